//! 强度重归一化: 把图谱的均值调整到新扫描的对比度, 不重新训练.
//!
//! 每个标签在新扫描中高先验位置的强度构成一个加权直方图, 平滑后取峰值作为该标签的
//! 目标强度. 白质取最右侧的峰, 脑室类取最左侧的峰, 其余取最高峰.

use std::collections::BTreeMap;
use std::path::Path;

use itertools::iproduct;

use super::Histogram;
use crate::consts::cma;
use crate::gca::{covar_index, Gca};
use crate::params::RenormParams;
use crate::transform::Transform;
use crate::volume::{MriLabel, MriScan, VolumeAttr};
use crate::{GcaError, GcaResult, Idx3d, Label};

/// 标签在高先验位置的样本: `(源体素坐标, 先验)`.
type LabelSamples = BTreeMap<Label, Vec<(Idx3d, f32)>>;

/// 排序修正. `items` 为 `(标签, 旧均值, 新均值)`.
///
/// 按旧均值升序排列后, 如果相邻两项的新均值次序颠倒, 就把两者重新分布在它们的平均值
/// 两侧, 间距按旧间距等比缩放. 重复直到新均值与旧均值同序.
pub(crate) fn preserve_order(items: &mut [(Label, f64, f64)]) {
    items.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    let n = items.len();
    for _ in 0..n * n {
        let mut changed = false;
        for i in 1..n {
            let (_, old_a, new_a) = items[i - 1];
            let (_, old_b, new_b) = items[i];
            if old_a >= old_b || new_a < new_b {
                continue;
            }
            let avg = (new_a + new_b) / 2.0;
            let old_avg = (old_a + old_b) / 2.0;
            let ratio = if old_avg > 0.0 { avg / old_avg } else { 1.0 };
            let half = (old_b - old_a) / 2.0 * ratio;
            log::debug!(
                "renormalization of labels {} and {} would cross ({new_a:.1} >= {new_b:.1}), averaging",
                items[i - 1].0,
                items[i].0
            );
            items[i - 1].2 = avg - half;
            items[i].2 = avg + half;
            changed = true;
        }
        if !changed {
            return;
        }
    }
    log::warn!("label order could not be fully restored after renormalization");
}

/// 按标签类型挑选直方图的峰.
fn label_peak(label: Label, hist: &Histogram, threshold: f64) -> Option<f64> {
    if cma::is_white_matter(label) {
        hist.last_peak(threshold)
    } else if cma::is_csf_like(label) {
        hist.first_peak(threshold)
    } else {
        hist.highest_peak()
    }
}

/// 第 `c` 个通道的取值范围.
fn channel_range(scan: &MriScan, c: usize) -> (f64, f64) {
    scan.channel(c)
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v as f64), hi.max(v as f64))
        })
}

#[inline]
fn shifted((x, y, z): Idx3d, (dx, dy, dz): (isize, isize, isize), dims: Idx3d) -> Option<Idx3d> {
    let step = |v: usize, d: isize, n: usize| {
        let r = v as isize + d;
        (0..n as isize).contains(&r).then_some(r as usize)
    };
    Some((step(x, dx, dims.0)?, step(y, dy, dims.1)?, step(z, dz, dims.2)?))
}

impl Gca {
    fn check_channels(&self, scan: &MriScan) -> GcaResult<()> {
        if scan.channels() != self.scan_channels() {
            return Err(GcaError::ChannelMismatch {
                expected: self.scan_channels(),
                found: scan.channels(),
            });
        }
        Ok(())
    }

    /// 收集每个标签在扫描中先验不低于 `min_prior` 的体素.
    fn label_samples(&self, scan: &MriScan, transform: &Transform, min_prior: f32) -> LabelSamples {
        let mut samples = LabelSamples::new();
        for pos in scan.indices() {
            let p = (pos.0 as f64, pos.1 as f64, pos.2 as f64);
            let Ok(pp) = self.source_voxel_to_prior(transform, p) else {
                continue;
            };
            for (label, prior) in self.prior(pp).iter() {
                if prior >= min_prior {
                    samples.entry(label).or_default().push((pos, prior));
                }
            }
        }
        samples
    }

    /// 以样本集合计算每个标签在第 `c` 通道上的直方图峰值.
    fn label_peaks(
        scan: &MriScan,
        samples: &LabelSamples,
        c: usize,
        params: &RenormParams,
    ) -> Vec<(Label, f64)> {
        let (lo, hi) = channel_range(scan, c);
        let mut targets = Vec::new();
        for (&label, list) in samples {
            if list.len() < params.min_samples {
                log::debug!("label {label}: only {} samples, skipped", list.len());
                continue;
            }
            let mut hist = Histogram::new(lo, hi.max(lo), params.nbins);
            for &(pos, prior) in list {
                hist.add(scan.get(pos, c) as f64, prior as f64);
            }
            hist.smooth(params.smooth_sigma);
            match label_peak(label, &hist, params.peak_threshold) {
                Some(peak) => targets.push((label, peak)),
                None => log::debug!("label {label}: no histogram peak"),
            }
        }
        targets
    }

    /// 把标签在第 `channel` 个特征上的均值缩放到目标强度, 保持标签间的强度次序.
    ///
    /// 图谱中不存在的标签被跳过并记录警告. 返回每个标签实际使用的缩放系数.
    pub fn renormalize_labels(
        &mut self,
        channel: usize,
        targets: &[(Label, f64)],
    ) -> GcaResult<BTreeMap<Label, f64>> {
        if channel >= self.ninputs() {
            return Err(GcaError::ChannelMismatch {
                expected: self.ninputs(),
                found: channel + 1,
            });
        }
        let mut items = Vec::with_capacity(targets.len());
        for &(label, target) in targets {
            match self.label_mean(label, channel) {
                Some(old) if old > 0.0 => items.push((label, old, target)),
                _ => log::warn!("label {label} has no usable mean, not renormalized"),
            }
        }
        preserve_order(&mut items);

        let scales: BTreeMap<Label, f64> = items
            .iter()
            .map(|&(label, old, new)| (label, new / old))
            .collect();
        for node in self.nodes_mut().iter_mut() {
            for (label, gc) in node.iter_mut() {
                if let Some(&s) = scales.get(&label) {
                    gc.means[channel] = (gc.means[channel] as f64 * s) as f32;
                }
            }
        }
        for (label, s) in &scales {
            log::debug!("label {label} channel {channel}: scale {s:.3}");
        }
        Ok(scales)
    }

    /// 基于直方图峰值的重归一化. 返回每个标签在各通道上的缩放系数.
    pub fn map_renormalize(
        &mut self,
        scan: &MriScan,
        transform: &Transform,
        params: &RenormParams,
    ) -> GcaResult<BTreeMap<Label, Vec<f64>>> {
        params.assert_args();
        self.check_channels(scan)?;
        let samples = self.label_samples(scan, transform, params.min_prior);
        let mut result: BTreeMap<Label, Vec<f64>> = BTreeMap::new();
        for c in 0..scan.channels() {
            let targets = Self::label_peaks(scan, &samples, c, params);
            for (label, s) in self.renormalize_labels(c, &targets)? {
                result.entry(label).or_insert_with(|| vec![1.0; scan.channels()])[c] = s;
            }
        }
        log::info!("renormalized {} labels", result.len());
        Ok(result)
    }

    /// 两遍重归一化. 第一遍同 [`Self::map_renormalize`]; 第二遍对每个标签在
    /// `alignment_radius` 内搜索整体位移, 使样本在重归一化后的模型下似然最大,
    /// 再以对齐后的样本重新取峰.
    pub fn map_renormalize_with_alignment(
        &mut self,
        scan: &MriScan,
        transform: &Transform,
        params: &RenormParams,
    ) -> GcaResult<BTreeMap<Label, Vec<f64>>> {
        let mut result = self.map_renormalize(scan, transform, params)?;
        let samples = self.label_samples(scan, transform, params.min_prior);
        let dims = scan.shape();
        let r = params.alignment_radius as isize;
        let nch = scan.channels();

        let mut aligned = LabelSamples::new();
        for (&label, list) in &samples {
            let model: Vec<(f64, f64)> = (0..nch)
                .filter_map(|c| Some((self.label_mean(label, c)?, self.label_variance(label, c)?)))
                .collect();
            if model.len() != nch || list.len() < params.min_samples {
                continue;
            }
            let score = |shift| -> f64 {
                list.iter()
                    .filter_map(|&(pos, prior)| {
                        let q = shifted(pos, shift, dims)?;
                        let ll: f64 = model
                            .iter()
                            .enumerate()
                            .map(|(c, &(m, v))| -(scan.get(q, c) as f64 - m).powi(2) / (2.0 * v))
                            .sum();
                        Some(prior as f64 * ll)
                    })
                    .sum()
            };
            let mut best = ((0, 0, 0), score((0, 0, 0)));
            for shift in iproduct!(-r..=r, -r..=r, -r..=r) {
                let s = score(shift);
                if s > best.1 {
                    best = (shift, s);
                }
            }
            if best.0 != (0, 0, 0) {
                log::debug!("label {label}: aligned by {:?}", best.0);
            }
            let moved = list
                .iter()
                .filter_map(|&(pos, prior)| Some((shifted(pos, best.0, dims)?, prior)))
                .collect();
            aligned.insert(label, moved);
        }

        for c in 0..nch {
            let targets = Self::label_peaks(scan, &aligned, c, params);
            for (label, s) in self.renormalize_labels(c, &targets)? {
                let entry = result.entry(label).or_insert_with(|| vec![1.0; nch]);
                entry[c] *= s;
            }
        }
        Ok(result)
    }

    /// 标签 `label` 第 `channel` 个特征的平均方差. 标签不存在时返回 `None`.
    fn label_variance(&self, label: Label, channel: usize) -> Option<f64> {
        let (mut sum, mut weight) = (0.0, 0.0);
        for gc in self.nodes().iter().filter_map(|n| n.gc(label)) {
            let w = gc.ntraining.max(1) as f64;
            sum += gc.variance(channel).max(0.0) as f64 * w;
            weight += w;
        }
        (weight > 0.0).then(|| (sum / weight).max(crate::consts::MIN_VAR))
    }

    /// 以带标注的样例扫描重归一化: 每个标签的目标强度为样例中该标签体素的平均强度.
    pub fn renormalize_to_example(
        &mut self,
        scan: &MriScan,
        labels: &MriLabel,
        transform: &Transform,
    ) -> GcaResult<BTreeMap<Label, Vec<f64>>> {
        self.check_channels(scan)?;
        if scan.shape() != labels.shape() {
            return Err(GcaError::ShapeMismatch(scan.shape(), labels.shape()));
        }
        let nch = scan.channels();
        let mut sums: BTreeMap<Label, (Vec<f64>, usize)> = BTreeMap::new();
        for pos in labels.indices() {
            let p = (pos.0 as f64, pos.1 as f64, pos.2 as f64);
            if self.source_voxel_to_node(transform, p).is_err() {
                continue;
            }
            let (sum, n) = sums.entry(labels[pos]).or_insert_with(|| (vec![0.0; nch], 0));
            for (c, s) in sum.iter_mut().enumerate() {
                *s += scan.get(pos, c) as f64;
            }
            *n += 1;
        }

        let mut result: BTreeMap<Label, Vec<f64>> = BTreeMap::new();
        for c in 0..nch {
            let targets: Vec<(Label, f64)> = sums
                .iter()
                .map(|(&label, (sum, n))| (label, sum[c] / *n as f64))
                .collect();
            for (label, s) in self.renormalize_labels(c, &targets)? {
                result.entry(label).or_insert_with(|| vec![1.0; nch])[c] = s;
            }
        }
        Ok(result)
    }

    /// 全局强度重归一化: 每个通道只用一个缩放系数, 由所有高先验标签的观测均值与图谱
    /// 均值之比 (以样本数加权) 求出. 均值与协方差同时缩放. 返回各通道的系数.
    pub fn renormalize_intensities(
        &mut self,
        scan: &MriScan,
        transform: &Transform,
        params: &RenormParams,
    ) -> GcaResult<Vec<f64>> {
        params.assert_args();
        self.check_channels(scan)?;
        let samples = self.label_samples(scan, transform, params.min_prior);
        let nch = scan.channels();
        let mut scales = vec![1.0; nch];
        for (c, scale) in scales.iter_mut().enumerate() {
            let (mut observed, mut expected) = (0.0, 0.0);
            for (&label, list) in &samples {
                if list.len() < params.min_samples {
                    continue;
                }
                let Some(mean) = self.label_mean(label, c) else {
                    continue;
                };
                let n = list.len() as f64;
                let obs = list.iter().map(|&(p, _)| scan.get(p, c) as f64).sum::<f64>() / n;
                observed += obs * n;
                expected += mean * n;
            }
            if expected > 0.0 {
                *scale = observed / expected;
            } else {
                log::warn!("channel {c}: no labels to estimate intensity scale");
            }
        }

        let f = self.ninputs();
        // 梯度特征本身不缩放, 它与强度的交叉协方差随强度通道缩放
        let factors: Vec<f64> = scales
            .iter()
            .copied()
            .chain(std::iter::repeat(1.0))
            .take(f)
            .collect();
        for gc in self.nodes_mut().iter_mut().flat_map(|n| n.gcs_mut().iter_mut()) {
            for (c, &s) in scales.iter().enumerate() {
                gc.means[c] = (gc.means[c] as f64 * s) as f32;
            }
            for r in 0..f {
                for c in r..f {
                    let k = covar_index(r, c, f);
                    gc.covars[k] = (gc.covars[k] as f64 * factors[r] * factors[c]) as f32;
                }
            }
        }
        log::info!("intensity scales {scales:?}");
        Ok(scales)
    }

    /// 从文本文件读取目标强度并重归一化第 `channel` 个特征.
    ///
    /// 每行为 `标签 强度`, 空行与 `#` 开头的行被忽略. 格式错误的行返回
    /// [`GcaError::MalformedRenormalization`], 图谱中不存在的标签返回 [`GcaError::EmptyLabel`].
    pub fn renormalize_from_file<P: AsRef<Path>>(
        &mut self,
        path: P,
        channel: usize,
    ) -> GcaResult<BTreeMap<Label, f64>> {
        let contents = std::fs::read_to_string(path)?;
        let present = self.labels_present();
        let mut targets = Vec::new();
        for (i, line) in contents.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let malformed = || GcaError::MalformedRenormalization {
                line: i + 1,
                content: line.to_string(),
            };
            let mut fields = trimmed.split_whitespace();
            let label: Label = fields
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(malformed)?;
            let value: f64 = fields
                .next()
                .and_then(|s| s.parse().ok())
                .filter(|v: &f64| v.is_finite())
                .ok_or_else(malformed)?;
            if fields.next().is_some() {
                return Err(malformed());
            }
            if !present.contains(&label) {
                return Err(GcaError::EmptyLabel(label));
            }
            targets.push((label, value));
        }
        self.renormalize_labels(channel, &targets)
    }
}

#[cfg(test)]
mod tests {
    use super::preserve_order;
    use itertools::iproduct;
    use crate::consts::flags;
    use crate::params::RenormParams;
    use crate::phantom::CubePhantom;
    use crate::{Gca, GcaError, Transform, VolumeGeometry};

    #[test]
    fn test_preserve_order_fixes_crossing() {
        // 旧均值 A < B, 目标峰 A = 120, B = 100
        let mut items = vec![(3, 80.0, 120.0), (4, 110.0, 100.0)];
        preserve_order(&mut items);
        let (a, b) = (items[0], items[1]);
        assert_eq!((a.0, b.0), (3, 4));
        assert!(a.2 < b.2);
        assert!(((a.2 + b.2) / 2.0 - 110.0).abs() < 1e-9);
    }

    #[test]
    fn test_preserve_order_keeps_consistent_targets() {
        let mut items = vec![(5, 50.0, 60.0), (2, 10.0, 20.0), (9, 90.0, 95.0)];
        preserve_order(&mut items);
        assert_eq!(items, vec![(2, 10.0, 20.0), (5, 50.0, 60.0), (9, 90.0, 95.0)]);
    }

    fn two_label_atlas() -> Gca {
        let g = VolumeGeometry::isotropic((2, 1, 1));
        let mut gca = Gca::new(1, 1.0, 1.0, g, 0);
        for (pos, label, mean) in [((0, 0, 0), 3, 80.0), ((1, 0, 0), 4, 110.0)] {
            let i = gca.node_mut(pos).find_or_insert(label, 1);
            let gc = &mut gca.node_mut(pos).gcs_mut()[i];
            gc.means[0] = mean;
            gc.covars[0] = 4.0;
            gc.ntraining = 10;
            gca.prior_mut(pos).add(label);
        }
        gca
    }

    #[test]
    fn test_renormalize_labels_never_inverts_order() {
        let mut gca = two_label_atlas();
        gca.renormalize_labels(0, &[(3, 120.0), (4, 100.0)]).unwrap();
        assert!(gca.label_mean(3, 0).unwrap() < gca.label_mean(4, 0).unwrap());
    }

    #[test]
    fn test_renormalize_from_file() {
        let path = std::env::temp_dir().join("gca-berry-renorm-test.txt");
        let mut gca = two_label_atlas();

        std::fs::write(&path, "# label intensity\n3 40\n\n4 55.5\n").unwrap();
        let scales = gca.renormalize_from_file(&path, 0).unwrap();
        assert!((scales[&3] - 0.5).abs() < 1e-9);
        assert!((gca.label_mean(4, 0).unwrap() - 55.5).abs() < 1e-4);

        std::fs::write(&path, "3 40\n4 abc\n").unwrap();
        match gca.renormalize_from_file(&path, 0) {
            Err(GcaError::MalformedRenormalization { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected {other:?}"),
        }

        std::fs::write(&path, "17 40\n").unwrap();
        assert!(matches!(
            gca.renormalize_from_file(&path, 0),
            Err(GcaError::EmptyLabel(17))
        ));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_global_scale_reaches_gradient_cross_terms() {
        let g = VolumeGeometry::isotropic((4, 4, 1));
        let mut gca = Gca::new(1, 1.0, 1.0, g.clone(), flags::GCA_XGRAD);
        assert_eq!(gca.ninputs(), 2);
        for (x, y) in iproduct!(0..4, 0..4) {
            let pos = (x, y, 0);
            let i = gca.node_mut(pos).find_or_insert(3, 2);
            let gc = &mut gca.node_mut(pos).gcs_mut()[i];
            gc.means = vec![80.0, 5.0];
            gc.covars = vec![4.0, 2.0, 3.0];
            gc.ntraining = 10;
            gca.prior_mut(pos).add(3);
        }
        let mut scan = crate::MriScan::new(g, 1);
        scan.channel_mut(0).fill(160.0);

        let scales = gca
            .renormalize_intensities(&scan, &Transform::identity(), &RenormParams::default())
            .unwrap();
        assert!((scales[0] - 2.0).abs() < 1e-9);
        let gc = gca.node((1, 2, 0)).gc(3).unwrap();
        assert_eq!(gc.means, vec![160.0, 5.0]);
        // 强度方差乘 4, 强度与梯度的协方差乘 2, 梯度方差不变
        assert_eq!(gc.covars, vec![16.0, 4.0, 3.0]);
    }

    fn brighter_case() -> (Gca, crate::MriScan) {
        let phantom = CubePhantom::new((12, 12, 12), (4, 4, 4), (4, 4, 4), 1);
        let gca = crate::phantom::train_atlas(&phantom.build(), 1.0, 1.0).unwrap();
        let mut scan = phantom.noise_free().scan;
        scan.channel_mut(0).mapv_inplace(|v| v * 1.5);
        (gca, scan)
    }

    #[test]
    fn test_map_renormalize_tracks_contrast_change() {
        let (mut gca, scan) = brighter_case();
        let before = [gca.label_mean(0, 0).unwrap(), gca.label_mean(1, 0).unwrap()];
        gca.map_renormalize(&scan, &Transform::identity(), &RenormParams::default())
            .unwrap();
        for (label, old) in [0, 1].into_iter().zip(before) {
            let ratio = gca.label_mean(label, 0).unwrap() / old;
            assert!((ratio - 1.5).abs() < 0.075, "label {label}: ratio {ratio}");
        }
    }

    #[test]
    fn test_alignment_pass_and_global_scale() {
        let (mut gca, scan) = brighter_case();
        let mut other = gca.clone();
        let scales = gca
            .map_renormalize_with_alignment(&scan, &Transform::identity(), &RenormParams::default())
            .unwrap();
        assert!((scales[&1][0] - 1.5).abs() < 0.075);

        let global = other
            .renormalize_intensities(&scan, &Transform::identity(), &RenormParams::default())
            .unwrap();
        assert!((global[0] - 1.5).abs() < 0.1, "{global:?}");
    }
}
