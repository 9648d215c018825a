//! FLASH 前向模型: 在不同脉冲序列参数之间重映射图谱.
//!
//! 信号方程 `S = PD · sinα · (1 - E1) / (1 - cosα · E1) · exp(-TE / T2*)`,
//! 其中 `E1 = exp(-TR / T1)`. `T2* = 0` 表示忽略回波衰减.
//! 协方差按一阶误差传播 `Σ_dst = J · Σ_src · Jᵗ`.

use nalgebra::DMatrix;

use crate::consts::{flags, GcaType, MIN_VAR};
use crate::gca::{Gc1d, Gca, PulseParams, TissueParms};
use crate::{GcaError, GcaResult, Label};

/// T1 拟合的搜索范围 (毫秒).
const T1_RANGE: (f64, f64) = (10.0, 10000.0);
const T1_GRID: usize = 400;

#[inline]
fn e1(t1: f64, tr: f64) -> f64 {
    if t1 > 0.0 {
        (-tr / t1).exp()
    } else {
        0.0
    }
}

#[inline]
fn echo_decay(tp: &TissueParms, p: &PulseParams) -> f64 {
    if tp.t2 > 0.0 {
        (-(p.te as f64) / tp.t2 as f64).exp()
    } else {
        1.0
    }
}

/// 组织参数 `tp` 在脉冲序列 `p` 下的期望信号强度.
pub fn flash_forward(tp: &TissueParms, p: &PulseParams) -> f64 {
    let (sin, cos) = (p.flip_angle as f64).sin_cos();
    let e = e1(tp.t1 as f64, p.tr as f64);
    let denom = 1.0 - cos * e;
    if denom.abs() < f64::EPSILON {
        return 0.0;
    }
    tp.pd as f64 * sin * (1.0 - e) / denom * echo_decay(tp, p)
}

/// 信号对 `(T1, PD)` 的雅可比矩阵, 每个序列一行.
pub fn flash_jacobian(tp: &TissueParms, seq: &[PulseParams]) -> DMatrix<f64> {
    let (t1, pd) = (tp.t1 as f64, tp.pd as f64);
    let mut j = DMatrix::zeros(seq.len(), 2);
    for (r, p) in seq.iter().enumerate() {
        let (sin, cos) = (p.flip_angle as f64).sin_cos();
        let tr = p.tr as f64;
        let e = e1(t1, tr);
        let denom = 1.0 - cos * e;
        if denom.abs() < f64::EPSILON {
            continue;
        }
        let decay = echo_decay(tp, p);
        // dS/dE1 * dE1/dT1
        let ds_de = pd * sin * (cos - 1.0) / (denom * denom);
        let de_dt1 = if t1 > 0.0 { e * tr / (t1 * t1) } else { 0.0 };
        j[(r, 0)] = ds_de * de_dt1 * decay;
        j[(r, 1)] = sin * (1.0 - e) / denom * decay;
    }
    j
}

/// 由一组序列下的观测强度拟合 `(T1, PD)`.
///
/// `PD` 对信号是线性的, 因此对每个候选 T1 取闭式最小二乘解, 在对数网格上搜索后以黄金
/// 分割细化 T1. 信号全为零时返回 `None`.
fn fit_tissue(means: &[f32], seq: &[PulseParams]) -> Option<TissueParms> {
    if means.iter().all(|m| *m == 0.0) {
        return None;
    }
    let residual = |t1: f64| -> (f64, f64) {
        let unit = TissueParms {
            t1: t1 as f32,
            pd: 1.0,
            t2: 0.0,
        };
        let g: Vec<f64> = seq.iter().map(|p| flash_forward(&unit, p)).collect();
        let gg: f64 = g.iter().map(|v| v * v).sum();
        if gg <= 0.0 {
            return (f64::INFINITY, 0.0);
        }
        let pd = g.iter().zip(means).map(|(g, m)| g * *m as f64).sum::<f64>() / gg;
        let err = g
            .iter()
            .zip(means)
            .map(|(g, m)| (pd * g - *m as f64).powi(2))
            .sum();
        (err, pd)
    };

    let (lo, hi) = (T1_RANGE.0.ln(), T1_RANGE.1.ln());
    let step = (hi - lo) / (T1_GRID - 1) as f64;
    let grid = |k: usize| (lo + step * k as f64).exp();
    let best = (0..T1_GRID)
        .map(|k| (k, residual(grid(k)).0))
        .min_by(|a, b| a.1.total_cmp(&b.1))?;
    if !best.1.is_finite() {
        return None;
    }

    // 黄金分割
    const PHI: f64 = 0.618_033_988_749_895;
    let (mut a, mut b) = (grid(best.0.saturating_sub(1)), grid((best.0 + 1).min(T1_GRID - 1)));
    for _ in 0..60 {
        let c = b - PHI * (b - a);
        let d = a + PHI * (b - a);
        if residual(c).0 < residual(d).0 {
            b = d;
        } else {
            a = c;
        }
    }
    let t1 = (a + b) / 2.0;
    let (_, pd) = residual(t1);
    Some(TissueParms {
        t1: t1 as f32,
        pd: pd as f32,
        t2: 0.0,
    })
}

/// 以新的均值与协方差重建分类器, 保留样本计数与邻居直方图.
fn remap_gc(gc: &Gc1d, means: Vec<f32>, mut covar: DMatrix<f64>) -> Gc1d {
    let mut out = Gc1d::new(means.len());
    out.means = means;
    out.set_covariance(&covar);
    if !out.is_invertible() {
        for c in 0..covar.nrows() {
            covar[(c, c)] += MIN_VAR;
        }
        out.set_covariance(&covar);
    }
    out.ntraining = gc.ntraining;
    out.n_just_priors = gc.n_just_priors;
    out.regularized = gc.regularized;
    out.nbrs = gc.nbrs.clone();
    out
}

impl Gca {
    /// 检查图谱类型.
    fn require_type(&self, expected: GcaType) -> GcaResult<()> {
        if self.gca_type() != expected {
            return Err(GcaError::GcaTypeMismatch {
                expected,
                found: self.gca_type(),
            });
        }
        Ok(())
    }

    /// 复制图谱结构, 特征数改为 `seq.len()`, 梯度通道被丢弃.
    fn flash_shell(&self, seq: &[PulseParams]) -> Gca {
        let mut out = self.clone();
        out.reshape_inputs(seq.len(), self.flags() & !flags::GCA_GRAD);
        out.set_gca_type(GcaType::Flash);
        out.set_sequence(seq.to_vec());
        out
    }

    /// 把 `(T1, PD)` 参数图谱转换为以 `seq` 标定的 FLASH 图谱.
    ///
    /// 参数图谱的两个特征依次是 T1 与 PD. 每个标签的组织参数表取其全图谱均值.
    pub fn create_flash_from_parameter(&self, seq: &[PulseParams]) -> GcaResult<Gca> {
        self.require_type(GcaType::Param)?;
        if self.ninputs() != 2 {
            return Err(GcaError::ChannelMismatch {
                expected: 2,
                found: self.ninputs(),
            });
        }
        if seq.is_empty() {
            return Err(GcaError::MissingSequence);
        }

        let mut out = self.flash_shell(seq);
        for (dst, src) in out.nodes_mut().iter_mut().zip(self.nodes().iter()) {
            for (d, s) in dst.gcs_mut().iter_mut().zip(src.gcs()) {
                let tp = TissueParms {
                    t1: s.means[0],
                    pd: s.means[1],
                    t2: 0.0,
                };
                let means = seq.iter().map(|p| flash_forward(&tp, p) as f32).collect();
                let j = flash_jacobian(&tp, seq);
                let covar = &j * s.covariance_matrix() * j.transpose();
                *d = remap_gc(s, means, covar);
            }
        }
        for label in self.labels_present() {
            if let (Some(t1), Some(pd)) = (self.label_mean(label, 0), self.label_mean(label, 1)) {
                out.set_tissue_parms(
                    label,
                    TissueParms {
                        t1: t1 as f32,
                        pd: pd as f32,
                        t2: 0.0,
                    },
                );
            }
        }
        log::info!("created {}-channel FLASH atlas from parameter atlas", seq.len());
        Ok(out)
    }

    /// 对 FLASH 图谱的每个标签, 由其全图谱均值强度拟合组织参数并写入组织参数表.
    /// 返回拟合成功的标签数.
    pub fn estimate_tissue_parms(&mut self) -> GcaResult<usize> {
        self.require_type(GcaType::Flash)?;
        let nch = self.scan_channels();
        if self.sequence().len() != nch {
            return Err(GcaError::MissingSequence);
        }
        let seq = self.sequence().to_vec();
        let mut n = 0;
        for label in self.labels_present() {
            let means: Option<Vec<f32>> = (0..nch)
                .map(|c| self.label_mean(label, c).map(|m| m as f32))
                .collect();
            match means.and_then(|m| fit_tissue(&m, &seq)) {
                Some(tp) => {
                    log::debug!("label {label}: T1 {:.1} PD {:.1}", tp.t1, tp.pd);
                    self.set_tissue_parms(label, tp);
                    n += 1;
                }
                None => log::warn!("could not estimate tissue parameters of label {label}"),
            }
        }
        Ok(n)
    }

    /// 把 FLASH 图谱重新标定到另一组序列参数 `seq`.
    ///
    /// 每个分类器先由其均值拟合组织参数 (失败时使用组织参数表), 再前向模拟新的强度.
    /// 协方差先经旧雅可比的伪逆映射回参数空间, 再经新雅可比传播.
    pub fn create_flash_from_flash(&self, seq: &[PulseParams]) -> GcaResult<Gca> {
        self.require_type(GcaType::Flash)?;
        let nch = self.scan_channels();
        if self.sequence().len() != nch || seq.is_empty() {
            return Err(GcaError::MissingSequence);
        }
        let old_seq = self.sequence();
        let mut out = self.flash_shell(seq);
        let mut failed = 0usize;

        for (dst, src) in out.nodes_mut().iter_mut().zip(self.nodes().iter()) {
            let labels: Vec<Label> = src.labels().to_vec();
            for ((d, s), label) in dst.gcs_mut().iter_mut().zip(src.gcs()).zip(labels) {
                let fallback = Some(self.tissue_parms(label)).filter(|tp| !tp.is_unset());
                let Some(tp) = fit_tissue(&s.means[..nch], old_seq).or(fallback) else {
                    failed += 1;
                    *d = remap_gc(s, vec![0.0; seq.len()], DMatrix::identity(seq.len(), seq.len()) * MIN_VAR);
                    continue;
                };
                let means = seq.iter().map(|p| flash_forward(&tp, p) as f32).collect();
                let src_cov = s.covariance_matrix().view((0, 0), (nch, nch)).into_owned();
                let j_old = flash_jacobian(&tp, old_seq);
                let j_new = flash_jacobian(&tp, seq);
                let param_cov = match j_old.pseudo_inverse(1e-12) {
                    Ok(pinv) => &pinv * src_cov * pinv.transpose(),
                    Err(_) => DMatrix::identity(2, 2) * MIN_VAR,
                };
                *d = remap_gc(s, means, &j_new * param_cov * j_new.transpose());
            }
        }
        if failed > 0 {
            log::warn!("{failed} classifiers could not be remapped and were zeroed");
        }
        log::info!("recalibrated FLASH atlas to {} channels", seq.len());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::{fit_tissue, flash_forward, flash_jacobian};
    use crate::consts::GcaType;
    use crate::{Gca, GcaError, PulseParams, TissueParms, VolumeGeometry};

    fn seq(flips_deg: &[f32]) -> Vec<PulseParams> {
        flips_deg
            .iter()
            .map(|f| PulseParams {
                tr: 20.0,
                flip_angle: f.to_radians(),
                te: 0.0,
            })
            .collect()
    }

    const WM: TissueParms = TissueParms {
        t1: 800.0,
        pd: 50.0,
        t2: 0.0,
    };

    #[test]
    fn test_forward_limits() {
        let long_tr = PulseParams {
            tr: 1e7,
            flip_angle: std::f32::consts::FRAC_PI_2,
            te: 0.0,
        };
        assert!((flash_forward(&WM, &long_tr) - 50.0).abs() < 1e-3);
        let zero_flip = PulseParams {
            flip_angle: 0.0,
            ..long_tr
        };
        assert_eq!(flash_forward(&WM, &zero_flip), 0.0);
    }

    #[test]
    fn test_jacobian_matches_finite_difference() {
        let s = seq(&[5.0, 30.0]);
        let j = flash_jacobian(&WM, &s);
        let h = 1.0;
        for (r, p) in s.iter().enumerate() {
            let plus = TissueParms { t1: WM.t1 + h, ..WM };
            let minus = TissueParms { t1: WM.t1 - h, ..WM };
            let num = (flash_forward(&plus, p) - flash_forward(&minus, p)) / (2.0 * h as f64);
            assert!((j[(r, 0)] - num).abs() < 1e-3 * num.abs().max(1e-6));
            assert!((j[(r, 1)] - flash_forward(&WM, p) / WM.pd as f64).abs() < 1e-9);
        }
    }

    #[test]
    fn test_fit_recovers_tissue() {
        let s = seq(&[5.0, 20.0, 30.0]);
        let means: Vec<f32> = s.iter().map(|p| flash_forward(&WM, p) as f32).collect();
        let tp = fit_tissue(&means, &s).unwrap();
        assert!((tp.t1 - 800.0).abs() < 8.0, "{tp:?}");
        assert!((tp.pd - 50.0).abs() < 0.5, "{tp:?}");
        assert!(fit_tissue(&[0.0, 0.0, 0.0], &s).is_none());
    }

    fn param_atlas() -> Gca {
        let g = VolumeGeometry::isotropic((1, 1, 1));
        let mut gca = Gca::new(2, 1.0, 1.0, g, 0);
        gca.set_gca_type(GcaType::Param);
        let i = gca.node_mut((0, 0, 0)).find_or_insert(2, 2);
        let gc = &mut gca.node_mut((0, 0, 0)).gcs_mut()[i];
        gc.means = vec![WM.t1, WM.pd];
        gc.covars = vec![100.0, 0.0, 4.0];
        gc.ntraining = 7;
        gca.prior_mut((0, 0, 0)).add(2);
        gca
    }

    #[test]
    fn test_flash_from_parameter() {
        let s = seq(&[5.0, 30.0]);
        let flash = param_atlas().create_flash_from_parameter(&s).unwrap();
        assert_eq!(flash.gca_type(), GcaType::Flash);
        assert_eq!(flash.ninputs(), 2);
        let gc = flash.find_classifier((0, 0, 0), 2).unwrap();
        assert_eq!(gc.ntraining, 7);
        for (c, p) in s.iter().enumerate() {
            assert!((gc.means[c] as f64 - flash_forward(&WM, p)).abs() < 1e-3);
        }
        let j = flash_jacobian(&WM, &s);
        let expected = j[(0, 0)].powi(2) * 100.0 + j[(0, 1)].powi(2) * 4.0;
        assert!((gc.variance(0) as f64 - expected).abs() < 1e-3 * expected.max(1.0));
        assert_eq!(flash.tissue_parms(2).t1, WM.t1);

        assert!(matches!(
            flash.create_flash_from_parameter(&s),
            Err(GcaError::GcaTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_flash_recalibration() {
        let a = seq(&[5.0, 20.0, 30.0]);
        let b = seq(&[10.0, 40.0]);
        let mut flash = param_atlas().create_flash_from_parameter(&a).unwrap();
        assert_eq!(flash.estimate_tissue_parms().unwrap(), 1);
        assert!((flash.tissue_parms(2).t1 - 800.0).abs() < 8.0);

        let moved = flash.create_flash_from_flash(&b).unwrap();
        assert_eq!(moved.ninputs(), 2);
        assert_eq!(moved.sequence(), b.as_slice());
        let gc = moved.find_classifier((0, 0, 0), 2).unwrap();
        for (c, p) in b.iter().enumerate() {
            let expected = flash_forward(&WM, p);
            assert!((gc.means[c] as f64 - expected).abs() < 0.01 * expected);
        }
        assert!(gc.is_invertible());
    }
}
