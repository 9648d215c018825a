//! 协方差正则化: 奇异矩阵修复, 病态矩阵 ridge, 以及整体混合.

use itertools::izip;
use nalgebra::DMatrix;

use super::fill::nearest_node;
use crate::consts::MIN_DET;
use crate::gca::{Gc1d, Gca};
use crate::params::RegularizeParams;
use crate::{GcaError, GcaResult, Idx3d, Label};

/// 协方差是否 "奇异": 不可逆或行列式不超过 `MIN_DET`.
#[inline]
fn is_singular(gc: &Gc1d) -> bool {
    !gc.is_invertible() || gc.determinant() <= MIN_DET
}

/// 良态判据: 样本数足以估计全部 `F(F+1)/2 + F` 个参数, 且行列式不低于
/// `det_fraction * Π 全局方差`. 只有良态的分类器能作为复制来源.
#[derive(Copy, Clone, Debug)]
pub(super) struct Conditioning {
    free_params: u32,
    det_floor: f64,
}

impl Conditioning {
    pub(super) fn new(ninputs: usize, global: &[f64], params: &RegularizeParams) -> Self {
        Self {
            free_params: (ninputs * (ninputs + 1) / 2 + ninputs) as u32,
            det_floor: params.det_fraction * global.iter().product::<f64>(),
        }
    }

    /// 可以作为空洞填充或奇异修复的来源?
    pub(super) fn is_well_conditioned(&self, gc: &Gc1d) -> bool {
        gc.ntraining >= self.free_params && !is_singular(gc) && gc.determinant() >= self.det_floor
    }

    /// 需要 ridge?
    fn needs_ridge(&self, gc: &Gc1d) -> bool {
        gc.ntraining < self.free_params || gc.determinant() < self.det_floor
    }
}

/// 在对角线上加 `amount[c]`.
fn add_to_diagonal(gc: &mut Gc1d, amount: impl Fn(usize) -> f64) {
    let mut m = gc.covariance_matrix();
    for c in 0..m.nrows() {
        m[(c, c)] += amount(c);
    }
    gc.set_covariance(&m);
}

impl Gca {
    /// 全局平均方差, 每个特征一个值. 以训练样本数加权, 只统计样本数不少于 2
    /// 且协方差非奇异的分类器.
    ///
    /// 没有可用分类器时退化为 1.
    pub fn global_variances(&self) -> Vec<f64> {
        let f = self.ninputs();
        let mut sums = vec![0.0; f];
        let mut weight = 0.0;
        for gc in self.nodes().iter().flat_map(|n| n.gcs().iter()) {
            if gc.ntraining < 2 || gc.regularized || is_singular(gc) {
                continue;
            }
            let w = gc.ntraining as f64;
            for (c, s) in sums.iter_mut().enumerate() {
                *s += gc.variance(c).max(0.0) as f64 * w;
            }
            weight += w;
        }
        if weight == 0.0 {
            log::warn!("no trained classifiers to estimate global variance, using 1.0");
            return vec![1.0; f];
        }
        sums.into_iter()
            .map(|s| {
                let v = s / weight;
                if v > 0.0 {
                    v
                } else {
                    1.0
                }
            })
            .collect()
    }

    /// 第一遍: 修复奇异协方差.
    ///
    /// 优先复制最近的、强度兼容的同标签分类器的协方差; 找不到时在对角线加全局方差.
    /// 返回修复的分类器个数.
    pub(crate) fn fix_singular_covariances(
        &mut self,
        global: &[f64],
        params: &RegularizeParams,
    ) -> usize {
        let compat = params.compat_sigma.powi(2);
        let cond = Conditioning::new(self.ninputs(), global, params);
        let mut copies: Vec<(Idx3d, usize, Option<Vec<f32>>)> = Vec::new();

        for (pos, node) in self.nodes().indexed_iter() {
            for (i, (label, gc)) in node.iter().enumerate() {
                if !is_singular(gc) {
                    continue;
                }
                let means = &gc.means;
                let accept = |_: Idx3d, n: &crate::GcaNode| {
                    n.gc(label).is_some_and(|other| {
                        cond.is_well_conditioned(other)
                            && !other.regularized
                            && izip!(means, &other.means, global)
                                .map(|(a, b, g)| ((*a - *b) as f64).powi(2) / g)
                                .sum::<f64>()
                                <= compat
                    })
                };
                let source = nearest_node(self.nodes(), pos, params.search_radius, accept)
                    .and_then(|p| self.node(p).gc(label))
                    .map(|other| other.covars.clone());
                copies.push((pos, i, source));
            }
        }

        let n = copies.len();
        for (pos, i, source) in copies {
            let gc = &mut self.node_mut(pos).gcs_mut()[i];
            match source {
                Some(covars) => gc.covars = covars,
                None => add_to_diagonal(gc, |c| global[c]),
            }
            gc.regularized = true;
        }
        n
    }

    /// 第二遍: 对病态 (行列式过小或样本数不足以估计全部参数) 的协方差做 ridge 正则化.
    /// 第一遍复制或填充来的协方差同样参与检查. 均值保持不变. 返回处理的分类器个数.
    pub(crate) fn fix_ill_conditioned_covariances(
        &mut self,
        global: &[f64],
        params: &RegularizeParams,
    ) -> usize {
        let cond = Conditioning::new(self.ninputs(), global, params);
        let mut n = 0;
        for gc in self.nodes_mut().iter_mut().flat_map(|n| n.gcs_mut().iter_mut()) {
            if cond.needs_ridge(gc) {
                add_to_diagonal(gc, |c| params.ridge_fraction * global[c]);
                gc.regularized = true;
                n += 1;
            }
        }
        n
    }

    /// 复查所有协方差. 仍不可逆时记录警告, 严格模式下返回错误.
    pub(crate) fn check_covariances(&self, params: &RegularizeParams) -> GcaResult<()> {
        let mut bad: Vec<(Idx3d, Label)> = Vec::new();
        for (pos, node) in self.nodes().indexed_iter() {
            for (label, gc) in node.iter() {
                if is_singular(gc) {
                    bad.push((pos, label));
                }
            }
        }
        if let Some(&(node, label)) = bad.first() {
            log::warn!(
                "{} covariance matrices remain singular after regularization, first at {node:?} label {label}",
                bad.len()
            );
            if params.strict {
                return Err(GcaError::SingularCovariance { node, label });
            }
        }
        Ok(())
    }

    /// 协方差混合: `Σ <- (1 - f) Σ + f * diag(全局方差)`.
    ///
    /// 如果 `fraction` 不在 `[0, 1]` 内, 则程序 panic.
    pub fn regularize_covariances(&mut self, fraction: f64) {
        assert!((0.0..=1.0).contains(&fraction), "混合比例必须在 [0, 1] 内");
        let global = self.global_variances();
        let target = DMatrix::from_diagonal(&nalgebra::DVector::from_vec(global));
        for gc in self.nodes_mut().iter_mut().flat_map(|n| n.gcs_mut().iter_mut()) {
            let m = gc.covariance_matrix() * (1.0 - fraction) + &target * fraction;
            gc.set_covariance(&m);
            gc.regularized = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::params::RegularizeParams;
    use crate::{Gca, VolumeGeometry};

    fn atlas_with(entries: &[((usize, usize, usize), f32, f32, u32)]) -> Gca {
        let g = VolumeGeometry::isotropic((6, 1, 1));
        let mut gca = Gca::new(1, 1.0, 1.0, g, 0);
        for &(pos, mean, var, n) in entries {
            let i = gca.node_mut(pos).find_or_insert(2, 1);
            let gc = &mut gca.node_mut(pos).gcs_mut()[i];
            gc.means[0] = mean;
            gc.covars[0] = var;
            gc.ntraining = n;
        }
        gca
    }

    #[test]
    fn test_singular_copies_compatible_neighbor() {
        let mut gca = atlas_with(&[
            ((0, 0, 0), 100.0, 0.0, 5),
            ((1, 0, 0), 300.0, 16.0, 5),
            ((3, 0, 0), 101.0, 9.0, 5),
        ]);
        let global = gca.global_variances();
        assert!((global[0] - 12.5).abs() < 1e-9);
        let n = gca.fix_singular_covariances(&global, &RegularizeParams::default());
        assert_eq!(n, 1);
        let gc = gca.find_classifier((0, 0, 0), 2).unwrap();
        // (1, 0, 0) 更近但强度不兼容
        assert_eq!(gc.covars[0], 9.0);
        assert!(gc.regularized);
        assert_eq!(gc.means[0], 100.0);
    }

    #[test]
    fn test_singular_without_neighbor_adds_global() {
        let mut gca = atlas_with(&[((0, 0, 0), 100.0, 0.0, 5), ((5, 0, 0), 500.0, 4.0, 5)]);
        let global = gca.global_variances();
        gca.fix_singular_covariances(&global, &RegularizeParams::default());
        assert_eq!(gca.find_classifier((0, 0, 0), 2).unwrap().covars[0], 4.0);
    }

    #[test]
    fn test_ridge_for_few_samples() {
        let mut gca = atlas_with(&[((0, 0, 0), 10.0, 2.0, 1), ((1, 0, 0), 10.0, 2.0, 9)]);
        let global = vec![2.0];
        let n = gca.fix_ill_conditioned_covariances(&global, &RegularizeParams::default());
        assert_eq!(n, 1);
        assert!((gca.find_classifier((0, 0, 0), 2).unwrap().covars[0] - 2.2).abs() < 1e-6);
        assert_eq!(gca.find_classifier((1, 0, 0), 2).unwrap().covars[0], 2.0);
    }

    fn two_sample_atlas() -> Gca {
        let g = VolumeGeometry::isotropic((6, 1, 1));
        let mut gca = Gca::new(2, 1.0, 1.0, g, 0);
        // 两个样本的协方差秩为 1, f32 下行列式约 3e-7, 略高于 MIN_DET
        let entries: [(usize, [f32; 2], [f32; 3], u32); 4] = [
            (0, [100.0, 150.0], [1.0709958, 1.3943696, 1.8153824], 2),
            (1, [100.0, 150.0], [0.0; 3], 1),
            (2, [100.0, 150.0], [0.0; 3], 2),
            (5, [101.0, 151.0], [9.0, 0.0, 9.0], 20),
        ];
        for (x, means, covars, n) in entries {
            let node = gca.node_mut((x, 0, 0));
            let i = node.find_or_insert(1, 2);
            let gc = &mut node.gcs_mut()[i];
            gc.means = means.to_vec();
            gc.covars = covars.to_vec();
            gc.ntraining = n;
        }
        gca
    }

    #[test]
    fn test_two_sample_covariances_are_not_copied() {
        for search_radius in [0, 3] {
            let mut gca = two_sample_atlas();
            let params = RegularizeParams {
                search_radius,
                ..Default::default()
            };
            let global = gca.global_variances();
            let det_floor = params.det_fraction * global.iter().product::<f64>();
            gca.regularize_trained_covariances(&params).unwrap();

            for x in [0, 1, 2, 5] {
                let gc = gca.find_classifier((x, 0, 0), 1).unwrap();
                assert!(gc.is_invertible(), "node {x}");
                assert!(gc.determinant() >= det_floor, "node {x}: {:?}", gc.covars);
            }
            // 空洞与奇异矩阵都来自 (5, 0, 0), 再加 ridge
            for x in [1, 2] {
                let gc = gca.find_classifier((x, 0, 0), 1).unwrap();
                assert!(gc.regularized);
                assert!(gc.covars[0] > 9.0 && gc.covars[2] > 9.0, "node {x}: {:?}", gc.covars);
                assert_eq!(gc.covars[1], 0.0);
            }
            let kept = gca.find_classifier((5, 0, 0), 1).unwrap();
            assert_eq!(kept.covars, vec![9.0, 0.0, 9.0]);
        }
    }

    #[test]
    fn test_strict_check_reports_singular() {
        let gca = atlas_with(&[((0, 0, 0), 1.0, 0.0, 3)]);
        let strict = RegularizeParams {
            strict: true,
            ..Default::default()
        };
        assert!(gca.check_covariances(&RegularizeParams::default()).is_ok());
        assert!(gca.check_covariances(&strict).is_err());
    }

    #[test]
    fn test_blend_towards_global() {
        let mut gca = atlas_with(&[((0, 0, 0), 1.0, 10.0, 4), ((1, 0, 0), 1.0, 30.0, 4)]);
        gca.regularize_covariances(0.5);
        assert_eq!(gca.find_classifier((0, 0, 0), 2).unwrap().covars[0], 15.0);
        assert_eq!(gca.find_classifier((1, 0, 0), 2).unwrap().covars[0], 25.0);
    }
}
