//! 模拟退火预处理: 以 `exp(ΔE / T)` 的概率接受随机提出的标签, 温度按几何级数下降.

use rand::rngs::StdRng;
use rand::seq::{IteratorRandom, SliceRandom};
use rand::{Rng, SeedableRng};

use super::{FixedMask, SegmentationContext};
use crate::gca::Gca;
use crate::params::AnnealParams;
use crate::sync::CancelToken;
use crate::volume::MriLabel;
use crate::{GcaError, GcaResult};

/// 一次退火运行的统计.
#[derive(Clone, Debug, PartialEq)]
pub struct AnnealReport {
    /// 每次遍历接受的提议数.
    pub accepted: Vec<usize>,
    /// 结束时的温度.
    pub final_temp: f64,
}

impl Gca {
    /// 模拟退火. `labels` 原地更新, 固定体素与图谱外体素不变.
    ///
    /// 提议标签从体素所在 prior 单元的其他标签中均匀抽取; 单元中只有一个标签时跳过.
    pub fn anneal(
        &self,
        ctx: &SegmentationContext,
        labels: &mut MriLabel,
        fixed: Option<&FixedMask>,
        params: &AnnealParams,
        cancel: Option<&CancelToken>,
    ) -> GcaResult<AnnealReport> {
        params.assert_args();
        ctx.check_labels(labels, fixed)?;
        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut order = ctx.active_voxels(fixed);
        let mut temp = params.initial_temp;
        let mut accepted = Vec::with_capacity(params.max_iter);

        for iter in 0..params.max_iter {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                log::info!("annealing cancelled after {iter} passes");
                return Err(GcaError::Cancelled);
            }
            order.shuffle(&mut rng);
            let mut n = 0;
            for &pos in &order {
                let Some((_, pp)) = ctx.cell(pos) else {
                    continue;
                };
                let current = labels[pos];
                let Some(proposal) = self
                    .prior(pp)
                    .labels()
                    .iter()
                    .copied()
                    .filter(|&l| l != current)
                    .choose(&mut rng)
                else {
                    continue;
                };
                let view = labels.data();
                let old = self.voxel_gibbs_log_likelihood(ctx, view, pos, current, params.prior_factor);
                let new = self.voxel_gibbs_log_likelihood(ctx, view, pos, proposal, params.prior_factor);
                let delta = new - old;
                if delta >= 0.0 || rng.gen::<f64>() < (delta / temp).exp() {
                    labels[pos] = proposal;
                    n += 1;
                }
            }
            log::debug!("anneal pass {iter}: T {temp:.4}, {n} accepted");
            accepted.push(n);
            temp *= params.cooling;
        }
        Ok(AnnealReport {
            accepted,
            final_temp: temp,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::infer::SegmentationContext;
    use crate::params::AnnealParams;
    use crate::phantom::CubePhantom;
    use crate::Transform;

    #[test]
    fn test_cold_anneal_never_breaks_truth() {
        let phantom = CubePhantom::new((8, 8, 8), (2, 2, 2), (4, 4, 4), 1);
        let gca = crate::phantom::train_atlas(&phantom.build(), 2.0, 2.0).unwrap();
        let truth = phantom.noise_free();
        let ctx = SegmentationContext::new(&gca, &truth.scan, &Transform::identity()).unwrap();

        let mut labels = truth.labels.clone();
        let params = AnnealParams {
            initial_temp: 1e-3,
            max_iter: 5,
            ..Default::default()
        };
        let report = gca.anneal(&ctx, &mut labels, None, &params, None).unwrap();
        assert_eq!(report.accepted.len(), 5);
        assert!(report.final_temp < 1e-3);
        assert_eq!(labels.diff_count(&truth.labels).unwrap(), 0);
    }

    #[test]
    fn test_anneal_is_seeded() {
        let phantom = CubePhantom::new((8, 8, 8), (2, 2, 2), (4, 4, 4), 1);
        let gca = crate::phantom::train_atlas(&phantom.build(), 2.0, 2.0).unwrap();
        let truth = phantom.noise_free();
        let ctx = SegmentationContext::new(&gca, &truth.scan, &Transform::identity()).unwrap();
        let params = AnnealParams {
            initial_temp: 1e4,
            max_iter: 3,
            ..Default::default()
        };
        let mut a = truth.labels.clone();
        let mut b = truth.labels.clone();
        let ra = gca.anneal(&ctx, &mut a, None, &params, None).unwrap();
        let rb = gca.anneal(&ctx, &mut b, None, &params, None).unwrap();
        assert_eq!(ra, rb);
        assert_eq!(a, b);
    }
}
