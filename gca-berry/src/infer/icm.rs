//! Gibbs 先验下的 ICM 重标注.
//!
//! 状态机 `Init -> OrderedPass -> RandomPass(n) -> Converged | MaxIterReached`.
//! 每次遍历后把本次改变的体素膨胀一步 (6-邻域) 作为下一次的工作集, 其余体素冻结.
//! 改变数低于阈值时把 `PRIOR_FACTOR` 加倍直到上限, 每次加倍都把所有体素重新标脏.
//! 到达上限后继续遍历, 直到某次遍历没有体素改变, 此时标注是该权重下的不动点.

use ndarray::{Array3, ArrayView3};
use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::gibbs::best_of;
use super::{FixedMask, SegmentationContext};
use crate::gca::{Direction, Gca};
use crate::params::{probe_hits, RelabelParams, Schedule};
use crate::sync::CancelToken;
use crate::volume::MriLabel;
use crate::{GcaError, GcaResult, Idx3d, Label};

/// ICM 的状态.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IcmState {
    /// 计算初始概率并排序.
    Init,
    /// 按初始概率升序遍历.
    OrderedPass,
    /// 第 `n` 次随机排列遍历.
    RandomPass(usize),
    /// `PRIOR_FACTOR` 已达上限, 且一次遍历没有体素改变.
    Converged,
    /// 达到最大遍历次数.
    MaxIterReached,
}

/// 一次 ICM 运行的统计.
#[derive(Clone, Debug, PartialEq)]
pub struct IcmReport {
    /// 终止状态.
    pub state: IcmState,
    /// 每次遍历改变的体素数.
    pub changed: Vec<usize>,
    /// 结束时的 `PRIOR_FACTOR`.
    pub prior_factor: f64,
}

impl IcmReport {
    /// 遍历次数.
    #[inline]
    pub fn passes(&self) -> usize {
        self.changed.len()
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
    }
}

impl Gca {
    /// 体素 `pos` 的最佳标签: 候选为 prior 单元中的标签加上当前标签, 同分时取最小标签.
    fn best_label(
        &self,
        ctx: &SegmentationContext,
        labels: ArrayView3<'_, Label>,
        pos: Idx3d,
        prior_factor: f64,
    ) -> Option<(Label, f64)> {
        let (_, pp) = ctx.cell(pos)?;
        let current = labels[pos];
        let prior = self.prior(pp);
        let candidates = prior
            .labels()
            .iter()
            .copied()
            .chain((!prior.labels().contains(&current)).then_some(current));
        best_of(candidates.map(|l| (l, self.voxel_gibbs_log_likelihood(ctx, labels, pos, l, prior_factor))))
    }

    /// 基于遍历开始时的冻结快照计算整个工作集的新标签, 只返回发生变化的体素.
    fn evaluate_frozen(
        &self,
        ctx: &SegmentationContext,
        snapshot: ArrayView3<'_, Label>,
        worklist: &[Idx3d],
        prior_factor: f64,
    ) -> Vec<(Idx3d, Label)> {
        let eval = |&pos: &Idx3d| {
            let (best, _) = self.best_label(ctx, snapshot, pos, prior_factor)?;
            (best != snapshot[pos]).then_some((pos, best))
        };
        cfg_if::cfg_if! {
            if #[cfg(feature = "rayon")] {
                worklist.par_iter().filter_map(eval).collect()
            } else {
                worklist.iter().filter_map(eval).collect()
            }
        }
    }

    /// ICM 重标注. `labels` 为初始标注, 原地更新.
    ///
    /// `fixed` 中为 `true` 的体素与映射到图谱外的体素保持输入标签. `cancel` 只在两次遍历
    /// 之间检查, 取消时返回 [`GcaError::Cancelled`], 此时 `labels` 为最后一次完整遍历的结果.
    pub fn reclassify_using_gibbs_priors(
        &self,
        ctx: &SegmentationContext,
        labels: &mut MriLabel,
        fixed: Option<&FixedMask>,
        params: &RelabelParams,
        cancel: Option<&CancelToken>,
    ) -> GcaResult<IcmReport> {
        params.assert_args();
        ctx.check_labels(labels, fixed)?;
        let dims = ctx.dims();
        let active = ctx.active_voxels(fixed);
        let is_active = |pos: Idx3d| ctx.cell(pos).is_some() && !fixed.is_some_and(|m| m[pos]);
        let mut rng = StdRng::seed_from_u64(params.seed);

        // Init
        let mut state = IcmState::Init;
        let mut first_order = active.clone();
        if params.sort_first_pass {
            let view = labels.data();
            let mut keyed: Vec<(OrderedFloat<f64>, Idx3d)> = first_order
                .iter()
                .map(|&pos| {
                    let l = view[pos];
                    let p = ctx
                        .cell(pos)
                        .map_or(f64::NEG_INFINITY, |(np, pp)| {
                            self.log_posterior_no_mrf(np, pp, l, ctx.vals(pos))
                        });
                    (OrderedFloat(p), pos)
                })
                .collect();
            keyed.sort();
            first_order = keyed.into_iter().map(|(_, pos)| pos).collect();
        } else {
            first_order.shuffle(&mut rng);
        }

        let mut dirty = Array3::from_elem(dims, false);
        for &pos in &active {
            dirty[pos] = true;
        }
        let mut prior_factor = params.prior_factor;
        let mut changed_counts = Vec::new();

        for iter in 0..params.max_iter {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                log::info!("relabeling cancelled after {iter} passes");
                return Err(GcaError::Cancelled);
            }
            let order = if iter == 0 {
                state = IcmState::OrderedPass;
                std::mem::take(&mut first_order)
            } else {
                state = IcmState::RandomPass(iter);
                let mut order: Vec<Idx3d> = active.iter().copied().filter(|p| dirty[*p]).collect();
                order.shuffle(&mut rng);
                order
            };

            let changed: Vec<Idx3d> = match params.schedule {
                Schedule::Sequential => {
                    let mut changed = Vec::new();
                    for pos in order {
                        if !dirty[pos] {
                            continue;
                        }
                        let Some((best, score)) = self.best_label(ctx, labels.data(), pos, prior_factor)
                        else {
                            continue;
                        };
                        if probe_hits(&params.probe, pos, None) {
                            log::trace!("icm {state:?} {pos:?}: {} -> {best} ({score:.3})", labels[pos]);
                        }
                        if best != labels[pos] {
                            labels[pos] = best;
                            changed.push(pos);
                        }
                    }
                    changed
                }
                Schedule::Parallel => {
                    let worklist: Vec<Idx3d> = order.into_iter().filter(|p| dirty[*p]).collect();
                    let updates = self.evaluate_frozen(ctx, labels.data(), &worklist, prior_factor);
                    for &(pos, best) in &updates {
                        if probe_hits(&params.probe, pos, None) {
                            log::trace!("icm {state:?} {pos:?}: {} -> {best}", labels[pos]);
                        }
                        labels[pos] = best;
                    }
                    updates.into_iter().map(|(pos, _)| pos).collect()
                }
            };

            let n = changed.len();
            changed_counts.push(n);
            log::debug!("{state:?}: {n} voxels changed, PRIOR_FACTOR {prior_factor:.3}");

            dirty.fill(false);
            for &pos in &changed {
                dirty[pos] = true;
                for dir in Direction::ALL {
                    if let Some(q) = dir.step(pos, dims) {
                        if is_active(q) {
                            dirty[q] = true;
                        }
                    }
                }
            }

            let at_cap = prior_factor >= params.max_prior_factor;
            if at_cap && n == 0 {
                state = IcmState::Converged;
                break;
            }
            if !at_cap && n < params.min_changed {
                prior_factor = (prior_factor * 2.0).min(params.max_prior_factor);
                for &pos in &active {
                    dirty[pos] = true;
                }
            }
            if iter + 1 == params.max_iter {
                state = IcmState::MaxIterReached;
            }
        }

        log::info!("relabeling finished in {} passes: {state:?}", changed_counts.len());
        Ok(IcmReport {
            state,
            changed: changed_counts,
            prior_factor,
        })
    }
}
