//! Gibbs 先验下的逐体素打分.
//!
//! `ll(l) = log p(v | l) + PF · Σ_dir log p_dir(邻居标签 | l) + log prior(l)`.
//! 从未观察到的邻居标签取 `UNSEEN_NEIGHBOR / total_training`.

use ndarray::ArrayView3;
use ordered_float::OrderedFloat;

use super::SegmentationContext;
use crate::consts::{BIG_AND_NEGATIVE, UNSEEN_NEIGHBOR};
use crate::gca::{Direction, Gca};
use crate::volume::MriLabel;
use crate::{Idx3d, Label};

/// 在候选中选出得分最高的标签. 同分时取标签值最小者.
pub(crate) fn best_of(scores: impl Iterator<Item = (Label, f64)>) -> Option<(Label, f64)> {
    scores.max_by_key(|&(l, s)| (OrderedFloat(s), std::cmp::Reverse(l)))
}

impl Gca {
    /// 体素 `pos` 取标签 `label` 时的 Gibbs 对数似然, 邻居标签读自 `labels`.
    ///
    /// 体素在图谱外或 node 中没有该标签的分类器时返回 [`BIG_AND_NEGATIVE`].
    /// 位于扫描边界的方向上, 邻居视为与自身同标签, 与训练时的处理一致.
    pub fn voxel_gibbs_log_likelihood(
        &self,
        ctx: &SegmentationContext,
        labels: ArrayView3<'_, Label>,
        pos: Idx3d,
        label: Label,
        prior_factor: f64,
    ) -> f64 {
        let Some((np, pp)) = ctx.cell(pos) else {
            return BIG_AND_NEGATIVE;
        };
        let node = self.node(np);
        let Some(gc) = node.gc(label) else {
            return BIG_AND_NEGATIVE;
        };

        let mut nbr = 0.0;
        if self.uses_mrf() {
            let unseen = UNSEEN_NEIGHBOR / node.total_training.max(1) as f64;
            let dims = ctx.dims();
            for dir in Direction::ALL {
                let q = dir.step_clamped(pos, dims);
                let nl = if q == pos { label } else { labels[q] };
                let p = gc
                    .neighbor_prior(dir, nl)
                    .map_or(unseen, |p| (p as f64).max(unseen));
                nbr += p.ln();
            }
        }

        let prior = self.get_prior(pp, label) as f64;
        let log_prior = if prior > 0.0 { prior.ln() } else { BIG_AND_NEGATIVE };
        gc.log_density(ctx.vals(pos)) + prior_factor * nbr + log_prior
    }

    /// 体素 `pos` 当前标签及其 6 个邻居当前标签的 Gibbs 对数似然之和.
    /// 图谱外的体素不计入.
    pub fn nbhd_gibbs_log_likelihood(
        &self,
        ctx: &SegmentationContext,
        labels: ArrayView3<'_, Label>,
        pos: Idx3d,
        prior_factor: f64,
    ) -> f64 {
        let dims = ctx.dims();
        std::iter::once(pos)
            .chain(Direction::ALL.iter().filter_map(|d| d.step(pos, dims)))
            .filter(|q| ctx.cell(*q).is_some())
            .map(|q| self.voxel_gibbs_log_likelihood(ctx, labels, q, labels[q], prior_factor))
            .sum()
    }

    /// 整幅标签体的 Gibbs 对数似然.
    pub fn image_gibbs_log_likelihood(
        &self,
        ctx: &SegmentationContext,
        labels: &MriLabel,
        prior_factor: f64,
    ) -> f64 {
        let view = labels.data();
        view.indexed_iter()
            .filter(|(pos, _)| ctx.cell(*pos).is_some())
            .map(|(pos, &l)| self.voxel_gibbs_log_likelihood(ctx, view, pos, l, prior_factor))
            .sum()
    }

    /// 体素 `pos` 上不考虑 MRF 的最大后验标签: `argmax log p(v | l) + log prior(l)`,
    /// 候选为 prior 单元中的标签. 图谱外返回 `None`.
    pub fn map_label_at(&self, ctx: &SegmentationContext, pos: Idx3d) -> Option<(Label, f64)> {
        let (np, pp) = ctx.cell(pos)?;
        let vals = ctx.vals(pos);
        best_of(
            self.prior(pp)
                .iter()
                .map(|(l, _)| (l, self.log_posterior_no_mrf(np, pp, l, vals))),
        )
    }

    /// 初始 MAP 标注. 图谱外的体素取 `init` 中的标签 (没有时为 0).
    pub fn label_map(&self, ctx: &SegmentationContext, init: Option<&MriLabel>) -> MriLabel {
        let mut out = match init {
            Some(l) => l.clone(),
            None => MriLabel::new(ctx.geometry().clone()),
        };
        for (pos, l) in out.data_mut().indexed_iter_mut() {
            if let Some((best, _)) = self.map_label_at(ctx, pos) {
                *l = best;
            }
        }
        out
    }

    /// 找出 "不可能" 的配置: 体素的某个邻居标签在训练中从未在该方向出现过.
    ///
    /// 仅用于诊断, 不影响推断.
    pub fn impossible_configuration(
        &self,
        ctx: &SegmentationContext,
        labels: &MriLabel,
    ) -> Vec<Idx3d> {
        if !self.uses_mrf() {
            return Vec::new();
        }
        let view = labels.data();
        let dims = ctx.dims();
        let mut found = Vec::new();
        for (pos, &label) in view.indexed_iter() {
            let Some((np, _)) = ctx.cell(pos) else {
                continue;
            };
            let Some(gc) = self.node(np).gc(label) else {
                continue;
            };
            let impossible = Direction::ALL.iter().any(|&dir| {
                dir.step(pos, dims)
                    .is_some_and(|q| gc.neighbor_prior(dir, view[q]).is_none())
            });
            if impossible {
                found.push(pos);
            }
        }
        if !found.is_empty() {
            log::warn!(
                "{} voxels have neighbor configurations never seen in training, first at {:?}",
                found.len(),
                found[0]
            );
        }
        found
    }
}

#[cfg(feature = "rayon")]
impl Gca {
    /// 借助 `rayon`, 并行地计算初始 MAP 标注.
    pub fn par_label_map(&self, ctx: &SegmentationContext, init: Option<&MriLabel>) -> MriLabel {
        use ndarray::Zip;

        let mut out = match init {
            Some(l) => l.clone(),
            None => MriLabel::new(ctx.geometry().clone()),
        };
        Zip::indexed(out.data_mut()).par_for_each(|pos, l| {
            if let Some((best, _)) = self.map_label_at(ctx, pos) {
                *l = best;
            }
        });
        out
    }
}
