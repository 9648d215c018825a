//! 统计引擎: 训练, 协方差正则化, 强度重归一化, FLASH 前向模型.
//!
//! 训练分两遍: 先对所有训练卷调用 [`Gca::train`] 后调用 [`Gca::complete_mean_training`],
//! 再对所有训练卷调用 [`Gca::train_covariances`] 后调用 [`Gca::complete_covariance_training`].

use crate::consts::BIG_AND_NEGATIVE;
use crate::gca::{Direction, Gca};
use crate::params::{probe_hits, RegularizeParams, TrainParams};
use crate::transform::Transform;
use crate::volume::{MriLabel, MriScan, VolumeAttr};
use crate::{GcaError, GcaResult, Idx3d, Label};

mod fill;
mod flash;
mod histogram;
mod regularize;
mod renorm;

pub use flash::{flash_forward, flash_jacobian};
pub use histogram::Histogram;

use fill::nearest_node;
use regularize::Conditioning;

impl Gca {
    /// 检查扫描与标签体是否匹配本图谱.
    fn check_inputs(&self, scan: &MriScan, labels: &MriLabel) -> GcaResult<()> {
        if scan.channels() != self.scan_channels() {
            return Err(GcaError::ChannelMismatch {
                expected: self.scan_channels(),
                found: scan.channels(),
            });
        }
        if scan.shape() != labels.shape() {
            return Err(GcaError::ShapeMismatch(scan.shape(), labels.shape()));
        }
        Ok(())
    }

    /// 剪枝图谱是否接受该样本的强度? 偏离参考均值超过 `prune_sigma` 个标准差时拒绝.
    fn prune_accepts(
        prune: Option<&Gca>,
        transform: &Transform,
        pos: Idx3d,
        label: Label,
        vals: &[f32],
        sigma: f64,
    ) -> bool {
        let Some(prune) = prune else {
            return true;
        };
        let p = (pos.0 as f64, pos.1 as f64, pos.2 as f64);
        let Some(gc) = prune
            .source_voxel_to_node(transform, p)
            .ok()
            .and_then(|n| prune.find_classifier(n, label))
        else {
            return true;
        };
        vals.iter().enumerate().all(|(c, v)| {
            let sd = (gc.variance(c).max(0.0) as f64).sqrt();
            ((*v - gc.means[c]) as f64).abs() <= sigma * sd
        })
    }

    /// 第一遍训练: 累积先验计数, 强度和, 以及 6 个方向的邻居标签直方图.
    ///
    /// `prune` 为可选的参考图谱, 偏离其均值过远的样本只计入先验.
    /// 映射到图谱外的体素被跳过.
    pub fn train(
        &mut self,
        scan: &MriScan,
        labels: &MriLabel,
        transform: &Transform,
        prune: Option<&Gca>,
        params: &TrainParams,
    ) -> GcaResult<()> {
        params.assert_args();
        self.check_inputs(scan, labels)?;
        let dims = labels.shape();
        let ninputs = self.ninputs();
        let mrf = self.uses_mrf();
        let mut vals = Vec::with_capacity(ninputs);
        let (mut used, mut outside, mut pruned) = (0usize, 0usize, 0usize);

        for pos in labels.indices() {
            let p = (pos.0 as f64, pos.1 as f64, pos.2 as f64);
            let (Ok(pp), Ok(np)) = (
                self.source_voxel_to_prior(transform, p),
                self.source_voxel_to_node(transform, p),
            ) else {
                outside += 1;
                continue;
            };
            let label = labels[pos];
            self.load_vals(scan, pos, &mut vals);

            // updatePrior
            self.prior_mut(pp).add(label);

            // updateNode
            let accept = !params.priors_only
                && Self::prune_accepts(prune, transform, pos, label, &vals, params.prune_sigma);
            let node = self.node_mut(np);
            node.total_training += 1;
            let i = node.find_or_insert(label, ninputs);
            let gc = &mut node.gcs_mut()[i];
            if accept {
                gc.accumulate_mean(&vals);
            } else {
                gc.n_just_priors += 1;
                pruned += 1;
            }

            // updateNodeGibbsPriors
            if mrf {
                for dir in Direction::ALL {
                    let nbr = labels[dir.step_clamped(pos, dims)];
                    gc.nbrs[dir.index()].add(nbr);
                }
            }

            if probe_hits(&params.probe, pos, Some(label)) {
                log::trace!("train {pos:?}: label {label} -> node {np:?}, prior {pp:?}, vals {vals:?}");
            }
            used += 1;
        }
        log::info!("trained on {used} voxels ({outside} outside atlas, {pruned} prior-only)");
        Ok(())
    }

    /// 第二遍训练: 累积离差外积. 要求均值已经由 [`Self::complete_mean_training`] 完成.
    pub fn train_covariances(
        &mut self,
        scan: &MriScan,
        labels: &MriLabel,
        transform: &Transform,
        prune: Option<&Gca>,
        params: &TrainParams,
    ) -> GcaResult<()> {
        params.assert_args();
        self.check_inputs(scan, labels)?;
        if params.priors_only {
            return Ok(());
        }
        let mut vals = Vec::with_capacity(self.ninputs());
        for pos in labels.indices() {
            let p = (pos.0 as f64, pos.1 as f64, pos.2 as f64);
            let Ok(np) = self.source_voxel_to_node(transform, p) else {
                continue;
            };
            let label = labels[pos];
            self.load_vals(scan, pos, &mut vals);
            if !Self::prune_accepts(prune, transform, pos, label, &vals, params.prune_sigma) {
                continue;
            }
            if let Some(gc) = self.node_mut(np).gc_mut(label) {
                if gc.ntraining > 0 {
                    gc.accumulate_covariance(&vals);
                }
            }
        }
        Ok(())
    }

    /// 完成均值训练: 均值除以样本数, 邻居直方图与先验归一化, 然后对没有强度样本的
    /// 分类器做空洞填充 (复制最近的同标签有效分类器的均值).
    pub fn complete_mean_training(&mut self) {
        for node in self.nodes_mut().iter_mut() {
            for gc in node.gcs_mut() {
                if gc.ntraining > 0 {
                    let n = gc.ntraining as f32;
                    gc.means.iter_mut().for_each(|m| *m /= n);
                }
                gc.nbrs.iter_mut().for_each(|h| h.normalize());
            }
        }
        for prior in self.priors_mut().iter_mut() {
            prior.normalize();
        }

        let radius = RegularizeParams::default().search_radius;
        let holes = self.find_holes(radius, |gc| gc.ntraining == 0, |gc| gc.ntraining > 0);
        let mut failed = 0;
        for (pos, i, label, source) in holes {
            match source {
                Some(src) => {
                    let means = match self.find_classifier(src, label) {
                        Some(gc) => gc.means.clone(),
                        None => continue,
                    };
                    self.node_mut(pos).gcs_mut()[i].means = means;
                }
                None => failed += 1,
            }
        }
        if failed > 0 {
            log::warn!("{failed} classifiers without intensity samples could not be filled");
        }
        log::info!("mean training complete");
    }

    /// 完成协方差训练: 除以 `n - 1`, 空洞填充, 然后做两遍正则化并复查.
    ///
    /// 严格模式下, 仍然奇异的协方差返回 [`GcaError::SingularCovariance`].
    pub fn complete_covariance_training(&mut self, params: &RegularizeParams) -> GcaResult<()> {
        params.assert_args();
        for gc in self.nodes_mut().iter_mut().flat_map(|n| n.gcs_mut().iter_mut()) {
            match gc.ntraining {
                0 => {}
                1 => gc.covars.iter_mut().for_each(|c| *c = 0.0),
                n => {
                    let n = (n - 1) as f32;
                    gc.covars.iter_mut().for_each(|c| *c /= n);
                }
            }
        }

        self.regularize_trained_covariances(params)?;
        log::info!("covariance training complete");
        Ok(())
    }

    /// 协方差归一化之后的步骤: 样本数不足 2 的分类器从最近的良态同标签分类器复制协方差,
    /// 然后两遍正则化并复查.
    pub(crate) fn regularize_trained_covariances(
        &mut self,
        params: &RegularizeParams,
    ) -> GcaResult<()> {
        let global = self.global_variances();
        let cond = Conditioning::new(self.ninputs(), &global, params);
        let holes = self.find_holes(
            params.search_radius,
            |gc| gc.ntraining < 2,
            |gc| cond.is_well_conditioned(gc),
        );
        for (pos, i, label, source) in holes {
            let Some(src) = source else {
                continue;
            };
            if let Some(covars) = self.find_classifier(src, label).map(|gc| gc.covars.clone()) {
                self.node_mut(pos).gcs_mut()[i].covars = covars;
            }
        }

        let singular = self.fix_singular_covariances(&global, params);
        let ill = self.fix_ill_conditioned_covariances(&global, params);
        log::debug!("regularized {singular} singular and {ill} ill-conditioned covariances");
        self.check_covariances(params)
    }

    /// 找到所有满足 `hole` 的分类器, 以及各自最近的满足 `is_source` 的同标签分类器所在单元.
    fn find_holes<H, S>(
        &self,
        radius: usize,
        hole: H,
        is_source: S,
    ) -> Vec<(Idx3d, usize, Label, Option<Idx3d>)>
    where
        H: Fn(&crate::Gc1d) -> bool,
        S: Fn(&crate::Gc1d) -> bool,
    {
        let mut holes = Vec::new();
        for (pos, node) in self.nodes().indexed_iter() {
            for (i, (label, gc)) in node.iter().enumerate() {
                if !hole(gc) {
                    continue;
                }
                let source =
                    nearest_node(self.nodes(), pos, radius, |_, n| n.gc(label).is_some_and(&is_source));
                holes.push((pos, i, label, source));
            }
        }
        holes
    }

    /// 单个体素的 "无 MRF" 对数后验: `log p(v | l) + log prior(l)`.
    /// 标签不在 node 中时返回 [`BIG_AND_NEGATIVE`].
    pub(crate) fn log_posterior_no_mrf(
        &self,
        node: Idx3d,
        prior: Idx3d,
        label: Label,
        vals: &[f32],
    ) -> f64 {
        match self.find_classifier(node, label) {
            Some(gc) => {
                let p = self.get_prior(prior, label) as f64;
                let lp = if p > 0.0 { p.ln() } else { BIG_AND_NEGATIVE };
                gc.log_density(vals) + lp
            }
            None => BIG_AND_NEGATIVE,
        }
    }
}
