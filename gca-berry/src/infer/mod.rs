//! 推断引擎: 逐体素后验, 邻域 Gibbs 能量, 模拟退火与 ICM 重标注.
//!
//! 推断期间图谱只读. 每次调用先为扫描构建一个 [`SegmentationContext`],
//! 缓存每个体素所在的 node / prior 单元与特征向量, 之后的所有遍历都只查表.

use ndarray::Array3;

use crate::gca::Gca;
use crate::params::{AnnealParams, RelabelParams};
use crate::sync::CancelToken;
use crate::transform::Transform;
use crate::volume::{MriLabel, MriScan, VolumeAttr, VolumeGeometry};
use crate::{GcaError, GcaResult, Idx3d};

mod anneal;
mod gibbs;
mod icm;

pub use anneal::AnnealReport;
pub use icm::{IcmReport, IcmState};

/// 体素掩码. `true` 表示该体素已固定, 不参与重标注.
pub type FixedMask = Array3<bool>;

/// 单次分割调用的只读缓存: 体素到 (node, prior) 单元的映射与特征向量.
#[derive(Debug, Clone)]
pub struct SegmentationContext {
    geometry: VolumeGeometry,
    cells: Array3<Option<(Idx3d, Idx3d)>>,

    /// 按 `x -> y -> z` 顺序展平, 每个体素 `ninputs` 个值.
    vals: Vec<f32>,
    ninputs: usize,
    inside: usize,
}

impl SegmentationContext {
    /// 为扫描 `scan` 在变换 `transform` 下构建缓存.
    ///
    /// 通道数与图谱不一致时返回 [`GcaError::ChannelMismatch`].
    pub fn new(gca: &Gca, scan: &MriScan, transform: &Transform) -> GcaResult<Self> {
        if scan.channels() != gca.scan_channels() {
            return Err(GcaError::ChannelMismatch {
                expected: gca.scan_channels(),
                found: scan.channels(),
            });
        }
        let (w, h, d) = scan.shape();
        let mut cells = Array3::from_elem((w, h, d), None);
        let ninputs = gca.ninputs();
        let mut vals = vec![0.0; w * h * d * ninputs];
        let mut buf = Vec::with_capacity(gca.ninputs());
        let mut inside = 0;
        for pos in scan.indices() {
            let p = (pos.0 as f64, pos.1 as f64, pos.2 as f64);
            let (Ok(np), Ok(pp)) = (
                gca.source_voxel_to_node(transform, p),
                gca.source_voxel_to_prior(transform, p),
            ) else {
                continue;
            };
            cells[pos] = Some((np, pp));
            gca.load_vals(scan, pos, &mut buf);
            let at = ((pos.0 * h + pos.1) * d + pos.2) * ninputs;
            vals[at..at + ninputs].copy_from_slice(&buf);
            inside += 1;
        }
        log::debug!("{inside} of {} voxels inside the atlas", w * h * d);
        Ok(Self {
            geometry: scan.geometry().clone(),
            cells,
            vals,
            ninputs,
            inside,
        })
    }

    /// 扫描几何.
    #[inline]
    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    /// 扫描形状.
    #[inline]
    pub fn dims(&self) -> Idx3d {
        self.cells.dim()
    }

    /// 体素所在的 `(node, prior)` 单元. 图谱外为 `None`.
    #[inline]
    pub fn cell(&self, pos: Idx3d) -> Option<(Idx3d, Idx3d)> {
        self.cells[pos]
    }

    /// 体素的特征向量.
    #[inline]
    pub fn vals(&self, (x, y, z): Idx3d) -> &[f32] {
        let (_, h, d) = self.dims();
        let at = ((x * h + y) * d + z) * self.ninputs;
        &self.vals[at..at + self.ninputs]
    }

    /// 图谱内的体素个数.
    #[inline]
    pub fn inside_count(&self) -> usize {
        self.inside
    }

    /// 图谱内且未被固定的体素, 按 `x -> y -> z` 顺序.
    pub(crate) fn active_voxels(&self, fixed: Option<&FixedMask>) -> Vec<Idx3d> {
        self.cells
            .indexed_iter()
            .filter(|(pos, c)| c.is_some() && !fixed.is_some_and(|m| m[*pos]))
            .map(|(pos, _)| pos)
            .collect()
    }

    pub(crate) fn check_labels(&self, labels: &MriLabel, fixed: Option<&FixedMask>) -> GcaResult<()> {
        if labels.shape() != self.dims() {
            return Err(GcaError::ShapeMismatch(self.dims(), labels.shape()));
        }
        if let Some(m) = fixed {
            if m.dim() != self.dims() {
                return Err(GcaError::ShapeMismatch(self.dims(), m.dim()));
            }
        }
        Ok(())
    }
}

impl Gca {
    /// 完整的分割流程: 初始 MAP 标注, 可选的模拟退火, 然后 ICM 重标注.
    ///
    /// 图谱外的体素标签为 0.
    pub fn segment(
        &self,
        scan: &MriScan,
        transform: &Transform,
        relabel: &RelabelParams,
        anneal: Option<&AnnealParams>,
        cancel: Option<&CancelToken>,
    ) -> GcaResult<(MriLabel, IcmReport)> {
        let ctx = SegmentationContext::new(self, scan, transform)?;
        cfg_if::cfg_if! {
            if #[cfg(feature = "rayon")] {
                let mut labels = self.par_label_map(&ctx, None);
            } else {
                let mut labels = self.label_map(&ctx, None);
            }
        }
        if let Some(params) = anneal {
            let report = self.anneal(&ctx, &mut labels, None, params, cancel)?;
            log::debug!("annealing: {:?} accepted", report.accepted);
        }
        let report = self.reclassify_using_gibbs_priors(&ctx, &mut labels, None, relabel, cancel)?;
        Ok((labels, report))
    }
}
