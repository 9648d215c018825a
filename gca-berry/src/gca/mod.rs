//! 图谱数据结构: node / prior 双分辨率网格.

use std::collections::BTreeSet;

use nalgebra::Matrix4;
use ndarray::Array3;

use crate::consts::{flags, GcaType, MAX_GCA_LABELS};
use crate::volume::{MriScan, VolumeGeometry};
use crate::{Idx3d, Label};

mod classifier;
mod coords;
mod node;
mod sample;

pub(crate) use classifier::{covar_index, log_density};
pub use classifier::{Direction, Gc1d, NeighborHistogram};
pub use node::{GcaNode, GcaPrior};
pub use sample::{GcaSample, SampleParams};

/// 单个输入通道的 FLASH 脉冲序列参数.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PulseParams {
    /// 重复时间 (毫秒).
    pub tr: f32,

    /// 翻转角 (弧度).
    pub flip_angle: f32,

    /// 回波时间 (毫秒).
    pub te: f32,
}

/// 单个标签的组织参数.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TissueParms {
    /// 纵向弛豫时间 (毫秒).
    pub t1: f32,

    /// 质子密度.
    pub pd: f32,

    /// 横向弛豫时间 (毫秒).
    pub t2: f32,
}

impl TissueParms {
    /// 是否尚未设置?
    #[inline]
    pub fn is_unset(&self) -> bool {
        self.t1 == 0.0 && self.pd == 0.0 && self.t2 == 0.0
    }
}

/// 模板体素 / RAS / node / prior 之间的仿射变换缓存. 总是由几何与间距导出, 从不持久化.
#[derive(Clone, Debug)]
pub(crate) struct GridXforms {
    pub(crate) tal_to_node: Matrix4<f64>,
    pub(crate) node_to_tal: Matrix4<f64>,
    pub(crate) tal_to_prior: Matrix4<f64>,
    pub(crate) prior_to_tal: Matrix4<f64>,
    pub(crate) ras_to_node: Matrix4<f64>,
    pub(crate) node_to_ras: Matrix4<f64>,
    pub(crate) ras_to_prior: Matrix4<f64>,
    pub(crate) prior_to_ras: Matrix4<f64>,
}

impl GridXforms {
    fn new(geometry: &VolumeGeometry, node_spacing: f64, prior_spacing: f64) -> Self {
        let node_to_ras = geometry.grid_vox2ras(node_spacing);
        let ras_to_node = geometry.grid_ras2vox(node_spacing);
        let prior_to_ras = geometry.grid_vox2ras(prior_spacing);
        let ras_to_prior = geometry.grid_ras2vox(prior_spacing);
        Self {
            tal_to_node: ras_to_node * geometry.vox2ras(),
            node_to_tal: geometry.ras2vox() * node_to_ras,
            tal_to_prior: ras_to_prior * geometry.vox2ras(),
            prior_to_tal: geometry.ras2vox() * prior_to_ras,
            ras_to_node,
            node_to_ras,
            ras_to_prior,
            prior_to_ras,
        }
    }
}

/// 网格在一个维度上的单元数: `ceil(dim * size / spacing)`, 至少为 1.
#[inline]
fn grid_len(dim: usize, size: f64, spacing: f64) -> usize {
    ((dim as f64 * size / spacing).ceil() as usize).max(1)
}

/// 高斯分类器阵列, 即整个概率图谱.
#[derive(Clone, Debug)]
pub struct Gca {
    node_spacing: f64,
    prior_spacing: f64,
    nodes: Array3<GcaNode>,
    priors: Array3<GcaPrior>,

    /// 特征数 = 扫描通道数 + 梯度通道数.
    ninputs: usize,
    flags: u32,
    gca_type: GcaType,

    /// 模板 (Talairach) 体数据几何.
    geometry: VolumeGeometry,
    sequence: Vec<PulseParams>,
    tissue_parms: Vec<TissueParms>,
    xforms: GridXforms,
}

impl Gca {
    /// 分配空图谱.
    ///
    /// `channels` 为输入扫描通道数, `flags` 中的梯度标志位会追加对应的特征通道.
    /// 网格尺寸由模板几何 `geometry` 的物理范围除以间距得到.
    ///
    /// 如果 `channels` 为 0 或间距不为正, 则程序 panic.
    pub fn new(
        channels: usize,
        prior_spacing: f64,
        node_spacing: f64,
        geometry: VolumeGeometry,
        flags: u32,
    ) -> Self {
        assert!(channels > 0, "至少需要一个输入通道");
        assert!(prior_spacing > 0.0 && node_spacing > 0.0, "网格间距必须为正");
        let (w, h, d) = geometry.dims();
        let [xs, ys, zs] = geometry.sizes();
        let grid = |s| (grid_len(w, xs, s), grid_len(h, ys, s), grid_len(d, zs, s));
        let nodes = Array3::from_elem(grid(node_spacing), GcaNode::default());
        let priors = Array3::from_elem(grid(prior_spacing), GcaPrior::default());
        Self::from_parts(
            channels + flags::grad_channels(flags),
            prior_spacing,
            node_spacing,
            nodes,
            priors,
            flags,
            geometry,
        )
    }

    /// 由已有网格组装. 变换缓存总是重新计算.
    pub(crate) fn from_parts(
        ninputs: usize,
        prior_spacing: f64,
        node_spacing: f64,
        nodes: Array3<GcaNode>,
        priors: Array3<GcaPrior>,
        flags: u32,
        geometry: VolumeGeometry,
    ) -> Self {
        let xforms = GridXforms::new(&geometry, node_spacing, prior_spacing);
        Self {
            node_spacing,
            prior_spacing,
            nodes,
            priors,
            ninputs,
            flags,
            gca_type: GcaType::Normal,
            geometry,
            sequence: Vec::new(),
            tissue_parms: vec![TissueParms::default(); MAX_GCA_LABELS],
            xforms,
        }
    }

    /// node 网格间距 (毫米).
    #[inline]
    pub fn node_spacing(&self) -> f64 {
        self.node_spacing
    }

    /// prior 网格间距 (毫米).
    #[inline]
    pub fn prior_spacing(&self) -> f64 {
        self.prior_spacing
    }

    /// node 网格尺寸.
    #[inline]
    pub fn node_dims(&self) -> Idx3d {
        self.nodes.dim()
    }

    /// prior 网格尺寸.
    #[inline]
    pub fn prior_dims(&self) -> Idx3d {
        self.priors.dim()
    }

    /// 特征数 (含梯度通道).
    #[inline]
    pub fn ninputs(&self) -> usize {
        self.ninputs
    }

    /// 输入扫描应有的通道数.
    #[inline]
    pub fn scan_channels(&self) -> usize {
        self.ninputs - flags::grad_channels(self.flags)
    }

    /// 标志位.
    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// 是否训练 / 使用 MRF 邻居直方图?
    #[inline]
    pub fn uses_mrf(&self) -> bool {
        self.flags & flags::GCA_NO_MRF == 0
    }

    /// 图谱类型.
    #[inline]
    pub fn gca_type(&self) -> GcaType {
        self.gca_type
    }

    /// 设置图谱类型.
    #[inline]
    pub fn set_gca_type(&mut self, t: GcaType) {
        self.gca_type = t;
    }

    /// 模板几何.
    #[inline]
    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    /// 替换模板几何并重建变换缓存. 网格尺寸不变.
    pub fn set_geometry(&mut self, geometry: VolumeGeometry) {
        self.xforms = GridXforms::new(&geometry, self.node_spacing, self.prior_spacing);
        self.geometry = geometry;
    }

    /// 改变特征数与标志位. 调用方负责同时改写所有分类器的维度.
    #[inline]
    pub(crate) fn reshape_inputs(&mut self, ninputs: usize, flags: u32) {
        self.ninputs = ninputs;
        self.flags = flags;
    }

    #[inline]
    pub(crate) fn xforms(&self) -> &GridXforms {
        &self.xforms
    }

    /// 每个扫描通道的脉冲序列参数. 未标定时为空.
    #[inline]
    pub fn sequence(&self) -> &[PulseParams] {
        &self.sequence
    }

    /// 设置脉冲序列参数.
    #[inline]
    pub fn set_sequence(&mut self, sequence: Vec<PulseParams>) {
        self.sequence = sequence;
    }

    /// 标签 `label` 的组织参数.
    #[inline]
    pub fn tissue_parms(&self, label: Label) -> TissueParms {
        self.tissue_parms[label as usize]
    }

    /// 设置标签 `label` 的组织参数.
    #[inline]
    pub fn set_tissue_parms(&mut self, label: Label, tp: TissueParms) {
        self.tissue_parms[label as usize] = tp;
    }

    /// 整张组织参数表.
    #[inline]
    pub fn tissue_table(&self) -> &[TissueParms] {
        &self.tissue_parms
    }

    /// node 网格.
    #[inline]
    pub fn nodes(&self) -> &Array3<GcaNode> {
        &self.nodes
    }

    /// 可变 node 网格.
    #[inline]
    pub fn nodes_mut(&mut self) -> &mut Array3<GcaNode> {
        &mut self.nodes
    }

    /// prior 网格.
    #[inline]
    pub fn priors(&self) -> &Array3<GcaPrior> {
        &self.priors
    }

    /// 可变 prior 网格.
    #[inline]
    pub fn priors_mut(&mut self) -> &mut Array3<GcaPrior> {
        &mut self.priors
    }

    /// 获取 node 单元. 越界时 panic.
    #[inline]
    pub fn node(&self, pos: Idx3d) -> &GcaNode {
        &self.nodes[pos]
    }

    /// 获取可变 node 单元. 越界时 panic.
    #[inline]
    pub fn node_mut(&mut self, pos: Idx3d) -> &mut GcaNode {
        &mut self.nodes[pos]
    }

    /// 获取 prior 单元. 越界时 panic.
    #[inline]
    pub fn prior(&self, pos: Idx3d) -> &GcaPrior {
        &self.priors[pos]
    }

    /// 获取可变 prior 单元. 越界时 panic.
    #[inline]
    pub fn prior_mut(&mut self, pos: Idx3d) -> &mut GcaPrior {
        &mut self.priors[pos]
    }

    /// 在 node 单元 `pos` 中查找标签 `label` 的分类器.
    #[inline]
    pub fn find_classifier(&self, pos: Idx3d, label: Label) -> Option<&Gc1d> {
        self.nodes.get(pos).and_then(|n| n.gc(label))
    }

    /// prior 单元 `pos` 中标签 `label` 的先验概率. 越界或不存在时为 0.
    #[inline]
    pub fn get_prior(&self, pos: Idx3d, label: Label) -> f32 {
        self.priors.get(pos).map_or(0.0, |p| p.prior(label))
    }

    /// 图谱中出现过的所有标签 (有先验或有分类器).
    pub fn labels_present(&self) -> BTreeSet<Label> {
        let mut set: BTreeSet<Label> = self
            .priors
            .iter()
            .flat_map(|p| p.iter().filter(|(_, v)| *v > 0.0).map(|(l, _)| l))
            .collect();
        set.extend(self.nodes.iter().flat_map(|n| n.labels().iter().copied()));
        set
    }

    /// 标签 `label` 在第 `channel` 个特征上的全图谱均值, 以训练样本数加权
    /// (样本数未知时权重为 1). 标签不存在时返回 `None`.
    pub fn label_mean(&self, label: Label, channel: usize) -> Option<f64> {
        let (mut sum, mut weight) = (0.0, 0.0);
        for gc in self.nodes.iter().filter_map(|n| n.gc(label)) {
            let w = gc.ntraining.max(1) as f64;
            sum += gc.means[channel] as f64 * w;
            weight += w;
        }
        (weight > 0.0).then(|| sum / weight)
    }

    /// 以模板几何生成 "最可能强度" 体: 每个体素取所在 prior 单元先验最大标签的均值.
    ///
    /// 不在网格内或没有分类器的体素保持 0.
    pub fn most_likely_volume(&self) -> MriScan {
        let mut out = MriScan::new(self.geometry.clone(), self.ninputs);
        let (w, h, d) = self.geometry.dims();
        for (x, y, z) in ndarray::indices((w, h, d)) {
            let p = (x as f64, y as f64, z as f64);
            let (Ok(pp), Ok(np)) = (self.template_voxel_to_prior(p), self.template_voxel_to_node(p))
            else {
                continue;
            };
            let Some((label, _)) = self.priors[pp].max_prior() else {
                continue;
            };
            if let Some(gc) = self.nodes[np].gc(label) {
                for (c, m) in gc.means.iter().enumerate() {
                    out.set((x, y, z), c, *m);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::Gca;
    use crate::consts::flags;
    use crate::VolumeGeometry;

    #[test]
    fn test_grid_dims_from_spacing() {
        let g = VolumeGeometry::new((10, 9, 8), [1.0, 1.0, 2.0]);
        let gca = Gca::new(1, 2.0, 4.0, g, 0);
        assert_eq!(gca.prior_dims(), (5, 5, 8));
        assert_eq!(gca.node_dims(), (3, 3, 4));
        assert_eq!(gca.ninputs(), 1);
    }

    #[test]
    fn test_gradient_flags_extend_features() {
        let g = VolumeGeometry::isotropic((4, 4, 4));
        let gca = Gca::new(2, 1.0, 1.0, g, flags::GCA_XGRAD | flags::GCA_ZGRAD);
        assert_eq!(gca.ninputs(), 4);
        assert_eq!(gca.scan_channels(), 2);
    }

    #[test]
    fn test_most_likely_volume_takes_max_prior_mean() {
        let g = VolumeGeometry::isotropic((4, 4, 4));
        let mut gca = Gca::new(1, 2.0, 2.0, g, 0);
        let node = gca.node_mut((0, 0, 0));
        for (label, mean) in [(3, 40.0), (5, 90.0)] {
            let i = node.find_or_insert(label, 1);
            node.gcs_mut()[i].means[0] = mean;
        }
        for l in [5, 3, 3] {
            gca.prior_mut((0, 0, 0)).add(l);
        }
        let node = gca.node_mut((1, 1, 1));
        let i = node.find_or_insert(5, 1);
        node.gcs_mut()[i].means[0] = 70.0;
        gca.prior_mut((1, 1, 1)).add(5);
        // prior 中有标签, node 中却没有对应分类器
        gca.prior_mut((1, 0, 0)).add(2);

        let vol = gca.most_likely_volume();
        assert_eq!(vol.channels(), 1);
        for (x, y, z) in ndarray::indices((4, 4, 4)) {
            let expected = match (x / 2, y / 2, z / 2) {
                (0, 0, 0) => 40.0,
                (1, 1, 1) => 70.0,
                _ => 0.0,
            };
            assert_eq!(vol.get((x, y, z), 0), expected, "{:?}", (x, y, z));
        }
    }

    #[test]
    fn test_label_mean_weighted_by_training() {
        let g = VolumeGeometry::isotropic((2, 1, 1));
        let mut gca = Gca::new(1, 1.0, 1.0, g, 0);
        let i = gca.node_mut((0, 0, 0)).find_or_insert(3, 1);
        gca.node_mut((0, 0, 0)).gcs_mut()[i].means[0] = 10.0;
        gca.node_mut((0, 0, 0)).gcs_mut()[i].ntraining = 3;
        let j = gca.node_mut((1, 0, 0)).find_or_insert(3, 1);
        gca.node_mut((1, 0, 0)).gcs_mut()[j].means[0] = 30.0;
        gca.node_mut((1, 0, 0)).gcs_mut()[j].ntraining = 1;
        assert_eq!(gca.label_mean(3, 0), Some(15.0));
        assert_eq!(gca.label_mean(4, 0), None);
        assert!(gca.labels_present().contains(&3));
    }
}
