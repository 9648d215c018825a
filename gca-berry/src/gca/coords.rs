//! 坐标变换链: 源体素 -> 模板体素 -> node / prior 网格, 以及反向映射.
//!
//! 所有映射都是纯函数, 不使用共享的临时矩阵.

use nalgebra::Matrix4;
use num::ToPrimitive;

use super::Gca;
use crate::consts::flags;
use crate::transform::{Backward, Transform};
use crate::volume::{transform_point, MriScan, VolumeAttr, VolumeGeometry};
use crate::{CoordResult, Idx3d, Idx3dF, OutOfBounds};

/// 向下取整并做边界检查.
#[inline]
fn floor_in(dims: Idx3d, (x, y, z): Idx3dF) -> CoordResult<Idx3d> {
    let x = x.floor().to_usize().ok_or(OutOfBounds)?;
    let y = y.floor().to_usize().ok_or(OutOfBounds)?;
    let z = z.floor().to_usize().ok_or(OutOfBounds)?;
    if x < dims.0 && y < dims.1 && z < dims.2 {
        Ok((x, y, z))
    } else {
        Err(OutOfBounds)
    }
}

/// 单元中心.
#[inline]
fn center((x, y, z): Idx3d) -> Idx3dF {
    (x as f64 + 0.5, y as f64 + 0.5, z as f64 + 0.5)
}

/// 按间距比例缩放整数索引, 向下取整并截断到 `dims` 内.
#[inline]
fn rescale((x, y, z): Idx3d, from: f64, to: f64, (w, h, d): Idx3d) -> Idx3d {
    let f = |v: usize, n: usize| {
        let r = (v as f64 * from / to).floor().to_usize().unwrap_or(0);
        r.min(n - 1)
    };
    (f(x, w), f(y, h), f(z, d))
}

impl Gca {
    #[inline]
    fn map_to_grid(&self, m: &Matrix4<f64>, dims: Idx3d, p: Idx3dF) -> CoordResult<Idx3d> {
        floor_in(dims, transform_point(m, p))
    }

    /// 任意体数据的体素 -> node 单元 (经由各自的体素到 RAS 变换).
    pub fn voxel_to_node(&self, geom: &VolumeGeometry, p: Idx3dF) -> CoordResult<Idx3d> {
        let ras = transform_point(geom.vox2ras(), p);
        self.map_to_grid(&self.xforms().ras_to_node, self.node_dims(), ras)
    }

    /// 任意体数据的体素 -> prior 单元.
    pub fn voxel_to_prior(&self, geom: &VolumeGeometry, p: Idx3dF) -> CoordResult<Idx3d> {
        let ras = transform_point(geom.vox2ras(), p);
        self.map_to_grid(&self.xforms().ras_to_prior, self.prior_dims(), ras)
    }

    /// node 单元 -> 体数据体素. 取单元中心 (加半个间距) 再向下取整.
    pub fn node_to_voxel(&self, geom: &VolumeGeometry, node: Idx3d) -> CoordResult<Idx3d> {
        let ras = transform_point(&self.xforms().node_to_ras, center(node));
        floor_in(geom.dims(), transform_point(geom.ras2vox(), ras))
    }

    /// prior 单元 -> 体数据体素.
    pub fn prior_to_voxel(&self, geom: &VolumeGeometry, prior: Idx3d) -> CoordResult<Idx3d> {
        let ras = transform_point(&self.xforms().prior_to_ras, center(prior));
        floor_in(geom.dims(), transform_point(geom.ras2vox(), ras))
    }

    /// prior 单元 -> node 单元. 两张网格共用方向余弦与原点, 只需按间距比例缩放.
    #[inline]
    pub fn prior_to_node(&self, prior: Idx3d) -> Idx3d {
        rescale(prior, self.prior_spacing(), self.node_spacing(), self.node_dims())
    }

    /// node 单元 -> prior 单元.
    #[inline]
    pub fn node_to_prior(&self, node: Idx3d) -> Idx3d {
        rescale(node, self.node_spacing(), self.prior_spacing(), self.prior_dims())
    }

    /// 模板体素 -> node 单元.
    #[inline]
    pub fn template_voxel_to_node(&self, p: Idx3dF) -> CoordResult<Idx3d> {
        self.map_to_grid(&self.xforms().tal_to_node, self.node_dims(), p)
    }

    /// 模板体素 -> prior 单元.
    #[inline]
    pub fn template_voxel_to_prior(&self, p: Idx3dF) -> CoordResult<Idx3d> {
        self.map_to_grid(&self.xforms().tal_to_prior, self.prior_dims(), p)
    }

    /// prior 单元中心的模板体素坐标.
    #[inline]
    pub fn prior_to_template_voxel(&self, prior: Idx3d) -> Idx3dF {
        transform_point(&self.xforms().prior_to_tal, center(prior))
    }

    /// node 单元中心的模板体素坐标.
    #[inline]
    pub fn node_to_template_voxel(&self, node: Idx3d) -> Idx3dF {
        transform_point(&self.xforms().node_to_tal, center(node))
    }

    /// 源体素 -> (外部变换) -> 模板体素 -> node 单元.
    #[inline]
    pub fn source_voxel_to_node(&self, transform: &Transform, p: Idx3dF) -> CoordResult<Idx3d> {
        self.template_voxel_to_node(transform.forward(p)?)
    }

    /// 源体素 -> (外部变换) -> 模板体素 -> prior 单元.
    #[inline]
    pub fn source_voxel_to_prior(&self, transform: &Transform, p: Idx3dF) -> CoordResult<Idx3d> {
        self.template_voxel_to_prior(transform.forward(p)?)
    }

    /// prior 单元 -> 源体素实数坐标. `backward` 由 [`Transform::backward`] 得到.
    #[inline]
    pub fn prior_to_source_voxel_real(&self, backward: &Backward, prior: Idx3d) -> CoordResult<Idx3dF> {
        backward.map(self.prior_to_template_voxel(prior))
    }

    /// prior 单元 -> 源体素整数坐标.
    pub fn prior_to_source_voxel(
        &self,
        backward: &Backward,
        geom: &VolumeGeometry,
        prior: Idx3d,
    ) -> CoordResult<Idx3d> {
        floor_in(geom.dims(), self.prior_to_source_voxel_real(backward, prior)?)
    }

    /// node 单元 -> 源体素整数坐标.
    pub fn node_to_source_voxel(
        &self,
        backward: &Backward,
        geom: &VolumeGeometry,
        node: Idx3d,
    ) -> CoordResult<Idx3d> {
        floor_in(geom.dims(), backward.map(self.node_to_template_voxel(node))?)
    }

    /// 读取体素 `pos` 处的特征向量: 扫描各通道, 再按标志位追加通道 0 的中心差分梯度.
    ///
    /// 调用方需保证扫描通道数等于 [`Gca::scan_channels`].
    pub fn load_vals(&self, scan: &MriScan, pos: Idx3d, out: &mut Vec<f32>) {
        scan.values_into(pos, out);
        let fl = self.flags();
        if fl & flags::GCA_GRAD == 0 {
            return;
        }
        let (w, h, d) = scan.shape();
        let (x, y, z) = pos;
        let grad = |a: Idx3d, b: Idx3d, span: usize| {
            if span == 0 {
                0.0
            } else {
                (scan.get(a, 0) - scan.get(b, 0)) / span as f32
            }
        };
        let (xl, xr) = (x.saturating_sub(1), (x + 1).min(w - 1));
        let (yl, yr) = (y.saturating_sub(1), (y + 1).min(h - 1));
        let (zl, zr) = (z.saturating_sub(1), (z + 1).min(d - 1));
        if fl & flags::GCA_XGRAD != 0 {
            out.push(grad((xr, y, z), (xl, y, z), xr - xl));
        }
        if fl & flags::GCA_YGRAD != 0 {
            out.push(grad((x, yr, z), (x, yl, z), yr - yl));
        }
        if fl & flags::GCA_ZGRAD != 0 {
            out.push(grad((x, y, zr), (x, y, zl), zr - zl));
        }
    }

    /// 在实数坐标处插值特征向量 (配准采样使用).
    pub(crate) fn interpolate_vals(&self, scan: &MriScan, p: Idx3dF, out: &mut Vec<f32>) {
        out.clear();
        out.extend((0..scan.channels()).map(|c| scan.trilinear(c, p) as f32));
        let fl = self.flags();
        let (x, y, z) = p;
        let central = |a: Idx3dF, b: Idx3dF| ((scan.trilinear(0, a) - scan.trilinear(0, b)) / 2.0) as f32;
        if fl & flags::GCA_XGRAD != 0 {
            out.push(central((x + 1.0, y, z), (x - 1.0, y, z)));
        }
        if fl & flags::GCA_YGRAD != 0 {
            out.push(central((x, y + 1.0, z), (x, y - 1.0, z)));
        }
        if fl & flags::GCA_ZGRAD != 0 {
            out.push(central((x, y, z + 1.0), (x, y, z - 1.0)));
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::consts::flags;
    use crate::{Gca, LinearTransform, MriScan, Transform, VolumeGeometry};
    use ndarray::Array3;

    fn chain_within_one(gca: &Gca, g: &VolumeGeometry) {
        let (w, h, d) = g.dims();
        for (x, y, z) in ndarray::indices((w, h, d)) {
            let p = (x as f64, y as f64, z as f64);
            let node = gca.voxel_to_node(g, p).unwrap();
            let (vx, vy, vz) = gca.node_to_voxel(g, node).unwrap();
            let spacing = gca.node_spacing() as usize;
            for (a, b) in [(vx, x), (vy, y), (vz, z)] {
                // 单元中心与单元内任一体素的距离不超过半个单元
                assert!(a.abs_diff(b) <= spacing.max(2) - 1, "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_voxel_node_chain_spacing_one() {
        let g = VolumeGeometry::isotropic((6, 5, 4)).with_center([1.0, -2.0, 3.0]);
        let gca = Gca::new(1, 1.0, 1.0, g.clone(), 0);
        chain_within_one(&gca, &g);
        assert_eq!(gca.voxel_to_node(&g, (2.0, 3.0, 1.0)).unwrap(), (2, 3, 1));
    }

    #[test]
    fn test_voxel_node_chain_spacing_two() {
        let g = VolumeGeometry::isotropic((8, 8, 8));
        let gca = Gca::new(1, 1.0, 2.0, g.clone(), 0);
        chain_within_one(&gca, &g);
        assert_eq!(gca.voxel_to_node(&g, (5.0, 4.0, 0.0)).unwrap(), (2, 2, 0));
        assert_eq!(gca.node_to_voxel(&g, (2, 2, 0)).unwrap(), (5, 5, 1));
    }

    #[test]
    fn test_out_of_bounds() {
        let g = VolumeGeometry::isotropic((4, 4, 4));
        let gca = Gca::new(1, 2.0, 2.0, g.clone(), 0);
        assert!(gca.voxel_to_node(&g, (-0.5, 0.0, 0.0)).is_err());
        assert!(gca.voxel_to_prior(&g, (4.0, 0.0, 0.0)).is_err());
        let t = Transform::linear(LinearTransform::translation(2.5, 0.0, 0.0)).unwrap();
        assert!(gca.source_voxel_to_node(&t, (2.0, 0.0, 0.0)).is_err());
        assert_eq!(gca.source_voxel_to_node(&t, (0.0, 0.0, 0.0)).unwrap(), (1, 0, 0));
    }

    #[test]
    fn test_prior_node_integer_ratio_is_exact() {
        let g = VolumeGeometry::isotropic((16, 16, 16));
        let gca = Gca::new(1, 1.0, 4.0, g, 0);
        for (x, y, z) in ndarray::indices(gca.node_dims()) {
            let n = (x, y, z);
            assert_eq!(gca.prior_to_node(gca.node_to_prior(n)), n);
        }
        assert_eq!(gca.prior_to_node((7, 8, 15)), (1, 2, 3));
    }

    #[test]
    fn test_backward_prior_to_source() {
        let g = VolumeGeometry::isotropic((8, 8, 8));
        let gca = Gca::new(1, 2.0, 2.0, g.clone(), 0);
        let mut t = Transform::linear(LinearTransform::translation(1.0, 0.0, 0.0)).unwrap();
        t.invert(&g).unwrap();
        let b = t.backward().unwrap();
        // prior (1, 1, 1) 中心为模板体素 (3, 3, 3), 源体素 (2, 3, 3)
        assert_eq!(gca.prior_to_source_voxel(&b, &g, (1, 1, 1)).unwrap(), (2, 3, 3));
        assert!(gca.prior_to_source_voxel(&b, &g, (0, 0, 0)).is_ok());
    }

    #[test]
    fn test_backward_node_to_source() {
        let g = VolumeGeometry::isotropic((16, 16, 16));
        let gca = Gca::new(1, 2.0, 4.0, g.clone(), 0);
        let mut t = Transform::linear(LinearTransform::translation(0.5, -0.5, 0.0)).unwrap();
        t.invert(&g).unwrap();
        let b = t.backward().unwrap();
        // node (1, 2, 0) 中心为模板体素 (6, 10, 2), 源体素 (5.5, 10.5, 2)
        assert_eq!(gca.node_to_source_voxel(&b, &g, (1, 2, 0)).unwrap(), (5, 10, 2));

        let mut far = Transform::linear(LinearTransform::translation(2.5, 0.0, 0.0)).unwrap();
        far.invert(&g).unwrap();
        let b = far.backward().unwrap();
        assert!(gca.node_to_source_voxel(&b, &g, (0, 0, 0)).is_err());
        assert_eq!(gca.node_to_source_voxel(&b, &g, (1, 0, 0)).unwrap(), (3, 2, 2));
    }

    #[test]
    fn test_load_vals_appends_gradients() {
        let g = VolumeGeometry::isotropic((4, 4, 4));
        let gca = Gca::new(1, 1.0, 1.0, g.clone(), flags::GCA_XGRAD | flags::GCA_ZGRAD);
        let ramp = Array3::from_shape_fn((4, 4, 4), |(x, _, z)| (2 * x + 5 * z) as f32);
        let scan = MriScan::from_channels(g, &[ramp]).unwrap();
        let mut v = Vec::new();
        gca.load_vals(&scan, (1, 1, 1), &mut v);
        assert_eq!(v, vec![7.0, 2.0, 5.0]);
        gca.load_vals(&scan, (0, 0, 3), &mut v);
        assert_eq!(v, vec![15.0, 2.0, 5.0]);
    }
}
