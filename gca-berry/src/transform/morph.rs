//! 稠密形变场.

use std::path::Path;

use ndarray::{s, Array3, Array4, Axis, Zip};

use crate::volume::{trilinear, VolumeGeometry};
use crate::{CoordResult, GcaError, GcaResult, Idx3dF, OutOfBounds};

use super::LinearTransform;

/// 反向表空洞填充的最大迭代次数.
const MAX_FILL_PASSES: usize = 8;

#[derive(Clone, Debug)]
struct FieldInverse {
    reference: VolumeGeometry,

    /// `[x, y, z, 3]`, 模板体素 -> 源体素坐标. 未覆盖处为 NaN.
    table: Array4<f32>,
}

/// 稠密形变场. 在源体数据的每个体素上保存其对应的模板体素坐标.
#[derive(Clone, Debug)]
pub struct DeformField {
    source: VolumeGeometry,
    template: VolumeGeometry,

    /// `[x, y, z, 3]`.
    targets: Array4<f32>,
    inverse: Option<FieldInverse>,
}

impl DeformField {
    /// 由 `[x, y, z, 3]` 数组创建. 前三维必须与 `source` 一致.
    pub fn from_array(
        source: VolumeGeometry,
        template: VolumeGeometry,
        targets: Array4<f32>,
    ) -> GcaResult<Self> {
        let (w, h, d, n) = targets.dim();
        if n != 3 {
            return Err(GcaError::MalformedFile(format!(
                "deformation field has {n} components, expected 3"
            )));
        }
        if source.dims() != (w, h, d) {
            return Err(GcaError::ShapeMismatch(source.dims(), (w, h, d)));
        }
        Ok(Self {
            source,
            template,
            targets,
            inverse: None,
        })
    }

    /// 从 `.npy` 文件读取 `[x, y, z, 3]` 形变场.
    pub fn from_npy<P: AsRef<Path>>(
        path: P,
        source: VolumeGeometry,
        template: VolumeGeometry,
    ) -> GcaResult<Self> {
        let targets: Array4<f32> = ndarray_npy::read_npy(path)?;
        Self::from_array(source, template, targets)
    }

    /// 将仿射变换采样为形变场.
    pub fn from_linear(
        lt: &LinearTransform,
        source: VolumeGeometry,
        template: VolumeGeometry,
    ) -> GcaResult<Self> {
        let (w, h, d) = source.dims();
        let mut targets = Array4::zeros((w, h, d, 3));
        for ((x, y, z), mut t) in ndarray::indices((w, h, d))
            .into_iter()
            .zip(targets.lanes_mut(Axis(3)))
        {
            let (tx, ty, tz) = lt.apply((x as f64, y as f64, z as f64));
            t[0] = tx as f32;
            t[1] = ty as f32;
            t[2] = tz as f32;
        }
        Self::from_array(source, template, targets)
    }

    /// 源体数据几何.
    #[inline]
    pub fn source(&self) -> &VolumeGeometry {
        &self.source
    }

    /// 模板几何.
    #[inline]
    pub fn template(&self) -> &VolumeGeometry {
        &self.template
    }

    #[inline]
    pub(super) fn is_inverted(&self) -> bool {
        self.inverse.is_some()
    }

    /// 三线性采样形变场.
    pub(super) fn forward(&self, p: Idx3dF) -> CoordResult<Idx3dF> {
        if !self.source.contains(p) {
            return Err(OutOfBounds);
        }
        let view = self.targets.view();
        Ok((
            trilinear(view, 0, p),
            trilinear(view, 1, p),
            trilinear(view, 2, p),
        ))
    }

    /// 最近邻查反向表.
    pub(super) fn backward(&self, (x, y, z): Idx3dF) -> CoordResult<Idx3dF> {
        let inv = self.inverse.as_ref().ok_or(OutOfBounds)?;
        let (xi, yi, zi) = (x.round(), y.round(), z.round());
        if !self.template.contains((xi, yi, zi)) {
            return Err(OutOfBounds);
        }
        let (xi, yi, zi) = (xi as usize, yi as usize, zi as usize);
        let q = (
            inv.table[(xi, yi, zi, 0)] as f64,
            inv.table[(xi, yi, zi, 1)] as f64,
            inv.table[(xi, yi, zi, 2)] as f64,
        );
        if q.0.is_nan() || !inv.reference.contains(q) {
            return Err(OutOfBounds);
        }
        Ok(q)
    }

    /// 以源体素坐标向模板网格 "泼溅" 建立反向表, 再迭代填充空洞.
    pub(super) fn invert(&mut self, reference: &VolumeGeometry) -> GcaResult<()> {
        if let Some(inv) = &self.inverse {
            if inv.reference.same_grid(reference) {
                return Ok(());
            }
        }
        if reference.dims() != self.source.dims() {
            return Err(GcaError::ShapeMismatch(self.source.dims(), reference.dims()));
        }

        let (tw, th, td) = self.template.dims();
        let mut sums = Array4::<f64>::zeros((tw, th, td, 3));
        let mut counts = Array3::<u32>::zeros((tw, th, td));
        let (w, h, d) = self.source.dims();
        for (x, y, z) in ndarray::indices((w, h, d)) {
            let t = (
                self.targets[(x, y, z, 0)].round() as f64,
                self.targets[(x, y, z, 1)].round() as f64,
                self.targets[(x, y, z, 2)].round() as f64,
            );
            if !self.template.contains(t) {
                continue;
            }
            let (tx, ty, tz) = (t.0 as usize, t.1 as usize, t.2 as usize);
            sums[(tx, ty, tz, 0)] += x as f64;
            sums[(tx, ty, tz, 1)] += y as f64;
            sums[(tx, ty, tz, 2)] += z as f64;
            counts[(tx, ty, tz)] += 1;
        }

        let mut table = Array4::<f32>::from_elem((tw, th, td, 3), f32::NAN);
        Zip::from(table.lanes_mut(Axis(3)))
            .and(sums.lanes(Axis(3)))
            .and(&counts)
            .for_each(|mut t, s, &n| {
                if n > 0 {
                    for c in 0..3 {
                        t[c] = (s[c] / n as f64) as f32;
                    }
                }
            });
        let holes = fill_holes(&mut table);
        if holes > 0 {
            log::debug!("inverse deformation leaves {holes} template voxels unmapped");
        }

        self.inverse = Some(FieldInverse {
            reference: reference.clone(),
            table,
        });
        Ok(())
    }
}

/// 用 6-邻域有效值的平均迭代填充 NaN. 返回剩余空洞数.
fn fill_holes(table: &mut Array4<f32>) -> usize {
    let (w, h, d, _) = table.dim();
    for _ in 0..MAX_FILL_PASSES {
        let snapshot = table.clone();
        let mut filled = 0;
        for (x, y, z) in ndarray::indices((w, h, d)) {
            if !snapshot[(x, y, z, 0)].is_nan() {
                continue;
            }
            let mut acc = [0.0f64; 3];
            let mut n = 0;
            for (dx, dy, dz) in crate::gca::Direction::ALL.map(|d| d.offset()) {
                let (nx, ny, nz) = (x as isize + dx, y as isize + dy, z as isize + dz);
                if nx < 0 || ny < 0 || nz < 0 {
                    continue;
                }
                let (nx, ny, nz) = (nx as usize, ny as usize, nz as usize);
                if nx >= w || ny >= h || nz >= d {
                    continue;
                }
                let v = snapshot.slice(s![nx, ny, nz, ..]);
                if v[0].is_nan() {
                    continue;
                }
                for c in 0..3 {
                    acc[c] += v[c] as f64;
                }
                n += 1;
            }
            if n > 0 {
                for c in 0..3 {
                    table[(x, y, z, c)] = (acc[c] / n as f64) as f32;
                }
                filled += 1;
            }
        }
        if filled == 0 {
            break;
        }
    }
    table.index_axis(Axis(3), 0).iter().filter(|v| v.is_nan()).count()
}

#[cfg(test)]
mod tests {
    use super::DeformField;
    use crate::{LinearTransform, Transform, VolumeGeometry};

    #[test]
    fn test_shifted_field_round_trip() {
        let src = VolumeGeometry::isotropic((10, 10, 10));
        let tpl = VolumeGeometry::isotropic((12, 12, 12));
        let field =
            DeformField::from_linear(&LinearTransform::translation(2.0, 0.0, 1.0), src.clone(), tpl)
                .unwrap();
        let mut t = Transform::from(field);
        assert!(!t.is_inverted());
        assert_eq!(t.forward((3.0, 4.0, 5.0)).unwrap(), (5.0, 4.0, 6.0));
        assert!(t.forward((10.5, 0.0, 0.0)).is_err());

        t.invert(&src).unwrap();
        let b = t.backward().unwrap();
        assert_eq!(b.map((5.0, 4.0, 6.0)).unwrap(), (3.0, 4.0, 5.0));
    }

    #[test]
    fn test_inverse_fills_holes_from_neighbors() {
        // 2 倍放大: 模板上奇数位置不会被直接命中
        let src = VolumeGeometry::isotropic((4, 4, 4));
        let tpl = VolumeGeometry::isotropic((8, 8, 8));
        let scale = LinearTransform::from_rows(
            crate::LinearKind::VoxelToVoxel,
            [
                [2.0, 0.0, 0.0, 0.0],
                [0.0, 2.0, 0.0, 0.0],
                [0.0, 0.0, 2.0, 0.0],
                [0.0, 0.0, 0.0, 1.0],
            ],
        );
        let mut t = Transform::from(DeformField::from_linear(&scale, src.clone(), tpl).unwrap());
        t.invert(&src).unwrap();
        let q = t.backward().unwrap().map((1.0, 0.0, 0.0)).unwrap();
        assert!((q.0 - 0.5).abs() < 1e-6 && q.1.abs() < 1e-6 && q.2.abs() < 1e-6);
    }
}
