//! 外部坐标变换: 源体素 <-> 模板 (Talairach) 体素.
//!
//! 变换既可以是体素到体素的仿射矩阵, 也可以是稠密形变场. 核心算法只使用
//! "正向映射" 与 "反向映射" 两个能力; 反向映射前必须先针对目标体数据调用一次
//! [`Transform::invert`].

use either::Either;
use nalgebra::Matrix4;

use crate::volume::{transform_point, VolumeGeometry};
use crate::{CoordResult, GcaError, GcaResult, Idx3dF, OutOfBounds};

mod morph;

pub use morph::DeformField;

/// 仿射矩阵作用的坐标空间.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LinearKind {
    /// 源体素 -> 模板体素.
    VoxelToVoxel,

    /// 扫描仪 RAS -> 模板 RAS. 使用前必须转换为体素到体素.
    RasToRas,
}

/// 4x4 仿射变换.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearTransform {
    kind: LinearKind,
    matrix: Matrix4<f64>,
}

impl LinearTransform {
    /// 体素到体素的恒等变换.
    #[inline]
    pub fn identity() -> Self {
        Self::new(LinearKind::VoxelToVoxel, Matrix4::identity())
    }

    /// 由给定矩阵创建.
    #[inline]
    pub fn new(kind: LinearKind, matrix: Matrix4<f64>) -> Self {
        Self { kind, matrix }
    }

    /// 由按行排列的 4x4 数组创建.
    pub fn from_rows(kind: LinearKind, rows: [[f64; 4]; 4]) -> Self {
        let matrix = Matrix4::from_fn(|r, c| rows[r][c]);
        Self::new(kind, matrix)
    }

    /// 仅含平移的体素到体素变换.
    pub fn translation(dx: f64, dy: f64, dz: f64) -> Self {
        let mut m = Matrix4::identity();
        m[(0, 3)] = dx;
        m[(1, 3)] = dy;
        m[(2, 3)] = dz;
        Self::new(LinearKind::VoxelToVoxel, m)
    }

    /// 变换类型.
    #[inline]
    pub fn kind(&self) -> LinearKind {
        self.kind
    }

    /// 变换矩阵.
    #[inline]
    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.matrix
    }

    /// 将 RAS 到 RAS 的变换转换为 `src` 体素到 `dst` 体素的变换:
    /// `dst.ras2vox * M * src.vox2ras`. 已是体素到体素的变换原样返回.
    pub fn ras_to_voxel(&self, src: &VolumeGeometry, dst: &VolumeGeometry) -> Self {
        match self.kind {
            LinearKind::VoxelToVoxel => self.clone(),
            LinearKind::RasToRas => Self::new(
                LinearKind::VoxelToVoxel,
                dst.ras2vox() * self.matrix * src.vox2ras(),
            ),
        }
    }

    /// 映射一个点.
    #[inline]
    pub fn apply(&self, p: Idx3dF) -> Idx3dF {
        transform_point(&self.matrix, p)
    }
}

/// 已求逆的仿射变换及其参考体数据.
#[derive(Clone, Debug)]
struct LinearInverse {
    matrix: Matrix4<f64>,
    reference: VolumeGeometry,
}

/// 源体素与模板体素之间的坐标变换.
#[derive(Clone, Debug)]
pub struct Transform {
    // 注: 变换只有两种形式, 这里直接用 `Either`.
    inner: Either<LinearTransform, DeformField>,
    inverse: Option<LinearInverse>,
}

impl From<DeformField> for Transform {
    fn from(value: DeformField) -> Self {
        Self {
            inner: Either::Right(value),
            inverse: None,
        }
    }
}

impl Transform {
    /// 体素到体素的恒等变换.
    #[inline]
    pub fn identity() -> Self {
        Self {
            inner: Either::Left(LinearTransform::identity()),
            inverse: None,
        }
    }

    /// 以仿射矩阵创建变换. 矩阵必须是体素到体素的, 否则返回 [`GcaError::TransformKind`].
    pub fn linear(lt: LinearTransform) -> GcaResult<Self> {
        if lt.kind() != LinearKind::VoxelToVoxel {
            return Err(GcaError::TransformKind);
        }
        Ok(Self {
            inner: Either::Left(lt),
            inverse: None,
        })
    }

    /// 以 RAS 到 RAS 的仿射矩阵创建变换, 借助源体数据与模板几何转换为体素到体素.
    pub fn from_ras(lt: &LinearTransform, src: &VolumeGeometry, template: &VolumeGeometry) -> Self {
        Self {
            inner: Either::Left(lt.ras_to_voxel(src, template)),
            inverse: None,
        }
    }

    /// 是否是形变场.
    #[inline]
    pub fn is_deformable(&self) -> bool {
        self.inner.is_right()
    }

    /// 是否已经求逆.
    #[inline]
    pub fn is_inverted(&self) -> bool {
        match &self.inner {
            Either::Left(_) => self.inverse.is_some(),
            Either::Right(field) => field.is_inverted(),
        }
    }

    /// 源体素 -> 模板体素. 形变场在源体数据范围外采样时返回 `Err`.
    #[inline]
    pub fn forward(&self, p: Idx3dF) -> CoordResult<Idx3dF> {
        match &self.inner {
            Either::Left(lt) => Ok(lt.apply(p)),
            Either::Right(field) => field.forward(p),
        }
    }

    /// 针对参考 (源) 体数据 `reference` 求逆并缓存. 以相同参考重复调用不会重新计算.
    pub fn invert(&mut self, reference: &VolumeGeometry) -> GcaResult<()> {
        match &mut self.inner {
            Either::Left(lt) => {
                if let Some(inv) = &self.inverse {
                    if inv.reference.same_grid(reference) {
                        return Ok(());
                    }
                }
                let matrix = lt.matrix.try_inverse().ok_or(GcaError::SingularTransform)?;
                self.inverse = Some(LinearInverse {
                    matrix,
                    reference: reference.clone(),
                });
                Ok(())
            }
            Either::Right(field) => field.invert(reference),
        }
    }

    /// 获取反向映射. 未调用 [`Self::invert`] 时返回 [`GcaError::TransformNotInverted`].
    pub fn backward(&self) -> GcaResult<Backward<'_>> {
        match &self.inner {
            Either::Left(_) => match &self.inverse {
                Some(inv) => Ok(Backward(Either::Left(inv))),
                None => Err(GcaError::TransformNotInverted),
            },
            Either::Right(field) if field.is_inverted() => Ok(Backward(Either::Right(field))),
            Either::Right(_) => Err(GcaError::TransformNotInverted),
        }
    }
}

/// 模板体素 -> 源体素的反向映射视图.
#[derive(Clone, Copy, Debug)]
pub struct Backward<'a>(Either<&'a LinearInverse, &'a DeformField>);

impl Backward<'_> {
    /// 映射一个点. 结果落在参考体数据外时返回 `Err`.
    pub fn map(&self, p: Idx3dF) -> CoordResult<Idx3dF> {
        match self.0 {
            Either::Left(inv) => {
                let q = transform_point(&inv.matrix, p);
                if inv.reference.contains(q) {
                    Ok(q)
                } else {
                    Err(OutOfBounds)
                }
            }
            Either::Right(field) => field.backward(p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{LinearKind, LinearTransform, Transform};
    use crate::{GcaError, VolumeGeometry};

    #[test]
    fn test_ras_affine_rejected() {
        let lt = LinearTransform::new(LinearKind::RasToRas, nalgebra::Matrix4::identity());
        assert!(matches!(Transform::linear(lt), Err(GcaError::TransformKind)));
    }

    #[test]
    fn test_backward_requires_invert() {
        let mut t = Transform::linear(LinearTransform::translation(1.0, 2.0, 3.0)).unwrap();
        assert!(matches!(t.backward(), Err(GcaError::TransformNotInverted)));

        let g = VolumeGeometry::isotropic((10, 10, 10));
        t.invert(&g).unwrap();
        let b = t.backward().unwrap();
        let q = b.map(t.forward((2.0, 2.0, 2.0)).unwrap()).unwrap();
        assert!((q.0 - 2.0).abs() < 1e-12 && (q.1 - 2.0).abs() < 1e-12);
        // (0, 0, 0) 反向映射到 (-1, -2, -3), 落在参考体外
        assert!(b.map((0.0, 0.0, 0.0)).is_err());
    }

    #[test]
    fn test_ras_to_voxel_between_shifted_volumes() {
        let src = VolumeGeometry::isotropic((8, 8, 8)).with_center([4.0, 0.0, 0.0]);
        let dst = VolumeGeometry::isotropic((8, 8, 8));
        let t = Transform::from_ras(
            &LinearTransform::new(LinearKind::RasToRas, nalgebra::Matrix4::identity()),
            &src,
            &dst,
        );
        let p = t.forward((0.0, 0.0, 0.0)).unwrap();
        assert!((p.0 - 4.0).abs() < 1e-12 && p.1.abs() < 1e-12 && p.2.abs() < 1e-12);
    }
}
