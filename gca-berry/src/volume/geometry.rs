//! 体数据几何: 尺寸, 体素大小, 方向余弦与中心点.

use crate::{Idx3d, Idx3dF};
use nalgebra::{Matrix3, Matrix4, Vector3, Vector4};
use once_cell::sync::OnceCell;

/// 体数据几何信息.
///
/// 体素到 RAS 的仿射变换在首次使用时计算并缓存, 任何修改几何的 setter 都会使缓存失效.
/// 方向余弦必须互相正交; setter 会将其归一化.
#[derive(Clone, Debug)]
pub struct VolumeGeometry {
    width: usize,
    height: usize,
    depth: usize,

    /// 体素大小 (单位: 毫米).
    sizes: [f64; 3],

    /// 方向余弦, 依次为 x, y, z 轴在 RAS 下的单位向量.
    dircos: [[f64; 3]; 3],

    /// 体中心 `(width / 2, height / 2, depth / 2)` 的 RAS 坐标.
    c_ras: [f64; 3],

    vox2ras: OnceCell<Matrix4<f64>>,
    ras2vox: OnceCell<Matrix4<f64>>,
}

/// 缓存不参与比较.
impl PartialEq for VolumeGeometry {
    fn eq(&self, other: &Self) -> bool {
        self.dims() == other.dims()
            && self.sizes == other.sizes
            && self.dircos == other.dircos
            && self.c_ras == other.c_ras
    }
}

impl VolumeGeometry {
    /// 以 RAS 轴对齐的方向余弦, 中心位于原点, 创建几何.
    ///
    /// 如果任一维度为 0 或体素大小不为正, 则程序 panic.
    pub fn new((width, height, depth): Idx3d, sizes: [f64; 3]) -> Self {
        assert!(width > 0 && height > 0 && depth > 0, "体数据尺寸不能为 0");
        assert!(sizes.iter().all(|s| *s > 0.0), "体素大小必须为正");
        Self {
            width,
            height,
            depth,
            sizes,
            dircos: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            c_ras: [0.0; 3],
            vox2ras: OnceCell::new(),
            ras2vox: OnceCell::new(),
        }
    }

    /// 以 1mm 各向同性体素创建几何.
    #[inline]
    pub fn isotropic(dims: Idx3d) -> Self {
        Self::new(dims, [1.0; 3])
    }

    /// 设置方向余弦 (x, y, z 三轴). 会归一化每个向量.
    pub fn with_dircos(mut self, x: [f64; 3], y: [f64; 3], z: [f64; 3]) -> Self {
        self.set_dircos(x, y, z);
        self
    }

    /// 设置中心点 RAS 坐标.
    pub fn with_center(mut self, c_ras: [f64; 3]) -> Self {
        self.set_center(c_ras);
        self
    }

    /// 就地设置方向余弦并使缓存失效.
    pub fn set_dircos(&mut self, x: [f64; 3], y: [f64; 3], z: [f64; 3]) {
        let normalize = |v: [f64; 3]| {
            let n = Vector3::from(v).norm();
            assert!(n > 0.0, "方向余弦不能为零向量");
            [v[0] / n, v[1] / n, v[2] / n]
        };
        self.dircos = [normalize(x), normalize(y), normalize(z)];
        debug_assert!(self.is_orthogonal());
        self.invalidate();
    }

    /// 就地设置中心点并使缓存失效.
    pub fn set_center(&mut self, c_ras: [f64; 3]) {
        self.c_ras = c_ras;
        self.invalidate();
    }

    /// 就地设置体素大小并使缓存失效.
    pub fn set_sizes(&mut self, sizes: [f64; 3]) {
        assert!(sizes.iter().all(|s| *s > 0.0), "体素大小必须为正");
        self.sizes = sizes;
        self.invalidate();
    }

    #[inline]
    fn invalidate(&mut self) {
        self.vox2ras = OnceCell::new();
        self.ras2vox = OnceCell::new();
    }

    fn is_orthogonal(&self) -> bool {
        let [x, y, z] = self.dircos.map(Vector3::from);
        x.dot(&y).abs() < 1e-4 && x.dot(&z).abs() < 1e-4 && y.dot(&z).abs() < 1e-4
    }

    /// 尺寸 `(width, height, depth)`.
    #[inline]
    pub fn dims(&self) -> Idx3d {
        (self.width, self.height, self.depth)
    }

    /// x 方向体素个数.
    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// y 方向体素个数.
    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// z 方向体素个数.
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// 体素大小 (单位: 毫米).
    #[inline]
    pub fn sizes(&self) -> [f64; 3] {
        self.sizes
    }

    /// 方向余弦.
    #[inline]
    pub fn dircos(&self) -> [[f64; 3]; 3] {
        self.dircos
    }

    /// 中心点 RAS 坐标.
    #[inline]
    pub fn center(&self) -> [f64; 3] {
        self.c_ras
    }

    /// 体素总数.
    #[inline]
    pub fn voxel_count(&self) -> usize {
        self.width * self.height * self.depth
    }

    /// 索引是否在体数据范围内.
    #[inline]
    pub fn check(&self, &(x, y, z): &Idx3d) -> bool {
        x < self.width && y < self.height && z < self.depth
    }

    /// 实数坐标是否落在体数据范围 `[0, dim)` 内.
    #[inline]
    pub fn contains(&self, (x, y, z): Idx3dF) -> bool {
        (0.0..self.width as f64).contains(&x)
            && (0.0..self.height as f64).contains(&y)
            && (0.0..self.depth as f64).contains(&z)
    }

    /// 方向余弦乘以体素大小, 即 `Mdc * D`.
    fn scaled_dircos(&self) -> Matrix3<f64> {
        let mut m = Matrix3::zeros();
        for (col, (axis, size)) in self.dircos.iter().zip(self.sizes).enumerate() {
            for (row, v) in axis.iter().enumerate() {
                m[(row, col)] = v * size;
            }
        }
        m
    }

    /// 体素索引 0 处的 RAS 坐标.
    pub fn origin(&self) -> Vector3<f64> {
        let half = Vector3::new(
            self.width as f64 / 2.0,
            self.height as f64 / 2.0,
            self.depth as f64 / 2.0,
        );
        Vector3::from(self.c_ras) - self.scaled_dircos() * half
    }

    /// 体素到 RAS 的仿射变换 (懒计算并缓存).
    pub fn vox2ras(&self) -> &Matrix4<f64> {
        self.vox2ras.get_or_init(|| affine(&self.scaled_dircos(), &self.origin()))
    }

    /// RAS 到体素的仿射变换 (懒计算并缓存).
    ///
    /// 方向余弦正交, 因此逆矩阵以转置解析求得.
    pub fn ras2vox(&self) -> &Matrix4<f64> {
        self.ras2vox.get_or_init(|| {
            let inv_d = Matrix3::from_diagonal(&Vector3::from(self.sizes.map(|s| 1.0 / s)));
            let mdc = Matrix3::from_columns(&self.dircos.map(Vector3::from));
            let rot = inv_d * mdc.transpose();
            affine(&rot, &(-(rot * self.origin())))
        })
    }

    /// 以 `spacing` 毫米为体素大小、与自身共用方向余弦和原点的网格的体素到 RAS 变换.
    ///
    /// node / prior 网格由此导出: 网格索引 0 与本体数据的体素索引 0 重合.
    pub fn grid_vox2ras(&self, spacing: f64) -> Matrix4<f64> {
        let mdc = Matrix3::from_columns(&self.dircos.map(Vector3::from));
        affine(&(mdc * spacing), &self.origin())
    }

    /// [`Self::grid_vox2ras`] 的逆变换.
    pub fn grid_ras2vox(&self, spacing: f64) -> Matrix4<f64> {
        let mdc = Matrix3::from_columns(&self.dircos.map(Vector3::from));
        let rot = mdc.transpose() / spacing;
        affine(&rot, &(-(rot * self.origin())))
    }

    /// 判断两个几何是否描述同一体素网格.
    #[inline]
    pub fn same_grid(&self, other: &Self) -> bool {
        self == other
    }
}

/// 由 3x3 线性部分和平移构造 4x4 齐次矩阵.
pub(crate) fn affine(linear: &Matrix3<f64>, translation: &Vector3<f64>) -> Matrix4<f64> {
    let mut m = Matrix4::identity();
    m.fixed_view_mut::<3, 3>(0, 0).copy_from(linear);
    m.fixed_view_mut::<3, 1>(0, 3).copy_from(translation);
    m
}

/// 用齐次矩阵变换一个点.
#[inline]
pub(crate) fn transform_point(m: &Matrix4<f64>, (x, y, z): Idx3dF) -> Idx3dF {
    let v = m * Vector4::new(x, y, z, 1.0);
    (v[0], v[1], v[2])
}
