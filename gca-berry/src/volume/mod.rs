use std::collections::BTreeMap;
use std::ops::{Index, IndexMut};
use std::path::Path;

use ndarray::{Array3, Array4, ArrayView3, ArrayView4, ArrayViewMut3, Axis, Ix3, Ix4};
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

use crate::{GcaError, GcaResult, Idx3d, Idx3dF, Label};

mod geometry;

pub(crate) use geometry::{affine, transform_point};
pub use geometry::VolumeGeometry;

/// 带几何信息的体数据的共用属性和部分通用操作.
pub trait VolumeAttr {
    /// 获取几何信息.
    fn geometry(&self) -> &VolumeGeometry;

    /// 获取数据形状 `(width, height, depth)`.
    #[inline]
    fn shape(&self) -> Idx3d {
        self.geometry().dims()
    }

    /// 获取数据体素个数.
    #[inline]
    fn size(&self) -> usize {
        self.geometry().voxel_count()
    }

    /// 检查索引是否合法.
    #[inline]
    fn check(&self, pos: &Idx3d) -> bool {
        self.geometry().check(pos)
    }

    /// 获取单个体素分辨率, 以毫米为单位.
    #[inline]
    fn pix_dim(&self) -> [f64; 3] {
        self.geometry().sizes()
    }

    /// 获取体素的实际体积值, 以立方毫米为单位.
    #[inline]
    fn voxel(&self) -> f64 {
        self.pix_dim().iter().product()
    }

    /// 按 `x -> y -> z` 由慢到快的顺序迭代所有体素索引.
    #[inline]
    fn indices(&self) -> ndarray::iter::IndicesIter<Ix3> {
        let (w, h, d) = self.shape();
        ndarray::indices((w, h, d)).into_iter()
    }
}

/// 从 nifti header 中恢复体数据几何.
///
/// `sform_code > 0` 时使用 sform, 否则仅使用 `pixdim`, 方向余弦取 RAS 轴对齐.
fn geometry_from_header(h: &NiftiHeader) -> VolumeGeometry {
    let [_, w, ht, d, ..] = h.dim;
    let dims = (w.max(1) as usize, ht.max(1) as usize, d.max(1) as usize);
    let pix = |v: f32| if v > 0.0 { v as f64 } else { 1.0 };
    if h.sform_code <= 0 {
        let [_, sx, sy, sz, ..] = h.pixdim;
        return VolumeGeometry::new(dims, [pix(sx), pix(sy), pix(sz)]);
    }

    let rows = [h.srow_x, h.srow_y, h.srow_z];
    let column = |j: usize| [rows[0][j] as f64, rows[1][j] as f64, rows[2][j] as f64];
    let norm = |v: [f64; 3]| (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    let cols = [column(0), column(1), column(2)];
    let sizes = cols.map(norm);
    let mut geom = VolumeGeometry::new(dims, sizes.map(|s| if s > 0.0 { s } else { 1.0 }));
    geom.set_dircos(cols[0], cols[1], cols[2]);

    // 中心 = M * (dims / 2)
    let half = [dims.0 as f64 / 2.0, dims.1 as f64 / 2.0, dims.2 as f64 / 2.0];
    let mut center = [0.0; 3];
    for (c, row) in center.iter_mut().zip(rows.iter()) {
        *c = row[3] as f64 + (0..3).map(|j| row[j] as f64 * half[j]).sum::<f64>();
    }
    geom.set_center(center);
    geom
}

/// 在 `[x, y, z, c]` 数组的实数坐标处三线性插值第 `c` 个分量. 坐标被截断到数组范围内.
pub(crate) fn trilinear(data: ArrayView4<'_, f32>, c: usize, (x, y, z): Idx3dF) -> f64 {
    let (w, h, d, _) = data.dim();
    let clamp = |v: f64, n: usize| v.clamp(0.0, (n - 1) as f64);
    let (x, y, z) = (clamp(x, w), clamp(y, h), clamp(z, d));
    let (x0, y0, z0) = (x.floor() as usize, y.floor() as usize, z.floor() as usize);
    let (x1, y1, z1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1), (z0 + 1).min(d - 1));
    let (fx, fy, fz) = (x - x0 as f64, y - y0 as f64, z - z0 as f64);

    let v = |i, j, k| data[(i, j, k, c)] as f64;
    let c00 = v(x0, y0, z0) * (1.0 - fx) + v(x1, y0, z0) * fx;
    let c10 = v(x0, y1, z0) * (1.0 - fx) + v(x1, y1, z0) * fx;
    let c01 = v(x0, y0, z1) * (1.0 - fx) + v(x1, y0, z1) * fx;
    let c11 = v(x0, y1, z1) * (1.0 - fx) + v(x1, y1, z1) * fx;
    let c0 = c00 * (1.0 - fy) + c10 * fy;
    let c1 = c01 * (1.0 - fy) + c11 * fy;
    c0 * (1.0 - fz) + c1 * fz
}

/// 多通道 MRI 强度体数据. 以 `[x, y, z, channel]` 格式存储 `f32`.
#[derive(Debug, Clone)]
pub struct MriScan {
    geometry: VolumeGeometry,
    data: Array4<f32>,
}

impl VolumeAttr for MriScan {
    #[inline]
    fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }
}

impl MriScan {
    /// 创建全零的 `channels` 通道扫描.
    pub fn new(geometry: VolumeGeometry, channels: usize) -> Self {
        assert!(channels > 0, "至少需要一个通道");
        let (w, h, d) = geometry.dims();
        Self {
            geometry,
            data: Array4::zeros((w, h, d, channels)),
        }
    }

    /// 由 `[x, y, z, channel]` 数组直接创建. 形状与几何不一致时返回 `Err`.
    pub fn from_array(geometry: VolumeGeometry, data: Array4<f32>) -> GcaResult<Self> {
        let (w, h, d, _) = data.dim();
        if geometry.dims() != (w, h, d) {
            return Err(GcaError::ShapeMismatch(geometry.dims(), (w, h, d)));
        }
        Ok(Self { geometry, data })
    }

    /// 由若干单通道数组拼接创建.
    pub fn from_channels(geometry: VolumeGeometry, channels: &[Array3<f32>]) -> GcaResult<Self> {
        let mut scan = Self::new(geometry, channels.len());
        for (c, ch) in channels.iter().enumerate() {
            if ch.dim() != scan.shape() {
                return Err(GcaError::ShapeMismatch(scan.shape(), ch.dim()));
            }
            scan.data.index_axis_mut(Axis(3), c).assign(ch);
        }
        Ok(scan)
    }

    /// 打开 nii 文件格式的扫描. 3D 文件视为单通道, 4D 文件的第四维视为通道.
    pub fn open<P: AsRef<Path>>(path: P) -> GcaResult<Self> {
        let obj = ReaderOptions::new().read_file(path.as_ref())?;
        let geometry = geometry_from_header(obj.header());
        let data = obj.into_volume().into_ndarray::<f32>()?;
        let data = match data.ndim() {
            3 => data
                .into_dimensionality::<Ix3>()
                .map_err(|e| GcaError::MalformedFile(e.to_string()))?
                .insert_axis(Axis(3)),
            4 => data
                .into_dimensionality::<Ix4>()
                .map_err(|e| GcaError::MalformedFile(e.to_string()))?,
            n => return Err(GcaError::MalformedFile(format!("{n}-dimensional scan"))),
        };
        Self::from_array(geometry, data.as_standard_layout().to_owned())
    }

    /// 通道数.
    #[inline]
    pub fn channels(&self) -> usize {
        self.data.dim().3
    }

    /// 获取 `pos` 处第 `c` 个通道的值.
    ///
    /// 越界时 panic.
    #[inline]
    pub fn get(&self, (x, y, z): Idx3d, c: usize) -> f32 {
        self.data[(x, y, z, c)]
    }

    /// 设置 `pos` 处第 `c` 个通道的值.
    #[inline]
    pub fn set(&mut self, (x, y, z): Idx3d, c: usize, v: f32) {
        self.data[(x, y, z, c)] = v;
    }

    /// 将 `pos` 处所有通道的值写入 `out`.
    #[inline]
    pub fn values_into(&self, (x, y, z): Idx3d, out: &mut Vec<f32>) {
        out.clear();
        out.extend((0..self.channels()).map(|c| self.data[(x, y, z, c)]));
    }

    /// 在实数坐标处三线性插值第 `c` 个通道. 坐标被截断到体数据范围内.
    #[inline]
    pub fn trilinear(&self, c: usize, p: Idx3dF) -> f64 {
        trilinear(self.data.view(), c, p)
    }

    /// 获得第 `c` 个通道的不可变视图.
    #[inline]
    pub fn channel(&self, c: usize) -> ArrayView3<'_, f32> {
        self.data.index_axis(Axis(3), c)
    }

    /// 获得第 `c` 个通道的可变视图.
    #[inline]
    pub fn channel_mut(&mut self, c: usize) -> ArrayViewMut3<'_, f32> {
        self.data.index_axis_mut(Axis(3), c)
    }

    /// 获得全部数据.
    #[inline]
    pub fn data(&self) -> &Array4<f32> {
        &self.data
    }
}

/// 3D 标签体数据, 标签值以 `u8` 保存.
#[derive(Debug, Clone, PartialEq)]
pub struct MriLabel {
    geometry: VolumeGeometry,
    data: Array3<Label>,
}

impl VolumeAttr for MriLabel {
    #[inline]
    fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }
}

impl Index<Idx3d> for MriLabel {
    type Output = Label;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl IndexMut<Idx3d> for MriLabel {
    #[inline]
    fn index_mut(&mut self, index: Idx3d) -> &mut Self::Output {
        &mut self.data[index]
    }
}

impl MriLabel {
    /// 创建全 0 (UNKNOWN) 标签体.
    pub fn new(geometry: VolumeGeometry) -> Self {
        let data = Array3::zeros(geometry.dims());
        Self { geometry, data }
    }

    /// 由 `[x, y, z]` 数组直接创建. 形状与几何不一致时返回 `Err`.
    pub fn from_array(geometry: VolumeGeometry, data: Array3<Label>) -> GcaResult<Self> {
        if geometry.dims() != data.dim() {
            return Err(GcaError::ShapeMismatch(geometry.dims(), data.dim()));
        }
        Ok(Self { geometry, data })
    }

    /// 打开 nii 文件格式的标签体.
    pub fn open<P: AsRef<Path>>(path: P) -> GcaResult<Self> {
        let obj = ReaderOptions::new().read_file(path.as_ref())?;
        let geometry = geometry_from_header(obj.header());
        let data = obj
            .into_volume()
            .into_ndarray::<u8>()?
            .into_dimensionality::<Ix3>()
            .map_err(|e| GcaError::MalformedFile(e.to_string()))?;
        Self::from_array(geometry, data.as_standard_layout().to_owned())
    }

    /// 从 `[x, y, z]` 格式的 `.npy` 文件读取标签, 几何由调用方给出.
    pub fn from_npy<P: AsRef<Path>>(path: P, geometry: VolumeGeometry) -> GcaResult<Self> {
        let data: Array3<Label> = ndarray_npy::read_npy(path)?;
        Self::from_array(geometry, data)
    }

    /// 标签 `label` 的体素个数.
    pub fn count(&self, label: Label) -> usize {
        self.data.iter().filter(|&&l| l == label).count()
    }

    /// 出现过的所有标签及其体素个数, 按标签升序.
    pub fn histogram(&self) -> BTreeMap<Label, usize> {
        let mut map = BTreeMap::new();
        for &l in self.data.iter() {
            *map.entry(l).or_insert(0) += 1;
        }
        map
    }

    /// 与 `other` 标签不同的体素个数. 形状不同时返回 `Err`.
    pub fn diff_count(&self, other: &MriLabel) -> GcaResult<usize> {
        if self.shape() != other.shape() {
            return Err(GcaError::ShapeMismatch(self.shape(), other.shape()));
        }
        Ok(ndarray::Zip::from(&self.data)
            .and(&other.data)
            .fold(0, |acc, a, b| acc + (a != b) as usize))
    }

    /// 获得数据的不可变视图.
    #[inline]
    pub fn data(&self) -> ArrayView3<'_, Label> {
        self.data.view()
    }

    /// 获得数据的可变视图.
    #[inline]
    pub fn data_mut(&mut self) -> ArrayViewMut3<'_, Label> {
        self.data.view_mut()
    }
}
