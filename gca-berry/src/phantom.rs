//! 合成体模: 均匀背景中的一个立方体, 每个通道带独立高斯噪声.
//!
//! 用于测试与消融实验. 随机数由种子决定, 同一种子总是生成同一扫描.

use ndarray::Array3;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

use crate::gca::Gca;
use crate::params::{RegularizeParams, TrainParams};
use crate::transform::Transform;
use crate::volume::{MriLabel, MriScan, VolumeGeometry};
use crate::{GcaResult, Idx3d, Label};

/// 一对配套的扫描与标注.
#[derive(Debug, Clone)]
pub struct PhantomCase {
    /// 扫描.
    pub scan: MriScan,
    /// 真值标注.
    pub labels: MriLabel,
}

/// 立方体体模的描述.
#[derive(Debug, Clone, PartialEq)]
pub struct CubePhantom {
    dims: Idx3d,
    lo: Idx3d,
    size: Idx3d,

    /// 每个通道的 `(背景均值, 前景均值)`.
    means: Vec<(f32, f32)>,
    bg_sigma: f32,
    fg_sigma: f32,
    seed: u64,
}

impl CubePhantom {
    /// 背景标签.
    pub const BACKGROUND: Label = 0;
    /// 立方体标签.
    pub const CUBE: Label = 1;

    /// 在 `dims` 体数据中, 以 `lo` 为起点放置边长 `size` 的立方体.
    ///
    /// 背景各通道均值 10, 标准差 2; 立方体第 `c` 个通道均值 `100 + 50c`, 标准差 3.
    ///
    /// 如果立方体超出体数据或 `channels` 为 0, 则程序 panic.
    pub fn new(dims: Idx3d, lo: Idx3d, size: Idx3d, channels: usize) -> Self {
        assert!(channels > 0, "至少需要一个通道");
        assert!(
            lo.0 + size.0 <= dims.0 && lo.1 + size.1 <= dims.1 && lo.2 + size.2 <= dims.2,
            "立方体超出体数据范围"
        );
        Self {
            dims,
            lo,
            size,
            means: (0..channels).map(|c| (10.0, 100.0 + 50.0 * c as f32)).collect(),
            bg_sigma: 2.0,
            fg_sigma: 3.0,
            seed: 0,
        }
    }

    /// 设置随机种子.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// 设置每个通道的 `(背景均值, 前景均值)`. 长度决定通道数.
    pub fn with_means(mut self, means: Vec<(f32, f32)>) -> Self {
        assert!(!means.is_empty(), "至少需要一个通道");
        self.means = means;
        self
    }

    /// 设置背景与前景的噪声标准差.
    pub fn with_sigmas(mut self, bg: f32, fg: f32) -> Self {
        assert!(bg >= 0.0 && fg >= 0.0, "标准差不能为负");
        self.bg_sigma = bg;
        self.fg_sigma = fg;
        self
    }

    /// 通道数.
    #[inline]
    pub fn channels(&self) -> usize {
        self.means.len()
    }

    /// `pos` 是否在立方体内?
    #[inline]
    pub fn inside(&self, (x, y, z): Idx3d) -> bool {
        let (lx, ly, lz) = self.lo;
        let (sx, sy, sz) = self.size;
        (lx..lx + sx).contains(&x) && (ly..ly + sy).contains(&y) && (lz..lz + sz).contains(&z)
    }

    fn labels(&self) -> MriLabel {
        let data = Array3::from_shape_fn(self.dims, |pos| {
            if self.inside(pos) {
                Self::CUBE
            } else {
                Self::BACKGROUND
            }
        });
        let mut labels = MriLabel::new(VolumeGeometry::isotropic(self.dims));
        labels.data_mut().assign(&data);
        labels
    }

    fn render(&self, mut noise: impl FnMut(f32) -> f32) -> PhantomCase {
        let geometry = VolumeGeometry::isotropic(self.dims);
        let mut scan = MriScan::new(geometry, self.channels());
        for pos in ndarray::indices(self.dims) {
            let inside = self.inside(pos);
            for (c, &(bg, fg)) in self.means.iter().enumerate() {
                let v = if inside {
                    fg + noise(self.fg_sigma)
                } else {
                    bg + noise(self.bg_sigma)
                };
                scan.set(pos, c, v);
            }
        }
        PhantomCase {
            scan,
            labels: self.labels(),
        }
    }

    /// 生成带噪声的扫描.
    pub fn build(&self) -> PhantomCase {
        let mut rng = StdRng::seed_from_u64(self.seed);
        self.render(|sigma| {
            let z: f32 = StandardNormal.sample(&mut rng);
            sigma * z
        })
    }

    /// 生成无噪声的扫描: 每个体素取精确的均值.
    pub fn noise_free(&self) -> PhantomCase {
        self.render(|_| 0.0)
    }
}

/// [`CubePhantom::new`] 加种子的简写.
pub fn cube_case(dims: Idx3d, lo: Idx3d, size: Idx3d, channels: usize, seed: u64) -> PhantomCase {
    CubePhantom::new(dims, lo, size, channels).with_seed(seed).build()
}

/// 以扫描自身的几何为模板, 恒等变换, 默认参数训练一个图谱.
pub fn train_atlas(case: &PhantomCase, prior_spacing: f64, node_spacing: f64) -> GcaResult<Gca> {
    use crate::volume::VolumeAttr;

    let geometry = case.scan.geometry().clone();
    let mut gca = Gca::new(case.scan.channels(), prior_spacing, node_spacing, geometry, 0);
    let transform = Transform::identity();
    let params = TrainParams::default();
    gca.train(&case.scan, &case.labels, &transform, None, &params)?;
    gca.complete_mean_training();
    gca.train_covariances(&case.scan, &case.labels, &transform, None, &params)?;
    gca.complete_covariance_training(&RegularizeParams::default())?;
    Ok(gca)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phantom_statistics() {
        let phantom = CubePhantom::new((10, 10, 10), (3, 3, 3), (4, 4, 4), 2).with_seed(7);
        let case = phantom.build();
        assert_eq!(case.labels.count(CubePhantom::CUBE), 64);

        let (mut sum, mut sq) = (0.0f64, 0.0f64);
        for pos in ndarray::indices((10, 10, 10)) {
            if !phantom.inside(pos) {
                let v = case.scan.get(pos, 1) as f64;
                sum += v;
                sq += v * v;
            }
        }
        let n = 1000.0 - 64.0;
        let mean = sum / n;
        let var = sq / n - mean * mean;
        assert!((mean - 10.0).abs() < 0.3, "{mean}");
        assert!((var - 4.0).abs() < 0.8, "{var}");

        let clean = phantom.noise_free();
        assert_eq!(clean.scan.get((4, 4, 4), 1), 150.0);
        assert_eq!(clean.labels, case.labels);
    }

    #[test]
    fn test_seed_is_deterministic() {
        let a = cube_case((6, 6, 6), (1, 1, 1), (2, 2, 2), 1, 3);
        let b = cube_case((6, 6, 6), (1, 1, 1), (2, 2, 2), 1, 3);
        let c = cube_case((6, 6, 6), (1, 1, 1), (2, 2, 2), 1, 4);
        assert_eq!(a.scan.data(), b.scan.data());
        assert_ne!(a.scan.data(), c.scan.data());
    }
}
