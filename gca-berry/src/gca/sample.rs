//! 配准用采样接口. 两个函数都是 (图谱, 变换, 扫描) 的纯函数, 不修改图谱.

use super::{log_density, Direction, Gca};
use crate::consts::BIG_AND_NEGATIVE;
use crate::transform::Transform;
use crate::volume::MriScan;
use crate::{GcaError, GcaResult, Label};

/// 采样参数.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SampleParams {
    /// 采样间距 (毫米).
    pub spacing: f64,

    /// 最大先验的下限.
    pub min_prior: f32,

    /// 不参与采样的标签.
    pub exclude: Vec<Label>,
}

impl Default for SampleParams {
    fn default() -> Self {
        Self {
            spacing: 8.0,
            min_prior: 0.9,
            exclude: vec![crate::consts::cma::UNKNOWN],
        }
    }
}

impl SampleParams {
    /// 创建采样参数.
    ///
    /// 如果 `spacing` 不为正或 `min_prior` 不在 `[0, 1]` 内, 则程序 panic.
    pub fn new(spacing: f64, min_prior: f32, exclude: Vec<Label>) -> Self {
        let p = Self {
            spacing,
            min_prior,
            exclude,
        };
        p.assert_args();
        p
    }

    /// 检查参数合法性. 非法时 panic.
    pub fn assert_args(&self) {
        assert!(self.spacing > 0.0, "采样间距必须为正");
        assert!((0.0..=1.0).contains(&self.min_prior), "先验下限必须在 [0, 1] 内");
    }
}

/// 图谱某个 prior 单元上的统计快照. 拥有自己的均值与协方差副本.
#[derive(Clone, Debug, PartialEq)]
pub struct GcaSample {
    /// prior 单元坐标.
    pub xp: usize,
    /// prior 单元坐标.
    pub yp: usize,
    /// prior 单元坐标.
    pub zp: usize,

    /// 单元中心的模板体素坐标.
    pub x: f64,
    /// 单元中心的模板体素坐标.
    pub y: f64,
    /// 单元中心的模板体素坐标.
    pub z: f64,

    /// 标签.
    pub label: Label,

    /// 该标签的先验.
    pub prior: f32,

    /// 均值.
    pub means: Vec<f32>,

    /// 压缩上三角协方差.
    pub covars: Vec<f32>,

    /// 最近一次计算的对数概率.
    pub log_p: f64,
}

impl GcaSample {
    /// 条件对数密度.
    #[inline]
    pub fn log_density(&self, vals: &[f32]) -> f64 {
        log_density(&self.means, &self.covars, vals)
    }
}

impl Gca {
    /// 寻找 "稳定" 的采样点: 最大先验标签的先验不低于 `min_prior`, 且 6 个相邻 prior
    /// 单元的最大先验标签都与其相同. 按 `spacing` 对 prior 网格做跨步扫描.
    pub fn find_stable_samples(&self, params: &SampleParams) -> Vec<GcaSample> {
        params.assert_args();
        let stride = ((params.spacing / self.prior_spacing()).round() as usize).max(1);
        let dims = self.prior_dims();
        let (w, h, d) = dims;

        let mut samples = Vec::new();
        for xp in (0..w).step_by(stride) {
            for yp in (0..h).step_by(stride) {
                for zp in (0..d).step_by(stride) {
                    let pos = (xp, yp, zp);
                    let Some((label, prior)) = self.prior(pos).max_prior() else {
                        continue;
                    };
                    if prior < params.min_prior || params.exclude.contains(&label) {
                        continue;
                    }
                    let stable = Direction::ALL.iter().all(|dir| match dir.step(pos, dims) {
                        Some(n) => self.prior(n).max_prior().map(|(l, _)| l) == Some(label),
                        None => true,
                    });
                    if !stable {
                        continue;
                    }
                    let Some(gc) = self.node(self.prior_to_node(pos)).gc(label) else {
                        continue;
                    };
                    let (x, y, z) = self.prior_to_template_voxel(pos);
                    samples.push(GcaSample {
                        xp,
                        yp,
                        zp,
                        x,
                        y,
                        z,
                        label,
                        prior,
                        means: gc.means.clone(),
                        covars: gc.covars.clone(),
                        log_p: 0.0,
                    });
                }
            }
        }
        log::debug!("{} stable samples at {} mm", samples.len(), params.spacing);
        samples
    }

    /// 在当前变换估计下, 计算扫描在全部采样点上的总对数概率.
    ///
    /// 采样点反向映射到扫描外时贡献 [`BIG_AND_NEGATIVE`]. 变换必须已对 `scan` 求逆.
    pub fn compute_log_sample_probability(
        &self,
        samples: &[GcaSample],
        scan: &MriScan,
        transform: &Transform,
    ) -> GcaResult<f64> {
        if scan.channels() != self.scan_channels() {
            return Err(GcaError::ChannelMismatch {
                expected: self.scan_channels(),
                found: scan.channels(),
            });
        }
        let backward = transform.backward()?;
        let mut vals = Vec::with_capacity(self.ninputs());
        let mut total = 0.0;
        for s in samples {
            total += match backward.map((s.x, s.y, s.z)) {
                Ok(p) => {
                    self.interpolate_vals(scan, p, &mut vals);
                    s.log_density(&vals)
                }
                Err(_) => BIG_AND_NEGATIVE,
            };
        }
        Ok(total)
    }
}
