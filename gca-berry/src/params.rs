//! 可调参数. 每个结构都带有 `Default`, 构造函数以 `assert!` 检查取值范围.
//!
//! 启用 `serde` 特性后可以从 JSON 文件加载.

use crate::{Idx3d, Label};

pub use crate::gca::SampleParams;

/// 调试探针: 在单个体素 (以及可选的单个标签) 上输出 `trace` 级日志.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DebugProbe {
    /// x 坐标.
    pub x: usize,
    /// y 坐标.
    pub y: usize,
    /// z 坐标.
    pub z: usize,
    /// 只关心的标签. `None` 表示所有标签.
    pub label: Option<Label>,
}

impl DebugProbe {
    /// 探针是否指向 `pos`?
    #[inline]
    pub fn hits(&self, pos: Idx3d) -> bool {
        (self.x, self.y, self.z) == pos
    }

    /// 探针是否关心 `label`?
    #[inline]
    pub fn wants(&self, label: Label) -> bool {
        self.label.map_or(true, |l| l == label)
    }
}

/// 探针是否命中 `pos` (并关心 `label`)?
#[inline]
pub(crate) fn probe_hits(probe: &Option<DebugProbe>, pos: Idx3d, label: Option<Label>) -> bool {
    probe.is_some_and(|p| p.hits(pos) && label.map_or(true, |l| p.wants(l)))
}

/// 训练参数.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(default))]
pub struct TrainParams {
    /// 剪枝图谱拒绝样本的阈值: 偏离参考均值超过 `prune_sigma` 个标准差时只计入先验.
    pub prune_sigma: f64,

    /// 整卷只训练先验, 不累积强度.
    pub priors_only: bool,

    /// 调试探针.
    pub probe: Option<DebugProbe>,
}

impl Default for TrainParams {
    fn default() -> Self {
        Self {
            prune_sigma: 2.0,
            priors_only: false,
            probe: None,
        }
    }
}

impl TrainParams {
    /// 检查参数合法性. 非法时 panic.
    pub fn assert_args(&self) {
        assert!(self.prune_sigma > 0.0, "剪枝阈值必须为正");
    }
}

/// 协方差正则化参数.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(default))]
pub struct RegularizeParams {
    /// 病态阈值: 行列式低于 `det_fraction * Π 全局方差` 视为病态.
    pub det_fraction: f64,

    /// 病态矩阵对角线增加 `ridge_fraction * 全局方差`.
    pub ridge_fraction: f64,

    /// 奇异矩阵从邻居复制时, 先在此半径 (node 单元) 内搜索.
    pub search_radius: usize,

    /// 邻居强度兼容阈值: `|Δμ|² <= compat_sigma² * 全局方差`.
    pub compat_sigma: f64,

    /// 正则化后仍不可逆时报错而不是警告.
    pub strict: bool,
}

impl Default for RegularizeParams {
    fn default() -> Self {
        Self {
            det_fraction: 1e-4,
            ridge_fraction: 0.1,
            search_radius: 3,
            compat_sigma: 2.0,
            strict: false,
        }
    }
}

impl RegularizeParams {
    /// 检查参数合法性. 非法时 panic.
    pub fn assert_args(&self) {
        assert!(self.det_fraction >= 0.0, "病态阈值不能为负");
        assert!(
            self.ridge_fraction > 0.0 && self.ridge_fraction <= 1.0,
            "ridge 比例必须在 (0, 1] 内"
        );
        assert!(self.compat_sigma > 0.0, "兼容阈值必须为正");
    }
}

/// 强度重归一化参数.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(default))]
pub struct RenormParams {
    /// 只统计先验不低于该值的 prior 单元.
    pub min_prior: f32,

    /// 直方图桶数.
    pub nbins: usize,

    /// 直方图高斯平滑的标准差 (桶).
    pub smooth_sigma: f64,

    /// 峰值必须高于最高峰的该比例才算作峰.
    pub peak_threshold: f64,

    /// 对齐搜索半径 (体素), 用于 [`crate::Gca::map_renormalize_with_alignment`].
    pub alignment_radius: usize,

    /// 参与统计的最少体素数, 不足时跳过该标签.
    pub min_samples: usize,
}

impl Default for RenormParams {
    fn default() -> Self {
        Self {
            min_prior: 0.6,
            nbins: 256,
            smooth_sigma: 2.0,
            peak_threshold: 0.1,
            alignment_radius: 2,
            min_samples: 10,
        }
    }
}

impl RenormParams {
    /// 检查参数合法性. 非法时 panic.
    pub fn assert_args(&self) {
        assert!((0.0..=1.0).contains(&self.min_prior), "先验下限必须在 [0, 1] 内");
        assert!(self.nbins >= 2, "直方图至少需要 2 个桶");
        assert!(self.smooth_sigma >= 0.0, "平滑参数不能为负");
        assert!((0.0..1.0).contains(&self.peak_threshold), "峰值阈值必须在 [0, 1) 内");
    }
}

/// ICM 单次遍历的执行方式.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Schedule {
    /// 原地更新, 遵循访问顺序.
    #[default]
    Sequential,

    /// 基于遍历开始时的冻结快照并行计算, 遍历结束后统一写回.
    Parallel,
}

/// Gibbs 先验下的 ICM 重标注参数.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(default))]
pub struct RelabelParams {
    /// 邻居项相对数据项的初始权重 `PRIOR_FACTOR`.
    pub prior_factor: f64,

    /// `PRIOR_FACTOR` 的上限.
    pub max_prior_factor: f64,

    /// 一次遍历改变的体素少于该值时视为停滞, 加倍 `PRIOR_FACTOR`.
    pub min_changed: usize,

    /// 最大遍历次数.
    pub max_iter: usize,

    /// 首轮是否按初始概率升序访问.
    pub sort_first_pass: bool,

    /// 随机排列的种子.
    pub seed: u64,

    /// 执行方式.
    pub schedule: Schedule,

    /// 调试探针.
    pub probe: Option<DebugProbe>,
}

impl Default for RelabelParams {
    fn default() -> Self {
        Self {
            prior_factor: 0.1,
            max_prior_factor: 1.0,
            min_changed: 5,
            max_iter: 200,
            sort_first_pass: true,
            seed: 0x6ca,
            schedule: Schedule::Sequential,
            probe: None,
        }
    }
}

impl RelabelParams {
    /// 检查参数合法性. 非法时 panic.
    pub fn assert_args(&self) {
        assert!(self.prior_factor > 0.0, "PRIOR_FACTOR 必须为正");
        assert!(
            self.max_prior_factor >= self.prior_factor,
            "PRIOR_FACTOR 上限不能小于初值"
        );
        assert!(self.max_iter > 0, "至少需要一次遍历");
    }
}

/// 模拟退火参数.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(default))]
pub struct AnnealParams {
    /// 初始温度.
    pub initial_temp: f64,

    /// 每次遍历后的降温系数.
    pub cooling: f64,

    /// 最大遍历次数.
    pub max_iter: usize,

    /// 邻居项权重.
    pub prior_factor: f64,

    /// 随机数种子.
    pub seed: u64,
}

impl Default for AnnealParams {
    fn default() -> Self {
        Self {
            initial_temp: 10.0,
            cooling: 0.99,
            max_iter: 100,
            prior_factor: 0.1,
            seed: 0x6ca,
        }
    }
}

impl AnnealParams {
    /// 检查参数合法性. 非法时 panic.
    pub fn assert_args(&self) {
        assert!(self.initial_temp > 0.0, "初始温度必须为正");
        assert!(self.cooling > 0.0 && self.cooling < 1.0, "降温系数必须在 (0, 1) 内");
        assert!(self.prior_factor > 0.0, "PRIOR_FACTOR 必须为正");
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "serde")] {
        use std::path::Path;

        use crate::{GcaError, GcaResult};

        /// 从 JSON 文件读取任意参数结构. 缺失的字段取默认值.
        pub fn from_json_file<T: serde::de::DeserializeOwned>(path: impl AsRef<Path>) -> GcaResult<T> {
            let path = path.as_ref();
            let contents = std::fs::read_to_string(path)?;
            serde_json::from_str(&contents)
                .map_err(|e| GcaError::Config(format!("{}: {e}", path.display())))
        }

        macro_rules! impl_from_json {
            ($($t:ty),*) => {$(
                impl $t {
                    /// 从 JSON 文件读取. 缺失的字段取默认值.
                    #[inline]
                    pub fn from_json_file(path: impl AsRef<Path>) -> GcaResult<Self> {
                        from_json_file(path)
                    }
                }
            )*};
        }

        impl_from_json!(TrainParams, RegularizeParams, RenormParams, RelabelParams, AnnealParams);
    }
}

#[cfg(test)]
mod tests {
    use super::{DebugProbe, RelabelParams, probe_hits};

    #[test]
    fn test_probe_matching() {
        let probe = Some(DebugProbe {
            x: 1,
            y: 2,
            z: 3,
            label: Some(4),
        });
        assert!(probe_hits(&probe, (1, 2, 3), Some(4)));
        assert!(probe_hits(&probe, (1, 2, 3), None));
        assert!(!probe_hits(&probe, (1, 2, 3), Some(5)));
        assert!(!probe_hits(&None, (1, 2, 3), None));
    }

    #[test]
    #[should_panic]
    fn test_relabel_params_reject_bad_cap() {
        RelabelParams {
            prior_factor: 1.0,
            max_prior_factor: 0.5,
            ..Default::default()
        }
        .assert_args();
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_relabel_params_from_json() {
        let dir = std::env::temp_dir().join("gca-berry-params-test.json");
        std::fs::write(&dir, r#"{ "prior_factor": 0.2, "schedule": "Parallel" }"#).unwrap();
        let p = RelabelParams::from_json_file(&dir).unwrap();
        assert_eq!(p.prior_factor, 0.2);
        assert_eq!(p.schedule, super::Schedule::Parallel);
        assert_eq!(p.max_iter, RelabelParams::default().max_iter);
        std::fs::remove_file(dir).ok();
    }
}
