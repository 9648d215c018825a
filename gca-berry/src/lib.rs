#![warn(missing_docs)] // <= 合适时移除它.
// #![warn(clippy::missing_docs_in_private_items)]  // <= too strict.

//! 核心库. 基于高斯分类器阵列 (Gaussian Classifier Array, GCA) 概率图谱的 MRI 全脑分割.
//!
//! 图谱由两张不同分辨率的三维网格组成: 较细的 node 网格为每个 (位置, 标签)
//! 保存多元高斯分布与 6-邻域 MRF 邻居标签直方图; 较粗的 prior 网格保存标签先验概率.
//! 训练时从人工标注的扫描中累积统计量, 分割时将新扫描映射到图谱空间,
//! 然后在 Gibbs 先验下做 ICM (iterated conditional modes) / 模拟退火迭代.
//!
//! 该 crate 目前仅提供 `safe` 接口.
//!
//! # 注意
//!
//! 1. 所有体数据均以 `(x, y, z)` 顺序索引, 与体素到 RAS 的仿射变换保持一致.
//! 2. 坐标越界 ([`OutOfBounds`]) 不是错误, 调用方应将该体素视为 "图谱外",
//!   而不是中断整个流程.
//! 3. 图谱在推断时只读, 训练/重归一化时可写. 多线程共享请使用 [`SharedAtlas`].
//!
//! # 开发计划
//!
//! ### 高斯分类器与协方差正则化 ✅
//!
//! 单通道快速路径, 多通道基于 `nalgebra` 的 Cholesky 分解.
//!
//! 实现位于 `gca-berry/src/gca/classifier.rs` 与 `gca-berry/src/stats/regularize.rs`.
//!
//! ### node / prior 双分辨率网格与坐标变换链 ✅
//!
//! 源体素 -> 模板 (Talairach) 体素 -> node / prior 网格, 以及反向映射.
//!
//! 实现位于 `gca-berry/src/gca/coords.rs`.
//!
//! ### 训练 ✅
//!
//! 均值、协方差两遍训练, 空洞填充 (最近同标签分类器), 奇异 / 病态协方差修复.
//!
//! 实现位于 `gca-berry/src/stats`.
//!
//! ### 强度重归一化 & FLASH 前向模型 ✅
//!
//! 直方图峰值检测 + 标签顺序保持; (T1, PD) 参数图谱到任意 FLASH 序列的重映射.
//!
//! 实现位于 `gca-berry/src/stats/renorm.rs` 与 `gca-berry/src/stats/flash.rs`.
//!
//! ### Gibbs 先验下的 ICM 与模拟退火 ✅
//!
//! 按概率排序的首轮 + 随机排列的后续轮次, 膨胀的 "脏体素" 工作集,
//! `PRIOR_FACTOR` 回退. 支持 `rayon` 并行 (冻结快照读取).
//!
//! 实现位于 `gca-berry/src/infer`.
//!
//! ### 持久化 ✅
//!
//! 与已有工具链位兼容的大端二进制格式, 带标签扩展段, 支持旧版本单分辨率格式.
//! 以 `.gz` 结尾的文件自动压缩.
//!
//! 实现位于 `gca-berry/src/persist`.
//!
//! ### 配准用采样接口 ✅
//!
//! `find_stable_samples`, `compute_log_sample_probability`.
//!
//! 实现位于 `gca-berry/src/gca/sample.rs`.

/// 三维索引 `(x, y, z)`, 同时也可一定程度上用作非负整数向量.
pub type Idx3d = (usize, usize, usize);

/// 三维实数坐标 `(x, y, z)`.
pub type Idx3dF = (f64, f64, f64);

/// 压缩存储优化时会用到. 该结构不对外公开.
type Idx3dU16 = (u16, u16, u16);

/// 解剖标签. 与 CMA 颜色表一致, 以单字节保存.
pub type Label = u8;

pub mod consts;

pub mod params;

mod error;

pub use error::{CoordResult, GcaError, GcaResult, OutOfBounds};

/// 带几何信息的三维 / 四维体数据.
pub mod volume;

pub use volume::{MriLabel, MriScan, VolumeAttr, VolumeGeometry};

pub mod transform;

pub use transform::{DeformField, LinearKind, LinearTransform, Transform};

pub mod gca;

pub use gca::{Direction, Gc1d, Gca, GcaNode, GcaPrior, GcaSample, PulseParams, TissueParms};

pub mod stats;

pub mod infer;

pub mod persist;

pub mod sync;

pub use sync::{CancelToken, SharedAtlas};

pub mod phantom;

pub mod prelude;

#[cfg(test)]
mod scenario_tests;
