//! 运行时错误.

use crate::consts::GcaType;
use crate::{Idx3d, Label};
use std::fmt::{self, Display, Formatter};

/// 坐标变换越界.
///
/// 这不是致命错误: 调用方应把对应体素视为 "图谱外", 在当前操作中跳过它.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OutOfBounds;

impl Display for OutOfBounds {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("coordinate maps outside the destination volume")
    }
}

impl std::error::Error for OutOfBounds {}

/// 坐标变换结果.
pub type CoordResult<T> = Result<T, OutOfBounds>;

/// 图谱操作的致命错误.
#[derive(Debug)]
pub enum GcaError {
    /// 底层 I/O 错误.
    Io(std::io::Error),

    /// 读取 nifti 文件错误.
    Nifti(nifti::NiftiError),

    /// 读取 npy 文件错误.
    Npy(ndarray_npy::ReadNpyError),

    /// 文件版本比当前版本更新.
    UnsupportedVersion(f32),

    /// 通道数不一致.
    ChannelMismatch {
        /// 期望的通道数.
        expected: usize,
        /// 实际的通道数.
        found: usize,
    },

    /// 两个体数据形状不一致.
    ShapeMismatch(Idx3d, Idx3d),

    /// 需要体素到体素的仿射变换, 却得到了 RAS 到 RAS 的变换.
    TransformKind,

    /// 反向映射之前没有调用 `Transform::invert`.
    TransformNotInverted,

    /// 仿射矩阵不可逆.
    SingularTransform,

    /// 正则化后协方差仍然奇异 (仅在严格模式下报告).
    SingularCovariance {
        /// node 坐标.
        node: Idx3d,
        /// 标签.
        label: Label,
    },

    /// 重归一化文件格式错误.
    MalformedRenormalization {
        /// 行号 (从 1 开始).
        line: usize,
        /// 该行原文.
        content: String,
    },

    /// 图谱文件内容不合法.
    MalformedFile(String),

    /// 图谱中不存在该标签.
    EmptyLabel(Label),

    /// 图谱类型不支持该操作.
    GcaTypeMismatch {
        /// 操作要求的类型.
        expected: GcaType,
        /// 图谱实际的类型.
        found: GcaType,
    },

    /// 缺少脉冲序列参数.
    MissingSequence,

    /// 参数文件无法解析.
    Config(String),

    /// 坐标越界 (在需要整体成功的操作中).
    OutOfBounds,

    /// 操作被取消.
    Cancelled,
}

impl Display for GcaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            GcaError::Io(e) => write!(f, "I/O error: {e}"),
            GcaError::Nifti(e) => write!(f, "nifti error: {e}"),
            GcaError::Npy(e) => write!(f, "npy error: {e}"),
            GcaError::UnsupportedVersion(v) => {
                write!(f, "atlas version {v} is newer than supported")
            }
            GcaError::ChannelMismatch { expected, found } => {
                write!(f, "expected {expected} input channels, found {found}")
            }
            GcaError::ShapeMismatch(a, b) => write!(f, "volume shapes differ: {a:?} vs {b:?}"),
            GcaError::TransformKind => f.write_str("a voxel-to-voxel transform is required"),
            GcaError::TransformNotInverted => {
                f.write_str("transform must be inverted before backward queries")
            }
            GcaError::SingularTransform => f.write_str("affine matrix is not invertible"),
            GcaError::SingularCovariance { node, label } => {
                write!(f, "covariance of label {label} at node {node:?} is still singular")
            }
            GcaError::MalformedRenormalization { line, content } => {
                write!(f, "malformed renormalization line {line}: `{content}`")
            }
            GcaError::MalformedFile(s) => write!(f, "malformed atlas file: {s}"),
            GcaError::EmptyLabel(l) => write!(f, "label {l} is absent from the atlas"),
            GcaError::GcaTypeMismatch { expected, found } => {
                write!(f, "operation requires a {expected:?} atlas, found {found:?}")
            }
            GcaError::MissingSequence => f.write_str("atlas has no pulse sequence parameters"),
            GcaError::Config(s) => write!(f, "invalid parameter file: {s}"),
            GcaError::OutOfBounds => Display::fmt(&OutOfBounds, f),
            GcaError::Cancelled => f.write_str("operation cancelled"),
        }
    }
}

impl std::error::Error for GcaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GcaError::Io(e) => Some(e),
            GcaError::Nifti(e) => Some(e),
            GcaError::Npy(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for GcaError {
    fn from(value: std::io::Error) -> Self {
        GcaError::Io(value)
    }
}

impl From<nifti::NiftiError> for GcaError {
    fn from(value: nifti::NiftiError) -> Self {
        GcaError::Nifti(value)
    }
}

impl From<ndarray_npy::ReadNpyError> for GcaError {
    fn from(value: ndarray_npy::ReadNpyError) -> Self {
        GcaError::Npy(value)
    }
}

impl From<OutOfBounds> for GcaError {
    fn from(_: OutOfBounds) -> Self {
        GcaError::OutOfBounds
    }
}

/// 图谱操作结果.
pub type GcaResult<T> = Result<T, GcaError>;
