//! 🧠欢迎光临🧠
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{Idx3d, Idx3dF, Label};

pub use crate::volume::{MriLabel, MriScan, VolumeAttr, VolumeGeometry};

pub use crate::transform::{DeformField, LinearKind, LinearTransform, Transform};

pub use crate::gca::{
    Direction, Gc1d, Gca, GcaNode, GcaPrior, GcaSample, NeighborHistogram, PulseParams, TissueParms,
};

pub use crate::infer::{AnnealReport, FixedMask, IcmReport, IcmState, SegmentationContext};

pub use crate::params::{
    AnnealParams, DebugProbe, RegularizeParams, RelabelParams, RenormParams, SampleParams,
    Schedule, TrainParams,
};

pub use crate::consts::{cma, flags, GcaType};

pub use crate::sync::{CancelToken, SharedAtlas};

pub use crate::{GcaError, GcaResult};
