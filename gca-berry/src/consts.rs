//! 通用常量.

/// CMA 颜色表中的常用解剖标签.
pub mod cma {
    use crate::Label;

    /// 未知 / 背景.
    pub const UNKNOWN: Label = 0;

    /// 左大脑外部.
    pub const LEFT_CEREBRAL_EXTERIOR: Label = 1;

    /// 左大脑白质.
    pub const LEFT_CEREBRAL_WHITE_MATTER: Label = 2;

    /// 左大脑皮层.
    pub const LEFT_CEREBRAL_CORTEX: Label = 3;

    /// 左侧脑室.
    pub const LEFT_LATERAL_VENTRICLE: Label = 4;

    /// 左侧脑室下角.
    pub const LEFT_INF_LAT_VENT: Label = 5;

    /// 左小脑白质.
    pub const LEFT_CEREBELLUM_WHITE_MATTER: Label = 7;

    /// 左小脑皮层.
    pub const LEFT_CEREBELLUM_CORTEX: Label = 8;

    /// 左丘脑.
    pub const LEFT_THALAMUS: Label = 10;

    /// 左尾状核.
    pub const LEFT_CAUDATE: Label = 11;

    /// 左壳核.
    pub const LEFT_PUTAMEN: Label = 12;

    /// 左苍白球.
    pub const LEFT_PALLIDUM: Label = 13;

    /// 第三脑室.
    pub const THIRD_VENTRICLE: Label = 14;

    /// 第四脑室.
    pub const FOURTH_VENTRICLE: Label = 15;

    /// 脑干.
    pub const BRAIN_STEM: Label = 16;

    /// 左海马.
    pub const LEFT_HIPPOCAMPUS: Label = 17;

    /// 左杏仁核.
    pub const LEFT_AMYGDALA: Label = 18;

    /// 脑脊液.
    pub const CSF: Label = 24;

    /// 右大脑白质.
    pub const RIGHT_CEREBRAL_WHITE_MATTER: Label = 41;

    /// 右大脑皮层.
    pub const RIGHT_CEREBRAL_CORTEX: Label = 42;

    /// 右侧脑室.
    pub const RIGHT_LATERAL_VENTRICLE: Label = 43;

    /// 右侧脑室下角.
    pub const RIGHT_INF_LAT_VENT: Label = 44;

    /// 右小脑白质.
    pub const RIGHT_CEREBELLUM_WHITE_MATTER: Label = 46;

    /// 右小脑皮层.
    pub const RIGHT_CEREBELLUM_CORTEX: Label = 47;

    /// 第五脑室.
    pub const FIFTH_VENTRICLE: Label = 72;

    /// 白质低信号.
    pub const WM_HYPOINTENSITIES: Label = 77;

    /// 标签是否是白质? 重归一化时白质选取直方图最右侧的峰.
    #[inline]
    pub const fn is_white_matter(l: Label) -> bool {
        matches!(
            l,
            LEFT_CEREBRAL_WHITE_MATTER
                | RIGHT_CEREBRAL_WHITE_MATTER
                | LEFT_CEREBELLUM_WHITE_MATTER
                | RIGHT_CEREBELLUM_WHITE_MATTER
        )
    }

    /// 标签是否是脑室 / 脑脊液? 重归一化时选取直方图最左侧的峰.
    #[inline]
    pub const fn is_csf_like(l: Label) -> bool {
        matches!(
            l,
            LEFT_LATERAL_VENTRICLE
                | LEFT_INF_LAT_VENT
                | THIRD_VENTRICLE
                | FOURTH_VENTRICLE
                | CSF
                | RIGHT_LATERAL_VENTRICLE
                | RIGHT_INF_LAT_VENT
                | FIFTH_VENTRICLE
        )
    }

    /// 标签是否是皮层?
    #[inline]
    pub const fn is_cortex(l: Label) -> bool {
        matches!(
            l,
            LEFT_CEREBRAL_CORTEX
                | RIGHT_CEREBRAL_CORTEX
                | LEFT_CEREBELLUM_CORTEX
                | RIGHT_CEREBELLUM_CORTEX
        )
    }
}

/// 图谱标志位.
pub mod flags {
    /// 不训练、不保存 MRF 邻居直方图.
    pub const GCA_NO_MRF: u32 = 0x0001;

    /// 附加 x 方向梯度通道.
    pub const GCA_XGRAD: u32 = 0x0002;

    /// 附加 y 方向梯度通道.
    pub const GCA_YGRAD: u32 = 0x0004;

    /// 附加 z 方向梯度通道.
    pub const GCA_ZGRAD: u32 = 0x0008;

    /// 全部梯度通道.
    pub const GCA_GRAD: u32 = GCA_XGRAD | GCA_YGRAD | GCA_ZGRAD;

    /// 梯度通道个数.
    #[inline]
    pub const fn grad_channels(flags: u32) -> usize {
        ((flags & GCA_XGRAD != 0) as usize)
            + ((flags & GCA_YGRAD != 0) as usize)
            + ((flags & GCA_ZGRAD != 0) as usize)
    }
}

/// 当前文件格式版本. 读取时以精确相等比较.
pub const GCA_VERSION: f32 = 4.0;

/// 图谱文件扩展段的标签号.
pub mod tags {
    /// 每个通道的 FLASH 参数 `(TR, 翻转角, TE)`.
    pub const TAG_PARAMETERS: i32 = 10;

    /// 图谱类型.
    pub const TAG_GCA_TYPE: i32 = 11;

    /// 模板几何: 方向余弦, 中心, 尺寸, 体素大小.
    pub const TAG_GCA_DIRCOS: i32 = 12;

    /// 非默认的组织参数表项.
    pub const TAG_GCA_TISSUE_PARMS: i32 = 13;
}

/// 组织参数表长度.
pub const MAX_GCA_LABELS: usize = 1000;

/// MRF 邻居个数 (6-邻域).
pub const GIBBS_NEIGHBORS: usize = 6;

/// 协方差行列式下限. 低于该值的协方差被视为奇异.
pub const MIN_DET: f64 = 1e-7;

/// 单通道方差下限.
pub const MIN_VAR: f64 = 1e-3;

/// "不可能" 的对数似然. 不是 `-inf`, 以便求和后仍可比较.
pub const BIG_AND_NEGATIVE: f64 = -1.0e7;

/// 训练中从未观察到的邻居标签的概率分子. 实际概率为 `UNSEEN_NEIGHBOR / total_training`.
pub const UNSEEN_NEIGHBOR: f64 = 0.1;

/// 图谱类型.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum GcaType {
    /// 普通强度图谱.
    #[default]
    Normal,

    /// 以 FLASH 序列参数标定的图谱.
    Flash,

    /// 以 (T1, PD) 组织参数表示的参数图谱.
    Param,
}

impl GcaType {
    /// 文件中的编码.
    #[inline]
    pub const fn code(&self) -> i32 {
        match self {
            GcaType::Normal => 0,
            GcaType::Flash => 1,
            GcaType::Param => 2,
        }
    }

    /// 从文件编码恢复. 未知编码返回 `None`.
    #[inline]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(GcaType::Normal),
            1 => Some(GcaType::Flash),
            2 => Some(GcaType::Param),
            _ => None,
        }
    }
}
