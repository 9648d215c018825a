//! 高斯分类器 (GC1D) 与 6-邻域方向.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};

use crate::consts::{BIG_AND_NEGATIVE, GIBBS_NEIGHBORS, MIN_VAR};
use crate::{Idx3d, Label};

const LOG_2PI: f64 = 1.837_877_066_409_345_5;

/// 6-邻域方向. 训练邻居直方图与推断打分使用同一套定义.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Direction {
    /// `+x`.
    XPos,
    /// `-x`.
    XNeg,
    /// `+y`.
    YPos,
    /// `-y`.
    YNeg,
    /// `+z`.
    ZPos,
    /// `-z`.
    ZNeg,
}

impl Direction {
    /// 全部方向, 顺序与文件中的存储顺序一致.
    pub const ALL: [Direction; GIBBS_NEIGHBORS] = [
        Direction::XPos,
        Direction::XNeg,
        Direction::YPos,
        Direction::YNeg,
        Direction::ZPos,
        Direction::ZNeg,
    ];

    /// 位移 `(dx, dy, dz)`.
    #[inline]
    pub const fn offset(self) -> (isize, isize, isize) {
        match self {
            Direction::XPos => (1, 0, 0),
            Direction::XNeg => (-1, 0, 0),
            Direction::YPos => (0, 1, 0),
            Direction::YNeg => (0, -1, 0),
            Direction::ZPos => (0, 0, 1),
            Direction::ZNeg => (0, 0, -1),
        }
    }

    /// 在 [`Self::ALL`] 中的下标.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// 反方向.
    #[inline]
    pub const fn opposite(self) -> Direction {
        match self {
            Direction::XPos => Direction::XNeg,
            Direction::XNeg => Direction::XPos,
            Direction::YPos => Direction::YNeg,
            Direction::YNeg => Direction::YPos,
            Direction::ZPos => Direction::ZNeg,
            Direction::ZNeg => Direction::ZPos,
        }
    }

    /// 沿该方向走一步. 越过边界时停在原地.
    #[inline]
    pub fn step_clamped(self, (x, y, z): Idx3d, (w, h, d): Idx3d) -> Idx3d {
        let (dx, dy, dz) = self.offset();
        let step = |v: usize, dv: isize, n: usize| match dv {
            1 if v + 1 < n => v + 1,
            -1 if v > 0 => v - 1,
            _ => v,
        };
        (step(x, dx, w), step(y, dy, h), step(z, dz, d))
    }

    /// 沿该方向走一步. 越过边界时返回 `None`.
    #[inline]
    pub fn step(self, (x, y, z): Idx3d, (w, h, d): Idx3d) -> Option<Idx3d> {
        let (dx, dy, dz) = self.offset();
        let nx = x.checked_add_signed(dx).filter(|v| *v < w)?;
        let ny = y.checked_add_signed(dy).filter(|v| *v < h)?;
        let nz = z.checked_add_signed(dz).filter(|v| *v < d)?;
        Some((nx, ny, nz))
    }
}

/// 单一方向上的邻居标签直方图. 训练时保存计数, 完成训练后保存概率.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NeighborHistogram {
    labels: Vec<Label>,
    priors: Vec<f32>,
}

impl NeighborHistogram {
    /// 由已知条目直接创建.
    pub fn from_entries(labels: Vec<Label>, priors: Vec<f32>) -> Self {
        assert_eq!(labels.len(), priors.len());
        Self { labels, priors }
    }

    /// 条目数.
    #[inline]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// 是否为空?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// 迭代 `(label, prior)`.
    #[inline]
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (Label, f32)> + '_ {
        self.labels.iter().copied().zip(self.priors.iter().copied())
    }

    /// 查询邻居标签的概率 (或训练中的计数).
    #[inline]
    pub fn get(&self, label: Label) -> Option<f32> {
        self.labels
            .iter()
            .position(|&l| l == label)
            .map(|i| self.priors[i])
    }

    /// 计数加一.
    pub fn add(&mut self, label: Label) {
        match self.labels.iter().position(|&l| l == label) {
            Some(i) => self.priors[i] += 1.0,
            None => {
                if self.labels.len() == self.labels.capacity() {
                    self.labels.reserve_exact(2);
                    self.priors.reserve_exact(2);
                }
                self.labels.push(label);
                self.priors.push(1.0);
            }
        }
    }

    /// 计数 -> 概率.
    pub fn normalize(&mut self) {
        let total: f32 = self.priors.iter().sum();
        if total > 0.0 {
            self.priors.iter_mut().for_each(|p| *p /= total);
        }
    }
}

/// 某个 (node, 标签) 上的多元高斯分类器, 附带 6 个方向的邻居标签直方图.
///
/// 训练期间 `means` 与 `covars` 用作累加器.
#[derive(Clone, Debug, PartialEq)]
pub struct Gc1d {
    /// 均值, 长度为通道数 `F`.
    pub means: Vec<f32>,

    /// 协方差上三角按行压缩存储, 长度为 `F * (F + 1) / 2`.
    pub covars: Vec<f32>,

    /// 带强度的训练样本数.
    pub ntraining: u32,

    /// 仅用于先验 (无可靠强度) 的训练样本数.
    pub n_just_priors: u32,

    /// 协方差是否经过人工稳定化.
    pub regularized: bool,

    /// 各方向邻居标签直方图, 按 [`Direction::ALL`] 排列.
    pub nbrs: [NeighborHistogram; GIBBS_NEIGHBORS],
}

/// 上三角压缩存储中 `(r, c)` 的位置. 要求 `r <= c`.
#[inline]
pub(crate) const fn covar_index(r: usize, c: usize, f: usize) -> usize {
    r * f - r * (r + 1) / 2 + c
}

/// 由压缩上三角恢复完整矩阵.
fn unpack(covars: &[f32], f: usize) -> DMatrix<f64> {
    DMatrix::from_fn(f, f, |r, c| {
        let (r, c) = if r <= c { (r, c) } else { (c, r) };
        covars[covar_index(r, c, f)] as f64
    })
}

/// Cholesky 分解. 失败时在对角线加 `MIN_VAR` 再试一次.
fn cholesky(covars: &[f32], f: usize) -> Option<Cholesky<f64, Dyn>> {
    let m = unpack(covars, f);
    Cholesky::new(m.clone()).or_else(|| Cholesky::new(m + DMatrix::identity(f, f) * MIN_VAR))
}

/// 单通道方差, 非正时取 `MIN_VAR`.
#[inline]
fn scalar_var(covars: &[f32]) -> f64 {
    let v = covars[0] as f64;
    if v > 0.0 {
        v
    } else {
        MIN_VAR
    }
}

#[inline]
fn whiten(chol: &Cholesky<f64, Dyn>, means: &[f32], vals: &[f32]) -> Option<f64> {
    let d = DVector::from_iterator(
        means.len(),
        vals.iter().zip(means).map(|(v, m)| (*v - *m) as f64),
    );
    chol.l().solve_lower_triangular(&d).map(|y| y.norm_squared())
}

/// 见 [`Gc1d::mahalanobis`].
pub(crate) fn mahalanobis(means: &[f32], covars: &[f32], vals: &[f32]) -> f64 {
    debug_assert_eq!(vals.len(), means.len());
    if means.len() == 1 {
        let d = (vals[0] - means[0]) as f64;
        return d * d / scalar_var(covars);
    }
    cholesky(covars, means.len())
        .and_then(|chol| whiten(&chol, means, vals))
        .unwrap_or(f64::INFINITY)
}

/// 见 [`Gc1d::log_density`].
pub(crate) fn log_density(means: &[f32], covars: &[f32], vals: &[f32]) -> f64 {
    debug_assert_eq!(vals.len(), means.len());
    let f = means.len();
    if f == 1 {
        let var = scalar_var(covars);
        let d = (vals[0] - means[0]) as f64;
        return -0.5 * (LOG_2PI + var.ln() + d * d / var);
    }
    let Some(chol) = cholesky(covars, f) else {
        return BIG_AND_NEGATIVE;
    };
    let log_det = 2.0 * chol.l().diagonal().iter().map(|v| v.ln()).sum::<f64>();
    match whiten(&chol, means, vals) {
        Some(maha) => -0.5 * (f as f64 * LOG_2PI + log_det + maha),
        None => BIG_AND_NEGATIVE,
    }
}

impl Gc1d {
    /// 创建 `ninputs` 通道的空分类器.
    pub fn new(ninputs: usize) -> Self {
        Self {
            means: vec![0.0; ninputs],
            covars: vec![0.0; ninputs * (ninputs + 1) / 2],
            ntraining: 0,
            n_just_priors: 0,
            regularized: false,
            nbrs: Default::default(),
        }
    }

    /// 通道数.
    #[inline]
    pub fn ninputs(&self) -> usize {
        self.means.len()
    }

    /// 协方差元素 `(r, c)`.
    #[inline]
    pub fn covar(&self, r: usize, c: usize) -> f32 {
        let (r, c) = if r <= c { (r, c) } else { (c, r) };
        self.covars[covar_index(r, c, self.ninputs())]
    }

    /// 对角方差.
    #[inline]
    pub fn variance(&self, c: usize) -> f32 {
        self.covar(c, c)
    }

    /// 完整协方差矩阵.
    pub fn covariance_matrix(&self) -> DMatrix<f64> {
        unpack(&self.covars, self.ninputs())
    }

    /// 以对称矩阵 `m` 的上三角覆盖协方差.
    pub fn set_covariance(&mut self, m: &DMatrix<f64>) {
        let f = self.ninputs();
        debug_assert_eq!(m.nrows(), f);
        for r in 0..f {
            for c in r..f {
                self.covars[covar_index(r, c, f)] = m[(r, c)] as f32;
            }
        }
    }

    /// 协方差行列式. 单通道直接返回方差.
    pub fn determinant(&self) -> f64 {
        match self.ninputs() {
            1 => self.covars[0] as f64,
            _ => self.covariance_matrix().determinant(),
        }
    }

    /// 协方差是否可逆且行列式为正.
    pub fn is_invertible(&self) -> bool {
        match self.ninputs() {
            1 => self.covars[0] > 0.0,
            _ => self.determinant() > 0.0 && Cholesky::new(self.covariance_matrix()).is_some(),
        }
    }

    /// 马氏距离平方 `(v - μ)ᵗ Σ⁻¹ (v - μ)`. 单通道退化为 `(v - μ)² / σ²`.
    ///
    /// 协方差无法分解时返回 `+inf`.
    #[inline]
    pub fn mahalanobis(&self, vals: &[f32]) -> f64 {
        mahalanobis(&self.means, &self.covars, vals)
    }

    /// 条件对数密度 `log p(v | label)`.
    ///
    /// 协方差无法分解时返回 [`BIG_AND_NEGATIVE`].
    #[inline]
    pub fn log_density(&self, vals: &[f32]) -> f64 {
        log_density(&self.means, &self.covars, vals)
    }

    /// 条件密度 `p(v | label)`, 恒非负.
    #[inline]
    pub fn density(&self, vals: &[f32]) -> f64 {
        self.log_density(vals).exp()
    }

    /// 方向 `dir` 上邻居为 `label` 的经验概率. 从未观察到时返回 `None`.
    #[inline]
    pub fn neighbor_prior(&self, dir: Direction, label: Label) -> Option<f32> {
        self.nbrs[dir.index()].get(label)
    }

    /// 累加一个训练样本的强度.
    pub(crate) fn accumulate_mean(&mut self, vals: &[f32]) {
        for (m, v) in self.means.iter_mut().zip(vals) {
            *m += *v;
        }
        self.ntraining += 1;
    }

    /// 累加一个训练样本的离差外积. 要求均值已经完成.
    pub(crate) fn accumulate_covariance(&mut self, vals: &[f32]) {
        let f = self.ninputs();
        for r in 0..f {
            let dr = vals[r] - self.means[r];
            for c in r..f {
                let dc = vals[c] - self.means[c];
                self.covars[covar_index(r, c, f)] += dr * dc;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{covar_index, Direction, Gc1d};

    fn gc(means: &[f32], covars: &[f32]) -> Gc1d {
        let mut g = Gc1d::new(means.len());
        g.means.copy_from_slice(means);
        g.covars.copy_from_slice(covars);
        g
    }

    #[test]
    fn test_covar_index_packing() {
        let expected = [(0, 0), (0, 1), (0, 2), (1, 1), (1, 2), (2, 2)];
        for (i, (r, c)) in expected.into_iter().enumerate() {
            assert_eq!(covar_index(r, c, 3), i);
        }
        assert_eq!(covar_index(1, 1, 2), 2);
    }

    #[test]
    fn test_direction_table() {
        for d in Direction::ALL {
            let (a, b, c) = d.offset();
            let (x, y, z) = d.opposite().offset();
            assert_eq!((a + x, b + y, c + z), (0, 0, 0));
            assert_eq!(Direction::ALL[d.index()], d);
        }
        assert_eq!(Direction::XNeg.step_clamped((0, 1, 1), (3, 3, 3)), (0, 1, 1));
        assert_eq!(Direction::ZPos.step((1, 1, 2), (3, 3, 3)), None);
        assert_eq!(Direction::YNeg.step((1, 1, 2), (3, 3, 3)), Some((1, 0, 2)));
    }

    #[test]
    fn test_scalar_mahalanobis_fast_path() {
        let g = gc(&[50.0], &[25.0]);
        assert!((g.mahalanobis(&[60.0]) - 4.0).abs() < 1e-12);
        assert_eq!(g.determinant(), 25.0);
    }

    #[test]
    fn test_diagonal_multichannel_matches_product() {
        let g2 = gc(&[100.0, 150.0], &[9.0, 0.0, 4.0]);
        let a = gc(&[100.0], &[9.0]);
        let b = gc(&[150.0], &[4.0]);
        let v = [103.0, 149.0];
        let joint = g2.log_density(&v);
        let split = a.log_density(&v[..1]) + b.log_density(&v[1..]);
        assert!((joint - split).abs() < 1e-9);
        assert!((g2.determinant() - 36.0).abs() < 1e-9);
        assert!(g2.density(&v) >= 0.0);
    }

    #[test]
    fn test_singular_covariance_is_not_invertible() {
        let g = gc(&[0.0, 0.0], &[1.0, 1.0, 1.0]);
        assert!(!g.is_invertible());
        // MIN_VAR 兜底后仍能计算
        assert!(g.log_density(&[0.0, 0.0]).is_finite());
    }
}
