//! node / prior 网格单元.

use super::Gc1d;
use crate::Label;

/// 单元标签表的扩容步长.
const GROW_BY: usize = 2;

/// node 网格单元. 标签按插入顺序保存, 不排序.
#[derive(Clone, Debug, Default)]
pub struct GcaNode {
    labels: Vec<Label>,
    gcs: Vec<Gc1d>,
    max_labels: usize,

    /// 训练中访问该单元的体素数.
    pub total_training: u32,
}

impl GcaNode {
    /// 由已知条目直接创建 (读取文件时使用).
    pub fn from_entries(labels: Vec<Label>, gcs: Vec<Gc1d>, total_training: u32) -> Self {
        assert_eq!(labels.len(), gcs.len());
        Self {
            max_labels: labels.len(),
            labels,
            gcs,
            total_training,
        }
    }

    /// 标签个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// 是否为空?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// 当前容量.
    #[inline]
    pub fn max_labels(&self) -> usize {
        self.max_labels
    }

    /// 标签表.
    #[inline]
    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// 分类器表, 与 [`Self::labels`] 一一对应.
    #[inline]
    pub fn gcs(&self) -> &[Gc1d] {
        &self.gcs
    }

    /// 可变分类器表.
    #[inline]
    pub fn gcs_mut(&mut self) -> &mut [Gc1d] {
        &mut self.gcs
    }

    /// 迭代 `(label, gc)`.
    #[inline]
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (Label, &Gc1d)> {
        self.labels.iter().copied().zip(self.gcs.iter())
    }

    /// 迭代 `(label, &mut gc)`.
    #[inline]
    pub fn iter_mut(&mut self) -> impl ExactSizeIterator<Item = (Label, &mut Gc1d)> {
        self.labels.iter().copied().zip(self.gcs.iter_mut())
    }

    /// 线性查找标签位置.
    #[inline]
    pub fn find(&self, label: Label) -> Option<usize> {
        self.labels.iter().position(|&l| l == label)
    }

    /// 查找标签对应的分类器.
    #[inline]
    pub fn gc(&self, label: Label) -> Option<&Gc1d> {
        self.find(label).map(|i| &self.gcs[i])
    }

    /// 查找标签对应的可变分类器.
    #[inline]
    pub fn gc_mut(&mut self, label: Label) -> Option<&mut Gc1d> {
        self.find(label).map(move |i| &mut self.gcs[i])
    }

    /// 获取标签的位置. 不存在时追加一个空分类器, 容量不足时扩容 2 个.
    pub fn find_or_insert(&mut self, label: Label, ninputs: usize) -> usize {
        if let Some(i) = self.find(label) {
            return i;
        }
        if self.labels.len() >= self.max_labels {
            self.max_labels += GROW_BY;
            self.labels.reserve_exact(GROW_BY);
            self.gcs.reserve_exact(GROW_BY);
        }
        self.labels.push(label);
        self.gcs.push(Gc1d::new(ninputs));
        self.labels.len() - 1
    }
}

/// prior 网格单元: `(标签, 先验概率)` 表.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GcaPrior {
    labels: Vec<Label>,
    priors: Vec<f32>,
    max_labels: usize,

    /// 训练中访问该单元的体素数.
    pub total_training: u32,
}

impl GcaPrior {
    /// 由已知条目直接创建.
    pub fn from_entries(labels: Vec<Label>, priors: Vec<f32>, total_training: u32) -> Self {
        assert_eq!(labels.len(), priors.len());
        Self {
            max_labels: labels.len(),
            labels,
            priors,
            total_training,
        }
    }

    /// 标签个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// 是否为空?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// 标签表.
    #[inline]
    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// 先验表.
    #[inline]
    pub fn priors(&self) -> &[f32] {
        &self.priors
    }

    /// 可变先验表.
    #[inline]
    pub fn priors_mut(&mut self) -> &mut [f32] {
        &mut self.priors
    }

    /// 迭代 `(label, prior)`.
    #[inline]
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (Label, f32)> + '_ {
        self.labels.iter().copied().zip(self.priors.iter().copied())
    }

    /// 标签的先验概率. 不存在时为 0.
    #[inline]
    pub fn prior(&self, label: Label) -> f32 {
        self.labels
            .iter()
            .position(|&l| l == label)
            .map_or(0.0, |i| self.priors[i])
    }

    /// 训练计数加一.
    pub fn add(&mut self, label: Label) {
        self.total_training += 1;
        match self.labels.iter().position(|&l| l == label) {
            Some(i) => self.priors[i] += 1.0,
            None => {
                if self.labels.len() >= self.max_labels {
                    self.max_labels += GROW_BY;
                    self.labels.reserve_exact(GROW_BY);
                    self.priors.reserve_exact(GROW_BY);
                }
                self.labels.push(label);
                self.priors.push(1.0);
            }
        }
    }

    /// 计数 -> 概率: `priors[n] /= total_training`.
    pub fn normalize(&mut self) {
        if self.total_training > 0 {
            let total = self.total_training as f32;
            self.priors.iter_mut().for_each(|p| *p /= total);
        }
    }

    /// 先验最大的标签. 先验相同时取标签号最小者.
    pub fn max_prior(&self) -> Option<(Label, f32)> {
        self.iter().fold(None, |best, (l, p)| match best {
            Some((bl, bp)) if bp > p || (bp == p && bl < l) => Some((bl, bp)),
            _ => Some((l, p)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{GcaNode, GcaPrior};

    #[test]
    fn test_node_grows_by_two() {
        let mut node = GcaNode::default();
        assert_eq!(node.max_labels(), 0);
        node.find_or_insert(3, 1);
        assert_eq!(node.max_labels(), 2);
        node.find_or_insert(5, 1);
        node.find_or_insert(3, 1);
        assert_eq!((node.len(), node.max_labels()), (2, 2));
        node.find_or_insert(1, 1);
        assert_eq!((node.len(), node.max_labels()), (3, 4));
        // 插入顺序
        assert_eq!(node.labels(), &[3, 5, 1]);
    }

    #[test]
    fn test_prior_normalizes_to_one() {
        let mut p = GcaPrior::default();
        for l in [1, 1, 2, 4, 1, 2] {
            p.add(l);
        }
        p.normalize();
        let sum: f32 = p.priors().iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert_eq!(p.max_prior(), Some((1, 0.5)));
        assert_eq!(p.prior(7), 0.0);
    }

    #[test]
    fn test_max_prior_tie_prefers_lowest_label() {
        let p = GcaPrior::from_entries(vec![9, 4, 6], vec![0.4, 0.4, 0.2], 10);
        assert_eq!(p.max_prior(), Some((4, 0.4)));
    }
}
