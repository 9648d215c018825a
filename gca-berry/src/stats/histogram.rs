//! 强度直方图与峰值检测, 用于重归一化.

/// 区间 `[min, max]` 上等宽分桶的加权直方图.
#[derive(Clone, Debug, PartialEq)]
pub struct Histogram {
    min: f64,
    bin_width: f64,
    bins: Vec<f64>,
}

impl Histogram {
    /// 创建 `nbins` 个桶的空直方图.
    ///
    /// 如果 `nbins` 为 0 或 `max < min`, 则程序 panic.
    pub fn new(min: f64, max: f64, nbins: usize) -> Self {
        assert!(nbins > 0, "直方图至少需要一个桶");
        assert!(max >= min, "直方图上界不能小于下界");
        let span = (max - min).max(f64::EPSILON);
        Self {
            min,
            bin_width: span / nbins as f64,
            bins: vec![0.0; nbins],
        }
    }

    /// 桶数.
    #[inline]
    pub fn len(&self) -> usize {
        self.bins.len()
    }

    /// 是否没有桶? 总是 `false`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// 各桶计数.
    #[inline]
    pub fn bins(&self) -> &[f64] {
        &self.bins
    }

    /// 第 `i` 个桶中心的强度.
    #[inline]
    pub fn bin_center(&self, i: usize) -> f64 {
        self.min + (i as f64 + 0.5) * self.bin_width
    }

    /// 总权重.
    #[inline]
    pub fn total(&self) -> f64 {
        self.bins.iter().sum()
    }

    /// 累加一个样本. 范围外的值计入两端的桶, 非有限值被忽略.
    pub fn add(&mut self, v: f64, weight: f64) {
        if !v.is_finite() {
            return;
        }
        let idx = ((v - self.min) / self.bin_width).floor().max(0.0) as usize;
        let idx = idx.min(self.bins.len() - 1);
        self.bins[idx] += weight.max(0.0);
    }

    /// 以标准差 `sigma` (桶) 的截断高斯核平滑. 边界按镜像处理.
    pub fn smooth(&mut self, sigma: f64) {
        if sigma <= 0.0 || self.bins.len() < 2 {
            return;
        }
        let half = (3.0 * sigma).ceil() as isize;
        let kernel: Vec<f64> = (-half..=half)
            .map(|k| (-(k * k) as f64 / (2.0 * sigma * sigma)).exp())
            .collect();
        let norm: f64 = kernel.iter().sum();

        let n = self.bins.len() as isize;
        let reflect = |i: isize| -> usize {
            let mut i = i;
            while i < 0 || i >= n {
                i = if i < 0 { -i - 1 } else { 2 * n - i - 1 };
            }
            i as usize
        };
        let smoothed = (0..n)
            .map(|i| {
                kernel
                    .iter()
                    .zip(-half..=half)
                    .map(|(w, k)| w * self.bins[reflect(i + k)])
                    .sum::<f64>()
                    / norm
            })
            .collect();
        self.bins = smoothed;
    }

    /// 所有高于 `threshold * 最高桶` 的局部极大值桶下标, 升序.
    ///
    /// 平台取其第一个桶.
    pub fn peaks(&self, threshold: f64) -> Vec<usize> {
        let max = self.bins.iter().copied().fold(0.0, f64::max);
        if max <= 0.0 {
            return Vec::new();
        }
        let floor = threshold * max;
        let n = self.bins.len();
        (0..n)
            .filter(|&i| {
                let v = self.bins[i];
                let left = if i == 0 { f64::NEG_INFINITY } else { self.bins[i - 1] };
                let right = if i + 1 == n { f64::NEG_INFINITY } else { self.bins[i + 1] };
                v > 0.0 && v >= floor && v > left && v >= right
            })
            .collect()
    }

    /// 最左侧峰的强度.
    #[inline]
    pub fn first_peak(&self, threshold: f64) -> Option<f64> {
        self.peaks(threshold).first().map(|&i| self.bin_center(i))
    }

    /// 最右侧峰的强度.
    #[inline]
    pub fn last_peak(&self, threshold: f64) -> Option<f64> {
        self.peaks(threshold).last().map(|&i| self.bin_center(i))
    }

    /// 最高峰的强度. 多个桶同高时取最左侧.
    pub fn highest_peak(&self) -> Option<f64> {
        let mut best: Option<(usize, f64)> = None;
        for (i, &v) in self.bins.iter().enumerate() {
            if v > 0.0 && best.map_or(true, |(_, b)| v > b) {
                best = Some((i, v));
            }
        }
        best.map(|(i, _)| self.bin_center(i))
    }
}

#[cfg(test)]
mod tests {
    use super::Histogram;

    #[test]
    fn test_add_clamps_to_edges() {
        let mut h = Histogram::new(0.0, 10.0, 5);
        h.add(-3.0, 1.0);
        h.add(10.0, 1.0);
        h.add(4.5, 2.0);
        h.add(f64::NAN, 1.0);
        assert_eq!(h.bins(), &[1.0, 0.0, 2.0, 0.0, 1.0]);
        assert_eq!(h.bin_center(2), 5.0);
        assert_eq!(h.total(), 4.0);
    }

    #[test]
    fn test_smooth_preserves_mass() {
        let mut h = Histogram::new(0.0, 20.0, 20);
        h.add(10.2, 5.0);
        h.smooth(1.5);
        assert!((h.total() - 5.0).abs() < 1e-9);
        assert_eq!(h.highest_peak(), Some(10.5));
    }

    #[test]
    fn test_peak_selection() {
        let mut h = Histogram::new(0.0, 100.0, 100);
        for _ in 0..10 {
            h.add(20.5, 1.0);
        }
        for _ in 0..30 {
            h.add(50.5, 1.0);
        }
        for _ in 0..5 {
            h.add(80.5, 1.0);
        }
        h.add(90.5, 0.1);
        assert_eq!(h.first_peak(0.1), Some(20.5));
        assert_eq!(h.last_peak(0.1), Some(80.5));
        assert_eq!(h.highest_peak(), Some(50.5));
        assert_eq!(h.peaks(0.0).len(), 4);
    }
}
