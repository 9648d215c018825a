//! 策略运行统计.

use std::time::{Duration, Instant};

/// 可暂停的累计计时器.
#[derive(Clone, Debug)]
struct AccTimer {
    consumed: Duration,
    since: Instant,
}

impl AccTimer {
    /// 初始化计时器. 初始化时视为已经开始计时.
    #[inline]
    fn new() -> Self {
        Self {
            consumed: Duration::ZERO,
            since: Instant::now(),
        }
    }

    /// 开始计时.
    #[inline]
    fn start(&mut self) {
        self.since = Instant::now();
    }

    /// 结束计时, 并将这一区间的时间累加. 返回本轮计时时长.
    ///
    /// 上一次调用必须是 `self.start()`, 否则计算时间值无意义.
    #[inline]
    fn elapsed(&mut self) -> Duration {
        let d = self.since.elapsed();
        self.consumed += d;
        d
    }

    /// 累计时间 (微秒).
    #[inline]
    fn total_us(&self) -> u64 {
        self.consumed.as_micros() as u64
    }
}

/// 一种策略在整个测试集上的统计.
#[derive(Clone, Debug)]
pub struct Profile {
    /// 测试体模个数.
    cases: u64,

    /// 参与比较的体素总数.
    voxels: u64,

    /// 与真值不一致的体素总数.
    errors: u64,

    /// ICM 遍历总次数.
    passes: u64,

    /// 未收敛 (达到最大遍历次数) 的体模个数.
    unconverged: u64,

    /// 分割本身花费的时间.
    work_time: AccTimer,

    /// 整个任务花费的时间 (包括构建上下文, 扰动初值等).
    real_time: AccTimer,

    /// 最耗时的一次分割.
    most: Option<Duration>,
}

impl Profile {
    /// 初始化.
    #[inline]
    pub fn new() -> Self {
        Self {
            cases: 0,
            voxels: 0,
            errors: 0,
            passes: 0,
            unconverged: 0,
            work_time: AccTimer::new(),
            real_time: AccTimer::new(),
            most: None,
        }
    }

    /// 开始一次分割计时.
    #[inline]
    pub fn work_start(&mut self) {
        self.work_time.start();
    }

    /// 结束一次分割计时.
    #[inline]
    pub fn work_elapsed(&mut self) {
        let d = self.work_time.elapsed();
        self.most = Some(self.most.map_or(d, |m| m.max(d)));
    }

    /// 记录一个体模的结果.
    #[inline]
    pub fn count_case(&mut self, voxels: usize, errors: usize, passes: usize, converged: bool) {
        self.cases += 1;
        self.voxels += voxels as u64;
        self.errors += errors as u64;
        self.passes += passes as u64;
        if !converged {
            self.unconverged += 1;
        }
    }

    /// 结束全部计时.
    #[inline]
    pub fn finish(mut self) -> Self {
        self.real_time.elapsed();
        self
    }

    /// 体模个数.
    #[inline]
    pub fn get_cases(&self) -> u64 {
        self.cases
    }

    /// 错误体素总数.
    #[inline]
    pub fn get_errors(&self) -> u64 {
        self.errors
    }

    /// 未收敛的体模个数.
    #[inline]
    pub fn get_unconverged(&self) -> u64 {
        self.unconverged
    }

    /// 错误率.
    #[inline]
    pub fn get_error_rate(&self) -> Option<f64> {
        match self.voxels {
            0 => None,
            v => Some(self.errors as f64 / v as f64),
        }
    }

    /// 每个体模的平均 ICM 遍历次数.
    #[inline]
    pub fn get_avg_passes(&self) -> Option<f64> {
        match self.cases {
            0 => None,
            c => Some(self.passes as f64 / c as f64),
        }
    }

    /// 分割总时间 (微秒).
    #[inline]
    pub fn get_work_time_us(&self) -> u64 {
        self.work_time.total_us()
    }

    /// 每个体模的平均分割时间 (微秒).
    #[inline]
    pub fn get_avg_work_time_us(&self) -> Option<f64> {
        match self.cases {
            0 => None,
            c => Some(self.get_work_time_us() as f64 / c as f64),
        }
    }

    /// 任务总时间 (微秒).
    #[inline]
    pub fn get_real_time_us(&self) -> u64 {
        self.real_time.total_us()
    }

    /// 最耗时的一次分割. 没有任务时为 `None`.
    #[inline]
    pub fn get_most_time_consuming(&self) -> Option<Duration> {
        self.most
    }
}

impl Default for Profile {
    fn default() -> Self {
        Self::new()
    }
}
