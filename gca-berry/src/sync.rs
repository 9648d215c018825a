//! 多线程共享的图谱与取消标志.
//!
//! 推断只需要读锁, 训练与重归一化需要写锁. 读写锁中毒时直接继续使用内部数据,
//! 因为图谱的每次修改都在单次调用内完成.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::gca::Gca;

/// 可在线程之间共享的图谱.
#[derive(Debug, Clone)]
pub struct SharedAtlas(Arc<RwLock<Gca>>);

impl SharedAtlas {
    /// 包装图谱.
    pub fn new(gca: Gca) -> Self {
        Self(Arc::new(RwLock::new(gca)))
    }

    /// 获取读锁. 可以同时存在多个.
    pub fn read(&self) -> RwLockReadGuard<'_, Gca> {
        self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    /// 获取写锁. 与所有读锁互斥.
    pub fn write(&self) -> RwLockWriteGuard<'_, Gca> {
        self.0.write().unwrap_or_else(|e| e.into_inner())
    }

    /// 如果这是最后一个引用, 取回图谱.
    pub fn try_unwrap(self) -> Result<Gca, Self> {
        Arc::try_unwrap(self.0)
            .map(|lock| lock.into_inner().unwrap_or_else(|e| e.into_inner()))
            .map_err(Self)
    }
}

impl From<Gca> for SharedAtlas {
    fn from(gca: Gca) -> Self {
        Self::new(gca)
    }
}

/// 协作式取消标志. 长时间运行的遍历在两次遍历之间检查它.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// 新建未取消的标志.
    pub fn new() -> Self {
        Self::default()
    }

    /// 请求取消. 所有克隆都会看到.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// 是否已请求取消?
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phantom::CubePhantom;

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        std::thread::scope(|s| {
            s.spawn(|| token.cancel());
        });
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_readers_see_writer_changes() {
        let case = CubePhantom::new((6, 6, 6), (1, 1, 1), (3, 3, 3), 1).build();
        let atlas = SharedAtlas::new(crate::phantom::train_atlas(&case, 2.0, 2.0).unwrap());
        let before = atlas.read().label_mean(1, 0).unwrap();

        let writer = atlas.clone();
        std::thread::scope(|s| {
            s.spawn(move || {
                writer.write().renormalize_labels(0, &[(1, 2.0 * before)]).unwrap();
            });
        });
        let after = atlas.read().label_mean(1, 0).unwrap();
        assert!((after - 2.0 * before).abs() < 1e-3 * before);
        assert!(atlas.try_unwrap().is_ok());
    }
}
