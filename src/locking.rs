//! 内存键锁：按上传会话 ID 串行化元数据的读-改-写。

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time;

type LockMap = HashMap<String, Arc<Mutex<()>>>;

/// 按上传 ID 管理异步互斥锁；条目在最后一个持有者或等待者离开时移除。
#[derive(Debug, Default)]
pub struct LockManager {
    locks: Arc<StdMutex<LockMap>>,
}

/// 持有中的键锁，释放时清理空闲条目。
#[derive(Debug)]
pub struct KeyGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: String,
    locks: Arc<StdMutex<LockMap>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        release_idle(&self.locks, &self.key);
    }
}

/// 仅剩映射表自身引用时删除条目。在表锁内判断，与新的获取者互斥。
fn release_idle(locks: &StdMutex<LockMap>, key: &str) {
    let mut locks = locks.lock().unwrap_or_else(PoisonError::into_inner);
    if locks
        .get(key)
        .is_some_and(|lock| Arc::strong_count(lock) == 1)
    {
        locks.remove(key);
    }
}

impl LockManager {
    /// 创建新的锁管理器实例。
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn wrap(&self, key: &str, guard: Option<OwnedMutexGuard<()>>) -> Option<KeyGuard> {
        match guard {
            Some(guard) => Some(KeyGuard {
                guard: Some(guard),
                key: key.to_string(),
                locks: Arc::clone(&self.locks),
            }),
            None => {
                release_idle(&self.locks, key);
                None
            }
        }
    }

    /// 在给定超时时间内获取键锁，超时返回 None。
    pub async fn lock_with_timeout(&self, key: &str, timeout: Duration) -> Option<KeyGuard> {
        let lock = self.entry(key);
        let guard = time::timeout(timeout, lock.lock_owned()).await.ok();
        self.wrap(key, guard)
    }

    /// 立即尝试获取键锁，被占用时返回 None。
    pub fn try_lock(&self, key: &str) -> Option<KeyGuard> {
        let lock = self.entry(key);
        let guard = lock.try_lock_owned().ok();
        self.wrap(key, guard)
    }

    /// 当前跟踪的键数量。
    #[cfg(test)]
    pub fn tracked(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
