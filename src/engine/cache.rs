// ==========================================
// 医院药品数据导入质控系统 - 缓存后端
// ==========================================
// 职责: 带过期时间的键值存储（进度快照/会话/任务锁共用）
// 生命周期: connect → 使用 → disconnect；断开期间所有操作返回 Unavailable
// ==========================================

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;

/// 缓存错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("缓存服务不可用")]
    Unavailable,

    #[error("缓存数据序列化失败: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

// ==========================================
// CacheBackend Trait
// ==========================================
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn connect(&self) -> CacheResult<()>;
    async fn disconnect(&self) -> CacheResult<()>;
    fn is_connected(&self) -> bool;

    /// 读取（过期视为不存在）
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// 写入并重置过期时间
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;

    /// 不存在（或已过期）时写入，返回是否写入
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool>;

    /// 刷新过期时间，返回键是否存在
    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool>;

    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// 仅当当前值等于 expected 时删除（持有者释放锁）
    async fn delete_if_eq(&self, key: &str, expected: &str) -> CacheResult<bool>;
}

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at <= Instant::now()
    }
}

// 每写入这么多次清扫一次过期条目
const SWEEP_EVERY: usize = 128;

// ==========================================
// InMemoryCache - 进程内实现
// ==========================================
#[derive(Clone)]
pub struct InMemoryCache {
    store: Arc<RwLock<HashMap<String, Entry>>>,
    connected: Arc<AtomicBool>,
    writes: Arc<AtomicUsize>,
}

impl InMemoryCache {
    /// 新建（未连接）
    pub fn new() -> Self {
        Self {
            store: Arc::new(RwLock::new(HashMap::new())),
            connected: Arc::new(AtomicBool::new(false)),
            writes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 删除全部过期条目，返回删除数
    pub async fn purge_expired(&self) -> usize {
        let mut store = self.store.write().await;
        let before = store.len();
        store.retain(|_, entry| !entry.is_expired());
        before - store.len()
    }

    /// 当前条目数（含尚未清扫的过期条目）
    pub async fn entry_count(&self) -> usize {
        self.store.read().await.len()
    }

    fn insert(&self, store: &mut HashMap<String, Entry>, key: &str, value: &str, ttl: Duration) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            store.retain(|_, entry| !entry.is_expired());
        }
        store.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn ensure_connected(&self) -> CacheResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Unavailable)
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn connect(&self) -> CacheResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> CacheResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.ensure_connected()?;
        let store = self.store.read().await;
        match store.get(key) {
            Some(entry) if !entry.is_expired() => Ok(Some(entry.value.clone())),
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        self.ensure_connected()?;
        let mut store = self.store.write().await;
        self.insert(&mut store, key, value, ttl);
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool> {
        self.ensure_connected()?;
        let mut store = self.store.write().await;
        if store.get(key).map_or(true, |e| e.is_expired()) {
            self.insert(&mut store, key, value, ttl);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        self.ensure_connected()?;
        let mut store = self.store.write().await;
        if let Some(entry) = store.get_mut(key) {
            if !entry.is_expired() {
                entry.expires_at = Instant::now() + ttl;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        self.ensure_connected()?;
        let mut store = self.store.write().await;
        Ok(store.remove(key).map_or(false, |e| !e.is_expired()))
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> CacheResult<bool> {
        self.ensure_connected()?;
        let mut store = self.store.write().await;
        match store.get(key) {
            Some(entry) if !entry.is_expired() && entry.value == expected => {
                store.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected() -> InMemoryCache {
        let cache = InMemoryCache::new();
        cache.connect().await.unwrap();
        cache
    }

    #[tokio::test]
    async fn test_set_get_and_expiry() {
        let cache = connected().await;
        cache.set("k", "v", Duration::from_millis(50)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_nx_and_delete_if_eq() {
        let cache = connected().await;
        assert!(cache.set_nx("lock", "a", Duration::from_secs(5)).await.unwrap());
        assert!(!cache.set_nx("lock", "b", Duration::from_secs(5)).await.unwrap());
        assert!(!cache.delete_if_eq("lock", "b").await.unwrap());
        assert!(cache.delete_if_eq("lock", "a").await.unwrap());
        assert!(cache.set_nx("lock", "b", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_entries_are_swept_on_write() {
        let cache = connected().await;
        for i in 0..10 {
            cache
                .set(&format!("import:progress:{}", i), "{}", Duration::from_millis(20))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.entry_count().await, 10);

        for _ in 0..SWEEP_EVERY {
            cache.set("live", "v", Duration::from_secs(5)).await.unwrap();
        }
        assert_eq!(cache.entry_count().await, 1);
        assert_eq!(cache.get("live").await.unwrap(), Some("v".to_string()));
        assert_eq!(cache.purge_expired().await, 0);
    }

    #[tokio::test]
    async fn test_disconnected_is_unavailable() {
        let cache = InMemoryCache::new();
        assert_eq!(cache.get("k").await, Err(CacheError::Unavailable));

        cache.connect().await.unwrap();
        cache.set("k", "v", Duration::from_secs(5)).await.unwrap();
        cache.disconnect().await.unwrap();
        assert_eq!(
            cache.set("k", "v", Duration::from_secs(5)).await,
            Err(CacheError::Unavailable)
        );
        assert!(!cache.is_connected());
    }
}
