//! 元数据缓存
//!
//! 调用方可以缓存远程 lstat 结果以减少往返；调度器在变更成功后使对应路径失效。
//! 计划器始终直接读取文件系统，不经过这里。

use crate::storage::FileStat;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::debug;

/// 变更成功后的缓存失效钩子
pub trait CacheInvalidator: Send + Sync {
    /// 使 `path` 及其全部后代失效
    fn invalidate(&self, path: &str);
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    stat: FileStat,
    cached_at: Instant,
}

/// 内存中的 lstat 缓存
#[derive(Debug)]
pub struct StatCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    /// 有效期，None 表示永不过期，直到失效或清空
    ttl: Option<Duration>,
}

impl Default for StatCache {
    fn default() -> Self {
        Self::new()
    }
}

impl StatCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: None,
        }
    }

    /// 设置有效期（0 表示永不过期）
    pub fn with_ttl(mut self, seconds: u64) -> Self {
        self.ttl = (seconds > 0).then(|| Duration::from_secs(seconds));
        self
    }

    pub fn get(&self, path: &str) -> Option<FileStat> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(Self::key(path))?;
        match self.ttl {
            Some(ttl) if entry.cached_at.elapsed() > ttl => None,
            _ => Some(entry.stat),
        }
    }

    pub fn insert(&self, path: &str, stat: FileStat) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                Self::key(path).to_string(),
                CacheEntry {
                    stat,
                    cached_at: Instant::now(),
                },
            );
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    fn key(path: &str) -> &str {
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            "/"
        } else {
            trimmed
        }
    }
}

impl CacheInvalidator for StatCache {
    fn invalidate(&self, path: &str) {
        let key = Self::key(path);
        let prefix = format!("{}/", key.trim_end_matches('/'));
        if let Ok(mut entries) = self.entries.write() {
            let before = entries.len();
            entries.retain(|p, _| p != key && !p.starts_with(&prefix));
            let removed = before - entries.len();
            if removed > 0 {
                debug!("缓存失效: {} ({} 项)", key, removed);
            }
        }
    }
}
