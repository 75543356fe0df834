//! # 内存缓存
//!
//! ## 设计思路
//!
//! 进程内的解码位图缓存，按“条目数 + 可选总开销”双预算做 LRU 淘汰。
//! 只负责存取，不做任何 I/O 与解码。
//!
//! ## 实现思路
//!
//! - `lru::LruCache`（无界模式）放在 `Mutex` 内，预算由本模块自行执行，
//!   这样条目数与总开销两个约束可以在同一个淘汰循环里满足。
//! - `get` 会提升条目的 LRU 位置，因此同样需要加锁。
//! - 锁中毒时读操作按未命中处理、写操作直接放弃，不向调用方传播 panic。

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use super::source::{CacheKey, DecodedImage};

struct MemoryEntry {
    image: Arc<DecodedImage>,
    cost: usize,
}

struct MemoryState {
    entries: LruCache<CacheKey, MemoryEntry>,
    total_cost: usize,
}

/// 线程安全的 LRU 位图缓存。
pub struct MemoryCache {
    state: Mutex<MemoryState>,
    max_entries: NonZeroUsize,
    max_cost: Option<usize>,
}

impl MemoryCache {
    /// # 示例
    /// ```rust
    /// use std::num::NonZeroUsize;
    /// use clip_thumbnails::thumbnail::MemoryCache;
    ///
    /// let cache = MemoryCache::new(NonZeroUsize::new(64).unwrap(), Some(32 * 1024 * 1024));
    /// assert!(cache.is_empty());
    /// ```
    pub fn new(max_entries: NonZeroUsize, max_cost: Option<usize>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                entries: LruCache::unbounded(),
                total_cost: 0,
            }),
            max_entries,
            max_cost,
        }
    }

    /// 查询并提升 LRU 位置。
    pub fn get(&self, key: &CacheKey) -> Option<Arc<DecodedImage>> {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(_) => return None,
        };
        state.entries.get(key).map(|entry| Arc::clone(&entry.image))
    }

    /// 写入条目，超出预算时淘汰最久未使用的条目。
    ///
    /// 单个条目的开销超过总开销预算时不会被写入。
    pub fn set(&self, key: CacheKey, image: Arc<DecodedImage>, cost: usize) {
        if let Some(max_cost) = self.max_cost {
            if cost > max_cost {
                log::debug!("🚫 缩略图开销 {} 超过内存缓存预算 {}，跳过缓存 - key: {}", cost, max_cost, key);
                return;
            }
        }

        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };

        if let Some(previous) = state.entries.put(key, MemoryEntry { image, cost }) {
            state.total_cost = state.total_cost.saturating_sub(previous.cost);
        }
        state.total_cost = state.total_cost.saturating_add(cost);

        let mut evicted = 0usize;
        while state.entries.len() > self.max_entries.get()
            || self.max_cost.is_some_and(|max| state.total_cost > max)
        {
            let Some((_, entry)) = state.entries.pop_lru() else {
                break;
            };
            state.total_cost = state.total_cost.saturating_sub(entry.cost);
            evicted += 1;
        }

        if evicted > 0 {
            log::debug!(
                "♻️ 内存缓存淘汰 {} 个条目（剩余 {} 个，{} 字节）",
                evicted,
                state.entries.len(),
                state.total_cost
            );
        }
    }

    /// 以图片自身的 RGBA 字节数作为开销写入。
    pub fn insert(&self, key: CacheKey, image: Arc<DecodedImage>) {
        let cost = image.cost();
        self.set(key, image, cost);
    }

    pub fn remove(&self, key: &CacheKey) -> Option<Arc<DecodedImage>> {
        let mut state = self.state.lock().ok()?;
        let entry = state.entries.pop(key)?;
        state.total_cost = state.total_cost.saturating_sub(entry.cost);
        Some(entry.image)
    }

    pub fn clear(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.entries.clear();
            state.total_cost = 0;
        }
    }

    /// 不影响 LRU 顺序的存在性检查。
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state
            .lock()
            .map(|state| state.entries.contains(key))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|state| state.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_cost(&self) -> usize {
        self.state.lock().map(|state| state.total_cost).unwrap_or(0)
    }
}
