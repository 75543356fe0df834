//! # 请求合并 / 在途登记表
//!
//! ## 设计思路
//!
//! 同一缓存键在任意时刻最多只有一个在途操作。滚动时多个单元格、预览与网格
//! 可能同时请求同一张图，后来者只登记为等待者，共享同一次解码结果。
//!
//! ```text
//! 请求 A ─┐
//!         │                               调度器
//! 请求 B ─┼──► RequestCoalescer ──────► 解码任务（唯一）
//!         │        │                        │
//! 请求 C ─┘        ▼                        ▼
//!            [A、B、C 按登记顺序 ◄──────── complete(key, outcome)
//!             收到同一结果]
//! ```
//!
//! ## 实现思路
//!
//! - 单把 `std::sync::Mutex` 保护 `key → InFlight` 与 `request_id → key` 两张表，
//!   “是否已有在途操作”的检查与登记在同一临界区内完成。
//! - `complete` 在持锁状态下移除条目并按顺序通知全部等待者，
//!   之后到达的请求不可能挂到已过期的条目上。
//! - 取消：被取消的等待者立即收到 `Cancelled`；最后一个等待者离开时取消条目的
//!   `CancellationToken`，但条目保留，直到操作方调用 `abandon` 或 `complete`。
//! - `abandon` 原子地判断是否有人在取消后重新加入：有则返回新的令牌让操作继续。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::source::{CacheKey, RequestId, ThumbnailOutcome};

struct InFlight {
    waiters: Vec<(RequestId, oneshot::Sender<ThumbnailOutcome>)>,
    token: CancellationToken,
}

#[derive(Default)]
struct Registry {
    in_flight: HashMap<CacheKey, InFlight>,
    index: HashMap<RequestId, CacheKey>,
}

/// 登记结果。
#[derive(Debug)]
pub(crate) enum Registration {
    /// 新建了在途操作，调用方负责调度实际工作，并最终调用 `complete`/`abandon`。
    New(CancellationToken),
    /// 挂到了已有操作上，只需等待结果。
    Joined,
}

impl Registration {
    #[cfg(test)]
    pub(crate) fn is_new_operation(&self) -> bool {
        matches!(self, Self::New(_))
    }
}

/// `cancel` 的结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelOutcome {
    /// 请求不在任何在途操作上（已完成或从未登记）。
    NotFound,
    /// 等待者已移除，操作仍有其他等待者。
    Detached,
    /// 最后一个等待者已移除，操作的令牌已取消。
    LastWaiter,
}

/// 操作方放弃条目时的裁决。
#[derive(Debug)]
pub(crate) enum Abandon {
    /// 条目已移除，不再有等待者。
    Removed,
    /// 取消后有新的等待者加入，操作必须继续并使用这个令牌。
    Revived(CancellationToken),
}

/// 合并统计。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoalescerStats {
    pub total_requests: u64,
    pub coalesced_requests: u64,
    pub new_requests: u64,
    pub in_flight: usize,
}

impl CoalescerStats {
    /// 合并比例（0.0 ~ 1.0）。
    pub fn coalescing_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.coalesced_requests as f64 / self.total_requests as f64
        }
    }
}

/// 按缓存键合并并发请求。
#[derive(Default)]
pub(crate) struct RequestCoalescer {
    registry: Mutex<Registry>,
    total_requests: AtomicU64,
    coalesced_requests: AtomicU64,
    new_requests: AtomicU64,
}

impl RequestCoalescer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 登记请求：已有在途操作则加入，否则新建。
    ///
    /// 返回的接收端恰好收到一次结果（完成、失败或取消）。
    pub(crate) fn begin_or_join(
        &self,
        key: &CacheKey,
        request_id: RequestId,
    ) -> (Registration, oneshot::Receiver<ThumbnailOutcome>) {
        let (tx, rx) = oneshot::channel();
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let mut registry = match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        registry.index.insert(request_id, key.clone());

        if let Some(entry) = registry.in_flight.get_mut(key) {
            // 全部等待者都取消过：换一个新令牌，避免新等待者继承旧的取消信号
            if entry.token.is_cancelled() {
                entry.token = CancellationToken::new();
            }
            entry.waiters.push((request_id, tx));
            self.coalesced_requests.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "🔗 合并请求 {} - key: {} 等待者: {}",
                request_id,
                key,
                entry.waiters.len()
            );
            return (Registration::Joined, rx);
        }

        let token = CancellationToken::new();
        registry.in_flight.insert(
            key.clone(),
            InFlight {
                waiters: vec![(request_id, tx)],
                token: token.clone(),
            },
        );
        self.new_requests.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "🆕 新建在途操作 {} - key: {} 在途: {}",
            request_id,
            key,
            registry.in_flight.len()
        );
        (Registration::New(token), rx)
    }

    /// 移除条目并按登记顺序通知全部等待者，返回通知数量。
    pub(crate) fn complete(&self, key: &CacheKey, outcome: ThumbnailOutcome) -> usize {
        let mut registry = match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let Some(entry) = registry.in_flight.remove(key) else {
            return 0;
        };

        let count = entry.waiters.len();
        for (request_id, sender) in entry.waiters {
            registry.index.remove(&request_id);
            // 接收端被丢弃说明调用方已不关心结果
            let _ = sender.send(outcome.clone());
        }

        if count > 1 {
            log::debug!("📣 结果已广播给 {} 个等待者 - key: {}", count, key);
        }
        count
    }

    /// 取消单个等待者。
    pub(crate) fn cancel(&self, request_id: RequestId) -> CancelOutcome {
        let mut registry = match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let Some(key) = registry.index.remove(&request_id) else {
            return CancelOutcome::NotFound;
        };
        let Some(entry) = registry.in_flight.get_mut(&key) else {
            return CancelOutcome::NotFound;
        };
        let Some(position) = entry.waiters.iter().position(|(id, _)| *id == request_id) else {
            return CancelOutcome::NotFound;
        };

        let (_, sender) = entry.waiters.remove(position);
        let _ = sender.send(ThumbnailOutcome::Cancelled);

        if entry.waiters.is_empty() {
            entry.token.cancel();
            log::debug!("🛑 最后一个等待者 {} 已取消，通知在途操作停止 - key: {}", request_id, key);
            CancelOutcome::LastWaiter
        } else {
            log::debug!(
                "↩️ 等待者 {} 已取消，剩余 {} 个 - key: {}",
                request_id,
                entry.waiters.len(),
                key
            );
            CancelOutcome::Detached
        }
    }

    /// 操作方因取消而停止时调用。
    ///
    /// 只有在条目已无等待者时才会移除；否则返回当前令牌，操作必须继续。
    pub(crate) fn abandon(&self, key: &CacheKey) -> Abandon {
        let mut registry = match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        match registry.in_flight.get(key) {
            Some(entry) if !entry.waiters.is_empty() => {
                log::debug!("🔁 在途操作被重新加入，继续执行 - key: {}", key);
                Abandon::Revived(entry.token.clone())
            }
            Some(_) => {
                registry.in_flight.remove(key);
                Abandon::Removed
            }
            None => Abandon::Removed,
        }
    }

    /// 某个键当前的令牌（若仍在途）。
    pub(crate) fn current_token(&self, key: &CacheKey) -> Option<CancellationToken> {
        self.registry
            .lock()
            .ok()
            .and_then(|registry| registry.in_flight.get(key).map(|entry| entry.token.clone()))
    }

    #[cfg(test)]
    pub(crate) fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.registry
            .lock()
            .map(|registry| registry.in_flight.contains_key(key))
            .unwrap_or(false)
    }

    pub(crate) fn in_flight_count(&self) -> usize {
        self.registry
            .lock()
            .map(|registry| registry.in_flight.len())
            .unwrap_or(0)
    }

    pub(crate) fn stats(&self) -> CoalescerStats {
        CoalescerStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            coalesced_requests: self.coalesced_requests.load(Ordering::Relaxed),
            new_requests: self.new_requests.load(Ordering::Relaxed),
            in_flight: self.in_flight_count(),
        }
    }
}
