//! # 解码调度器
//!
//! ## 设计思路
//!
//! 解码与降采样是本子系统里唯一昂贵的 CPU 工作，所有调用方共享固定数量的
//! 执行槽位，快速滚动时峰值内存与 CPU 占用因此有上界。
//!
//! ## 实现思路
//!
//! - `Semaphore` 限制同时运行的任务数，任务体放到 `spawn_blocking` 中执行，
//!   不阻塞异步 worker。
//! - 每个任务携带一个 `CancellationToken`：排队期间令牌触发则直接出队并回调
//!   `cancelled()`；运行期间由任务自己在检查点观察令牌（解码本身不可抢占）。
//! - 任务不会被静默丢弃：要么 `run`，要么 `cancelled`，二者恰好其一。
//!   任务 panic 会被 join 捕获并记录日志，槽位照常归还。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::ThumbnailError;

/// 可调度的解码任务。
pub trait DecodeJob: Send + 'static {
    /// 在阻塞线程上执行；`token` 供任务在检查点观察取消。
    fn run(self: Box<Self>, token: &CancellationToken);

    /// 任务在开始前被取消。
    fn cancelled(self: Box<Self>);
}

/// 已提交任务的句柄。
pub struct JobHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl JobHandle {
    /// 请求取消：排队中的任务会出队，运行中的任务在下一个检查点停止。
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// 等待任务结束（运行完成或被取消）。
    pub async fn join(self) {
        let _ = self.join.await;
    }
}

/// 调度器运行状态快照。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub max_concurrent: usize,
    pub queued: usize,
    pub running: usize,
    pub peak_running: usize,
}

struct SchedulerState {
    semaphore: Arc<Semaphore>,
    max_concurrent: AtomicUsize,
    queued: AtomicUsize,
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

impl SchedulerState {
    fn update_peak(&self, current: usize) {
        let mut peak = self.peak_running.load(Ordering::Relaxed);
        while current > peak {
            match self.peak_running.compare_exchange_weak(
                peak,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => peak = observed,
            }
        }
    }
}

/// 有界并发的解码任务池。
#[derive(Clone)]
pub struct DecodeScheduler {
    state: Arc<SchedulerState>,
    runtime: Handle,
}

impl DecodeScheduler {
    /// 使用当前 tokio 运行时创建调度器。
    pub fn new(max_concurrent: usize) -> Result<Self, ThumbnailError> {
        let runtime = Handle::try_current()
            .map_err(|e| ThumbnailError::Runtime(format!("缺少 tokio 运行时：{}", e)))?;
        Self::with_handle(max_concurrent, runtime)
    }

    pub fn with_handle(max_concurrent: usize, runtime: Handle) -> Result<Self, ThumbnailError> {
        if max_concurrent == 0 {
            return Err(ThumbnailError::Runtime("解码并发数必须大于 0".to_string()));
        }

        Ok(Self {
            state: Arc::new(SchedulerState {
                semaphore: Arc::new(Semaphore::new(max_concurrent)),
                max_concurrent: AtomicUsize::new(max_concurrent),
                queued: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                peak_running: AtomicUsize::new(0),
            }),
            runtime,
        })
    }

    /// 提交任务；可以在非运行时线程上调用。
    pub fn submit(&self, job: Box<dyn DecodeJob>, token: CancellationToken) -> JobHandle {
        let state = Arc::clone(&self.state);
        let job_token = token.clone();
        state.queued.fetch_add(1, Ordering::Relaxed);

        let join = self.runtime.spawn(async move {
            let acquired = tokio::select! {
                biased;
                _ = job_token.cancelled() => None,
                permit = Arc::clone(&state.semaphore).acquire_owned() => permit.ok(),
            };
            state.queued.fetch_sub(1, Ordering::Relaxed);

            let Some(permit) = acquired else {
                job.cancelled();
                return;
            };

            // 拿到槽位的瞬间可能恰好被取消，此时不必再占用阻塞线程
            if job_token.is_cancelled() {
                drop(permit);
                job.cancelled();
                return;
            }

            let current = state.running.fetch_add(1, Ordering::Relaxed) + 1;
            state.update_peak(current);

            let outcome = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                job.run(&job_token);
            })
            .await;

            state.running.fetch_sub(1, Ordering::Relaxed);
            if let Err(err) = outcome {
                log::error!("❌ 解码任务异常退出：{}", err);
            }
        });

        JobHandle { token, join }
    }

    /// 调整最大并发数；缩小时等待运行中的任务归还槽位后生效。
    pub fn resize(&self, max_concurrent: usize) {
        if max_concurrent == 0 {
            log::warn!("⚠️ 忽略无效的解码并发数 0");
            return;
        }

        let previous = self.state.max_concurrent.swap(max_concurrent, Ordering::Relaxed);
        if max_concurrent > previous {
            self.state.semaphore.add_permits(max_concurrent - previous);
        } else if max_concurrent < previous {
            let surplus = (previous - max_concurrent) as u32;
            let semaphore = Arc::clone(&self.state.semaphore);
            self.runtime.spawn(async move {
                if let Ok(permits) = semaphore.acquire_many_owned(surplus).await {
                    permits.forget();
                }
            });
        }

        if previous != max_concurrent {
            log::info!("⚙️ 解码并发数调整：{} → {}", previous, max_concurrent);
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.state.max_concurrent.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            max_concurrent: self.max_concurrent(),
            queued: self.state.queued.load(Ordering::Relaxed),
            running: self.state.running.load(Ordering::Relaxed),
            peak_running: self.state.peak_running.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Ran(usize),
        Cancelled(usize),
    }

    struct SleepJob {
        id: usize,
        sleep: Duration,
        active: Arc<AtomicUsize>,
        max_seen: Arc<AtomicUsize>,
        events: mpsc::UnboundedSender<Event>,
    }

    impl DecodeJob for SleepJob {
        fn run(self: Box<Self>, _token: &CancellationToken) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.sleep);
            self.active.fetch_sub(1, Ordering::SeqCst);
            let _ = self.events.send(Event::Ran(self.id));
        }

        fn cancelled(self: Box<Self>) {
            let _ = self.events.send(Event::Cancelled(self.id));
        }
    }

    fn sleep_job(
        id: usize,
        millis: u64,
        active: &Arc<AtomicUsize>,
        max_seen: &Arc<AtomicUsize>,
        events: &mpsc::UnboundedSender<Event>,
    ) -> Box<dyn DecodeJob> {
        Box::new(SleepJob {
            id,
            sleep: Duration::from_millis(millis),
            active: Arc::clone(active),
            max_seen: Arc::clone(max_seen),
            events: events.clone(),
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_exceeds_max_concurrent() {
        let scheduler = DecodeScheduler::new(2).expect("scheduler");
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handles: Vec<_> = (0..8)
            .map(|id| scheduler.submit(sleep_job(id, 30, &active, &max_seen, &tx), CancellationToken::new()))
            .collect();
        for handle in handles {
            handle.join().await;
        }

        let mut ran = 0;
        while let Ok(event) = rx.try_recv() {
            assert!(matches!(event, Event::Ran(_)));
            ran += 1;
        }
        assert_eq!(ran, 8);
        assert!(max_seen.load(Ordering::SeqCst) <= 2);

        let stats = scheduler.stats();
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.running, 0);
        assert!(stats.peak_running >= 1 && stats.peak_running <= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn queued_job_cancelled_before_start() {
        let scheduler = DecodeScheduler::new(1).expect("scheduler");
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let blocker = scheduler.submit(sleep_job(0, 100, &active, &max_seen, &tx), CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let queued = scheduler.submit(sleep_job(1, 10, &active, &max_seen, &tx), CancellationToken::new());
        queued.cancel();
        queued.join().await;
        blocker.join().await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(events.contains(&Event::Cancelled(1)));
        assert!(events.contains(&Event::Ran(0)));
        assert!(!events.contains(&Event::Ran(1)));
    }

    #[tokio::test]
    async fn pre_cancelled_token_never_runs() {
        let scheduler = DecodeScheduler::new(4).expect("scheduler");
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let token = CancellationToken::new();
        token.cancel();
        scheduler.submit(sleep_job(7, 1, &active, &max_seen, &tx), token).join().await;

        assert_eq!(rx.try_recv().ok(), Some(Event::Cancelled(7)));
    }

    struct PanicJob;

    impl DecodeJob for PanicJob {
        fn run(self: Box<Self>, _token: &CancellationToken) {
            panic!("decoder exploded");
        }

        fn cancelled(self: Box<Self>) {}
    }

    struct FlagJob(Arc<AtomicBool>);

    impl DecodeJob for FlagJob {
        fn run(self: Box<Self>, _token: &CancellationToken) {
            self.0.store(true, Ordering::SeqCst);
        }

        fn cancelled(self: Box<Self>) {}
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_job_releases_its_slot() {
        let scheduler = DecodeScheduler::new(1).expect("scheduler");
        scheduler.submit(Box::new(PanicJob), CancellationToken::new()).join().await;

        let flag = Arc::new(AtomicBool::new(false));
        scheduler
            .submit(Box::new(FlagJob(Arc::clone(&flag))), CancellationToken::new())
            .join()
            .await;
        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(scheduler.stats().running, 0);
    }

    #[tokio::test]
    async fn resize_updates_limit_and_rejects_zero() {
        let scheduler = DecodeScheduler::new(2).expect("scheduler");
        scheduler.resize(4);
        assert_eq!(scheduler.max_concurrent(), 4);
        scheduler.resize(0);
        assert_eq!(scheduler.max_concurrent(), 4);
        scheduler.resize(1);
        assert_eq!(scheduler.stats().max_concurrent, 1);

        assert!(DecodeScheduler::new(0).is_err());
    }

    #[test]
    fn requires_runtime() {
        assert!(matches!(DecodeScheduler::new(1), Err(ThumbnailError::Runtime(_))));
    }
}
