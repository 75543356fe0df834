//! # 缩略图流水线（对外入口）
//!
//! ## 设计思路
//!
//! `ThumbnailPipeline` 只负责编排，不直接做解码或 I/O：
//! 1. 内存缓存命中 → 立即交付
//! 2. 登记到请求合并器；已有在途操作则等待其结果
//! 3. 新操作：复查内存 → 探测磁盘（含失效判定）→ 提交解码任务
//! 4. 解码任务：取字节 → 校验 → 解码降采样 → 写磁盘与内存 → 广播结果
//!
//! 任何取数或解码失败都不会抛给调用方，统一收敛为“无结果”。
//!
//! ## 实现思路
//!
//! - 构造时捕获 tokio 运行时句柄，`load_thumbnail` 可在非运行时线程（UI 线程）上调用。
//! - 磁盘探测放在合并后的操作内部执行（阻塞线程上），同一键的并发请求只探测一次，
//!   且不占用解码槽位。
//! - 配置通过 `RwLock` 支持运行时切档，单次操作使用同一配置快照。
//! - `InFlightGuard` 采用 RAII：操作被丢弃或 panic 时以失败结果清理在途条目，
//!   条目恰好被清理一次。
//! - 记录 `probe/fetch/decode/total` 阶段耗时，便于性能诊断。

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::coalescer::{Abandon, CancelOutcome, CoalescerStats, Registration, RequestCoalescer};
use super::decoder::ImageDecoder;
use super::disk_cache::{DiskCache, DiskEntryMeta};
use super::invalidation;
use super::memory_cache::MemoryCache;
use super::provider::{self, ByteProvider, NoOriginalSize, OriginalSizeProvider};
use super::scheduler::{DecodeJob, DecodeScheduler, SchedulerStats};
use super::source::{
    CacheKey, CacheTier, DecodeRequest, DecodedImage, RawImageData, RequestId, ThumbnailOutcome,
};
use super::{ThumbnailConfig, ThumbnailError, ThumbnailPerformanceProfile};

/// 单次请求的结果句柄。
///
/// 既可以 `.await` 得到 `Option<Arc<DecodedImage>>`，也可以通过 `outcome()`
/// 区分成功、失败与取消。丢弃句柄不会取消请求，取消请使用
/// [`ThumbnailPipeline::cancel`]。
pub struct ThumbnailHandle {
    request_id: RequestId,
    rx: oneshot::Receiver<ThumbnailOutcome>,
}

impl ThumbnailHandle {
    fn ready(request_id: RequestId, outcome: ThumbnailOutcome) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        Self { request_id, rx }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// 等待完整结果。
    pub async fn outcome(self) -> ThumbnailOutcome {
        self.rx.await.unwrap_or(ThumbnailOutcome::Cancelled)
    }

    /// 在非异步线程上阻塞等待结果；不能在运行时的异步上下文中调用。
    pub fn blocking_outcome(self) -> ThumbnailOutcome {
        self.rx.blocking_recv().unwrap_or(ThumbnailOutcome::Cancelled)
    }

    /// 非阻塞查询，结果尚未就绪时返回 `None`。
    pub fn try_outcome(&mut self) -> Option<ThumbnailOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(ThumbnailOutcome::Cancelled),
        }
    }
}

impl Future for ThumbnailHandle {
    type Output = Option<Arc<DecodedImage>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.ok().and_then(|outcome| outcome.image()))
    }
}

/// 流水线运行统计快照。
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PipelineStats {
    pub requests: u64,
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub disk_invalidations: u64,
    pub coalesced: u64,
    pub decodes: u64,
    pub failures: u64,
    pub cancellations: u64,
    pub abandoned: u64,
    pub memory_entries: usize,
    pub memory_cost: usize,
    pub coalescer: CoalescerStats,
    pub scheduler: SchedulerStats,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    disk_invalidations: AtomicU64,
    coalesced: AtomicU64,
    decodes: AtomicU64,
    failures: AtomicU64,
    cancellations: AtomicU64,
    abandoned: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct PipelineInner {
    config: RwLock<ThumbnailConfig>,
    memory: Arc<MemoryCache>,
    disk: Arc<DiskCache>,
    coalescer: RequestCoalescer,
    scheduler: DecodeScheduler,
    bytes: Arc<dyn ByteProvider>,
    sizes: Arc<dyn OriginalSizeProvider>,
    runtime: Handle,
    counters: Counters,
}

/// 流水线构建器。
pub struct PipelineBuilder {
    config: ThumbnailConfig,
    cache_dir: Option<PathBuf>,
    memory: Option<Arc<MemoryCache>>,
    disk: Option<Arc<DiskCache>>,
    bytes: Arc<dyn ByteProvider>,
    sizes: Arc<dyn OriginalSizeProvider>,
    runtime: Option<Handle>,
}

impl PipelineBuilder {
    pub fn config(mut self, config: ThumbnailConfig) -> Self {
        self.config = config;
        self
    }

    /// 磁盘缓存目录；未提供 `disk_cache` 时必填。
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn memory_cache(mut self, memory: Arc<MemoryCache>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn disk_cache(mut self, disk: Arc<DiskCache>) -> Self {
        self.disk = Some(disk);
        self
    }

    pub fn original_sizes(mut self, sizes: Arc<dyn OriginalSizeProvider>) -> Self {
        self.sizes = sizes;
        self
    }

    /// 指定运行时；默认使用构建时所在的运行时。
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<ThumbnailPipeline, ThumbnailError> {
        self.config.validate()?;

        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current()
                .map_err(|e| ThumbnailError::Runtime(format!("缺少 tokio 运行时：{}", e)))?,
        };

        let disk = match (self.disk, self.cache_dir) {
            (Some(disk), _) => disk,
            (None, Some(dir)) => Arc::new(DiskCache::new(dir, self.config.disk_cache_max_bytes)),
            (None, None) => {
                return Err(ThumbnailError::DiskIo("未配置磁盘缓存目录".to_string()));
            }
        };

        let memory = self.memory.unwrap_or_else(|| {
            Arc::new(MemoryCache::new(
                self.config.memory_capacity(),
                self.config.memory_cache_max_cost,
            ))
        });

        let scheduler = DecodeScheduler::with_handle(self.config.max_concurrent_decodes, runtime.clone())?;

        log::info!(
            "🚀 缩略图流水线已创建 - 档位: {} 并发解码: {} 磁盘目录: {}",
            self.config.infer_performance_profile().as_str(),
            self.config.max_concurrent_decodes,
            disk.dir().display()
        );

        Ok(ThumbnailPipeline {
            inner: Arc::new(PipelineInner {
                config: RwLock::new(self.config),
                memory,
                disk,
                coalescer: RequestCoalescer::new(),
                scheduler,
                bytes: self.bytes,
                sizes: self.sizes,
                runtime,
                counters: Counters::default(),
            }),
        })
    }
}

/// 缩略图加载与缓存流水线。
///
/// 克隆开销很小，所有克隆共享同一组缓存与在途登记表。
#[derive(Clone)]
pub struct ThumbnailPipeline {
    inner: Arc<PipelineInner>,
}

impl ThumbnailPipeline {
    pub fn builder(bytes: Arc<dyn ByteProvider>) -> PipelineBuilder {
        PipelineBuilder {
            config: ThumbnailConfig::default(),
            cache_dir: None,
            memory: None,
            disk: None,
            bytes,
            sizes: Arc::new(NoOriginalSize),
            runtime: None,
        }
    }

    /// 按配置创建缓存，需要在 tokio 运行时内调用。
    ///
    /// # 示例
    /// ```rust,no_run
    /// use std::sync::Arc;
    /// use clip_thumbnails::thumbnail::{FileByteProvider, ThumbnailConfig, ThumbnailPipeline};
    ///
    /// # async fn demo() -> Result<(), clip_thumbnails::thumbnail::ThumbnailError> {
    /// let config = ThumbnailConfig::default();
    /// let provider = Arc::new(FileByteProvider::new(config.max_source_bytes));
    /// let pipeline = ThumbnailPipeline::new(config, "/tmp/thumbnails", provider)?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(
        config: ThumbnailConfig,
        cache_dir: impl Into<PathBuf>,
        bytes: Arc<dyn ByteProvider>,
    ) -> Result<Self, ThumbnailError> {
        Self::builder(bytes).config(config).cache_dir(cache_dir).build()
    }

    /// 使用调用方构建的缓存实例。
    pub fn with_parts(
        config: ThumbnailConfig,
        memory: Arc<MemoryCache>,
        disk: Arc<DiskCache>,
        bytes: Arc<dyn ByteProvider>,
    ) -> Result<Self, ThumbnailError> {
        Self::builder(bytes)
            .config(config)
            .memory_cache(memory)
            .disk_cache(disk)
            .build()
    }

    /// 请求一张缩略图。
    ///
    /// 内存命中时句柄立即就绪；否则结果在后台产生。可在任意线程调用。
    pub fn load_thumbnail(&self, request: DecodeRequest) -> ThumbnailHandle {
        let inner = &self.inner;
        let request_id = request.request_id;
        bump(&inner.counters.requests);

        if let Some(image) = inner.memory.get(&request.cache_key) {
            bump(&inner.counters.memory_hits);
            log::debug!("⚡ 内存命中 {} - key: {}", request_id, request.cache_key);
            return ThumbnailHandle::ready(
                request_id,
                ThumbnailOutcome::Loaded {
                    image,
                    tier: CacheTier::Memory,
                },
            );
        }

        let (registration, rx) = inner.coalescer.begin_or_join(&request.cache_key, request_id);
        match registration {
            Registration::Joined => bump(&inner.counters.coalesced),
            Registration::New(token) => {
                let guard = InFlightGuard::new(Arc::clone(inner), request.cache_key.clone());
                let operation = Arc::clone(inner);
                inner
                    .runtime
                    .spawn(async move { operation.run_operation(request, token, guard).await });
            }
        }

        ThumbnailHandle { request_id, rx }
    }

    /// 只查内存与磁盘缓存，不取数、不解码。用于即时占位渲染。
    ///
    /// 磁盘命中会被提升到内存缓存。
    pub fn read_cache_only(&self, key: &CacheKey) -> Option<Arc<DecodedImage>> {
        if let Some(image) = self.inner.memory.get(key) {
            return Some(image);
        }

        let image = Arc::new(self.inner.read_disk(key)?);
        self.inner.memory.insert(key.clone(), Arc::clone(&image));
        Some(image)
    }

    /// 尽力取消请求。返回该请求是否仍在等待中。
    ///
    /// 若它是在途操作的最后一个等待者，排队中的解码任务会出队，运行中的任务在检查点停止。
    pub fn cancel(&self, request_id: RequestId) -> bool {
        match self.inner.coalescer.cancel(request_id) {
            CancelOutcome::NotFound => false,
            CancelOutcome::Detached | CancelOutcome::LastWaiter => {
                bump(&self.inner.counters.cancellations);
                true
            }
        }
    }

    /// 删除某个键在内存与磁盘中的缓存（原图被删除或替换时调用）。
    pub fn invalidate(&self, key: &CacheKey) {
        self.inner.memory.remove(key);
        self.inner.disk.remove(key);
        log::debug!("🗑️ 已失效缓存 - key: {}", key);
    }

    /// 清空内存与磁盘缓存。
    pub fn evict_all(&self) -> Result<(), ThumbnailError> {
        self.inner.memory.clear();
        self.inner.disk.clear()
    }

    /// 设置性能档位，对之后开始的操作生效。
    pub fn set_performance_profile(&self, profile: ThumbnailPerformanceProfile) -> Result<(), ThumbnailError> {
        let mut config = self
            .inner
            .config
            .write()
            .map_err(|_| ThumbnailError::Runtime("配置写入锁已中毒".to_string()))?;
        config.apply_performance_profile(profile);
        self.inner.scheduler.resize(config.max_concurrent_decodes);

        log::info!(
            "⚙️ 已切换缩略图性能档位：{}（filter={:?}, format={:?}, concurrency={}）",
            profile.as_str(),
            config.resize_filter,
            config.disk_format,
            config.max_concurrent_decodes
        );
        Ok(())
    }

    pub fn performance_profile(&self) -> Result<ThumbnailPerformanceProfile, ThumbnailError> {
        Ok(self.config()?.infer_performance_profile())
    }

    /// 当前配置快照。
    pub fn config(&self) -> Result<ThumbnailConfig, ThumbnailError> {
        self.inner.config_snapshot()
    }

    pub fn memory_cache(&self) -> &Arc<MemoryCache> {
        &self.inner.memory
    }

    pub fn disk_cache(&self) -> &Arc<DiskCache> {
        &self.inner.disk
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    pub fn stats(&self) -> PipelineStats {
        let counters = &self.inner.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        PipelineStats {
            requests: load(&counters.requests),
            memory_hits: load(&counters.memory_hits),
            disk_hits: load(&counters.disk_hits),
            disk_invalidations: load(&counters.disk_invalidations),
            coalesced: load(&counters.coalesced),
            decodes: load(&counters.decodes),
            failures: load(&counters.failures),
            cancellations: load(&counters.cancellations),
            abandoned: load(&counters.abandoned),
            memory_entries: self.inner.memory.len(),
            memory_cost: self.inner.memory.total_cost(),
            coalescer: self.inner.coalescer.stats(),
            scheduler: self.inner.scheduler.stats(),
        }
    }
}

impl PipelineInner {
    fn config_snapshot(&self) -> Result<ThumbnailConfig, ThumbnailError> {
        self.config
            .read()
            .map(|cfg| cfg.clone())
            .map_err(|_| ThumbnailError::Runtime("配置读取锁已中毒".to_string()))
    }

    /// 新建的在途操作：复查内存 → 探测磁盘 → 提交解码。
    async fn run_operation(self: Arc<Self>, request: DecodeRequest, token: CancellationToken, guard: InFlightGuard) {
        let started = Instant::now();
        let key = request.cache_key.clone();

        // 上一次操作可能刚好在登记前完成并写入了内存
        if let Some(image) = self.memory.get(&key) {
            bump(&self.counters.memory_hits);
            guard.complete(ThumbnailOutcome::Loaded {
                image,
                tier: CacheTier::Memory,
            });
            return;
        }

        let probe = {
            let inner = Arc::clone(&self);
            let request = request.clone();
            tokio::task::spawn_blocking(move || inner.probe_disk(&request)).await
        };
        let probe_ms = started.elapsed().as_millis();

        match probe {
            Ok(Some(image)) => {
                bump(&self.counters.disk_hits);
                log::debug!("💾 磁盘命中 {} - key: {} ({} ms)", request.request_id, key, probe_ms);
                guard.complete(ThumbnailOutcome::Loaded {
                    image,
                    tier: CacheTier::Disk,
                });
                return;
            }
            Ok(None) => {}
            Err(err) => log::warn!("⚠️ 磁盘探测任务异常，按未命中处理 - key: {} err: {}", key, err),
        }

        // 探测期间令牌可能已被替换（全部取消后又有人加入）
        let token = self.coalescer.current_token(&key).unwrap_or(token);
        let job = ThumbnailJob {
            inner: Arc::clone(&self),
            request,
            guard,
            started,
            probe_ms,
        };
        self.scheduler.submit(Box::new(job), token);
    }

    /// 读取并解码磁盘条目；损坏的条目会被删除。
    fn read_disk(&self, key: &CacheKey) -> Option<DecodedImage> {
        let bytes = self.disk.get(key)?;
        match ImageDecoder::decode_cached(&bytes) {
            Ok(image) => Some(image),
            Err(err) => {
                log::warn!("⚠️ 磁盘缓存条目无法解码，已删除 - key: {} err: {}", key, err);
                self.disk.remove(key);
                None
            }
        }
    }

    /// 磁盘命中且满足请求分辨率时提升到内存并返回。
    fn probe_disk(&self, request: &DecodeRequest) -> Option<Arc<DecodedImage>> {
        let key = &request.cache_key;
        let image = self.read_disk(key)?;
        let cached = image.size();

        let original = request
            .original_size
            .or_else(|| self.sizes.original_size(&request.source))
            .or_else(|| self.disk.meta(key).map(|meta| meta.original));

        if let Some(original) = original {
            if invalidation::evaluate(
                &request.invalidation,
                original,
                cached,
                request.target_size,
                request.display_scale,
            ) {
                bump(&self.counters.disk_invalidations);
                log::info!(
                    "🔄 磁盘缓存分辨率不足，重新生成 - key: {} 缓存: {} 原图: {} 请求: {:.0}x{:.0}@{}x",
                    key,
                    cached,
                    original,
                    request.target_size.width,
                    request.target_size.height,
                    request.display_scale
                );
                return None;
            }
        }

        let image = Arc::new(image);
        self.memory.insert(key.clone(), Arc::clone(&image));
        Some(image)
    }

    fn finish(&self, key: &CacheKey, outcome: ThumbnailOutcome) {
        self.coalescer.complete(key, outcome);
    }
}

/// 在途条目的 RAII 守卫：未显式完成或放弃就被丢弃时，以失败结果清理条目。
struct InFlightGuard {
    inner: Arc<PipelineInner>,
    key: CacheKey,
    armed: bool,
}

impl InFlightGuard {
    fn new(inner: Arc<PipelineInner>, key: CacheKey) -> Self {
        Self {
            inner,
            key,
            armed: true,
        }
    }

    fn complete(mut self, outcome: ThumbnailOutcome) {
        self.armed = false;
        self.inner.finish(&self.key, outcome);
    }

    /// 所有等待者都已离开时尝试放弃操作。
    ///
    /// 返回 `Some(token)` 表示有人重新加入，操作必须继续。
    fn abandon(&mut self) -> Option<CancellationToken> {
        match self.inner.coalescer.abandon(&self.key) {
            Abandon::Removed => {
                self.armed = false;
                bump(&self.inner.counters.abandoned);
                log::debug!("🛑 在途操作已放弃 - key: {}", self.key);
                None
            }
            Abandon::Revived(token) => Some(token),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            log::warn!("⚠️ 在途操作异常终止 - key: {}", self.key);
            self.inner.finish(
                &self.key,
                ThumbnailOutcome::Failed(ThumbnailError::Decode("解码任务意外终止".to_string())),
            );
        }
    }
}

/// 一次完整的“取字节 → 解码 → 写缓存”任务。
struct ThumbnailJob {
    inner: Arc<PipelineInner>,
    request: DecodeRequest,
    guard: InFlightGuard,
    started: Instant,
    probe_ms: u128,
}

impl ThumbnailJob {
    /// 检查点：令牌已触发时尝试放弃；返回 `false` 表示应停止。
    fn checkpoint(&mut self, token: &mut CancellationToken) -> bool {
        if !token.is_cancelled() {
            return true;
        }
        match self.guard.abandon() {
            Some(revived) => {
                *token = revived;
                true
            }
            None => false,
        }
    }

    fn fail(self, error: ThumbnailError) {
        bump(&self.inner.counters.failures);
        log::warn!(
            "❌ 缩略图生成失败 - source: {} key: {} [{}/{}] {}",
            self.request.source,
            self.request.cache_key,
            error.stage(),
            error.code(),
            error
        );
        self.guard.complete(ThumbnailOutcome::Failed(error));
    }
}

impl DecodeJob for ThumbnailJob {
    fn run(self: Box<Self>, token: &CancellationToken) {
        let mut job = *self;
        let mut token = token.clone();

        let config = match job.inner.config_snapshot() {
            Ok(config) => config,
            Err(err) => return job.fail(err),
        };
        let target = job.request.target_pixels();

        let fetch_started = Instant::now();
        let fetched = job
            .inner
            .bytes
            .fetch(&job.request.source)
            .and_then(|bytes| provider::validate_source_bytes(&bytes, config.max_source_bytes).map(|_| bytes));
        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(err) => return job.fail(err),
        };
        let fetch_ms = fetch_started.elapsed().as_millis();

        if !job.checkpoint(&mut token) {
            return;
        }

        let decode_started = Instant::now();
        bump(&job.inner.counters.decodes);
        let raw = RawImageData {
            bytes,
            source_hint: job.request.source.clone(),
        };
        let decoded = match ImageDecoder::decode_thumbnail(&raw, target, &config) {
            Ok(decoded) => decoded,
            Err(err) => return job.fail(err),
        };
        let decode_ms = decode_started.elapsed().as_millis();

        // 解码不可抢占；取消后不再做编码与写盘
        if !job.checkpoint(&mut token) {
            return;
        }

        let key = job.request.cache_key.clone();
        let meta = DiskEntryMeta {
            original: decoded.original_size,
            pixel: decoded.image.size(),
        };
        match ImageDecoder::encode_for_disk(&decoded.image, &config) {
            Ok(encoded) => {
                if let Err(err) = job.inner.disk.set_with_meta(&key, &encoded, meta) {
                    log::warn!("⚠️ 写入磁盘缓存失败 - key: {} err: {}", key, err);
                }
            }
            Err(err) => log::warn!("⚠️ 缩略图编码失败，跳过磁盘缓存 - key: {} err: {}", key, err),
        }

        let image = Arc::new(decoded.image);
        job.inner.memory.insert(key.clone(), Arc::clone(&image));

        log::info!(
            "✅ 缩略图已生成 - key: {} 原图: {} 缩略图: {}（probe={}ms, fetch={}ms, decode={}ms, total={}ms）",
            key,
            meta.original,
            meta.pixel,
            job.probe_ms,
            fetch_ms,
            decode_ms,
            job.started.elapsed().as_millis()
        );

        job.guard.complete(ThumbnailOutcome::Loaded {
            image,
            tier: CacheTier::Decoded,
        });
    }

    fn cancelled(mut self: Box<Self>) {
        if let Some(token) = self.guard.abandon() {
            log::debug!("🔁 排队中的操作被重新加入，重新提交 - key: {}", self.request.cache_key);
            let scheduler = self.inner.scheduler.clone();
            scheduler.submit(self, token);
        }
    }
}
