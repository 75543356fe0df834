use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgba};

use clip_thumbnails::thumbnail::{
    ByteProvider, CacheKey, CacheTier, DecodeRequest, InvalidationPolicy, PixelSize, PointSize,
    SourceRef, ThumbnailConfig, ThumbnailError, ThumbnailOutcome, ThumbnailPipeline,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn png(width: u32, height: u32) -> Bytes {
    let img = ImageBuffer::from_fn(width, height, |x, y| {
        Rgba([(x % 251) as u8, (y % 251) as u8, ((x * y) % 251) as u8, 255])
    });
    let mut cursor = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img)
        .write_to(&mut cursor, ImageFormat::Png)
        .expect("encode test png");
    Bytes::from(cursor.into_inner())
}

/// 内存中的原图库，记录每个来源被读取的次数。
struct CountingSource {
    images: Mutex<HashMap<String, Result<Bytes, ThumbnailError>>>,
    calls: AtomicUsize,
    delay: Duration,
}

impl CountingSource {
    fn new(delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            images: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(delay_ms),
        })
    }

    fn with(self: Arc<Self>, source: &str, result: Result<Bytes, ThumbnailError>) -> Arc<Self> {
        self.images
            .lock()
            .expect("source lock")
            .insert(source.to_string(), result);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ByteProvider for CountingSource {
    fn fetch(&self, source: &SourceRef) -> Result<Bytes, ThumbnailError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.images
            .lock()
            .expect("source lock")
            .get(source.as_str())
            .cloned()
            .unwrap_or_else(|| Err(ThumbnailError::SourceUnavailable(format!("尚未同步：{}", source))))
    }
}

fn pipeline(dir: &std::path::Path, source: &Arc<CountingSource>) -> ThumbnailPipeline {
    pipeline_with(dir, source, ThumbnailConfig::default())
}

fn pipeline_with(dir: &std::path::Path, source: &Arc<CountingSource>, config: ThumbnailConfig) -> ThumbnailPipeline {
    let provider: Arc<dyn ByteProvider> = Arc::clone(source) as Arc<dyn ByteProvider>;
    ThumbnailPipeline::new(config, dir, provider).expect("pipeline")
}

fn request(source: &str, key: &str, points: f64, scale: f64) -> DecodeRequest {
    DecodeRequest::new(source, key, PointSize::new(points, points), scale)
}

async fn wait_until_idle(pipeline: &ThumbnailPipeline) {
    for _ in 0..100 {
        let stats = pipeline.stats();
        if stats.coalescer.in_flight == 0 && stats.scheduler.running == 0 && stats.scheduler.queued == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pipeline did not become idle: {:?}", pipeline.stats());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_decode_once() {
    init_logger();
    let dir = tempfile::tempdir().expect("tempdir");
    let source = CountingSource::new(80).with("a.png", Ok(png(600, 300)));
    let pipeline = pipeline(dir.path(), &source);

    let handles: Vec<_> = (0..20)
        .map(|_| pipeline.load_thumbnail(request("a.png", "grid-cell/a", 40.0, 2.0)))
        .collect();

    let mut images = Vec::new();
    for handle in handles {
        images.push(handle.await.expect("every waiter receives the image"));
    }

    assert_eq!(source.calls(), 1);
    assert!(images.iter().all(|img| Arc::ptr_eq(img, &images[0])));
    assert_eq!(images[0].size(), PixelSize::new(160, 80));

    let stats = pipeline.stats();
    assert_eq!(stats.decodes, 1);
    assert_eq!(stats.requests, 20);
    assert_eq!(stats.coalesced + stats.memory_hits + 1, 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disk_cache_is_used_before_decoding() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = CountingSource::new(0).with("a.png", Ok(png(400, 400)));

    let first = pipeline(dir.path(), &source);
    assert!(first.load_thumbnail(request("a.png", "k", 50.0, 1.0)).await.is_some());
    assert_eq!(source.calls(), 1);

    // 新实例：内存为空，磁盘仍在
    let second = pipeline(dir.path(), &source);
    let outcome = second.load_thumbnail(request("a.png", "k", 50.0, 1.0)).outcome().await;
    let ThumbnailOutcome::Loaded { image, tier } = outcome else {
        panic!("expected disk hit");
    };
    assert_eq!(tier, CacheTier::Disk);
    assert_eq!(image.size(), PixelSize::new(50, 50));
    assert_eq!(source.calls(), 1);
    assert!(second.memory_cache().contains(&CacheKey::new("k")), "disk hit is promoted");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn low_resolution_disk_entry_is_regenerated() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = CountingSource::new(0).with("a.png", Ok(png(300, 300)));

    let small = pipeline(dir.path(), &source);
    let image = small
        .load_thumbnail(request("a.png", "k", 20.0, 1.0))
        .await
        .expect("small thumbnail");
    assert_eq!(image.size(), PixelSize::new(20, 20));

    let large = pipeline(dir.path(), &source);
    let outcome = large.load_thumbnail(request("a.png", "k", 40.0, 2.0)).outcome().await;
    let ThumbnailOutcome::Loaded { image, tier } = outcome else {
        panic!("expected regenerated thumbnail");
    };
    assert_eq!(tier, CacheTier::Decoded);
    assert_eq!(image.size(), PixelSize::new(80, 80));
    assert_eq!(source.calls(), 2);
    assert_eq!(large.stats().disk_invalidations, 1);

    // 新的磁盘条目满足同样的请求
    let third = pipeline(dir.path(), &source);
    let outcome = third.load_thumbnail(request("a.png", "k", 40.0, 2.0)).outcome().await;
    assert!(matches!(outcome, ThumbnailOutcome::Loaded { tier: CacheTier::Disk, .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn never_policy_keeps_low_resolution_entry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = CountingSource::new(0).with("a.png", Ok(png(300, 300)));

    assert!(pipeline(dir.path(), &source)
        .load_thumbnail(request("a.png", "k", 20.0, 1.0))
        .await
        .is_some());

    let other = pipeline(dir.path(), &source);
    let request = request("a.png", "k", 40.0, 2.0).with_invalidation(InvalidationPolicy::Never);
    let outcome = other.load_thumbnail(request).outcome().await;
    assert!(matches!(outcome, ThumbnailOutcome::Loaded { tier: CacheTier::Disk, .. }));
    assert_eq!(source.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn small_original_is_not_upscaled_or_regenerated() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = CountingSource::new(0).with("tiny.png", Ok(png(40, 40)));

    let image = pipeline(dir.path(), &source)
        .load_thumbnail(request("tiny.png", "k", 80.0, 2.0))
        .await
        .expect("thumbnail");
    assert_eq!(image.size(), PixelSize::new(40, 40));

    let request = request("tiny.png", "k", 80.0, 2.0).with_original_size(PixelSize::new(40, 40));
    let outcome = pipeline(dir.path(), &source).load_thumbnail(request).outcome().await;
    assert!(matches!(outcome, ThumbnailOutcome::Loaded { tier: CacheTier::Disk, .. }));
    assert_eq!(source.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_cache_stays_within_budget() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut source = CountingSource::new(0);
    for i in 0..6 {
        source = source.with(&format!("{}.png", i), Ok(png(32, 32)));
    }
    let config = ThumbnailConfig {
        memory_cache_max_entries: 3,
        ..ThumbnailConfig::default()
    };
    let pipeline = pipeline_with(dir.path(), &source, config);

    for i in 0..6 {
        let key = format!("k{}", i);
        assert!(pipeline
            .load_thumbnail(request(&format!("{}.png", i), &key, 32.0, 1.0))
            .await
            .is_some());
        assert!(pipeline.stats().memory_entries <= 3);
    }

    assert_eq!(pipeline.memory_cache().len(), 3);
    assert!(pipeline.memory_cache().contains(&CacheKey::new("k5")));
    assert!(!pipeline.memory_cache().contains(&CacheKey::new("k0")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_one_waiter_does_not_affect_others() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = CountingSource::new(150).with("a.png", Ok(png(100, 100)));
    let pipeline = pipeline(dir.path(), &source);

    let first = pipeline.load_thumbnail(request("a.png", "k", 30.0, 1.0));
    let second = pipeline.load_thumbnail(request("a.png", "k", 30.0, 1.0));

    assert!(pipeline.cancel(first.request_id()));
    assert!(first.outcome().await.is_cancelled());
    assert!(second.await.is_some());
    assert_eq!(source.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_last_waiter_drops_queued_job() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = CountingSource::new(150)
        .with("busy.png", Ok(png(64, 64)))
        .with("queued.png", Ok(png(64, 64)));
    let config = ThumbnailConfig {
        max_concurrent_decodes: 1,
        ..ThumbnailConfig::default()
    };
    let pipeline = pipeline_with(dir.path(), &source, config);

    let busy = pipeline.load_thumbnail(request("busy.png", "busy", 32.0, 1.0));
    tokio::time::sleep(Duration::from_millis(40)).await;
    let queued = pipeline.load_thumbnail(request("queued.png", "queued", 32.0, 1.0));
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(pipeline.cancel(queued.request_id()));
    assert!(queued.outcome().await.is_cancelled());
    assert!(busy.await.is_some());

    wait_until_idle(&pipeline).await;
    assert_eq!(source.calls(), 1, "the queued job never fetched its source");
    assert_eq!(pipeline.stats().abandoned, 1);
    assert!(pipeline.read_cache_only(&CacheKey::new("queued")).is_none());
}

async fn wait_until_running(pipeline: &ThumbnailPipeline) {
    for _ in 0..100 {
        if pipeline.stats().scheduler.running == 1 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("decode job never started: {:?}", pipeline.stats());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_running_job_removes_entry_once() {
    init_logger();
    let dir = tempfile::tempdir().expect("tempdir");
    let source = CountingSource::new(200).with("slow.png", Ok(png(64, 64)));
    let pipeline = pipeline(dir.path(), &source);
    let key = CacheKey::new("slow");

    let only = pipeline.load_thumbnail(request("slow.png", "slow", 32.0, 1.0));
    wait_until_running(&pipeline).await;

    assert!(pipeline.cancel(only.request_id()));
    assert!(only.outcome().await.is_cancelled());

    // 任务在取字节后的检查点放弃，不解码也不写缓存
    wait_until_idle(&pipeline).await;
    let stats = pipeline.stats();
    assert_eq!(stats.coalescer.in_flight, 0);
    assert_eq!(stats.abandoned, 1);
    assert_eq!(stats.decodes, 0);
    assert!(!pipeline.memory_cache().contains(&key));
    assert!(pipeline.disk_cache().get(&key).is_none());

    let later = pipeline.load_thumbnail(request("slow.png", "slow", 32.0, 1.0)).await;
    assert_eq!(later.expect("later request decodes").size(), PixelSize::new(32, 32));
    assert_eq!(source.calls(), 2);
    assert_eq!(pipeline.stats().abandoned, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rejoining_running_job_delivers_to_new_waiter() {
    init_logger();
    let dir = tempfile::tempdir().expect("tempdir");
    let source = CountingSource::new(200).with("slow.png", Ok(png(64, 64)));
    let pipeline = pipeline(dir.path(), &source);

    let first = pipeline.load_thumbnail(request("slow.png", "slow", 32.0, 1.0));
    wait_until_running(&pipeline).await;

    assert!(pipeline.cancel(first.request_id()));
    let second = pipeline.load_thumbnail(request("slow.png", "slow", 32.0, 1.0));

    assert!(first.outcome().await.is_cancelled());
    let image = second.await.expect("re-joined waiter receives the image");
    assert_eq!(image.size(), PixelSize::new(32, 32));

    wait_until_idle(&pipeline).await;
    let stats = pipeline.stats();
    assert_eq!(source.calls(), 1, "the running job carried on for the new waiter");
    assert_eq!(stats.abandoned, 0);
    assert_eq!(stats.coalescer.in_flight, 0);
    assert!(pipeline.memory_cache().contains(&CacheKey::new("slow")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rejoining_after_cancel_still_delivers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = CountingSource::new(60).with("a.png", Ok(png(64, 64)));
    let pipeline = pipeline(dir.path(), &source);

    let first = pipeline.load_thumbnail(request("a.png", "k", 32.0, 1.0));
    assert!(pipeline.cancel(first.request_id()));
    let second = pipeline.load_thumbnail(request("a.png", "k", 32.0, 1.0));

    assert!(second.await.is_some());
    wait_until_idle(&pipeline).await;
    assert!(source.calls() <= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repeated_request_returns_same_image() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = CountingSource::new(0).with("a.png", Ok(png(120, 90)));
    let pipeline = pipeline(dir.path(), &source);

    let first = pipeline
        .load_thumbnail(request("a.png", "k", 30.0, 1.0))
        .await
        .expect("first");
    let second = pipeline
        .load_thumbnail(request("a.png", "k", 30.0, 1.0))
        .await
        .expect("second");

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(source.calls(), 1);
    assert!(!pipeline.cancel(clip_thumbnails::thumbnail::RequestId::next()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn read_cache_only_never_decodes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = CountingSource::new(0).with("a.png", Ok(png(50, 50)));
    let pipeline = pipeline(dir.path(), &source);
    let key = CacheKey::new("k");

    assert!(pipeline.read_cache_only(&key).is_none());
    assert_eq!(source.calls(), 0);

    assert!(pipeline.load_thumbnail(request("a.png", "k", 25.0, 1.0)).await.is_some());
    assert!(pipeline.read_cache_only(&key).is_some());

    // 只剩磁盘时同样可读，并提升到内存
    pipeline.memory_cache().clear();
    assert!(pipeline.read_cache_only(&key).is_some());
    assert!(pipeline.memory_cache().contains(&key));
    assert_eq!(source.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failures_resolve_to_none_and_are_not_cached() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = CountingSource::new(0).with("garbage.bin", Ok(Bytes::from_static(b"not an image at all")));
    let pipeline = pipeline(dir.path(), &source);

    let missing = pipeline.load_thumbnail(request("missing.png", "missing", 30.0, 1.0));
    assert!(matches!(
        missing.outcome().await,
        ThumbnailOutcome::Failed(ThumbnailError::SourceUnavailable(_))
    ));
    assert!(pipeline.load_thumbnail(request("garbage.bin", "garbage", 30.0, 1.0)).await.is_none());

    // 调用方重新请求时会再次取数
    assert!(pipeline.load_thumbnail(request("missing.png", "missing", 30.0, 1.0)).await.is_none());
    assert_eq!(source.calls(), 3);
    assert_eq!(pipeline.stats().failures, 3);
    assert!(pipeline.read_cache_only(&CacheKey::new("missing")).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn corrupt_disk_entry_is_treated_as_miss() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = CountingSource::new(0).with("a.png", Ok(png(64, 64)));
    let pipeline = pipeline(dir.path(), &source);
    let key = CacheKey::new("k");

    pipeline.disk_cache().set(&key, b"definitely not a png").expect("seed corrupt entry");

    let outcome = pipeline.load_thumbnail(request("a.png", "k", 32.0, 1.0)).outcome().await;
    assert!(matches!(outcome, ThumbnailOutcome::Loaded { tier: CacheTier::Decoded, .. }));
    assert_eq!(source.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invalidate_and_evict_all_force_regeneration() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = CountingSource::new(0)
        .with("a.png", Ok(png(64, 64)))
        .with("b.png", Ok(png(64, 64)));
    let pipeline = pipeline(dir.path(), &source);

    assert!(pipeline.load_thumbnail(request("a.png", "a", 32.0, 1.0)).await.is_some());
    assert!(pipeline.load_thumbnail(request("b.png", "b", 32.0, 1.0)).await.is_some());

    pipeline.invalidate(&CacheKey::new("a"));
    assert!(pipeline.read_cache_only(&CacheKey::new("a")).is_none());
    assert!(pipeline.read_cache_only(&CacheKey::new("b")).is_some());

    pipeline.evict_all().expect("evict all");
    assert!(pipeline.read_cache_only(&CacheKey::new("b")).is_none());
    assert!(dir.path().is_dir());
    assert_eq!(pipeline.disk_cache().usage().file_count, 0);

    assert!(pipeline.load_thumbnail(request("b.png", "b", 32.0, 1.0)).await.is_some());
    assert_eq!(source.calls(), 3);
}
