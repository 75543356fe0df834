//! # 显示绑定
//!
//! ## 设计思路
//!
//! 列表单元格会被复用：同一个显示目标先后绑定不同的图片。绑定新请求前必须取消旧请求，
//! 并保证旧请求的迟到结果永远不会覆盖新内容。
//!
//! ## 实现思路
//!
//! - 每个绑定最多持有一个活动请求（请求 id + 投递任务）。
//! - `bind`：取消旧请求 → 用 `read_cache_only` 画占位图 → 发起加载并在后台投递。
//! - 代次计数放在 `Mutex` 内，投递时“比较代次 + 设置图片”在同一临界区完成，
//!   与新的 `bind`/`unbind` 互斥。
//! - `unbind` 与 `Drop` 都会取消活动请求。
//!
//! `set_image` 在运行时的工作线程上被调用；需要在主线程更新界面的实现应自行转发。

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use super::pipeline::ThumbnailPipeline;
use super::source::{DecodeRequest, DecodedImage, RequestId, ThumbnailOutcome};

/// 可以显示缩略图的目标（单元格、预览视图等）。
pub trait CanDisplay: Send + Sync + 'static {
    /// `None` 表示清空当前图片。
    fn set_image(&self, image: Option<Arc<DecodedImage>>);
}

struct ActiveRequest {
    request_id: RequestId,
    delivery: JoinHandle<()>,
}

/// 单个显示目标与流水线之间的绑定。
pub struct DisplayBinding<T: CanDisplay> {
    pipeline: ThumbnailPipeline,
    target: Arc<T>,
    generation: Arc<Mutex<u64>>,
    active: Mutex<Option<ActiveRequest>>,
}

impl<T: CanDisplay> DisplayBinding<T> {
    pub fn new(pipeline: ThumbnailPipeline, target: Arc<T>) -> Self {
        Self {
            pipeline,
            target,
            generation: Arc::new(Mutex::new(0)),
            active: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &Arc<T> {
        &self.target
    }

    /// 当前活动请求的 id。
    pub fn active_request(&self) -> Option<RequestId> {
        self.active
            .lock()
            .ok()
            .and_then(|active| active.as_ref().map(|request| request.request_id))
    }

    /// 绑定新的请求，旧请求会先被取消。
    pub fn bind(&self, request: DecodeRequest) {
        self.unbind();

        let placeholder = self.pipeline.read_cache_only(&request.cache_key);
        let has_placeholder = placeholder.is_some();
        let generation = match self.generation.lock() {
            Ok(current) => {
                self.target.set_image(placeholder);
                *current
            }
            Err(_) => return,
        };

        let handle = self.pipeline.load_thumbnail(request);
        let request_id = handle.request_id();
        let target = Arc::clone(&self.target);
        let current = Arc::clone(&self.generation);

        let delivery = self.pipeline.runtime().spawn(async move {
            let outcome = handle.outcome().await;
            let Ok(latest) = current.lock() else {
                return;
            };
            if *latest != generation {
                return;
            }

            match outcome {
                ThumbnailOutcome::Loaded { image, .. } => target.set_image(Some(image)),
                // 失败时保留占位图；没有占位图则保持清空状态
                ThumbnailOutcome::Failed(_) if !has_placeholder => target.set_image(None),
                ThumbnailOutcome::Failed(_) | ThumbnailOutcome::Cancelled => {}
            }
        });

        if let Ok(mut active) = self.active.lock() {
            *active = Some(ActiveRequest { request_id, delivery });
        }
    }

    /// 取消活动请求；迟到的结果不会再投递到目标上。
    pub fn unbind(&self) {
        if let Ok(mut current) = self.generation.lock() {
            *current = current.wrapping_add(1);
        }

        let previous = self.active.lock().ok().and_then(|mut active| active.take());
        if let Some(previous) = previous {
            if self.pipeline.cancel(previous.request_id) {
                log::debug!("↩️ 显示目标已解绑，取消请求 {}", previous.request_id);
            }
            previous.delivery.abort();
        }
    }
}

impl<T: CanDisplay> Drop for DisplayBinding<T> {
    fn drop(&mut self) {
        self.unbind();
    }
}
