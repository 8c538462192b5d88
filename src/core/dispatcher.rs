use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use super::errors::{DispatchError, Result};
use super::progress::{progress_channel, ProgressStream};
use super::queue::{FailureOutcome, TaskQueue};
use super::task::{DispatcherStatus, Task, TaskStatus};
use super::traits::{UploadRequest, Uploader};
use super::types::{DispatcherConfig, DispatcherState};
use crate::utils::{RateLimiter, RetryPolicy};

/// 一轮处理结束的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PassStop {
    /// 快照里的任务都处理过了
    #[default]
    Exhausted,
    Paused,
    Shutdown,
}

/// 一轮处理的统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PassReport {
    pub uploaded: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    /// 还没到重试时间的任务
    pub skipped: usize,
    pub stop: PassStop,
}

impl PassReport {
    pub fn attempted(&self) -> usize {
        self.uploaded + self.failed + self.dead_lettered
    }
}

/// 控制面：暂停、恢复、查询状态
///
/// 可以任意克隆，在任何任务里调用都是安全的。
#[derive(Clone)]
pub struct DispatcherHandle {
    control: Arc<watch::Sender<DispatcherState>>,
    current: Arc<watch::Sender<Option<TaskStatus>>>,
}

impl DispatcherHandle {
    /// 暂停调度，同时打断正在进行的上传
    pub fn pause(&self) -> DispatcherStatus {
        let changed = self.control.send_if_modified(|state| {
            if state.is_paused() {
                return false;
            }
            *state = DispatcherState::Paused;
            true
        });
        if changed {
            tracing::info!("Dispatcher paused");
        }
        self.status()
    }

    pub fn resume(&self) -> DispatcherStatus {
        let changed = self.control.send_if_modified(|state| {
            if !state.is_paused() {
                return false;
            }
            *state = DispatcherState::Running;
            true
        });
        if changed {
            tracing::info!("Dispatcher resumed");
        }
        self.status()
    }

    pub fn is_paused(&self) -> bool {
        self.control.borrow().is_paused()
    }

    pub fn status(&self) -> DispatcherStatus {
        DispatcherStatus {
            paused: self.is_paused(),
            progress: self.current.borrow().clone(),
        }
    }
}

/// 上传调度器
///
/// 单个工作循环按创建时间顺序逐个上传队列里的任务，成功后从队列删除，
/// 失败的任务留在队列里等待下一轮重试。
pub struct Dispatcher {
    queue: TaskQueue,
    uploader: Arc<dyn Uploader>,
    limiter: RateLimiter,
    config: DispatcherConfig,
    retry: RetryPolicy,
    control: Arc<watch::Sender<DispatcherState>>,
    current: Arc<watch::Sender<Option<TaskStatus>>>,
}

impl Dispatcher {
    pub fn new(queue: TaskQueue, uploader: Arc<dyn Uploader>, config: DispatcherConfig) -> Self {
        let initial = if config.start_paused {
            DispatcherState::Paused
        } else {
            DispatcherState::Running
        };
        let (control, _) = watch::channel(initial);
        let (current, _) = watch::channel(None);

        Self {
            queue,
            uploader,
            limiter: RateLimiter::new(config.rate, config.capacity),
            config,
            retry: RetryPolicy::default(),
            control: Arc::new(control),
            current: Arc::new(current),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            control: self.control.clone(),
            current: self.current.clone(),
        }
    }

    pub fn pause(&self) -> DispatcherStatus {
        self.handle().pause()
    }

    pub fn resume(&self) -> DispatcherStatus {
        self.handle().resume()
    }

    pub fn status(&self) -> DispatcherStatus {
        self.handle().status()
    }

    fn is_paused(&self) -> bool {
        self.control.borrow().is_paused()
    }

    /// 主循环，直到 `shutdown` 被取消
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            uploader = self.uploader.name(),
            backend = self.queue.backend(),
            throttled = self.limiter.is_enabled(),
            "Dispatcher started"
        );

        let mut control = self.control.subscribe();
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            // 暂停期间不访问队列
            if control.borrow_and_update().is_paused() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = control.changed() => continue,
                }
            }

            match self.run_pass(&shutdown).await {
                Ok(report) => {
                    if report.attempted() > 0 {
                        tracing::debug!(?report, "Pass finished");
                    }
                    match report.stop {
                        PassStop::Shutdown => break,
                        PassStop::Paused => continue,
                        PassStop::Exhausted => {}
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, code = err.code(), "Failed to query task queue");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = control.changed() => {}
            }
        }

        self.current.send_replace(None);
        tracing::info!("Dispatcher stopped");
    }

    /// 处理一轮队列快照
    pub async fn run_pass(&self, shutdown: &CancellationToken) -> Result<PassReport> {
        let mut report = PassReport::default();
        if shutdown.is_cancelled() {
            report.stop = PassStop::Shutdown;
            return Ok(report);
        }
        if self.is_paused() {
            report.stop = PassStop::Paused;
            return Ok(report);
        }

        let tasks = self.queue.query_ordered().await?;
        let now = self.queue.now_nanos();

        for task in tasks {
            if shutdown.is_cancelled() {
                report.stop = PassStop::Shutdown;
                break;
            }
            if self.is_paused() {
                report.stop = PassStop::Paused;
                break;
            }
            if !task.is_due(now) {
                report.skipped += 1;
                continue;
            }

            let result = self.execute(&task, shutdown).await;
            self.current.send_replace(None);

            match result {
                Ok(remote_id) => {
                    report.uploaded += 1;
                    tracing::info!(
                        task_id = %task.id,
                        filename = %task.filename.display(),
                        remote_id = %remote_id,
                        "Upload completed"
                    );
                    self.remove_uploaded(&task).await;
                }
                Err(DispatchError::Cancelled) => {
                    // 被打断的任务不算失败，恢复后第一个重新执行
                    report.stop = if shutdown.is_cancelled() {
                        PassStop::Shutdown
                    } else {
                        PassStop::Paused
                    };
                    tracing::info!(task_id = %task.id, stop = ?report.stop, "Upload interrupted");
                    break;
                }
                Err(err) => {
                    tracing::warn!(
                        task_id = %task.id,
                        filename = %task.filename.display(),
                        attempts = task.attempts + 1,
                        error = %err,
                        retryable = err.is_retryable(),
                        "Upload failed"
                    );
                    match self.queue.record_failure(&task, &err.to_string(), &self.retry).await {
                        Ok(FailureOutcome::Retrying { .. }) => report.failed += 1,
                        Ok(FailureOutcome::DeadLettered { .. }) => report.dead_lettered += 1,
                        Err(store_err) => {
                            report.failed += 1;
                            tracing::warn!(task_id = %task.id, error = %store_err, "Failed to record upload failure");
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    async fn remove_uploaded(&self, task: &Task) {
        match self.queue.remove(task).await {
            Ok(()) => {}
            Err(err) if err.is_benign_race() => {
                tracing::info!(task_id = %task.id, error = %err, "Uploaded task changed concurrently, left as is");
            }
            Err(err) => {
                tracing::error!(task_id = %task.id, error = %err, "Failed to remove uploaded task");
            }
        }
    }

    /// 执行一次上传；被暂停或关闭打断时返回 `Cancelled`
    async fn execute(&self, task: &Task, shutdown: &CancellationToken) -> Result<String> {
        let attempt = shutdown.child_token();
        let mut control = self.control.subscribe();
        if control.borrow_and_update().is_paused() {
            return Err(DispatchError::Cancelled);
        }

        let file = tokio::fs::File::open(&task.filename).await?;
        let total_bytes = file.metadata().await?.len();

        let mut status = TaskStatus::new(task, total_bytes);
        self.current.send_replace(Some(status.clone()));

        let mime_type = task.resolved_mime_type();
        tracing::info!(
            task_id = %task.id,
            filename = %task.filename.display(),
            size = total_bytes,
            mime_type = mime_type.as_deref().unwrap_or("-"),
            attempts = task.attempts,
            "Upload started"
        );

        let (progress_tx, mut progress_rx) = progress_channel();
        let reader = ReaderStream::with_capacity(file, self.config.chunk_size.max(1));
        let body = ProgressStream::new(self.limiter.throttle(reader, attempt.clone()), total_bytes, progress_tx);

        let request = UploadRequest {
            name: task.display_name(),
            description: task.description.clone(),
            parents: task.parents.clone(),
            mime_type,
            size: total_bytes,
            body: Box::pin(body),
        };

        let upload = self.uploader.upload(request, attempt.clone());
        tokio::pin!(upload);

        let mut progress_open = true;
        let result = loop {
            tokio::select! {
                result = &mut upload => break result,
                event = progress_rx.recv(), if progress_open => match event {
                    Some(event) => {
                        status.update(event.bytes_sent, event.total_bytes);
                        self.current.send_replace(Some(status.clone()));
                    }
                    None => progress_open = false,
                },
                changed = control.changed(), if !attempt.is_cancelled() => {
                    if changed.is_err() || control.borrow_and_update().is_paused() {
                        attempt.cancel();
                    }
                }
            }
        };

        match result {
            Err(err) if attempt.is_cancelled() => {
                tracing::debug!(task_id = %task.id, error = %err, "Upload aborted by cancellation");
                Err(DispatchError::Cancelled)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use async_trait::async_trait;
    use futures::TryStreamExt;
    use tokio::sync::Notify;
    use crate::core::store::MemoryStore;
    use crate::core::task::NewTask;
    use crate::core::types::KeyField;

    /// 读完整个流后成功
    #[derive(Default)]
    struct RecordingUploader {
        uploads: Mutex<Vec<(String, Option<String>, u64)>>,
    }

    #[async_trait]
    impl Uploader for RecordingUploader {
        async fn upload(&self, request: UploadRequest, _cancel: CancellationToken) -> Result<String> {
            let chunks: Vec<_> = request.body.try_collect().await?;
            let received = chunks.iter().map(|c| c.len() as u64).sum::<u64>();
            assert_eq!(received, request.size);
            self.uploads.lock().unwrap().push((request.name.clone(), request.mime_type, received));
            Ok(format!("remote-{}", request.name))
        }
    }

    /// 前 `failures` 次调用失败
    struct FlakyUploader {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Uploader for FlakyUploader {
        async fn upload(&self, _request: UploadRequest, _cancel: CancellationToken) -> Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(DispatchError::upload_failed("remote returned 503"));
            }
            Ok("ok".to_string())
        }
    }

    /// 一直挂起直到被取消
    #[derive(Default)]
    struct BlockingUploader {
        started: Notify,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Uploader for BlockingUploader {
        async fn upload(&self, _request: UploadRequest, cancel: CancellationToken) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            cancel.cancelled().await;
            Err(DispatchError::Cancelled)
        }
    }

    /// 第一次调用挂起直到被取消，之后正常读完
    #[derive(Default)]
    struct GateUploader {
        started: Notify,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Uploader for GateUploader {
        async fn upload(&self, request: UploadRequest, cancel: CancellationToken) -> Result<String> {
            let first = {
                let mut seen = self.seen.lock().unwrap();
                seen.push(request.name.clone());
                seen.len() == 1
            };
            if first {
                self.started.notify_one();
                cancel.cancelled().await;
                return Err(DispatchError::Cancelled);
            }
            let _chunks: Vec<_> = request.body.try_collect().await?;
            Ok(request.name)
        }
    }

    fn write_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn memory_queue() -> TaskQueue {
        TaskQueue::from_store(Arc::new(MemoryStore::new(KeyField::Id)))
    }

    fn dispatcher(queue: &TaskQueue, uploader: Arc<dyn Uploader>) -> Dispatcher {
        let config = DispatcherConfig {
            poll_interval: Duration::from_millis(10),
            chunk_size: 4,
            ..Default::default()
        };
        Dispatcher::new(queue.clone(), uploader, config).with_retry_policy(RetryPolicy::immediate(10))
    }

    #[tokio::test]
    async fn test_pass_uploads_in_order_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let queue = memory_queue();
        let b = write_file(dir.path(), "b.png", b"bbbbbbbbbb");
        let a = write_file(dir.path(), "a.txt", b"hello");
        queue.create(NewTask::new(&b).with_created_at(2)).await.unwrap();
        queue.create(NewTask::new(&a).with_created_at(1)).await.unwrap();

        let uploader = Arc::new(RecordingUploader::default());
        let dispatcher = dispatcher(&queue, uploader.clone());
        let report = dispatcher.run_pass(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.uploaded, 2);
        assert_eq!(report.stop, PassStop::Exhausted);
        assert!(queue.list().await.unwrap().is_empty());
        assert!(dispatcher.status().progress.is_none());

        let uploads = uploader.uploads.lock().unwrap().clone();
        assert_eq!(
            uploads,
            vec![
                ("a.txt".to_string(), Some("text/plain; charset=utf-8".to_string()), 5),
                ("b.png".to_string(), Some("image/png".to_string()), 10),
            ]
        );
    }

    #[tokio::test]
    async fn test_pause_cancels_in_flight_upload() {
        let dir = tempfile::tempdir().unwrap();
        let queue = memory_queue();
        let path = write_file(dir.path(), "big.bin", &[1u8; 64]);
        let task = queue.create(NewTask::new(&path)).await.unwrap();

        let uploader = Arc::new(BlockingUploader::default());
        let dispatcher = dispatcher(&queue, uploader.clone());
        let handle = dispatcher.handle();

        let pass = tokio::spawn(async move { dispatcher.run_pass(&CancellationToken::new()).await });
        uploader.started.notified().await;

        let status = handle.status();
        assert!(!status.paused);
        assert_eq!(status.progress.map(|p| p.id), Some(task.id));

        assert!(handle.pause().paused);
        let report = tokio::time::timeout(Duration::from_secs(5), pass)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report.stop, PassStop::Paused);
        assert_eq!(report.attempted(), 0);
        assert!(handle.status().progress.is_none());

        // 被打断不记为失败
        let remaining = queue.list().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].attempts, 0);
    }

    #[tokio::test]
    async fn test_paused_dispatcher_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let queue = memory_queue();
        let path = write_file(dir.path(), "a.txt", b"a");
        queue.create(NewTask::new(&path)).await.unwrap();

        let uploader = Arc::new(BlockingUploader::default());
        let dispatcher = dispatcher(&queue, uploader.clone());
        dispatcher.pause();
        dispatcher.pause();

        let report = dispatcher.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.stop, PassStop::Paused);
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 0);
        assert!(dispatcher.status().progress.is_none());

        assert!(!dispatcher.resume().paused);
        assert!(!dispatcher.resume().paused);
    }

    #[tokio::test]
    async fn test_failed_task_retried_until_removed() {
        let dir = tempfile::tempdir().unwrap();
        let queue = memory_queue();
        let path = write_file(dir.path(), "a.txt", b"abc");
        queue.create(NewTask::new(&path)).await.unwrap();

        let uploader = Arc::new(FlakyUploader { failures: 2, calls: AtomicUsize::new(0) });
        let dispatcher = dispatcher(&queue, uploader.clone());
        let shutdown = CancellationToken::new();

        let mut passes = 0;
        while !queue.list().await.unwrap().is_empty() {
            passes += 1;
            assert!(passes <= 5, "task was never removed");
            dispatcher.run_pass(&shutdown).await.unwrap();
        }
        assert_eq!(passes, 3);
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_task_dead_lettered_after_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let queue = memory_queue();
        let path = write_file(dir.path(), "a.txt", b"abc");
        queue.create(NewTask::new(&path)).await.unwrap();

        let uploader = Arc::new(FlakyUploader { failures: usize::MAX, calls: AtomicUsize::new(0) });
        let dispatcher = dispatcher(&queue, uploader).with_retry_policy(RetryPolicy::immediate(2));
        let shutdown = CancellationToken::new();

        assert_eq!(dispatcher.run_pass(&shutdown).await.unwrap().failed, 1);
        assert_eq!(dispatcher.run_pass(&shutdown).await.unwrap().dead_lettered, 1);
        assert!(queue.list().await.unwrap().is_empty());

        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_missing_file_is_recorded_and_backoff_skips() {
        let queue = memory_queue();
        queue.create(NewTask::new("/definitely/not/here.bin")).await.unwrap();

        let uploader = Arc::new(RecordingUploader::default());
        let dispatcher = dispatcher(&queue, uploader).with_retry_policy(RetryPolicy::default());
        let shutdown = CancellationToken::new();

        let report = dispatcher.run_pass(&shutdown).await.unwrap();
        assert_eq!(report.failed, 1);

        let report = dispatcher.run_pass(&shutdown).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.attempted(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_pass() {
        let queue = memory_queue();
        queue.create(NewTask::new("a.txt")).await.unwrap();

        let uploader = Arc::new(BlockingUploader::default());
        let dispatcher = dispatcher(&queue, uploader.clone());
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let report = dispatcher.run_pass(&shutdown).await.unwrap();
        assert_eq!(report.stop, PassStop::Shutdown);
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_loop_drains_queue_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let queue = memory_queue();
        let uploader = Arc::new(RecordingUploader::default());
        let dispatcher = dispatcher(&queue, uploader.clone());
        let shutdown = CancellationToken::new();

        let worker = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { dispatcher.run(shutdown).await }
        });

        for name in ["1.txt", "2.txt", "3.txt"] {
            let path = write_file(dir.path(), name, name.as_bytes());
            queue.create(NewTask::new(path)).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while !queue.list().await.unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), worker).await.unwrap().unwrap();
        assert_eq!(uploader.uploads.lock().unwrap().len(), 3);
    }

    async fn wait_until<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_resume_retries_interrupted_task_first() {
        let dir = tempfile::tempdir().unwrap();
        let queue = memory_queue();
        let a = write_file(dir.path(), "a.txt", b"aaaa");
        let b = write_file(dir.path(), "b.txt", b"bbbb");
        queue.create(NewTask::new(&a).with_created_at(1)).await.unwrap();
        queue.create(NewTask::new(&b).with_created_at(2)).await.unwrap();

        let uploader = Arc::new(GateUploader::default());
        let dispatcher = dispatcher(&queue, uploader.clone());
        let handle = dispatcher.handle();
        let shutdown = CancellationToken::new();

        let worker = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { dispatcher.run(shutdown).await }
        });

        uploader.started.notified().await;
        handle.pause();
        wait_until(|| {
            let handle = handle.clone();
            async move { handle.status().progress.is_none() }
        })
        .await;
        assert_eq!(queue.list().await.unwrap().len(), 2);

        handle.resume();
        wait_until(|| {
            let queue = queue.clone();
            async move { queue.list().await.unwrap().is_empty() }
        })
        .await;

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), worker).await.unwrap().unwrap();
        assert_eq!(*uploader.seen.lock().unwrap(), vec!["a.txt", "a.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_in_flight_upload() {
        let dir = tempfile::tempdir().unwrap();
        let queue = memory_queue();
        let path = write_file(dir.path(), "a.txt", b"abc");
        queue.create(NewTask::new(&path)).await.unwrap();

        let uploader = Arc::new(BlockingUploader::default());
        let dispatcher = dispatcher(&queue, uploader.clone());
        let handle = dispatcher.handle();
        let shutdown = CancellationToken::new();

        let worker = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { dispatcher.run(shutdown).await }
        });

        uploader.started.notified().await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), worker).await.unwrap().unwrap();

        let remaining = queue.list().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].attempts, 0);
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 1);
        assert!(handle.status().progress.is_none());
    }
}
