use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use chrono::Utc;
use super::errors::{DispatchError, Result};
use super::store::{StoreLocation, StoreRegistry};
use super::task::{NewTask, Task};
use super::traits::TaskStore;
use crate::utils::RetryPolicy;

/// 按创建时间排好序的任务快照
///
/// 快照在调用时取得，之后的写入不会影响已经取出的顺序。
#[derive(Debug)]
pub struct OrderedTasks {
    inner: std::vec::IntoIter<Task>,
}

impl Iterator for OrderedTasks {
    type Item = Task;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// 失败记录的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// 保留在队列中，`next_attempt_at` 之后重试
    Retrying { attempts: u32, next_attempt_at: i64 },
    /// 达到重试上限，已移入死信
    DeadLettered { attempts: u32 },
}

/// 持久化任务队列
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    last_timestamp: Arc<AtomicI64>,
}

impl TaskQueue {
    /// 通过注册表打开 URL 指定的后端
    pub async fn open(registry: &StoreRegistry, location: &StoreLocation) -> Result<Self> {
        let store = registry.open(location).await?;
        Ok(Self::from_store(store))
    }

    pub fn from_store(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            last_timestamp: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    /// 单调递增的纳秒时间戳，同一纳秒内的两次调用也不会重复
    pub fn now_nanos(&self) -> i64 {
        let wall = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let mut last = self.last_timestamp.load(Ordering::Relaxed);
        loop {
            let next = wall.max(last.saturating_add(1));
            match self.last_timestamp.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }

    pub async fn create(&self, new_task: NewTask) -> Result<Task> {
        let created_at = match new_task.created_at {
            Some(created_at) => created_at,
            None => self.now_nanos(),
        };
        let task = new_task.into_task(created_at)?;
        let stored = self.store.insert(task).await?;

        tracing::info!(
            task_id = %stored.id,
            filename = %stored.filename.display(),
            created_at = stored.created_at,
            "Task queued"
        );
        Ok(stored)
    }

    pub async fn query_ordered(&self) -> Result<OrderedTasks> {
        let tasks = self.store.list_ordered().await?;
        Ok(OrderedTasks { inner: tasks.into_iter() })
    }

    pub async fn list(&self) -> Result<Vec<Task>> {
        self.store.list_ordered().await
    }

    /// 按版本号删除；版本不一致返回 `ConflictingRevision`，不存在返回 `NotFound`
    pub async fn delete(&self, task: &Task) -> Result<()> {
        let revision = task.revision_or_err()?;
        self.store.delete(task.id, revision).await
    }

    /// 上传成功后移除，已经不存在视为成功
    pub async fn remove(&self, task: &Task) -> Result<()> {
        match self.delete(task).await {
            Err(DispatchError::NotFound(_)) => {
                tracing::debug!(task_id = %task.id, "Task already removed");
                Ok(())
            }
            other => other,
        }
    }

    /// 记录一次失败：累加次数并按退避策略安排下次执行，或者移入死信
    pub async fn record_failure(&self, task: &Task, error: &str, policy: &RetryPolicy) -> Result<FailureOutcome> {
        let attempts = task.attempts.saturating_add(1);
        let mut failed = task.clone();
        failed.attempts = attempts;
        failed.last_error = Some(error.to_string());

        if !policy.should_retry(attempts) {
            failed.next_attempt_at = None;
            self.store.dead_letter(&failed).await?;
            tracing::warn!(
                task_id = %task.id,
                filename = %task.filename.display(),
                attempts,
                error,
                "Task moved to dead letters"
            );
            return Ok(FailureOutcome::DeadLettered { attempts });
        }

        let delay = policy.backoff(attempts);
        let delay_nanos = i64::try_from(delay.as_nanos()).unwrap_or(i64::MAX);
        let next_attempt_at = self.now_nanos().saturating_add(delay_nanos);
        failed.next_attempt_at = Some(next_attempt_at);
        self.store.update(&failed).await?;

        tracing::info!(
            task_id = %task.id,
            attempts,
            delay_ms = delay.as_millis() as u64,
            error,
            "Task will be retried"
        );
        Ok(FailureOutcome::Retrying { attempts, next_attempt_at })
    }

    pub async fn dead_letters(&self) -> Result<Vec<Task>> {
        self.store.list_dead_letters().await
    }

    pub async fn close(&self) -> Result<()> {
        self.store.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::MemoryStore;
    use crate::core::types::KeyField;

    fn queue(key_field: KeyField) -> TaskQueue {
        TaskQueue::from_store(Arc::new(MemoryStore::new(key_field)))
    }

    #[tokio::test]
    async fn test_query_ordered_by_created_at_then_insertion() {
        let queue = queue(KeyField::Id);
        let late = queue.create(NewTask::new("late.bin").with_created_at(30)).await.unwrap();
        let first = queue.create(NewTask::new("first.bin").with_created_at(10)).await.unwrap();
        let tie = queue.create(NewTask::new("tie.bin").with_created_at(30)).await.unwrap();

        let mut ordered = queue.query_ordered().await.unwrap();
        assert_eq!(ordered.size_hint(), (3, Some(3)));
        assert_eq!(ordered.next().unwrap().id, first.id);

        // 快照之后的写入不影响本次迭代
        queue.create(NewTask::new("new.bin").with_created_at(0)).await.unwrap();
        let rest: Vec<_> = ordered.map(|t| t.id).collect();
        assert_eq!(rest, vec![late.id, tie.id]);
    }

    #[tokio::test]
    async fn test_assigned_timestamps_are_strictly_increasing() {
        let queue = queue(KeyField::Id);
        let mut last = 0;
        for i in 0..50 {
            let task = queue.create(NewTask::new(format!("{i}.bin"))).await.unwrap();
            assert!(task.created_at > last);
            last = task.created_at;
        }
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_through_remove() {
        let queue = queue(KeyField::Filename);
        let task = queue.create(NewTask::new("a.txt")).await.unwrap();

        queue.delete(&task).await.unwrap();
        assert!(matches!(queue.delete(&task).await, Err(DispatchError::NotFound(_))));
        queue.remove(&task).await.unwrap();
        assert!(queue.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_detects_stale_revision() {
        let queue = queue(KeyField::Id);
        let task = queue.create(NewTask::new("a.txt")).await.unwrap();
        queue.record_failure(&task, "boom", &RetryPolicy::immediate(3)).await.unwrap();

        let err = queue.remove(&task).await.unwrap_err();
        assert!(matches!(err, DispatchError::ConflictingRevision(_)));
        assert!(err.is_benign_race());
    }

    #[tokio::test]
    async fn test_record_failure_retries_then_dead_letters() {
        let queue = queue(KeyField::Id);
        let policy = RetryPolicy::immediate(2);
        let task = queue.create(NewTask::new("a.txt")).await.unwrap();

        let outcome = queue.record_failure(&task, "timeout", &policy).await.unwrap();
        assert!(matches!(outcome, FailureOutcome::Retrying { attempts: 1, .. }));

        let stored = queue.list().await.unwrap().remove(0);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.last_error.as_deref(), Some("timeout"));

        let outcome = queue.record_failure(&stored, "timeout again", &policy).await.unwrap();
        assert_eq!(outcome, FailureOutcome::DeadLettered { attempts: 2 });
        assert!(queue.list().await.unwrap().is_empty());

        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_error.as_deref(), Some("timeout again"));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_tasks() {
        let queue = queue(KeyField::Filename);
        assert!(matches!(queue.create(NewTask::new("")).await, Err(DispatchError::InvalidTask(_))));

        queue.create(NewTask::new("a.txt")).await.unwrap();
        assert!(matches!(queue.create(NewTask::new("a.txt")).await, Err(DispatchError::InvalidTask(_))));
    }
}
