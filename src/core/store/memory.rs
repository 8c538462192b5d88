use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use crate::core::errors::{DispatchError, Result};
use crate::core::task::Task;
use crate::core::traits::{StoreFactory, TaskStore};
use crate::core::types::{KeyField, Revision, TaskId};
use super::StoreLocation;

pub(super) const SCHEME: &str = "mem";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    /// 写入顺序，created_at 相同时用来排序
    seq: u64,
    task: Task,
}

/// 落盘文件格式
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    next_seq: u64,
    tasks: Vec<Record>,
    #[serde(default)]
    dead_letters: Vec<Task>,
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<TaskId, Record>,
    /// 主键 -> 任务 ID
    keys: HashMap<String, TaskId>,
    dead_letters: Vec<Task>,
    next_seq: u64,
}

impl Inner {
    fn snapshot(&self) -> Snapshot {
        let mut tasks: Vec<Record> = self.records.values().cloned().collect();
        tasks.sort_by_key(|record| record.seq);
        Snapshot {
            next_seq: self.next_seq,
            tasks,
            dead_letters: self.dead_letters.clone(),
        }
    }

    fn checked_record(&self, id: TaskId, revision: Revision) -> Result<&Record> {
        let record = self.records
            .get(&id)
            .ok_or_else(|| DispatchError::NotFound(id.to_string()))?;
        if record.task.revision != Some(revision) {
            return Err(DispatchError::ConflictingRevision(id.to_string()));
        }
        Ok(record)
    }

    fn remove(&mut self, id: TaskId, key_field: KeyField) -> Option<Record> {
        let record = self.records.remove(&id)?;
        self.keys.remove(&store_key(&record.task, key_field));
        Some(record)
    }
}

fn store_key(task: &Task, key_field: KeyField) -> String {
    match key_field {
        KeyField::Id => task.id.to_string(),
        KeyField::Filename => task.filename.to_string_lossy().into_owned(),
    }
}

/// 进程内任务存储
///
/// 配置了 `localfile` 时，每次写入后把全部数据重写到该文件，启动时从文件恢复。
pub struct MemoryStore {
    key_field: KeyField,
    localfile: Option<PathBuf>,
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new(key_field: KeyField) -> Self {
        Self {
            key_field,
            localfile: None,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// 打开带落盘文件的存储，文件不存在时从空开始
    pub async fn open(key_field: KeyField, localfile: Option<PathBuf>) -> Result<Self> {
        let mut inner = Inner::default();

        if let Some(path) = &localfile {
            if tokio::fs::try_exists(path).await? {
                let data = tokio::fs::read_to_string(path).await?;
                let snapshot: Snapshot = if data.trim().is_empty() {
                    Snapshot::default()
                } else {
                    serde_json::from_str(&data).map_err(|err| {
                        DispatchError::store_unavailable(format!(
                            "Failed to restore tasks from {}: {err}",
                            path.display()
                        ))
                    })?
                };

                inner.next_seq = snapshot.next_seq;
                for record in snapshot.tasks {
                    inner.next_seq = inner.next_seq.max(record.seq + 1);
                    let key = store_key(&record.task, key_field);
                    if inner.keys.contains_key(&key) {
                        tracing::warn!(key = %key, task_id = %record.task.id, "Skipping duplicate task while restoring");
                        continue;
                    }
                    inner.keys.insert(key, record.task.id);
                    inner.records.insert(record.task.id, record);
                }
                inner.dead_letters = snapshot.dead_letters;

                tracing::info!(
                    path = %path.display(),
                    tasks = inner.records.len(),
                    dead_letters = inner.dead_letters.len(),
                    "Restored tasks from local file"
                );
            }
        }

        Ok(Self {
            key_field,
            localfile,
            inner: RwLock::new(inner),
        })
    }

    /// 先写临时文件再 rename，避免写到一半的文件
    async fn persist(&self, inner: &Inner) -> Result<()> {
        let Some(path) = &self.localfile else {
            return Ok(());
        };

        let data = serde_json::to_string_pretty(&inner.snapshot())?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn persist_or_unavailable(&self, inner: &Inner) -> Result<()> {
        self.persist(inner).await.map_err(|err| {
            tracing::error!(error = %err, localfile = ?self.localfile, "Failed to persist task store");
            DispatchError::store_unavailable(format!("Failed to persist task store: {err}"))
        })
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    fn backend(&self) -> &'static str {
        SCHEME
    }

    async fn insert(&self, mut task: Task) -> Result<Task> {
        let mut inner = self.inner.write().await;

        let key = store_key(&task, self.key_field);
        if inner.keys.contains_key(&key) {
            return Err(DispatchError::invalid_task(format!("{key} is already queued")));
        }

        task.revision = Some(Revision::initial());
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.keys.insert(key, task.id);
        inner.records.insert(task.id, Record { seq, task: task.clone() });

        if let Err(err) = self.persist_or_unavailable(&inner).await {
            inner.remove(task.id, self.key_field);
            return Err(err);
        }

        Ok(task)
    }

    async fn list_ordered(&self) -> Result<Vec<Task>> {
        let inner = self.inner.read().await;
        let mut records: Vec<&Record> = inner.records.values().collect();
        records.sort_by_key(|record| (record.task.created_at, record.seq));
        Ok(records.into_iter().map(|record| record.task.clone()).collect())
    }

    async fn update(&self, task: &Task) -> Result<Revision> {
        let mut inner = self.inner.write().await;
        let revision = task.revision_or_err()?;
        let previous = inner.checked_record(task.id, revision)?.task.clone();

        let next_revision = revision.next();
        if let Some(record) = inner.records.get_mut(&task.id) {
            // filename 和 created_at 不可变
            record.task.description = task.description.clone();
            record.task.parents = task.parents.clone();
            record.task.mime_type = task.mime_type.clone();
            record.task.attempts = task.attempts;
            record.task.next_attempt_at = task.next_attempt_at;
            record.task.last_error = task.last_error.clone();
            record.task.revision = Some(next_revision);
        }

        if let Err(err) = self.persist_or_unavailable(&inner).await {
            if let Some(record) = inner.records.get_mut(&task.id) {
                record.task = previous;
            }
            return Err(err);
        }

        Ok(next_revision)
    }

    async fn delete(&self, id: TaskId, revision: Revision) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.checked_record(id, revision)?;

        let Some(record) = inner.remove(id, self.key_field) else {
            return Err(DispatchError::NotFound(id.to_string()));
        };

        if let Err(err) = self.persist_or_unavailable(&inner).await {
            inner.keys.insert(store_key(&record.task, self.key_field), id);
            inner.records.insert(id, record);
            return Err(err);
        }

        Ok(())
    }

    async fn dead_letter(&self, task: &Task) -> Result<()> {
        let mut inner = self.inner.write().await;
        let revision = task.revision_or_err()?;
        inner.checked_record(task.id, revision)?;

        let Some(record) = inner.remove(task.id, self.key_field) else {
            return Err(DispatchError::NotFound(task.id.to_string()));
        };
        let mut dead = record.task.clone();
        dead.attempts = task.attempts;
        dead.last_error = task.last_error.clone();
        dead.next_attempt_at = None;
        inner.dead_letters.push(dead);

        if let Err(err) = self.persist_or_unavailable(&inner).await {
            inner.dead_letters.pop();
            inner.keys.insert(store_key(&record.task, self.key_field), task.id);
            inner.records.insert(task.id, record);
            return Err(err);
        }

        Ok(())
    }

    async fn list_dead_letters(&self) -> Result<Vec<Task>> {
        Ok(self.inner.read().await.dead_letters.clone())
    }

    async fn close(&self) -> Result<()> {
        let inner = self.inner.read().await;
        self.persist(&inner).await
    }
}

/// `mem://` 后端工厂
pub struct MemoryStoreFactory;

#[async_trait]
impl StoreFactory for MemoryStoreFactory {
    fn scheme(&self) -> &'static str {
        SCHEME
    }

    async fn open(&self, location: &StoreLocation) -> Result<Arc<dyn TaskStore>> {
        let store = MemoryStore::open(location.key_field, location.localfile.clone()).await?;
        Ok(Arc::new(store))
    }
}
