use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use crate::core::errors::{DispatchError, Result};
use crate::core::task::Task;
use crate::core::traits::{StoreFactory, TaskStore};
use crate::core::types::{KeyField, Revision, TaskId};
use super::StoreLocation;

pub(super) const SCHEME: &str = "sqlite";

const TASK_COLUMNS: &str = "id, filename, description, parents, mime_type, created_at, attempts, next_attempt_at, last_error, revision";

// SQLITE_BUSY / SQLITE_LOCKED 及其扩展码
fn is_busy(db: &dyn sqlx::error::DatabaseError) -> bool {
    db.code()
        .and_then(|code| code.parse::<i32>().ok())
        .is_some_and(|code| matches!(code & 0xff, 5 | 6))
}

fn map_sqlx(err: sqlx::Error) -> DispatchError {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            DispatchError::invalid_task(format!("task is already queued: {}", db.message()))
        }
        sqlx::Error::Database(db) if is_busy(db.as_ref()) => {
            DispatchError::store_unavailable(format!("sqlite is busy: {}", db.message()))
        }
        sqlx::Error::Io(err) => DispatchError::store_unavailable(err.to_string()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            DispatchError::store_unavailable("sqlite pool is not available")
        }
        other => DispatchError::Sqlite(other),
    }
}

fn task_from_row(row: &SqliteRow) -> Result<Task> {
    let id: String = row.try_get("id")?;
    let id = TaskId::from_str(&id)
        .map_err(|err| DispatchError::store_unavailable(format!("corrupted task id {id:?}: {err}")))?;
    let filename: String = row.try_get("filename")?;
    let parents: String = row.try_get("parents")?;
    let attempts: i64 = row.try_get("attempts")?;
    let revision: i64 = row.try_get("revision")?;

    Ok(Task {
        id,
        filename: PathBuf::from(filename),
        description: row.try_get("description")?,
        parents: serde_json::from_str(&parents)?,
        mime_type: row.try_get("mime_type")?,
        created_at: row.try_get("created_at")?,
        attempts: attempts.clamp(0, u32::MAX as i64) as u32,
        next_attempt_at: row.try_get("next_attempt_at")?,
        last_error: row.try_get("last_error")?,
        revision: Some(Revision::from_raw(revision)),
    })
}

/// SQLite 任务存储
pub struct SqliteStore {
    pool: SqlitePool,
    key_field: KeyField,
}

impl SqliteStore {
    pub async fn connect(options: SqliteConnectOptions, key_field: KeyField) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "Failed to connect sqlite task store");
                DispatchError::store_unavailable(format!("Failed to connect sqlite: {err}"))
            })?;

        sqlx::migrate!().run(&pool).await.map_err(|err| {
            tracing::error!(error = %err, "Failed to migrate sqlite task store");
            err
        })?;

        Ok(Self { pool, key_field })
    }

    /// 从 `sqlite://<path>` 解析连接参数
    fn connect_options(location: &StoreLocation) -> Result<SqliteConnectOptions> {
        let url = &location.url;
        let raw = if url.cannot_be_a_base() {
            url.path().to_string()
        } else {
            format!("{}{}", url.host_str().unwrap_or_default(), url.path())
        };
        // URL 里的路径是百分号编码的
        let path = percent_decode_str(&raw)
            .decode_utf8()
            .map_err(|err| DispatchError::config(format!("Invalid sqlite path in {url}: {err}")))?
            .into_owned();

        if path.is_empty() {
            return Err(DispatchError::config(format!("Missing sqlite path in {url}")));
        }
        if path == ":memory:" {
            return SqliteConnectOptions::from_str("sqlite::memory:").map_err(map_sqlx);
        }

        let path = PathBuf::from(path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        Ok(SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal))
    }

    fn store_key(&self, task: &Task) -> String {
        match self.key_field {
            KeyField::Id => task.id.to_string(),
            KeyField::Filename => task.filename.to_string_lossy().into_owned(),
        }
    }

    /// 写操作没有命中行时，区分是不存在还是版本冲突
    async fn miss_reason(&self, id: TaskId) -> DispatchError {
        let exists = sqlx::query("SELECT 1 FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await;
        match exists {
            Ok(Some(_)) => DispatchError::ConflictingRevision(id.to_string()),
            Ok(None) => DispatchError::NotFound(id.to_string()),
            Err(err) => map_sqlx(err),
        }
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    fn backend(&self) -> &'static str {
        SCHEME
    }

    async fn insert(&self, mut task: Task) -> Result<Task> {
        let revision = Revision::initial();
        sqlx::query(
            "INSERT INTO tasks (id, store_key, filename, description, parents, mime_type, created_at, attempts, next_attempt_at, last_error, revision) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(task.id.to_string())
        .bind(self.store_key(&task))
        .bind(task.filename.to_string_lossy().into_owned())
        .bind(&task.description)
        .bind(serde_json::to_string(&task.parents)?)
        .bind(&task.mime_type)
        .bind(task.created_at)
        .bind(task.attempts as i64)
        .bind(task.next_attempt_at)
        .bind(&task.last_error)
        .bind(revision.raw())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        task.revision = Some(revision);
        Ok(task)
    }

    async fn list_ordered(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at ASC, seq ASC"))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(task_from_row).collect()
    }

    async fn update(&self, task: &Task) -> Result<Revision> {
        let revision = task.revision_or_err()?;
        let result = sqlx::query(
            "UPDATE tasks SET description = ?, parents = ?, mime_type = ?, attempts = ?, next_attempt_at = ?, last_error = ?, revision = revision + 1 \
             WHERE id = ? AND revision = ?",
        )
        .bind(&task.description)
        .bind(serde_json::to_string(&task.parents)?)
        .bind(&task.mime_type)
        .bind(task.attempts as i64)
        .bind(task.next_attempt_at)
        .bind(&task.last_error)
        .bind(task.id.to_string())
        .bind(revision.raw())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(self.miss_reason(task.id).await);
        }
        Ok(revision.next())
    }

    async fn delete(&self, id: TaskId, revision: Revision) -> Result<()> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ? AND revision = ?")
            .bind(id.to_string())
            .bind(revision.raw())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(self.miss_reason(id).await);
        }
        Ok(())
    }

    async fn dead_letter(&self, task: &Task) -> Result<()> {
        let revision = task.revision_or_err()?;
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let inserted = sqlx::query(
            "INSERT INTO dead_letters (id, filename, description, parents, mime_type, created_at, attempts, last_error, revision, dead_at) \
             SELECT id, filename, description, parents, mime_type, created_at, ?, ?, revision, ? FROM tasks WHERE id = ? AND revision = ?",
        )
        .bind(task.attempts as i64)
        .bind(&task.last_error)
        .bind(chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX))
        .bind(task.id.to_string())
        .bind(revision.raw())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await.map_err(map_sqlx)?;
            return Err(self.miss_reason(task.id).await);
        }

        sqlx::query("DELETE FROM tasks WHERE id = ? AND revision = ?")
            .bind(task.id.to_string())
            .bind(revision.raw())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn list_dead_letters(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT id, filename, description, parents, mime_type, created_at, attempts, NULL AS next_attempt_at, last_error, revision \
             FROM dead_letters ORDER BY seq ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(task_from_row).collect()
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// `sqlite://` 后端工厂
pub struct SqliteStoreFactory;

#[async_trait]
impl StoreFactory for SqliteStoreFactory {
    fn scheme(&self) -> &'static str {
        SCHEME
    }

    async fn open(&self, location: &StoreLocation) -> Result<Arc<dyn TaskStore>> {
        let options = SqliteStore::connect_options(location)?;
        let store = SqliteStore::connect(options, location.key_field).await?;
        Ok(Arc::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::NewTask;

    fn task(filename: &str, created_at: i64) -> Task {
        NewTask::new(filename)
            .with_description("desc")
            .with_parents(["folder-1", "folder-2"])
            .into_task(created_at)
            .unwrap()
    }

    async fn open(url: &str) -> Arc<dyn TaskStore> {
        let location = StoreLocation::parse(url, None).unwrap();
        SqliteStoreFactory.open(&location).await.unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_roundtrip_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("tasks.db").display());
        let store = open(&url).await;
        assert_eq!(store.backend(), "sqlite");

        let b = store.insert(task("b.bin", 20)).await.unwrap();
        let a = store.insert(task("a.bin", 10)).await.unwrap();
        let c = store.insert(task("c.bin", 20)).await.unwrap();

        let tasks = store.list_ordered().await.unwrap();
        assert_eq!(tasks.iter().map(|t| t.id).collect::<Vec<_>>(), vec![a.id, b.id, c.id]);
        assert_eq!(tasks[0], a);
        assert_eq!(tasks[0].parents, vec!["folder-1", "folder-2"]);

        store.close().await.unwrap();
        let reopened = open(&url).await;
        assert_eq!(reopened.list_ordered().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_sqlite_revision_conflicts() {
        let store = open("sqlite::memory:").await;
        let mut stored = store.insert(task("a.bin", 1)).await.unwrap();
        let stale = stored.clone();

        stored.attempts = 2;
        stored.next_attempt_at = Some(99);
        stored.last_error = Some("timeout".to_string());
        let next = store.update(&stored).await.unwrap();

        let fetched = store.list_ordered().await.unwrap().remove(0);
        assert_eq!(fetched.attempts, 2);
        assert_eq!(fetched.next_attempt_at, Some(99));
        assert_eq!(fetched.revision, Some(next));

        assert!(matches!(store.update(&stale).await, Err(DispatchError::ConflictingRevision(_))));
        assert!(matches!(
            store.delete(stale.id, stale.revision.unwrap()).await,
            Err(DispatchError::ConflictingRevision(_))
        ));

        store.delete(stored.id, next).await.unwrap();
        assert!(matches!(store.delete(stored.id, next).await, Err(DispatchError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_sqlite_filename_key_and_dead_letters() {
        let store = open("sqlite::memory:?key=filename").await;
        let mut stored = store.insert(task("a.bin", 1)).await.unwrap();
        assert!(matches!(store.insert(task("a.bin", 2)).await, Err(DispatchError::InvalidTask(_))));

        stored.attempts = 3;
        stored.last_error = Some("gone".to_string());
        store.dead_letter(&stored).await.unwrap();

        assert!(store.list_ordered().await.unwrap().is_empty());
        let dead = store.list_dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, stored.id);
        assert_eq!(dead[0].attempts, 3);

        // 死信之后同名文件可以重新入队
        store.insert(task("a.bin", 3)).await.unwrap();
    }

    #[tokio::test]
    async fn test_sqlite_path_is_percent_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("my dir").join("tasks.db");
        let location = StoreLocation::parse(&format!("sqlite://{}", db_path.display()), None).unwrap();

        let store = SqliteStoreFactory.open(&location).await.unwrap();
        store.insert(task("a.bin", 1)).await.unwrap();
        store.close().await.unwrap();

        assert!(db_path.exists());
        assert!(!dir.path().join("my%20dir").exists());
    }

    #[tokio::test]
    async fn test_busy_database_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("tasks.db");
        let store = open(&format!("sqlite://{}", db_path.display())).await;

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::new().filename(&db_path))
            .await
            .unwrap();
        let mut held = writer.acquire().await.unwrap();
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *held).await.unwrap();

        let contender = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(&db_path)
                    .busy_timeout(std::time::Duration::ZERO),
            )
            .await
            .unwrap();
        let err = sqlx::query("INSERT INTO dead_letters (id, filename, created_at, dead_at) VALUES ('x', 'x', 0, 0)")
            .execute(&contender)
            .await
            .unwrap_err();

        let mapped = map_sqlx(err);
        assert!(matches!(mapped, DispatchError::StoreUnavailable(_)), "{mapped:?}");
        assert!(mapped.is_retryable());

        sqlx::query("ROLLBACK").execute(&mut *held).await.unwrap();
        drop(held);
        store.close().await.unwrap();
    }
}
