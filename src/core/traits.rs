use std::pin::Pin;
use std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio_util::sync::CancellationToken;
use super::errors::Result;
use super::store::StoreLocation;
use super::task::Task;
use super::types::{Revision, TaskId};

/// 上传的字节流
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// 一次上传请求
pub struct UploadRequest {
    /// 远端文件名
    pub name: String,
    pub description: String,
    /// 目标目录
    pub parents: Vec<String>,
    pub mime_type: Option<String>,
    /// 文件总大小
    pub size: u64,
    pub body: ByteStream,
}

impl std::fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadRequest")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("parents", &self.parents)
            .field("mime_type", &self.mime_type)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// 上传器 - 把字节流传到远端存储
#[async_trait]
pub trait Uploader: Send + Sync {
    /// 上传并返回远端对象的标识
    ///
    /// `cancel` 被取消时应尽快返回 `DispatchError::Cancelled`。
    async fn upload(&self, request: UploadRequest, cancel: CancellationToken) -> Result<String>;

    /// 上传器名称，用于日志
    fn name(&self) -> &str {
        "uploader"
    }
}

/// 任务存储后端
///
/// 每次写入都会分配新的 `Revision`，更新和删除时必须匹配当前版本。
#[async_trait]
pub trait TaskStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// 写入新任务，返回带版本号的任务
    async fn insert(&self, task: Task) -> Result<Task>;

    /// 按 (created_at, 写入顺序) 升序返回全部待处理任务
    async fn list_ordered(&self) -> Result<Vec<Task>>;

    /// 按版本号更新，返回新版本号
    async fn update(&self, task: &Task) -> Result<Revision>;

    /// 按版本号删除
    async fn delete(&self, id: TaskId, revision: Revision) -> Result<()>;

    /// 按版本号把任务移入死信
    async fn dead_letter(&self, task: &Task) -> Result<()>;

    async fn list_dead_letters(&self) -> Result<Vec<Task>>;

    /// 关闭前落盘
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// 存储后端工厂，由 `StoreRegistry` 按 URL scheme 选择
#[async_trait]
pub trait StoreFactory: Send + Sync {
    fn scheme(&self) -> &'static str;

    async fn open(&self, location: &StoreLocation) -> Result<Arc<dyn TaskStore>>;
}
