use std::str::FromStr;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use super::errors::DispatchError;

/// 上传任务唯一标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// 存储写入时分配的版本号
///
/// 只能由存储层产生，删除和更新时必须带上，用来发现并发修改。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Revision(u64);

impl Revision {
    pub(crate) fn initial() -> Self {
        Self(1)
    }

    pub(crate) fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub(crate) fn from_raw(raw: i64) -> Self {
        Self(raw as u64)
    }

    pub(crate) fn raw(self) -> i64 {
        self.0 as i64
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// 存储记录的主键字段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyField {
    /// 以任务 ID 为键，同一个文件可以重复入队
    #[default]
    Id,
    /// 以文件名为键，同一个文件同时只能有一个待上传任务
    Filename,
}

impl FromStr for KeyField {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "id" => Ok(KeyField::Id),
            "filename" => Ok(KeyField::Filename),
            other => Err(DispatchError::config(format!("Unsupported key field: {other}"))),
        }
    }
}

/// 调度器运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum DispatcherState {
    Running,
    Paused,
}

impl DispatcherState {
    pub fn is_paused(&self) -> bool {
        matches!(self, DispatcherState::Paused)
    }
}

/// 调度器配置
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// 限速（字节/秒），<= 0 表示不限速
    pub rate: f64,
    /// 令牌桶容量（字节），<= 0 表示不限速
    pub capacity: i64,
    /// 队列为空时的轮询间隔
    pub poll_interval: Duration,
    /// 读取文件的分块大小
    pub chunk_size: usize,
    /// 启动时是否处于暂停状态
    pub start_paused: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            rate: 0.0,
            capacity: 0,
            poll_interval: Duration::from_secs(1),
            chunk_size: 64 * 1024, // 64KB
            start_paused: false,
        }
    }
}

// 静态断言确保类型是 Send的
const fn assert_send<T: Send + Sync>() {}

const _: () = {
    assert_send::<TaskId>();
    assert_send::<Revision>();
    assert_send::<DispatcherState>();
};
