use std::path::{Path, PathBuf};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use super::errors::{DispatchError, Result};
use super::types::{Revision, TaskId};

/// 新建任务的参数
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub filename: PathBuf,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    /// 不指定时由队列分配
    #[serde(default)]
    pub created_at: Option<i64>,
}

impl NewTask {
    pub fn new(filename: impl Into<PathBuf>) -> Self {
        Self {
            filename: filename.into(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_parents<I, S>(mut self, parents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parents = parents.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_created_at(mut self, created_at: i64) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// 校验并生成待入库的任务
    pub(crate) fn into_task(self, created_at: i64) -> Result<Task> {
        if self.filename.as_os_str().is_empty() {
            return Err(DispatchError::invalid_task("filename is required"));
        }
        if created_at < 0 {
            return Err(DispatchError::invalid_task("createdAt must not be negative"));
        }

        // 保持顺序去重
        let mut parents: Vec<String> = Vec::with_capacity(self.parents.len());
        for parent in self.parents {
            if parent.is_empty() {
                return Err(DispatchError::invalid_task("parent id must not be empty"));
            }
            if !parents.contains(&parent) {
                parents.push(parent);
            }
        }

        Ok(Task {
            id: TaskId::new(),
            filename: self.filename,
            description: self.description,
            parents,
            mime_type: self.mime_type.filter(|m| !m.is_empty()),
            created_at,
            attempts: 0,
            next_attempt_at: None,
            last_error: None,
            revision: None,
        })
    }
}

/// 上传任务
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub filename: PathBuf,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// 创建时间（纳秒），排序的唯一依据
    pub created_at: i64,
    /// 已失败的次数
    #[serde(default)]
    pub attempts: u32,
    /// 下次允许执行的时间（纳秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,
}

impl Task {
    pub fn created_at(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.created_at)
    }

    /// 上传到远端时使用的文件名
    pub fn display_name(&self) -> String {
        self.filename
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.filename.to_string_lossy().into_owned())
    }

    /// 是否到了可以执行的时间
    pub fn is_due(&self, now: i64) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// 每次执行时重新推断，不写回存储
    pub fn resolved_mime_type(&self) -> Option<String> {
        match &self.mime_type {
            Some(mime_type) if !mime_type.is_empty() => Some(mime_type.clone()),
            _ => mime_type_by_extension(&self.filename).map(String::from),
        }
    }

    pub(crate) fn revision_or_err(&self) -> Result<Revision> {
        self.revision.ok_or_else(|| {
            DispatchError::invalid_task(format!("task {} has no revision, it was never stored", self.id))
        })
    }
}

/// 按扩展名推断内容类型，无法识别时返回 None 交给远端处理
pub fn mime_type_by_extension(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime_type = match extension.as_str() {
        // Images
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "svg" => "image/svg+xml",
        "bmp" => "image/bmp",
        "ico" => "image/x-icon",
        "heic" => "image/heic",
        "tif" | "tiff" => "image/tiff",
        // Videos
        "mp4" => "video/mp4",
        "m4v" => "video/x-m4v",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "mkv" => "video/x-matroska",
        "ts" | "m2ts" => "video/mp2t",
        "flv" => "video/x-flv",
        "wmv" => "video/x-ms-wmv",
        // Audio
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "m4a" => "audio/mp4",
        "flac" => "audio/flac",
        "aac" => "audio/aac",
        // Documents
        "txt" => "text/plain; charset=utf-8",
        "csv" => "text/csv; charset=utf-8",
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" => "text/javascript; charset=utf-8",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        // Archives
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "7z" => "application/x-7z-compressed",
        _ => return None,
    };
    Some(mime_type)
}

/// 当前任务的进度
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub id: TaskId,
    pub filename: PathBuf,
    /// 完成百分比
    pub percent: f64,
    pub bytes_sent: u64,
    pub total_bytes: u64,
}

impl TaskStatus {
    pub fn new(task: &Task, total_bytes: u64) -> Self {
        Self {
            id: task.id,
            filename: task.filename.clone(),
            percent: 0.0,
            bytes_sent: 0,
            total_bytes,
        }
    }

    pub fn update(&mut self, bytes_sent: u64, total_bytes: u64) {
        self.bytes_sent = bytes_sent;
        self.total_bytes = total_bytes;
        self.percent = if total_bytes == 0 {
            0.0
        } else {
            (bytes_sent as f64 / total_bytes as f64 * 100.0).min(100.0)
        };
    }
}

/// 调度器状态快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherStatus {
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<TaskStatus>,
}
