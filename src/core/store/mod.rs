//! 任务存储后端
//!
//! 后端由 URL 的 scheme 选择：
//! - `mem://<collection>/<keyField>[?localfile=<path>]` 进程内存储，可选落盘到本地 JSON 文件
//! - `sqlite://<path>[?key=<keyField>]` SQLite 持久化存储
//!
//! 选择通过显式传入的 `StoreRegistry` 完成，没有全局注册表。

mod memory;
mod sqlite;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;
use super::errors::{DispatchError, Result};
use super::traits::{StoreFactory, TaskStore};
use super::types::KeyField;

pub use memory::{MemoryStore, MemoryStoreFactory};
pub use sqlite::{SqliteStore, SqliteStoreFactory};

/// 解析后的存储位置
#[derive(Debug, Clone)]
pub struct StoreLocation {
    pub url: Url,
    pub key_field: KeyField,
    /// mem 后端的落盘文件
    pub localfile: Option<PathBuf>,
}

impl StoreLocation {
    /// 解析存储 URL；`localfile` 来自配置文件，URL 中的 `localfile` 参数优先
    pub fn parse(url: &str, localfile: Option<&Path>) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|err| DispatchError::config(format!("Invalid store url {url:?}: {err}")))?;

        let mut key_field = None;
        let mut query_localfile = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "key" | "keyField" => key_field = Some(value.parse::<KeyField>()?),
                "localfile" if !value.is_empty() => query_localfile = Some(PathBuf::from(value.as_ref())),
                _ => {}
            }
        }

        // mem://collection/Filename 形式，最后一段路径是主键字段
        if key_field.is_none() && url.scheme() == memory::SCHEME {
            let last_segment = url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .unwrap_or_default();
            key_field = Some(last_segment.parse::<KeyField>()?);
        }

        Ok(Self {
            key_field: key_field.unwrap_or_default(),
            localfile: query_localfile.or_else(|| localfile.map(Path::to_path_buf)),
            url,
        })
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }
}

/// 存储后端注册表
#[derive(Clone, Default)]
pub struct StoreRegistry {
    factories: HashMap<&'static str, Arc<dyn StoreFactory>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册内置的 mem 和 sqlite 后端
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register(MemoryStoreFactory)
            .register(SqliteStoreFactory);
        registry
    }

    pub fn register(&mut self, factory: impl StoreFactory + 'static) -> &mut Self {
        self.factories.insert(factory.scheme(), Arc::new(factory));
        self
    }

    pub fn schemes(&self) -> Vec<&'static str> {
        let mut schemes: Vec<_> = self.factories.keys().copied().collect();
        schemes.sort_unstable();
        schemes
    }

    pub async fn open(&self, location: &StoreLocation) -> Result<Arc<dyn TaskStore>> {
        let factory = self.factories.get(location.scheme()).ok_or_else(|| {
            DispatchError::config(format!(
                "Unsupported store scheme {:?}, expected one of {:?}",
                location.scheme(),
                self.schemes()
            ))
        })?;

        tracing::info!(
            url = %location.url,
            backend = factory.scheme(),
            key_field = ?location.key_field,
            localfile = ?location.localfile,
            "Opening task store"
        );
        factory.open(location).await
    }
}
