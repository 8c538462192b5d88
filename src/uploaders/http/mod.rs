use std::time::Duration;
use async_trait::async_trait;
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::{Body, Client};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use crate::core::{DispatchError, Result, UploadRequest, Uploader};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// HTTP 上传器配置
#[derive(Debug, Clone)]
pub struct HttpUploaderConfig {
    pub endpoint: String,
    /// Bearer token，为空时不带认证头
    pub token: Option<String>,
    pub timeout: Duration,
}

impl Default for HttpUploaderConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080/upload".to_string(),
            token: None,
            timeout: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    id: String,
}

/// 以流式 POST 把文件发到远端
///
/// 文件名、描述和目标目录放在 `Upload-Metadata` 头里，值用 base64 编码。
pub struct HttpUploader {
    client: Client,
    config: HttpUploaderConfig,
}

impl HttpUploader {
    pub fn new(config: HttpUploaderConfig) -> Result<Self> {
        if config.endpoint.is_empty() {
            return Err(DispatchError::config("uploader endpoint is required"));
        }
        url::Url::parse(&config.endpoint)
            .map_err(|err| DispatchError::config(format!("Invalid uploader endpoint {:?}: {err}", config.endpoint)))?;

        let client = Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(Self { client, config })
    }

    async fn send(&self, request: UploadRequest) -> Result<String> {
        let metadata = encode_metadata(&request);
        let content_type = request.mime_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE).to_string();

        let mut builder = self.client
            .post(&self.config.endpoint)
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, request.size)
            .header("Upload-Metadata", metadata)
            .body(Body::wrap_stream(request.body));

        if let Some(token) = self.config.token.as_deref().filter(|t| !t.is_empty()) {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::upload_failed(format!(
                "{} responded {status}: {}",
                self.config.endpoint,
                body.trim()
            )));
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = response.text().await?;

        // 优先用响应体里的 id，其次 Location
        match serde_json::from_str::<UploadResponse>(&body) {
            Ok(parsed) => Ok(parsed.id),
            Err(_) => location.ok_or_else(|| {
                DispatchError::upload_failed("response carried neither an id nor a Location header")
            }),
        }
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self, request: UploadRequest, cancel: CancellationToken) -> Result<String> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DispatchError::Cancelled),
            result = self.send(request) => result,
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}

fn encode_metadata(request: &UploadRequest) -> String {
    let mut parts = vec![format!("filename {}", BASE64_STANDARD.encode(&request.name))];
    if !request.description.is_empty() {
        parts.push(format!("description {}", BASE64_STANDARD.encode(&request.description)));
    }
    if !request.parents.is_empty() {
        parts.push(format!("parents {}", BASE64_STANDARD.encode(request.parents.join(","))));
    }
    if let Some(mime_type) = &request.mime_type {
        parts.push(format!("filetype {}", BASE64_STANDARD.encode(mime_type)));
    }
    parts.join(",")
}
