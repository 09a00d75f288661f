//! WebDAV 存储（reqwest）
//!
//! 服务器返回 401 时重建 HTTP 会话并按 1s/2s/4s 退避重试。

use super::{normalize_remote_path, remote_ancestors, remote_parent, RemoteStorage};
use super::CONNECT_TIMEOUT;
use crate::core::retry::{retry_with_backoff, BackoffPolicy};
use crate::error::{SyncError, SyncResult};
use crate::models::{Protocol, SyncTask};
use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Client, Method, RequestBuilder, StatusCode};
use std::future::Future;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// 单个 HTTP 请求的上限
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const PROPFIND_SIZE_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:"><d:prop><d:getcontentlength/></d:prop></d:propfind>"#;

pub struct WebDavStorage {
    base_url: String,
    username: String,
    password: String,
    client: RwLock<Client>,
    name: String,
}

fn build_client() -> SyncResult<Client> {
    Client::builder()
        .pool_max_idle_per_host(10)
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| SyncError::Connection(format!("创建HTTP客户端失败: {}", e)))
}

fn dav_method(name: &'static str) -> SyncResult<Method> {
    Method::from_bytes(name.as_bytes())
        .map_err(|e| SyncError::Transfer(format!("无效的HTTP方法 {}: {}", name, e)))
}

fn status_error(action: &str, target: &str, status: StatusCode) -> SyncError {
    if status == StatusCode::UNAUTHORIZED {
        SyncError::Auth(format!("{} {}: HTTP {}", action, target, status))
    } else {
        SyncError::Transfer(format!("{} {}: HTTP {}", action, target, status))
    }
}

fn content_length_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<(?:[a-z0-9]+:)?getcontentlength[^>]*>\s*(\d+)\s*<").ok())
        .as_ref()
}

/// 从 PROPFIND 的 multistatus 响应中取出 getcontentlength
fn parse_content_length(xml: &str) -> Option<u64> {
    content_length_regex()?
        .captures(xml)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

impl WebDavStorage {
    pub async fn connect(task: &SyncTask) -> SyncResult<Self> {
        let base_url = task.host.trim_end_matches('/').to_string();
        let storage = Self {
            name: format!("webdav://{}@{}", task.username, base_url),
            base_url,
            username: task.username.clone(),
            password: task.password().unwrap_or_default().to_string(),
            client: RwLock::new(build_client()?),
        };

        storage
            .with_auth_retry("WebDAV连接认证", |client| {
                let storage = &storage;
                async move { storage.check_collection(&client, "/").await }
            })
            .await?;

        info!("WebDAV连接成功: {}", storage.name);
        Ok(storage)
    }

    fn url_for(&self, path: &str) -> String {
        let encoded: Vec<String> = normalize_remote_path(path)
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| urlencoding::encode(s).into_owned())
            .collect();
        format!("{}/{}", self.base_url, encoded.join("/"))
    }

    fn collection_url(&self, dir: &str) -> String {
        let url = self.url_for(dir);
        if url.ends_with('/') {
            url
        } else {
            format!("{}/", url)
        }
    }

    fn request(&self, client: &Client, method: Method, url: String) -> RequestBuilder {
        client
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
    }

    async fn client(&self) -> Client {
        self.client.read().await.clone()
    }

    /// 丢弃旧的连接池，换一个新的 HTTP 会话
    async fn refresh_client(&self) -> SyncResult<()> {
        let fresh = build_client()?;
        *self.client.write().await = fresh;
        debug!("WebDAV会话已重建: {}", self.name);
        Ok(())
    }

    async fn with_auth_retry<T, F, Fut>(&self, label: &str, op: F) -> SyncResult<T>
    where
        F: Fn(Client) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        retry_with_backoff(
            BackoffPolicy::webdav_auth(),
            label,
            SyncError::is_auth,
            |attempt| {
                let op = &op;
                async move {
                    if attempt > 0 {
                        self.refresh_client().await?;
                    }
                    op(self.client().await).await
                }
            },
        )
        .await
    }

    /// PROPFIND Depth: 0，207/200 表示目录存在
    async fn collection_exists(&self, client: &Client, dir: &str) -> SyncResult<bool> {
        let url = self.collection_url(dir);
        let resp = self
            .request(client, dav_method("PROPFIND")?, url.clone())
            .header("Depth", "0")
            .send()
            .await?;
        match resp.status() {
            StatusCode::MULTI_STATUS | StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(status_error("PROPFIND", &url, status)),
        }
    }

    async fn check_collection(&self, client: &Client, dir: &str) -> SyncResult<()> {
        if self.collection_exists(client, dir).await? {
            Ok(())
        } else {
            Err(SyncError::Connection(format!(
                "WebDAV目录不存在: {}",
                self.collection_url(dir)
            )))
        }
    }

    /// MKCOL，405 表示目录已被其他写入方创建
    async fn make_collection(&self, client: &Client, dir: &str) -> SyncResult<()> {
        let url = self.collection_url(dir);
        let resp = self
            .request(client, dav_method("MKCOL")?, url.clone())
            .send()
            .await?;
        match resp.status() {
            StatusCode::CREATED | StatusCode::OK => {
                debug!("创建远程目录: {}", dir);
                Ok(())
            }
            StatusCode::METHOD_NOT_ALLOWED => {
                debug!("远程目录已存在: {}", dir);
                Ok(())
            }
            status => Err(status_error("MKCOL", &url, status)),
        }
    }

    async fn ensure_dir_with(&self, client: &Client, dir: &str) -> SyncResult<()> {
        for ancestor in remote_ancestors(dir) {
            if !self.collection_exists(client, &ancestor).await? {
                self.make_collection(client, &ancestor).await?;
            }
        }
        Ok(())
    }

    async fn put_file(&self, client: &Client, local: &Path, remote: &str) -> SyncResult<u64> {
        if let Some(parent) = remote_parent(remote) {
            self.ensure_dir_with(client, &parent).await?;
        }

        let file = tokio::fs::File::open(local).await?;
        let size = file.metadata().await?.len();
        let url = self.url_for(remote);
        let resp = self
            .request(client, Method::PUT, url.clone())
            .header(CONTENT_LENGTH, size)
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?;

        match resp.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT => {
                debug!("WebDAV上传完成: {:?} -> {} ({} bytes)", local, remote, size);
                Ok(size)
            }
            status => Err(status_error("PUT", &url, status)),
        }
    }
}

#[async_trait]
impl RemoteStorage for WebDavStorage {
    fn protocol(&self) -> Protocol {
        Protocol::WebDav
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_dir(&self, remote_dir: &str) -> SyncResult<()> {
        self.with_auth_retry("WebDAV创建目录", |client| async move {
            self.ensure_dir_with(&client, remote_dir).await
        })
        .await
    }

    async fn upload(&self, local: &Path, remote: &str) -> SyncResult<u64> {
        let remote = normalize_remote_path(remote);
        let remote = remote.as_str();
        self.with_auth_retry("WebDAV上传", |client| async move {
            self.put_file(&client, local, remote).await
        })
        .await
    }

    async fn download(&self, remote: &str, local: &Path) -> SyncResult<u64> {
        let url = self.url_for(remote);
        let url = url.as_str();
        self.with_auth_retry("WebDAV下载", |client| async move {
            let resp = self
                .request(&client, Method::GET, url.to_string())
                .send()
                .await?;
            if resp.status() != StatusCode::OK {
                return Err(status_error("GET", url, resp.status()));
            }

            if let Some(parent) = local.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::File::create(local).await?;
            let mut total = 0u64;
            let mut body = resp.bytes_stream();
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                total += chunk.len() as u64;
            }
            file.flush().await?;
            Ok(total)
        })
        .await
    }

    async fn delete(&self, remote: &str) -> SyncResult<()> {
        let url = self.url_for(remote);
        let url = url.as_str();
        self.with_auth_retry("WebDAV删除", |client| async move {
            let resp = self
                .request(&client, Method::DELETE, url.to_string())
                .send()
                .await?;
            match resp.status() {
                StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::ACCEPTED => Ok(()),
                status => Err(status_error("DELETE", url, status)),
            }
        })
        .await
    }

    async fn remote_size(&self, remote: &str) -> SyncResult<Option<u64>> {
        let url = self.url_for(remote);
        let url = url.as_str();
        self.with_auth_retry("WebDAV获取文件信息", |client| async move {
            let resp = self
                .request(&client, dav_method("PROPFIND")?, url.to_string())
                .header("Depth", "0")
                .header(CONTENT_TYPE, "application/xml")
                .body(PROPFIND_SIZE_BODY)
                .send()
                .await?;
            match resp.status() {
                StatusCode::MULTI_STATUS | StatusCode::OK => {
                    let xml = resp.text().await?;
                    Ok(parse_content_length(&xml))
                }
                StatusCode::NOT_FOUND => Ok(None),
                status => Err(status_error("PROPFIND", url, status)),
            }
        })
        .await
    }

    async fn close(&self) -> SyncResult<()> {
        // reqwest 的连接池随 Client 一起释放
        self.refresh_client().await
    }
}
