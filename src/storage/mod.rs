pub mod ftp;
pub mod sftp;
pub mod webdav;

#[cfg(test)]
pub(crate) mod memory;

use crate::error::SyncResult;
use crate::models::{Protocol, SyncTask};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub use ftp::FtpStorage;
pub use sftp::SftpStorage;
pub use webdav::WebDavStorage;

// ============ 公共常量 ============

/// 建立 TCP / HTTP 连接的超时
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// 单次阻塞协议调用的超时（SFTP 会话、FTP 套接字读写）
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// 远程存储：三种协议实现同一组能力，在建立连接时选定一次
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// 用于日志的名称
    fn name(&self) -> &str;

    /// 递归创建远程目录，目录已存在视为成功
    async fn ensure_dir(&self, remote_dir: &str) -> SyncResult<()>;

    /// 上传文件（会先创建缺失的父目录），返回写入字节数
    async fn upload(&self, local: &Path, remote: &str) -> SyncResult<u64>;

    /// 下载文件到本地（会创建本地父目录），返回字节数
    async fn download(&self, remote: &str, local: &Path) -> SyncResult<u64>;

    async fn delete(&self, remote: &str) -> SyncResult<()>;

    /// 远程文件大小，不存在时返回 None
    async fn remote_size(&self, remote: &str) -> SyncResult<Option<u64>>;

    /// 关闭会话
    async fn close(&self) -> SyncResult<()>;
}

/// 根据任务协议建立会话（各协议自带重试策略）
pub async fn connect(task: &SyncTask) -> SyncResult<Arc<dyn RemoteStorage>> {
    task.validate()?;
    match task.protocol {
        Protocol::Sftp => {
            tracing::info!("创建SFTP连接: {}@{}", task.username, task.host);
            Ok(Arc::new(SftpStorage::connect(task).await?) as Arc<dyn RemoteStorage>)
        }
        Protocol::Ftp => {
            tracing::info!("创建FTP连接: {}@{}", task.username, task.host);
            Ok(Arc::new(FtpStorage::connect(task).await?) as Arc<dyn RemoteStorage>)
        }
        Protocol::WebDav => {
            tracing::info!("创建WebDAV连接: {}", task.host);
            Ok(Arc::new(WebDavStorage::connect(task).await?) as Arc<dyn RemoteStorage>)
        }
    }
}

/// 规范化远程路径：统一使用 `/`，以 `/` 开头，去掉重复和末尾的分隔符
pub fn normalize_remote_path(path: &str) -> String {
    let joined = path
        .replace('\\', "/")
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/");
    format!("/{}", joined)
}

/// 远程父目录，根目录返回 None
pub fn remote_parent(path: &str) -> Option<String> {
    let path = normalize_remote_path(path);
    let idx = path.rfind('/')?;
    if path == "/" {
        None
    } else if idx == 0 {
        Some("/".to_string())
    } else {
        Some(path[..idx].to_string())
    }
}

/// 从外到内列出需要存在的各级目录（不含根目录）
pub fn remote_ancestors(dir: &str) -> Vec<String> {
    let dir = normalize_remote_path(dir);
    let mut current = String::new();
    dir.split('/')
        .filter(|s| !s.is_empty())
        .map(|segment| {
            current.push('/');
            current.push_str(segment);
            current.clone()
        })
        .collect()
}
