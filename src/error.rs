//! 错误类型
//!
//! 所有错误都只影响产生它的单个任务或单个文件操作，不会终止其他任务或监控进程。

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// 文件或目录不可读（扫描时跳过，不会中断扫描）
    #[error("扫描失败: {path:?}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// 建立会话时的网络/认证失败
    #[error("连接失败: {0}")]
    Connection(String),

    /// HTTP 401 类错误，有单独的退避策略
    #[error("认证失败: {0}")]
    Auth(String),

    /// 上传/下载/删除过程中的远程权限或 IO 错误
    #[error("传输失败: {0}")]
    Transfer(String),

    #[error("校验失败: {remote} 远程大小 {remote_size:?}，本地大小 {local_size}")]
    VerificationMismatch {
        remote: String,
        local_size: u64,
        remote_size: Option<u64>,
    },

    #[error("任务 {0} 的连接已存在")]
    AlreadyExists(String),

    #[error("任务 {0} 未建立连接")]
    NotConnected(String),

    #[error("目录 {0:?} 已在监控中")]
    AlreadyMonitoring(PathBuf),

    /// 监控进程启动后立即退出
    #[error("监控失败: {0}")]
    Watcher(String),

    #[error("操作超时 ({0:?})")]
    Timeout(Duration),

    #[error("配置错误: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("序列化失败: {0}")]
    Json(#[from] serde_json::Error),

    /// 单个文件操作失败，附带任务 ID 和本地/远程路径
    #[error("任务 {task_id}: {local:?} -> {remote}: {source}")]
    File {
        task_id: String,
        local: PathBuf,
        remote: String,
        #[source]
        source: Box<SyncError>,
    },
}

impl SyncError {
    /// 为错误附加任务与路径上下文
    pub fn for_file(self, task_id: &str, local: impl Into<PathBuf>, remote: &str) -> Self {
        SyncError::File {
            task_id: task_id.to_string(),
            local: local.into(),
            remote: remote.to_string(),
            source: Box::new(self),
        }
    }

    pub fn is_auth(&self) -> bool {
        match self {
            SyncError::Auth(_) => true,
            SyncError::File { source, .. } => source.is_auth(),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.status() == Some(reqwest::StatusCode::UNAUTHORIZED) {
            SyncError::Auth(e.to_string())
        } else if e.is_connect() || e.is_timeout() {
            SyncError::Connection(e.to_string())
        } else {
            SyncError::Transfer(e.to_string())
        }
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        SyncError::Transfer(format!("后台任务异常退出: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_context_keeps_auth_classification() {
        let err = SyncError::Auth("401".into()).for_file("t1", "/tmp/a.txt", "/r/a.txt");
        assert!(err.is_auth());
        let msg = err.to_string();
        assert!(msg.contains("t1"));
        assert!(msg.contains("/r/a.txt"));
    }
}
