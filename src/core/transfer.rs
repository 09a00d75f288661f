//! 文件传输：在任务已持有的连接上执行上传 / 删除 / 下载与校验

use crate::core::connection::ConnectionManager;
use crate::error::{SyncError, SyncResult};
use crate::models::Protocol;
use crate::storage::normalize_remote_path;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// FTP 操作与 WebDAV 上传/下载的超时
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);
/// WebDAV 删除的超时
pub const DELETE_TIMEOUT: Duration = Duration::from_secs(30);
/// 校验（查询远程大小）的超时
pub const VERIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// 同步操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOp {
    Upload,
    Delete,
    Download,
}

impl std::fmt::Display for SyncOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncOp::Upload => write!(f, "上传"),
            SyncOp::Delete => write!(f, "删除"),
            SyncOp::Download => write!(f, "下载"),
        }
    }
}

/// 引擎层超时。SFTP 依赖会话自身的 30s 超时。
fn operation_timeout(protocol: Protocol, op: SyncOp) -> Option<Duration> {
    match (protocol, op) {
        (Protocol::Sftp, _) => None,
        (Protocol::WebDav, SyncOp::Delete) => Some(DELETE_TIMEOUT),
        _ => Some(TRANSFER_TIMEOUT),
    }
}

async fn with_timeout<T>(
    limit: Option<Duration>,
    fut: impl Future<Output = SyncResult<T>>,
) -> SyncResult<T> {
    match limit {
        Some(d) => tokio::time::timeout(d, fut)
            .await
            .map_err(|_| SyncError::Timeout(d))?,
        None => fut.await,
    }
}

#[derive(Clone)]
pub struct TransferEngine {
    connections: Arc<ConnectionManager>,
}

impl TransferEngine {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// 执行一次同步操作，失败只记录日志并返回 false
    pub async fn sync(&self, task_id: &str, local: &Path, remote: &str, op: SyncOp) -> bool {
        match self.try_sync(task_id, local, remote, op).await {
            Ok(()) => true,
            Err(e) => {
                error!("{}失败: {}", op, e);
                false
            }
        }
    }

    /// 执行一次同步操作，错误附带任务 ID 和两端路径
    pub async fn try_sync(
        &self,
        task_id: &str,
        local: &Path,
        remote: &str,
        op: SyncOp,
    ) -> SyncResult<()> {
        let remote = normalize_remote_path(remote);
        self.run(task_id, local, &remote, op)
            .await
            .map_err(|e| e.for_file(task_id, local, &remote))
    }

    async fn run(&self, task_id: &str, local: &Path, remote: &str, op: SyncOp) -> SyncResult<()> {
        let conn = self
            .connections
            .get(task_id)
            .ok_or_else(|| SyncError::NotConnected(task_id.to_string()))?;
        let _permit = conn.acquire().await?;
        let storage = conn.storage();
        let limit = operation_timeout(conn.protocol, op);

        match op {
            SyncOp::Upload => {
                let bytes = with_timeout(limit, storage.upload(local, remote)).await?;
                info!("上传成功: {:?} -> {} ({} bytes)", local, remote, bytes);
            }
            SyncOp::Download => {
                let bytes = with_timeout(limit, storage.download(remote, local)).await?;
                info!("下载成功: {} -> {:?} ({} bytes)", remote, local, bytes);
            }
            SyncOp::Delete => {
                with_timeout(limit, storage.delete(remote)).await?;
                info!("删除成功: {}", remote);
            }
        }
        Ok(())
    }

    /// 比较本地和远程文件大小，不一致或查询失败都返回 false
    pub async fn verify(&self, task_id: &str, local: &Path, remote: &str) -> bool {
        match self.try_verify(task_id, local, remote).await {
            Ok(()) => true,
            Err(e) => {
                error!("校验失败: {}", e);
                false
            }
        }
    }

    pub async fn try_verify(&self, task_id: &str, local: &Path, remote: &str) -> SyncResult<()> {
        let remote = normalize_remote_path(remote);
        let result: SyncResult<()> = async {
            let local_size = tokio::fs::metadata(local).await?.len();
            let conn = self
                .connections
                .get(task_id)
                .ok_or_else(|| SyncError::NotConnected(task_id.to_string()))?;
            let _permit = conn.acquire().await?;
            let remote_size =
                with_timeout(Some(VERIFY_TIMEOUT), conn.storage().remote_size(&remote)).await?;

            if remote_size == Some(local_size) {
                debug!("校验通过: {} ({} bytes)", remote, local_size);
                Ok(())
            } else {
                Err(SyncError::VerificationMismatch {
                    remote: remote.clone(),
                    local_size,
                    remote_size,
                })
            }
        }
        .await;
        result.map_err(|e| e.for_file(task_id, local, &remote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use std::sync::atomic::Ordering;

    fn engine_with(protocol: Protocol) -> (TransferEngine, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new(protocol));
        let manager = Arc::new(ConnectionManager::new());
        manager.register("task", storage.clone()).unwrap();
        (TransferEngine::new(manager), storage)
    }

    #[tokio::test]
    async fn upload_into_missing_parents_then_verify() {
        let (engine, storage) = engine_with(Protocol::Sftp);
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("blob.bin");
        std::fs::write(&local, vec![7u8; 1024]).unwrap();

        assert!(engine.sync("task", &local, "/a/b/c/blob.bin", SyncOp::Upload).await);
        assert!(storage.has_dir("/a"));
        assert!(storage.has_dir("/a/b"));
        assert!(storage.has_dir("/a/b/c"));
        assert_eq!(storage.file("/a/b/c/blob.bin").unwrap().len(), 1024);
        assert!(engine.verify("task", &local, "/a/b/c/blob.bin").await);
    }

    #[tokio::test]
    async fn windows_style_remote_path_is_normalized() {
        let (engine, storage) = engine_with(Protocol::Ftp);
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("x.txt");
        std::fs::write(&local, b"x").unwrap();

        assert!(engine.sync("task", &local, "www\\x.txt", SyncOp::Upload).await);
        assert!(storage.file("/www/x.txt").is_some());
    }

    #[tokio::test]
    async fn deleting_missing_file_fails_but_task_stays_usable() {
        let (engine, storage) = engine_with(Protocol::WebDav);
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("gone.txt");

        let err = engine
            .try_sync("task", &local, "/nothing/here.txt", SyncOp::Delete)
            .await
            .unwrap_err();
        match &err {
            SyncError::File {
                task_id,
                remote,
                source,
                ..
            } => {
                assert_eq!(task_id, "task");
                assert_eq!(remote, "/nothing/here.txt");
                assert!(matches!(**source, SyncError::Transfer(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        std::fs::write(&local, b"back").unwrap();
        assert!(engine.sync("task", &local, "/r/gone.txt", SyncOp::Upload).await);
        assert!(engine.sync("task", &local, "/r/gone.txt", SyncOp::Delete).await);
        assert!(storage.file("/r/gone.txt").is_none());
    }

    #[tokio::test]
    async fn size_mismatch_fails_verification() {
        let (engine, storage) = engine_with(Protocol::Ftp);
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a.txt");
        std::fs::write(&local, b"abc").unwrap();
        assert!(engine.sync("task", &local, "/a.txt", SyncOp::Upload).await);

        storage.corrupt_sizes.store(true, Ordering::SeqCst);
        let err = engine.try_verify("task", &local, "/a.txt").await.unwrap_err();
        assert!(err.to_string().contains("校验失败"));
        assert!(!engine.verify("task", &local, "/missing.txt").await);
    }

    #[tokio::test]
    async fn unknown_task_is_not_connected() {
        let (engine, _) = engine_with(Protocol::Sftp);
        let err = engine
            .try_sync("other", Path::new("/tmp/x"), "/x", SyncOp::Upload)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::File { source, .. } if matches!(*source, SyncError::NotConnected(_))));
    }

    #[tokio::test]
    async fn download_writes_local_file() {
        let (engine, _) = engine_with(Protocol::WebDav);
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("up.txt");
        std::fs::write(&local, b"round").unwrap();
        assert!(engine.sync("task", &local, "/d/up.txt", SyncOp::Upload).await);

        let target = dir.path().join("nested/down.txt");
        assert!(engine.sync("task", &target, "/d/up.txt", SyncOp::Download).await);
        assert_eq!(std::fs::read(&target).unwrap(), b"round");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_operation_times_out() {
        let (engine, storage) = engine_with(Protocol::Ftp);
        storage.set_delay(Duration::from_secs(120));
        let err = engine
            .try_sync("task", Path::new("/tmp/none"), "/x", SyncOp::Delete)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::File { source, .. } if matches!(*source, SyncError::Timeout(_))));
    }

    #[tokio::test]
    async fn pool_bounds_parallel_uploads() {
        let (engine, storage) = engine_with(Protocol::WebDav);
        storage.set_delay(Duration::from_millis(50));
        let dir = tempfile::tempdir().unwrap();

        let mut jobs = Vec::new();
        for i in 0..10 {
            let local = dir.path().join(format!("{i}.txt"));
            std::fs::write(&local, b"p").unwrap();
            let engine = engine.clone();
            jobs.push(tokio::spawn(async move {
                engine
                    .sync("task", &local, &format!("/p/{i}.txt"), SyncOp::Upload)
                    .await
            }));
        }
        for job in jobs {
            assert!(job.await.unwrap());
        }
        assert!(storage.max_in_flight.load(Ordering::SeqCst) <= 4);
    }
}
