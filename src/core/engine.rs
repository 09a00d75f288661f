use crate::core::comparator::ChangeSet;
use crate::core::connection::ConnectionManager;
use crate::core::snapshot::SnapshotStore;
use crate::core::transfer::{SyncOp, TransferEngine};
use crate::core::watcher::{WatchMessage, WatcherConfig, WatcherRegistry};
use crate::error::{SyncError, SyncResult};
use crate::models::SyncTask;
use crate::storage::normalize_remote_path;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 读取监控消息的间隔
pub const DRAIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    Completed,
    PartiallyFailed,
    Failed,
}

/// 一轮同步的结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub task_id: String,
    pub start_time: i64,
    pub end_time: i64,
    pub status: SyncStatus,
    pub files_uploaded: u32,
    pub files_deleted: u32,
    pub files_failed: u32,
    pub errors: Vec<String>,
}

/// 本地路径映射到远程路径；不在本地根目录下时返回 None
pub fn remote_path_for(local_root: &Path, remote_dir: &str, local_path: &Path) -> Option<String> {
    let relative = local_path.strip_prefix(local_root).ok()?;
    let mut remote = normalize_remote_path(remote_dir);
    for component in relative.components() {
        match component {
            Component::Normal(segment) => {
                if !remote.ends_with('/') {
                    remote.push('/');
                }
                remote.push_str(&segment.to_string_lossy());
            }
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(remote)
}

/// 快照里的路径都是规范化后的绝对路径
fn local_root(task: &SyncTask) -> PathBuf {
    task.local_dir
        .canonicalize()
        .unwrap_or_else(|_| task.local_dir.clone())
}

/// 把一组变化交给传输引擎：上传（含校验）与删除并发执行，由连接的并发上限约束
pub async fn sync_changes(
    transfer: &TransferEngine,
    task: &SyncTask,
    changes: &ChangeSet,
) -> SyncReport {
    let start_time = chrono::Utc::now().timestamp();
    let root = local_root(task);
    let mut errors = Vec::new();

    let mut uploads = Vec::new();
    for local in changes.uploads() {
        match remote_path_for(&root, &task.remote_dir, local) {
            Some(remote) => uploads.push(async move {
                if !transfer.sync(&task.id, local, &remote, SyncOp::Upload).await {
                    return Err(format!("上传失败: {:?}", local));
                }
                if !transfer.verify(&task.id, local, &remote).await {
                    return Err(format!("校验失败: {:?} -> {}", local, remote));
                }
                Ok(())
            }),
            None => errors.push(format!("路径不在同步目录内: {:?}", local)),
        }
    }

    let mut deletes = Vec::new();
    for local in &changes.deleted {
        match remote_path_for(&root, &task.remote_dir, local) {
            Some(remote) => deletes.push(async move {
                if transfer.sync(&task.id, local, &remote, SyncOp::Delete).await {
                    Ok(())
                } else {
                    Err(format!("删除失败: {}", remote))
                }
            }),
            None => errors.push(format!("路径不在同步目录内: {:?}", local)),
        }
    }

    let (upload_results, delete_results) = futures::join!(join_all(uploads), join_all(deletes));

    let mut files_uploaded = 0u32;
    let mut files_deleted = 0u32;
    for result in upload_results {
        match result {
            Ok(()) => files_uploaded += 1,
            Err(e) => errors.push(e),
        }
    }
    for result in delete_results {
        match result {
            Ok(()) => files_deleted += 1,
            Err(e) => errors.push(e),
        }
    }

    let files_failed = errors.len() as u32;
    let status = if files_failed == 0 {
        SyncStatus::Completed
    } else if files_uploaded + files_deleted == 0 {
        SyncStatus::Failed
    } else {
        SyncStatus::PartiallyFailed
    };

    let report = SyncReport {
        task_id: task.id.clone(),
        start_time,
        end_time: chrono::Utc::now().timestamp(),
        status,
        files_uploaded,
        files_deleted,
        files_failed,
        errors,
    };

    if files_failed == 0 {
        info!(
            "任务 {} 同步完成: 上传 {} 删除 {}",
            task.name, files_uploaded, files_deleted
        );
    } else {
        warn!(
            "任务 {} 同步结束: 上传 {} 删除 {} 失败 {}",
            task.name, files_uploaded, files_deleted, files_failed
        );
    }
    report
}

/// 单个任务的消息处理循环
struct TaskLoop {
    task: SyncTask,
    data_dir: PathBuf,
    transfer: TransferEngine,
    watchers: Arc<WatcherRegistry>,
    reports: broadcast::Sender<SyncReport>,
    interval: Duration,
    /// 尚未同步的变化；None 表示还没有收到变化明细
    pending: Option<ChangeSet>,
}

impl TaskLoop {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let lines = self.watchers.drain_events(&self.task.local_dir).await;
            self.handle_lines(lines).await;
        }
    }

    async fn handle_lines(&mut self, lines: Vec<String>) {
        for line in lines {
            match WatchMessage::parse(&line) {
                WatchMessage::Changes(changes) => {
                    debug!("任务 {} 收到 {} 项变化", self.task.name, changes.total());
                    self.pending
                        .get_or_insert_with(ChangeSet::default)
                        .merge(changes);
                }
                WatchMessage::SyncRequired => {
                    let changes = match self.pending.take() {
                        Some(changes) => changes,
                        None => self.full_upload_changes(),
                    };
                    if changes.is_empty() {
                        continue;
                    }
                    let report = sync_changes(&self.transfer, &self.task, &changes).await;
                    let _ = self.reports.send(report);
                }
                WatchMessage::Info(message) => info!("[{}] {}", self.task.name, message),
            }
        }
    }

    /// 没有变化明细时，按最近保存的快照整体上传
    fn full_upload_changes(&self) -> ChangeSet {
        let store = SnapshotStore::new(&self.data_dir, &self.task.local_dir, &self.task.remote_dir);
        let current = store.load_current();
        info!(
            "任务 {} 未收到变化明细，按当前快照上传 {} 个文件",
            self.task.name,
            current.len()
        );
        ChangeSet {
            added: current.paths().cloned().collect(),
            ..Default::default()
        }
    }
}

struct RunningTask {
    task: SyncTask,
    handle: JoinHandle<()>,
}

/// 同步服务：为每个任务维护一个连接、一个目录监控和一个消息循环
pub struct SyncService {
    data_dir: PathBuf,
    connections: Arc<ConnectionManager>,
    transfer: TransferEngine,
    watchers: Arc<WatcherRegistry>,
    running: Mutex<HashMap<String, RunningTask>>,
    reports: broadcast::Sender<SyncReport>,
    drain_interval: Duration,
}

impl SyncService {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let connections = Arc::new(ConnectionManager::new());
        let (reports, _) = broadcast::channel(64);
        Self {
            transfer: TransferEngine::new(connections.clone()),
            watchers: Arc::new(WatcherRegistry::new(&data_dir)),
            data_dir,
            connections,
            running: Mutex::new(HashMap::new()),
            reports,
            drain_interval: DRAIN_INTERVAL,
        }
    }

    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }

    /// 订阅每轮同步的结果
    pub fn subscribe(&self) -> broadcast::Receiver<SyncReport> {
        self.reports.subscribe()
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn transfer(&self) -> &TransferEngine {
        &self.transfer
    }

    pub fn watchers(&self) -> &Arc<WatcherRegistry> {
        &self.watchers
    }

    /// 启动任务：建立连接，再开始监控目录
    pub async fn start_task(&self, task: &SyncTask) -> SyncResult<()> {
        if self.running.lock().await.contains_key(&task.id) {
            return Err(SyncError::AlreadyExists(task.id.clone()));
        }
        task.validate()?;

        self.connections.create(&task.id, task).await?;
        if let Err(e) = self.start_monitoring(task).await {
            error!("任务 {} 启动监控失败: {}", task.name, e);
            self.connections.close(&task.id).await;
            return Err(e);
        }
        info!("任务 {} 已启动: {:?} -> {}", task.name, task.local_dir, task.remote_dir);
        Ok(())
    }

    /// 在已建立的连接上开始监控
    pub(crate) async fn start_monitoring(&self, task: &SyncTask) -> SyncResult<()> {
        let mut running = self.running.lock().await;
        if running.contains_key(&task.id) {
            return Err(SyncError::AlreadyExists(task.id.clone()));
        }

        self.watchers
            .start(
                &task.local_dir,
                &task.remote_dir,
                WatcherConfig::with_interval(task.scan_interval()),
            )
            .await?;

        let task_loop = TaskLoop {
            task: task.clone(),
            data_dir: self.data_dir.clone(),
            transfer: self.transfer.clone(),
            watchers: self.watchers.clone(),
            reports: self.reports.clone(),
            interval: self.drain_interval,
            pending: None,
        };
        let handle = tokio::spawn(task_loop.run());
        running.insert(
            task.id.clone(),
            RunningTask {
                task: task.clone(),
                handle,
            },
        );
        Ok(())
    }

    /// 停止任务：结束消息循环、停止监控、关闭连接
    pub async fn stop_task(&self, task_id: &str) -> bool {
        let Some(running) = self.running.lock().await.remove(task_id) else {
            debug!("任务 {} 未在运行", task_id);
            return false;
        };

        running.handle.abort();
        self.watchers.stop(&running.task.local_dir).await;
        self.connections.close(task_id).await;
        info!("任务 {} 已停止", running.task.name);
        true
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.running.lock().await.keys().cloned().collect();
        for id in ids {
            self.stop_task(&id).await;
        }
        self.watchers.stop_all().await;
        self.connections.close_all().await;
    }

    pub async fn is_running(&self, task_id: &str) -> bool {
        self.running.lock().await.contains_key(task_id)
    }

    pub async fn running_tasks(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::snapshot::Snapshotter;
    use crate::core::watcher::SYNC_REQUIRED;
    use crate::models::{Credential, Protocol};
    use crate::storage::memory::MemoryStorage;
    use std::collections::BTreeSet;
    use std::fs;
    use std::sync::atomic::Ordering;

    fn task_for(local: &Path, protocol: Protocol) -> SyncTask {
        SyncTask {
            id: "t".into(),
            name: "site".into(),
            protocol,
            host: "localhost".into(),
            port: None,
            username: "u".into(),
            credential: Credential::Password("p".into()),
            local_dir: local.to_path_buf(),
            remote_dir: "/www".into(),
            scan_interval: 1,
        }
    }

    fn memory_transfer(protocol: Protocol) -> (TransferEngine, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new(protocol));
        let manager = Arc::new(ConnectionManager::new());
        manager.register("t", storage.clone()).unwrap();
        (TransferEngine::new(manager), storage)
    }

    async fn eventually(check: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[test]
    fn maps_local_paths_under_remote_dir() {
        let root = Path::new("/data/site");
        assert_eq!(
            remote_path_for(root, "/www", Path::new("/data/site/css/main.css")).as_deref(),
            Some("/www/css/main.css")
        );
        assert_eq!(
            remote_path_for(root, "/", Path::new("/data/site/a.txt")).as_deref(),
            Some("/a.txt")
        );
        assert_eq!(remote_path_for(root, "/www", Path::new("/etc/passwd")), None);
    }

    #[tokio::test]
    async fn applies_uploads_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub/new.txt"), b"new").unwrap();

        let (transfer, storage) = memory_transfer(Protocol::Ftp);
        let task = task_for(dir.path(), Protocol::Ftp);
        let stale = root.join("old.txt");
        fs::write(&stale, b"old").unwrap();
        assert!(transfer.sync("t", &stale, "/www/old.txt", SyncOp::Upload).await);
        fs::remove_file(&stale).unwrap();

        let changes = ChangeSet {
            added: BTreeSet::from([root.join("sub/new.txt")]),
            modified: BTreeSet::new(),
            deleted: BTreeSet::from([stale]),
        };
        let report = sync_changes(&transfer, &task, &changes).await;

        assert_eq!(report.status, SyncStatus::Completed);
        assert_eq!((report.files_uploaded, report.files_deleted), (1, 1));
        assert_eq!(storage.file("/www/sub/new.txt").unwrap(), b"new");
        assert!(storage.file("/www/old.txt").is_none());
    }

    #[tokio::test]
    async fn failed_upload_is_reported_and_others_continue() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::write(root.join("a.txt"), b"a").unwrap();
        fs::write(root.join("b.txt"), b"b").unwrap();

        let (transfer, storage) = memory_transfer(Protocol::Sftp);
        storage.fail_uploads.store(1, Ordering::SeqCst);
        let task = task_for(dir.path(), Protocol::Sftp);
        let changes = ChangeSet {
            added: BTreeSet::from([root.join("a.txt"), root.join("b.txt")]),
            ..Default::default()
        };

        let report = sync_changes(&transfer, &task, &changes).await;
        assert_eq!(report.status, SyncStatus::PartiallyFailed);
        assert_eq!(report.files_uploaded, 1);
        assert_eq!(report.files_failed, 1);
    }

    #[tokio::test]
    async fn trigger_without_details_uploads_current_snapshot() {
        let data = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), b"<html>").unwrap();
        let task = task_for(dir.path(), Protocol::WebDav);

        let store = SnapshotStore::new(data.path(), &task.local_dir, &task.remote_dir);
        store
            .save_current(&Snapshotter::new().scan(dir.path()).unwrap())
            .unwrap();

        let (transfer, storage) = memory_transfer(Protocol::WebDav);
        let (reports, mut rx) = broadcast::channel(4);
        let mut task_loop = TaskLoop {
            task,
            data_dir: data.path().to_path_buf(),
            transfer,
            watchers: Arc::new(WatcherRegistry::new(data.path())),
            reports,
            interval: Duration::from_millis(100),
            pending: None,
        };
        task_loop.handle_lines(vec![SYNC_REQUIRED.to_string()]).await;

        assert_eq!(storage.file("/www/index.html").unwrap(), b"<html>");
        assert_eq!(rx.recv().await.unwrap().files_uploaded, 1);
    }

    #[tokio::test]
    async fn change_details_accumulate_until_trigger() {
        let data = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::write(root.join("one.txt"), b"1").unwrap();
        fs::write(root.join("two.txt"), b"2").unwrap();

        let (transfer, storage) = memory_transfer(Protocol::Ftp);
        let (reports, _rx) = broadcast::channel(4);
        let mut task_loop = TaskLoop {
            task: task_for(dir.path(), Protocol::Ftp),
            data_dir: data.path().to_path_buf(),
            transfer,
            watchers: Arc::new(WatcherRegistry::new(data.path())),
            reports,
            interval: Duration::from_millis(100),
            pending: None,
        };

        let first = ChangeSet {
            added: BTreeSet::from([root.join("one.txt")]),
            ..Default::default()
        };
        let second = ChangeSet {
            added: BTreeSet::from([root.join("two.txt")]),
            ..Default::default()
        };
        task_loop
            .handle_lines(vec![
                WatchMessage::changes_line(&first).unwrap(),
                "开始监控目录".to_string(),
                WatchMessage::changes_line(&second).unwrap(),
            ])
            .await;
        assert!(storage.file("/www/one.txt").is_none());
        assert_eq!(task_loop.pending.as_ref().map(ChangeSet::total), Some(2));

        task_loop.handle_lines(vec![SYNC_REQUIRED.to_string()]).await;
        assert!(storage.file("/www/one.txt").is_some());
        assert!(storage.file("/www/two.txt").is_some());
        assert!(task_loop.pending.is_none());
    }

    #[tokio::test]
    async fn watched_directory_is_mirrored_end_to_end() {
        let data = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let service = SyncService::new(data.path()).with_drain_interval(Duration::from_millis(100));
        let storage = Arc::new(MemoryStorage::new(Protocol::Ftp));
        service
            .connections()
            .register("t", storage.clone())
            .unwrap();
        let task = task_for(dir.path(), Protocol::Ftp);
        service.start_monitoring(&task).await.unwrap();
        assert!(service.is_running("t").await);

        let page = dir.path().join("docs/page.md");
        fs::create_dir_all(page.parent().unwrap()).unwrap();
        fs::write(&page, b"# hello").unwrap();
        assert!(eventually(|| storage.file("/www/docs/page.md").is_some()).await);

        fs::remove_file(&page).unwrap();
        assert!(eventually(|| storage.file("/www/docs/page.md").is_none()).await);

        assert!(service.stop_task("t").await);
        assert!(!service.stop_task("t").await);
        assert!(!service.connections().is_connected("t"));
        assert!(!service.watchers().is_monitoring(dir.path()).await);
        assert!(storage.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn invalid_task_is_rejected_before_connecting() {
        let data = tempfile::tempdir().unwrap();
        let service = SyncService::new(data.path());
        let mut task = task_for(data.path(), Protocol::WebDav);
        task.host = "dav.example.com".into();

        let result = service.start_task(&task).await;
        assert!(matches!(result, Err(SyncError::Config(_))));
        assert!(service.running_tasks().await.is_empty());
    }
}
