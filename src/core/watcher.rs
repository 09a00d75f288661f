//! 目录监控
//!
//! 每个本地目录一个独立的 tokio 任务，按扫描间隔轮询快照，
//! 通过无界通道向外发送文本事件。

use crate::core::comparator::{diff, ChangeSet};
use crate::core::snapshot::{Snapshot, SnapshotStore, Snapshotter};
use crate::error::{SyncError, SyncResult};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 需要同步的触发信号
pub const SYNC_REQUIRED: &str = "SYNC_REQUIRED";
/// 变化消息的前缀标记，后接 JSON
pub const CHANGE_MARKER: &str = "检测到文件变化";

/// 休眠时检查取消标志的粒度
const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Stopped,
    Starting,
    Running,
    /// 本轮扫描失败，等待下一轮
    Error,
    Stopping,
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub interval: Duration,
    /// 发出触发信号后多久把当前快照写为 previous
    pub settle_delay: Duration,
    /// 启动后等待多久检查工作任务是否存活
    pub startup_grace: Duration,
    pub stop_grace: Duration,
    pub kill_grace: Duration,
}

impl WatcherConfig {
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(crate::models::DEFAULT_SCAN_INTERVAL_SECS),
            settle_delay: Duration::from_millis(500),
            startup_grace: Duration::from_millis(500),
            stop_grace: Duration::from_secs(5),
            kill_grace: Duration::from_secs(1),
        }
    }
}

/// 监控通道中的一行消息
#[derive(Debug, Clone, PartialEq)]
pub enum WatchMessage {
    SyncRequired,
    Changes(ChangeSet),
    Info(String),
}

impl WatchMessage {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed == SYNC_REQUIRED {
            return WatchMessage::SyncRequired;
        }
        if let Some(pos) = trimmed.find(CHANGE_MARKER) {
            let rest = &trimmed[pos + CHANGE_MARKER.len()..];
            if let (Some(start), Some(end)) = (rest.find('{'), rest.rfind('}')) {
                if start < end {
                    if let Ok(changes) = serde_json::from_str(&rest[start..=end]) {
                        return WatchMessage::Changes(changes);
                    }
                }
            }
        }
        WatchMessage::Info(trimmed.to_string())
    }

    /// 生成变化消息文本
    pub fn changes_line(changes: &ChangeSet) -> SyncResult<String> {
        let json = serde_json::to_string(changes)?;
        Ok(format!("{}: {}", CHANGE_MARKER, json))
    }
}

fn set_state(state: &Mutex<WatcherState>, value: WatcherState) {
    if let Ok(mut s) = state.lock() {
        *s = value;
    }
}

struct WatchWorker {
    local_dir: PathBuf,
    store: SnapshotStore,
    config: WatcherConfig,
    cancel: Arc<AtomicBool>,
    events: UnboundedSender<String>,
    state: Arc<Mutex<WatcherState>>,
}

impl WatchWorker {
    fn emit(&self, line: impl Into<String>) {
        // 接收端已关闭时直接丢弃
        let _ = self.events.send(line.into());
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// 分片休眠，取消后尽快返回
    async fn sleep(&self, total: Duration) {
        let mut left = total;
        while !left.is_zero() && !self.cancelled() {
            let step = left.min(SLEEP_SLICE);
            tokio::time::sleep(step).await;
            left = left.saturating_sub(step);
        }
    }

    async fn scan(&self) -> SyncResult<Snapshot> {
        let root = self.local_dir.clone();
        let cancel = self.cancel.clone();
        tokio::task::spawn_blocking(move || Snapshotter::with_cancel(cancel).scan(&root)).await?
    }

    /// 首次扫描同时作为 current 和 previous，已有文件不算新增
    async fn baseline(&self) -> SyncResult<()> {
        let snapshot = self.scan().await?;
        self.store.save_current(&snapshot)?;
        self.store.save_previous(&snapshot)?;
        debug!("初始快照: {:?} ({} 个文件)", self.local_dir, snapshot.len());
        Ok(())
    }

    async fn poll_once(&self) -> SyncResult<()> {
        let current = self.scan().await?;
        if self.cancelled() {
            return Ok(());
        }
        let previous = self.store.load_previous();
        let changes = diff(&current, &previous);
        if changes.is_empty() {
            return Ok(());
        }

        info!(
            "检测到文件变化: {:?} 新增 {} 修改 {} 删除 {}",
            self.local_dir,
            changes.added.len(),
            changes.modified.len(),
            changes.deleted.len()
        );
        self.emit(WatchMessage::changes_line(&changes)?);
        self.store.save_current(&current)?;
        self.emit(SYNC_REQUIRED);

        // 触发信号先于 previous 落盘
        tokio::time::sleep(self.config.settle_delay).await;
        self.store.save_previous(&current)?;
        Ok(())
    }

    async fn run(self) {
        let state = self.state.clone();
        scopeguard::defer! {
            set_state(&state, WatcherState::Stopped);
        }

        self.emit(format!("开始监控目录: {}", self.local_dir.display()));
        if let Err(e) = self.baseline().await {
            warn!("初始扫描失败 {:?}: {}", self.local_dir, e);
            self.emit(format!("初始扫描失败: {}", e));
        }
        set_state(&self.state, WatcherState::Running);

        while !self.cancelled() {
            match self.poll_once().await {
                Ok(()) => set_state(&self.state, WatcherState::Running),
                Err(e) => {
                    set_state(&self.state, WatcherState::Error);
                    error!("监控目录时发生错误 {:?}: {}", self.local_dir, e);
                    self.emit(format!("监控目录时发生错误: {}", e));
                }
            }
            self.sleep(self.config.interval).await;
        }

        self.emit(format!("停止监控目录: {}", self.local_dir.display()));
    }
}

/// 单个目录的监控句柄
pub struct DirectoryWatcher {
    local_dir: PathBuf,
    cancel: Arc<AtomicBool>,
    state: Arc<Mutex<WatcherState>>,
    events: Option<UnboundedReceiver<String>>,
    handle: Option<JoinHandle<()>>,
    config: WatcherConfig,
}

impl DirectoryWatcher {
    fn spawn(local_dir: &Path, store: SnapshotStore, config: WatcherConfig) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let state = Arc::new(Mutex::new(WatcherState::Starting));
        let (tx, rx) = mpsc::unbounded_channel();

        let worker = WatchWorker {
            local_dir: local_dir.to_path_buf(),
            store,
            config: config.clone(),
            cancel: cancel.clone(),
            events: tx,
            state: state.clone(),
        };
        let handle = tokio::spawn(worker.run());

        Self {
            local_dir: local_dir.to_path_buf(),
            cancel,
            state,
            events: Some(rx),
            handle: Some(handle),
            config,
        }
    }

    pub fn local_dir(&self) -> &Path {
        &self.local_dir
    }

    pub fn state(&self) -> WatcherState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(WatcherState::Error)
    }

    pub fn is_alive(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// 非阻塞取出所有待处理消息
    pub fn drain(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(rx) = self.events.as_mut() {
            while let Ok(line) = rx.try_recv() {
                lines.push(line);
            }
        }
        lines
    }

    /// 停止监控：先请求退出，超时后强制中止。重复调用无副作用。
    pub async fn stop(&mut self) {
        let (stop_grace, kill_grace) = (self.config.stop_grace, self.config.kill_grace);
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(mut handle) = self.handle.take() {
            if !handle.is_finished() {
                set_state(&self.state, WatcherState::Stopping);
            }
            if tokio::time::timeout(stop_grace, &mut handle)
                .await
                .is_err()
            {
                warn!("监控任务未在时限内退出，强制终止: {:?}", self.local_dir);
                handle.abort();
                let _ = tokio::time::timeout(kill_grace, handle).await;
            }
        }
        self.events = None;
        set_state(&self.state, WatcherState::Stopped);
    }
}

/// 所有目录监控的注册表（以本地目录为键）
pub struct WatcherRegistry {
    data_dir: PathBuf,
    watchers: tokio::sync::Mutex<HashMap<PathBuf, DirectoryWatcher>>,
    /// 正在启动中的目录，启动期间不持有 watchers 锁
    starting: Arc<Mutex<HashSet<PathBuf>>>,
}

fn watch_key(local_dir: &Path) -> PathBuf {
    local_dir
        .canonicalize()
        .unwrap_or_else(|_| local_dir.to_path_buf())
}

impl WatcherRegistry {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            watchers: tokio::sync::Mutex::new(HashMap::new()),
            starting: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// 开始监控目录。已有存活的监控时拒绝；已退出的旧条目先清理。
    pub async fn start(
        &self,
        local_dir: &Path,
        remote_dir: &str,
        config: WatcherConfig,
    ) -> SyncResult<()> {
        if !local_dir.is_dir() {
            return Err(SyncError::Config(format!(
                "本地目录不存在: {}",
                local_dir.display()
            )));
        }

        let key = watch_key(local_dir);
        let dead = {
            let mut watchers = self.watchers.lock().await;
            let mut starting = self
                .starting
                .lock()
                .map_err(|_| SyncError::Watcher("监控注册表锁已损坏".into()))?;
            let alive = watchers.get(&key).map(DirectoryWatcher::is_alive).unwrap_or(false);
            if alive || starting.contains(&key) {
                warn!("目录已在监控中: {:?}", key);
                return Err(SyncError::AlreadyMonitoring(key));
            }
            starting.insert(key.clone());
            watchers.remove(&key)
        };

        let starting = self.starting.clone();
        let reserved = key.clone();
        let _reservation = scopeguard::guard((), move |_| {
            if let Ok(mut starting) = starting.lock() {
                starting.remove(&reserved);
            }
        });

        if let Some(mut dead) = dead {
            debug!("清理已退出的监控: {:?}", key);
            dead.stop().await;
        }

        let store = SnapshotStore::new(&self.data_dir, local_dir, remote_dir);
        let startup_grace = config.startup_grace;
        let mut watcher = DirectoryWatcher::spawn(local_dir, store, config);

        tokio::time::sleep(startup_grace).await;
        if !watcher.is_alive() {
            let lines = watcher.drain();
            watcher.stop().await;
            error!("监控进程启动失败: {:?} {:?}", key, lines);
            return Err(SyncError::Watcher(format!(
                "{} 的监控任务启动后立即退出",
                local_dir.display()
            )));
        }

        info!("开始监控目录: {:?}", key);
        self.watchers.lock().await.insert(key, watcher);
        Ok(())
    }

    pub async fn stop(&self, local_dir: &Path) {
        let key = watch_key(local_dir);
        let removed = self.watchers.lock().await.remove(&key);
        match removed {
            Some(mut watcher) => {
                watcher.stop().await;
                info!("已停止监控目录: {:?}", key);
            }
            None => debug!("目录未在监控中: {:?}", key),
        }
    }

    pub async fn stop_all(&self) {
        let all: Vec<DirectoryWatcher> = self.watchers.lock().await.drain().map(|(_, w)| w).collect();
        for mut watcher in all {
            watcher.stop().await;
        }
    }

    pub async fn is_monitoring(&self, local_dir: &Path) -> bool {
        self.watchers
            .lock()
            .await
            .get(&watch_key(local_dir))
            .map(DirectoryWatcher::is_alive)
            .unwrap_or(false)
    }

    pub async fn monitored_directories(&self) -> Vec<PathBuf> {
        self.watchers
            .lock()
            .await
            .values()
            .filter(|w| w.is_alive())
            .map(|w| w.local_dir().to_path_buf())
            .collect()
    }

    pub async fn state(&self, local_dir: &Path) -> WatcherState {
        self.watchers
            .lock()
            .await
            .get(&watch_key(local_dir))
            .map(DirectoryWatcher::state)
            .unwrap_or(WatcherState::Stopped)
    }

    pub async fn drain_events(&self, local_dir: &Path) -> Vec<String> {
        self.watchers
            .lock()
            .await
            .get_mut(&watch_key(local_dir))
            .map(DirectoryWatcher::drain)
            .unwrap_or_default()
    }
}
