//! 连接管理：每个任务 ID 只持有一个远程会话

use crate::error::{SyncError, SyncResult};
use crate::models::{Protocol, SyncTask};
use crate::storage::{self, RemoteStorage};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{MutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

/// FTP / WebDAV 每个任务的并发上限
pub const POOL_SIZE: usize = 4;

/// 关闭连接时等待在途操作结束的上限
const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// 每个连接的并发控制：SFTP 独占，其余协议固定大小的池
pub enum Limiter {
    /// 锁内为 true 表示连接已关闭
    Exclusive(tokio::sync::Mutex<bool>),
    Pool(Arc<Semaphore>),
}

/// 持有期间占用一个操作名额
pub struct Permit<'a> {
    _exclusive: Option<MutexGuard<'a, bool>>,
    _pooled: Option<OwnedSemaphorePermit>,
}

impl Limiter {
    pub fn for_protocol(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Sftp => Limiter::Exclusive(tokio::sync::Mutex::new(false)),
            Protocol::Ftp | Protocol::WebDav => Limiter::Pool(Arc::new(Semaphore::new(POOL_SIZE))),
        }
    }

    pub async fn acquire(&self) -> SyncResult<Permit<'_>> {
        match self {
            Limiter::Exclusive(lock) => {
                let guard = lock.lock().await;
                if *guard {
                    return Err(SyncError::Transfer("连接已关闭".into()));
                }
                Ok(Permit {
                    _exclusive: Some(guard),
                    _pooled: None,
                })
            }
            Limiter::Pool(sem) => {
                let permit = sem
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| SyncError::Transfer("连接已关闭".into()))?;
                Ok(Permit {
                    _exclusive: None,
                    _pooled: Some(permit),
                })
            }
        }
    }

    /// 等待所有在途操作结束，并拒绝后续操作
    async fn drain(&self) {
        match self {
            Limiter::Exclusive(lock) => {
                *lock.lock().await = true;
            }
            Limiter::Pool(sem) => {
                if let Ok(all) = sem.acquire_many(POOL_SIZE as u32).await {
                    all.forget();
                }
                sem.close();
            }
        }
    }
}

/// 一个任务的活动会话
pub struct Connection {
    pub task_id: String,
    pub protocol: Protocol,
    storage: Arc<dyn RemoteStorage>,
    limiter: Limiter,
}

impl Connection {
    fn new(task_id: &str, storage: Arc<dyn RemoteStorage>) -> Self {
        let protocol = storage.protocol();
        Self {
            task_id: task_id.to_string(),
            protocol,
            storage,
            limiter: Limiter::for_protocol(protocol),
        }
    }

    pub fn storage(&self) -> &dyn RemoteStorage {
        self.storage.as_ref()
    }

    pub async fn acquire(&self) -> SyncResult<Permit<'_>> {
        self.limiter.acquire().await
    }
}

#[derive(Default)]
struct Registry {
    active: HashMap<String, Arc<Connection>>,
    /// 正在建立中的任务 ID
    pending: HashSet<String>,
}

/// 任务 ID -> 连接 的注册表
#[derive(Default)]
pub struct ConnectionManager {
    registry: Arc<Mutex<Registry>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> SyncResult<std::sync::MutexGuard<'_, Registry>> {
        self.registry
            .lock()
            .map_err(|_| SyncError::Transfer("连接注册表锁已损坏".into()))
    }

    /// 为任务建立连接；同一 ID 已有连接或正在建立时拒绝
    pub async fn create(&self, task_id: &str, task: &SyncTask) -> SyncResult<()> {
        {
            let mut reg = self.lock()?;
            if reg.active.contains_key(task_id) || reg.pending.contains(task_id) {
                warn!("任务 {} 的连接已存在", task_id);
                return Err(SyncError::AlreadyExists(task_id.to_string()));
            }
            reg.pending.insert(task_id.to_string());
        }

        // 建立过程被取消时也要释放占位
        let registry = self.registry.clone();
        let id = task_id.to_string();
        let _reservation = scopeguard::guard((), move |_| {
            if let Ok(mut reg) = registry.lock() {
                reg.pending.remove(&id);
            }
        });

        match storage::connect(task).await {
            Ok(storage) => {
                info!("任务 {} 已连接: {}", task_id, storage.name());
                self.register(task_id, storage)
            }
            Err(e) => {
                error!("任务 {} 建立{}连接失败: {}", task_id, task.protocol, e);
                Err(e)
            }
        }
    }

    /// 直接登记一个已建立的会话
    pub(crate) fn register(&self, task_id: &str, storage: Arc<dyn RemoteStorage>) -> SyncResult<()> {
        let mut reg = self.lock()?;
        if reg.active.contains_key(task_id) {
            return Err(SyncError::AlreadyExists(task_id.to_string()));
        }
        reg.active
            .insert(task_id.to_string(), Arc::new(Connection::new(task_id, storage)));
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<Connection>> {
        self.lock().ok()?.active.get(task_id).cloned()
    }

    pub fn is_connected(&self, task_id: &str) -> bool {
        self.get(task_id).is_some()
    }

    pub fn active_tasks(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .map(|reg| reg.active.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// 关闭连接：先等在途操作结束再关闭会话，失败只记录日志
    pub async fn close(&self, task_id: &str) {
        let removed = match self.lock() {
            Ok(mut reg) => reg.active.remove(task_id),
            Err(e) => {
                error!("关闭连接失败: {}", e);
                return;
            }
        };
        let Some(conn) = removed else {
            debug!("任务 {} 没有活动连接", task_id);
            return;
        };

        if tokio::time::timeout(DRAIN_TIMEOUT, conn.limiter.drain())
            .await
            .is_err()
        {
            warn!("任务 {} 等待在途操作超时，强制关闭", task_id);
        }
        match conn.storage.close().await {
            Ok(()) => info!("任务 {} 的连接已关闭", task_id),
            Err(e) => error!("关闭任务 {} 的连接时出错: {}", task_id, e),
        }
    }

    pub async fn close_all(&self) {
        for task_id in self.active_tasks() {
            self.close(&task_id).await;
        }
    }
}
