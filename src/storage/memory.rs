//! 测试用内存存储

use super::{normalize_remote_path, remote_ancestors, remote_parent, RemoteStorage};
use crate::error::{SyncError, SyncResult};
use crate::models::Protocol;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub(crate) struct MemoryStorage {
    protocol: Protocol,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    dirs: Mutex<BTreeSet<String>>,
    /// 接下来 N 次上传直接失败
    pub fail_uploads: AtomicU32,
    /// 每次操作的人为延迟
    pub delay: Mutex<Duration>,
    /// 上传后远程大小多报一个字节
    pub corrupt_sizes: AtomicBool,
    pub in_flight: AtomicU32,
    pub max_in_flight: AtomicU32,
    pub closed: AtomicBool,
}

impl MemoryStorage {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            files: Mutex::new(BTreeMap::new()),
            dirs: Mutex::new(BTreeSet::new()),
            fail_uploads: AtomicU32::new(0),
            delay: Mutex::new(Duration::ZERO),
            corrupt_sizes: AtomicBool::new(false),
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn file(&self, remote: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(&normalize_remote_path(remote))
            .cloned()
    }

    pub fn has_dir(&self, remote: &str) -> bool {
        self.dirs
            .lock()
            .unwrap()
            .contains(&normalize_remote_path(remote))
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    async fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteStorage for MemoryStorage {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn name(&self) -> &str {
        "memory"
    }

    async fn ensure_dir(&self, remote_dir: &str) -> SyncResult<()> {
        let mut dirs = self.dirs.lock().unwrap();
        for dir in remote_ancestors(remote_dir) {
            dirs.insert(dir);
        }
        Ok(())
    }

    async fn upload(&self, local: &Path, remote: &str) -> SyncResult<u64> {
        self.enter().await;
        let result = async {
            if self
                .fail_uploads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SyncError::Transfer("injected failure".into()));
            }
            let data = tokio::fs::read(local).await?;
            if let Some(parent) = remote_parent(remote) {
                self.ensure_dir(&parent).await?;
            }
            let len = data.len() as u64;
            self.files
                .lock()
                .unwrap()
                .insert(normalize_remote_path(remote), data);
            Ok(len)
        }
        .await;
        self.leave();
        result
    }

    async fn download(&self, remote: &str, local: &Path) -> SyncResult<u64> {
        let data = self
            .file(remote)
            .ok_or_else(|| SyncError::Transfer(format!("no such file: {}", remote)))?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local, &data).await?;
        Ok(data.len() as u64)
    }

    async fn delete(&self, remote: &str) -> SyncResult<()> {
        self.enter().await;
        let removed = self
            .files
            .lock()
            .unwrap()
            .remove(&normalize_remote_path(remote));
        self.leave();
        removed
            .map(|_| ())
            .ok_or_else(|| SyncError::Transfer(format!("no such file: {}", remote)))
    }

    async fn remote_size(&self, remote: &str) -> SyncResult<Option<u64>> {
        let extra = u64::from(self.corrupt_sizes.load(Ordering::SeqCst));
        Ok(self.file(remote).map(|d| d.len() as u64 + extra))
    }

    async fn close(&self) -> SyncResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
