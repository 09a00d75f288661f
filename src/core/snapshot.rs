//! 目录快照：路径 -> 内容哈希

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// 哈希时的读取块大小
pub const HASH_BLOCK_SIZE: usize = 4096;

/// 某一时刻目录树的内容快照（绝对路径 -> 十六进制摘要）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(HashMap<PathBuf, String>);

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: PathBuf, hash: String) {
        self.0.insert(path, hash);
    }

    pub fn get(&self, path: &Path) -> Option<&str> {
        self.0.get(path).map(String::as_str)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.0.contains_key(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, &String)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(PathBuf, String)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (PathBuf, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// 流式计算文件内容哈希（BLAKE3，4096 字节分块）
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; HASH_BLOCK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// 目录快照生成器
#[derive(Default)]
pub struct Snapshotter {
    cancel_flag: Option<Arc<AtomicBool>>,
}

impl Snapshotter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 带取消标志，取消后扫描提前结束
    pub fn with_cancel(cancel_flag: Arc<AtomicBool>) -> Self {
        Self {
            cancel_flag: Some(cancel_flag),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_flag
            .as_ref()
            .map(|f| f.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// 扫描目录树。不可读的文件、符号链接和遍历错误都会被跳过。
    ///
    /// 只有根目录本身无法解析时才返回错误；取消时返回已扫描的部分。
    pub fn scan(&self, root: &Path) -> Result<Snapshot, SyncError> {
        let root = root.canonicalize().map_err(|source| SyncError::Scan {
            path: root.to_path_buf(),
            source,
        })?;

        let mut snapshot = Snapshot::new();
        for entry in WalkDir::new(&root).follow_links(false) {
            if self.is_cancelled() {
                debug!("扫描已取消: {:?}", root);
                break;
            }

            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!("跳过无法遍历的路径: {}", e);
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            // 非 UTF-8 文件名无法写入 JSON 快照
            if entry.path().to_str().is_none() {
                let err = SyncError::Scan {
                    path: entry.path().to_path_buf(),
                    source: io::Error::new(io::ErrorKind::InvalidData, "文件名不是有效的 UTF-8"),
                };
                debug!("跳过文件: {}", err);
                continue;
            }

            match hash_file(entry.path()) {
                Ok(hash) => snapshot.insert(entry.into_path(), hash),
                Err(source) => {
                    let err = SyncError::Scan {
                        path: entry.path().to_path_buf(),
                        source,
                    };
                    debug!("跳过不可读文件: {}", err);
                }
            }
        }

        Ok(snapshot)
    }
}

/// 快照持久化：每个任务一对 current/previous JSON 文件
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    current_path: PathBuf,
    previous_path: PathBuf,
}

impl SnapshotStore {
    pub fn new(data_dir: &Path, local_dir: &Path, remote_dir: &str) -> Self {
        let key = Self::persistence_key(local_dir, remote_dir);
        Self {
            current_path: data_dir.join(format!("current_hashes_{}.json", key)),
            previous_path: data_dir.join(format!("previous_hashes_{}.json", key)),
        }
    }

    /// 由 (本地目录, 远程目录) 计算稳定的文件名键
    pub fn persistence_key(local_dir: &Path, remote_dir: &str) -> String {
        let ident = format!("{}:{}", local_dir.display(), remote_dir);
        blake3::hash(ident.as_bytes()).to_hex()[..32].to_string()
    }

    pub fn current_path(&self) -> &Path {
        &self.current_path
    }

    pub fn previous_path(&self) -> &Path {
        &self.previous_path
    }

    pub fn save_current(&self, snapshot: &Snapshot) -> io::Result<()> {
        Self::save(&self.current_path, snapshot)
    }

    pub fn save_previous(&self, snapshot: &Snapshot) -> io::Result<()> {
        Self::save(&self.previous_path, snapshot)
    }

    pub fn load_current(&self) -> Snapshot {
        Self::load(&self.current_path)
    }

    pub fn load_previous(&self) -> Snapshot {
        Self::load(&self.previous_path)
    }

    /// 写入临时文件后重命名，避免读到半截 JSON
    pub fn save(path: &Path, snapshot: &Snapshot) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(snapshot)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)
    }

    /// 文件缺失或损坏时返回空快照
    pub fn load(path: &Path) -> Snapshot {
        let data = match std::fs::read(path) {
            Ok(d) => d,
            Err(_) => return Snapshot::new(),
        };
        match serde_json::from_slice(&data) {
            Ok(s) => s,
            Err(e) => {
                warn!("快照文件损坏，按空快照处理 {:?}: {}", path, e);
                Snapshot::new()
            }
        }
    }
}
