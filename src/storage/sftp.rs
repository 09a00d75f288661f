//! SFTP 存储（ssh2，阻塞调用放在 spawn_blocking 中执行）

use super::{normalize_remote_path, remote_ancestors, remote_parent, RemoteStorage};
use super::{CONNECT_TIMEOUT, SESSION_TIMEOUT};
use crate::error::{SyncError, SyncResult};
use crate::models::{Credential, Protocol, SyncTask};
use async_trait::async_trait;
use ssh2::{ErrorCode, Session, Sftp};
use std::fs::File;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

// libssh2 SFTP 状态码
const FX_NO_SUCH_FILE: i32 = 2;
const FX_FAILURE: i32 = 4;
const FX_FILE_ALREADY_EXISTS: i32 = 11;

struct SftpSession {
    session: Session,
    sftp: Sftp,
}

/// 单个 SSH 会话，同一时刻只允许一个操作
pub struct SftpStorage {
    inner: Arc<Mutex<SftpSession>>,
    name: String,
}

impl SftpStorage {
    pub async fn connect(task: &SyncTask) -> SyncResult<Self> {
        let host = task.host.clone();
        let port = task.effective_port().unwrap_or(22);
        let username = task.username.clone();
        let credential = task.credential.clone();
        let name = format!("sftp://{}@{}:{}", username, host, port);

        let session = tokio::task::spawn_blocking(move || {
            open_session(&host, port, &username, &credential)
        })
        .await??;

        info!("SFTP连接成功: {}", name);
        Ok(Self {
            inner: Arc::new(Mutex::new(session)),
            name,
        })
    }

    async fn run<T, F>(&self, f: F) -> SyncResult<T>
    where
        F: FnOnce(&SftpSession) -> SyncResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = inner
                .lock()
                .map_err(|_| SyncError::Transfer("SFTP会话锁已损坏".into()))?;
            f(&guard)
        })
        .await?
    }
}

fn open_session(
    host: &str,
    port: u16,
    username: &str,
    credential: &Credential,
) -> SyncResult<SftpSession> {
    if let Credential::PrivateKey(key) = credential {
        if !key.exists() {
            return Err(SyncError::Connection(format!("密钥文件不存在: {:?}", key)));
        }
    }

    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| SyncError::Connection(format!("无法解析主机 {}: {}", host, e)))?
        .next()
        .ok_or_else(|| SyncError::Connection(format!("无法解析主机 {}", host)))?;
    let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
        .map_err(|e| SyncError::Connection(format!("无法连接 {}: {}", addr, e)))?;

    let mut session = Session::new().map_err(|e| connection_error("创建SSH会话", e))?;
    session.set_timeout(SESSION_TIMEOUT.as_millis() as u32);
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| connection_error("SSH握手", e))?;

    match credential {
        Credential::Password(password) => session
            .userauth_password(username, password)
            .map_err(|e| connection_error("密码认证", e))?,
        Credential::PrivateKey(key) => session
            .userauth_pubkey_file(username, None, key, None)
            .map_err(|e| connection_error("密钥认证", e))?,
    }
    if !session.authenticated() {
        return Err(SyncError::Connection(format!("用户 {} 认证失败", username)));
    }

    let sftp = session
        .sftp()
        .map_err(|e| connection_error("打开SFTP通道", e))?;
    Ok(SftpSession { session, sftp })
}

fn connection_error(action: &str, e: ssh2::Error) -> SyncError {
    SyncError::Connection(format!("{}失败: {}", action, e))
}

fn transfer_error(action: &str, path: &str, e: ssh2::Error) -> SyncError {
    SyncError::Transfer(format!("{} {} 失败: {}", action, path, e))
}

fn is_no_such_file(code: ErrorCode) -> bool {
    code == ErrorCode::SFTP(FX_NO_SUCH_FILE)
}

/// mkdir 报告目录已存在（OpenSSH 返回通用失败码）
fn is_already_exists(code: ErrorCode) -> bool {
    matches!(code, ErrorCode::SFTP(FX_FAILURE) | ErrorCode::SFTP(FX_FILE_ALREADY_EXISTS))
}

/// 逐级建目录用到的两个远程操作
trait DirOps {
    /// 路径存在时返回是否为目录；不存在时返回 SFTP 错误码 2
    fn stat_is_dir(&self, path: &str) -> Result<bool, ssh2::Error>;
    fn make_dir(&self, path: &str) -> Result<(), ssh2::Error>;
}

impl DirOps for Sftp {
    fn stat_is_dir(&self, path: &str) -> Result<bool, ssh2::Error> {
        self.stat(Path::new(path)).map(|stat| stat.is_dir())
    }

    fn make_dir(&self, path: &str) -> Result<(), ssh2::Error> {
        self.mkdir(Path::new(path), 0o755)
    }
}

fn ensure_dir_blocking<D: DirOps + ?Sized>(ops: &D, dir: &str) -> SyncResult<()> {
    for ancestor in remote_ancestors(dir) {
        match ops.stat_is_dir(&ancestor) {
            Ok(true) => continue,
            Ok(false) => {
                return Err(SyncError::Transfer(format!(
                    "远程路径已存在且不是目录: {}",
                    ancestor
                )))
            }
            Err(e) if is_no_such_file(e.code()) => {}
            Err(e) => return Err(transfer_error("检查目录", &ancestor, e)),
        }

        match ops.make_dir(&ancestor) {
            Ok(()) => debug!("创建远程目录: {}", ancestor),
            // 其他写入方可能已经创建了同一目录
            Err(e)
                if is_already_exists(e.code())
                    && ops.stat_is_dir(&ancestor).unwrap_or(false) =>
            {
                debug!("远程目录已存在: {}", ancestor)
            }
            Err(e) => return Err(transfer_error("创建目录", &ancestor, e)),
        }
    }
    Ok(())
}

#[async_trait]
impl RemoteStorage for SftpStorage {
    fn protocol(&self) -> Protocol {
        Protocol::Sftp
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_dir(&self, remote_dir: &str) -> SyncResult<()> {
        let dir = normalize_remote_path(remote_dir);
        self.run(move |s| ensure_dir_blocking(&s.sftp, &dir)).await
    }

    async fn upload(&self, local: &Path, remote: &str) -> SyncResult<u64> {
        let local = local.to_path_buf();
        let remote = normalize_remote_path(remote);
        self.run(move |s| {
            if let Some(parent) = remote_parent(&remote) {
                ensure_dir_blocking(&s.sftp, &parent)?;
            }
            let mut source = File::open(&local)?;
            let mut target = s
                .sftp
                .create(Path::new(&remote))
                .map_err(|e| transfer_error("创建远程文件", &remote, e))?;
            let written = io::copy(&mut source, &mut target)
                .map_err(|e| SyncError::Transfer(format!("写入 {} 失败: {}", remote, e)))?;
            debug!("SFTP上传完成: {:?} -> {} ({} bytes)", local, remote, written);
            Ok(written)
        })
        .await
    }

    async fn download(&self, remote: &str, local: &Path) -> SyncResult<u64> {
        let local: PathBuf = local.to_path_buf();
        let remote = normalize_remote_path(remote);
        self.run(move |s| {
            let mut source = s
                .sftp
                .open(Path::new(&remote))
                .map_err(|e| transfer_error("打开远程文件", &remote, e))?;
            if let Some(parent) = local.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut target = File::create(&local)?;
            let read = io::copy(&mut source, &mut target)
                .map_err(|e| SyncError::Transfer(format!("读取 {} 失败: {}", remote, e)))?;
            Ok(read)
        })
        .await
    }

    async fn delete(&self, remote: &str) -> SyncResult<()> {
        let remote = normalize_remote_path(remote);
        self.run(move |s| {
            s.sftp
                .unlink(Path::new(&remote))
                .map_err(|e| transfer_error("删除", &remote, e))
        })
        .await
    }

    async fn remote_size(&self, remote: &str) -> SyncResult<Option<u64>> {
        let remote = normalize_remote_path(remote);
        self.run(move |s| match s.sftp.stat(Path::new(&remote)) {
            Ok(stat) => Ok(stat.size),
            Err(e) if is_no_such_file(e.code()) => Ok(None),
            Err(e) => Err(transfer_error("获取文件信息", &remote, e)),
        })
        .await
    }

    async fn close(&self) -> SyncResult<()> {
        let name = self.name.clone();
        self.run(move |s| {
            if let Err(e) = s.session.disconnect(None, "closing", None) {
                warn!("关闭SFTP会话失败 {}: {}", name, e);
            }
            Ok(())
        })
        .await
    }
}
