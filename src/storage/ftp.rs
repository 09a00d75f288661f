//! FTP 存储（suppaftp 同步客户端 + 小型连接池）

use super::{normalize_remote_path, remote_ancestors, remote_parent, RemoteStorage};
use super::{CONNECT_TIMEOUT, SESSION_TIMEOUT};
use crate::core::retry::{retry_with_backoff, BackoffPolicy};
use crate::error::{SyncError, SyncResult};
use crate::models::{Protocol, SyncTask};
use async_trait::async_trait;
use socket2::SockRef;
use std::fs::File;
use std::io::Cursor;
use std::net::ToSocketAddrs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Mode};
use tracing::{debug, info, warn};

/// MKD 失败时服务器返回 550，其中包括目录已存在
const REPLY_FILE_UNAVAILABLE: u32 = 550;

#[derive(Debug)]
struct FtpParams {
    host: String,
    port: u16,
    username: String,
    password: String,
}

/// FTP 连接池：空闲连接借出前先发 NOOP 检查，失效则重连
pub struct FtpStorage {
    params: Arc<FtpParams>,
    idle: Arc<Mutex<Vec<FtpStream>>>,
    name: String,
}

/// 4xx 回复和连接层错误视为瞬时错误
fn is_transient_reply(code: u32) -> bool {
    (400..500).contains(&code)
}

fn reply_code(e: &FtpError) -> Option<u32> {
    match e {
        FtpError::UnexpectedResponse(resp) => Some(resp.status.code()),
        _ => None,
    }
}

fn classify(action: &str, e: FtpError) -> SyncError {
    let transient = match &e {
        FtpError::ConnectionError(_) => true,
        other => reply_code(other).map(is_transient_reply).unwrap_or(false),
    };
    if transient {
        SyncError::Connection(format!("{}: {}", action, e))
    } else {
        SyncError::Transfer(format!("{}: {}", action, e))
    }
}

fn is_transient(e: &SyncError) -> bool {
    matches!(e, SyncError::Connection(_))
}

fn open_stream(params: &FtpParams) -> SyncResult<FtpStream> {
    let addr = (params.host.as_str(), params.port)
        .to_socket_addrs()
        .map_err(|e| SyncError::Connection(format!("无法解析主机 {}: {}", params.host, e)))?
        .next()
        .ok_or_else(|| SyncError::Connection(format!("无法解析主机 {}", params.host)))?;

    let mut stream =
        FtpStream::connect_timeout(addr, CONNECT_TIMEOUT).map_err(|e| classify("连接", e))?;
    stream
        .login(&params.username, &params.password)
        .map_err(|e| match e {
            FtpError::UnexpectedResponse(_) => {
                SyncError::Transfer(format!("FTP登录失败: {}", e))
            }
            other => classify("登录", other),
        })?;
    stream.set_mode(Mode::Passive);

    let socket = stream.get_ref();
    if let Err(e) = SockRef::from(socket).set_keepalive(true) {
        debug!("无法启用TCP keep-alive: {}", e);
    }
    let _ = socket.set_read_timeout(Some(SESSION_TIMEOUT));
    let _ = socket.set_write_timeout(Some(SESSION_TIMEOUT));

    stream.noop().map_err(|e| classify("NOOP", e))?;
    Ok(stream)
}

/// 借出一个可用连接：空闲连接 NOOP 失败就丢弃并重新建立
fn checkout(params: &FtpParams, idle: &Mutex<Vec<FtpStream>>) -> SyncResult<FtpStream> {
    let cached = idle.lock().ok().and_then(|mut pool| pool.pop());
    if let Some(mut stream) = cached {
        match stream.noop() {
            Ok(()) => return Ok(stream),
            Err(e) => {
                warn!("FTP连接已断开，尝试重新连接: {}", e);
                let _ = stream.quit();
            }
        }
    }
    open_stream(params)
}

fn checkin(idle: &Mutex<Vec<FtpStream>>, stream: FtpStream) {
    if let Ok(mut pool) = idle.lock() {
        pool.push(stream);
    }
}

fn ensure_dir_blocking(stream: &mut FtpStream, dir: &str) -> Result<(), FtpError> {
    for ancestor in remote_ancestors(dir) {
        if stream.cwd(&ancestor).is_ok() {
            continue;
        }
        match stream.mkdir(&ancestor) {
            Ok(()) => debug!("创建远程目录: {}", ancestor),
            // 只有“目录已存在”的 550 被吞掉，其余 550（如权限不足）照常报错
            Err(e)
                if reply_code(&e) == Some(REPLY_FILE_UNAVAILABLE)
                    && stream.cwd(&ancestor).is_ok() =>
            {
                debug!("远程目录已存在: {}", ancestor)
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

impl FtpStorage {
    pub async fn connect(task: &SyncTask) -> SyncResult<Self> {
        let params = Arc::new(FtpParams {
            host: task.host.clone(),
            port: task.effective_port().unwrap_or(21),
            username: task.username.clone(),
            password: task.password().unwrap_or_default().to_string(),
        });
        let name = format!("ftp://{}@{}:{}", params.username, params.host, params.port);

        let stream = retry_with_backoff(
            BackoffPolicy::ftp_connect(),
            "FTP连接",
            is_transient,
            |_| {
                let params = params.clone();
                async move { tokio::task::spawn_blocking(move || open_stream(&params)).await? }
            },
        )
        .await?;

        info!("FTP连接成功: {}", name);
        Ok(Self {
            params,
            idle: Arc::new(Mutex::new(vec![stream])),
            name,
        })
    }

    /// 在池中的连接上执行一次阻塞操作，瞬时错误按固定间隔重试
    async fn with_stream<T, F>(&self, label: &str, f: F) -> SyncResult<T>
    where
        F: Fn(&mut FtpStream) -> SyncResult<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let f = Arc::new(f);
        retry_with_backoff(BackoffPolicy::ftp_transfer(), label, is_transient, |_| {
            let params = self.params.clone();
            let idle = self.idle.clone();
            let f = f.clone();
            async move {
                tokio::task::spawn_blocking(move || {
                    let mut stream = checkout(&params, &idle)?;
                    let result = (*f)(&mut stream);
                    match &result {
                        // 连接层错误后连接不再可信，直接丢弃
                        Err(e) if is_transient(e) => {
                            let _ = stream.quit();
                        }
                        _ => checkin(&idle, stream),
                    }
                    result
                })
                .await?
            }
        })
        .await
    }
}

#[async_trait]
impl RemoteStorage for FtpStorage {
    fn protocol(&self) -> Protocol {
        Protocol::Ftp
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_dir(&self, remote_dir: &str) -> SyncResult<()> {
        let dir = normalize_remote_path(remote_dir);
        self.with_stream("FTP创建目录", move |stream| {
            ensure_dir_blocking(stream, &dir).map_err(|e| classify("创建目录", e))
        })
        .await
    }

    async fn upload(&self, local: &Path, remote: &str) -> SyncResult<u64> {
        let local = local.to_path_buf();
        let remote = normalize_remote_path(remote);
        self.with_stream("FTP上传", move |stream| {
            if let Some(parent) = remote_parent(&remote) {
                ensure_dir_blocking(stream, &parent).map_err(|e| classify("创建目录", e))?;
            }
            stream
                .transfer_type(FileType::Binary)
                .map_err(|e| classify("设置传输模式", e))?;
            let mut source = File::open(&local)?;
            let written = stream
                .put_file(&remote, &mut source)
                .map_err(|e| classify("上传", e))?;
            debug!("FTP上传完成: {:?} -> {} ({} bytes)", local, remote, written);
            Ok(written)
        })
        .await
    }

    async fn download(&self, remote: &str, local: &Path) -> SyncResult<u64> {
        let local = local.to_path_buf();
        let remote = normalize_remote_path(remote);
        self.with_stream("FTP下载", move |stream| {
            stream
                .transfer_type(FileType::Binary)
                .map_err(|e| classify("设置传输模式", e))?;
            let buffer: Cursor<Vec<u8>> = stream
                .retr_as_buffer(&remote)
                .map_err(|e| classify("下载", e))?;
            if let Some(parent) = local.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let data = buffer.into_inner();
            std::fs::write(&local, &data)?;
            Ok(data.len() as u64)
        })
        .await
    }

    async fn delete(&self, remote: &str) -> SyncResult<()> {
        let remote = normalize_remote_path(remote);
        self.with_stream("FTP删除", move |stream| {
            stream.rm(&remote).map_err(|e| classify("删除", e))
        })
        .await
    }

    async fn remote_size(&self, remote: &str) -> SyncResult<Option<u64>> {
        let remote = normalize_remote_path(remote);
        self.with_stream("FTP获取文件大小", move |stream| {
            stream
                .transfer_type(FileType::Binary)
                .map_err(|e| classify("设置传输模式", e))?;
            match stream.size(&remote) {
                Ok(size) => Ok(Some(size as u64)),
                Err(e) if reply_code(&e) == Some(REPLY_FILE_UNAVAILABLE) => Ok(None),
                Err(e) => Err(classify("获取文件大小", e)),
            }
        })
        .await
    }

    async fn close(&self) -> SyncResult<()> {
        let idle = self.idle.clone();
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || {
            let streams: Vec<FtpStream> = match idle.lock() {
                Ok(mut pool) => pool.drain(..).collect(),
                Err(_) => Vec::new(),
            };
            for mut stream in streams {
                if let Err(e) = stream.quit() {
                    debug!("关闭FTP连接 {} 时出错: {}", name, e);
                }
            }
        })
        .await?;
        Ok(())
    }
}
