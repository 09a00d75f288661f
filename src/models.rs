use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 默认扫描间隔（秒）
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 5;

/// 传输协议
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Protocol {
    #[serde(rename = "SFTP")]
    Sftp,
    #[serde(rename = "FTP")]
    Ftp,
    #[serde(rename = "WebDAV")]
    WebDav,
}

impl Protocol {
    /// 协议默认端口，WebDAV 由 URL 决定
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Protocol::Sftp => Some(22),
            Protocol::Ftp => Some(21),
            Protocol::WebDav => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Sftp => write!(f, "SFTP"),
            Protocol::Ftp => write!(f, "FTP"),
            Protocol::WebDav => write!(f, "WebDAV"),
        }
    }
}

/// 认证凭据
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Password(String),
    PrivateKey(PathBuf),
}

/// 同步任务（由外部配置存储持有，运行期间只读）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SyncTaskRecord", into = "SyncTaskRecord")]
pub struct SyncTask {
    pub id: String,
    pub name: String,
    pub protocol: Protocol,
    pub host: String,
    pub port: Option<u16>,
    pub username: String,
    pub credential: Credential,
    pub local_dir: PathBuf,
    pub remote_dir: String,
    pub scan_interval: u64,
}

impl SyncTask {
    /// 实际使用的端口（未配置时取协议默认值）
    pub fn effective_port(&self) -> Option<u16> {
        self.port.or_else(|| self.protocol.default_port())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval.max(1))
    }

    pub fn password(&self) -> Option<&str> {
        match &self.credential {
            Credential::Password(p) => Some(p),
            Credential::PrivateKey(_) => None,
        }
    }

    /// 连接前的基本校验
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.host.trim().is_empty() {
            return Err(SyncError::Config("主机名不能为空".into()));
        }
        if self.username.trim().is_empty() {
            return Err(SyncError::Config("用户名不能为空".into()));
        }
        if self.remote_dir.trim().is_empty() {
            return Err(SyncError::Config("远程目录不能为空".into()));
        }
        if self.protocol == Protocol::WebDav
            && !(self.host.starts_with("http://") || self.host.starts_with("https://"))
        {
            return Err(SyncError::Config(
                "WebDAV主机名必须以http://或https://开头".into(),
            ));
        }
        if self.protocol != Protocol::Sftp && matches!(self.credential, Credential::PrivateKey(_)) {
            return Err(SyncError::Config(format!(
                "{} 不支持密钥认证",
                self.protocol
            )));
        }
        Ok(())
    }
}

/// 配置文件中的任务记录格式
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SyncTaskRecord {
    #[serde(default = "new_task_id")]
    id: String,
    #[serde(default)]
    name: String,
    protocol: Protocol,
    host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    #[serde(default)]
    use_key_auth: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key_path: Option<PathBuf>,
    local_dir: PathBuf,
    remote_dir: String,
    #[serde(default = "default_scan_interval")]
    scan_interval: u64,
}

fn new_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_scan_interval() -> u64 {
    DEFAULT_SCAN_INTERVAL_SECS
}

impl TryFrom<SyncTaskRecord> for SyncTask {
    type Error = SyncError;

    fn try_from(record: SyncTaskRecord) -> Result<Self, Self::Error> {
        let credential = if record.use_key_auth {
            let key = record
                .key_path
                .ok_or_else(|| SyncError::Config("密钥认证需要 key_path".into()))?;
            Credential::PrivateKey(key)
        } else {
            Credential::Password(record.password.unwrap_or_default())
        };

        // WebDAV 的端口由 URL 决定
        let port = match record.protocol {
            Protocol::WebDav => None,
            _ => record.port.or_else(|| record.protocol.default_port()),
        };

        Ok(SyncTask {
            id: record.id,
            name: record.name,
            protocol: record.protocol,
            host: record.host,
            port,
            username: record.username,
            credential,
            local_dir: record.local_dir,
            remote_dir: record.remote_dir,
            scan_interval: record.scan_interval,
        })
    }
}

impl From<SyncTask> for SyncTaskRecord {
    fn from(task: SyncTask) -> Self {
        let (password, use_key_auth, key_path) = match task.credential {
            Credential::Password(p) => (Some(p), false, None),
            Credential::PrivateKey(k) => (None, true, Some(k)),
        };
        SyncTaskRecord {
            id: task.id,
            name: task.name,
            protocol: task.protocol,
            host: task.host,
            port: task.port,
            username: task.username,
            password,
            use_key_auth,
            key_path,
            local_dir: task.local_dir,
            remote_dir: task.remote_dir,
            scan_interval: task.scan_interval,
        }
    }
}
