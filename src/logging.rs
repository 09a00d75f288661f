//! 日志模块 - 文件日志与大小轮转

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

pub const LOG_FILE: &str = "app.log";

/// 日志配置（config.json 的 `log` 字段）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 单个日志文件上限（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// "error" / "warn" / "info" / "debug" / "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

struct RotatingFile {
    path: PathBuf,
    max_size: u64,
    writer: Option<BufWriter<File>>,
}

impl RotatingFile {
    fn open(path: PathBuf, max_size: u64) -> io::Result<Self> {
        let mut file = Self {
            path,
            max_size,
            writer: None,
        };
        file.rotate_if_needed()?;
        file.writer = Some(Self::open_writer(&file.path)?);
        Ok(file)
    }

    fn open_writer(path: &Path) -> io::Result<BufWriter<File>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(BufWriter::new(file))
    }

    fn oversized(&self) -> bool {
        fs::metadata(&self.path)
            .map(|m| m.len() > self.max_size)
            .unwrap_or(false)
    }

    /// 超过上限时把 app.log 改名为 app.log.old 并重新打开
    fn rotate_if_needed(&mut self) -> io::Result<()> {
        if !self.oversized() {
            return Ok(());
        }
        if let Some(mut w) = self.writer.take() {
            let _ = w.flush();
        }
        let backup = self.path.with_extension("log.old");
        if backup.exists() {
            fs::remove_file(&backup)?;
        }
        fs::rename(&self.path, &backup)?;
        self.writer = Some(Self::open_writer(&self.path)?);
        Ok(())
    }
}

/// 带大小限制的日志写入器
#[derive(Clone)]
pub struct SizeRotatingWriter {
    inner: Arc<Mutex<RotatingFile>>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        let max_size = u64::from(max_size_mb.max(1)) * 1024 * 1024;
        let file = RotatingFile::open(log_dir.join(LOG_FILE), max_size)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(file)),
        })
    }
}

/// 单次写入使用的句柄
pub struct LogWriter {
    inner: Arc<Mutex<RotatingFile>>,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer poisoned"))?;
        let written = match file.writer.as_mut() {
            Some(w) => {
                let n = w.write(buf)?;
                w.flush()?;
                n
            }
            None => return Err(io::Error::new(io::ErrorKind::Other, "Writer not available")),
        };
        let _ = file.rotate_if_needed();
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.lock() {
            Ok(mut file) => match file.writer.as_mut() {
                Some(w) => w.flush(),
                None => Ok(()),
            },
            Err(_) => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for SizeRotatingWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            inner: self.inner.clone(),
        }
    }
}

/// 日志目录（跟随数据目录）
pub fn get_log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("log")
}

fn console_layer<S>() -> impl Layer<S> + Send + Sync
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
}

fn file_layer<S>(writer: SizeRotatingWriter) -> impl Layer<S> + Send + Sync
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
}

/// 初始化全局日志：文件 + 控制台，文件创建失败时只输出到控制台
pub fn init_logging(config: &LogConfig, log_dir: &Path) {
    if !config.enabled {
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return;
    }

    let filter = || {
        let mut filter = tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(config.tracing_level().into());
        for directive in ["hyper=warn", "reqwest=warn"] {
            if let Ok(d) = directive.parse() {
                filter = filter.add_directive(d);
            }
        }
        filter
    };

    match SizeRotatingWriter::new(log_dir, config.max_size_mb) {
        Ok(file_writer) => {
            let subscriber = tracing_subscriber::registry()
                .with(filter())
                .with(file_layer(file_writer))
                .with(console_layer());
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        Err(e) => {
            let subscriber = tracing_subscriber::registry()
                .with(filter())
                .with(console_layer());
            let _ = tracing::subscriber::set_global_default(subscriber);
            tracing::warn!("无法创建日志文件 {:?}: {}", log_dir, e);
        }
    }
}
