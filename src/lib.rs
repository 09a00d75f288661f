use std::path::PathBuf;
use std::sync::Arc;

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod models;
pub mod storage;

pub use config::AppConfig;
pub use core::{SyncReport, SyncService};
pub use error::{SyncError, SyncResult};
pub use models::{Credential, Protocol, SyncTask};

/// 应用状态：配置 + 同步服务
#[derive(Clone)]
pub struct AppState {
    pub config_dir: PathBuf,
    pub config: AppConfig,
    pub service: Arc<SyncService>,
}

impl AppState {
    pub fn new(config_dir: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config_dir)?;

        let config = AppConfig::load(&config_dir);
        if config.data_dir != config_dir {
            tracing::debug!("使用自定义数据路径: {:?}", config.data_dir);
        }
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(Self {
            service: Arc::new(SyncService::new(&config.data_dir)),
            config_dir,
            config,
        })
    }

    /// 启动配置中的所有任务，返回成功启动的数量
    pub async fn start_all(&self) -> usize {
        let mut started = 0;
        for task in &self.config.sync_tasks {
            match self.service.start_task(task).await {
                Ok(()) => started += 1,
                Err(e) => tracing::error!("任务 {} 启动失败: {}", task.name, e),
            }
        }
        started
    }

    /// 清理资源（退出时调用）
    pub async fn cleanup(&self) {
        tracing::info!("正在清理应用资源...");
        self.service.stop_all().await;
        tracing::info!("资源清理完成");
    }
}

/// 平台配置目录
pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }
    }
}
