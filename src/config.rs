//! 应用配置模块
//!
//! 任务列表由外部配置存储维护，这里只负责读取 `config.json`。

use crate::logging::LogConfig;
use crate::models::SyncTask;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const CONFIG_FILE: &str = "config.json";

/// 应用配置
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub sync_tasks: Vec<SyncTask>,
    pub log: LogConfig,
    /// 快照文件等运行数据的存放目录
    pub data_dir: PathBuf,
}

impl AppConfig {
    /// 从配置目录加载，文件缺失或损坏时返回默认配置
    pub fn load(config_dir: &Path) -> Self {
        let config = read_config_value(config_dir).unwrap_or_else(|| serde_json::json!({}));

        let sync_tasks = config
            .get("sync_tasks")
            .and_then(|v| v.as_array())
            .map(|tasks| {
                tasks
                    .iter()
                    .filter_map(|raw| match serde_json::from_value::<SyncTask>(raw.clone()) {
                        Ok(task) => Some(task),
                        Err(e) => {
                            warn!("忽略无效的同步任务配置: {}", e);
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        let log = config
            .get("log")
            .and_then(|v| serde_json::from_value::<LogConfig>(v.clone()).ok())
            .unwrap_or_default();

        let data_dir = data_path_override(&config).unwrap_or_else(|| config_dir.to_path_buf());

        Self {
            sync_tasks,
            log,
            data_dir,
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&SyncTask> {
        self.sync_tasks.iter().find(|t| t.id == task_id)
    }
}

/// 读取 config.json 为 JSON 值
pub fn read_config_value(config_dir: &Path) -> Option<serde_json::Value> {
    let content = fs::read_to_string(config_dir.join(CONFIG_FILE)).ok()?;
    serde_json::from_str(&content).ok()
}

/// 自定义数据路径（必须是已存在的目录）
pub fn data_path_override(config: &serde_json::Value) -> Option<PathBuf> {
    config
        .get("data_path")?
        .as_str()
        .map(PathBuf::from)
        .filter(|p| p.is_dir())
}

/// 默认配置目录
pub fn default_config_dir() -> PathBuf {
    crate::dirs::config_dir()
        .map(|p| p.join("mirrorsync"))
        .unwrap_or_else(|| PathBuf::from(".mirrorsync"))
}
