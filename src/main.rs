use anyhow::Context;
use mirrorsync_lib::config::default_config_dir;
use mirrorsync_lib::logging::{get_log_dir, init_logging};
use mirrorsync_lib::AppState;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 可以通过第一个参数指定配置目录
    let config_dir = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(default_config_dir);

    let state = AppState::new(config_dir.clone())
        .with_context(|| format!("无法初始化配置目录 {:?}", config_dir))?;
    init_logging(&state.config.log, &get_log_dir(&state.config.data_dir));

    tracing::info!(
        "配置目录: {:?}, 共 {} 个同步任务",
        state.config_dir,
        state.config.sync_tasks.len()
    );

    let mut reports = state.service.subscribe();
    tokio::spawn(async move {
        while let Ok(report) = reports.recv().await {
            match serde_json::to_string(&report) {
                Ok(json) => tracing::debug!("同步报告: {}", json),
                Err(e) => tracing::warn!("序列化同步报告失败: {}", e),
            }
        }
    });

    let started = state.start_all().await;
    tracing::info!("已启动 {} 个任务，按 Ctrl-C 退出", started);

    tokio::signal::ctrl_c().await.context("等待退出信号失败")?;
    state.cleanup().await;
    Ok(())
}
