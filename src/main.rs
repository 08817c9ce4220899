//! Hive - 多 Agent Worker 编排器
//!
//! 入口：初始化日志、加载配置、安装信号处理器，编排 [fleet].workers 并把 FleetReport 以 JSON 打印到 stdout。
//! 任一 Worker 未完成时以非零码退出。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hive::config::{load_config, AppConfig};
use hive::core::{create_orchestrator, ShutdownManager};
use hive::observability;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let orchestrator = create_orchestrator(&cfg)
        .context("Failed to create orchestrator")?
        .with_shutdown(shutdown.token());
    let logger = observability::spawn_event_logger(orchestrator.subscribe());

    let report = orchestrator
        .coordinate(&cfg.fleet.workers)
        .await
        .context("Fleet coordination failed")?;
    if report.timed_out {
        tracing::warn!(
            timeout_secs = cfg.fleet.timeout_secs,
            "fleet timed out, remaining workers were terminated"
        );
    }

    drop(orchestrator);
    let _ = tokio::time::timeout(Duration::from_secs(1), logger).await;

    let json = serde_json::to_string_pretty(&report).context("Failed to serialize fleet report")?;
    println!("{}", json);

    if !report.all_completed() {
        std::process::exit(1);
    }
    Ok(())
}
