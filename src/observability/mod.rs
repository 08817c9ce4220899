//! 可观测性：tracing 初始化与生命周期事件日志

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::core::{LifecycleEvent, LifecycleEventKind};

/// 日志：默认 info，可通过 RUST_LOG 覆盖；输出到 stderr，stdout 留给 FleetReport
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// 把生命周期事件逐条写入日志，直到发送端全部关闭
pub fn spawn_event_logger(mut rx: broadcast::Receiver<LifecycleEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "lifecycle event logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &LifecycleEvent) {
    let agent = &event.agent;
    match event.kind {
        LifecycleEventKind::Spawned => {
            tracing::info!(worker_id = %agent.id, role = %agent.role, pid = ?agent.pid, "[spawned]")
        }
        LifecycleEventKind::Working => tracing::debug!(
            worker_id = %agent.id,
            tool = agent.work_log.last().map(|t| t.action_label.as_str()).unwrap_or(""),
            "[working]"
        ),
        LifecycleEventKind::Completed => tracing::info!(
            worker_id = %agent.id,
            role = %agent.role,
            verified = agent.verified_count(),
            claimed = agent.total_claimed(),
            "[completed]"
        ),
        LifecycleEventKind::Failed => tracing::warn!(
            worker_id = %agent.id,
            role = %agent.role,
            reason = %agent.failure.as_ref().map(|f| f.to_string()).unwrap_or_default(),
            "[failed]"
        ),
    }
}
