//! 完成聚合：进程退出后计算 success_rate、决定终态、持久化快照、驱逐并发出事件

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::core::{FailureReason, LifecycleEvent, LifecycleEventKind, WorkerAgent, WorkerStatus};
use crate::memory::{keys, SharedMemory};
use crate::process::{ExitInfo, WorkerRegistry};

/// 验收阈值（不含边界）：success_rate 必须严格大于该值
pub const ACCEPTANCE_THRESHOLD: f64 = 0.8;

/// verified / claimed；无声明时为 0
pub fn success_rate(verified: usize, claimed: usize) -> f64 {
    if claimed == 0 {
        return 0.0;
    }
    (verified.min(claimed) as f64) / (claimed as f64)
}

/// 由退出信息与 success_rate 得出终态。非零退出码优先于 success_rate
pub fn decide(exit: ExitInfo, rate: f64) -> (WorkerStatus, Option<FailureReason>) {
    if exit.terminated {
        return (WorkerStatus::Failed, Some(FailureReason::Terminated));
    }
    match exit.code {
        None => (WorkerStatus::Failed, Some(FailureReason::Signalled)),
        Some(code) if code != 0 => (WorkerStatus::Failed, Some(FailureReason::NonZeroExit { code })),
        Some(_) if rate > ACCEPTANCE_THRESHOLD => (WorkerStatus::Completed, None),
        Some(_) => (
            WorkerStatus::Failed,
            Some(FailureReason::Acceptance {
                success_rate: rate,
                threshold: ACCEPTANCE_THRESHOLD,
            }),
        ),
    }
}

/// 完成聚合器（由 LifecycleManager 持有，Worker 事件循环在退出排空后调用）
#[derive(Clone)]
pub struct CompletionAggregator {
    memory: Arc<dyn SharedMemory>,
    registry: WorkerRegistry,
    events: broadcast::Sender<LifecycleEvent>,
}

impl CompletionAggregator {
    pub fn new(
        memory: Arc<dyn SharedMemory>,
        registry: WorkerRegistry,
        events: broadcast::Sender<LifecycleEvent>,
    ) -> Self {
        Self {
            memory,
            registry,
            events,
        }
    }

    pub async fn finalize(&self, mut agent: WorkerAgent, exit: ExitInfo) -> WorkerAgent {
        let rate = success_rate(agent.verified_count(), agent.total_claimed());
        let (status, failure) = decide(exit, rate);
        if !agent.finish(status, exit.code, rate, failure) {
            tracing::warn!(worker_id = %agent.id, "worker already finalized, ignoring second exit");
            return agent;
        }

        match status {
            WorkerStatus::Completed => tracing::info!(
                worker_id = %agent.id,
                role = %agent.role,
                success_rate = rate,
                claimed = agent.total_claimed(),
                "worker completed"
            ),
            _ => tracing::warn!(
                worker_id = %agent.id,
                role = %agent.role,
                success_rate = rate,
                exit_code = ?exit.code,
                reason = %agent.failure.as_ref().map(|f| f.to_string()).unwrap_or_default(),
                "worker failed"
            ),
        }

        match serde_json::to_value(&agent) {
            Ok(mut value) => {
                value["duration_ms"] = serde_json::json!(agent.duration_ms());
                if let Err(e) = self.memory.store(&keys::result(&agent.id), value).await {
                    tracing::warn!(worker_id = %agent.id, error = %e, "failed to persist worker result");
                }
            }
            Err(e) => tracing::warn!(worker_id = %agent.id, error = %e, "failed to serialize worker result"),
        }

        self.registry.evict(&agent.id, agent.clone()).await;

        let kind = if status == WorkerStatus::Completed {
            LifecycleEventKind::Completed
        } else {
            LifecycleEventKind::Failed
        };
        let _ = self.events.send(LifecycleEvent::new(kind, &agent));
        agent
    }
}
