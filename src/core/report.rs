//! FleetReport：一组 Worker 进入终态后的只读汇总（按需计算，不持久化）

use serde::Serialize;

use crate::core::aggregator::success_rate;
use crate::core::state::now_millis;
use crate::core::{FailureReason, WorkerAgent, WorkerStatus};

#[derive(Debug, Clone, Serialize)]
pub struct FleetReport {
    /// 按传入 spec 的顺序，含启动失败的占位 Worker
    pub workers: Vec<WorkerAgent>,
    pub total_workers: usize,
    pub completed: usize,
    pub failed: usize,
    pub spawn_failures: usize,
    pub total_claimed: usize,
    pub total_verified: usize,
    /// 已核验存在的远端产物数
    pub total_artifacts_created: usize,
    /// 生成报告时注册表中仍活跃的 Worker 数
    pub active_agents: usize,
    pub fleet_success_rate: f64,
    pub started_at: i64,
    pub finished_at: i64,
    pub duration_ms: i64,
    pub timed_out: bool,
}

impl FleetReport {
    pub fn build(
        workers: Vec<WorkerAgent>,
        active_agents: usize,
        started_at: i64,
        timed_out: bool,
    ) -> Self {
        let count = |status: WorkerStatus| workers.iter().filter(|w| w.status == status).count();
        let completed = count(WorkerStatus::Completed);
        let failed = count(WorkerStatus::Failed);
        let spawn_failures = workers
            .iter()
            .filter(|w| matches!(w.failure, Some(FailureReason::SpawnFailed { .. })))
            .count();
        let total_claimed: usize = workers.iter().map(|w| w.total_claimed()).sum();
        let total_verified: usize = workers.iter().map(|w| w.verified_count()).sum();
        let finished_at = now_millis();

        Self {
            total_workers: workers.len(),
            completed,
            failed,
            spawn_failures,
            total_claimed,
            total_verified,
            total_artifacts_created: total_verified,
            active_agents,
            fleet_success_rate: success_rate(total_verified, total_claimed),
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).max(0),
            timed_out,
            workers,
        }
    }

    /// 全部 Worker 均 completed
    pub fn all_completed(&self) -> bool {
        self.total_workers > 0 && self.completed == self.total_workers
    }
}
