//! 多 Worker 编排：并发拉起 → 有界轮询等待终态 → 合并为 FleetReport
//!
//! 各 Worker 相互独立：单个启动失败或运行失败不会取消兄弟 Worker。
//! coordinate 只在前置条件不满足时返回 Err（空 spec 列表、已请求关闭）。
//! 关闭信号或整体超时到来时终止所有剩余 Worker，等待它们进入终态后照常返回报告。

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{AppConfig, FleetSection, WorkerSpec};
use crate::core::state::now_millis;
use crate::core::{FleetReport, HiveError, LifecycleEvent, WorkerAgent, WorkerId};
use crate::memory::open_shared_memory;
use crate::process::{LifecycleManager, LifecycleOptions, TokioSpawner};
use crate::verify::{CandidateCatalog, InMemoryRemote, RemoteQuery, ServiceNowRemote, VerificationEngine};

/// 轮询与超时参数（来自 [fleet] 段）
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub poll_interval: Duration,
    /// None 表示不限时
    pub fleet_timeout: Option<Duration>,
}

impl From<&FleetSection> for OrchestratorOptions {
    fn from(cfg: &FleetSection) -> Self {
        Self {
            poll_interval: Duration::from_millis(cfg.poll_interval_ms.max(1)),
            fleet_timeout: (cfg.timeout_secs > 0).then(|| Duration::from_secs(cfg.timeout_secs)),
        }
    }
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self::from(&FleetSection::default())
    }
}

/// spec 对应的槽位：运行中的 Worker ID，或启动失败的占位快照
enum Slot {
    Spawned(WorkerId),
    Failed(WorkerAgent),
}

pub struct Orchestrator {
    lifecycle: LifecycleManager,
    options: OrchestratorOptions,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(lifecycle: LifecycleManager, options: OrchestratorOptions) -> Self {
        Self {
            lifecycle,
            options,
            shutdown: CancellationToken::new(),
        }
    }

    /// 绑定外部关闭令牌（通常来自 ShutdownManager::token）
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    pub async fn coordinate(&self, specs: &[WorkerSpec]) -> Result<FleetReport, HiveError> {
        if specs.is_empty() {
            return Err(HiveError::EmptyFleet);
        }
        if self.shutdown.is_cancelled() {
            return Err(HiveError::ShutdownRequested);
        }

        let started_at = now_millis();
        tracing::info!(workers = specs.len(), "coordinating fleet");

        let results = join_all(specs.iter().map(|spec| self.lifecycle.spawn(spec))).await;
        let slots: Vec<Slot> = specs
            .iter()
            .zip(results)
            .map(|(spec, result)| match result {
                Ok(handle) => Slot::Spawned(handle.id),
                Err(e) => Slot::Failed(WorkerAgent::spawn_failed(
                    format!("worker_{}", Uuid::new_v4().simple()),
                    spec.role.clone(),
                    self.lifecycle.executable_for(spec),
                    e.to_string(),
                )),
            })
            .collect();

        let ids: Vec<WorkerId> = slots
            .iter()
            .filter_map(|slot| match slot {
                Slot::Spawned(id) => Some(id.clone()),
                Slot::Failed(_) => None,
            })
            .collect();
        if ids.len() < specs.len() {
            tracing::warn!(
                spawned = ids.len(),
                failed = specs.len() - ids.len(),
                "some workers failed to spawn, continuing with the rest"
            );
        }

        let timed_out = self.wait_for_terminal(&ids).await;

        let registry = self.lifecycle.registry();
        let mut workers = Vec::with_capacity(slots.len());
        for slot in slots {
            match slot {
                Slot::Failed(agent) => workers.push(agent),
                Slot::Spawned(id) => {
                    if let Some(agent) = registry.finished(&id).await {
                        workers.push(agent);
                    } else if let Some(handle) = registry.get(&id).await {
                        workers.push(handle.snapshot());
                    }
                }
            }
        }

        let report = FleetReport::build(workers, registry.active_count().await, started_at, timed_out);
        registry.forget(&ids).await;
        tracing::info!(
            completed = report.completed,
            failed = report.failed,
            artifacts = report.total_artifacts_created,
            success_rate = report.fleet_success_rate,
            "fleet finished"
        );
        Ok(report)
    }

    /// 按固定间隔轮询注册表直到全部终态；返回是否因整体超时而终止
    async fn wait_for_terminal(&self, ids: &[WorkerId]) -> bool {
        let registry = self.lifecycle.registry();
        let deadline = self.options.fleet_timeout.map(|t| Instant::now() + t);
        let mut interval = tokio::time::interval(self.options.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut timed_out = false;
        let mut terminating = false;
        loop {
            let remaining = registry.unfinished(ids).await;
            if remaining.is_empty() {
                break;
            }

            if !terminating {
                if self.shutdown.is_cancelled() {
                    tracing::warn!(remaining = remaining.len(), "shutdown requested, terminating workers");
                    terminating = true;
                } else if deadline.is_some_and(|d| Instant::now() >= d) {
                    tracing::warn!(remaining = remaining.len(), "fleet timed out, terminating workers");
                    timed_out = true;
                    terminating = true;
                }
                if terminating {
                    for id in &remaining {
                        self.lifecycle.terminate(id).await;
                    }
                }
            }

            tokio::select! {
                _ = interval.tick() => {}
                _ = self.shutdown.cancelled(), if !terminating => {}
            }
        }
        timed_out
    }
}

/// 按配置组装编排器：共享记忆、远端、候选目录、核验引擎、生命周期管理
pub fn create_orchestrator(cfg: &AppConfig) -> Result<Orchestrator, HiveError> {
    let memory = open_shared_memory(&cfg.memory)?;

    let remote: Arc<dyn RemoteQuery> = if cfg.remote.instance_url.trim().is_empty() {
        tracing::warn!("remote.instance_url not set, using empty in-memory remote (no claim will verify)");
        Arc::new(InMemoryRemote::new())
    } else {
        Arc::new(ServiceNowRemote::new(&cfg.remote)?)
    };

    let catalog = Arc::new(CandidateCatalog::from_config(&cfg.verification));
    let verifier = VerificationEngine::new(remote, catalog, memory.clone())
        .with_query_timeout(Duration::from_secs(cfg.remote.timeout_secs.max(1)));
    let lifecycle = LifecycleManager::new(
        Arc::new(TokioSpawner),
        verifier,
        memory,
        LifecycleOptions::from(&cfg.worker),
    );
    Ok(Orchestrator::new(lifecycle, OrchestratorOptions::from(&cfg.fleet)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemorySharedMemory;
    use crate::process::{Script, ScriptedSpawner};

    fn build_orchestrator(spawner: ScriptedSpawner) -> Orchestrator {
        let memory = Arc::new(InMemorySharedMemory::new());
        let verifier = VerificationEngine::new(
            Arc::new(InMemoryRemote::new()),
            Arc::new(CandidateCatalog::servicenow()),
            memory.clone(),
        );
        let lifecycle = LifecycleManager::new(
            Arc::new(spawner),
            verifier,
            memory,
            LifecycleOptions {
                executable: "agent".to_string(),
                termination_grace: Duration::from_millis(20),
                drain_timeout: Duration::from_millis(200),
                ..LifecycleOptions::default()
            },
        );
        Orchestrator::new(
            lifecycle,
            OrchestratorOptions {
                poll_interval: Duration::from_millis(10),
                fleet_timeout: Some(Duration::from_millis(200)),
            },
        )
    }

    #[tokio::test]
    async fn test_empty_fleet_is_rejected() {
        let orchestrator = build_orchestrator(ScriptedSpawner::new());
        assert!(matches!(orchestrator.coordinate(&[]).await, Err(HiveError::EmptyFleet)));
    }

    #[tokio::test]
    async fn test_shutdown_before_start_is_rejected() {
        let token = CancellationToken::new();
        token.cancel();
        let orchestrator = build_orchestrator(ScriptedSpawner::new()).with_shutdown(token);
        let result = orchestrator.coordinate(&[WorkerSpec::new("builder", "go")]).await;
        assert!(matches!(result, Err(HiveError::ShutdownRequested)));
    }

    #[tokio::test]
    async fn test_fleet_timeout_terminates_hanging_workers() {
        let spawner = ScriptedSpawner::new()
            .with_script("agent", Script::new().stdout("thinking\n").hang())
            .with_script("quick", Script::new().exit(0));
        let orchestrator = build_orchestrator(spawner);
        let report = orchestrator
            .coordinate(&[
                WorkerSpec::new("slow", "go"),
                WorkerSpec::new("fast", "go").with_executable("quick"),
            ])
            .await
            .unwrap();

        assert!(report.timed_out);
        assert_eq!(report.total_workers, 2);
        assert_eq!(report.failed, 2);
        assert_eq!(report.active_agents, 0);
        assert_eq!(
            report.workers[0].failure,
            Some(crate::core::FailureReason::Terminated)
        );
        assert_eq!(report.workers[1].role, "fast");
    }

    #[tokio::test]
    async fn test_finished_snapshots_released_after_report() {
        let orchestrator =
            build_orchestrator(ScriptedSpawner::new().with_script("agent", Script::new().exit(0)));
        let report = orchestrator
            .coordinate(&[WorkerSpec::new("builder", "go")])
            .await
            .unwrap();

        let id = &report.workers[0].id;
        let registry = orchestrator.lifecycle().registry();
        assert!(registry.finished(id).await.is_none());
        assert_eq!(registry.active_count().await, 0);
    }
}
