//! 核心编排层：错误与失败原因、Worker 状态、完成聚合、FleetReport、编排器、关闭信号

pub mod aggregator;
pub mod error;
pub mod orchestrator;
pub mod report;
pub mod shutdown;
pub mod state;

pub use aggregator::{success_rate, CompletionAggregator, ACCEPTANCE_THRESHOLD};
pub use error::{FailureReason, HiveError, MemoryError, SpawnError, VerificationIoError};
pub use orchestrator::{create_orchestrator, Orchestrator, OrchestratorOptions};
pub use report::FleetReport;
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::{
    LifecycleEvent, LifecycleEventKind, ToolInvocation, VerificationRecord, WorkerAgent, WorkerId,
    WorkerStatus,
};
