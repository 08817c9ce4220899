//! 错误类型与失败原因
//!
//! 只有 SpawnError（以及 coordinate 的前置条件错误）会以 Err 形式向上传播；
//! 远端查询失败、验收不达标都被记录进 WorkerAgent / FleetReport 数据中，正常返回。

use serde::Serialize;
use thiserror::Error;

/// 拉起 Worker 进程失败（可执行文件缺失、启动即崩溃、管道缺失）
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Executable not found: {0}")]
    NotFound(String),

    #[error("Failed to start '{executable}': {source}")]
    Io {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process '{0}' exited before a handle was established")]
    ExitedEarly(String),

    #[error("Missing stdio pipe: {0}")]
    MissingPipe(&'static str),
}

/// 远端单条记录读取失败；验证引擎只记日志并视为「该候选集合未命中」
#[derive(Error, Debug)]
pub enum VerificationIoError {
    #[error("Request to '{collection}' failed: {message}")]
    Transport { collection: String, message: String },

    #[error("Unexpected status {status} from '{collection}'")]
    Status { collection: String, status: u16 },

    #[error("Query against '{0}' timed out")]
    Timeout(String),

    #[error("Malformed response from '{collection}': {message}")]
    Decode { collection: String, message: String },
}

/// 共享记忆读写错误
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Blocking task failed: {0}")]
    Join(String),
}

/// 编排层对外错误：仅在 fan-out 前置条件失败时返回
#[derive(Error, Debug)]
pub enum HiveError {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("No worker specs to coordinate")]
    EmptyFleet,

    #[error("Shutdown already requested")]
    ShutdownRequested,
}

/// Worker 进入 failed 的原因（记录在数据里，从不抛出）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// 进程未能启动
    SpawnFailed { message: String },
    /// 非零退出码，无论 success_rate 如何
    NonZeroExit { code: i32 },
    /// 被信号杀死，无退出码
    Signalled,
    /// 被编排器主动终止（超时 / 关闭）
    Terminated,
    /// 退出码为 0，但已核验比例未超过验收阈值
    Acceptance { success_rate: f64, threshold: f64 },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::SpawnFailed { message } => write!(f, "spawn failed: {}", message),
            FailureReason::NonZeroExit { code } => write!(f, "exited with code {}", code),
            FailureReason::Signalled => write!(f, "killed by signal"),
            FailureReason::Terminated => write!(f, "terminated by orchestrator"),
            FailureReason::Acceptance {
                success_rate,
                threshold,
            } => write!(
                f,
                "success rate {:.2} did not exceed threshold {:.2}",
                success_rate, threshold
            ),
        }
    }
}
