//! 进程层：拉起原语、脚本化进程、Worker 注册表、生命周期管理

pub mod lifecycle;
pub mod registry;
pub mod scripted;
pub mod spawner;

pub use lifecycle::{LifecycleManager, LifecycleOptions};
pub use registry::{WorkerHandle, WorkerRegistry};
pub use scripted::{Script, ScriptedSpawner, SpawnRecord};
pub use spawner::{
    ExitInfo, ProcessControl, ProcessSpawner, SpawnRequest, SpawnedProcess, TokioSpawner,
};
