//! Hive - 多 Agent Worker 编排器
//!
//! 拉起一组外部 Agent 进程，解析它们的自由文本输出，逐一核验其声称创建的远端记录，
//! 并汇总为一份 FleetReport。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误、Worker 状态、完成聚合、FleetReport、编排器、关闭信号
//! - **process**: 进程拉起原语、脚本化进程、注册表、生命周期管理
//! - **stream**: 输出流解析（工具调用标记 / 标识符）与 UTF-8 增量解码
//! - **verify**: 远端只读查询、候选集合目录、核验引擎
//! - **memory**: 共享键值记忆（内存 / SQLite）
//! - **observability**: 日志初始化与生命周期事件日志

pub mod config;
pub mod core;
pub mod memory;
pub mod observability;
pub mod process;
pub mod stream;
pub mod verify;

pub use crate::core::{create_orchestrator, FleetReport, Orchestrator};
