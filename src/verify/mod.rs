//! 核验层：远端只读查询原语、候选集合目录、核验引擎

pub mod catalog;
pub mod engine;
pub mod remote;

pub use catalog::{CandidateCatalog, ToolCategory};
pub use engine::VerificationEngine;
pub use remote::{InMemoryRemote, RemoteQuery, ServiceNowRemote};
