//! 核验引擎：按类别的候选列表逐个探测远端集合，首个命中即停
//!
//! 只读、可重试，从不修改远端状态。单个候选查询失败 / 超时只记 warn 并继续下一个候选。
//! 结果写入共享记忆 `hive/workers/{id}/verifications/{identifier}` 供其他观察者读取。

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::core::state::now_millis;
use crate::core::VerificationRecord;
use crate::memory::{keys, SharedMemory};
use crate::verify::{CandidateCatalog, RemoteQuery};

/// 单次候选查询的默认超时
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(15);

/// 核验引擎（可 clone 后放进各个核验任务）
#[derive(Clone)]
pub struct VerificationEngine {
    remote: Arc<dyn RemoteQuery>,
    catalog: Arc<CandidateCatalog>,
    memory: Arc<dyn SharedMemory>,
    query_timeout: Duration,
}

impl VerificationEngine {
    pub fn new(
        remote: Arc<dyn RemoteQuery>,
        catalog: Arc<CandidateCatalog>,
        memory: Arc<dyn SharedMemory>,
    ) -> Self {
        Self {
            remote,
            catalog,
            memory,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_query_timeout(mut self, query_timeout: Duration) -> Self {
        self.query_timeout = query_timeout;
        self
    }

    pub fn catalog(&self) -> &CandidateCatalog {
        &self.catalog
    }

    /// 核验一个已声明的标识符；总是返回一条记录（未命中时 exists = false）
    pub async fn verify(&self, worker_id: &str, identifier: &str, category: &str) -> VerificationRecord {
        let candidates = self.catalog.candidates(category);
        let mut checked = 0;
        let mut matched = None;

        for collection in candidates {
            checked += 1;
            match timeout(self.query_timeout, self.remote.query(collection, identifier)).await {
                Ok(Ok(Some(_))) => {
                    matched = Some(collection.clone());
                    break;
                }
                Ok(Ok(None)) => {
                    tracing::debug!(worker_id, identifier, collection = %collection, "not found in candidate");
                }
                Ok(Err(error)) => {
                    tracing::warn!(worker_id, identifier, collection = %collection, %error, "verification query failed, trying next candidate");
                }
                Err(_) => {
                    tracing::warn!(
                        worker_id,
                        identifier,
                        collection = %collection,
                        timeout_ms = self.query_timeout.as_millis() as u64,
                        "verification query timed out, trying next candidate"
                    );
                }
            }
        }

        let record = VerificationRecord {
            identifier: identifier.to_string(),
            exists: matched.is_some(),
            collection_name: matched,
            verified_at: now_millis(),
            candidates_checked: checked,
        };

        if record.exists {
            tracing::info!(worker_id, identifier, collection = ?record.collection_name, "identifier verified");
        } else {
            tracing::warn!(worker_id, identifier, category, checked, "identifier not found in any candidate collection");
        }

        match serde_json::to_value(&record) {
            Ok(value) => {
                if let Err(error) = self
                    .memory
                    .store(&keys::verification(worker_id, identifier), value)
                    .await
                {
                    tracing::warn!(worker_id, identifier, %error, "failed to persist verification record");
                }
            }
            Err(error) => tracing::warn!(worker_id, %error, "failed to serialize verification record"),
        }

        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemorySharedMemory;
    use crate::verify::{InMemoryRemote, ToolCategory};

    const ID: &str = "3f9c2b1a4e5d6f7a8b9c0d1e2f3a4b5c";

    fn four_table_catalog() -> Arc<CandidateCatalog> {
        Arc::new(CandidateCatalog::new(
            vec![ToolCategory {
                name: "deployment".to_string(),
                server_keywords: vec!["deployment".to_string()],
                collections: vec![
                    "sp_widget".to_string(),
                    "sys_ui_page".to_string(),
                    "sys_script_include".to_string(),
                    "sys_ui_action".to_string(),
                ],
            }],
            "deployment",
        ))
    }

    #[tokio::test]
    async fn test_first_matching_candidate_wins() {
        let remote = Arc::new(InMemoryRemote::new());
        remote.insert("sys_ui_page", ID).await;
        remote.insert("sys_script_include", ID).await;
        let memory = Arc::new(InMemorySharedMemory::new());
        let engine = VerificationEngine::new(remote.clone(), four_table_catalog(), memory.clone());

        let record = engine.verify("w1", ID, "deployment").await;
        assert!(record.exists);
        assert_eq!(record.collection_name.as_deref(), Some("sys_ui_page"));
        assert_eq!(record.candidates_checked, 2);
        // 命中后不再探测后续候选
        let calls = remote.calls().await;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "sp_widget");

        let stored = memory
            .get(&keys::verification("w1", ID))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored["collection_name"], "sys_ui_page");
    }

    #[tokio::test]
    async fn test_io_errors_are_skipped() {
        let remote = Arc::new(InMemoryRemote::new());
        remote.fail_collection("sp_widget").await;
        remote.fail_collection("sys_ui_page").await;
        remote.insert("sys_script_include", ID).await;
        let engine = VerificationEngine::new(
            remote,
            four_table_catalog(),
            Arc::new(InMemorySharedMemory::new()),
        );

        let record = engine.verify("w1", ID, "deployment").await;
        assert!(record.exists);
        assert_eq!(record.collection_name.as_deref(), Some("sys_script_include"));
    }

    #[tokio::test]
    async fn test_exhausted_candidates_report_missing() {
        let remote = Arc::new(InMemoryRemote::new());
        remote.insert("incident", ID).await; // 不在 deployment 候选列表里
        let engine = VerificationEngine::new(
            remote.clone(),
            four_table_catalog(),
            Arc::new(InMemorySharedMemory::new()),
        );

        let record = engine.verify("w1", ID, "deployment").await;
        assert!(!record.exists);
        assert_eq!(record.collection_name, None);
        assert_eq!(record.candidates_checked, 4);
        assert_eq!(remote.calls().await.len(), 4);
    }

    #[tokio::test]
    async fn test_slow_candidate_times_out() {
        let remote = Arc::new(InMemoryRemote::new().with_latency(Duration::from_millis(200)));
        remote.insert("sp_widget", ID).await;
        let engine = VerificationEngine::new(
            remote,
            four_table_catalog(),
            Arc::new(InMemorySharedMemory::new()),
        )
        .with_query_timeout(Duration::from_millis(10));

        let record = engine.verify("w1", ID, "deployment").await;
        assert!(!record.exists);
    }
}
