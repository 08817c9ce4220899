//! 远端单条记录读取原语
//!
//! `query(collection, identifier)`：命中返回记录，未命中返回 None，网络 / 状态码异常返回 VerificationIoError。
//! ServiceNowRemote 走 Table API（GET /api/now/table/{table}/{sys_id}，Basic Auth）；
//! InMemoryRemote 用于测试与离线演练，可注入失败并记录调用顺序。

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use crate::config::RemoteSection;
use crate::core::{HiveError, VerificationIoError};

/// 远端只读查询 trait
#[async_trait]
pub trait RemoteQuery: Send + Sync {
    async fn query(
        &self,
        collection: &str,
        identifier: &str,
    ) -> Result<Option<Value>, VerificationIoError>;
}

/// ServiceNow Table API 客户端
pub struct ServiceNowRemote {
    client: reqwest::Client,
    instance_url: String,
    username: String,
    password: String,
}

impl ServiceNowRemote {
    pub fn new(cfg: &RemoteSection) -> Result<Self, HiveError> {
        if cfg.instance_url.trim().is_empty() {
            return Err(HiveError::ConfigError(
                "remote.instance_url is not set".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
            .build()
            .map_err(|e| HiveError::ConfigError(format!("http client: {}", e)))?;
        let instance_url = if cfg.instance_url.starts_with("http") {
            cfg.instance_url.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", cfg.instance_url.trim_end_matches('/'))
        };
        Ok(Self {
            client,
            instance_url,
            username: cfg.username.clone(),
            password: cfg.password.clone(),
        })
    }

    fn record_url(&self, collection: &str, identifier: &str) -> String {
        format!(
            "{}/api/now/table/{}/{}?sysparm_fields=sys_id",
            self.instance_url, collection, identifier
        )
    }
}

#[async_trait]
impl RemoteQuery for ServiceNowRemote {
    async fn query(
        &self,
        collection: &str,
        identifier: &str,
    ) -> Result<Option<Value>, VerificationIoError> {
        let response = self
            .client
            .get(self.record_url(collection, identifier))
            .basic_auth(&self.username, Some(&self.password))
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    VerificationIoError::Timeout(collection.to_string())
                } else {
                    VerificationIoError::Transport {
                        collection: collection.to_string(),
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(VerificationIoError::Status {
                collection: collection.to_string(),
                status: status.as_u16(),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| VerificationIoError::Decode {
                collection: collection.to_string(),
                message: e.to_string(),
            })?;
        // Table API 把记录包在 result 里；空 result 视为未命中
        match body.get("result") {
            Some(Value::Null) => Ok(None),
            Some(Value::Object(map)) if map.is_empty() => Ok(None),
            Some(record) => Ok(Some(record.clone())),
            None => Ok(Some(body)),
        }
    }
}

/// 内存远端：collection → 记录 ID 集合
#[derive(Default)]
pub struct InMemoryRemote {
    records: RwLock<HashMap<String, HashSet<String>>>,
    failing: RwLock<HashSet<String>>,
    calls: Mutex<Vec<(String, String)>>,
    latency: Option<Duration>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每次查询前人为等待，模拟网络延迟
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub async fn insert(&self, collection: &str, identifier: &str) {
        self.records
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(identifier.to_string());
    }

    /// 令该集合的所有查询返回传输错误
    pub async fn fail_collection(&self, collection: &str) {
        self.failing.write().await.insert(collection.to_string());
    }

    /// 已发生的查询（按发生顺序）
    pub async fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl RemoteQuery for InMemoryRemote {
    async fn query(
        &self,
        collection: &str,
        identifier: &str,
    ) -> Result<Option<Value>, VerificationIoError> {
        self.calls
            .lock()
            .await
            .push((collection.to_string(), identifier.to_string()));
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.read().await.contains(collection) {
            return Err(VerificationIoError::Transport {
                collection: collection.to_string(),
                message: "injected failure".to_string(),
            });
        }
        let hit = self
            .records
            .read()
            .await
            .get(collection)
            .is_some_and(|ids| ids.contains(identifier));
        Ok(hit.then(|| serde_json::json!({ "sys_id": identifier })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_servicenow_requires_instance() {
        let cfg = RemoteSection::default();
        assert!(matches!(
            ServiceNowRemote::new(&cfg),
            Err(HiveError::ConfigError(_))
        ));
    }

    #[test]
    fn test_servicenow_record_url() {
        let cfg = RemoteSection {
            instance_url: "dev12345.service-now.com/".to_string(),
            ..RemoteSection::default()
        };
        let remote = ServiceNowRemote::new(&cfg).unwrap();
        assert_eq!(
            remote.record_url("sp_widget", "abc"),
            "https://dev12345.service-now.com/api/now/table/sp_widget/abc?sysparm_fields=sys_id"
        );
    }

    #[tokio::test]
    async fn test_in_memory_remote() {
        let remote = InMemoryRemote::new();
        remote.insert("incident", "a").await;
        remote.fail_collection("problem").await;
        assert!(remote.query("incident", "a").await.unwrap().is_some());
        assert!(remote.query("incident", "b").await.unwrap().is_none());
        assert!(remote.query("problem", "a").await.is_err());
        assert_eq!(remote.calls().await.len(), 3);
    }
}
