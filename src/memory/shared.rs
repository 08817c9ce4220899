//! 共享记忆：跨进程协调与审计用的键值存储
//!
//! 只需 store / get，无事务语义。每个 Worker 只写自己 `hive/workers/{id}/...` 命名空间下的键，
//! 且每个键只有一个写入方，因此无需加锁协调。
//! 提供内存实现（测试 / 单进程）与 SQLite 实现（持久化，rusqlite 同步调用放到 spawn_blocking）。

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::config::MemorySection;
use crate::core::MemoryError;

/// 共享记忆 trait
#[async_trait]
pub trait SharedMemory: Send + Sync {
    async fn store(&self, key: &str, value: Value) -> Result<(), MemoryError>;

    async fn get(&self, key: &str) -> Result<Option<Value>, MemoryError>;
}

/// 键命名空间
pub mod keys {
    const ROOT: &str = "hive/workers";

    /// 拉起时写入的协调记录（role、instructions、spawn 时间）
    pub fn coordination(worker_id: &str) -> String {
        format!("{}/{}/coordination", ROOT, worker_id)
    }

    pub fn verification(worker_id: &str, identifier: &str) -> String {
        format!("{}/{}/verifications/{}", ROOT, worker_id, identifier)
    }

    /// 退出后聚合的完整快照
    pub fn result(worker_id: &str) -> String {
        format!("{}/{}/result", ROOT, worker_id)
    }
}

/// 内存实现
#[derive(Clone, Default)]
pub struct InMemorySharedMemory {
    entries: Arc<RwLock<HashMap<String, Value>>>,
}

impl InMemorySharedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 列出某前缀下的全部键（排序后返回）
    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl SharedMemory for InMemorySharedMemory {
    async fn store(&self, key: &str, value: Value) -> Result<(), MemoryError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, MemoryError> {
        Ok(self.entries.read().await.get(key).cloned())
    }
}

/// SQLite 实现：单表 key / value(JSON) / updated_at
#[derive(Clone)]
pub struct SqliteSharedMemory {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSharedMemory {
    /// 打开（不存在则创建）数据库文件；父目录不存在时自动创建
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, MemoryError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, MemoryError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS shared_memory (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, MemoryError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, MemoryError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| MemoryError::Join(format!("connection lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| MemoryError::Join(e.to_string()))?
    }
}

#[async_trait]
impl SharedMemory for SqliteSharedMemory {
    async fn store(&self, key: &str, value: Value) -> Result<(), MemoryError> {
        let key = key.to_string();
        let text = serde_json::to_string(&value)?;
        let now = chrono::Utc::now().timestamp_millis();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO shared_memory (key, value, updated_at) VALUES (?1, ?2, ?3)",
                params![key, text, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, MemoryError> {
        let key = key.to_string();
        let text: Option<String> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT value FROM shared_memory WHERE key = ?1",
                        params![key],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        match text {
            Some(t) => Ok(Some(serde_json::from_str(&t)?)),
            None => Ok(None),
        }
    }
}

/// 按 [memory] 配置创建共享记忆后端
pub fn open_shared_memory(cfg: &MemorySection) -> Result<Arc<dyn SharedMemory>, MemoryError> {
    match cfg.backend.to_lowercase().as_str() {
        "memory" | "in_memory" => Ok(Arc::new(InMemorySharedMemory::new())),
        _ => {
            tracing::info!(path = %cfg.path.display(), "Using SQLite shared memory");
            Ok(Arc::new(SqliteSharedMemory::open(&cfg.path)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_store_and_get() {
        let mem = InMemorySharedMemory::new();
        assert_eq!(mem.get("missing").await.unwrap(), None);
        mem.store(&keys::result("w1"), json!({"status": "completed"}))
            .await
            .unwrap();
        let value = mem.get(&keys::result("w1")).await.unwrap().unwrap();
        assert_eq!(value["status"], "completed");
        assert_eq!(
            mem.keys_with_prefix("hive/workers/w1").await,
            vec!["hive/workers/w1/result".to_string()]
        );
    }

    #[test]
    fn test_sqlite_open_reports_unusable_parent() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let result = SqliteSharedMemory::open(blocker.join("hive.db"));
        assert!(matches!(result, Err(MemoryError::Io(_))));
    }

    #[tokio::test]
    async fn test_sqlite_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("hive.db");
        {
            let mem = SqliteSharedMemory::open(&path).unwrap();
            mem.store("k", json!({"n": 1})).await.unwrap();
            mem.store("k", json!({"n": 2})).await.unwrap();
        }
        let mem = SqliteSharedMemory::open(&path).unwrap();
        assert_eq!(mem.get("k").await.unwrap(), Some(json!({"n": 2})));
        assert_eq!(mem.get("other").await.unwrap(), None);
    }

    #[test]
    fn test_keys_are_namespaced_per_worker() {
        assert_eq!(keys::coordination("w1"), "hive/workers/w1/coordination");
        assert_eq!(
            keys::verification("w1", "abc"),
            "hive/workers/w1/verifications/abc"
        );
    }
}
