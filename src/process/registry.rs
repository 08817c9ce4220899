//! Worker 注册表：由拥有它的 LifecycleManager / Orchestrator 实例持有（非全局单例）
//!
//! active 存放仍在运行的 Worker 句柄；进入终态后句柄被驱逐，最终快照转入 finished。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::core::{WorkerAgent, WorkerId};

/// 运行中 Worker 的句柄：快照订阅 + 终止令牌
#[derive(Clone, Debug)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub role: String,
    snapshot: watch::Receiver<WorkerAgent>,
    cancel: CancellationToken,
}

impl WorkerHandle {
    pub(crate) fn new(
        snapshot: watch::Receiver<WorkerAgent>,
        cancel: CancellationToken,
    ) -> Self {
        let (id, role) = {
            let agent = snapshot.borrow();
            (agent.id.clone(), agent.role.clone())
        };
        Self {
            id,
            role,
            snapshot,
            cancel,
        }
    }

    /// 当前快照
    pub fn snapshot(&self) -> WorkerAgent {
        self.snapshot.borrow().clone()
    }

    /// 请求终止：先优雅信号，宽限期后强杀。可重复调用；进程已退出时为空操作
    pub fn terminate(&self) {
        self.cancel.cancel();
    }

    pub fn termination_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 等待进入终态并返回最终快照
    pub async fn wait_terminal(&mut self) -> WorkerAgent {
        loop {
            {
                let agent = self.snapshot.borrow_and_update();
                if agent.is_terminal() {
                    return agent.clone();
                }
            }
            if self.snapshot.changed().await.is_err() {
                return self.snapshot.borrow().clone();
            }
        }
    }
}

/// 活跃 / 已结束 Worker 表
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    active: Arc<RwLock<HashMap<WorkerId, WorkerHandle>>>,
    finished: Arc<RwLock<HashMap<WorkerId, WorkerAgent>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, handle: WorkerHandle) {
        self.active.write().await.insert(handle.id.clone(), handle);
    }

    /// 驱逐：先写 finished 再移出 active，轮询方不会看到「两边都不在」
    pub async fn evict(&self, id: &str, final_snapshot: WorkerAgent) {
        self.finished
            .write()
            .await
            .insert(id.to_string(), final_snapshot);
        self.active.write().await.remove(id);
    }

    pub async fn get(&self, id: &str) -> Option<WorkerHandle> {
        self.active.read().await.get(id).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    pub async fn active_handles(&self) -> Vec<WorkerHandle> {
        self.active.read().await.values().cloned().collect()
    }

    pub async fn finished(&self, id: &str) -> Option<WorkerAgent> {
        self.finished.read().await.get(id).cloned()
    }

    /// 丢弃已结束 Worker 的快照（报告生成后调用）
    pub async fn forget(&self, ids: &[WorkerId]) {
        let mut finished = self.finished.write().await;
        for id in ids {
            finished.remove(id.as_str());
        }
    }

    /// 给定 ID 中尚未进入终态的那些
    pub async fn unfinished(&self, ids: &[WorkerId]) -> Vec<WorkerId> {
        let finished = self.finished.read().await;
        ids.iter()
            .filter(|id| !finished.contains_key(id.as_str()))
            .cloned()
            .collect()
    }
}
