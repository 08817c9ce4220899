//! Worker 状态与数据模型：WorkerAgent / ToolInvocation / VerificationRecord / 生命周期事件
//!
//! WorkerAgent 由所属 Worker 的事件循环独占修改，其余地方只拿快照（clone）。
//! 状态迁移单调：spawning → active ⇄ working → completed | failed，终态只写一次。

use std::collections::BTreeMap;

use serde::Serialize;

use crate::core::error::FailureReason;

/// Worker ID（spawn 时生成，全局唯一）
pub type WorkerId = String;

/// 当前毫秒时间戳
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Worker 状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// 进程已启动，尚未观察到任何输出
    Spawning,
    /// 有输出，但当前不在工具调用中
    Active,
    /// 最近一次输出包含工具调用标记
    Working,
    Completed,
    Failed,
}

impl WorkerStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerStatus::Completed | WorkerStatus::Failed)
    }

    /// 是否允许迁移到 next；仅 active ⇄ working 可来回
    pub fn can_transition_to(self, next: WorkerStatus) -> bool {
        use WorkerStatus::*;
        match (self, next) {
            (Completed | Failed, _) => false,
            (Spawning, Active | Working | Completed | Failed) => true,
            (Active, Working | Completed | Failed) => true,
            (Working, Active | Completed | Failed) => true,
            _ => false,
        }
    }
}

/// 从输出中推断出的一次工具调用（记录后不可变）
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolInvocation {
    /// 服务名（如 servicenow-deployment）
    pub source_label: String,
    /// 工具名（如 snow_deploy）
    pub action_label: String,
    /// 协议标签（如 MCP）
    pub protocol_tag: String,
    pub observed_at: i64,
    /// 命中的原文片段
    pub raw_excerpt: String,
}

/// 单个标识符的核验结果；每个 Worker 每个标识符至多一条，写入后不再修改
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VerificationRecord {
    pub identifier: String,
    /// 命中的集合名；未命中时为 None
    pub collection_name: Option<String>,
    pub exists: bool,
    pub verified_at: i64,
    /// 实际探测过的候选集合数
    pub candidates_checked: usize,
}

/// 一个被拉起的外部进程及其跟踪状态（进程句柄由生命周期任务独占，不在快照里）
#[derive(Clone, Debug, Serialize)]
pub struct WorkerAgent {
    pub id: WorkerId,
    pub role: String,
    pub executable: String,
    pub pid: Option<u32>,
    pub status: WorkerStatus,
    pub work_log: Vec<ToolInvocation>,
    /// 按首次出现顺序保存，不重复
    pub claimed_identifiers: Vec<String>,
    pub verifications: BTreeMap<String, VerificationRecord>,
    pub spawned_at: i64,
    pub completed_at: Option<i64>,
    pub exit_code: Option<i32>,
    pub success_rate: Option<f64>,
    pub failure: Option<FailureReason>,
    /// 最近一次工具调用所属的类别，决定新声明标识符的候选集合
    pub current_category: String,
}

impl WorkerAgent {
    pub fn new(
        id: impl Into<WorkerId>,
        role: impl Into<String>,
        executable: impl Into<String>,
        default_category: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            executable: executable.into(),
            pid: None,
            status: WorkerStatus::Spawning,
            work_log: Vec::new(),
            claimed_identifiers: Vec::new(),
            verifications: BTreeMap::new(),
            spawned_at: now_millis(),
            completed_at: None,
            exit_code: None,
            success_rate: None,
            failure: None,
            current_category: default_category.into(),
        }
    }

    /// 启动失败的占位 Worker：直接处于 failed，供 FleetReport 展示
    pub fn spawn_failed(
        id: impl Into<WorkerId>,
        role: impl Into<String>,
        executable: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let mut agent = Self::new(id, role, executable, String::new());
        agent.status = WorkerStatus::Failed;
        agent.completed_at = Some(agent.spawned_at);
        agent.success_rate = Some(0.0);
        agent.failure = Some(FailureReason::SpawnFailed {
            message: message.into(),
        });
        agent
    }

    /// 非终态迁移；非法迁移返回 false 且不修改状态
    pub fn transition(&mut self, next: WorkerStatus) -> bool {
        if self.status == next || !self.status.can_transition_to(next) || next.is_terminal() {
            return false;
        }
        self.status = next;
        true
    }

    pub fn record_invocation(&mut self, invocation: ToolInvocation) {
        self.work_log.push(invocation);
    }

    /// 记录一次声明；已声明过返回 false
    pub fn claim(&mut self, identifier: &str) -> bool {
        if self.claimed_identifiers.iter().any(|c| c == identifier) {
            return false;
        }
        self.claimed_identifiers.push(identifier.to_string());
        true
    }

    pub fn is_claimed(&self, identifier: &str) -> bool {
        self.claimed_identifiers.iter().any(|c| c == identifier)
    }

    /// 写入核验结果：必须先声明过，且同一标识符只写一次
    pub fn record_verification(&mut self, record: VerificationRecord) -> bool {
        if !self.is_claimed(&record.identifier) || self.verifications.contains_key(&record.identifier) {
            return false;
        }
        self.verifications.insert(record.identifier.clone(), record);
        true
    }

    pub fn total_claimed(&self) -> usize {
        self.claimed_identifiers.len()
    }

    pub fn verified_count(&self) -> usize {
        self.verifications.values().filter(|r| r.exists).count()
    }

    /// 写入终态；completed_at 只会被设置一次
    pub(crate) fn finish(
        &mut self,
        status: WorkerStatus,
        exit_code: Option<i32>,
        success_rate: f64,
        failure: Option<FailureReason>,
    ) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.exit_code = exit_code;
        self.success_rate = Some(success_rate);
        self.failure = failure;
        self.completed_at = Some(now_millis());
        true
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at.map(|done| (done - self.spawned_at).max(0))
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// 生命周期事件类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventKind {
    Spawned,
    Working,
    Completed,
    Failed,
}

/// 生命周期事件：携带事件发生时的 WorkerAgent 快照
#[derive(Clone, Debug, Serialize)]
pub struct LifecycleEvent {
    pub kind: LifecycleEventKind,
    pub agent: WorkerAgent,
}

impl LifecycleEvent {
    pub fn new(kind: LifecycleEventKind, agent: &WorkerAgent) -> Self {
        Self {
            kind,
            agent: agent.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(identifier: &str, exists: bool) -> VerificationRecord {
        VerificationRecord {
            identifier: identifier.to_string(),
            collection_name: exists.then(|| "incident".to_string()),
            exists,
            verified_at: now_millis(),
            candidates_checked: 1,
        }
    }

    #[test]
    fn test_status_transitions() {
        let mut agent = WorkerAgent::new("w1", "builder", "snow-flow", "platform");
        assert!(agent.transition(WorkerStatus::Active));
        assert!(agent.transition(WorkerStatus::Working));
        assert!(agent.transition(WorkerStatus::Active));
        assert!(!agent.transition(WorkerStatus::Spawning));
        // 终态只能经 finish 写入
        assert!(!agent.transition(WorkerStatus::Completed));
        assert!(agent.finish(WorkerStatus::Completed, Some(0), 1.0, None));
        assert!(!agent.finish(WorkerStatus::Failed, Some(1), 0.0, None));
        assert_eq!(agent.status, WorkerStatus::Completed);
        assert!(!agent.transition(WorkerStatus::Active));
    }

    #[test]
    fn test_claims_are_deduplicated() {
        let mut agent = WorkerAgent::new("w1", "builder", "snow-flow", "platform");
        assert!(agent.claim("a"));
        assert!(!agent.claim("a"));
        assert!(agent.claim("b"));
        assert_eq!(agent.claimed_identifiers, vec!["a", "b"]);
    }

    #[test]
    fn test_verification_requires_claim_and_is_written_once() {
        let mut agent = WorkerAgent::new("w1", "builder", "snow-flow", "platform");
        assert!(!agent.record_verification(record("x", true)));
        agent.claim("x");
        assert!(agent.record_verification(record("x", true)));
        assert!(!agent.record_verification(record("x", false)));
        assert!(agent.verifications["x"].exists);
        assert!(agent.verified_count() <= agent.total_claimed());
    }

    #[test]
    fn test_spawn_failed_is_terminal() {
        let agent = WorkerAgent::spawn_failed("w2", "tester", "/missing", "not found");
        assert_eq!(agent.status, WorkerStatus::Failed);
        assert!(agent.completed_at.is_some());
        assert!(matches!(agent.failure, Some(FailureReason::SpawnFailed { .. })));
    }
}
