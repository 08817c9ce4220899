//! Worker 生命周期管理：拉起、注入指令、事件循环、终止
//!
//! 每个 Worker 由三类任务驱动，全部通过一个 mpsc 通道把事件送进该 Worker 独占的事件循环：
//! - stdout / stderr 读取任务：按块读取、增量 UTF-8 解码 → `Output`，读到 EOF → `StreamClosed`
//! - 退出监督任务：等待退出或终止令牌；终止时先优雅停止，宽限期后强杀 → `Exited`
//! - 核验任务：每个新声明的标识符一个，不阻塞流解析 → `Verified`
//!
//! 事件循环是 WorkerAgent 唯一的修改方，每处理一个事件就把快照发布到 watch 通道。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{WorkerSection, WorkerSpec};
use crate::core::{
    CompletionAggregator, LifecycleEvent, LifecycleEventKind, SpawnError, VerificationRecord,
    WorkerAgent, WorkerStatus,
};
use crate::memory::{keys, SharedMemory};
use crate::process::spawner::{BoxedReader, BoxedWriter};
use crate::process::{
    ExitInfo, ProcessControl, ProcessSpawner, SpawnRequest, SpawnedProcess, WorkerHandle,
    WorkerRegistry,
};
use crate::stream::{OutputParser, ParsedEvent, StreamKind, Utf8ChunkDecoder};
use crate::verify::VerificationEngine;

const READ_CHUNK: usize = 8 * 1024;
const EVENT_CHANNEL_CAPACITY: usize = 256;
const LIFECYCLE_CHANNEL_CAPACITY: usize = 256;

/// 拉起与终止参数（来自 [worker] 段）
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    pub executable: String,
    pub args: Vec<String>,
    pub extra_env: HashMap<String, String>,
    pub scrub_env: Vec<String>,
    pub worker_id_env: String,
    pub role_env: String,
    pub coordination_env: String,
    pub working_dir: Option<PathBuf>,
    pub termination_grace: Duration,
    pub drain_timeout: Duration,
}

impl From<&WorkerSection> for LifecycleOptions {
    fn from(cfg: &WorkerSection) -> Self {
        Self {
            executable: cfg.executable.clone(),
            args: cfg.args.clone(),
            extra_env: cfg.env.clone(),
            scrub_env: cfg.scrub_env.clone(),
            worker_id_env: cfg.worker_id_env.clone(),
            role_env: cfg.role_env.clone(),
            coordination_env: cfg.coordination_env.clone(),
            working_dir: cfg.working_dir.clone(),
            termination_grace: Duration::from_millis(cfg.termination_grace_ms),
            drain_timeout: Duration::from_millis(cfg.drain_timeout_ms),
        }
    }
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self::from(&WorkerSection::default())
    }
}

/// 送入 Worker 事件循环的离散事件
#[derive(Debug)]
enum WorkerEvent {
    Output { kind: StreamKind, text: String },
    StreamClosed(StreamKind),
    Verified(VerificationRecord),
    Exited(ExitInfo),
}

/// 生命周期管理器：持有拉起原语、核验引擎、共享记忆与本实例的 Worker 注册表
#[derive(Clone)]
pub struct LifecycleManager {
    spawner: Arc<dyn ProcessSpawner>,
    verifier: VerificationEngine,
    memory: Arc<dyn SharedMemory>,
    aggregator: CompletionAggregator,
    options: Arc<LifecycleOptions>,
    registry: WorkerRegistry,
    events: broadcast::Sender<LifecycleEvent>,
}

impl LifecycleManager {
    pub fn new(
        spawner: Arc<dyn ProcessSpawner>,
        verifier: VerificationEngine,
        memory: Arc<dyn SharedMemory>,
        options: LifecycleOptions,
    ) -> Self {
        let registry = WorkerRegistry::new();
        let (events, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);
        let aggregator = CompletionAggregator::new(memory.clone(), registry.clone(), events.clone());
        Self {
            spawner,
            verifier,
            memory,
            aggregator,
            options: Arc::new(options),
            registry,
            events,
        }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// 订阅生命周期事件（spawned / working / completed / failed）
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// 拉起一个 Worker：注入环境、登记、写入协调记录、启动事件循环，最后把指令写入 stdin 并关闭
    pub async fn spawn(&self, spec: &WorkerSpec) -> Result<WorkerHandle, SpawnError> {
        let id = format!("worker_{}", Uuid::new_v4().simple());
        let request = self.build_request(&id, spec);

        let SpawnedProcess {
            pid,
            stdin,
            stdout,
            stderr,
            control,
        } = self.spawner.spawn(&request).await.map_err(|e| {
            tracing::error!(role = %spec.role, executable = %request.executable, error = %e, "failed to spawn worker");
            e
        })?;

        let mut agent = WorkerAgent::new(
            id.clone(),
            spec.role.clone(),
            request.executable.clone(),
            self.verifier.catalog().default_category(),
        );
        agent.pid = pid;

        let (snapshot_tx, snapshot_rx) = watch::channel(agent.clone());
        let cancel = CancellationToken::new();
        let handle = WorkerHandle::new(snapshot_rx, cancel.clone());
        self.registry.register(handle.clone()).await;

        let record = serde_json::json!({
            "worker_id": id,
            "role": spec.role,
            "instructions": spec.instructions,
            "executable": request.executable,
            "pid": pid,
            "spawned_at": agent.spawned_at,
        });
        if let Err(e) = self.memory.store(&keys::coordination(&id), record).await {
            tracing::warn!(worker_id = %id, error = %e, "failed to persist coordination record");
        }

        tracing::info!(worker_id = %id, role = %spec.role, pid = ?pid, executable = %request.executable, "worker spawned");
        let _ = self.events.send(LifecycleEvent::new(LifecycleEventKind::Spawned, &agent));

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(pump(stdout, StreamKind::Stdout, tx.clone(), id.clone()));
        tokio::spawn(pump(stderr, StreamKind::Stderr, tx.clone(), id.clone()));
        tokio::spawn(supervise(
            control,
            cancel,
            self.options.termination_grace,
            tx.clone(),
            id.clone(),
        ));

        let worker = WorkerLoop {
            agent,
            stdout: OutputParser::new(StreamKind::Stdout),
            stderr: OutputParser::new(StreamKind::Stderr),
            stdout_open: true,
            stderr_open: true,
            pending: 0,
            verifier: self.verifier.clone(),
            aggregator: self.aggregator.clone(),
            events: self.events.clone(),
            snapshot_tx,
            tx,
            drain_timeout: self.options.drain_timeout,
        };
        tokio::spawn(worker.run(rx));

        // 不读 stdin 的 Worker 会让写入永久挂起，交给独立任务，终止时随管道关闭而结束
        tokio::spawn(deliver_instructions(stdin, spec.instructions.clone(), id));

        Ok(handle)
    }

    /// 终止一个 Worker：优雅信号 → 宽限期 → 强杀。Worker 已退出或不存在时为空操作
    pub async fn terminate(&self, worker_id: &str) {
        match self.registry.get(worker_id).await {
            Some(handle) => {
                if !handle.termination_requested() {
                    tracing::info!(worker_id, "terminating worker");
                }
                handle.terminate();
            }
            None => tracing::debug!(worker_id, "terminate ignored, worker not active"),
        }
    }

    /// 终止全部活跃 Worker，返回发出终止请求的数量
    pub async fn terminate_all(&self) -> usize {
        let handles = self.registry.active_handles().await;
        for handle in &handles {
            self.terminate(&handle.id).await;
        }
        handles.len()
    }

    /// spec 未指定时使用 [worker].executable
    pub fn executable_for(&self, spec: &WorkerSpec) -> String {
        spec.executable
            .clone()
            .unwrap_or_else(|| self.options.executable.clone())
    }

    fn build_request(&self, id: &str, spec: &WorkerSpec) -> SpawnRequest {
        let options = &self.options;
        let mut env = options.extra_env.clone();
        env.insert(options.worker_id_env.clone(), id.to_string());
        env.insert(options.role_env.clone(), spec.role.clone());
        env.insert(options.coordination_env.clone(), "true".to_string());

        SpawnRequest {
            executable: self.executable_for(spec),
            args: spec.args.clone().unwrap_or_else(|| options.args.clone()),
            env,
            env_remove: options.scrub_env.clone(),
            working_dir: options.working_dir.clone(),
        }
    }
}

/// 写入指令后关闭 stdin，表示输入结束
async fn deliver_instructions(mut stdin: BoxedWriter, instructions: String, worker_id: String) {
    let write = async {
        stdin.write_all(instructions.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.shutdown().await
    };
    match write.await {
        Ok(()) => tracing::debug!(worker_id = %worker_id, bytes = instructions.len(), "instructions delivered"),
        Err(e) => tracing::warn!(worker_id = %worker_id, error = %e, "failed to deliver instructions"),
    }
}

/// 读取一路输出直到 EOF
async fn pump(
    mut reader: BoxedReader,
    kind: StreamKind,
    tx: mpsc::Sender<WorkerEvent>,
    worker_id: String,
) {
    let mut decoder = Utf8ChunkDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.decode(&buf[..n]);
                if !text.is_empty() && tx.send(WorkerEvent::Output { kind, text }).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(worker_id = %worker_id, stream = kind.as_str(), error = %e, "output read failed");
                break;
            }
        }
    }
    let tail = decoder.finish();
    if !tail.is_empty() {
        let _ = tx.send(WorkerEvent::Output { kind, text: tail }).await;
    }
    let _ = tx.send(WorkerEvent::StreamClosed(kind)).await;
}

/// 等待进程退出；终止令牌触发时先优雅停止，超过宽限期再强杀
async fn supervise(
    mut control: Box<dyn ProcessControl>,
    cancel: CancellationToken,
    grace: Duration,
    tx: mpsc::Sender<WorkerEvent>,
    worker_id: String,
) {
    let mut terminated = false;
    let result = tokio::select! {
        biased;
        result = control.wait() => result,
        _ = cancel.cancelled() => {
            terminated = true;
            if let Err(e) = control.request_stop().await {
                tracing::debug!(worker_id = %worker_id, error = %e, "graceful stop failed");
            }
            match tokio::time::timeout(grace, control.wait()).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(
                        worker_id = %worker_id,
                        grace_ms = grace.as_millis() as u64,
                        "worker ignored graceful stop, killing"
                    );
                    if let Err(e) = control.force_kill() {
                        tracing::warn!(worker_id = %worker_id, error = %e, "force kill failed");
                    }
                    control.wait().await
                }
            }
        }
    };

    let exit = match result {
        Ok(code) => ExitInfo { code, terminated },
        Err(e) => {
            tracing::warn!(worker_id = %worker_id, error = %e, "failed to wait for worker exit");
            ExitInfo {
                code: None,
                terminated,
            }
        }
    };
    tracing::debug!(worker_id = %worker_id, code = ?exit.code, terminated, "worker process exited");
    let _ = tx.send(WorkerEvent::Exited(exit)).await;
}

/// 单个 Worker 的事件循环
struct WorkerLoop {
    agent: WorkerAgent,
    stdout: OutputParser,
    stderr: OutputParser,
    stdout_open: bool,
    stderr_open: bool,
    /// 在途核验数
    pending: usize,
    verifier: VerificationEngine,
    aggregator: CompletionAggregator,
    events: broadcast::Sender<LifecycleEvent>,
    snapshot_tx: watch::Sender<WorkerAgent>,
    /// 交给核验任务回送结果
    tx: mpsc::Sender<WorkerEvent>,
    drain_timeout: Duration,
}

impl WorkerLoop {
    /// 退出后：drain_timeout 只约束输出流的关闭；正常退出时在途核验一律等到结果，
    /// 被终止的 Worker 则在期限到达后丢弃未完成的核验
    async fn run(mut self, mut rx: mpsc::Receiver<WorkerEvent>) {
        let mut exit: Option<ExitInfo> = None;
        let mut drain_deadline: Option<Instant> = None;

        loop {
            let deadline = match exit {
                Some(info) if info.terminated || self.streams_open() => drain_deadline,
                _ => None,
            };
            let next = match deadline {
                None => rx.recv().await,
                Some(deadline) => match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        if exit.is_some_and(|info| info.terminated) {
                            tracing::warn!(
                                worker_id = %self.agent.id,
                                pending = self.pending,
                                "drain timed out after termination, discarding unresolved verifications"
                            );
                            break;
                        }
                        tracing::warn!(
                            worker_id = %self.agent.id,
                            pending = self.pending,
                            "output streams still open after exit, closing them"
                        );
                        self.close_open_streams();
                        self.snapshot_tx.send_replace(self.agent.clone());
                        if self.pending == 0 {
                            break;
                        }
                        continue;
                    }
                },
            };
            let Some(event) = next else { break };

            match event {
                WorkerEvent::Output { kind, text } => self.on_output(kind, &text),
                WorkerEvent::StreamClosed(kind) => self.on_stream_closed(kind),
                WorkerEvent::Verified(record) => {
                    self.pending = self.pending.saturating_sub(1);
                    self.agent.record_verification(record);
                }
                WorkerEvent::Exited(info) => {
                    exit = Some(info);
                    drain_deadline = Some(Instant::now() + self.drain_timeout);
                }
            }
            self.snapshot_tx.send_replace(self.agent.clone());

            if exit.is_some() && !self.streams_open() && self.pending == 0 {
                break;
            }
        }

        let exit = exit.unwrap_or(ExitInfo {
            code: None,
            terminated: false,
        });
        let agent = self.aggregator.finalize(self.agent, exit).await;
        self.snapshot_tx.send_replace(agent);
    }

    fn streams_open(&self) -> bool {
        self.stdout_open || self.stderr_open
    }

    fn is_open(&self, kind: StreamKind) -> bool {
        match kind {
            StreamKind::Stdout => self.stdout_open,
            StreamKind::Stderr => self.stderr_open,
        }
    }

    /// 孙进程可能继承管道导致 EOF 迟迟不来：按已关闭处理，冲刷缓冲区
    fn close_open_streams(&mut self) {
        for kind in [StreamKind::Stdout, StreamKind::Stderr] {
            if self.is_open(kind) {
                self.on_stream_closed(kind);
            }
        }
    }

    fn on_output(&mut self, kind: StreamKind, text: &str) {
        if !self.is_open(kind) {
            return;
        }
        let parsed = match kind {
            StreamKind::Stdout => self.stdout.feed(text),
            StreamKind::Stderr => self.stderr.feed(text),
        };
        if self.agent.status == WorkerStatus::Spawning && self.agent.transition(WorkerStatus::Active) {
            tracing::debug!(worker_id = %self.agent.id, "first output observed, worker active");
        }
        let saw_marker = self.apply(parsed);
        if kind == StreamKind::Stdout && !saw_marker && self.agent.status == WorkerStatus::Working {
            self.agent.transition(WorkerStatus::Active);
        }
    }

    fn on_stream_closed(&mut self, kind: StreamKind) {
        if !self.is_open(kind) {
            return;
        }
        let parsed = match kind {
            StreamKind::Stdout => {
                self.stdout_open = false;
                self.stdout.finish()
            }
            StreamKind::Stderr => {
                self.stderr_open = false;
                self.stderr.finish()
            }
        };
        self.apply(parsed);
        tracing::debug!(worker_id = %self.agent.id, stream = kind.as_str(), "output stream closed");
    }

    /// 按观察顺序应用解析事件；返回是否出现了工具调用标记
    fn apply(&mut self, parsed: Vec<ParsedEvent>) -> bool {
        let mut saw_marker = false;
        for event in parsed {
            match event {
                ParsedEvent::Tool(invocation) => {
                    saw_marker = true;
                    self.agent.current_category =
                        self.verifier.catalog().category_for(&invocation).to_string();
                    tracing::debug!(
                        worker_id = %self.agent.id,
                        server = %invocation.source_label,
                        tool = %invocation.action_label,
                        category = %self.agent.current_category,
                        "tool invocation observed"
                    );
                    self.agent.record_invocation(invocation);
                    if self.agent.transition(WorkerStatus::Working) {
                        let _ = self
                            .events
                            .send(LifecycleEvent::new(LifecycleEventKind::Working, &self.agent));
                    }
                }
                ParsedEvent::Identifier(identifier) => {
                    if self.agent.claim(&identifier) {
                        tracing::info!(
                            worker_id = %self.agent.id,
                            identifier = %identifier,
                            category = %self.agent.current_category,
                            "identifier claimed"
                        );
                        self.start_verification(identifier);
                    }
                }
            }
        }
        saw_marker
    }

    fn start_verification(&mut self, identifier: String) {
        let verifier = self.verifier.clone();
        let tx = self.tx.clone();
        let worker_id = self.agent.id.clone();
        let category = self.agent.current_category.clone();
        self.pending += 1;
        tokio::spawn(async move {
            let record = verifier.verify(&worker_id, &identifier, &category).await;
            let _ = tx.send(WorkerEvent::Verified(record)).await;
        });
    }
}
