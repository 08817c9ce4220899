//! 脚本化进程（用于测试与离线演练，无需真实 Agent 可执行文件）
//!
//! 每个可执行名对应一段 Script：按顺序向 stdout / stderr 写块、睡眠，最后以给定退出码结束。
//! 未登记的可执行名拉起失败（SpawnError::NotFound）。stdin 内容与关闭状态会被记录，便于断言。

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::core::SpawnError;
use crate::process::{ProcessControl, ProcessSpawner, SpawnRequest, SpawnedProcess};

/// SIGTERM 对应的退出码（128 + 15）
const STOPPED_EXIT_CODE: i32 = 143;

const PIPE_CAPACITY: usize = 64 * 1024;

/// 脚本中的一步
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Sleep(Duration),
}

/// 一个脚本化进程的行为
#[derive(Debug, Clone, Default)]
pub struct Script {
    steps: Vec<ScriptStep>,
    exit_code: i32,
    /// 输出完毕后不退出，直到被停止 / 强杀
    hang: bool,
    /// 忽略优雅停止，只能被强杀
    ignore_stop: bool,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdout(mut self, text: impl AsRef<str>) -> Self {
        self.steps
            .push(ScriptStep::Stdout(text.as_ref().as_bytes().to_vec()));
        self
    }

    pub fn stdout_bytes(mut self, bytes: &[u8]) -> Self {
        self.steps.push(ScriptStep::Stdout(bytes.to_vec()));
        self
    }

    pub fn stderr(mut self, text: impl AsRef<str>) -> Self {
        self.steps
            .push(ScriptStep::Stderr(text.as_ref().as_bytes().to_vec()));
        self
    }

    pub fn sleep_ms(mut self, ms: u64) -> Self {
        self.steps.push(ScriptStep::Sleep(Duration::from_millis(ms)));
        self
    }

    pub fn exit(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn hang(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn ignore_stop(mut self) -> Self {
        self.ignore_stop = true;
        self
    }
}

/// 一次拉起的记录
#[derive(Debug, Clone)]
pub struct SpawnRecord {
    pub request: SpawnRequest,
    stdin: Arc<Mutex<Vec<u8>>>,
    stdin_closed: Arc<AtomicBool>,
}

impl SpawnRecord {
    pub async fn stdin_text(&self) -> String {
        String::from_utf8_lossy(&self.stdin.lock().await).into_owned()
    }

    pub fn stdin_closed(&self) -> bool {
        self.stdin_closed.load(Ordering::SeqCst)
    }
}

/// 脚本化拉起器
#[derive(Default)]
pub struct ScriptedSpawner {
    scripts: HashMap<String, Script>,
    spawned: Mutex<Vec<SpawnRecord>>,
}

impl ScriptedSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, executable: impl Into<String>, script: Script) -> Self {
        self.scripts.insert(executable.into(), script);
        self
    }

    pub async fn spawned(&self) -> Vec<SpawnRecord> {
        self.spawned.lock().await.clone()
    }
}

#[async_trait]
impl ProcessSpawner for ScriptedSpawner {
    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess, SpawnError> {
        let script = self
            .scripts
            .get(&request.executable)
            .cloned()
            .ok_or_else(|| SpawnError::NotFound(request.executable.clone()))?;

        let (stdin_w, mut stdin_r) = tokio::io::duplex(PIPE_CAPACITY);
        let (mut stdout_w, stdout_r) = tokio::io::duplex(PIPE_CAPACITY);
        let (mut stderr_w, stderr_r) = tokio::io::duplex(PIPE_CAPACITY);

        let record = SpawnRecord {
            request: request.clone(),
            stdin: Arc::new(Mutex::new(Vec::new())),
            stdin_closed: Arc::new(AtomicBool::new(false)),
        };
        let stdin_buf = Arc::clone(&record.stdin);
        let stdin_closed = Arc::clone(&record.stdin_closed);
        tokio::spawn(async move {
            let mut data = Vec::new();
            if stdin_r.read_to_end(&mut data).await.is_ok() {
                stdin_closed.store(true, Ordering::SeqCst);
            }
            stdin_buf.lock().await.extend_from_slice(&data);
        });
        self.spawned.lock().await.push(record);

        let (exit_tx, exit_rx) = watch::channel(None);
        let stop = CancellationToken::new();
        let kill = CancellationToken::new();
        let stop_signal = stop.clone();
        let kill_signal = kill.clone();

        tokio::spawn(async move {
            let Script {
                steps,
                exit_code,
                hang,
                ignore_stop,
            } = script;
            let run = async move {
                for step in steps {
                    match step {
                        ScriptStep::Stdout(bytes) => {
                            let _ = stdout_w.write_all(&bytes).await;
                            let _ = stdout_w.flush().await;
                        }
                        ScriptStep::Stderr(bytes) => {
                            let _ = stderr_w.write_all(&bytes).await;
                            let _ = stderr_w.flush().await;
                        }
                        ScriptStep::Sleep(duration) => tokio::time::sleep(duration).await,
                    }
                }
                // 输出结束即关闭管道，与真实进程退出时一致
                drop(stdout_w);
                drop(stderr_w);
                if hang {
                    std::future::pending::<()>().await;
                }
            };

            let code = tokio::select! {
                _ = run => Some(exit_code),
                _ = stop_signal.cancelled(), if !ignore_stop => Some(STOPPED_EXIT_CODE),
                _ = kill_signal.cancelled() => None,
            };
            let _ = exit_tx.send(Some(code));
        });

        Ok(SpawnedProcess {
            pid: None,
            stdin: Box::new(stdin_w),
            stdout: Box::new(stdout_r),
            stderr: Box::new(stderr_r),
            control: Box::new(ScriptedControl {
                exit_rx,
                stop,
                kill,
            }),
        })
    }
}

struct ScriptedControl {
    exit_rx: watch::Receiver<Option<Option<i32>>>,
    stop: CancellationToken,
    kill: CancellationToken,
}

#[async_trait]
impl ProcessControl for ScriptedControl {
    async fn wait(&mut self) -> io::Result<Option<i32>> {
        loop {
            let current = *self.exit_rx.borrow();
            if let Some(code) = current {
                return Ok(code);
            }
            self.exit_rx
                .changed()
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "scripted process vanished"))?;
        }
    }

    async fn request_stop(&mut self) -> io::Result<()> {
        self.stop.cancel();
        Ok(())
    }

    fn force_kill(&mut self) -> io::Result<()> {
        self.kill.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_process_output_and_exit() {
        let spawner = ScriptedSpawner::new().with_script(
            "agent",
            Script::new().stdout("hello ").sleep_ms(5).stdout("world").stderr("oops").exit(2),
        );
        let request = SpawnRequest {
            executable: "agent".to_string(),
            ..SpawnRequest::default()
        };
        let mut process = spawner.spawn(&request).await.unwrap();
        process.stdin.write_all(b"do the thing\n").await.unwrap();
        process.stdin.shutdown().await.unwrap();
        drop(process.stdin);

        let mut out = String::new();
        process.stdout.read_to_string(&mut out).await.unwrap();
        let mut err = String::new();
        process.stderr.read_to_string(&mut err).await.unwrap();
        assert_eq!(out, "hello world");
        assert_eq!(err, "oops");
        assert_eq!(process.control.wait().await.unwrap(), Some(2));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let records = spawner.spawned().await;
        assert_eq!(records[0].stdin_text().await, "do the thing\n");
        assert!(records[0].stdin_closed());
    }

    #[tokio::test]
    async fn test_unknown_executable_fails() {
        let spawner = ScriptedSpawner::new();
        let request = SpawnRequest {
            executable: "/bad/path".to_string(),
            ..SpawnRequest::default()
        };
        assert!(matches!(
            spawner.spawn(&request).await,
            Err(SpawnError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_and_kill() {
        let spawner = ScriptedSpawner::new()
            .with_script("polite", Script::new().hang())
            .with_script("stubborn", Script::new().hang().ignore_stop());
        let polite = SpawnRequest {
            executable: "polite".to_string(),
            ..SpawnRequest::default()
        };
        let mut process = spawner.spawn(&polite).await.unwrap();
        process.control.request_stop().await.unwrap();
        assert_eq!(process.control.wait().await.unwrap(), Some(STOPPED_EXIT_CODE));

        let stubborn = SpawnRequest {
            executable: "stubborn".to_string(),
            ..SpawnRequest::default()
        };
        let mut process = spawner.spawn(&stubborn).await.unwrap();
        process.control.request_stop().await.unwrap();
        let waited =
            tokio::time::timeout(Duration::from_millis(50), process.control.wait()).await;
        assert!(waited.is_err());
        process.control.force_kill().unwrap();
        assert_eq!(process.control.wait().await.unwrap(), None);
    }
}
