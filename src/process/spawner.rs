//! 进程拉起原语
//!
//! `spawn(executable, args, env)` 返回可写 stdin、可增量读取的 stdout / stderr，以及一个退出控制柄。
//! TokioSpawner 基于 tokio::process；测试与离线演练用 scripted 模块中的 ScriptedSpawner。

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use crate::core::SpawnError;

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// 一次拉起请求
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub executable: String,
    pub args: Vec<String>,
    /// 注入的环境变量
    pub env: HashMap<String, String>,
    /// 从继承环境中移除的变量
    pub env_remove: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

/// 进程退出信息
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitInfo {
    /// 被信号杀死时为 None
    pub code: Option<i32>,
    /// 是否由编排器主动终止
    pub terminated: bool,
}

impl ExitInfo {
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            terminated: false,
        }
    }
}

/// 退出控制柄：等待退出、优雅停止、强杀
#[async_trait]
pub trait ProcessControl: Send {
    /// 等待进程退出，返回退出码（被信号杀死时为 None）；可被取消
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// 优雅停止（unix 下为 SIGTERM）
    async fn request_stop(&mut self) -> io::Result<()>;

    /// 强制终止
    fn force_kill(&mut self) -> io::Result<()>;
}

/// 已拉起的进程
pub struct SpawnedProcess {
    pub pid: Option<u32>,
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: BoxedReader,
    pub control: Box<dyn ProcessControl>,
}

/// 进程拉起 trait
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess, SpawnError>;
}

/// 基于 tokio::process 的真实实现
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSpawner;

#[async_trait]
impl ProcessSpawner for TokioSpawner {
    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess, SpawnError> {
        let mut command = Command::new(&request.executable);
        command
            .args(&request.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for var in &request.env_remove {
            command.env_remove(var);
        }
        for (key, value) in &request.env {
            command.env(key, value);
        }
        if let Some(dir) = &request.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                SpawnError::NotFound(request.executable.clone())
            } else {
                SpawnError::Io {
                    executable: request.executable.clone(),
                    source,
                }
            }
        })?;

        let pid = child
            .id()
            .ok_or_else(|| SpawnError::ExitedEarly(request.executable.clone()))?;
        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(SpawnError::MissingPipe("stderr"))?;

        tracing::debug!(executable = %request.executable, pid, "process spawned");

        Ok(SpawnedProcess {
            pid: Some(pid),
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            control: Box::new(TokioControl { child }),
        })
    }
}

struct TokioControl {
    child: Child,
}

#[async_trait]
impl ProcessControl for TokioControl {
    async fn wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.child.wait().await?.code())
    }

    async fn request_stop(&mut self) -> io::Result<()> {
        send_terminate(&mut self.child).await
    }

    fn force_kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }
}

/// 通过 kill(1) 发送 SIGTERM
#[cfg(unix)]
async fn send_terminate(child: &mut Child) -> io::Result<()> {
    // 已被回收的进程没有 pid，无需发送
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let status = Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!("kill -TERM {} exited with {}", pid, status),
        ))
    }
}

#[cfg(not(unix))]
async fn send_terminate(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_missing_executable_is_not_found() {
        let request = SpawnRequest {
            executable: "/definitely/not/here/agent".to_string(),
            ..SpawnRequest::default()
        };
        let result = TokioSpawner.spawn(&request).await;
        assert!(matches!(result, Err(SpawnError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_env_and_stdio_are_wired() {
        let mut env = HashMap::new();
        env.insert("HIVE_TEST_VAR".to_string(), "hello".to_string());
        let request = SpawnRequest {
            executable: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "read line; echo \"$HIVE_TEST_VAR $line\"; echo err >&2; exit 3".to_string(),
            ],
            env,
            ..SpawnRequest::default()
        };
        let mut process = TokioSpawner.spawn(&request).await.unwrap();
        process.stdin.write_all(b"world\n").await.unwrap();
        drop(process.stdin);

        let mut out = String::new();
        process.stdout.read_to_string(&mut out).await.unwrap();
        let mut err = String::new();
        process.stderr.read_to_string(&mut err).await.unwrap();
        assert_eq!(out.trim(), "hello world");
        assert_eq!(err.trim(), "err");
        assert_eq!(process.control.wait().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_request_stop_sends_sigterm() {
        let request = SpawnRequest {
            executable: "sleep".to_string(),
            args: vec!["30".to_string()],
            ..SpawnRequest::default()
        };
        let mut process = TokioSpawner.spawn(&request).await.unwrap();
        process.control.request_stop().await.unwrap();
        let code = tokio::time::timeout(std::time::Duration::from_secs(5), process.control.wait())
            .await
            .unwrap()
            .unwrap();
        // 被信号终止，没有退出码
        assert_eq!(code, None);
    }
}
