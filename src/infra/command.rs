//! 命令执行器
//!
//! 所有外部工具（容器引擎、证书工具、crontab）都通过 `ProcessRunner` 调用：
//! - 完整捕获 stdout/stderr，非零退出时也一样
//! - 超时会杀掉进程并返回 `CommandError::TimedOut`
//! - 测试中替换为脚本化的 fake

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, error, warn};

use crate::error::ProvisionError;

/// 命令执行错误
#[derive(Debug, Error)]
pub enum CommandError {
    /// Command could not be started
    #[error("failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// Command exceeded its timeout and was killed
    #[error("{operation} timed out after {timeout:?}")]
    TimedOut { operation: String, timeout: Duration },
    /// Waiting for the command failed
    #[error("failed to wait for {program}: {source}")]
    WaitFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<CommandError> for ProvisionError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::SpawnFailed { program, source } => {
                ProvisionError::tool_failure(program, None, source.to_string())
            }
            CommandError::TimedOut { operation, .. } => ProvisionError::timed_out(operation),
            CommandError::WaitFailed { program, source } => {
                ProvisionError::tool_failure(program, None, source.to_string())
            }
        }
    }
}

/// 已结束命令的输出
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// 被信号终止时为 `None`
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            (true, false) => self.stderr.trim_end().to_string(),
            (true, true) => String::new(),
        }
    }

    /// 非零退出转换为 `ExternalToolFailure`
    pub fn check(self, tool: &str) -> Result<Self, ProvisionError> {
        if self.succeeded() {
            Ok(self)
        } else {
            Err(ProvisionError::tool_failure(tool, self.exit_code, self.combined()))
        }
    }
}

/// `run_detached` 启动的长驻进程
pub struct DetachedProcess {
    program: String,
    child: Option<Child>,
}

impl DetachedProcess {
    /// Handle for a process that is already gone (used by fakes)
    pub fn finished(program: &str) -> Self {
        Self {
            program: program.to_string(),
            child: None,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// 杀掉进程并回收
    pub async fn kill(&mut self) -> Result<(), CommandError> {
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.kill().await {
                warn!(program = %self.program, error = %e, "Failed to kill detached process");
            }
            child.wait().await.map_err(|source| CommandError::WaitFailed {
                program: self.program.clone(),
                source,
            })?;
        }
        self.child = None;
        Ok(())
    }
}

/// 与操作系统交互的唯一边界
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// 运行至结束并捕获输出
    async fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput, CommandError>;

    /// 运行至结束，`input` 写入 stdin
    async fn run_with_input(
        &self,
        program: &str,
        args: &[String],
        input: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError>;

    /// 启动长驻进程，不等待其结束
    fn run_detached(&self, program: &str, args: &[String]) -> Result<DetachedProcess, CommandError>;
}

/// 基于真实系统进程的 `ProcessRunner`
#[derive(Clone, Debug, Default)]
pub struct SystemRunner;

impl SystemRunner {
    async fn execute(
        program: &str,
        args: &[String],
        input: Option<&str>,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        let operation = describe(program, args);
        debug!(command = %operation, "Running command");

        let mut child = Command::new(program)
            .args(args)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::SpawnFailed {
                program: program.to_string(),
                source,
            })?;

        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                warn!(command = %operation, error = %e, "Failed to write stdin");
            }
            // dropping stdin closes the pipe
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut stdout) = stdout {
                let _ = stdout.read_to_end(&mut buf).await;
            }
            String::from_utf8_lossy(&buf).to_string()
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_end(&mut buf).await;
            }
            String::from_utf8_lossy(&buf).to_string()
        });

        let status = tokio::select! {
            status = child.wait() => status.map_err(|source| CommandError::WaitFailed {
                program: program.to_string(),
                source,
            })?,
            _ = tokio::time::sleep(timeout) => {
                error!(command = %operation, ?timeout, "Command timed out, killing process");
                let _ = child.kill().await;
                let _ = child.wait().await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(CommandError::TimedOut { operation, timeout });
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        debug!(command = %operation, exit_code = ?status.code(), "Command finished");
        Ok(CommandOutput {
            exit_code: status.code(),
            stdout,
            stderr,
        })
    }
}

#[async_trait]
impl ProcessRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput, CommandError> {
        Self::execute(program, args, None, timeout).await
    }

    async fn run_with_input(
        &self,
        program: &str,
        args: &[String],
        input: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        Self::execute(program, args, Some(input), timeout).await
    }

    fn run_detached(&self, program: &str, args: &[String]) -> Result<DetachedProcess, CommandError> {
        debug!(command = %describe(program, args), "Starting detached process");
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| CommandError::SpawnFailed {
                program: program.to_string(),
                source,
            })?;
        Ok(DetachedProcess {
            program: program.to_string(),
            child: Some(child),
        })
    }
}

/// 日志用的 `program arg1 arg2`
pub fn describe(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

/// 构造参数列表
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

/// 测试用的脚本化执行器
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::Mutex;

    /// One recorded call
    #[derive(Clone, Debug)]
    pub struct Invocation {
        pub program: String,
        pub args: Vec<String>,
        pub input: Option<String>,
    }

    impl Invocation {
        pub fn line(&self) -> String {
            describe(&self.program, &self.args)
        }
    }

    type Handler = Box<dyn Fn(&Invocation) -> Result<CommandOutput, CommandError> + Send + Sync>;

    /// Answers each call with `handler` and records it
    pub struct ScriptedRunner {
        handler: Handler,
        calls: Mutex<Vec<Invocation>>,
    }

    impl ScriptedRunner {
        pub fn new<F>(handler: F) -> Self
        where
            F: Fn(&Invocation) -> Result<CommandOutput, CommandError> + Send + Sync + 'static,
        {
            Self {
                handler: Box::new(handler),
                calls: Mutex::new(Vec::new()),
            }
        }

        /// Every call succeeds with empty output
        pub fn succeeding() -> Self {
            Self::new(|_| Ok(CommandOutput::success("")))
        }

        pub fn calls(&self) -> Vec<Invocation> {
            self.calls.lock().unwrap().clone()
        }

        /// Recorded command lines containing `needle`
        pub fn matching(&self, needle: &str) -> Vec<String> {
            self.calls()
                .iter()
                .map(Invocation::line)
                .filter(|l| l.contains(needle))
                .collect()
        }

        fn answer(&self, invocation: Invocation) -> Result<CommandOutput, CommandError> {
            let result = (self.handler)(&invocation);
            self.calls.lock().unwrap().push(invocation);
            result
        }
    }

    #[async_trait]
    impl ProcessRunner for ScriptedRunner {
        async fn run(&self, program: &str, args: &[String], _timeout: Duration) -> Result<CommandOutput, CommandError> {
            self.answer(Invocation {
                program: program.to_string(),
                args: args.to_vec(),
                input: None,
            })
        }

        async fn run_with_input(
            &self,
            program: &str,
            args: &[String],
            input: &str,
            _timeout: Duration,
        ) -> Result<CommandOutput, CommandError> {
            self.answer(Invocation {
                program: program.to_string(),
                args: args.to_vec(),
                input: Some(input.to_string()),
            })
        }

        fn run_detached(&self, program: &str, args: &[String]) -> Result<DetachedProcess, CommandError> {
            self.answer(Invocation {
                program: program.to_string(),
                args: args.to_vec(),
                input: None,
            })?;
            Ok(DetachedProcess::finished(program))
        }
    }
}
