//! External command execution with hard timeouts.
//!
//! Every shell-out (`ps`, `tmux`, `lsof`, the editor bridge) goes through a
//! [`CommandRunner`] so resolvers can be exercised against canned output.
//! The system runner kills the child when the timeout fires instead of
//! leaving it running.

use std::io;
use std::process::Stdio;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("i/o error talking to {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} timed out after {timeout_ms}ms and was killed")]
    TimedOut { program: String, timeout_ms: u64 },
}

/// A fully described process invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(bytes);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }
}

/// Result of a finished command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: Some(1),
            stderr: stderr.into(),
            ..Default::default()
        }
    }
}

pub trait CommandRunner: Send + Sync {
    fn run<'a>(
        &'a self,
        invocation: &'a Invocation,
    ) -> BoxFuture<'a, Result<CommandOutput, CommandError>>;
}

/// Runs real processes via `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run<'a>(
        &'a self,
        invocation: &'a Invocation,
    ) -> BoxFuture<'a, Result<CommandOutput, CommandError>> {
        Box::pin(run_with_timeout(invocation))
    }
}

async fn run_with_timeout(invocation: &Invocation) -> Result<CommandOutput, CommandError> {
    let start = Instant::now();
    let program = invocation.program.clone();

    let mut child = Command::new(&invocation.program)
        .args(&invocation.args)
        .stdin(if invocation.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| CommandError::Spawn {
            program: program.clone(),
            source,
        })?;

    let stdin_pipe = child.stdin.take();
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let payload = invocation.stdin.as_deref();

    let exchange = async {
        if let (Some(mut pipe), Some(bytes)) = (stdin_pipe, payload) {
            pipe.write_all(bytes).await?;
            pipe.shutdown().await?;
        }
        let (stdout, stderr) = tokio::join!(drain(stdout_pipe), drain(stderr_pipe));
        let (stdout, stderr) = (stdout?, stderr?);
        let status = child.wait().await?;
        Ok::<_, io::Error>((status, stdout, stderr))
    };

    let result = tokio::time::timeout(invocation.timeout, exchange).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(Ok((status, stdout, stderr))) => Ok(CommandOutput {
            success: status.success(),
            exit_code: status.code(),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            duration_ms,
        }),
        Ok(Err(source)) => {
            let _ = child.kill().await;
            Err(CommandError::Io { program, source })
        }
        Err(_) => {
            // kill() also reaps, so no zombie is left behind.
            let _ = child.kill().await;
            debug!(
                component = "command",
                event = "command.timed_out",
                program = %program,
                timeout_ms = invocation.timeout.as_millis() as u64,
                "Killed command after timeout"
            );
            Err(CommandError::TimedOut {
                program,
                timeout_ms: invocation.timeout.as_millis() as u64,
            })
        }
    }
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let inv = Invocation::new("sh").args(["-c", "echo hello; exit 3"]);
        let out = SystemRunner.run(&inv).await.unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success);
    }

    #[tokio::test]
    async fn feeds_stdin() {
        let inv = Invocation::new("cat").stdin(b"ping".to_vec());
        let out = SystemRunner.run(&inv).await.unwrap();
        assert_eq!(out.stdout, "ping");
    }

    #[tokio::test]
    async fn timeout_returns_typed_error() {
        let inv = Invocation::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(100));
        let started = Instant::now();
        let err = SystemRunner.run(&inv).await.unwrap_err();
        assert!(matches!(err, CommandError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let inv = Invocation::new("/definitely/not/a/binary");
        let err = SystemRunner.run(&inv).await.unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }
}
