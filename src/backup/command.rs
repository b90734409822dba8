//! Bounded external tool invocation (`pg_dump`, `psql`).

use crate::error::{GatewayError, Result};
use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub(crate) const CHUNK_SIZE: usize = 64 * 1024;

/// Result of a command that ran to completion (successfully or not).
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub exit_code: Option<i32>,
    pub stderr: String,
}

impl CommandOutcome {
    fn from_status(status: ExitStatus, stderr: String) -> Self {
        Self {
            exit_code: status.code(),
            stderr,
        }
    }

    /// Non-zero exit (or death by signal) is always failure.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stderr, or the exit code when the tool printed nothing.
    pub fn failure_message(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        match self.exit_code {
            Some(code) => format!("exited with status {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct ExternalCommand {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    timeout: Duration,
}

// Environment values carry credentials; only their names are printed
impl fmt::Debug for ExternalCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalCommand")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("envs", &self.envs.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ExternalCommand {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Sets a variable in the child's environment only.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn spawn(&self, stdin: Stdio, stdout: Stdio) -> Result<Child> {
        debug!("Running {} with {} arguments", self.program, self.args.len());
        Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GatewayError::Internal(format!("Failed to start {}: {}", self.program, e)))
    }

    /// Runs the command, sending its stdout to `sink` in chunks.
    ///
    /// A closed sink aborts the command.
    pub async fn run_with_output(&self, sink: mpsc::Sender<Vec<u8>>) -> Result<CommandOutcome> {
        let mut child = self.spawn(Stdio::null(), Stdio::piped())?;
        let stderr = drain_stderr(&mut child);

        let work = async {
            let mut stdout = child
                .stdout
                .take()
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "stdout not captured"))?;
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let n = stdout.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                sink.send(buf[..n].to_vec()).await.map_err(|_| {
                    io::Error::new(io::ErrorKind::BrokenPipe, "output sink closed")
                })?;
            }
            child.wait().await
        };
        let waited = tokio::time::timeout(self.timeout, work).await;

        self.finish(waited, &mut child, stderr).await
    }

    /// Runs the command with the chunks from `source` streamed into its stdin.
    ///
    /// An error from `source` kills the command before its stdin is closed, so
    /// a tool reading a transaction never sees a truncated but clean EOF.
    pub async fn run_with_input(
        &self,
        mut source: mpsc::Receiver<io::Result<Vec<u8>>>,
    ) -> Result<CommandOutcome> {
        let mut child = self.spawn(Stdio::piped(), Stdio::null())?;
        let stderr = drain_stderr(&mut child);
        // Held out here so an aborted run is killed before its stdin closes
        let mut stdin = child.stdin.take();

        let work = async {
            let pipe = stdin
                .as_mut()
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "stdin not captured"))?;
            while let Some(chunk) = source.recv().await {
                let chunk = chunk?;
                if let Err(e) = pipe.write_all(&chunk).await {
                    // The tool exited early; its status and stderr tell why
                    if e.kind() == io::ErrorKind::BrokenPipe {
                        break;
                    }
                    return Err(e);
                }
            }
            let _ = pipe.shutdown().await;
            drop(stdin.take());
            child.wait().await
        };
        let waited = tokio::time::timeout(self.timeout, work).await;

        let outcome = self.finish(waited, &mut child, stderr).await;
        drop(stdin);
        outcome
    }

    async fn finish(
        &self,
        waited: std::result::Result<io::Result<ExitStatus>, tokio::time::error::Elapsed>,
        child: &mut Child,
        stderr: Option<JoinHandle<String>>,
    ) -> Result<CommandOutcome> {
        let status = match waited {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(GatewayError::Internal(format!(
                    "I/O error while running {}: {}",
                    self.program, e
                )));
            }
            Err(_) => {
                warn!(
                    "{} exceeded {}s, killing it",
                    self.program,
                    self.timeout.as_secs()
                );
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill {}: {}", self.program, e);
                }
                return Err(GatewayError::CommandTimedOut {
                    program: self.program.clone(),
                    timeout_secs: self.timeout.as_secs(),
                });
            }
        };

        let stderr = match stderr {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        Ok(CommandOutcome::from_status(status, stderr))
    }
}

fn drain_stderr(child: &mut Child) -> Option<JoinHandle<String>> {
    child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            let mut out = String::new();
            let _ = stderr.read_to_string(&mut out).await;
            out
        })
    })
}
