//! Process isolation backend
//!
//! The overseer only needs to start a process that will connect back and
//! present its id, and to release it later. How the process is isolated is
//! up to the backend; [`ProcessIsolate`] runs a plain child process.

use crate::error::IsolateError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Grace period for a killed drone to be reaped
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Starts drone processes
#[async_trait]
pub trait Isolate: Send + Sync {
    /// Prepare the application image before the first spawn
    async fn spool(&self) -> Result<(), IsolateError>;

    /// Start a drone expected to hand-shake with `id`
    async fn spawn(&self, id: &str, args: &[String]) -> Result<Box<dyn ProcessHandle>, IsolateError>;
}

/// Exclusively owned handle to a running drone process
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Stop the process (if still running) and reap it
    async fn release(self: Box<Self>);
}

/// Runs each drone as a child process of the overseer
#[derive(Debug, Clone)]
pub struct ProcessIsolate {
    executable: PathBuf,
}

impl ProcessIsolate {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

#[async_trait]
impl Isolate for ProcessIsolate {
    async fn spool(&self) -> Result<(), IsolateError> {
        match tokio::fs::metadata(&self.executable).await {
            Ok(meta) if meta.is_file() => Ok(()),
            _ => Err(IsolateError::MissingExecutable(self.executable.clone())),
        }
    }

    async fn spawn(&self, id: &str, args: &[String]) -> Result<Box<dyn ProcessHandle>, IsolateError> {
        let mut child = Command::new(&self.executable)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| IsolateError::Spawn {
                id: id.to_string(),
                source,
            })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(id.to_string(), "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(id.to_string(), "stderr", stderr));
        }

        debug!("[ISOLATE] started drone {} pid={:?}", id, child.id());
        Ok(Box::new(ChildProcess {
            id: id.to_string(),
            child,
        }))
    }
}

/// Split a drone's output stream into lines and log each one
async fn forward_output<R: AsyncRead + Unpin>(id: String, stream: &'static str, output: R) {
    let mut lines = BufReader::new(output).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!("[DRONE {}] {} <<< {}", id, stream, line),
            Ok(None) => break,
            Err(e) => {
                debug!("[DRONE {}] {} read error: {}", id, stream, e);
                break;
            }
        }
    }
}

struct ChildProcess {
    id: String,
    child: Child,
}

#[async_trait]
impl ProcessHandle for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn release(mut self: Box<Self>) {
        // Fails only if the drone already exited
        let _ = self.child.start_kill();
        match tokio::time::timeout(REAP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => debug!("[ISOLATE] drone {} exited: {}", self.id, status),
            Ok(Err(e)) => warn!("[ISOLATE] failed to reap drone {}: {}", self.id, e),
            Err(_) => warn!("[ISOLATE] drone {} did not exit after kill", self.id),
        }
    }
}
