//! Build command execution.
//!
//! Commands run through a shell inside the project's working directory with
//! stdout and stderr merged into a single stream in arrival order. A non-zero
//! exit is a normal result; only a failure to start the command is an error.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::errors::SpawnError;

/// Result of running a build command to completion (or to its timeout).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    /// Exit code, `-1` when the process was terminated by a signal.
    pub exit_code: i32,
    /// Combined stdout and stderr.
    pub output: Vec<u8>,
    pub timed_out: bool,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// Something that can execute a build command in a working directory.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        command: &str,
        working_dir: &Path,
        limit: Duration,
    ) -> Result<RunOutput, SpawnError>;
}

/// Runs build commands as `<shell> -c <command>`.
pub struct ShellRunner {
    shell: String,
}

impl ShellRunner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new("sh")
    }
}

const DRAIN_GRACE: Duration = Duration::from_secs(2);

pub fn timeout_marker(limit: Duration) -> String {
    format!("\n[vigil] build timed out after {}s\n", limit.as_secs())
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(
        &self,
        command: &str,
        working_dir: &Path,
        limit: Duration,
    ) -> Result<RunOutput, SpawnError> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so everything the shell started can be killed with it.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| SpawnError {
            command: command.to_string(),
            working_dir: working_dir.to_path_buf(),
            source,
        })?;

        // Taken now: `Child::id` is gone once the child has been reaped.
        let pgid = child.id();

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_chunks(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_chunks(stderr, tx.clone()));
        }
        drop(tx);

        // The shell's exit ends the build, even if something it started in
        // the background still holds the pipes open.
        let mut output = Vec::new();
        let waited = timeout(limit, async {
            loop {
                tokio::select! {
                    Some(chunk) = rx.recv() => output.extend_from_slice(&chunk),
                    status = child.wait() => break status,
                }
            }
        })
        .await;

        let (exit_code, timed_out, trailer) = match waited {
            Ok(Ok(status)) => {
                // Background leftovers must not outlive the build.
                kill_group(pgid);
                (status.code().unwrap_or(-1), false, String::new())
            }
            Ok(Err(e)) => {
                tracing::warn!(command, error = %e, "failed to wait for build command");
                kill_group(pgid);
                (-1, false, format!("\n[vigil] failed to wait for build: {}\n", e))
            }
            Err(_) => {
                tracing::warn!(command, secs = limit.as_secs(), "build command timed out");
                kill_group(pgid);
                if let Err(e) = child.kill().await {
                    tracing::debug!(error = %e, "child already exited");
                }
                (-1, true, timeout_marker(limit))
            }
        };

        // Pick up whatever was written before the group went down.
        let _ = timeout(DRAIN_GRACE, async {
            while let Some(chunk) = rx.recv().await {
                output.extend_from_slice(&chunk);
            }
        })
        .await;
        output.extend_from_slice(trailer.as_bytes());

        Ok(RunOutput {
            exit_code,
            output,
            timed_out,
        })
    }
}

async fn forward_chunks<R>(mut reader: R, tx: mpsc::UnboundedSender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
        }
    }
}

/// Kill every process left in the build's process group.
fn kill_group(pgid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pgid) = pgid {
        // SAFETY: killpg only sends a signal; the group was created for this build.
        unsafe {
            libc::killpg(pgid as libc::pid_t, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;
}
