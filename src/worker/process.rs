//! Worker child processes
//!
//! The child talks the framed protocol on its stdin/stdout; stderr is
//! inherited so its logs end up next to the host's.

use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::protocol::{MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE};
use crate::config::WorkerConfig;
use crate::error::{PdfiumError, Result};

/// How long a worker gets to exit on its own before it is killed
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// A running worker process; killed and reaped on drop
#[derive(Debug)]
pub struct WorkerProcess {
    child: Child,
}

impl WorkerProcess {
    /// Start the worker binary with the magic cookie in its environment
    pub fn spawn(config: &WorkerConfig) -> Result<(Self, ChildStdout, ChildStdin)> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                PdfiumError::Io(format!("failed to start worker {}: {e}", config.command.display()))
            })?;

        let pipes = child.stdout.take().zip(child.stdin.take());
        let mut process = Self { child };
        let (stdout, stdin) = pipes.ok_or_else(|| {
            process.kill();
            PdfiumError::Io("worker stdio was not captured".into())
        })?;

        info!(pid = process.id(), command = %config.command.display(), "worker spawned");
        Ok((process, stdout, stdin))
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Whether the process has exited
    pub fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    /// Give the process [`EXIT_GRACE`] to exit, then kill it
    pub fn wait_or_kill(&mut self) {
        let deadline = Instant::now() + EXIT_GRACE;
        while Instant::now() < deadline {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!(pid = self.id(), %status, "worker exited");
                    return;
                }
                Ok(None) => thread::sleep(Duration::from_millis(10)),
                Err(e) => {
                    warn!(pid = self.id(), error = %e, "failed to poll worker");
                    break;
                }
            }
        }
        self.kill();
    }

    /// Kill and reap; a process that already exited is only reaped
    pub fn kill(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        if let Err(e) = self.child.kill() {
            debug!(pid = self.id(), error = %e, "kill failed");
        }
        match self.child.wait() {
            Ok(status) => debug!(pid = self.id(), %status, "worker reaped"),
            Err(e) => warn!(pid = self.id(), error = %e, "failed to reap worker"),
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.kill();
    }
}
