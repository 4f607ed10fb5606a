//! Shared child-process plumbing for the encoder adapters.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;

use super::{EncoderError, STOP_GRACE};

/// Holds the spawned child and its stdin behind separate locks so a writer
/// blocked on pipe backpressure never blocks exit observation.
pub(crate) struct ChildHandle {
    binary: &'static str,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<tokio::process::ChildStdin>>,
    running: Arc<AtomicBool>,
}

impl ChildHandle {
    pub(crate) fn new(binary: &'static str) -> Self {
        Self {
            binary,
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn `cmd` with piped stdin/stderr, returning the stderr handle for
    /// the adapter's parser task.
    pub(crate) async fn spawn(
        &self,
        mut cmd: Command,
        stdout: Stdio,
    ) -> Result<ChildStderr, EncoderError> {
        let mut slot = self.child.lock().await;
        if slot.is_some() {
            return Err(EncoderError::AlreadyRunning);
        }

        cmd.stdin(Stdio::piped()).stdout(stdout).stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EncoderError::BinaryMissing(self.binary.to_string())
            } else {
                EncoderError::SpawnFailed(e)
            }
        })?;

        let stdin = child.stdin.take().ok_or(EncoderError::NotRunning)?;
        let stderr = child.stderr.take().ok_or(EncoderError::NotRunning)?;

        tracing::info!(
            binary = self.binary,
            pid = child.id().unwrap_or(0),
            "Encoder child spawned"
        );

        *self.stdin.lock().await = Some(stdin);
        *slot = Some(child);
        self.running.store(true, Ordering::Relaxed);
        Ok(stderr)
    }

    pub(crate) async fn write(&self, chunk: &[u8]) -> Result<(), EncoderError> {
        let mut stdin = self.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            return Err(EncoderError::NotRunning);
        };
        match pipe.write_all(chunk).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                // Child is gone; drop the pipe so later writers fail fast.
                stdin.take();
                self.running.store(false, Ordering::Relaxed);
                Err(EncoderError::NotRunning)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Stop protocol: optionally write a final control byte, close stdin,
    /// wait `STOP_GRACE` for a clean exit, escalate to SIGINT, then SIGKILL.
    /// Resolves once the child's exit is observed.
    pub(crate) async fn shutdown(&self, eos_byte: Option<u8>) -> Result<(), EncoderError> {
        if let Some(mut pipe) = self.stdin.lock().await.take() {
            if let Some(byte) = eos_byte {
                let _ = pipe.write_all(&[byte]).await;
            }
            let _ = pipe.shutdown().await;
        }

        let child = self.child.lock().await.take();
        let Some(mut child) = child else {
            self.running.store(false, Ordering::Relaxed);
            return Ok(());
        };

        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(binary = self.binary, ?status, "Encoder child exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(binary = self.binary, "Error waiting for encoder child: {e}");
            }
            Err(_) => {
                tracing::warn!(binary = self.binary, "Encoder child did not exit, sending SIGINT");
                if let Some(pid) = child.id() {
                    let _ = nix::sys::signal::kill(
                        nix::unistd::Pid::from_raw(pid as i32),
                        nix::sys::signal::Signal::SIGINT,
                    );
                }
                if tokio::time::timeout(STOP_GRACE, child.wait()).await.is_err() {
                    tracing::warn!(binary = self.binary, "Encoder child ignored SIGINT, killing");
                    let _ = child.kill().await;
                }
            }
        }

        self.running.store(false, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Flag shared with the stderr reader so it can record exit on EOF.
    pub(crate) fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }
}
