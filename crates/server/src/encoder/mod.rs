//! Encoder child-process management.
//!
//! An [`EncoderProcess`] wraps one external encoder tool fed over stdin.
//! Two adapters exist (ffmpeg and gst-launch); both report readiness, stats
//! and errors by parsing the child's stderr, and both follow the same stop
//! protocol: close stdin, wait for a graceful exit, escalate to SIGINT.

mod child;
pub mod ffmpeg;
pub mod gstreamer;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use castpipe_protocol::{EncoderStats, Processor, StreamConfig};
use tokio::sync::{mpsc, oneshot};

pub use ffmpeg::FfmpegEncoder;
pub use gstreamer::GstEncoder;

/// How long a spawned child may take to print its readiness marker.
pub const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a stopping child may take to exit before SIGINT, and again
/// after SIGINT before SIGKILL.
pub const STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("encoder already running")]
    AlreadyRunning,
    #[error("encoder binary `{0}` not found")]
    BinaryMissing(String),
    #[error("failed to spawn encoder: {0}")]
    SpawnFailed(std::io::Error),
    #[error("encoder is not running")]
    NotRunning,
    #[error("no readiness marker within {}s", READY_TIMEOUT.as_secs())]
    ReadyTimeout,
    #[error("encoder reported: {0}")]
    Runtime(String),
    #[error("encoder stdin: {0}")]
    Io(#[from] std::io::Error),
}

/// Emitted by an adapter while its child is alive.
#[derive(Debug)]
pub enum EncoderEvent {
    /// The stderr readiness marker appeared; the child accepts real data.
    Ready,
    /// A progress record parsed from stderr.
    Stats(EncoderStats),
    /// Fatal: readiness timeout or an error marker on stderr.
    Error(EncoderError),
    /// The child's stderr reached EOF; the process is gone or going.
    Exited,
}

/// Scoped lifecycle over one encoder child.
///
/// Events flow through the `mpsc::Sender<EncoderEvent>` supplied at
/// construction; the owning AV session drives state transitions from them.
#[async_trait]
pub trait EncoderProcess: Send + Sync {
    /// Spawn the child. After success the process is live but not yet
    /// ready; readiness arrives as [`EncoderEvent::Ready`].
    async fn start(&self) -> Result<(), EncoderError>;

    /// Feed one chunk to the child's stdin, suspending on pipe
    /// backpressure until the child drains it.
    async fn write(&self, chunk: Bytes) -> Result<(), EncoderError>;

    /// Cooperative shutdown; resolves once the child has exited.
    async fn stop(&self) -> Result<(), EncoderError>;

    fn is_running(&self) -> bool;
}

/// Construct the adapter selected by `cfg.processor`.
pub fn new_encoder(
    cfg: &StreamConfig,
    events: mpsc::Sender<EncoderEvent>,
) -> Box<dyn EncoderProcess> {
    match cfg.processor {
        Processor::Ffmpeg => Box::new(FfmpegEncoder::new(cfg.clone(), events)),
        Processor::Gstreamer => Box::new(GstEncoder::new(cfg.clone(), events)),
    }
}

/// Fail the session if the readiness marker never shows within
/// [`READY_TIMEOUT`]. A dropped sender means stderr hit EOF first; the
/// `Exited` event covers that path, so only a true timeout reports here.
pub(crate) fn spawn_ready_watchdog(
    ready_rx: oneshot::Receiver<()>,
    events: mpsc::Sender<EncoderEvent>,
) {
    tokio::spawn(async move {
        if tokio::time::timeout(READY_TIMEOUT, ready_rx).await.is_err() {
            let _ = events
                .send(EncoderEvent::Error(EncoderError::ReadyTimeout))
                .await;
        }
    });
}

/// Incremental stderr line scanner.
///
/// ffmpeg rewrites its progress line with carriage returns and only
/// occasionally emits a newline, so a plain `lines()` reader would sit on
/// progress updates indefinitely. This splits on both terminators.
#[derive(Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Feed raw bytes, returning every line completed by `\n` or `\r`.
    pub(crate) fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(data);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n' || *b == b'\r') {
            let rest = self.pending.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.pending, rest);
            line.pop();
            if !line.is_empty() {
                lines.push(String::from_utf8_lossy(&line).into_owned());
            }
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_splits_on_newline() {
        let mut buf = LineBuffer::default();
        let lines = buf.push(b"first line\nsecond line\n");
        assert_eq!(lines, vec!["first line", "second line"]);
    }

    #[test]
    fn line_buffer_splits_on_carriage_return() {
        let mut buf = LineBuffer::default();
        let lines = buf.push(b"frame=1 fps=30\rframe=2 fps=30\r");
        assert_eq!(lines, vec!["frame=1 fps=30", "frame=2 fps=30"]);
    }

    #[test]
    fn line_buffer_holds_partial_lines() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"incompl").is_empty());
        let lines = buf.push(b"ete\nnext");
        assert_eq!(lines, vec!["incomplete"]);
        let lines = buf.push(b"\n");
        assert_eq!(lines, vec!["next"]);
    }

    #[test]
    fn line_buffer_skips_blank_lines() {
        let mut buf = LineBuffer::default();
        let lines = buf.push(b"\r\n\r\nreal\n");
        assert_eq!(lines, vec!["real"]);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_watchdog_reports_timeout() {
        let (_ready_tx, ready_rx) = oneshot::channel();
        let (events_tx, mut events_rx) = mpsc::channel(4);
        spawn_ready_watchdog(ready_rx, events_tx);

        tokio::time::sleep(READY_TIMEOUT + Duration::from_secs(1)).await;
        match events_rx.recv().await.unwrap() {
            EncoderEvent::Error(EncoderError::ReadyTimeout) => {}
            other => panic!("expected ReadyTimeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ready_watchdog_is_quiet_after_marker() {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (events_tx, mut events_rx) = mpsc::channel(4);
        spawn_ready_watchdog(ready_rx, events_tx);

        ready_tx.send(()).unwrap();
        tokio::time::sleep(READY_TIMEOUT + Duration::from_secs(1)).await;
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ready_watchdog_is_quiet_when_reader_is_gone() {
        // stderr EOF drops the sender; the Exited event owns that path, so
        // the watchdog must not also report a timeout.
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let (events_tx, mut events_rx) = mpsc::channel(4);
        spawn_ready_watchdog(ready_rx, events_tx);

        drop(ready_tx);
        tokio::time::sleep(READY_TIMEOUT + Duration::from_secs(1)).await;
        assert!(events_rx.try_recv().is_err());
    }
}
