//! Per-client AV session: one encoder child, one paced frame queue, one
//! chunk-arrival watchdog.
//!
//! State machine:
//! `Init → Starting → Running → Stopping → Closed`, with `Failed` replacing
//! `Stopping` on encoder errors. Every exit path stops the encoder child.

pub mod queue;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use castpipe_protocol::{EncoderStats, StreamConfig};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::encoder::{self, EncoderError, EncoderEvent, EncoderProcess};
use self::queue::{FrameQueue, QUEUE_CAPACITY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvState {
    Init,
    Starting,
    Running,
    Stopping,
    Failed,
    Closed,
}

/// Emitted to the owning client session, which maps these onto wire
/// packets (`AvReady`, `SessionStartError`, `ChunkWaitTimeout`) and the
/// `av:stats` signaling message.
#[derive(Debug)]
pub enum AvEvent {
    Ready,
    Stats(EncoderStats),
    Timeout,
    Error(EncoderError),
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    /// Idle span after which the session is stopped.
    pub chunk_wait_timeout: Duration,
    /// Tick interval of the liveness check.
    pub check_interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            chunk_wait_timeout: Duration::from_secs(10),
            check_interval: Duration::from_secs(1),
        }
    }
}

pub struct AvSession {
    client_id: Uuid,
    state: Mutex<AvState>,
    queue: Arc<FrameQueue>,
    encoder: Arc<dyn EncoderProcess>,
    last_chunk: Mutex<Instant>,
    cancel: CancellationToken,
    events: mpsc::Sender<AvEvent>,
    frame_interval: Duration,
    watchdog: WatchdogConfig,
}

impl AvSession {
    pub fn new(
        client_id: Uuid,
        cfg: &StreamConfig,
        events: mpsc::Sender<AvEvent>,
        watchdog: WatchdogConfig,
    ) -> Arc<Self> {
        let (encoder_tx, encoder_rx) = mpsc::channel(64);
        let encoder: Arc<dyn EncoderProcess> = Arc::from(encoder::new_encoder(cfg, encoder_tx));
        Self::with_encoder(client_id, cfg, encoder, encoder_rx, events, watchdog)
    }

    /// Wire up a session around an already-built adapter. Split out so
    /// tests can drive the state machine with a scripted encoder.
    pub(crate) fn with_encoder(
        client_id: Uuid,
        cfg: &StreamConfig,
        encoder: Arc<dyn EncoderProcess>,
        encoder_rx: mpsc::Receiver<EncoderEvent>,
        events: mpsc::Sender<AvEvent>,
        watchdog: WatchdogConfig,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            client_id,
            state: Mutex::new(AvState::Init),
            queue: Arc::new(FrameQueue::new(QUEUE_CAPACITY)),
            encoder,
            last_chunk: Mutex::new(Instant::now()),
            cancel: CancellationToken::new(),
            events,
            frame_interval: cfg.encoder.video.frame_interval(),
            watchdog,
        });
        tokio::spawn(Arc::clone(&session).pump_encoder_events(encoder_rx));
        session
    }

    pub fn state(&self) -> AvState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: AvState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    /// Spawn the encoder child and the session workers. A second call is
    /// rejected.
    pub async fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != AvState::Init {
                tracing::warn!(client_id = %self.client_id, state = ?*state, "AV session already started");
                return;
            }
            *state = AvState::Starting;
        }
        self.touch();

        tracing::info!(client_id = %self.client_id, "Starting AV session");
        if let Err(e) = self.encoder.start().await {
            tracing::warn!(client_id = %self.client_id, "Encoder failed to start: {e}");
            self.shutdown(AvState::Failed, Some(AvEvent::Error(e))).await;
            return;
        }

        tokio::spawn(Arc::clone(self).run_pump());
        tokio::spawn(Arc::clone(self).run_watchdog());
    }

    /// Enqueue one media chunk. Outside Starting/Running the chunk is
    /// dropped and the start-error event is emitted so the client can stop
    /// its capture.
    pub async fn put(&self, chunk: Bytes) {
        let state = self.state();
        if !matches!(state, AvState::Starting | AvState::Running) {
            tracing::warn!(client_id = %self.client_id, ?state, "Chunk while encoder not running");
            let _ = self
                .events
                .send(AvEvent::Error(EncoderError::NotRunning))
                .await;
            return;
        }

        self.touch();
        if let Some(evicted) = self.queue.push(chunk) {
            tracing::warn!(
                client_id = %self.client_id,
                dropped_bytes = evicted.len(),
                queued = self.queue.len(),
                "Frame queue full, evicted oldest chunk"
            );
        }
    }

    /// Cooperative stop: cancel the workers, clear the queue, reap the
    /// encoder child. Resolves once the child has exited.
    pub async fn stop(&self) {
        self.shutdown(AvState::Stopping, None).await;
    }

    fn touch(&self) {
        *self.last_chunk.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// Single teardown path. `next` is `Stopping` for cooperative stops and
    /// watchdog expiry, `Failed` for encoder errors; the terminal state is
    /// always `Closed`.
    async fn shutdown(&self, next: AvState, notice: Option<AvEvent>) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if !matches!(*state, AvState::Init | AvState::Starting | AvState::Running) {
                return;
            }
            *state = next;
        }
        if let Some(event) = notice {
            let _ = self.events.send(event).await;
        }

        self.cancel.cancel();
        if !self.queue.is_empty() {
            tracing::debug!(
                client_id = %self.client_id,
                discarded = self.queue.len(),
                "Discarding queued chunks"
            );
        }
        self.queue.clear();
        if let Err(e) = self.encoder.stop().await {
            tracing::warn!(client_id = %self.client_id, "Encoder stop failed: {e}");
        }

        self.set_state(AvState::Closed);
        tracing::info!(client_id = %self.client_id, "AV session closed");
        let _ = self.events.send(AvEvent::Closed).await;
    }

    /// Translate encoder events into state transitions and owner events.
    async fn pump_encoder_events(self: Arc<Self>, mut encoder_rx: mpsc::Receiver<EncoderEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = encoder_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                EncoderEvent::Ready => {
                    let became_running = {
                        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                        if *state == AvState::Starting {
                            *state = AvState::Running;
                            true
                        } else {
                            false
                        }
                    };
                    if became_running {
                        tracing::info!(client_id = %self.client_id, "Encoder ready");
                        let _ = self.events.send(AvEvent::Ready).await;
                    }
                }
                EncoderEvent::Stats(stats) => {
                    if self.state() == AvState::Running {
                        let _ = self.events.send(AvEvent::Stats(stats)).await;
                    }
                }
                EncoderEvent::Error(e) => {
                    self.shutdown(AvState::Failed, Some(AvEvent::Error(e))).await;
                }
                EncoderEvent::Exited => match self.state() {
                    AvState::Starting | AvState::Running => {
                        self.shutdown(
                            AvState::Failed,
                            Some(AvEvent::Error(EncoderError::Runtime(
                                "encoder exited unexpectedly".to_string(),
                            ))),
                        )
                        .await;
                    }
                    _ => {}
                },
            }
        }
    }

    /// Single consumer of the frame queue. Paces writes so successive
    /// chunks reach the child at least `frame_interval` apart; late chunks
    /// dispatch immediately.
    async fn run_pump(self: Arc<Self>) {
        let mut last_write: Option<Instant> = None;
        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => break,
                chunk = self.queue.recv() => chunk,
            };

            if let Some(previous) = last_write {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep_until(previous + self.frame_interval) => {}
                }
            }

            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.encoder.write(chunk) => result,
            };
            last_write = Some(Instant::now());
            if let Err(e) = result {
                // Child death surfaces through the stderr reader as well;
                // that path owns the session's fate.
                tracing::warn!(client_id = %self.client_id, "Encoder write failed: {e}");
                break;
            }
        }
    }

    /// Liveness check: stop the session once no chunk arrived within the
    /// configured timeout. This is the only liveness source; there are no
    /// data-channel heartbeats.
    async fn run_watchdog(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.watchdog.check_interval);
        ticker.tick().await; // consume the immediate first tick
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let idle = self
                .last_chunk
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .elapsed();
            if idle >= self.watchdog.chunk_wait_timeout {
                tracing::warn!(
                    client_id = %self.client_id,
                    idle_ms = idle.as_millis() as u64,
                    "Chunk wait timeout, stopping AV session"
                );
                self.shutdown(AvState::Stopping, Some(AvEvent::Timeout)).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeEncoder {
        running: AtomicBool,
        fail_start: bool,
        written: Mutex<Vec<Bytes>>,
    }

    impl FakeEncoder {
        fn new(fail_start: bool) -> Arc<Self> {
            Arc::new(Self {
                running: AtomicBool::new(false),
                fail_start,
                written: Mutex::new(Vec::new()),
            })
        }

        fn written(&self) -> Vec<Bytes> {
            self.written.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EncoderProcess for FakeEncoder {
        async fn start(&self) -> Result<(), EncoderError> {
            if self.fail_start {
                return Err(EncoderError::BinaryMissing("ffmpeg".to_string()));
            }
            self.running.store(true, Ordering::Relaxed);
            Ok(())
        }

        async fn write(&self, chunk: Bytes) -> Result<(), EncoderError> {
            if !self.running.load(Ordering::Relaxed) {
                return Err(EncoderError::NotRunning);
            }
            self.written.lock().unwrap().push(chunk);
            Ok(())
        }

        async fn stop(&self) -> Result<(), EncoderError> {
            self.running.store(false, Ordering::Relaxed);
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::Relaxed)
        }
    }

    struct Harness {
        session: Arc<AvSession>,
        encoder: Arc<FakeEncoder>,
        encoder_tx: mpsc::Sender<EncoderEvent>,
        events: mpsc::Receiver<AvEvent>,
    }

    fn harness(fail_start: bool, watchdog: WatchdogConfig) -> Harness {
        let (encoder_tx, encoder_rx) = mpsc::channel(16);
        let (event_tx, events) = mpsc::channel(64);
        let encoder = FakeEncoder::new(fail_start);
        let session = AvSession::with_encoder(
            Uuid::new_v4(),
            &StreamConfig::default(),
            Arc::clone(&encoder) as Arc<dyn EncoderProcess>,
            encoder_rx,
            event_tx,
            watchdog,
        );
        Harness {
            session,
            encoder,
            encoder_tx,
            events,
        }
    }

    #[tokio::test]
    async fn ready_moves_starting_to_running() {
        let mut h = harness(false, WatchdogConfig::default());
        h.session.start().await;
        assert_eq!(h.session.state(), AvState::Starting);

        h.encoder_tx.send(EncoderEvent::Ready).await.unwrap();
        match h.events.recv().await.unwrap() {
            AvEvent::Ready => {}
            other => panic!("expected Ready, got {:?}", other),
        }
        assert_eq!(h.session.state(), AvState::Running);
    }

    #[tokio::test]
    async fn start_failure_reports_error_then_closes() {
        let mut h = harness(true, WatchdogConfig::default());
        h.session.start().await;
        match h.events.recv().await.unwrap() {
            AvEvent::Error(EncoderError::BinaryMissing(_)) => {}
            other => panic!("expected Error(BinaryMissing), got {:?}", other),
        }
        match h.events.recv().await.unwrap() {
            AvEvent::Closed => {}
            other => panic!("expected Closed, got {:?}", other),
        }
        assert_eq!(h.session.state(), AvState::Closed);
        assert!(!h.encoder.is_running());
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let h = harness(false, WatchdogConfig::default());
        h.session.start().await;
        h.session.start().await;
        assert_eq!(h.session.state(), AvState::Starting);
    }

    #[tokio::test]
    async fn chunks_reach_encoder_in_order() {
        let mut h = harness(false, WatchdogConfig::default());
        h.session.start().await;
        h.encoder_tx.send(EncoderEvent::Ready).await.unwrap();
        h.events.recv().await.unwrap();

        for i in 0..3u8 {
            h.session.put(Bytes::from(vec![i])).await;
        }
        // Pacing at 30 fps: three chunks take two frame intervals
        tokio::time::sleep(Duration::from_millis(200)).await;
        let written = h.encoder.written();
        assert_eq!(written.len(), 3);
        for (i, chunk) in written.iter().enumerate() {
            assert_eq!(chunk[0], i as u8);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn writes_are_paced_at_frame_interval() {
        let mut h = harness(false, WatchdogConfig::default());
        h.session.start().await;
        h.encoder_tx.send(EncoderEvent::Ready).await.unwrap();
        h.events.recv().await.unwrap();

        h.session.put(Bytes::from_static(b"a")).await;
        h.session.put(Bytes::from_static(b"b")).await;

        // First chunk goes out immediately; the second waits a frame interval
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(h.encoder.written().len(), 1);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(h.encoder.written().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_times_out_idle_session() {
        let mut h = harness(false, WatchdogConfig::default());
        h.session.start().await;
        h.encoder_tx.send(EncoderEvent::Ready).await.unwrap();
        h.events.recv().await.unwrap();

        // No chunks for longer than the 10 s timeout
        tokio::time::sleep(Duration::from_secs(12)).await;
        match h.events.recv().await.unwrap() {
            AvEvent::Timeout => {}
            other => panic!("expected Timeout, got {:?}", other),
        }
        match h.events.recv().await.unwrap() {
            AvEvent::Closed => {}
            other => panic!("expected Closed, got {:?}", other),
        }
        assert_eq!(h.session.state(), AvState::Closed);
        assert!(!h.encoder.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn chunks_keep_the_watchdog_quiet() {
        let mut h = harness(false, WatchdogConfig::default());
        h.session.start().await;
        h.encoder_tx.send(EncoderEvent::Ready).await.unwrap();
        h.events.recv().await.unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(5)).await;
            h.session.put(Bytes::from_static(b"keepalive")).await;
        }
        assert_eq!(h.session.state(), AvState::Running);
    }

    #[tokio::test]
    async fn runtime_error_fails_the_session() {
        let mut h = harness(false, WatchdogConfig::default());
        h.session.start().await;
        h.encoder_tx.send(EncoderEvent::Ready).await.unwrap();
        h.events.recv().await.unwrap();

        h.encoder_tx
            .send(EncoderEvent::Error(EncoderError::Runtime(
                "Unknown encoder 'bogus_codec'".to_string(),
            )))
            .await
            .unwrap();
        match h.events.recv().await.unwrap() {
            AvEvent::Error(EncoderError::Runtime(msg)) => {
                assert!(msg.contains("Unknown encoder"));
            }
            other => panic!("expected Error, got {:?}", other),
        }
        match h.events.recv().await.unwrap() {
            AvEvent::Closed => {}
            other => panic!("expected Closed, got {:?}", other),
        }
        assert!(!h.encoder.is_running());
    }

    #[tokio::test]
    async fn put_after_close_reports_start_error() {
        let mut h = harness(false, WatchdogConfig::default());
        h.session.start().await;
        h.session.stop().await;
        match h.events.recv().await.unwrap() {
            AvEvent::Closed => {}
            other => panic!("expected Closed, got {:?}", other),
        }

        h.session.put(Bytes::from_static(b"late")).await;
        match h.events.recv().await.unwrap() {
            AvEvent::Error(EncoderError::NotRunning) => {}
            other => panic!("expected Error(NotRunning), got {:?}", other),
        }
        assert!(h.encoder.written().is_empty());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let mut h = harness(false, WatchdogConfig::default());
        h.session.start().await;
        h.session.stop().await;
        h.session.stop().await;
        match h.events.recv().await.unwrap() {
            AvEvent::Closed => {}
            other => panic!("expected a single Closed, got {:?}", other),
        }
        assert!(h.events.try_recv().is_err());
    }
}
