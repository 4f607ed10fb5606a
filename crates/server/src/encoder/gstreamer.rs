//! GStreamer adapter: drives `gst-launch-1.0` with a decode → re-encode →
//! mux pipeline described on the command line.
//!
//! The child reads container bytes from fd 0 via `fdsrc`; `-v` property
//! notifications from the `videorate` element supply the stats counters.
//! Readiness is the PLAYING state-change line. On stop an ASCII `q` is
//! written before stdin closes to request a graceful EOS.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use castpipe_protocol::{
    AudioCodec, DestinationKind, EncoderStats, PipelineStats, StreamConfig,
};
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::child::ChildHandle;
use super::ffmpeg::is_error_line;
use super::{EncoderError, EncoderEvent, EncoderProcess, LineBuffer};

const BINARY: &str = "gst-launch-1.0";

const DEFAULT_VIDEO_CODEC: &str = "x264";

/// Stderr line that marks the pipeline reaching PLAYING.
const READY_MARKER: &str = "Setting pipeline to PLAYING";

pub struct GstEncoder {
    cfg: StreamConfig,
    events: mpsc::Sender<EncoderEvent>,
    child: ChildHandle,
}

impl GstEncoder {
    pub fn new(cfg: StreamConfig, events: mpsc::Sender<EncoderEvent>) -> Self {
        Self {
            cfg,
            events,
            child: ChildHandle::new(BINARY),
        }
    }
}

#[async_trait]
impl EncoderProcess for GstEncoder {
    async fn start(&self) -> Result<(), EncoderError> {
        let args = build_args(&self.cfg);
        tracing::debug!(?args, "Spawning gst-launch");

        let mut cmd = Command::new(BINARY);
        cmd.args(&args);
        let stdout = if self.cfg.destination.kind.is_none() {
            Stdio::inherit()
        } else {
            Stdio::null()
        };
        let stderr = self.child.spawn(cmd, stdout).await?;

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(read_stderr(
            stderr,
            self.events.clone(),
            ready_tx,
            self.child.running_flag(),
        ));
        super::spawn_ready_watchdog(ready_rx, self.events.clone());
        Ok(())
    }

    async fn write(&self, chunk: Bytes) -> Result<(), EncoderError> {
        self.child.write(&chunk).await
    }

    async fn stop(&self) -> Result<(), EncoderError> {
        self.child.shutdown(Some(b'q')).await
    }

    fn is_running(&self) -> bool {
        self.child.is_running()
    }
}

async fn read_stderr(
    mut stderr: ChildStderr,
    events: mpsc::Sender<EncoderEvent>,
    ready_tx: oneshot::Sender<()>,
    running: Arc<AtomicBool>,
) {
    let mut ready_tx = Some(ready_tx);
    let mut scanner = LineBuffer::default();
    let mut stats = VideorateStats::default();
    let started = Instant::now();
    let mut buf = [0u8; 4096];
    loop {
        let n = match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for line in scanner.push(&buf[..n]) {
            tracing::trace!(target: "gstreamer", "{line}");
            if ready_tx.is_some() && line.contains(READY_MARKER) {
                let _ = ready_tx.take().unwrap().send(());
                let _ = events.send(EncoderEvent::Ready).await;
            } else if let Some(record) = stats.observe(&line, started.elapsed()) {
                let _ = events
                    .send(EncoderEvent::Stats(EncoderStats::Gstreamer(record)))
                    .await;
            } else if is_error_line(&line) {
                tracing::warn!(target: "gstreamer", "{line}");
                let _ = events
                    .send(EncoderEvent::Error(EncoderError::Runtime(line)))
                    .await;
            }
        }
    }
    running.store(false, Ordering::Relaxed);
    let _ = events.send(EncoderEvent::Exited).await;
}

/// Synthesize the `gst-launch-1.0` argument vector.
///
/// Unknown video codec names are emitted verbatim as the element name so
/// the child reports them itself.
pub(crate) fn build_args(cfg: &StreamConfig) -> Vec<String> {
    let video = &cfg.encoder.video;
    let audio = &cfg.encoder.audio;
    let codec = video.codec.as_deref().unwrap_or(DEFAULT_VIDEO_CODEC);

    let mut args: Vec<String> = ["-e", "-v", "fdsrc", "fd=0", "!", "decodebin", "name=demux"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    // Video branch
    args.extend(
        ["demux.", "!", "queue", "!", "videoconvert", "!", "videorate", "!"]
            .iter()
            .map(|s| s.to_string()),
    );
    match codec {
        "x264" => args.extend([
            "x264enc".to_string(),
            "tune=zerolatency".to_string(),
            "speed-preset=ultrafast".to_string(),
            format!("bitrate={}", video.bitrate),
            format!("key-int-max={}", video.keyframe_interval()),
        ]),
        "h264_nvenc" => args.extend([
            "nvh264enc".to_string(),
            "zerolatency=true".to_string(),
            format!("bitrate={}", video.bitrate),
            format!("gop-size={}", video.keyframe_interval()),
        ]),
        other => args.push(other.to_string()),
    }
    args.extend(["!", "h264parse", "!", "mux."].iter().map(|s| s.to_string()));

    // Audio branch
    args.extend(
        ["demux.", "!", "queue", "!", "audioconvert", "!", "audioresample", "!"]
            .iter()
            .map(|s| s.to_string()),
    );
    args.push(format!("audio/x-raw,rate={}", audio.sample_rate));
    match audio.codec {
        AudioCodec::Aac => args.extend([
            "!".to_string(),
            "avenc_aac".to_string(),
            format!("bitrate={}", audio.bitrate),
            "!".to_string(),
            "aacparse".to_string(),
        ]),
        AudioCodec::Opus => args.extend([
            "!".to_string(),
            "opusenc".to_string(),
            format!("bitrate={}", audio.bitrate),
        ]),
    }
    args.extend(["!", "mux."].iter().map(|s| s.to_string()));

    // Mux and sink
    match (cfg.destination.kind, cfg.destination.path.as_deref()) {
        (Some(DestinationKind::File), Some(path)) => args.extend([
            "mp4mux".to_string(),
            "name=mux".to_string(),
            "!".to_string(),
            "filesink".to_string(),
            format!("location={path}"),
        ]),
        (Some(DestinationKind::Rtmp), Some(url)) => args.extend([
            "flvmux".to_string(),
            "name=mux".to_string(),
            "streamable=true".to_string(),
            "!".to_string(),
            "rtmpsink".to_string(),
            format!("location={url}"),
        ]),
        _ => args.extend(
            ["matroskamux", "name=mux", "!", "fdsink", "fd=1"]
                .iter()
                .map(|s| s.to_string()),
        ),
    }

    args
}

/// Accumulates `videorate` counters from `-v` property notifications and
/// emits at most one stats record per truncated second.
#[derive(Default)]
pub(crate) struct VideorateStats {
    in_frames: u64,
    out_frames: u64,
    dropped: u64,
    duplicated: u64,
    last_stamp: Option<u64>,
}

impl VideorateStats {
    /// Lines look like:
    /// `/GstPipeline:pipeline0/GstVideoRate:videorate0: in = 123`
    pub(crate) fn observe(&mut self, line: &str, elapsed: Duration) -> Option<PipelineStats> {
        let (path, assignment) = line.split_once(": ")?;
        if !path.contains("GstVideoRate") {
            return None;
        }
        let (prop, value) = assignment.split_once(" = ")?;
        let value: u64 = value.trim().parse().ok()?;
        match prop.trim() {
            "in" => self.in_frames = value,
            "out" => self.out_frames = value,
            "drop" => self.dropped = value,
            "duplicate" => self.duplicated = value,
            _ => return None,
        }

        let stamp = elapsed.as_secs();
        if self.last_stamp == Some(stamp) {
            return None;
        }
        self.last_stamp = Some(stamp);

        let secs = elapsed.as_secs_f64();
        let fps = if secs > 0.0 {
            self.out_frames as f64 / secs
        } else {
            0.0
        };
        Some(PipelineStats {
            fps,
            in_frames: self.in_frames,
            out_frames: self.out_frames,
            dropped_frames: self.dropped,
            duplicated_frames: self.duplicated,
            timestamp: stamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(json: &str) -> StreamConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn default_config_targets_stdout() {
        let args = build_args(&config(r#"{"processor":"gstreamer"}"#));
        assert_eq!(args[0], "-e");
        assert_eq!(args[1], "-v");
        assert!(args.contains(&"fdsrc".to_string()));
        assert_eq!(args.last().unwrap(), "fd=1");
        assert!(args.contains(&"matroskamux".to_string()));
    }

    #[test]
    fn x264_block_carries_gop_and_bitrate() {
        let cfg = config(r#"{"encoder":{"video":{"codec":"x264","bitrate":2500,"fps":25}}}"#);
        let args = build_args(&cfg);
        assert!(args.contains(&"x264enc".to_string()));
        assert!(args.contains(&"bitrate=2500".to_string()));
        assert!(args.contains(&"key-int-max=50".to_string()));
    }

    #[test]
    fn nvenc_block_uses_gop_size() {
        let cfg = config(r#"{"encoder":{"video":{"codec":"h264_nvenc","fps":30}}}"#);
        let args = build_args(&cfg);
        assert!(args.contains(&"nvh264enc".to_string()));
        assert!(args.contains(&"gop-size=60".to_string()));
    }

    #[test]
    fn bogus_codec_becomes_element_name() {
        let cfg = config(r#"{"encoder":{"video":{"codec":"bogus_codec"}}}"#);
        let args = build_args(&cfg);
        assert!(args.contains(&"bogus_codec".to_string()));
    }

    #[test]
    fn file_destination_uses_mp4mux() {
        let cfg = config(r#"{"destination":{"type":"file","path":"/tmp/out.mp4"}}"#);
        let args = build_args(&cfg);
        assert!(args.contains(&"mp4mux".to_string()));
        assert_eq!(args.last().unwrap(), "location=/tmp/out.mp4");
    }

    #[test]
    fn rtmp_destination_uses_flvmux() {
        let cfg = config(r#"{"destination":{"type":"rtmp","path":"rtmp://live/app"}}"#);
        let args = build_args(&cfg);
        assert!(args.contains(&"flvmux".to_string()));
        assert!(args.contains(&"rtmpsink".to_string()));
        assert_eq!(args.last().unwrap(), "location=rtmp://live/app");
    }

    #[test]
    fn audio_rate_and_codec_flow_into_pipeline() {
        let cfg = config(
            r#"{"encoder":{"audio":{"codec":"opus","bitrate":96000,"sampleRate":48000}}}"#,
        );
        let args = build_args(&cfg);
        assert!(args.contains(&"audio/x-raw,rate=48000".to_string()));
        assert!(args.contains(&"opusenc".to_string()));
        assert!(args.contains(&"bitrate=96000".to_string()));
    }

    #[test]
    fn stats_track_videorate_counters() {
        let mut stats = VideorateStats::default();
        let record = stats
            .observe(
                "/GstPipeline:pipeline0/GstVideoRate:videorate0: in = 100",
                Duration::from_millis(2500),
            )
            .unwrap();
        assert_eq!(record.in_frames, 100);
        assert_eq!(record.timestamp, 2);

        // Same truncated second: counter updates but nothing emits
        assert!(
            stats
                .observe(
                    "/GstPipeline:pipeline0/GstVideoRate:videorate0: out = 98",
                    Duration::from_millis(2900),
                )
                .is_none()
        );

        // Next second: the accumulated counters emit together
        let record = stats
            .observe(
                "/GstPipeline:pipeline0/GstVideoRate:videorate0: drop = 2",
                Duration::from_millis(3100),
            )
            .unwrap();
        assert_eq!(record.out_frames, 98);
        assert_eq!(record.dropped_frames, 2);
        assert_eq!(record.timestamp, 3);
    }

    #[test]
    fn stats_fps_is_out_frames_over_elapsed() {
        let mut stats = VideorateStats::default();
        stats.out_frames = 0;
        let record = stats
            .observe(
                "/GstPipeline:pipeline0/GstVideoRate:videorate0: out = 60",
                Duration::from_secs(2),
            )
            .unwrap();
        assert_eq!(record.fps, 30.0);
    }

    #[test]
    fn unrelated_property_lines_are_ignored() {
        let mut stats = VideorateStats::default();
        assert!(
            stats
                .observe(
                    "/GstPipeline:pipeline0/GstX264Enc:x264enc0.GstPad:src: caps = video/x-h264",
                    Duration::from_secs(1),
                )
                .is_none()
        );
        assert!(
            stats
                .observe("Pipeline is PREROLLED ...", Duration::from_secs(1))
                .is_none()
        );
    }

    #[test]
    fn ready_marker_matches_gst_launch_output() {
        let line = "Setting pipeline to PLAYING ...";
        assert!(line.contains(READY_MARKER));
    }

    #[test]
    fn gst_error_lines_match_keyword_set() {
        assert!(is_error_line(
            "ERROR: from element /GstPipeline:pipeline0/GstFdSrc:fdsrc0: Internal data stream error."
        ));
        assert!(is_error_line(
            "ERROR: pipeline could not be constructed: no element \"bogus_codec\"."
        ));
        assert!(!is_error_line("Setting pipeline to PAUSED ..."));
    }
}
