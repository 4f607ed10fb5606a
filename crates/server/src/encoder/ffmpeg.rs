//! FFmpeg adapter: container bytes in on stdin, encoded output to a file,
//! an RTMP endpoint, or stdout.
//!
//! Readiness is the version banner on stderr (so the banner is not
//! suppressed). Progress lines are parsed into stats records on every
//! update; error markers fail the session.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use castpipe_protocol::{AudioCodec, DestinationKind, EncoderStats, FfmpegProgress, StreamConfig};
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, Command};
use tokio::sync::{mpsc, oneshot};

use super::child::ChildHandle;
use super::{EncoderError, EncoderEvent, EncoderProcess, LineBuffer};

const BINARY: &str = "ffmpeg";

/// Video codec when the config names none.
const DEFAULT_VIDEO_CODEC: &str = "libx264";

pub struct FfmpegEncoder {
    cfg: StreamConfig,
    events: mpsc::Sender<EncoderEvent>,
    child: ChildHandle,
}

impl FfmpegEncoder {
    pub fn new(cfg: StreamConfig, events: mpsc::Sender<EncoderEvent>) -> Self {
        Self {
            cfg,
            events,
            child: ChildHandle::new(BINARY),
        }
    }
}

#[async_trait]
impl EncoderProcess for FfmpegEncoder {
    async fn start(&self) -> Result<(), EncoderError> {
        let args = build_args(&self.cfg);
        tracing::debug!(?args, "Spawning ffmpeg");

        let mut cmd = Command::new(BINARY);
        cmd.args(&args);
        // With no destination the encoded stream goes to our stdout so the
        // operator can pipe it onward; otherwise stdout is unused.
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
        self.child.shutdown(None).await
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
    let mut buf = [0u8; 4096];
    loop {
        let n = match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for line in scanner.push(&buf[..n]) {
            tracing::trace!(target: "ffmpeg", "{line}");
            if ready_tx.is_some() && line.contains("ffmpeg version") {
                let _ = ready_tx.take().unwrap().send(());
                let _ = events.send(EncoderEvent::Ready).await;
            } else if let Some(progress) = parse_progress(&line) {
                let _ = events
                    .send(EncoderEvent::Stats(EncoderStats::Ffmpeg(progress)))
                    .await;
            } else if is_error_line(&line) {
                tracing::warn!(target: "ffmpeg", "{line}");
                let _ = events
                    .send(EncoderEvent::Error(EncoderError::Runtime(line)))
                    .await;
            }
        }
    }
    running.store(false, Ordering::Relaxed);
    let _ = events.send(EncoderEvent::Exited).await;
}

/// Synthesize the full argument vector from the stream config.
///
/// Unknown codec names pass through untouched; ffmpeg reports them itself
/// (`Unknown encoder`) and the error path picks that up from stderr.
pub(crate) fn build_args(cfg: &StreamConfig) -> Vec<String> {
    let video = &cfg.encoder.video;
    let audio = &cfg.encoder.audio;
    let codec = video.codec.as_deref().unwrap_or(DEFAULT_VIDEO_CODEC);

    let mut args: Vec<String> = ["-i", "pipe:0", "-c:v", codec]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let tuning: &[&str] = match codec {
        "libx264" => &["-preset", "veryfast", "-tune", "zerolatency"],
        "h264_nvenc" | "hevc_nvenc" => &["-preset", "llhq", "-rc", "cbr"],
        _ => &[],
    };
    args.extend(tuning.iter().map(|s| s.to_string()));

    args.extend([
        "-b:v".to_string(),
        format!("{}k", video.bitrate),
        "-maxrate".to_string(),
        format!("{}k", video.bitrate),
        "-bufsize".to_string(),
        format!("{}k", video.bitrate * 2),
        "-r".to_string(),
        video.fps.to_string(),
        "-g".to_string(),
        video.keyframe_interval().to_string(),
    ]);

    let acodec = match audio.codec {
        AudioCodec::Aac => "aac",
        AudioCodec::Opus => "libopus",
    };
    args.extend([
        "-c:a".to_string(),
        acodec.to_string(),
        "-b:a".to_string(),
        audio.bitrate.to_string(),
        "-ar".to_string(),
        audio.sample_rate.to_string(),
    ]);

    match (cfg.destination.kind, cfg.destination.path.as_deref()) {
        (Some(DestinationKind::File), Some(path)) => {
            args.extend(["-y".to_string(), path.to_string()]);
        }
        (Some(DestinationKind::Rtmp), Some(url)) => {
            args.extend(["-f".to_string(), "flv".to_string(), url.to_string()]);
        }
        _ => {
            // Raw pipe: stdout sentinel must come last.
            args.extend([
                "-f".to_string(),
                "matroska".to_string(),
                "pipe:1".to_string(),
            ]);
        }
    }

    args
}

/// Parse one ffmpeg progress line:
/// `frame=  120 fps= 30 q=28.0 size=     256KiB time=00:00:04.00 bitrate= 524.3kbits/s speed=1.01x`
///
/// Returns `None` for anything else, including early lines where fields
/// still read `N/A`.
pub(crate) fn parse_progress(line: &str) -> Option<FfmpegProgress> {
    if !line.contains("frame=") || !line.contains("time=") {
        return None;
    }

    // ffmpeg pads values after '=', so collapse `key=   value` first.
    let mut normalized = String::with_capacity(line.len());
    let mut after_eq = false;
    for ch in line.chars() {
        if ch == '=' {
            after_eq = true;
            normalized.push(ch);
        } else if ch.is_whitespace() && after_eq {
            // skip padding
        } else {
            after_eq = false;
            normalized.push(ch);
        }
    }

    let mut frame = None;
    let mut fps = None;
    let mut size_kb = None;
    let mut time_ms = None;
    let mut bitrate = None;
    let mut speed = None;
    for token in normalized.split_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        match key {
            "frame" => frame = value.parse().ok(),
            "fps" => fps = value.parse().ok(),
            "size" | "Lsize" => {
                size_kb = value
                    .trim_end_matches("KiB")
                    .trim_end_matches("kB")
                    .parse()
                    .ok();
            }
            "time" => time_ms = parse_clock_ms(value),
            "bitrate" => bitrate = value.trim_end_matches("kbits/s").parse().ok(),
            "speed" => speed = value.trim_end_matches('x').parse().ok(),
            _ => {}
        }
    }

    Some(FfmpegProgress {
        frame: frame?,
        fps: fps?,
        size_kb: size_kb?,
        time_ms: time_ms?,
        bitrate_kbps: bitrate?,
        speed: speed?,
    })
}

/// `HH:MM:SS.cc` → milliseconds.
fn parse_clock_ms(value: &str) -> Option<u64> {
    let (clock, centis) = value.split_once('.')?;
    let mut parts = clock.splitn(3, ':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: u64 = parts.next()?.parse().ok()?;
    let centis: u64 = centis.parse().ok()?;
    Some(((hours * 60 + minutes) * 60 + seconds) * 1000 + centis * 10)
}

pub(crate) fn is_error_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.contains("error")
        || lower.contains("already exists")
        || line.contains("Unknown encoder")
        || line.contains("Unrecognized option")
        || line.contains("Invalid argument")
}
