use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Operator-supplied stream configuration, carried in the payload of the
/// session-start packet as JSON. Unknown fields are ignored; missing fields
/// fall back to the defaults below (video codec defaults are per-adapter and
/// applied during argument synthesis).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Which encoder adapter drives the child process.
    #[serde(default)]
    pub processor: Processor,
    #[serde(default)]
    pub destination: Destination,
    #[serde(default)]
    pub encoder: EncoderSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Processor {
    #[default]
    Ffmpeg,
    Gstreamer,
}

/// Where the encoded output goes. With no `type`, the child writes to its
/// stdout and the operator pipes it onward.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Destination {
    #[serde(rename = "type", default)]
    pub kind: Option<DestinationKind>,
    /// Filesystem path or RTMP URL, depending on `kind`.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    File,
    Rtmp,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncoderSettings {
    #[serde(default)]
    pub video: VideoSettings,
    #[serde(default)]
    pub audio: AudioSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoSettings {
    /// Encoder-specific codec name. Passed through to the child verbatim so
    /// an unknown name surfaces as the child's own diagnostic, not ours.
    #[serde(default)]
    pub codec: Option<String>,
    /// kbit/s
    #[serde(default = "default_video_bitrate")]
    pub bitrate: u32,
    /// Target frames per second
    #[serde(default = "default_fps")]
    pub fps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioSettings {
    #[serde(default)]
    pub codec: AudioCodec,
    /// bits/s
    #[serde(default = "default_audio_bitrate")]
    pub bitrate: u32,
    /// Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    #[default]
    Aac,
    Opus,
}

impl VideoSettings {
    /// Minimum spacing between successive chunk writes to the encoder.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.fps.max(1)))
    }

    /// GOP size: two seconds of frames.
    pub fn keyframe_interval(&self) -> u32 {
        self.fps.max(1) * 2
    }
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            codec: None,
            bitrate: default_video_bitrate(),
            fps: default_fps(),
        }
    }
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            codec: AudioCodec::Aac,
            bitrate: default_audio_bitrate(),
            sample_rate: default_sample_rate(),
        }
    }
}

fn default_video_bitrate() -> u32 {
    3000
}

fn default_fps() -> u32 {
    30
}

fn default_audio_bitrate() -> u32 {
    128_000
}

fn default_sample_rate() -> u32 {
    44_100
}
