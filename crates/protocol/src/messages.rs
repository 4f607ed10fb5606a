use serde::{Deserialize, Serialize};

/// Signaling messages exchanged over the WebSocket during session setup.
///
/// The signaling channel carries UTF-8 JSON only; once the data channel is
/// open, media flows as framed binary packets instead (see `packet`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalMessage {
    /// WebRTC SDP offer from the browser
    #[serde(rename = "wrtc:offer")]
    Offer { offer: SessionDescription },
    /// WebRTC SDP answer from the server
    #[serde(rename = "wrtc:answer")]
    Answer { answer: SessionDescription },
    /// Trickle ICE candidate, either direction
    #[serde(rename = "wrtc:ice")]
    Ice { candidate: IceCandidate },
    /// Encoder progress report, server → client
    #[serde(rename = "av:stats")]
    Stats { data: EncoderStats },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    /// "offer" or "answer"
    #[serde(rename = "type")]
    pub kind: String,
}

/// Browsers send the media-line id as `sdpMid`; we emit the shorter `mid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "mid", alias = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
}

/// Stats record extracted from the encoder child's stderr.
///
/// The two adapters report different shapes; the client distinguishes them
/// by their fields, so the JSON carries no tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EncoderStats {
    Ffmpeg(FfmpegProgress),
    Gstreamer(PipelineStats),
}

/// One ffmpeg progress line, emitted on every line the child prints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FfmpegProgress {
    pub frame: u64,
    pub fps: f64,
    #[serde(rename = "sizeKB")]
    pub size_kb: u64,
    pub time_ms: u64,
    pub bitrate_kbps: f64,
    pub speed: f64,
}

/// Videorate counters from the gst-launch pipeline, at most one per second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub fps: f64,
    pub in_frames: u64,
    pub out_frames: u64,
    pub dropped_frames: u64,
    pub duplicated_frames: u64,
    /// Whole seconds since the pipeline started; also the dedup key.
    pub timestamp: u64,
}
