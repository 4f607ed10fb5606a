//! WebRTC peer transport: answers the browser's offer and carries framed
//! binary packets over the data channel the browser opens.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// The message-oriented transport a client session sends packets through.
/// Abstracted so the session pipeline can run against a recording fake.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Send one framed packet over the data channel.
    async fn send(&self, packet: Bytes) -> Result<()>;

    /// Hand an ICE candidate received over signaling to the transport.
    async fn add_remote_candidate(&self, candidate: &str, mid: Option<&str>) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

pub struct WebRtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
    data_channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
}

impl WebRtcPeer {
    /// Data-channel-only peer; no media tracks are negotiated.
    pub async fn new(ice_server_urls: Vec<String>) -> Result<Self> {
        let api = APIBuilder::new().build();
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: ice_server_urls,
                ..Default::default()
            }],
            ..Default::default()
        };
        let peer_connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .context("Failed to create peer connection")?,
        );

        info!("WebRTC peer connection created");
        Ok(Self {
            peer_connection,
            data_channel: Arc::new(Mutex::new(None)),
        })
    }

    /// Forward every inbound data-channel message into `packets`. The
    /// channel send awaits, so SCTP backpressure reaches the browser
    /// instead of growing an unbounded buffer here.
    pub fn on_packet(&self, packets: mpsc::Sender<Bytes>) {
        let dc_storage = Arc::clone(&self.data_channel);
        self.peer_connection.on_data_channel(Box::new(move |dc| {
            let packets = packets.clone();
            let dc_storage = Arc::clone(&dc_storage);
            Box::pin(async move {
                info!(label = dc.label(), "Data channel opened");
                {
                    let mut storage = dc_storage.lock().await;
                    *storage = Some(Arc::clone(&dc));
                }
                dc.on_message(Box::new(move |msg| {
                    let packets = packets.clone();
                    Box::pin(async move {
                        if packets.send(msg.data).await.is_err() {
                            debug!("Packet router gone, dropping data channel message");
                        }
                    })
                }));
            })
        }));
    }

    /// Invoke `callback` once the connection reaches a terminal state, so
    /// the owning session can be torn down.
    pub fn on_closed(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |state| {
                match state {
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                        warn!(?state, "Peer connection terminated");
                        callback();
                    }
                    _ => {
                        info!(?state, "Peer connection state changed");
                    }
                }
                Box::pin(async {})
            }));
    }

    pub fn on_ice_candidate(
        &self,
        callback: impl Fn(String, Option<String>) + Send + Sync + 'static,
    ) {
        let callback = Arc::new(callback);
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate| {
                if let Some(c) = candidate {
                    match c.to_json() {
                        Ok(json) => {
                            let cb = Arc::clone(&callback);
                            cb(json.candidate, json.sdp_mid);
                        }
                        Err(e) => {
                            warn!("Failed to serialize ICE candidate: {e}");
                        }
                    }
                }
                Box::pin(async {})
            }));
    }

    /// Apply the browser's offer and produce our answer SDP. Candidates
    /// trickle separately through `on_ice_candidate`.
    pub async fn handle_offer(&self, sdp: &str) -> Result<String> {
        let offer =
            RTCSessionDescription::offer(sdp.to_string()).context("Failed to parse SDP offer")?;

        self.peer_connection
            .set_remote_description(offer)
            .await
            .context("Failed to set remote description")?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .context("Failed to create answer")?;

        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .context("Failed to set local description")?;

        debug!(sdp_len = answer.sdp.len(), "Answer created");
        Ok(answer.sdp)
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeer {
    async fn send(&self, packet: Bytes) -> Result<()> {
        let dc = self.data_channel.lock().await;
        let Some(dc) = dc.as_ref() else {
            anyhow::bail!("data channel not open");
        };
        dc.send(&packet)
            .await
            .context("Failed to send data channel packet")?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &str, mid: Option<&str>) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.to_string(),
            sdp_mid: mid.map(str::to_string),
            ..Default::default()
        };

        self.peer_connection
            .add_ice_candidate(init)
            .await
            .context("Failed to add ICE candidate")?;

        debug!(candidate, ?mid, "ICE candidate added");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection
            .close()
            .await
            .context("Failed to close peer connection")?;
        info!("Peer connection closed");
        Ok(())
    }
}
