//! Per-client session: binds the signaling connection, the peer transport
//! and at most one AV session, and routes inbound framed packets.

use std::sync::Arc;

use bytes::Bytes;
use castpipe_protocol::packet::{self, PacketHeader};
use castpipe_protocol::{IceCandidate, SignalMessage, StreamConfig};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::av::{AvEvent, AvSession, AvState, WatchdogConfig};
use crate::config::ServerConfig;
use crate::peer::{PeerTransport, WebRtcPeer};

pub struct ClientSession {
    pub id: Uuid,
    cfg: Arc<ServerConfig>,
    peer: Mutex<Option<Arc<dyn PeerTransport>>>,
    av: Mutex<Option<Arc<AvSession>>>,
    /// Outbox to the signaling WebSocket loop.
    signal_tx: mpsc::Sender<SignalMessage>,
    /// Inbound datagrams from the data channel; single consumer keeps
    /// packet handling serialized per client.
    packet_tx: mpsc::Sender<Bytes>,
    av_events_tx: mpsc::Sender<AvEvent>,
    cancel: CancellationToken,
}

impl ClientSession {
    pub fn spawn(
        id: Uuid,
        cfg: Arc<ServerConfig>,
        signal_tx: mpsc::Sender<SignalMessage>,
    ) -> Arc<Self> {
        let (packet_tx, packet_rx) = mpsc::channel(256);
        let (av_events_tx, av_events_rx) = mpsc::channel(64);
        let session = Arc::new(Self {
            id,
            cfg,
            peer: Mutex::new(None),
            av: Mutex::new(None),
            signal_tx,
            packet_tx,
            av_events_tx,
            cancel: CancellationToken::new(),
        });
        tokio::spawn(Arc::clone(&session).route(packet_rx, av_events_rx));
        session
    }

    /// Resolves when the session should be torn down (peer transport died
    /// or `close` was called); the signaling loop selects on this.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Handle one signaling message from the client.
    pub async fn handle_signal(&self, msg: SignalMessage) {
        match msg {
            SignalMessage::Offer { offer } => {
                if let Err(e) = self.handle_offer(&offer.sdp).await {
                    tracing::warn!(client_id = %self.id, "Failed to handle offer: {e:#}");
                }
            }
            SignalMessage::Ice { candidate } => {
                let peer = { self.peer.lock().await.clone() };
                let Some(peer) = peer else {
                    tracing::warn!(client_id = %self.id, "ICE candidate before offer, dropping");
                    return;
                };
                if let Err(e) = peer
                    .add_remote_candidate(&candidate.candidate, candidate.mid.as_deref())
                    .await
                {
                    tracing::warn!(client_id = %self.id, "Failed to add ICE candidate: {e:#}");
                }
            }
            other => {
                tracing::warn!(client_id = %self.id, msg = ?other, "Unexpected signaling message");
            }
        }
    }

    async fn handle_offer(&self, sdp: &str) -> anyhow::Result<()> {
        let peer = WebRtcPeer::new(self.cfg.ice_servers.clone()).await?;

        peer.on_packet(self.packet_tx.clone());

        let ice_tx = self.signal_tx.clone();
        peer.on_ice_candidate(move |candidate, mid| {
            let _ = ice_tx.try_send(SignalMessage::Ice {
                candidate: IceCandidate { candidate, mid },
            });
        });

        let cancel = self.cancel.clone();
        peer.on_closed(move || cancel.cancel());

        let answer_sdp = peer.handle_offer(sdp).await?;

        {
            let mut slot = self.peer.lock().await;
            if let Some(previous) = slot.replace(Arc::new(peer)) {
                tracing::info!(client_id = %self.id, "Replacing peer transport on new offer");
                let _ = previous.close().await;
            }
        }

        self.signal_tx
            .send(SignalMessage::Answer {
                answer: castpipe_protocol::SessionDescription {
                    sdp: answer_sdp,
                    kind: "answer".to_string(),
                },
            })
            .await?;
        Ok(())
    }

    /// Install a transport directly; the offer path does this with the
    /// real WebRTC peer, tests with a recording fake.
    pub(crate) async fn install_peer(&self, peer: Arc<dyn PeerTransport>) {
        *self.peer.lock().await = Some(peer);
    }

    async fn route(
        self: Arc<Self>,
        mut packet_rx: mpsc::Receiver<Bytes>,
        mut av_events_rx: mpsc::Receiver<AvEvent>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                datagram = packet_rx.recv() => match datagram {
                    Some(datagram) => self.handle_datagram(datagram).await,
                    None => break,
                },
                event = av_events_rx.recv() => match event {
                    Some(event) => self.handle_av_event(event).await,
                    None => break,
                },
            }
        }
    }

    pub(crate) async fn handle_datagram(&self, datagram: Bytes) {
        let (header_byte, payload) = match packet::decode(&datagram, self.cfg.max_packet_size) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(client_id = %self.id, "Dropping bad packet: {e}");
                return;
            }
        };
        let header = match PacketHeader::try_from(header_byte) {
            Ok(header) => header,
            Err(e) => {
                tracing::warn!(client_id = %self.id, "Dropping packet: {e}");
                return;
            }
        };

        match header {
            PacketHeader::SessionStart => self.handle_session_start(&payload).await,
            PacketHeader::AvChunk => {
                let av = { self.av.lock().await.clone() };
                match av {
                    Some(av) => av.put(payload).await,
                    None => {
                        tracing::warn!(client_id = %self.id, "Chunk without an AV session");
                        self.send_packet(PacketHeader::SessionStartError, &[]).await;
                    }
                }
            }
            PacketHeader::SessionEnd => {
                let av = { self.av.lock().await.take() };
                match av {
                    Some(av) => {
                        tracing::info!(client_id = %self.id, "Session end requested");
                        av.stop().await;
                    }
                    None => {
                        tracing::debug!(client_id = %self.id, "Session end without an AV session");
                    }
                }
            }
            PacketHeader::AvReady
            | PacketHeader::SessionStartError
            | PacketHeader::ChunkWaitTimeout => {
                tracing::warn!(client_id = %self.id, ?header, "Server-only header from client, dropping");
            }
        }
    }

    async fn handle_session_start(&self, payload: &[u8]) {
        let stream_cfg: StreamConfig = match serde_json::from_slice(payload) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!(client_id = %self.id, "Malformed stream config, dropping: {e}");
                return;
            }
        };

        let rejected = {
            let mut av = self.av.lock().await;
            if let Some(existing) = av.as_ref()
                && !matches!(existing.state(), AvState::Closed | AvState::Failed)
            {
                true
            } else {
                let session = AvSession::new(
                    self.id,
                    &stream_cfg,
                    self.av_events_tx.clone(),
                    WatchdogConfig {
                        chunk_wait_timeout: self.cfg.chunk_wait_timeout,
                        check_interval: self.cfg.chunk_wait_check_interval,
                    },
                );
                session.start().await;
                *av = Some(session);
                false
            }
        };

        if rejected {
            tracing::warn!(client_id = %self.id, "Session start while one is live, rejecting");
            self.send_packet(PacketHeader::SessionStartError, &[]).await;
        }
    }

    async fn handle_av_event(&self, event: AvEvent) {
        match event {
            AvEvent::Ready => {
                self.send_packet(PacketHeader::AvReady, &[]).await;
            }
            AvEvent::Stats(stats) => {
                let _ = self
                    .signal_tx
                    .send(SignalMessage::Stats { data: stats })
                    .await;
            }
            AvEvent::Timeout => {
                self.send_packet(PacketHeader::ChunkWaitTimeout, &[]).await;
            }
            AvEvent::Error(e) => {
                tracing::warn!(client_id = %self.id, "AV session error: {e}");
                self.send_packet(PacketHeader::SessionStartError, &[]).await;
            }
            AvEvent::Closed => {
                let mut av = self.av.lock().await;
                if av.as_ref().is_some_and(|s| s.state() == AvState::Closed) {
                    *av = None;
                }
            }
        }
    }

    async fn send_packet(&self, header: PacketHeader, payload: &[u8]) {
        let peer = { self.peer.lock().await.clone() };
        let Some(peer) = peer else {
            tracing::debug!(client_id = %self.id, ?header, "No peer transport, dropping outbound packet");
            return;
        };
        for piece in packet::encode(header, payload, self.cfg.max_packet_size) {
            if let Err(e) = peer.send(piece).await {
                tracing::warn!(client_id = %self.id, "Data channel send failed: {e:#}");
                break;
            }
        }
    }

    /// Tear down everything this session owns. Invoked by the registry on
    /// signaling disconnect, and idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();
        let av = { self.av.lock().await.take() };
        if let Some(av) = av {
            av.stop().await;
        }
        let peer = { self.peer.lock().await.take() };
        if let Some(peer) = peer {
            let _ = peer.close().await;
        }
        tracing::info!(client_id = %self.id, "Client session closed");
    }
}
