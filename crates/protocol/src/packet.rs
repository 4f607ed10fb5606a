//! Binary packet framing for the WebRTC data channel.
//!
//! Every message is one unsigned header byte followed by an opaque payload:
//! ```text
//! [0]    header (see `PacketHeader`)
//! [1..]  payload
//! ```
//! The data channel is ordered and message-oriented, so there are no
//! checksums and no sequence numbers. Payloads larger than
//! `max_packet_size - 1` are split into multiple packets carrying the same
//! header; each arrival is an independent chunk appended in arrival order.
//! The media container carried in chunk payloads is self-delimiting, so the
//! downstream encoder tolerates arbitrary chunk boundaries.

use bytes::Bytes;

/// Default ceiling on a framed packet, header byte included.
/// The underlying datagram transport cannot fragment larger messages.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 300 * 1024;

/// Closed enumeration of packet headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketHeader {
    /// client → server: JSON `StreamConfig` payload
    SessionStart = 0x10,
    /// server → client: encoder accepted input, empty payload
    AvReady = 0x34,
    /// server → client: encoder failed to start or died, empty payload
    SessionStartError = 0x35,
    /// server → client: chunk-arrival watchdog expired, empty payload
    ChunkWaitTimeout = 0x36,
    /// client → server: opaque media container bytes
    AvChunk = 0x41,
    /// client → server: end of stream, empty payload
    SessionEnd = 0x84,
}

impl TryFrom<u8> for PacketHeader {
    type Error = PacketError;

    fn try_from(byte: u8) -> Result<Self, PacketError> {
        match byte {
            0x10 => Ok(Self::SessionStart),
            0x34 => Ok(Self::AvReady),
            0x35 => Ok(Self::SessionStartError),
            0x36 => Ok(Self::ChunkWaitTimeout),
            0x41 => Ok(Self::AvChunk),
            0x84 => Ok(Self::SessionEnd),
            other => Err(PacketError::UnknownHeader(other)),
        }
    }
}

/// Frame a payload into one or more packets sharing `header`.
///
/// Payloads up to `max_packet_size - 1` bytes produce a single packet.
/// Larger payloads are split into slices of at most `max_packet_size - 1`
/// bytes, emitted in order. An empty payload produces one header-only packet.
pub fn encode(header: PacketHeader, payload: &[u8], max_packet_size: usize) -> Vec<Bytes> {
    let max_payload = max_packet_size.saturating_sub(1).max(1);
    if payload.is_empty() {
        return vec![Bytes::copy_from_slice(&[header as u8])];
    }
    payload
        .chunks(max_payload)
        .map(|slice| {
            let mut buf = Vec::with_capacity(1 + slice.len());
            buf.push(header as u8);
            buf.extend_from_slice(slice);
            Bytes::from(buf)
        })
        .collect()
}

/// Split a received datagram into its raw header byte and payload.
///
/// The header byte is returned raw so the routing layer can log and drop
/// unknown values without this layer growing a policy for them.
pub fn decode(datagram: &[u8], max_packet_size: usize) -> Result<(u8, Bytes), PacketError> {
    if datagram.is_empty() {
        return Err(PacketError::Empty);
    }
    if datagram.len() > max_packet_size {
        return Err(PacketError::Oversize {
            len: datagram.len(),
            max: max_packet_size,
        });
    }
    Ok((datagram[0], Bytes::copy_from_slice(&datagram[1..])))
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("empty datagram")]
    Empty,
    #[error("datagram of {len} bytes exceeds maximum of {max}")]
    Oversize { len: usize, max: usize },
    #[error("unknown packet header 0x{0:02x}")]
    UnknownHeader(u8),
}
