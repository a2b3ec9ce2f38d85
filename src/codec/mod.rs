//! Framed packet codec for tunnel traffic
//!
//! Every record on a tunnel is a 4-byte big-endian length prefix followed by
//! the frame body. In the clear, the body is `stream_id (u16 BE) || flag
//! (u8) || payload`. When a cipher is in play the whole body tuple is
//! AEAD-sealed and the frame carries `nonce || ciphertext+tag` instead; the
//! length prefix always frames the post-encryption bytes.
//!
//! ```text
//! u32 BE length
//! <length bytes>:
//!    encrypted: 12-byte nonce || sealed(stream_id || flag || payload)
//!    plaintext: u16 BE stream_id || u8 flag || payload
//! ```
//!
//! Flags: 1=NewStreamTcp 2=NewStreamTcpSuccess 3=TcpData 4=UdpData
//! 5=CloseStream.

mod metadata;

pub use metadata::{build_stream_metadata, parse_stream_metadata, StreamTarget, CMD_CONNECT};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::Cipher;
use crate::error::CodecError;

/// Maximum accepted frame length (payload ceiling plus AEAD overhead)
pub const MAX_FRAME_LEN: usize = 64 * 1024 + 32;

/// Stream id reserved for the aggregated UDP-associate stream
pub const UDP_STREAM_ID: u16 = 0xFFFF;

/// Highest stream id handed out to TCP streams (0xFFFF stays reserved)
pub const MAX_TCP_STREAM_ID: u16 = 65530;

/// Minimum frame body: stream id + flag
const MIN_PLAINTEXT_LEN: usize = 3;

/// Packet flags on the tunnel wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketFlag {
    /// Open a new TCP stream; payload carries the target metadata
    NewStreamTcp = 1,
    /// Remote confirmation that the stream's upstream connect succeeded
    NewStreamTcpSuccess = 2,
    /// TCP payload bytes for an open stream
    TcpData = 3,
    /// Encapsulated SOCKS5 UDP datagram (stream id 0xFFFF)
    UdpData = 4,
    /// Cooperative stream close
    CloseStream = 5,
}

impl TryFrom<u8> for PacketFlag {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            1 => Ok(Self::NewStreamTcp),
            2 => Ok(Self::NewStreamTcpSuccess),
            3 => Ok(Self::TcpData),
            4 => Ok(Self::UdpData),
            5 => Ok(Self::CloseStream),
            other => Err(CodecError::UnknownFlag(other)),
        }
    }
}

/// One framed record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Logical stream this record belongs to
    pub stream_id: u16,
    /// Record kind
    pub flag: PacketFlag,
    /// Plaintext payload (may be empty for control records)
    pub payload: Vec<u8>,
}

impl Packet {
    /// Create a packet
    #[must_use]
    pub fn new(stream_id: u16, flag: PacketFlag, payload: Vec<u8>) -> Self {
        Self {
            stream_id,
            flag,
            payload,
        }
    }

    /// Create a control packet with no payload
    #[must_use]
    pub fn control(stream_id: u16, flag: PacketFlag) -> Self {
        Self::new(stream_id, flag, Vec::new())
    }

    /// Serialize the plaintext body: `stream_id || flag || payload`
    #[must_use]
    pub fn to_body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(MIN_PLAINTEXT_LEN + self.payload.len());
        body.extend_from_slice(&self.stream_id.to_be_bytes());
        body.push(self.flag as u8);
        body.extend_from_slice(&self.payload);
        body
    }

    /// Parse a plaintext body back into a packet.
    ///
    /// # Errors
    ///
    /// Returns `CodecError` on short bodies or unknown flags.
    pub fn from_body(body: &[u8]) -> Result<Self, CodecError> {
        if body.len() < MIN_PLAINTEXT_LEN {
            return Err(CodecError::truncated(format!(
                "frame body is {} bytes, need at least {MIN_PLAINTEXT_LEN}",
                body.len()
            )));
        }
        let stream_id = u16::from_be_bytes([body[0], body[1]]);
        let flag = PacketFlag::try_from(body[2])?;
        Ok(Self {
            stream_id,
            flag,
            payload: body[3..].to_vec(),
        })
    }
}

/// Encode a packet to full wire form (length prefix included).
///
/// # Errors
///
/// Returns `CodecError` if sealing fails or the encoded frame would exceed
/// [`MAX_FRAME_LEN`].
pub fn encode_packet(packet: &Packet, cipher: Option<&Cipher>) -> Result<Vec<u8>, CodecError> {
    let body = match cipher {
        Some(cipher) => cipher.seal(&packet.to_body())?,
        None => packet.to_body(),
    };

    if body.len() > MAX_FRAME_LEN {
        return Err(CodecError::OversizedFrame {
            len: body.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let mut wire = Vec::with_capacity(4 + body.len());
    wire.extend_from_slice(&u32::try_from(body.len()).unwrap_or(u32::MAX).to_be_bytes());
    wire.extend_from_slice(&body);
    Ok(wire)
}

/// Decode a frame body (the bytes after the length prefix).
///
/// # Errors
///
/// Returns `CodecError::Auth` on AEAD failure and `CodecError` variants for
/// malformed plaintext.
pub fn decode_body(body: &[u8], cipher: Option<&Cipher>) -> Result<Packet, CodecError> {
    match cipher {
        Some(cipher) => {
            let plaintext = cipher.open(body)?;
            Packet::from_body(&plaintext)
        }
        None => Packet::from_body(body),
    }
}

/// Read one packet from `transport`.
///
/// Reads exactly the declared frame length and never past it. The length is
/// validated against [`MAX_FRAME_LEN`] before any allocation.
///
/// # Errors
///
/// Returns `CodecError` for oversized/short frames, AEAD failures, unknown
/// flags, and transport I/O errors (EOF surfaces as `IoError`).
pub async fn read_packet<R>(
    transport: &mut R,
    cipher: Option<&Cipher>,
) -> Result<Packet, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    transport.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_LEN {
        return Err(CodecError::OversizedFrame {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    if len < MIN_PLAINTEXT_LEN {
        return Err(CodecError::truncated(format!("declared length {len}")));
    }

    let mut body = vec![0u8; len];
    transport.read_exact(&mut body).await?;

    decode_body(&body, cipher)
}

/// Write one packet to `transport`.
///
/// Callers sharing a transport between tasks must serialize calls (the
/// tunnel write mutex); a frame is emitted as a single write so packet
/// boundaries are atomic at this layer.
///
/// # Errors
///
/// Returns `CodecError` if sealing fails or the transport write fails.
pub async fn write_packet<W>(
    transport: &mut W,
    packet: &Packet,
    cipher: Option<&Cipher>,
) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let wire = encode_packet(packet, cipher)?;
    transport.write_all(&wire).await?;
    transport.flush().await?;
    Ok(())
}
