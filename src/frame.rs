//! # Frame
//!
//! The `frame` module implements WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! ### Frame Binary Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! :                     Payload Data continued ...                :
//! +---------------------------------------------------------------+
//! ```
//!
//! A header is at most [`MAX_HEAD_SIZE`] (14) bytes: two prefix bytes, up to
//! eight bytes of extended length and four bytes of masking key.
//!
//! [`FrameHeader`] only describes a frame; reading and demasking the payload is
//! up to the caller. Two emission paths exist:
//!
//! - [`seal`] writes the header in place in front of a payload that already
//!   lives at offset [`MAX_HEAD_SIZE`] of a pool slab, masking the slab copy.
//! - [`write_frame`] masks a caller-owned buffer in place, writes it, and
//!   restores the original bytes before returning.
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{mask::apply_mask, Result, WebSocketError};

/// Maximum size of an encoded frame header.
pub const MAX_HEAD_SIZE: usize = 14;

/// Maximum payload of a control frame.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest payload length the wire format allows (2^63 - 1).
pub const MAX_PAYLOAD_LEN: u64 = i64::MAX as u64;

/// WebSocket operation code (OpCode) that determines the semantic meaning and handling of a frame.
///
/// The numeric values for each OpCode are defined in [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8).
/// The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected as protocol errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` if the `OpCode` represents a control frame (`Close`, `Ping`, or `Pong`).
    ///
    /// Control opcodes have the high bit of the 4-bit nibble set.
    pub fn is_control(&self) -> bool {
        u8::from(*self) & 0x8 != 0
    }

    /// Returns `true` for `Text` and `Binary`, the opcodes that start a message.
    pub fn is_data(&self) -> bool {
        matches!(*self, OpCode::Text | OpCode::Binary)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment of a message.
    pub fin: bool,
    /// Per-message compressed flag when permessage-deflate is negotiated.
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: OpCode,
    /// Masking key; present if and only if the MASK bit is set.
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
}

impl FrameHeader {
    /// Creates a header with all reserved bits cleared.
    pub fn new(fin: bool, opcode: OpCode, mask: Option<[u8; 4]>, payload_len: usize) -> Self {
        Self {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            mask,
            payload_len: payload_len as u64,
        }
    }

    /// Sets the compressed (rsv1) bit.
    pub fn with_rsv1(mut self, rsv1: bool) -> Self {
        self.rsv1 = rsv1;
        self
    }

    /// Total header length announced by the first two header bytes.
    #[inline]
    pub fn head_len(prefix: [u8; 2]) -> usize {
        let extra = match prefix[1] & 0x7F {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let mask = if prefix[1] & 0x80 != 0 { 4 } else { 0 };
        2 + extra + mask
    }

    /// Parses a header from the front of `src`.
    ///
    /// Returns `Ok(None)` when `src` does not yet hold the complete header,
    /// otherwise the header and the number of bytes it occupied.
    pub fn decode(src: &[u8]) -> Result<Option<(Self, usize)>> {
        if src.len() < 2 {
            return Ok(None);
        }

        let head_len = Self::head_len([src[0], src[1]]);
        if src.len() < head_len {
            return Ok(None);
        }

        let fin = src[0] & 0b1000_0000 != 0;
        let rsv1 = src[0] & 0b0100_0000 != 0;
        let rsv2 = src[0] & 0b0010_0000 != 0;
        let rsv3 = src[0] & 0b0001_0000 != 0;
        let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;
        let masked = src[1] & 0b1000_0000 != 0;

        let (payload_len, offset) = match src[1] & 0x7F {
            126 => (u16::from_be_bytes([src[2], src[3]]) as u64, 4),
            127 => {
                let mut len = [0u8; 8];
                len.copy_from_slice(&src[2..10]);
                (u64::from_be_bytes(len), 10)
            }
            code => (code as u64, 2),
        };

        if payload_len > MAX_PAYLOAD_LEN {
            return Err(WebSocketError::FrameTooLarge);
        }

        let mask = if masked {
            let mut key = [0u8; 4];
            key.copy_from_slice(&src[offset..offset + 4]);
            Some(key)
        } else {
            None
        };

        Ok(Some((
            Self {
                fin,
                rsv1,
                rsv2,
                rsv3,
                opcode,
                mask,
                payload_len,
            },
            head_len,
        )))
    }

    /// Reads exactly one header from `io`: two prefix bytes, then the
    /// extended length and masking key announced by the prefix.
    pub async fn read<R>(io: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; MAX_HEAD_SIZE];
        io.read_exact(&mut head[..2]).await?;
        let len = Self::head_len([head[0], head[1]]);
        io.read_exact(&mut head[2..len]).await?;

        match Self::decode(&head[..len])? {
            Some((header, _)) => Ok(header),
            None => Err(WebSocketError::FrameTooLarge),
        }
    }

    /// Formats the header into `head` and returns the number of bytes used.
    pub fn encode(&self, head: &mut [u8; MAX_HEAD_SIZE]) -> usize {
        head[0] = (self.fin as u8) << 7
            | (self.rsv1 as u8) << 6
            | (self.rsv2 as u8) << 5
            | (self.rsv3 as u8) << 4
            | u8::from(self.opcode);

        let len = self.payload_len;
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len < 65536 {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&len.to_be_bytes());
            10
        };

        if let Some(mask) = self.mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&mask);
            size + 4
        } else {
            size
        }
    }

    /// Number of bytes [`encode`](Self::encode) produces.
    pub fn encoded_len(&self) -> usize {
        let extra = match self.payload_len {
            0..=125 => 0,
            126..=65535 => 2,
            _ => 8,
        };
        2 + extra + if self.mask.is_some() { 4 } else { 0 }
    }

    /// Payload length as an addressable size.
    pub fn payload_size(&self) -> Result<usize> {
        usize::try_from(self.payload_len).map_err(|_| WebSocketError::FrameTooLarge)
    }
}

/// Finalizes a frame inside a pool slab.
///
/// The payload must already be stored at `slab[MAX_HEAD_SIZE..MAX_HEAD_SIZE + header.payload_len]`.
/// The payload is masked in place if the header carries a key and the header
/// is written immediately before it. Returns the offset at which the encoded
/// frame starts; the frame spans `slab[offset..MAX_HEAD_SIZE + payload_len]`.
pub fn seal(slab: &mut [u8], header: &FrameHeader) -> usize {
    debug_assert!(
        !header.opcode.is_control() || header.payload_len <= MAX_CONTROL_PAYLOAD as u64,
        "control frame payload exceeds 125 bytes"
    );

    let end = MAX_HEAD_SIZE + header.payload_len as usize;
    if let Some(mask) = header.mask {
        apply_mask(&mut slab[MAX_HEAD_SIZE..end], mask);
    }

    let mut head = [0u8; MAX_HEAD_SIZE];
    let size = header.encode(&mut head);
    let start = MAX_HEAD_SIZE - size;
    slab[start..MAX_HEAD_SIZE].copy_from_slice(&head[..size]);
    start
}

/// Writes one frame to `io`, masking `payload` in place if the header carries a key.
///
/// The caller's buffer is restored to its original contents before this
/// function returns, whether the write succeeded or not. If the returned
/// future is dropped mid-write the buffer is left masked.
pub async fn write_frame<W>(io: &mut W, header: &FrameHeader, payload: &mut [u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if header.payload_len != payload.len() as u64 {
        return Err(WebSocketError::FrameTooLarge);
    }
    if header.opcode.is_control() && payload.len() > MAX_CONTROL_PAYLOAD {
        return Err(WebSocketError::ControlFrameTooLarge);
    }

    let mut head = [0u8; MAX_HEAD_SIZE];
    let size = header.encode(&mut head);

    if let Some(mask) = header.mask {
        apply_mask(payload, mask);
    }

    let res = async {
        io.write_all(&head[..size]).await?;
        io.write_all(payload).await
    }
    .await;

    if let Some(mask) = header.mask {
        apply_mask(payload, mask);
    }

    res.map_err(WebSocketError::from)
}

/// Represents a WebSocket frame: a header and its payload.
///
/// **Note: This low-level struct should rarely be used directly.** It is the
/// item type of the sans-io [`Codec`](crate::codec::Codec); connections deliver
/// [`Message`]s instead.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    /// Payload as carried on the wire (compressed if `rsv1`); never masked.
    pub payload: BytesMut,
}

impl Frame {
    pub fn new(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: impl Into<BytesMut>,
    ) -> Self {
        let payload = payload.into();
        Self {
            header: FrameHeader::new(fin, opcode, mask, payload.len()),
            payload,
        }
    }

    /// Creates a frame whose payload was compressed with permessage-deflate.
    pub fn compress(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: impl Into<BytesMut>,
    ) -> Self {
        let mut frame = Self::new(fin, opcode, mask, payload);
        frame.header.rsv1 = true;
        frame
    }

    #[inline]
    pub fn is_fin(&self) -> bool {
        self.header.fin
    }

    #[inline]
    pub fn opcode(&self) -> OpCode {
        self.header.opcode
    }
}

/// A complete application message.
///
/// Continuation frames are never surfaced: a message is the concatenation of
/// a data frame and every continuation that follows it up to FIN, already
/// decompressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub opcode: OpCode,
    pub payload: Bytes,
}

impl Message {
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Text, payload)
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, payload)
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, payload)
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, payload)
    }

    /// Payload as text; `None` if it is not valid UTF-8.
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

impl From<Message> for (OpCode, Bytes) {
    fn from(val: Message) -> Self {
        (val.opcode, val.payload)
    }
}
