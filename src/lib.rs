//! # sluice
//! A WebSocket protocol engine (RFC 6455) with permessage-deflate compression (RFC 7692),
//! for both client and server endpoints.
//!
//! The engine starts after the HTTP upgrade: it is handed an upgraded byte
//! stream, the negotiated extension parameters and the endpoint role, and turns
//! the stream into application messages and back. Every wire-level rule of the
//! RFC is enforced: frame header layout, masking direction, fragmentation,
//! control-frame limits, close codes and UTF-8 validity of text.
//!
//! # Features
//!
//! - `logging` (default): debug logging of negotiation, connection lifecycle
//!   and protocol errors through the `log` crate.
//! - `simd`: SIMD accelerated UTF-8 validation through `simdutf8`.
//!
//! # Compression Support
//! permessage-deflate is implemented with:
//!
//! - Context takeover for both client and server, backed by a per-direction
//!   history window used as a preset dictionary
//! - Window sizes from 8 to 15 bits
//! - Per-message compression without context takeover using pooled deflate streams
//! - A size threshold below which messages are sent uncompressed
//!
//! # Example
//! ```no_run
//! use sluice::{Handler, Message, Negotiation, Options, Role, WebSocket};
//! use tokio::net::TcpStream;
//!
//! struct Echo;
//!
//! impl Handler<TcpStream> for Echo {
//!     async fn on_message(&self, socket: &WebSocket<TcpStream>, message: Message) {
//!         if message.opcode.is_data() {
//!             let _ = socket.write_message(message.opcode, &message.payload).await;
//!         }
//!     }
//! }
//!
//! async fn serve(stream: TcpStream) -> sluice::Result<()> {
//!     // the HTTP upgrade has already been performed on `stream`
//!     let socket = WebSocket::new(Role::Server, stream, Negotiation::default(), Options::default())?;
//!     socket.read_loop(Echo).await;
//!     Ok(())
//! }
//! ```
//!
//! # Memory
//! - Frame buffers come from a process-wide slab pool with room for the frame
//!   header in front of the payload, so frames are written with a single copy
//! - The read window has an explicit size and only grows by swapping slabs
//! - Incoming messages are capped (16 MiB by default), including after inflation

#![cfg_attr(docsrs, feature(doc_cfg))]

mod broadcast;
pub mod close;
pub mod codec;
pub mod compression;
pub mod frame;
pub mod handshake;
pub mod history;
pub mod mask;
pub mod pool;
pub mod reader;
mod socket;

use thiserror::Error;

pub use broadcast::Broadcaster;
pub use close::{CloseCode, CloseFrame};
pub use compression::PermessageDeflate;
pub use frame::{Message, OpCode};
pub use socket::*;

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Represents errors that can occur during WebSocket operations.
///
/// The errors are broadly categorized into:
///
/// - Protocol errors (invalid frames, incorrect sequence of frames), answered with close code 1002
/// - Data validation errors (invalid UTF-8, oversized messages), answered with 1007 and 1009
/// - Compression errors
/// - Connection and I/O errors, for which no Close frame is sent
///
/// See [`WebSocketError::close_code`] for the exact mapping.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// Occurs when a new Text or Binary frame arrives while a fragmented
    /// message is still being assembled.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// Occurs when receiving a continuation frame without a preceding initial frame.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// Indicates that reserved bits in the frame header are set when they
    /// should be 0: `rsv2`, `rsv3`, or `rsv1` outside the first frame of a
    /// compressed message.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// Indicates receipt of a frame with an opcode outside the defined set.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// A control frame was fragmented or carried more than 125 bytes.
    #[error("Control frame too large or fragmented")]
    ControlFrameTooLarge,

    /// A server received an unmasked frame.
    #[error("Frame from client is not masked")]
    MaskRequired,

    /// A client received a masked frame.
    #[error("Frame from server is masked")]
    UnexpectedMask,

    /// A frame had `rsv1` set but permessage-deflate was not negotiated.
    #[error("Compressed frame without negotiated compression")]
    CompressionNotSupported,

    /// The declared payload length cannot be represented or exceeds a frame limit.
    #[error("Frame too large")]
    FrameTooLarge,

    /// Indicates that a text frame or close frame reason contains invalid UTF-8 data.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// A Close frame carried a one-byte payload.
    #[error("Close payload too small")]
    ClosePayloadTooSmall,

    /// A Close frame carried a status code that may not appear on the wire.
    #[error("Invalid close code {0}")]
    InvalidCloseCode(u16),

    /// An assembled message, after decompression, exceeded the configured limit.
    #[error("Message too large")]
    MessageTooLarge,

    /// The deflate stream did not end with the sync-flush tail, or continued
    /// after a final block.
    #[error("Unexpected deflate stream")]
    UnexpectedFlateStream,

    /// The compression library failed.
    #[error("{0}")]
    Deflate(String),

    /// Window bits outside 8-15.
    #[error("Invalid window bits {0}")]
    InvalidWindowBits(u8),

    /// A `Sec-WebSocket-Extensions` value could not be used.
    #[error("Invalid extension: {0}")]
    InvalidExtension(String),

    /// An option is out of range.
    #[error("Invalid option: {0}")]
    InvalidOption(&'static str),

    /// The peer sent a Close frame.
    #[error("Connection closed by peer ({0})")]
    Closed(CloseFrame),

    /// Returned when attempting to perform operations on a closed (or closing)
    /// connection, and reported when the connection was closed locally.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// A read or write deadline expired.
    #[error("Timeout")]
    Timeout,

    /// Wraps standard I/O errors that occur during WebSocket communication.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl WebSocketError {
    /// Close code sent to the peer when this error tears the connection down.
    ///
    /// `None` means no Close frame is sent: the transport is gone, the peer
    /// already closed, or the connection was closed locally.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Self::InvalidFragment
            | Self::InvalidContinuationFrame
            | Self::ReservedBitsNotZero
            | Self::InvalidOpCode(_)
            | Self::ControlFrameTooLarge
            | Self::MaskRequired
            | Self::UnexpectedMask
            | Self::CompressionNotSupported
            | Self::FrameTooLarge
            | Self::ClosePayloadTooSmall
            | Self::InvalidCloseCode(_)
            | Self::UnexpectedFlateStream
            | Self::Deflate(_) => Some(CloseCode::Protocol),
            Self::InvalidUTF8 => Some(CloseCode::Invalid),
            Self::MessageTooLarge => Some(CloseCode::Size),
            Self::InvalidWindowBits(_)
            | Self::InvalidExtension(_)
            | Self::InvalidOption(_)
            | Self::Closed(_)
            | Self::ConnectionClosed
            | Self::Timeout
            | Self::IoError(_) => None,
        }
    }

    /// Close code that ended the connection, whichever side sent it.
    ///
    /// For [`Closed`](Self::Closed) this is the peer's code, so both ends of a
    /// connection torn down for invalid UTF-8 report [`CloseCode::Invalid`].
    pub fn status_code(&self) -> Option<CloseCode> {
        match self {
            Self::Closed(frame) => frame.code,
            _ => self.close_code(),
        }
    }

    /// Returns `true` for a clean shutdown: a local close, or a peer Close
    /// with code 1000, 1001 or no code.
    pub fn is_clean_close(&self) -> bool {
        match self {
            Self::Closed(frame) => frame.is_normal(),
            Self::ConnectionClosed => true,
            _ => false,
        }
    }
}
