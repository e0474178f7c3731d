use std::time::Duration;

use crate::{
    compression::{PermessageDeflate, MAX_WINDOW_BITS, MIN_WINDOW_BITS},
    Result, WebSocketError,
};

/// Compression level type, re-exported from `flate2`.
pub type CompressionLevel = flate2::Compression;

/// Default cap on an assembled incoming message: 16 MiB.
pub const MAX_READ_MESSAGE: usize = 16 * 1024 * 1024;

/// Default size of the read window: 4 KiB.
pub const READ_BUFFER_SIZE: usize = 4 * 1024;

/// Smallest read window ever allocated.
const MIN_READ_BUFFER_SIZE: usize = 1024;

/// How incoming frame payloads are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseMode {
    /// Payloads are processed in place inside the read window, which is
    /// swapped for a larger pool slab when a frame does not fit.
    #[default]
    Window,
    /// Payloads are copied out of a small window into a separate pool slab
    /// sized to the frame.
    Bufio,
}

/// Configuration options for a WebSocket connection.
///
/// `Options` governs the behavior of a connection: message size limits, read
/// window sizing, compression, write coalescing and UTF-8 validation.
#[derive(Debug, Clone)]
pub struct Options {
    /// Answer every Ping with a Pong carrying the same payload.
    ///
    /// Default: `true`
    pub auto_reply_ping: bool,

    /// Drop received Pongs instead of passing them to the handler.
    ///
    /// Default: `false`
    pub ignore_pong: bool,

    /// Maximum size of an assembled incoming message, after decompression.
    /// `0` disables the limit.
    ///
    /// Default: 16 MiB as defined in [`MAX_READ_MESSAGE`]
    pub read_max_message: usize,

    /// Longest time to wait for the next incoming message. `None` waits forever.
    pub read_timeout: Option<Duration>,

    /// Base size of the read window.
    ///
    /// Default: 4 KiB as defined in [`READ_BUFFER_SIZE`]
    pub read_buffer_size: usize,

    /// Scales `read_buffer_size` to obtain the initial read window. Must be at least 1.0.
    pub window_payload_multiplier: f32,

    pub parse_mode: ParseMode,

    /// permessage-deflate settings; `None` means the extension is neither
    /// offered nor accepted.
    pub compression: Option<DeflateOptions>,

    /// Number of frames queued by delayed writes that triggers a flush.
    ///
    /// Default: 10
    pub max_delay_write_num: usize,

    /// Longest time a frame queued by a delayed write may wait.
    ///
    /// Default: 500 ms
    pub max_delay_write_duration: Duration,

    /// Initial capacity of the delayed-write buffer.
    pub delay_write_init_buffer_size: usize,

    /// Validate that Text messages are UTF-8. Close reasons are always validated.
    ///
    /// Default: `true`
    pub check_utf8: bool,

    /// Subprotocols in order of preference.
    pub subprotocols: Vec<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            auto_reply_ping: true,
            ignore_pong: false,
            read_max_message: MAX_READ_MESSAGE,
            read_timeout: None,
            read_buffer_size: READ_BUFFER_SIZE,
            window_payload_multiplier: 1.0,
            parse_mode: ParseMode::Window,
            compression: None,
            max_delay_write_num: 10,
            max_delay_write_duration: Duration::from_millis(500),
            delay_write_init_buffer_size: 4 * 1024,
            check_utf8: true,
            subprotocols: Vec::new(),
        }
    }
}

/// Configuration options for permessage-deflate (RFC 7692).
///
/// # Context Management
///
/// - **Context Takeover** (default): the sliding window is kept across
///   messages of a direction, giving better ratios on similar messages.
/// - **No Context Takeover**: each message is compressed on its own and the
///   deflate state is borrowed from a shared pool only while it is in use.
///
/// # Example
/// ```
/// use sluice::{DeflateOptions, CompressionLevel};
///
/// let opts = DeflateOptions {
///     level: CompressionLevel::fast(),
///     server_context_takeover: false,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct DeflateOptions {
    /// Compression level (0-9).
    pub level: CompressionLevel,

    /// Data messages shorter than this are sent uncompressed.
    ///
    /// Default: 512 bytes
    pub compress_threshold: usize,

    /// Compress outgoing messages.
    pub compression: bool,

    /// Accept compressed incoming messages. When `false` the extension is not negotiated.
    pub decompression: bool,

    /// Keep the server's sliding window across messages.
    pub server_context_takeover: bool,

    /// Keep the client's sliding window across messages.
    pub client_context_takeover: bool,

    /// LZ77 window of the server's compressor, in bits (8-15).
    pub server_max_window_bits: u8,

    /// LZ77 window of the client's compressor, in bits (8-15).
    pub client_max_window_bits: u8,
}

impl Default for DeflateOptions {
    fn default() -> Self {
        Self {
            level: CompressionLevel::new(6),
            compress_threshold: 512,
            compression: true,
            decompression: true,
            server_context_takeover: true,
            client_context_takeover: true,
            server_max_window_bits: MAX_WINDOW_BITS,
            client_max_window_bits: MAX_WINDOW_BITS,
        }
    }
}

impl DeflateOptions {
    /// Server side: agrees on parameters for a client offer.
    ///
    /// Context-takeover restrictions from either side win, window bits are the
    /// smaller of both, and the client's window is only restricted if the
    /// client announced support for it.
    pub fn negotiate(&self, offer: &PermessageDeflate) -> PermessageDeflate {
        let server_max_window_bits = match offer.server_max_window_bits {
            Some(bits) => Some(bits.min(self.server_max_window_bits)),
            None => (self.server_max_window_bits < MAX_WINDOW_BITS)
                .then_some(self.server_max_window_bits),
        };

        PermessageDeflate {
            client_no_context_takeover: offer.client_no_context_takeover
                || !self.client_context_takeover,
            server_no_context_takeover: offer.server_no_context_takeover
                || !self.server_context_takeover,
            client_max_window_bits: offer
                .client_max_window_bits
                .map(|bits| bits.min(self.client_max_window_bits)),
            server_max_window_bits,
        }
    }

    pub fn with_level(self, level: CompressionLevel) -> Self {
        Self { level, ..self }
    }

    pub fn with_compress_threshold(self, compress_threshold: usize) -> Self {
        Self {
            compress_threshold,
            ..self
        }
    }

    pub fn with_server_context_takeover(self, server_context_takeover: bool) -> Self {
        Self {
            server_context_takeover,
            ..self
        }
    }

    pub fn with_client_context_takeover(self, client_context_takeover: bool) -> Self {
        Self {
            client_context_takeover,
            ..self
        }
    }

    pub fn with_server_max_window_bits(self, server_max_window_bits: u8) -> Self {
        Self {
            server_max_window_bits,
            ..self
        }
    }

    pub fn with_client_max_window_bits(self, client_max_window_bits: u8) -> Self {
        Self {
            client_max_window_bits,
            ..self
        }
    }

    fn validate(&self) -> Result<()> {
        for bits in [self.server_max_window_bits, self.client_max_window_bits] {
            if !(MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&bits) {
                return Err(WebSocketError::InvalidWindowBits(bits));
            }
        }
        Ok(())
    }
}

impl Options {
    /// Checks that every knob is within range.
    pub fn validate(&self) -> Result<()> {
        if let Some(compression) = &self.compression {
            compression.validate()?;
        }
        if self.max_delay_write_num == 0 {
            return Err(WebSocketError::InvalidOption("max_delay_write_num must be at least 1"));
        }
        if !(self.window_payload_multiplier >= 1.0) {
            return Err(WebSocketError::InvalidOption(
                "window_payload_multiplier must be at least 1.0",
            ));
        }
        Ok(())
    }

    /// Size of the initial read window.
    pub(crate) fn read_window(&self) -> usize {
        let size = (self.read_buffer_size as f64 * self.window_payload_multiplier as f64) as usize;
        size.max(MIN_READ_BUFFER_SIZE)
    }

    /// Enables permessage-deflate with the given settings.
    pub fn with_compression(self, compression: DeflateOptions) -> Self {
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Sets the compression level for outgoing messages, enabling compression
    /// with default settings if it was off.
    pub fn with_compression_level(self, level: CompressionLevel) -> Self {
        let compression = self.compression.clone().unwrap_or_default();
        self.with_compression(compression.with_level(level))
    }

    /// Disables compression for the WebSocket connection.
    pub fn without_compression(self) -> Self {
        Self {
            compression: None,
            ..self
        }
    }

    /// Sets the maximum size of an assembled incoming message (`0` for unbounded).
    pub fn with_read_max_message(self, read_max_message: usize) -> Self {
        Self {
            read_max_message,
            ..self
        }
    }

    pub fn with_read_timeout(self, read_timeout: Duration) -> Self {
        Self {
            read_timeout: Some(read_timeout),
            ..self
        }
    }

    pub fn with_read_buffer_size(self, read_buffer_size: usize) -> Self {
        Self {
            read_buffer_size,
            ..self
        }
    }

    pub fn with_window_payload_multiplier(self, window_payload_multiplier: f32) -> Self {
        Self {
            window_payload_multiplier,
            ..self
        }
    }

    pub fn with_parse_mode(self, parse_mode: ParseMode) -> Self {
        Self { parse_mode, ..self }
    }

    /// Leaves Pings unanswered; the application may answer them itself.
    pub fn without_auto_reply_ping(self) -> Self {
        Self {
            auto_reply_ping: false,
            ..self
        }
    }

    pub fn with_ignore_pong(self) -> Self {
        Self {
            ignore_pong: true,
            ..self
        }
    }

    /// Configures write coalescing: flush after `num` queued frames or after
    /// `duration`, whichever comes first.
    pub fn with_delay_write(self, num: usize, duration: Duration) -> Self {
        Self {
            max_delay_write_num: num,
            max_delay_write_duration: duration,
            ..self
        }
    }

    /// Disables UTF-8 validation of Text messages.
    pub fn without_utf8(self) -> Self {
        Self {
            check_utf8: false,
            ..self
        }
    }

    pub fn with_subprotocols<I, T>(self, subprotocols: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            subprotocols: subprotocols.into_iter().map(Into::into).collect(),
            ..self
        }
    }
}
