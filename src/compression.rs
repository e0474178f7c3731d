//! permessage-deflate (RFC 7692): extension negotiation and the per-message
//! deflate engine.
//!
//! Outgoing messages are compressed with a sync flush and the trailing
//! `00 00 FF FF` is stripped; incoming messages get the tail appended back
//! before they are inflated.
//!
//! Context takeover is implemented with a [`HistoryDict`] per direction: the
//! deflate state is reset before every message and primed with the window of
//! previously sent (or received) uncompressed bytes. Without context takeover
//! the deflate state is borrowed from a process-wide pool for the duration of
//! a single message.
use std::{
    collections::HashMap,
    sync::{Mutex, OnceLock},
};

use flate2::{Compress, CompressError, Decompress, DecompressError, FlushCompress, FlushDecompress, Status};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, digit1, space0},
    combinator::opt,
    sequence::{delimited, preceded},
    IResult, Parser,
};

use crate::{history::HistoryDict, CompressionLevel, DeflateOptions, Result, Role, WebSocketError};

/// Extension token.
pub const PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// Bytes every sync flush ends with; stripped from outgoing payloads.
pub const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Appended to incoming payloads: the stripped tail plus an empty final
/// stored block, so the inflater drains every pending byte.
const INFLATE_TAIL: [u8; 9] = [0x00, 0x00, 0xff, 0xff, 0x01, 0x00, 0x00, 0xff, 0xff];

pub const MIN_WINDOW_BITS: u8 = 8;
pub const MAX_WINDOW_BITS: u8 = 15;

/// Smallest window the deflate backend can produce a raw stream for.
const MIN_DEFLATE_WINDOW_BITS: u8 = 9;

/// Per-key bound on pooled no-context-takeover streams.
const POOL_DEPTH: usize = 64;

/// Parameters of one permessage-deflate extension offer or response.
///
/// `None` window bits mean the parameter is absent. A bare
/// `client_max_window_bits` in a client offer is stored as `Some(15)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PermessageDeflate {
    pub client_no_context_takeover: bool,
    pub server_no_context_takeover: bool,
    pub client_max_window_bits: Option<u8>,
    pub server_max_window_bits: Option<u8>,
}

/// Effective settings of one direction of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Direction {
    pub context_takeover: bool,
    pub window_bits: u8,
}

impl PermessageDeflate {
    /// Builds the offer a client sends from its options.
    ///
    /// `client_max_window_bits` is always included so the server may restrict
    /// the client's window.
    pub fn offer(options: &DeflateOptions) -> Self {
        Self {
            client_no_context_takeover: !options.client_context_takeover,
            server_no_context_takeover: !options.server_context_takeover,
            client_max_window_bits: Some(options.client_max_window_bits),
            server_max_window_bits: (options.server_max_window_bits < MAX_WINDOW_BITS)
                .then_some(options.server_max_window_bits),
        }
    }

    /// Server side: picks the first acceptable offer of a
    /// `Sec-WebSocket-Extensions` request header and returns the agreed
    /// parameters, to be echoed back with `Display`.
    ///
    /// Returns `None` when the client did not offer permessage-deflate in a
    /// form we understand, in which case the extension is simply not used.
    pub fn negotiate(options: &DeflateOptions, header: &str) -> Option<Self> {
        if !options.decompression {
            return None;
        }

        let offer = Self::parse_offers(header).into_iter().next()?;
        let agreed = options.negotiate(&offer);

        #[cfg(feature = "logging")]
        log::debug!("permessage-deflate offer={offer} agreed={agreed}");

        Some(agreed)
    }

    /// Client side: validates the server's response to our [`offer`](Self::offer).
    pub fn accept_response(options: &DeflateOptions, header: &str) -> Result<Self> {
        let response: Self = header.trim().parse()?;
        let offer = Self::offer(options);

        if offer.server_no_context_takeover && !response.server_no_context_takeover {
            return Err(WebSocketError::InvalidExtension(
                "server_no_context_takeover was requested but not granted".into(),
            ));
        }
        if let Some(requested) = offer.server_max_window_bits {
            match response.server_max_window_bits {
                Some(bits) if bits <= requested => {}
                _ => {
                    return Err(WebSocketError::InvalidExtension(format!(
                        "server_max_window_bits={requested} was requested but not granted"
                    )))
                }
            }
        }

        #[cfg(feature = "logging")]
        log::debug!("permessage-deflate accepted {response}");

        Ok(response)
    }

    /// Parses every permessage-deflate offer of a header value, in order,
    /// skipping other extensions and offers with invalid parameters.
    pub fn parse_offers(header: &str) -> Vec<Self> {
        header
            .split(',')
            .filter_map(|offer| offer.trim().parse().ok())
            .collect()
    }

    /// Settings used by `role` for the messages it sends.
    pub fn sender(&self, role: Role) -> Direction {
        match role {
            Role::Server => Direction {
                context_takeover: !self.server_no_context_takeover,
                window_bits: self.server_max_window_bits.unwrap_or(MAX_WINDOW_BITS),
            },
            Role::Client => Direction {
                context_takeover: !self.client_no_context_takeover,
                window_bits: self.client_max_window_bits.unwrap_or(MAX_WINDOW_BITS),
            },
        }
    }

    /// Settings used by `role` for the messages it receives.
    pub fn receiver(&self, role: Role) -> Direction {
        match role {
            Role::Server => self.sender(Role::Client),
            Role::Client => self.sender(Role::Server),
        }
    }

    fn parse(input: &str) -> Result<Self> {
        let invalid = || WebSocketError::InvalidExtension(input.to_owned());

        let (mut rest, _) = tag::<_, _, nom::error::Error<&str>>(PERMESSAGE_DEFLATE)
            .parse(input)
            .map_err(|_| invalid())?;

        let mut this = Self::default();
        let mut seen = Vec::with_capacity(4);
        while !rest.trim_end().is_empty() {
            let (remaining, (key, value)) = parameter(rest).map_err(|_| invalid())?;
            if seen.contains(&key) {
                return Err(invalid());
            }
            seen.push(key);

            match (key, value) {
                ("client_no_context_takeover", None) => this.client_no_context_takeover = true,
                ("server_no_context_takeover", None) => this.server_no_context_takeover = true,
                ("client_max_window_bits", None) => {
                    this.client_max_window_bits = Some(MAX_WINDOW_BITS)
                }
                ("client_max_window_bits", Some(value)) => {
                    this.client_max_window_bits = Some(window_bits(value)?)
                }
                ("server_max_window_bits", Some(value)) => {
                    this.server_max_window_bits = Some(window_bits(value)?)
                }
                _ => return Err(invalid()),
            }

            rest = remaining;
        }

        Ok(this)
    }
}

/// `; key` or `; key=value`, where value may be quoted.
fn parameter(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    preceded(
        (space0, char(';'), space0),
        (
            take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
            opt(preceded(
                (space0, char('='), space0),
                alt((digit1, delimited(char('"'), digit1, char('"')))),
            )),
        ),
    )
    .parse(input)
}

fn window_bits(value: &str) -> Result<u8> {
    let bits: u8 = value
        .parse()
        .map_err(|_| WebSocketError::InvalidExtension(format!("window bits {value}")))?;
    if !(MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&bits) {
        return Err(WebSocketError::InvalidWindowBits(bits));
    }
    Ok(bits)
}

impl std::str::FromStr for PermessageDeflate {
    type Err = WebSocketError;

    fn from_str(input: &str) -> Result<Self> {
        Self::parse(input)
    }
}

impl std::fmt::Display for PermessageDeflate {
    /// Formats the parameters as a `Sec-WebSocket-Extensions` value.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{PERMESSAGE_DEFLATE}")?;

        if self.client_no_context_takeover {
            write!(f, "; client_no_context_takeover")?;
        }
        if self.server_no_context_takeover {
            write!(f, "; server_no_context_takeover")?;
        }
        if let Some(bits) = self.client_max_window_bits.filter(|&bits| bits != 0) {
            write!(f, "; client_max_window_bits={bits}")?;
        }
        if let Some(bits) = self.server_max_window_bits.filter(|&bits| bits != 0) {
            write!(f, "; server_max_window_bits={bits}")?;
        }

        Ok(())
    }
}

fn deflate_error(err: CompressError) -> WebSocketError {
    WebSocketError::Deflate(format!("compression error: {err}"))
}

fn inflate_error(err: DecompressError) -> WebSocketError {
    WebSocketError::Deflate(format!("decompression error: {err}"))
}

type DeflatePool = Mutex<HashMap<(u32, u8), Vec<Compress>>>;

fn deflate_pool() -> &'static DeflatePool {
    static POOL: OnceLock<DeflatePool> = OnceLock::new();
    POOL.get_or_init(Default::default)
}

fn inflate_pool() -> &'static Mutex<Vec<Decompress>> {
    static POOL: OnceLock<Mutex<Vec<Decompress>>> = OnceLock::new();
    POOL.get_or_init(Default::default)
}

fn take_deflate(level: CompressionLevel, window_bits: u8) -> Compress {
    let pooled = deflate_pool()
        .lock()
        .ok()
        .and_then(|mut pool| pool.get_mut(&(level.level(), window_bits))?.pop());

    match pooled {
        Some(mut deflate) => {
            deflate.reset();
            deflate
        }
        None => Compress::new_with_window_bits(level, false, window_bits),
    }
}

fn give_deflate(level: CompressionLevel, window_bits: u8, deflate: Compress) {
    if let Ok(mut pool) = deflate_pool().lock() {
        let streams = pool.entry((level.level(), window_bits)).or_default();
        if streams.len() < POOL_DEPTH {
            streams.push(deflate);
        }
    }
}

fn take_inflate() -> Decompress {
    let pooled = inflate_pool().lock().ok().and_then(|mut pool| pool.pop());
    match pooled {
        Some(mut inflate) => {
            inflate.reset(false);
            inflate
        }
        None => Decompress::new_with_window_bits(false, MAX_WINDOW_BITS),
    }
}

fn give_inflate(inflate: Decompress) {
    if let Ok(mut pool) = inflate_pool().lock() {
        if pool.len() < POOL_DEPTH {
            pool.push(inflate);
        }
    }
}

/// Compresses `input` as one sync-flushed deflate block sequence and appends
/// it to `out` with the trailing `00 00 FF FF` removed.
fn deflate_into(deflate: &mut Compress, mut input: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let start = out.len();

    loop {
        out.reserve((input.len() / 2).max(256));
        let before = deflate.total_in();
        deflate
            .compress_vec(input, out, FlushCompress::Sync)
            .map_err(deflate_error)?;
        input = &input[(deflate.total_in() - before) as usize..];

        // spare capacity left means the flush completed
        if input.is_empty() && out.len() < out.capacity() {
            break;
        }
    }

    if !out[start..].ends_with(&DEFLATE_TAIL) {
        return Err(WebSocketError::UnexpectedFlateStream);
    }
    out.truncate(out.len() - DEFLATE_TAIL.len());

    Ok(())
}

/// Inflates `input` into `out`. `limit` bounds `out.len()` (`0` for none).
///
/// Returns `true` once the stream signalled its end.
fn inflate_into(
    inflate: &mut Decompress,
    mut input: &[u8],
    out: &mut Vec<u8>,
    limit: usize,
) -> Result<bool> {
    loop {
        if out.len() == out.capacity() {
            let mut grow = (input.len() * 2).max(1024);
            if limit > 0 {
                grow = grow.min(limit.saturating_sub(out.len()) + 1);
            }
            out.reserve(grow);
        }

        let before_in = inflate.total_in();
        let before_out = inflate.total_out();
        let status = inflate
            .decompress_vec(input, out, FlushDecompress::Sync)
            .map_err(inflate_error)?;
        let consumed = (inflate.total_in() - before_in) as usize;
        let produced = (inflate.total_out() - before_out) as usize;
        input = &input[consumed..];

        if limit > 0 && out.len() > limit {
            return Err(WebSocketError::MessageTooLarge);
        }

        match status {
            Status::StreamEnd => return Ok(true),
            _ if out.len() < out.capacity() && (input.is_empty() || consumed + produced == 0) => {
                return Ok(false)
            }
            _ => {}
        }
    }
}

enum Deflater {
    Contextual {
        deflate: Box<Compress>,
        history: HistoryDict,
    },
    NoContextTakeover,
}

/// Compressor for one sending direction.
pub struct Compressor {
    level: CompressionLevel,
    window_bits: u8,
    deflater: Deflater,
}

impl Compressor {
    /// Creates a compressor for a direction.
    ///
    /// Returns `None` for an 8-bit window: the deflate backend cannot bound a
    /// raw stream to 256 bytes, so such a direction sends uncompressed.
    pub fn new(level: CompressionLevel, direction: Direction) -> Option<Self> {
        if direction.window_bits < MIN_DEFLATE_WINDOW_BITS {
            #[cfg(feature = "logging")]
            log::debug!("sending window of {} bits, compression disabled", direction.window_bits);
            return None;
        }

        let deflater = if direction.context_takeover {
            Deflater::Contextual {
                deflate: Box::new(Compress::new_with_window_bits(
                    level,
                    false,
                    direction.window_bits,
                )),
                history: HistoryDict::new(direction.window_bits),
            }
        } else {
            Deflater::NoContextTakeover
        };

        Some(Self {
            level,
            window_bits: direction.window_bits,
            deflater,
        })
    }

    /// Compresses one whole message and appends the payload to `out`.
    pub fn compress(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        match &mut self.deflater {
            Deflater::Contextual { deflate, history } => {
                deflate.reset();
                if !history.is_empty() {
                    deflate.set_dictionary(history.get()).map_err(deflate_error)?;
                }
                deflate_into(&mut **deflate, input, out)?;
                history.write(input);
                Ok(())
            }
            Deflater::NoContextTakeover => compress_message(self.level, self.window_bits, input, out),
        }
    }

    pub fn context_takeover(&self) -> bool {
        matches!(self.deflater, Deflater::Contextual { .. })
    }
}

/// Compresses a message with a fresh deflate stream borrowed from the
/// process-wide pool.
pub fn compress_message(
    level: CompressionLevel,
    window_bits: u8,
    input: &[u8],
    out: &mut Vec<u8>,
) -> Result<()> {
    let mut deflate = take_deflate(level, window_bits);
    let res = deflate_into(&mut deflate, input, out);
    give_deflate(level, window_bits, deflate);
    res
}

enum Inflater {
    Contextual {
        inflate: Box<Decompress>,
        history: HistoryDict,
    },
    NoContextTakeover(Option<Decompress>),
}

/// Decompressor for one receiving direction.
///
/// A compressed message is inflated fragment by fragment: [`begin`](Self::begin)
/// on its first frame, [`decompress`](Self::decompress) for every frame, and
/// [`finish`](Self::finish) after the final one.
pub struct Decompressor {
    inflater: Inflater,
    ended: bool,
}

impl Decompressor {
    pub fn new(direction: Direction) -> Self {
        let inflater = if direction.context_takeover {
            Inflater::Contextual {
                inflate: Box::new(Decompress::new_with_window_bits(false, MAX_WINDOW_BITS)),
                history: HistoryDict::new(direction.window_bits),
            }
        } else {
            Inflater::NoContextTakeover(None)
        };

        Self {
            inflater,
            ended: false,
        }
    }

    /// Prepares the inflater for a new message.
    pub fn begin(&mut self) -> Result<()> {
        self.ended = false;
        match &mut self.inflater {
            Inflater::Contextual { inflate, history } => {
                inflate.reset(false);
                if !history.is_empty() {
                    inflate.set_dictionary(history.get()).map_err(inflate_error)?;
                }
            }
            Inflater::NoContextTakeover(slot) => match slot {
                Some(inflate) => inflate.reset(false),
                None => *slot = Some(take_inflate()),
            },
        }
        Ok(())
    }

    /// Inflates one fragment of the current message into `out`.
    pub fn decompress(&mut self, input: &[u8], out: &mut Vec<u8>, limit: usize) -> Result<()> {
        if self.ended {
            // data after a final deflate block
            return if input.is_empty() {
                Ok(())
            } else {
                Err(WebSocketError::UnexpectedFlateStream)
            };
        }
        let inflate = self.stream()?;
        self.ended = inflate_into(inflate, input, out, limit)?;
        Ok(())
    }

    /// Completes the current message. `out` must hold exactly the message
    /// inflated so far; it is recorded as history when context takeover applies.
    pub fn finish(&mut self, out: &mut Vec<u8>, limit: usize) -> Result<()> {
        if !self.ended {
            let inflate = self.stream()?;
            inflate_into(inflate, &INFLATE_TAIL, out, limit)?;
        }

        match &mut self.inflater {
            Inflater::Contextual { history, .. } => history.write(out),
            Inflater::NoContextTakeover(slot) => {
                if let Some(inflate) = slot.take() {
                    give_inflate(inflate);
                }
            }
        }
        Ok(())
    }

    /// Inflates a complete single-frame message.
    pub fn decompress_message(&mut self, input: &[u8], limit: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(input.len() * 2);
        self.begin()?;
        self.decompress(input, &mut out, limit)?;
        self.finish(&mut out, limit)?;
        Ok(out)
    }

    fn stream(&mut self) -> Result<&mut Decompress> {
        match &mut self.inflater {
            Inflater::Contextual { inflate, .. } => Ok(&mut **inflate),
            Inflater::NoContextTakeover(Some(inflate)) => Ok(inflate),
            Inflater::NoContextTakeover(None) => Err(WebSocketError::UnexpectedFlateStream),
        }
    }
}
