use bytes::Bytes;
use tokio::io::AsyncReadExt;

use crate::{
    close::CloseFrame,
    compression::Decompressor,
    frame::{FrameHeader, Message, OpCode, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE},
    mask::{apply_mask, apply_mask_at},
    pool,
    reader::FixedReader,
    Result, WebSocketError,
};

#[cfg(feature = "simd")]
use simdutf8::compat::from_utf8;
#[cfg(not(feature = "simd"))]
use std::str::from_utf8;

use super::{options::ParseMode, Role};

/// What the read side produced from one or more frames.
#[derive(Debug)]
pub(crate) enum Event {
    /// A complete data message, a Ping or a Pong.
    Message(Message),
    /// A valid Close frame.
    Close(CloseFrame),
}

/// Assembly state of data messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Text,
    Binary,
}

/// Validates frames against the protocol rules and turns data frames into
/// messages.
///
/// Control frames are handled immediately and never disturb an in-progress
/// message.
pub(crate) struct Assembler {
    role: Role,
    state: State,
    /// The message being assembled is compressed.
    compressed: bool,
    decompressor: Option<Decompressor>,
    buf: Vec<u8>,
    /// Length of the prefix of `buf` known to be valid UTF-8.
    checked: usize,
    /// Wire bytes of the current message.
    received: u64,
    max_message: usize,
    check_utf8: bool,
}

impl Assembler {
    pub fn new(
        role: Role,
        decompressor: Option<Decompressor>,
        max_message: usize,
        check_utf8: bool,
    ) -> Self {
        Self {
            role,
            state: State::Idle,
            compressed: false,
            decompressor,
            buf: Vec::new(),
            checked: 0,
            received: 0,
            max_message,
            check_utf8,
        }
    }

    /// Checks a header before its payload is read.
    pub fn check_header(&self, header: &FrameHeader) -> Result<()> {
        if header.rsv2 || header.rsv3 {
            return Err(WebSocketError::ReservedBitsNotZero);
        }

        match (self.role, header.mask.is_some()) {
            (Role::Server, false) => return Err(WebSocketError::MaskRequired),
            (Role::Client, true) => return Err(WebSocketError::UnexpectedMask),
            _ => {}
        }

        if header.opcode.is_control() {
            if !header.fin || header.payload_len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(WebSocketError::ControlFrameTooLarge);
            }
            if header.rsv1 {
                return Err(WebSocketError::ReservedBitsNotZero);
            }
            return Ok(());
        }

        match (self.state, header.opcode) {
            (State::Idle, OpCode::Continuation) => {
                return Err(WebSocketError::InvalidContinuationFrame)
            }
            (State::Text | State::Binary, OpCode::Text | OpCode::Binary) => {
                return Err(WebSocketError::InvalidFragment)
            }
            _ => {}
        }

        if header.rsv1 {
            if header.opcode == OpCode::Continuation {
                return Err(WebSocketError::ReservedBitsNotZero);
            }
            if self.decompressor.is_none() {
                return Err(WebSocketError::CompressionNotSupported);
            }
        }

        // the cap applies to wire bytes before any payload is read
        if self.max_message > 0 {
            let (pending, compressed) = match header.opcode {
                OpCode::Continuation => (self.received, self.compressed),
                _ => (0, header.rsv1),
            };
            if pending.saturating_add(header.payload_len) > self.wire_limit(compressed) {
                return Err(WebSocketError::MessageTooLarge);
            }
        }

        Ok(())
    }

    /// Largest number of wire bytes a message may take.
    ///
    /// Stored deflate blocks add five bytes per 64 KiB, so compressed
    /// messages get a little slack over the inflated cap.
    fn wire_limit(&self, compressed: bool) -> u64 {
        let max = self.max_message as u64;
        if compressed {
            max.saturating_add(max / 1024 + 64)
        } else {
            max
        }
    }

    /// Processes one demasked frame that passed [`check_header`](Self::check_header).
    pub fn on_frame(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<Option<Event>> {
        match header.opcode {
            OpCode::Ping => return Ok(Some(Event::Message(Message::ping(Bytes::copy_from_slice(payload))))),
            OpCode::Pong => return Ok(Some(Event::Message(Message::pong(Bytes::copy_from_slice(payload))))),
            OpCode::Close => return Ok(Some(Event::Close(CloseFrame::parse(payload)?))),
            OpCode::Text | OpCode::Binary | OpCode::Continuation => {}
        }

        self.begin_frame(header)?;
        self.on_data(payload)?;
        self.end_frame(header)
    }

    /// Starts a data frame whose payload is fed in pieces through
    /// [`on_data`](Self::on_data).
    pub fn begin_frame(&mut self, header: &FrameHeader) -> Result<()> {
        match header.opcode {
            OpCode::Text | OpCode::Binary => self.start(header),
            _ => Ok(()),
        }
    }

    /// Appends demasked payload bytes of the current data frame.
    pub fn on_data(&mut self, data: &[u8]) -> Result<()> {
        self.received += data.len() as u64;
        if self.compressed {
            if let Some(decompressor) = &mut self.decompressor {
                decompressor.decompress(data, &mut self.buf, self.max_message)?;
            }
        } else {
            self.buf.extend_from_slice(data);
        }
        self.validate_utf8(false)
    }

    /// Ends the current data frame, returning the message after the final one.
    pub fn end_frame(&mut self, header: &FrameHeader) -> Result<Option<Event>> {
        if !header.fin {
            return Ok(None);
        }

        if self.compressed {
            if let Some(decompressor) = &mut self.decompressor {
                decompressor.finish(&mut self.buf, self.max_message)?;
            }
        }
        self.validate_utf8(true)?;

        let opcode = match self.state {
            State::Text => OpCode::Text,
            _ => OpCode::Binary,
        };
        self.state = State::Idle;
        self.compressed = false;
        self.checked = 0;
        self.received = 0;

        let payload = Bytes::from(std::mem::take(&mut self.buf));
        Ok(Some(Event::Message(Message::new(opcode, payload))))
    }

    fn start(&mut self, header: &FrameHeader) -> Result<()> {
        self.state = if header.opcode == OpCode::Text {
            State::Text
        } else {
            State::Binary
        };
        self.compressed = header.rsv1;
        self.buf.clear();
        self.checked = 0;
        self.received = 0;

        if self.compressed {
            if let Some(decompressor) = &mut self.decompressor {
                decompressor.begin()?;
            }
        }
        Ok(())
    }

    /// Validates the bytes appended since the last call. An incomplete
    /// trailing sequence is tolerated until the message is complete.
    fn validate_utf8(&mut self, complete: bool) -> Result<()> {
        if self.state != State::Text || !self.check_utf8 {
            return Ok(());
        }

        match from_utf8(&self.buf[self.checked..]) {
            Ok(_) => self.checked = self.buf.len(),
            Err(err) => {
                if complete || err.error_len().is_some() {
                    return Err(WebSocketError::InvalidUTF8);
                }
                self.checked += err.valid_up_to();
            }
        }
        Ok(())
    }
}

/// Largest payload read as a whole into one pooled slab. Larger frames are
/// fed to the assembler as their bytes arrive.
const MAX_BUFFERED_FRAME: usize = pool::BUCKETS * 1024;

/// The read side of a connection: the fixed reader plus the assembler.
pub(crate) struct ReadHalf<S> {
    reader: FixedReader<tokio::io::ReadHalf<S>>,
    mode: ParseMode,
    /// Slab length of the initial window; the window shrinks back to it after
    /// a large frame.
    window: usize,
    assembler: Assembler,
}

impl<S> ReadHalf<S>
where
    S: tokio::io::AsyncRead + Unpin,
{
    pub fn new(
        stream: tokio::io::ReadHalf<S>,
        leftover: &[u8],
        window: usize,
        mode: ParseMode,
        assembler: Assembler,
    ) -> Self {
        let slab = pool::get(window);
        let window = slab.len();
        Self {
            reader: FixedReader::with_leftover(stream, slab, leftover),
            mode,
            window,
            assembler,
        }
    }

    /// Reads frames until one produces an event.
    pub async fn next_event(&mut self) -> Result<Event> {
        loop {
            let header = self.read_header().await?;
            self.assembler.check_header(&header)?;
            let len = header.payload_size()?;

            let event = match self.mode {
                _ if len > MAX_BUFFERED_FRAME => self.read_in_pieces(&header, len).await?,
                ParseMode::Window => self.read_in_window(&header, len).await?,
                ParseMode::Bufio => self.read_in_slab(&header, len).await?,
            };

            if let Some(event) = event {
                return Ok(event);
            }
        }
    }

    async fn read_header(&mut self) -> Result<FrameHeader> {
        self.reader.fill(2).await?;
        let prefix = self.reader.buffered();
        let head_len = FrameHeader::head_len([prefix[0], prefix[1]]);
        self.reader.fill(head_len).await?;

        let (header, used) =
            FrameHeader::decode(self.reader.buffered())?.ok_or(WebSocketError::FrameTooLarge)?;
        self.reader.consume(used);
        Ok(header)
    }

    async fn read_in_window(&mut self, header: &FrameHeader, len: usize) -> Result<Option<Event>> {
        if len > self.reader.capacity() {
            let small = self.reader.reset(pool::get(len));
            pool::put(small);
        }

        self.reader.fill(len).await?;
        let payload = &mut self.reader.buffered_mut()[..len];
        if let Some(mask) = header.mask {
            apply_mask(payload, mask);
        }
        let event = self.assembler.on_frame(header, payload);
        self.reader.consume(len);

        if self.reader.capacity() > self.window && self.reader.buffered_len() <= self.window - MAX_HEAD_SIZE {
            let large = self.reader.reset(pool::get(self.window - MAX_HEAD_SIZE));
            pool::put(large);
        }

        event
    }

    async fn read_in_slab(&mut self, header: &FrameHeader, len: usize) -> Result<Option<Event>> {
        let mut slab = pool::get(len);
        let res = self.reader.read_exact(&mut slab[..len]).await;
        if let Err(err) = res {
            pool::put(slab);
            return Err(err.into());
        }

        let payload = &mut slab[..len];
        if let Some(mask) = header.mask {
            apply_mask(payload, mask);
        }
        let event = self.assembler.on_frame(header, payload);
        pool::put(slab);

        event
    }

    async fn read_in_pieces(&mut self, header: &FrameHeader, len: usize) -> Result<Option<Event>> {
        self.assembler.begin_frame(header)?;

        let mut offset = 0;
        while offset < len {
            if self.reader.buffered_len() == 0 {
                self.reader.fill(1).await?;
            }
            let n = self.reader.buffered_len().min(len - offset);
            let piece = &mut self.reader.buffered_mut()[..n];
            if let Some(mask) = header.mask {
                apply_mask_at(piece, mask, offset);
            }
            let res = self.assembler.on_data(piece);
            self.reader.consume(n);
            res?;
            offset += n;
        }

        self.assembler.end_frame(header)
    }
}
