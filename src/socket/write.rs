use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Encoder as _;

use crate::{
    close::{close_payload, CloseCode},
    codec::Encoder,
    compression::Compressor,
    frame::{self, Frame, FrameHeader, OpCode, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE},
    pool, CompressionLevel, Result, WebSocketError,
};

use super::Role;

/// How a connection compresses outgoing data messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Compression {
    Off,
    /// Fresh deflate state per message; the output only depends on the payload.
    Stateless {
        level: CompressionLevel,
        window_bits: u8,
        threshold: usize,
    },
    /// Context takeover; the output depends on previously sent messages.
    Stateful,
}

/// An encoded frame inside a pool slab, spanning `slab[start..end]`.
pub(crate) struct Sealed {
    slab: Vec<u8>,
    start: usize,
    end: usize,
}

impl Sealed {
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.slab[self.start..self.end]
    }

    pub fn release(self) {
        pool::put(self.slab);
    }
}

/// The write side of a connection. Always used under the connection's write lock.
pub(crate) struct WriteHalf<S> {
    io: tokio::io::WriteHalf<S>,
    role: Role,
    compressor: Option<Compressor>,
    compression: Compression,
    threshold: usize,
    encoder: Encoder,
    /// Frames queued by delayed writes.
    delayed: BytesMut,
    delayed_count: usize,
    /// Bumped on every flush of the delayed buffer.
    generation: u64,
    close_sent: bool,
}

impl<S> WriteHalf<S>
where
    S: AsyncWrite + Unpin,
{
    pub fn new(
        io: tokio::io::WriteHalf<S>,
        role: Role,
        compressor: Option<Compressor>,
        compression: Compression,
        threshold: usize,
        delay_buffer_size: usize,
    ) -> Self {
        Self {
            io,
            role,
            compressor,
            compression,
            threshold,
            encoder: Encoder,
            delayed: BytesMut::with_capacity(delay_buffer_size),
            delayed_count: 0,
            generation: 0,
            close_sent: false,
        }
    }

    #[inline]
    pub fn compression(&self) -> Compression {
        self.compression
    }

    #[inline]
    pub fn close_sent(&self) -> bool {
        self.close_sent
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Fresh masking key for every client frame.
    fn mask_key(&self) -> Option<[u8; 4]> {
        match self.role {
            Role::Client => Some(rand::random()),
            Role::Server => None,
        }
    }

    /// Empty messages are never compressed.
    fn should_compress(&self, opcode: OpCode, len: usize) -> bool {
        self.compressor.is_some() && opcode.is_data() && len > 0 && len >= self.threshold
    }

    fn check_writable(&self, opcode: OpCode, len: usize) -> Result<()> {
        if self.close_sent {
            return Err(WebSocketError::ConnectionClosed);
        }
        if opcode.is_control() && len > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlFrameTooLarge);
        }
        if opcode == OpCode::Continuation {
            return Err(WebSocketError::InvalidContinuationFrame);
        }
        Ok(())
    }

    /// Encodes a single-frame message into a pool slab, compressing it if
    /// negotiated, and masks it for client connections.
    pub fn seal(&mut self, opcode: OpCode, payload: &[u8]) -> Result<Sealed> {
        let compress = self.should_compress(opcode, payload.len());
        let mut slab = pool::get(payload.len());

        let len = match &mut self.compressor {
            Some(compressor) if compress => {
                slab.truncate(MAX_HEAD_SIZE);
                if let Err(err) = compressor.compress(payload, &mut slab) {
                    pool::put(slab);
                    return Err(err);
                }
                slab.len() - MAX_HEAD_SIZE
            }
            _ => {
                slab[MAX_HEAD_SIZE..MAX_HEAD_SIZE + payload.len()].copy_from_slice(payload);
                payload.len()
            }
        };

        let header = FrameHeader::new(true, opcode, self.mask_key(), len).with_rsv1(compress);
        let start = frame::seal(&mut slab, &header);

        Ok(Sealed {
            slab,
            start,
            end: MAX_HEAD_SIZE + len,
        })
    }

    /// Writes one unfragmented message.
    pub async fn write_message(&mut self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        self.check_writable(opcode, payload.len())?;
        self.flush_delayed().await?;

        let sealed = self.seal(opcode, payload)?;
        let res = self.io.write_all(sealed.bytes()).await;
        sealed.release();
        res?;

        self.io.flush().await?;
        Ok(())
    }

    /// Writes bytes that already form complete frames.
    pub async fn write_raw(&mut self, frames: &[u8]) -> Result<()> {
        if self.close_sent {
            return Err(WebSocketError::ConnectionClosed);
        }
        self.flush_delayed().await?;
        self.io.write_all(frames).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Writes a message as frames of at most `chunk_size` payload bytes.
    ///
    /// The message is compressed as a whole first, so the compressed bytes are
    /// what gets split. All frames leave in one write.
    pub async fn write_fragment(
        &mut self,
        opcode: OpCode,
        payload: &[u8],
        chunk_size: usize,
    ) -> Result<()> {
        if !opcode.is_data() {
            return Err(WebSocketError::InvalidFragment);
        }
        self.check_writable(opcode, payload.len())?;
        self.flush_delayed().await?;

        let compress = self.should_compress(opcode, payload.len());
        let mut compressed = Vec::new();
        let body = match &mut self.compressor {
            Some(compressor) if compress => {
                compressor.compress(payload, &mut compressed)?;
                &compressed[..]
            }
            _ => payload,
        };

        let chunk_size = if chunk_size == 0 { body.len().max(1) } else { chunk_size };
        let count = body.len().div_ceil(chunk_size).max(1);

        let mut out = BytesMut::with_capacity(body.len() + count * MAX_HEAD_SIZE);
        for index in 0..count {
            let chunk = &body[(index * chunk_size).min(body.len())..((index + 1) * chunk_size).min(body.len())];
            let fin = index + 1 == count;
            let frame = if index == 0 {
                let mut frame = Frame::new(fin, opcode, self.mask_key(), chunk);
                frame.header.rsv1 = compress;
                frame
            } else {
                Frame::new(fin, OpCode::Continuation, self.mask_key(), chunk)
            };
            self.encoder.encode(frame, &mut out)?;
        }

        self.io.write_all(&out).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Appends a message to the coalescing buffer and returns how many frames
    /// are now queued.
    pub fn queue(&mut self, opcode: OpCode, payload: &[u8]) -> Result<usize> {
        self.check_writable(opcode, payload.len())?;

        let sealed = self.seal(opcode, payload)?;
        self.delayed.extend_from_slice(sealed.bytes());
        sealed.release();

        self.delayed_count += 1;
        Ok(self.delayed_count)
    }

    /// Writes out every queued frame.
    pub async fn flush_delayed(&mut self) -> Result<()> {
        if self.delayed_count == 0 {
            return Ok(());
        }

        #[cfg(feature = "logging")]
        log::debug!(
            "flushing {} delayed frames ({} bytes)",
            self.delayed_count,
            self.delayed.len()
        );

        self.generation = self.generation.wrapping_add(1);
        self.delayed_count = 0;
        let res = self.io.write_all(&self.delayed).await;
        self.delayed.clear();
        res?;

        self.io.flush().await?;
        Ok(())
    }

    /// Sends a Close frame. Every later write fails with `ConnectionClosed`.
    pub async fn write_close(&mut self, code: CloseCode, reason: &str) -> Result<()> {
        if self.close_sent {
            return Err(WebSocketError::ConnectionClosed);
        }
        self.flush_delayed().await?;

        let payload = close_payload(code, reason);
        let sealed = self.seal(OpCode::Close, &payload)?;
        self.close_sent = true;
        let res = self.io.write_all(sealed.bytes()).await;
        sealed.release();
        res?;

        self.io.flush().await?;
        Ok(())
    }

    /// Echoes a peer's Close: same code, or 1000 if it had none.
    pub async fn reply_close(&mut self, code: Option<CloseCode>) -> Result<()> {
        self.write_close(code.unwrap_or(CloseCode::Normal), "").await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.io.shutdown().await?;
        Ok(())
    }
}
