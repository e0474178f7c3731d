//! The connection: read loop, write path, delayed writes and handler dispatch.
mod options;
mod read;
mod write;

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex as StdMutex, Weak,
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::{
    close::CloseCode,
    compression::{Compressor, Decompressor, PermessageDeflate},
    frame::{Message, OpCode},
    Result, WebSocketError,
};

pub use options::{
    CompressionLevel, DeflateOptions, Options, ParseMode, MAX_READ_MESSAGE, READ_BUFFER_SIZE,
};

use read::{Assembler, Event, ReadHalf};
use write::{Compression, WriteHalf};

pub(crate) use write::Compression as WriteCompression;

/// The role the current WebSocket connection is serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepts connections; receives masked frames and sends unmasked ones.
    Server,
    /// Initiates connections; masks every frame it sends.
    Client,
}

/// A byte stream a connection can run on.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Outcome of the opening handshake, handed to the connection.
#[derive(Debug, Clone, Default)]
pub struct Negotiation {
    /// Agreed permessage-deflate parameters, `None` if not negotiated.
    pub deflate: Option<PermessageDeflate>,
    /// Agreed subprotocol.
    pub subprotocol: Option<String>,
    /// Bytes the HTTP layer read past the end of the handshake. They are the
    /// beginning of the first frame.
    pub leftover: Bytes,
}

/// Callbacks driven by [`WebSocket::read_loop`].
///
/// Every method has a no-op default, so a handler only implements what it
/// needs. Calls happen in order on the read task: `on_open` once, then
/// `on_message` for each message, then `on_close` exactly once.
pub trait Handler<S>: Send + Sync + 'static {
    fn on_open(&self, socket: &WebSocket<S>) -> impl Future<Output = ()> + Send {
        let _ = socket;
        async {}
    }

    /// Receives Text, Binary and Ping messages, and Pong messages unless
    /// [`Options::ignore_pong`] is set. Close frames are reported by
    /// [`on_close`](Self::on_close).
    fn on_message(&self, socket: &WebSocket<S>, message: Message) -> impl Future<Output = ()> + Send {
        let _ = (socket, message);
        async {}
    }

    /// Called once the connection is closed. `err` is
    /// [`WebSocketError::Closed`] when the peer closed,
    /// [`WebSocketError::ConnectionClosed`] after a local [`WebSocket::close`],
    /// or the error that tore the connection down.
    fn on_close(&self, socket: &WebSocket<S>, err: WebSocketError) -> impl Future<Output = ()> + Send {
        let _ = (socket, err);
        async {}
    }
}

impl<S, H> Handler<S> for Arc<H>
where
    H: Handler<S>,
{
    fn on_open(&self, socket: &WebSocket<S>) -> impl Future<Output = ()> + Send {
        (**self).on_open(socket)
    }

    fn on_message(&self, socket: &WebSocket<S>, message: Message) -> impl Future<Output = ()> + Send {
        (**self).on_message(socket, message)
    }

    fn on_close(&self, socket: &WebSocket<S>, err: WebSocketError) -> impl Future<Output = ()> + Send {
        (**self).on_close(socket, err)
    }
}

const OPEN: u8 = 0;
/// A Close frame was sent; waiting for the peer's.
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

struct Inner<S> {
    role: Role,
    options: Options,
    deflate: Option<PermessageDeflate>,
    subprotocol: Option<String>,
    state: AtomicU8,
    writer: tokio::sync::Mutex<WriteHalf<S>>,
    reader: StdMutex<Option<ReadHalf<S>>>,
    read_timeout: StdMutex<Option<Duration>>,
    shutdown: CancellationToken,
}

/// A WebSocket connection over an upgraded stream.
///
/// `WebSocket` is a cheap handle: clones share the connection. One task runs
/// [`read_loop`](Self::read_loop); any number of tasks may write concurrently,
/// frames are never interleaved on the wire.
pub struct WebSocket<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for WebSocket<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> std::fmt::Debug for WebSocket<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket")
            .field("role", &self.inner.role)
            .field("deflate", &self.inner.deflate)
            .field("subprotocol", &self.inner.subprotocol)
            .field("state", &self.inner.state.load(Ordering::Acquire))
            .finish()
    }
}

impl<S: Transport> WebSocket<S> {
    /// Wraps an upgraded stream.
    ///
    /// `negotiation` carries what the handshake agreed on; compression is
    /// only used if `negotiation.deflate` is set and `options.compression`
    /// is configured.
    pub fn new(role: Role, stream: S, negotiation: Negotiation, options: Options) -> Result<Self> {
        options.validate()?;

        let Negotiation {
            deflate,
            subprotocol,
            leftover,
        } = negotiation;

        let deflate_options = options.compression.clone();
        let deflate = deflate.filter(|_| deflate_options.is_some());

        let (compressor, compression, threshold, decompressor) = match (&deflate, &deflate_options) {
            (Some(params), Some(config)) => {
                let sender = params.sender(role);
                let compressor = config
                    .compression
                    .then(|| Compressor::new(config.level, sender))
                    .flatten();
                let compression = match &compressor {
                    None => Compression::Off,
                    Some(c) if c.context_takeover() => Compression::Stateful,
                    Some(_) => Compression::Stateless {
                        level: config.level,
                        window_bits: sender.window_bits,
                        threshold: config.compress_threshold,
                    },
                };
                let decompressor = Decompressor::new(params.receiver(role));
                (compressor, compression, config.compress_threshold, Some(decompressor))
            }
            _ => (None, Compression::Off, 0, None),
        };

        #[cfg(feature = "logging")]
        log::debug!(
            "websocket open role={role:?} deflate={} subprotocol={subprotocol:?}",
            deflate.map(|d| d.to_string()).unwrap_or_else(|| "off".into())
        );

        let (read_half, write_half) = tokio::io::split(stream);

        let assembler = Assembler::new(
            role,
            decompressor,
            options.read_max_message,
            options.check_utf8,
        );
        let reader = ReadHalf::new(
            read_half,
            &leftover,
            options.read_window(),
            options.parse_mode,
            assembler,
        );
        let writer = WriteHalf::new(
            write_half,
            role,
            compressor,
            compression,
            threshold,
            options.delay_write_init_buffer_size,
        );

        Ok(Self {
            inner: Arc::new(Inner {
                role,
                read_timeout: StdMutex::new(options.read_timeout),
                options,
                deflate,
                subprotocol,
                state: AtomicU8::new(OPEN),
                writer: tokio::sync::Mutex::new(writer),
                reader: StdMutex::new(Some(reader)),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Runs the connection until it closes, dispatching to `handler`.
    ///
    /// Only the first call runs; later calls return immediately. On a
    /// protocol error a Close frame with the matching code is sent before the
    /// transport is shut down.
    pub async fn read_loop<H: Handler<S>>(&self, handler: H) {
        let reader = self.inner.reader.lock().ok().and_then(|mut slot| slot.take());
        let Some(mut reader) = reader else {
            #[cfg(feature = "logging")]
            log::debug!("read loop already started");
            return;
        };

        handler.on_open(self).await;
        let err = self.drive(&mut reader, &handler).await;

        #[cfg(feature = "logging")]
        log::debug!("read loop finished: {err}");

        self.teardown(&err).await;
        handler.on_close(self, err).await;
    }

    async fn drive<H: Handler<S>>(&self, reader: &mut ReadHalf<S>, handler: &H) -> WebSocketError {
        loop {
            let event = tokio::select! {
                _ = self.inner.shutdown.cancelled() => return WebSocketError::ConnectionClosed,
                event = self.next_event(reader) => event,
            };

            let event = match event {
                Ok(event) => event,
                Err(err) => return err,
            };

            match event {
                Event::Close(frame) => {
                    #[cfg(feature = "logging")]
                    log::debug!("received close: {frame}");

                    let mut writer = self.inner.writer.lock().await;
                    if !writer.close_sent() {
                        let _ = writer.reply_close(frame.code).await;
                    }
                    return WebSocketError::Closed(frame);
                }
                // closing: validate but do not dispatch or answer
                Event::Message(_) if self.inner.state.load(Ordering::Acquire) != OPEN => {}
                Event::Message(message) => match message.opcode {
                    OpCode::Ping => {
                        if self.inner.options.auto_reply_ping {
                            if let Err(err) = self.write_pong(&message.payload).await {
                                return err;
                            }
                        }
                        handler.on_message(self, message).await;
                    }
                    OpCode::Pong if self.inner.options.ignore_pong => {}
                    _ => handler.on_message(self, message).await,
                },
            }
        }
    }

    async fn next_event(&self, reader: &mut ReadHalf<S>) -> Result<Event> {
        match self.read_timeout() {
            Some(deadline) => tokio::time::timeout(deadline, reader.next_event())
                .await
                .map_err(|_| WebSocketError::Timeout)?,
            None => reader.next_event().await,
        }
    }

    async fn teardown(&self, err: &WebSocketError) {
        let mut writer = self.inner.writer.lock().await;

        if let Some(code) = err.close_code() {
            #[cfg(feature = "logging")]
            log::debug!("protocol error, closing with {code}: {err}");

            if !writer.close_sent() && self.inner.state.load(Ordering::Acquire) != CLOSED {
                let _ = writer.write_close(code, &err.to_string()).await;
            }
        }

        let _ = writer.flush_delayed().await;
        let _ = writer.shutdown().await;
        self.inner.state.store(CLOSED, Ordering::Release);
        self.inner.shutdown.cancel();
    }

    fn check_open(&self) -> Result<()> {
        match self.inner.state.load(Ordering::Acquire) {
            CLOSED => Err(WebSocketError::ConnectionClosed),
            _ => Ok(()),
        }
    }

    /// Sends one unfragmented message, compressed if negotiated.
    pub async fn write_message(&self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        self.check_open()?;
        self.inner.writer.lock().await.write_message(opcode, payload).await
    }

    /// Sends a [`Message`].
    pub async fn send(&self, message: Message) -> Result<()> {
        self.write_message(message.opcode, &message.payload).await
    }

    /// Like [`write_message`](Self::write_message), bounded by `deadline`
    /// including the wait for the write lock.
    ///
    /// A missed deadline may leave a partial frame on the wire, so the
    /// connection is closed.
    pub async fn write_timeout(&self, opcode: OpCode, payload: &[u8], deadline: Duration) -> Result<()> {
        self.check_open()?;
        let write = async { self.inner.writer.lock().await.write_message(opcode, payload).await };
        match tokio::time::timeout(deadline, write).await {
            Ok(res) => res,
            Err(_) => {
                self.inner.state.store(CLOSED, Ordering::Release);
                self.inner.shutdown.cancel();
                Err(WebSocketError::Timeout)
            }
        }
    }

    /// Queues a message for a coalesced write.
    ///
    /// Queued frames are written once [`Options::max_delay_write_num`] frames
    /// are waiting, or [`Options::max_delay_write_duration`] after the first
    /// of them was queued, whichever comes first. Any immediate write flushes
    /// the queue first, so frames always leave in the order they were issued.
    pub async fn write_message_delay(&self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        self.check_open()?;
        let mut writer = self.inner.writer.lock().await;
        let queued = writer.queue(opcode, payload)?;

        if queued >= self.inner.options.max_delay_write_num {
            writer.flush_delayed().await
        } else {
            if queued == 1 {
                self.schedule_flush(writer.generation());
            }
            Ok(())
        }
    }

    fn schedule_flush(&self, generation: u64) {
        let inner: Weak<Inner<S>> = Arc::downgrade(&self.inner);
        let delay = self.inner.options.max_delay_write_duration;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut writer = inner.writer.lock().await;
            // a flush since scheduling already took these frames
            if writer.generation() == generation {
                if let Err(_err) = writer.flush_delayed().await {
                    #[cfg(feature = "logging")]
                    log::debug!("delayed flush failed, closing: {_err}");

                    inner.state.store(CLOSED, Ordering::Release);
                    inner.shutdown.cancel();
                }
            }
        });
    }

    /// Writes out frames queued by [`write_message_delay`](Self::write_message_delay).
    pub async fn flush(&self) -> Result<()> {
        self.check_open()?;
        self.inner.writer.lock().await.flush_delayed().await
    }

    pub async fn write_ping(&self, payload: &[u8]) -> Result<()> {
        self.write_message(OpCode::Ping, payload).await
    }

    pub async fn write_pong(&self, payload: &[u8]) -> Result<()> {
        self.write_message(OpCode::Pong, payload).await
    }

    /// Starts the closing handshake. The reason is cut to fit a 125 byte
    /// control frame. The read loop keeps running until the peer answers.
    pub async fn write_close(&self, code: CloseCode, reason: &str) -> Result<()> {
        self.check_open()?;
        let mut writer = self.inner.writer.lock().await;
        writer.write_close(code, reason).await?;
        let _ = self
            .inner
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire);
        Ok(())
    }

    /// Sends a Text or Binary message as frames carrying at most `chunk_size`
    /// bytes each.
    pub async fn write_fragment(&self, opcode: OpCode, payload: &[u8], chunk_size: usize) -> Result<()> {
        self.check_open()?;
        self.inner
            .writer
            .lock()
            .await
            .write_fragment(opcode, payload, chunk_size)
            .await
    }

    pub(crate) async fn write_raw(&self, frames: &[u8]) -> Result<()> {
        self.check_open()?;
        self.inner.writer.lock().await.write_raw(frames).await
    }

    pub(crate) async fn compression(&self) -> Compression {
        self.inner.writer.lock().await.compression()
    }

    /// Shuts the transport down without a closing handshake. Idempotent.
    ///
    /// A running read loop stops and reports [`WebSocketError::ConnectionClosed`].
    pub async fn close(&self) -> Result<()> {
        if self.inner.state.swap(CLOSED, Ordering::AcqRel) == CLOSED {
            return Ok(());
        }
        self.inner.shutdown.cancel();

        let mut writer = self.inner.writer.lock().await;
        let _ = writer.flush_delayed().await;
        writer.shutdown().await
    }

    /// Changes the read deadline applied while waiting for each message.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        if let Ok(mut slot) = self.inner.read_timeout.lock() {
            *slot = timeout;
        }
    }

    fn read_timeout(&self) -> Option<Duration> {
        self.inner.read_timeout.lock().ok().and_then(|slot| *slot)
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn subprotocol(&self) -> Option<&str> {
        self.inner.subprotocol.as_deref()
    }

    /// Negotiated permessage-deflate parameters.
    pub fn deflate(&self) -> Option<&PermessageDeflate> {
        self.inner.deflate.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == CLOSED
    }
}
