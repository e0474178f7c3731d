use std::{
    collections::HashMap,
    sync::{Mutex, OnceLock},
};

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Encoder as _;

use crate::{
    codec::Encoder,
    compression::compress_message,
    frame::{Frame, OpCode},
    socket::WriteCompression,
    CompressionLevel, Result, Role, Transport, WebSocket,
};

/// Sends one message to many connections, encoding it once.
///
/// Server connections without sending-side context takeover produce the same
/// bytes for the same message, so the encoded frame (plain, or compressed per
/// compression level and window size) is cached and written as is. Client
/// connections and connections with context takeover fall back to
/// [`WebSocket::write_message`].
pub struct Broadcaster {
    opcode: OpCode,
    payload: Bytes,
    plain: OnceLock<Bytes>,
    compressed: Mutex<HashMap<(u32, u8), Bytes>>,
}

impl Broadcaster {
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
            plain: OnceLock::new(),
            compressed: Mutex::new(HashMap::new()),
        }
    }

    /// Writes the message to `socket`.
    pub async fn broadcast<S: Transport>(&self, socket: &WebSocket<S>) -> Result<()> {
        if socket.role() == Role::Client {
            return socket.write_message(self.opcode, &self.payload).await;
        }

        match socket.compression().await {
            WriteCompression::Off => socket.write_raw(&self.plain()?).await,
            WriteCompression::Stateless {
                level,
                window_bits,
                threshold,
            } if self.opcode.is_data() && !self.payload.is_empty() && self.payload.len() >= threshold => {
                socket.write_raw(&self.compressed(level, window_bits)?).await
            }
            WriteCompression::Stateless { .. } => socket.write_raw(&self.plain()?).await,
            WriteCompression::Stateful => socket.write_message(self.opcode, &self.payload).await,
        }
    }

    fn plain(&self) -> Result<Bytes> {
        if let Some(frame) = self.plain.get() {
            return Ok(frame.clone());
        }
        let frame = encode(Frame::new(true, self.opcode, None, &self.payload[..]))?;
        Ok(self.plain.get_or_init(|| frame).clone())
    }

    fn compressed(&self, level: CompressionLevel, window_bits: u8) -> Result<Bytes> {
        let key = (level.level(), window_bits);
        if let Some(frame) = self.compressed.lock().ok().and_then(|cache| cache.get(&key).cloned()) {
            return Ok(frame);
        }

        let mut payload = Vec::with_capacity(self.payload.len() / 2);
        compress_message(level, window_bits, &self.payload, &mut payload)?;
        let frame = encode(Frame::compress(true, self.opcode, None, &payload[..]))?;

        if let Ok(mut cache) = self.compressed.lock() {
            cache.insert(key, frame.clone());
        }
        Ok(frame)
    }
}

fn encode(frame: Frame) -> Result<Bytes> {
    let mut out = BytesMut::with_capacity(frame.payload.len() + 14);
    Encoder.encode(frame, &mut out)?;
    Ok(out.freeze())
}
