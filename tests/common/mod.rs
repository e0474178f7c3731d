#![allow(dead_code)]

use std::time::Duration;

use sluice::{
    frame::{self, FrameHeader},
    mask::apply_mask,
    DeflateOptions, Handler, Message, Negotiation, OpCode, Options, PermessageDeflate, Role,
    WebSocket, WebSocketError,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    sync::mpsc,
};

pub type Socket = WebSocket<DuplexStream>;

const WAIT: Duration = Duration::from_secs(5);

pub fn init_logger() {
    let _ = simple_logger::init_with_level(log::Level::Debug);
}

/// What a [`Recorder`] observed, in callback order.
#[derive(Debug)]
pub enum Record {
    Open,
    Message(Message),
    Close(WebSocketError),
}

/// Forwards every callback to a channel, optionally echoing data messages.
pub struct Recorder {
    tx: mpsc::UnboundedSender<Record>,
    echo: bool,
}

impl Recorder {
    pub fn new(echo: bool) -> (Self, mpsc::UnboundedReceiver<Record>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, echo }, rx)
    }
}

impl Handler<DuplexStream> for Recorder {
    async fn on_open(&self, _socket: &Socket) {
        let _ = self.tx.send(Record::Open);
    }

    async fn on_message(&self, socket: &Socket, message: Message) {
        if self.echo && message.opcode.is_data() {
            let _ = socket.send(message.clone()).await;
        }
        let _ = self.tx.send(Record::Message(message));
    }

    async fn on_close(&self, _socket: &Socket, err: WebSocketError) {
        let _ = self.tx.send(Record::Close(err));
    }
}

/// Starts the read loop of `socket` on its own task.
pub fn spawn(socket: &Socket, echo: bool) -> mpsc::UnboundedReceiver<Record> {
    let (recorder, rx) = Recorder::new(echo);
    let socket = socket.clone();
    tokio::spawn(async move { socket.read_loop(recorder).await });
    rx
}

pub async fn next(rx: &mut mpsc::UnboundedReceiver<Record>) -> Record {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("no callback in time")
        .expect("read loop gone")
}

/// Next message, skipping `Open`. Panics on `Close`.
pub async fn next_message(rx: &mut mpsc::UnboundedReceiver<Record>) -> Message {
    loop {
        match next(rx).await {
            Record::Open => {}
            Record::Message(message) => return message,
            Record::Close(err) => panic!("closed while waiting for a message: {err}"),
        }
    }
}

/// Waits for `Close`, skipping `Open`. Panics on a message.
pub async fn next_close(rx: &mut mpsc::UnboundedReceiver<Record>) -> WebSocketError {
    loop {
        match next(rx).await {
            Record::Open => {}
            Record::Message(message) => panic!("unexpected message {message:?}"),
            Record::Close(err) => return err,
        }
    }
}

pub fn deflate_options() -> DeflateOptions {
    DeflateOptions {
        compress_threshold: 0,
        ..Default::default()
    }
}

/// A server and a client connected through an in-memory pipe, both agreeing on `deflate`.
pub fn pair(
    server: Options,
    client: Options,
    deflate: Option<PermessageDeflate>,
) -> (Socket, Socket) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let negotiation = Negotiation {
        deflate,
        ..Default::default()
    };
    let server = WebSocket::new(Role::Server, a, negotiation.clone(), server).unwrap();
    let client = WebSocket::new(Role::Client, b, negotiation, client).unwrap();
    (server, client)
}

/// A server whose peer is a raw pipe the test drives byte by byte.
pub fn raw_client(options: Options, negotiation: Negotiation) -> (Socket, DuplexStream) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let server = WebSocket::new(Role::Server, a, negotiation, options).unwrap();
    (server, b)
}

/// Encodes a client frame (masked) into bytes without any validation.
pub fn client_frame(fin: bool, opcode: OpCode, rsv1: bool, payload: &[u8]) -> Vec<u8> {
    let mask: [u8; 4] = rand::random();
    let header = FrameHeader::new(fin, opcode, Some(mask), payload.len()).with_rsv1(rsv1);

    let mut head = [0u8; frame::MAX_HEAD_SIZE];
    let size = header.encode(&mut head);

    let mut out = head[..size].to_vec();
    let start = out.len();
    out.extend_from_slice(payload);
    apply_mask(&mut out[start..], mask);
    out
}

/// Encodes only the header of a masked client frame announcing `len` bytes.
pub fn client_header(fin: bool, opcode: OpCode, rsv1: bool, len: u64) -> Vec<u8> {
    let mut header = FrameHeader::new(fin, opcode, Some(rand::random()), 0).with_rsv1(rsv1);
    header.payload_len = len;

    let mut head = [0u8; frame::MAX_HEAD_SIZE];
    let size = header.encode(&mut head);
    head[..size].to_vec()
}

pub async fn send_raw(io: &mut DuplexStream, fin: bool, opcode: OpCode, payload: &[u8]) {
    io.write_all(&client_frame(fin, opcode, false, payload))
        .await
        .unwrap();
}

/// Reads one frame the server wrote, demasking if needed.
pub async fn read_raw(io: &mut DuplexStream) -> (FrameHeader, Vec<u8>) {
    let read = async {
        let header = FrameHeader::read(io).await.unwrap();
        let mut payload = vec![0u8; header.payload_len as usize];
        io.read_exact(&mut payload).await.unwrap();
        if let Some(mask) = header.mask {
            apply_mask(&mut payload, mask);
        }
        (header, payload)
    };
    tokio::time::timeout(WAIT, read).await.expect("no frame in time")
}

/// Reads a Close frame and returns its status code.
pub async fn read_close_code(io: &mut DuplexStream) -> u16 {
    let (header, payload) = read_raw(io).await;
    assert_eq!(header.opcode, OpCode::Close);
    assert!(payload.len() <= 125);
    u16::from_be_bytes([payload[0], payload[1]])
}
