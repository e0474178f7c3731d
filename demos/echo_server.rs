//! A WebSocket echo server built on sluice and hyper.
//!
//! hyper performs the HTTP upgrade; the upgraded stream is handed to a
//! server-role [`WebSocket`] that echoes every Text and Binary message.
//! permessage-deflate is negotiated when the client offers it.

use http_body_util::Empty;
use hyper::{
    body::{Bytes, Incoming},
    header,
    server::conn::http1,
    service::service_fn,
    upgrade::Upgraded,
    Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use sluice::{
    handshake, DeflateOptions, Handler, Message, Negotiation, Options, PermessageDeflate, Role,
    WebSocket, WebSocketError,
};
use tokio::net::TcpListener;

type Stream = TokioIo<Upgraded>;

struct Echo;

impl Handler<Stream> for Echo {
    async fn on_open(&self, socket: &WebSocket<Stream>) {
        log::info!("client connected, deflate: {:?}", socket.deflate());
    }

    async fn on_message(&self, socket: &WebSocket<Stream>, message: Message) {
        if message.opcode.is_data() {
            if let Err(err) = socket.send(message).await {
                log::error!("echo failed: {err}");
            }
        }
    }

    async fn on_close(&self, _socket: &WebSocket<Stream>, err: WebSocketError) {
        if err.is_clean_close() {
            log::info!("client disconnected");
        } else {
            log::warn!("connection closed: {err}");
        }
    }
}

fn options() -> Options {
    Options::default()
        .with_compression(DeflateOptions::default())
        .with_read_max_message(64 * 1024 * 1024)
        .with_subprotocols(["echo"])
}

fn bad_request() -> Response<Empty<Bytes>> {
    let mut response = Response::new(Empty::new());
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

/// Answers the upgrade request and spawns the connection.
async fn server_upgrade(mut req: Request<Incoming>) -> anyhow::Result<Response<Empty<Bytes>>> {
    let Some(key) = req.headers().get(header::SEC_WEBSOCKET_KEY).cloned() else {
        return Ok(bad_request());
    };
    if req.headers().get(header::SEC_WEBSOCKET_VERSION).map(|v| v.as_bytes()) != Some(b"13") {
        return Ok(bad_request());
    }

    let options = options();

    let deflate = match (&options.compression, req.headers().get(header::SEC_WEBSOCKET_EXTENSIONS)) {
        (Some(config), Some(offer)) => offer
            .to_str()
            .ok()
            .and_then(|offer| PermessageDeflate::negotiate(config, offer)),
        _ => None,
    };
    let subprotocol = req
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| handshake::select_subprotocol(value, &options.subprotocols));

    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, "websocket")
        .header(
            header::SEC_WEBSOCKET_ACCEPT,
            handshake::sec_websocket_accept(key.as_bytes()),
        );
    if let Some(params) = &deflate {
        builder = builder.header(
            header::SEC_WEBSOCKET_EXTENSIONS,
            handshake::format_extension_offer(params),
        );
    }
    if let Some(protocol) = &subprotocol {
        builder = builder.header(header::SEC_WEBSOCKET_PROTOCOL, protocol.as_str());
    }
    let response = builder.body(Empty::new())?;

    let upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        let upgraded = match upgrade.await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                log::error!("upgrade failed: {err}");
                return;
            }
        };

        // hyper hands any bytes read past the request back through `Upgraded`
        let negotiation = Negotiation {
            deflate,
            subprotocol,
            leftover: Default::default(),
        };
        match WebSocket::new(Role::Server, TokioIo::new(upgraded), negotiation, options) {
            Ok(socket) => socket.read_loop(Echo).await,
            Err(err) => log::error!("invalid options: {err}"),
        }
    });

    Ok(response)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    simple_logger::init_with_level(log::Level::Debug)?;

    let listener = TcpListener::bind("0.0.0.0:8080").await?;
    log::debug!("Listening on {}", listener.local_addr()?);

    loop {
        let (stream, _) = listener.accept().await?;

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let conn_fut = http1::Builder::new()
                .serve_connection(io, service_fn(server_upgrade))
                .with_upgrades();
            if let Err(e) = conn_fut.await {
                log::error!("An error occurred: {:?}", e);
            }
        });
    }
}
