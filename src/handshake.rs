//! Helpers for the HTTP layer that performs the opening handshake.
//!
//! The engine does not parse HTTP. A server computes `Sec-WebSocket-Accept`,
//! picks a subprotocol and answers the extension offer with these helpers,
//! then hands the upgraded stream to [`WebSocket::new`](crate::WebSocket::new).
use base64::prelude::*;
use sha1::{Digest, Sha1};

use crate::compression::PermessageDeflate;

/// GUID appended to the client key (RFC 6455 Section 1.3).
pub const WEBSOCKET_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `base64(sha1(key || GUID))`, the value of `Sec-WebSocket-Accept`.
pub fn sec_websocket_accept(key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(WEBSOCKET_GUID);
    let result = sha1.finalize();
    BASE64_STANDARD.encode(&result[..])
}

/// Client side: checks the server's `Sec-WebSocket-Accept` against the key we sent.
pub fn verify_accept(key: &[u8], accept: &[u8]) -> bool {
    sec_websocket_accept(key).as_bytes() == accept
}

/// A random 16-byte `Sec-WebSocket-Key`.
pub fn generate_key() -> String {
    let input: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(input)
}

/// Picks the first protocol of `supported` (server preference order) that the
/// client listed in its `Sec-WebSocket-Protocol` header.
pub fn select_subprotocol<S: AsRef<str>>(header: &str, supported: &[S]) -> Option<String> {
    supported
        .iter()
        .map(AsRef::as_ref)
        .find(|protocol| header.split(',').any(|offered| offered.trim() == *protocol))
        .map(str::to_owned)
}

/// Formats the `Sec-WebSocket-Extensions` value for `params`.
pub fn format_extension_offer(params: &PermessageDeflate) -> String {
    params.to_string()
}
