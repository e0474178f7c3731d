//! Close codes and close frame payloads (RFC 6455 Section 7.4).

use bytes::Bytes;

use crate::{Result, WebSocketError};

/// Status code carried by a Close frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000: the purpose for which the connection was established has been fulfilled.
    Normal,
    /// 1001: an endpoint is going away (server shutdown, page navigation).
    Away,
    /// 1002: protocol error.
    Protocol,
    /// 1003: received a type of data the endpoint cannot accept.
    Unsupported,
    /// 1005: reserved; no status code was present. Never sent on the wire.
    Status,
    /// 1006: reserved; the connection was closed abnormally. Never sent on the wire.
    Abnormal,
    /// 1007: message data was inconsistent with its type (e.g. non UTF-8 text).
    Invalid,
    /// 1008: policy violation.
    Policy,
    /// 1009: message too big to process.
    Size,
    /// 1010: the client expected an extension the server did not negotiate.
    Extension,
    /// 1011: the server hit an unexpected condition.
    Error,
    /// 3000-3999: registered with IANA for libraries and frameworks.
    Iana(u16),
    /// 4000-4999: private use.
    Library(u16),
    /// Any other value.
    Other(u16),
}

impl CloseCode {
    /// Returns whether this code may appear in a Close frame received from a peer.
    ///
    /// Legal codes are 1000-1011 excluding 1004, 1005 and 1006, and 3000-4999.
    pub fn is_allowed(self) -> bool {
        let code = u16::from(self);
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::Away,
            1002 => Self::Protocol,
            1003 => Self::Unsupported,
            1005 => Self::Status,
            1006 => Self::Abnormal,
            1007 => Self::Invalid,
            1008 => Self::Policy,
            1009 => Self::Size,
            1010 => Self::Extension,
            1011 => Self::Error,
            3000..=3999 => Self::Iana(code),
            4000..=4999 => Self::Library(code),
            _ => Self::Other(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Iana(code) | CloseCode::Library(code) | CloseCode::Other(code) => code,
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}

/// A parsed Close frame payload.
///
/// An empty payload has no code and no reason.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloseFrame {
    pub code: Option<CloseCode>,
    pub reason: Bytes,
}

impl CloseFrame {
    /// Parses and validates a Close payload received from a peer.
    ///
    /// The payload is either empty, or a big-endian status code followed by a
    /// UTF-8 reason.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        match payload.len() {
            0 => Ok(Self::default()),
            1 => Err(WebSocketError::ClosePayloadTooSmall),
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                let reason = &payload[2..];
                if std::str::from_utf8(reason).is_err() {
                    return Err(WebSocketError::InvalidUTF8);
                }
                if !CloseCode::from(code).is_allowed() {
                    return Err(WebSocketError::InvalidCloseCode(code));
                }

                Ok(Self {
                    code: Some(CloseCode::from(code)),
                    reason: Bytes::copy_from_slice(reason),
                })
            }
        }
    }

    /// Returns the reason as a string slice.
    pub fn reason(&self) -> &str {
        std::str::from_utf8(&self.reason).unwrap_or_default()
    }

    /// Returns whether the peer closed normally (1000, 1001, or no code).
    pub fn is_normal(&self) -> bool {
        matches!(self.code, None | Some(CloseCode::Normal | CloseCode::Away))
    }
}

impl std::fmt::Display for CloseFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "code={code} reason={:?}", self.reason()),
            None => write!(f, "no status"),
        }
    }
}

/// Builds a Close payload of at most 125 bytes, cutting `reason` at a char
/// boundary if needed.
pub(crate) fn close_payload(code: CloseCode, reason: &str) -> Vec<u8> {
    let mut end = reason.len().min(123);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }

    let mut payload = Vec::with_capacity(2 + end);
    payload.extend_from_slice(&u16::from(code).to_be_bytes());
    payload.extend_from_slice(&reason.as_bytes()[..end]);
    payload
}
