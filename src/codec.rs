//! Sans-io frame codec for [`tokio_util::codec`].
//!
//! The connection reads frames through its own fixed reader; this codec is
//! used where frames live in a [`BytesMut`]: fragmented writes, broadcast
//! encoding, and tests that inspect raw wire bytes.
use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{Frame, FrameHeader, MAX_CONTROL_PAYLOAD},
    mask::apply_mask,
    WebSocketError,
};

/// A combined codec that provides both encoding and decoding functionality for WebSocket frames.
///
/// The `Codec` struct combines a `Decoder` for parsing incoming WebSocket frames and an
/// `Encoder` for serializing outgoing frames.
pub struct Codec {
    decoder: Decoder,
    encoder: Encoder,
}

impl Codec {
    /// Creates a codec whose decoder rejects payloads larger than `max_payload_size`
    /// (`0` means unbounded).
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            decoder: Decoder::new(max_payload_size),
            encoder: Encoder,
        }
    }
}

impl From<(Decoder, Encoder)> for Codec {
    fn from((decoder, encoder): (Decoder, Encoder)) -> Self {
        Self { decoder, encoder }
    }
}

impl codec::Decoder for Codec {
    type Item = <Decoder as codec::Decoder>::Item;
    type Error = <Decoder as codec::Decoder>::Error;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode(src)
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = <Encoder as codec::Encoder<Frame>>::Error;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encoder.encode(item, dst)
    }
}

/// A decoder for WebSocket frames.
///
/// The decoder remembers a parsed header across calls so a partially received
/// payload does not cause the header to be parsed twice. Decoded payloads are
/// demasked; reserved bits are reported as received and left for the message
/// assembler to judge.
pub struct Decoder {
    /// Header waiting for its payload.
    state: Option<FrameHeader>,
    /// Maximum allowed size for the frame payload, `0` for none.
    max_payload_size: usize,
}

impl Decoder {
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            state: None,
            max_payload_size,
        }
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.state.take() {
            Some(header) => header,
            None => {
                let Some((header, used)) = FrameHeader::decode(src)? else {
                    return Ok(None);
                };

                if header.opcode.is_control()
                    && (!header.fin || header.payload_len > MAX_CONTROL_PAYLOAD as u64)
                {
                    return Err(WebSocketError::ControlFrameTooLarge);
                }
                let len = header.payload_size()?;
                if self.max_payload_size > 0 && len > self.max_payload_size {
                    return Err(WebSocketError::FrameTooLarge);
                }

                src.advance(used);
                header
            }
        };

        let len = header.payload_len as usize;
        if src.remaining() < len {
            src.reserve(len - src.remaining());
            self.state = Some(header);
            return Ok(None);
        }

        let mut payload = src.split_to(len);
        if let Some(mask) = header.mask {
            apply_mask(&mut payload, mask);
        }

        Ok(Some(Frame { header, payload }))
    }
}

/// WebSocket frame encoder.
///
/// Writes the header, then the payload masked with the header's key if it has one.
pub struct Encoder;

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, mut frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.header.opcode.is_control() && frame.payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlFrameTooLarge);
        }
        frame.header.payload_len = frame.payload.len() as u64;

        let mut head = [0u8; crate::frame::MAX_HEAD_SIZE];
        let size = frame.header.encode(&mut head);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&head[..size]);

        let start = dst.len();
        dst.extend_from_slice(&frame.payload);
        if let Some(mask) = frame.header.mask {
            apply_mask(&mut dst[start..], mask);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::OpCode;
    use tokio_util::codec::{Decoder as _, Encoder as _};

    #[test]
    fn test_encode_decode_masked() {
        let mut codec = Codec::new(0);
        let mut wire = BytesMut::new();

        let frame = Frame::new(true, OpCode::Text, Some([1, 2, 3, 4]), &b"Hello"[..]);
        codec.encode(frame, &mut wire).unwrap();
        assert_eq!(wire.len(), 2 + 4 + 5);
        assert_ne!(&wire[6..], b"Hello");

        let decoded = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(decoded.opcode(), OpCode::Text);
        assert_eq!(decoded.header.mask, Some([1, 2, 3, 4]));
        assert_eq!(&decoded.payload[..], b"Hello");
        assert!(wire.is_empty());
    }

    #[test]
    fn test_decode_partial_payload() {
        let mut codec = Codec::new(0);
        let mut wire = BytesMut::new();
        let payload = vec![b'1'; 65535];
        codec
            .encode(Frame::new(true, OpCode::Binary, None, &payload[..]), &mut wire)
            .unwrap();
        assert_eq!(wire[1], 126);

        let mut rest = wire.split_off(100);
        assert!(codec.decode(&mut wire).unwrap().is_none());
        wire.unsplit(rest.split());

        let frame = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 65535);
        assert!(frame.payload.iter().all(|&b| b == b'1'));
    }

    #[test]
    fn test_decode_rejects_fragmented_control() {
        let mut codec = Codec::new(0);
        let mut wire = BytesMut::from(&[0x09u8, 0x00][..]);
        assert!(matches!(
            codec.decode(&mut wire),
            Err(WebSocketError::ControlFrameTooLarge)
        ));
    }

    #[test]
    fn test_decode_payload_limit() {
        let mut codec = Codec::new(10);
        let mut wire = BytesMut::new();
        codec
            .encode(Frame::new(true, OpCode::Binary, None, &[0u8; 11][..]), &mut wire)
            .unwrap();
        assert!(matches!(
            codec.decode(&mut wire),
            Err(WebSocketError::FrameTooLarge)
        ));
    }

    #[test]
    fn test_encode_rejects_large_control() {
        let mut codec = Codec::new(0);
        let mut wire = BytesMut::new();
        let frame = Frame::new(true, OpCode::Close, None, &[0u8; 130][..]);
        assert!(matches!(
            codec.encode(frame, &mut wire),
            Err(WebSocketError::ControlFrameTooLarge)
        ));
    }

    #[test]
    fn test_compressed_bit_is_kept() {
        let mut codec = Codec::new(0);
        let mut wire = BytesMut::new();
        codec
            .encode(Frame::compress(true, OpCode::Text, None, &b"xyz"[..]), &mut wire)
            .unwrap();
        assert_eq!(wire[0], 0b1100_0001);
        let frame = codec.decode(&mut wire).unwrap().unwrap();
        assert!(frame.header.rsv1);
    }
}
