//! Wire layer of the i3 / sway IPC protocol.
//!
//! Every message, in both directions, is
//!
//! ```text
//! "i3-ipc" | length: u32 LE | type: u32 LE | payload: length bytes
//! ```
//!
//! Replies echo the request's type.  Events have bit 31 of `type` set and
//! the event kind in the remaining bits.

use super::{EventKind, I3Event, I3Message, I3Request, MessageType};
use crate::error::{FrameError, ProtocolError};
use crate::traits::{Codec, Decoded, Frame, FrameOf};
use log::{debug, warn};
use serde_json::Value;

pub const MAGIC: &[u8; 6] = b"i3-ipc";
pub const HEADER_SIZE: usize = MAGIC.len() + 8;
pub const EVENT_BIT: u32 = 1 << 31;

/// Default cap on announced payload sizes: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// One undecoded frame borrowed from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame<'a> {
    pub message_type: u32,
    pub payload: &'a [u8],
}

impl RawFrame<'_> {
    pub fn is_event(&self) -> bool {
        self.message_type & EVENT_BIT != 0
    }

    /// Bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Append one frame to `dst`.
pub fn encode_frame(
    message_type: u32,
    payload: &[u8],
    dst: &mut Vec<u8>,
) -> Result<(), FrameError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    dst.reserve(HEADER_SIZE + payload.len());
    dst.extend_from_slice(MAGIC);
    dst.extend_from_slice(&len.to_le_bytes());
    dst.extend_from_slice(&message_type.to_le_bytes());
    dst.extend_from_slice(payload);
    Ok(())
}

/// Parse the frame at the front of `src`.
///
/// Returns `Ok(None)` until the header and the whole payload are buffered.
/// A magic mismatch is reported as soon as the first differing byte
/// arrives.
pub fn parse_frame(src: &[u8], max_payload: usize) -> Result<Option<RawFrame<'_>>, FrameError> {
    let seen = src.len().min(MAGIC.len());
    if src[..seen] != MAGIC[..seen] {
        return Err(FrameError::BadMagic(src[..seen].to_vec()));
    }
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }
    let len = u32::from_le_bytes([src[6], src[7], src[8], src[9]]) as usize;
    let message_type = u32::from_le_bytes([src[10], src[11], src[12], src[13]]);
    if len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: max_payload,
        });
    }
    if src.len() < HEADER_SIZE + len {
        return Ok(None);
    }
    Ok(Some(RawFrame {
        message_type,
        payload: &src[HEADER_SIZE..HEADER_SIZE + len],
    }))
}

fn parse_payload(payload: &[u8]) -> Result<Value, serde_json::Error> {
    if payload.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(payload)
}

/// [`Codec`] for the i3 / sway IPC socket.
#[derive(Debug, Clone)]
pub struct I3Codec {
    max_payload: usize,
}

impl I3Codec {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

impl Default for I3Codec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl Codec for I3Codec {
    type Request = I3Request;
    type Reply = I3Message;
    type Event = I3Event;
    type Tag = MessageType;

    fn encode(
        &mut self,
        request: &I3Request,
        dst: &mut Vec<u8>,
    ) -> Result<Option<MessageType>, FrameError> {
        let payload = request.payload.as_bytes();
        if payload.len() > self.max_payload {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload,
            });
        }
        let raw = request.kind.raw();
        if raw & EVENT_BIT != 0 {
            return Err(FrameError::InvalidRequest(format!(
                "message type {:#x} has the event bit set",
                raw
            )));
        }
        encode_frame(raw, payload, dst)?;
        // Tag with the canonical form so `Other(1)` matches a decoded
        // `GetWorkspaces` reply.
        Ok(Some(MessageType::from_u32(raw)))
    }

    fn decode(&mut self, src: &[u8]) -> Result<Decoded<FrameOf<Self>>, FrameError> {
        let Some(raw) = parse_frame(src, self.max_payload)? else {
            return Ok(Decoded::need_more(0));
        };
        let consumed = raw.wire_len();

        if raw.is_event() {
            let kind = EventKind::from_u32(raw.message_type & !EVENT_BIT);
            debug!("i3 event {:?} ({} bytes)", kind, raw.payload.len());
            return match parse_payload(raw.payload) {
                Ok(payload) => {
                    Ok(Decoded::frame(Frame::Event(I3Event { kind, payload }), consumed))
                }
                Err(e) => {
                    warn!("dropping {:?} event with invalid payload: {}", kind, e);
                    Ok(Decoded::need_more(consumed))
                }
            };
        }

        let kind = MessageType::from_u32(raw.message_type);
        debug!("i3 reply {:?} ({} bytes)", kind, raw.payload.len());
        let body = parse_payload(raw.payload)
            .map(|payload| I3Message { kind, payload })
            .map_err(|e| ProtocolError::new(format!("invalid {:?} reply payload: {}", kind, e)));
        Ok(Decoded::frame(
            Frame::Reply {
                tag: Some(kind),
                body,
            },
            consumed,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(message_type: u32, payload: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_frame(message_type, payload.as_bytes(), &mut buf).unwrap();
        buf
    }

    fn decode_all(codec: &mut I3Codec, mut src: &[u8]) -> Vec<FrameOf<I3Codec>> {
        let mut frames = Vec::new();
        loop {
            let step = codec.decode(src).unwrap();
            if step.is_exhausted() {
                return frames;
            }
            src = &src[step.consumed..];
            frames.extend(step.frame);
        }
    }

    #[test]
    fn header_layout_is_magic_length_type() {
        let bytes = frame(2, "[\"workspace\"]");
        assert_eq!(&bytes[..6], b"i3-ipc");
        assert_eq!(&bytes[6..10], &13u32.to_le_bytes());
        assert_eq!(&bytes[10..14], &2u32.to_le_bytes());
        assert_eq!(&bytes[14..], b"[\"workspace\"]");
    }

    #[test]
    fn request_encodes_with_its_kind_as_tag() {
        let mut codec = I3Codec::default();
        let mut buf = Vec::new();
        let tag = codec.encode(&I3Request::query(MessageType::GetWorkspaces), &mut buf).unwrap();
        assert_eq!(tag, Some(MessageType::GetWorkspaces));
        assert_eq!(buf, frame(1, ""));

        buf.clear();
        let tag = codec.encode(&I3Request::new(MessageType::Other(1), ""), &mut buf).unwrap();
        assert_eq!(tag, Some(MessageType::GetWorkspaces));
    }

    #[test]
    fn empty_payload_round_trips_as_null() {
        let mut codec = I3Codec::default();
        let mut buf = Vec::new();
        codec.encode(&I3Request::query(MessageType::GetVersion), &mut buf).unwrap();
        let raw = parse_frame(&buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(raw.message_type, 7);
        assert!(raw.payload.is_empty());

        let step = codec.decode(&buf).unwrap();
        assert_eq!(step.consumed, HEADER_SIZE);
        assert_eq!(
            step.frame,
            Some(Frame::Reply {
                tag: Some(MessageType::GetVersion),
                body: Ok(I3Message {
                    kind: MessageType::GetVersion,
                    payload: Value::Null
                }),
            })
        );
    }

    #[test]
    fn event_bit_selects_event_kind() {
        let mut codec = I3Codec::default();
        let bytes = frame(0x8000_0003, r#"{"change":"focus"}"#);
        let frames = decode_all(&mut codec, &bytes);
        assert_eq!(
            frames,
            vec![Frame::Event(I3Event {
                kind: EventKind::Window,
                payload: json!({"change": "focus"}),
            })]
        );
        assert_eq!(EventKind::Window.raw(), 3);
    }

    #[test]
    fn every_split_point_yields_the_same_frame() {
        let bytes = frame(1, r#"[{"num":1,"focused":true}]"#);
        let mut whole = I3Codec::default();
        let expected = decode_all(&mut whole, &bytes);
        assert_eq!(expected.len(), 1);

        for split in 1..bytes.len() {
            let mut codec = I3Codec::default();
            let mut buffer = bytes[..split].to_vec();
            assert!(decode_all(&mut codec, &buffer).is_empty(), "split at {}", split);
            buffer.extend_from_slice(&bytes[split..]);
            assert_eq!(decode_all(&mut codec, &buffer), expected, "split at {}", split);
        }
    }

    #[test]
    fn bad_magic_is_detected_before_the_header_completes() {
        let mut codec = I3Codec::default();
        assert_eq!(
            codec.decode(b"i3-x").unwrap_err(),
            FrameError::BadMagic(b"i3-x".to_vec())
        );
        assert!(codec.decode(b"i3-").unwrap().is_exhausted());
    }

    #[test]
    fn oversized_announcement_is_rejected() {
        let mut codec = I3Codec::new(8);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&9u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        assert_eq!(
            codec.decode(&bytes).unwrap_err(),
            FrameError::PayloadTooLarge { size: 9, max: 8 }
        );
    }

    #[test]
    fn invalid_reply_json_fails_only_that_request() {
        let mut codec = I3Codec::default();
        let frames = decode_all(&mut codec, &frame(0, "{not json"));
        match &frames[..] {
            [Frame::Reply { tag, body: Err(e) }] => {
                assert_eq!(*tag, Some(MessageType::RunCommand));
                assert!(e.message.contains("invalid"));
            }
            other => panic!("unexpected frames: {:?}", other),
        }
    }

    #[test]
    fn invalid_event_json_is_consumed_and_dropped() {
        let mut codec = I3Codec::default();
        let mut bytes = frame(0x8000_0000, "{broken");
        bytes.extend(frame(0x8000_0002, r#"{"change":"resize"}"#));
        let frames = decode_all(&mut codec, &bytes);
        assert_eq!(
            frames,
            vec![Frame::Event(I3Event {
                kind: EventKind::Mode,
                payload: json!({"change": "resize"}),
            })]
        );
    }

    #[test]
    fn request_with_event_bit_is_invalid() {
        let mut codec = I3Codec::default();
        let request = I3Request {
            kind: MessageType::Other(EVENT_BIT | 1),
            payload: String::new(),
        };
        let mut buf = Vec::new();
        assert!(matches!(
            codec.encode(&request, &mut buf),
            Err(FrameError::InvalidRequest(_))
        ));
        assert!(buf.is_empty());
    }
}
