//! Wire codec.
//!
//! ## Wire Format
//! ```text
//! [Length(4, big endian)] [bincode(WireFrame { envelope, marker })]
//! ```
//! `envelope` is the bincode encoding of a [`Packet`]. `marker` must be
//! present and carry the protocol magic; a frame without it did not come
//! from a peer speaking this protocol and is rejected as fatal.
//!
//! A frame whose outer structure and marker are sound but whose envelope
//! does not decode is returned as [`Inbound::Unreadable`] so the caller can
//! answer with an operation failure instead of dropping the connection.

use bincode::Options;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::CodecError;
use crate::packet::Packet;

/// Maximum size of one frame (16 MiB).
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

const MARKER_MAGIC: [u8; 4] = *b"HAZE";

/// Bytes a frame body adds around its envelope: the envelope length, the
/// marker's option tag and the magic.
const FRAME_OVERHEAD: usize = 8 + 1 + MARKER_MAGIC.len();

/// Proof that a frame was produced by this protocol's encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Marker {
    magic: [u8; 4],
}

impl Marker {
    const AUTHENTIC: Marker = Marker {
        magic: MARKER_MAGIC,
    };
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFrame {
    envelope: Vec<u8>,
    marker: Option<Marker>,
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Packet(Packet),
    /// Authentic frame whose envelope could not be read
    Unreadable { raw: Vec<u8>, reason: String },
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_FRAME_LENGTH as u64)
        .reject_trailing_bytes()
}

fn serialize_error(e: bincode::Error, size: usize) -> CodecError {
    match *e {
        bincode::ErrorKind::SizeLimit => CodecError::Oversized {
            size,
            max: MAX_FRAME_LENGTH,
        },
        _ => CodecError::Malformed(e),
    }
}

/// Size of the frame body `packet` encodes to, without encoding it.
pub fn frame_len(packet: &Packet) -> Result<usize, CodecError> {
    let envelope = bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .serialized_size(packet)
        .map_err(CodecError::Malformed)?;
    Ok(envelope as usize + FRAME_OVERHEAD)
}

/// Whether `packet` can be sent as a single frame.
pub fn fits_in_frame(packet: &Packet) -> bool {
    matches!(frame_len(packet), Ok(len) if len <= MAX_FRAME_LENGTH)
}

/// Stamps the packet with the current time and encodes it as a frame body.
pub fn encode(packet: &mut Packet) -> Result<Vec<u8>, CodecError> {
    let size = frame_len(packet)?;
    if size > MAX_FRAME_LENGTH {
        return Err(CodecError::Oversized {
            size,
            max: MAX_FRAME_LENGTH,
        });
    }

    packet.stamp();
    let envelope = options()
        .serialize(packet)
        .map_err(|e| serialize_error(e, size))?;
    options()
        .serialize(&WireFrame {
            envelope,
            marker: Some(Marker::AUTHENTIC),
        })
        .map_err(|e| serialize_error(e, size))
}

/// Decodes a frame body, separating fatal from recoverable failures.
pub fn decode_frame(bytes: &[u8]) -> Result<Inbound, CodecError> {
    let frame: WireFrame = options().deserialize(bytes).map_err(CodecError::Malformed)?;

    match frame.marker {
        Some(Marker::AUTHENTIC) => {}
        Some(_) => return Err(CodecError::WrongMarker),
        None => return Err(CodecError::MissingMarker),
    }

    let envelope: bincode::Result<Packet> = options().deserialize(&frame.envelope);
    match envelope {
        Ok(packet) => Ok(Inbound::Packet(packet)),
        Err(e) => Ok(Inbound::Unreadable {
            raw: frame.envelope,
            reason: e.to_string(),
        }),
    }
}

/// Strict decode: anything other than a readable packet is an error.
pub fn decode(bytes: &[u8]) -> Result<Packet, CodecError> {
    match decode_frame(bytes)? {
        Inbound::Packet(packet) => Ok(packet),
        Inbound::Unreadable { reason, .. } => Err(CodecError::PayloadMismatch(reason)),
    }
}

/// Length-delimited framing around [`encode`] and [`decode_frame`].
#[derive(Debug)]
pub struct HazeCodec {
    framing: LengthDelimitedCodec,
}

impl HazeCodec {
    pub fn new() -> Self {
        Self {
            framing: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
        }
    }
}

impl Default for HazeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for HazeCodec {
    type Item = Inbound;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, CodecError> {
        match self.framing.decode(src)? {
            Some(frame) => decode_frame(&frame).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<Packet> for HazeCodec {
    type Error = CodecError;

    fn encode(&mut self, mut packet: Packet, dst: &mut BytesMut) -> Result<(), CodecError> {
        let body = encode(&mut packet)?;
        self.framing.encode(Bytes::from(body), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::EndpointId;
    use crate::packet::{FailureInfo, FailureKind, PacketBody};
    use crate::snapshot::{Departure, MemberSnapshot, RosterUpdate, ServerSnapshot};

    fn snapshot() -> ServerSnapshot {
        let member = MemberSnapshot {
            id: EndpointId::from_string("m0"),
            name: "alice".to_string(),
            index: 0,
            tag: Some(vec![1, 2]),
            connected_for_ms: 1500,
        };
        ServerSnapshot {
            id: EndpointId::from_string("srv"),
            name: "haze".to_string(),
            capacity: 8,
            size: 1,
            index: Some(0),
            members: vec![member],
        }
    }

    fn every_kind() -> Vec<Packet> {
        let server = snapshot();
        let member = server.members[0].clone();
        vec![
            Packet::authentication("alice", Some(vec![7])),
            Packet::welcome(server.clone()),
            Packet::roster_update(RosterUpdate {
                server: server.clone(),
                joined: Some(member.clone()),
                departed: Some(Departure {
                    member,
                    reason: "bye".to_string(),
                    connected_for_ms: 42,
                }),
            }),
            Packet::name_update("bob"),
            Packet::ping(),
            Packet::ping_reply(3),
            Packet::relay(
                EndpointId::from_string("a"),
                EndpointId::from_string("b"),
                Packet::text("hi"),
            ),
            Packet::operation_failed(
                Packet::text("cause"),
                Some(FailureInfo::new(FailureKind::HandlerFailed, "boom")),
            ),
            Packet::disconnect("server is closed"),
            Packet::text("hello"),
            Packet::raw(vec![0, 1, 2, 3]).with_tag(vec![4]),
        ]
    }

    #[test]
    fn test_every_kind_survives_the_wire() {
        for mut packet in every_kind() {
            let bytes = encode(&mut packet).unwrap();
            assert_eq!(decode(&bytes).unwrap(), packet, "{}", packet.describe());
        }
    }

    #[test]
    fn test_frame_len_matches_encoding() {
        for mut packet in every_kind() {
            let predicted = frame_len(&packet).unwrap();
            assert_eq!(encode(&mut packet).unwrap().len(), predicted, "{}", packet.describe());
        }
    }

    #[test]
    fn test_oversized_packet_is_refused() {
        let empty = frame_len(&Packet::raw(Vec::new())).unwrap();
        let largest = Packet::raw(vec![0; MAX_FRAME_LENGTH - empty]);
        assert!(fits_in_frame(&largest));

        let mut too_large = Packet::raw(vec![0; MAX_FRAME_LENGTH - empty + 1]);
        assert!(!fits_in_frame(&too_large));
        match encode(&mut too_large) {
            Err(CodecError::Oversized { size, max }) => {
                assert_eq!(size, MAX_FRAME_LENGTH + 1);
                assert_eq!(max, MAX_FRAME_LENGTH);
            }
            other => panic!("Expected oversized error, got {:?}", other.map(|b| b.len())),
        }
    }

    #[test]
    fn test_encode_stamps_send_time() {
        let mut packet = Packet::text("late");
        let created = packet.sent_at();
        std::thread::sleep(std::time::Duration::from_millis(5));

        let bytes = encode(&mut packet).unwrap();
        assert!(packet.sent_at() > created);
        assert_eq!(decode(&bytes).unwrap().sent_at(), packet.sent_at());
    }

    #[test]
    fn test_garbage_is_fatal() {
        for garbage in [&b""[..], &b"\x01\x02\x03"[..], &[0xFF; 64][..]] {
            let err = decode_frame(garbage).unwrap_err();
            assert!(err.is_fatal(), "{err}");
        }
    }

    #[test]
    fn test_truncated_frame_is_fatal() {
        let bytes = encode(&mut Packet::text("truncate me")).unwrap();
        let err = decode_frame(&bytes[..bytes.len() / 2]).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn test_missing_marker_is_rejected() {
        let envelope = options().serialize(&Packet::text("sneaky")).unwrap();
        let bytes = options()
            .serialize(&WireFrame {
                envelope,
                marker: None,
            })
            .unwrap();

        assert!(matches!(decode_frame(&bytes), Err(CodecError::MissingMarker)));
    }

    #[test]
    fn test_wrong_marker_is_rejected() {
        let envelope = options().serialize(&Packet::text("sneaky")).unwrap();
        let bytes = options()
            .serialize(&WireFrame {
                envelope,
                marker: Some(Marker { magic: *b"EVIL" }),
            })
            .unwrap();

        assert!(matches!(decode_frame(&bytes), Err(CodecError::WrongMarker)));
    }

    #[test]
    fn test_unreadable_envelope_is_recoverable() {
        let bytes = options()
            .serialize(&WireFrame {
                envelope: vec![0xEE; 12],
                marker: Some(Marker::AUTHENTIC),
            })
            .unwrap();

        match decode_frame(&bytes).unwrap() {
            Inbound::Unreadable { raw, .. } => assert_eq!(raw, vec![0xEE; 12]),
            Inbound::Packet(p) => panic!("decoded garbage as {}", p.describe()),
        }
        assert!(matches!(decode(&bytes), Err(CodecError::PayloadMismatch(_))));
    }

    #[test]
    fn test_codec_waits_for_complete_frame() {
        let mut codec = HazeCodec::new();
        let mut buffer = BytesMut::new();
        codec.encode(Packet::text("split"), &mut buffer).unwrap();

        let mut partial = buffer.split_to(buffer.len() - 3);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buffer);
        match codec.decode(&mut partial).unwrap() {
            Some(Inbound::Packet(packet)) => match packet.body() {
                PacketBody::Text { text } => assert_eq!(text, "split"),
                _ => panic!("Wrong packet type"),
            },
            other => panic!("Unexpected decode result: {other:?}"),
        }
        assert!(partial.is_empty());
    }

    #[test]
    fn test_codec_rejects_oversized_length_prefix() {
        let mut codec = HazeCodec::new();
        let mut buffer = BytesMut::from(&[0xFF, 0xFF, 0xFF, 0xFF, 0x00][..]);
        let err = codec.decode(&mut buffer).unwrap_err();
        assert!(matches!(err, CodecError::Io(_)));
    }
}
