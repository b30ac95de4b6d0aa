//! The packet envelope and every message kind of the protocol.
//!
//! A [`Packet`] is an immutable envelope: a typed [`PacketBody`], the instant
//! it was sent and an optional opaque tag. Some bodies carry structured
//! fields only (a disconnect reason, a roster snapshot); `Generic` carries an
//! application value serialized with bincode that only the intended receiver
//! knows how to [`unpack`](Packet::unpack).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec::{fits_in_frame, MAX_FRAME_LENGTH};
use crate::error::CodecError;
use crate::id::EndpointId;
use crate::snapshot::{RosterUpdate, ServerSnapshot};
use crate::utils::get_timestamp;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketBody {
    /// First message on every connection: the presented name and tag
    Authentication {
        name: String,
        tag: Option<Vec<u8>>,
    },
    /// Server reply to a successful authentication
    Welcome {
        server: ServerSnapshot,
    },
    RosterUpdate(RosterUpdate),
    NameUpdate {
        name: String,
    },
    /// Sent bare by clients; echoed by the server with its processing time
    Ping {
        server_processing_ms: Option<u64>,
    },
    /// A packet the server forwards to another endpoint without reading it
    PeerRelay {
        sender: EndpointId,
        recipient: EndpointId,
        inner: Box<Packet>,
    },
    OperationFailed {
        cause: Box<Packet>,
        error: Option<FailureInfo>,
    },
    Disconnect {
        reason: String,
    },
    Text {
        text: String,
    },
    Generic {
        payload: Vec<u8>,
    },
}

/// Discriminant of a [`PacketBody`], handy for logging and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Authentication,
    Welcome,
    RosterUpdate,
    NameUpdate,
    Ping,
    PeerRelay,
    OperationFailed,
    Disconnect,
    Text,
    Generic,
}

impl PacketBody {
    pub fn kind(&self) -> PacketKind {
        match self {
            PacketBody::Authentication { .. } => PacketKind::Authentication,
            PacketBody::Welcome { .. } => PacketKind::Welcome,
            PacketBody::RosterUpdate(_) => PacketKind::RosterUpdate,
            PacketBody::NameUpdate { .. } => PacketKind::NameUpdate,
            PacketBody::Ping { .. } => PacketKind::Ping,
            PacketBody::PeerRelay { .. } => PacketKind::PeerRelay,
            PacketBody::OperationFailed { .. } => PacketKind::OperationFailed,
            PacketBody::Disconnect { .. } => PacketKind::Disconnect,
            PacketBody::Text { .. } => PacketKind::Text,
            PacketBody::Generic { .. } => PacketKind::Generic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    RecipientNotFound,
    PayloadMismatch,
    HandlerFailed,
    AlreadyAuthenticated,
    /// The packet would not fit in one frame
    TooLarge,
}

/// Why an operation failed, in the form that crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureInfo {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn recipient_not_found(recipient: &EndpointId) -> Self {
        Self::new(
            FailureKind::RecipientNotFound,
            format!("recipient {recipient} not found"),
        )
    }

    pub fn too_large(size: usize) -> Self {
        Self::new(
            FailureKind::TooLarge,
            format!("{size} byte frame exceeds the {MAX_FRAME_LENGTH} byte limit"),
        )
    }
}

impl fmt::Display for FailureInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// A received operation failure, as surfaced to application handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// The packet that could not be processed
    pub cause: Packet,
    pub error: Option<FailureInfo>,
    /// The remote peer at fault, when the failure concerns a relayed packet
    pub peer: Option<EndpointId>,
}

impl Failure {
    /// Extracts the failure carried by an operation-failed packet.
    pub fn from_packet(packet: &Packet, peer: Option<EndpointId>) -> Option<Self> {
        match packet.body() {
            PacketBody::OperationFailed { cause, error } => {
                // A bounced relay names the peer that could not be reached.
                let peer = peer.or_else(|| match cause.body() {
                    PacketBody::PeerRelay { recipient, .. } => Some(recipient.clone()),
                    _ => None,
                });
                Some(Self {
                    cause: (**cause).clone(),
                    error: error.clone(),
                    peer,
                })
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    body: PacketBody,
    sent_at: u64,
    tag: Option<Vec<u8>>,
}

impl Packet {
    pub fn new(body: PacketBody) -> Self {
        Self {
            body,
            sent_at: get_timestamp(),
            tag: None,
        }
    }

    pub fn authentication(name: impl Into<String>, tag: Option<Vec<u8>>) -> Self {
        Self::new(PacketBody::Authentication {
            name: name.into(),
            tag,
        })
    }

    pub fn welcome(server: ServerSnapshot) -> Self {
        Self::new(PacketBody::Welcome { server })
    }

    pub fn roster_update(update: RosterUpdate) -> Self {
        Self::new(PacketBody::RosterUpdate(update))
    }

    pub fn name_update(name: impl Into<String>) -> Self {
        Self::new(PacketBody::NameUpdate { name: name.into() })
    }

    pub fn ping() -> Self {
        Self::new(PacketBody::Ping {
            server_processing_ms: None,
        })
    }

    pub fn ping_reply(server_processing_ms: u64) -> Self {
        Self::new(PacketBody::Ping {
            server_processing_ms: Some(server_processing_ms),
        })
    }

    pub fn relay(sender: EndpointId, recipient: EndpointId, inner: Packet) -> Self {
        Self::new(PacketBody::PeerRelay {
            sender,
            recipient,
            inner: Box::new(inner),
        })
    }

    /// Failure report for `cause`. If the report would not fit in a frame,
    /// the cause is replaced by its [`without_payload`](Self::without_payload)
    /// stand-in.
    pub fn failure_report(cause: Packet, error: FailureInfo) -> Self {
        let stand_in = cause.without_payload();
        let report = Self::operation_failed(cause, Some(error.clone()));
        if fits_in_frame(&report) {
            report
        } else {
            Self::operation_failed(stand_in, Some(error))
        }
    }

    pub fn operation_failed(cause: Packet, error: Option<FailureInfo>) -> Self {
        Self::new(PacketBody::OperationFailed {
            cause: Box::new(cause),
            error,
        })
    }

    pub fn disconnect(reason: impl Into<String>) -> Self {
        Self::new(PacketBody::Disconnect {
            reason: reason.into(),
        })
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(PacketBody::Text { text: text.into() })
    }

    /// Wraps an application value as an opaque payload.
    pub fn generic<T: Serialize>(value: &T) -> Result<Self, CodecError> {
        let payload = bincode::serialize(value).map_err(CodecError::Malformed)?;
        Ok(Self::raw(payload))
    }

    pub fn raw(payload: Vec<u8>) -> Self {
        Self::new(PacketBody::Generic { payload })
    }

    pub fn with_tag(mut self, tag: Vec<u8>) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn body(&self) -> &PacketBody {
        &self.body
    }

    pub fn into_body(self) -> PacketBody {
        self.body
    }

    pub fn kind(&self) -> PacketKind {
        self.body.kind()
    }

    /// Unix milliseconds of the last time this packet was encoded.
    pub fn sent_at(&self) -> u64 {
        self.sent_at
    }

    pub fn tag(&self) -> Option<&[u8]> {
        self.tag.as_deref()
    }

    pub(crate) fn stamp(&mut self) {
        self.sent_at = get_timestamp();
    }

    /// Decodes the opaque payload of a `Generic` packet as `T`.
    pub fn unpack<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        match &self.body {
            PacketBody::Generic { payload } => bincode::deserialize(payload).map_err(|e| {
                CodecError::PayloadMismatch(format!(
                    "payload is not a {}: {e}",
                    std::any::type_name::<T>()
                ))
            }),
            other => Err(CodecError::PayloadMismatch(format!(
                "{:?} packet has no payload",
                other.kind()
            ))),
        }
    }

    /// Whether this packet reports a failure, directly or through a relay.
    pub fn is_failure(&self) -> bool {
        match &self.body {
            PacketBody::OperationFailed { .. } => true,
            PacketBody::PeerRelay { inner, .. } => inner.is_failure(),
            _ => false,
        }
    }

    /// The same packet with its payload and tag removed. Relays keep their
    /// sender and recipient.
    pub fn without_payload(&self) -> Packet {
        let body = match &self.body {
            PacketBody::PeerRelay {
                sender,
                recipient,
                inner,
            } => PacketBody::PeerRelay {
                sender: sender.clone(),
                recipient: recipient.clone(),
                inner: Box::new(inner.without_payload()),
            },
            _ => PacketBody::Generic {
                payload: Vec::new(),
            },
        };
        Packet {
            body,
            sent_at: self.sent_at,
            tag: None,
        }
    }

    /// Replaces the sender of a relay packet, leaving everything else as is.
    pub fn with_sender(mut self, authenticated: EndpointId) -> Self {
        if let PacketBody::PeerRelay { sender, .. } = &mut self.body {
            *sender = authenticated;
        }
        self
    }

    /// Short one-line description for logs.
    pub fn describe(&self) -> String {
        match &self.body {
            PacketBody::Authentication { name, .. } => format!("Authentication({name})"),
            PacketBody::Welcome { server } => format!("Welcome({} members)", server.size),
            PacketBody::RosterUpdate(update) => format!("RosterUpdate({} members)", update.server.size),
            PacketBody::NameUpdate { name } => format!("NameUpdate({name})"),
            PacketBody::Ping {
                server_processing_ms,
            } => match server_processing_ms {
                Some(ms) => format!("Ping(reply, {ms}ms)"),
                None => "Ping".to_string(),
            },
            PacketBody::PeerRelay {
                sender,
                recipient,
                inner,
            } => format!("PeerRelay({sender} -> {recipient}: {})", inner.describe()),
            PacketBody::OperationFailed { cause, error } => match error {
                Some(info) => format!("OperationFailed({}, {info})", cause.describe()),
                None => format!("OperationFailed({})", cause.describe()),
            },
            PacketBody::Disconnect { reason } => format!("Disconnect({reason})"),
            PacketBody::Text { text } => format!("Text({} chars)", text.len()),
            PacketBody::Generic { payload } => format!("Generic({} bytes)", payload.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Move {
        x: i32,
        y: i32,
    }

    #[test]
    fn test_generic_unpack() {
        let packet = Packet::generic(&Move { x: 3, y: -4 }).unwrap();
        assert_eq!(packet.kind(), PacketKind::Generic);
        assert_eq!(packet.unpack::<Move>().unwrap(), Move { x: 3, y: -4 });
    }

    #[test]
    fn test_unpack_wrong_type_is_payload_mismatch() {
        let packet = Packet::generic(&7u8).unwrap();
        let err = packet.unpack::<Move>().unwrap_err();
        assert!(matches!(err, CodecError::PayloadMismatch(_)));
        assert!(!err.is_fatal());

        let err = Packet::text("hello").unpack::<String>().unwrap_err();
        assert!(matches!(err, CodecError::PayloadMismatch(_)));
    }

    #[test]
    fn test_is_failure_sees_through_relay() {
        let failure = Packet::operation_failed(Packet::text("x"), None);
        assert!(failure.is_failure());

        let relayed = Packet::relay(
            EndpointId::from_string("a"),
            EndpointId::from_string("b"),
            failure,
        );
        assert!(relayed.is_failure());
        assert!(!Packet::text("plain").is_failure());
    }

    #[test]
    fn test_with_sender_only_touches_sender() {
        let original = Packet::relay(
            EndpointId::from_string("spoofed"),
            EndpointId::from_string("bob"),
            Packet::text("hi"),
        )
        .with_tag(vec![9]);
        let sent_at = original.sent_at();

        let corrected = original.with_sender(EndpointId::from_string("alice"));
        match corrected.body() {
            PacketBody::PeerRelay {
                sender,
                recipient,
                inner,
            } => {
                assert_eq!(sender.as_str(), "alice");
                assert_eq!(recipient.as_str(), "bob");
                assert_eq!(inner.body(), Packet::text("hi").body());
            }
            _ => panic!("Wrong packet type"),
        }
        assert_eq!(corrected.tag(), Some(&[9u8][..]));
        assert_eq!(corrected.sent_at(), sent_at);
    }

    #[test]
    fn test_failure_from_bounced_relay_names_recipient() {
        let relay = Packet::relay(
            EndpointId::from_string("alice"),
            EndpointId::from_string("ghost"),
            Packet::text("anyone there?"),
        );
        let bounce = Packet::operation_failed(
            relay,
            Some(FailureInfo::recipient_not_found(&EndpointId::from_string("ghost"))),
        );

        let failure = Failure::from_packet(&bounce, None).unwrap();
        assert_eq!(failure.peer, Some(EndpointId::from_string("ghost")));
        assert_eq!(
            failure.error.map(|e| e.kind),
            Some(FailureKind::RecipientNotFound)
        );
        assert!(Failure::from_packet(&Packet::ping(), None).is_none());
    }

    #[test]
    fn test_oversized_failure_report_keeps_routing() {
        let relay = Packet::relay(
            EndpointId::from_string("alice"),
            EndpointId::from_string("bob"),
            Packet::raw(vec![1; MAX_FRAME_LENGTH - 100]),
        );
        let report = Packet::failure_report(relay, FailureInfo::too_large(MAX_FRAME_LENGTH + 1));
        assert!(fits_in_frame(&report));

        let failure = Failure::from_packet(&report, None).unwrap();
        assert_eq!(failure.peer, Some(EndpointId::from_string("bob")));
        assert_eq!(failure.error.map(|e| e.kind), Some(FailureKind::TooLarge));
        match failure.cause.body() {
            PacketBody::PeerRelay { sender, inner, .. } => {
                assert_eq!(sender.as_str(), "alice");
                assert!(matches!(inner.body(), PacketBody::Generic { payload } if payload.is_empty()));
            }
            other => panic!("Expected relay, got {:?}", other.kind()),
        }
    }

    #[test]
    fn test_small_failure_report_keeps_cause() {
        let cause = Packet::text("keep me").with_tag(vec![3]);
        let report = Packet::failure_report(cause.clone(), FailureInfo::new(FailureKind::HandlerFailed, "no"));
        assert_eq!(Failure::from_packet(&report, None).map(|f| f.cause), Some(cause));
    }
}
