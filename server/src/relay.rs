//! Peer relay routing.
//!
//! The server forwards `PeerRelay` packets between members without looking
//! at what they carry. The declared sender is always replaced with the ID of
//! the connection the packet arrived on, which can grow the frame; a relay
//! that no longer fits in one frame is bounced instead of forwarded.

use haze_shared::codec::frame_len;
use haze_shared::{EndpointId, FailureInfo, FailureKind, Packet, PacketBody, MAX_FRAME_LENGTH};

use crate::client_manager::ClientManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Forward `packet` to `recipient`
    Deliver { recipient: EndpointId, packet: Packet },
    /// Send this failure back to the sender
    Bounce(Packet),
    /// Undeliverable failure report; answering it could start a failure loop
    Discarded,
}

/// Decides where a relay packet from `sender` goes.
///
/// A member may address itself; the packet comes back to it like any other
/// delivery.
pub fn route(roster: &ClientManager, sender: &EndpointId, packet: Packet) -> RelayOutcome {
    let packet = packet.with_sender(sender.clone());

    let recipient = match packet.body() {
        PacketBody::PeerRelay { recipient, .. } => recipient.clone(),
        _ => {
            let info = FailureInfo::new(
                FailureKind::PayloadMismatch,
                format!("{:?} packet cannot be relayed", packet.kind()),
            );
            return RelayOutcome::Bounce(Packet::failure_report(packet, info));
        }
    };

    let info = if !roster.is_member(&recipient) {
        FailureInfo::recipient_not_found(&recipient)
    } else {
        match frame_len(&packet) {
            Ok(size) if size <= MAX_FRAME_LENGTH => {
                return RelayOutcome::Deliver { recipient, packet };
            }
            Ok(size) => FailureInfo::too_large(size),
            Err(e) => FailureInfo::new(FailureKind::PayloadMismatch, e.to_string()),
        }
    };

    if packet.is_failure() {
        return RelayOutcome::Discarded;
    }
    RelayOutcome::Bounce(Packet::failure_report(packet, info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ServerClient;
    use crate::client_manager::Validation;
    use haze_shared::{Connection, IdPool};

    fn roster_with(pool: &IdPool, names: &[&str]) -> (ClientManager, Vec<EndpointId>) {
        let mut manager = ClientManager::new(8);
        let mut ids = Vec::new();
        for name in names {
            let (connection, _outbox) = Connection::detached("127.0.0.1:8080".parse().unwrap());
            let client = ServerClient::new(pool.lease(), connection);
            let id = client.id().clone();
            manager.enqueue(client);
            assert!(matches!(
                manager.validate(&id, name.to_string(), None),
                Validation::Admitted(_)
            ));
            ids.push(id);
        }
        (manager, ids)
    }

    #[test]
    fn test_deliver_to_present_recipient() {
        let pool = IdPool::new();
        let (roster, ids) = roster_with(&pool, &["alice", "bob"]);
        let inner = Packet::text("hello bob").with_tag(vec![5]);
        let packet = Packet::relay(ids[0].clone(), ids[1].clone(), inner.clone());

        match route(&roster, &ids[0], packet) {
            RelayOutcome::Deliver { recipient, packet } => {
                assert_eq!(recipient, ids[1]);
                match packet.body() {
                    PacketBody::PeerRelay { inner: delivered, .. } => {
                        assert_eq!(**delivered, inner)
                    }
                    _ => panic!("Wrong packet type"),
                }
            }
            other => panic!("Unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_spoofed_sender_is_corrected() {
        let pool = IdPool::new();
        let (roster, ids) = roster_with(&pool, &["alice", "bob"]);
        let packet = Packet::relay(
            EndpointId::from_string("mallory"),
            ids[1].clone(),
            Packet::text("trust me"),
        );

        match route(&roster, &ids[0], packet) {
            RelayOutcome::Deliver { packet, .. } => match packet.body() {
                PacketBody::PeerRelay { sender, .. } => assert_eq!(sender, &ids[0]),
                _ => panic!("Wrong packet type"),
            },
            other => panic!("Unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_absent_recipient_bounces() {
        let pool = IdPool::new();
        let (roster, ids) = roster_with(&pool, &["alice"]);
        let ghost = EndpointId::from_string("ghost");
        let packet = Packet::relay(ids[0].clone(), ghost.clone(), Packet::text("anyone?"));

        match route(&roster, &ids[0], packet) {
            RelayOutcome::Bounce(failure) => match failure.body() {
                PacketBody::OperationFailed { cause, error } => {
                    assert_eq!(cause.kind(), haze_shared::PacketKind::PeerRelay);
                    assert_eq!(
                        error.as_ref().map(|e| e.kind),
                        Some(FailureKind::RecipientNotFound)
                    );
                }
                _ => panic!("Wrong packet type"),
            },
            other => panic!("Unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_self_relay_is_delivered() {
        let pool = IdPool::new();
        let (roster, ids) = roster_with(&pool, &["alice"]);
        let packet = Packet::relay(ids[0].clone(), ids[0].clone(), Packet::text("me"));

        assert!(matches!(
            route(&roster, &ids[0], packet),
            RelayOutcome::Deliver { recipient, .. } if recipient == ids[0]
        ));
    }

    #[test]
    fn test_relay_grown_past_frame_limit_bounces() {
        let pool = IdPool::new();
        let (roster, ids) = roster_with(&pool, &["mallory", "victim"]);
        let short_sender = EndpointId::from_string("x");

        // Exactly one frame as sent; the sender rewrite pushes it over.
        let empty = Packet::relay(short_sender.clone(), ids[1].clone(), Packet::raw(Vec::new()));
        let room = MAX_FRAME_LENGTH - frame_len(&empty).unwrap();
        let packet = Packet::relay(short_sender, ids[1].clone(), Packet::raw(vec![7; room]));
        assert_eq!(frame_len(&packet).unwrap(), MAX_FRAME_LENGTH);

        match route(&roster, &ids[0], packet) {
            RelayOutcome::Bounce(failure) => {
                assert!(haze_shared::codec::fits_in_frame(&failure));
                match failure.body() {
                    PacketBody::OperationFailed { cause, error } => {
                        assert_eq!(error.as_ref().map(|e| e.kind), Some(FailureKind::TooLarge));
                        assert!(matches!(
                            cause.body(),
                            PacketBody::PeerRelay { sender, recipient, .. }
                                if sender == &ids[0] && recipient == &ids[1]
                        ));
                    }
                    _ => panic!("Wrong packet type"),
                }
            }
            other => panic!("Unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_near_limit_bounce_still_fits() {
        let pool = IdPool::new();
        let (roster, ids) = roster_with(&pool, &["alice"]);
        let ghost = EndpointId::from_string("ghost");
        let packet = Packet::relay(ids[0].clone(), ghost, Packet::raw(vec![1; MAX_FRAME_LENGTH - 200]));

        match route(&roster, &ids[0], packet) {
            RelayOutcome::Bounce(failure) => {
                assert!(haze_shared::codec::fits_in_frame(&failure));
                assert!(matches!(
                    failure.body(),
                    PacketBody::OperationFailed { error: Some(info), .. }
                        if info.kind == FailureKind::RecipientNotFound
                ));
            }
            other => panic!("Unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_undeliverable_failure_is_discarded() {
        let pool = IdPool::new();
        let (roster, ids) = roster_with(&pool, &["alice"]);
        let failure = Packet::operation_failed(Packet::text("x"), None);
        let packet = Packet::relay(ids[0].clone(), EndpointId::from_string("gone"), failure);

        assert_eq!(route(&roster, &ids[0], packet), RelayOutcome::Discarded);
    }

    #[test]
    fn test_non_relay_packet_bounces() {
        let pool = IdPool::new();
        let (roster, ids) = roster_with(&pool, &["alice"]);

        assert!(matches!(
            route(&roster, &ids[0], Packet::text("not a relay")),
            RelayOutcome::Bounce(_)
        ));
    }
}
