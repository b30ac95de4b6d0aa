//! Application hooks for client events.

use haze_shared::{EndpointId, Failure, HandlerError, Packet, RosterUpdate, ServerSnapshot};
use std::time::Duration;
use tokio::sync::mpsc;

/// Where a data packet came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Server,
    /// Relayed from another member
    Peer(EndpointId),
}

/// Callbacks invoked from the client's read loop
///
/// An error from [`on_data`](ClientHandler::on_data) is reported back to
/// whoever sent the packet, through the relay when it came from a peer.
pub trait ClientHandler: Send + 'static {
    fn on_connected(&mut self, _server: &ServerSnapshot) {}

    fn on_roster_update(&mut self, _update: &RosterUpdate) {}

    /// Called exactly once, when the connection is gone.
    fn on_disconnected(&mut self, _reason: &str, _connected_for: Duration) {}

    fn on_data(&mut self, _origin: &Origin, _packet: &Packet) -> Result<(), HandlerError> {
        Ok(())
    }

    fn on_operation_failed(&mut self, _failure: &Failure) -> Result<(), HandlerError> {
        Ok(())
    }
}

impl ClientHandler for () {}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected(ServerSnapshot),
    RosterUpdated(RosterUpdate),
    Disconnected {
        reason: String,
        connected_for: Duration,
    },
    Data {
        origin: Origin,
        packet: Packet,
    },
    OperationFailed(Failure),
}

/// Forwards every client event to a channel
pub struct ChannelHandler {
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl ChannelHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, rx)
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

impl ClientHandler for ChannelHandler {
    fn on_connected(&mut self, server: &ServerSnapshot) {
        self.emit(ClientEvent::Connected(server.clone()));
    }

    fn on_roster_update(&mut self, update: &RosterUpdate) {
        self.emit(ClientEvent::RosterUpdated(update.clone()));
    }

    fn on_disconnected(&mut self, reason: &str, connected_for: Duration) {
        self.emit(ClientEvent::Disconnected {
            reason: reason.to_string(),
            connected_for,
        });
    }

    fn on_data(&mut self, origin: &Origin, packet: &Packet) -> Result<(), HandlerError> {
        self.emit(ClientEvent::Data {
            origin: origin.clone(),
            packet: packet.clone(),
        });
        Ok(())
    }

    fn on_operation_failed(&mut self, failure: &Failure) -> Result<(), HandlerError> {
        self.emit(ClientEvent::OperationFailed(failure.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_handler_forwards_events() {
        let (mut handler, mut events) = ChannelHandler::new();
        let peer = EndpointId::from_string("peer");

        handler
            .on_data(&Origin::Peer(peer.clone()), &Packet::text("hi"))
            .unwrap();
        handler.on_disconnected("bye", Duration::from_millis(10));

        match events.try_recv() {
            Ok(ClientEvent::Data { origin, .. }) => assert_eq!(origin, Origin::Peer(peer)),
            other => panic!("Unexpected event: {other:?}"),
        }
        assert!(matches!(
            events.try_recv(),
            Ok(ClientEvent::Disconnected { reason, .. }) if reason == "bye"
        ));
    }
}
