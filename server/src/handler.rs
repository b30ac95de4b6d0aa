//! Application hooks for server events.

use haze_shared::{Departure, EndpointId, Failure, HandlerError, MemberSnapshot, Packet};
use tokio::sync::mpsc;

/// Callbacks the server actor invokes as the roster changes and data arrives
///
/// All methods run on the actor task, one at a time, so they should return
/// quickly. Errors from [`on_data`](ServerHandler::on_data) are sent back to
/// the sender as an operation failure.
pub trait ServerHandler: Send + 'static {
    fn on_connected(&mut self, _member: &MemberSnapshot) {}

    /// A queued connection was dropped before it authenticated.
    fn on_invalidated(&mut self, _id: &EndpointId, _reason: &str) {}

    fn on_disconnected(&mut self, _departure: &Departure) {}

    fn on_name_changed(&mut self, _member: &MemberSnapshot, _old_name: &str) {}

    fn on_data(&mut self, _sender: &MemberSnapshot, _packet: &Packet) -> Result<(), HandlerError> {
        Ok(())
    }

    /// A member reported that something the server sent could not be handled.
    /// An error here is logged and never answered.
    fn on_operation_failed(
        &mut self,
        _reporter: &MemberSnapshot,
        _failure: &Failure,
    ) -> Result<(), HandlerError> {
        Ok(())
    }
}

impl ServerHandler for () {}

#[derive(Debug, Clone)]
pub enum ServerEvent {
    Connected(MemberSnapshot),
    Invalidated { id: EndpointId, reason: String },
    Disconnected(Departure),
    NameChanged { member: MemberSnapshot, old_name: String },
    Data { sender: MemberSnapshot, packet: Packet },
    OperationFailed { reporter: MemberSnapshot, failure: Failure },
}

/// Forwards every server event to a channel
pub struct ChannelHandler {
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl ChannelHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, rx)
    }

    fn emit(&self, event: ServerEvent) {
        // Receiver gone means nobody is listening; not an error.
        let _ = self.events.send(event);
    }
}

impl ServerHandler for ChannelHandler {
    fn on_connected(&mut self, member: &MemberSnapshot) {
        self.emit(ServerEvent::Connected(member.clone()));
    }

    fn on_invalidated(&mut self, id: &EndpointId, reason: &str) {
        self.emit(ServerEvent::Invalidated {
            id: id.clone(),
            reason: reason.to_string(),
        });
    }

    fn on_disconnected(&mut self, departure: &Departure) {
        self.emit(ServerEvent::Disconnected(departure.clone()));
    }

    fn on_name_changed(&mut self, member: &MemberSnapshot, old_name: &str) {
        self.emit(ServerEvent::NameChanged {
            member: member.clone(),
            old_name: old_name.to_string(),
        });
    }

    fn on_data(&mut self, sender: &MemberSnapshot, packet: &Packet) -> Result<(), HandlerError> {
        self.emit(ServerEvent::Data {
            sender: sender.clone(),
            packet: packet.clone(),
        });
        Ok(())
    }

    fn on_operation_failed(
        &mut self,
        reporter: &MemberSnapshot,
        failure: &Failure,
    ) -> Result<(), HandlerError> {
        self.emit(ServerEvent::OperationFailed {
            reporter: reporter.clone(),
            failure: failure.clone(),
        });
        Ok(())
    }
}
