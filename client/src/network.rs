//! Client side of a Haze connection
//!
//! A [`Client`] is a cheap cloneable handle. The connection's read loop runs
//! on its own task and only holds a weak reference, so dropping the last
//! handle closes the connection.

use haze_shared::{
    Connection, ConnectionError, EndpointId, Failure, FailureInfo, FailureKind, FrameReader,
    IdLease, IdPool, Inbound, Packet, PacketBody, ReadEvent, ServerSnapshot,
};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::config::ClientConfig;
use crate::handler::{ClientHandler, Origin};
use crate::history::{History, Record};
use crate::ping::PingReport;
use crate::resolver::{AddressResolver, SystemResolver};

type WelcomeSender = oneshot::Sender<Result<ServerSnapshot, ConnectionError>>;

/// Arrival instant and server-reported processing time of a ping reply
type PingReply = (Instant, Duration);

#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

struct Shared {
    config: ClientConfig,
    provisional: IdLease,
    assigned: OnceLock<EndpointId>,
    connection: Connection,
    local_address: Option<IpAddr>,
    resolver: Box<dyn AddressResolver>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    connected: bool,
    welcomed_at: Option<Instant>,
    server: Option<ServerSnapshot>,
    sent: History,
    received: History,
    pending_pings: VecDeque<oneshot::Sender<PingReply>>,
    close_reason: Option<String>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn id(&self) -> &EndpointId {
        self.assigned.get().unwrap_or_else(|| self.provisional.id())
    }

    /// Sends without the connected check. The handshake and failure reports
    /// go through here.
    fn send_unguarded(&self, packet: Packet) -> Result<(), ConnectionError> {
        self.state().sent.push(packet.clone());
        self.connection.send(packet)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.connection.close(Some("client dropped".to_string()));
    }
}

impl Client {
    /// Connects, authenticates and waits for the server's welcome.
    pub async fn connect<H: ClientHandler>(
        config: ClientConfig,
        handler: H,
    ) -> Result<Client, ConnectionError> {
        Self::connect_with(config, handler, SystemResolver::new()).await
    }

    pub async fn connect_with<H, R>(
        config: ClientConfig,
        handler: H,
        resolver: R,
    ) -> Result<Client, ConnectionError>
    where
        H: ClientHandler,
        R: AddressResolver + 'static,
    {
        config.validate()?;

        let local_address = match resolver.local_address() {
            Ok(address) => Some(address),
            Err(e) => {
                warn!("Could not resolve local address: {}", e);
                None
            }
        };

        info!("Connecting to {} as '{}'", config.server_addr, config.name);
        let stream = timeout(config.connect_timeout, TcpStream::connect(&config.server_addr))
            .await
            .map_err(|_| ConnectionError::Timeout(config.connect_timeout))??;
        let (connection, reader) = Connection::open(stream)?;

        let shared = Arc::new(Shared {
            provisional: IdPool::global().lease(),
            assigned: OnceLock::new(),
            connection: connection.clone(),
            local_address,
            resolver: Box::new(resolver),
            state: Mutex::new(State::default()),
            config,
        });

        shared.send_unguarded(Packet::authentication(
            shared.config.name.clone(),
            shared.config.tag.clone(),
        ))?;

        let (welcome_tx, welcome_rx) = oneshot::channel();
        tokio::spawn(read_loop(
            Arc::downgrade(&shared),
            connection,
            reader,
            handler,
            welcome_tx,
        ));

        let connect_timeout = shared.config.connect_timeout;
        let client = Client { shared };
        match timeout(connect_timeout, welcome_rx).await {
            Ok(Ok(Ok(server))) => {
                info!(
                    "Joined '{}' as {} at index {:?}",
                    server.name,
                    client.id(),
                    server.index
                );
                Ok(client)
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(ConnectionError::Closed),
            Err(_) => {
                client.shared.connection.close(None);
                Err(ConnectionError::Timeout(connect_timeout))
            }
        }
    }

    /// The effective ID: the server-assigned one once welcomed.
    pub fn id(&self) -> &EndpointId {
        self.shared.id()
    }

    pub fn provisional_id(&self) -> &EndpointId {
        self.shared.provisional.id()
    }

    pub fn assigned_id(&self) -> Option<&EndpointId> {
        self.shared.assigned.get()
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state().connected
    }

    /// Time since the welcome arrived.
    pub fn connected_for(&self) -> Option<Duration> {
        self.shared.state().welcomed_at.map(|at| at.elapsed())
    }

    /// Last roster snapshot received from the server.
    pub fn server(&self) -> Option<ServerSnapshot> {
        self.shared.state().server.clone()
    }

    pub fn local_address(&self) -> Option<IpAddr> {
        self.shared.local_address
    }

    pub async fn public_address(&self) -> io::Result<IpAddr> {
        self.shared.resolver.public_address().await
    }

    pub fn close_reason(&self) -> Option<String> {
        self.shared.state().close_reason.clone()
    }

    pub fn sent_history(&self) -> Vec<Record> {
        self.shared.state().sent.to_vec()
    }

    pub fn received_history(&self) -> Vec<Record> {
        self.shared.state().received.to_vec()
    }

    /// Sends a packet to the server.
    pub fn send(&self, packet: Packet) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        self.shared.send_unguarded(packet)
    }

    /// Sends a packet to another member through the server.
    pub fn send_to_peer(&self, recipient: &EndpointId, packet: Packet) -> Result<(), ConnectionError> {
        self.send(Packet::relay(self.id().clone(), recipient.clone(), packet))
    }

    pub fn set_name(&self, name: impl Into<String>) -> Result<(), ConnectionError> {
        self.send(Packet::name_update(name))
    }

    /// Measures a round trip to the server
    ///
    /// Upload is the time until the ping has been written to the socket.
    /// Download is what remains after subtracting upload and the server's
    /// reported processing time.
    pub async fn ping(&self) -> Result<PingReport, ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let packet = Packet::ping();
        {
            let mut state = self.shared.state();
            state.pending_pings.push_back(reply_tx);
            state.sent.push(packet.clone());
        }

        let started = Instant::now();
        self.shared.connection.send_flushed(packet).await?;
        let upload = started.elapsed();

        let ping_timeout = self.shared.config.ping_timeout;
        let (arrived, server_processing) = timeout(ping_timeout, reply_rx)
            .await
            .map_err(|_| ConnectionError::Timeout(ping_timeout))?
            .map_err(|_| ConnectionError::Closed)?;

        Ok(PingReport::split(
            arrived.saturating_duration_since(started),
            upload,
            server_processing,
        ))
    }

    /// Says goodbye and closes the connection. Returns false if the
    /// connection was already closed.
    pub fn disconnect(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        {
            let mut state = self.shared.state();
            if state.close_reason.is_none() {
                state.close_reason = Some(reason.clone());
            }
            state.connected = false;
        }
        self.shared.connection.close(Some(reason))
    }
}

/// Reads frames until the connection ends, then reports the disconnect
/// exactly once.
async fn read_loop<H: ClientHandler>(
    shared: Weak<Shared>,
    connection: Connection,
    mut reader: FrameReader,
    mut handler: H,
    welcome_tx: WelcomeSender,
) {
    let mut welcome = Some(welcome_tx);

    let reason = loop {
        let frame = match connection.read(&mut reader).await {
            ReadEvent::Frame(frame) => frame,
            ReadEvent::Violation(e) => {
                warn!("Protocol violation from server: {}", e);
                break format!("protocol violation: {e}");
            }
            ReadEvent::Eof => break "connection closed by server".to_string(),
            ReadEvent::Cancelled => break "connection closed".to_string(),
        };

        let Some(live) = shared.upgrade() else {
            break "client dropped".to_string();
        };

        match frame {
            Inbound::Packet(packet) => {
                let arrived = Instant::now();
                if let Some(reason) = handle_packet(&live, packet, arrived, &mut handler, &mut welcome) {
                    break reason;
                }
            }
            Inbound::Unreadable { raw, reason } => {
                if !live.state().connected {
                    break format!("unreadable packet before welcome: {reason}");
                }
                warn!("Unreadable packet from server: {}", reason);
                let info = FailureInfo::new(FailureKind::PayloadMismatch, reason);
                let _ = live.send_unguarded(Packet::failure_report(Packet::raw(raw), info));
            }
        }
    };

    connection.close(None);

    let (reason, connected_for) = match shared.upgrade() {
        Some(live) => {
            let mut state = live.state();
            state.connected = false;
            state.pending_pings.clear();
            let reason = state.close_reason.get_or_insert(reason).clone();
            let connected_for = state.welcomed_at.map(|at| at.elapsed()).unwrap_or_default();
            (reason, connected_for)
        }
        None => (reason, Duration::ZERO),
    };

    if let Some(welcome) = welcome.take() {
        let _ = welcome.send(Err(ConnectionError::Rejected(reason.clone())));
    }

    info!("Disconnected: {}", reason);
    handler.on_disconnected(&reason, connected_for);
}

/// Dispatches one packet. Returns the teardown reason when the server said
/// goodbye.
fn handle_packet<H: ClientHandler>(
    shared: &Shared,
    packet: Packet,
    arrived: Instant,
    handler: &mut H,
    welcome: &mut Option<WelcomeSender>,
) -> Option<String> {
    debug!("Received {}", packet.describe());
    shared.state().received.push(packet.clone());

    match packet.body() {
        PacketBody::Welcome { server } => {
            if let Some(own) = server.own_entry() {
                // Set once; a repeated welcome cannot change the identity.
                let _ = shared.assigned.set(own.id.clone());
            }
            {
                let mut state = shared.state();
                state.connected = true;
                state.welcomed_at.get_or_insert_with(Instant::now);
                state.server = Some(server.clone());
            }
            if let Some(welcome) = welcome.take() {
                let _ = welcome.send(Ok(server.clone()));
            }
            handler.on_connected(server);
        }
        PacketBody::RosterUpdate(update) => {
            shared.state().server = Some(update.server.clone());
            handler.on_roster_update(update);
        }
        PacketBody::Ping {
            server_processing_ms,
        } => {
            let processing = Duration::from_millis(server_processing_ms.unwrap_or(0));
            let mut state = shared.state();
            // Waiters whose ping timed out are skipped.
            while let Some(waiter) = state.pending_pings.pop_front() {
                if waiter.send((arrived, processing)).is_ok() {
                    break;
                }
            }
        }
        PacketBody::PeerRelay { sender, inner, .. } => {
            handle_relayed(shared, sender.clone(), (**inner).clone(), handler);
        }
        PacketBody::OperationFailed { .. } => {
            if let Some(failure) = Failure::from_packet(&packet, None) {
                warn!("Server could not handle {}", failure.cause.describe());
                if let Err(e) = handler.on_operation_failed(&failure) {
                    warn!("Failure handler failed: {}", e);
                }
            }
        }
        PacketBody::Disconnect { reason } => return Some(reason.clone()),
        _ => {
            if let Err(e) = handler.on_data(&Origin::Server, &packet) {
                warn!("Handler rejected {}: {}", packet.describe(), e);
                if !packet.is_failure() {
                    let failure = Packet::failure_report(packet.clone(), e.to_failure_info());
                    if let Err(e) = shared.send_unguarded(failure) {
                        debug!("Failure report dropped: {}", e);
                    }
                }
            }
        }
    }
    None
}

/// A packet another member sent through the server. Failures in handling it
/// go back to that member, not to the server.
fn handle_relayed<H: ClientHandler>(shared: &Shared, sender: EndpointId, inner: Packet, handler: &mut H) {
    if let PacketBody::OperationFailed { .. } = inner.body() {
        if let Some(failure) = Failure::from_packet(&inner, Some(sender)) {
            if let Err(e) = handler.on_operation_failed(&failure) {
                warn!("Failure handler failed: {}", e);
            }
        }
        return;
    }

    let origin = Origin::Peer(sender.clone());
    if let Err(e) = handler.on_data(&origin, &inner) {
        warn!("Handler rejected {} from {}: {}", inner.describe(), sender, e);
        if inner.is_failure() {
            return;
        }
        let failure = Packet::failure_report(inner, e.to_failure_info());
        let reply = Packet::relay(shared.id().clone(), sender, failure);
        if let Err(e) = shared.send_unguarded(reply) {
            debug!("Failure report dropped: {}", e);
        }
    }
}
