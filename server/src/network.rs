//! Server network layer: accept loop, per-connection tasks and the roster actor
//!
//! One actor task owns the [`ClientManager`] and the listener. Connection
//! readers, validation timers and [`ServerHandle`] commands all talk to it
//! through a single channel, so every roster change is serialized.

use haze_shared::utils::duration_ms;
use haze_shared::{
    Connection, ConnectionError, Departure, EndpointId, Failure, FailureInfo, FailureKind,
    FrameReader, IdLease, IdPool, Inbound, MemberSnapshot, Packet, PacketBody, PacketKind,
    ReadEvent, RosterUpdate, ServerSnapshot,
};
use log::{debug, error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::client::ServerClient;
use crate::client_manager::{ClientManager, Validation};
use crate::config::ServerConfig;
use crate::handler::ServerHandler;
use crate::relay::{self, RelayOutcome};

/// Farewell sent to every member when the server shuts down
pub const CLOSED_REASON: &str = "server is closed";

static INSTANCES: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No member at index {0}")]
    NoSuchMember(usize),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Server is not running")]
    Stopped,
}

/// Messages sent to the server actor
#[derive(Debug)]
enum ServerMessage {
    FrameReceived {
        id: EndpointId,
        frame: Inbound,
        received_at: Instant,
    },
    ConnectionLost {
        id: EndpointId,
        reason: String,
    },
    ValidationExpired {
        id: EndpointId,
    },
    Command(ServerCommand),
}

#[derive(Debug)]
enum ServerCommand {
    Send {
        index: usize,
        packet: Packet,
        reply: oneshot::Sender<Result<(), ServerError>>,
    },
    Broadcast {
        packet: Packet,
        exclude: Option<usize>,
    },
    Kick {
        index: usize,
        reason: String,
        reply: oneshot::Sender<Result<(), ServerError>>,
    },
    SetMaxClients {
        max_clients: usize,
    },
    SendUpdates,
    Roster {
        reply: oneshot::Sender<ServerSnapshot>,
    },
    Shutdown {
        reason: String,
        done: oneshot::Sender<()>,
    },
}

/// Cloneable control surface for a running server
#[derive(Debug, Clone)]
pub struct ServerHandle {
    id: EndpointId,
    local_addr: SocketAddr,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ServerHandle {
    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn command(&self, command: ServerCommand) -> Result<(), ServerError> {
        self.server_tx
            .send(ServerMessage::Command(command))
            .map_err(|_| ServerError::Stopped)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ServerCommand,
    ) -> Result<T, ServerError> {
        let (reply, response) = oneshot::channel();
        self.command(build(reply))?;
        response.await.map_err(|_| ServerError::Stopped)
    }

    /// Sends a packet to the member at `index`.
    pub async fn send(&self, index: usize, packet: Packet) -> Result<(), ServerError> {
        self.request(|reply| ServerCommand::Send {
            index,
            packet,
            reply,
        })
        .await?
    }

    /// Sends a packet to every member, optionally skipping one index.
    pub fn broadcast(&self, packet: Packet, exclude: Option<usize>) -> Result<(), ServerError> {
        self.command(ServerCommand::Broadcast { packet, exclude })
    }

    /// Disconnects the member at `index`, telling it why.
    pub async fn kick(&self, index: usize, reason: impl Into<String>) -> Result<(), ServerError> {
        let reason = reason.into();
        self.request(|reply| ServerCommand::Kick {
            index,
            reason,
            reply,
        })
        .await?
    }

    /// Changes the capacity. Members beyond the new limit are disconnected.
    pub fn set_max_clients(&self, max_clients: usize) -> Result<(), ServerError> {
        self.command(ServerCommand::SetMaxClients { max_clients })
    }

    /// Sends every member a fresh roster snapshot.
    pub fn send_updates(&self) -> Result<(), ServerError> {
        self.command(ServerCommand::SendUpdates)
    }

    pub async fn roster(&self) -> Result<ServerSnapshot, ServerError> {
        self.request(|reply| ServerCommand::Roster { reply }).await
    }

    /// Disconnects everyone with `reason` and stops the server.
    pub async fn shutdown(&self, reason: impl Into<String>) -> Result<(), ServerError> {
        let reason = reason.into();
        self.request(|done| ServerCommand::Shutdown { reason, done })
            .await
    }

    pub async fn close(&self) -> Result<(), ServerError> {
        self.shutdown(CLOSED_REASON).await
    }
}

/// Keeps the process-wide server count while a server is alive
#[derive(Debug)]
struct InstanceGuard;

impl InstanceGuard {
    fn new() -> Self {
        INSTANCES.fetch_add(1, Ordering::SeqCst);
        InstanceGuard
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        INSTANCES.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Main server coordinating admission, dispatch and roster broadcasts
pub struct Server<H: ServerHandler = ()> {
    lease: IdLease,
    config: ServerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    clients: ClientManager,
    handler: H,
    pool: IdPool,
    stopping: bool,
    _instance: InstanceGuard,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl<H: ServerHandler> Server<H> {
    pub async fn bind(config: ServerConfig, handler: H) -> Result<Self, ServerError> {
        config.validate()?;

        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let pool = IdPool::global().clone();
        let (server_tx, server_rx) = mpsc::unbounded_channel();

        info!("Server '{}' listening on {}", config.name, local_addr);

        Ok(Server {
            lease: pool.lease(),
            clients: ClientManager::new(config.max_clients),
            config,
            listener,
            local_addr,
            handler,
            pool,
            stopping: false,
            _instance: InstanceGuard::new(),
            server_tx,
            server_rx,
        })
    }

    /// Number of servers currently bound in this process
    pub fn instance_count() -> usize {
        INSTANCES.load(Ordering::SeqCst)
    }

    pub fn id(&self) -> &EndpointId {
        self.lease.id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            id: self.id().clone(),
            local_addr: self.local_addr,
            server_tx: self.server_tx.clone(),
        }
    }

    /// Runs the server on its own task.
    pub fn spawn(self) -> (ServerHandle, JoinHandle<Result<(), ServerError>>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run()))
    }

    /// Main server loop
    ///
    /// The listener is only polled while there is room for another
    /// connection, so a burst beyond capacity waits in the OS backlog.
    pub async fn run(mut self) -> Result<(), ServerError> {
        info!("Server started successfully");

        loop {
            tokio::select! {
                accepted = self.listener.accept(), if self.clients.has_capacity() => {
                    match accepted {
                        Ok((stream, addr)) => self.accept(stream, addr),
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                            self.shutdown(CLOSED_REASON);
                            return Err(ServerError::Io(e));
                        }
                    }
                },

                message = self.server_rx.recv() => {
                    match message {
                        Some(message) => self.handle_message(message),
                        None => break,
                    }
                },
            }

            if self.stopping {
                break;
            }
        }

        info!("Server '{}' stopped", self.config.name);
        Ok(())
    }

    fn accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        let (connection, reader) = match Connection::open(stream) {
            Ok(opened) => opened,
            Err(e) => {
                warn!("Failed to set up connection from {}: {}", addr, e);
                return;
            }
        };

        let client = ServerClient::new(self.pool.lease(), connection.clone());
        let id = client.id().clone();
        info!("Connection {} accepted from {}", id, addr);

        self.clients.enqueue(client);
        spawn_reader(id.clone(), connection.clone(), reader, self.server_tx.clone());
        spawn_validation_timer(
            id,
            connection,
            self.config.validation_timeout,
            self.server_tx.clone(),
        );
    }

    fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::FrameReceived {
                id,
                frame,
                received_at,
            } => self.handle_frame(&id, frame, received_at),
            ServerMessage::ConnectionLost { id, reason } => {
                if self.clients.is_pending(&id) {
                    self.invalidate(&id, &reason);
                } else {
                    self.disconnect(&id, &reason, false);
                }
            }
            ServerMessage::ValidationExpired { id } => {
                if self.clients.is_pending(&id) {
                    self.invalidate(&id, "validation timed out");
                }
            }
            ServerMessage::Command(command) => self.handle_command(command),
        }
    }

    fn handle_command(&mut self, command: ServerCommand) {
        match command {
            ServerCommand::Send {
                index,
                packet,
                reply,
            } => {
                let result = match self.clients.by_index(index) {
                    Some(client) => client.send(packet).map_err(ServerError::from),
                    None => Err(ServerError::NoSuchMember(index)),
                };
                let _ = reply.send(result);
            }
            ServerCommand::Broadcast { packet, exclude } => {
                for client in self.clients.members() {
                    if client.index() == exclude {
                        continue;
                    }
                    if let Err(e) = client.send(packet.clone()) {
                        debug!("Broadcast to {} skipped: {}", client.id(), e);
                    }
                }
            }
            ServerCommand::Kick {
                index,
                reason,
                reply,
            } => {
                let result = match self.clients.by_index(index).map(|c| c.id().clone()) {
                    Some(id) => {
                        self.disconnect(&id, &reason, true);
                        Ok(())
                    }
                    None => Err(ServerError::NoSuchMember(index)),
                };
                let _ = reply.send(result);
            }
            ServerCommand::SetMaxClients { max_clients } => {
                info!(
                    "Capacity changed from {} to {}",
                    self.clients.max_clients(),
                    max_clients
                );
                for id in self.clients.set_max_clients(max_clients) {
                    self.disconnect(&id, "server capacity reduced", true);
                }
            }
            ServerCommand::SendUpdates => self.send_updates(),
            ServerCommand::Roster { reply } => {
                let _ = reply.send(self.clients.snapshot(self.id(), &self.config.name, None));
            }
            ServerCommand::Shutdown { reason, done } => {
                self.shutdown(&reason);
                let _ = done.send(());
            }
        }
    }

    fn handle_frame(&mut self, id: &EndpointId, frame: Inbound, received_at: Instant) {
        if self.clients.is_pending(id) {
            self.authenticate(id, frame);
            return;
        }

        let Some(client) = self.clients.get_mut(id) else {
            debug!("Dropping frame from departed connection {}", id);
            return;
        };

        match frame {
            Inbound::Packet(packet) => {
                debug!("Received {} from {}", packet.describe(), id);
                client.record(packet.clone());
                self.dispatch(id, packet, received_at);
            }
            Inbound::Unreadable { raw, reason } => {
                warn!("Unreadable packet from {}: {}", id, reason);
                let info = FailureInfo::new(FailureKind::PayloadMismatch, reason);
                self.reply(id, Packet::failure_report(Packet::raw(raw), info));
            }
        }
    }

    /// First frame of a queued connection: it must be an authentication.
    fn authenticate(&mut self, id: &EndpointId, frame: Inbound) {
        let packet = match frame {
            Inbound::Packet(packet) => packet,
            Inbound::Unreadable { reason, .. } => {
                self.invalidate(id, &format!("unreadable first packet: {reason}"));
                return;
            }
        };

        let (name, tag) = match packet.body() {
            PacketBody::Authentication { name, tag } => (name.clone(), tag.clone()),
            other => {
                let reason = format!("expected authentication, got {:?}", other.kind());
                self.invalidate(id, &reason);
                return;
            }
        };

        match self.clients.validate(id, name, tag) {
            Validation::Admitted(index) => {
                let server = self.clients.snapshot(self.id(), &self.config.name, Some(index));
                let Some(member) = server.member_at(index).cloned() else {
                    return;
                };
                if let Some(client) = self.clients.get_mut(id) {
                    client.record(packet);
                }
                self.reply(id, Packet::welcome(server));
                self.broadcast_update(Some(&member), None, Some(id));
                self.handler.on_connected(&member);
            }
            Validation::Full(client) => {
                client.close(None);
                info!("Connection {} refused: roster is full", id);
                self.handler.on_invalidated(id, "server is full");
            }
            Validation::Unknown => {}
        }
    }

    fn dispatch(&mut self, id: &EndpointId, packet: Packet, received_at: Instant) {
        let Some(sender) = self.clients.get(id).and_then(|c| c.snapshot()) else {
            return;
        };

        match packet.kind() {
            PacketKind::Authentication => {
                let info = FailureInfo::new(
                    FailureKind::AlreadyAuthenticated,
                    "connection is already authenticated",
                );
                self.reply(id, Packet::failure_report(packet, info));
            }
            PacketKind::NameUpdate => {
                if let PacketBody::NameUpdate { name } = packet.into_body() {
                    self.rename(id, name);
                }
            }
            PacketKind::Ping => {
                let processing = duration_ms(received_at.elapsed());
                self.reply(id, Packet::ping_reply(processing));
            }
            PacketKind::PeerRelay => self.relay(id, packet),
            PacketKind::OperationFailed => {
                if let Some(failure) = Failure::from_packet(&packet, None) {
                    if let Err(e) = self.handler.on_operation_failed(&sender, &failure) {
                        warn!("Failure handler for {} failed: {}", id, e);
                    }
                }
            }
            PacketKind::Disconnect => {
                let reason = match packet.body() {
                    PacketBody::Disconnect { reason } => reason.clone(),
                    _ => String::new(),
                };
                self.disconnect(id, &reason, false);
            }
            _ => {
                if let Err(e) = self.handler.on_data(&sender, &packet) {
                    warn!("Handler rejected {} from {}: {}", packet.describe(), id, e);
                    if !packet.is_failure() {
                        let info = e.to_failure_info();
                        self.reply(id, Packet::failure_report(packet, info));
                    }
                }
            }
        }
    }

    fn rename(&mut self, id: &EndpointId, name: String) {
        let Some(client) = self.clients.get_mut(id) else {
            return;
        };
        let old_name = client.set_name(name);
        let Some(member) = client.snapshot() else {
            return;
        };

        info!("Client {} renamed from '{}' to '{}'", id, old_name, member.name);
        self.send_updates();
        self.handler.on_name_changed(&member, &old_name);
    }

    fn relay(&mut self, id: &EndpointId, packet: Packet) {
        match relay::route(&self.clients, id, packet) {
            RelayOutcome::Deliver { recipient, packet } => {
                debug!("Relaying {}", packet.describe());
                if let Some(target) = self.clients.get(&recipient) {
                    if let Err(e) = target.send(packet) {
                        debug!("Relay to {} failed: {}", recipient, e);
                    }
                }
            }
            RelayOutcome::Bounce(failure) => self.reply(id, failure),
            RelayOutcome::Discarded => debug!("Discarding undeliverable failure from {}", id),
        }
    }

    fn reply(&self, id: &EndpointId, packet: Packet) {
        if let Some(client) = self.clients.get(id) {
            if let Err(e) = client.send(packet) {
                debug!("Reply to {} dropped: {}", id, e);
            }
        }
    }

    fn send_updates(&self) {
        self.broadcast_update(None, None, None);
    }

    /// Sends each member the full roster with its own index filled in.
    fn broadcast_update(
        &self,
        joined: Option<&MemberSnapshot>,
        departed: Option<&Departure>,
        exclude: Option<&EndpointId>,
    ) {
        let base = self.clients.snapshot(self.id(), &self.config.name, None);

        for client in self.clients.members() {
            if Some(client.id()) == exclude {
                continue;
            }

            let mut server = base.clone();
            server.index = client.index();
            let update = RosterUpdate {
                server,
                joined: joined.cloned(),
                departed: departed.cloned(),
            };
            if let Err(e) = client.send(Packet::roster_update(update)) {
                debug!("Roster update to {} dropped: {}", client.id(), e);
            }
        }
    }

    /// Drops a queued connection that never authenticated. The peer is not
    /// told why.
    fn invalidate(&mut self, id: &EndpointId, reason: &str) {
        if let Some(client) = self.clients.drop_pending(id) {
            client.close(None);
            info!("Connection {} invalidated: {}", id, reason);
            self.handler.on_invalidated(id, reason);
        }
    }

    /// Removes a validated member, renumbers the roster and tells the rest.
    fn disconnect(&mut self, id: &EndpointId, reason: &str, notify: bool) {
        let Some(client) = self.clients.remove(id) else {
            return;
        };
        client.close(notify.then(|| reason.to_string()));

        let Some(member) = client.snapshot() else {
            return;
        };
        let departure = Departure {
            connected_for_ms: member.connected_for_ms,
            member,
            reason: reason.to_string(),
        };
        info!(
            "Client {} ('{}') disconnected after {}ms: {}",
            id, departure.member.name, departure.connected_for_ms, reason
        );

        if !self.stopping {
            self.broadcast_update(None, Some(&departure), None);
        }
        self.handler.on_disconnected(&departure);
    }

    fn shutdown(&mut self, reason: &str) {
        info!("Server shutting down: {}", reason);
        self.stopping = true;

        for id in self.clients.ids().into_iter().rev() {
            self.disconnect(&id, reason, true);
        }
        for client in self.clients.drain_queue() {
            client.close(None);
            self.handler.on_invalidated(client.id(), reason);
        }
    }
}

/// Spawns the task that forwards frames from one connection to the actor
fn spawn_reader(
    id: EndpointId,
    connection: Connection,
    mut reader: FrameReader,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
) {
    tokio::spawn(async move {
        let reason = loop {
            match connection.read(&mut reader).await {
                ReadEvent::Frame(frame) => {
                    let message = ServerMessage::FrameReceived {
                        id: id.clone(),
                        frame,
                        received_at: Instant::now(),
                    };
                    if server_tx.send(message).is_err() {
                        break "server stopped".to_string();
                    }
                }
                ReadEvent::Violation(e) => {
                    warn!("Protocol violation from {}: {}", id, e);
                    break format!("protocol violation: {e}");
                }
                ReadEvent::Eof => break "connection closed by peer".to_string(),
                ReadEvent::Cancelled => break "connection closed".to_string(),
            }
        };

        connection.close(None);
        let _ = server_tx.send(ServerMessage::ConnectionLost { id, reason });
    });
}

/// Spawns the one-shot timer that expires an unauthenticated connection
fn spawn_validation_timer(
    id: EndpointId,
    connection: Connection,
    timeout: Duration,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
) {
    let cancel = connection.cancellation();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                let _ = server_tx.send(ServerMessage::ValidationExpired { id });
            }
            _ = cancel.cancelled() => {}
        }
    });
}
