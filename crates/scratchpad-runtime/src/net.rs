//! TCP servers and sockets behind the guest `net` module.
//!
//! Listeners are bound through the [`ServerTracker`]; socket traffic runs on
//! Tokio tasks and is reported back to the worker as [`NetEvent`]s, which
//! the JS side receives through its dispatch function.

use crate::tracker::{BoundListener, CloseMode, ListenerId, ServerTracker};
use crate::worker::HostEvent;
use crossbeam_channel::Sender;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

pub type SocketId = u32;

/// Errors that can occur in net operations.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Resource not found: {0}")]
    NotFound(u32),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Socket closed")]
    SocketClosed,
}

pub type NetResult<T> = Result<T, NetError>;

/// Events emitted by net operations for JavaScript consumption.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum NetEvent {
    /// Server started listening
    Listening {
        server_id: ListenerId,
        address: String,
        port: u16,
        family: &'static str,
    },
    /// New connection accepted
    Connection {
        server_id: ListenerId,
        socket_id: SocketId,
        remote_address: String,
        remote_port: u16,
        local_address: String,
        local_port: u16,
    },
    /// Server stopped accepting and is untracked
    ServerClose { server_id: ListenerId },
    /// Server error
    ServerError {
        server_id: ListenerId,
        error: String,
    },
    /// Client socket connected
    SocketConnect {
        socket_id: SocketId,
        remote_address: String,
        remote_port: u16,
        local_address: String,
        local_port: u16,
    },
    /// Data received on socket
    SocketData {
        socket_id: SocketId,
        #[serde(with = "binary_string")]
        data: Vec<u8>,
    },
    /// Remote end closed write side
    SocketEnd { socket_id: SocketId },
    /// Socket fully closed
    SocketClose { socket_id: SocketId, had_error: bool },
    /// Socket error
    SocketError { socket_id: SocketId, error: String },
}

/// Bytes travel to JavaScript as binary strings (one char per byte).
mod binary_string {
    use crate::ops::encoding::bytes_to_binary;
    use serde::{Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        bytes_to_binary(bytes).serialize(serializer)
    }
}

/// Server information returned to JavaScript
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub id: ListenerId,
    pub address: String,
    pub port: u16,
    pub family: String,
}

impl ServerInfo {
    pub fn new(id: ListenerId, addr: SocketAddr) -> Self {
        Self {
            id,
            address: addr.ip().to_string(),
            port: addr.port(),
            family: family(&addr).to_string(),
        }
    }
}

impl From<&BoundListener> for ServerInfo {
    fn from(bound: &BoundListener) -> Self {
        Self::new(bound.id, bound.local_addr)
    }
}

fn family(addr: &SocketAddr) -> &'static str {
    if addr.is_ipv4() { "IPv4" } else { "IPv6" }
}

/// Resolve a guest `(host, port)` pair. An empty host means all interfaces.
pub fn resolve_addr(host: &str, port: u16) -> NetResult<SocketAddr> {
    let host = match host {
        "" => "0.0.0.0",
        "localhost" => "127.0.0.1",
        other => other,
    };
    (host, port)
        .to_socket_addrs()
        .map_err(|_| NetError::InvalidAddress(format!("{host}:{port}")))?
        .next()
        .ok_or_else(|| NetError::InvalidAddress(format!("{host}:{port}")))
}

/// Command sent to a socket's task
enum SocketCommand {
    Write(Vec<u8>),
    End,
    Destroy,
}

struct SocketHandle {
    commands: mpsc::UnboundedSender<SocketCommand>,
}

type SocketMap = Arc<DashMap<SocketId, SocketHandle>>;

/// Owns the sockets of the current context and opens tracked TCP servers.
pub struct NetManager {
    tracker: Arc<ServerTracker>,
    sockets: SocketMap,
    next_id: Arc<AtomicU32>,
    events: Sender<HostEvent>,
}

impl NetManager {
    pub fn new(tracker: Arc<ServerTracker>, events: Sender<HostEvent>) -> Self {
        Self {
            tracker,
            sockets: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU32::new(1)),
            events,
        }
    }

    /// Bind a TCP server and start its accept loop.
    pub fn listen(&self, host: &str, port: u16) -> NetResult<ServerInfo> {
        let addr = resolve_addr(host, port)?;
        let bound = self.tracker.listen_tcp(addr)?;
        let info = ServerInfo::from(&bound);

        let _ = self.events.send(HostEvent::Net(NetEvent::Listening {
            server_id: bound.id,
            address: info.address.clone(),
            port: info.port,
            family: family(&bound.local_addr),
        }));

        let events = self.events.clone();
        let sockets = self.sockets.clone();
        let next_id = self.next_id.clone();
        tokio::spawn(accept_loop(bound, events, sockets, next_id));

        Ok(info)
    }

    /// Connect to a remote server. Completion is reported via events.
    pub fn connect(&self, host: &str, port: u16) -> SocketId {
        let socket_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (commands, command_rx) = mpsc::unbounded_channel();
        self.sockets.insert(socket_id, SocketHandle { commands });

        let events = self.events.clone();
        let sockets = self.sockets.clone();
        let target = resolve_addr(host, port);

        tokio::spawn(async move {
            let stream = match target {
                Ok(addr) => TcpStream::connect(addr).await.map_err(NetError::from),
                Err(e) => Err(e),
            };
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    sockets.remove(&socket_id);
                    let _ = events.send(HostEvent::Net(NetEvent::SocketError {
                        socket_id,
                        error: e.to_string(),
                    }));
                    let _ = events.send(HostEvent::Net(NetEvent::SocketClose {
                        socket_id,
                        had_error: true,
                    }));
                    return;
                }
            };

            let (remote, local) = endpoints(&stream);
            let _ = events.send(HostEvent::Net(NetEvent::SocketConnect {
                socket_id,
                remote_address: remote.ip().to_string(),
                remote_port: remote.port(),
                local_address: local.ip().to_string(),
                local_port: local.port(),
            }));
            handle_socket(socket_id, stream, command_rx, events, sockets).await;
        });

        socket_id
    }

    /// Queue data for a socket.
    pub fn write(&self, socket_id: SocketId, data: Vec<u8>) -> NetResult<()> {
        self.command(socket_id, SocketCommand::Write(data))
    }

    /// Half-close the write side.
    pub fn end(&self, socket_id: SocketId) -> NetResult<()> {
        self.command(socket_id, SocketCommand::End)
    }

    /// Close a socket immediately.
    pub fn destroy(&self, socket_id: SocketId) -> NetResult<()> {
        let result = self.command(socket_id, SocketCommand::Destroy);
        self.sockets.remove(&socket_id);
        result
    }

    /// Guest `server.close()`: stop accepting, keep open connections.
    pub fn close_server(&self, server_id: ListenerId) -> bool {
        self.tracker.close(server_id, CloseMode::Graceful)
    }

    pub fn open_sockets(&self) -> usize {
        self.sockets.len()
    }

    /// Destroy every socket of the previous context.
    pub fn reset(&self) {
        let count = self.sockets.len();
        for entry in self.sockets.iter() {
            let _ = entry.commands.send(SocketCommand::Destroy);
        }
        self.sockets.clear();
        if count > 0 {
            debug!(count, "Destroyed sockets of previous run");
        }
    }

    fn command(&self, socket_id: SocketId, command: SocketCommand) -> NetResult<()> {
        let socket = self
            .sockets
            .get(&socket_id)
            .ok_or(NetError::NotFound(socket_id))?;
        socket
            .commands
            .send(command)
            .map_err(|_| NetError::SocketClosed)
    }
}

fn endpoints(stream: &TcpStream) -> (SocketAddr, SocketAddr) {
    let unspecified = SocketAddr::from(([0, 0, 0, 0], 0));
    (
        stream.peer_addr().unwrap_or(unspecified),
        stream.local_addr().unwrap_or(unspecified),
    )
}

/// Accept loop for a server
async fn accept_loop(
    bound: BoundListener,
    events: Sender<HostEvent>,
    sockets: SocketMap,
    next_id: Arc<AtomicU32>,
) {
    let BoundListener {
        id: server_id,
        listener,
        mut shutdown,
        closed,
        ..
    } = bound;
    let mut connections = JoinSet::new();

    let mode = loop {
        tokio::select! {
            mode = &mut shutdown => break mode.unwrap_or(CloseMode::Force),
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        let socket_id = next_id.fetch_add(1, Ordering::Relaxed);
                        let local_addr = stream.local_addr().unwrap_or(peer_addr);
                        let (commands, command_rx) = mpsc::unbounded_channel();
                        sockets.insert(socket_id, SocketHandle { commands });

                        let _ = events.send(HostEvent::Net(NetEvent::Connection {
                            server_id,
                            socket_id,
                            remote_address: peer_addr.ip().to_string(),
                            remote_port: peer_addr.port(),
                            local_address: local_addr.ip().to_string(),
                            local_port: local_addr.port(),
                        }));

                        connections.spawn(handle_socket(
                            socket_id,
                            stream,
                            command_rx,
                            events.clone(),
                            sockets.clone(),
                        ));
                    }
                    Err(e) => {
                        let _ = events.send(HostEvent::Net(NetEvent::ServerError {
                            server_id,
                            error: e.to_string(),
                        }));
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    };

    drop(listener);
    match mode {
        CloseMode::Force => connections.shutdown().await,
        CloseMode::Graceful => connections.detach_all(),
    }
    drop(closed);

    debug!(server_id, ?mode, "TCP server stopped");
    let _ = events.send(HostEvent::Net(NetEvent::ServerClose { server_id }));
}

/// Handle a socket's read/write operations
async fn handle_socket(
    socket_id: SocketId,
    stream: TcpStream,
    mut command_rx: mpsc::UnboundedReceiver<SocketCommand>,
    events: Sender<HostEvent>,
    sockets: SocketMap,
) {
    // Runs on normal exit and when the task is aborted.
    let mut had_error = scopeguard::guard(false, {
        let events = events.clone();
        move |had_error| {
            sockets.remove(&socket_id);
            let _ = events.send(HostEvent::Net(NetEvent::SocketClose {
                socket_id,
                had_error,
            }));
        }
    });

    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = vec![0u8; 64 * 1024];
    let mut reading = true;

    loop {
        tokio::select! {
            result = reader.read(&mut buf), if reading => {
                match result {
                    Ok(0) => {
                        let _ = events.send(HostEvent::Net(NetEvent::SocketEnd { socket_id }));
                        reading = false;
                    }
                    Ok(n) => {
                        trace!(socket_id, bytes = n, "Socket data");
                        let _ = events.send(HostEvent::Net(NetEvent::SocketData {
                            socket_id,
                            data: buf[..n].to_vec(),
                        }));
                    }
                    Err(e) => {
                        *had_error = true;
                        let _ = events.send(HostEvent::Net(NetEvent::SocketError {
                            socket_id,
                            error: e.to_string(),
                        }));
                        break;
                    }
                }
            }
            cmd = command_rx.recv() => {
                match cmd {
                    Some(SocketCommand::Write(data)) => {
                        let result = writer.write_all(&data).await;
                        if let Err(e) = result.and(writer.flush().await) {
                            *had_error = true;
                            warn!(socket_id, error = %e, "Socket write failed");
                            let _ = events.send(HostEvent::Net(NetEvent::SocketError {
                                socket_id,
                                error: e.to_string(),
                            }));
                            break;
                        }
                    }
                    Some(SocketCommand::End) => {
                        let _ = writer.shutdown().await;
                        if !reading {
                            break;
                        }
                    }
                    Some(SocketCommand::Destroy) | None => break,
                }
            }
        }
    }
}
