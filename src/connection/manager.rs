//! Ownership of the single current connection

use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use super::{Connection, ConnectionEvent, ConnectionId, ConnectionState, Role};
use crate::discovery::{DiscoveredEndpoint, ServiceDescriptor};
use crate::protocol::Message;
use crate::{Error, Result};

/// Bound listening socket for the inbound role
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Local address, including the OS-assigned port
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next inbound connection attempt
    ///
    /// # Errors
    ///
    /// Returns error if the listening socket fails
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        Ok(self.inner.accept().await?)
    }
}

/// Owns the transport lifecycle for exactly one peer
///
/// Not shared: the manager lives inside one dispatcher loop, which is the
/// only place the current connection is ever replaced.
pub struct ConnectionManager {
    current: Option<Connection>,
    next_id: ConnectionId,
    events: mpsc::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    /// Create a manager reporting receive-loop events on `events`
    #[must_use]
    pub const fn new(events: mpsc::Sender<ConnectionEvent>) -> Self {
        Self {
            current: None,
            next_id: 1,
            events,
        }
    }

    /// Bind a listener for `descriptor`
    ///
    /// Uses port 0 (OS-assigned) when the descriptor carries none. Advertise
    /// [`Listener::local_addr`] so peers learn the real port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Advertise`] if the port cannot be bound
    pub async fn listen(descriptor: &ServiceDescriptor) -> Result<Listener> {
        let port = descriptor.port().unwrap_or(0);
        let inner = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map_err(|e| Error::Advertise(format!("failed to bind port {port}: {e}")))?;
        let local_addr = inner.local_addr()?;

        tracing::info!(addr = %local_addr, instance = descriptor.name(), "listening");
        Ok(Listener { inner, local_addr })
    }

    /// The current connection, if any
    #[must_use]
    pub const fn current(&self) -> Option<&Connection> {
        self.current.as_ref()
    }

    /// Whether the current connection is `Ready`
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.current.as_ref().is_some_and(Connection::is_ready)
    }

    /// Adopt an accepted stream as the current connection
    ///
    /// The previous current connection, if any, is closed first. Later peers
    /// always preempt earlier ones.
    pub async fn accept(&mut self, stream: TcpStream, peer: SocketAddr) -> Connection {
        if let Some(previous) = self.current.take() {
            tracing::info!(
                previous = previous.id(),
                peer = %peer,
                "new inbound peer preempts current connection"
            );
            previous.close().await;
        }

        let conn = self.allocate(Role::Inbound, peer.to_string());
        conn.transition(ConnectionState::Connecting);
        self.start(&conn, stream).await;
        self.current = Some(conn.clone());
        conn
    }

    /// Open an outbound connection to `endpoint` and make it current
    ///
    /// Addresses are tried in order. On failure the connection ends `Failed`,
    /// nothing is current, and the endpoint is not retried.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connect`] if no address accepts
    pub async fn connect(&mut self, endpoint: &DiscoveredEndpoint) -> Result<Connection> {
        if let Some(previous) = self.current.take() {
            previous.close().await;
        }

        let peer = endpoint
            .addrs
            .first()
            .map_or_else(|| endpoint.instance.clone(), ToString::to_string);
        let conn = self.allocate(Role::Outbound, peer);
        conn.transition(ConnectionState::Connecting);
        self.current = Some(conn.clone());

        tracing::info!(connection = conn.id(), endpoint = %endpoint, "connecting");

        match TcpStream::connect(endpoint.addrs.as_slice()).await {
            Ok(stream) => {
                self.start(&conn, stream).await;
                tracing::info!(connection = conn.id(), peer = %conn.peer(), "connected");
                Ok(conn)
            }
            Err(e) => {
                conn.transition(ConnectionState::Failed);
                self.current = None;
                Err(Error::Connect {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Send on the current connection
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] when nothing is current or the current
    /// connection is not `Ready`
    pub async fn send(&self, message: &Message) -> Result<()> {
        match &self.current {
            Some(conn) => conn.send(message).await,
            None => Err(Error::NotConnected),
        }
    }

    /// Account for a receive loop that ended
    ///
    /// Returns true if `id` was the current connection, which is then
    /// dropped. Events from superseded connections return false.
    pub fn handle_closed(&mut self, id: ConnectionId) -> bool {
        if self.current.as_ref().is_some_and(|c| c.id() == id) {
            self.current = None;
            return true;
        }
        false
    }

    /// Whether `id` names the current connection
    #[must_use]
    pub fn is_current(&self, id: ConnectionId) -> bool {
        self.current.as_ref().is_some_and(|c| c.id() == id)
    }

    /// Close and forget the current connection
    pub async fn close(&mut self) {
        if let Some(conn) = self.current.take() {
            conn.close().await;
        }
    }

    fn allocate(&mut self, role: Role, peer: String) -> Connection {
        let id = self.next_id;
        self.next_id += 1;
        Connection::new(id, role, peer)
    }

    async fn start(&self, conn: &Connection, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::trace!(error = %e, "set_nodelay failed");
        }

        let (reader, writer) = stream.into_split();
        conn.attach_writer(writer).await;
        if conn.transition(ConnectionState::Ready) {
            tokio::spawn(conn.clone().receive_loop(reader, self.events.clone()));
        }
    }
}
