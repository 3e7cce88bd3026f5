//! Transport connections between controller and companion
//!
//! A [`Connection`] is a cheap, cloneable handle onto one TCP stream. Its
//! state only moves forward: `Idle → Connecting → Ready → {Closed, Failed}`.
//! Terminal states are never left; reconnecting always creates a new handle.
//!
//! The [`ConnectionManager`] owns the single current connection. Listeners
//! follow a last-writer-wins policy: a new inbound peer closes the previous
//! one. This is intentional, one peer at a time, nothing is queued or
//! multiplexed.

mod manager;

use std::fmt;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, watch};

pub use manager::{ConnectionManager, Listener};

use crate::protocol::{MAX_MESSAGE_LEN, Message};
use crate::{Error, Result};

/// Identifies a connection within one manager
pub type ConnectionId = u64;

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted by a listener
    Inbound,
    /// Opened by a connector
    Outbound,
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, nothing attempted yet
    Idle,
    /// Transport connect in progress
    Connecting,
    /// Usable for sends
    Ready,
    /// Transport error or failed connect
    Failed,
    /// Closed by either end
    Closed,
}

impl ConnectionState {
    /// Whether no further transition is possible
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Events reported by connection receive loops
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A chunk arrived and decoded as text
    Message {
        /// Source connection
        id: ConnectionId,
        /// Decoded message
        message: Message,
    },

    /// The receive loop ended
    Closed {
        /// Source connection
        id: ConnectionId,
        /// Terminal state reached
        state: ConnectionState,
    },
}

struct Inner {
    id: ConnectionId,
    role: Role,
    peer: String,
    state: watch::Sender<ConnectionState>,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

/// Handle onto one peer connection
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, role: Role, peer: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            inner: Arc::new(Inner {
                id,
                role,
                peer: peer.into(),
                state,
                writer: Mutex::new(None),
            }),
        }
    }

    /// Connection id
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Which side opened it
    #[must_use]
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Peer address as text
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Whether sends are currently allowed
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Watch state transitions
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the connection reaches a terminal state
    pub async fn closed(&self) -> ConnectionState {
        let mut rx = self.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state.is_terminal() {
                return state;
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }

    /// Move to `next` unless already terminal
    ///
    /// Returns whether the state changed.
    pub(crate) fn transition(&self, next: ConnectionState) -> bool {
        let changed = self.inner.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            *state = next;
            true
        });

        if changed {
            tracing::debug!(connection = self.id(), peer = %self.peer(), state = %next, "connection state");
        }
        changed
    }

    pub(crate) async fn attach_writer(&self, writer: OwnedWriteHalf) {
        *self.inner.writer.lock().await = Some(writer);
    }

    /// Write one message to the peer
    ///
    /// Fire-and-forget: success means the bytes reached the transport, not
    /// that the peer acted on them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] without writing anything unless the
    /// connection is `Ready`, or [`Error::Transport`] if the write fails (the
    /// connection is then `Failed`).
    pub async fn send(&self, message: &Message) -> Result<()> {
        if !self.is_ready() {
            return Err(Error::NotConnected);
        }

        let mut writer = self.inner.writer.lock().await;
        // Close may have won the race for the lock
        let Some(stream) = writer.as_mut().filter(|_| self.is_ready()) else {
            return Err(Error::NotConnected);
        };

        if let Err(e) = stream.write_all(message.as_bytes()).await {
            writer.take();
            drop(writer);
            self.transition(ConnectionState::Failed);
            tracing::warn!(connection = self.id(), error = %e, "send failed");
            return Err(Error::Transport(e.to_string()));
        }

        tracing::debug!(connection = self.id(), payload = message.payload(), "message sent");
        Ok(())
    }

    /// Close the connection and release the transport
    ///
    /// Safe to call in any state; terminal connections are left as they are.
    pub async fn close(&self) {
        if self.transition(ConnectionState::Closed) {
            tracing::info!(connection = self.id(), peer = %self.peer(), "connection closed");
        }
        self.release_writer().await;
    }

    async fn release_writer(&self) {
        let writer = self.inner.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }

    /// Drain the read half until the connection ends
    ///
    /// Every successful read is reported and the next read is armed right
    /// away. Ends on EOF (`Closed`), read error (`Failed`) or when the handle
    /// is moved to a terminal state from elsewhere.
    pub(crate) async fn receive_loop(
        self,
        mut reader: OwnedReadHalf,
        events: mpsc::Sender<ConnectionEvent>,
    ) {
        let id = self.id();
        let mut state = self.subscribe();
        let mut buf = vec![0u8; MAX_MESSAGE_LEN];

        loop {
            if state.borrow_and_update().is_terminal() {
                break;
            }

            tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        tracing::info!(connection = id, "peer closed connection");
                        self.transition(ConnectionState::Closed);
                        break;
                    }
                    Ok(n) => {
                        let Some(message) = Message::decode(&buf[..n]) else {
                            tracing::debug!(connection = id, bytes = n, "ignoring non-text chunk");
                            continue;
                        };
                        if events.send(ConnectionEvent::Message { id, message }).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(connection = id, error = %e, "read failed");
                        self.transition(ConnectionState::Failed);
                        break;
                    }
                },
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.release_writer().await;
        let _ = events
            .send(ConnectionEvent::Closed { id, state: self.state() })
            .await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("role", &self.role())
            .field("peer", &self.peer())
            .field("state", &self.state())
            .finish()
    }
}
