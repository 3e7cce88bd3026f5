//! Companion side: inbound commands become local actions

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::Result;
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::discovery::{DiscoveredEndpoint, DiscoveryEvent, EndpointStream, ServiceDirectory};
use crate::protocol::{Command, Message};
use crate::voice::AlertAction;

/// Queued connection events
const EVENT_BUFFER: usize = 64;

/// Pause before re-browsing after a browse stream ends on its own
const REBROWSE_DELAY: Duration = Duration::from_secs(1);

/// Where the companion is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompanionPhase {
    /// Waiting for a controller to show up
    Browsing,
    /// Connect attempt in flight
    Connecting,
    /// Connected to a controller
    Connected,
}

impl fmt::Display for CompanionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Browsing => "browsing",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Observes and stops a running [`Companion`]
#[derive(Clone)]
pub struct CompanionHandle {
    shutdown: mpsc::Sender<()>,
    phase: watch::Receiver<CompanionPhase>,
}

impl CompanionHandle {
    /// Stop the companion loop
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(()).await;
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> CompanionPhase {
        *self.phase.borrow()
    }

    /// Wait until the companion reaches `phase`
    pub async fn wait_for(&self, phase: CompanionPhase) {
        let mut rx = self.phase.clone();
        while *rx.borrow_and_update() != phase {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Serialized companion loop
pub struct Companion {
    connections: ConnectionManager,
    connection_events: mpsc::Receiver<ConnectionEvent>,
    alert: Arc<dyn AlertAction>,
    alert_task: Option<JoinHandle<()>>,
    shutdown: mpsc::Receiver<()>,
    phase: watch::Sender<CompanionPhase>,
}

impl Companion {
    /// Build a companion that plays `alert` on `RING`
    #[must_use]
    pub fn new(alert: Arc<dyn AlertAction>) -> (Self, CompanionHandle) {
        let (connection_tx, connection_events) = mpsc::channel(EVENT_BUFFER);
        let (shutdown_tx, shutdown) = mpsc::channel(1);
        let (phase, phase_rx) = watch::channel(CompanionPhase::Browsing);

        let companion = Self {
            connections: ConnectionManager::new(connection_tx),
            connection_events,
            alert,
            alert_task: None,
            shutdown,
            phase,
        };
        let handle = CompanionHandle {
            shutdown: shutdown_tx,
            phase: phase_rx,
        };
        (companion, handle)
    }

    /// Browse for `service_type` and serve the first controller found
    ///
    /// While a connection is current, further sightings are ignored. When it
    /// ends, browsing restarts so the controller can resurface.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Browse`] if browsing cannot start
    pub async fn run(mut self, directory: &dyn ServiceDirectory, service_type: &str) -> Result<()> {
        let mut sightings: EndpointStream = directory.browse(service_type).await?;
        tracing::info!(service_type, "companion browsing");

        loop {
            tokio::select! {
                sighting = sightings.next() => match sighting {
                    Some(DiscoveryEvent::Found(endpoint)) => self.on_endpoint(&endpoint).await,
                    Some(DiscoveryEvent::Lost(instance)) => {
                        tracing::debug!(instance = %instance, "endpoint withdrawn");
                    }
                    None => {
                        tracing::warn!("browse stream ended, restarting");
                        tokio::time::sleep(REBROWSE_DELAY).await;
                        sightings = directory.browse(service_type).await?;
                    }
                },
                Some(event) = self.connection_events.recv() => {
                    if self.on_connection_event(event) {
                        sightings = directory.browse(service_type).await?;
                    }
                }
                Some(()) = self.shutdown.recv() => break,
            }
        }

        tracing::info!("companion shutting down");
        self.connections.close().await;
        if let Some(task) = self.alert_task.take() {
            task.abort();
        }
        Ok(())
    }

    async fn on_endpoint(&mut self, endpoint: &DiscoveredEndpoint) {
        if self
            .connections
            .current()
            .is_some_and(|c| !c.state().is_terminal())
        {
            tracing::debug!(endpoint = %endpoint, "already connected, ignoring endpoint");
            return;
        }

        self.set_phase(CompanionPhase::Connecting);
        match self.connections.connect(endpoint).await {
            Ok(conn) => {
                tracing::info!(connection = conn.id(), endpoint = %endpoint, "paired with controller");
                self.set_phase(CompanionPhase::Connected);
            }
            Err(e) => {
                tracing::warn!(error = %e, "endpoint discarded");
                self.set_phase(CompanionPhase::Browsing);
            }
        }
    }

    /// Returns true when the current connection ended
    fn on_connection_event(&mut self, event: ConnectionEvent) -> bool {
        match event {
            ConnectionEvent::Message { id, message } => {
                if self.connections.is_current(id) {
                    self.dispatch(&message);
                } else {
                    tracing::debug!(connection = id, "discarding message from superseded connection");
                }
                false
            }
            ConnectionEvent::Closed { id, state } => {
                if !self.connections.handle_closed(id) {
                    return false;
                }
                tracing::info!(connection = id, %state, "controller disconnected");
                self.set_phase(CompanionPhase::Browsing);
                true
            }
        }
    }

    /// Act on one inbound message
    ///
    /// Unknown literals are ignored so newer controllers stay compatible.
    fn dispatch(&mut self, message: &Message) {
        match message.known_command() {
            Some(Command::Ring) => self.ring(),
            None => {
                tracing::debug!(payload = message.payload(), "ignoring unknown command");
            }
        }
    }

    /// Start the alert unless one is still playing
    fn ring(&mut self) {
        if self.alert_task.as_ref().is_some_and(|task| !task.is_finished()) {
            tracing::info!("alert already playing, ignoring RING");
            return;
        }

        tracing::info!("RING received");
        let alert = Arc::clone(&self.alert);
        self.alert_task = Some(tokio::spawn(async move {
            if let Err(e) = alert.alert().await {
                tracing::warn!(error = %e, "alert failed");
            }
        }));
    }

    fn set_phase(&self, next: CompanionPhase) {
        let changed = self.phase.send_if_modified(|phase| {
            if *phase == next {
                return false;
            }
            *phase = next;
            true
        });
        if changed {
            tracing::debug!(phase = %next, "companion phase");
        }
    }
}
