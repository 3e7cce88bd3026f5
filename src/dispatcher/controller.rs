//! Controller side: trigger detections become outbound commands

use std::fmt;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::connection::{ConnectionEvent, ConnectionManager, Listener};
use crate::discovery::{ServiceDescriptor, ServiceDirectory};
use crate::protocol::{Command, Message};
use crate::voice::{
    AudioSource, RecognitionPipeline, SessionEvent, SessionOutcome, SpeechRecognizer,
    TriggerPhrases,
};
use crate::{Error, Result};

/// Queued events per source
const EVENT_BUFFER: usize = 64;

/// Where the controller is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerPhase {
    /// Discoverable, no peer
    Advertising,
    /// Peer connected, not listening
    PeerConnected,
    /// Recognition session active
    Listening,
    /// Trigger matched, command being relayed
    TriggerFired,
    /// Command written to the peer
    CommandSent,
}

impl fmt::Display for ControllerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Advertising => "advertising",
            Self::PeerConnected => "peer connected",
            Self::Listening => "listening",
            Self::TriggerFired => "trigger fired",
            Self::CommandSent => "command sent",
        };
        f.write_str(name)
    }
}

/// Controller behaviour knobs
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Phrases that fire a `RING`
    pub triggers: TriggerPhrases,

    /// Start listening whenever a peer is connected and idle
    ///
    /// Covers a new peer, a sent command, and a session that ended without
    /// a match. A recognizer failure is never re-armed automatically.
    pub listen_on_connect: bool,
}

#[derive(Debug)]
enum ControlRequest {
    StartListening,
    StopListening,
    Shutdown,
}

/// Posts requests into a running [`Controller`]
#[derive(Clone)]
pub struct ControllerHandle {
    requests: mpsc::Sender<ControlRequest>,
    phase: watch::Receiver<ControllerPhase>,
}

impl ControllerHandle {
    /// Arm a new recognition session
    pub async fn start_listening(&self) {
        self.request(ControlRequest::StartListening).await;
    }

    /// Stop the current recognition session
    pub async fn stop_listening(&self) {
        self.request(ControlRequest::StopListening).await;
    }

    /// Stop the controller loop
    pub async fn shutdown(&self) {
        self.request(ControlRequest::Shutdown).await;
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> ControllerPhase {
        *self.phase.borrow()
    }

    /// Watch phase transitions
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ControllerPhase> {
        self.phase.clone()
    }

    /// Wait until the controller reaches `phase`
    ///
    /// Transient phases may be skipped by a slow observer; wait on stable
    /// ones (`Advertising`, `PeerConnected`, `Listening`).
    pub async fn wait_for(&self, phase: ControllerPhase) {
        let mut rx = self.phase.clone();
        while *rx.borrow_and_update() != phase {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn request(&self, request: ControlRequest) {
        if self.requests.send(request).await.is_err() {
            tracing::debug!("controller already stopped");
        }
    }
}

/// Serialized controller loop
pub struct Controller {
    connections: ConnectionManager,
    connection_events: mpsc::Receiver<ConnectionEvent>,
    pipeline: RecognitionPipeline,
    session_events: mpsc::Receiver<SessionEvent>,
    requests: mpsc::Receiver<ControlRequest>,
    phase: watch::Sender<ControllerPhase>,
    options: ControllerOptions,
}

impl Controller {
    /// Build a controller and the handle that drives it
    #[must_use]
    pub fn new(
        source: Box<dyn AudioSource>,
        recognizer: Arc<dyn SpeechRecognizer>,
        options: ControllerOptions,
    ) -> (Self, ControllerHandle) {
        let (connection_tx, connection_events) = mpsc::channel(EVENT_BUFFER);
        let (session_tx, session_events) = mpsc::channel(EVENT_BUFFER);
        let (request_tx, requests) = mpsc::channel(EVENT_BUFFER);
        let (phase, phase_rx) = watch::channel(ControllerPhase::Advertising);

        let controller = Self {
            connections: ConnectionManager::new(connection_tx),
            connection_events,
            pipeline: RecognitionPipeline::new(source, recognizer, session_tx),
            session_events,
            requests,
            phase,
            options,
        };
        let handle = ControllerHandle {
            requests: request_tx,
            phase: phase_rx,
        };
        (controller, handle)
    }

    /// Bind, advertise `descriptor`, and run until shut down
    ///
    /// The advertisement carries the bound port and is withdrawn on return.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Advertise`] if binding or advertising fails
    pub async fn serve(
        self,
        directory: &dyn ServiceDirectory,
        descriptor: ServiceDescriptor,
    ) -> Result<()> {
        let listener = ConnectionManager::listen(&descriptor).await?;
        let advertised = descriptor.with_port(listener.local_addr().port());
        let advertisement = directory.advertise(advertised).await?;

        let result = self.run(listener).await;
        advertisement.stop();
        result
    }

    /// Run the event loop on an already bound listener
    ///
    /// # Errors
    ///
    /// Currently never fails; accept faults are logged and skipped
    pub async fn run(mut self, listener: Listener) -> Result<()> {
        tracing::info!(addr = %listener.local_addr(), "controller running");
        self.set_phase(ControllerPhase::Advertising);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.on_inbound(stream, peer).await,
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },
                Some(event) = self.connection_events.recv() => self.on_connection_event(event),
                Some(event) = self.session_events.recv() => self.on_session_event(event).await,
                Some(request) = self.requests.recv() => match request {
                    ControlRequest::StartListening => self.start_listening(),
                    ControlRequest::StopListening => {
                        self.pipeline.stop_listening();
                        self.settle();
                    }
                    ControlRequest::Shutdown => break,
                },
            }
        }

        tracing::info!("controller shutting down");
        self.pipeline.stop_listening();
        self.connections.close().await;
        Ok(())
    }

    async fn on_inbound(&mut self, stream: TcpStream, peer: std::net::SocketAddr) {
        let conn = self.connections.accept(stream, peer).await;
        tracing::info!(connection = conn.id(), peer = %peer, "peer connected");

        if self.pipeline.is_listening() {
            self.set_phase(ControllerPhase::Listening);
        } else {
            self.set_phase(ControllerPhase::PeerConnected);
            self.rearm();
        }
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Message { id, message } => {
                tracing::debug!(connection = id, payload = message.payload(), "ignoring inbound message");
            }
            ConnectionEvent::Closed { id, state } => {
                if self.connections.handle_closed(id) {
                    tracing::info!(connection = id, %state, "peer disconnected");
                    self.pipeline.stop_listening();
                    self.set_phase(ControllerPhase::Advertising);
                } else {
                    tracing::debug!(connection = id, %state, "superseded connection ended");
                }
            }
        }
    }

    async fn on_session_event(&mut self, event: SessionEvent) {
        match self.pipeline.handle(event) {
            SessionOutcome::Pending | SessionOutcome::Stale => {}
            SessionOutcome::Triggered { phrase, .. } => {
                self.set_phase(ControllerPhase::TriggerFired);
                self.relay(Command::Ring, &phrase).await;
                self.settle();
                self.rearm();
            }
            SessionOutcome::Finished => {
                self.settle();
                self.rearm();
            }
            SessionOutcome::Failed(reason) => {
                tracing::warn!(reason = %reason, "listening ended on recognition error");
                self.settle();
            }
        }
    }

    /// Send `command` to the current peer, dropping it if there is none
    async fn relay(&mut self, command: Command, phrase: &str) {
        match self.connections.send(&Message::command(command)).await {
            Ok(()) => {
                tracing::info!(%command, phrase, "command sent");
                self.set_phase(ControllerPhase::CommandSent);
            }
            Err(Error::NotConnected) => {
                tracing::info!(%command, "no ready peer, command dropped");
            }
            Err(e) => {
                tracing::warn!(%command, error = %e, "command send failed");
            }
        }
    }

    fn start_listening(&mut self) {
        match self.pipeline.start_listening(&self.options.triggers) {
            Ok(_) => self.set_phase(ControllerPhase::Listening),
            Err(e) => {
                tracing::warn!(error = %e, "failed to start listening");
                self.settle();
            }
        }
    }

    /// Re-arm listening when configured to and a peer is idle
    fn rearm(&mut self) {
        if self.options.listen_on_connect
            && self.connections.is_connected()
            && !self.pipeline.is_listening()
        {
            self.start_listening();
        }
    }

    /// Fall back to the stable phase matching current state
    fn settle(&self) {
        let phase = if self.pipeline.is_listening() {
            ControllerPhase::Listening
        } else if self.connections.is_connected() {
            ControllerPhase::PeerConnected
        } else {
            ControllerPhase::Advertising
        };
        self.set_phase(phase);
    }

    fn set_phase(&self, next: ControllerPhase) {
        let changed = self.phase.send_if_modified(|phase| {
            if *phase == next {
                return false;
            }
            *phase = next;
            true
        });
        if changed {
            tracing::debug!(phase = %next, "controller phase");
        }
    }
}
