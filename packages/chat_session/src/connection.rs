//! ConnectionManager: the single duplex event-channel connection.
//!
//! Owns the transport handle, the `disconnected → connecting → connected`
//! state machine, and the generation counter that keeps signals from a torn
//! down connection out of the session.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::types::Credential;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What a transport reports about its connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Event(ServerEvent),
    Closed { reason: String },
}

/// A transport event tagged with the generation of the connection it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportSignal {
    pub generation: u64,
    pub event: TransportEvent,
}

/// Where a transport delivers inbound events for one connection.
#[derive(Debug, Clone)]
pub struct TransportSink {
    generation: u64,
    tx: mpsc::UnboundedSender<TransportSignal>,
}

impl TransportSink {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once the session is gone.
    pub fn deliver(&self, event: TransportEvent) -> bool {
        self.tx
            .send(TransportSignal {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// The duplex event channel underneath the connection manager.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform the handshake with `credential` attached. Inbound events for
    /// this connection go to `sink` until `close` is called.
    async fn open(&mut self, credential: &Credential, sink: TransportSink) -> Result<()>;

    /// Queue an event on the open connection.
    fn send(&mut self, event: &ClientEvent) -> Result<()>;

    /// Tear down the connection and stop delivering to its sink.
    fn close(&mut self);
}

/// What the session should do with a [`TransportSignal`].
#[derive(Debug, PartialEq)]
pub enum SignalOutcome {
    /// From a connection that no longer exists.
    Stale,
    Event(ServerEvent),
    /// The current connection dropped; state is now `Disconnected`.
    Lost,
}

pub struct ConnectionManager {
    transport: Box<dyn Transport>,
    state: ConnectionState,
    generation: u64,
    sink_tx: mpsc::UnboundedSender<TransportSignal>,
}

impl ConnectionManager {
    pub fn new(
        transport: Box<dyn Transport>,
        sink_tx: mpsc::UnboundedSender<TransportSignal>,
    ) -> Self {
        Self {
            transport,
            state: ConnectionState::Disconnected,
            generation: 0,
            sink_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Open the channel. Returns `true` if this call transitioned to `Connected`.
    ///
    /// Without a credential no attempt is made. Handshake failures are logged
    /// and leave the manager `Disconnected`.
    pub async fn connect(&mut self, credential: Option<&Credential>) -> bool {
        if self.state != ConnectionState::Disconnected {
            debug!(state = ?self.state, "connect ignored, connection already in progress");
            return false;
        }
        let Some(credential) = credential else {
            info!("no credential, not connecting");
            return false;
        };

        self.generation += 1;
        self.state = ConnectionState::Connecting;
        let sink = TransportSink {
            generation: self.generation,
            tx: self.sink_tx.clone(),
        };
        debug!(generation = self.generation, "connecting");

        match self.transport.open(credential, sink).await {
            Ok(()) => {
                self.state = ConnectionState::Connected;
                info!(generation = self.generation, "connected");
                true
            }
            Err(e) => {
                warn!(generation = self.generation, error = %e, "connect failed");
                self.transport.close();
                self.state = ConnectionState::Disconnected;
                false
            }
        }
    }

    /// Close the channel. Signals already queued for it become stale.
    pub fn disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.transport.close();
        self.generation += 1;
        self.state = ConnectionState::Disconnected;
        info!("disconnected");
    }

    /// Send an event if connected. Returns `false` when it was dropped.
    pub fn emit(&mut self, event: ClientEvent) -> bool {
        if self.state != ConnectionState::Connected {
            debug!(event = event.name(), "not connected, dropping event");
            return false;
        }
        match self.transport.send(&event) {
            Ok(()) => true,
            Err(e) => {
                warn!(event = event.name(), error = %e, "emit failed, dropping event");
                false
            }
        }
    }

    pub fn on_signal(&mut self, signal: TransportSignal) -> SignalOutcome {
        if signal.generation != self.generation || self.state != ConnectionState::Connected {
            debug!(
                generation = signal.generation,
                current = self.generation,
                "stale transport signal"
            );
            return SignalOutcome::Stale;
        }
        match signal.event {
            TransportEvent::Event(event) => SignalOutcome::Event(event),
            TransportEvent::Closed { reason } => {
                warn!(generation = self.generation, reason = %reason, "connection lost");
                self.transport.close();
                self.state = ConnectionState::Disconnected;
                SignalOutcome::Lost
            }
        }
    }
}
