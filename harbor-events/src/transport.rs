//! Persistent event transport.
//!
//! # Design
//!
//! [`EventTransport::spawn`] starts one task that owns the socket, the
//! outbound buffer, and the retry loop. The returned handle talks to that
//! task over a command channel; inbound events fan out on a broadcast
//! channel and the connection state is published on a watch channel.
//!
//! Failures never reach subscribers. A close logs one warning, errors are
//! logged at most once per debounce window, and the task reconnects on the
//! first retry tick where the network is online, the session is alive and
//! the transport was not explicitly disconnected.

use std::collections::VecDeque;
use std::sync::Arc;

use harbor_core::{SessionEvent, TransportError};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::TransportConfig;
use crate::session::SessionCollaborators;
use crate::socket::{Connector, SocketSignal, ABNORMAL_CLOSURE};

/// Connection state of the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportState {
    /// Explicitly disconnected; no retries until `connect()`.
    Disconnected,
    Connecting,
    Open,
    Closed { code: u16 },
    Errored,
    /// Waiting for the next retry tick.
    Retrying,
}

enum Command {
    Connect,
    Disconnect,
    Emit(SessionEvent),
}

/// Handle to the transport task. Cheap to clone.
#[derive(Clone)]
pub struct EventTransport {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SessionEvent>,
    opened: broadcast::Sender<u64>,
    state: watch::Receiver<TransportState>,
}

impl EventTransport {
    /// Start the transport task and begin connecting. Must be called from
    /// within a tokio runtime.
    pub fn spawn<C: Connector>(
        connector: C,
        collaborators: SessionCollaborators,
        config: TransportConfig,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (opened, _) = broadcast::channel(16);
        let (state_tx, state) = watch::channel(TransportState::Connecting);

        let task = TransportTask {
            connector: Arc::new(connector),
            collaborators,
            config,
            commands: commands_rx,
            events: events.clone(),
            opened: opened.clone(),
            state: state_tx,
            outbox: VecDeque::new(),
            disconnected: false,
            opens: 0,
            session_activated: false,
            last_error_log: None,
        };
        tokio::spawn(task.run());

        Self {
            commands,
            events,
            opened,
            state,
        }
    }

    /// Leave the explicitly disconnected state and reconnect immediately.
    pub fn connect(&self) -> Result<(), TransportError> {
        self.send(Command::Connect)
    }

    /// Close the live socket and stop retrying until [`connect`](Self::connect).
    pub fn disconnect(&self) -> Result<(), TransportError> {
        self.send(Command::Disconnect)
    }

    /// Queue an outbound event. It is written once the socket is open and
    /// activated; earlier events are released first.
    pub fn emit(&self, event: SessionEvent) -> Result<(), TransportError> {
        self.send(Command::Emit(event))
    }

    /// Every decoded inbound event.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Fires on every socket open with the running open count (1 for the
    /// first connection, 2 after the first reconnect, ...).
    pub fn on_init(&self) -> broadcast::Receiver<u64> {
        self.opened.subscribe()
    }

    pub fn state(&self) -> watch::Receiver<TransportState> {
        self.state.clone()
    }

    pub fn current_state(&self) -> TransportState {
        self.state.borrow().clone()
    }

    fn send(&self, command: Command) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .map_err(|_| TransportError::Stopped)
    }
}

/// Why a connection ended.
enum ConnectionEnd {
    Closed { code: u16, reason: String },
    Errored(String),
    Disconnected,
    Stopped,
}

struct TransportTask {
    connector: Arc<dyn Connector>,
    collaborators: SessionCollaborators,
    config: TransportConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<SessionEvent>,
    opened: broadcast::Sender<u64>,
    state: watch::Sender<TransportState>,
    outbox: VecDeque<SessionEvent>,
    disconnected: bool,
    opens: u64,
    /// Set by the first successful handshake; reconnects reuse the session.
    session_activated: bool,
    last_error_log: Option<Instant>,
}

impl TransportTask {
    async fn run(mut self) {
        loop {
            if self.disconnected {
                self.set_state(TransportState::Disconnected);
                if !self.wait_for_connect().await {
                    break;
                }
                continue;
            }

            self.set_state(TransportState::Connecting);
            match self.run_connection().await {
                ConnectionEnd::Stopped => break,
                ConnectionEnd::Disconnected => continue,
                ConnectionEnd::Closed { code, reason } => {
                    warn!(code, reason = %reason, "Websocket closed ({}): {}", code, reason);
                    self.set_state(TransportState::Closed { code });
                }
                ConnectionEnd::Errored(message) => {
                    self.log_error(&message);
                    self.set_state(TransportState::Errored);
                }
            }

            if !self.wait_for_retry().await {
                break;
            }
        }
        debug!("Transport task stopped");
    }

    fn set_state(&self, state: TransportState) {
        trace!(state = ?state, "Transport state");
        self.state.send_replace(state);
    }

    fn log_error(&mut self, message: &str) {
        let now = Instant::now();
        let due = self
            .last_error_log
            .map(|last| now.duration_since(last) >= self.config.error_debounce)
            .unwrap_or(true);
        if due {
            error!(error = %message, "Websocket error");
            self.last_error_log = Some(now);
        } else {
            debug!(error = %message, "Websocket error (debounced)");
        }
    }

    /// Park until `connect()`. Returns `false` when every handle is gone.
    async fn wait_for_connect(&mut self) -> bool {
        loop {
            match self.commands.recv().await {
                None => return false,
                Some(Command::Connect) => {
                    self.disconnected = false;
                    return true;
                }
                Some(Command::Disconnect) => {}
                Some(Command::Emit(event)) => self.outbox.push_back(event),
            }
        }
    }

    /// Tick until the reconnect gate opens. Returns `false` when every handle
    /// is gone.
    async fn wait_for_retry(&mut self) -> bool {
        self.set_state(TransportState::Retrying);
        let period = self.config.retry_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.collaborators.can_reconnect() && !self.disconnected {
                        return true;
                    }
                    debug!("Reconnect postponed: offline or session expired");
                }
                command = self.commands.recv() => match command {
                    None => return false,
                    Some(Command::Connect) => {}
                    Some(Command::Disconnect) => {
                        self.disconnected = true;
                        return true;
                    }
                    Some(Command::Emit(event)) => self.outbox.push_back(event),
                },
            }
        }
    }

    async fn run_connection(&mut self) -> ConnectionEnd {
        let link = match self.connector.connect().await {
            Ok(link) => link,
            Err(err) => return ConnectionEnd::Errored(err.to_string()),
        };
        let outbound = link.outbound;
        let mut inbound = link.inbound;
        let mut activated = false;

        loop {
            tokio::select! {
                signal = inbound.recv() => match signal {
                    Some(SocketSignal::Opened) => {
                        self.opens += 1;
                        info!(opens = self.opens, "Websocket connected");
                        self.set_state(TransportState::Open);
                        let _ = self.opened.send(self.opens);

                        if !self.session_activated {
                            if let Err(err) = self.collaborators.activation.activate().await {
                                return ConnectionEnd::Errored(err.to_string());
                            }
                            self.session_activated = true;
                        }
                        activated = true;
                        self.flush(&outbound);
                    }
                    Some(SocketSignal::Text(frame)) => self.dispatch(&frame),
                    Some(SocketSignal::Closed { code, reason }) => {
                        return ConnectionEnd::Closed { code, reason };
                    }
                    Some(SocketSignal::Error(message)) => return ConnectionEnd::Errored(message),
                    None => {
                        return ConnectionEnd::Closed {
                            code: ABNORMAL_CLOSURE,
                            reason: "connection lost".to_string(),
                        };
                    }
                },
                command = self.commands.recv() => match command {
                    None => return ConnectionEnd::Stopped,
                    Some(Command::Connect) => {}
                    Some(Command::Disconnect) => {
                        self.disconnected = true;
                        info!("Websocket disconnected");
                        return ConnectionEnd::Disconnected;
                    }
                    Some(Command::Emit(event)) => {
                        self.outbox.push_back(event);
                        if activated {
                            self.flush(&outbound);
                        }
                    }
                },
            }
        }
    }

    /// Write buffered events in order. Stops at the first write failure and
    /// keeps the rest for the next connection.
    fn flush(&mut self, outbound: &mpsc::UnboundedSender<String>) {
        while let Some(event) = self.outbox.pop_front() {
            let frame = match event.encode() {
                Ok(frame) => frame,
                Err(err) => {
                    let err = TransportError::Encode(err.to_string());
                    warn!(error = %err, "Dropping outbound event");
                    continue;
                }
            };
            if outbound.send(frame).is_err() {
                self.outbox.push_front(event);
                break;
            }
        }
    }

    fn dispatch(&self, frame: &str) {
        match SessionEvent::decode(frame) {
            Ok(event) => {
                trace!(id = %event.id(), "Inbound event");
                if self.events.send(event).is_err() {
                    trace!("No event subscribers");
                }
            }
            Err(err) => warn!(error = %err, "Dropping undecodable event frame"),
        }
    }
}
