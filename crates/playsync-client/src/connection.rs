//! Lifecycle of the control channel: probe, connect, run, reconnect.
//!
//! `ConnectionManager::spawn` starts one background task that keeps at most a
//! single channel open.  Before every attempt the hub's health endpoint is
//! probed; an unreachable hub never gets a connect attempt, only a retry
//! scheduled with exponential backoff.  Failures are never fatal.
//!
//! The returned [`ConnectionHandle`] owns the task.  Dropping it (or calling
//! `disconnect`) cancels any pending retry and closes the channel.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use playsync_proto::config::ClientConfig;
use playsync_proto::protocol::{ClientMessage, PlayerState};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::CommandDispatcher;
use crate::receiver::StateReceiver;
use crate::transport::{Channel, Connector, HealthProbe};

/// Upper bound on the close handshake during `disconnect()`.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Exponential reconnect delay: `min(base * 2^attempt, max)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
        )
    }

    /// Retries scheduled since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for the retry being scheduled now; bumps the attempt count.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.checked_pow(self.attempt).unwrap_or(u32::MAX);
        let delay = self.base.checked_mul(factor).unwrap_or(self.max).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Observable connection status.  Transient, never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionSession {
    pub connected: bool,
    pub last_error: Option<String>,
    pub reconnect_attempt: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Disconnected { reason: Option<String> },
    RetryScheduled { attempt: u32, delay: Duration },
    State(PlayerState),
    ServerError(String),
    CommandExecuted {
        action: String,
        params: Map<String, Value>,
    },
}

pub struct ConnectionManager<C, P> {
    connector: C,
    probe: P,
    probe_timeout: Duration,
    backoff: Backoff,
}

impl<C: Connector, P: HealthProbe> ConnectionManager<C, P> {
    pub fn new(connector: C, probe: P, backoff: Backoff, probe_timeout: Duration) -> Self {
        Self {
            connector,
            probe,
            probe_timeout,
            backoff,
        }
    }

    pub fn spawn(self) -> (ConnectionHandle, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (receiver, state_rx) = StateReceiver::new(events_tx.clone());
        let (session_tx, session_rx) = watch::channel(ConnectionSession::default());
        let dispatcher = CommandDispatcher::new();
        let cancel = CancellationToken::new();

        let worker = Worker {
            manager: self,
            dispatcher: dispatcher.clone(),
            receiver,
            session: session_tx,
            events: events_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(worker.run());

        let handle = ConnectionHandle {
            cancel,
            task: Some(task),
            dispatcher,
            state_rx,
            session_rx,
        };
        (handle, events_rx)
    }
}

pub struct ConnectionHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    dispatcher: CommandDispatcher,
    state_rx: watch::Receiver<PlayerState>,
    session_rx: watch::Receiver<ConnectionSession>,
}

impl ConnectionHandle {
    pub fn dispatcher(&self) -> CommandDispatcher {
        self.dispatcher.clone()
    }

    /// Latest authoritative snapshot.
    pub fn player_state(&self) -> PlayerState {
        self.state_rx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<PlayerState> {
        self.state_rx.clone()
    }

    pub fn session(&self) -> ConnectionSession {
        self.session_rx.borrow().clone()
    }

    pub fn watch_session(&self) -> watch::Receiver<ConnectionSession> {
        self.session_rx.clone()
    }

    /// Cancel any scheduled retry, close the channel and wait for the task.
    pub async fn disconnect(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Attempt {
    Open(Channel),
    Unreachable(String),
    Cancelled,
}

enum SessionEnd {
    Closed(Option<String>),
    Cancelled,
}

struct Worker<C, P> {
    manager: ConnectionManager<C, P>,
    dispatcher: CommandDispatcher,
    receiver: StateReceiver,
    session: watch::Sender<ConnectionSession>,
    events: mpsc::UnboundedSender<ClientEvent>,
    cancel: CancellationToken,
}

impl<C: Connector, P: HealthProbe> Worker<C, P> {
    async fn run(mut self) {
        loop {
            match self.connect_if_ready().await {
                Attempt::Cancelled => break,
                Attempt::Unreachable(reason) => {
                    debug!("connection: {}", reason);
                    self.session.send_modify(|s| s.last_error = Some(reason));
                }
                Attempt::Open(channel) => {
                    self.manager.backoff.reset();
                    self.session.send_modify(|s| {
                        s.connected = true;
                        s.last_error = None;
                        s.reconnect_attempt = 0;
                    });

                    let end = self.run_session(channel).await;
                    self.dispatcher.detach();

                    let cancelled = matches!(end, SessionEnd::Cancelled);
                    let reason = match end {
                        SessionEnd::Cancelled => None,
                        SessionEnd::Closed(reason) => reason,
                    };
                    info!("connection: closed ({})", reason.as_deref().unwrap_or("clean"));
                    self.session.send_modify(|s| {
                        s.connected = false;
                        if reason.is_some() {
                            s.last_error = reason.clone();
                        }
                    });
                    let _ = self.events.send(ClientEvent::Disconnected { reason });

                    if cancelled {
                        break;
                    }
                }
            }

            let delay = self.manager.backoff.next_delay();
            let attempt = self.manager.backoff.attempt();
            self.session.send_modify(|s| s.reconnect_attempt = attempt);
            debug!("connection: retry {} in {:?}", attempt, delay);
            let _ = self.events.send(ClientEvent::RetryScheduled { attempt, delay });

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.dispatcher.detach();
        self.session.send_modify(|s| s.connected = false);
        debug!("connection: manager stopped");
    }

    async fn connect_if_ready(&self) -> Attempt {
        if self.cancel.is_cancelled() {
            return Attempt::Cancelled;
        }

        let healthy = tokio::select! {
            _ = self.cancel.cancelled() => return Attempt::Cancelled,
            result = tokio::time::timeout(self.manager.probe_timeout, self.manager.probe.check()) => {
                matches!(result, Ok(true))
            }
        };
        if !healthy {
            return Attempt::Unreachable("hub unreachable".to_string());
        }

        tokio::select! {
            _ = self.cancel.cancelled() => Attempt::Cancelled,
            result = self.manager.connector.connect() => match result {
                Ok(channel) => Attempt::Open(channel),
                Err(e) => {
                    warn!("connection: {}", e);
                    Attempt::Unreachable(e.to_string())
                }
            },
        }
    }

    async fn run_session(&mut self, channel: Channel) -> SessionEnd {
        let Channel {
            mut sink,
            mut stream,
        } = channel;
        let (tx, mut rx) = mpsc::unbounded_channel::<ClientMessage>();
        self.dispatcher.attach(tx);
        info!("connection: channel open");
        let _ = self.events.send(ClientEvent::Connected);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    if tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await.is_err() {
                        warn!("connection: close handshake timed out, dropping channel");
                    }
                    return SessionEnd::Cancelled;
                }
                Some(msg) = rx.recv() => {
                    let text = match msg.encode() {
                        Ok(t) => t,
                        Err(e) => {
                            warn!("connection: cannot encode {}: {}", msg.action, e);
                            continue;
                        }
                    };
                    let sent = tokio::select! {
                        _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
                        result = sink.send(text) => result,
                    };
                    if let Err(e) = sent {
                        return SessionEnd::Closed(Some(e.to_string()));
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(text)) => self.receiver.handle_frame(&text),
                    // Recorded only; the stream ending is what closes the session.
                    Some(Err(e)) => {
                        warn!("connection: channel error: {}", e);
                        self.session.send_modify(|s| s.last_error = Some(e.to_string()));
                    }
                    None => {
                        let reason = self.session.borrow().last_error.clone();
                        return SessionEnd::Closed(reason.or_else(|| Some("closed by hub".to_string())));
                    }
                },
            }
        }
    }
}
