use crate::transport::{Connector, Transport, TransportError, TransportEvent};
use execwatch_core::ConnectionStatus;
use serde::Serialize;
use std::future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(1_000);
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 1.5;
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_millis(30_000);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const OPEN_RESULT_QUEUE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max: DEFAULT_BACKOFF_MAX,
        }
    }
}

impl BackoffConfig {
    fn sanitized(self) -> Self {
        let multiplier = if self.multiplier.is_finite() && self.multiplier >= 1.0 {
            self.multiplier
        } else {
            DEFAULT_BACKOFF_MULTIPLIER
        };
        let max = self.max.max(self.base);
        Self {
            base: self.base,
            multiplier,
            max,
        }
    }
}

pub fn next_backoff(current: Duration, config: &BackoffConfig) -> Duration {
    let next = current.mul_f64(config.multiplier);
    if next > config.max {
        config.max
    } else {
        next
    }
}

/// Exponential retry delay. `next_delay` hands out the current delay and
/// grows the one after it.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let config = config.sanitized();
        Self {
            current: config.base,
            config,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = next_backoff(delay, &self.config);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.config.base;
    }
}

/// Aggregate connection status published to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Delay the next scheduled retry will wait.
    pub reconnect_delay: Duration,
    pub reconnect_attempts: u32,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Idle,
            reconnect_delay: DEFAULT_BACKOFF_BASE,
            reconnect_attempts: 0,
        }
    }
}

/// What the driver must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    Open,
    Reopen,
    ScheduleRetry(Duration),
    Close,
}

/// Connection lifecycle without any I/O.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    enabled: bool,
    torn_down: bool,
    status: ConnectionStatus,
    attempts: u32,
    backoff: Backoff,
}

impl ConnectionMachine {
    pub fn new(enabled: bool, backoff: BackoffConfig) -> Self {
        Self {
            enabled,
            torn_down: false,
            status: ConnectionStatus::Idle,
            attempts: 0,
            backoff: Backoff::new(backoff),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState {
            status: self.status,
            reconnect_delay: self.backoff.current(),
            reconnect_attempts: self.attempts,
        }
    }

    /// Only opens from a state with no connection in flight.
    pub fn connect(&mut self) -> Effect {
        if self.torn_down || !self.enabled {
            return Effect::None;
        }
        match self.status {
            ConnectionStatus::Idle | ConnectionStatus::Disconnected => {
                self.status = ConnectionStatus::Connecting;
                Effect::Open
            }
            _ => Effect::None,
        }
    }

    pub fn opened(&mut self) -> Effect {
        if self.torn_down || self.status != ConnectionStatus::Connecting {
            return Effect::Close;
        }
        self.status = ConnectionStatus::Connected;
        self.attempts = 0;
        self.backoff.reset();
        Effect::None
    }

    pub fn errored(&mut self) -> Effect {
        if !self.torn_down
            && matches!(
                self.status,
                ConnectionStatus::Connected | ConnectionStatus::Connecting
            )
        {
            self.status = ConnectionStatus::Error;
        }
        Effect::None
    }

    /// Close and failed open take the same path.
    pub fn closed(&mut self) -> Effect {
        if self.torn_down {
            return Effect::None;
        }
        match self.status {
            ConnectionStatus::Connected | ConnectionStatus::Connecting | ConnectionStatus::Error => {
                self.status = ConnectionStatus::Reconnecting;
                self.attempts = self.attempts.saturating_add(1);
                Effect::ScheduleRetry(self.backoff.next_delay())
            }
            _ => Effect::None,
        }
    }

    pub fn retry_due(&mut self) -> Effect {
        if self.torn_down || self.status != ConnectionStatus::Reconnecting {
            return Effect::None;
        }
        self.status = ConnectionStatus::Connecting;
        Effect::Open
    }

    /// Valid from any state: drops the current connection and opens at once.
    pub fn reconnect(&mut self) -> Effect {
        if self.torn_down || !self.enabled {
            return Effect::None;
        }
        self.backoff.reset();
        self.attempts = 0;
        self.status = ConnectionStatus::Connecting;
        Effect::Reopen
    }

    pub fn teardown(&mut self) -> Effect {
        self.torn_down = true;
        self.status = ConnectionStatus::Disconnected;
        Effect::Close
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: Url,
    pub enabled: bool,
    pub backoff: BackoffConfig,
    /// An open attempt still pending after this long fails like a refused one.
    pub connect_timeout: Duration,
}

#[derive(Debug)]
enum Command {
    Connect,
    Reconnect,
    Send(String),
    Teardown,
}

type OpenResult = (u64, Result<Transport, TransportError>);

/// Handle to the connection driver task. Clones share one connection.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionManager {
    /// Starts the driver. Inbound text frames are forwarded to `inbound` in
    /// arrival order.
    pub fn spawn(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        inbound: mpsc::Sender<String>,
    ) -> Self {
        let machine = ConnectionMachine::new(config.enabled, config.backoff);
        let (state_tx, state_rx) = watch::channel(machine.state());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (open_tx, open_rx) = mpsc::channel(OPEN_RESULT_QUEUE);

        let driver = Driver {
            url: config.url,
            connect_timeout: config.connect_timeout,
            connector,
            machine,
            state_tx,
            inbound,
            generation: 0,
            active: None,
            retry_at: None,
            open_tx,
        };
        tokio::spawn(driver.run(command_rx, open_rx));

        Self {
            commands: command_tx,
            state: state_rx,
        }
    }

    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    pub fn reconnect(&self) {
        let _ = self.commands.send(Command::Reconnect);
    }

    /// Writes the payload only while connected. Returns false when the
    /// payload was dropped.
    pub fn send<T: Serialize>(&self, payload: &T) -> bool {
        let status = self.status();
        if status != ConnectionStatus::Connected {
            warn!(event = "send_dropped", status = %status);
            return false;
        }
        let text = match serde_json::to_string(payload) {
            Ok(text) => text,
            Err(err) => {
                warn!(event = "send_encode_error", error = %err);
                return false;
            }
        };
        self.commands.send(Command::Send(text)).is_ok()
    }

    pub fn teardown(&self) {
        let _ = self.commands.send(Command::Teardown);
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.borrow().status
    }
}

struct Driver {
    url: Url,
    connect_timeout: Duration,
    connector: Arc<dyn Connector>,
    machine: ConnectionMachine,
    state_tx: watch::Sender<ConnectionState>,
    inbound: mpsc::Sender<String>,
    generation: u64,
    active: Option<Transport>,
    retry_at: Option<Instant>,
    open_tx: mpsc::Sender<OpenResult>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut open_results: mpsc::Receiver<OpenResult>,
    ) {
        loop {
            let retry_pending = self.retry_at.is_some();
            let retry_at = self.retry_at.unwrap_or_else(Instant::now);

            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Connect) => {
                            let effect = self.machine.connect();
                            self.apply(effect);
                        }
                        Some(Command::Reconnect) => {
                            info!(event = "connection_reconnect_requested");
                            let effect = self.machine.reconnect();
                            self.apply(effect);
                        }
                        Some(Command::Send(text)) => self.write(text),
                        Some(Command::Teardown) | None => {
                            let effect = self.machine.teardown();
                            self.apply(effect);
                            info!(event = "connection_teardown");
                            break;
                        }
                    }
                }
                Some((generation, result)) = open_results.recv() => {
                    self.on_open_result(generation, result);
                }
                event = next_event(&mut self.active) => {
                    self.on_transport_event(event).await;
                }
                _ = sleep_until(retry_at), if retry_pending => {
                    self.retry_at = None;
                    let effect = self.machine.retry_due();
                    self.apply(effect);
                }
            }
        }
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::None => {}
            Effect::Open => self.open(),
            Effect::Reopen => {
                self.close();
                self.open();
            }
            Effect::ScheduleRetry(delay) => {
                info!(
                    event = "connection_retry_scheduled",
                    delay_ms = delay.as_millis() as u64,
                    attempt = self.machine.state().reconnect_attempts
                );
                self.retry_at = Some(Instant::now() + delay);
            }
            Effect::Close => self.close(),
        }
        self.publish();
    }

    fn open(&mut self) {
        self.retry_at = None;
        self.generation += 1;
        let generation = self.generation;
        let pending = self.connector.connect(&self.url);
        let open_tx = self.open_tx.clone();
        let limit = self.connect_timeout;
        debug!(event = "connection_open", url = %self.url, generation);
        tokio::spawn(async move {
            let result = match timeout(limit, pending).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Connect(format!(
                    "timed out after {}ms",
                    limit.as_millis()
                ))),
            };
            let _ = open_tx.send((generation, result)).await;
        });
    }

    fn close(&mut self) {
        self.retry_at = None;
        // Invalidates any open still in flight.
        self.generation += 1;
        if self.active.take().is_some() {
            debug!(event = "connection_closed_locally");
        }
    }

    fn on_open_result(&mut self, generation: u64, result: Result<Transport, TransportError>) {
        if generation != self.generation {
            debug!(event = "connection_open_stale", generation);
            return;
        }
        match result {
            Ok(transport) => {
                let effect = self.machine.opened();
                if effect == Effect::None {
                    self.active = Some(transport);
                }
                self.apply(effect);
            }
            Err(err) => {
                warn!(event = "connection_open_error", error = %err);
                let effect = self.machine.closed();
                self.apply(effect);
            }
        }
    }

    async fn on_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Message(text)) => {
                if self.inbound.send(text).await.is_err() {
                    debug!(event = "inbound_receiver_closed");
                }
            }
            Some(TransportEvent::Error(err)) => {
                warn!(event = "connection_error", error = %err);
                let effect = self.machine.errored();
                self.apply(effect);
            }
            Some(TransportEvent::Closed) | None => {
                self.active = None;
                let effect = self.machine.closed();
                self.apply(effect);
            }
        }
    }

    fn write(&mut self, text: String) {
        let Some(active) = self.active.as_ref() else {
            warn!(event = "send_dropped", status = %self.machine.status());
            return;
        };
        if self.machine.status() != ConnectionStatus::Connected {
            warn!(event = "send_dropped", status = %self.machine.status());
            return;
        }
        if let Err(err) = active.outgoing.try_send(text) {
            warn!(event = "send_dropped", error = %err);
        }
    }

    fn publish(&self) {
        let next = self.machine.state();
        let changed_status = self.state_tx.borrow().status != next.status;
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });
        if changed_status {
            info!(
                event = "connection_status",
                status = %next.status,
                attempts = next.reconnect_attempts
            );
        }
    }
}

async fn next_event(active: &mut Option<Transport>) -> Option<TransportEvent> {
    match active {
        Some(transport) => transport.incoming.recv().await,
        None => future::pending().await,
    }
}
