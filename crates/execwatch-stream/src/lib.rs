//! Real-time ingestion pipeline for tool executions streamed over a
//! dashboard WebSocket: connection management, message routing, bounded
//! output buffering and display-block segmentation.

pub mod buffer;
pub mod cache;
pub mod connection;
pub mod monitor;
pub mod resync;
pub mod router;
pub mod segment;
pub mod store;
pub mod transport;

pub use buffer::{ExecutionPatch, ExecutionRecord, ExecutionSummary, IngestionBuffer};
pub use cache::{BlockCache, BlockSet};
pub use connection::{
    BackoffConfig, ConnectionConfig, ConnectionManager, ConnectionState, DEFAULT_CONNECT_TIMEOUT,
};
pub use monitor::{Liveness, Monitor, MonitorEvent};
pub use resync::{ExecutionSnapshot, FetchError, Resync};
pub use router::{Dispatch, Router};
pub use segment::{segment, BlockKind, BlockStatus, DisplayBlock};
pub use store::ExecutionStore;
pub use transport::{ChannelConnector, Connector, TransportError, WsConnector};

use execwatch_core::wire::DEFAULT_MAX_FRAME_BYTES;
use execwatch_core::DEFAULT_MAX_LINES;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

pub const DEFAULT_URL: &str = "ws://127.0.0.1:3456/ws";
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1_024;
const INBOUND_QUEUE_CAPACITY: usize = 1_024;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub url: Url,
    pub enabled: bool,
    pub backoff: BackoffConfig,
    pub connect_timeout: Duration,
    pub max_lines_per_execution: usize,
    pub max_frame_bytes: usize,
    pub event_queue_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            url: Url::parse(DEFAULT_URL).expect("valid default url"),
            enabled: true,
            backoff: BackoffConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_lines_per_execution: DEFAULT_MAX_LINES,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
        }
    }
}

impl MonitorConfig {
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            url: self.url.clone(),
            enabled: self.enabled,
            backoff: self.backoff,
            connect_timeout: self.connect_timeout,
        }
    }
}

/// A running pipeline: connection driver feeding one monitor task.
pub struct Pipeline {
    pub monitor: Monitor,
    pub connection: ConnectionManager,
    pub events: mpsc::Receiver<MonitorEvent>,
    task: JoinHandle<()>,
}

impl Pipeline {
    pub fn start(
        config: &MonitorConfig,
        connector: Arc<dyn Connector>,
        resync: Option<Arc<dyn Resync>>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_queue_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);

        let mut monitor = Monitor::new(config, event_tx);
        if let Some(resync) = resync {
            monitor = monitor.with_resync(resync);
        }
        let connection = ConnectionManager::spawn(config.connection_config(), connector, inbound_tx);
        let task = tokio::spawn(monitor.clone().run(inbound_rx, connection.subscribe()));
        connection.connect();

        Self {
            monitor,
            connection,
            events: event_rx,
            task,
        }
    }

    /// Revokes liveness, cancels any pending retry and closes the connection,
    /// then waits for the monitor task to drain.
    pub async fn shutdown(self) {
        self.monitor.teardown();
        self.connection.teardown();
        if let Err(err) = self.task.await {
            tracing::warn!(event = "monitor_task_error", error = %err);
        }
    }
}
