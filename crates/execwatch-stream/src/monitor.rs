use crate::buffer::{ExecutionPatch, ExecutionRecord, ExecutionSummary};
use crate::cache::BlockSet;
use crate::connection::ConnectionState;
use crate::resync::{FetchError, Resync};
use crate::router::{CliAction, Dispatch, Router};
use crate::store::ExecutionStore;
use crate::MonitorConfig;
use execwatch_core::wire::{
    CoordinatorEvent, NodeCompletedPayload, NodeFailedPayload, NodeStartedPayload,
    OrchestratorMessage, PipelineLogPayload, PipelineStateUpdate, SurfaceUpdate,
};
use execwatch_core::{now_ms, ConnectionStatus, ExecutionStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

/// Notifications for read-only consumers of the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    Surface(SurfaceUpdate),
    Coordinator(CoordinatorEvent),
    PipelineState(PipelineStateUpdate),
    NodeStarted(NodeStartedPayload),
    NodeCompleted(NodeCompletedPayload),
    NodeFailed(NodeFailedPayload),
    PipelineLog(PipelineLogPayload),
    ExecutionStarted {
        execution_id: String,
        tool: String,
        mode: String,
    },
    ExecutionFinished {
        execution_id: String,
        status: ExecutionStatus,
    },
}

/// Shared flag gating every message-driven mutation. Once revoked it stays revoked.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn revoke(&self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
struct MonitorState {
    router: Router,
    store: ExecutionStore,
}

/// The ingestion service object: router plus execution store behind one
/// lock, so each message is applied completely before the next.
#[derive(Clone)]
pub struct Monitor {
    alive: Liveness,
    state: Arc<Mutex<MonitorState>>,
    events: mpsc::Sender<MonitorEvent>,
    resync: Option<Arc<dyn Resync>>,
}

impl Monitor {
    pub fn new(config: &MonitorConfig, events: mpsc::Sender<MonitorEvent>) -> Self {
        Self {
            alive: Liveness::new(),
            state: Arc::new(Mutex::new(MonitorState {
                router: Router::new(config.max_frame_bytes),
                store: ExecutionStore::new(config.max_lines_per_execution),
            })),
            events,
            resync: None,
        }
    }

    pub fn with_resync(mut self, resync: Arc<dyn Resync>) -> Self {
        self.resync = Some(resync);
        self
    }

    pub fn liveness(&self) -> Liveness {
        self.alive.clone()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.is_alive()
    }

    pub fn teardown(&self) {
        self.alive.revoke();
    }

    pub async fn track_coordinator(&self, execution_id: Option<String>) {
        self.state.lock().await.router.track_coordinator(execution_id);
    }

    pub async fn track_orchestrator(&self, execution_id: Option<String>) {
        self.state.lock().await.router.track_orchestrator(execution_id);
    }

    /// Routes and applies one inbound frame. Returns false when the monitor
    /// has been torn down and the frame was discarded untouched.
    pub async fn handle_message(&self, text: &str) -> bool {
        if !self.is_alive() {
            debug!(event = "message_after_teardown", bytes = text.len());
            return false;
        }
        let mut state = self.state.lock().await;
        if !self.is_alive() {
            return false;
        }
        let dispatch = state.router.route(text, now_ms());
        self.apply(&mut state.store, dispatch);
        true
    }

    fn apply(&self, store: &mut ExecutionStore, dispatch: Dispatch) {
        match dispatch {
            Dispatch::Cli(action) => self.apply_cli(store, action),
            Dispatch::Surface(update) => self.emit(MonitorEvent::Surface(update)),
            Dispatch::Coordinator(event) => self.emit(MonitorEvent::Coordinator(event)),
            Dispatch::Orchestrator(message) => self.emit(match message {
                OrchestratorMessage::StateUpdate(payload) => MonitorEvent::PipelineState(payload),
                OrchestratorMessage::NodeStarted(payload) => MonitorEvent::NodeStarted(payload),
                OrchestratorMessage::NodeCompleted(payload) => MonitorEvent::NodeCompleted(payload),
                OrchestratorMessage::NodeFailed(payload) => MonitorEvent::NodeFailed(payload),
                OrchestratorMessage::Log(payload) => MonitorEvent::PipelineLog(payload),
            }),
            Dispatch::Ignored(_) | Dispatch::Dropped(_) => {}
        }
    }

    fn apply_cli(&self, store: &mut ExecutionStore, action: CliAction) {
        match action {
            CliAction::Started {
                execution_id,
                tool,
                mode,
                start_time,
            } => {
                store.upsert(
                    &execution_id,
                    ExecutionPatch {
                        tool: Some(tool),
                        mode: Some(mode),
                        status: Some(ExecutionStatus::Running),
                        start_time: Some(start_time.unwrap_or_else(now_ms)),
                        end_time: Some(None),
                        ..ExecutionPatch::default()
                    },
                );
                let (tool, mode) = store
                    .get(&execution_id)
                    .map(|record| (record.tool.clone(), record.mode.clone()))
                    .unwrap_or_default();
                info!(event = "execution_started", execution_id = %execution_id, tool = %tool);
                self.emit(MonitorEvent::ExecutionStarted {
                    execution_id,
                    tool,
                    mode,
                });
            }
            CliAction::Output {
                execution_id,
                lines,
            } => {
                let mut evicted = 0;
                for line in lines {
                    evicted += store.append(&execution_id, line).evicted;
                }
                if evicted > 0 {
                    debug!(event = "execution_lines_truncated", execution_id = %execution_id, evicted);
                }
            }
            CliAction::Completed {
                execution_id,
                status,
                duration_ms,
            } => {
                if !store.contains(&execution_id) {
                    debug!(event = "completion_for_unknown_execution", execution_id = %execution_id);
                    return;
                }
                store.upsert(
                    &execution_id,
                    ExecutionPatch {
                        status: Some(status),
                        end_time: Some(Some(now_ms())),
                        reported_duration_ms: duration_ms,
                        ..ExecutionPatch::default()
                    },
                );
                info!(event = "execution_finished", execution_id = %execution_id, status = %status);
                self.emit(MonitorEvent::ExecutionFinished {
                    execution_id,
                    status,
                });
            }
        }
    }

    fn emit(&self, event: MonitorEvent) {
        if let Err(err) = self.events.try_send(event) {
            debug!(event = "monitor_event_dropped", error = %err);
        }
    }

    pub async fn executions(&self) -> Vec<ExecutionSummary> {
        self.state.lock().await.store.summaries()
    }

    pub async fn execution(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.state.lock().await.store.get(execution_id).cloned()
    }

    pub async fn blocks(&self, execution_id: &str) -> BlockSet {
        self.state.lock().await.store.blocks(execution_id)
    }

    pub async fn invalidate(&self, execution_id: &str) -> bool {
        self.state.lock().await.store.invalidate(execution_id)
    }

    pub async fn remove(&self, execution_id: &str) -> bool {
        self.state.lock().await.store.remove(execution_id).is_some()
    }

    pub async fn remove_finished(&self) -> Vec<String> {
        self.state.lock().await.store.remove_finished()
    }

    /// Pulls authoritative execution state and merges it as recovered.
    /// Returns the number of executions applied.
    pub async fn resync(&self) -> Result<usize, FetchError> {
        let Some(resync) = self.resync.clone() else {
            return Ok(0);
        };
        let snapshots = resync.active_executions().await?;
        if !self.is_alive() {
            return Ok(0);
        }

        let now = now_ms();
        let mut state = self.state.lock().await;
        for snapshot in &snapshots {
            let finished_locally = state
                .store
                .get(&snapshot.id)
                .is_some_and(|record| record.status.is_terminal());
            let (status, end_time) = if snapshot.status.is_terminal() {
                (
                    Some(snapshot.status),
                    Some(Some(snapshot.end_time.unwrap_or(now))),
                )
            } else if finished_locally {
                // A live completion outranks a snapshot taken before it.
                debug!(event = "execution_resync_kept_terminal", execution_id = %snapshot.id);
                (None, None)
            } else {
                (Some(snapshot.status), Some(None))
            };
            state.store.upsert(
                &snapshot.id,
                ExecutionPatch {
                    tool: Some(snapshot.tool.clone()),
                    mode: Some(snapshot.mode.clone()),
                    status,
                    start_time: snapshot.start_time,
                    end_time,
                    recovered: Some(true),
                    ..ExecutionPatch::default()
                },
            );
            state
                .store
                .seed_lines(&snapshot.id, snapshot.output_lines(now));
        }
        info!(event = "execution_resync", executions = snapshots.len());
        Ok(snapshots.len())
    }

    /// Consumes inbound frames until the connection driver goes away.
    /// Re-entering `Connected` after an earlier connection triggers a resync;
    /// reaching `Disconnected` revokes liveness.
    pub async fn run(
        self,
        mut inbound: mpsc::Receiver<String>,
        mut status: watch::Receiver<ConnectionState>,
    ) {
        let mut last_status = status.borrow_and_update().status;
        let mut was_connected = last_status == ConnectionStatus::Connected;
        let mut status_open = true;

        loop {
            tokio::select! {
                message = inbound.recv() => {
                    match message {
                        Some(text) => {
                            self.handle_message(&text).await;
                        }
                        None => break,
                    }
                }
                changed = status.changed(), if status_open => {
                    if changed.is_err() {
                        status_open = false;
                        continue;
                    }
                    let current = status.borrow_and_update().status;
                    if current == last_status {
                        continue;
                    }
                    last_status = current;
                    match current {
                        ConnectionStatus::Connected => {
                            if was_connected {
                                if let Err(err) = self.resync().await {
                                    warn!(event = "execution_resync_error", error = %err);
                                }
                            }
                            was_connected = true;
                        }
                        ConnectionStatus::Disconnected => self.teardown(),
                        _ => {}
                    }
                }
            }
        }
        debug!(event = "monitor_stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resync::ExecutionSnapshot;
    use crate::segment::BlockKind;
    use execwatch_core::OutputKind;
    use futures_util::future::BoxFuture;
    use serde_json::json;

    struct FixedResync(Vec<ExecutionSnapshot>);

    impl Resync for FixedResync {
        fn active_executions(
            &self,
        ) -> BoxFuture<'static, Result<Vec<ExecutionSnapshot>, FetchError>> {
            let snapshots = self.0.clone();
            Box::pin(async move { Ok(snapshots) })
        }
    }

    fn monitor() -> (Monitor, mpsc::Receiver<MonitorEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (Monitor::new(&MonitorConfig::default(), tx), rx)
    }

    fn started(execution_id: &str) -> String {
        json!({
            "type": "CLI_STARTED",
            "payload": {"executionId": execution_id, "tool": "codex", "mode": "write", "timestamp": 1000}
        })
        .to_string()
    }

    fn output(execution_id: &str, chunk_type: &str, data: &str) -> String {
        json!({
            "type": "CLI_OUTPUT",
            "payload": {"executionId": execution_id, "chunkType": chunk_type, "data": data}
        })
        .to_string()
    }

    fn completed(execution_id: &str, success: bool) -> String {
        json!({
            "type": "CLI_COMPLETED",
            "payload": {"executionId": execution_id, "success": success, "duration": 42}
        })
        .to_string()
    }

    #[tokio::test]
    async fn cli_lifecycle_builds_record_and_events() {
        let (monitor, mut events) = monitor();
        assert!(monitor.handle_message(&started("exec-1")).await);
        monitor
            .handle_message(&output("exec-1", "stdout", "compiling\nlinking"))
            .await;
        monitor
            .handle_message(&output("exec-1", "stderr", "warning: unused"))
            .await;
        monitor.handle_message(&completed("exec-1", false)).await;

        let record = monitor.execution("exec-1").await.expect("record");
        assert_eq!(record.tool, "codex");
        assert_eq!(record.start_time, 1000);
        assert_eq!(record.status, ExecutionStatus::Error);
        assert!(record.end_time.is_some());
        assert_eq!(record.reported_duration_ms, Some(42));
        assert_eq!(record.lines.len(), 3);

        let blocks = monitor.blocks("exec-1").await;
        let kinds: Vec<_> = blocks.iter().map(|block| block.kind).collect();
        assert_eq!(kinds, vec![BlockKind::Stdout, BlockKind::Stderr]);

        assert_eq!(
            events.try_recv().expect("started event"),
            MonitorEvent::ExecutionStarted {
                execution_id: "exec-1".to_string(),
                tool: "codex".to_string(),
                mode: "write".to_string(),
            }
        );
        assert_eq!(
            events.try_recv().expect("finished event"),
            MonitorEvent::ExecutionFinished {
                execution_id: "exec-1".to_string(),
                status: ExecutionStatus::Error,
            }
        );
    }

    #[tokio::test]
    async fn restart_clears_previous_end_time() {
        let (monitor, _events) = monitor();
        monitor.handle_message(&started("exec-1")).await;
        monitor.handle_message(&completed("exec-1", true)).await;
        monitor.handle_message(&started("exec-1")).await;
        let record = monitor.execution("exec-1").await.expect("record");
        assert_eq!(record.status, ExecutionStatus::Running);
        assert_eq!(record.end_time, None);
    }

    #[tokio::test]
    async fn pipeline_messages_reach_consumers_only_when_tracked() {
        let (monitor, mut events) = monitor();
        let log = json!({
            "type": "ORCHESTRATOR_LOG",
            "payload": {
                "execId": "pipe-1",
                "log": {"timestamp": 1, "level": "info", "message": "node ready"},
                "timestamp": 1
            }
        })
        .to_string();

        monitor.handle_message(&log).await;
        assert!(events.try_recv().is_err());

        monitor.track_orchestrator(Some("pipe-1".to_string())).await;
        monitor.handle_message(&log).await;
        let Ok(MonitorEvent::PipelineLog(payload)) = events.try_recv() else {
            panic!("expected pipeline log event");
        };
        assert_eq!(payload.log.message, "node ready");
    }

    #[tokio::test]
    async fn full_event_queue_does_not_block_ingestion() {
        let (tx, _rx) = mpsc::channel(1);
        let monitor = Monitor::new(&MonitorConfig::default(), tx);
        for index in 0..5 {
            let id = format!("exec-{index}");
            assert!(monitor.handle_message(&started(&id)).await);
        }
        assert_eq!(monitor.executions().await.len(), 5);
    }

    #[tokio::test]
    async fn teardown_gates_every_mutation() {
        let (monitor, _events) = monitor();
        monitor.handle_message(&started("exec-1")).await;
        let liveness = monitor.liveness();
        liveness.revoke();

        assert!(!monitor.handle_message(&output("exec-1", "stdout", "late")).await);
        assert!(!monitor.handle_message(&started("exec-2")).await);
        let record = monitor.execution("exec-1").await.expect("record");
        assert!(record.lines.is_empty());
        assert_eq!(monitor.executions().await.len(), 1);
    }

    #[tokio::test]
    async fn resync_marks_recovered_and_seeds_empty_records() {
        let snapshot = |id: &str| ExecutionSnapshot {
            id: id.to_string(),
            tool: "gemini".to_string(),
            mode: "analysis".to_string(),
            status: ExecutionStatus::Running,
            start_time: Some(500),
            end_time: None,
            output: vec![crate::resync::SnapshotLine {
                kind: OutputKind::Stdout,
                content: "from history".to_string(),
                timestamp: Some(600),
            }],
        };
        let (tx, _rx) = mpsc::channel(16);
        let monitor = Monitor::new(&MonitorConfig::default(), tx).with_resync(Arc::new(
            FixedResync(vec![snapshot("exec-1"), snapshot("exec-2")]),
        ));
        monitor
            .handle_message(&output("exec-1", "stdout", "live line"))
            .await;

        assert_eq!(monitor.resync().await, Ok(2));
        let live = monitor.execution("exec-1").await.expect("record");
        assert!(live.recovered);
        assert_eq!(live.lines.len(), 1);
        assert_eq!(live.lines[0].content, "live line");

        let restored = monitor.execution("exec-2").await.expect("record");
        assert_eq!(restored.tool, "gemini");
        assert_eq!(restored.start_time, 500);
        assert_eq!(restored.lines[0].content, "from history");
    }

    #[tokio::test]
    async fn completion_for_unknown_execution_is_ignored() {
        let (monitor, mut events) = monitor();
        assert!(monitor.handle_message(&completed("ghost", true)).await);
        assert!(monitor.execution("ghost").await.is_none());
        assert!(monitor.executions().await.is_empty());
        assert!(events.try_recv().is_err());
    }

    fn running_snapshot(id: &str) -> ExecutionSnapshot {
        ExecutionSnapshot {
            id: id.to_string(),
            tool: "codex".to_string(),
            mode: "write".to_string(),
            status: ExecutionStatus::Running,
            start_time: Some(1000),
            end_time: None,
            output: Vec::new(),
        }
    }

    #[tokio::test]
    async fn stale_running_snapshot_keeps_local_completion() {
        let (tx, _rx) = mpsc::channel(16);
        let monitor = Monitor::new(&MonitorConfig::default(), tx)
            .with_resync(Arc::new(FixedResync(vec![running_snapshot("exec-1")])));
        monitor.handle_message(&started("exec-1")).await;
        monitor
            .handle_message(&output("exec-1", "stdout", "done"))
            .await;
        monitor.handle_message(&completed("exec-1", true)).await;
        let end_time = monitor.execution("exec-1").await.expect("record").end_time;

        assert_eq!(monitor.resync().await, Ok(1));
        let record = monitor.execution("exec-1").await.expect("record");
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.end_time, end_time);
        assert!(record.recovered);
    }

    #[tokio::test]
    async fn running_snapshot_clears_end_and_is_never_cached() {
        let (tx, _rx) = mpsc::channel(16);
        let monitor = Monitor::new(&MonitorConfig::default(), tx)
            .with_resync(Arc::new(FixedResync(vec![running_snapshot("exec-1")])));
        monitor
            .handle_message(&output("exec-1", "stdout", "partial"))
            .await;
        {
            let mut state = monitor.state.lock().await;
            state.store.upsert(
                "exec-1",
                ExecutionPatch {
                    end_time: Some(Some(5)),
                    ..ExecutionPatch::default()
                },
            );
        }

        assert_eq!(monitor.resync().await, Ok(1));
        let record = monitor.execution("exec-1").await.expect("record");
        assert_eq!(record.status, ExecutionStatus::Running);
        assert_eq!(record.end_time, None);

        let first = monitor.blocks("exec-1").await;
        let second = monitor.blocks("exec-1").await;
        assert_eq!(first, second);
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn remove_finished_keeps_running_executions() {
        let (monitor, _events) = monitor();
        monitor.handle_message(&started("done")).await;
        monitor.handle_message(&completed("done", true)).await;
        monitor.handle_message(&started("live")).await;

        assert_eq!(monitor.remove_finished().await, vec!["done"]);
        assert!(monitor.execution("done").await.is_none());
        assert!(monitor.remove("live").await);
        assert!(monitor.executions().await.is_empty());
    }
}
