mod config;
mod logging;
mod snapshot;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::Parser;
use config::Args;
use execwatch_core::{ConnectionStatus, ExecutionStatus};
use execwatch_stream::{
    BlockSet, ConnectionState, DisplayBlock, Monitor, MonitorEvent, Pipeline, Resync, WsConnector,
};
use snapshot::FileResync;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = config::load_config(args)?;
    let _log_guard = logging::init_logging(&config);

    let resync = config
        .resync_file
        .clone()
        .map(|path| Arc::new(FileResync::new(path)) as Arc<dyn Resync>);
    let mut pipeline = Pipeline::start(&config.monitor, Arc::new(WsConnector), resync);
    pipeline
        .monitor
        .track_coordinator(config.coordinator.clone())
        .await;
    pipeline
        .monitor
        .track_orchestrator(config.orchestrator.clone())
        .await;
    info!(
        event = "monitor_started",
        url = %config.monitor.url,
        enabled = config.monitor.enabled
    );

    let mut states = pipeline.connection.subscribe();
    let mut states_open = true;
    loop {
        tokio::select! {
            event = pipeline.events.recv() => {
                let Some(event) = event else {
                    break;
                };
                report_event(&pipeline.monitor, event, config.json).await?;
            }
            changed = states.changed(), if states_open => {
                if changed.is_err() {
                    states_open = false;
                    continue;
                }
                let state = states.borrow_and_update().clone();
                eprintln!("{}", describe_state(&state));
            }
            _ = tokio::signal::ctrl_c() => {
                info!(event = "shutdown_requested");
                break;
            }
        }
    }

    pipeline.shutdown().await;
    Ok(())
}

async fn report_event(monitor: &Monitor, event: MonitorEvent, json: bool) -> Result<()> {
    match event {
        MonitorEvent::ExecutionFinished {
            execution_id,
            status,
        } => {
            let blocks = monitor.blocks(&execution_id).await;
            if json {
                for block in blocks.iter() {
                    let line = serde_json::to_string(block).context("encode block")?;
                    println!("{line}");
                }
            } else {
                print!("{}", render_execution(&execution_id, status, &blocks));
            }
        }
        other => {
            if let Some(line) = describe_event(&other) {
                eprintln!("{line}");
            }
        }
    }
    Ok(())
}

fn describe_state(state: &ConnectionState) -> String {
    match state.status {
        ConnectionStatus::Reconnecting => format!(
            "connection: reconnecting (attempt {}, next delay {}ms)",
            state.reconnect_attempts,
            state.reconnect_delay.as_millis()
        ),
        status => format!("connection: {status}"),
    }
}

fn describe_event(event: &MonitorEvent) -> Option<String> {
    let line = match event {
        MonitorEvent::ExecutionStarted {
            execution_id,
            tool,
            mode,
        } => format!("started {execution_id} ({tool}, {mode})"),
        MonitorEvent::PipelineState(update) => format!(
            "pipeline {}: {}{}",
            update.exec_id,
            update.status,
            update
                .current_node_id
                .as_deref()
                .map(|node| format!(" at {node}"))
                .unwrap_or_default()
        ),
        MonitorEvent::NodeStarted(node) => {
            format!("pipeline {}: node {} started", node.exec_id, node.node_id)
        }
        MonitorEvent::NodeCompleted(node) => {
            format!("pipeline {}: node {} completed", node.exec_id, node.node_id)
        }
        MonitorEvent::NodeFailed(node) => format!(
            "pipeline {}: node {} failed: {}",
            node.exec_id, node.node_id, node.error
        ),
        MonitorEvent::PipelineLog(entry) => format!(
            "pipeline {} [{:?}] {}",
            entry.exec_id, entry.log.level, entry.log.message
        ),
        MonitorEvent::Coordinator(event) => format!("coordinator: {}", event.kind),
        MonitorEvent::Surface(update) => format!("surface {} updated", update.surface_id),
        MonitorEvent::ExecutionFinished { .. } => return None,
    };
    Some(line)
}

fn render_execution(execution_id: &str, status: ExecutionStatus, blocks: &BlockSet) -> String {
    let mut out = format!("== {execution_id} {status} ({} blocks)\n", blocks.len());
    for block in blocks.iter() {
        out.push_str(&render_block(block));
    }
    out
}

fn render_block(block: &DisplayBlock) -> String {
    let at = Utc
        .timestamp_millis_opt(block.timestamp)
        .single()
        .map(|time| time.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string());
    let duration = block
        .duration
        .map(|ms| format!(", {ms}ms"))
        .unwrap_or_default();
    let mut out = format!(
        "-- {at} [{}] {} ({} lines{duration})\n",
        block.kind.as_str(),
        block.title,
        block.line_count
    );
    for line in &block.lines {
        out.push_str("   ");
        out.push_str(&line.content);
        out.push('\n');
    }
    out
}
