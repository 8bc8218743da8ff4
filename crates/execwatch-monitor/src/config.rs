use anyhow::{bail, Context, Result};
use clap::Parser;
use execwatch_stream::MonitorConfig;
use std::env;
use std::path::PathBuf;
use url::Url;

const DEFAULT_ADDR: &str = "127.0.0.1:3456";
const DEFAULT_LOG_DIR: &str = ".execwatch/logs";

#[derive(Parser, Debug)]
#[command(name = "execwatch-monitor", about = "Follow tool executions streamed by a dashboard server")]
pub struct Args {
    /// Full WebSocket URL; overrides --addr.
    #[arg(long, default_value = "")]
    pub url: String,
    #[arg(long, default_value = "")]
    pub addr: String,
    #[arg(long, default_value = "")]
    pub log_dir: String,
    /// Start without opening a connection.
    #[arg(long)]
    pub disabled: bool,
    /// Coordinator execution whose COORDINATOR_ messages are followed.
    #[arg(long)]
    pub coordinator: Option<String>,
    /// Pipeline execution whose ORCHESTRATOR_ messages are followed.
    #[arg(long)]
    pub orchestrator: Option<String>,
    /// JSON file answering resync requests with `{success, data}`.
    #[arg(long)]
    pub resync_file: Option<PathBuf>,
    #[arg(long)]
    pub max_lines: Option<usize>,
    /// Print finished blocks as JSON lines.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub monitor: MonitorConfig,
    pub coordinator: Option<String>,
    pub orchestrator: Option<String>,
    pub resync_file: Option<PathBuf>,
    pub log_dir: String,
    pub log_stdout: bool,
    pub json: bool,
}

pub fn load_config(args: Args) -> Result<RuntimeConfig> {
    let url = resolve_url(
        pick(&args.url, env::var("EXECWATCH_URL").ok()),
        pick(&args.addr, env::var("EXECWATCH_ADDR").ok()),
    )?;
    let enabled = !args.disabled
        && env::var("EXECWATCH_ENABLED")
            .ok()
            .and_then(|value| parse_bool_env(&value))
            .unwrap_or(true);
    let max_lines = match args.max_lines {
        Some(value) => value,
        None => match env::var("EXECWATCH_MAX_LINES") {
            Ok(value) if !value.trim().is_empty() => value
                .trim()
                .parse()
                .with_context(|| format!("invalid EXECWATCH_MAX_LINES: {value}"))?,
            _ => execwatch_core::DEFAULT_MAX_LINES,
        },
    };
    if max_lines == 0 {
        bail!("max lines per execution must be positive");
    }

    let monitor = MonitorConfig {
        url,
        enabled,
        max_lines_per_execution: max_lines,
        ..MonitorConfig::default()
    };
    Ok(RuntimeConfig {
        monitor,
        coordinator: non_empty(args.coordinator),
        orchestrator: non_empty(args.orchestrator),
        resync_file: args.resync_file,
        log_dir: pick(&args.log_dir, env::var("EXECWATCH_LOG_DIR").ok())
            .unwrap_or_else(|| DEFAULT_LOG_DIR.to_string()),
        log_stdout: env::var("EXECWATCH_LOG_STDOUT")
            .ok()
            .and_then(|value| parse_bool_env(&value))
            .unwrap_or(false),
        json: args.json,
    })
}

/// Flag first, then environment, skipping blank values.
fn pick(flag: &str, env_value: Option<String>) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.trim().to_string());
    }
    env_value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn resolve_url(url: Option<String>, addr: Option<String>) -> Result<Url> {
    if let Some(url) = url {
        let parsed = Url::parse(&url).with_context(|| format!("invalid url: {url}"))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            bail!("unsupported url scheme: {}", parsed.scheme());
        }
        return Ok(parsed);
    }
    let addr = addr.unwrap_or_else(|| DEFAULT_ADDR.to_string());
    Url::parse(&format!("ws://{addr}/ws")).with_context(|| format!("invalid addr: {addr}"))
}

pub fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" | "on" | "ON" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" | "off" | "OFF" => Some(false),
        _ => None,
    }
}
