//! fanpost-send - Scheduling and publish daemon
//!
//! Hosts the fanpost orchestration core: accepts requests as JSON lines on
//! stdin, releases posts when they fall due and publishes them to every
//! target platform through the configured platform agents.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use libfanpost::logging::{level_from_env, LogFormat, LoggingConfig};
use libfanpost::{Config, FanpostError, FanpostService, SubmitRequest};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "fanpost-send")]
#[command(version)]
#[command(about = "Scheduling and publish daemon")]
#[command(long_about = "\
fanpost-send - Scheduling and publish daemon

DESCRIPTION:
    fanpost-send holds posts until their scheduled time, then publishes each
    one to all of its target platforms concurrently, retrying failed
    destinations with backoff and reporting every success to the analytics
    sink exactly once.

REQUESTS (one JSON object per line on stdin, one response per line on stdout):
    {\"op\":\"submit\",\"user_id\":\"u1\",\"raw_content\":\"Hello #rust\",
     \"target_platforms\":[\"facebook\",\"twitter\"],\"scheduled_at\":\"30m\",
     \"credential_refs\":{\"facebook\":\"fb-page\",\"twitter\":\"tw-main\"}}
    {\"op\":\"cancel\",\"post_id\":\"...\"}
    {\"op\":\"status\",\"post_id\":\"...\"}

CREDENTIALS:
    A credential reference `fb-page` is read from FANPOST_TOKEN_FB_PAGE.

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (in-flight dispatches finish)

CONFIGURATION:
    Configuration file: ~/.config/fanpost/config.toml (or FANPOST_CONFIG)
    Database location: ~/.local/share/fanpost/posts.db

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
    3 - Invalid input
")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "PATH", env = "FANPOST_CONFIG")]
    config: Option<PathBuf>,

    /// Tick interval in milliseconds (overrides config)
    #[arg(long, value_name = "MILLIS")]
    tick_interval_ms: Option<u64>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Log output format: text, json or pretty
    #[arg(long, value_name = "FORMAT", default_value = "text", env = "FANPOST_LOG_FORMAT")]
    log_format: LogFormat,

    /// Read requests until stdin closes, run one tick, finish dispatches and exit
    #[arg(long)]
    once: bool,
}

/// One stdin request
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Submit(SubmitRequest),
    Cancel { post_id: String },
    Status { post_id: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::new(cli.log_format, level_from_env(), cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        let code = e
            .downcast_ref::<FanpostError>()
            .map_or(1, FanpostError::exit_code);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = load_config(cli.config)?;
    if let Some(tick) = cli.tick_interval_ms {
        config.scheduler.tick_interval_ms = tick;
    }

    info!("fanpost-send daemon starting");
    info!("Tick interval: {}ms", config.scheduler.tick_interval_ms);

    let service = Arc::new(FanpostService::from_config(config).await?);
    service.recover().await?;

    if cli.once {
        serve_requests(&service, spawn_stdin_reader()).await;
        let released = service.run_once().await;
        service.db().close().await;
        info!("fanpost-send: released {} post(s) once, exiting", released);
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    setup_signal_handlers(shutdown_tx).context("Signal setup failed")?;

    let requests = {
        let service = Arc::clone(&service);
        let lines = spawn_stdin_reader();
        tokio::spawn(async move { serve_requests(&service, lines).await })
    };

    service.run(shutdown_rx).await;
    requests.abort();
    service.db().close().await;

    info!("fanpost-send daemon stopped");
    Ok(())
}

fn load_config(path: Option<PathBuf>) -> libfanpost::Result<Config> {
    let path = match path {
        Some(path) => path,
        None => libfanpost::config::resolve_config_path()?,
    };

    if path.exists() {
        Config::load_from_path(&path)
    } else {
        warn!("No config file at {}, using defaults", path.display());
        Ok(Config::default())
    }
}

/// Read stdin lines on a plain thread so a pending read never holds up exit
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

/// Answer requests until stdin closes
async fn serve_requests(service: &FanpostService, mut lines: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = lines.recv().await {
        if line.trim().is_empty() {
            continue;
        }
        println!("{}", handle_line(service, &line).await);
    }
}

async fn handle_line(service: &FanpostService, line: &str) -> Value {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            return json!({
                "ok": false,
                "error": format!("Invalid request: {}", e),
                "code": 3,
            })
        }
    };

    let result = match request {
        Request::Submit(submit) => service
            .process_and_schedule_post(submit)
            .await
            .map(|post_id| json!({ "ok": true, "post_id": post_id })),
        Request::Cancel { post_id } => service
            .cancel_post(&post_id)
            .await
            .map(|()| json!({ "ok": true, "post_id": post_id })),
        Request::Status { post_id } => service
            .get_post_status(&post_id)
            .await
            .map(|view| json!({ "ok": true, "post": view })),
    };

    result.unwrap_or_else(|e| {
        json!({
            "ok": false,
            "error": e.to_string(),
            "code": e.exit_code(),
        })
    })
}

/// Flip `shutdown` on SIGINT or SIGTERM
#[cfg(unix)]
fn setup_signal_handlers(shutdown: watch::Sender<bool>) -> std::io::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!(signal = sig, "Received shutdown signal, stopping gracefully...");
            let _ = shutdown.send(true);
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: watch::Sender<bool>) -> std::io::Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping gracefully...");
            let _ = shutdown.send(true);
        }
    });
    Ok(())
}
