//! Stdio worker serving the Lingua engine over length-prefixed frames.
//!
//! stdout carries response frames only; logs go to stderr.

mod dispatch;
mod protocol;
mod wire;

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use lingua_engine::{Engine, EngineConfig};
use tracing_subscriber::EnvFilter;

use dispatch::{CancelSet, handle_cancel_request, handle_request};
use wire::{
    DecodedRequest, ResponseEnvelope, WireCodec, decode_request, encode_response, read_frame,
    write_frame,
};

const DEFAULT_LOG_FILTER: &str = "lingua_worker=info,lingua_engine=info,lingua_db=info,warn";

#[derive(Parser, Debug)]
#[command(name = "lingua-worker", about = "Serve Lingua dataset operations over stdio")]
struct Cli {
    /// JSON engine configuration; environment variables override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Worker threads; defaults to the available parallelism.
    #[arg(long)]
    threads: Option<usize>,

    #[arg(long, default_value_t = 64)]
    max_queue: usize,

    /// SQLite database path.
    #[arg(long)]
    db: Option<PathBuf>,

    #[arg(long)]
    staging_dir: Option<PathBuf>,

    /// Accepted for launcher compatibility; stdio is the only transport.
    #[arg(long)]
    stdio: bool,
}

impl Cli {
    fn engine_config(&self) -> Result<EngineConfig> {
        let base = match &self.config {
            Some(path) => EngineConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => EngineConfig::default(),
        };
        let mut config = base.with_overrides(|key| std::env::var(key).ok());
        if let Some(db) = &self.db {
            config.database_path = db.clone();
        }
        if let Some(dir) = &self.staging_dir {
            config.staging_dir = dir.clone();
        }
        Ok(config)
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();
}

/// Queues a status-only response behind any in-flight ones.
fn reject(
    response_tx: &Sender<(WireCodec, ResponseEnvelope)>,
    wire: WireCodec,
    request_id: u64,
    status: &'static str,
    error: String,
) {
    let response = ResponseEnvelope::status_only(request_id, status, Some(error));
    if response_tx.send((wire, response)).is_err() {
        tracing::error!(request_id, "response channel closed");
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = cli.engine_config()?;

    let thread_count = cli.threads.unwrap_or_else(|| {
        thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(4)
    });
    let engine = Arc::new(Engine::open(config).context("opening engine")?);
    let cancelled: CancelSet = Arc::new(Mutex::new(HashSet::new()));
    tracing::info!(threads = thread_count, max_queue = cli.max_queue, stdio = cli.stdio, "worker started");

    let (request_tx, request_rx) = bounded::<DecodedRequest>(cli.max_queue);
    let (response_tx, response_rx) = bounded::<(WireCodec, ResponseEnvelope)>(cli.max_queue);

    let mut workers = Vec::with_capacity(thread_count);
    for _ in 0..thread_count.max(1) {
        let request_rx = request_rx.clone();
        let response_tx = response_tx.clone();
        let engine = engine.clone();
        let cancelled = cancelled.clone();
        workers.push(thread::spawn(move || {
            worker_loop(&engine, request_rx, response_tx, cancelled)
        }));
    }
    let writer = thread::spawn(move || write_loop(response_rx));

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    loop {
        let frame = match read_frame(&mut reader) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                tracing::error!(error = %err, "unreadable frame, shutting down");
                reject(&response_tx, WireCodec::Json, 0, "InvalidInput", err.to_string());
                break;
            }
        };
        let decoded = match decode_request(&frame) {
            Ok(decoded) => decoded,
            Err(err) => {
                reject(&response_tx, WireCodec::Json, 0, "InvalidInput", err.to_string());
                continue;
            }
        };
        if decoded.envelope.entry == "__cancel__" {
            let mut response = match handle_cancel_request(&decoded.envelope, &cancelled) {
                Ok(()) => ResponseEnvelope::status_only(decoded.envelope.request_id, "Ok", None),
                Err(err) => ResponseEnvelope::status_only(
                    decoded.envelope.request_id,
                    err.status,
                    Some(err.message),
                ),
            };
            response.entry = Some("__cancel__".to_string());
            let _ = response_tx.send((decoded.wire, response));
            continue;
        }
        match request_tx.try_send(decoded) {
            Ok(()) => {}
            Err(TrySendError::Full(request)) => {
                tracing::warn!(request_id = request.envelope.request_id, "queue full, rejecting request");
                reject(
                    &response_tx,
                    request.wire,
                    request.envelope.request_id,
                    "Busy",
                    "Worker queue full".to_string(),
                );
            }
            Err(TrySendError::Disconnected(_)) => break,
        }
    }

    drop(request_tx);
    for worker in workers {
        let _ = worker.join();
    }
    drop(response_tx);
    let _ = writer.join();
    tracing::info!("worker stopped");
    Ok(())
}

fn worker_loop(
    engine: &Engine,
    request_rx: Receiver<DecodedRequest>,
    response_tx: Sender<(WireCodec, ResponseEnvelope)>,
    cancelled: CancelSet,
) {
    while let Ok(request) = request_rx.recv() {
        let queue_depth = request_rx.len();
        let response = handle_request(engine, request, queue_depth, &cancelled);
        if response_tx.send(response).is_err() {
            break;
        }
    }
}

fn write_loop(response_rx: Receiver<(WireCodec, ResponseEnvelope)>) {
    let stdout = io::stdout();
    let mut writer = stdout.lock();
    while let Ok((wire, response)) = response_rx.recv() {
        let encoded = match encode_response(&response, wire) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::error!(request_id = response.request_id, error = %err, "failed to encode response");
                continue;
            }
        };
        if let Err(err) = write_frame(&mut writer, &encoded) {
            tracing::error!(error = %err, "failed to write response");
            break;
        }
    }
}
