//! Binary entry point: CLI flags, config loading, tracing init, and
//! worker task spawning — `CliArgs` via `clap`, `tracing_subscriber`
//! init, `tokio::main` spawning long-running tasks.

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use camstream::config::Config;
use camstream::encoder::{ConfigAttempt, EncoderBackend};
use camstream::error::{EncoderError, MuxerError};
use camstream::recording::MuxerFile;
use camstream::server::{self, MuxerFactory, StreamServer};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Single-source, multi-viewer live streaming server")]
struct CliArgs {
    /// Path to a TOML config file. Defaults are used for anything it omits.
    #[arg(long)]
    config: Option<String>,

    /// Overrides the listen port from the config file.
    #[arg(long)]
    port: Option<u16>,

    /// Overrides the viewer password from the config file.
    #[arg(long)]
    password: Option<String>,
}

/// No real hardware encoder is wired in this repository — camera capture
/// and the H.264/AAC encoders are out-of-scope collaborators. This
/// backend exists so the binary links and starts; a real deployment
/// supplies its own `EncoderBackend` here.
struct UnconfiguredEncoderBackend;

impl EncoderBackend for UnconfiguredEncoderBackend {
    fn configure(&mut self, attempt: ConfigAttempt) -> Result<(), EncoderError> {
        Err(EncoderError::ConfigUnsupported {
            width: attempt.width,
            height: attempt.height,
        })
    }

    fn push_raw(&mut self, _data: Bytes, _pts_us: u64) -> Result<(), EncoderError> {
        Err(EncoderError::NotRunning)
    }

    fn poll_output(&mut self) -> Option<(Bytes, u64)> {
        None
    }

    fn request_keyframe(&mut self) {}

    fn adjust_bitrate(&mut self, _bps: u32) {}

    fn stop(&mut self) {}
}

struct UnconfiguredMuxerFactory;

impl MuxerFactory for UnconfiguredMuxerFactory {
    fn create(&self) -> Result<(Box<dyn MuxerFile>, std::fs::File, bool, u32), MuxerError> {
        Err(MuxerError::InvalidState)
    }
}

fn load_config(args: &CliArgs) -> Result<Config> {
    let mut cfg = match &args.config {
        Some(path) => Config::from_file(path).with_context(|| format!("loading config from {path}"))?,
        None => Config::default(),
    };
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(password) = &args.password {
        cfg.password = password.clone();
    }
    cfg.validate().context("validating configuration")?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    let config = Arc::new(load_config(&args)?);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(port = config.port, "starting streaming server");

    let (server, command_rx) = StreamServer::new(
        config.clone(),
        Box::new(UnconfiguredEncoderBackend),
        Arc::new(UnconfiguredMuxerFactory),
    );

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding listener on port {}", config.port))?;

    let accept_handle = tokio::spawn(server.clone().accept_loop(listener));
    let sender_handle = tokio::spawn(server.clone().sender_loop());
    let control_handle = tokio::spawn(server.clone().control_loop(command_rx));

    let governor_server = server.clone();
    let governor_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(2));
        loop {
            interval.tick().await;
            governor_server.governor_tick(true);
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received, stopping capture");
    server::broadcast_stopped(&server).await;
    server::encoder_handle(&server).stop().await;

    accept_handle.abort();
    sender_handle.abort();
    control_handle.abort();
    governor_handle.abort();

    Ok(())
}
