//! Audio Receiver Application
//!
//! Accepts one sender at a time and writes its audio into the virtual
//! microphone's pipe (or stdout).

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mic_relay::{config::AppConfig, session::Server};

#[derive(Parser, Debug)]
#[command(name = "receiver")]
#[command(about = "Receive a relayed microphone and feed it to a virtual input", long_about = None)]
struct Args {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    bind: Option<String>,

    /// TCP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Sink path, usually the virtual source FIFO; `-` writes to stdout
    #[arg(short, long)]
    sink: Option<String>,

    /// Device volume (0.0-2.0)
    #[arg(long)]
    volume: Option<f32>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stdout may be the sink, so logs go to stderr
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting mic relay receiver");

    let mut config = AppConfig::load(args.config.as_deref())?.server;
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(sink) = args.sink {
        config.sink = sink;
    }
    if let Some(volume) = args.volume {
        config.device_volume = volume;
    }
    config.validate()?;

    tracing::info!("Sink: {}", config.sink);
    tracing::info!("Device volume: {:.0}%", config.device_volume * 100.0);

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut server_task = tokio::task::spawn_blocking({
        let shutdown = shutdown.clone();
        move || -> mic_relay::Result<()> {
            let factory = config.sink_target().into_factory();
            let mut server = Server::bind(config, factory)?;
            server.run(&shutdown)
        }
    });

    tokio::select! {
        result = &mut server_task => {
            result??;
            return Ok(());
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Shutting down, finishing current session");
            shutdown.store(true, Ordering::SeqCst);
        }
    }

    server_task.await??;
    Ok(())
}
