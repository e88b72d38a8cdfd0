//! Audio Sender Application
//!
//! Captures the microphone and streams it to the receiver over TCP.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mic_relay::{
    audio::{
        capture::{MicCapture, ToneSource},
        device::list_input_devices,
        gain::GainState,
    },
    config::AppConfig,
    network::sender::stream_to_server,
    protocol::Quality,
};

#[derive(Parser, Debug)]
#[command(name = "sender")]
#[command(about = "Stream a microphone to a mic relay receiver", long_about = None)]
struct Args {
    /// Receiver host name or address
    host: Option<String>,

    /// Receiver port
    #[arg(short, long)]
    port: Option<u16>,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Input device name
    #[arg(short, long)]
    device: Option<String>,

    /// Sample rate in Hz
    #[arg(short, long)]
    rate: Option<u32>,

    /// Channel count (1 or 2)
    #[arg(long)]
    channels: Option<u16>,

    /// Frames per chunk
    #[arg(short, long)]
    frame_size: Option<u32>,

    /// low_latency, balanced or high_quality
    #[arg(short, long)]
    quality: Option<Quality>,

    /// Microphone volume (0.0-2.0)
    #[arg(long)]
    volume: Option<f32>,

    /// Send a sine tone of this frequency instead of the microphone
    #[arg(long)]
    tone: Option<f32>,

    /// List input devices and exit
    #[arg(short, long)]
    list: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.list {
        println!("\n=== Available Input Devices ===");
        for device in list_input_devices() {
            let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
            println!("  {}{}", device.name, default_marker);
            println!("    Channels: {}", device.channels);
            println!("    Default sample rate: {}", device.default_sample_rate);
        }
        println!();
        return Ok(());
    }

    tracing::info!("Starting mic relay sender");

    let mut client = AppConfig::load(args.config.as_deref())?.client;
    if let Some(host) = args.host {
        client.host = host;
    }
    if let Some(port) = args.port {
        client.port = port;
    }
    if args.device.is_some() {
        client.device = args.device;
    }
    if let Some(rate) = args.rate {
        client.sample_rate = rate;
    }
    if let Some(channels) = args.channels {
        client.channels = channels;
    }
    if let Some(frame_size) = args.frame_size {
        client.frame_size = frame_size;
    }
    if let Some(quality) = args.quality {
        client.quality = quality;
    }
    if let Some(volume) = args.volume {
        client.volume = volume;
    }
    client.apply_quality_preset();
    client.validate()?;

    let session = client.session_config()?;
    tracing::info!("Target receiver: {}:{}", client.host, client.port);
    tracing::info!(
        "Audio: {} ({:.1} ms per frame), volume {:.0}%",
        session,
        session.frame_duration().as_secs_f64() * 1000.0,
        client.volume * 100.0
    );

    let gain = Arc::new(GainState::new(client.volume));
    let shutdown = Arc::new(AtomicBool::new(false));
    let tone = args.tone;

    let mut stream_task = tokio::task::spawn_blocking({
        let shutdown = shutdown.clone();
        move || -> mic_relay::Result<()> {
            let stats = match tone {
                Some(frequency) => {
                    tracing::info!("Sending a {} Hz test tone", frequency);
                    let source = ToneSource::new(&session, frequency);
                    stream_to_server(&client, source, gain, &shutdown)?
                }
                None => {
                    let mut capture = MicCapture::new(client.device.as_deref(), &session)?;
                    capture.start()?;
                    stream_to_server(&client, capture, gain, &shutdown)?
                }
            };
            tracing::info!(
                "Sent {} frames ({:.1} KB)",
                stats.frames_sent,
                stats.bytes_sent as f64 / 1024.0
            );
            Ok(())
        }
    });

    tokio::select! {
        result = &mut stream_task => {
            result??;
            return Ok(());
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Stopping stream");
            shutdown.store(true, Ordering::SeqCst);
        }
    }

    stream_task.await??;
    Ok(())
}
