use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::time::Duration;
use telemetry_wire::{
    encode_measurement, identity_frame_from_str, MeasurementRecord, MEASUREMENT_FRAME_LEN,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "device-sim", version, about = "Simulated telemetry device")]
#[command(disable_help_subcommand = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct Target {
    /// Server address as host:port
    #[arg(long, default_value = "127.0.0.1:1337")]
    server_address: String,
    /// 15-digit device identity (must pass the check digit)
    #[arg(long, default_value = "490154203237518")]
    imei: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Log in and send random in-range readings
    Random {
        #[command(flatten)]
        target: Target,
        /// Number of readings to send
        #[arg(long, default_value_t = 5)]
        count: u32,
        /// Pause between readings in milliseconds
        #[arg(long, default_value_t = 25)]
        interval_ms: u64,
        /// Send every frame in two writes
        #[arg(long)]
        split: bool,
    },
    /// Send readings slower than usual but inside the liveness window
    Slow {
        #[command(flatten)]
        target: Target,
        #[arg(long, default_value_t = 5)]
        count: u32,
        #[arg(long, default_value_t = 1500)]
        interval_ms: u64,
    },
    /// Log in, then stay silent past the liveness window
    TooSlow {
        #[command(flatten)]
        target: Target,
        #[arg(long, default_value_t = 2500)]
        delay_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Random {
            target,
            count,
            interval_ms,
            split,
        } => {
            let mut stream = login(&target).await?;
            send_readings(&mut stream, count, Duration::from_millis(interval_ms), split).await?;
        }
        Commands::Slow {
            target,
            count,
            interval_ms,
        } => {
            let mut stream = login(&target).await?;
            send_readings(&mut stream, count, Duration::from_millis(interval_ms), false).await?;
        }
        Commands::TooSlow { target, delay_ms } => {
            let mut stream = login(&target).await?;
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if server_closed(&mut stream).await {
                info!("server dropped the silent connection");
            } else {
                warn!("connection still open after {delay_ms}ms of silence");
            }
        }
    }
    Ok(())
}

async fn login(target: &Target) -> Result<TcpStream> {
    let frame = identity_frame_from_str(&target.imei)
        .with_context(|| format!("invalid imei {:?}", target.imei))?;
    let mut stream = TcpStream::connect(&target.server_address)
        .await
        .with_context(|| format!("connecting to {}", target.server_address))?;
    stream.write_all(&frame).await.context("sending login")?;
    info!(imei = %target.imei, server = %target.server_address, "logged in");
    Ok(stream)
}

async fn send_readings(
    stream: &mut TcpStream,
    count: u32,
    interval: Duration,
    split: bool,
) -> Result<()> {
    let mut rng = rand::thread_rng();
    for seq in 0..count {
        let record = MeasurementRecord::random(&mut rng);
        let frame = encode_measurement(&record);
        if split {
            let (head, tail) = frame.split_at(MEASUREMENT_FRAME_LEN / 2);
            stream.write_all(head).await.context("sending reading")?;
            stream.flush().await?;
            tokio::time::sleep(Duration::from_millis(5)).await;
            stream.write_all(tail).await.context("sending reading")?;
        } else {
            stream.write_all(&frame).await.context("sending reading")?;
        }
        info!(seq, ?record, "reading sent");
        if seq + 1 < count {
            tokio::time::sleep(interval).await;
        }
    }
    Ok(())
}

/// Whether the peer has closed: a read returns end of stream or an error.
async fn server_closed(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 1];
    match tokio::time::timeout(Duration::from_millis(500), stream.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => true,
        Ok(Ok(_)) | Err(_) => false,
    }
}

fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
