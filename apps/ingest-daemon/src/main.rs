use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use device_registry::{DeviceRegistry, MetricsHub};
use ingest_server::{load_config_file, ServerConfig, ShortReadPolicy};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "ingest-daemon")]
#[command(about = "Accepts device telemetry connections and prints each reading as CSV")]
struct Args {
    /// YAML config file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    /// TCP port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Maximum number of concurrently logged-in devices
    #[arg(long)]
    max_devices: Option<usize>,

    /// Login frame deadline in milliseconds
    #[arg(long)]
    login_timeout_ms: Option<u64>,

    /// Silence allowed between readings in milliseconds
    #[arg(long)]
    liveness_timeout_ms: Option<u64>,

    /// What to do with a read shorter than one reading frame
    #[arg(long, value_enum)]
    short_read_policy: Option<ShortReads>,

    /// Log a stats line every N seconds (0 disables)
    #[arg(long)]
    stats_interval_secs: Option<u64>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ShortReads {
    Forward,
    Reassemble,
    Disconnect,
}

impl From<ShortReads> for ShortReadPolicy {
    fn from(value: ShortReads) -> Self {
        match value {
            ShortReads::Forward => ShortReadPolicy::Forward,
            ShortReads::Reassemble => ShortReadPolicy::Reassemble,
            ShortReads::Disconnect => ShortReadPolicy::Disconnect,
        }
    }
}

impl Args {
    fn resolve(self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => load_config_file(path)?,
            None => ServerConfig::default(),
        };
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(max) = self.max_devices {
            config.max_devices = max;
        }
        if let Some(ms) = self.login_timeout_ms {
            config.login_timeout_ms = ms;
        }
        if let Some(ms) = self.liveness_timeout_ms {
            config.liveness_timeout_ms = ms;
        }
        if let Some(policy) = self.short_read_policy {
            config.short_read_policy = policy.into();
        }
        if let Some(secs) = self.stats_interval_secs {
            config.stats_interval_secs = secs;
        }
        config.validate().context("invalid command line settings")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config = Args::parse().resolve()?;
    info!(
        address = %config.bind_address(),
        max_devices = config.max_devices,
        policy = ?config.short_read_policy,
        "ingest-daemon starting"
    );

    let hub = MetricsHub::new().map_err(|e| anyhow::anyhow!("Failed to create metrics: {}", e))?;
    let registry = DeviceRegistry::builder()
        .metrics(hub.dev.clone())
        .on_reading(|event| println!("{event}"))
        .build();

    let server = ingest_server::start(&config, registry.clone())
        .await
        .with_context(|| format!("binding {}", config.bind_address()))?;
    info!(local_addr = %server.local_addr, "listening");

    if config.stats_interval_secs > 0 {
        let period = Duration::from_secs(config.stats_interval_secs);
        tokio::spawn(log_stats(registry, hub.clone(), period));
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    warn!("interrupted, shutting down");
    server.abort();
    debug!(metrics = %hub.encode_text(), "final metrics");
    Ok(())
}

async fn log_stats(registry: DeviceRegistry, hub: MetricsHub, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        info!(
            connected = registry.count(),
            readings = hub.dev.readings.get(),
            invalid = hub.dev.invalid_readings.get(),
            rejected_logins = hub.dev.rejected_logins.get(),
            admission_rejected = hub.dev.admission_rejected.get(),
            internal_faults = hub.dev.internal_faults.get(),
            "stats"
        );
    }
}

fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
