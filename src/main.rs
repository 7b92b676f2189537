use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono_tz::Tz;
use clap::Parser;
use collector::Collector;
use config::{ChannelConfig, CollectorConfig};
use db::SqliteBatchStore;
use hardware::{Dht22Reader, RpiGpio};
use log::LevelFilter;
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};

mod channel;
mod collector;
mod config;
mod db;
mod dht22;
mod hardware;
mod history;
mod sample;
#[cfg(test)]
mod testing;

#[derive(Debug, Parser)]
#[command(name = "dht-logger")]
#[command(about = "Record humidity and temperature from DHT22 sensors", long_about = None)]
struct Args {
    /// Data pins (BCM numbering), one sensor each
    #[arg(required = true, num_args = 1..)]
    pins: Vec<u8>,

    /// Pin driving the sensors' power rail
    #[arg(long)]
    power_pin: Option<u8>,

    #[arg(long)]
    ok_led: Option<u8>,

    #[arg(long)]
    err_led: Option<u8>,

    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Timezone used for file names and log output
    #[arg(long, default_value = "America/Los_Angeles")]
    timezone: String,

    /// Seconds between reads of each sensor
    #[arg(long, default_value_t = config::DEFAULT_POLL_INTERVAL.as_secs())]
    poll_secs: u64,

    /// Seconds of history used to reject outliers
    #[arg(long, default_value_t = config::DEFAULT_RETENTION.as_secs())]
    history_secs: u64,

    #[arg(long, default_value_t = config::DEFAULT_OUTLIER_THRESHOLD)]
    threshold: f64,

    #[arg(long, default_value_t = config::DEFAULT_DRAIN_INTERVAL.as_secs())]
    drain_secs: u64,

    #[arg(long, default_value_t = config::DEFAULT_POWER_CYCLE_INTERVAL.as_secs())]
    power_cycle_secs: u64,

    #[arg(long, default_value_t = config::DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    #[arg(long, default_value = "info")]
    log_level: LevelFilter,

    /// Check which data pins answer, then exit
    #[arg(long)]
    probe: bool,
}

impl Args {
    fn collector_config(&self, timezone: Tz) -> CollectorConfig {
        CollectorConfig {
            channel: ChannelConfig {
                poll_interval: Duration::from_secs(self.poll_secs),
                retention: Duration::from_secs(self.history_secs),
                outlier_threshold: self.threshold,
                timezone,
                ..ChannelConfig::default()
            },
            queue_capacity: self.queue_capacity,
            power_pin: self.power_pin,
            ok_led_pin: self.ok_led,
            err_led_pin: self.err_led,
            drain_interval: Duration::from_secs(self.drain_secs),
            power_cycle_interval: Duration::from_secs(self.power_cycle_secs),
            ..CollectorConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();

    TermLogger::init(
        args.log_level,
        ConfigBuilder::new()
            .set_time_format_rfc3339()
            .set_time_offset_to_local()
            .map_err(|_| anyhow::anyhow!("Failed to set time offset to local"))?
            .build(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .context("Failed to initialize logger")?;

    if let Err(e) = run(args).await {
        log::error!("{e:#}");
        std::process::exit(1);
    }

    Ok(())
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    let timezone: Tz = args
        .timezone
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid timezone {:?}: {e}", args.timezone))?;

    let reader = Arc::new(Dht22Reader::new().context("Failed to initialize DHT22 reader")?);

    if args.probe {
        for &pin in &args.pins {
            if dht22::is_connected(reader.as_ref(), pin, config::DEFAULT_READ_DELAY) {
                log::info!("pin {pin}: sensor responded");
            } else {
                log::warn!("pin {pin}: no response");
            }
        }
        return Ok(());
    }

    let config = args.collector_config(timezone);
    let gpio = RpiGpio::new()?;
    let store = SqliteBatchStore::new(&args.data_dir, timezone)
        .context("Failed to initialize batch store")?;
    log::info!("Writing batches to {}", store.dir().display());

    let collector = Collector::start(config, &args.pins, reader, gpio, store).await?;

    collector
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to wait for Ctrl+C signal: {e}");
            }
        })
        .await?;

    log::info!("User stop!");
    Ok(())
}
