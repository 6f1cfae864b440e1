//! `mm-cli`: command-line access to serial microscope devices.
//!
//! - `query` sends one raw command over a serial port and prints the reply
//! - `devices` lists the available drivers and the configured devices
//! - `get` / `set` read and write a device option
//! - `poll` streams readings from a device's acquisition until done or Ctrl-C
//!
//! # Usage
//!
//! ```bash
//! mm-cli query --port /dev/ttyUSB0 "W X Y"
//! mm-cli --config microscope.toml set XYStage PositionX 1500
//! mm-cli --config microscope.toml poll Camera --count 10
//! ```

// Global allocator
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mm_core::config::AppConfig;
use mm_core::device::{Device, DeviceContext, OptionValue};
use mm_core::logging::{self, OutputFormat, TracingConfig};
use mm_core::poller::{PollEvent, SampleCount};
use mm_core::registry::DeviceRegistry;
use mm_core::transactor::{Command, EchoMatch, ReplyMatch, Transactor};
use mm_core::SerialChannel;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mm-cli")]
#[command(about = "Serial microscope device adapters from the command line", long_about = None)]
struct Cli {
    /// Configuration file (TOML). Environment variables prefixed `MM_` override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format: pretty, compact or json
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send one command over a serial port and print the reply
    Query {
        /// Serial port path
        #[arg(long)]
        port: String,

        #[arg(long, default_value_t = 9600)]
        baud: u32,

        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,

        /// Reply must start with this prefix (e.g. ":A")
        #[arg(long)]
        expect: Option<String>,

        /// Reply terminator
        #[arg(long, value_enum, default_value_t = Terminator::Cr)]
        terminator: Terminator,

        /// Command text; the configured transmit terminator is appended
        command: String,
    },

    /// List driver types and configured devices
    Devices,

    /// Read a device option
    Get { device: String, option: String },

    /// Write a device option
    Set {
        device: String,
        option: String,
        value: String,
    },

    /// Stream readings from a device until the count is reached or Ctrl-C
    Poll {
        device: String,

        /// Stop after this many readings (unbounded when omitted)
        #[arg(long)]
        count: Option<u64>,

        /// Pause between readings; defaults to `[poller] interval_ms`
        #[arg(long)]
        interval_ms: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Terminator {
    Cr,
    Lf,
    Crlf,
}

impl Terminator {
    fn bytes(self) -> &'static [u8] {
        match self {
            Terminator::Cr => b"\r",
            Terminator::Lf => b"\n",
            Terminator::Crlf => b"\r\n",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref())?;
    init_logging(&config, cli.log_format.as_deref(), cli.verbose)?;

    let registry = registry();
    let result = run(cli.command, &config, &registry).await;
    registry.close_all().await;
    result
}

fn init_logging(config: &AppConfig, format: Option<&str>, verbose: u8) -> Result<()> {
    let mut tracing_config = TracingConfig::from_logging_config(&config.logging)?;
    if let Some(format) = format {
        tracing_config = tracing_config.with_format(format.parse::<OutputFormat>()?);
    }
    tracing_config.level = match verbose {
        0 => tracing_config.level,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    logging::init(tracing_config)?;
    Ok(())
}

/// Every driver this binary ships with.
fn registry() -> DeviceRegistry {
    mm_driver_asi::link();
    mm_driver_sutter::link();
    mm_driver_pgfocus::link();
    mm_driver_mock::link();

    let registry = DeviceRegistry::new();
    registry.register_factory(Box::new(mm_driver_asi::AsiStageFactory));
    registry.register_factory(Box::new(mm_driver_sutter::SutterLambdaFactory));
    registry.register_factory(Box::new(mm_driver_pgfocus::PgFocusFactory));
    registry.register_factory(Box::new(mm_driver_mock::MockCameraFactory));
    registry
}

async fn run(command: Commands, config: &AppConfig, registry: &DeviceRegistry) -> Result<()> {
    match command {
        Commands::Query {
            port,
            baud,
            timeout_ms,
            expect,
            terminator,
            command,
        } => {
            query(
                config,
                &port,
                baud,
                Duration::from_millis(timeout_ms),
                expect,
                terminator,
                command,
            )
            .await
        }
        Commands::Devices => {
            list_devices(config, registry);
            Ok(())
        }
        Commands::Get { device, option } => {
            let device = open_device(config, registry, &device).await?;
            let value = device.get_option(&option).await?;
            println!("{}", value);
            Ok(())
        }
        Commands::Set {
            device,
            option,
            value,
        } => {
            let device = open_device(config, registry, &device).await?;
            device
                .set_option(&option, OptionValue::parse(&value))
                .await?;
            info!(device = %device.name(), option = %option, value = %value, "option set");
            Ok(())
        }
        Commands::Poll {
            device,
            count,
            interval_ms,
        } => {
            let interval = interval_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.poller.interval());
            let device = open_device(config, registry, &device).await?;
            poll(device, SampleCount::from(count), interval).await
        }
    }
}

async fn query(
    config: &AppConfig,
    port: &str,
    baud: u32,
    timeout: Duration,
    expect: Option<String>,
    terminator: Terminator,
    command: String,
) -> Result<()> {
    let channel = SerialChannel::open(port, baud, "query").await?;
    let transactor = Transactor::with_settings(channel, config.transactor.settings());

    let expected = match expect {
        Some(prefix) => ReplyMatch::from(EchoMatch::prefix(prefix, terminator.bytes())),
        None => ReplyMatch::terminator(terminator.bytes()),
    };
    let reply = transactor
        .execute(Command::text(command), expected, timeout)
        .await
        .with_context(|| format!("query on {} failed", port))?;

    println!("{}", reply.text());
    Ok(())
}

fn list_devices(config: &AppConfig, registry: &DeviceRegistry) {
    println!("Drivers:");
    for factory in registry.factories() {
        let capabilities: Vec<&str> = factory.capabilities.iter().map(|c| c.name()).collect();
        println!(
            "  {:<16} {:<28} [{}]",
            factory.driver_type,
            factory.name,
            capabilities.join(", ")
        );
    }

    println!("Devices:");
    if config.devices.is_empty() {
        println!("  (none configured)");
    }
    for entry in &config.devices {
        println!("  {:<16} {}", entry.name, entry.driver);
    }
}

/// Instantiate one configured device by name.
async fn open_device(
    config: &AppConfig,
    registry: &DeviceRegistry,
    name: &str,
) -> Result<Arc<dyn Device>> {
    let entry = config
        .device(name)
        .ok_or_else(|| anyhow!("no device named '{}' in the configuration", name))?;
    let ctx = DeviceContext::from_config(entry.name.clone(), config);
    let device = registry
        .instantiate(ctx, &entry.driver, toml::Value::Table(entry.params.clone()))
        .await?;
    Ok(device)
}

async fn poll(
    device: Arc<dyn Device>,
    count: SampleCount,
    interval: Duration,
) -> Result<()> {
    let acquisition = device
        .acquisition()
        .ok_or_else(|| anyhow!("device '{}' does not stream readings", device.name()))?;

    let mut readings = acquisition.subscribe();
    // A device may run its own acquisition from open (pgFocus); restart it
    // with the requested count.
    if acquisition.is_running() {
        acquisition.stop();
        acquisition.wait_idle().await;
    }
    acquisition.start(count, interval).await?;

    let mut failure = None;
    loop {
        tokio::select! {
            biased;
            event = readings.recv() => match event {
                Ok(PollEvent::Sample(sample)) => println!("{:>6}  {}", sample.seq, sample.value),
                Ok(PollEvent::Failed(err)) => {
                    failure = Some(err);
                    break;
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "reader fell behind"),
                Err(RecvError::Closed) => break,
            },
            _ = acquisition.wait_idle() => {
                while let Ok(PollEvent::Sample(sample)) = readings.try_recv() {
                    println!("{:>6}  {}", sample.seq, sample.value);
                }
                break;
            }
            _ = signal::ctrl_c() => {
                info!("interrupted");
                acquisition.stop();
                acquisition.wait_idle().await;
                break;
            }
        }
    }

    match failure {
        Some(err) => Err(anyhow!("acquisition on '{}' failed: {}", device.name(), err)),
        None => Ok(()),
    }
}
