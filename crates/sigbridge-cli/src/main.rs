//! `sigbridge` – command line front end for the signal bridge.
//!
//! ```text
//! sigbridge monitor                     # put a simulated device on the broker
//! sigbridge get voltage                 # read a remote property
//! sigbridge set voltage 80              # write a remote property
//! sigbridge call set_state_of_channels --args '[[0, 3]]' --kwargs '{"append": false}'
//! sigbridge config [--write]            # show (or persist) the effective config
//! ```
//!
//! Broker and device settings come from `~/.sigbridge/config.toml` with
//! `SIGBRIDGE_*` environment overrides (see [`config`]).

mod config;

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::Value;
use tracing::{error, info};

use sigbridge_hal::{Device, SimDevice, SimSource};
use sigbridge_middleware::Signal;
use sigbridge_runtime::monitor::{CONNECTED_SIGNAL, DISCONNECTED_SIGNAL};
use sigbridge_runtime::{DeviceProxy, Monitor, MonitorPhase, init_tracing};
use sigbridge_types::{BridgeError, Payload};

use config::Config;

#[derive(Debug, Parser)]
#[command(name = "sigbridge", version, about = "Bridge device signals and calls over MQTT")]
struct Cli {
    /// Configuration file (default `~/.sigbridge/config.toml`).
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a monitor for a simulated device until Ctrl-C.
    Monitor,
    /// Read a property of the remote device.
    Get { name: String },
    /// Write a property of the remote device.
    Set {
        name: String,
        /// New value as JSON, e.g. `80` or `"text"`.
        value: String,
    },
    /// Invoke a method of the remote device.
    Call {
        name: String,
        /// Positional arguments as a JSON array.
        #[arg(long, default_value = "[]")]
        args: String,
        /// Keyword arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        kwargs: String,
    },
    /// Print the effective configuration.
    Config {
        /// Also write it to the configuration file.
        #[arg(long, default_value_t = false)]
        write: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _telemetry = init_tracing("sigbridge");

    let config = match &cli.config {
        Some(path) => config::load_from(path),
        None => config::load(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{} failed to start runtime: {e}", "error:".red().bold());
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli, config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("{} {e}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config: Config) -> Result<(), BridgeError> {
    match cli.command {
        Command::Monitor => monitor(&config).await,
        Command::Get { name } => {
            let proxy = open_proxy(&config).await?;
            let result = proxy.get(&name).await;
            proxy.stop();
            print_value(result?);
            Ok(())
        }
        Command::Set { name, value } => {
            let value: Value = serde_json::from_str(&value)?;
            let proxy = open_proxy(&config).await?;
            let result = proxy.set(&name, value).await;
            proxy.stop();
            result?;
            println!("{}", "ok".green());
            Ok(())
        }
        Command::Call { name, args, kwargs } => {
            let (args, kwargs) = parse_call_arguments(&args, &kwargs)?;
            let proxy = open_proxy(&config).await?;
            let result = proxy.invoke(&name, args, kwargs).await;
            proxy.stop();
            print_value(result?);
            Ok(())
        }
        Command::Config { write } => {
            let path = cli.config.unwrap_or_else(config::config_path);
            let rendered = toml::to_string_pretty(&config)
                .map_err(|e| BridgeError::Config(format!("failed to render config: {e}")))?;
            println!("{} {}", "#".dimmed(), path.display().to_string().dimmed());
            print!("{rendered}");
            if write {
                config::save_to(&config, &path)?;
                println!("{}", format!("✓ written to {}", path.display()).green());
            }
            Ok(())
        }
    }
}

// ── Monitor ──────────────────────────────────────────────────────────────────

async fn monitor(config: &Config) -> Result<(), BridgeError> {
    print_banner(config);

    let device: Arc<dyn Device> = Arc::new(SimDevice::new());
    let (_plug, source) = SimSource::attached(device);
    let monitor = Monitor::connect(source, config.mqtt_settings("monitor"), config.monitor_config())?;

    let connected = announce(monitor.signals().signal(CONNECTED_SIGNAL), "connected");
    let disconnected = announce(monitor.signals().signal(DISCONNECTED_SIGNAL), "disconnected");
    let mut phases = monitor.phases();

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "failed to listen for Ctrl-C");
                }
                break;
            }
            changed = phases.changed() => {
                if changed.is_err() {
                    break;
                }
                let phase = *phases.borrow_and_update();
                info!(?phase, "monitor phase");
                if phase == MonitorPhase::Cancelled {
                    break;
                }
            }
        }
    }

    println!();
    println!("{}", "⚠  stopping monitor …".yellow().bold());
    monitor.stop().await;
    connected.abort();
    disconnected.abort();
    println!("{}", "  ✓ device released.".green());
    Ok(())
}

fn announce(signal: Signal, label: &'static str) -> tokio::task::JoinHandle<()> {
    let mut emissions = signal.subscribe();
    tokio::spawn(async move {
        while let Some(emission) = emissions.recv().await {
            let device_id = emission
                .fields
                .get("device_id")
                .and_then(Value::as_str)
                .unwrap_or("?");
            println!("  {} {}", format!("● {label}").cyan().bold(), device_id);
        }
    })
}

fn print_banner(config: &Config) {
    println!("{}", "sigbridge".bold().cyan());
    println!(
        "  broker  {}",
        format!("{}:{}", config.broker_host, config.broker_port).bold()
    );
    println!("  device  {}", config.device_name.bold());
    println!("{}", "  press Ctrl-C to stop".dimmed());
    println!();
}

// ── Remote access ────────────────────────────────────────────────────────────

async fn open_proxy(config: &Config) -> Result<DeviceProxy, BridgeError> {
    DeviceProxy::connect(
        SimDevice::device_shape(),
        config.mqtt_settings(&format!("client-{}", std::process::id())),
        &config.device_name,
        config.proxy_options(),
    )
    .await
}

fn parse_call_arguments(args: &str, kwargs: &str) -> Result<(Vec<Value>, Payload), BridgeError> {
    let args = match serde_json::from_str(args)? {
        Value::Array(items) => items,
        other => {
            return Err(BridgeError::Serialization(format!(
                "--args must be a JSON array, got {other}"
            )));
        }
    };
    let kwargs = match serde_json::from_str(kwargs)? {
        Value::Object(fields) => fields,
        other => {
            return Err(BridgeError::Serialization(format!(
                "--kwargs must be a JSON object, got {other}"
            )));
        }
    };
    Ok((args, kwargs))
}

fn print_value(value: Option<Value>) {
    match value {
        Some(v) => println!("{v}"),
        None => println!("{}", "(no value)".dimmed()),
    }
}
