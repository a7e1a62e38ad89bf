//! CLI entry point for terps-host
//!
//! Subcommands:
//! - `run`: acquire from a serial port (or stdin) until Ctrl-C
//! - `decode-eeprom`: decode a raw 512-byte EEPROM image and print it as JSON
//! - `presets`: list the built-in acquisition presets
//!
//! # Usage
//!
//! ```bash
//! terps-host run --port /dev/ttyACM0 --preset 0p01 --output data/run.csv
//! terps-host run --port - --set frame_format=binary < capture.bin
//! terps-host decode-eeprom eeprom.bin
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use terps_host::coeff::{CoefficientMode, Provenance};
use terps_host::config::TerpsConfig;
use terps_host::host::HostOrchestrator;
use terps_host::logging::{self, OutputFormat, TracingConfig};
use terps_host::presets;
use terps_host::protocol::decode_eeprom;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "terps-host")]
#[command(about = "TERPS pressure sensor host agent", long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Compact, global = true)]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire samples until interrupted
    Run {
        /// Serial device. Use '-' to read from stdin.
        #[arg(short, long)]
        port: Option<String>,

        /// Serial baud rate for UART links
        #[arg(long)]
        baud: Option<u32>,

        /// Serial read timeout (seconds)
        #[arg(long)]
        timeout: Option<f64>,

        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override config keys, e.g. --set frame_format=binary --set adc.gain=32
        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,

        /// Apply a named preset (see `presets`)
        #[arg(long)]
        preset: Option<String>,

        /// Coefficient arbitration policy
        #[arg(long, value_enum)]
        coeff_mode: Option<CoefficientMode>,

        /// Manual coefficient override (JSON)
        #[arg(long)]
        manual_coeff: Option<PathBuf>,

        /// Sample log destination (CSV)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print the effective configuration and exit
        #[arg(long)]
        print_config: bool,
    },

    /// Decode a raw EEPROM image and print the coefficients as JSON
    DecodeEeprom {
        /// 512-byte image file
        file: PathBuf,
    },

    /// List acquisition presets
    Presets,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            port,
            baud,
            timeout,
            config,
            mut overrides,
            preset,
            coeff_mode,
            manual_coeff,
            output,
            print_config,
        } => {
            // Dedicated flags win over --set.
            if let Some(port) = port {
                overrides.push(format!("serial.port={}", port));
            }
            if let Some(baud) = baud {
                overrides.push(format!("serial.baud_rate={}", baud));
            }
            if let Some(timeout) = timeout {
                overrides.push(format!("serial.timeout_sec={:?}", timeout));
            }
            if let Some(mode) = coeff_mode {
                overrides.push(format!("coefficients.mode={}", mode));
            }
            if let Some(path) = manual_coeff {
                overrides.push(format!("coefficients.manual_path={}", path.display()));
            }
            if let Some(path) = output {
                overrides.push(format!("output_csv={}", path.display()));
            }

            let config = TerpsConfig::load(config.as_deref(), preset.as_deref(), &overrides)
                .context("Failed to load configuration")?;
            config.validate()?;

            if print_config {
                print!("{}", config.to_toml()?);
                return Ok(());
            }

            logging::init_from_config(&config, cli.log_format)?;
            run(config).await
        }
        Commands::DecodeEeprom { file } => {
            init_cli_logging(cli.log_format)?;
            let blob = std::fs::read(&file)
                .with_context(|| format!("Failed to read EEPROM image {}", file.display()))?;
            let set = decode_eeprom(&blob, Provenance::Eeprom, None)
                .with_context(|| format!("Failed to decode {}", file.display()))?;
            println!("{}", serde_json::to_string_pretty(&set)?);
            Ok(())
        }
        Commands::Presets => {
            for preset in presets::all() {
                println!("{:<6} {}", preset.name, preset.description);
                for item in preset.overrides() {
                    println!("       {}", item);
                }
            }
            Ok(())
        }
    }
}

fn init_cli_logging(format: OutputFormat) -> Result<()> {
    logging::init(TracingConfig::new(tracing::Level::WARN).with_format(format))?;
    Ok(())
}

async fn run(config: TerpsConfig) -> Result<()> {
    let host = HostOrchestrator::from_config(config)?;
    let summary = host
        .run(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await?;
    info!(
        samples = summary.samples,
        elapsed_sec = summary.elapsed.as_secs_f64(),
        "Run complete"
    );
    Ok(())
}
