use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use keygrid::config::{AppConfig, Command};
use keygrid::engine::list_devices;
use keygrid::export::export_store;
use keygrid::finder::Finder;
use keygrid::import::import_address_files;

/// secp256k1 key-space search against an on-disk address store
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON configuration
    config: PathBuf,

    /// Verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading configuration '{}'", args.config.display()))?;
    let config: AppConfig =
        serde_json::from_str(&content).context("parsing configuration JSON")?;

    info!("command: {:?}", config.command);
    match config.command {
        Command::Find => {
            let finder_config = config
                .finder
                .context("'Find' needs a 'finder' configuration section")?;

            let stop = Arc::new(AtomicBool::new(false));
            let signal_stop = Arc::clone(&stop);
            ctrlc::set_handler(move || {
                info!("interrupt received, shutting down");
                signal_stop.store(true, Ordering::SeqCst);
            })
            .context("installing the signal handler")?;

            let mut finder = Finder::new(finder_config, stop);
            finder.run().context("running the find pipeline")?;
        }
        Command::AddressFilesToStore => {
            let import_config = config
                .address_files_to_store
                .context("'AddressFilesToStore' needs its configuration section")?;
            let statistic = import_address_files(&import_config)?;
            info!(
                "import done: {} unsupported, {} error lines",
                statistic.unsupported,
                statistic.errors.len()
            );
        }
        Command::StoreToAddressFile => {
            let export_config = config
                .store_to_address_file
                .context("'StoreToAddressFile' needs its configuration section")?;
            export_store(&export_config)?;
        }
        Command::GpuInfo => {
            let devices = list_devices();
            if devices.is_empty() {
                println!("no compute devices available");
            } else {
                for device in devices {
                    println!("{device}");
                }
            }
        }
    }
    Ok(())
}
