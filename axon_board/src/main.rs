//! # Axon Board Binary
//!
//! Boots the simulated Axon board and manages its stored configuration.
//!
//! # Usage
//!
//! ```bash
//! # Boot and run until Ctrl-C
//! axon_board --config board.toml boot
//!
//! # Boot, run for two seconds, print stats as JSON
//! axon_board --config board.toml boot --run-ms 2000
//!
//! # Print the configuration the next boot would use
//! axon_board --config board.toml show
//!
//! # Store factory defaults / wipe the stored configuration
//! axon_board --config board.toml store-defaults
//! axon_board --config board.toml erase
//! ```

use axon_board::axis::IdleLoop;
use axon_board::boot::{check_config_set, BootOrchestrator};
use axon_board::drivers::simulation::{FileStore, SimBoard, SimResourceProbe};
use axon_board::nvm::{load_or_default, store_config, ConfigManager, ConfigSource};
use axon_common::config::{BoardConfig, ConfigLoader, LogLevel};
use axon_common::layout::ConfigSet;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Idle diagnostics period.
const DIAGNOSTICS_PERIOD: Duration = Duration::from_millis(500);

/// Axon board - boot sequence and configuration storage on a simulated board
#[derive(Parser, Debug)]
#[command(name = "axon_board")]
#[command(version)]
#[command(about = "Axon motor-controller board core on a simulated board")]
#[command(long_about = None)]
struct Args {
    /// Path to the board configuration file (TOML). Defaults apply when omitted.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the NVM backing file from the configuration.
    #[arg(long, value_name = "FILE")]
    nvm: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Boot the board and run it
    Boot {
        /// Stop after this many milliseconds instead of waiting for Ctrl-C
        #[arg(long)]
        run_ms: Option<u64>,
    },
    /// Print the configuration the next boot would use (JSON)
    Show,
    /// Store the default configuration
    StoreDefaults,
    /// Erase the stored configuration
    Erase,
}

fn main() {
    let args = Args::parse();
    let config = match load_board_config(&args) {
        Ok(config) => config,
        Err(e) => {
            setup_tracing(&args, LogLevel::default());
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    setup_tracing(&args, config.shared.log_level);

    if let Err(e) = run(args, config) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn load_board_config(args: &Args) -> Result<BoardConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => BoardConfig::load(path)?,
        None => BoardConfig::default(),
    };
    if let Some(path) = &args.nvm {
        config.nvm.path = path.clone();
    }
    config.validate()?;
    Ok(config)
}

fn run(args: Args, config: BoardConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "{} v{} on hardware {}",
        config.shared.service_name,
        env!("CARGO_PKG_VERSION"),
        config.board.hw_version
    );
    let store = FileStore::open(&config.nvm.path, config.nvm.capacity)?;
    let mut manager = ConfigManager::new(store);
    let hw = config.board.hw_version;

    match args.command {
        Command::Boot { run_ms } => boot(&config, manager, run_ms)?,
        Command::Show => {
            let loaded = load_or_default(&mut manager, hw, |set: &ConfigSet| {
                check_config_set(set, hw)
            });
            let reason = match &loaded.source {
                ConfigSource::Stored => None,
                ConfigSource::Defaults { reason } => Some(reason.clone()),
            };
            let out = serde_json::json!({
                "user_config_loaded": loaded.user_config_loaded(),
                "fallback_reason": reason,
                "config": loaded.set,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Command::StoreDefaults => {
            store_config(&mut manager, &ConfigSet::defaults(hw))?;
            info!("Default configuration stored in {:?}", config.nvm.path);
        }
        Command::Erase => {
            manager.erase()?;
            info!("Stored configuration erased");
        }
    }
    Ok(())
}

fn boot(
    config: &BoardConfig,
    manager: ConfigManager<FileStore>,
    run_ms: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = running.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        handler_flag.store(false, Ordering::SeqCst);
    })?;

    let platform = SimBoard::from_config(config)?;
    let orchestrator = BootOrchestrator::new(platform, manager, config.boot.clone());
    let mut board = orchestrator.boot(Arc::new(IdleLoop::default()))?;

    let probe = Arc::new(SimResourceProbe::new(
        config.simulation.free_heap.unwrap_or(usize::MAX),
    ));
    let diagnostics = board
        .diagnostics(probe, config.simulation.min_free_bytes)
        .spawn(DIAGNOSTICS_PERIOD)?;

    let deadline = run_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
    while running.load(Ordering::SeqCst) && deadline.is_none_or(|d| Instant::now() < d) {
        thread::sleep(Duration::from_millis(10));
    }

    let stats = board.context().stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);

    board.shutdown();
    if board.safety_hook().is_tripped() {
        // The diagnostics context stays halted after a safety shutdown.
        warn!("Safety hook tripped, processor halted");
    } else if diagnostics.join().is_err() {
        warn!("Diagnostics context panicked");
    }
    info!("Axon board shutdown complete");
    Ok(())
}

/// Setup tracing subscriber based on CLI arguments and the configured level.
fn setup_tracing(args: &Args, level: LogLevel) {
    let mut filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_directive()));
    if args.verbose {
        filter = filter.add_directive(Level::DEBUG.into());
    }

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
