use std::path::PathBuf;

use structopt::StructOpt;
use tracing::{error, info, trace};

#[macro_use]
extern crate quick_error;

mod announce;
mod camera;
mod config;
mod detection;
mod runner;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "pi_detector",
    about = "Camera object detector announcing people and animals it sees."
)]
struct CliArgs {
    #[structopt(
        parse(from_os_str),
        short = "c",
        long = "config",
        default_value = "config.toml",
        help = "Path to configuration file.",
        env = "PI_DETECTOR_CONFIG"
    )]
    config: PathBuf,

    #[structopt(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Capture frames, run detection and announce what is seen (default)
    Run,
    /// Try every camera backend and report which ones deliver frames
    Probe,
    /// Capture frames without detection, logging progress
    Capture,
}

fn init_tracing(system: &config::ConfigSystem) -> Result<(), String> {
    let filter = tracing_subscriber::EnvFilter::new(&system.log_level);
    let builder = tracing_subscriber::fmt()
        // Filter from user
        .with_env_filter(filter);
    let installed = if system.log_json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    installed.map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() {
    let args = CliArgs::from_args();
    let cfg = match config::load_config(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Unable to load configuration {}: {}", args.config.display(), e);
            std::process::exit(2);
        }
    };
    if let Err(e) = init_tracing(&cfg.system) {
        eprintln!("Unable to set up logging: {}", e);
    }

    info!("Pi detector starting");
    trace!("Config: {:?}", cfg);

    let code = match args.command.unwrap_or(Command::Run) {
        Command::Probe => match runner::probe(&cfg) {
            true => 0,
            false => 1,
        },
        Command::Run => finish(runner::run(cfg).await),
        Command::Capture => finish(runner::capture(cfg).await),
    };
    std::process::exit(code);
}

fn finish(result: Result<runner::LoopSummary, runner::RunError>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => {
            error!("{}", e);
            1
        }
    }
}
