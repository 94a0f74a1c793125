//! SCST Configurator CLI
//!
//! Thin front-end over the library entry points: `--apply` converges the
//! live subsystem to a configuration file, `--check` parses and validates
//! without touching the system, `--clear` removes the complete live
//! configuration.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{ArgGroup, Parser};
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use scst_configurator::{
    ConfigParser, ConvergenceEngine, EngineOptions, Error, ModuleManager, ScstSysfs, DEFAULT_ROOT,
    DEFAULT_TIMEOUT_SECS,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Declarative configurator for the SCST SCSI target subsystem
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(group(ArgGroup::new("action").required(true).args(["apply", "check", "clear"])))]
struct Args {
    /// Apply a configuration file to the live subsystem
    #[arg(long, value_name = "FILE")]
    apply: Option<PathBuf>,

    /// Parse and validate a configuration file without touching the system
    #[arg(long, value_name = "FILE")]
    check: Option<PathBuf>,

    /// Remove the complete live configuration
    #[arg(long)]
    clear: bool,

    /// Suspend subsystem I/O with this value for the duration of the run
    #[arg(long, value_name = "N")]
    suspend: Option<u32>,

    /// Per-operation timeout in seconds
    #[arg(long, value_name = "SECONDS", default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout: u64,

    /// Control filesystem root
    #[arg(long, env = "SCST_ROOT", default_value = DEFAULT_ROOT)]
    root: PathBuf,

    /// With --check: dump the parsed model as JSON
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            if let Error::PartialConvergence { failures } = &e {
                for failure in failures {
                    error!("  {failure}");
                }
            }
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn run(args: &Args) -> scst_configurator::Result<()> {
    let parser = ConfigParser::new();

    if let Some(path) = &args.check {
        let config = parser.parse_file(path)?;
        config.validate()?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&config)?);
        } else {
            println!("{}: configuration OK", path.display());
        }
        return Ok(());
    }

    let sysfs = ScstSysfs::new(&args.root, Duration::from_secs(args.timeout));
    let mut engine = ConvergenceEngine::new(sysfs, ModuleManager::with_modprobe());
    let options = EngineOptions {
        suspend: args.suspend,
    };

    if let Some(path) = &args.apply {
        let config = parser.parse_file(path)?;
        let report = engine.apply(&config, &options)?;
        info!(mutations = report.mutations, "configuration applied");
    } else {
        let report = engine.clear(&options)?;
        info!(mutations = report.mutations, "configuration cleared");
    }
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .init();
    }
}
