//! `doom` - probe, fuzz and learn the SCPI command surface of an instrument
//!
//! # Usage
//! - `doom test --ip 192.168.2.70`            probe the full catalog
//! - `doom group MATH1 --ip 192.168.2.70`     probe one command group
//! - `doom fuzz --ip 192.168.2.70`            probe random candidates
//! - `doom learn --ip 192.168.2.70`           discover and save new commands
//! - `doom send ":CHAN1:SCAL?" --ip ...`      send one command
//!
//! Logging goes to stderr (`RUST_LOG` overrides the default `info` level);
//! `--json` prints the session report to stdout.

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use scpi_doom::config::{DEFAULT_FUZZ_ITERATIONS, DEFAULT_LEARN_ITERATIONS};
use scpi_doom::{
    Catalog, Denylist, DoomError, Outcome, ProbeConfig, Prober, SessionReport, TcpTransport,
};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "doom")]
#[command(version)]
#[command(about = "SCPI command-surface prober: test, fuzz and learn per-device catalogs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full catalog against the device
    Test {
        #[command(flatten)]
        target: Target,
    },

    /// Run the commands of one group (e.g. MATH1, CHAN, TRIG)
    Group {
        /// Group tag, matched as a case-insensitive prefix
        #[arg(value_name = "GROUP")]
        tag: String,

        #[command(flatten)]
        target: Target,
    },

    /// Fuzz the device with generated queries
    Fuzz {
        #[command(flatten)]
        target: Target,

        /// Maximum number of candidates
        #[arg(short = 'n', long, default_value_t = DEFAULT_FUZZ_ITERATIONS)]
        iterations: usize,

        /// Wall-clock limit in seconds
        #[arg(long, value_name = "SECS")]
        time_limit: Option<u64>,
    },

    /// Discover new commands and add them to this device's learned catalog
    Learn {
        #[command(flatten)]
        target: Target,

        /// Maximum number of candidates
        #[arg(short = 'n', long, default_value_t = DEFAULT_LEARN_ITERATIONS)]
        iterations: usize,

        /// Wall-clock limit in seconds
        #[arg(long, value_name = "SECS")]
        time_limit: Option<u64>,
    },

    /// Send a single command and classify the reply
    Send {
        /// SCPI command or query, quoted
        #[arg(value_name = "SCPI")]
        command: String,

        #[command(flatten)]
        target: Target,
    },
}

#[derive(Args)]
struct Target {
    /// Instrument address, `host` or `host:port` (raw SCPI socket, default port 5555)
    #[arg(long, value_name = "ADDR")]
    ip: String,

    /// Per-probe timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// Baseline command list
    #[arg(long, value_name = "FILE")]
    baseline: Option<PathBuf>,

    /// Directory for learned catalogs and session logs
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Extra destructive commands to never generate, one per line
    #[arg(long, value_name = "FILE")]
    denylist: Option<PathBuf>,

    /// RNG seed for reproducible fuzz/learn runs
    #[arg(long)]
    seed: Option<u64>,

    /// Connect and identify, but send no probes
    #[arg(long)]
    dry_run: bool,

    /// Print the session report as JSON on stdout
    #[arg(long)]
    json: bool,
}

impl Target {
    fn config(&self) -> ProbeConfig {
        let defaults = ProbeConfig::default();
        ProbeConfig {
            timeout: Duration::from_millis(self.timeout_ms),
            baseline_path: self.baseline.clone().unwrap_or(defaults.baseline_path.clone()),
            data_dir: self.data_dir.clone().unwrap_or(defaults.data_dir.clone()),
            denylist_path: self.denylist.clone(),
            seed: self.seed,
            dry_run: self.dry_run,
            ..defaults
        }
    }
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()) {
        error!("{}", e);
        eprintln!("{}", format!("❌ {}", e).red());
        std::process::exit(1);
    }
}

fn connect(target: &Target, cancel: Arc<AtomicBool>) -> Result<Prober<TcpTransport>, DoomError> {
    let config = target.config();
    if config.dry_run {
        warn!("--dry-run: no probes will be sent");
    }

    let denylist = match &config.denylist_path {
        Some(path) => Denylist::with_file(path)?,
        None => Denylist::default(),
    };

    info!("Connecting to {} ...", target.ip);
    let transport = TcpTransport::open(&target.ip, config.connect_timeout)?;
    Ok(Prober::new(transport, config)
        .with_denylist(denylist)
        .with_cancel_flag(cancel)
        .with_progress(true))
}

fn run(cli: Cli) -> Result<(), DoomError> {
    let cancel = Arc::new(AtomicBool::new(false));
    if let Err(e) = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&cancel)) {
        warn!("Could not install Ctrl+C handler: {}", e);
    }

    let secs = |s: Option<u64>| s.map(Duration::from_secs);

    let (report, json) = match &cli.command {
        Commands::Test { target } => {
            let mut prober = connect(target, cancel)?;
            let identity = prober.identify_or_generic();
            let catalog = Catalog::open(
                identity,
                &prober.config().baseline_path,
                &prober.config().data_dir,
            )?;
            (prober.run_test(&catalog)?, target.json)
        }
        Commands::Group { tag, target } => {
            let mut prober = connect(target, cancel)?;
            let identity = prober.identify_or_generic();
            let catalog = Catalog::open(
                identity,
                &prober.config().baseline_path,
                &prober.config().data_dir,
            )?;
            (prober.run_group(&catalog, tag)?, target.json)
        }
        Commands::Fuzz {
            target,
            iterations,
            time_limit,
        } => {
            let mut prober = connect(target, cancel)?;
            (prober.run_fuzz(*iterations, secs(*time_limit))?, target.json)
        }
        Commands::Learn {
            target,
            iterations,
            time_limit,
        } => {
            let mut prober = connect(target, cancel)?;
            (prober.run_learn(*iterations, secs(*time_limit))?, target.json)
        }
        Commands::Send { command, target } => {
            let mut prober = connect(target, cancel)?;
            if target.dry_run {
                println!("💤 Would send: {}", command);
                return Ok(());
            }
            info!("Sending SCPI command: {}", command);
            let result = prober.probe(command.trim())?;
            if target.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("{}", result.progress_line(1, Some(1)));
            }
            return Ok(());
        }
    };

    print_report(&report);
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

fn print_report(report: &SessionReport) {
    let summary = report.summary();
    if report.count(Outcome::Confirmed) > 0 {
        eprintln!("\n{}", summary.green());
    } else {
        eprintln!("\n{}", summary.yellow());
    }

    let review = report.needs_review();
    if !review.is_empty() {
        eprintln!("{}", "Review (error or malformed reply):".red());
        for command in review {
            eprintln!("  - {}", command);
        }
    }
    let timed_out = report.timed_out();
    if !timed_out.is_empty() {
        eprintln!("{}", "Unstable (no reply):".yellow());
        for command in timed_out {
            eprintln!("  - {}", command);
        }
    }
    if !report.learned.is_empty() {
        eprintln!("{}", format!("💾 Learned {} new commands", report.learned.len()).green());
        for command in &report.learned {
            eprintln!("  + {}", command);
        }
    }
    if !report.unpersisted.is_empty() {
        eprintln!(
            "{}",
            format!(
                "⚠️ {} learned commands were NOT saved to disk",
                report.unpersisted.len()
            )
            .red()
            .bold()
        );
    }
    if let Some(path) = &report.log_path {
        eprintln!("💾 Saved log to {}", path.display());
    }
}
