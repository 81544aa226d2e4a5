//! `labdaq` command line.
//!
//! Run a headless session from a configuration file:
//! ```bash
//! labdaq run --config lab.toml --label sampleA --duration 600
//! ```
//!
//! Check a configuration without touching hardware:
//! ```bash
//! labdaq check --config lab.toml
//! ```

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use daq_backend::telemetry::{self, TracingConfig};
use daq_backend::{Backend, DisplayCallback, InstrumentSample, Settings};
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(name = "labdaq")]
#[command(about = "Concurrent acquisition and resonance tracking for lab instruments", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every configured instrument and poll until Ctrl+C or the session ends
    Run {
        /// Configuration file (TOML)
        #[arg(long)]
        config: PathBuf,

        /// Start logging immediately under this session label
        #[arg(long)]
        label: Option<String>,

        /// Record duration in seconds, overriding the configuration
        #[arg(long)]
        duration: Option<f64>,
    },

    /// Load and validate a configuration, then print it
    Check {
        /// Configuration file (TOML)
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            config,
            label,
            duration,
        } => run(&config, label, duration),
        Commands::Check { config } => check(&config),
    }
}

fn load(path: &Path) -> Result<Settings> {
    if !path.exists() {
        bail!("config file not found: {}", path.display());
    }
    Settings::load(Some(path)).with_context(|| format!("loading {}", path.display()))
}

fn check(path: &Path) -> Result<()> {
    let settings = load(path)?;
    println!("Configuration OK: {}", path.display());
    println!("  datadir: {}", settings.datadir.display());
    if let Some(master) = &settings.master_instrument {
        println!("  master:  {master}");
    }
    println!("  instruments:");
    for instrument in &settings.instruments {
        println!("    {:<16} {}", instrument.id, instrument.driver.kind());
    }
    println!();
    print!("{}", toml::to_string_pretty(&settings).context("rendering settings")?);
    Ok(())
}

fn run(path: &Path, label: Option<String>, duration: Option<f64>) -> Result<()> {
    let mut settings = load(path)?;
    if let Some(seconds) = duration {
        settings.record_duration_s = seconds;
        settings.validate().context("invalid --duration")?;
    }
    telemetry::init(&TracingConfig::from_settings(&settings)?)?;

    // Engines block on their own threads; the runtime only watches for Ctrl+C.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .context("creating signal runtime")?;
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    runtime.spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, shutting down"),
            Err(e) => error!(error = %e, "failed to listen for Ctrl+C"),
        }
        flag.store(true, Ordering::SeqCst);
    });

    let poll = settings.poll_interval();
    let mut backend = Backend::new(settings)?;
    let report = backend.start()?;
    for (name, e) in &report.failed {
        warn!(instrument = %name, error = %e, "instrument unavailable");
    }
    if report.started.is_empty() {
        backend.stop()?;
        bail!("no instrument could be started");
    }

    let mut callbacks: HashMap<String, DisplayCallback<'_>> = report
        .started
        .iter()
        .map(|name| {
            let instrument = name.clone();
            let callback: DisplayCallback<'_> =
                Box::new(move |elapsed: f64, sample: &InstrumentSample| {
                    debug!(instrument = %instrument, elapsed = format_args!("{elapsed:.3}"), ?sample, "sample");
                });
            (name.clone(), callback)
        })
        .collect();

    if let Some(label) = &label {
        backend.start_logging(label)?;
    }

    let outcome = poll_loop(&mut backend, &mut callbacks, &interrupted, label.is_some(), poll);
    drop(callbacks);
    let stopped = backend.stop();
    outcome?;
    stopped?;
    Ok(())
}

fn poll_loop(
    backend: &mut Backend,
    callbacks: &mut HashMap<String, DisplayCallback<'_>>,
    interrupted: &AtomicBool,
    logging: bool,
    poll: std::time::Duration,
) -> Result<()> {
    loop {
        if interrupted.load(Ordering::SeqCst) {
            return Ok(());
        }
        let active = backend.process_samples(callbacks)?;
        if logging && !active {
            info!("session finished");
            return Ok(());
        }
        if !backend.has_live_engines() {
            bail!("every instrument has stopped");
        }
        std::thread::sleep(poll);
    }
}
