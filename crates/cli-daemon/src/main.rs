//! CLI entry point for reelrelay
//!
//! Parses command line arguments, sets up logging and runs the pipeline.

use clap::{Parser, Subcommand};
use reelrelay::pipeline::ErrorClass;
use reelrelay::{
    metrics::spawn_system_sampler, prepare_work_dirs, run_startup_checks, run_status_server,
    shutdown::channel as shutdown_channel, sweep_stale_media, Config, Pipeline, PipelineError,
    StateStore,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// reelrelay - curated short-video relay from Reddit to Telegram
#[derive(Parser, Debug)]
#[command(name = "reelrelay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, default_value = "false")]
    json: bool,

    /// Run a single iteration and exit (same as the `once` subcommand)
    #[arg(long, default_value = "false")]
    once: bool,

    /// Skip the ffmpeg/ffprobe preflight. For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline loop until interrupted (default)
    Run,
    /// Run a single iteration and exit
    Once,
    /// Load and validate the configuration, then exit
    CheckConfig,
    /// Clear the persisted seen, blacklist and failed sets
    ResetState,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.json);

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(config = %args.config.display(), error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let command = match args.command {
        Some(command) => command,
        None if args.once => Command::Once,
        None => Command::Run,
    };

    match command {
        Command::CheckConfig => {
            if let Err(e) = config.validate() {
                error!(config = %args.config.display(), error = %e, "Invalid configuration");
                return ExitCode::FAILURE;
            }
            info!(
                config = %args.config.display(),
                subreddits = config.discovery.subreddits.len(),
                "Configuration is valid"
            );
            ExitCode::SUCCESS
        }
        Command::ResetState => {
            let mut store = StateStore::load(&config.paths.state_file);
            match store.reset() {
                Ok(()) => {
                    info!(path = %config.paths.state_file.display(), "State cleared");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!(error = %e, "Could not clear state");
                    ExitCode::FAILURE
                }
            }
        }
        Command::Once => run(config, args.skip_checks, true).await,
        Command::Run => run(config, args.skip_checks, false).await,
    }
}

async fn run(config: Config, skip_checks: bool, once: bool) -> ExitCode {
    match start(config, skip_checks, once).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.class() {
                ErrorClass::Fatal => error!(error = %e, "Fatal error, exiting"),
                ErrorClass::Transient => error!(error = %e, "Pipeline stopped"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn start(config: Config, skip_checks: bool, once: bool) -> Result<(), PipelineError> {
    config.validate()?;

    if skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
    } else {
        let major = run_startup_checks()?;
        info!(ffmpeg_major = major, "Startup checks passed");
    }

    prepare_work_dirs(&[
        config.paths.download_dir.as_path(),
        config.paths.output_dir.as_path(),
    ])?;

    let (trigger, shutdown) = shutdown_channel();
    let status_config = config.status.clone();
    let mut pipeline = Pipeline::from_config(config, shutdown.clone())?;
    sweep_stale_media(&pipeline.work_dirs());

    let plan = pipeline.plan();
    info!(
        cores = plan.total_cores,
        threads = plan.transcoder_threads,
        max_concurrent_jobs = plan.max_concurrent_jobs,
        "Concurrency plan"
    );

    if once {
        let outcome = pipeline.run_once().await;
        info!(?outcome, "Single iteration finished");
        return Ok(());
    }

    let status = pipeline.status();
    let sampler = spawn_system_sampler(status.clone(), Duration::from_secs(5), shutdown.clone());
    let server = if status_config.enabled {
        let server_shutdown = shutdown.clone();
        let bind = status_config.bind;
        info!(bind = %bind, "Starting status endpoint at /status");
        Some(tokio::spawn(async move {
            if let Err(e) = run_status_server(status, &bind, server_shutdown).await {
                error!(error = %e, "Status endpoint stopped");
            }
        }))
    } else {
        None
    };

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown requested");
        trigger.trigger();
    });

    pipeline.run().await;

    let _ = sampler.await;
    if let Some(server) = server {
        let _ = server.await;
    }
    info!("reelrelay stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Could not install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
