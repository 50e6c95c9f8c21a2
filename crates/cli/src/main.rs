//! CLI entry point for the reel assembler
//!
//! Runs assembly manifests through the executor and exposes encoder detection
//! and cache maintenance.

use clap::{Parser, Subcommand};
use reel_assembler::{
    init_logging, load_request, new_shared_metrics, run_metrics_server, run_startup_checks,
    Assembler, AssemblySettings, ClipCache, ConcurrencyPlan, Config, EncoderSelector,
    FfmpegEngine, OutputProfile, RunExecutor,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

/// Reel assembler - normalize, trim, join and mix clips into one video
#[derive(Parser, Debug)]
#[command(name = "reel-assemble")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file; built-in defaults when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Assemble every manifest, running up to the configured number at once
    Run {
        /// Directory for per-run scratch files
        #[arg(short, long, default_value = "/tmp/reel-assembler")]
        work_dir: PathBuf,

        /// Skip startup checks (ffmpeg version, writable directories). For testing only.
        #[arg(long, default_value = "false")]
        skip_checks: bool,

        /// Serve metrics as JSON on this address (e.g. 127.0.0.1:7878)
        #[arg(long)]
        metrics_addr: Option<SocketAddr>,

        /// Run manifest files
        #[arg(required = true)]
        manifests: Vec<PathBuf>,
    },

    /// Print the video encoder this host would use
    DetectEncoder,

    /// Inspect or clear the normalized clip cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Print entry count and size
    Stats,
    /// Remove every cached clip and the index
    Clear,
}

fn load_config(path: Option<&Path>) -> Result<Config, String> {
    match path {
        Some(path) => Config::load(path).map_err(|e| format!("{}: {}", path.display(), e)),
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config.validate().map_err(|e| e.to_string())?;
            Ok(config)
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{}", line),
        Err(e) => eprintln!("Failed to serialize output: {}", e),
    }
}

fn open_cache(config: &Config) -> ClipCache {
    if config.cache.enabled {
        ClipCache::open(&config.cache.dir)
    } else {
        ClipCache::disabled()
    }
}

async fn run(
    config: Config,
    work_dir: PathBuf,
    skip_checks: bool,
    metrics_addr: Option<SocketAddr>,
    manifests: Vec<PathBuf>,
) -> ExitCode {
    if skip_checks {
        tracing::warn!("skipping startup checks (--skip-checks enabled)");
    } else if let Err(e) = run_startup_checks(&config, &work_dir) {
        eprintln!("Startup check failed: {}", e);
        return ExitCode::FAILURE;
    }

    let selector = EncoderSelector::from_config(&config.encoder);
    let encoder = match tokio::task::spawn_blocking(move || selector.detect()).await {
        Ok(encoder) => encoder,
        Err(e) => {
            eprintln!("Encoder detection failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let metrics = new_shared_metrics();
    metrics.write().await.encoder = encoder.name.clone();

    let assembler = Assembler::new(
        Arc::new(FfmpegEngine::from_config(&config.encoder)),
        Arc::new(open_cache(&config)),
        OutputProfile::from_config(&config, encoder),
        &work_dir,
    );
    let plan = ConcurrencyPlan::derive(&config);
    tracing::info!(
        cores = plan.total_cores,
        max_concurrent_runs = plan.max_concurrent_runs,
        "concurrency plan"
    );
    let executor = Arc::new(RunExecutor::new(Arc::new(assembler), plan, metrics.clone()));

    let server = metrics_addr.map(|addr| {
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(metrics, addr).await {
                tracing::error!(error = %e, "metrics server stopped");
            }
        })
    });

    let interrupt = {
        let executor = executor.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, cancelling runs");
                executor.cancel_all();
            }
        })
    };

    let defaults = AssemblySettings::from_config(&config);
    let mut failed = false;
    let mut tasks = Vec::with_capacity(manifests.len());
    for path in &manifests {
        match load_request(path, &defaults) {
            Ok(request) => {
                let executor = executor.clone();
                tasks.push(tokio::spawn(async move { executor.execute(request).await }));
            }
            Err(e) => {
                failed = true;
                print_json(&serde_json::json!({
                    "manifest": path,
                    "error": e.to_string(),
                }));
            }
        }
    }

    for task in tasks {
        match task.await {
            Ok(report) => {
                failed |= !report.succeeded();
                print_json(&report);
            }
            Err(e) => {
                failed = true;
                tracing::error!(error = %e, "run task failed");
            }
        }
    }

    interrupt.abort();
    if let Some(server) = server {
        server.abort();
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.logging);

    match args.command {
        Command::Run {
            work_dir,
            skip_checks,
            metrics_addr,
            manifests,
        } => run(config, work_dir, skip_checks, metrics_addr, manifests).await,

        Command::DetectEncoder => {
            let selector = EncoderSelector::from_config(&config.encoder);
            print_json(&selector.detect());
            ExitCode::SUCCESS
        }

        Command::Cache { action } => {
            let cache = open_cache(&config);
            if !cache.is_enabled() {
                eprintln!("Cache is disabled or {} is unusable", config.cache.dir.display());
                return ExitCode::FAILURE;
            }
            match action {
                CacheAction::Stats => {
                    print_json(&cache.stats());
                    ExitCode::SUCCESS
                }
                CacheAction::Clear => match cache.clear() {
                    Ok(removed) => {
                        println!("Removed {} cached files", removed);
                        ExitCode::SUCCESS
                    }
                    Err(e) => {
                        eprintln!("Failed to clear cache: {}", e);
                        ExitCode::FAILURE
                    }
                },
            }
        }
    }
}
