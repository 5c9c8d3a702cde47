//! taskray: distributed tracing for task queue workers
//!
//! Runs in-process worker simulations through the task instrumentation and
//! inspects the segments they record.

mod config;
mod session;
mod show;
mod simulate;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use config::Config;
use taskray_recorder::{Emitter, FanoutEmitter, MemoryEmitter, TraceWriter, WriterConfig};

/// Distributed tracing for task queue workers
#[derive(Parser)]
#[command(name = "taskray")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to .taskray directory (default: search for .taskray/config.toml)
    #[arg(long, global = true, env = "TASKRAY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new .taskray directory with config file
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Run a producer and worker pool through the instrumentation
    Simulate {
        /// Number of tasks to publish
        #[arg(long, default_value = "10")]
        tasks: usize,

        /// Number of workers (default: [worker] count from config)
        #[arg(long)]
        workers: Option<usize>,

        /// Make every n-th task on a worker fail
        #[arg(long)]
        fail_every: Option<usize>,

        /// Make every n-th task on a worker request a retry
        #[arg(long)]
        retry_every: Option<usize>,

        /// Record every trace regardless of the configured sampling rule
        #[arg(long)]
        sample_all: bool,

        /// Segment output file (default: the session directory)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Print the segments of a trace file or session directory
    Show {
        /// JSONL file or session directory (default: latest trace file)
        path: Option<PathBuf>,
    },

    /// Parse a trace header value
    Header {
        /// Header value, e.g. "Root=1-...;Parent=...;Sampled=1"
        value: String,
    },
}

fn env_filter(verbose: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Initialize logging for interactive commands.
/// Logs to stderr.
fn init_logging(verbose: bool) {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter(verbose))
        .init();
}

/// Initialize logging for simulations.
/// Logs to rotating files in .taskray/logs/ with daily rotation.
fn init_file_logging(taskray_dir: &Path, verbose: bool) {
    let logs_dir = taskray_dir.join("logs");

    if let Err(e) = std::fs::create_dir_all(&logs_dir) {
        eprintln!("Warning: Failed to create logs directory: {}", e);
        init_logging(verbose);
        return;
    }

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &logs_dir, "taskray.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Dropping the guard stops the background writer
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(env_filter(verbose))
        .init();
}

/// Load config from file or auto-discover from `.taskray/config.toml`.
///
/// Returns the config and the path to the `.taskray` directory (for resolving relative paths).
fn load_config(override_path: Option<&PathBuf>) -> Result<(Config, Option<PathBuf>)> {
    if let Some(path) = override_path {
        // Explicit path override - treat as path to .taskray directory
        let config_file = if path.is_dir() {
            path.join(config::CONFIG_FILE)
        } else {
            path.clone()
        };
        let taskray_dir = config_file.parent().unwrap_or(path).to_path_buf();
        let config = Config::from_file(&config_file)?;
        return Ok((config, Some(taskray_dir)));
    }

    match Config::find_and_load() {
        Ok(Some((config, taskray_dir))) => Ok((config, Some(taskray_dir))),
        Ok(None) => Ok((Config::default(), None)),
        Err(e) => {
            eprintln!("Warning: {e:#}, using defaults");
            Ok((Config::default(), None))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, config_dir) = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Init { force } => {
            init_logging(cli.verbose);
            use config::{CONFIG_FILE, DEFAULT_CONFIG, TASKRAY_DIR};

            let taskray_dir = PathBuf::from(TASKRAY_DIR);
            let config_path = taskray_dir.join(CONFIG_FILE);

            if config_path.exists() && !force {
                anyhow::bail!(".taskray/config.toml already exists. Use --force to overwrite.");
            }

            if !taskray_dir.exists() {
                std::fs::create_dir_all(&taskray_dir)?;
                info!("Created {}/", taskray_dir.display());
            }

            std::fs::write(&config_path, DEFAULT_CONFIG)?;
            info!("Created {}", config_path.display());
            info!("Next steps:");
            info!("  1. Edit .taskray/config.toml to tune sampling and output");
            info!("  2. Run 'taskray simulate --tasks 20' to record a run");
            info!("  3. Run 'taskray show <session dir>' to inspect it");
        }

        Commands::Simulate {
            tasks,
            workers,
            fail_every,
            retry_every,
            sample_all,
            output,
        } => {
            let taskray_dir = config_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(config::TASKRAY_DIR));
            init_file_logging(&taskray_dir, cli.verbose);

            let mut config = config;
            if let Some(workers) = workers {
                config.worker.count = workers;
            }
            if sample_all {
                config.recorder.sampling = taskray_recorder::SamplingConfig::always();
            }
            let errors = config.validate();
            if !errors.is_empty() {
                for error in &errors {
                    eprintln!("  {error}");
                }
                anyhow::bail!("Invalid configuration ({} errors)", errors.len());
            }

            let session_id = session::SessionId::generate();
            let session_dir = session::session_dir(&taskray_dir, &session_id);
            std::fs::create_dir_all(&session_dir)?;
            let segments_path =
                output.unwrap_or_else(|| session_dir.join(session::SEGMENTS_FILE));

            let memory = Arc::new(MemoryEmitter::new());
            let mut fanout = FanoutEmitter::new()
                .with(Arc::new(TraceWriter::new(WriterConfig::session(&segments_path))?))
                .with(memory.clone());
            if let Some(writer_config) = config.extra_writer(config_dir.as_deref(), &segments_path)
            {
                fanout = fanout.with(Arc::new(TraceWriter::new(writer_config)?));
            }
            let emitter: Arc<dyn Emitter> = Arc::new(fanout);

            let metadata = session::SessionMetadata::new(&session_id, tasks, config.worker.count);
            session::write_metadata(&session_dir, &metadata)?;
            info!(session = %session_id, tasks, workers = config.worker.count, "simulation starting");

            let report = simulate::run(
                simulate::SimulationOptions {
                    tasks,
                    workers: config.worker.count,
                    fail_every,
                    retry_every,
                    recorder: config.recorder.clone(),
                },
                emitter,
            )
            .await?;

            let emitted = memory.len();
            session::write_metadata(&session_dir, &metadata.finish(emitted))?;

            if report.stats.open_segments() > 0 || report.stats.open_subsegments() > 0 {
                warn!(
                    open_segments = report.stats.open_segments(),
                    open_subsegments = report.stats.open_subsegments(),
                    "simulation left entities open"
                );
            }

            println!("session:   {}", session_dir.display());
            println!("segments:  {} ({} emitted)", segments_path.display(), emitted);
            println!(
                "tasks:     {} published, {} executed, {} failed, {} retried",
                report.published, report.executed, report.failures, report.retries
            );
        }

        Commands::Show { path } => {
            init_logging(cli.verbose);
            let path = match path {
                Some(path) => path,
                None => {
                    let writer = TraceWriter::new(config.resolved_writer(config_dir.as_deref()))?;
                    writer
                        .list_trace_files()?
                        .pop()
                        .ok_or_else(|| anyhow::anyhow!("No trace files found"))?
                }
            };
            print!("{}", show::render_path(&path)?);
        }

        Commands::Header { value } => {
            init_logging(cli.verbose);
            print!("{}", show::describe_header(&value)?);
        }
    }

    Ok(())
}
