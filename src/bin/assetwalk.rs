//! # assetwalk CLI - resumable batch processing for image-asset trees
//!
//! ## Usage
//! ```bash
//! # Run a batch (resumes where the last run stopped)
//! assetwalk --config config.json run
//!
//! # Override paths and reprocess everything
//! assetwalk run --source uploads --output outputs --logs logs --force
//!
//! # Transform a single file without progress tracking
//! assetwalk process shot.png cropped.png
//!
//! # Show per-agent progress from the compacted snapshots
//! assetwalk status --agent Agent1Crop --runs 5
//!
//! # Fold the append logs into snapshots now
//! assetwalk compact
//! ```
//!
//! Exit codes: 0 on success, 2 for a rejected configuration or a locked
//! logs directory, 128 + n when stopped by signal n, 1 otherwise.

use anyhow::Context;
use assetwalk::status::DEFAULT_RECENT_RUNS;
use assetwalk::{
    compact_logs, process_single, processor_for, CompletionPolicy, EngineBuilder, EngineConfig,
    ProcessorKind, RunOutcome, StatusReport, WalkError, WalkSummary,
};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// assetwalk - resumable hierarchical batch traversal
#[derive(Parser)]
#[command(name = "assetwalk")]
#[command(version)]
#[command(about = "Walk image-asset trees, transform every image, resume after any crash")]
#[command(long_about = None)]
struct Cli {
    /// JSON config file (relative paths inside resolve against its directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Logs directory (overrides the config file)
    #[arg(short, long, global = true)]
    logs: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full batch over the source tree
    Run {
        /// Source tree
        #[arg(short, long)]
        source: Option<PathBuf>,

        /// Output mirror root
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Agent identifier
        #[arg(short, long)]
        agent: Option<String>,

        /// Reprocess items that are already completed
        #[arg(long)]
        force: bool,

        /// Rebuild archives from their processed output
        #[arg(long, overrides_with = "no_recompress")]
        recompress: bool,

        /// Keep processed archive contents as plain directories
        #[arg(long)]
        no_recompress: bool,

        /// Leaf items processed concurrently per directory
        #[arg(long)]
        concurrency: Option<usize>,

        /// Whether failed items block App/Variant completion
        #[arg(long, value_enum)]
        policy: Option<PolicyArg>,

        /// Per-item transform
        #[arg(long, value_enum)]
        processor: Option<ProcessorArg>,

        /// Remove a stale LOCK left by a killed run
        #[arg(long)]
        force_unlock: bool,
    },

    /// Transform a single file without progress tracking
    Process {
        /// Input image
        input: PathBuf,

        /// Output path (defaults to the output directory)
        output: Option<PathBuf>,

        /// Per-item transform
        #[arg(long, value_enum)]
        processor: Option<ProcessorArg>,
    },

    /// Show progress from the compacted snapshots
    Status {
        /// Agents to show (all when omitted)
        #[arg(short, long)]
        agent: Vec<String>,

        /// Recent runs shown per agent
        #[arg(long, default_value_t = DEFAULT_RECENT_RUNS)]
        runs: usize,
    },

    /// Fold the append logs into snapshots
    Compact {
        /// Remove a stale LOCK left by a killed run
        #[arg(long)]
        force_unlock: bool,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum PolicyArg {
    Always,
    RequireSuccess,
}

impl From<PolicyArg> for CompletionPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Always => CompletionPolicy::Always,
            PolicyArg::RequireSuccess => CompletionPolicy::RequireSuccess,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum ProcessorArg {
    Copy,
    Crop,
}

impl From<ProcessorArg> for ProcessorKind {
    fn from(arg: ProcessorArg) -> Self {
        match arg {
            ProcessorArg::Copy => ProcessorKind::Copy,
            ProcessorArg::Crop => ProcessorKind::Crop,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    // Set up logging
    let default_level = if cli.verbose { "assetwalk=debug" } else { "assetwalk=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            let code = e.downcast_ref::<WalkError>().map_or(1, WalkError::exit_code);
            let message = e
                .downcast_ref::<WalkError>()
                .map_or_else(|| format!("{:#}", e), WalkError::user_message);
            eprintln!("{}: {}", "Error".red().bold(), message);
            code
        }
    };
    std::process::exit(code);
}

/// Main command runner; returns the process exit code
fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(logs) = cli.logs {
        config.logs_dir = logs;
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;

    match cli.command {
        Commands::Run {
            source,
            output,
            agent,
            force,
            recompress,
            no_recompress,
            concurrency,
            policy,
            processor,
            force_unlock,
        } => {
            if let Some(source) = source {
                config.source_dir = source;
            }
            if let Some(output) = output {
                config.output_dir = output;
            }
            if let Some(agent) = agent {
                config.agent = agent;
            }
            if force {
                config.force_reprocess = true;
            }
            if recompress {
                config.recompress_archives = true;
            }
            if no_recompress {
                config.recompress_archives = false;
            }
            if concurrency.is_some() {
                config.concurrency = concurrency;
            }
            if let Some(policy) = policy {
                config.completion_policy = policy.into();
            }
            if let Some(processor) = processor {
                config.processor = processor.into();
            }
            runtime.block_on(cmd_run(config, force_unlock))
        }
        Commands::Process {
            input,
            output,
            processor,
        } => {
            if let Some(processor) = processor {
                config.processor = processor.into();
            }
            runtime.block_on(cmd_process(config, input, output))
        }
        Commands::Status { agent, runs } => cmd_status(config, agent, runs),
        Commands::Compact { force_unlock } => {
            compact_logs(&config, force_unlock)?;
            println!("{} Compacted logs in {}", "✓".green().bold(), config.logs_dir.display());
            Ok(0)
        }
    }
}

/// Run a batch with signal handling
async fn cmd_run(config: EngineConfig, force_unlock: bool) -> anyhow::Result<i32> {
    println!(
        "{} {} over {}",
        "Running".blue().bold(),
        config.agent.cyan(),
        config.source_dir.display().to_string().cyan()
    );

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .context("invalid progress template")?,
    );
    pb.enable_steady_tick(Duration::from_millis(120));

    let spinner = pb.clone();
    let engine = EngineBuilder::new(config)
        .force_unlock(force_unlock)
        .on_progress(move |info| {
            spinner.set_message(format!(
                "{} processed, {} skipped, {} failed | {}",
                info.processed,
                info.skipped,
                info.failed,
                info.current_item.unwrap_or_default()
            ));
        })
        .build()?;

    let start = Instant::now();
    let outcome = engine.run_until_signal().await;
    pb.finish_and_clear();
    let code = outcome.exit_code();

    match &outcome {
        RunOutcome::Completed(summary) => print_summary(summary, start.elapsed()),
        RunOutcome::Interrupted(signal) => {
            eprintln!(
                "{} Interrupted by {}; progress saved, rerun to resume",
                "■".yellow().bold(),
                signal.name
            );
        }
        RunOutcome::Faulted(e) => {
            eprintln!("{} Run failed: {}", "✗".red().bold(), e.user_message());
        }
    }

    engine.close()?;
    Ok(code)
}

fn print_summary(summary: &WalkSummary, elapsed: Duration) {
    println!("{} Batch finished", "✓".green().bold());
    println!("  Processed: {}", summary.processed.to_string().green());
    println!("  Skipped:   {}", summary.skipped.to_string().cyan());
    if summary.failed > 0 {
        println!("  Failed:    {}", summary.failed.to_string().red());
    }
    println!(
        "  Apps:      {} completed, {} skipped",
        summary.apps_completed, summary.apps_skipped
    );
    println!(
        "  Variants:  {} completed, {} skipped",
        summary.variants_completed, summary.variants_skipped
    );
    if summary.archives_spliced + summary.archives_skipped + summary.archives_failed > 0 {
        println!(
            "  Archives:  {} spliced, {} skipped, {} failed",
            summary.archives_spliced, summary.archives_skipped, summary.archives_failed
        );
    }
    println!(
        "  Time:      {}",
        format_duration(Duration::from_secs(elapsed.as_secs())).to_string().cyan()
    );
}

/// Transform one file
async fn cmd_process(
    config: EngineConfig,
    input: PathBuf,
    output: Option<PathBuf>,
) -> anyhow::Result<i32> {
    let processor = processor_for(&config)?;
    let written = process_single(&config, processor.as_ref(), &input, output.as_deref())
        .await
        .with_context(|| format!("processing {}", input.display()))?;
    println!(
        "{} {} -> {}",
        "✓".green().bold(),
        input.display(),
        written.display().to_string().cyan()
    );
    Ok(0)
}

/// Show status from snapshots
fn cmd_status(config: EngineConfig, agents: Vec<String>, runs: usize) -> anyhow::Result<i32> {
    let report = StatusReport::load(&config.logs_dir, &agents, runs)?;
    print!("{}", report.render());
    Ok(0)
}
