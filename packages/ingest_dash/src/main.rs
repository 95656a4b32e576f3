use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use job_feed::protocol::TargetSystem;
use job_feed::{ControlRequest, EventKind, Scope};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::prelude::*;

mod api;
mod cli;
mod config;
mod wizard;

use crate::api::IncrementalMode;
use crate::cli::jobs::AnalyzeOptions;
use crate::config::{ApiConfig, FeedConfig, FileConfig};

#[derive(Parser)]
#[command(name = "ingest")]
#[command(about = "Follow and control data-ingest jobs on the pipeline service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config directory holding ingest.toml (defaults to <config dir>/ingest)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Event feed URL (overrides feed.url)
    #[arg(long, global = true)]
    feed_url: Option<String>,

    /// API base URL (overrides api.base_url)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Session token (overrides session.token and INGEST_SESSION__TOKEN)
    #[arg(long, global = true)]
    token: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the live event stream
    Watch(WatchArgs),

    /// Analyze a source and print the storage recommendation
    Analyze(AnalyzeArgs),

    /// Follow a running job until it finishes
    Monitor(MonitorArgs),

    /// Start a pipeline run now
    RunNow(PipelineArgs),

    /// Retry a failed run
    Retry(RunArgs),

    /// Cancel a run
    Cancel(RunArgs),

    /// Pause a pipeline's schedule
    Pause(PipelineArgs),

    /// Resume a paused pipeline
    Resume(PipelineArgs),
}

#[derive(Parser)]
struct WatchArgs {
    /// Only these event kinds (repeatable; default: all)
    #[arg(long = "kind", value_parser = parse_event_kind)]
    kinds: Vec<EventKind>,

    /// Only events about this job or run id
    #[arg(long)]
    job: Option<String>,
}

#[derive(Parser)]
struct AnalyzeArgs {
    /// JSON draft: {"sourceType", "source", "preview"?, "schedule"?}
    draft: PathBuf,

    /// Create the pipeline after the analysis finishes
    #[arg(long)]
    create: bool,

    /// Cron schedule for the new pipeline (default: the recommendation's hint)
    #[arg(long)]
    cron: Option<String>,

    /// Incremental load mode
    #[arg(long, value_enum)]
    incremental: Option<IncrementalMode>,

    /// Column driving incremental loads
    #[arg(long)]
    incremental_column: Option<String>,

    /// Override the recommended target system
    #[arg(long)]
    target: Option<TargetSystem>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ScopeArg {
    Analyze,
    Pipeline,
}

impl From<ScopeArg> for Scope {
    fn from(arg: ScopeArg) -> Self {
        match arg {
            ScopeArg::Analyze => Scope::Analyze,
            ScopeArg::Pipeline => Scope::Pipeline,
        }
    }
}

#[derive(Parser)]
struct MonitorArgs {
    /// Job or run id
    id: String,

    /// Kind of job
    #[arg(long, value_enum, default_value = "pipeline")]
    scope: ScopeArg,

    /// Print log lines as they arrive
    #[arg(long)]
    logs: bool,
}

#[derive(Parser)]
struct PipelineArgs {
    pipeline_id: String,
}

#[derive(Parser)]
struct RunArgs {
    run_id: String,
}

fn parse_event_kind(s: &str) -> Result<EventKind, String> {
    EventKind::ALL
        .into_iter()
        .find(|kind| kind.as_str() == s)
        .ok_or_else(|| {
            let known: Vec<&str> = EventKind::ALL.iter().map(|k| k.as_str()).collect();
            format!("unknown event kind '{s}' (expected one of: {})", known.join(", "))
        })
}

fn init_logging(debug: bool) {
    // stdout carries command output; logs go to stderr
    let default_directive = if debug {
        "ingest=debug,job_feed=debug,info"
    } else {
        "ingest=info,job_feed=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn build_context(cli: &Cli) -> Result<cli::Context> {
    let dir = config::config_dir(cli.config_dir.clone())?;
    let mut file: FileConfig = config::load_config(&dir)
        .extract()
        .with_context(|| format!("Invalid configuration in {}", dir.display()))?;

    if let Some(url) = &cli.feed_url {
        file.feed.url = url.clone();
    }
    if let Some(url) = &cli.api_url {
        file.api.base_url = url.clone();
    }
    if let Some(token) = &cli.token {
        file.session.token = Some(token.clone());
    }
    debug!(config_dir = %dir.display(), feed = %file.feed.url, api = %file.api.base_url, "configuration loaded");

    Ok(cli::Context {
        feed: FeedConfig::from_file(&file.feed, &file.session),
        api: ApiConfig::from_file(&file.api),
        credentials: config::credential_source(&file.session),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);
    let ctx = build_context(&cli)?;

    match cli.command {
        Commands::Watch(args) => cli::watch_command(&ctx, args.kinds, args.job).await,
        Commands::Analyze(args) => {
            let opts = AnalyzeOptions {
                create: args.create,
                cron: args.cron,
                incremental: args.incremental,
                incremental_column: args.incremental_column,
                target: args.target,
            };
            cli::analyze_command(&ctx, &args.draft, opts).await
        }
        Commands::Monitor(args) => {
            cli::monitor_command(&ctx, args.scope.into(), &args.id, args.logs).await
        }
        Commands::RunNow(args) => {
            cli::control_command(
                &ctx,
                ControlRequest::RunNow {
                    pipeline_id: args.pipeline_id,
                },
            )
            .await
        }
        Commands::Retry(args) => {
            cli::control_command(&ctx, ControlRequest::Retry { run_id: args.run_id }).await
        }
        Commands::Cancel(args) => {
            cli::control_command(&ctx, ControlRequest::Cancel { run_id: args.run_id }).await
        }
        Commands::Pause(args) => {
            cli::control_command(
                &ctx,
                ControlRequest::Pause {
                    pipeline_id: args.pipeline_id,
                },
            )
            .await
        }
        Commands::Resume(args) => {
            cli::control_command(
                &ctx,
                ControlRequest::Resume {
                    pipeline_id: args.pipeline_id,
                },
            )
            .await
        }
    }
}
