//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use topicdigest_core::{Pipeline, Progress, RunOutcome, RunState, write_digest};
use topicdigest_crawler::HttpWebSource;
use topicdigest_llm::OpenAiModel;
use topicdigest_shared::{
    AppConfig, PipelineConfig, init_config, load_config, load_config_from, resolve_api_key,
};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// topicdigest: crawl a topic, extract entities, synthesize themes.
#[derive(Parser)]
#[command(
    name = "topicdigest",
    version,
    about = "Crawl the web for a topic and digest it into entities and themes.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of the default location.
    #[arg(long, global = true, env = "TOPICDIGEST_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the pipeline for one topic and write its digest.
    Run(RunArgs),

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Options for `topicdigest run`. Each flag overrides its config value.
#[derive(clap::Args)]
pub(crate) struct RunArgs {
    /// Topic to research.
    pub topic: String,

    /// Directory the digest is written to.
    #[arg(short, long)]
    pub out: Option<PathBuf>,

    /// Maximum pages admitted to the crawl.
    #[arg(long)]
    pub max_pages: Option<usize>,

    /// Maximum link depth from a search result.
    #[arg(long)]
    pub depth: Option<u32>,

    /// Extra seed URL (repeatable).
    #[arg(long = "seed")]
    pub seeds: Vec<String>,

    /// RSS/Atom feed whose entries seed the crawl (repeatable).
    #[arg(long = "feed")]
    pub feeds: Vec<String>,

    /// Keep only feed entries mentioning this keyword (repeatable).
    #[arg(long = "feed-keyword")]
    pub feed_keywords: Vec<String>,

    /// Drop dated results published before this instant (RFC 3339 or YYYY-MM-DD).
    #[arg(long, value_parser = parse_since)]
    pub since: Option<DateTime<Utc>>,

    /// Drop dated results published after this instant (RFC 3339 or YYYY-MM-DD).
    #[arg(long, value_parser = parse_until)]
    pub until: Option<DateTime<Utc>>,

    /// Concurrent page fetches.
    #[arg(long)]
    pub fetch_concurrency: Option<usize>,

    /// Concurrent model calls.
    #[arg(long)]
    pub llm_concurrency: Option<usize>,

    /// Model identifier.
    #[arg(long)]
    pub model: Option<String>,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "topicdigest=info",
        1 => "topicdigest=debug",
        _ => "topicdigest=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run(args) => cmd_run(config_path, args).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(config_path),
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

/// Fold command-line overrides into the loaded config.
fn apply_overrides(config: &mut AppConfig, args: &RunArgs) {
    if let Some(max_pages) = args.max_pages {
        config.crawl.max_pages = max_pages;
    }
    if let Some(depth) = args.depth {
        config.crawl.max_depth = depth;
    }
    if let Some(n) = args.fetch_concurrency {
        config.crawl.fetch_concurrency = n;
    }
    if let Some(n) = args.llm_concurrency {
        config.llm.concurrency = n;
    }
    if let Some(model) = &args.model {
        config.llm.model = model.clone();
    }
    if args.since.is_some() {
        config.crawl.since = args.since;
    }
    if args.until.is_some() {
        config.crawl.until = args.until;
    }
    config.crawl.seed_urls.extend(args.seeds.iter().cloned());
    config.crawl.feed_urls.extend(args.feeds.iter().cloned());
    config.crawl.feed_keywords.extend(args.feed_keywords.iter().cloned());
}

/// A bare date opens the window at the start of that day.
fn parse_since(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    parse_instant(raw, NaiveTime::MIN)
}

/// A bare date closes the window at the last second of that day.
fn parse_until(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    let end_of_day = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);
    parse_instant(raw, end_of_day)
}

fn parse_instant(raw: &str, time_of_day: NaiveTime) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        return Ok(instant.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|date| date.and_time(time_of_day).and_utc())
        .map_err(|_| format!("expected RFC 3339 or YYYY-MM-DD, got {raw:?}"))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(config_path: Option<&Path>, args: RunArgs) -> Result<()> {
    let topic = args.topic.trim();
    if topic.is_empty() {
        return Err(eyre!("topic must not be empty"));
    }

    let mut config = resolve_config(config_path)?;
    apply_overrides(&mut config, &args);

    // Missing credentials fail before any network traffic.
    let api_key = resolve_api_key(&config.llm)?;
    let source = Arc::new(HttpWebSource::new(&config)?);
    let model = Arc::new(OpenAiModel::new(&config.llm, api_key)?);

    let out_dir = args
        .out
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.pipeline.output_dir));

    let pipeline = Pipeline::new(PipelineConfig::from(&config), source, model);
    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    info!(topic, model = %config.llm.model, "starting topic digest");

    let display = CliProgress::new();
    let ticker = display.spawn(pipeline.progress(), pipeline.subscribe());
    let outcome = pipeline.run(topic, cancel).await;
    ticker.abort();
    display.finish();

    let RunOutcome { report, digest } = outcome?;
    let path = write_digest(&digest, &out_dir)?;

    println!();
    println!("  Digest complete.");
    println!("  Run:               {}", report.run_id);
    println!("  Fetched:           {}", report.fetched);
    println!("  Fetch failed:      {}", report.fetch_failed);
    println!("  Extraction failed: {}", report.extraction_failed);
    println!("  Theme failed:      {}", report.theme_failed);
    println!("  Tokens:            {}", report.tokens.total());
    println!("  Entities:          {}", report.entities);
    println!("  Themes:            {}", report.themes);
    println!("  Elapsed:           {:.1}s", report.elapsed_ms as f64 / 1000.0);
    println!("  Output:            {}", path.display());
    println!();

    Ok(())
}

/// First Ctrl-C cancels the run; the coordinator then unwinds the workers.
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("interrupt received, cancelling run");
                cancel.cancel();
            }
            Err(e) => warn!(error = %e, "cannot listen for Ctrl-C"),
        }
    });
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress display
// ---------------------------------------------------------------------------

/// Spinner that polls the pipeline's counters.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} [{elapsed}] {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }

    fn spawn(
        &self,
        progress: Arc<Progress>,
        state: watch::Receiver<RunState>,
    ) -> tokio::task::JoinHandle<()> {
        let spinner = self.spinner.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(250));
            loop {
                interval.tick().await;
                let run_state = *state.borrow();
                let snap = progress.snapshot();
                spinner.set_message(format!(
                    "{run_state}: fetched {} | extracted {} | themed {} | failed {} | model calls {} | tokens {}",
                    snap.entity.enqueued,
                    snap.entity.completed_ok,
                    snap.theme.completed_ok,
                    snap.entity.completed_failed + snap.theme.completed_failed,
                    snap.llm_calls,
                    snap.tokens.total(),
                ));
                if run_state.is_terminal() {
                    break;
                }
            }
        })
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}
