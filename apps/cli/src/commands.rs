//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use briefengine_core::{
    BriefEngine, ProgressReporter, Providers, RunLogger, StorageRunLogger, TracingRunLogger, failure_summary,
    setup_failure,
};
use briefengine_markup::MarkupSchema;
use briefengine_registry::ModuleRegistry;
use briefengine_search::default_freshness;
use briefengine_shared::{
    AppConfig, Credentials, RunId, RunOutcome, RunRequest, RunType, Stage, init_config, load_config,
    load_config_from,
};
use briefengine_storage::{RunQuery, RunRecord, Storage};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// briefengine: search-grounded briefs delivered to chat topics.
#[derive(Parser)]
#[command(
    name = "briefengine",
    version,
    about = "Generate sourced, validated news briefs and deliver them to chat topics.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.briefengine/briefengine.toml).
    #[arg(long, global = true, env = "BRIEFENGINE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

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
    /// Run one brief: search, generate, validate, deliver.
    Run {
        /// Module name (file stem under the modules directory).
        module: String,

        /// Run type, e.g. daily, weekly, flash.
        run_type: RunType,

        /// Reference date (YYYY-MM-DD); defaults to today.
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Resolve a module without touching the network.
    Check {
        /// Module name.
        module: String,

        /// Run type to resolve (defaults to every declared run type).
        run_type: Option<RunType>,
    },

    /// Validate a saved brief against a module's markup rules.
    Validate {
        /// Module name.
        module: String,

        /// Run type whose section rules apply.
        run_type: RunType,

        /// File containing the brief.
        file: PathBuf,
    },

    /// List recorded run outcomes.
    Runs {
        /// Maximum rows to show.
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Only show runs for this module.
        #[arg(short, long)]
        module: Option<String>,

        /// Show one run in full, including its preserved brief.
        #[arg(long)]
        id: Option<RunId>,

        /// Print JSON lines instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
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
        0 => "briefengine=info",
        1 => "briefengine=debug",
        _ => "briefengine=trace",
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
pub(crate) async fn run(cli: Cli) -> Result<ExitCode> {
    let config_path = cli.config.clone();
    let config = || -> Result<AppConfig> {
        Ok(match &config_path {
            Some(path) => load_config_from(path)?,
            None => load_config()?,
        })
    };

    match cli.command {
        Command::Run {
            module,
            run_type,
            date,
        } => cmd_run(&config()?, &module, run_type, date).await,
        Command::Check { module, run_type } => cmd_check(&config()?, &module, run_type.as_ref()),
        Command::Validate {
            module,
            run_type,
            file,
        } => cmd_validate(&config()?, &module, &run_type, &file),
        Command::Runs {
            limit,
            module,
            id,
            json,
        } => cmd_runs(&config()?, limit, module, id, json).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(&config()?),
        },
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn cmd_run(config: &AppConfig, module: &str, run_type: RunType, date: Option<NaiveDate>) -> Result<ExitCode> {
    let logger = open_run_logger(config).await;
    let request = RunRequest {
        date,
        ..RunRequest::new(module, run_type)
    };

    info!(module, run_type = %request.run_type, "running brief");

    let reporter = CliProgress::new();
    let outcome = run_request(config, &request, logger, &reporter).await;

    match failure_summary(&outcome) {
        None => {
            println!();
            println!("  Brief delivered!");
            println!("  Run:      {}", outcome.id);
            println!("  Module:   {} ({})", outcome.module, outcome.run_type);
            println!("  Message:  {}", outcome.delivery_id.as_deref().unwrap_or("-"));
            println!("  Time:     {:.1}s", outcome.elapsed_ms() as f64 / 1000.0);
            println!();
            Ok(ExitCode::SUCCESS)
        }
        Some(summary) => {
            eprintln!("error: {summary}");
            if outcome.output.is_some() {
                eprintln!(
                    "  The generated brief was preserved. Inspect it with: briefengine runs --id {}",
                    outcome.id
                );
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Execute `request` and return its recorded outcome.
///
/// The module and run type are resolved before credentials are read, so an
/// unknown name is reported as such. Failures before the pipeline starts are
/// recorded like any other failed run.
async fn run_request(
    config: &AppConfig,
    request: &RunRequest,
    logger: Arc<dyn RunLogger>,
    progress: &dyn ProgressReporter,
) -> RunOutcome {
    let started_at = Utc::now();

    match build_engine(config, request, Arc::clone(&logger)) {
        Ok(engine) => engine.run(request, progress).await,
        Err(e) => {
            error!(kind = e.kind(), error = %e, "brief run could not start");
            let outcome = setup_failure(request, started_at, &e);
            logger.record(&outcome).await;
            progress.done(&outcome);
            outcome
        }
    }
}

fn build_engine(
    config: &AppConfig,
    request: &RunRequest,
    logger: Arc<dyn RunLogger>,
) -> briefengine_shared::Result<BriefEngine> {
    let registry = ModuleRegistry::load(config)?;
    registry.resolve(&request.module, &request.run_type)?;

    let credentials = Credentials::from_env(config)?;
    let providers = Providers::from_config(config, &credentials)?;

    Ok(BriefEngine::new(config, Arc::new(registry), providers, logger))
}

/// The run database logger, or the log-only fallback if the database cannot be opened.
async fn open_run_logger(config: &AppConfig) -> Arc<dyn RunLogger> {
    let opened = match config.engine.runs_db_path() {
        Ok(path) => Storage::open(&path).await,
        Err(e) => Err(e),
    };

    match opened {
        Ok(storage) => Arc::new(StorageRunLogger::new(storage)),
        Err(e) => {
            warn!(error = %e, "run database unavailable, outcomes will only be logged");
            Arc::new(TracingRunLogger)
        }
    }
}

// ---------------------------------------------------------------------------
// check / validate
// ---------------------------------------------------------------------------

fn cmd_check(config: &AppConfig, module: &str, run_type: Option<&RunType>) -> Result<ExitCode> {
    let registry = ModuleRegistry::load(config)?;
    let definition = registry.module(module)?;

    let run_types: Vec<RunType> = match run_type {
        Some(rt) => vec![rt.clone()],
        None => definition.variants.keys().cloned().collect(),
    };

    println!();
    println!("  Module:       {}", definition.name);
    println!("  Destination:  {}", definition.destination);
    println!(
        "  Model:        {}",
        definition.model.as_deref().unwrap_or(&config.model.default_model)
    );
    println!(
        "  Max tokens:   {}",
        definition.max_tokens.unwrap_or(config.model.default_max_tokens)
    );

    if run_types.is_empty() {
        println!("  (no run types declared)");
    }

    for rt in &run_types {
        let resolved = registry.resolve(module, rt)?;
        let variant = &resolved.variant;
        println!();
        println!("  [{rt}]");
        println!("    Prompt:     {}", variant.prompt_path);
        println!(
            "    Freshness:  {}",
            variant
                .freshness
                .clone()
                .or_else(|| default_freshness(rt))
                .unwrap_or_else(|| "any".into())
        );
        println!("    Queries:    {}", variant.queries.len());
        for query in &variant.queries {
            println!("      - {query}");
        }
        if !variant.sections.is_empty() {
            println!("    Sections:");
            for section in &variant.sections {
                let marker = if section.required { " (required)" } else { "" };
                println!("      - {}{marker}", section.title);
            }
        }
    }
    println!();

    Ok(ExitCode::SUCCESS)
}

fn cmd_validate(config: &AppConfig, module: &str, run_type: &RunType, file: &Path) -> Result<ExitCode> {
    let registry = ModuleRegistry::load(config)?;
    let resolved = registry.resolve(module, run_type)?;

    let text = std::fs::read_to_string(file).map_err(|e| eyre!("cannot read '{}': {e}", file.display()))?;
    let schema = MarkupSchema::telegram_html(resolved.variant.sections.clone());
    let violations = briefengine_markup::check(&text, &schema);

    if violations.is_empty() {
        println!("valid: {} ({} chars)", file.display(), text.chars().count());
        return Ok(ExitCode::SUCCESS);
    }

    eprintln!(
        "error: stage={} kind=OutputMalformed: {} violation(s)",
        Stage::OutputValidator,
        violations.len()
    );
    for violation in &violations {
        eprintln!("  {violation}");
    }
    Ok(ExitCode::FAILURE)
}

// ---------------------------------------------------------------------------
// runs
// ---------------------------------------------------------------------------

async fn cmd_runs(
    config: &AppConfig,
    limit: usize,
    module: Option<String>,
    id: Option<RunId>,
    json: bool,
) -> Result<ExitCode> {
    let path = config.engine.runs_db_path()?;
    let storage = Storage::open_readonly(&path).await?;

    if let Some(id) = id {
        let record = storage
            .get_run_outcome(&id)
            .await?
            .ok_or_else(|| eyre!("no run with id {id}"))?;
        if json {
            println!("{}", serde_json::to_string_pretty(&record.outcome)?);
        } else {
            print_run_detail(&record);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let records = storage.list_run_outcomes(&RunQuery { module, limit }).await?;

    if json {
        for record in &records {
            println!("{}", serde_json::to_string(&record.outcome)?);
        }
        return Ok(ExitCode::SUCCESS);
    }

    if records.is_empty() {
        println!("no runs recorded");
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "{:<20}  {:<36}  {:<18}  {:<8}  {:<6}  {:<20}  KIND",
        "STARTED", "RUN", "MODULE", "TYPE", "STATUS", "STAGE"
    );
    for record in &records {
        let o = &record.outcome;
        println!(
            "{:<20}  {:<36}  {:<18}  {:<8}  {:<6}  {:<20}  {}",
            o.started_at.format("%Y-%m-%d %H:%M:%S"),
            o.id,
            o.module,
            o.run_type,
            status(o),
            o.stage,
            o.error_kind.as_deref().unwrap_or("-")
        );
    }

    Ok(ExitCode::SUCCESS)
}

fn status(outcome: &RunOutcome) -> &'static str {
    if outcome.success { "ok" } else { "failed" }
}

fn print_run_detail(record: &RunRecord) {
    let o = &record.outcome;
    println!();
    println!("  Run:       {}", o.id);
    println!("  Module:    {} ({})", o.module, o.run_type);
    println!("  Started:   {}", o.started_at.to_rfc3339());
    println!("  Elapsed:   {:.1}s", o.elapsed_ms() as f64 / 1000.0);
    println!("  Status:    {}", status(o));
    println!("  Stage:     {}", o.stage);
    if let Some(kind) = &o.error_kind {
        println!("  Kind:      {kind}");
    }
    if let Some(detail) = &o.error_detail {
        println!("  Detail:    {detail}");
    }
    if let Some(delivery) = &o.delivery_id {
        println!("  Message:   {delivery}");
    }
    if let Some(digest) = &record.output_sha256 {
        println!("  SHA-256:   {digest}");
    }
    if let Some(output) = &o.output {
        println!();
        println!("{output}");
    }
    println!();
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<ExitCode> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(ExitCode::SUCCESS)
}

fn cmd_config_show(config: &AppConfig) -> Result<ExitCode> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
        }
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn stage(&self, stage: Stage) {
        self.spinner.set_message(stage.to_string());
    }

    fn detail(&self, message: &str) {
        self.spinner.set_message(message.to_string());
    }

    fn done(&self, _outcome: &RunOutcome) {
        self.spinner.finish_and_clear();
    }
}
