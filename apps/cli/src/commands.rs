//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use celia_artifacts::{ArtifactBuilder, BuildContext, extract_json};
use celia_core::{
    CorpusRetriever, NoRetrieval, OpenRouterGenerator, Pipeline, PipelineProgress,
    PipelineRequest, PipelineState, Retriever, Stage, ValidationResult, Validator,
    ValidatorConfig,
};
use celia_shared::{
    AppConfig, DocumentType, NarrativeArtifact, NodeTag, Snippet, StructuredArtifact,
    init_config, load_config, load_config_from,
};
use celia_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// CELIA: draft and validate procurement-justification sections.
#[derive(Parser)]
#[command(
    name = "celia",
    version,
    about = "Generate, validate and log procurement-justification artifacts.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.celia/celia.toml.
    #[arg(long, global = true)]
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
    /// Run the generation pipeline for one section.
    Generate {
        /// Expedient identifier.
        #[arg(short, long)]
        expedient: String,

        /// Section id (e.g. JN.1).
        #[arg(short, long)]
        section: String,

        /// Document type.
        #[arg(long, default_value = "JN")]
        doc_type: DocumentType,

        /// User text describing the need.
        #[arg(short, long, conflicts_with = "input")]
        text: Option<String>,

        /// Read the user text from a file.
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// JSON file with pre-retrieved snippets; skips corpus search.
        #[arg(long)]
        context: Option<PathBuf>,

        /// Do not search the snippet corpus.
        #[arg(long)]
        no_retrieval: bool,

        /// Write the final pipeline state as JSON.
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Append the artifact pair to the output log when validation passes.
        #[arg(long)]
        persist: bool,

        /// Downgrade validation failures to notices.
        #[arg(long)]
        non_strict: bool,

        /// Override the repair budget.
        #[arg(long)]
        max_retries: Option<u32>,

        /// Override the generation model.
        #[arg(long)]
        model: Option<String>,

        /// Override the database path.
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Build a structured artifact offline from a raw JSON file.
    Build {
        /// Raw generator output (JSON, optionally fenced).
        input: PathBuf,

        /// Section id (e.g. JN.6).
        #[arg(short, long)]
        section: String,

        /// Expedient identifier.
        #[arg(short, long, default_value = "LOCAL")]
        expedient: String,

        /// Document type.
        #[arg(long, default_value = "JN")]
        doc_type: DocumentType,

        /// Write the artifact here instead of stdout.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Validate artifact files offline.
    Validate {
        /// Structured artifact JSON file.
        structured: PathBuf,

        /// Narrative artifact JSON file to check against the structured one.
        #[arg(short, long)]
        narrative: Option<PathBuf>,

        /// Section to validate against (defaults to the artifact's own).
        #[arg(short, long)]
        section: Option<String>,

        /// Report failures without a non-zero exit.
        #[arg(long)]
        non_strict: bool,
    },

    /// List the output log for an expedient.
    History {
        /// Expedient identifier.
        expedient: String,

        /// Only this section.
        #[arg(short, long)]
        section: Option<String>,

        /// Override the database path.
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Manage the retrieval snippet corpus.
    Corpus {
        #[command(subcommand)]
        action: CorpusAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Corpus subcommands.
#[derive(Subcommand)]
pub(crate) enum CorpusAction {
    /// Add passages from a text file (one snippet per paragraph) or inline text.
    Add {
        /// Stable source identifier (e.g. lcsp-116).
        #[arg(long)]
        source_id: String,

        /// Source title shown in citations.
        #[arg(long)]
        title: String,

        /// Page number within the source.
        #[arg(long)]
        page: Option<u32>,

        /// Inline passage text.
        #[arg(short, long, conflicts_with = "file")]
        text: Option<String>,

        /// Text file to split into paragraphs.
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Override the database path.
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Search the corpus.
    Search {
        /// Query text.
        query: String,

        /// Maximum results.
        #[arg(short, long, default_value = "5")]
        limit: u32,

        /// Override the database path.
        #[arg(long)]
        db: Option<PathBuf>,
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
        0 => "celia=info",
        1 => "celia=debug",
        _ => "celia=trace",
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
    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };

    match cli.command {
        Command::Generate {
            expedient,
            section,
            doc_type,
            text,
            input,
            context,
            no_retrieval,
            out,
            persist,
            non_strict,
            max_retries,
            model,
            db,
        } => {
            let mut config = config;
            if non_strict {
                config.pipeline.strict = false;
            }
            if let Some(n) = max_retries {
                config.pipeline.max_retries = n;
            }
            if let Some(model) = model {
                config.generation.model = model;
            }
            let args = GenerateArgs {
                expedient,
                section,
                doc_type,
                user_text: read_user_text(text, input.as_deref())?,
                context: context.as_deref().map(read_snippets).transpose()?,
                no_retrieval,
                out,
                persist,
                db,
            };
            cmd_generate(&config, args).await
        }
        Command::Build {
            input,
            section,
            expedient,
            doc_type,
            out,
        } => cmd_build(&input, &section, &expedient, doc_type, out.as_deref()),
        Command::Validate {
            structured,
            narrative,
            section,
            non_strict,
        } => cmd_validate(&config, &structured, narrative.as_deref(), section.as_deref(), non_strict),
        Command::History {
            expedient,
            section,
            db,
        } => cmd_history(&config, &expedient, section.as_deref(), db).await,
        Command::Corpus { action } => match action {
            CorpusAction::Add {
                source_id,
                title,
                page,
                text,
                file,
                db,
            } => cmd_corpus_add(&config, &source_id, &title, page, text, file.as_deref(), db).await,
            CorpusAction::Search { query, limit, db } => {
                cmd_corpus_search(&config, &query, limit, db).await
            }
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(&config),
        },
    }
}

fn db_path(config: &AppConfig, flag: Option<PathBuf>) -> Result<PathBuf> {
    match flag {
        Some(path) => Ok(path),
        None => Ok(config.storage.resolved_db_path()?),
    }
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).wrap_err_with(|| format!("failed to read {}", path.display()))
}

fn read_user_text(text: Option<String>, input: Option<&Path>) -> Result<String> {
    let text = match (text, input) {
        (Some(text), _) => text,
        (None, Some(path)) => read_file(path)?,
        (None, None) => return Err(eyre!("provide the user text with --text or --input")),
    };
    if text.trim().is_empty() {
        return Err(eyre!("user text is empty"));
    }
    Ok(text)
}

fn read_snippets(path: &Path) -> Result<Vec<Snippet>> {
    let content = read_file(path)?;
    serde_json::from_str(&content)
        .wrap_err_with(|| format!("{} is not a JSON array of snippets", path.display()))
}

fn write_json(path: &Path, value: &impl serde::Serialize) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    std::fs::write(path, content).wrap_err_with(|| format!("failed to write {}", path.display()))
}

// ---------------------------------------------------------------------------
// generate
// ---------------------------------------------------------------------------

struct GenerateArgs {
    expedient: String,
    section: String,
    doc_type: DocumentType,
    user_text: String,
    context: Option<Vec<Snippet>>,
    no_retrieval: bool,
    out: Option<PathBuf>,
    persist: bool,
    db: Option<PathBuf>,
}

async fn cmd_generate(config: &AppConfig, args: GenerateArgs) -> Result<()> {
    let generator = OpenRouterGenerator::from_config(config)?;

    let needs_corpus = !args.no_retrieval && args.context.is_none();
    let storage = if args.persist || needs_corpus {
        let path = db_path(config, args.db.clone())?;
        Some(Arc::new(Storage::open(&path).await?))
    } else {
        None
    };

    let mut request = PipelineRequest::new(
        args.expedient.clone(),
        args.doc_type,
        args.section.clone(),
        args.user_text,
    );
    request.retrieved_context = args.context;
    if let Some(storage) = &storage {
        if let Some((version, hash)) = storage
            .latest_version(&args.expedient, args.doc_type, &args.section, NodeTag::Structured)
            .await?
        {
            request.version = version + 1;
            request.previous_hash = Some(hash);
        }
    }

    info!(
        expedient = %args.expedient,
        section = %args.section,
        version = request.version,
        model = generator.model(),
        "generating section"
    );

    let state = match (&storage, needs_corpus) {
        (Some(storage), true) => {
            run_pipeline(generator, CorpusRetriever::new(Arc::clone(storage)), config, request).await
        }
        _ => run_pipeline(generator, NoRetrieval, config, request).await,
    };

    print_state(&state);

    if let Some(out) = &args.out {
        write_json(out, &state)?;
        println!("  State:    {}", out.display());
    }

    if args.persist {
        match (&storage, &state.structured, &state.narrative) {
            (Some(storage), Some(structured), Some(narrative)) if state.is_persistable() => {
                storage
                    .append_pair(structured, narrative)
                    .await
                    .wrap_err_with(|| format!("version {} was not logged", structured.version))?;
                println!("  Logged:   version {}", structured.version);
            }
            _ => {
                warn!("artifacts not persisted");
                println!("  Logged:   skipped (validation failed or artifacts incomplete)");
            }
        }
    }
    println!();

    if state.validation_failed {
        return Err(eyre!(
            "validation failed: {}",
            state.validation_error_message.as_deref().unwrap_or("see diagnostics above")
        ));
    }
    Ok(())
}

async fn run_pipeline<R: Retriever>(
    generator: OpenRouterGenerator,
    retriever: R,
    config: &AppConfig,
    request: PipelineRequest,
) -> PipelineState {
    let pipeline = Pipeline::new(generator, retriever, config);
    let progress = CliProgress::new();
    pipeline.run(request, &progress).await
}

fn print_state(state: &PipelineState) {
    println!();
    let verdict = if state.validation_failed { "FAILED" } else { "OK" };
    println!("  Verdict:  {verdict}");
    println!("  Status:   {:?}", state.structured_status);
    if let Some(structured) = &state.structured {
        println!("  Version:  {}", structured.version);
        println!("  Hash:     {}", structured.hash);
    }
    if let Some(repair) = &state.repair {
        println!(
            "  Repair:   {} attempt(s), {}",
            repair.attempts,
            if repair.repaired { "data replaced" } else { "no usable output" }
        );
    }
    if let Some(result) = &state.structured_validation {
        print_result("Structured", result);
    }
    if let Some(result) = &state.narrative_validation {
        print_result("Narrative", result);
    }
    for error in &state.stage_errors {
        println!("  ! {} failed: {}", error.stage, error.message);
    }
    for notice in &state.notices {
        println!("  ~ {notice}");
    }
    if let Some(narrative) = &state.narrative {
        println!();
        println!("{}", narrative.narrative);
        println!();
    }
}

fn print_result(label: &str, result: &ValidationResult) {
    println!(
        "  {label}: {} error(s), {} warning(s)",
        result.errors().len(),
        result.warnings().len()
    );
    for error in result.errors() {
        println!("    x {error}");
    }
    for warning in result.warnings() {
        println!("    - {warning}");
    }
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
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl PipelineProgress for CliProgress {
    fn stage(&self, stage: Stage) {
        self.spinner.set_message(stage.label());
    }

    fn done(&self, _state: &PipelineState) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// Offline commands
// ---------------------------------------------------------------------------

fn cmd_build(
    input: &Path,
    section: &str,
    expedient: &str,
    doc_type: DocumentType,
    out: Option<&Path>,
) -> Result<()> {
    let raw = read_file(input)?;
    let object = extract_json(&raw)?;
    let builder = ArtifactBuilder::new(BuildContext::new(expedient, doc_type));
    let artifact = builder.build(section, &serde_json::Value::Object(object))?;

    info!(
        section,
        missing = artifact.missing.len(),
        alerts = artifact.alerts.len(),
        "artifact built"
    );

    match out {
        Some(path) => {
            write_json(path, &artifact)?;
            println!("Artifact written to {} ({})", path.display(), artifact.hash);
        }
        None => println!("{}", serde_json::to_string_pretty(&artifact)?),
    }
    Ok(())
}

fn cmd_validate(
    config: &AppConfig,
    structured: &Path,
    narrative: Option<&Path>,
    section: Option<&str>,
    non_strict: bool,
) -> Result<()> {
    let mut artifact: StructuredArtifact = serde_json::from_str(&read_file(structured)?)
        .wrap_err_with(|| format!("{} is not a structured artifact", structured.display()))?;
    let section = section.map(str::to_string).unwrap_or_else(|| artifact.section_id.clone());

    let validator = Validator::new(ValidatorConfig::from(config));
    let (structured_result, narrative_result) = match narrative {
        Some(path) => {
            let narrative: NarrativeArtifact = serde_json::from_str(&read_file(path)?)
                .wrap_err_with(|| format!("{} is not a narrative artifact", path.display()))?;
            let (structured_result, narrative_result) =
                validator.validate_pair(&mut artifact, &narrative, &section);
            (structured_result, Some(narrative_result))
        }
        None => (validator.validate_structured(&mut artifact, &section), None),
    };

    let mut valid = structured_result.is_valid();
    let mut report = serde_json::json!({ "structured": serde_json::to_value(&structured_result)? });
    if let Some(narrative_result) = &narrative_result {
        valid &= narrative_result.is_valid();
        report["narrative"] = serde_json::to_value(narrative_result)?;
    }

    println!("{}", serde_json::to_string_pretty(&report)?);

    if !valid && config.pipeline.strict && !non_strict {
        return Err(eyre!("validation failed"));
    }
    Ok(())
}

async fn cmd_history(
    config: &AppConfig,
    expedient: &str,
    section: Option<&str>,
    db: Option<PathBuf>,
) -> Result<()> {
    let storage = Storage::open_readonly(&db_path(config, db)?).await?;
    let records = storage.list_outputs(expedient, section).await?;

    if records.is_empty() {
        println!("No outputs recorded for {expedient}.");
        return Ok(());
    }

    println!("{:<8} {:>7}  {:<10}  {:<16}  {}", "SECTION", "VERSION", "NODE", "HASH", "CREATED");
    for record in &records {
        let short_hash: String = record.hash.chars().take(16).collect();
        println!(
            "{:<8} {:>7}  {:<10}  {:<16}  {}",
            record.section_id,
            record.version,
            record.node.as_str(),
            short_hash,
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

async fn cmd_corpus_add(
    config: &AppConfig,
    source_id: &str,
    title: &str,
    page: Option<u32>,
    text: Option<String>,
    file: Option<&Path>,
    db: Option<PathBuf>,
) -> Result<()> {
    let passages: Vec<String> = match (text, file) {
        (Some(text), _) => vec![text],
        (None, Some(path)) => read_file(path)?
            .split("\n\n")
            .map(|p| p.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|p| !p.is_empty())
            .collect(),
        (None, None) => return Err(eyre!("provide the passage with --text or --file")),
    };
    if passages.is_empty() {
        return Err(eyre!("no passages to add"));
    }

    let storage = Storage::open(&db_path(config, db)?).await?;
    for passage in &passages {
        storage.insert_snippet(source_id, title, page, passage).await?;
    }
    info!(source_id, count = passages.len(), "corpus updated");
    println!("Added {} passage(s) from {title}.", passages.len());
    Ok(())
}

async fn cmd_corpus_search(
    config: &AppConfig,
    query: &str,
    limit: u32,
    db: Option<PathBuf>,
) -> Result<()> {
    let storage = Storage::open_readonly(&db_path(config, db)?).await?;
    let snippets = storage.search_snippets(query, limit).await?;

    if snippets.is_empty() {
        println!("No matches.");
        return Ok(());
    }
    for (i, snippet) in snippets.iter().enumerate() {
        let page = snippet.page.map(|p| format!(", p. {p}")).unwrap_or_default();
        println!(
            "[{}] {} ({}{page})  score {:.3}",
            i + 1,
            snippet.source_title,
            snippet.source_id,
            snippet.score
        );
        println!("    {}", snippet.text);
    }
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}
