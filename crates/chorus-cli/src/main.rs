//! CLI binary for running Chorus batches and inspecting their results.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use serde_json::Value;

use chorus_dispatch::{
    BatchReport, CategoryCatalog, Dispatcher, JsonlSink, RecordFilter, TopicPromptSource,
};
use chorus_llm::{extract_for, ChorusConfig, DynProvider, GeminiAdapter, ProviderRegistry};
use chorus_types::ParamMap;

#[derive(Parser)]
#[command(name = "chorus", version, about = "Send one prompt to many LLM providers and record every answer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate prompts from a category catalog and fan each out to every provider
    Run {
        /// Category catalog JSON ({"data": [{"category", "topics"}]})
        #[arg(short, long)]
        categories: PathBuf,

        /// JSON-lines file the records are appended to
        #[arg(short, long)]
        records: PathBuf,

        /// Restrict the batch to these provider ids (repeatable; default: all configured)
        #[arg(short, long = "provider")]
        providers: Vec<String>,

        /// Parameter overlay, `<provider>:<key>=<json>`; dotted keys nest
        #[arg(long = "set")]
        overlays: Vec<String>,

        /// Number of batches to run
        #[arg(short, long, default_value = "1")]
        batches: u32,

        /// Per-call timeout in seconds (overrides CHORUS_CALL_TIMEOUT_SECS)
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Maximum simultaneous provider calls (default: one per provider)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Seed for prompt generation
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Send one prompt to a single provider and print what came back
    Probe {
        /// Provider id, as listed by `chorus providers`
        provider: String,

        /// Prompt text
        prompt: String,

        /// Parameter overlay, `<provider>:<key>=<json>`; dotted keys nest
        #[arg(long = "set")]
        overlays: Vec<String>,
    },

    /// Print stored records as JSON lines
    Records {
        /// JSON-lines records file
        #[arg(short, long)]
        records: PathBuf,

        /// Only records whose field equals the value, `<field>=<value>` (repeatable)
        #[arg(short, long = "where")]
        conditions: Vec<String>,
    },

    /// List the providers configured from the environment
    Providers,

    /// Count tokens for a text with the Gemini countTokens endpoint
    Tokens {
        /// Text to count
        text: String,

        /// Gemini model to ask
        #[arg(short, long)]
        model: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays machine-readable
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            categories,
            records,
            providers,
            overlays,
            batches,
            timeout_secs,
            concurrency,
            seed,
        } => {
            cmd_run(RunArgs {
                categories: &categories,
                records: &records,
                providers: &providers,
                overlays: &overlays,
                batches,
                timeout_secs,
                concurrency,
                seed,
            })
            .await?;
        }
        Commands::Probe {
            provider,
            prompt,
            overlays,
        } => {
            cmd_probe(&provider, &prompt, &overlays).await?;
        }
        Commands::Records {
            records,
            conditions,
        } => {
            cmd_records(&records, &conditions).await?;
        }
        Commands::Providers => {
            cmd_providers()?;
        }
        Commands::Tokens { text, model } => {
            cmd_tokens(&text, model.as_deref()).await?;
        }
    }

    Ok(())
}

fn load_config(timeout_secs: Option<u64>) -> anyhow::Result<ChorusConfig> {
    let mut config = ChorusConfig::from_env()?;
    if let Some(secs) = timeout_secs {
        if secs == 0 {
            bail!("--timeout-secs must be greater than zero");
        }
        config = config.with_call_timeout(Duration::from_secs(secs));
    }
    Ok(config)
}

/// Parse `--set` flags into one overlay per provider id.
///
/// The provider id ends at the first `:` (ids themselves contain dots). The
/// value is JSON when it parses as JSON, otherwise a plain string.
fn parse_overlays(specs: &[String]) -> anyhow::Result<HashMap<String, ParamMap>> {
    let mut overlays: HashMap<String, ParamMap> = HashMap::new();
    for spec in specs {
        let (provider, assignment) = spec
            .split_once(':')
            .with_context(|| format!("overlay '{spec}' must look like <provider>:<key>=<json>"))?;
        let (key, raw) = assignment
            .split_once('=')
            .with_context(|| format!("overlay '{spec}' is missing '='"))?;
        if provider.is_empty() || key.is_empty() || key.split('.').any(str::is_empty) {
            bail!("overlay '{spec}' has an empty provider or key");
        }

        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        let segments: Vec<&str> = key.split('.').collect();
        insert_at(overlays.entry(provider.to_string()).or_default(), &segments, value);
    }
    Ok(overlays)
}

/// Set `value` at a dotted path, creating (or replacing non-object) parents.
/// A `null` leaf is kept so the merge onto defaults can remove that key.
fn insert_at(map: &mut ParamMap, segments: &[&str], value: Value) {
    match segments {
        [] => {}
        [leaf] => {
            map.insert(leaf.to_string(), value);
        }
        [parent, rest @ ..] => {
            let child = map
                .entry(parent.to_string())
                .or_insert_with(|| Value::Object(ParamMap::new()));
            if !child.is_object() {
                *child = Value::Object(ParamMap::new());
            }
            if let Value::Object(inner) = child {
                insert_at(inner, rest, value);
            }
        }
    }
}

struct RunArgs<'a> {
    categories: &'a Path,
    records: &'a Path,
    providers: &'a [String],
    overlays: &'a [String],
    batches: u32,
    timeout_secs: Option<u64>,
    concurrency: Option<usize>,
    seed: Option<u64>,
}

async fn cmd_run(args: RunArgs<'_>) -> anyhow::Result<()> {
    let config = load_config(args.timeout_secs)?;
    let registry = ProviderRegistry::from_config(&config)?;
    let adapters = registry.select(args.providers)?;

    let catalog = CategoryCatalog::load(args.categories)
        .await
        .with_context(|| format!("loading categories from {}", args.categories.display()))?;
    let mut source = TopicPromptSource::new(catalog);
    if let Some(seed) = args.seed {
        source = source.with_seed(seed);
    }

    let sink = Arc::new(JsonlSink::open(args.records).await?);
    let mut dispatcher = Dispatcher::from_config(sink, &config);
    for (provider, overlay) in parse_overlays(args.overlays)? {
        if registry.get(&provider).is_none() {
            bail!("overlay names unknown provider '{provider}'");
        }
        dispatcher = dispatcher.with_overlay(provider, overlay);
    }
    if let Some(limit) = args.concurrency {
        dispatcher = dispatcher.with_concurrency(limit);
    }

    println!("Providers: {}", provider_list(&adapters));
    println!("Records: {}", args.records.display());

    let mut sink_failures = 0;
    for n in 1..=args.batches {
        let report = dispatcher.run_prompt_source(&source, &adapters).await?;
        tracing::info!(
            batch = n,
            batch_id = %report.batch_id,
            ok = report.successes(),
            failed = report.failures(),
            sink_failures = report.sink_failures.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Batch finished"
        );
        print_report(n, &report);
        sink_failures += report.sink_failures.len();
    }

    if sink_failures > 0 {
        bail!("{sink_failures} record(s) could not be written");
    }
    Ok(())
}

/// Ids of the adapters a run will call, in call order.
fn provider_list(adapters: &[DynProvider]) -> String {
    adapters.iter().map(DynProvider::id).collect::<Vec<_>>().join(", ")
}

fn print_report(n: u32, report: &BatchReport) {
    println!(
        "\nBatch {} ({}) finished in {:.3}s: {} ok, {} failed",
        n,
        report.batch_id,
        report.elapsed.as_secs_f64(),
        report.successes(),
        report.failures()
    );
    for outcome in &report.outcomes {
        let status = match &outcome.error {
            Some(error) => format!("ERROR {error}"),
            None => outcome.extracted.to_string(),
        };
        println!(
            "  {:<32} {:>8.3}s  {}",
            outcome.provider,
            outcome.elapsed.as_secs_f64(),
            status
        );
    }
    for failure in &report.sink_failures {
        println!("  [sink] {}: {}", failure.provider, failure.message);
    }
}

async fn cmd_probe(provider: &str, prompt: &str, overlays: &[String]) -> anyhow::Result<()> {
    let config = load_config(None)?;
    let registry = ProviderRegistry::from_config(&config)?;
    let adapter = registry
        .get(provider)
        .with_context(|| format!("unknown provider '{provider}' (see `chorus providers`)"))?;
    let overlay = parse_overlays(overlays)?
        .remove(provider)
        .unwrap_or_default();

    let started = Instant::now();
    let call = tokio::time::timeout(config.call_timeout, adapter.invoke(prompt, &overlay))
        .await
        .with_context(|| format!("{provider} did not answer within {:?}", config.call_timeout))??;

    println!("Request: {}", call.request_body);
    println!("Status: {}", call.response.status);
    println!(
        "Call time: {:.3}s (total {:.3}s)",
        call.elapsed.as_secs_f64(),
        started.elapsed().as_secs_f64()
    );
    if let Some(error) = adapter.application_error(&call.response.body) {
        println!("Provider error: {error}");
    }
    println!("Response: {}", extract_for(adapter.response_path(), &call.response.body));
    Ok(())
}

async fn cmd_records(path: &Path, conditions: &[String]) -> anyhow::Result<()> {
    if !path.exists() {
        bail!("records file {} does not exist", path.display());
    }
    let mut filter = RecordFilter::new();
    for condition in conditions {
        let (field, value) = condition
            .split_once('=')
            .with_context(|| format!("condition '{condition}' must look like <field>=<value>"))?;
        filter = filter.field(field, value);
    }

    let sink = JsonlSink::open(path).await?;
    for record in sink.records(&filter).await? {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}

fn cmd_providers() -> anyhow::Result<()> {
    let config = load_config(None)?;
    let registry = ProviderRegistry::from_config(&config)?;
    println!("Configured providers:");
    for provider in registry.providers() {
        let path = provider
            .response_path()
            .map(ToString::to_string)
            .unwrap_or_else(|| "(no extraction path)".to_string());
        println!(
            "  {:<32} {:<48} {}",
            provider.id(),
            provider.config().endpoint.base_url,
            path
        );
    }
    Ok(())
}

async fn cmd_tokens(text: &str, model: Option<&str>) -> anyhow::Result<()> {
    let config = load_config(None)?;
    let mut gemini = GeminiAdapter::new(&config)?;
    if let Some(model) = model {
        gemini = gemini.with_model(model);
    }
    let count = gemini.count_tokens(text).await?;
    println!("{count}");
    Ok(())
}
