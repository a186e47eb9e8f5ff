//! CLI binary for manifest-extract.
//!
//! A thin shim over the library crate: maps flags to `ExtractionConfig`,
//! keeps state in a JSON store snapshot between invocations, and prints
//! results as a table or JSON.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use manifest_extract::pipeline::{format, input};
use manifest_extract::{
    CancelFlag, ExtractionConfig, ExtractionMode, ExtractionProgressCallback, Extractor, ManifestEntry,
    MemoryStore, ProgressCallback, RunSummary,
};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar over batches. Batches may finish out of order when
/// `--concurrency` is above 1.
struct CliProgressCallback {
    bar: ProgressBar,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Preparing");
        bar.set_message("Opening PDF…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            errors: AtomicUsize::new(0),
        })
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_run_start(&self, total_batches: usize, total_pages: usize) {
        self.bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {pos:>3}/{len} batches  \
                 ⏱ {elapsed_precise}  ETA {eta_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS),
        );
        self.bar.set_length(total_batches as u64);
        self.bar.set_prefix("Extracting");
        self.bar.reset_eta();
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!(
                "Extracting {total_pages} pages in {total_batches} batches…"
            ))
        ));
    }

    fn on_batch_start(&self, batch: usize, _total: usize, pages: &[usize]) {
        self.bar
            .set_message(format!("batch {batch} (pages {})", page_span(pages)));
    }

    fn on_batch_complete(&self, batch: usize, total: usize, pages: &[usize], candidates: usize) {
        self.bar.println(format!(
            "  {} Batch {:>3}/{:<3}  pages {:<9}  {}",
            green("✓"),
            batch,
            total,
            page_span(pages),
            dim(&format!("{candidates} candidates")),
        ));
        self.bar.inc(1);
    }

    fn on_batch_error(&self, batch: usize, total: usize, pages: &[usize], error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let msg = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Batch {:>3}/{:<3}  pages {:<9}  {}",
            red("✗"),
            batch,
            total,
            page_span(pages),
            red(&msg),
        ));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, stored: usize, dropped: usize, failed_batches: usize) {
        self.bar.finish_and_clear();
        let mark = if failed_batches == 0 {
            green("✔")
        } else {
            cyan("⚠")
        };
        eprintln!(
            "{} {} entries stored  ({} dropped, {} batches failed)",
            mark,
            bold(&stored.to_string()),
            dropped,
            if failed_batches == 0 {
                failed_batches.to_string()
            } else {
                red(&failed_batches.to_string())
            },
        );
    }
}

fn page_span(pages: &[usize]) -> String {
    match (pages.first(), pages.last()) {
        (Some(a), Some(b)) if a != b => format!("{a}-{b}"),
        (Some(a), _) => a.to_string(),
        _ => "-".to_string(),
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract every page of a manifest into the default store
  manifest-extract extract manifest.pdf

  # Pages 4 to 9 only, two batches in flight, sending the PDF itself (Gemini reads PDFs inline)
  manifest-extract extract --start-page 4 --end-page 9 --concurrency 2 \
      --mode document --provider gemini --model gemini-2.5-flash manifest.pdf

  # Download and extract
  manifest-extract extract https://example.org/manifests/2024-12.pdf

  # Re-run extraction on a stored document (idempotent)
  manifest-extract rerun 3

  # Preview what text mode sends (no API key needed)
  manifest-extract inspect manifest.pdf

  # Listings
  manifest-extract documents
  manifest-extract entries --document 3 --json

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  MANIFEST_STORE          Store snapshot path
  PDFIUM_LIB_PATH         Path to an existing libpdfium, skips auto-download
"#;

/// Extract cargo-manifest records from PDF documents with LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "manifest-extract",
    version,
    about = "Extract cargo-manifest records from PDF documents with LLMs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON snapshot holding documents and manifest entries.
    #[arg(long, global = true, env = "MANIFEST_STORE", default_value = "manifest-store.json")]
    store: PathBuf,

    /// LLM model ID (e.g. gpt-4.1, gpt-4.1-mini, claude-sonnet-4-20250514).
    #[arg(long, global = true, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, global = true, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// What each request carries: text (page text + tables) or document (a PDF of the batch,
    /// gemini / vertex-ai providers only).
    #[arg(long, global = true, env = "MANIFEST_MODE", default_value = "text")]
    mode: ExtractionMode,

    /// Pages per external call.
    #[arg(long, global = true, env = "MANIFEST_BATCH_SIZE", default_value_t = 3)]
    batch_size: usize,

    /// Batches in flight at once.
    #[arg(short, long, global = true, env = "MANIFEST_CONCURRENCY", default_value_t = 1)]
    concurrency: usize,

    /// Retries per batch on rate limits, transport errors and timeouts.
    #[arg(long, global = true, env = "MANIFEST_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Per-call LLM timeout in seconds.
    #[arg(long, global = true, env = "MANIFEST_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// HTTP download timeout in seconds.
    #[arg(long, global = true, env = "MANIFEST_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Max LLM output tokens per batch.
    #[arg(long, global = true, env = "MANIFEST_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, global = true, env = "MANIFEST_TEMPERATURE", default_value_t = 0.0)]
    temperature: f32,

    /// PDF user password for encrypted documents.
    #[arg(long, global = true, env = "MANIFEST_PASSWORD")]
    password: Option<String>,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, global = true, env = "MANIFEST_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Print JSON instead of tables.
    #[arg(long, global = true, env = "MANIFEST_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, global = true, env = "MANIFEST_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "MANIFEST_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors and results.
    #[arg(short, long, global = true, env = "MANIFEST_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a PDF (path or URL) and extract its manifest entries.
    Extract {
        input: String,
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Extract a stored document again.
    Rerun {
        document: i64,
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Print the page text and tables text mode would send. No inference.
    Inspect {
        input: String,
        #[command(flatten)]
        range: RangeArgs,
    },
    /// List stored documents, newest first.
    Documents,
    /// List stored manifest entries.
    Entries {
        /// Only entries of this document.
        #[arg(long)]
        document: Option<i64>,
    },
    /// Write a stored document, or some of its pages, to a PDF file.
    Export {
        document: i64,
        #[command(flatten)]
        range: RangeArgs,
        /// Output file (default: derived from the document name).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete a stored document and its entries.
    Delete { document: i64 },
}

#[derive(clap::Args, Debug, Clone, Copy)]
struct RangeArgs {
    /// First page (1-based). Default: 1.
    #[arg(long)]
    start_page: Option<usize>,
    /// Last page (inclusive). Default: last page of the document.
    #[arg(long)]
    end_page: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs while it is visible.
    let runs_batches = matches!(cli.command, Command::Extract { .. } | Command::Rerun { .. });
    let show_progress = runs_batches && !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn ExtractionProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress).await?;

    // `inspect` never touches the persistent store.
    if let Command::Inspect { input, range } = &cli.command {
        return inspect(&cli, config, input, *range).await;
    }

    let store = Arc::new(
        MemoryStore::load_json(&cli.store)
            .await
            .with_context(|| format!("Failed to load store {}", cli.store.display()))?,
    );
    let extractor = Extractor::with_store(config, Arc::clone(&store));

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{} interrupted, finishing batches in flight…", cyan("⚠"));
                cancel.cancel();
            }
        });
    }

    let mutated = match &cli.command {
        Command::Extract { input, range } => {
            let loaded = input::load_input(input, cli.download_timeout)
                .await
                .context("Failed to load input")?;
            let summary = extractor
                .upload(loaded.name, loaded.bytes, range.start_page, range.end_page, &cancel)
                .await;
            // A failed run may still have created the document.
            store.save_json(&cli.store).await.context("Failed to save store")?;
            print_summary(&cli, &summary.context("Extraction failed")?)?;
            false
        }
        Command::Rerun { document, range } => {
            let summary = extractor
                .extract_document(*document, range.start_page, range.end_page, &cancel)
                .await
                .context("Extraction failed")?;
            print_summary(&cli, &summary)?;
            true
        }
        Command::Documents => {
            let docs = extractor.list_documents().await?;
            if cli.json {
                print_json(&docs)?;
            } else {
                println!("{:>5}  {:<10}  {:>5}  NAME", "ID", "CREATED", "PAGES");
                for d in docs {
                    println!("{:>5}  {}  {:>5}  {}", d.id, d.created_on, d.page_count, d.name);
                }
            }
            false
        }
        Command::Entries { document } => {
            let entries = match document {
                Some(id) => extractor.entries_for_document(*id).await?,
                None => extractor.list_entries().await?,
            };
            if cli.json {
                print_json(&entries)?;
            } else {
                print_entries(&entries);
            }
            false
        }
        Command::Export {
            document,
            range,
            output,
        } => {
            let doc = extractor.document(*document).await?;
            let bytes = if range.start_page.is_none() && range.end_page.is_none() {
                doc.content
            } else {
                extractor
                    .export_pages(*document, range.start_page, range.end_page)
                    .await?
            };
            let path = output.clone().unwrap_or_else(|| {
                let first = range.start_page.unwrap_or(1);
                let last = range.end_page.unwrap_or(doc.page_count);
                let pages: Vec<usize> = (first..=last.max(first)).collect();
                input::default_export_path(&doc.name, &pages)
            });
            write_file(&path, &bytes).await?;
            if !cli.quiet {
                eprintln!("{} wrote {} bytes to {}", green("✔"), bytes.len(), bold(&path.display().to_string()));
            }
            false
        }
        Command::Delete { document } => {
            extractor.delete_document(*document).await?;
            if !cli.quiet {
                eprintln!("{} deleted document {}", green("✔"), document);
            }
            true
        }
        Command::Inspect { .. } => false,
    };

    if mutated {
        store.save_json(&cli.store).await.context("Failed to save store")?;
    }
    Ok(())
}

/// Map CLI args to `ExtractionConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ExtractionConfig> {
    let mut builder = ExtractionConfig::builder()
        .batch_size(cli.batch_size)
        .mode(cli.mode)
        .concurrency(cli.concurrency)
        .max_retries(cli.max_retries)
        .api_timeout_secs(cli.api_timeout)
        .download_timeout_secs(cli.download_timeout)
        .max_tokens(cli.max_tokens)
        .temperature(cli.temperature);

    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(ref password) = cli.password {
        builder = builder.password(password);
    }
    if let Some(ref path) = cli.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

async fn inspect(cli: &Cli, config: ExtractionConfig, source: &str, range: RangeArgs) -> Result<()> {
    let loaded = input::load_input(source, cli.download_timeout)
        .await
        .context("Failed to load input")?;
    let scratch = Extractor::with_store(config, Arc::new(MemoryStore::new()));
    let doc = scratch.import_document(loaded.name, loaded.bytes).await?;
    let segments = scratch
        .inspect(doc.id, range.start_page, range.end_page)
        .await
        .context("Failed to extract page text")?;

    if cli.json {
        print_json(&segments)?;
    } else {
        let mut out = io::stdout().lock();
        out.write_all(format::join_segments(&segments).as_bytes())
            .context("Failed to write to stdout")?;
        out.write_all(b"\n").ok();
        if !cli.quiet {
            eprintln!("{} {} pages", dim("File:"), doc.page_count);
        }
    }
    Ok(())
}

fn print_summary(cli: &Cli, summary: &RunSummary) -> Result<()> {
    if cli.json {
        return print_json(summary);
    }
    print_entries(&summary.inserted);
    if cli.quiet {
        return Ok(());
    }
    eprintln!(
        "{}  document {}  {}/{} pages processed  {} stored  {} dropped  {} in store  {}ms{}",
        if summary.failures.is_empty() {
            green("✔")
        } else {
            cyan("⚠")
        },
        summary.document_id,
        summary.processed_pages,
        summary.total_pages,
        summary.inserted.len(),
        summary.dropped,
        summary.total_entries,
        summary.duration_ms,
        if summary.cancelled { "  (cancelled)" } else { "" },
    );
    for failure in &summary.failures {
        eprintln!(
            "   {} batch {} (pages {}): {}",
            red("✗"),
            failure.batch_index + 1,
            page_span(&failure.pages),
            failure.error
        );
    }
    Ok(())
}

fn print_entries(entries: &[ManifestEntry]) {
    let opt = |s: &Option<String>| s.clone().unwrap_or_else(|| "-".to_string());
    println!(
        "{:>5}  {:>4}  {:<24}  {:<12}  {:<24}  {:>12}  {:>14}  DATE",
        "ID", "PAGE", "NAME", "FLAG", "PRODUCTS", "VOLUME", "WEIGHT"
    );
    for e in entries {
        println!(
            "{:>5}  {:>4}  {:<24}  {:<12}  {:<24}  {:>12}  {:>14}  {}",
            e.id,
            e.page,
            opt(&e.name),
            opt(&e.flag),
            opt(&e.products),
            e.volume.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string()),
            e.weight,
            e.date.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string()),
        );
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialise output")?
    );
    Ok(())
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}
