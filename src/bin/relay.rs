//! CLI binary for render-relay.
//!
//! A thin shim over the library crate: builds the pipeline from environment
//! configuration and runs one preview, render-and-publish or detection job.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use render_relay::convert::spreadsheet;
use render_relay::dispatch::{Payload, RenderRequest};
use render_relay::publish::{BotApiDestination, LoggingPublicationSink, PublishStats};
use render_relay::watermark::{Compositor, TileCache, WatermarkOverrides};
use render_relay::{
    BlobStore, Converters, Dispatcher, LibreOfficeConverter, MemoryBlobStore, OfficeConverter,
    PageSelection, PdfiumRasterizer, PipelineConfig, PreviewGenerator, PublishProgressCallback,
    Publisher, TaskExecutor, TaskOutput, TaskRequest,
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
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

// ── CLI progress callback using indicatif ────────────────────────────────────

const TICKS: [&str; 11] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

/// Terminal progress for a render-and-publish batch.
struct CliProgressCallback {
    bar: ProgressBar,
    failed: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Converting");
        bar.set_message("Rendering pages…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            failed: AtomicUsize::new(0),
        })
    }
}

impl PublishProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&TICKS);
        self.bar.set_length(total as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Publishing");
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Publishing {total} pages…"))
        ));
    }

    fn on_page_published(&self, page_index: usize, _total: usize, filename: &str) {
        self.bar.println(format!(
            "  {} Page {:>3}  {}",
            green("✓"),
            page_index,
            dim(filename)
        ));
        self.bar.inc(1);
    }

    fn on_page_failed(&self, page_index: usize, _total: usize, error: &str) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        let msg: String = if error.chars().count() > 80 {
            error.chars().take(79).chain(['…']).collect()
        } else {
            error.to_string()
        };
        self.bar
            .println(format!("  {} Page {:>3}  {}", red("✗"), page_index, red(&msg)));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, total: usize, published: usize) {
        self.bar.finish_and_clear();
        let failed = total.saturating_sub(published);
        if failed == 0 {
            eprintln!("{} {} pages published", green("✔"), bold(&published.to_string()));
        } else {
            eprintln!(
                "{} {}/{} pages published  ({} failed)",
                if published == 0 { red("✘") } else { cyan("⚠") },
                bold(&published.to_string()),
                total,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Previews of a Word document into ./out
  relay preview memo.docx --out out

  # Publish pages 1 and 3 of a PDF with a watermark
  relay publish report.pdf --destination -1001234567890 --watermark CONFIDENTIAL --pages 1,3

  # Table regions a spreadsheet would be split into
  relay detect budget.xlsx

ENVIRONMENT VARIABLES:
  BOT_TOKEN               Bot API token used by `publish`
  RENDER_DPI              Rasterisation DPI (default 300)
  PREVIEW_MAX_DIM         Longest side of preview JPEGs (default 1600)
  OFFICE_BINARY           LibreOffice binary (default: search PATH)
  OFFICE_TIMEOUT_SECS     Office conversion time budget (default 240)
  PDFIUM_LIB_PATH         Directory containing libpdfium
  WATERMARK_*             Watermark defaults (opacity, step, angle, color, fonts)
  RUST_LOG                Log filter (default info)
"#;

/// Render documents to watermarked pages and publish them.
#[derive(Parser, Debug)]
#[command(
    name = "relay",
    version,
    about = "Render documents to watermarked PNG pages and publish them",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "RELAY_VERBOSE")]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate preview JPEGs and full-resolution PNGs for a document.
    Preview {
        file: PathBuf,

        /// Declared format tag (pdf, docx, xlsx, png, …). Detected from the suffix when absent.
        #[arg(long)]
        format: Option<String>,

        /// Directory the images are written to.
        #[arg(long, env = "RELAY_OUT", default_value = "previews")]
        out: PathBuf,
    },

    /// Render a document and publish its pages to a destination.
    Publish {
        file: PathBuf,

        /// Destination (chat) id.
        #[arg(long, env = "RELAY_DESTINATION", allow_hyphen_values = true)]
        destination: i64,

        /// Watermark text tiled over every page.
        #[arg(long, env = "RELAY_WATERMARK")]
        watermark: Option<String>,

        /// Pages to publish: all, 5, 2-4 or 1,3,5.
        #[arg(long, default_value = "all")]
        pages: String,

        /// Bot API token.
        #[arg(long, env = "BOT_TOKEN", hide_env_values = true)]
        token: String,

        /// Disable the progress bar.
        #[arg(long, env = "RELAY_NO_PROGRESS")]
        no_progress: bool,
    },

    /// Print the table regions detected in a spreadsheet.
    Detect { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = Arc::new(PipelineConfig::from_env().context("Invalid configuration")?);

    match cli.command {
        Command::Preview { file, format, out } => preview(config, &file, format, &out).await,
        Command::Publish {
            file,
            destination,
            watermark,
            pages,
            token,
            no_progress,
        } => {
            let pages = parse_pages(&pages)?;
            publish(config, &file, destination, watermark, pages, token, no_progress).await
        }
        Command::Detect { file } => detect(&file).await,
    }
}

fn converters(config: &PipelineConfig) -> Converters {
    let office = match LibreOfficeConverter::locate(config.office_binary.as_deref(), config.office_timeout)
    {
        Ok(office) => Some(Arc::new(office) as Arc<dyn OfficeConverter>),
        Err(e) => {
            warn!(error = %e, "Office conversion disabled");
            None
        }
    };
    Converters::new(
        Some(Arc::new(PdfiumRasterizer::new(config.pdfium_lib_path.clone()))),
        office,
    )
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", path.display()))
}

async fn preview(
    config: Arc<PipelineConfig>,
    file: &Path,
    format: Option<String>,
    out: &Path,
) -> Result<()> {
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let filename = file_name(file)?;

    let store = Arc::new(MemoryBlobStore::default());
    let generator = PreviewGenerator::new(converters(&config), store.clone(), config);
    let result = generator
        .generate(bytes, &filename, format.as_deref())
        .await
        .context("Preview failed")?;

    tokio::fs::create_dir_all(out)
        .await
        .with_context(|| format!("Failed to create {}", out.display()))?;
    for page in &result.pages {
        let png = store.load(&page.fullres_key, true).await?;
        let jpeg = store.load(&page.preview_key, true).await?;
        let stem = page.filename.trim_end_matches(".png");
        tokio::fs::write(out.join(&page.filename), png).await?;
        tokio::fs::write(out.join(format!("{stem}.jpg")), jpeg).await?;
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("Failed to serialise result")?
    );
    eprintln!(
        "{} {} pages  →  {}",
        green("✔"),
        result.pages.len(),
        bold(&out.display().to_string())
    );
    Ok(())
}

async fn publish(
    config: Arc<PipelineConfig>,
    file: &Path,
    destination_id: i64,
    watermark: Option<String>,
    pages: PageSelection,
    token: String,
    no_progress: bool,
) -> Result<()> {
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let filename = file_name(file)?;

    let destination = BotApiDestination::new(token, config.delivery_timeout)?;
    let stats = Arc::new(PublishStats::from_env());
    let publisher = Publisher::new(
        Arc::new(destination),
        config.publish_backoff.clone(),
        Arc::new(LoggingPublicationSink),
        stats.clone(),
    );
    let compositor = Compositor::new(Arc::new(TileCache::new(config.tile_cache_capacity)));
    let mut executor = TaskExecutor::new(
        config.clone(),
        Arc::new(MemoryBlobStore::default()),
        converters(&config),
        Arc::new(compositor),
        Arc::new(publisher),
    );
    if !no_progress {
        executor = executor.with_progress(CliProgressCallback::new());
    }

    let dispatcher = Dispatcher::start(config.dispatch.clone(), Arc::new(executor));
    let ticket = dispatcher.submit(TaskRequest::Render(RenderRequest {
        destination_id,
        payload: Payload::inline(&bytes),
        filename,
        format: None,
        mime: None,
        watermark,
        overrides: WatermarkOverrides::default(),
        pages,
    }))?;
    let output = ticket.wait().await;
    dispatcher.shutdown().await;
    stats.flush();

    match output.context("Publishing failed")? {
        TaskOutput::Batch(batch) => {
            for failure in &batch.failures {
                eprintln!("  {} {}", red("✗"), failure);
            }
            if !batch.ok {
                bail!(
                    "{} of {} pages were not published",
                    batch.failures.len(),
                    batch.pages_selected
                );
            }
        }
        TaskOutput::Published(record) => {
            eprintln!("{} published as message {}", green("✔"), record.message_id);
        }
        other => bail!("Unexpected task output: {other:?}"),
    }
    Ok(())
}

async fn detect(file: &Path) -> Result<()> {
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let analysis = tokio::task::spawn_blocking(move || spreadsheet::analyze(&bytes))
        .await
        .context("Detection task panicked")??;

    for sheet in &analysis.sheets {
        println!(
            "{} {}",
            bold(&format!("Sheet {}", sheet.sheet_index)),
            dim(&sheet.sheet_name)
        );
        if sheet.regions.is_empty() {
            println!("  {}", dim("no tables"));
        }
        for r in &sheet.regions {
            println!(
                "  rows {:>4}–{:<4}  cols {:>3}–{:<3}  ({}×{})",
                r.min_row,
                r.max_row,
                r.min_col,
                r.max_col,
                r.height(),
                r.width()
            );
        }
    }
    eprintln!(
        "{} {} regions in {} sheets",
        green("✔"),
        analysis.regions_total(),
        analysis.sheets.len()
    );
    Ok(())
}

/// Parse `--pages` into a 1-based [`PageSelection`].
fn parse_pages(s: &str) -> Result<PageSelection> {
    let s = s.trim().to_lowercase();
    if s == "all" {
        return Ok(PageSelection::All);
    }

    let mut pages = Vec::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if let Some((start, end)) = part.split_once('-') {
            let start: usize = start.trim().parse().context("Invalid start page in range")?;
            let end: usize = end.trim().parse().context("Invalid end page in range")?;
            if start < 1 || start > end {
                bail!("Invalid page range '{part}'");
            }
            pages.extend(start..=end);
        } else {
            let page: usize = part
                .parse()
                .with_context(|| format!("Invalid page number: '{part}'"))?;
            if page < 1 {
                bail!("Pages are 1-indexed, minimum is 1 (got {page})");
            }
            pages.push(page);
        }
    }
    if pages.is_empty() {
        bail!("No pages selected");
    }
    Ok(PageSelection::Set(pages))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pages_accepts_lists_and_ranges() {
        assert_eq!(parse_pages("all").unwrap(), PageSelection::All);
        assert_eq!(parse_pages("3").unwrap(), PageSelection::Set(vec![3]));
        assert_eq!(
            parse_pages("1, 4-6").unwrap(),
            PageSelection::Set(vec![1, 4, 5, 6])
        );
        assert!(parse_pages("0").is_err());
        assert!(parse_pages("5-2").is_err());
        assert!(parse_pages("x").is_err());
    }
}
