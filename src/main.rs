mod boxes;
mod config;
mod crop;
mod document;
mod error;
mod fields;
mod gemini;
mod pipeline;
mod rasterize;
mod receipt;
mod receipt_db;

use clap::{Parser, Subcommand};
use config::Config;
use crop::CropOutcome;
use document::Document;
use error::ReceiptError;
use gemini::GeminiClient;
use pipeline::IngestSource;
use rasterize::Pdftoppm;
use receipt_db::ReceiptStore;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "receipt-ingest",
    version,
    about = "Extract, crop and validate scanned point-of-sale receipts"
)]
struct Cli {
    /// Path to a TOML config file (default: .config/receipt_ingest.toml if present)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Locate every receipt in a scanned batch and save one image per receipt
    Crop {
        /// Path to the PDF (or a single page image)
        input_file: PathBuf,

        /// Directory for the cropped images
        #[arg(short = 'O', long = "out", value_name = "DIR")]
        out: Option<PathBuf>,

        /// Padding on each side, in normalized units (10 = 1% of the page)
        #[arg(long)]
        padding: Option<f64>,

        /// Rasterization resolution
        #[arg(long)]
        dpi: Option<u32>,
    },
    /// Transcribe every receipt into structured JSON
    Extract {
        /// Path to the PDF
        input_file: PathBuf,

        /// Directory for the results JSON
        #[arg(short, long, value_name = "DIR")]
        results: Option<PathBuf>,
    },
    /// Validate extracted receipts and store them (PDF or results JSON)
    Ingest {
        /// Path to a PDF, or a results JSON written by `extract`
        input_file: PathBuf,

        /// Validate and report without touching the database
        #[arg(long)]
        dry_run: bool,
    },
    /// Report how many receipts the service finds on each page
    Count {
        /// Path to the PDF
        input_file: PathBuf,
    },
}

fn is_results_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

/// Set up an ingest run. A results file needs no vision client. Credentials are
/// checked before the database file is created.
fn open_ingest(
    cfg: &Config,
    input_file: &Path,
    dry_run: bool,
) -> Result<(Option<GeminiClient>, Option<ReceiptStore>), ReceiptError> {
    let service = if is_results_file(input_file) {
        None
    } else {
        Some(GeminiClient::new(&cfg.gemini)?)
    };

    let store = if dry_run {
        info!("Dry run, database left untouched");
        None
    } else {
        info!(db_path = %cfg.db_path, "Opening receipt database");
        Some(ReceiptStore::new(&cfg.db_path)?)
    };
    Ok((service, store))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let mut cfg = Config::resolve(cli.config.as_deref())?;

    // init tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(filter)
        .init();

    match cli.command {
        Commands::Crop {
            input_file,
            out,
            padding,
            dpi,
        } => {
            if let Some(out) = out {
                cfg.crop.output_dir = out;
            }
            if let Some(padding) = padding {
                cfg.crop.padding = padding;
            }
            if let Some(dpi) = dpi {
                cfg.crop.dpi = dpi;
            }
            cfg.crop.check()?;

            let service = GeminiClient::new(&cfg.gemini)?;
            let rasterizer = Pdftoppm::new(cfg.crop.pdftoppm.as_deref());
            let doc = Document::open(&input_file)?;

            let outcomes = pipeline::run_crop(&service, &rasterizer, &doc, &cfg.crop).await?;
            if outcomes.is_empty() {
                println!("No receipts found in {}", doc.filename);
            }
            for outcome in &outcomes {
                match outcome {
                    CropOutcome::Saved(saved) if saved.placeholder => println!(
                        "  P{} receipt {}: invalid box, placeholder saved to {}",
                        saved.page_number,
                        saved.receipt_index,
                        saved.path.display()
                    ),
                    CropOutcome::Saved(saved) => println!(
                        "  P{} receipt {}: saved {}",
                        saved.page_number,
                        saved.receipt_index,
                        saved.path.display()
                    ),
                    CropOutcome::Skipped {
                        page_number,
                        receipt_index,
                        reason,
                    } => println!("  P{page_number} receipt {receipt_index}: skipped ({reason})"),
                }
            }
        }
        Commands::Extract {
            input_file,
            results,
        } => {
            if let Some(results) = results {
                cfg.extract.results_dir = results;
            }

            let service = GeminiClient::new(&cfg.gemini)?;
            let doc = Document::open(&input_file)?;

            let (extraction, path) = pipeline::run_extract(&service, &doc, &cfg.extract).await?;
            println!("\n--- {} receipts extracted to {} ---", extraction.records.len(), path.display());
            for (i, record) in extraction.records.iter().enumerate() {
                println!("  #{:<3} {:<20} {}", i + 1, record.kind(), record.label());
            }
        }
        Commands::Ingest {
            input_file,
            dry_run,
        } => {
            let (service, store) = open_ingest(&cfg, &input_file, dry_run)?;

            let report = match &service {
                None => {
                    pipeline::run_ingest(
                        IngestSource::Results(&input_file),
                        None,
                        &cfg.extract,
                        store.as_ref(),
                    )
                    .await?
                }
                Some(service) => {
                    let doc = Document::open(&input_file)?;
                    pipeline::run_ingest(
                        IngestSource::Document(&doc),
                        Some(service),
                        &cfg.extract,
                        store.as_ref(),
                    )
                    .await?
                }
            };
            report.print_summary();

            if let Some(db) = &store {
                let (receipts, quarantined, documents) = db.get_counts()?;
                info!(receipts, quarantined, documents, "Database statistics");
            }
        }
        Commands::Count { input_file } => {
            let service = GeminiClient::new(&cfg.gemini)?;
            let doc = Document::open(&input_file)?;

            let per_page = pipeline::count_receipts(&service, &doc).await?;
            println!("\n--- {} ---", doc.filename);
            for (i, count) in per_page.iter().enumerate() {
                println!("  page {}: {} receipt(s)", i + 1, count);
            }
            println!("--- total {} ---\n", per_page.iter().sum::<usize>());
        }
    }

    Ok(())
}
