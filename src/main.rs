mod config;
mod crawler;
mod error;
mod export;
mod extract;
mod hooks;
mod postprocess;
mod record;
mod sitemap;

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, error};

use crate::config::Settings;
use crate::crawler::cloud::SpiderCloud;
use crate::crawler::http::HttpCrawler;
use crate::crawler::{parse_seeds, CrawlMode, CrawlOptions, DocScraper, ScrapeStrategy, SPIDER_NAME};
use crate::error::PostProcessError;
use crate::export::JsonExporter;
use crate::hooks::HookChain;

#[derive(Parser)]
#[command(
    name = "doc_scraper",
    about = "Scrape code blocks and explanatory text from documentation sites"
)]
struct Cli {
    /// Settings file (default: ./doc_scraper.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl pages, export records to JSON, then convert the JSON to CSV
    Crawl {
        /// Seed URLs (default: start_urls from settings)
        urls: Vec<String>,
        /// Follow links within the allowed domains instead of fetching seeds only
        #[arg(long)]
        follow: bool,
        #[arg(long, value_enum, default_value_t = Backend::Http)]
        backend: Backend,
        /// Max pages to request
        #[arg(short = 'n', long)]
        max_pages: Option<usize>,
        /// Don't follow links more than this many hops from a seed
        #[arg(long)]
        max_depth: Option<usize>,
        /// Take seed URLs from this sitemap
        #[arg(long, conflicts_with = "urls")]
        sitemap: Option<String>,
        /// Only keep sitemap URLs matching this regex
        #[arg(long, requires = "sitemap")]
        sitemap_filter: Option<String>,
        /// JSON output path
        #[arg(long)]
        json: Option<PathBuf>,
        /// CSV output path
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Skip the CSV conversion
        #[arg(long)]
        no_csv: bool,
    },
    /// Convert an existing JSON export to CSV
    Convert {
        #[arg(long)]
        json: Option<PathBuf>,
        #[arg(long)]
        csv: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Backend {
    /// Local fetcher built on reqwest
    Http,
    /// spider.cloud API (needs SPIDER_API_KEY)
    SpiderCloud,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref()).context("Invalid configuration")?;

    let result = match cli.command {
        Commands::Crawl {
            urls,
            follow,
            backend,
            max_pages,
            max_depth,
            sitemap,
            sitemap_filter,
            json,
            csv,
            no_csv,
        } => {
            if let Some(n) = max_pages {
                settings.max_pages = Some(n);
            }
            if let Some(d) = max_depth {
                settings.max_depth = Some(d);
            }
            if let Some(path) = json {
                settings.json_output = path;
            }
            if let Some(path) = csv {
                settings.csv_output = path;
            }

            let seeds = if !urls.is_empty() {
                urls
            } else if let Some(sitemap_url) = sitemap {
                sitemap::fetch_urls(&sitemap_url, sitemap_filter.as_deref()).await?
            } else {
                settings.start_urls.clone()
            };
            if seeds.is_empty() {
                println!("No seed URLs. Pass URLs, --sitemap, or set start_urls.");
                return Ok(());
            }

            let mode = if follow {
                CrawlMode::FollowLinks
            } else {
                CrawlMode::SinglePage
            };
            run_crawl(&settings, &seeds, mode, backend, !no_csv).await
        }
        Commands::Convert { json, csv } => {
            let json = json.unwrap_or_else(|| settings.json_output.clone());
            let csv = csv.unwrap_or_else(|| settings.csv_output.clone());
            let rows = postprocess::json_to_csv(&json, &csv)?;
            println!("Wrote {} rows to {}", rows, csv.display());
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

async fn run_crawl(
    settings: &Settings,
    seeds: &[String],
    mode: CrawlMode,
    backend: Backend,
    write_csv: bool,
) -> anyhow::Result<()> {
    let seeds = parse_seeds(seeds)?;
    let hooks = HookChain::from_settings(settings)?;
    debug!("{} request hooks enabled", hooks.len());
    let options = CrawlOptions::from_settings(settings, mode);

    let strategy: Box<dyn ScrapeStrategy> = match backend {
        Backend::Http => Box::new(HttpCrawler::new(SPIDER_NAME, options, hooks)?),
        Backend::SpiderCloud => Box::new(SpiderCloud::from_env(SPIDER_NAME, options, hooks)?),
    };
    let scraper = DocScraper::new(strategy);

    let mut exporter = JsonExporter::create(&settings.json_output)?;
    println!(
        "Scraping {} seed URL(s) via {} ({})...",
        seeds.len(),
        scraper.backend(),
        match mode {
            CrawlMode::SinglePage => "single page",
            CrawlMode::FollowLinks => "following links",
        }
    );
    // On error the exporter is dropped here, which still closes the JSON array.
    let stats = scraper.scrape(&seeds, &mut exporter).await?;
    let json_path = exporter.path().to_path_buf();
    let exported = exporter.finish()?;
    println!(
        "Done: {} requested ({} exported, {} errors) -> {}",
        stats.requested,
        exported,
        stats.failed,
        json_path.display()
    );

    if write_csv {
        convert_after_crawl(&settings.json_output, &settings.csv_output);
    }
    Ok(())
}

/// CSV conversion after a crawl. The crawl already succeeded, so failures are reported, not returned.
fn convert_after_crawl(json: &Path, csv: &Path) {
    match postprocess::json_to_csv(json, csv) {
        Ok(rows) => println!("Wrote {} rows to {}", rows, csv.display()),
        Err(e @ PostProcessError::MissingOutput { .. }) => {
            error!("Failed to read JSON file. File not found: {}", e);
            println!("CSV skipped: {}", e);
        }
        Err(e) => {
            error!("Failed to read JSON file. Unexpected error: {}", e);
            println!("CSV skipped: {}", e);
        }
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
