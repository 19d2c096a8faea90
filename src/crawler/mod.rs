pub mod cloud;
pub mod http;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;
use url::Url;

use crate::config::Settings;
use crate::error::CrawlError;
use crate::export::ItemPipeline;
use crate::record::DocumentRecord;

/// Name reported to lifecycle hooks.
pub const SPIDER_NAME: &str = "doc_spider";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlMode {
    /// Fetch the seed URLs only.
    SinglePage,
    /// Also follow links discovered on fetched pages, within the allowed domains.
    FollowLinks,
}

#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub mode: CrawlMode,
    pub allowed_domains: Vec<String>,
    pub concurrency: usize,
    pub max_pages: Option<usize>,
    /// Links are not followed past this many hops from a seed.
    pub max_depth: Option<usize>,
    pub timeout: Duration,
    pub respect_robots: bool,
}

impl CrawlOptions {
    pub fn from_settings(settings: &Settings, mode: CrawlMode) -> Self {
        CrawlOptions {
            mode,
            allowed_domains: settings.allowed_domains.clone(),
            concurrency: settings.concurrency.max(1),
            max_pages: settings.max_pages,
            max_depth: settings.max_depth,
            timeout: settings.request_timeout(),
            respect_robots: settings.respect_robots,
        }
    }

    pub fn follow_links(&self) -> bool {
        self.mode == CrawlMode::FollowLinks
    }

    fn limit_reached(&self, requested: usize) -> bool {
        self.max_pages.is_some_and(|max| requested >= max)
    }

    fn depth_allowed(&self, depth: usize) -> bool {
        self.max_depth.map_or(true, |max| depth <= max)
    }
}

/// Counters for one crawl run.
#[derive(Debug, Clone)]
pub struct CrawlStats {
    pub requested: usize,
    pub records: usize,
    pub failed: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl CrawlStats {
    pub fn start() -> Self {
        CrawlStats {
            requested: 0,
            records: 0,
            failed: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at.unwrap_or_else(Utc::now) - self.started_at
    }
}

/// A fetch backend: fetches pages, extracts each one, and feeds the records to a pipeline.
#[async_trait]
pub trait ScrapeStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Records reach `pipeline` in fetch-completion order. Per-page failures are
    /// reported to hooks and skipped; a pipeline error aborts the crawl.
    async fn fetch_and_extract(
        &self,
        urls: &[Url],
        pipeline: &mut dyn ItemPipeline,
    ) -> Result<CrawlStats, CrawlError>;
}

/// Scrapes through whichever backend it was built with.
pub struct DocScraper {
    strategy: Box<dyn ScrapeStrategy>,
}

impl DocScraper {
    pub fn new(strategy: Box<dyn ScrapeStrategy>) -> Self {
        DocScraper { strategy }
    }

    pub fn backend(&self) -> &str {
        self.strategy.name()
    }

    pub async fn scrape(
        &self,
        urls: &[Url],
        pipeline: &mut dyn ItemPipeline,
    ) -> Result<CrawlStats, CrawlError> {
        info!("Scraping {} seed URL(s) via {}", urls.len(), self.strategy.name());
        self.strategy.fetch_and_extract(urls, pipeline).await
    }
}

#[cfg(test)]
impl DocScraper {
    /// Scrape and return the records in memory instead of streaming them out.
    pub async fn collect(&self, urls: &[Url]) -> Result<Vec<DocumentRecord>, CrawlError> {
        let mut records = Vec::new();
        self.scrape(urls, &mut records).await?;
        Ok(records)
    }
}

/// Parse seed URLs, dropping fragments and duplicates.
pub fn parse_seeds<S: AsRef<str>>(raw: &[S]) -> Result<Vec<Url>, CrawlError> {
    let mut seeds: Vec<Url> = Vec::with_capacity(raw.len());
    for s in raw {
        let s = s.as_ref().trim();
        let mut url = Url::parse(s).map_err(|source| CrawlError::InvalidUrl {
            url: s.to_string(),
            source,
        })?;
        url.set_fragment(None);
        if !seeds.contains(&url) {
            seeds.push(url);
        }
    }
    Ok(seeds)
}
