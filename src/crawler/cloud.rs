use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use async_trait::async_trait;
use rayon::prelude::*;
use spider_client::shapes::request::{ReturnFormat, ReturnFormatHandling};
use spider_client::{RequestParams, Spider};
use tracing::{debug, info, warn};
use url::Url;

use super::{CrawlMode, CrawlOptions, CrawlStats, ScrapeStrategy};
use crate::error::{CrawlError, FetchError};
use crate::export::ItemPipeline;
use crate::extract::{domain_allowed, extract};
use crate::hooks::{HookChain, OutboundRequest};
use crate::record::{DocumentRecord, FetchedPage};

const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF_MS: u64 = 2000;

/// Crawl backend that delegates fetching, link following and robots.txt to spider.cloud.
pub struct SpiderCloud {
    name: String,
    api: Box<dyn SpiderApi>,
    options: CrawlOptions,
    hooks: HookChain,
}

/// The spider.cloud calls the backend makes.
#[async_trait]
trait SpiderApi: Send + Sync {
    async fn call(
        &self,
        url: &str,
        params: RequestParams,
        mode: CrawlMode,
    ) -> Result<serde_json::Value, String>;
}

#[async_trait]
impl SpiderApi for Spider {
    async fn call(
        &self,
        url: &str,
        params: RequestParams,
        mode: CrawlMode,
    ) -> Result<serde_json::Value, String> {
        let response = match mode {
            CrawlMode::SinglePage => self.scrape_url(url, Some(params), "application/json").await,
            CrawlMode::FollowLinks => {
                self.crawl_url(url, Some(params), false, "application/json", None::<fn(serde_json::Value)>)
                    .await
            }
        };
        response.map_err(|e| e.to_string())
    }
}

/// One entry of a spider.cloud response array.
#[derive(Debug, Default, PartialEq)]
struct RemotePage {
    url: Option<String>,
    content: Option<String>,
    status: Option<i64>,
    error: Option<String>,
}

impl SpiderCloud {
    /// Reads the API key from `SPIDER_API_KEY`.
    pub fn from_env(
        name: impl Into<String>,
        options: CrawlOptions,
        hooks: HookChain,
    ) -> Result<Self, CrawlError> {
        let api_key = std::env::var("SPIDER_API_KEY").map_err(|_| {
            CrawlError::Backend("SPIDER_API_KEY environment variable must be set".into())
        })?;
        Self::new(name, api_key, options, hooks)
    }

    pub fn new(
        name: impl Into<String>,
        api_key: String,
        options: CrawlOptions,
        hooks: HookChain,
    ) -> Result<Self, CrawlError> {
        let spider = Spider::new(Some(api_key))
            .map_err(|e| CrawlError::Backend(format!("Failed to create Spider client: {}", e)))?;
        Ok(Self::with_api(name, spider, options, hooks))
    }

    fn with_api(
        name: impl Into<String>,
        api: impl SpiderApi + 'static,
        options: CrawlOptions,
        hooks: HookChain,
    ) -> Self {
        SpiderCloud {
            name: name.into(),
            api: Box::new(api),
            options,
            hooks,
        }
    }

    fn params(&self, request: &OutboundRequest) -> RequestParams {
        let limit = match self.options.mode {
            CrawlMode::SinglePage => None,
            CrawlMode::FollowLinks => self.options.max_pages.map(|m| m as u32),
        };
        RequestParams {
            return_format: Some(ReturnFormatHandling::Single(ReturnFormat::Raw)),
            limit,
            user_agent: request.user_agent().map(String::from),
            respect_robots: Some(self.options.respect_robots),
            ..Default::default()
        }
    }

    async fn request_with_retry(&self, request: &OutboundRequest) -> Result<Vec<RemotePage>, FetchError> {
        let mut attempt = 0;
        loop {
            match self.request_once(request).await {
                Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                    let backoff = Duration::from_millis(BASE_BACKOFF_MS * 2u64.pow(attempt));
                    warn!(
                        "Rate limited on {} (attempt {}/{}), backing off {:.1}s",
                        request.url,
                        attempt + 1,
                        MAX_RETRIES,
                        backoff.as_secs_f64()
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn request_once(&self, request: &OutboundRequest) -> Result<Vec<RemotePage>, FetchError> {
        let url = request.url.as_str();
        let params = self.params(request);
        let value = self
            .api
            .call(url, params, self.options.mode)
            .await
            .map_err(|reason| FetchError::Remote {
                url: url.to_string(),
                reason,
            })?;
        Ok(parse_response(value))
    }

    async fn run(
        &self,
        seeds: &[Url],
        pipeline: &mut dyn ItemPipeline,
        stats: &mut CrawlStats,
    ) -> Result<(), CrawlError> {
        for seed in seeds {
            if self.options.limit_reached(stats.requested) {
                break;
            }
            let mut request = OutboundRequest::new(seed.clone());
            self.hooks.process_request(&mut request);

            let pages = match self.request_with_retry(&request).await {
                Ok(pages) => pages,
                Err(error) => {
                    stats.requested += 1;
                    stats.failed += 1;
                    self.hooks.process_exception(&request, &error);
                    continue;
                }
            };

            let mut fetched = Vec::with_capacity(pages.len());
            for page in pages {
                match page.into_fetched(seed) {
                    Ok(p) if p.url != *seed && !domain_allowed(&p.url, &self.options.allowed_domains) => {
                        debug!(url = %p.url, "outside allowed domains, skipped");
                    }
                    Ok(p) => {
                        stats.requested += 1;
                        fetched.push(p);
                    }
                    Err(error) => {
                        stats.requested += 1;
                        stats.failed += 1;
                        let failed = Url::parse(error.url()).unwrap_or_else(|_| seed.clone());
                        self.hooks.process_exception(&OutboundRequest::new(failed), &error);
                    }
                }
            }

            let extracted: Vec<Option<DocumentRecord>> = fetched
                .par_iter()
                .map(|p| panic::catch_unwind(AssertUnwindSafe(|| extract(&p.body))).ok())
                .collect();

            for (page, record) in fetched.iter().zip(extracted) {
                match record {
                    Some(record) => {
                        pipeline.process_item(record)?;
                        stats.records += 1;
                    }
                    None => {
                        stats.failed += 1;
                        let error = FetchError::Extraction {
                            url: page.url.to_string(),
                            reason: "extractor panicked".into(),
                        };
                        self.hooks.process_exception(&OutboundRequest::new(page.url.clone()), &error);
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ScrapeStrategy for SpiderCloud {
    fn name(&self) -> &str {
        "spider-cloud"
    }

    async fn fetch_and_extract(
        &self,
        urls: &[Url],
        pipeline: &mut dyn ItemPipeline,
    ) -> Result<CrawlStats, CrawlError> {
        let mut stats = CrawlStats::start();
        self.hooks.crawl_opened(&self.name);

        let result = self.run(urls, pipeline, &mut stats).await;

        stats.finish();
        self.hooks.crawl_closed(&self.name, &stats);
        info!(
            "Scraped {} pages via spider.cloud ({} records, {} errors)",
            stats.requested, stats.records, stats.failed
        );
        result.map(|_| stats)
    }
}

/// The service answers with a JSON array, sometimes wrapped in a JSON string.
fn parse_response(value: serde_json::Value) -> Vec<RemotePage> {
    let parsed = match value {
        serde_json::Value::String(s) => {
            serde_json::from_str(&s).unwrap_or_else(|_| serde_json::Value::String(s))
        }
        other => other,
    };

    parsed
        .as_array()
        .map(|arr| arr.iter().map(RemotePage::from_json).collect())
        .unwrap_or_default()
}

impl RemotePage {
    fn from_json(obj: &serde_json::Value) -> Self {
        let text = |key: &str| obj.get(key).and_then(|v| v.as_str()).map(String::from);
        RemotePage {
            url: text("url"),
            content: text("content"),
            status: obj.get("status").and_then(|s| s.as_i64()),
            error: text("error").filter(|e| !e.is_empty()),
        }
    }

    fn into_fetched(self, seed: &Url) -> Result<FetchedPage, FetchError> {
        let url = self
            .url
            .as_deref()
            .and_then(|u| Url::parse(u).ok())
            .unwrap_or_else(|| seed.clone());

        if let Some(reason) = self.error {
            return Err(FetchError::Remote {
                url: url.to_string(),
                reason,
            });
        }
        if let Some(status) = self.status.filter(|s| !(200..300).contains(s)) {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status as u16,
            });
        }
        match self.content {
            Some(body) => Ok(FetchedPage { url, body }),
            None => Err(FetchError::Remote {
                url: url.to_string(),
                reason: "No content in spider response".into(),
            }),
        }
    }
}
