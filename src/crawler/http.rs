use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info};
use url::Url;

use super::{CrawlOptions, CrawlStats, ScrapeStrategy};
use crate::error::{CrawlError, FetchError};
use crate::export::ItemPipeline;
use crate::extract::{domain_allowed, extract, extract_with_links};
use crate::hooks::{HookChain, OutboundRequest};
use crate::record::{DocumentRecord, FetchedPage};

const DEFAULT_USER_AGENT: &str = concat!("doc_scraper/", env!("CARGO_PKG_VERSION"));
const MAX_REDIRECTS: usize = 10;

/// Local crawl backend on top of `reqwest`.
///
/// Up to `concurrency` fetches run at once. Every result is joined back into
/// the crawl loop, which is the only writer to the pipeline. Links are followed
/// breadth-first.
pub struct HttpCrawler {
    name: String,
    options: CrawlOptions,
    hooks: Arc<HookChain>,
    clients: Arc<ClientPool>,
}

enum PageOutcome {
    Fetched {
        request: OutboundRequest,
        url: Url,
        record: DocumentRecord,
        links: Vec<Url>,
    },
    Failed {
        request: OutboundRequest,
        error: FetchError,
    },
}

impl HttpCrawler {
    pub fn new(
        name: impl Into<String>,
        options: CrawlOptions,
        hooks: HookChain,
    ) -> Result<Self, CrawlError> {
        let clients = ClientPool::new(options.timeout).map_err(CrawlError::Client)?;
        Ok(HttpCrawler {
            name: name.into(),
            options,
            hooks: Arc::new(hooks),
            clients: Arc::new(clients),
        })
    }

    async fn run(
        &self,
        seeds: &[Url],
        pipeline: &mut dyn ItemPipeline,
        stats: &mut CrawlStats,
    ) -> Result<(), CrawlError> {
        let follow = self.options.follow_links();
        let semaphore = Arc::new(Semaphore::new(self.options.concurrency));

        let mut frontier: VecDeque<(Url, usize)> = seeds.iter().map(|u| (u.clone(), 0)).collect();
        let mut seen: HashSet<String> = HashSet::new();
        // Final URLs already exported, so a redirect alias cannot export the same page twice.
        let mut exported: HashSet<String> = HashSet::new();
        let mut tasks: JoinSet<PageOutcome> = JoinSet::new();

        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}) {msg}")
                .map_err(|e| CrawlError::Backend(e.to_string()))?
                .progress_chars("=> "),
        );

        loop {
            while let Some((mut url, depth)) = frontier.pop_front() {
                if self.options.limit_reached(stats.requested) {
                    debug!("page limit reached, dropping {} queued URLs", frontier.len() + 1);
                    frontier.clear();
                    break;
                }
                url.set_fragment(None);
                if !seen.insert(url.as_str().to_string()) {
                    continue;
                }

                let mut request = OutboundRequest::new(url).with_depth(depth);
                self.hooks.process_request(&mut request);
                stats.requested += 1;
                pb.set_length(stats.requested as u64);

                let clients = Arc::clone(&self.clients);
                let sem = Arc::clone(&semaphore);
                tasks.spawn(async move {
                    // Held until the page is processed. The semaphore is never closed.
                    let _permit = sem.acquire_owned().await;
                    process(&clients, request, follow).await
                });
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            pb.inc(1);
            let Some(outcome) = settle(joined) else {
                stats.failed += 1;
                pb.set_message(format!("{} errors", stats.failed));
                continue;
            };

            match outcome {
                PageOutcome::Fetched { request, url, record, links } => {
                    seen.insert(url.as_str().to_string());
                    if !exported.insert(url.as_str().to_string()) {
                        debug!(%url, requested = %request.url, "already exported, skipped");
                        continue;
                    }
                    if record.is_empty() {
                        debug!(%url, "no code blocks or paragraphs");
                    } else {
                        debug!(%url, code = record.api_docs.len(), paragraphs = record.explanatory_text.len(), "extracted");
                    }
                    if let Err(e) = pipeline.process_item(record) {
                        tasks.abort_all();
                        pb.abandon_with_message("export failed");
                        return Err(e.into());
                    }
                    stats.records += 1;

                    let depth = request.meta.depth + 1;
                    if follow && self.options.depth_allowed(depth) {
                        for link in links {
                            if domain_allowed(&link, &self.options.allowed_domains)
                                && !seen.contains(link.as_str())
                            {
                                frontier.push_back((link, depth));
                            }
                        }
                    }
                }
                PageOutcome::Failed { request, error } => {
                    stats.failed += 1;
                    pb.set_message(format!("{} errors", stats.failed));
                    self.hooks.process_exception(&request, &error);
                }
            }
        }

        pb.finish_and_clear();
        Ok(())
    }
}

/// A fetch task that panicked or was cancelled still counts as done.
fn settle(joined: Result<PageOutcome, JoinError>) -> Option<PageOutcome> {
    match joined {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            error!("Fetch task failed: {}", e);
            None
        }
    }
}

#[async_trait]
impl ScrapeStrategy for HttpCrawler {
    fn name(&self) -> &str {
        "http"
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
            "Crawled {} pages ({} records, {} errors) in {:.1}s",
            stats.requested,
            stats.records,
            stats.failed,
            stats.elapsed().num_milliseconds() as f64 / 1000.0
        );
        result.map(|_| stats)
    }
}

async fn process(clients: &ClientPool, request: OutboundRequest, follow: bool) -> PageOutcome {
    let page = match fetch(clients, &request).await {
        Ok(page) => page,
        Err(error) => return PageOutcome::Failed { request, error },
    };

    // Extraction is not expected to panic on any HTML, but if it does only this page is lost.
    let extracted = panic::catch_unwind(AssertUnwindSafe(|| {
        if follow {
            extract_with_links(&page.body, &page.url)
        } else {
            (extract(&page.body), Vec::new())
        }
    }));

    match extracted {
        Ok((record, links)) => PageOutcome::Fetched {
            request,
            url: page.url,
            record,
            links,
        },
        Err(_) => {
            let error = FetchError::Extraction {
                url: page.url.to_string(),
                reason: "extractor panicked".into(),
            };
            PageOutcome::Failed { request, error }
        }
    }
}

async fn fetch(clients: &ClientPool, request: &OutboundRequest) -> Result<FetchedPage, FetchError> {
    let url = request.url.to_string();
    let request_err = |source| FetchError::Request {
        url: url.clone(),
        source,
    };

    let client = clients
        .client_for(request.meta.proxy.as_ref())
        .map_err(request_err)?;
    let resp = client
        .get(request.url.clone())
        .headers(request.headers.clone())
        .send()
        .await
        .map_err(request_err)?;

    let status = resp.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            url: url.clone(),
            status: status.as_u16(),
        });
    }

    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase());
    if let Some(ct) = content_type.filter(|ct| !is_markup(ct)) {
        return Err(FetchError::Extraction {
            url: url.clone(),
            reason: format!("not an HTML document ({})", ct),
        });
    }

    let final_url = resp.url().clone();
    let body = resp.text().await.map_err(request_err)?;
    Ok(FetchedPage { url: final_url, body })
}

fn is_markup(content_type: &str) -> bool {
    content_type.starts_with("text/") || content_type.contains("html") || content_type.contains("xml")
}

/// One `reqwest::Client` per proxy endpoint, built on first use.
///
/// Environment proxy variables are ignored; proxies only come from request metadata.
struct ClientPool {
    timeout: Duration,
    direct: Client,
    proxied: Mutex<HashMap<String, Client>>,
}

impl ClientPool {
    fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(ClientPool {
            timeout,
            direct: Self::builder(timeout).no_proxy().build()?,
            proxied: Mutex::new(HashMap::new()),
        })
    }

    fn builder(timeout: Duration) -> reqwest::ClientBuilder {
        Client::builder()
            .timeout(timeout)
            .user_agent(DEFAULT_USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
    }

    fn client_for(&self, proxy: Option<&Url>) -> Result<Client, reqwest::Error> {
        let Some(proxy) = proxy else {
            return Ok(self.direct.clone());
        };
        let mut proxied = self.proxied.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = proxied.get(proxy.as_str()) {
            return Ok(client.clone());
        }
        let client = Self::builder(self.timeout)
            .proxy(reqwest::Proxy::all(proxy.as_str())?)
            .build()?;
        proxied.insert(proxy.as_str().to_string(), client.clone());
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::path::PathBuf;

    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{Html, IntoResponse, Redirect};
    use axum::routing::get;
    use axum::Router;

    use super::*;
    use crate::crawler::{CrawlMode, DocScraper};
    use crate::error::ExportError;
    use crate::hooks::tests::Recorder;
    use crate::hooks::{ErrorLogging, RotateUserAgent};

    const INDEX: &str = r#"<html><body>
        <pre>X</pre><p>A</p><p>B</p>
        <a href="/a">a</a>
        <a href="/b#section">b</a>
        <a href="/missing">missing</a>
        <a href="http://example.invalid/elsewhere">offsite</a>
        <a href="/logo.png">logo</a>
    </body></html>"#;

    const PAGE_A: &str = r#"<html><body>
        <p>Page A</p>
        <a href="/">home</a>
        <a href="/b">b</a>
    </body></html>"#;

    const PAGE_B: &str = r#"<html><body><pre>fn b() {}</pre></body></html>"#;

    const ALIASES: &str = r#"<html><body>
        <p>Aliases</p>
        <a href="/a">a</a>
        <a href="/old">old a</a>
    </body></html>"#;

    async fn echo_user_agent(headers: HeaderMap) -> Html<String> {
        let ua = headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Html(format!("<p>{}</p>", ua))
    }

    async fn serve() -> SocketAddr {
        let app = Router::new()
            .route("/", get(|| async { Html(INDEX) }))
            .route("/a", get(|| async { Html(PAGE_A) }))
            .route("/b", get(|| async { Html(PAGE_B) }))
            .route("/aliases", get(|| async { Html(ALIASES) }))
            .route("/old", get(|| async { Redirect::permanent("/a") }))
            .route("/ua", get(echo_user_agent))
            .route(
                "/binary",
                get(|| async { ([("content-type", "application/octet-stream")], vec![0u8, 1, 2]) }),
            )
            .route(
                "/boom",
                get(|| async { StatusCode::INTERNAL_SERVER_ERROR.into_response() }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn options(mode: CrawlMode) -> CrawlOptions {
        CrawlOptions {
            mode,
            allowed_domains: vec!["127.0.0.1".into()],
            concurrency: 4,
            max_pages: None,
            max_depth: None,
            timeout: Duration::from_secs(5),
            respect_robots: false,
        }
    }

    fn url(addr: SocketAddr, path: &str) -> Url {
        Url::parse(&format!("http://{}{}", addr, path)).unwrap()
    }

    #[tokio::test]
    async fn single_page_mode_fetches_only_seeds() {
        let addr = serve().await;
        let crawler = HttpCrawler::new("test", options(CrawlMode::SinglePage), HookChain::new()).unwrap();

        let mut records = Vec::new();
        let stats = crawler
            .fetch_and_extract(&[url(addr, "/")], &mut records)
            .await
            .unwrap();

        assert_eq!(stats.requested, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(
            records,
            vec![DocumentRecord {
                api_docs: vec!["X".into()],
                explanatory_text: vec!["A".into(), "B".into()],
            }]
        );
        assert!(stats.finished_at.is_some());
    }

    #[tokio::test]
    async fn follow_mode_stays_on_site_and_skips_failures() {
        let addr = serve().await;
        let rec = Arc::new(Recorder::default());
        let hooks = HookChain::new().with(rec.clone()).with(ErrorLogging);
        let crawler = HttpCrawler::new("test", options(CrawlMode::FollowLinks), hooks).unwrap();

        let mut records = Vec::new();
        let stats = crawler
            .fetch_and_extract(&[url(addr, "/")], &mut records)
            .await
            .unwrap();

        // "/", "/a", "/b", "/missing"; the offsite link and the image are never requested.
        assert_eq!(stats.requested, 4);
        assert_eq!(stats.records, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(records.len(), 3);
        assert!(records.iter().any(|r| r.explanatory_text == vec!["Page A"]));
        assert!(records.iter().any(|r| r.api_docs == vec!["fn b() {}"]));

        let events = rec.events.lock().unwrap();
        assert_eq!(events.first().map(String::as_str), Some("opened test"));
        assert_eq!(events.last().map(String::as_str), Some("closed test"));
        let requests: Vec<_> = events.iter().filter(|e| e.starts_with("request ")).collect();
        assert_eq!(requests.len(), 4);
        let errors: Vec<_> = events.iter().filter(|e| e.starts_with("error ")).collect();
        assert_eq!(errors, vec![&format!("error {}", url(addr, "/missing"))]);
    }

    #[tokio::test]
    async fn page_limit_caps_requests() {
        let addr = serve().await;
        let mut opts = options(CrawlMode::FollowLinks);
        opts.max_pages = Some(2);
        let crawler = HttpCrawler::new("test", opts, HookChain::new()).unwrap();

        let mut records = Vec::new();
        let stats = crawler
            .fetch_and_extract(&[url(addr, "/")], &mut records)
            .await
            .unwrap();
        assert_eq!(stats.requested, 2);
    }

    #[tokio::test]
    async fn redirect_alias_is_exported_once() {
        let addr = serve().await;
        let mut opts = options(CrawlMode::FollowLinks);
        opts.max_depth = Some(1);
        let crawler = HttpCrawler::new("test", opts, HookChain::new()).unwrap();

        let mut records = Vec::new();
        let stats = crawler
            .fetch_and_extract(&[url(addr, "/aliases")], &mut records)
            .await
            .unwrap();

        assert_eq!(stats.requested, 3);
        assert_eq!(stats.records, 2);
        let page_a = records
            .iter()
            .filter(|r| r.explanatory_text == vec!["Page A"])
            .count();
        assert_eq!(page_a, 1);
    }

    #[tokio::test]
    async fn depth_limit_stops_link_following() {
        let addr = serve().await;
        let mut opts = options(CrawlMode::FollowLinks);
        opts.max_depth = Some(0);
        let crawler = HttpCrawler::new("test", opts, HookChain::new()).unwrap();

        let mut records = Vec::new();
        let stats = crawler
            .fetch_and_extract(&[url(addr, "/")], &mut records)
            .await
            .unwrap();
        assert_eq!(stats.requested, 1);
        assert_eq!(records.len(), 1);
    }

    fn exploding_fetch() -> PageOutcome {
        panic!("fetch task blew up")
    }

    #[tokio::test]
    async fn panicked_fetch_task_is_settled() {
        let mut set: JoinSet<PageOutcome> = JoinSet::new();
        set.spawn(async { exploding_fetch() });
        let joined = set.join_next().await.unwrap();
        assert!(settle(joined).is_none());
        assert!(set.join_next().await.is_none());
    }

    #[tokio::test]
    async fn hook_user_agent_is_sent() {
        let addr = serve().await;
        let hooks = HookChain::new().with(RotateUserAgent::new(vec!["test-agent/1.0".to_string()]).unwrap());
        let crawler = HttpCrawler::new("test", options(CrawlMode::SinglePage), hooks).unwrap();
        let scraper = DocScraper::new(Box::new(crawler));

        let records = scraper.collect(&[url(addr, "/ua")]).await.unwrap();
        assert_eq!(records[0].explanatory_text, vec!["test-agent/1.0"]);
    }

    #[tokio::test]
    async fn server_errors_and_binaries_produce_no_record() {
        let addr = serve().await;
        let crawler = HttpCrawler::new("test", options(CrawlMode::SinglePage), HookChain::new()).unwrap();

        let mut records = Vec::new();
        let stats = crawler
            .fetch_and_extract(&[url(addr, "/boom"), url(addr, "/binary")], &mut records)
            .await
            .unwrap();
        assert_eq!(stats.failed, 2);
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn unreachable_host_is_a_page_failure() {
        let crawler = HttpCrawler::new("test", options(CrawlMode::SinglePage), HookChain::new()).unwrap();
        let mut records = Vec::new();
        let stats = crawler
            .fetch_and_extract(&[Url::parse("http://127.0.0.1:1/").unwrap()], &mut records)
            .await
            .unwrap();
        assert_eq!(stats.failed, 1);
        assert!(records.is_empty());
    }

    struct BrokenDisk;

    impl ItemPipeline for BrokenDisk {
        fn process_item(&mut self, _item: DocumentRecord) -> Result<(), ExportError> {
            Err(ExportError::Write {
                path: PathBuf::from("output/items.json"),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            })
        }
    }

    #[tokio::test]
    async fn export_failure_aborts_the_crawl() {
        let addr = serve().await;
        let crawler = HttpCrawler::new("test", options(CrawlMode::FollowLinks), HookChain::new()).unwrap();
        let err = crawler
            .fetch_and_extract(&[url(addr, "/")], &mut BrokenDisk)
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::Export(ExportError::Write { .. })));
    }
}
