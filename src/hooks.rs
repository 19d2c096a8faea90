//! Per-request policy hooks invoked by the crawl backends.
//!
//! A backend runs every outbound request through [`HookChain::process_request`]
//! before dispatch, reports failures through [`HookChain::process_exception`],
//! and announces the start and end of a crawl. Hooks observe or mutate the
//! request; none of them can abort a crawl.

use std::fmt;
use std::sync::Arc;

use rand::seq::SliceRandom;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{error, info, warn};
use url::Url;

use crate::config::Settings;
use crate::crawler::CrawlStats;
use crate::error::{FetchError, HookError, SettingsError};

/// Routing metadata attached to a request.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub proxy: Option<Url>,
    /// Link hops from the seed URL.
    pub depth: usize,
}

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: Url,
    pub headers: HeaderMap,
    pub meta: RequestMeta,
}

impl OutboundRequest {
    pub fn new(url: Url) -> Self {
        OutboundRequest {
            url,
            headers: HeaderMap::new(),
            meta: RequestMeta::default(),
        }
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.meta.depth = depth;
        self
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.headers.get(USER_AGENT).and_then(|v| v.to_str().ok())
    }
}

impl fmt::Display for OutboundRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<GET {}>", self.url)
    }
}

pub trait RequestHook: Send + Sync {
    fn process_request(&self, _request: &mut OutboundRequest) {}

    fn process_exception(&self, _request: &OutboundRequest, _error: &FetchError) {}

    fn crawl_opened(&self, _name: &str) {}

    fn crawl_closed(&self, _name: &str, _stats: &CrawlStats) {}
}

/// Sets a random `User-Agent` from a fixed candidate list unless one is already present.
pub struct RotateUserAgent {
    candidates: Arc<[String]>,
}

impl RotateUserAgent {
    pub fn new(candidates: impl Into<Arc<[String]>>) -> Result<Self, HookError> {
        let candidates = candidates.into();
        if candidates.is_empty() {
            return Err(HookError::EmptyUserAgents);
        }
        Ok(RotateUserAgent { candidates })
    }
}

impl RequestHook for RotateUserAgent {
    fn process_request(&self, request: &mut OutboundRequest) {
        if request.headers.contains_key(USER_AGENT) {
            return;
        }
        let Some(ua) = self.candidates.choose(&mut rand::thread_rng()) else {
            return;
        };
        if ua.is_empty() {
            return;
        }
        match HeaderValue::from_str(ua) {
            Ok(v) => {
                request.headers.insert(USER_AGENT, v);
            }
            Err(_) => warn!("Skipping invalid user-agent candidate {:?}", ua),
        }
    }
}

/// Routes every request through one proxy endpoint.
pub struct ProxyAssignment {
    endpoint: Url,
}

impl ProxyAssignment {
    pub fn new(endpoint: Url) -> Self {
        ProxyAssignment { endpoint }
    }
}

impl RequestHook for ProxyAssignment {
    fn process_request(&self, request: &mut OutboundRequest) {
        request.meta.proxy = Some(self.endpoint.clone());
    }
}

/// Logs request failures and crawl lifecycle.
pub struct ErrorLogging;

impl RequestHook for ErrorLogging {
    fn process_exception(&self, request: &OutboundRequest, error: &FetchError) {
        error!("Error occurred processing request {}: {}", request, error);
    }

    fn crawl_opened(&self, name: &str) {
        info!("Spider opened: {}", name);
    }

    fn crawl_closed(&self, name: &str, stats: &CrawlStats) {
        info!(
            requested = stats.requested,
            records = stats.records,
            failed = stats.failed,
            "Spider closed: {}",
            name
        );
    }
}

/// Hooks in registration order. Each call fans out to every hook.
#[derive(Clone, Default)]
pub struct HookChain {
    hooks: Vec<Arc<dyn RequestHook>>,
}

impl HookChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, hook: impl RequestHook + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Proxy first, then user-agent, then error logging, as enabled by settings.
    pub fn from_settings(settings: &Settings) -> Result<Self, SettingsError> {
        let mut chain = HookChain::new();
        if let Some(proxy) = settings.proxy_url()? {
            chain = chain.with(ProxyAssignment::new(proxy));
        }
        if settings.rotate_user_agent {
            let ua = RotateUserAgent::new(settings.user_agents.clone())
                .map_err(|_| SettingsError::EmptyUserAgents)?;
            chain = chain.with(ua);
        }
        Ok(chain.with(ErrorLogging))
    }

    pub fn process_request(&self, request: &mut OutboundRequest) {
        for hook in &self.hooks {
            hook.process_request(request);
        }
    }

    pub fn process_exception(&self, request: &OutboundRequest, error: &FetchError) {
        for hook in &self.hooks {
            hook.process_exception(request, error);
        }
    }

    pub fn crawl_opened(&self, name: &str) {
        for hook in &self.hooks {
            hook.crawl_opened(name);
        }
    }

    pub fn crawl_closed(&self, name: &str, stats: &CrawlStats) {
        for hook in &self.hooks {
            hook.crawl_closed(name, stats);
        }
    }
}
