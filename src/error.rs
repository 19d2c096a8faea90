use std::path::PathBuf;

use thiserror::Error;

/// Failure of a single page. Logged and skipped; the crawl carries on.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("could not extract {url}: {reason}")]
    Extraction { url: String, reason: String },
    #[error("spider cloud failed on {url}: {reason}")]
    Remote { url: String, reason: String },
}

impl FetchError {
    pub fn url(&self) -> &str {
        match self {
            FetchError::Request { url, .. }
            | FetchError::Status { url, .. }
            | FetchError::Extraction { url, .. }
            | FetchError::Remote { url, .. } => url,
        }
    }

    /// Rate limits and server-side failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
            FetchError::Remote { reason, .. } => {
                reason.contains("429")
                    || reason.contains("rate")
                    || reason.contains("500")
                    || reason.contains("502")
                    || reason.contains("503")
            }
            FetchError::Request { source, .. } => source.is_timeout() || source.is_connect(),
            FetchError::Extraction { .. } => false,
        }
    }
}

/// The JSON output cannot be opened or written. Fatal to the run.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("cannot open export file {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed writing to {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// JSON → CSV conversion failed. The crawl output itself is untouched.
#[derive(Debug, Error)]
pub enum PostProcessError {
    #[error("missing output: {} does not exist", .path.display())]
    MissingOutput { path: PathBuf },
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} is not a JSON array of records: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write CSV {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Run-level crawl failure.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error("invalid URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("crawl backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("user-agent rotation needs at least one candidate")]
    EmptyUserAgents,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),
    #[error("rotate_user_agent is enabled but user_agents is empty")]
    EmptyUserAgents,
    #[error("invalid proxy URL {url}: {source}")]
    InvalidProxy {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("concurrency must be at least 1")]
    InvalidConcurrency,
}
