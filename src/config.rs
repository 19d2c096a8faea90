use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::SettingsError;

/// Looked up in the working directory when no `--config` is given. Optional.
const DEFAULT_CONFIG: &str = "doc_scraper";
const ENV_PREFIX: &str = "DOC_SCRAPER";

pub const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 6.1; WOW64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/36.0.1985.143 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Seeds used when none are given on the command line.
    pub start_urls: Vec<String>,
    /// Hosts (and their subdomains) discovered links may point to. Empty means any.
    pub allowed_domains: Vec<String>,
    pub json_output: PathBuf,
    pub csv_output: PathBuf,
    pub concurrency: usize,
    pub max_pages: Option<usize>,
    /// Hops from a seed beyond which links are not followed. Unset means no limit.
    pub max_depth: Option<usize>,
    pub request_timeout_secs: u64,
    /// Forwarded to spider.cloud; the local HTTP backend does not read robots.txt.
    pub respect_robots: bool,
    pub rotate_user_agent: bool,
    pub user_agents: Vec<String>,
    pub proxy: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            start_urls: vec!["https://python.langchain.com/en/latest/index.html".into()],
            allowed_domains: vec!["python.langchain.com".into()],
            json_output: PathBuf::from("output/items.json"),
            csv_output: PathBuf::from("output.csv"),
            concurrency: 10,
            max_pages: None,
            max_depth: None,
            request_timeout_secs: 30,
            respect_robots: true,
            rotate_user_agent: false,
            user_agents: DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect(),
            proxy: None,
        }
    }
}

impl Settings {
    /// Defaults, then the config file, then `DOC_SCRAPER_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        Self::load_with_env(path, None)
    }

    fn load_with_env(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self, SettingsError> {
        let file = match path {
            Some(p) => File::from(p).required(true),
            None => File::with_name(DEFAULT_CONFIG).required(false),
        };
        let env = Environment::with_prefix(ENV_PREFIX)
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("start_urls")
            .with_list_parse_key("allowed_domains")
            .with_list_parse_key("user_agents")
            .source(env);

        let settings: Settings = Config::builder()
            .add_source(file)
            .add_source(env)
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        debug!(?settings, "settings loaded");
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.concurrency == 0 {
            return Err(SettingsError::InvalidConcurrency);
        }
        if self.rotate_user_agent && self.user_agents.iter().all(|ua| ua.trim().is_empty()) {
            return Err(SettingsError::EmptyUserAgents);
        }
        self.proxy_url()?;
        Ok(())
    }

    pub fn proxy_url(&self) -> Result<Option<Url>, SettingsError> {
        self.proxy
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(|p| {
                Url::parse(p.trim()).map_err(|source| SettingsError::InvalidProxy {
                    url: p.to_string(),
                    source,
                })
            })
            .transpose()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Option<config::Map<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn defaults_without_file_or_env() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent");
        let s = Settings::load_with_env(Some(&missing), env(&[])).err();
        // An explicit --config path must exist.
        assert!(matches!(s, Some(SettingsError::Load(_))));

        let s = Settings::load_with_env(None, env(&[])).unwrap();
        assert_eq!(s.json_output, PathBuf::from("output/items.json"));
        assert_eq!(s.csv_output, PathBuf::from("output.csv"));
        assert_eq!(s.allowed_domains, vec!["python.langchain.com"]);
        assert!(!s.rotate_user_agent);
        assert!(!s.user_agents.is_empty());
    }

    #[test]
    fn file_then_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc_scraper.toml");
        std::fs::write(
            &path,
            r#"
concurrency = 4
max_depth = 2
allowed_domains = ["docs.rs"]
json_output = "out/docs.json"
rotate_user_agent = true
user_agents = ["ua-one", "ua-two"]
"#,
        )
        .unwrap();

        let s = Settings::load_with_env(
            Some(&path),
            env(&[
                ("DOC_SCRAPER_CONCURRENCY", "2"),
                ("DOC_SCRAPER_MAX_PAGES", "25"),
                ("DOC_SCRAPER_ALLOWED_DOMAINS", "docs.rs,doc.rust-lang.org"),
            ]),
        )
        .unwrap();

        assert_eq!(s.concurrency, 2);
        assert_eq!(s.max_pages, Some(25));
        assert_eq!(s.max_depth, Some(2));
        assert_eq!(s.allowed_domains, vec!["docs.rs", "doc.rust-lang.org"]);
        assert_eq!(s.json_output, PathBuf::from("out/docs.json"));
        assert_eq!(s.user_agents, vec!["ua-one", "ua-two"]);
        assert!(s.rotate_user_agent);
    }

    #[test]
    fn rotation_needs_candidates() {
        let s = Settings {
            rotate_user_agent: true,
            user_agents: vec![],
            ..Settings::default()
        };
        assert!(matches!(s.validate(), Err(SettingsError::EmptyUserAgents)));
    }

    #[test]
    fn bad_proxy_rejected() {
        let s = Settings {
            proxy: Some("not a url".into()),
            ..Settings::default()
        };
        assert!(matches!(s.validate(), Err(SettingsError::InvalidProxy { .. })));
    }

    #[test]
    fn zero_concurrency_rejected() {
        let s = Settings {
            concurrency: 0,
            ..Settings::default()
        };
        assert!(matches!(s.validate(), Err(SettingsError::InvalidConcurrency)));
    }
}
