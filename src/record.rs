use serde::{Deserialize, Serialize};
use url::Url;

/// Code blocks and paragraphs extracted from one documentation page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    #[serde(default)]
    pub api_docs: Vec<String>,
    #[serde(default)]
    pub explanatory_text: Vec<String>,
}

impl DocumentRecord {
    pub fn is_empty(&self) -> bool {
        self.api_docs.is_empty() && self.explanatory_text.is_empty()
    }
}

/// A fetched page as handed to the extractor: final URL after redirects plus raw markup.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: Url,
    pub body: String,
}
