use std::collections::HashSet;
use std::sync::LazyLock;

use scraper::{Html, Selector};
use url::Url;

use crate::record::DocumentRecord;

static PRE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("pre").unwrap());
static PARAGRAPH: LazyLock<Selector> = LazyLock::new(|| Selector::parse("p").unwrap());
static ANCHOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());

/// Link targets never worth fetching as documentation pages.
const ASSET_EXTENSIONS: &[&str] = &[
    // images
    "png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "bmp", "tif", "tiff",
    // archives
    "zip", "tar", "gz", "tgz", "bz2", "xz", "7z", "rar", "whl", "egg",
    // media
    "mp3", "mp4", "wav", "ogg", "webm", "avi", "mov", "mkv",
    // documents
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "odt", "ods",
    // other
    "css", "js", "exe", "dmg", "iso", "bin",
];

/// Pull every `<pre>` block and `<p>` paragraph out of a page, in document order.
pub fn extract(html: &str) -> DocumentRecord {
    record_from(&Html::parse_document(html))
}

/// [`extract`] plus the page's outgoing links, from a single parse.
///
/// Links are absolute http(s) URLs resolved against `base`. Fragments are
/// dropped, duplicates keep their first position, and links to images,
/// archives, media and office documents are skipped.
pub fn extract_with_links(html: &str, base: &Url) -> (DocumentRecord, Vec<Url>) {
    let doc = Html::parse_document(html);
    (record_from(&doc), links_from(&doc, base))
}

fn record_from(doc: &Html) -> DocumentRecord {
    DocumentRecord {
        api_docs: texts(doc, &PRE),
        explanatory_text: texts(doc, &PARAGRAPH),
    }
}

fn texts(doc: &Html, selector: &Selector) -> Vec<String> {
    doc.select(selector)
        .map(|el| el.text().collect::<String>())
        .collect()
}

fn links_from(doc: &Html, base: &Url) -> Vec<Url> {
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for el in doc.select(&ANCHOR) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        let Ok(mut url) = base.join(href.trim()) else {
            continue;
        };
        if !matches!(url.scheme(), "http" | "https") || is_asset(&url) {
            continue;
        }
        url.set_fragment(None);
        if seen.insert(url.as_str().to_string()) {
            links.push(url);
        }
    }

    links
}

fn is_asset(url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    let Some(last) = path.rsplit('/').next() else {
        return false;
    };
    match last.rsplit_once('.') {
        Some((_, ext)) => ASSET_EXTENSIONS.contains(&ext),
        None => false,
    }
}

/// `host` is one of `allowed` or a subdomain of one. An empty allow-list admits everything.
pub fn domain_allowed(url: &Url, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    allowed.iter().any(|d| {
        let d = d.trim().trim_start_matches('.').to_ascii_lowercase();
        host == d || host.ends_with(&format!(".{}", d))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str) -> String {
        std::fs::read_to_string(format!("tests/fixtures/{}.html", name)).unwrap()
    }

    #[test]
    fn pre_and_paragraphs() {
        let r = extract("<pre>X</pre><p>A</p><p>B</p>");
        assert_eq!(r.api_docs, vec!["X"]);
        assert_eq!(r.explanatory_text, vec!["A", "B"]);
    }

    #[test]
    fn no_matches_gives_empty_record() {
        let r = extract("<html><body><div>nothing here</div></body></html>");
        assert!(r.api_docs.is_empty());
        assert!(r.explanatory_text.is_empty());
    }

    #[test]
    fn empty_input() {
        assert!(extract("").is_empty());
    }

    #[test]
    fn nested_markup_is_flattened_per_element() {
        let r = extract("<pre><code>let <b>x</b> = 1;</code></pre><p>See <a href='#'>this</a> page</p>");
        assert_eq!(r.api_docs, vec!["let x = 1;"]);
        assert_eq!(r.explanatory_text, vec!["See this page"]);
    }

    #[test]
    fn whitespace_and_duplicates_kept() {
        let r = extract("<p>  same </p><p>  same </p><pre>\n  indented\n</pre>");
        assert_eq!(r.explanatory_text, vec!["  same ", "  same "]);
        assert_eq!(r.api_docs, vec!["  indented\n"]);
    }

    #[test]
    fn langchain_fixture_counts() {
        let r = extract(&fixture("langchain_index"));
        assert_eq!(r.api_docs.len(), 2);
        assert_eq!(r.explanatory_text.len(), 4);
        assert!(r.api_docs[0].contains("pip install langchain"));
        assert!(r.explanatory_text[0].starts_with("LangChain is a framework"));
        assert_eq!(r.explanatory_text[3], "Modèles de langage – déjà prêts.");
    }

    #[test]
    fn empty_page_fixture() {
        assert!(extract(&fixture("empty_page")).is_empty());
    }

    #[test]
    fn links_are_resolved_and_filtered() {
        let base = Url::parse("https://python.langchain.com/en/latest/index.html").unwrap();
        let (_, links) = extract_with_links(&fixture("langchain_index"), &base);
        let got: Vec<&str> = links.iter().map(|u| u.as_str()).collect();
        assert_eq!(
            got,
            vec![
                "https://python.langchain.com/en/latest/getting_started.html",
                "https://python.langchain.com/en/latest/modules/models.html",
                "https://github.com/hwchase17/langchain",
            ]
        );
    }

    #[test]
    fn record_with_links_matches_plain_extract() {
        let html = fixture("langchain_index");
        let base = Url::parse("https://python.langchain.com/en/latest/index.html").unwrap();
        let (record, _) = extract_with_links(&html, &base);
        assert_eq!(record, extract(&html));
    }

    #[test]
    fn domain_matching() {
        let allowed = vec!["python.langchain.com".to_string()];
        let ok = Url::parse("https://python.langchain.com/x").unwrap();
        let sub = Url::parse("https://api.python.langchain.com/x").unwrap();
        let other = Url::parse("https://github.com/x").unwrap();
        let lookalike = Url::parse("https://evilpython.langchain.com.example/x").unwrap();
        assert!(domain_allowed(&ok, &allowed));
        assert!(domain_allowed(&sub, &allowed));
        assert!(!domain_allowed(&other, &allowed));
        assert!(!domain_allowed(&lookalike, &allowed));
        assert!(domain_allowed(&other, &[]));
    }
}
