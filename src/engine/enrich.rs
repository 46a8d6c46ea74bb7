// Keywatch Engine — URL Enricher
//
// Link-only posts carry almost no matchable text; their n-grams would match
// arbitrary queries through the URL itself. For such posts the enricher
// fetches up to the first two URLs and substitutes extracted page text
// (title, meta description, readable body) for matching purposes. The
// original text is retained for display. If every fetch fails the message
// is skipped entirely.

use crate::atoms::constants::{ENRICH_FETCH_TIMEOUT_SECS, ENRICH_MAX_TEXT_CHARS, ENRICH_MAX_URLS, URL_ONLY_MAX_RESIDUE_CHARS};
use log::{debug, info, warn};
use regex::Regex;
use scraper::{Html, Selector};
use std::sync::LazyLock;
use std::time::Duration;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s<>()]+").expect("static URL regex"));

/// What enrichment decided for one message.
#[derive(Debug, Clone, PartialEq)]
pub enum EnrichOutcome {
    /// The message has enough of its own text; match it as-is.
    NotUrlOnly,
    /// URL-only message with fetched content — match against this text.
    Enriched(String),
    /// URL-only and nothing could be fetched — do not process the message.
    Skip,
}

pub struct UrlEnricher {
    client: reqwest::Client,
}

impl UrlEnricher {
    pub fn new() -> Self {
        // Pages must answer fast or not at all; a browser user agent keeps
        // listing sites from serving their bot-wall stubs.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(ENRICH_FETCH_TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent("Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36")
            .build()
            .unwrap_or_else(|e| {
                warn!("[enrich] Client builder failed ({}) — using defaults", e);
                reqwest::Client::new()
            });
        UrlEnricher { client }
    }

    /// All URLs in a text, in order of appearance.
    pub fn find_urls(text: &str) -> Vec<String> {
        URL_RE.find_iter(text).map(|m| m.as_str().to_string()).collect()
    }

    /// A message is URL-only when stripping its URLs leaves fewer than ten
    /// characters of real content.
    pub fn is_url_only(text: &str) -> bool {
        if !URL_RE.is_match(text) {
            return false;
        }
        let residue = URL_RE.replace_all(text, "");
        residue.chars().filter(|c| c.is_alphanumeric()).count() < URL_ONLY_MAX_RESIDUE_CHARS
    }

    /// Apply the enrichment policy to a message text.
    pub async fn enrich(&self, text: &str) -> EnrichOutcome {
        if !Self::is_url_only(text) {
            return EnrichOutcome::NotUrlOnly;
        }

        let urls: Vec<String> = Self::find_urls(text)
            .into_iter()
            .filter(|u| url::Url::parse(u).is_ok())
            .collect();
        let mut parts: Vec<String> = Vec::new();
        for url in urls.iter().take(ENRICH_MAX_URLS) {
            match self.fetch_page_text(url).await {
                Ok(page_text) if !page_text.trim().is_empty() => {
                    debug!("[enrich] Fetched {} chars from {}", page_text.len(), url);
                    parts.push(page_text);
                }
                Ok(_) => {
                    debug!("[enrich] No readable text at {}", url);
                }
                Err(e) => {
                    warn!("[enrich] Fetch failed for {}: {}", url, e);
                }
            }
        }

        if parts.is_empty() {
            info!("[enrich] URL-only message with no fetchable content — skipping");
            return EnrichOutcome::Skip;
        }

        let mut combined = parts.join("\n\n");
        if combined.chars().count() > ENRICH_MAX_TEXT_CHARS {
            combined = combined.chars().take(ENRICH_MAX_TEXT_CHARS).collect();
        }
        EnrichOutcome::Enriched(combined)
    }

    /// Fetch one URL and extract its readable text.
    async fn fetch_page_text(&self, url: &str) -> Result<String, String> {
        let resp = self.client.get(url).send().await.map_err(|e| e.to_string())?;

        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }

        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = resp.text().await.map_err(|e| e.to_string())?;

        if !content_type.contains("html") {
            // Plain text / JSON bodies are usable as-is.
            return Ok(body);
        }

        Ok(extract_page_text(&body))
    }
}

impl Default for UrlEnricher {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract title + meta description + readable content from an HTML page,
/// skipping script/style/navigation noise.
/// Tries <article>, <main>, then falls back to paragraph-level elements.
fn extract_page_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut sections: Vec<String> = Vec::new();

    if let Ok(sel) = Selector::parse("title") {
        if let Some(el) = document.select(&sel).next() {
            let title = el.text().collect::<String>().trim().to_string();
            if !title.is_empty() {
                sections.push(title);
            }
        }
    }

    if let Ok(sel) = Selector::parse("meta[name=description]") {
        if let Some(el) = document.select(&sel).next() {
            if let Some(desc) = el.value().attr("content") {
                let desc = desc.trim();
                if !desc.is_empty() {
                    sections.push(desc.to_string());
                }
            }
        }
    }

    sections.push(extract_readable_text(&document));
    sections.retain(|s| !s.trim().is_empty());
    sections.join("\n\n")
}

/// Extract readable text from an HTML element, skipping nested noise.
fn extract_text_from_element(element: &scraper::ElementRef) -> String {
    let mut text = String::new();
    for node in element.text() {
        let trimmed = node.trim();
        if !trimmed.is_empty() {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(trimmed);
        }
    }
    text
}

/// Readable content from a full HTML document.
/// Tries content-rich containers first, then paragraph-level elements.
fn extract_readable_text(document: &Html) -> String {
    for sel_str in &["article", "main", "[role=main]", ".post-content", ".entry-content"] {
        if let Ok(sel) = Selector::parse(sel_str) {
            let parts: Vec<String> = document
                .select(&sel)
                .map(|el| extract_text_from_element(&el))
                .filter(|t| !t.trim().is_empty())
                .collect();
            if !parts.is_empty() {
                return parts.join("\n\n");
            }
        }
    }

    // Fallback: paragraph-level elements from <body>, skipping short noise.
    if let Ok(body_sel) = Selector::parse("body") {
        if let Some(body) = document.select(&body_sel).next() {
            let mut paragraphs = Vec::new();
            for sel_str in &["p", "h1", "h2", "h3", "li", "blockquote", "td"] {
                if let Ok(sel) = Selector::parse(sel_str) {
                    for el in body.select(&sel) {
                        let text = extract_text_from_element(&el);
                        if text.len() > 20 {
                            paragraphs.push(text);
                        }
                    }
                }
            }
            if !paragraphs.is_empty() {
                paragraphs.dedup();
                return paragraphs.join("\n\n");
            }
            return extract_text_from_element(&body);
        }
    }

    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_urls_in_order() {
        let urls = UrlEnricher::find_urls("see https://a.example/x and http://b.example/y now");
        assert_eq!(urls, vec!["https://a.example/x", "http://b.example/y"]);
    }

    #[test]
    fn url_only_detection() {
        assert!(UrlEnricher::is_url_only("https://example.com/listing/123"));
        assert!(UrlEnricher::is_url_only("👀 https://example.com/listing/123"));
        assert!(!UrlEnricher::is_url_only(
            "Продаю iPhone 15 Pro, подробности тут: https://example.com/listing/123"
        ));
        // No URL at all is never URL-only.
        assert!(!UrlEnricher::is_url_only("Продаю iPhone"));
    }

    #[test]
    fn extracts_title_meta_and_article() {
        let html = r#"<html><head><title>iPhone 15 Pro — продажа</title>
            <meta name="description" content="Продаю iPhone 15 Pro 256gb">
            <script>var x = "noise";</script></head>
            <body><nav>Menu Home About</nav>
            <article>Отличное состояние, полный комплект, цена 80000 рублей.</article>
            </body></html>"#;
        let text = extract_page_text(html);
        assert!(text.contains("iPhone 15 Pro — продажа"));
        assert!(text.contains("Продаю iPhone 15 Pro 256gb"));
        assert!(text.contains("цена 80000"));
        assert!(!text.contains("var x"));
    }

    #[test]
    fn falls_back_to_paragraphs_without_article() {
        let html = r#"<html><body>
            <p>Первый абзац с достаточно длинным текстом объявления.</p>
            <p>ok</p>
            <p>Второй абзац с ещё каким-то осмысленным содержанием.</p>
            </body></html>"#;
        let text = extract_page_text(html);
        assert!(text.contains("Первый абзац"));
        assert!(text.contains("Второй абзац"));
        // Short fragments are dropped.
        assert!(!text.contains("\nok\n"));
    }

    #[tokio::test]
    async fn non_url_only_passes_through() {
        let enricher = UrlEnricher::new();
        let outcome = enricher
            .enrich("Продаю iPhone 15 Pro, подробности: https://example.com/x")
            .await;
        assert_eq!(outcome, EnrichOutcome::NotUrlOnly);
    }

    #[tokio::test]
    async fn url_only_with_unreachable_host_skips() {
        let enricher = UrlEnricher::new();
        let outcome = enricher.enrich("http://127.0.0.1:1/dead-link").await;
        assert_eq!(outcome, EnrichOutcome::Skip);
    }
}
