//! Built-in web scraper: reqwest for HTTP, the `scraper` crate for HTML
//! parsing, htmd for HTML-to-Markdown conversion.
//!
//! No JavaScript rendering; static HTML sites only. Produces one markdown
//! artifact per crawled page. Link discovery stays on the start URL's
//! domain and is bounded by `max_depth` / `max_pages`.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use bytes::Bytes;
use scraper::{Html, Selector};
use tracing::{debug, warn};
use url::Url;

use crate::common::error::Result;
use crate::domains::artifacts::ArtifactMetadata;
use crate::domains::jobs::ScrapeParams;

use super::{ArtifactPayload, CollabContext, CollaboratorOutput, Scraper};

/// Hard ceiling on pages per execution regardless of parameters.
const MAX_PAGES_CEILING: usize = 20;

enum FetchFailure {
    Retryable(String),
    Terminal(String),
}

pub struct SimpleScraper {
    client: reqwest::Client,
}

impl SimpleScraper {
    pub fn new() -> AnyResult<Self> {
        // Browser-like headers avoid trivial bot blocks.
        let user_agent = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }

    async fn fetch_html(&self, url: &str) -> std::result::Result<String, FetchFailure> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchFailure::Retryable(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(FetchFailure::Retryable(format!("HTTP {status} for {url}")));
        }
        if !status.is_success() {
            return Err(FetchFailure::Terminal(format!("HTTP {status} for {url}")));
        }

        response
            .text()
            .await
            .map_err(|e| FetchFailure::Retryable(format!("reading body of {url} failed: {e}")))
    }
}

struct PageExtract {
    title: Option<String>,
    markdown: String,
    links: Vec<String>,
}

/// Parse a fetched page into owned data. Synchronous on purpose: `Html` is
/// not `Send` and must not live across an await point.
fn parse_page(html: &str, page_url: &Url, selector: Option<&str>) -> PageExtract {
    let document = Html::parse_document(html);

    let title = Selector::parse("title").ok().and_then(|sel| {
        document
            .select(&sel)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty())
    });

    let content_html = extract_content(&document, selector);
    let markdown = htmd::convert(&content_html).unwrap_or_else(|_| {
        // Fallback: strip tags and keep the text.
        document.root_element().text().collect::<String>()
    });

    PageExtract {
        title,
        markdown,
        links: extract_links(&document, page_url),
    }
}

/// Pick the content region: the caller's selector if given, otherwise the
/// usual main-content candidates, otherwise the whole document.
fn extract_content(document: &Html, selector: Option<&str>) -> String {
    if let Some(raw) = selector {
        if let Ok(sel) = Selector::parse(raw) {
            let matched: Vec<String> = document.select(&sel).map(|el| el.html()).collect();
            if !matched.is_empty() {
                return matched.join("\n");
            }
        }
    }

    let main_selectors = ["main", "article", "[role='main']", "#content", "#main"];
    for candidate in main_selectors {
        if let Ok(sel) = Selector::parse(candidate) {
            if let Some(el) = document.select(&sel).next() {
                return el.html();
            }
        }
    }

    document.html()
}

/// Same-domain http(s) links, resolved against the page URL.
fn extract_links(document: &Html, base_url: &Url) -> Vec<String> {
    let Ok(link_selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let base_domain = base_url.domain().unwrap_or("");

    document
        .select(&link_selector)
        .filter_map(|el| el.value().attr("href"))
        .filter_map(|href| base_url.join(href).ok())
        .filter(|url| {
            url.domain() == Some(base_domain)
                && (url.scheme() == "http" || url.scheme() == "https")
                && url.fragment().is_none()
        })
        .map(|mut url| {
            url.set_query(None);
            url.to_string()
        })
        .collect()
}

#[async_trait]
impl Scraper for SimpleScraper {
    async fn run(&self, params: &ScrapeParams, ctx: &CollabContext) -> Result<CollaboratorOutput> {
        let start = match Url::parse(&params.url) {
            Ok(url) => url,
            Err(e) => {
                return Ok(CollaboratorOutput::terminal(format!(
                    "invalid url {}: {e}",
                    params.url
                )));
            }
        };

        let max_depth = params.max_depth.unwrap_or(0);
        let max_pages = (params.max_pages.unwrap_or(1) as usize).clamp(1, MAX_PAGES_CEILING);

        let mut artifacts: Vec<ArtifactPayload> = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, u32)> = VecDeque::new();
        queue.push_back((start.to_string(), 0));

        while let Some((page_url, depth)) = queue.pop_front() {
            if ctx.cancel.is_cancelled() {
                return Ok(CollaboratorOutput::retryable("scrape cancelled mid-crawl"));
            }
            if artifacts.len() >= max_pages || !visited.insert(page_url.clone()) {
                continue;
            }

            let html = match self.fetch_html(&page_url).await {
                Ok(html) => html,
                Err(FetchFailure::Retryable(msg)) if artifacts.is_empty() => {
                    return Ok(CollaboratorOutput::retryable(msg));
                }
                Err(FetchFailure::Terminal(msg)) if artifacts.is_empty() => {
                    return Ok(CollaboratorOutput::terminal(msg));
                }
                Err(FetchFailure::Retryable(msg)) | Err(FetchFailure::Terminal(msg)) => {
                    warn!(url = %page_url, error = %msg, "skipping page in crawl");
                    continue;
                }
            };

            let parsed_url = match Url::parse(&page_url) {
                Ok(url) => url,
                Err(_) => continue,
            };
            let page = parse_page(&html, &parsed_url, params.selector.as_deref());
            debug!(url = %page_url, depth, bytes = page.markdown.len(), "scraped page");

            artifacts.push(ArtifactPayload {
                content_type: "text/markdown".into(),
                data: Bytes::from(page.markdown),
                metadata: ArtifactMetadata {
                    source_url: Some(page_url.clone()),
                    title: page.title,
                    ..Default::default()
                },
            });

            if depth < max_depth {
                for link in page.links {
                    if !visited.contains(&link) {
                        queue.push_back((link, depth + 1));
                    }
                }
            }
        }

        Ok(CollaboratorOutput::ok(artifacts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html>
          <head><title>Test Page</title></head>
          <body>
            <nav><a href="/ignored-by-main">nav</a></nav>
            <main>
              <h1>Hello</h1>
              <p>Some <b>content</b> here.</p>
              <a href="/next">next</a>
              <a href="https://elsewhere.test/out">external</a>
            </main>
          </body>
        </html>
    "#;

    #[test]
    fn parse_extracts_title_and_main_content() {
        let url = Url::parse("http://example.test/a").unwrap();
        let page = parse_page(PAGE, &url, None);
        assert_eq!(page.title.as_deref(), Some("Test Page"));
        assert!(page.markdown.contains("Hello"));
        assert!(page.markdown.contains("content"));
        assert!(!page.markdown.contains("nav"));
    }

    #[test]
    fn links_stay_on_domain() {
        let url = Url::parse("http://example.test/a").unwrap();
        let page = parse_page(PAGE, &url, None);
        assert!(page.links.contains(&"http://example.test/next".to_string()));
        assert!(!page.links.iter().any(|l| l.contains("elsewhere.test")));
    }

    #[test]
    fn explicit_selector_wins() {
        let url = Url::parse("http://example.test/a").unwrap();
        let page = parse_page(PAGE, &url, Some("h1"));
        assert!(page.markdown.contains("Hello"));
        assert!(!page.markdown.contains("content"));
    }
}
