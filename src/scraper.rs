use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use scraper::{Html, Selector};
use spider_client::shapes::request::{ReturnFormat, ReturnFormatHandling};
use spider_client::{RequestParams, Spider};
use tracing::{debug, warn};

use crate::config::FetchSettings;
use crate::error::FetchError;

const MAX_RETRIES: u32 = 2;
const BASE_BACKOFF_MS: u64 = 2000;

static BODY_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("body").unwrap());

/// A fetched page: visible text for the model, raw HTML when the backend
/// returns it.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub url: String,
    pub text: String,
    pub html: Option<String>,
}

impl Page {
    pub fn from_html(url: &str, html: String) -> Self {
        Self {
            url: url.to_string(),
            text: html_to_text(&html),
            html: Some(html),
        }
    }
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Page, FetchError>;

    /// PNG of the rendered page, for backends that render.
    async fn screenshot(&self, _url: &str) -> Option<Vec<u8>> {
        None
    }
}

/// Fetch, logging failures as "no content".
pub async fn fetch_or_none(fetcher: &dyn PageFetcher, url: &str) -> Option<Page> {
    match fetcher.fetch(url).await {
        Ok(page) if !page.text.trim().is_empty() => {
            debug!(url = %page.url, chars = page.text.len(), "Page text ready");
            Some(page)
        }
        Ok(_) => {
            warn!(url, "Page has no visible text");
            None
        }
        Err(e) => {
            warn!(url, error = %e, "Page fetch failed");
            None
        }
    }
}

// ── Plain HTTP ──

pub struct HttpFetcher {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(settings: &FetchSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout())
            .user_agent(settings.user_agent.clone())
            .build()?;
        Ok(Self {
            http,
            timeout: settings.timeout(),
        })
    }

    async fn fetch_once(&self, url: &str) -> Result<Page, FetchError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let body = response.text().await.map_err(|e| self.transport_error(e))?;
        if body.trim().is_empty() {
            return Err(FetchError::Empty);
        }
        Ok(Page::from_html(url, body))
    }

    fn transport_error(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else if e.is_builder() {
            FetchError::InvalidUrl(e.to_string())
        } else {
            FetchError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Page, FetchError> {
        check_url(url)?;
        with_retry(url, || self.fetch_once(url)).await
    }
}

// ── Spider cloud crawler ──

pub struct SpiderFetcher {
    spider: Spider,
}

impl SpiderFetcher {
    pub fn new(api_key: &str) -> Result<Self> {
        let spider = Spider::new(Some(api_key.to_string()))
            .map_err(|e| anyhow::anyhow!("Failed to create Spider client: {}", e))?;
        Ok(Self { spider })
    }

    async fn fetch_once(&self, url: &str) -> Result<Page, FetchError> {
        let params = RequestParams {
            return_format: Some(ReturnFormatHandling::Single(ReturnFormat::Raw)),
            ..Default::default()
        };

        let response = self
            .spider
            .scrape_url(url, Some(params), "application/json")
            .await
            .map_err(|e| match e.status() {
                Some(s) => FetchError::Status {
                    status: s.as_u16(),
                    url: url.to_string(),
                },
                None => FetchError::Transport(e.to_string()),
            })?;

        let parsed: serde_json::Value = match response.as_str() {
            Some(s) => serde_json::from_str(s).unwrap_or(response.clone()),
            None => response,
        };
        let first = parsed.as_array().and_then(|arr| arr.first());

        if let Some(status) = first
            .and_then(|obj| obj.get("status"))
            .and_then(|s| s.as_u64())
            .filter(|s| *s >= 400)
        {
            return Err(FetchError::Status {
                status: status as u16,
                url: url.to_string(),
            });
        }

        let html = first
            .and_then(|obj| obj.get("content"))
            .and_then(|c| c.as_str())
            .filter(|c| !c.trim().is_empty())
            .ok_or(FetchError::Empty)?;

        Ok(Page::from_html(url, html.to_string()))
    }
}

#[async_trait]
impl PageFetcher for SpiderFetcher {
    async fn fetch(&self, url: &str) -> Result<Page, FetchError> {
        check_url(url)?;
        with_retry(url, || self.fetch_once(url)).await
    }
}

fn check_url(url: &str) -> Result<(), FetchError> {
    match url::Url::parse(url) {
        Ok(u) if matches!(u.scheme(), "http" | "https") => Ok(()),
        _ => Err(FetchError::InvalidUrl(url.to_string())),
    }
}

/// Retry transient failures with exponential backoff.
async fn with_retry<F, Fut>(url: &str, mut op: F) -> Result<Page, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Page, FetchError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
                let backoff = Duration::from_millis(BASE_BACKOFF_MS * 2u64.pow(attempt));
                warn!(
                    "Fetch of {} failed ({}), attempt {}/{}, backing off {:.1}s",
                    url,
                    e,
                    attempt + 1,
                    MAX_RETRIES,
                    backoff.as_secs_f64()
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            result => {
                if result.is_ok() {
                    debug!(url, attempts = attempt + 1, "Fetched page");
                }
                return result;
            }
        }
    }
}

/// Visible body text, one line per text run; scripts and styles dropped.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let root = document
        .select(&BODY_SELECTOR)
        .next()
        .unwrap_or_else(|| document.root_element());

    let mut lines: Vec<String> = Vec::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .is_some_and(|e| matches!(e.name(), "script" | "style" | "noscript" | "template"))
        });
        if hidden {
            continue;
        }
        let line = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines.join("\n")
}
