use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::SearchSettings;
use crate::normalize::host_of;
use crate::parser::links::is_blocked_host;

const SERPER_URL: &str = "https://google.serper.dev/search";
const SNIPPET_RESULTS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateLink {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<CandidateLink>>;
}

// ── Serper (Google results over JSON) ──

pub struct SerperSearch {
    api_key: String,
    client: reqwest::Client,
}

#[derive(Debug, serde::Deserialize)]
struct SerperResponse {
    #[serde(default)]
    organic: Vec<SerperResult>,
}

#[derive(Debug, serde::Deserialize)]
struct SerperResult {
    #[serde(default)]
    link: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    snippet: String,
}

impl SerperSearch {
    pub fn new(api_key: &str) -> Result<Self> {
        Ok(Self {
            api_key: api_key.to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .context("Failed to build HTTP client")?,
        })
    }
}

#[async_trait]
impl SearchProvider for SerperSearch {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<CandidateLink>> {
        debug!(query, max_results, "Serper search");

        let body = serde_json::json!({
            "q": query,
            "num": max_results,
        });

        let data: SerperResponse = self
            .client
            .post(SERPER_URL)
            .header("X-API-KEY", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("Serper API request failed")?
            .error_for_status()
            .context("Serper API returned an error")?
            .json()
            .await
            .context("Failed to parse Serper response")?;

        Ok(data
            .organic
            .into_iter()
            .map(|r| CandidateLink {
                title: r.title,
                url: r.link,
                snippet: r.snippet,
            })
            .collect())
    }
}

/// Search with the pipeline's filtering rules applied. Provider failures
/// are logged and read as "no results".
#[derive(Clone)]
pub struct Searcher {
    provider: Arc<dyn SearchProvider>,
    top_n: usize,
    blacklist: Vec<String>,
}

impl Searcher {
    pub fn new(provider: Arc<dyn SearchProvider>, settings: &SearchSettings) -> Self {
        Self {
            provider,
            top_n: settings.top_n.max(1),
            blacklist: settings.blacklist.clone(),
        }
    }

    /// Up to `top_n` distinct web results, blacklisted hosts removed.
    pub async fn candidates(&self, query: &str) -> Vec<CandidateLink> {
        let raw = match self.provider.search(query, (self.top_n * 2).min(20)).await {
            Ok(r) => r,
            Err(e) => {
                warn!(query, error = %e, "Search failed");
                return Vec::new();
            }
        };

        let mut seen = HashSet::new();
        let kept: Vec<CandidateLink> = raw
            .into_iter()
            .filter(|c| c.url.starts_with("http://") || c.url.starts_with("https://"))
            .filter(|c| match host_of(&c.url) {
                Some(host) => !is_blocked_host(&host, &self.blacklist),
                None => false,
            })
            .filter(|c| seen.insert(c.url.clone()))
            .take(self.top_n)
            .collect();

        info!(query, count = kept.len(), "Search candidates");
        kept
    }

    /// Result titles, links and snippets as one text block, unfiltered.
    pub async fn snippets(&self, query: &str) -> Option<String> {
        let results = match self.provider.search(query, SNIPPET_RESULTS).await {
            Ok(r) => r,
            Err(e) => {
                warn!(query, error = %e, "Snippet search failed");
                return None;
            }
        };
        if results.is_empty() {
            return None;
        }
        let mut block = String::new();
        for r in &results {
            let _ = writeln!(block, "{}\n{}\n{}\n", r.title, r.url, r.snippet);
        }
        Some(block)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Returns the same canned results for every query.
    pub(crate) struct CannedSearch {
        pub(crate) results: Vec<CandidateLink>,
        pub(crate) queries: Mutex<Vec<String>>,
    }

    impl CannedSearch {
        pub(crate) fn new(urls: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                results: urls
                    .iter()
                    .map(|(title, url)| CandidateLink {
                        title: title.to_string(),
                        url: url.to_string(),
                        snippet: format!("{} snippet", title),
                    })
                    .collect(),
                queries: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SearchProvider for CannedSearch {
        async fn search(&self, query: &str, max_results: usize) -> Result<Vec<CandidateLink>> {
            self.queries.lock().unwrap().push(query.to_string());
            Ok(self.results.iter().take(max_results).cloned().collect())
        }
    }

    struct Failing;

    #[async_trait]
    impl SearchProvider for Failing {
        async fn search(&self, _: &str, _: usize) -> Result<Vec<CandidateLink>> {
            anyhow::bail!("HTTP 403")
        }
    }

    #[tokio::test]
    async fn blacklist_and_top_n_applied() {
        let provider = CannedSearch::new(&[
            ("Gir Lions - Wikipedia", "https://en.wikipedia.org/wiki/Gir_Lions"),
            ("Gir Lions", "https://www.facebook.com/girlions"),
            ("Gir Lions Official", "https://girlions.com/"),
            ("Gir Lions Official", "https://girlions.com/"),
            ("Amazon", "https://www.amazon.in/gir"),
            ("FTP", "ftp://files.example.org"),
            ("Scores", "https://cricscores.in/gir-lions"),
        ]);
        let settings = SearchSettings { top_n: 5, ..Default::default() };
        let searcher = Searcher::new(provider, &settings);
        let urls: Vec<String> = searcher
            .candidates("gir lions official website")
            .await
            .into_iter()
            .map(|c| c.url)
            .collect();
        assert_eq!(urls, vec!["https://girlions.com/", "https://cricscores.in/gir-lions"]);
    }

    #[tokio::test]
    async fn top_n_caps_results() {
        let provider = CannedSearch::new(&[
            ("a", "https://a.in"),
            ("b", "https://b.in"),
            ("c", "https://c.in"),
        ]);
        let settings = SearchSettings { top_n: 2, ..Default::default() };
        let searcher = Searcher::new(provider, &settings);
        assert_eq!(searcher.candidates("q").await.len(), 2);
    }

    #[tokio::test]
    async fn snippets_are_unfiltered() {
        let provider = CannedSearch::new(&[("Gir Lions on Instagram", "https://instagram.com/girlions")]);
        let searcher = Searcher::new(provider, &SearchSettings::default());
        let block = searcher.snippets("gir lions instagram").await.unwrap();
        assert!(block.contains("https://instagram.com/girlions"));
        assert!(block.contains("Gir Lions on Instagram snippet"));
    }

    #[tokio::test]
    async fn provider_failure_is_empty() {
        let searcher = Searcher::new(Arc::new(Failing), &SearchSettings::default());
        assert!(searcher.candidates("q").await.is_empty());
        assert!(searcher.snippets("q").await.is_none());
    }
}
