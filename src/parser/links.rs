use std::collections::BTreeMap;
use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::normalize::host_of;

static ROW_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("li, tr").unwrap());
static LINK_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());

/// Which link texts count as entity names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractPolicy {
    pub min_name_len: usize,
    pub max_name_len: usize,
    /// Whole-text matches (case-insensitive) that are navigation, not names.
    pub stop_words: Vec<String>,
    /// Phrases that disqualify a text wherever they appear.
    pub stop_phrases: Vec<String>,
    pub blocked_suffixes: Vec<String>,
    /// Host substrings of platforms that are never an entity's own site.
    pub blocked_hosts: Vec<String>,
}

impl Default for ExtractPolicy {
    fn default() -> Self {
        let words = [
            "home", "about", "about us", "contact", "contact us", "sitemap", "disclaimer",
            "privacy", "privacy policy", "terms", "terms of use", "search", "feedback", "help",
            "faq", "login", "register", "download", "downloads", "press", "media", "news",
            "events", "blog", "gallery", "videos", "photos", "career", "careers", "archive",
            "skip to main content", "related resources", "rti information", "dashboard",
            "overview", "summary", "annual report", "tender", "tenders", "next", "previous",
        ];
        let phrases = ["copyright", "read more", "click here", "all rights reserved"];
        let suffixes = [".pdf", ".doc", ".docx", ".xls", ".xlsx", ".zip"];
        let hosts = [
            "facebook.com", "twitter.com", "x.com", "instagram.com", "linkedin.com",
            "youtube.com", "google.", "bing.com", "duckduckgo.com", "yahoo.com",
        ];
        let owned = |xs: &[&str]| xs.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            min_name_len: 5,
            max_name_len: 100,
            stop_words: owned(&words),
            stop_phrases: owned(&phrases),
            blocked_suffixes: owned(&suffixes),
            blocked_hosts: owned(&hosts),
        }
    }
}

impl ExtractPolicy {
    pub fn accepts_name(&self, text: &str) -> bool {
        let len = text.chars().count();
        if len < self.min_name_len || len > self.max_name_len {
            return false;
        }
        let lower = text.to_lowercase();
        if self.stop_words.iter().any(|w| w.eq_ignore_ascii_case(&lower)) {
            return false;
        }
        if self.stop_phrases.iter().any(|p| lower.contains(&p.to_lowercase())) {
            return false;
        }
        !self
            .blocked_suffixes
            .iter()
            .any(|s| lower.ends_with(&s.to_lowercase()))
    }

    pub fn blocks_url(&self, url: &str) -> bool {
        match host_of(url) {
            Some(host) => is_blocked_host(&host, &self.blocked_hosts),
            None => true,
        }
    }
}

/// True when `host` matches any blacklist entry. Entries ending in `.` match
/// any TLD (`amazon.`); others match the host or a subdomain of it.
pub fn is_blocked_host(host: &str, blacklist: &[String]) -> bool {
    let host = host.to_lowercase();
    blacklist.iter().any(|entry| {
        let entry = entry.trim().to_lowercase();
        if entry.is_empty() {
            false
        } else if entry.ends_with('.') {
            host.starts_with(&entry) || host.contains(&format!(".{}", entry))
        } else {
            host == entry || host.ends_with(&format!(".{}", entry))
        }
    })
}

/// Pull candidate entity names from list items and table rows of an anchor
/// page: name → absolute link. Never fails; bad input yields an empty map.
pub fn extract(html: &str, base_url: &str, policy: &ExtractPolicy) -> BTreeMap<String, String> {
    let mut leads = BTreeMap::new();
    let base = match Url::parse(base_url) {
        Ok(u) => u,
        Err(e) => {
            warn!(base_url, error = %e, "Unparseable base URL, no leads extracted");
            return leads;
        }
    };
    if html.trim().is_empty() {
        return leads;
    }

    let document = Html::parse_document(html);
    for item in document.select(&ROW_SELECTOR) {
        let Some(link) = item.select(&LINK_SELECTOR).next() else {
            continue;
        };
        let name = visible_text(&link);
        if !policy.accepts_name(&name) {
            continue;
        }
        let Some(url) = resolve_href(&base, link.value().attr("href").unwrap_or("")) else {
            continue;
        };
        if policy.blocks_url(&url) {
            debug!(name = %name, url = %url, "Skipping blacklisted host");
            continue;
        }
        leads.entry(name).or_insert(url);
    }

    debug!(base_url, count = leads.len(), "Extracted leads");
    leads
}

fn visible_text(el: &ElementRef) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn resolve_href(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
        || href.starts_with("javascript:")
    {
        return None;
    }
    let resolved = base.join(href).ok()?;
    match resolved.scheme() {
        "http" | "https" => Some(resolved.to_string()),
        _ => None,
    }
}
