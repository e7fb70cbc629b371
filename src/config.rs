use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::Config;
use serde::{Deserialize, Serialize};

use crate::parser::links::ExtractPolicy;
use crate::triage::{Tier, TriageConfig};

pub const DEFAULT_CONFIG_PATH: &str = "scout.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub paths: Paths,
    pub sheets: Sheets,
    pub triage: TriageConfig,
    pub search: SearchSettings,
    pub fetch: FetchSettings,
    pub model: ModelSettings,
    pub extract: ExtractPolicy,
    pub pacing: PacingSettings,
    pub run: RunSettings,
    pub discovery: DiscoverySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Paths {
    pub db: PathBuf,
    pub checkpoint: PathBuf,
    pub anchors: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            db: PathBuf::from("data/scout.sqlite"),
            checkpoint: PathBuf::from("data/processed_entities.txt"),
            anchors: PathBuf::from("data/processed_anchors.txt"),
        }
    }
}

/// Table names. Tier tables map 1:1 onto `Tier`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Sheets {
    pub input: String,
    pub hot_lead: String,
    pub reach_lead: String,
    pub redesign: String,
    pub low_priority: String,
    pub reject: String,
}

impl Default for Sheets {
    fn default() -> Self {
        Self {
            input: "Extracted Raw Entities".into(),
            hot_lead: "P1 - HOT Leads (<30k Followers)".into(),
            reach_lead: "P2 - Web Leads (>30k Followers)".into(),
            redesign: "P3 - Redesign Leads (Bad Website)".into(),
            low_priority: "P4 - Good Website (Low Priority)".into(),
            reject: "P5 - Rejects (No Presence)".into(),
        }
    }
}

impl Sheets {
    pub fn for_tier(&self, tier: Tier) -> &str {
        match tier {
            Tier::HotLead => &self.hot_lead,
            Tier::ReachLead => &self.reach_lead,
            Tier::Redesign => &self.redesign,
            Tier::LowPriority => &self.low_priority,
            Tier::Reject => &self.reject,
        }
    }

    /// Every output table, in tier order.
    pub fn outputs(&self) -> Vec<(Tier, &str)> {
        Tier::ALL.iter().map(|t| (*t, self.for_tier(*t))).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub top_n: usize,
    /// Host substrings never treated as an entity's own site.
    pub blacklist: Vec<String>,
}

impl Default for SearchSettings {
    fn default() -> Self {
        let blacklist = [
            "google.com", "facebook.com", "instagram.com", "twitter.com", "x.com",
            "linkedin.com", "youtube.com", "wikipedia.org", "medium.com", "quora.com",
            "blogspot.com", "justdial.com", "indiamart.com", "zaubacorp.com",
            "sulekha.com", "amazon.", "flipkart.",
        ];
        Self {
            top_n: 5,
            blacklist: blacklist.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchBackend {
    Http,
    Spider,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    pub backend: FetchBackend,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            backend: FetchBackend::Http,
            timeout_secs: 45,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/118.0.0.0 Safari/537.36"
                .into(),
        }
    }
}

impl FetchSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub name: String,
    pub max_attempts: u32,
    /// One back-off unit in seconds; retry waits are multiples of this.
    pub backoff_unit_secs: u64,
    pub timeout_secs: u64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            name: "gemini-2.5-flash".into(),
            max_attempts: 3,
            backoff_unit_secs: 1,
            timeout_secs: 120,
        }
    }
}

/// Inclusive range of seconds for a randomized pause.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PauseRange {
    pub min_secs: f64,
    pub max_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingSettings {
    pub short: PauseRange,
    pub long: PauseRange,
}

impl Default for PacingSettings {
    fn default() -> Self {
        Self {
            short: PauseRange { min_secs: 0.8, max_secs: 1.8 },
            long: PauseRange { min_secs: 2.5, max_secs: 5.5 },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub flush_every: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self { flush_every: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub missions: Vec<String>,
    pub keywords_per_mission: usize,
    pub max_sources_per_keyword: usize,
    pub max_entities_per_source: usize,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            missions: vec![
                "Find member clubs of the state football association".into(),
                "Find participating teams in state-level cricket leagues".into(),
                "Find directories of sports academies and venues in the city".into(),
            ],
            keywords_per_mission: 5,
            max_sources_per_keyword: 3,
            max_entities_per_source: 15,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            paths: Paths::default(),
            sheets: Sheets::default(),
            triage: TriageConfig::default(),
            search: SearchSettings::default(),
            fetch: FetchSettings::default(),
            model: ModelSettings::default(),
            extract: ExtractPolicy::default(),
            pacing: PacingSettings::default(),
            run: RunSettings::default(),
            discovery: DiscoverySettings::default(),
        }
    }
}

impl Settings {
    /// Defaults, then the TOML file (optional unless given explicitly), then
    /// `SCOUT_*` environment variables (`__` between nested keys).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => config::File::from(p).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_PATH).required(false),
        };
        let settings: Settings = Config::builder()
            .add_source(Config::try_from(&Settings::default())?)
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("SCOUT")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.search.top_n == 0 {
            bail!("search.top_n must be at least 1");
        }
        if self.model.max_attempts == 0 {
            bail!("model.max_attempts must be at least 1");
        }
        if self.extract.min_name_len > self.extract.max_name_len {
            bail!(
                "extract.min_name_len ({}) exceeds extract.max_name_len ({})",
                self.extract.min_name_len,
                self.extract.max_name_len
            );
        }
        for range in [self.pacing.short, self.pacing.long] {
            if range.min_secs < 0.0 || range.min_secs > range.max_secs {
                bail!("invalid pause range {:?}", range);
            }
        }
        let mut names: Vec<&str> = self.sheets.outputs().into_iter().map(|(_, n)| n).collect();
        names.push(&self.sheets.input);
        names.sort_unstable();
        names.dedup();
        if names.len() != Tier::ALL.len() + 1 {
            bail!("sheet names must be distinct (input plus one per tier)");
        }
        Ok(())
    }
}

/// API keys. Only ever read from the environment.
#[derive(Clone)]
pub struct Secrets {
    pub gemini_api_key: String,
    pub serper_api_key: String,
    pub spider_api_key: Option<String>,
}

impl Secrets {
    pub fn from_env(settings: &Settings) -> Result<Self> {
        let gemini_api_key = required_env("GEMINI_API_KEY")?;
        let serper_api_key = required_env("SERPER_API_KEY")?;
        let spider_api_key = std::env::var("SPIDER_API_KEY").ok().filter(|k| !k.is_empty());
        if settings.fetch.backend == FetchBackend::Spider && spider_api_key.is_none() {
            bail!("SPIDER_API_KEY environment variable must be set for fetch.backend = \"spider\"");
        }
        Ok(Self {
            gemini_api_key,
            serper_api_key,
            spider_api_key,
        })
    }
}

fn required_env(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => bail!("{} environment variable must be set", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let s = Settings::default();
        s.validate().unwrap();
        assert_eq!(s.triage.follower_threshold, 30_000);
        assert_eq!(s.search.top_n, 5);
        assert_eq!(s.fetch.timeout(), Duration::from_secs(45));
        assert_eq!(s.sheets.for_tier(Tier::Reject), "P5 - Rejects (No Presence)");
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scout.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "[triage]\nfollower_threshold = 10000\nscheme = \"three\"\n\n[search]\ntop_n = 3\n"
        )
        .unwrap();

        let s = Settings::load(Some(&path)).unwrap();
        assert_eq!(s.triage.follower_threshold, 10_000);
        assert_eq!(s.search.top_n, 3);
        // untouched sections keep their defaults
        assert_eq!(s.model.max_attempts, 3);
        assert!(!s.search.blacklist.is_empty());
    }

    #[test]
    fn duplicate_sheet_names_rejected() {
        let mut s = Settings::default();
        s.sheets.reach_lead = s.sheets.hot_lead.clone();
        assert!(s.validate().is_err());
    }

    #[test]
    fn inverted_name_bounds_rejected() {
        let mut s = Settings::default();
        s.extract.min_name_len = 50;
        s.extract.max_name_len = 10;
        assert!(s.validate().is_err());
    }
}
