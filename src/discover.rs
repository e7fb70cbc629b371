use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::ai::prompts;
use crate::ai::{Gateway, Mode};
use crate::checkpoint::CheckpointStore;
use crate::config::Settings;
use crate::db::TabularStore;
use crate::entity::{EntityKind, RAW_HEADERS};
use crate::normalize::{host_of, normalize_key, normalize_url, NA};
use crate::pacer::Pacer;
use crate::parser::links;
use crate::pipeline::Services;
use crate::scraper::{fetch_or_none, PageFetcher};
use crate::search::Searcher;

#[derive(Debug, Default)]
pub struct DiscoverySummary {
    pub missions: usize,
    pub keywords: usize,
    pub anchors_visited: usize,
    pub anchors_skipped: usize,
    pub added: usize,
    pub duplicates: usize,
    pub interrupted: bool,
}

/// One candidate row for the raw table.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Lead {
    name: String,
    kind: String,
    website: String,
}

/// Turns missions into anchor pages and anchor pages into raw entity rows.
pub struct Discovery<'a> {
    settings: &'a Settings,
    store: &'a dyn TabularStore,
    gateway: Gateway,
    searcher: Searcher,
    fetcher: Arc<dyn PageFetcher>,
    anchors: CheckpointStore,
    pacer: Pacer,
    known: HashSet<String>,
    stop: Arc<AtomicBool>,
}

impl<'a> Discovery<'a> {
    pub fn new(
        settings: &'a Settings,
        services: &Services,
        store: &'a dyn TabularStore,
        anchors: CheckpointStore,
        pacer: Pacer,
    ) -> Self {
        Self {
            settings,
            store,
            gateway: services.gateway(settings),
            searcher: services.searcher(settings),
            fetcher: services.fetcher.clone(),
            anchors,
            pacer,
            known: HashSet::new(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    #[cfg(test)]
    pub fn with_gateway(mut self, gateway: Gateway) -> Self {
        self.gateway = gateway;
        self
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    #[cfg(test)]
    pub fn anchors(&self) -> &CheckpointStore {
        &self.anchors
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub async fn run(&mut self, missions: &[String]) -> Result<DiscoverySummary> {
        let settings = self.settings;
        let input = &settings.sheets.input;
        self.store.ensure_table(input, &RAW_HEADERS)?;
        self.known = self
            .store
            .read_all(input)?
            .iter()
            .filter_map(|row| row.first())
            .map(|name| normalize_key(name))
            .collect();
        info!(existing = self.known.len(), anchors = self.anchors.len(), "Starting discovery");

        let mut summary = DiscoverySummary::default();
        'missions: for mission in missions {
            summary.missions += 1;
            let keywords = self.keywords(mission).await;
            info!(mission = %mission, keywords = keywords.len(), "Mission keywords");

            for keyword in keywords {
                if self.stopping() {
                    summary.interrupted = true;
                    break 'missions;
                }
                summary.keywords += 1;
                self.pacer.long().await;
                self.keyword(&keyword, &mut summary).await;
            }
        }

        info!(
            added = summary.added,
            duplicates = summary.duplicates,
            anchors = summary.anchors_visited,
            "Discovery finished"
        );
        Ok(summary)
    }

    async fn keywords(&self, mission: &str) -> Vec<String> {
        let limit = self.settings.discovery.keywords_per_mission;
        let prompt = prompts::discovery_keywords(mission, limit);
        let raw = self
            .gateway
            .classify(&prompt, Mode::Text, None)
            .await
            .map(|v| prompts::keywords(&v))
            .unwrap_or_default();

        let mut seen = HashSet::new();
        raw.into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty() && seen.insert(k.to_lowercase()))
            .take(limit)
            .collect()
    }

    async fn keyword(&mut self, keyword: &str, summary: &mut DiscoverySummary) {
        let candidates = self.searcher.candidates(keyword).await;
        let mut anchors = Vec::new();
        for c in candidates {
            if self.anchors.contains(&c.url) {
                debug!(url = %c.url, "Anchor already processed");
                summary.anchors_skipped += 1;
                continue;
            }
            if anchors.len() < self.settings.discovery.max_sources_per_keyword {
                anchors.push(c.url);
            }
        }
        if anchors.is_empty() {
            info!(keyword, "No new anchor pages");
            return;
        }

        for url in anchors {
            if self.stopping() {
                summary.interrupted = true;
                return;
            }
            self.pacer.short().await;
            match self.visit(&url, summary).await {
                Ok(()) => {
                    summary.anchors_visited += 1;
                    if let Err(e) = self.anchors.commit(&url) {
                        warn!(url = %url, error = %e, "Could not checkpoint anchor");
                    }
                }
                Err(e) => warn!(url = %url, error = %e, "Anchor skipped"),
            }
        }
    }

    /// Extract leads from one anchor and append the new ones. A page that
    /// cannot be fetched counts as visited; a failed append does not.
    async fn visit(&mut self, url: &str, summary: &mut DiscoverySummary) -> Result<()> {
        let Some(page) = fetch_or_none(self.fetcher.as_ref(), url).await else {
            return Ok(());
        };

        let anchor_host = host_of(url);
        let mut leads: BTreeMap<String, Lead> = BTreeMap::new();
        if let Some(html) = &page.html {
            for (name, link) in links::extract(html, url, &self.settings.extract) {
                let website = if host_of(&link) == anchor_host {
                    NA.to_string()
                } else {
                    normalize_url(&link)
                };
                leads.insert(
                    normalize_key(&name),
                    Lead {
                        name,
                        kind: NA.to_string(),
                        website,
                    },
                );
            }
        }

        self.pacer.short().await;
        let prompt = prompts::page_entities(&page.text);
        if let Some(v) = self.gateway.classify(&prompt, Mode::Text, Some("entities")).await {
            for found in prompts::entity_leads(&v) {
                let kind = EntityKind::parse(&found.kind).to_string();
                leads
                    .entry(normalize_key(&found.name))
                    .and_modify(|l| l.kind = kind.clone())
                    .or_insert(Lead {
                        name: found.name,
                        kind,
                        website: NA.to_string(),
                    });
            }
        }

        let mut rows = Vec::new();
        for (key, lead) in leads {
            if rows.len() >= self.settings.discovery.max_entities_per_source {
                break;
            }
            if self.known.contains(&key) {
                summary.duplicates += 1;
                continue;
            }
            rows.push(vec![lead.name, lead.kind, lead.website, NA.to_string(), url.to_string()]);
            self.known.insert(key);
        }
        if rows.is_empty() {
            info!(url, "No new entities on anchor page");
            return Ok(());
        }

        let added = match self.store.append_rows(&self.settings.sheets.input, &rows) {
            Ok(n) => n,
            Err(e) => {
                for row in &rows {
                    self.known.remove(&normalize_key(&row[0]));
                }
                return Err(e);
            }
        };
        info!(url, added, "Saved raw entities");
        summary.added += added;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::pipeline::tests::{MapFetcher, RuleModel};
    use crate::search::tests::CannedSearch;
    use std::time::Duration;

    const KEYWORDS: &str = "Suggest";
    const ENTITIES: &str = "List the state-level sports organizations";

    const ANCHOR: &str = "https://gsfa.example.org/clubs";
    const ANCHOR_HTML: &str = r#"<html><body><ul>
        <li><a href="/">Home</a></li>
        <li><a href="https://vadodarastrikers.in/team">Vadodara Strikers</a></li>
        <li><a href="/members/arfc.html">Ahmedabad Racquet FC</a></li>
        </ul><p>The Gujarat State Football League is run by the GSFA.</p></body></html>"#;

    fn discovery<'a>(settings: &'a Settings, store: &'a SqliteStore, services: &Services) -> Discovery<'a> {
        let anchors = CheckpointStore::load(&settings.paths.anchors).unwrap();
        let gateway = services.gateway(settings).with_backoff_unit(Duration::ZERO);
        Discovery::new(settings, services, store, anchors, Pacer::disabled()).with_gateway(gateway)
    }

    fn collaborators() -> (Services, Arc<RuleModel>, Arc<MapFetcher>) {
        let model = RuleModel::new(&[
            (KEYWORDS, r#"{"keywords": ["gujarat football clubs list", "Gujarat Football Clubs List", " "]}"#),
            (ENTITIES, r#"{"entities": [
                {"name": "Gujarat State Football League", "type": "league"},
                {"name": "Vadodara Strikers", "type": "Team"}
            ]}"#),
        ]);
        let search = CannedSearch::new(&[
            ("Clubs", ANCHOR),
            ("Wiki", "https://en.wikipedia.org/wiki/GSFA"),
        ]);
        let fetcher = MapFetcher::new(&[(ANCHOR, ANCHOR_HTML)]);
        let services = Services {
            model: model.clone(),
            search,
            fetcher: fetcher.clone(),
        };
        (services, model, fetcher)
    }

    fn settings(dir: &tempfile::TempDir) -> Settings {
        let mut s = Settings::default();
        s.paths.anchors = dir.path().join("processed_anchors.txt");
        s
    }

    #[tokio::test]
    async fn anchor_page_yields_merged_raw_rows() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&dir);
        let store = SqliteStore::in_memory().unwrap();
        let (services, _, _) = collaborators();

        let mut d = discovery(&settings, &store, &services);
        let summary = d.run(&["Find member clubs".to_string()]).await.unwrap();

        assert_eq!(summary.keywords, 1);
        assert_eq!(summary.anchors_visited, 1);
        assert_eq!(summary.added, 3);
        assert!(d.anchors().contains(ANCHOR));

        let rows = store.read_all(&settings.sheets.input).unwrap();
        let find = |name: &str| rows.iter().find(|r| r[0] == name).cloned().unwrap();
        assert_eq!(
            find("Vadodara Strikers"),
            vec!["Vadodara Strikers", "Team", "https://vadodarastrikers.in", "NA", ANCHOR]
        );
        // link back into the directory itself is not the club's website
        assert_eq!(find("Ahmedabad Racquet FC")[2], "NA");
        assert_eq!(find("Gujarat State Football League")[1], "League");
    }

    #[tokio::test]
    async fn processed_anchor_not_revisited() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&dir);
        let store = SqliteStore::in_memory().unwrap();

        let (services, _, _) = collaborators();
        discovery(&settings, &store, &services).run(&["m".to_string()]).await.unwrap();

        let (services, _, fetcher) = collaborators();
        let summary = discovery(&settings, &store, &services).run(&["m".to_string()]).await.unwrap();
        assert_eq!(summary.anchors_skipped, 1);
        assert_eq!(summary.added, 0);
        assert_eq!(fetcher.calls(), 0);
        assert_eq!(store.read_all(&settings.sheets.input).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn existing_names_not_duplicated() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&dir);
        let store = SqliteStore::in_memory().unwrap();
        store.ensure_table(&settings.sheets.input, &RAW_HEADERS).unwrap();
        let existing: Vec<String> = ["vadodara strikers", "Team", "NA", "NA", "manual"].iter().map(|s| s.to_string()).collect();
        store.append_rows(&settings.sheets.input, &[existing]).unwrap();

        let (services, _, _) = collaborators();
        let summary = discovery(&settings, &store, &services).run(&["m".to_string()]).await.unwrap();
        assert_eq!(summary.added, 2);
        assert_eq!(summary.duplicates, 1);
    }

    #[tokio::test]
    async fn entity_cap_per_source() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(&dir);
        settings.discovery.max_entities_per_source = 1;
        let store = SqliteStore::in_memory().unwrap();
        let (services, _, _) = collaborators();
        let summary = discovery(&settings, &store, &services).run(&["m".to_string()]).await.unwrap();
        assert_eq!(summary.added, 1);
    }
}
