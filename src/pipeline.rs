use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, error, info, warn};

use crate::ai::prompts::{self, ContactInfo, SocialCheck, Target};
use crate::ai::{Gateway, ImagePart, LanguageModel, Mode};
use crate::checkpoint::CheckpointStore;
use crate::config::Settings;
use crate::db::TabularStore;
use crate::entity::{Entity, InputRow};
use crate::normalize::{is_na, normalize_url, NA};
use crate::pacer::Pacer;
use crate::scraper::{fetch_or_none, Page, PageFetcher};
use crate::search::{SearchProvider, Searcher};
use crate::sink::{RouteOutcome, SinkRouter};
use crate::triage::{triage, Signals, SiteQuality, Tier};

pub const NOTE_SITE_FAILED: &str = "Site visit failed.";
pub const NOTE_NO_WEBSITE: &str = "No official website found.";

/// External collaborators shared by the agents.
#[derive(Clone)]
pub struct Services {
    pub model: Arc<dyn LanguageModel>,
    pub search: Arc<dyn SearchProvider>,
    pub fetcher: Arc<dyn PageFetcher>,
}

impl Services {
    pub fn gateway(&self, settings: &Settings) -> Gateway {
        Gateway::new(self.model.clone(), &settings.model)
    }

    pub fn searcher(&self, settings: &Settings) -> Searcher {
        Searcher::new(self.search.clone(), &settings.search)
    }
}

/// Counts for one `run`.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub considered: usize,
    pub collapsed: usize,
    pub skipped: usize,
    pub processed: usize,
    pub duplicates: usize,
    pub tiers: BTreeMap<Tier, usize>,
    pub written: usize,
    pub unflushed: usize,
    pub interrupted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntityOutcome {
    Routed(Tier),
    Duplicate(RouteOutcome),
    KnownWebsite,
    Interrupted,
}

pub struct Driver<'a> {
    settings: &'a Settings,
    store: &'a dyn TabularStore,
    gateway: Gateway,
    searcher: Searcher,
    fetcher: Arc<dyn PageFetcher>,
    checkpoint: CheckpointStore,
    router: SinkRouter,
    pacer: Pacer,
    stop: Arc<AtomicBool>,
}

impl<'a> Driver<'a> {
    pub fn new(
        settings: &'a Settings,
        services: &Services,
        store: &'a dyn TabularStore,
        checkpoint: CheckpointStore,
        pacer: Pacer,
    ) -> Self {
        Self {
            settings,
            store,
            gateway: services.gateway(settings),
            searcher: services.searcher(settings),
            fetcher: services.fetcher.clone(),
            checkpoint,
            router: SinkRouter::new(),
            pacer,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    #[cfg(test)]
    /// Swap in a differently configured gateway.
    pub fn with_gateway(mut self, gateway: Gateway) -> Self {
        self.gateway = gateway;
        self
    }

    /// Flag checked between steps; set it to stop after draining buffers.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    #[cfg(test)]
    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Enrich and triage every input row not yet checkpointed.
    pub async fn run(&mut self, limit: Option<usize>) -> Result<RunSummary> {
        let settings = self.settings;
        let sheets = &settings.sheets;
        SinkRouter::ensure_tables(self.store, sheets)?;
        self.router
            .load_existing(self.store, sheets, &mut self.checkpoint)
            .context("Failed to read existing output tables")?;

        let header = self
            .store
            .header(&sheets.input)?
            .with_context(|| format!("Input table '{}' not found; run `discover` first", sheets.input))?;
        let rows = self.store.read_all(&sheets.input)?;

        let mut summary = RunSummary::default();
        let mut seen = HashSet::new();
        let mut queue = Vec::new();
        for (i, row) in rows.iter().enumerate() {
            let Some(input) = InputRow::from_row(&header, row) else {
                warn!(row = i + 1, "Skipping input row without a name");
                continue;
            };
            summary.considered += 1;
            if !seen.insert(input.key()) {
                summary.collapsed += 1;
                continue;
            }
            if self.checkpoint.contains(&input.key()) {
                summary.skipped += 1;
                continue;
            }
            queue.push(input);
        }
        if let Some(n) = limit {
            queue.truncate(n);
        }

        info!(
            pending = queue.len(),
            skipped = summary.skipped,
            collapsed = summary.collapsed,
            "Starting enrichment"
        );

        let pb = ProgressBar::new(queue.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")?
                .progress_chars("=> "),
        );

        let flush_every = settings.run.flush_every.max(1);
        for (i, input) in queue.iter().enumerate() {
            if self.stopping() {
                summary.interrupted = true;
                break;
            }
            if i > 0 {
                self.pacer.long().await;
            }
            pb.set_message(input.name.clone());

            let mut entity = input.to_entity();
            match self.process(&mut entity).await {
                EntityOutcome::Interrupted => {
                    summary.interrupted = true;
                    break;
                }
                EntityOutcome::Routed(tier) => {
                    // checkpointed once its row is written, see `drain`
                    info!(entity = %entity.name, tier = %tier, "Triaged");
                    *summary.tiers.entry(tier).or_default() += 1;
                }
                EntityOutcome::Duplicate(_) | EntityOutcome::KnownWebsite => {
                    summary.duplicates += 1;
                    if let Err(e) = self.checkpoint.commit(&input.key()) {
                        error!(error = %e, "Checkpoint write failed, stopping");
                        self.drain(&mut summary)?;
                        return Err(e);
                    }
                }
            }
            summary.processed += 1;
            pb.inc(1);

            if summary.processed % flush_every == 0 {
                self.drain(&mut summary)?;
            }
        }
        pb.finish_and_clear();

        self.drain(&mut summary)?;
        summary.unflushed = self.router.pending();
        if summary.unflushed > 0 {
            warn!(rows = summary.unflushed, "Rows not written; their entities stay pending for the next run");
        }
        Ok(summary)
    }

    /// Flush buffered rows and checkpoint the entities whose rows were
    /// written. Rows that fail stay buffered and their entities unmarked.
    fn drain(&mut self, summary: &mut RunSummary) -> Result<()> {
        if self.router.pending() == 0 {
            return Ok(());
        }
        let report = self.router.flush(self.store, &self.settings.sheets);
        summary.written += report.total_written();
        if !report.is_clean() {
            warn!(pending = self.router.pending(), "Some rows remain buffered");
        }
        for key in &report.keys {
            self.checkpoint
                .commit(key)
                .context("Checkpoint write failed after flush")?;
        }
        Ok(())
    }

    async fn process(&mut self, entity: &mut Entity) -> EntityOutcome {
        // 1. official website
        if !entity.has_website() {
            if let Some(site) = self.find_website(entity).await {
                entity.set_website(&site);
            }
        }
        if self.stopping() {
            return EntityOutcome::Interrupted;
        }

        // 2. website shared with an entity already recorded
        if entity.has_website() && self.router.is_known_website(&entity.website) {
            info!(entity = %entity.name, website = %entity.website, "Website already recorded, skipping");
            return EntityOutcome::KnownWebsite;
        }

        // 3. enrichment from the site itself
        let site_page = if entity.has_website() {
            self.pacer.short().await;
            let page = fetch_or_none(self.fetcher.as_ref(), &entity.website).await;
            match &page {
                Some(p) => self.enrich_from_site(entity, p).await,
                None => entity.note(NOTE_SITE_FAILED),
            }
            page
        } else {
            entity.note(NOTE_NO_WEBSITE);
            None
        };
        if self.stopping() {
            return EntityOutcome::Interrupted;
        }

        // 4. fallback searches
        if !entity.has_socials() {
            let found = self.fallback_search(entity, Target::Socials).await;
            entity.add_socials(found.into_iter().filter(|v| is_web_url(v)));
        }
        if is_na(&entity.phone) {
            if let Some(phone) = self.fallback_search(entity, Target::Phone).await.into_iter().next() {
                entity.phone = phone;
            }
        }
        if self.stopping() {
            return EntityOutcome::Interrupted;
        }

        // 5. triage and route
        let mut signals = Signals {
            has_website: entity.has_website(),
            has_socials: entity.has_socials(),
            ..Default::default()
        };
        if signals.has_website {
            signals.site_quality = self.critique(entity, site_page.as_ref()).await;
        } else if let Some(social) = entity.socials.first().cloned() {
            let check = self.verify_social(entity, &social).await;
            signals.verified_match = check.is_match;
            signals.follower_count = check.follower_count;
        }
        let tier = triage(&signals, &self.settings.triage);
        debug!(entity = %entity.name, ?signals, tier = %tier, "Triage decision");

        match self.router.route(entity, tier, &self.checkpoint) {
            RouteOutcome::Buffered(t) => EntityOutcome::Routed(t),
            other => EntityOutcome::Duplicate(other),
        }
    }

    async fn search_query(&self, entity: &Entity, target: Target) -> String {
        let kind = entity.kind.to_string();
        let prompt = prompts::search_query(&entity.name, &kind, target);
        self.gateway
            .complete(&prompt, Mode::Text)
            .await
            .and_then(|text| clean_query(&text))
            .unwrap_or_else(|| prompts::fallback_query(&entity.name, &kind, target))
    }

    async fn find_website(&self, entity: &Entity) -> Option<String> {
        let query = self.search_query(entity, Target::Website).await;
        self.pacer.short().await;
        let candidates = self.searcher.candidates(&query).await;
        if candidates.is_empty() {
            info!(entity = %entity.name, query = %query, "No website candidates");
            return None;
        }

        self.pacer.short().await;
        let prompt = prompts::censor(&entity.name, &entity.kind.to_string(), &candidates);
        let pick = self
            .gateway
            .classify(&prompt, Mode::Text, Some("best_url"))
            .await
            .and_then(|v| prompts::best_url(&v))
            .map(|u| normalize_url(&u))
            .filter(|u| !is_na(u));
        match &pick {
            Some(url) => info!(entity = %entity.name, url = %url, "Official website chosen"),
            None => info!(entity = %entity.name, "No candidate accepted as official website"),
        }
        pick
    }

    async fn enrich_from_site(&self, entity: &mut Entity, page: &Page) {
        self.pacer.short().await;
        let prompt = prompts::enrich(&entity.name, &page.text);
        let Some(value) = self.gateway.classify(&prompt, Mode::Text, None).await else {
            return;
        };
        let info = ContactInfo::from_value(&value);
        if let Some(phone) = info.phone {
            entity.phone = phone;
        }
        entity.add_contacts(info.contacts);
        entity.add_socials(info.socials.into_iter().filter(|v| is_web_url(v)));
        if let Some(address) = info.address {
            entity.address = address;
        }
    }

    async fn fallback_search(&self, entity: &Entity, target: Target) -> Vec<String> {
        self.pacer.short().await;
        let query = self.search_query(entity, target).await;
        let Some(snippets) = self.searcher.snippets(&query).await else {
            return Vec::new();
        };
        self.pacer.short().await;
        let prompt = prompts::fallback(&entity.name, &query, target, &snippets);
        let found = self
            .gateway
            .classify(&prompt, Mode::Text, Some("found_data"))
            .await
            .map(|v| prompts::found_data(&v))
            .unwrap_or_default();
        debug!(entity = %entity.name, target = ?target, found = found.len(), "Fallback search");
        found
    }

    async fn verify_social(&self, entity: &Entity, url: &str) -> SocialCheck {
        self.pacer.short().await;
        let Some(page) = fetch_or_none(self.fetcher.as_ref(), url).await else {
            return SocialCheck::default();
        };
        let prompt = prompts::verify_social(&entity.name, &entity.kind.to_string(), url, &page.text);
        let check = self
            .gateway
            .classify(&prompt, Mode::Text, Some("is_match"))
            .await
            .map(|v| SocialCheck::from_value(&v))
            .unwrap_or_default();
        info!(
            entity = %entity.name,
            url,
            is_match = check.is_match,
            followers = check.follower_count.unwrap_or(0),
            "Social verification"
        );
        check
    }

    /// Site grade from a screenshot when the fetcher can take one, else from
    /// the page text. `None` when neither is available.
    async fn critique(&self, entity: &Entity, page: Option<&Page>) -> Option<SiteQuality> {
        self.pacer.short().await;
        let value = match self.fetcher.screenshot(&entity.website).await {
            Some(png) => {
                let image = ImagePart::png(png);
                let prompt = prompts::critic(&entity.name, &entity.website, None);
                self.gateway.classify(&prompt, Mode::Vision(&image), Some("tier")).await
            }
            None => {
                let page = page?;
                let prompt = prompts::critic(&entity.name, &entity.website, Some(&page.text));
                self.gateway.classify(&prompt, Mode::Text, Some("tier")).await
            }
        };
        value.and_then(|v| prompts::site_quality(&v))
    }
}

/// First line of a model-written query, quotes stripped.
fn clean_query(text: &str) -> Option<String> {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty())?;
    let cleaned = line.replace(['"', '`'], "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == NA {
        None
    } else {
        Some(cleaned.to_string())
    }
}

fn is_web_url(v: &str) -> bool {
    url::Url::parse(v.trim()).is_ok_and(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::entity::{OUTPUT_HEADERS, RAW_HEADERS, WEBSITE_COLUMN};
    use crate::error::{FetchError, ModelError};
    use crate::search::tests::CannedSearch;
    use crate::sink::tests::FlakyStore;
    use async_trait::async_trait;
    use std::cell::Cell;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Answers by the first rule whose needle appears in the prompt.
    pub(crate) struct RuleModel {
        rules: Vec<(&'static str, String)>,
        pub(crate) prompts: Mutex<Vec<String>>,
    }

    impl RuleModel {
        pub(crate) fn new(rules: &[(&'static str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                rules: rules.iter().map(|(n, r)| (*n, r.to_string())).collect(),
                prompts: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LanguageModel for RuleModel {
        async fn generate(&self, request: &crate::ai::ModelRequest) -> Result<String, ModelError> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            self.rules
                .iter()
                .find(|(needle, _)| request.prompt.contains(needle))
                .map(|(_, reply)| Ok(reply.clone()))
                .unwrap_or_else(|| Err(ModelError::from_status(400, "no rule".into())))
        }

        fn name(&self) -> &str {
            "rules"
        }
    }

    /// Serves canned pages by URL; everything else is a 404.
    pub(crate) struct MapFetcher {
        pages: HashMap<String, String>,
        screenshots: bool,
        pub(crate) fetched: Mutex<Vec<String>>,
    }

    impl MapFetcher {
        pub(crate) fn new(pages: &[(&str, &str)]) -> Arc<Self> {
            Self::build(pages, false)
        }

        pub(crate) fn build(pages: &[(&str, &str)], screenshots: bool) -> Arc<Self> {
            Arc::new(Self {
                pages: pages.iter().map(|(u, h)| (u.to_string(), h.to_string())).collect(),
                screenshots,
                fetched: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn calls(&self) -> usize {
            self.fetched.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PageFetcher for MapFetcher {
        async fn fetch(&self, url: &str) -> Result<Page, FetchError> {
            self.fetched.lock().unwrap().push(url.to_string());
            match self.pages.get(url) {
                Some(html) => Ok(Page::from_html(url, html.clone())),
                None => Err(FetchError::Status { status: 404, url: url.to_string() }),
            }
        }

        async fn screenshot(&self, url: &str) -> Option<Vec<u8>> {
            (self.screenshots && self.pages.contains_key(url)).then(|| vec![0x89, b'P', b'N', b'G'])
        }
    }

    const SEARCH_QUERY: &str = "Write one web search query";
    const CENSOR: &str = "choosing the official homepage";
    const ENRICH: &str = "Extract contact details";
    const FALLBACK: &str = "result snippets are below";
    const VERIFY: &str = "follower or subscriber count";
    const CRITIC: &str = "You review websites";

    struct Harness {
        _dir: tempfile::TempDir,
        settings: Settings,
        store: SqliteStore,
    }

    impl Harness {
        fn new(rows: &[[&str; 5]]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut settings = Settings::default();
            settings.paths.checkpoint = dir.path().join("processed_entities.txt");
            settings.run.flush_every = 2;
            let store = SqliteStore::in_memory().unwrap();
            store.ensure_table(&settings.sheets.input, &RAW_HEADERS).unwrap();
            let rows: Vec<Vec<String>> = rows.iter().map(|r| r.iter().map(|c| c.to_string()).collect()).collect();
            store.append_rows(&settings.sheets.input, &rows).unwrap();
            Self { _dir: dir, settings, store }
        }

        async fn run(&self, services: &Services) -> (RunSummary, CheckpointStore) {
            let checkpoint = CheckpointStore::load(&self.settings.paths.checkpoint).unwrap();
            let gateway = services.gateway(&self.settings).with_backoff_unit(Duration::ZERO);
            let mut driver = Driver::new(&self.settings, services, &self.store, checkpoint, Pacer::disabled())
                .with_gateway(gateway);
            let summary = driver.run(None).await.unwrap();
            (summary, driver.checkpoint)
        }

        fn rows(&self, tier: Tier) -> Vec<Vec<String>> {
            self.store.read_all(self.settings.sheets.for_tier(tier)).unwrap()
        }
    }

    fn services(model: Arc<RuleModel>, search: Arc<CannedSearch>, fetcher: Arc<MapFetcher>) -> Services {
        Services { model, search, fetcher }
    }

    fn gir_lions_model() -> Arc<RuleModel> {
        RuleModel::new(&[
            (SEARCH_QUERY, "gir lions cricket team contact number"),
            (FALLBACK, r#"{"found_data": []}"#),
            (VERIFY, r#"{"is_match": true, "follower_count": 5000}"#),
        ])
    }

    #[tokio::test]
    async fn social_only_entity_becomes_hot_lead() {
        let h = Harness::new(&[["Gir Lions", "Team", "NA", "https://instagram.com/girlions", "https://gcl.in"]]);
        let model = gir_lions_model();
        let fetcher = MapFetcher::new(&[("https://instagram.com/girlions", "<p>Gir Lions official</p><p>5,000 followers</p>")]);
        let search = CannedSearch::new(&[]);

        let (summary, checkpoint) = h.run(&services(model, search, fetcher)).await;

        assert_eq!(summary.tiers.get(&Tier::HotLead), Some(&1));
        assert!(checkpoint.contains("gir lions"));
        let p1 = h.rows(Tier::HotLead);
        assert_eq!(p1.len(), 1);
        assert_eq!(p1[0][0], "Gir Lions");
        assert_eq!(p1[0].len(), OUTPUT_HEADERS.len());
        assert_eq!(p1[0][WEBSITE_COLUMN], "NA");
        assert_eq!(p1[0][8], NOTE_NO_WEBSITE);
    }

    #[tokio::test]
    async fn second_run_makes_no_external_calls() {
        let h = Harness::new(&[["Gir Lions", "Team", "NA", "https://instagram.com/girlions", "https://gcl.in"]]);
        let fetcher = MapFetcher::new(&[("https://instagram.com/girlions", "<p>Gir Lions official</p>")]);
        h.run(&services(gir_lions_model(), CannedSearch::new(&[]), fetcher)).await;

        let model = gir_lions_model();
        let search = CannedSearch::new(&[]);
        let fetcher = MapFetcher::new(&[]);
        let (summary, _) = h.run(&services(model.clone(), search.clone(), fetcher.clone())).await;

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.processed, 0);
        assert_eq!(model.calls(), 0);
        assert_eq!(fetcher.calls(), 0);
        assert!(search.queries.lock().unwrap().is_empty());
        assert_eq!(h.rows(Tier::HotLead).len(), 1);
    }

    #[tokio::test]
    async fn rows_already_in_sinks_are_not_repeated_without_checkpoint() {
        let h = Harness::new(&[["Gir Lions", "Team", "NA", "https://instagram.com/girlions", "NA"]]);
        let fetcher = MapFetcher::new(&[("https://instagram.com/girlions", "<p>Gir Lions</p>")]);
        h.run(&services(gir_lions_model(), CannedSearch::new(&[]), fetcher.clone())).await;

        std::fs::remove_file(&h.settings.paths.checkpoint).unwrap();
        let (summary, checkpoint) = h.run(&services(gir_lions_model(), CannedSearch::new(&[]), fetcher)).await;
        assert_eq!(summary.skipped, 1);
        assert!(checkpoint.contains("gir lions"));
        let total: usize = Tier::ALL.iter().map(|t| h.rows(*t).len()).sum();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn website_found_enriched_and_critiqued() {
        let h = Harness::new(&[["Bhavnagar Blasters", "Team", "NA", "NA", "https://gcl.in"]]);
        let model = RuleModel::new(&[
            (SEARCH_QUERY, "\"bhavnagar blasters official website\""),
            (CENSOR, r#"{"best_url": "https://bhavnagarblasters.in/home"}"#),
            (ENRICH, r#"```json
{"phone": "+91 98765 43210", "contacts": ["info@bhavnagarblasters.in"],
 "socials": ["https://instagram.com/bb", "not a url"], "address": "Sports Complex, Bhavnagar"}
```"#),
            (CRITIC, r#"{"tier": "P3"}"#),
        ]);
        let search = CannedSearch::new(&[
            ("Bhavnagar Blasters - Wikipedia", "https://en.wikipedia.org/wiki/BB"),
            ("Bhavnagar Blasters", "https://bhavnagarblasters.in/home"),
        ]);
        let fetcher = MapFetcher::new(&[("https://bhavnagarblasters.in", "<h1>Bhavnagar Blasters</h1><p>Call us</p>")]);

        let (summary, _) = h.run(&services(model.clone(), search.clone(), fetcher)).await;
        assert_eq!(summary.tiers.get(&Tier::Redesign), Some(&1));

        let row = &h.rows(Tier::Redesign)[0];
        assert_eq!(row[WEBSITE_COLUMN], "https://bhavnagarblasters.in");
        assert_eq!(row[3], "+91 98765 43210");
        assert_eq!(row[4], "info@bhavnagarblasters.in");
        assert_eq!(row[5], "https://instagram.com/bb");
        assert_eq!(row[6], "Sports Complex, Bhavnagar");
        assert_eq!(row[8], "NA");

        let queries = search.queries.lock().unwrap();
        assert_eq!(queries[0], "bhavnagar blasters official website");
        // the censor saw only non-blacklisted candidates
        let prompts = model.prompts.lock().unwrap();
        let censor = prompts.iter().find(|p| p.contains(CENSOR)).unwrap();
        assert!(!censor.contains("wikipedia"));
    }

    #[tokio::test]
    async fn vision_critic_used_when_screenshots_available() {
        let h = Harness::new(&[["Delhi Dynamos FC", "Team", "https://delhidynamos.in/about", "https://x.com/dd", "NA"]]);
        let model = RuleModel::new(&[
            (ENRICH, r#"{"phone": "NA", "contacts": [], "socials": [], "address": "NA"}"#),
            (SEARCH_QUERY, "delhi dynamos phone"),
            (FALLBACK, r#"{"found_data": ["+91 99999 00000"]}"#),
            ("screenshot", r#"{"tier": "P4"}"#),
        ]);
        let fetcher = MapFetcher::build(&[("https://delhidynamos.in", "<p>Delhi Dynamos</p>")], true);
        let search = CannedSearch::new(&[("DD contact", "https://justdial.com/dd")]);

        let (summary, _) = h.run(&services(model, search, fetcher)).await;
        assert_eq!(summary.tiers.get(&Tier::LowPriority), Some(&1));
        let row = &h.rows(Tier::LowPriority)[0];
        assert_eq!(row[3], "+91 99999 00000");
        assert_eq!(row[WEBSITE_COLUMN], "https://delhidynamos.in");
    }

    #[tokio::test]
    async fn failing_collaborators_still_write_reject_and_checkpoint() {
        let h = Harness::new(&[["Surat United", "Team", "NA", "https://facebook.com/suratunited", "NA"]]);
        let model = RuleModel::new(&[]);
        let fetcher = MapFetcher::new(&[]);
        let search = CannedSearch::new(&[]);

        let (summary, checkpoint) = h.run(&services(model.clone(), search, fetcher)).await;
        assert_eq!(summary.tiers.get(&Tier::Reject), Some(&1));
        assert!(checkpoint.contains("surat united"));
        assert_eq!(h.rows(Tier::Reject)[0][8], NOTE_NO_WEBSITE);
        // every model call was retried to the attempt limit
        assert_eq!(model.calls() % 3, 0);
    }

    #[tokio::test]
    async fn shared_website_and_input_duplicates() {
        let h = Harness::new(&[
            ["Delhi FC", "Team", "https://delhifc.in", "NA", "NA"],
            ["delhi fc ", "Team", "https://delhifc.in", "NA", "NA"],
            ["Delhi Football Club", "Team", "https://www.delhifc.in", "NA", "NA"],
            ["Delhi Football Club Official", "Team", "https://delhifc.in/contact", "NA", "NA"],
        ]);
        let model = RuleModel::new(&[
            (ENRICH, r#"{"phone": "011 2345 6789", "socials": ["https://instagram.com/delhifc"]}"#),
            (CRITIC, r#"{"tier": "P4"}"#),
        ]);
        let fetcher = MapFetcher::new(&[
            ("https://delhifc.in", "<p>Delhi FC</p>"),
            ("https://www.delhifc.in", "<p>Delhi FC</p>"),
        ]);
        let (summary, checkpoint) = h.run(&services(model, CannedSearch::new(&[]), fetcher)).await;

        assert_eq!(summary.collapsed, 1);
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(h.rows(Tier::LowPriority).len(), 2);
        assert!(checkpoint.contains("delhi football club official"));
    }

    #[tokio::test]
    async fn stop_before_start_processes_nothing() {
        let h = Harness::new(&[["Gir Lions", "Team", "NA", "https://instagram.com/girlions", "NA"]]);
        let checkpoint = CheckpointStore::load(&h.settings.paths.checkpoint).unwrap();
        let s = services(gir_lions_model(), CannedSearch::new(&[]), MapFetcher::new(&[]));
        let mut driver = Driver::new(&h.settings, &s, &h.store, checkpoint, Pacer::disabled());
        driver.stop_flag().store(true, Ordering::SeqCst);
        let summary = driver.run(None).await.unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.processed, 0);
        assert!(!driver.checkpoint().contains("gir lions"));
    }

    /// Raises `flag` once `trigger` has been fetched.
    struct TrippingFetcher {
        inner: Arc<MapFetcher>,
        trigger: &'static str,
        flag: Arc<AtomicBool>,
    }

    #[async_trait]
    impl PageFetcher for TrippingFetcher {
        async fn fetch(&self, url: &str) -> Result<Page, FetchError> {
            let page = self.inner.fetch(url).await;
            if url == self.trigger {
                self.flag.store(true, Ordering::SeqCst);
            }
            page
        }
    }

    #[tokio::test]
    async fn interrupt_drains_rows_already_routed() {
        let h = Harness::new(&[
            ["Gir Lions", "Team", "NA", "https://instagram.com/girlions", "NA"],
            ["Bhavnagar Blasters", "Team", "NA", "NA", "NA"],
        ]);
        assert_eq!(h.settings.run.flush_every, 2);
        let flag = Arc::new(AtomicBool::new(false));
        let fetcher = Arc::new(TrippingFetcher {
            inner: MapFetcher::new(&[("https://instagram.com/girlions", "<p>Gir Lions official</p>")]),
            trigger: "https://instagram.com/girlions",
            flag: flag.clone(),
        });
        let s = Services {
            model: gir_lions_model(),
            search: CannedSearch::new(&[]),
            fetcher,
        };

        let checkpoint = CheckpointStore::load(&h.settings.paths.checkpoint).unwrap();
        let mut driver = Driver::new(&h.settings, &s, &h.store, checkpoint, Pacer::disabled())
            .with_gateway(s.gateway(&h.settings).with_backoff_unit(Duration::ZERO));
        driver.stop = flag;
        let summary = driver.run(None).await.unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.written, 1);
        assert_eq!(h.rows(Tier::HotLead).len(), 1);
        assert!(driver.checkpoint().contains("gir lions"));
        assert!(!driver.checkpoint().contains("bhavnagar blasters"));
    }

    #[tokio::test]
    async fn failed_flush_keeps_entity_pending_for_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.paths.checkpoint = dir.path().join("processed_entities.txt");
        let inner = SqliteStore::in_memory().unwrap();
        inner.ensure_table(&settings.sheets.input, &RAW_HEADERS).unwrap();
        let row: Vec<String> = ["Gir Lions", "Team", "NA", "https://instagram.com/girlions", "NA"]
            .iter()
            .map(|c| c.to_string())
            .collect();
        inner.append_rows(&settings.sheets.input, &[row]).unwrap();
        let store = FlakyStore {
            inner,
            broken_sheet: settings.sheets.for_tier(Tier::HotLead).to_string(),
            broken: Cell::new(true),
        };

        let run = |settings: &Settings, store: &FlakyStore| {
            let services = services(
                gir_lions_model(),
                CannedSearch::new(&[]),
                MapFetcher::new(&[("https://instagram.com/girlions", "<p>Gir Lions official</p>")]),
            );
            let checkpoint = CheckpointStore::load(&settings.paths.checkpoint).unwrap();
            let gateway = services.gateway(settings).with_backoff_unit(Duration::ZERO);
            (services, checkpoint, gateway)
        };

        let (svc, checkpoint, gateway) = run(&settings, &store);
        let mut driver = Driver::new(&settings, &svc, &store, checkpoint, Pacer::disabled()).with_gateway(gateway);
        let summary = driver.run(None).await.unwrap();
        assert_eq!(summary.written, 0);
        assert_eq!(summary.unflushed, 1);
        assert!(!driver.checkpoint().contains("gir lions"));
        drop(driver);

        store.broken.set(false);
        let (svc, checkpoint, gateway) = run(&settings, &store);
        let mut driver = Driver::new(&settings, &svc, &store, checkpoint, Pacer::disabled()).with_gateway(gateway);
        let summary = driver.run(None).await.unwrap();
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.written, 1);
        assert!(driver.checkpoint().contains("gir lions"));
        assert_eq!(store.read_all(settings.sheets.for_tier(Tier::HotLead)).unwrap().len(), 1);
    }

    #[test]
    fn query_cleanup() {
        assert_eq!(clean_query("\"gir lions official website\"\n").as_deref(), Some("gir lions official website"));
        assert_eq!(clean_query("\n\n  `x y`  \nsecond line").as_deref(), Some("x y"));
        assert_eq!(clean_query("   "), None);
    }
}
