use std::collections::{BTreeMap, HashSet};

use anyhow::Result;
use tracing::{debug, error, info};

use crate::checkpoint::CheckpointStore;
use crate::config::Sheets;
use crate::db::TabularStore;
use crate::entity::{Entity, OUTPUT_HEADERS, WEBSITE_COLUMN};
use crate::normalize::{is_na, normalize_url};
use crate::triage::Tier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Buffered(Tier),
    /// Name already written in an earlier run or buffered in this one.
    DuplicateKey,
    /// Another entity already claimed this website.
    DuplicateWebsite,
}

#[derive(Debug, Default)]
pub struct FlushReport {
    pub written: BTreeMap<Tier, usize>,
    /// Identity keys of the rows that reached their table.
    pub keys: Vec<String>,
    pub failed: Vec<(Tier, String)>,
}

impl FlushReport {
    pub fn total_written(&self) -> usize {
        self.written.values().sum()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Rows waiting for one tier table, with the identity key of each.
#[derive(Debug, Default)]
struct TierBuffer {
    keys: Vec<String>,
    rows: Vec<Vec<String>>,
}

/// Per-tier row buffers plus the in-run dedup sets guarding them.
#[derive(Debug, Default)]
pub struct SinkRouter {
    buffers: BTreeMap<Tier, TierBuffer>,
    buffered_keys: HashSet<String>,
    known_websites: HashSet<String>,
}

impl SinkRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create every output table that does not exist yet.
    pub fn ensure_tables(store: &dyn TabularStore, sheets: &Sheets) -> Result<()> {
        for (_, name) in sheets.outputs() {
            store.ensure_table(name, &OUTPUT_HEADERS)?;
        }
        Ok(())
    }

    /// Seed the checkpoint with every name already in an output table and the
    /// router with every website. Returns `(names, websites)` added.
    pub fn load_existing(
        &mut self,
        store: &dyn TabularStore,
        sheets: &Sheets,
        checkpoint: &mut CheckpointStore,
    ) -> Result<(usize, usize)> {
        let mut names = Vec::new();
        let mut websites = Vec::new();
        for (_, sheet) in sheets.outputs() {
            for row in store.read_all(sheet)? {
                if let Some(name) = row.first() {
                    names.push(name.clone());
                }
                if let Some(site) = row.get(WEBSITE_COLUMN) {
                    websites.push(site.clone());
                }
            }
        }
        let added_names = checkpoint.seed(names);
        let added_sites = self.seed_websites(websites);
        info!(
            names = added_names,
            websites = added_sites,
            "Seeded dedup sets from output tables"
        );
        Ok((added_names, added_sites))
    }

    pub fn seed_websites<I, S>(&mut self, sites: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let before = self.known_websites.len();
        for site in sites {
            let site = normalize_url(site.as_ref());
            if !is_na(&site) {
                self.known_websites.insert(site);
            }
        }
        self.known_websites.len() - before
    }

    pub fn is_known_website(&self, website: &str) -> bool {
        let site = normalize_url(website);
        !is_na(&site) && self.known_websites.contains(&site)
    }

    pub fn route(&mut self, entity: &Entity, tier: Tier, checkpoint: &CheckpointStore) -> RouteOutcome {
        let key = entity.key();
        if checkpoint.contains(&key) || self.buffered_keys.contains(&key) {
            debug!(entity = %entity.name, "Already recorded, not routed");
            return RouteOutcome::DuplicateKey;
        }
        if entity.has_website() && self.is_known_website(&entity.website) {
            debug!(entity = %entity.name, website = %entity.website, "Website already recorded");
            return RouteOutcome::DuplicateWebsite;
        }

        self.buffered_keys.insert(key.clone());
        if entity.has_website() {
            self.known_websites.insert(entity.website.clone());
        }
        let buffer = self.buffers.entry(tier).or_default();
        buffer.keys.push(key);
        buffer.rows.push(entity.to_row());
        RouteOutcome::Buffered(tier)
    }

    pub fn pending(&self) -> usize {
        self.buffers.values().map(|b| b.rows.len()).sum()
    }

    /// One batched append per non-empty tier. Tiers that fail keep their rows
    /// for the next flush; only keys of written rows are reported.
    pub fn flush(&mut self, store: &dyn TabularStore, sheets: &Sheets) -> FlushReport {
        let mut report = FlushReport::default();
        let tiers: Vec<Tier> = self
            .buffers
            .iter()
            .filter(|(_, b)| !b.rows.is_empty())
            .map(|(t, _)| *t)
            .collect();

        for tier in tiers {
            let sheet = sheets.for_tier(tier);
            let rows = self.buffers.get(&tier).map(|b| b.rows.as_slice()).unwrap_or_default();
            match store.append_rows(sheet, rows) {
                Ok(n) => {
                    info!(tier = %tier, sheet, rows = n, "Flushed rows");
                    report.written.insert(tier, n);
                    if let Some(buffer) = self.buffers.remove(&tier) {
                        report.keys.extend(buffer.keys);
                    }
                }
                Err(e) => {
                    error!(tier = %tier, sheet, error = %e, "Flush failed, rows kept for retry");
                    report.failed.push((tier, e.to_string()));
                }
            }
        }
        report
    }
}
