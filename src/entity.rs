use std::fmt;

use crate::normalize::{is_na, join_or_na, normalize_key, normalize_url, split_list, NA};

/// Header shared by every tier table.
pub const OUTPUT_HEADERS: [&str; 9] = [
    "Entity Name",
    "Type",
    "Official Website",
    "Phone",
    "Contacts",
    "Socials",
    "Address",
    "Source URL",
    "Notes",
];

/// Header of the raw table written by discovery and read by the pipeline.
pub const RAW_HEADERS: [&str; 5] = ["Entity Name", "Type", "Official Website", "Socials", "Source URL"];

/// Column of `OUTPUT_HEADERS` holding the cleaned website.
pub const WEBSITE_COLUMN: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityKind {
    League,
    Team,
    Event,
    Venue,
    Federation,
    Academy,
    /// Anything else; keeps the original label for display.
    Unknown(String),
}

impl EntityKind {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "league" => EntityKind::League,
            "team" | "club" => EntityKind::Team,
            "event" | "tournament" => EntityKind::Event,
            "venue" => EntityKind::Venue,
            "federation" | "association" => EntityKind::Federation,
            "academy" => EntityKind::Academy,
            _ => EntityKind::Unknown(s.trim().to_string()),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::League => f.write_str("League"),
            EntityKind::Team => f.write_str("Team"),
            EntityKind::Event => f.write_str("Event"),
            EntityKind::Venue => f.write_str("Venue"),
            EntityKind::Federation => f.write_str("Federation"),
            EntityKind::Academy => f.write_str("Academy"),
            EntityKind::Unknown(label) if !label.is_empty() && !is_na(label) => f.write_str(label),
            EntityKind::Unknown(_) => f.write_str("Unknown"),
        }
    }
}

/// A sports organization being enriched. Scalars hold `"NA"` when unknown.
#[derive(Debug, Clone)]
pub struct Entity {
    pub name: String,
    pub kind: EntityKind,
    /// Always `"NA"` or a bare `scheme://host`.
    pub website: String,
    pub phone: String,
    pub contacts: Vec<String>,
    pub socials: Vec<String>,
    pub address: String,
    pub source_url: String,
    pub notes: Vec<String>,
}

impl Entity {
    pub fn new(name: &str, kind: EntityKind, source_url: &str) -> Self {
        Self {
            name: name.trim().to_string(),
            kind,
            website: NA.to_string(),
            phone: NA.to_string(),
            contacts: Vec::new(),
            socials: Vec::new(),
            address: NA.to_string(),
            source_url: or_na(source_url),
            notes: Vec::new(),
        }
    }

    pub fn key(&self) -> String {
        normalize_key(&self.name)
    }

    pub fn set_website(&mut self, raw: &str) {
        self.website = normalize_url(raw);
    }

    pub fn has_website(&self) -> bool {
        !is_na(&self.website)
    }

    pub fn has_socials(&self) -> bool {
        !self.socials.is_empty()
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    /// Add list values without duplicates, skipping placeholders.
    pub fn add_contacts<I: IntoIterator<Item = String>>(&mut self, values: I) {
        merge_unique(&mut self.contacts, values);
    }

    pub fn add_socials<I: IntoIterator<Item = String>>(&mut self, values: I) {
        merge_unique(&mut self.socials, values);
    }

    /// One row in `OUTPUT_HEADERS` order, with no blank cells.
    pub fn to_row(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.kind.to_string(),
            or_na(&self.website),
            or_na(&self.phone),
            join_or_na(&self.contacts),
            join_or_na(&self.socials),
            or_na(&self.address),
            or_na(&self.source_url),
            if self.notes.is_empty() {
                NA.to_string()
            } else {
                self.notes.join(" ")
            },
        ]
    }
}

fn merge_unique<I: IntoIterator<Item = String>>(into: &mut Vec<String>, values: I) {
    for v in values {
        let v = v.trim().to_string();
        if is_na(&v) || into.iter().any(|e| e.eq_ignore_ascii_case(&v)) {
            continue;
        }
        into.push(v);
    }
}

fn or_na(s: &str) -> String {
    if is_na(s) {
        NA.to_string()
    } else {
        s.trim().to_string()
    }
}

/// A row of the input table, read by header name.
#[derive(Debug, Clone)]
pub struct InputRow {
    pub name: String,
    pub kind: String,
    pub website: String,
    pub socials: String,
    pub phone: String,
    pub source_url: String,
}

impl InputRow {
    /// Map a row through its table header. Returns `None` for rows without a name.
    pub fn from_row(header: &[String], row: &[String]) -> Option<Self> {
        let cell = |names: &[&str]| -> String {
            header
                .iter()
                .position(|h| names.iter().any(|n| h.trim().eq_ignore_ascii_case(n)))
                .and_then(|i| row.get(i))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| NA.to_string())
        };

        let name = cell(&["Entity Name", "Name"]);
        if is_na(&name) {
            return None;
        }
        Some(Self {
            name,
            kind: cell(&["Type", "Category"]),
            website: cell(&["Official Website", "Entity Website", "Website"]),
            socials: cell(&["Socials"]),
            phone: cell(&["Phone"]),
            source_url: cell(&["Source URL"]),
        })
    }

    pub fn key(&self) -> String {
        normalize_key(&self.name)
    }

    /// Start an entity from what the input already knows.
    pub fn to_entity(&self) -> Entity {
        let mut e = Entity::new(&self.name, EntityKind::parse(&self.kind), &self.source_url);
        if !is_na(&self.website) {
            e.set_website(&self.website);
        }
        if !is_na(&self.phone) {
            e.phone = self.phone.clone();
        }
        e.add_socials(split_list(&self.socials));
        e
    }
}
