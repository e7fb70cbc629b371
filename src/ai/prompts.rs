//! Prompt builders and the lenient readers for what the model sends back.
//!
//! Every reader takes a `serde_json::Value` already pulled out of free text by
//! `parse_lenient` and tolerates the usual drift: strings where lists were
//! asked for, numbers as strings, `"NA"` placeholders.

use std::fmt::Write as _;

use serde_json::Value;

use crate::normalize::{is_na, split_list, NA};
use crate::search::CandidateLink;
use crate::triage::SiteQuality;

pub const ENRICH_TEXT_CHARS: usize = 12_000;
pub const SNIPPET_TEXT_CHARS: usize = 8_000;
pub const SOCIAL_TEXT_CHARS: usize = 4_000;
pub const CRITIC_TEXT_CHARS: usize = 6_000;
pub const DISCOVERY_TEXT_CHARS: usize = 10_000;

/// What a search query should turn up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Website,
    Socials,
    Phone,
}

impl Target {
    pub fn label(self) -> &'static str {
        match self {
            Target::Website => "official website",
            Target::Socials => "official social media pages",
            Target::Phone => "contact phone number",
        }
    }
}

// ── Builders ──

pub fn search_query(name: &str, kind: &str, target: Target) -> String {
    format!(
        "Write one web search query that would find the {what} of this sports organization.\n\
         Name: \"{name}\"\n\
         Type: \"{kind}\"\n\n\
         Combine the name with the type or sport so the query cannot match an unrelated \
         business with a similar name. For example: \"Gir Lions cricket team official website\" \
         or \"Bhavnagar Blasters contact mobile number\".\n\n\
         Reply with the query only, as plain text, no quotes.",
        what = target.label(),
    )
}

/// Query used when the model cannot write one.
pub fn fallback_query(name: &str, kind: &str, target: Target) -> String {
    format!("\"{}\" {} {}", name, kind, target.label())
}

pub fn censor(name: &str, kind: &str, candidates: &[CandidateLink]) -> String {
    let mut listing = String::new();
    for (i, c) in candidates.iter().enumerate() {
        let _ = writeln!(listing, "{}. title: \"{}\" url: {}", i + 1, c.title, c.url);
    }
    format!(
        "You are choosing the official homepage of one specific sports organization.\n\
         Name: \"{name}\"\n\
         Type: \"{kind}\"\n\n\
         Search results:\n{listing}\n\
         Rules:\n\
         - Pick the site that belongs to this exact organization. A parent league or \
           association site is wrong when the organization is a team.\n\
         - Directories, encyclopedias, social networks and news articles are never the answer.\n\
         - The domain usually echoes the name (girlions.com for Gir Lions).\n\
         - If none of the results is the organization's own homepage, answer \"NA\".\n\n\
         Reply with JSON only: {{\"best_url\": \"https://...\"}} or {{\"best_url\": \"NA\"}}"
    )
}

pub fn enrich(name: &str, page_text: &str) -> String {
    format!(
        "Extract contact details for \"{name}\" from the text of its website.\n\n\
         ---\n{text}\n---\n\n\
         - phone: a mobile number if one exists (Indian mobiles are 10 digits starting \
           with 6, 7, 8 or 9), otherwise any phone number, otherwise \"NA\".\n\
         - contacts: every contact email address.\n\
         - socials: full profile URLs on Facebook, Instagram, X/Twitter, LinkedIn or YouTube.\n\
         - address: the main postal address or headquarters, or \"NA\".\n\n\
         Reply with JSON only, for example:\n\
         {{\"phone\": \"+91 98765 43210\", \"contacts\": [\"info@club.in\"], \
         \"socials\": [\"https://www.instagram.com/club\"], \"address\": \"Stadium Road, Ahmedabad\"}}",
        text = truncate_chars(page_text, ENRICH_TEXT_CHARS),
    )
}

pub fn fallback(name: &str, query: &str, target: Target, snippets: &str) -> String {
    format!(
        "I searched the web for \"{query}\" hoping to find the {what} of the sports \
         organization \"{name}\". The result snippets are below.\n\n\
         Keep only values that clearly belong to this organization. Similar names from \
         other fields do not count (a page about Gir Forest is not Gir Lions).\n\n\
         Reply with JSON only: {{\"found_data\": [\"...\"]}} or {{\"found_data\": []}}\n\n\
         ---\n{text}\n---",
        what = target.label(),
        text = truncate_chars(snippets, SNIPPET_TEXT_CHARS),
    )
}

pub fn verify_social(name: &str, kind: &str, url: &str, page_text: &str) -> String {
    format!(
        "Below is the text of the social media page {url}.\n\
         Decide whether it is the official page of the sports organization \"{name}\" \
         ({kind}), and read its follower or subscriber count.\n\n\
         ---\n{text}\n---\n\n\
         Reply with JSON only: {{\"is_match\": true, \"follower_count\": 5000}}. \
         Use 0 when no count is visible.",
        text = truncate_chars(page_text, SOCIAL_TEXT_CHARS),
    )
}

/// Grade a homepage. With `page_text` the grade comes from the text alone,
/// otherwise a screenshot accompanies the prompt.
pub fn critic(name: &str, url: &str, page_text: Option<&str>) -> String {
    let subject = match page_text {
        Some(text) => format!(
            "the text of the homepage {url}:\n---\n{}\n---",
            truncate_chars(text, CRITIC_TEXT_CHARS)
        ),
        None => format!("the attached screenshot of the homepage {url}."),
    };
    format!(
        "You review websites of sports organizations. Judge {subject}\n\n\
         The site belongs to \"{name}\". Score it from 1 to 10 on how modern, clear, \
         trustworthy, readable, mobile friendly and well branded it feels next to a \
         top national sports body.\n\
         - 6 or lower: the site needs a redesign, answer \"P3\".\n\
         - 7 or higher: the site is fine, answer \"P4\".\n\n\
         Reply with JSON only: {{\"tier\": \"P3\"}} or {{\"tier\": \"P4\"}}"
    )
}

pub fn discovery_keywords(mission: &str, count: usize) -> String {
    format!(
        "Suggest {count} different web search queries that would surface lists or \
         directories of sports organizations for this goal:\n\"{mission}\"\n\n\
         Write them the way a local fan would search: concrete words like league, club, \
         academy, tournament, association, plus city or state names. Vary them.\n\n\
         Reply with JSON only: {{\"keywords\": [\"...\"]}}"
    )
}

pub fn page_entities(page_text: &str) -> String {
    format!(
        "List the state-level sports organizations named in the page text below: leagues, \
         teams, events, venues, federations and academies.\n\n\
         Skip national or international teams and top professional leagues. Skip \
         district, school and neighbourhood sides. Skip individual players and anything \
         that is navigation, news or a notice. Translate non-English names to English.\n\n\
         Reply with JSON only, for example:\n\
         {{\"entities\": [{{\"name\": \"Delhi Premier League\", \"type\": \"League\"}}]}}\n\n\
         ---\n{text}\n---",
        text = truncate_chars(page_text, DISCOVERY_TEXT_CHARS),
    )
}

// ── Readers ──

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContactInfo {
    pub phone: Option<String>,
    pub contacts: Vec<String>,
    pub socials: Vec<String>,
    pub address: Option<String>,
}

impl ContactInfo {
    pub fn from_value(v: &Value) -> Self {
        Self {
            phone: list_field(v, "phone").into_iter().next(),
            contacts: list_field(v, "contacts"),
            socials: list_field(v, "socials"),
            address: text_field(v, "address"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocialCheck {
    pub is_match: bool,
    pub follower_count: Option<u64>,
}

impl SocialCheck {
    pub fn from_value(v: &Value) -> Self {
        let is_match = match v.get("is_match") {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes"),
            _ => false,
        };
        Self {
            is_match,
            follower_count: v.get("follower_count").and_then(follower_count),
        }
    }
}

pub fn best_url(v: &Value) -> Option<String> {
    text_field(v, "best_url")
}

pub fn site_quality(v: &Value) -> Option<SiteQuality> {
    text_field(v, "tier").map(|t| SiteQuality::from_label(&t))
}

pub fn found_data(v: &Value) -> Vec<String> {
    list_field(v, "found_data")
}

/// Keywords from `{"keywords": [...]}` or a bare array.
pub fn keywords(v: &Value) -> Vec<String> {
    match v {
        Value::Array(_) => strings(v),
        _ => list_field(v, "keywords"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityLead {
    pub name: String,
    pub kind: String,
}

pub fn entity_leads(v: &Value) -> Vec<EntityLead> {
    let items = match v {
        Value::Array(items) => items.as_slice(),
        _ => match v.get("entities") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => return Vec::new(),
        },
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(name) => Some(EntityLead {
                name: name.trim().to_string(),
                kind: NA.to_string(),
            }),
            Value::Object(_) => Some(EntityLead {
                name: text_field(item, "name")?,
                kind: text_field(item, "type").unwrap_or_else(|| NA.to_string()),
            }),
            _ => None,
        })
        .filter(|lead| !lead.name.is_empty())
        .collect()
}

/// Follower count from a number or any string form ("12,400", "12.4K",
/// "1.2M followers"). Unreadable values are `None`.
pub fn follower_count(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64)),
        Value::String(s) => parse_count(s),
        _ => None,
    }
}

fn parse_count(s: &str) -> Option<u64> {
    let lower = s.trim().to_ascii_lowercase().replace(',', "");
    let token = lower.split_whitespace().next()?;
    let (num, mult) = match token.chars().last()? {
        'k' => (&token[..token.len() - 1], 1_000.0),
        'm' => (&token[..token.len() - 1], 1_000_000.0),
        'b' => (&token[..token.len() - 1], 1_000_000_000.0),
        _ => (token, 1.0),
    };
    if let Ok(f) = num.parse::<f64>() {
        if f >= 0.0 {
            return Some((f * mult).round() as u64);
        }
    }
    let digits: String = lower.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Non-placeholder string at `key`.
fn text_field(v: &Value, key: &str) -> Option<String> {
    match v.get(key)? {
        Value::String(s) if !is_na(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// List at `key`, accepting a single string (comma separated) in place of an
/// array.
fn list_field(v: &Value, key: &str) -> Vec<String> {
    match v.get(key) {
        Some(Value::String(s)) => split_list(s),
        Some(list @ Value::Array(_)) => strings(list),
        Some(Value::Number(n)) => vec![n.to_string()],
        _ => Vec::new(),
    }
}

fn strings(v: &Value) -> Vec<String> {
    v.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|i| match i {
                    Value::String(s) => Some(s.trim().to_string()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .filter(|s| !is_na(s))
                .collect()
        })
        .unwrap_or_default()
}

/// Longest prefix of `text` with at most `max` chars.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
