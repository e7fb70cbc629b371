use std::fmt;

use serde::{Deserialize, Serialize};

/// Priority bucket an entity lands in after triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    /// P1: socials only, small verified audience.
    HotLead,
    /// P2: socials only, audience already at or above the threshold.
    ReachLead,
    /// P3: has a website that rates poorly.
    Redesign,
    /// P4: has an adequate website.
    LowPriority,
    /// P5: no verifiable online presence.
    Reject,
}

impl Tier {
    pub const ALL: [Tier; 5] = [
        Tier::HotLead,
        Tier::ReachLead,
        Tier::Redesign,
        Tier::LowPriority,
        Tier::Reject,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Tier::HotLead => "P1",
            Tier::ReachLead => "P2",
            Tier::Redesign => "P3",
            Tier::LowPriority => "P4",
            Tier::Reject => "P5",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Website grade returned by the critic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteQuality {
    Poor,
    Good,
}

impl SiteQuality {
    /// Anything the critic says that is not recognizably "poor" counts as good.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "p3" | "poor" | "bad" => SiteQuality::Poor,
            _ => SiteQuality::Good,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierScheme {
    Five,
    /// Social leads collapse into P1, website leads into P3.
    Three,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageConfig {
    pub follower_threshold: u64,
    pub scheme: TierScheme,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            follower_threshold: 30_000,
            scheme: TierScheme::Five,
        }
    }
}

/// Everything triage looks at for one entity.
#[derive(Debug, Clone, Copy, Default)]
pub struct Signals {
    pub has_website: bool,
    pub has_socials: bool,
    pub verified_match: bool,
    pub follower_count: Option<u64>,
    pub site_quality: Option<SiteQuality>,
}

/// First matching rule wins.
pub fn triage(signals: &Signals, config: &TriageConfig) -> Tier {
    let tier = if !signals.has_website {
        if !signals.has_socials || !signals.verified_match {
            Tier::Reject
        } else if signals.follower_count.unwrap_or(0) < config.follower_threshold {
            Tier::HotLead
        } else {
            Tier::ReachLead
        }
    } else {
        match signals.site_quality {
            Some(SiteQuality::Poor) => Tier::Redesign,
            Some(SiteQuality::Good) | None => Tier::LowPriority,
        }
    };

    match config.scheme {
        TierScheme::Five => tier,
        TierScheme::Three => collapse(tier),
    }
}

fn collapse(tier: Tier) -> Tier {
    match tier {
        Tier::HotLead | Tier::ReachLead => Tier::HotLead,
        Tier::Redesign | Tier::LowPriority => Tier::Redesign,
        Tier::Reject => Tier::Reject,
    }
}
