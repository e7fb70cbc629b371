use std::time::Duration;

use rand::Rng;

use crate::config::{PacingSettings, PauseRange};

/// Randomized pauses between outbound requests.
#[derive(Debug, Clone)]
pub struct Pacer {
    short: PauseRange,
    long: PauseRange,
    enabled: bool,
}

impl Pacer {
    pub fn new(settings: &PacingSettings) -> Self {
        Self {
            short: settings.short,
            long: settings.long,
            enabled: true,
        }
    }

    #[cfg(test)]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(&PacingSettings::default())
        }
    }

    /// Between calls within one entity.
    pub async fn short(&self) {
        self.pause(self.short).await;
    }

    /// Between entities and page visits.
    pub async fn long(&self) {
        self.pause(self.long).await;
    }

    async fn pause(&self, range: PauseRange) {
        if !self.enabled {
            return;
        }
        tokio::time::sleep(jitter(range)).await;
    }
}

fn jitter(range: PauseRange) -> Duration {
    if range.max_secs <= range.min_secs {
        return Duration::from_secs_f64(range.min_secs.max(0.0));
    }
    Duration::from_secs_f64(rand::rng().random_range(range.min_secs..range.max_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_within_range() {
        let range = PauseRange { min_secs: 0.8, max_secs: 1.8 };
        for _ in 0..200 {
            let d = jitter(range).as_secs_f64();
            assert!((0.8..=1.8).contains(&d), "{} out of range", d);
        }
    }

    #[test]
    fn degenerate_range_is_fixed() {
        let range = PauseRange { min_secs: 2.0, max_secs: 2.0 };
        assert_eq!(jitter(range), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn disabled_pacer_returns_immediately() {
        let start = std::time::Instant::now();
        let pacer = Pacer::disabled();
        pacer.long().await;
        pacer.short().await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
