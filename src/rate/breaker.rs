use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::warn;

/// Per-(provider, pair) rate-limit fuse. A 429 on a quote opens the fuse for
/// that provider+pair; the scanner stops asking until it expires.
#[derive(Default)]
pub struct PairBreakers {
    open_until: DashMap<(String, String), Instant>,
}

impl PairBreakers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or extend) the fuse. Forward-only: a shorter request never
    /// shortens an already-open window.
    pub fn open(&self, provider: &str, pair: &str, duration: Duration) {
        let until = Instant::now() + duration;
        let key = (provider.to_string(), pair.to_string());
        let mut entry = self.open_until.entry(key).or_insert(until);
        if *entry < until {
            *entry = until;
        }
        warn!(
            "breaker open: provider={provider} pair={pair} for {}ms",
            duration.as_millis()
        );
    }

    pub fn is_open(&self, provider: &str, pair: &str) -> bool {
        self.remaining(provider, pair).is_some()
    }

    pub fn remaining(&self, provider: &str, pair: &str) -> Option<Duration> {
        let key = (provider.to_string(), pair.to_string());
        let until = self.open_until.get(&key)?;
        until.checked_duration_since(Instant::now())
    }

    pub fn remaining_ms(&self, provider: &str, pair: &str) -> u64 {
        self.remaining(provider, pair)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_per_provider_and_pair() {
        let breakers = PairBreakers::new();
        breakers.open("jupiter", "SOL/USDC", Duration::from_secs(30));

        assert!(breakers.is_open("jupiter", "SOL/USDC"));
        assert!(!breakers.is_open("jupiter", "SOL/mSOL"));
        assert!(!breakers.is_open("openocean", "SOL/USDC"));
        assert!(breakers.remaining_ms("jupiter", "SOL/USDC") > 29_000);
    }

    #[test]
    fn open_is_forward_only() {
        let breakers = PairBreakers::new();
        breakers.open("jupiter", "SOL/USDC", Duration::from_secs(30));
        breakers.open("jupiter", "SOL/USDC", Duration::from_secs(1));
        assert!(breakers.remaining_ms("jupiter", "SOL/USDC") > 28_000);
    }

    #[test]
    fn closed_once_expired() {
        let breakers = PairBreakers::new();
        breakers.open("jupiter", "SOL/USDC", Duration::from_millis(0));
        assert!(!breakers.is_open("jupiter", "SOL/USDC"));
    }
}
