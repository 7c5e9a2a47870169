use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;

use crate::config::UpstreamRateSettings;

/// Tuning for one adaptive token bucket.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub name: String,
    pub base_rps: f64,
    pub min_rps: f64,
    pub burst: f64,
    pub penalty: Duration,
    pub recovery_every: Duration,
    pub recovery_step_rps: f64,
}

impl LimiterConfig {
    pub fn from_settings(name: &str, rate: &UpstreamRateSettings) -> Self {
        let base_rps = rate.effective_rps().max(0.05);
        Self {
            name: name.to_string(),
            base_rps,
            min_rps: (base_rps * 0.25).max(0.05),
            burst: rate.burst.max(1.0),
            penalty: Duration::from_millis(rate.penalty_ms.max(1_000)),
            recovery_every: Duration::from_millis(rate.recovery_every_ms.max(1_000)),
            recovery_step_rps: rate.recovery_step_rps,
        }
    }
}

#[derive(Debug)]
struct LimiterState {
    current_rps: f64,
    tokens: f64,
    last_refill: Instant,
    cooldown_until: Option<Instant>,
    penalty_until: Option<Instant>,
    last_recovery: Instant,
    calls: u64,
    hits_429: u64,
    last_429: Option<Instant>,
}

/// Snapshot exposed on the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterSnapshot {
    pub name: String,
    pub base_rps: f64,
    pub current_rps: f64,
    pub tokens: f64,
    pub calls: u64,
    pub hits_429: u64,
    pub in_penalty: bool,
    pub cooldown_ms_remaining: u64,
}

/// Token bucket that adapts to upstream 429s: halve on a hit, step back up
/// while requests keep succeeding. Callers are admitted strictly FIFO through
/// the sequencer so a burst of tasks cannot race the same token.
pub struct AdaptiveRateLimiter {
    config: LimiterConfig,
    state: Mutex<LimiterState>,
    seq: AsyncMutex<()>,
}

impl AdaptiveRateLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        let now = Instant::now();
        let state = LimiterState {
            current_rps: config.base_rps,
            tokens: config.burst,
            last_refill: now,
            cooldown_until: None,
            penalty_until: None,
            last_recovery: now,
            calls: 0,
            hits_429: 0,
            last_429: None,
        };
        Self {
            config,
            state: Mutex::new(state),
            seq: AsyncMutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Wait for one token (and for any cooldown window to pass), FIFO.
    pub async fn acquire(&self) {
        let _turn = self.seq.lock().await;
        loop {
            let wait = self.try_take(Instant::now());
            match wait {
                None => return,
                Some(wait) => sleep(wait).await,
            }
        }
    }

    /// Run `f` once a token is available.
    pub async fn schedule<T, Fut>(&self, f: Fut) -> T
    where
        Fut: Future<Output = T>,
    {
        self.acquire().await;
        f.await
    }

    /// One refill-and-consume step. Returns how long to sleep when no token
    /// is available yet.
    fn try_take(&self, now: Instant) -> Option<Duration> {
        let mut st = self.state.lock().unwrap();
        let elapsed = now.saturating_duration_since(st.last_refill);
        st.tokens = (st.tokens + elapsed.as_secs_f64() * st.current_rps).min(self.config.burst);
        st.last_refill = now;

        let cooldown_wait = st
            .cooldown_until
            .and_then(|until| until.checked_duration_since(now))
            .unwrap_or(Duration::ZERO);

        if st.tokens >= 1.0 && cooldown_wait.is_zero() {
            st.tokens -= 1.0;
            st.calls += 1;
            return None;
        }

        let token_wait = if st.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - st.tokens) / st.current_rps)
        };
        Some(token_wait.max(cooldown_wait).max(Duration::from_millis(1)))
    }

    pub fn note_429(&self) {
        self.note_429_at(Instant::now());
    }

    fn note_429_at(&self, now: Instant) {
        let mut st = self.state.lock().unwrap();
        let before = st.current_rps;
        st.current_rps = (st.current_rps * 0.5).max(self.config.min_rps);
        st.penalty_until = Some(now + self.config.penalty);
        st.last_recovery = now;
        st.hits_429 += 1;
        st.last_429 = Some(now);
        warn!(
            "[{}] 429: rps {:.3} -> {:.3}, penalty {}ms",
            self.config.name,
            before,
            st.current_rps,
            self.config.penalty.as_millis()
        );
    }

    pub fn note_success(&self) {
        self.note_success_at(Instant::now());
    }

    fn note_success_at(&self, now: Instant) {
        let mut st = self.state.lock().unwrap();
        if st.penalty_until.is_some_and(|until| now < until) {
            return;
        }
        if st.current_rps < self.config.base_rps
            && now.saturating_duration_since(st.last_recovery) >= self.config.recovery_every
        {
            st.current_rps =
                (st.current_rps + self.config.recovery_step_rps).min(self.config.base_rps);
            st.last_recovery = now;
            debug!("[{}] recovered to {:.3} rps", self.config.name, st.current_rps);
        }
    }

    /// Push the shared cooldown forward; never shortens an existing one.
    pub fn cooldown(&self, duration: Duration) {
        let until = Instant::now() + duration;
        let mut st = self.state.lock().unwrap();
        st.cooldown_until = Some(match st.cooldown_until {
            Some(existing) => existing.max(until),
            None => until,
        });
    }

    pub fn current_rps(&self) -> f64 {
        self.state.lock().unwrap().current_rps
    }

    pub fn snapshot(&self) -> LimiterSnapshot {
        let now = Instant::now();
        let st = self.state.lock().unwrap();
        LimiterSnapshot {
            name: self.config.name.clone(),
            base_rps: self.config.base_rps,
            current_rps: st.current_rps,
            tokens: st.tokens,
            calls: st.calls,
            hits_429: st.hits_429,
            in_penalty: st.penalty_until.is_some_and(|until| now < until),
            cooldown_ms_remaining: st
                .cooldown_until
                .and_then(|until| until.checked_duration_since(now))
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        }
    }

    #[cfg(test)]
    fn rewind_recovery_clock(&self, by: Duration) {
        let mut st = self.state.lock().unwrap();
        st.last_recovery -= by;
        if let Some(p) = st.penalty_until.as_mut() {
            *p -= by;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(base_rps: f64) -> AdaptiveRateLimiter {
        AdaptiveRateLimiter::new(LimiterConfig {
            name: "test".to_string(),
            base_rps,
            min_rps: 0.25,
            burst: 2.0,
            penalty: Duration::from_millis(1_000),
            recovery_every: Duration::from_millis(1_000),
            recovery_step_rps: 0.1,
        })
    }

    #[test]
    fn note_429_halves_down_to_floor() {
        let lim = limiter(2.0);
        lim.note_429();
        assert_eq!(lim.current_rps(), 1.0);
        lim.note_429();
        assert_eq!(lim.current_rps(), 0.5);
        lim.note_429();
        assert_eq!(lim.current_rps(), 0.25);
        lim.note_429();
        assert_eq!(lim.current_rps(), 0.25);
    }

    #[test]
    fn success_recovers_only_after_penalty_and_interval() {
        let lim = limiter(2.0);
        lim.note_429();
        assert_eq!(lim.current_rps(), 1.0);

        // Inside penalty: no recovery.
        lim.note_success();
        assert_eq!(lim.current_rps(), 1.0);

        // Outside penalty with the recovery interval elapsed: step up.
        lim.rewind_recovery_clock(Duration::from_millis(2_000));
        lim.note_success();
        assert!((lim.current_rps() - 1.1).abs() < 1e-9);

        // Interval not elapsed again yet: hold.
        lim.note_success();
        assert!((lim.current_rps() - 1.1).abs() < 1e-9);
    }

    #[test]
    fn recovery_caps_at_base() {
        let lim = limiter(1.0);
        lim.note_429();
        for _ in 0..20 {
            lim.rewind_recovery_clock(Duration::from_millis(2_000));
            lim.note_success();
        }
        assert_eq!(lim.current_rps(), 1.0);
    }

    #[test]
    fn cooldown_is_monotonic() {
        let lim = limiter(1.0);
        lim.cooldown(Duration::from_millis(5_000));
        let long = lim.snapshot().cooldown_ms_remaining;
        lim.cooldown(Duration::from_millis(100));
        let after = lim.snapshot().cooldown_ms_remaining;
        assert!(after >= long.saturating_sub(50), "cooldown shrank: {long} -> {after}");
    }

    #[tokio::test]
    async fn burst_tokens_admit_immediately_then_throttle() {
        let lim = limiter(1000.0);
        let start = Instant::now();
        lim.acquire().await;
        lim.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(100));

        let snap = lim.snapshot();
        assert_eq!(snap.calls, 2);
        assert!(snap.tokens < 1.0);
    }
}
