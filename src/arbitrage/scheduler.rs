use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use serde_json::json;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::arbitrage::scanner::ScanContext;
use crate::arbitrage::trigger::{run_pair, ExecuteSink, PairRunOutcome, PairRunState};
use crate::config::PairConfig;
use crate::error::ArbError;
use crate::events::EventType;

/// Spreads pairs across the poll interval, bounds scan fan-out, applies pair
/// cooldowns, and enforces the bounded-error exit.
pub struct Scheduler {
    ctx: Arc<ScanContext>,
    executor: Arc<dyn ExecuteSink>,
    pairs: Vec<PairConfig>,
}

impl Scheduler {
    pub fn new(ctx: Arc<ScanContext>, executor: Arc<dyn ExecuteSink>, pairs: Vec<PairConfig>) -> Self {
        Self { ctx, executor, pairs }
    }

    /// Run scheduling cycles until stopped (or once). Returns an error only
    /// when the bounded-error exit fires; the caller maps that to exit code 1.
    pub async fn run(&self, once: bool, stop: watch::Receiver<bool>) -> Result<(), ArbError> {
        let settings = &self.ctx.settings;
        let poll_interval = Duration::from_millis(settings.poll_interval_ms.max(1));
        let stagger = poll_interval / self.pairs.len().max(1) as u32;
        let semaphore = Arc::new(Semaphore::new(settings.pair_concurrency));

        let mut states: HashMap<String, PairRunState> = HashMap::new();
        let mut cooldowns: HashMap<String, Instant> = HashMap::new();
        let mut errors_total: u64 = 0;
        let mut errors_consecutive: u64 = 0;

        loop {
            let cycle_start = Instant::now();
            let mut tasks: JoinSet<(String, PairRunState, PairRunOutcome, u64)> = JoinSet::new();

            for (index, pair) in self.pairs.iter().enumerate() {
                if *stop.borrow() {
                    break;
                }
                if let Some(until) = cooldowns.get(&pair.name) {
                    if Instant::now() < *until {
                        debug!("pair {} cooling down", pair.name);
                        continue;
                    }
                }

                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("semaphore never closed");
                let ctx = self.ctx.clone();
                let executor = self.executor.clone();
                let pair = pair.clone();
                let pair_stop = stop.clone();
                let mut state = states.remove(&pair.name).unwrap_or_default();
                tasks.spawn(async move {
                    let outcome = run_pair(&ctx, &pair, &mut state, executor.as_ref(), &pair_stop).await;
                    drop(permit);
                    (pair.name.clone(), state, outcome, pair.cooldown_ms)
                });

                if index + 1 < self.pairs.len() && !sleep_or_stop(&stop, stagger).await {
                    break;
                }
            }

            while let Some(joined) = tasks.join_next().await {
                let Ok((name, state, outcome, cooldown_ms)) = joined else {
                    errors_total += 1;
                    errors_consecutive += 1;
                    continue;
                };
                states.insert(name.clone(), state);
                if cooldown_ms > 0 {
                    cooldowns.insert(name, Instant::now() + Duration::from_millis(cooldown_ms));
                }
                if outcome.error_count > 0 {
                    errors_total += outcome.error_count;
                    errors_consecutive += outcome.error_count;
                } else {
                    errors_consecutive = 0;
                }
            }

            let total_cap = settings.max_errors_before_exit;
            let consecutive_cap = settings.max_consecutive_errors_before_exit;
            if (total_cap > 0 && errors_total >= total_cap)
                || (consecutive_cap > 0 && errors_consecutive >= consecutive_cap)
            {
                self.ctx
                    .events
                    .emit(
                        EventType::Exit,
                        json!({
                            "reason": "error-budget-exhausted",
                            "errorsTotal": errors_total,
                            "errorsConsecutive": errors_consecutive,
                        }),
                    )
                    .await;
                return Err(ArbError::ExecutionError(format!(
                    "error budget exhausted: total={errors_total} consecutive={errors_consecutive}"
                )));
            }

            if once {
                info!("single pass complete");
                return Ok(());
            }
            if *stop.borrow() {
                return Ok(());
            }
            let elapsed = cycle_start.elapsed();
            if elapsed < poll_interval && !sleep_or_stop(&stop, poll_interval - elapsed).await {
                return Ok(());
            }
        }
    }
}

/// Returns false when the stop signal fired during the sleep.
async fn sleep_or_stop(stop: &watch::Receiver<bool>, duration: Duration) -> bool {
    let mut stop = stop.clone();
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        changed = stop.changed() => match changed {
            Ok(()) => !*stop.borrow(),
            Err(_) => {
                tokio::time::sleep(duration).await;
                true
            }
        },
    }
}
