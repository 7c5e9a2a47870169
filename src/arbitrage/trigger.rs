use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::arbitrage::scanner::{scan_pair, ScanContext, ScanSummary};
use crate::arbitrage::stats::{auto_alpha, RollingStats};
use crate::arbitrage::Candidate;
use crate::config::{AmountMode, PairConfig, Settings, TriggerStrategyKind};
use crate::error::ArbError;
use crate::events::EventType;

/// Where fired candidates go. The executor implements this; tests stub it.
#[async_trait]
pub trait ExecuteSink: Send + Sync {
    async fn execute(&self, candidate: &Candidate) -> Result<(), ArbError>;
}

/// Per-pair state that survives across windows.
#[derive(Debug, Default)]
pub struct PairRunState {
    pub rotate_cursor: usize,
}

#[derive(Debug, Default)]
pub struct PairRunOutcome {
    pub fired: bool,
    pub error_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Single,
    Observe,
    Execute,
}

fn pair_sizes(pair: &PairConfig) -> Vec<String> {
    pair.amount_a_steps
        .clone()
        .unwrap_or_else(|| vec![pair.amount_a.clone()])
}

/// `fixed` picks k sizes once per window, starting at the configured default
/// size's position.
fn fixed_override(settings: &Settings, pair: &PairConfig) -> Option<Vec<String>> {
    let sizes = pair_sizes(pair);
    let k = settings.max_amounts_per_tick.min(sizes.len()).max(1);
    let start = sizes.iter().position(|s| *s == pair.amount_a).unwrap_or(0);
    Some((0..k).map(|i| sizes[(start + i) % sizes.len()].clone()).collect())
}

/// `rotate` round-robins k sizes per tick; the cursor persists across
/// windows.
fn rotate_override(settings: &Settings, pair: &PairConfig, cursor: &mut usize) -> Option<Vec<String>> {
    let sizes = pair_sizes(pair);
    let k = settings.max_amounts_per_tick.min(sizes.len()).max(1);
    let picked = (0..k).map(|i| sizes[(*cursor + i) % sizes.len()].clone()).collect();
    *cursor = (*cursor + k) % sizes.len();
    Some(picked)
}

/// Whether this tick may spend secondary quote budget. Armed strategies
/// always may: the decision point wants the best execution price available.
fn secondary_allowed(settings: &Settings, phase: Phase, tick: u64, armed: bool) -> bool {
    if !settings.openocean_enabled {
        return false;
    }
    if armed {
        return true;
    }
    let phase_enabled = match phase {
        Phase::Observe => settings.openocean_observe,
        Phase::Single | Phase::Execute => settings.openocean_execute,
    };
    phase_enabled && tick % settings.openocean_every_n_ticks.max(1) as u64 == 0
}

/// Per-candidate profit signal in parts per million of notional.
fn candidate_ppm(candidate: &Candidate) -> f64 {
    let core = candidate.core();
    if core.amount_in == 0 {
        return f64::NAN;
    }
    core.decision.conservative_profit as f64 * 1e6 / core.amount_in as f64
}

/// Scan-level VWAP signal: all candidates' conservative profit over all
/// notional, in ppm.
fn scan_vwap_ppm(summary: &ScanSummary) -> Option<f64> {
    if summary.candidates.is_empty() {
        return None;
    }
    let profit: i128 = summary
        .candidates
        .iter()
        .map(|c| c.core().decision.conservative_profit)
        .sum();
    let notional: u128 = summary.candidates.iter().map(|c| c.core().amount_in).sum();
    if notional == 0 {
        return None;
    }
    Some(profit as f64 * 1e6 / notional as f64)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TickAction {
    None,
    Arm,
    Fire(&'static str),
}

/// Execute-phase arming and trailing-stop bookkeeping, pure so the rules are
/// testable without clocks.
#[derive(Debug)]
struct ExecuteRule {
    arm_threshold_ppm: f64,
    emergency_threshold_ppm: Option<f64>,
    trail_drop_ppm: f64,
    lookback: u32,
    armed: bool,
    peak_ppm: f64,
    declines: u32,
}

impl ExecuteRule {
    fn new(arm_threshold_ppm: f64, emergency_threshold_ppm: Option<f64>, trail_drop_ppm: f64, lookback: u32) -> Self {
        Self {
            arm_threshold_ppm,
            emergency_threshold_ppm,
            trail_drop_ppm,
            lookback: lookback.max(1),
            armed: false,
            peak_ppm: f64::NEG_INFINITY,
            declines: 0,
        }
    }

    fn on_tick(&mut self, ppm: f64) -> TickAction {
        if !ppm.is_finite() {
            return TickAction::None;
        }
        if let Some(emergency) = self.emergency_threshold_ppm {
            if ppm >= emergency {
                return TickAction::Fire("emergency-sigma");
            }
        }
        if !self.armed {
            if ppm >= self.arm_threshold_ppm {
                self.armed = true;
                self.peak_ppm = ppm;
                self.declines = 0;
                return TickAction::Arm;
            }
            return TickAction::None;
        }
        if ppm > self.peak_ppm {
            self.peak_ppm = ppm;
            self.declines = 0;
        } else if self.peak_ppm - ppm >= self.trail_drop_ppm {
            self.declines += 1;
            if self.declines >= self.lookback {
                return TickAction::Fire("trailing-stop");
            }
        } else {
            self.declines = 0;
        }
        TickAction::None
    }

    fn reset_declines(&mut self) {
        self.declines = 0;
    }
}

/// Drive one scheduling slot for a pair: a single scan for `immediate`, a
/// full observe/execute window for the windowed strategies.
pub async fn run_pair(
    ctx: &ScanContext,
    pair: &PairConfig,
    state: &mut PairRunState,
    executor: &dyn ExecuteSink,
    stop: &watch::Receiver<bool>,
) -> PairRunOutcome {
    match ctx.settings.trigger_strategy {
        TriggerStrategyKind::Immediate => run_immediate(ctx, pair, state, executor).await,
        _ => run_window(ctx, pair, state, executor, stop).await,
    }
}

fn override_for_tick(
    ctx: &ScanContext,
    pair: &PairConfig,
    state: &mut PairRunState,
    fixed: &Option<Vec<String>>,
) -> Option<Vec<String>> {
    match ctx.settings.amount_mode {
        AmountMode::All => None,
        AmountMode::Fixed => fixed.clone(),
        AmountMode::Rotate => rotate_override(&ctx.settings, pair, &mut state.rotate_cursor),
    }
}

async fn fire_and_execute(
    ctx: &ScanContext,
    pair: &PairConfig,
    candidate: &Candidate,
    reason: &'static str,
    outcome: &mut PairRunOutcome,
    executor: &dyn ExecuteSink,
) {
    ctx.events
        .emit(
            EventType::TriggerFire,
            json!({
                "pair": pair.name,
                "strategy": strategy_name(ctx.settings.trigger_strategy),
                "reason": reason,
                "amountIn": candidate.core().amount_in.to_string(),
                "conservativeProfit": candidate.core().decision.conservative_profit.to_string(),
            }),
        )
        .await;
    match executor.execute(candidate).await {
        Ok(()) => outcome.fired = true,
        Err(e) => {
            outcome.error_count += 1;
            ctx.events
                .emit(
                    EventType::Error,
                    json!({"pair": pair.name, "stage": "execute", "error": e.to_string()}),
                )
                .await;
        }
    }
}

fn strategy_name(kind: TriggerStrategyKind) -> &'static str {
    match kind {
        TriggerStrategyKind::Immediate => "immediate",
        TriggerStrategyKind::AvgWindow => "avg-window",
        TriggerStrategyKind::Vwap => "vwap",
        TriggerStrategyKind::Bollinger => "bollinger",
    }
}

async fn run_immediate(
    ctx: &ScanContext,
    pair: &PairConfig,
    state: &mut PairRunState,
    executor: &dyn ExecuteSink,
) -> PairRunOutcome {
    let mut outcome = PairRunOutcome::default();
    let fixed = fixed_override(&ctx.settings, pair);
    let amounts = override_for_tick(ctx, pair, state, &fixed);
    let secondary = secondary_allowed(&ctx.settings, Phase::Single, 0, false);

    let summary = scan_pair(ctx, pair, amounts.as_deref(), secondary).await;
    outcome.error_count += summary.error_count;

    match summary.best_candidate() {
        Some(best) if best.core().decision.profitable => {
            let best = best.clone();
            fire_and_execute(ctx, pair, &best, "immediate", &mut outcome, executor).await;
        }
        Some(_) => {
            ctx.events
                .emit(
                    EventType::Skip,
                    json!({"pair": pair.name, "reason": "not-profitable"}),
                )
                .await;
        }
        None => {
            if summary.error_count == 0 {
                ctx.events
                    .emit(
                        EventType::Skip,
                        json!({"pair": pair.name, "reason": "no-candidates"}),
                    )
                    .await;
            }
        }
    }
    outcome
}

struct ObserveResult {
    stats: RollingStats,
    positive_sum: i128,
    positive_count: u64,
    fired: bool,
}

async fn run_window(
    ctx: &ScanContext,
    pair: &PairConfig,
    state: &mut PairRunState,
    executor: &dyn ExecuteSink,
    stop: &watch::Receiver<bool>,
) -> PairRunOutcome {
    let settings = &ctx.settings;
    let strategy = settings.trigger_strategy;
    let mut outcome = PairRunOutcome::default();

    ctx.events
        .emit(
            EventType::TriggerStart,
            json!({
                "pair": pair.name,
                "strategy": strategy_name(strategy),
                "observeMs": settings.observe_ms,
                "executeMs": settings.execute_ms,
            }),
        )
        .await;

    let fixed = fixed_override(settings, pair);

    // --- observe phase ---
    let alpha = if settings.trigger_alpha > 0.0 {
        settings.trigger_alpha.clamp(0.01, 1.0)
    } else {
        auto_alpha(settings.observe_ms, settings.observe_interval_ms)
    };
    let observe = observe_phase(ctx, pair, state, executor, stop, &fixed, alpha, &mut outcome).await;
    let Some(observe) = observe else {
        return outcome; // cancelled or fired via emergency break-through
    };
    if observe.fired {
        outcome.fired = true;
        return outcome;
    }

    let avg = if observe.positive_count > 0 {
        observe.positive_sum as f64 / observe.positive_count as f64
    } else {
        0.0
    };
    ctx.events
        .emit(
            EventType::TriggerStats,
            json!({
                "pair": pair.name,
                "strategy": strategy_name(strategy),
                "emaPpm": observe.stats.ema(),
                "sigmaPpm": observe.stats.sigma(),
                "samples": observe.stats.samples(),
                "avgConservativeProfit": avg,
            }),
        )
        .await;

    if matches!(strategy, TriggerStrategyKind::Vwap | TriggerStrategyKind::Bollinger)
        && observe.stats.samples() < settings.min_samples
    {
        ctx.events
            .emit(
                EventType::Skip,
                json!({
                    "pair": pair.name,
                    "reason": "insufficient-samples",
                    "samples": observe.stats.samples(),
                    "minSamples": settings.min_samples,
                }),
            )
            .await;
        return outcome;
    }

    // --- execute phase ---
    let arm_threshold = match strategy {
        TriggerStrategyKind::Vwap => settings.target_ppm,
        TriggerStrategyKind::Bollinger => observe.stats.upper_band(settings.bollinger_k),
        _ => 0.0,
    };
    let emergency = (strategy == TriggerStrategyKind::Bollinger
        && settings.emergency_sigma > 0.0)
        .then(|| observe.stats.ema() + settings.emergency_sigma * observe.stats.sigma());
    let mut rule = ExecuteRule::new(
        arm_threshold,
        emergency,
        settings.trail_drop_ppm,
        settings.trail_lookback,
    );

    let deadline = Instant::now() + Duration::from_millis(settings.execute_ms);
    let mut tick: u64 = 0;
    while Instant::now() < deadline {
        if *stop.borrow() {
            return outcome;
        }
        let amounts = override_for_tick(ctx, pair, state, &fixed);
        let secondary = secondary_allowed(settings, Phase::Execute, tick, rule.armed);
        let summary = scan_pair(ctx, pair, amounts.as_deref(), secondary).await;
        outcome.error_count += summary.error_count;

        if let Some(best) = summary.best_candidate() {
            let best = best.clone();
            let ppm = candidate_ppm(&best);
            let profitable = best.core().decision.profitable;
            let action = match ctx.settings.trigger_strategy {
                TriggerStrategyKind::AvgWindow => {
                    let cp = best.core().decision.conservative_profit;
                    if profitable && cp as f64 >= avg {
                        TickAction::Fire("above-average")
                    } else {
                        TickAction::None
                    }
                }
                _ => rule.on_tick(ppm),
            };
            match action {
                TickAction::Arm => {
                    ctx.events
                        .emit(
                            EventType::TriggerArm,
                            json!({
                                "pair": pair.name,
                                "strategy": strategy_name(strategy),
                                "ppm": ppm,
                                "amountIn": best.core().amount_in.to_string(),
                            }),
                        )
                        .await;
                }
                TickAction::Fire(reason) => {
                    if profitable {
                        fire_and_execute(ctx, pair, &best, reason, &mut outcome, executor).await;
                        return outcome;
                    }
                    ctx.events
                        .emit(
                            EventType::Skip,
                            json!({"pair": pair.name, "reason": "not-profitable", "rule": reason}),
                        )
                        .await;
                    rule.reset_declines();
                }
                TickAction::None => {}
            }
        }

        tick += 1;
        if !sleep_tick(stop, settings.execute_interval_ms, deadline).await {
            return outcome;
        }
    }

    ctx.events
        .emit(
            EventType::Skip,
            json!({"pair": pair.name, "reason": "window-expired"}),
        )
        .await;
    outcome
}

#[allow(clippy::too_many_arguments)]
async fn observe_phase(
    ctx: &ScanContext,
    pair: &PairConfig,
    state: &mut PairRunState,
    executor: &dyn ExecuteSink,
    stop: &watch::Receiver<bool>,
    fixed: &Option<Vec<String>>,
    alpha: f64,
    outcome: &mut PairRunOutcome,
) -> Option<ObserveResult> {
    let settings = &ctx.settings;
    let strategy = settings.trigger_strategy;
    let mut result = ObserveResult {
        stats: RollingStats::new(alpha),
        positive_sum: 0,
        positive_count: 0,
        fired: false,
    };

    let deadline = Instant::now() + Duration::from_millis(settings.observe_ms);
    let mut tick: u64 = 0;
    while Instant::now() < deadline {
        if *stop.borrow() {
            return None;
        }
        let amounts = override_for_tick(ctx, pair, state, fixed);
        let secondary = secondary_allowed(settings, Phase::Observe, tick, false);
        let summary = scan_pair(ctx, pair, amounts.as_deref(), secondary).await;
        outcome.error_count += summary.error_count;

        match strategy {
            TriggerStrategyKind::AvgWindow => {
                if let Some(best) = summary.best_candidate() {
                    let cp = best.core().decision.conservative_profit;
                    if cp > 0 {
                        result.positive_sum += cp;
                        result.positive_count += 1;
                    }
                }
            }
            _ => {
                if let Some(ppm) = scan_vwap_ppm(&summary) {
                    result.stats.update(ppm);
                }
                // Emergency break-through during observe.
                if strategy == TriggerStrategyKind::Bollinger
                    && settings.emergency_sigma > 0.0
                    && result.stats.samples() >= settings.min_samples
                {
                    if let Some(best) = summary.best_candidate() {
                        let ppm = candidate_ppm(best);
                        let threshold =
                            result.stats.ema() + settings.emergency_sigma * result.stats.sigma();
                        if ppm.is_finite()
                            && ppm >= threshold
                            && best.core().decision.profitable
                        {
                            let best = best.clone();
                            fire_and_execute(ctx, pair, &best, "emergency-sigma", outcome, executor)
                                .await;
                            result.fired = true;
                            return Some(result);
                        }
                    }
                }
            }
        }

        tick += 1;
        if !sleep_tick(stop, settings.observe_interval_ms, deadline).await {
            return None;
        }
    }
    debug!(
        "observe window done for {}: {} samples",
        pair.name,
        result.stats.samples()
    );
    Some(result)
}

/// Sleep until the next tick, honoring the stop signal and never sleeping
/// past the phase deadline. Returns false when the run should stop.
async fn sleep_tick(stop: &watch::Receiver<bool>, interval_ms: u64, deadline: Instant) -> bool {
    let mut stop = stop.clone();
    let wake = Instant::now() + Duration::from_millis(interval_ms);
    let wake = wake.min(deadline);
    tokio::select! {
        _ = tokio::time::sleep_until(wake) => true,
        changed = stop.changed() => match changed {
            Ok(()) => !*stop.borrow(),
            // Sender gone: nobody can stop us anymore, keep ticking.
            Err(_) => {
                tokio::time::sleep_until(wake).await;
                true
            }
        },
    }
}
