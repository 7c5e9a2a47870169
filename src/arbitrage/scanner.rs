use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde_json::json;
use solana_sdk::pubkey::Pubkey;

use crate::aggregator::{JupiterQuote, PrimaryQuoter, QuoteRequest, SecondaryQuoter, UltraClient};
use crate::arbitrage::decider::{Decide, DecideRequest};
use crate::arbitrage::fees::{
    compute_tip, estimate_fee_lamports, is_native_mint, min_profit_in_a, FeeConverter, FeeParams,
    TipParams,
};
use crate::arbitrage::{Candidate, CandidateCore, PrimaryLeg};
use crate::config::{ExecutionProvider, ExecutionStrategy, PairConfig, Settings};
use crate::error::ArbError;
use crate::events::{EventLog, EventType};
use crate::rate::PairBreakers;

pub const PROVIDER_JUPITER: &str = "jupiter";
pub const PROVIDER_OPENOCEAN: &str = "openocean";

/// Everything a scan needs, passed by handle from the scheduler.
pub struct ScanContext {
    pub settings: Arc<Settings>,
    pub jupiter: Arc<dyn PrimaryQuoter>,
    pub ultra: Option<Arc<UltraClient>>,
    pub openocean: Option<Arc<dyn SecondaryQuoter>>,
    pub breakers: Arc<PairBreakers>,
    pub fee_converter: Arc<FeeConverter>,
    pub decider: Arc<dyn Decide>,
    pub events: Arc<EventLog>,
    pub wallet: Pubkey,
}

#[derive(Debug, Default)]
pub struct ScanSummary {
    pub candidates: Vec<Candidate>,
    pub best: Option<usize>,
    pub error_count: u64,
}

impl ScanSummary {
    pub fn best_candidate(&self) -> Option<&Candidate> {
        self.best.and_then(|i| self.candidates.get(i))
    }
}

/// Candidate input sizes for one scan: trigger override, else the configured
/// step list, else the single default size. Non-numeric entries are dropped,
/// sizes strictly above the notional ceiling are excluded, duplicates keep
/// their first position.
pub fn build_amount_list(pair: &PairConfig, amount_override: Option<&[String]>) -> Vec<String> {
    let base: Vec<String> = match amount_override {
        Some(sizes) if !sizes.is_empty() => sizes.to_vec(),
        _ => pair
            .amount_a_steps
            .clone()
            .unwrap_or_else(|| vec![pair.amount_a.clone()]),
    };
    let max_notional = pair.max_notional_a_u128();
    let mut seen = HashSet::new();
    base.into_iter()
        .filter(|s| crate::config::pairs::is_decimal_string(s))
        .filter(|s| match (s.parse::<u128>(), max_notional) {
            (Ok(size), Some(max)) => size <= max,
            (Ok(_), None) => true,
            (Err(_), _) => false,
        })
        .filter(|s| seen.insert(s.clone()))
        .collect()
}

fn quote_request(
    pair: &PairConfig,
    input_mint: &str,
    output_mint: &str,
    amount: u128,
    leg: u8,
) -> QuoteRequest {
    QuoteRequest {
        input_mint: input_mint.to_string(),
        output_mint: output_mint.to_string(),
        amount,
        slippage_bps: pair.slippage_for_leg(leg),
        include_dexes: pair.include_dexes.clone(),
        exclude_dexes: pair.exclude_dexes.clone(),
    }
}

/// Scan one pair across its candidate sizes and pick the best round trip by
/// conservative profit (first-seen wins ties).
pub async fn scan_pair(
    ctx: &ScanContext,
    pair: &PairConfig,
    amount_override: Option<&[String]>,
    secondary_allowed: bool,
) -> ScanSummary {
    let mut summary = ScanSummary::default();

    if let Some(remaining) = ctx.breakers.remaining(PROVIDER_JUPITER, &pair.name) {
        ctx.events
            .emit(
                EventType::Skip,
                json!({
                    "pair": pair.name,
                    "reason": "rate-limited",
                    "provider": PROVIDER_JUPITER,
                    "cooldownMsRemaining": remaining.as_millis() as u64,
                }),
            )
            .await;
        return summary;
    }

    let amounts = build_amount_list(pair, amount_override);
    if amounts.is_empty() {
        ctx.events
            .emit(
                EventType::Skip,
                json!({"pair": pair.name, "reason": "no-amounts"}),
            )
            .await;
        return summary;
    }

    let fee_params = FeeParams::resolve(&ctx.settings, pair);
    let tip_params = TipParams::from_settings(&ctx.settings);
    let use_ultra = ctx.settings.execution_provider == ExecutionProvider::Ultra
        && ctx.ultra.is_some()
        && !pair.is_triangular()
        && is_native_mint(&pair.a_mint)
        && ctx.settings.execution_strategy == ExecutionStrategy::Sequential;

    for amount_str in &amounts {
        let amount: u128 = amount_str.parse().expect("filtered to decimal strings");
        let result = if pair.is_triangular() {
            scan_triangular_amount(ctx, pair, &fee_params, &tip_params, amount).await
        } else if use_ultra {
            scan_ultra_amount(ctx, pair, &fee_params, &tip_params, amount).await
        } else {
            scan_loop_amount(ctx, pair, &fee_params, &tip_params, amount).await
        };

        match result {
            Ok(candidate) => {
                emit_candidate(ctx, &candidate).await;
                summary.candidates.push(candidate);
            }
            Err(e) => {
                summary.error_count += 1;
                ctx.events
                    .emit(
                        EventType::CandidateError,
                        json!({
                            "pair": pair.name,
                            "provider": PROVIDER_JUPITER,
                            "amountIn": amount_str,
                            "error": e.to_string(),
                        }),
                    )
                    .await;
                if e.is_rate_limit() {
                    trip_breaker(ctx, PROVIDER_JUPITER, pair, ctx.settings.jupiter_rate.cooldown_429_ms)
                        .await;
                    break;
                }
            }
        }
    }

    summary.best = pick_best(&summary.candidates);

    let best_core = summary.best_candidate().map(|c| c.core().clone());
    if let Some(core) = best_core {
        if secondary_eligible(ctx, pair) {
            scan_secondary(ctx, pair, &fee_params, &core, secondary_allowed, &mut summary).await;
            summary.best = pick_best(&summary.candidates);
        }
    }

    let best_fields = summary.best_candidate().map(|c| {
        json!({
            "kind": c.kind(),
            "amountIn": c.core().amount_in.to_string(),
            "conservativeProfit": c.core().decision.conservative_profit.to_string(),
            "profitable": c.core().decision.profitable,
        })
    });
    ctx.events
        .emit(
            EventType::ScanSummary,
            json!({
                "pair": pair.name,
                "amounts": amounts.len(),
                "candidates": summary.candidates.len(),
                "errors": summary.error_count,
                "best": best_fields,
            }),
        )
        .await;

    summary
}

fn pick_best(candidates: &[Candidate]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, candidate) in candidates.iter().enumerate() {
        let better = match best {
            None => true,
            Some(j) => {
                candidate.core().decision.conservative_profit
                    > candidates[j].core().decision.conservative_profit
            }
        };
        if better {
            best = Some(i);
        }
    }
    best
}

fn secondary_eligible(ctx: &ScanContext, pair: &PairConfig) -> bool {
    ctx.settings.openocean_enabled
        && ctx.openocean.is_some()
        && ctx.settings.execution_strategy == ExecutionStrategy::Sequential
        && !pair.is_triangular()
}

async fn trip_breaker(ctx: &ScanContext, provider: &str, pair: &PairConfig, cooldown_ms: u64) {
    ctx.breakers
        .open(provider, &pair.name, Duration::from_millis(cooldown_ms));
    ctx.events
        .emit(
            EventType::RateLimit,
            json!({
                "pair": pair.name,
                "provider": provider,
                "cooldownMs": cooldown_ms,
            }),
        )
        .await;
}

async fn emit_candidate(ctx: &ScanContext, candidate: &Candidate) {
    let core = candidate.core();
    ctx.events
        .emit(
            EventType::Candidate,
            json!({
                "pair": core.pair_name,
                "kind": candidate.kind(),
                "provider": candidate.provider(),
                "amountIn": core.amount_in.to_string(),
                "finalMinOut": candidate.final_min_out().to_string(),
                "tipLamports": core.tip_lamports,
                "feeLamports": core.fee_lamports,
                "feeInA": core.fee_in_a.to_string(),
                "profit": core.decision.profit.to_string(),
                "conservativeProfit": core.decision.conservative_profit.to_string(),
                "profitable": core.decision.profitable,
            }),
        )
        .await;
}

#[allow(clippy::too_many_arguments)]
async fn decide_core(
    ctx: &ScanContext,
    pair: &PairConfig,
    fee_params: &FeeParams,
    amount: u128,
    leg1_out: u128,
    leg1_min_out: u128,
    final_out: u128,
    final_min_out: u128,
    tip_lamports: u64,
    fee_lamports: u64,
    provider: &'static str,
) -> Result<CandidateCore, ArbError> {
    let fee_in_a = ctx.fee_converter.fee_in_a(pair, fee_lamports, provider).await?;
    let min_profit = min_profit_in_a(pair.min_profit_a_u128(), pair.min_profit_bps, amount);
    let decision = ctx
        .decider
        .decide(&DecideRequest {
            amount_in: amount,
            leg1_out,
            leg1_min_out,
            final_out,
            final_min_out,
            fee_in_a,
            min_profit_in_a: min_profit,
        })
        .await;
    Ok(CandidateCore {
        pair_name: pair.name.clone(),
        amount_in: amount,
        tip_lamports,
        fee_lamports,
        fee_in_a,
        cu_limit: fee_params.cu_limit,
        cu_price_micro_lamports: fee_params.cu_price_micro_lamports,
        decision,
    })
}

fn tip_for(ctx: &ScanContext, tip_params: &TipParams, pair: &PairConfig, amount: u128, final_min_out: u128) -> u64 {
    if !ctx.settings.jito_enabled {
        return 0;
    }
    compute_tip(tip_params, is_native_mint(&pair.a_mint), amount, final_min_out)
}

async fn scan_loop_amount(
    ctx: &ScanContext,
    pair: &PairConfig,
    fee_params: &FeeParams,
    tip_params: &TipParams,
    amount: u128,
) -> Result<Candidate, ArbError> {
    let quote1 = ctx
        .jupiter
        .quote_exact_in(&quote_request(pair, &pair.a_mint, &pair.b_mint, amount, 1))
        .await?;
    let quote2 = ctx
        .jupiter
        .quote_exact_in(&quote_request(
            pair,
            &pair.b_mint,
            &pair.a_mint,
            quote1.other_amount_threshold,
            2,
        ))
        .await?;

    let tip = tip_for(ctx, tip_params, pair, amount, quote2.other_amount_threshold);
    let tx_count = match ctx.settings.execution_strategy {
        ExecutionStrategy::Atomic => 1,
        ExecutionStrategy::Sequential => 2,
    };
    let fee_lamports = estimate_fee_lamports(fee_params, tx_count, 1, tip);
    let core = decide_core(
        ctx,
        pair,
        fee_params,
        amount,
        quote1.out_amount,
        quote1.other_amount_threshold,
        quote2.out_amount,
        quote2.other_amount_threshold,
        tip,
        fee_lamports,
        PROVIDER_JUPITER,
    )
    .await?;
    Ok(Candidate::Loop {
        core,
        leg1: PrimaryLeg::Quote(quote1),
        leg2: PrimaryLeg::Quote(quote2),
    })
}

async fn scan_ultra_amount(
    ctx: &ScanContext,
    pair: &PairConfig,
    fee_params: &FeeParams,
    tip_params: &TipParams,
    amount: u128,
) -> Result<Candidate, ArbError> {
    let ultra = ctx.ultra.as_ref().expect("ultra client checked by caller");
    let taker = ctx.wallet.to_string();
    let exclude = pair.exclude_dexes.as_deref();
    let order1 = ultra
        .order(&pair.a_mint, &pair.b_mint, amount, &taker, exclude)
        .await?;
    let order2 = ultra
        .order(
            &pair.b_mint,
            &pair.a_mint,
            order1.other_amount_threshold,
            &taker,
            exclude,
        )
        .await?;

    let tip = tip_for(ctx, tip_params, pair, amount, order2.other_amount_threshold);
    let fee_lamports = estimate_fee_lamports(fee_params, 2, 1, tip);
    let core = decide_core(
        ctx,
        pair,
        fee_params,
        amount,
        order1.out_amount,
        order1.other_amount_threshold,
        order2.out_amount,
        order2.other_amount_threshold,
        tip,
        fee_lamports,
        PROVIDER_JUPITER,
    )
    .await?;
    Ok(Candidate::Loop {
        core,
        leg1: PrimaryLeg::Ultra(order1),
        leg2: PrimaryLeg::Ultra(order2),
    })
}

async fn scan_triangular_amount(
    ctx: &ScanContext,
    pair: &PairConfig,
    fee_params: &FeeParams,
    tip_params: &TipParams,
    amount: u128,
) -> Result<Candidate, ArbError> {
    let c_mint = pair.c_mint.as_deref().expect("triangular pair has cMint");
    let quote1 = ctx
        .jupiter
        .quote_exact_in(&quote_request(pair, &pair.a_mint, &pair.b_mint, amount, 1))
        .await?;
    let quote2 = ctx
        .jupiter
        .quote_exact_in(&quote_request(
            pair,
            &pair.b_mint,
            c_mint,
            quote1.other_amount_threshold,
            2,
        ))
        .await?;
    let quote3 = ctx
        .jupiter
        .quote_exact_in(&quote_request(
            pair,
            c_mint,
            &pair.a_mint,
            quote2.other_amount_threshold,
            3,
        ))
        .await?;

    let tip = tip_for(ctx, tip_params, pair, amount, quote3.other_amount_threshold);
    let fee_lamports = estimate_fee_lamports(fee_params, 1, 1, tip);
    let core = decide_core(
        ctx,
        pair,
        fee_params,
        amount,
        quote1.out_amount,
        quote1.other_amount_threshold,
        quote3.out_amount,
        quote3.other_amount_threshold,
        tip,
        fee_lamports,
        PROVIDER_JUPITER,
    )
    .await?;
    Ok(Candidate::Triangular {
        core,
        quote1,
        quote2,
        quote3,
    })
}

/// Second opinion from the meta-aggregator, gated by how the best primary
/// candidate looks. Clearly-unprofitable and clearly-profitable scans both
/// skip it to protect the secondary quote budget.
async fn scan_secondary(
    ctx: &ScanContext,
    pair: &PairConfig,
    fee_params: &FeeParams,
    best: &CandidateCore,
    secondary_allowed: bool,
    summary: &mut ScanSummary,
) {
    if !secondary_allowed {
        return;
    }
    let amount = best.amount_in;
    if amount == 0 {
        return;
    }

    let bps = best.decision.conservative_profit * 10_000 / amount as i128;
    let gate = ctx.settings.openocean_jupiter_gate_bps as i128;
    let near_gate = ctx.settings.openocean_jupiter_near_gate_bps as i128;
    if bps < gate {
        ctx.events
            .emit(
                EventType::OpenoceanSkip,
                json!({"pair": pair.name, "reason": "below-gate", "bps": bps as f64}),
            )
            .await;
        return;
    }
    if near_gate > 0 && bps > gate + near_gate {
        ctx.events
            .emit(
                EventType::OpenoceanSkip,
                json!({"pair": pair.name, "reason": "above-near-gate", "bps": bps as f64}),
            )
            .await;
        return;
    }
    if let Some(remaining) = ctx.breakers.remaining(PROVIDER_OPENOCEAN, &pair.name) {
        ctx.events
            .emit(
                EventType::OpenoceanSkip,
                json!({
                    "pair": pair.name,
                    "reason": "rate-limited",
                    "cooldownMsRemaining": remaining.as_millis() as u64,
                }),
            )
            .await;
        return;
    }

    let openocean = ctx.openocean.as_ref().expect("eligibility checked");
    // Quote errors here belong to the secondary provider. The fee-conversion
    // call below goes through the primary quoter, so it is scoped apart:
    // a primary 429 must never open the secondary breaker.
    let quotes = async {
        let quote1 = openocean
            .quote_exact_in(&pair.a_mint, &pair.b_mint, amount, pair.slippage_for_leg(1))
            .await?;
        let quote2 = openocean
            .quote_exact_in(
                &pair.b_mint,
                &pair.a_mint,
                quote1.min_out_amount,
                pair.slippage_for_leg(2),
            )
            .await?;
        Ok::<_, ArbError>((quote1, quote2))
    }
    .await;

    let (quote1, quote2) = match quotes {
        Ok(quotes) => quotes,
        Err(e) => {
            secondary_candidate_error(ctx, pair, amount, PROVIDER_OPENOCEAN, &e, summary).await;
            if e.is_rate_limit() {
                trip_breaker(
                    ctx,
                    PROVIDER_OPENOCEAN,
                    pair,
                    ctx.settings.openocean_rate.cooldown_429_ms,
                )
                .await;
            }
            return;
        }
    };

    let fee_lamports = estimate_fee_lamports(fee_params, 2, ctx.settings.openocean_sigs_estimate, 0);
    let core = match decide_core(
        ctx,
        pair,
        fee_params,
        amount,
        quote1.out_amount,
        quote1.min_out_amount,
        quote2.out_amount,
        quote2.min_out_amount,
        0,
        fee_lamports,
        PROVIDER_OPENOCEAN,
    )
    .await
    {
        Ok(core) => core,
        Err(e) => {
            secondary_candidate_error(ctx, pair, amount, PROVIDER_JUPITER, &e, summary).await;
            if e.is_rate_limit() {
                trip_breaker(ctx, PROVIDER_JUPITER, pair, ctx.settings.jupiter_rate.cooldown_429_ms)
                    .await;
            }
            return;
        }
    };

    let candidate = Candidate::LoopSecondary { core, quote1, quote2 };
    emit_candidate(ctx, &candidate).await;
    summary.candidates.push(candidate);
    debug!("secondary scan finished for {}", pair.name);
}

async fn secondary_candidate_error(
    ctx: &ScanContext,
    pair: &PairConfig,
    amount: u128,
    provider: &'static str,
    error: &ArbError,
    summary: &mut ScanSummary,
) {
    summary.error_count += 1;
    ctx.events
        .emit(
            EventType::CandidateError,
            json!({
                "pair": pair.name,
                "provider": provider,
                "amountIn": amount.to_string(),
                "error": error.to_string(),
            }),
        )
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::OpenOceanQuote;
    use crate::arbitrage::decider::LocalDecider;
    use crate::config::settings::Mode;
    use async_trait::async_trait;
    use serde_json::json as j;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    const SOL: &str = "So11111111111111111111111111111111111111112";
    const USDC: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
    const MSOL: &str = "mSoLzYCxHdYgdzU16g5QSh3i5K3z3KZK7ytfqcJm7So";

    /// Scripted quoter: responses keyed by (inputMint, amount).
    struct StubPrimary {
        responses: Mutex<HashMap<(String, u128), Result<(u128, u128), ArbError>>>,
    }

    impl StubPrimary {
        fn new() -> Self {
            Self { responses: Mutex::new(HashMap::new()) }
        }

        fn quote(self, input: &str, amount: u128, out: u128, min_out: u128) -> Self {
            self.responses
                .lock()
                .unwrap()
                .insert((input.to_string(), amount), Ok((out, min_out)));
            self
        }

        fn fail(self, input: &str, amount: u128, err: ArbError) -> Self {
            self.responses
                .lock()
                .unwrap()
                .insert((input.to_string(), amount), Err(err));
            self
        }
    }

    #[async_trait]
    impl PrimaryQuoter for StubPrimary {
        async fn quote_exact_in(&self, request: &QuoteRequest) -> Result<JupiterQuote, ArbError> {
            let key = (request.input_mint.clone(), request.amount);
            match self.responses.lock().unwrap().get(&key) {
                Some(Ok((out, min_out))) => Ok(JupiterQuote {
                    input_mint: request.input_mint.clone(),
                    output_mint: request.output_mint.clone(),
                    in_amount: request.amount,
                    out_amount: *out,
                    other_amount_threshold: *min_out,
                    slippage_bps: request.slippage_bps,
                    response: j!({}),
                }),
                Some(Err(e)) => Err(e.clone()),
                None => Err(ArbError::AggregatorError(format!(
                    "no stub for {key:?}"
                ))),
            }
        }
    }

    struct StubSecondary {
        out: u128,
        min_out: u128,
    }

    #[async_trait]
    impl SecondaryQuoter for StubSecondary {
        async fn quote_exact_in(
            &self,
            input_mint: &str,
            output_mint: &str,
            amount: u128,
            slippage_bps: u16,
        ) -> Result<OpenOceanQuote, ArbError> {
            Ok(OpenOceanQuote {
                input_mint: input_mint.to_string(),
                output_mint: output_mint.to_string(),
                in_amount: amount,
                out_amount: self.out,
                min_out_amount: self.min_out,
                slippage_bps,
                dex_id: Some("2".to_string()),
            })
        }
    }

    struct RateLimitedSecondary;

    #[async_trait]
    impl SecondaryQuoter for RateLimitedSecondary {
        async fn quote_exact_in(
            &self,
            _input_mint: &str,
            _output_mint: &str,
            _amount: u128,
            _slippage_bps: u16,
        ) -> Result<OpenOceanQuote, ArbError> {
            Err(ArbError::HttpStatus { status: 429, body: "Too Many Requests".into() })
        }
    }

    fn sol_usdc_pair() -> PairConfig {
        serde_json::from_value(j!({
            "name": "SOL/USDC",
            "aMint": SOL,
            "bMint": USDC,
            "slippageBps": 50,
            "amountA": "1000000",
            "minProfitA": "0",
            "cooldownMs": 1000
        }))
        .unwrap()
    }

    fn context(primary: StubPrimary, settings: Settings) -> ScanContext {
        let jupiter: Arc<dyn PrimaryQuoter> = Arc::new(primary);
        ScanContext {
            settings: Arc::new(settings),
            jupiter: jupiter.clone(),
            ultra: None,
            openocean: None,
            breakers: Arc::new(PairBreakers::new()),
            fee_converter: Arc::new(FeeConverter::new(jupiter)),
            decider: Arc::new(LocalDecider),
            events: Arc::new(EventLog::stdout(true)),
            wallet: Pubkey::new_unique(),
        }
    }

    #[tokio::test]
    async fn loop_not_profitable() {
        // Scenario: fees eat the round trip.
        let primary = StubPrimary::new()
            .quote(SOL, 1_000_000, 99_500, 99_000)
            .quote(USDC, 99_000, 999_500, 995_000);
        let ctx = context(primary, Settings::test_default());
        let pair = sol_usdc_pair();

        let summary = scan_pair(&ctx, &pair, None, false).await;
        assert_eq!(summary.candidates.len(), 1);
        let best = summary.best_candidate().unwrap();
        assert_eq!(best.core().fee_lamports, 5_000);
        assert_eq!(best.core().fee_in_a, 5_000);
        assert_eq!(best.core().decision.conservative_profit, -10_000);
        assert!(!best.core().decision.profitable);
    }

    #[tokio::test]
    async fn rate_limit_trips_breaker_and_stops_the_scan() {
        let mut pair = sol_usdc_pair();
        pair.amount_a_steps = Some(vec!["1000000".to_string(), "2000000".to_string()]);
        let primary = StubPrimary::new().fail(
            SOL,
            1_000_000,
            ArbError::HttpStatus { status: 429, body: "Too Many Requests".into() },
        );
        let ctx = context(primary, Settings::test_default());

        let summary = scan_pair(&ctx, &pair, None, false).await;
        assert!(summary.candidates.is_empty());
        assert_eq!(summary.error_count, 1);
        assert!(ctx.breakers.is_open(PROVIDER_JUPITER, "SOL/USDC"));
        // Follow-up scan short-circuits on the open breaker.
        let summary = scan_pair(&ctx, &pair, None, false).await;
        assert!(summary.candidates.is_empty());
        assert_eq!(summary.error_count, 0);
    }

    #[tokio::test]
    async fn triangular_uses_three_legs_and_no_secondary() {
        let mut pair = sol_usdc_pair();
        pair.c_mint = Some(MSOL.to_string());
        let primary = StubPrimary::new()
            .quote(SOL, 1_000_000, 99_500, 99_000)
            .quote(USDC, 99_000, 900_000, 890_000)
            .quote(MSOL, 890_000, 990_000, 980_000);
        let mut settings = Settings::test_default();
        settings.openocean_enabled = true;
        settings.execution_strategy = ExecutionStrategy::Sequential;
        let mut ctx = context(primary, settings);
        ctx.openocean = Some(Arc::new(StubSecondary { out: 2_000_000, min_out: 1_900_000 }));

        let summary = scan_pair(&ctx, &pair, None, true).await;
        assert_eq!(summary.candidates.len(), 1);
        let best = summary.best_candidate().unwrap();
        assert_eq!(best.kind(), "triangular");
        // conservative: 980_000 - 1_000_000 - fee < 0
        assert!(!best.core().decision.profitable);
    }

    #[tokio::test]
    async fn max_notional_excludes_strictly_greater_sizes() {
        let mut pair = sol_usdc_pair();
        pair.amount_a_steps = Some(vec![
            "1000000".to_string(),
            "2000000".to_string(),
            "2000001".to_string(),
        ]);
        pair.max_notional_a = Some("2000000".to_string());
        let amounts = build_amount_list(&pair, None);
        assert_eq!(amounts, vec!["1000000".to_string(), "2000000".to_string()]);
    }

    #[tokio::test]
    async fn best_candidate_is_argmax_with_first_seen_tie_break() {
        let mut pair = sol_usdc_pair();
        pair.amount_a_steps = Some(vec!["1000000".to_string(), "2000000".to_string()]);
        let primary = StubPrimary::new()
            .quote(SOL, 1_000_000, 110_000, 109_000)
            .quote(USDC, 109_000, 1_030_000, 1_020_000)
            .quote(SOL, 2_000_000, 220_000, 218_000)
            .quote(USDC, 218_000, 2_030_000, 2_015_000);
        let ctx = context(primary, Settings::test_default());

        let summary = scan_pair(&ctx, &pair, None, false).await;
        assert_eq!(summary.candidates.len(), 2);
        // 1_020_000 - 1_000_000 - 5_000 = 15_000 vs 2_015_000 - 2_000_000 - 5_000 = 10_000
        assert_eq!(summary.best, Some(0));
        assert!(summary.best_candidate().unwrap().core().decision.profitable);
    }

    #[tokio::test]
    async fn secondary_runs_between_the_gates() {
        let mut settings = Settings::test_default();
        settings.openocean_enabled = true;
        settings.execution_strategy = ExecutionStrategy::Sequential;
        settings.openocean_jupiter_gate_bps = 0;
        settings.openocean_jupiter_near_gate_bps = 0;
        settings.mode = Mode::DryRun;

        // Primary: conservative profit 15_000 - 10_000 fee (sequential txCount=2)
        let primary = StubPrimary::new()
            .quote(SOL, 1_000_000, 110_000, 109_000)
            .quote(USDC, 109_000, 1_030_000, 1_025_000);
        let mut ctx = context(primary, settings);
        ctx.openocean = Some(Arc::new(StubSecondary { out: 1_060_000, min_out: 1_050_000 }));

        let pair = sol_usdc_pair();
        let summary = scan_pair(&ctx, &pair, None, true).await;
        assert_eq!(summary.candidates.len(), 2);
        let best = summary.best_candidate().unwrap();
        assert_eq!(best.kind(), "loop-secondary");
        // openocean fee: 5000*2*3 = 30_000 -> conservative 1_050_000-1_000_000-30_000
        assert_eq!(best.core().decision.conservative_profit, 20_000);
    }

    #[tokio::test]
    async fn secondary_skipped_below_gate() {
        let mut settings = Settings::test_default();
        settings.openocean_enabled = true;
        settings.execution_strategy = ExecutionStrategy::Sequential;
        settings.openocean_jupiter_gate_bps = 100;

        let primary = StubPrimary::new()
            .quote(SOL, 1_000_000, 99_500, 99_000)
            .quote(USDC, 99_000, 999_500, 995_000);
        let mut ctx = context(primary, settings);
        ctx.openocean = Some(Arc::new(StubSecondary { out: 1_040_000, min_out: 1_035_000 }));

        let pair = sol_usdc_pair();
        let summary = scan_pair(&ctx, &pair, None, true).await;
        assert_eq!(summary.candidates.len(), 1);
        assert_eq!(summary.best_candidate().unwrap().kind(), "loop");
    }

    #[tokio::test]
    async fn secondary_skipped_above_near_gate() {
        let mut settings = Settings::test_default();
        settings.openocean_enabled = true;
        settings.execution_strategy = ExecutionStrategy::Sequential;
        settings.openocean_jupiter_gate_bps = 0;
        settings.openocean_jupiter_near_gate_bps = 10;

        // conservative profit 95_000 on 1_000_000 = 950 bps, way past gate+near
        let primary = StubPrimary::new()
            .quote(SOL, 1_000_000, 120_000, 119_000)
            .quote(USDC, 119_000, 1_110_000, 1_105_000);
        let mut ctx = context(primary, settings);
        ctx.openocean = Some(Arc::new(StubSecondary { out: 1_040_000, min_out: 1_035_000 }));

        let pair = sol_usdc_pair();
        let summary = scan_pair(&ctx, &pair, None, true).await;
        assert_eq!(summary.candidates.len(), 1);
    }

    #[tokio::test]
    async fn secondary_quote_429_trips_only_the_openocean_breaker() {
        let mut settings = Settings::test_default();
        settings.openocean_enabled = true;
        settings.execution_strategy = ExecutionStrategy::Sequential;
        settings.openocean_jupiter_gate_bps = -10_000;

        let primary = StubPrimary::new()
            .quote(SOL, 1_000_000, 110_000, 109_000)
            .quote(USDC, 109_000, 1_030_000, 1_025_000);
        let mut ctx = context(primary, settings);
        ctx.openocean = Some(Arc::new(RateLimitedSecondary));

        let pair = sol_usdc_pair();
        let summary = scan_pair(&ctx, &pair, None, true).await;

        // The primary candidate survives; the 429 is charged to openocean.
        assert_eq!(summary.candidates.len(), 1);
        assert_eq!(summary.error_count, 1);
        assert!(ctx.breakers.is_open(PROVIDER_OPENOCEAN, "SOL/USDC"));
        assert!(!ctx.breakers.is_open(PROVIDER_JUPITER, "SOL/USDC"));
    }

    /// Reference quoter that serves the first lamport->A conversion and 429s
    /// the next, so the secondary leg's fee conversion fails at jupiter.
    struct SecondConversionFailsPrimary {
        reference_calls: AtomicU32,
    }

    #[async_trait]
    impl PrimaryQuoter for SecondConversionFailsPrimary {
        async fn quote_exact_in(&self, request: &QuoteRequest) -> Result<JupiterQuote, ArbError> {
            let quote = |out: u128, min_out: u128| JupiterQuote {
                input_mint: request.input_mint.clone(),
                output_mint: request.output_mint.clone(),
                in_amount: request.amount,
                out_amount: out,
                other_amount_threshold: min_out,
                slippage_bps: request.slippage_bps,
                response: j!({}),
            };
            match (request.input_mint.as_str(), request.amount) {
                (USDC, 1_000_000) => Ok(quote(6_700, 6_600)),
                (SOL, 6_600) => Ok(quote(1_020_000, 1_010_000)),
                (SOL, 1_000_000_000) => {
                    if self.reference_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Ok(quote(150_000_000, 149_000_000))
                    } else {
                        Err(ArbError::HttpStatus { status: 429, body: "Too Many Requests".into() })
                    }
                }
                other => Err(ArbError::AggregatorError(format!("no stub for {other:?}"))),
            }
        }
    }

    #[tokio::test]
    async fn fee_conversion_429_during_secondary_is_charged_to_jupiter() {
        let mut settings = Settings::test_default();
        settings.openocean_enabled = true;
        settings.execution_strategy = ExecutionStrategy::Sequential;
        settings.openocean_jupiter_gate_bps = -10_000;

        let jupiter: Arc<dyn PrimaryQuoter> = Arc::new(SecondConversionFailsPrimary {
            reference_calls: AtomicU32::new(0),
        });
        let ctx = ScanContext {
            settings: Arc::new(settings),
            jupiter: jupiter.clone(),
            ultra: None,
            openocean: Some(Arc::new(StubSecondary { out: 1_060_000, min_out: 1_050_000 })),
            breakers: Arc::new(PairBreakers::new()),
            fee_converter: Arc::new(FeeConverter::new(jupiter)),
            decider: Arc::new(LocalDecider),
            events: Arc::new(EventLog::stdout(true)),
            wallet: Pubkey::new_unique(),
        };

        // Non-native input so every decision needs the reference conversion.
        let pair: PairConfig = serde_json::from_value(j!({
            "name": "USDC/SOL",
            "aMint": USDC,
            "bMint": SOL,
            "slippageBps": 50,
            "amountA": "1000000",
            "minProfitA": "0",
            "cooldownMs": 1000
        }))
        .unwrap();

        let summary = scan_pair(&ctx, &pair, None, true).await;

        // The loop candidate priced fine; the secondary's fee conversion hit
        // a jupiter 429, so only the jupiter breaker opens.
        assert_eq!(summary.candidates.len(), 1);
        assert_eq!(summary.candidates[0].kind(), "loop");
        assert_eq!(summary.error_count, 1);
        assert!(ctx.breakers.is_open(PROVIDER_JUPITER, "USDC/SOL"));
        assert!(!ctx.breakers.is_open(PROVIDER_OPENOCEAN, "USDC/SOL"));
    }
}
