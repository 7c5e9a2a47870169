use std::sync::Arc;
use std::time::Duration;

use crate::aggregator::cache::{fee_conversion_ttl, CoalescingCache, FeeConversionKey};
use crate::aggregator::{PrimaryQuoter, QuoteRequest};
use crate::config::{PairConfig, Settings, TipMode};
use crate::error::ArbError;

pub const NATIVE_MINT: &str = "So11111111111111111111111111111111111111112";
pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

pub fn is_native_mint(mint: &str) -> bool {
    mint == NATIVE_MINT
}

/// Per-candidate fee knobs after per-pair overrides are applied.
#[derive(Debug, Clone, Copy)]
pub struct FeeParams {
    pub base_fee_lamports: u64,
    pub rent_buffer_lamports: u64,
    pub cu_limit: u32,
    pub cu_price_micro_lamports: u64,
}

impl FeeParams {
    pub fn resolve(settings: &Settings, pair: &PairConfig) -> Self {
        Self {
            base_fee_lamports: pair.base_fee_lamports.unwrap_or(settings.base_fee_lamports),
            rent_buffer_lamports: pair
                .rent_buffer_lamports
                .unwrap_or(settings.rent_buffer_lamports),
            cu_limit: pair.cu_limit.unwrap_or(settings.cu_limit),
            cu_price_micro_lamports: pair
                .cu_price_micro_lamports
                .unwrap_or(settings.cu_price_micro_lamports),
        }
    }

    pub fn priority_lamports(&self) -> u64 {
        (self.cu_limit as u64).saturating_mul(self.cu_price_micro_lamports) / 1_000_000
    }
}

/// Total lamport cost of the round trip:
/// signatures + rent buffer + priority fee, each per transaction, plus tip.
pub fn estimate_fee_lamports(
    params: &FeeParams,
    tx_count: u64,
    sigs_per_tx: u64,
    tip_lamports: u64,
) -> u64 {
    params.base_fee_lamports * tx_count * sigs_per_tx
        + params.rent_buffer_lamports * tx_count
        + params.priority_lamports() * tx_count
        + tip_lamports
}

#[derive(Debug, Clone, Copy)]
pub struct TipParams {
    pub mode: TipMode,
    pub fixed_lamports: u64,
    pub bps: u64,
    pub min_lamports: u64,
    pub max_lamports: u64,
}

impl TipParams {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            mode: settings.jito_tip_mode,
            fixed_lamports: settings.jito_tip_lamports,
            bps: settings.jito_tip_bps,
            min_lamports: settings.jito_min_tip_lamports,
            max_lamports: settings.jito_max_tip_lamports,
        }
    }
}

/// Tip for one candidate. Dynamic tips are a share of the conservative gross
/// and only make sense when the input token *is* lamports; otherwise the
/// fixed tip applies.
pub fn compute_tip(
    params: &TipParams,
    a_is_native: bool,
    amount_in: u128,
    final_min_out: u128,
) -> u64 {
    match params.mode {
        TipMode::Dynamic if a_is_native => {
            let gross = final_min_out.saturating_sub(amount_in);
            if gross == 0 {
                return 0;
            }
            let raw = gross.saturating_mul(params.bps as u128) / 10_000;
            if raw == 0 {
                return 0;
            }
            let raw = u64::try_from(raw).unwrap_or(u64::MAX);
            raw.clamp(params.min_lamports, params.max_lamports)
        }
        _ => params.fixed_lamports,
    }
}

/// Profit floor in A units: the larger of the absolute floor and the
/// bps-of-notional floor.
pub fn min_profit_in_a(min_profit_a: u128, min_profit_bps: Option<u32>, amount_a: u128) -> u128 {
    match min_profit_bps {
        Some(bps) if amount_a > 0 => {
            min_profit_a.max(amount_a.saturating_mul(bps as u128) / 10_000)
        }
        _ => min_profit_a,
    }
}

/// `ceil(fee_lamports * out_per_sol / 1e9)` where `out_per_sol` is the
/// optimistic A-amount one SOL buys. Optimistic on purpose: it overstates
/// the fee in A, keeping the profitability check conservative.
pub fn fee_lamports_to_input_units(fee_lamports: u64, out_per_sol: u128) -> u128 {
    let numerator = (fee_lamports as u128).saturating_mul(out_per_sol);
    numerator.div_ceil(LAMPORTS_PER_SOL as u128)
}

/// Converts lamport fees into input-token units via a cached reference quote
/// of one SOL -> A on the primary aggregator.
pub struct FeeConverter {
    quoter: Arc<dyn PrimaryQuoter>,
    cache: CoalescingCache<FeeConversionKey, u128>,
}

impl FeeConverter {
    pub fn new(quoter: Arc<dyn PrimaryQuoter>) -> Self {
        Self {
            quoter,
            cache: CoalescingCache::new(),
        }
    }

    pub async fn fee_in_a(
        &self,
        pair: &PairConfig,
        fee_lamports: u64,
        provider: &'static str,
    ) -> Result<u128, ArbError> {
        if is_native_mint(&pair.a_mint) {
            return Ok(fee_lamports as u128);
        }
        let slippage_bps = pair.fee_conversion_slippage();
        let key = FeeConversionKey {
            pair_name: pair.name.clone(),
            a_mint: pair.a_mint.clone(),
            slippage_bps,
            provider,
        };
        let ttl = fee_conversion_ttl(Duration::from_millis(pair.cooldown_ms));
        let quoter = self.quoter.clone();
        let a_mint = pair.a_mint.clone();
        let out_per_sol = self
            .cache
            .get_or_fetch(key, ttl, move || async move {
                let request = QuoteRequest {
                    input_mint: NATIVE_MINT.to_string(),
                    output_mint: a_mint,
                    amount: LAMPORTS_PER_SOL as u128,
                    slippage_bps,
                    include_dexes: None,
                    exclude_dexes: None,
                };
                // Optimistic out amount, not the slippage floor: a high
                // out-per-sol means a high fee in A.
                Ok(quoter.quote_exact_in(&request).await?.out_amount)
            })
            .await?;
        Ok(fee_lamports_to_input_units(fee_lamports, out_per_sol))
    }
}
