use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use solana_sdk::pubkey::Pubkey;

use crate::error::ArbError;

pub const MIN_SLIPPAGE_BPS: u16 = 1;
pub const MAX_SLIPPAGE_BPS: u16 = 5_000;

/// One configured arbitrage pair: loop A->B->A, or triangular A->B->C->A when
/// `c_mint` is present. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairConfig {
    pub name: String,
    pub a_mint: String,
    pub b_mint: String,
    #[serde(default)]
    pub c_mint: Option<String>,
    pub slippage_bps: u16,
    #[serde(default)]
    pub slippage_bps_leg1: Option<u16>,
    #[serde(default)]
    pub slippage_bps_leg2: Option<u16>,
    #[serde(default)]
    pub slippage_bps_leg3: Option<u16>,
    #[serde(default)]
    pub include_dexes: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_dexes: Option<Vec<String>>,
    /// Default input size, atomic units of A, decimal string.
    pub amount_a: String,
    #[serde(default)]
    pub amount_a_steps: Option<Vec<String>>,
    #[serde(default)]
    pub max_notional_a: Option<String>,
    /// Minimum absolute profit in atomic units of A.
    #[serde(default)]
    pub min_profit_a: String,
    #[serde(default)]
    pub min_profit_bps: Option<u32>,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default)]
    pub cu_limit: Option<u32>,
    #[serde(default)]
    pub cu_price_micro_lamports: Option<u64>,
    #[serde(default)]
    pub base_fee_lamports: Option<u64>,
    #[serde(default)]
    pub rent_buffer_lamports: Option<u64>,
}

fn default_cooldown_ms() -> u64 {
    0
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PairsFile {
    pub pairs: Vec<PairConfig>,
}

pub fn is_decimal_string(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn clamp_slippage(bps: u16) -> u16 {
    bps.clamp(MIN_SLIPPAGE_BPS, MAX_SLIPPAGE_BPS)
}

impl PairConfig {
    pub fn is_triangular(&self) -> bool {
        self.c_mint.is_some()
    }

    pub fn amount_a_u128(&self) -> u128 {
        self.amount_a.parse().unwrap_or(0)
    }

    pub fn min_profit_a_u128(&self) -> u128 {
        self.min_profit_a.parse().unwrap_or(0)
    }

    pub fn max_notional_a_u128(&self) -> Option<u128> {
        self.max_notional_a.as_deref().and_then(|s| s.parse().ok())
    }

    pub fn slippage_for_leg(&self, leg: u8) -> u16 {
        let chosen = match leg {
            1 => self.slippage_bps_leg1,
            2 => self.slippage_bps_leg2,
            3 => self.slippage_bps_leg3,
            _ => None,
        };
        clamp_slippage(chosen.unwrap_or(self.slippage_bps))
    }

    /// Slippage used to key the lamport->A conversion cache.
    pub fn fee_conversion_slippage(&self) -> u16 {
        clamp_slippage(self.slippage_bps)
    }

    /// All mints this pair touches, A first.
    pub fn mints(&self) -> Vec<&str> {
        let mut out = vec![self.a_mint.as_str(), self.b_mint.as_str()];
        if let Some(c) = &self.c_mint {
            out.push(c.as_str());
        }
        out
    }

    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("pair name must be non-empty".to_string());
        }
        for (label, mint) in [
            ("aMint", Some(self.a_mint.as_str())),
            ("bMint", Some(self.b_mint.as_str())),
            ("cMint", self.c_mint.as_deref()),
        ] {
            if let Some(mint) = mint {
                Pubkey::from_str(mint)
                    .map_err(|_| format!("pair '{}': {label} '{mint}' is not a valid pubkey", self.name))?;
            }
        }
        if !(MIN_SLIPPAGE_BPS..=MAX_SLIPPAGE_BPS).contains(&self.slippage_bps) {
            return Err(format!(
                "pair '{}': slippageBps {} outside {MIN_SLIPPAGE_BPS}..={MAX_SLIPPAGE_BPS}",
                self.name, self.slippage_bps
            ));
        }
        if let Some(bps) = self.min_profit_bps {
            if bps > 10_000 {
                return Err(format!(
                    "pair '{}': minProfitBps {} outside 0..=10000",
                    self.name, bps
                ));
            }
        }
        if !is_decimal_string(&self.amount_a) {
            return Err(format!(
                "pair '{}': amountA '{}' is not a decimal string",
                self.name, self.amount_a
            ));
        }
        if !self.min_profit_a.is_empty() && !is_decimal_string(&self.min_profit_a) {
            return Err(format!(
                "pair '{}': minProfitA '{}' is not a decimal string",
                self.name, self.min_profit_a
            ));
        }
        if let Some(steps) = &self.amount_a_steps {
            for step in steps {
                if !is_decimal_string(step) {
                    return Err(format!(
                        "pair '{}': amountASteps entry '{step}' is not a decimal string",
                        self.name
                    ));
                }
            }
        }
        if let Some(max) = &self.max_notional_a {
            if !is_decimal_string(max) {
                return Err(format!(
                    "pair '{}': maxNotionalA '{max}' is not a decimal string",
                    self.name
                ));
            }
        }
        Ok(())
    }
}

pub fn parse_pairs(json: &str) -> Result<Vec<PairConfig>, ArbError> {
    let file: PairsFile =
        serde_json::from_str(json).map_err(|e| ArbError::ConfigError(format!("pairs file: {e}")))?;
    if file.pairs.is_empty() {
        return Err(ArbError::ConfigError("pairs file has no pairs".to_string()));
    }
    let mut names = HashSet::new();
    for pair in &file.pairs {
        pair.validate().map_err(ArbError::ConfigError)?;
        if !names.insert(pair.name.clone()) {
            return Err(ArbError::ConfigError(format!(
                "duplicate pair name '{}'",
                pair.name
            )));
        }
    }
    Ok(file.pairs)
}

pub fn load_pairs(path: &Path) -> Result<Vec<PairConfig>, ArbError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        ArbError::ConfigError(format!("cannot read pairs file {}: {e}", path.display()))
    })?;
    parse_pairs(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOL: &str = "So11111111111111111111111111111111111111112";
    const USDC: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
    const MSOL: &str = "mSoLzYCxHdYgdzU16g5QSh3i5K3z3KZK7ytfqcJm7So";

    fn pair_json(extra: &str) -> String {
        format!(
            r#"{{"pairs":[{{"name":"SOL/USDC","aMint":"{SOL}","bMint":"{USDC}",
                "slippageBps":50,"amountA":"1000000","minProfitA":"0","cooldownMs":1000{extra}}}]}}"#
        )
    }

    #[test]
    fn loads_minimal_loop_pair() {
        let pairs = parse_pairs(&pair_json("")).unwrap();
        assert_eq!(pairs.len(), 1);
        assert!(!pairs[0].is_triangular());
        assert_eq!(pairs[0].amount_a_u128(), 1_000_000);
        assert_eq!(pairs[0].min_profit_a_u128(), 0);
    }

    #[test]
    fn triangular_pair_and_leg_slippage_overrides() {
        let json = pair_json(&format!(
            r#","cMint":"{MSOL}","slippageBpsLeg2":80,"slippageBpsLeg3":9000"#
        ));
        let pairs = parse_pairs(&json).unwrap();
        let p = &pairs[0];
        assert!(p.is_triangular());
        assert_eq!(p.slippage_for_leg(1), 50);
        assert_eq!(p.slippage_for_leg(2), 80);
        // clamped to the ceiling
        assert_eq!(p.slippage_for_leg(3), MAX_SLIPPAGE_BPS);
    }

    #[test]
    fn rejects_non_decimal_amount() {
        let json = pair_json("").replace("\"1000000\"", "\"1_000_000\"");
        assert!(parse_pairs(&json).is_err());
    }

    #[test]
    fn rejects_out_of_range_slippage() {
        let json = pair_json("").replace("\"slippageBps\":50", "\"slippageBps\":6000");
        assert!(parse_pairs(&json).is_err());
    }

    #[test]
    fn rejects_bad_mint() {
        let json = pair_json("").replace(USDC, "not-a-mint");
        assert!(parse_pairs(&json).is_err());
    }

    #[test]
    fn reserialization_round_trips() {
        let json = pair_json(&format!(r#","cMint":"{MSOL}","minProfitBps":25"#));
        let pairs = parse_pairs(&json).unwrap();
        let reser = serde_json::to_string(&PairsFile { pairs: pairs.clone() }).unwrap();
        let again = parse_pairs(&reser).unwrap();
        assert_eq!(again.len(), pairs.len());
        assert_eq!(again[0].name, pairs[0].name);
        assert_eq!(again[0].slippage_bps, pairs[0].slippage_bps);
        assert_eq!(again[0].min_profit_bps, pairs[0].min_profit_bps);
        assert_eq!(again[0].c_mint, pairs[0].c_mint);
    }
}
