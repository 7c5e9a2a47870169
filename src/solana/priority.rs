use std::sync::Arc;
use std::time::Duration;

use log::warn;
use serde_json::{json, Value};

use crate::config::{PriorityFeeStrategy, Settings};
use crate::error::ArbError;
use crate::solana::rpc::SolanaRpcClient;

/// Compute-unit price estimator. Failures never block an execution: the
/// configured default price is used instead.
pub struct PriorityFeeEstimator {
    strategy: PriorityFeeStrategy,
    level: String,
    default_cu_price: u64,
    rpc: Arc<SolanaRpcClient>,
    http: reqwest::Client,
    helius_url: Option<String>,
}

impl PriorityFeeEstimator {
    pub fn new(settings: &Settings, rpc: Arc<SolanaRpcClient>) -> Self {
        Self {
            strategy: settings.priority_fee_strategy,
            level: settings.priority_fee_level.clone(),
            default_cu_price: settings.cu_price_micro_lamports,
            rpc,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("default http client"),
            helius_url: settings.helius_api_url.clone(),
        }
    }

    pub async fn cu_price_micro_lamports(&self) -> u64 {
        let estimated = match self.strategy {
            PriorityFeeStrategy::Off => return self.default_cu_price,
            PriorityFeeStrategy::RpcRecent => self.from_rpc_recent().await,
            PriorityFeeStrategy::Helius => self.from_helius().await,
        };
        match estimated {
            Ok(price) => price,
            Err(e) => {
                warn!("priority fee estimate failed ({e}), using default");
                self.default_cu_price
            }
        }
    }

    async fn from_rpc_recent(&self) -> Result<u64, ArbError> {
        let fees = self.rpc.recent_prioritization_fees().await?;
        if fees.is_empty() {
            return Ok(self.default_cu_price);
        }
        Ok(percentile(&fees, level_percentile(&self.level)))
    }

    async fn from_helius(&self) -> Result<u64, ArbError> {
        let url = self
            .helius_url
            .as_ref()
            .ok_or_else(|| ArbError::ConfigError("HELIUS_API_URL not set".to_string()))?;
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getPriorityFeeEstimate",
            "params": [{"options": {"priorityLevel": helius_level(&self.level)}}],
        });
        let response: Value = self.http.post(url).json(&body).send().await?.json().await?;
        response["result"]["priorityFeeEstimate"]
            .as_f64()
            .map(|estimate| estimate.max(0.0) as u64)
            .ok_or_else(|| {
                ArbError::AggregatorError(format!("unexpected helius response: {response}"))
            })
    }
}

fn level_percentile(level: &str) -> f64 {
    match level {
        "min" => 0.0,
        "low" => 0.25,
        "medium" => 0.50,
        "high" => 0.75,
        "veryHigh" | "very-high" => 0.95,
        "unsafeMax" | "unsafe-max" => 1.0,
        _ => 0.50,
    }
}

fn helius_level(level: &str) -> &'static str {
    match level {
        "min" => "Min",
        "low" => "Low",
        "high" => "High",
        "veryHigh" | "very-high" => "VeryHigh",
        "unsafeMax" | "unsafe-max" => "UnsafeMax",
        _ => "Medium",
    }
}

fn percentile(values: &[u64], p: f64) -> u64 {
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let idx = ((sorted.len() - 1) as f64 * p.clamp(0.0, 1.0)).round() as usize;
    sorted[idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_picks_by_level() {
        let fees = vec![100, 0, 50, 200, 1_000];
        assert_eq!(percentile(&fees, 0.0), 0);
        assert_eq!(percentile(&fees, 0.5), 100);
        assert_eq!(percentile(&fees, 1.0), 1_000);
    }

    #[test]
    fn level_mapping_defaults_to_median() {
        assert_eq!(level_percentile("medium"), 0.5);
        assert_eq!(level_percentile("bogus"), 0.5);
        assert_eq!(level_percentile("veryHigh"), 0.95);
        assert_eq!(helius_level("bogus"), "Medium");
        assert_eq!(helius_level("unsafeMax"), "UnsafeMax");
    }
}
