use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use serde::Deserialize;
use url::Url;

use crate::aggregator::{parse_amount, read_json, OpenOceanQuote, SecondaryQuoter};
use crate::error::ArbError;
use crate::rate::{with_retry, AdaptiveRateLimiter, RetryPolicy};

pub const DEFAULT_BASE_URL: &str = "https://open-api.openocean.finance/v4/solana";

/// OpenOcean meta-aggregator client for the second-opinion path: exact-in
/// quote and a swap endpoint returning a ready-to-sign transaction.
pub struct OpenOceanClient {
    http: reqwest::Client,
    base_url: String,
    limiter: Arc<AdaptiveRateLimiter>,
    retry: RetryPolicy,
    referrer: Option<String>,
    referrer_fee: Option<f64>,
    enabled_dex_ids: Option<String>,
    disabled_dex_ids: Option<String>,
}

/// The swap payload plus its blockhash horizon.
#[derive(Debug, Clone)]
pub struct OpenOceanSwap {
    pub transaction: Vec<u8>,
    pub last_valid_block_height: Option<u64>,
}

impl OpenOceanClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        base_url: &str,
        timeout: Duration,
        limiter: Arc<AdaptiveRateLimiter>,
        retry: RetryPolicy,
        referrer: Option<String>,
        referrer_fee: Option<f64>,
        enabled_dex_ids: Option<String>,
        disabled_dex_ids: Option<String>,
    ) -> Result<Self, ArbError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ArbError::ConfigError(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: sanitize_base_url(base_url),
            limiter,
            retry,
            referrer,
            referrer_fee,
            enabled_dex_ids,
            disabled_dex_ids,
        })
    }

    fn venue_filters(&self, query: &mut Vec<(&'static str, String)>) {
        if let Some(ids) = &self.enabled_dex_ids {
            query.push(("enabledDexIds", ids.clone()));
        }
        if let Some(ids) = &self.disabled_dex_ids {
            query.push(("disabledDexIds", ids.clone()));
        }
    }

    /// Request a swap transaction for `account`. The returned payload may be
    /// base64 or hex encoded depending on the gateway version.
    pub async fn swap(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u128,
        slippage_bps: u16,
        account: &str,
    ) -> Result<OpenOceanSwap, ArbError> {
        let url = format!("{}/swap", self.base_url);
        let mut query: Vec<(&'static str, String)> = vec![
            ("inTokenAddress", input_mint.to_string()),
            ("outTokenAddress", output_mint.to_string()),
            ("amountDecimals", amount.to_string()),
            ("slippage", format!("{}", slippage_bps as f64 / 100.0)),
            ("account", account.to_string()),
        ];
        if let Some(referrer) = &self.referrer {
            query.push(("referrer", referrer.clone()));
            if let Some(fee) = self.referrer_fee {
                query.push(("referrerFee", fee.to_string()));
            }
        }
        self.venue_filters(&mut query);

        let envelope: Envelope<SwapData> = with_retry(&self.limiter, &self.retry, || {
            let req = self.http.get(&url).query(&query);
            async move { read_json(req.send().await?).await }
        })
        .await?;
        let data = envelope.into_data()?;
        let payload = data
            .transaction
            .ok_or_else(|| ArbError::AggregatorError("openocean swap missing transaction".into()))?;
        Ok(OpenOceanSwap {
            transaction: decode_tx_payload(&payload)?,
            last_valid_block_height: data.last_valid_block_height,
        })
    }
}

#[async_trait]
impl SecondaryQuoter for OpenOceanClient {
    async fn quote_exact_in(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u128,
        slippage_bps: u16,
    ) -> Result<OpenOceanQuote, ArbError> {
        let url = format!("{}/quote", self.base_url);
        let mut query: Vec<(&'static str, String)> = vec![
            ("inTokenAddress", input_mint.to_string()),
            ("outTokenAddress", output_mint.to_string()),
            ("amountDecimals", amount.to_string()),
            ("slippage", format!("{}", slippage_bps as f64 / 100.0)),
        ];
        self.venue_filters(&mut query);

        let envelope: Envelope<QuoteData> = with_retry(&self.limiter, &self.retry, || {
            let req = self.http.get(&url).query(&query);
            async move { read_json(req.send().await?).await }
        })
        .await?;
        let data = envelope.into_data()?;

        let out_amount = parse_amount(&data.out_amount, "outAmount")?;
        let min_out_amount = match &data.min_out_amount {
            Some(raw) => parse_amount(raw, "minOutAmount")?,
            // The gateway omits the floor on some routes; derive it.
            None => out_amount * (10_000 - slippage_bps as u128) / 10_000,
        };
        Ok(OpenOceanQuote {
            input_mint: input_mint.to_string(),
            output_mint: output_mint.to_string(),
            in_amount: amount,
            out_amount,
            min_out_amount,
            slippage_bps,
            dex_id: data.dex_id,
        })
    }
}

/// Accept sloppy configured URLs: missing scheme, trailing slashes, stray
/// query/fragment. Anything unparseable falls back to the public endpoint.
fn sanitize_base_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return DEFAULT_BASE_URL.to_string();
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    match Url::parse(&candidate) {
        Ok(mut parsed) if parsed.host_str().is_some() => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            parsed.as_str().trim_end_matches('/').to_string()
        }
        _ => {
            warn!("invalid OPENOCEAN_BASE_URL '{raw}', using default");
            DEFAULT_BASE_URL.to_string()
        }
    }
}

/// Hex (optionally 0x-prefixed) or base64. Hex is checked first: a hex
/// string is also a valid base64 charset, so the order matters.
fn decode_tx_payload(payload: &str) -> Result<Vec<u8>, ArbError> {
    use base64::{engine::general_purpose, Engine as _};
    let hex = payload.strip_prefix("0x").unwrap_or(payload);
    let looks_hex = !hex.is_empty()
        && hex.len() % 2 == 0
        && hex.bytes().all(|b| b.is_ascii_hexdigit());
    if looks_hex {
        let decoded: Result<Vec<u8>, _> = (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
            .collect();
        if let Ok(bytes) = decoded {
            return Ok(bytes);
        }
    }
    general_purpose::STANDARD.decode(payload).map_err(|_| {
        ArbError::AggregatorError("swap payload is neither base64 nor hex".to_string())
    })
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    error: Option<String>,
    data: Option<T>,
}

impl<T> Envelope<T> {
    fn into_data(self) -> Result<T, ArbError> {
        if let Some(code) = self.code {
            if code != 200 {
                return Err(ArbError::AggregatorError(format!(
                    "openocean code {code}: {}",
                    self.error.unwrap_or_default()
                )));
            }
        }
        self.data
            .ok_or_else(|| ArbError::AggregatorError("openocean response missing data".into()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteData {
    out_amount: String,
    #[serde(default)]
    min_out_amount: Option<String>,
    #[serde(default, alias = "dexIndex")]
    dex_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwapData {
    #[serde(default, alias = "data")]
    transaction: Option<String>,
    #[serde(default)]
    last_valid_block_height: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_configured_urls() {
        assert_eq!(
            sanitize_base_url("open-api.openocean.finance/v4/solana"),
            DEFAULT_BASE_URL
        );
        assert_eq!(
            sanitize_base_url("https://open-api.openocean.finance/v4/solana///"),
            DEFAULT_BASE_URL
        );
        assert_eq!(
            sanitize_base_url("https://example.com/oo?x=1#frag"),
            "https://example.com/oo"
        );
        assert_eq!(sanitize_base_url("   "), DEFAULT_BASE_URL);
        assert_eq!(sanitize_base_url("http://"), DEFAULT_BASE_URL);
    }

    #[test]
    fn decodes_base64_and_hex_payloads() {
        use base64::{engine::general_purpose, Engine as _};
        let bytes = vec![1u8, 2, 3, 255];
        let b64 = general_purpose::STANDARD.encode(&bytes);
        assert_eq!(decode_tx_payload(&b64).unwrap(), bytes);
        assert_eq!(decode_tx_payload("0x010203ff").unwrap(), bytes);
        assert_eq!(decode_tx_payload("010203ff").unwrap(), bytes);
        assert!(decode_tx_payload("zz-not-a-payload").is_err());
    }

    #[test]
    fn envelope_rejects_error_codes() {
        let env: Envelope<QuoteData> = serde_json::from_str(
            r#"{"code": 429, "error": "too many requests"}"#,
        )
        .unwrap();
        let err = env.into_data().unwrap_err();
        assert!(err.to_string().contains("429"));
        assert!(err.is_rate_limit());
    }

    #[test]
    fn derives_min_out_when_absent() {
        let data = QuoteData {
            out_amount: "1000000".to_string(),
            min_out_amount: None,
            dex_id: None,
        };
        let out: u128 = data.out_amount.parse().unwrap();
        let min = out * (10_000 - 50u128) / 10_000;
        assert_eq!(min, 995_000);
    }
}
