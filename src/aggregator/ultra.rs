use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::aggregator::{normalize_base_url, parse_amount, read_json, UltraOrder};
use crate::error::ArbError;
use crate::rate::{with_retry, AdaptiveRateLimiter, RetryPolicy};

/// Jupiter Ultra client: order (quote + pre-built unsigned transaction) and
/// execute (submit the signed transaction through the aggregator).
pub struct UltraClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    limiter: Arc<AdaptiveRateLimiter>,
    retry: RetryPolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UltraExecuteResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub code: Option<i64>,
}

impl UltraClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
        limiter: Arc<AdaptiveRateLimiter>,
        retry: RetryPolicy,
    ) -> Result<Self, ArbError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ArbError::ConfigError(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: normalize_ultra_base_url(base_url),
            api_key,
            limiter,
            retry,
        })
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("x-api-key", key),
            None => builder,
        }
    }

    pub async fn order(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u128,
        taker: &str,
        exclude_dexes: Option<&[String]>,
    ) -> Result<UltraOrder, ArbError> {
        let url = format!("{}/v1/order", self.base_url);
        let mut query: Vec<(&str, String)> = vec![
            ("inputMint", input_mint.to_string()),
            ("outputMint", output_mint.to_string()),
            ("amount", amount.to_string()),
            ("taker", taker.to_string()),
        ];
        if let Some(dexes) = exclude_dexes {
            if !dexes.is_empty() {
                query.push(("excludeDexes", dexes.join(",")));
            }
        }
        let response: OrderResponse = with_retry(&self.limiter, &self.retry, || {
            let req = self.request(self.http.get(&url).query(&query));
            async move { read_json(req.send().await?).await }
        })
        .await?;
        parse_order(response)
    }

    /// Submit the signed order. Failures are reported in-band; see
    /// [`execute_failure`].
    pub async fn execute(
        &self,
        signed_transaction_base64: &str,
        request_id: &str,
    ) -> Result<UltraExecuteResponse, ArbError> {
        let url = format!("{}/v1/execute", self.base_url);
        let body = json!({
            "signedTransaction": signed_transaction_base64,
            "requestId": request_id,
        });
        with_retry(&self.limiter, &self.retry, || {
            let req = self.request(self.http.post(&url)).json(&body);
            async move { read_json(req.send().await?).await }
        })
        .await
    }
}

/// Accept the base URL with or without the trailing `/ultra` path.
fn normalize_ultra_base_url(raw: &str) -> String {
    let base = normalize_base_url(raw);
    if base.ends_with("/ultra") {
        base
    } else {
        format!("{base}/ultra")
    }
}

fn parse_order(response: OrderResponse) -> Result<UltraOrder, ArbError> {
    let request_id = response
        .request_id
        .ok_or_else(|| ArbError::AggregatorError("ultra order missing requestId".to_string()))?;
    Ok(UltraOrder {
        input_mint: response.input_mint,
        output_mint: response.output_mint,
        in_amount: parse_amount(&response.in_amount, "inAmount")?,
        out_amount: parse_amount(&response.out_amount, "outAmount")?,
        other_amount_threshold: parse_amount(
            &response.other_amount_threshold,
            "otherAmountThreshold",
        )?,
        slippage_bps: response.slippage_bps,
        transaction_base64: response.transaction,
        request_id,
    })
}

/// The execute response is non-uniform across failure shapes: a failure may
/// surface as a status string, a non-zero code, or an error field alone.
/// Returns the failure description when any of them indicates one.
pub fn execute_failure(response: &UltraExecuteResponse) -> Option<String> {
    if let Some(error) = &response.error {
        if !error.is_empty() {
            return Some(error.clone());
        }
    }
    if let Some(code) = response.code {
        if code != 0 {
            return Some(format!("code {code}"));
        }
    }
    if let Some(status) = &response.status {
        let lowered = status.to_lowercase();
        if ["fail", "error", "revert", "reject"]
            .iter()
            .any(|needle| lowered.contains(needle))
        {
            return Some(format!("status {status}"));
        }
    }
    None
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    input_mint: String,
    in_amount: String,
    output_mint: String,
    out_amount: String,
    other_amount_threshold: String,
    slippage_bps: u16,
    #[serde(default)]
    transaction: Option<String>,
    #[serde(default)]
    request_id: Option<String>,
}
