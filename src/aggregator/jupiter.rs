use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use serde_json::{json, Value};
use solana_sdk::pubkey::Pubkey;

use crate::aggregator::cache::{CoalescingCache, QuoteKey, QUOTE_CACHE_TTL};
use crate::aggregator::{
    normalize_base_url, parse_amount, read_json, BuiltSwapTransaction, InstructionJson,
    JupiterQuote, PrimaryQuoter, QuoteRequest, SwapInstructionSet,
};
use crate::error::ArbError;
use crate::rate::{with_retry, AdaptiveRateLimiter, RetryPolicy};

/// Hosted API domain that refuses anonymous traffic.
const KEYED_API_HOST: &str = "api.jup.ag";

/// Jupiter swap-API client (quote, swap, swap-instructions). Quotes are
/// cached for a short TTL with in-flight coalescing; every upstream call
/// consumes a limiter token and retries transient failures.
pub struct JupiterQuoteClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    limiter: Arc<AdaptiveRateLimiter>,
    retry: RetryPolicy,
    quote_cache: CoalescingCache<QuoteKey, JupiterQuote>,
}

impl JupiterQuoteClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
        limiter: Arc<AdaptiveRateLimiter>,
        retry: RetryPolicy,
    ) -> Result<Self, ArbError> {
        let base_url = normalize_base_url(base_url);
        require_key_for_hosted_api(&base_url, api_key.as_deref())?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ArbError::ConfigError(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url,
            api_key,
            limiter,
            retry,
            quote_cache: CoalescingCache::new(),
        })
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("x-api-key", key),
            None => builder,
        }
    }

    /// Build the swap transaction for a previously fetched quote.
    pub async fn build_swap_transaction(
        &self,
        quote: &JupiterQuote,
        user: &Pubkey,
        cu_price_micro_lamports: Option<u64>,
    ) -> Result<BuiltSwapTransaction, ArbError> {
        let body = swap_request_body(quote, user, cu_price_micro_lamports);
        let url = format!("{}/swap", self.base_url);
        let response: SwapResponse = with_retry(&self.limiter, &self.retry, || {
            let req = self.request(self.http.post(&url)).json(&body);
            async move { read_json(req.send().await?).await }
        })
        .await?;
        Ok(BuiltSwapTransaction {
            transaction_base64: response.swap_transaction,
            last_valid_block_height: response.last_valid_block_height,
        })
    }

    /// Fetch the leg's instruction groups for atomic assembly.
    pub async fn build_swap_instructions(
        &self,
        quote: &JupiterQuote,
        user: &Pubkey,
        cu_price_micro_lamports: Option<u64>,
    ) -> Result<SwapInstructionSet, ArbError> {
        let body = swap_request_body(quote, user, cu_price_micro_lamports);
        let url = format!("{}/swap-instructions", self.base_url);
        let response: SwapInstructionsResponse = with_retry(&self.limiter, &self.retry, || {
            let req = self.request(self.http.post(&url)).json(&body);
            async move { read_json(req.send().await?).await }
        })
        .await?;
        convert_swap_instructions(response)
    }
}

#[async_trait]
impl PrimaryQuoter for JupiterQuoteClient {
    async fn quote_exact_in(&self, request: &QuoteRequest) -> Result<JupiterQuote, ArbError> {
        let key = QuoteKey::new(request);
        let http = self.http.clone();
        let base_url = self.base_url.clone();
        let api_key = self.api_key.clone();
        let limiter = self.limiter.clone();
        let retry = self.retry.clone();
        let request = request.clone();
        self.quote_cache
            .get_or_fetch(key, QUOTE_CACHE_TTL, move || {
                fetch_quote(http, base_url, api_key, limiter, retry, request)
            })
            .await
    }
}

async fn fetch_quote(
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    limiter: Arc<AdaptiveRateLimiter>,
    retry: RetryPolicy,
    request: QuoteRequest,
) -> Result<JupiterQuote, ArbError> {
    let url = format!("{base_url}/quote");
    let mut query: Vec<(&str, String)> = vec![
        ("inputMint", request.input_mint.clone()),
        ("outputMint", request.output_mint.clone()),
        ("amount", request.amount.to_string()),
        ("slippageBps", request.slippage_bps.to_string()),
        ("swapMode", "ExactIn".to_string()),
    ];
    if let Some(dexes) = &request.include_dexes {
        if !dexes.is_empty() {
            query.push(("dexes", dexes.join(",")));
        }
    }
    if let Some(dexes) = &request.exclude_dexes {
        if !dexes.is_empty() {
            query.push(("excludeDexes", dexes.join(",")));
        }
    }

    let raw: Value = with_retry(&limiter, &retry, || {
        let mut req = http.get(&url).query(&query);
        if let Some(key) = &api_key {
            req = req.header("x-api-key", key);
        }
        async move { read_json(req.send().await?).await }
    })
    .await?;

    parse_quote(raw)
}

fn parse_quote(raw: Value) -> Result<JupiterQuote, ArbError> {
    let parsed: QuoteResponse = serde_json::from_value(raw.clone())?;
    debug!(
        "jupiter quote {} -> {}: out={} minOut={}",
        parsed.input_mint, parsed.output_mint, parsed.out_amount, parsed.other_amount_threshold
    );
    Ok(JupiterQuote {
        in_amount: parse_amount(&parsed.in_amount, "inAmount")?,
        out_amount: parse_amount(&parsed.out_amount, "outAmount")?,
        other_amount_threshold: parse_amount(
            &parsed.other_amount_threshold,
            "otherAmountThreshold",
        )?,
        input_mint: parsed.input_mint,
        output_mint: parsed.output_mint,
        slippage_bps: parsed.slippage_bps,
        response: raw,
    })
}

fn swap_request_body(quote: &JupiterQuote, user: &Pubkey, cu_price: Option<u64>) -> Value {
    let mut body = json!({
        "quoteResponse": quote.response,
        "userPublicKey": user.to_string(),
        "wrapAndUnwrapSol": true,
    });
    if let Some(price) = cu_price {
        if price > 0 {
            body["computeUnitPriceMicroLamports"] = json!(price);
        }
    }
    body
}

fn convert_swap_instructions(
    response: SwapInstructionsResponse,
) -> Result<SwapInstructionSet, ArbError> {
    let decode_all = |list: &[InstructionJson]| {
        list.iter().map(InstructionJson::decode).collect::<Result<Vec<_>, _>>()
    };
    let lookup_table_addresses = response
        .address_lookup_table_addresses
        .iter()
        .map(|s| {
            Pubkey::from_str(s)
                .map_err(|e| ArbError::AggregatorError(format!("bad lookup table address: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SwapInstructionSet {
        compute_budget: decode_all(&response.compute_budget_instructions)?,
        setup: decode_all(&response.setup_instructions)?,
        other: decode_all(&response.other_instructions)?,
        swap: response.swap_instruction.decode()?,
        cleanup: match &response.cleanup_instruction {
            Some(ix) => vec![ix.decode()?],
            None => Vec::new(),
        },
        lookup_table_addresses,
    })
}

fn require_key_for_hosted_api(base_url: &str, api_key: Option<&str>) -> Result<(), ArbError> {
    let host = url::Url::parse(base_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default();
    if host.eq_ignore_ascii_case(KEYED_API_HOST) && api_key.map_or(true, str::is_empty) {
        return Err(ArbError::ConfigError(format!(
            "{KEYED_API_HOST} requires JUPITER_API_KEY"
        )));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteResponse {
    input_mint: String,
    in_amount: String,
    output_mint: String,
    out_amount: String,
    other_amount_threshold: String,
    slippage_bps: u16,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwapResponse {
    swap_transaction: String,
    #[serde(default)]
    last_valid_block_height: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwapInstructionsResponse {
    #[serde(default)]
    compute_budget_instructions: Vec<InstructionJson>,
    #[serde(default)]
    setup_instructions: Vec<InstructionJson>,
    #[serde(default)]
    other_instructions: Vec<InstructionJson>,
    swap_instruction: InstructionJson,
    #[serde(default)]
    cleanup_instruction: Option<InstructionJson>,
    #[serde(default)]
    address_lookup_table_addresses: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosted_api_requires_key() {
        assert!(require_key_for_hosted_api("https://api.jup.ag", None).is_err());
        assert!(require_key_for_hosted_api("https://api.jup.ag", Some("")).is_err());
        assert!(require_key_for_hosted_api("https://api.jup.ag", Some("k")).is_ok());
        assert!(require_key_for_hosted_api("https://lite-api.jup.ag/swap/v1", None).is_ok());
    }

    #[test]
    fn parses_quote_and_keeps_raw_response() {
        let raw = json!({
            "inputMint": "So11111111111111111111111111111111111111112",
            "inAmount": "1000000",
            "outputMint": "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
            "outAmount": "99500",
            "otherAmountThreshold": "99000",
            "slippageBps": 50,
            "routePlan": [{"swapInfo": {"label": "Whirlpool"}}]
        });
        let quote = parse_quote(raw).unwrap();
        assert_eq!(quote.in_amount, 1_000_000);
        assert_eq!(quote.out_amount, 99_500);
        assert_eq!(quote.other_amount_threshold, 99_000);
        assert_eq!(quote.slippage_bps, 50);
        assert!(quote.response.get("routePlan").is_some());
    }

    #[test]
    fn swap_body_includes_cu_price_only_when_positive() {
        let quote = parse_quote(json!({
            "inputMint": "So11111111111111111111111111111111111111112",
            "inAmount": "1",
            "outputMint": "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
            "outAmount": "2",
            "otherAmountThreshold": "2",
            "slippageBps": 50
        }))
        .unwrap();
        let user = Pubkey::new_unique();
        assert!(swap_request_body(&quote, &user, None)
            .get("computeUnitPriceMicroLamports")
            .is_none());
        assert!(swap_request_body(&quote, &user, Some(0))
            .get("computeUnitPriceMicroLamports")
            .is_none());
        assert_eq!(
            swap_request_body(&quote, &user, Some(1_000))["computeUnitPriceMicroLamports"],
            json!(1_000)
        );
    }

    #[test]
    fn converts_instruction_groups() {
        use base64::{engine::general_purpose, Engine as _};
        let ix = |data: &[u8]| InstructionJson {
            program_id: Pubkey::new_unique().to_string(),
            accounts: vec![],
            data: general_purpose::STANDARD.encode(data),
        };
        let response = SwapInstructionsResponse {
            compute_budget_instructions: vec![ix(&[2]), ix(&[3])],
            setup_instructions: vec![ix(&[4])],
            other_instructions: vec![],
            swap_instruction: ix(&[9]),
            cleanup_instruction: Some(ix(&[5])),
            address_lookup_table_addresses: vec![Pubkey::new_unique().to_string()],
        };
        let set = convert_swap_instructions(response).unwrap();
        assert_eq!(set.compute_budget.len(), 2);
        assert_eq!(set.setup.len(), 1);
        assert_eq!(set.cleanup.len(), 1);
        assert_eq!(set.swap.data, vec![9]);
        assert_eq!(set.lookup_table_addresses.len(), 1);
    }
}
