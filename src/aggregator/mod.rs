pub mod cache;
pub mod jupiter;
pub mod lut;
pub mod openocean;
pub mod ultra;

use async_trait::async_trait;
use serde::Deserialize;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use std::str::FromStr;

use crate::error::ArbError;

pub use jupiter::JupiterQuoteClient;
pub use openocean::OpenOceanClient;
pub use ultra::UltraClient;

/// Parameters for an exact-in quote on either aggregator.
#[derive(Debug, Clone)]
pub struct QuoteRequest {
    pub input_mint: String,
    pub output_mint: String,
    pub amount: u128,
    pub slippage_bps: u16,
    pub include_dexes: Option<Vec<String>>,
    pub exclude_dexes: Option<Vec<String>>,
}

/// A structured Jupiter quote. `response` carries the raw quote body, which
/// the swap/swap-instructions endpoints require verbatim.
#[derive(Debug, Clone)]
pub struct JupiterQuote {
    pub input_mint: String,
    pub output_mint: String,
    pub in_amount: u128,
    pub out_amount: u128,
    pub other_amount_threshold: u128,
    pub slippage_bps: u16,
    pub response: serde_json::Value,
}

/// An OpenOcean quote; carries the routed venue id when the API reports one.
#[derive(Debug, Clone)]
pub struct OpenOceanQuote {
    pub input_mint: String,
    pub output_mint: String,
    pub in_amount: u128,
    pub out_amount: u128,
    pub min_out_amount: u128,
    pub slippage_bps: u16,
    pub dex_id: Option<String>,
}

/// An Ultra order: a quote plus the pre-built unsigned transaction.
#[derive(Debug, Clone)]
pub struct UltraOrder {
    pub input_mint: String,
    pub output_mint: String,
    pub in_amount: u128,
    pub out_amount: u128,
    pub other_amount_threshold: u128,
    pub slippage_bps: u16,
    pub transaction_base64: Option<String>,
    pub request_id: String,
}

/// Instruction groups returned by the swap-instructions endpoint, decoded
/// into sdk instructions. This is what the atomic builder merges.
#[derive(Debug, Clone)]
pub struct SwapInstructionSet {
    pub compute_budget: Vec<Instruction>,
    pub setup: Vec<Instruction>,
    pub other: Vec<Instruction>,
    pub swap: Instruction,
    pub cleanup: Vec<Instruction>,
    pub lookup_table_addresses: Vec<Pubkey>,
}

/// A pre-built swap transaction plus its blockhash horizon.
#[derive(Debug, Clone)]
pub struct BuiltSwapTransaction {
    pub transaction_base64: String,
    pub last_valid_block_height: Option<u64>,
}

#[async_trait]
pub trait PrimaryQuoter: Send + Sync {
    async fn quote_exact_in(&self, request: &QuoteRequest) -> Result<JupiterQuote, ArbError>;
}

#[async_trait]
pub trait SecondaryQuoter: Send + Sync {
    async fn quote_exact_in(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u128,
        slippage_bps: u16,
    ) -> Result<OpenOceanQuote, ArbError>;
}

/// Ensure a scheme is present; hosts without one get https.
pub(crate) fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

/// Wire shape of an instruction in aggregator responses.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InstructionJson {
    pub program_id: String,
    pub accounts: Vec<AccountMetaJson>,
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AccountMetaJson {
    pub pubkey: String,
    pub is_signer: bool,
    pub is_writable: bool,
}

impl InstructionJson {
    pub fn decode(&self) -> Result<Instruction, ArbError> {
        use base64::{engine::general_purpose, Engine as _};
        let program_id = Pubkey::from_str(&self.program_id)
            .map_err(|e| ArbError::AggregatorError(format!("bad programId: {e}")))?;
        let data = general_purpose::STANDARD
            .decode(&self.data)
            .map_err(|e| ArbError::AggregatorError(format!("bad instruction data: {e}")))?;
        let accounts = self
            .accounts
            .iter()
            .map(|a| {
                let pubkey = Pubkey::from_str(&a.pubkey)
                    .map_err(|e| ArbError::AggregatorError(format!("bad account key: {e}")))?;
                Ok(if a.is_writable {
                    AccountMeta::new(pubkey, a.is_signer)
                } else {
                    AccountMeta::new_readonly(pubkey, a.is_signer)
                })
            })
            .collect::<Result<Vec<_>, ArbError>>()?;
        Ok(Instruction { program_id, accounts, data })
    }
}

/// Read a JSON body, folding non-2xx statuses into `ArbError::HttpStatus` so
/// the retry classifier can see the code.
pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ArbError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let body = body.chars().take(300).collect::<String>();
        return Err(ArbError::HttpStatus { status: status.as_u16(), body });
    }
    Ok(response.json::<T>().await?)
}

pub(crate) fn parse_amount(raw: &str, field: &str) -> Result<u128, ArbError> {
    raw.parse::<u128>()
        .map_err(|_| ArbError::AggregatorError(format!("non-numeric {field}: '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_normalization() {
        assert_eq!(normalize_base_url("lite-api.jup.ag/swap/v1"), "https://lite-api.jup.ag/swap/v1");
        assert_eq!(normalize_base_url("https://api.jup.ag/"), "https://api.jup.ag");
        assert_eq!(normalize_base_url("http://localhost:8080//"), "http://localhost:8080");
    }

    #[test]
    fn instruction_json_decodes_account_flags() {
        use base64::{engine::general_purpose, Engine as _};
        let ix = InstructionJson {
            program_id: "ComputeBudget111111111111111111111111111111".to_string(),
            accounts: vec![
                AccountMetaJson {
                    pubkey: "So11111111111111111111111111111111111111112".to_string(),
                    is_signer: true,
                    is_writable: true,
                },
                AccountMetaJson {
                    pubkey: "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v".to_string(),
                    is_signer: false,
                    is_writable: false,
                },
            ],
            data: general_purpose::STANDARD.encode([2u8, 0, 1]),
        };
        let decoded = ix.decode().unwrap();
        assert_eq!(decoded.data, vec![2, 0, 1]);
        assert!(decoded.accounts[0].is_signer && decoded.accounts[0].is_writable);
        assert!(!decoded.accounts[1].is_signer && !decoded.accounts[1].is_writable);
    }

    #[test]
    fn amount_parsing_rejects_junk() {
        assert_eq!(parse_amount("1000", "outAmount").unwrap(), 1000);
        assert!(parse_amount("1e9", "outAmount").is_err());
        assert!(parse_amount("-5", "outAmount").is_err());
    }
}
