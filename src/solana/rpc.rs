use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, warn};
use solana_client::nonblocking::rpc_client::RpcClient as NonBlockingRpcClient;
use solana_client::rpc_config::{RpcSendTransactionConfig, RpcSimulateTransactionConfig};
use solana_sdk::commitment_config::{CommitmentConfig, CommitmentLevel};
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::VersionedTransaction;
use tokio::time::sleep;

use crate::error::ArbError;

const CONFIRM_POLL_INTERVAL: Duration = Duration::from_millis(500);
const CONFIRM_HARD_CAP: Duration = Duration::from_secs(90);

/// Thin wrapper over the nonblocking RPC client: blockhash, cached balance,
/// simulation, send and confirm against a block-height horizon.
pub struct SolanaRpcClient {
    client: NonBlockingRpcClient,
    commitment: CommitmentConfig,
    balance_cache: Mutex<Option<(Instant, u64)>>,
    balance_ttl: Duration,
}

impl SolanaRpcClient {
    pub fn new(url: &str, commitment: CommitmentConfig, balance_ttl: Duration) -> Self {
        Self {
            client: NonBlockingRpcClient::new_with_commitment(url.to_string(), commitment),
            commitment,
            balance_cache: Mutex::new(None),
            balance_ttl,
        }
    }

    pub fn inner(&self) -> &NonBlockingRpcClient {
        &self.client
    }

    pub async fn latest_blockhash(&self) -> Result<(Hash, u64), ArbError> {
        let (hash, last_valid_block_height) = self
            .client
            .get_latest_blockhash_with_commitment(self.commitment)
            .await?;
        Ok((hash, last_valid_block_height))
    }

    /// Native balance with a small TTL cache; the executor polls this before
    /// every live execution.
    pub async fn balance_cached(&self, pubkey: &Pubkey) -> Result<u64, ArbError> {
        {
            let cache = self.balance_cache.lock().unwrap();
            if let Some((at, balance)) = *cache {
                if at.elapsed() < self.balance_ttl {
                    return Ok(balance);
                }
            }
        }
        let balance = self.client.get_balance(pubkey).await?;
        *self.balance_cache.lock().unwrap() = Some((Instant::now(), balance));
        Ok(balance)
    }

    pub async fn get_account_data(&self, pubkey: &Pubkey) -> Result<Option<Vec<u8>>, ArbError> {
        let response = self
            .client
            .get_account_with_commitment(pubkey, self.commitment)
            .await?;
        Ok(response.value.map(|account| account.data))
    }

    /// Simulate at "processed" and return the on-chain error, if any.
    pub async fn simulate(&self, tx: &VersionedTransaction) -> Result<Option<String>, ArbError> {
        let config = RpcSimulateTransactionConfig {
            sig_verify: true,
            commitment: Some(CommitmentConfig {
                commitment: CommitmentLevel::Processed,
            }),
            ..RpcSimulateTransactionConfig::default()
        };
        let result = self
            .client
            .simulate_transaction_with_config(tx, config)
            .await?;
        Ok(result.value.err.map(|e| format!("{e:?}")))
    }

    pub async fn send_transaction(&self, tx: &VersionedTransaction) -> Result<Signature, ArbError> {
        let config = RpcSendTransactionConfig {
            skip_preflight: true,
            max_retries: Some(2),
            ..RpcSendTransactionConfig::default()
        };
        let signature = self
            .client
            .send_transaction_with_config(tx, config)
            .await?;
        debug!("sent transaction {signature}");
        Ok(signature)
    }

    /// Wait for the signature to reach the configured commitment, bounded by
    /// `last_valid_block_height` (and a hard wall-clock cap as a backstop).
    pub async fn confirm_signature(
        &self,
        signature: &Signature,
        last_valid_block_height: u64,
    ) -> Result<(), ArbError> {
        let started = Instant::now();
        loop {
            let statuses = self.client.get_signature_statuses(&[*signature]).await?;
            if let Some(Some(status)) = statuses.value.first() {
                if let Some(err) = &status.err {
                    return Err(ArbError::TransactionError(format!(
                        "{signature} failed on chain: {err:?}"
                    )));
                }
                if status.satisfies_commitment(self.commitment) {
                    return Ok(());
                }
            }

            let block_height = self.client.get_block_height().await?;
            if block_height > last_valid_block_height {
                return Err(ArbError::TimeoutError(format!(
                    "{signature} expired: block height {block_height} > {last_valid_block_height}"
                )));
            }
            if started.elapsed() > CONFIRM_HARD_CAP {
                warn!("confirmation wall-clock cap hit for {signature}");
                return Err(ArbError::TimeoutError(format!(
                    "{signature} unconfirmed after {}s",
                    CONFIRM_HARD_CAP.as_secs()
                )));
            }
            sleep(CONFIRM_POLL_INTERVAL).await;
        }
    }

    pub async fn recent_prioritization_fees(&self) -> Result<Vec<u64>, ArbError> {
        let fees = self.client.get_recent_prioritization_fees(&[]).await?;
        Ok(fees.into_iter().map(|f| f.prioritization_fee).collect())
    }
}
