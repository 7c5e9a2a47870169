use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use futures::future::try_join_all;
use log::{info, warn};
use serde_json::json;
use solana_sdk::signature::{Keypair, Signature, Signer};
use solana_sdk::transaction::{Transaction, VersionedTransaction};

use crate::aggregator::lut::LookupTableCache;
use crate::aggregator::ultra::execute_failure;
use crate::aggregator::{JupiterQuote, JupiterQuoteClient, OpenOceanClient, UltraClient, UltraOrder};
use crate::arbitrage::builder::{build_atomic_transaction, resolve_tip_account};
use crate::arbitrage::fees::is_native_mint;
use crate::arbitrage::jito_client::{should_fallback_to_rpc, BundleDisposition, JitoClient};
use crate::arbitrage::trigger::ExecuteSink;
use crate::arbitrage::{Candidate, CandidateCore, PrimaryLeg};
use crate::config::{ExecutionProvider, ExecutionStrategy, PriorityFeeStrategy, Settings};
use crate::error::ArbError;
use crate::events::{EventLog, EventType};
use crate::solana::priority::PriorityFeeEstimator;
use crate::solana::rpc::SolanaRpcClient;

/// Executes fired candidates: builds, optionally preflights, and submits.
pub struct Executor {
    pub settings: Arc<Settings>,
    pub rpc: Arc<SolanaRpcClient>,
    pub wallet: Arc<Keypair>,
    pub jupiter: Arc<JupiterQuoteClient>,
    pub ultra: Option<Arc<UltraClient>>,
    pub openocean: Option<Arc<OpenOceanClient>>,
    pub jito: Option<Arc<JitoClient>>,
    pub lut_cache: Arc<LookupTableCache>,
    pub priority: Arc<PriorityFeeEstimator>,
    pub events: Arc<EventLog>,
}

#[async_trait]
impl ExecuteSink for Executor {
    async fn execute(&self, candidate: &Candidate) -> Result<(), ArbError> {
        if !self.min_balance_ok().await? {
            self.skip(candidate.core(), "min-balance").await;
            return Ok(());
        }
        match candidate {
            Candidate::Loop { core, leg1, leg2 } => match (leg1, leg2) {
                (PrimaryLeg::Ultra(o1), PrimaryLeg::Ultra(o2)) => {
                    self.execute_ultra(core, o1, o2).await
                }
                (PrimaryLeg::Quote(q1), PrimaryLeg::Quote(q2)) => {
                    match self.settings.execution_strategy {
                        ExecutionStrategy::Atomic => self.execute_atomic(core, &[q1, q2]).await,
                        ExecutionStrategy::Sequential => {
                            self.execute_sequential(core, &[q1, q2]).await
                        }
                    }
                }
                _ => Err(ArbError::ExecutionError(
                    "mixed quote/ultra legs in one candidate".to_string(),
                )),
            },
            Candidate::Triangular {
                core,
                quote1,
                quote2,
                quote3,
            } => {
                // Ultra has no triangular orders; reject here rather than
                // trusting the scanner to never hand one over.
                if self.settings.execution_provider == ExecutionProvider::Ultra {
                    self.skip(core, "ultra-does-not-support-triangular").await;
                    return Ok(());
                }
                self.execute_atomic(core, &[quote1, quote2, quote3]).await
            }
            Candidate::LoopSecondary { core, quote1, quote2 } => {
                self.execute_secondary(core, quote1.slippage_bps, quote2.slippage_bps, quote1)
                    .await
            }
        }
    }
}

impl Executor {
    fn live(&self) -> bool {
        self.settings.mode.is_live()
    }

    async fn min_balance_ok(&self) -> Result<bool, ArbError> {
        if !self.live() || self.settings.min_balance_lamports == 0 {
            return Ok(true);
        }
        let balance = self.rpc.balance_cached(&self.wallet.pubkey()).await?;
        Ok(balance >= self.settings.min_balance_lamports)
    }

    async fn skip(&self, core: &CandidateCore, reason: &str) {
        self.events
            .emit(
                EventType::Skip,
                json!({"pair": core.pair_name, "reason": reason}),
            )
            .await;
    }

    async fn cu_price(&self, core: &CandidateCore) -> u64 {
        match self.settings.priority_fee_strategy {
            PriorityFeeStrategy::Off => core.cu_price_micro_lamports,
            _ => self.priority.cu_price_micro_lamports().await,
        }
    }

    /// Preflight a signed transaction. Returns false when the simulation
    /// errored and the send must be skipped.
    async fn preflight_ok(
        &self,
        core: &CandidateCore,
        tx: &VersionedTransaction,
        leg: Option<u8>,
    ) -> Result<bool, ArbError> {
        let err = self.rpc.simulate(tx).await?;
        self.events
            .emit(
                EventType::Preflight,
                json!({
                    "pair": core.pair_name,
                    "leg": leg,
                    "ok": err.is_none(),
                    "error": err,
                }),
            )
            .await;
        Ok(err.is_none())
    }

    // --- atomic (single merged transaction) ---

    async fn execute_atomic(
        &self,
        core: &CandidateCore,
        quotes: &[&JupiterQuote],
    ) -> Result<(), ArbError> {
        let cu_price = self.cu_price(core).await;
        let user = self.wallet.pubkey();
        let legs = try_join_all(quotes.iter().map(|quote| {
            self.jupiter
                .build_swap_instructions(quote, &user, (cu_price > 0).then_some(cu_price))
        }))
        .await?;

        let use_bundle = self.settings.jito_enabled && self.jito.is_some();
        let tip = (use_bundle && core.tip_lamports > 0).then(|| {
            (
                resolve_tip_account(self.settings.jito_tip_account.as_deref()),
                core.tip_lamports,
            )
        });

        let built = build_atomic_transaction(
            &self.rpc,
            &self.lut_cache,
            &self.wallet,
            &legs,
            core.cu_limit,
            cu_price,
            tip,
        )
        .await?;
        self.events
            .emit(
                EventType::Built,
                json!({
                    "pair": core.pair_name,
                    "kind": "atomic",
                    "legs": legs.len(),
                    "tipLamports": tip.map(|(_, l)| l).unwrap_or(0),
                    "signature": built.transaction.signatures[0].to_string(),
                }),
            )
            .await;

        if !self.live() {
            if self.settings.dry_run_simulate {
                let err = self.rpc.simulate(&built.transaction).await?;
                self.events
                    .emit(
                        EventType::Simulate,
                        json!({"pair": core.pair_name, "ok": err.is_none(), "error": err}),
                    )
                    .await;
            }
            return Ok(());
        }

        if self.settings.live_preflight_simulate
            && !self.preflight_ok(core, &built.transaction, None).await?
        {
            self.skip(core, "preflight-failed").await;
            return Ok(());
        }

        if use_bundle {
            self.submit_bundle(core, &legs, cu_price, built).await
        } else {
            let signature = self.rpc.send_transaction(&built.transaction).await?;
            self.confirm_and_report(core, &signature, built.last_valid_block_height, json!({}))
                .await;
            Ok(())
        }
    }

    async fn submit_bundle(
        &self,
        core: &CandidateCore,
        legs: &[crate::aggregator::SwapInstructionSet],
        cu_price: u64,
        built: crate::arbitrage::builder::BuiltAtomicTransaction,
    ) -> Result<(), ArbError> {
        let jito = self.jito.as_ref().expect("bundle path requires jito client");
        let signature = built.transaction.signatures[0];
        let encoded = general_purpose::STANDARD.encode(
            bincode::serialize(&built.transaction)
                .map_err(|e| ArbError::TransactionError(format!("serialize: {e}")))?,
        );

        let wait_ms = self.settings.jito_wait_ms;
        let result = match jito.send_bundle(&[encoded]).await {
            Ok(bundle_id) => {
                if wait_ms > 0 {
                    let disposition = jito
                        .wait_for_result(&bundle_id, Duration::from_millis(wait_ms))
                        .await;
                    self.events
                        .emit(
                            EventType::JitoBundle,
                            json!({
                                "pair": core.pair_name,
                                "bundleId": bundle_id,
                                "status": format!("{:?}", disposition),
                            }),
                        )
                        .await;
                    disposition
                } else {
                    self.events
                        .emit(
                            EventType::JitoBundle,
                            json!({"pair": core.pair_name, "bundleId": bundle_id, "status": "submitted"}),
                        )
                        .await;
                    // Fire-and-forget: no waiting, no confirmation.
                    self.events
                        .emit(
                            EventType::Executed,
                            json!({
                                "pair": core.pair_name,
                                "jito": true,
                                "signature": signature.to_string(),
                                "confirmed": false,
                            }),
                        )
                        .await;
                    return Ok(());
                }
            }
            Err(e) => {
                self.events
                    .emit(
                        EventType::JitoBundle,
                        json!({"pair": core.pair_name, "error": e.to_string()}),
                    )
                    .await;
                Err(e)
            }
        };

        if should_fallback_to_rpc(&result, wait_ms, self.settings.jito_fallback_rpc) {
            // Same trade, no tip: the tip only pays for bundle inclusion.
            let rebuilt = build_atomic_transaction(
                &self.rpc,
                &self.lut_cache,
                &self.wallet,
                legs,
                core.cu_limit,
                cu_price,
                None,
            )
            .await?;
            let rpc_signature = self.rpc.send_transaction(&rebuilt.transaction).await?;
            self.confirm_and_report(
                core,
                &rpc_signature,
                rebuilt.last_valid_block_height,
                json!({"jito": true, "fallbackRpc": true}),
            )
            .await;
            return Ok(());
        }

        match result {
            Ok(BundleDisposition::Landed(slot)) => {
                self.confirm_and_report(
                    core,
                    &signature,
                    built.last_valid_block_height,
                    json!({"jito": true, "landedSlot": slot}),
                )
                .await;
            }
            Ok(BundleDisposition::TimedOut) => {
                // The bundle may still land; report unconfirmed and move on.
                self.events
                    .emit(
                        EventType::Executed,
                        json!({
                            "pair": core.pair_name,
                            "jito": true,
                            "signature": signature.to_string(),
                            "confirmed": false,
                        }),
                    )
                    .await;
            }
            Ok(other) => {
                self.events
                    .emit(
                        EventType::Error,
                        json!({
                            "pair": core.pair_name,
                            "stage": "jito",
                            "error": format!("bundle {other:?} and fallback disabled"),
                        }),
                    )
                    .await;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn confirm_and_report(
        &self,
        core: &CandidateCore,
        signature: &Signature,
        last_valid_block_height: u64,
        extra: serde_json::Value,
    ) {
        match self
            .rpc
            .confirm_signature(signature, last_valid_block_height)
            .await
        {
            Ok(()) => {
                let mut fields = json!({
                    "pair": core.pair_name,
                    "signature": signature.to_string(),
                    "confirmed": true,
                });
                merge(&mut fields, extra);
                self.events.emit(EventType::Executed, fields).await;
                info!("executed {}: {signature}", core.pair_name);
            }
            Err(e) => {
                // Economic correctness over retries: never re-send here.
                self.events
                    .emit(
                        EventType::ConfirmError,
                        json!({
                            "pair": core.pair_name,
                            "signature": signature.to_string(),
                            "error": e.to_string(),
                        }),
                    )
                    .await;
            }
        }
    }

    // --- sequential (one transaction per leg) ---

    async fn execute_sequential(
        &self,
        core: &CandidateCore,
        quotes: &[&JupiterQuote],
    ) -> Result<(), ArbError> {
        let cu_price = self.cu_price(core).await;
        let user = self.wallet.pubkey();

        for (index, quote) in quotes.iter().enumerate() {
            let leg = index as u8 + 1;
            let built = self
                .jupiter
                .build_swap_transaction(quote, &user, (cu_price > 0).then_some(cu_price))
                .await?;
            let tx = sign_base64_transaction(&built.transaction_base64, &self.wallet)?;
            let signature = tx.signatures[0];
            self.events
                .emit(
                    EventType::Built,
                    json!({
                        "pair": core.pair_name,
                        "kind": "sequential",
                        "leg": leg,
                        "signature": signature.to_string(),
                    }),
                )
                .await;

            if !self.live() {
                continue;
            }
            if self.settings.live_preflight_simulate
                && !self.preflight_ok(core, &tx, Some(leg)).await?
            {
                self.skip(core, "preflight-failed").await;
                return Ok(());
            }

            let last_valid = match built.last_valid_block_height {
                Some(height) => height,
                None => self.rpc.latest_blockhash().await?.1,
            };
            let signature = self.rpc.send_transaction(&tx).await?;
            if let Err(e) = self.rpc.confirm_signature(&signature, last_valid).await {
                self.events
                    .emit(
                        EventType::ConfirmError,
                        json!({
                            "pair": core.pair_name,
                            "leg": leg,
                            "signature": signature.to_string(),
                            "error": e.to_string(),
                        }),
                    )
                    .await;
                return Ok(());
            }
            self.events
                .emit(
                    EventType::Executed,
                    json!({
                        "pair": core.pair_name,
                        "leg": leg,
                        "signature": signature.to_string(),
                        "confirmed": true,
                    }),
                )
                .await;
        }
        Ok(())
    }

    // --- ultra (aggregator-hosted execution) ---

    async fn execute_ultra(
        &self,
        core: &CandidateCore,
        order1: &UltraOrder,
        order2: &UltraOrder,
    ) -> Result<(), ArbError> {
        if self.settings.execution_strategy == ExecutionStrategy::Atomic {
            self.skip(core, "ultra-requires-sequential").await;
            return Ok(());
        }
        if !is_native_mint(&order1.input_mint) {
            self.skip(core, "ultra-requires-sol-amint").await;
            return Ok(());
        }
        let ultra = self
            .ultra
            .as_ref()
            .ok_or_else(|| ArbError::ConfigError("ultra client not configured".to_string()))?;

        for (index, order) in [order1, order2].into_iter().enumerate() {
            let leg = index as u8 + 1;
            let unsigned = order.transaction_base64.as_deref().ok_or_else(|| {
                ArbError::ExecutionError(format!("ultra order leg{leg} has no transaction"))
            })?;
            let tx = sign_base64_transaction(unsigned, &self.wallet)?;
            self.events
                .emit(
                    EventType::Built,
                    json!({
                        "pair": core.pair_name,
                        "kind": "ultra",
                        "leg": leg,
                        "requestId": order.request_id,
                    }),
                )
                .await;
            if !self.live() {
                continue;
            }

            let signed = general_purpose::STANDARD.encode(
                bincode::serialize(&tx)
                    .map_err(|e| ArbError::TransactionError(format!("serialize: {e}")))?,
            );
            let response = ultra.execute(&signed, &order.request_id).await?;
            if let Some(failure) = execute_failure(&response) {
                self.events
                    .emit(
                        EventType::Skip,
                        json!({
                            "pair": core.pair_name,
                            "reason": format!("ultra-exec-failed-leg{leg}"),
                            "error": failure,
                        }),
                    )
                    .await;
                return Ok(());
            }

            let signature = response
                .signature
                .as_deref()
                .and_then(|s| s.parse::<Signature>().ok())
                .unwrap_or(tx.signatures[0]);
            // Best-effort confirmation; ultra already accepted the leg.
            let last_valid = self.rpc.latest_blockhash().await?.1;
            self.confirm_and_report(core, &signature, last_valid, json!({"leg": leg, "ultra": true}))
                .await;
        }
        Ok(())
    }

    // --- secondary (meta-aggregator, sequential only) ---

    async fn execute_secondary(
        &self,
        core: &CandidateCore,
        leg1_slippage_bps: u16,
        leg2_slippage_bps: u16,
        quote1: &crate::aggregator::OpenOceanQuote,
    ) -> Result<(), ArbError> {
        let openocean = self
            .openocean
            .as_ref()
            .ok_or_else(|| ArbError::ConfigError("openocean client not configured".to_string()))?;
        let account = self.wallet.pubkey().to_string();
        let a_mint = quote1.input_mint.clone();
        let b_mint = quote1.output_mint.clone();
        let should_preflight = if self.live() {
            self.settings.live_preflight_simulate
        } else {
            self.settings.dry_run_simulate
        };

        // Leg 1
        let swap1 = openocean
            .swap(&a_mint, &b_mint, core.amount_in, leg1_slippage_bps, &account)
            .await?;
        let tx1 = sign_raw_transaction(&swap1.transaction, &self.wallet)?;
        self.events
            .emit(
                EventType::Built,
                json!({"pair": core.pair_name, "kind": "openocean", "leg": 1}),
            )
            .await;
        if should_preflight && !self.preflight_ok(core, &tx1, Some(1)).await? {
            self.skip(core, "preflight-failed").await;
            return Ok(());
        }
        if self.live() {
            let last_valid = match swap1.last_valid_block_height {
                Some(height) => height,
                None => self.rpc.latest_blockhash().await?.1,
            };
            let signature = self.rpc.send_transaction(&tx1).await?;
            self.rpc.confirm_signature(&signature, last_valid).await?;
            self.events
                .emit(
                    EventType::Executed,
                    json!({
                        "pair": core.pair_name,
                        "leg": 1,
                        "signature": signature.to_string(),
                        "confirmed": true,
                    }),
                )
                .await;
        }

        // Leg 2, funded by leg 1's conservative output.
        let swap2 = openocean
            .swap(&b_mint, &a_mint, quote1.min_out_amount, leg2_slippage_bps, &account)
            .await?;
        let tx2 = sign_raw_transaction(&swap2.transaction, &self.wallet)?;
        self.events
            .emit(
                EventType::Built,
                json!({"pair": core.pair_name, "kind": "openocean", "leg": 2}),
            )
            .await;
        if should_preflight && !self.preflight_ok(core, &tx2, Some(2)).await? {
            if self.live() {
                self.skip(core, "preflight-failed").await;
                return Ok(());
            }
            // In dry-run leg 1 never executed, so leg 2 cannot hold the
            // intermediate balance; an expected outcome, not a failure.
            warn!(
                "leg2 preflight failed in dry-run for {} (expected without leg1 on chain)",
                core.pair_name
            );
            self.events
                .emit(
                    EventType::Preflight,
                    json!({
                        "pair": core.pair_name,
                        "leg": 2,
                        "expected": true,
                        "note": "dry-run: intermediate balance not held on chain",
                    }),
                )
                .await;
        }
        if self.live() {
            let last_valid = match swap2.last_valid_block_height {
                Some(height) => height,
                None => self.rpc.latest_blockhash().await?.1,
            };
            let signature = self.rpc.send_transaction(&tx2).await?;
            self.rpc.confirm_signature(&signature, last_valid).await?;
            self.events
                .emit(
                    EventType::Executed,
                    json!({
                        "pair": core.pair_name,
                        "leg": 2,
                        "signature": signature.to_string(),
                        "confirmed": true,
                    }),
                )
                .await;
        }
        Ok(())
    }
}

fn merge(target: &mut serde_json::Value, extra: serde_json::Value) {
    if let (Some(target), Some(extra)) = (target.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            target.insert(k.clone(), v.clone());
        }
    }
}

/// Deserialize a base64 transaction payload and sign it with the wallet.
pub fn sign_base64_transaction(
    payload_base64: &str,
    wallet: &Keypair,
) -> Result<VersionedTransaction, ArbError> {
    let bytes = general_purpose::STANDARD
        .decode(payload_base64)
        .map_err(|e| ArbError::TransactionError(format!("base64: {e}")))?;
    sign_raw_transaction(&bytes, wallet)
}

/// Sign raw transaction bytes: versioned first, legacy as fallback.
pub fn sign_raw_transaction(
    bytes: &[u8],
    wallet: &Keypair,
) -> Result<VersionedTransaction, ArbError> {
    if let Ok(tx) = bincode::deserialize::<VersionedTransaction>(bytes) {
        return VersionedTransaction::try_new(tx.message, &[wallet])
            .map_err(|e| ArbError::TransactionError(format!("sign: {e}")));
    }
    let legacy: Transaction = bincode::deserialize(bytes)
        .map_err(|e| ArbError::TransactionError(format!("deserialize: {e}")))?;
    let mut legacy = Transaction::new_unsigned(legacy.message);
    let blockhash = legacy.message.recent_blockhash;
    legacy
        .try_sign(&[wallet], blockhash)
        .map_err(|e| ArbError::TransactionError(format!("sign legacy: {e}")))?;
    Ok(VersionedTransaction::from(legacy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::hash::Hash;
    use solana_sdk::message::Message;
    use solana_sdk::pubkey::Pubkey;
    use solana_sdk::system_instruction;

    #[test]
    fn signs_a_legacy_transaction_payload() {
        let wallet = Keypair::new();
        let to = Pubkey::new_unique();
        let ix = system_instruction::transfer(&wallet.pubkey(), &to, 1_000);
        let message = Message::new(&[ix], Some(&wallet.pubkey()));
        let unsigned = Transaction::new_unsigned(message);
        let bytes = bincode::serialize(&unsigned).unwrap();

        let signed = sign_raw_transaction(&bytes, &wallet).unwrap();
        assert_ne!(signed.signatures[0], Signature::default());
    }

    #[test]
    fn signs_a_versioned_transaction_payload() {
        let wallet = Keypair::new();
        let to = Pubkey::new_unique();
        let ix = system_instruction::transfer(&wallet.pubkey(), &to, 1_000);
        let v0 = solana_sdk::message::v0::Message::try_compile(
            &wallet.pubkey(),
            &[ix],
            &[],
            Hash::new_unique(),
        )
        .unwrap();
        let unsigned = VersionedTransaction {
            signatures: vec![Signature::default()],
            message: solana_sdk::message::VersionedMessage::V0(v0),
        };
        let bytes = bincode::serialize(&unsigned).unwrap();

        let encoded = general_purpose::STANDARD.encode(&bytes);
        let signed = sign_base64_transaction(&encoded, &wallet).unwrap();
        assert_ne!(signed.signatures[0], Signature::default());
    }

    #[test]
    fn rejects_garbage_payloads() {
        let wallet = Keypair::new();
        assert!(sign_raw_transaction(&[1, 2, 3], &wallet).is_err());
        assert!(sign_base64_transaction("!!!", &wallet).is_err());
    }

    use crate::arbitrage::Decision;
    use crate::rate::{AdaptiveRateLimiter, LimiterConfig, RetryPolicy};
    use solana_sdk::commitment_config::CommitmentConfig;
    use std::path::PathBuf;

    const SOL: &str = "So11111111111111111111111111111111111111112";
    const USDC: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
    const MSOL: &str = "mSoLzYCxHdYgdzU16g5QSh3i5K3z3KZK7ytfqcJm7So";

    /// Offline executor: dry-run settings, nothing dialed before the guard
    /// paths under test bail out.
    fn offline_executor(settings: Settings, events_path: PathBuf) -> Executor {
        let settings = Arc::new(settings);
        let limiter = Arc::new(AdaptiveRateLimiter::new(LimiterConfig::from_settings(
            "jupiter",
            &settings.jupiter_rate,
        )));
        let retry = RetryPolicy::from_settings(&settings.jupiter_rate);
        let rpc = Arc::new(SolanaRpcClient::new(
            "http://localhost:8899",
            CommitmentConfig::confirmed(),
            Duration::from_secs(1),
        ));
        Executor {
            settings: settings.clone(),
            rpc: rpc.clone(),
            wallet: Arc::new(Keypair::new()),
            jupiter: Arc::new(
                JupiterQuoteClient::new(
                    "https://lite-api.jup.ag/swap/v1",
                    None,
                    Duration::from_secs(1),
                    limiter,
                    retry,
                )
                .unwrap(),
            ),
            ultra: None,
            openocean: None,
            jito: None,
            lut_cache: Arc::new(LookupTableCache::new(Duration::from_secs(60))),
            priority: Arc::new(PriorityFeeEstimator::new(&settings, rpc)),
            events: Arc::new(EventLog::new(Some(events_path), false, 0, 0, true)),
        }
    }

    fn core(pair: &str) -> CandidateCore {
        CandidateCore {
            pair_name: pair.to_string(),
            amount_in: 1_000_000,
            tip_lamports: 0,
            fee_lamports: 5_000,
            fee_in_a: 5_000,
            cu_limit: 600_000,
            cu_price_micro_lamports: 0,
            decision: Decision { profit: 10_000, conservative_profit: 5_000, profitable: true },
        }
    }

    fn jupiter_quote(input: &str, output: &str) -> JupiterQuote {
        JupiterQuote {
            input_mint: input.to_string(),
            output_mint: output.to_string(),
            in_amount: 1_000_000,
            out_amount: 1_010_000,
            other_amount_threshold: 1_005_000,
            slippage_bps: 50,
            response: json!({}),
        }
    }

    fn ultra_order(input: &str, output: &str) -> UltraOrder {
        UltraOrder {
            input_mint: input.to_string(),
            output_mint: output.to_string(),
            in_amount: 1_000_000,
            out_amount: 1_010_000,
            other_amount_threshold: 1_005_000,
            slippage_bps: 50,
            transaction_base64: Some("AQID".to_string()),
            request_id: "req-1".to_string(),
        }
    }

    #[tokio::test]
    async fn triangular_under_ultra_provider_skips_with_the_documented_reason() {
        let dir = tempfile::tempdir().unwrap();
        let events_path = dir.path().join("events.ndjson");
        let mut settings = Settings::test_default();
        settings.execution_provider = ExecutionProvider::Ultra;
        settings.execution_strategy = ExecutionStrategy::Sequential;
        let executor = offline_executor(settings, events_path.clone());

        let candidate = Candidate::Triangular {
            core: core("SOL/USDC/mSOL"),
            quote1: jupiter_quote(SOL, USDC),
            quote2: jupiter_quote(USDC, MSOL),
            quote3: jupiter_quote(MSOL, SOL),
        };
        executor.execute(&candidate).await.unwrap();

        let raw = std::fs::read_to_string(&events_path).unwrap();
        assert!(raw.contains("ultra-does-not-support-triangular"), "{raw}");
    }

    #[tokio::test]
    async fn ultra_with_non_native_input_skips_with_the_documented_reason() {
        let dir = tempfile::tempdir().unwrap();
        let events_path = dir.path().join("events.ndjson");
        let mut settings = Settings::test_default();
        settings.execution_provider = ExecutionProvider::Ultra;
        settings.execution_strategy = ExecutionStrategy::Sequential;
        let executor = offline_executor(settings, events_path.clone());

        let candidate = Candidate::Loop {
            core: core("USDC/SOL"),
            leg1: PrimaryLeg::Ultra(ultra_order(USDC, SOL)),
            leg2: PrimaryLeg::Ultra(ultra_order(SOL, USDC)),
        };
        executor.execute(&candidate).await.unwrap();

        let raw = std::fs::read_to_string(&events_path).unwrap();
        assert!(raw.contains("ultra-requires-sol-amint"), "{raw}");
    }

    #[tokio::test]
    async fn ultra_under_atomic_strategy_skips_before_any_leg() {
        let dir = tempfile::tempdir().unwrap();
        let events_path = dir.path().join("events.ndjson");
        let mut settings = Settings::test_default();
        settings.execution_provider = ExecutionProvider::Ultra;
        settings.execution_strategy = ExecutionStrategy::Atomic;
        let executor = offline_executor(settings, events_path.clone());

        let candidate = Candidate::Loop {
            core: core("SOL/USDC"),
            leg1: PrimaryLeg::Ultra(ultra_order(SOL, USDC)),
            leg2: PrimaryLeg::Ultra(ultra_order(USDC, SOL)),
        };
        executor.execute(&candidate).await.unwrap();

        let raw = std::fs::read_to_string(&events_path).unwrap();
        assert!(raw.contains("ultra-requires-sequential"), "{raw}");
    }
}
