use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use log::info;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer};
use solana_sdk::transaction::Transaction;
use spl_associated_token_account::{
    get_associated_token_address, instruction::create_associated_token_account_idempotent,
};

use crate::config::PairConfig;
use crate::error::ArbError;
use crate::solana::rpc::SolanaRpcClient;

/// Load the wallet secret from its env-var form: a JSON byte array, a base58
/// string, or a path to a JSON byte-array file.
pub fn load_keypair(secret: &str) -> Result<Keypair, ArbError> {
    let trimmed = secret.trim();
    if trimmed.is_empty() {
        return Err(ArbError::WalletError("empty wallet secret".to_string()));
    }

    if trimmed.starts_with('[') {
        let bytes: Vec<u8> = serde_json::from_str(trimmed)
            .map_err(|e| ArbError::WalletError(format!("secret JSON array: {e}")))?;
        return Keypair::from_bytes(&bytes)
            .map_err(|e| ArbError::WalletError(format!("secret bytes: {e}")));
    }

    if let Ok(bytes) = bs58::decode(trimmed).into_vec() {
        if let Ok(keypair) = Keypair::from_bytes(&bytes) {
            return Ok(keypair);
        }
    }

    let path = Path::new(trimmed);
    let raw = std::fs::read_to_string(path).map_err(|e| {
        ArbError::WalletError(format!(
            "wallet secret is neither base58, JSON array, nor readable file ({e})"
        ))
    })?;
    let bytes: Vec<u8> = serde_json::from_str(raw.trim())
        .map_err(|e| ArbError::WalletError(format!("keypair file {}: {e}", path.display())))?;
    Keypair::from_bytes(&bytes)
        .map_err(|e| ArbError::WalletError(format!("keypair file bytes: {e}")))
}

/// Create the associated token account for every mint in every pair,
/// idempotently. Returns how many creation transactions were actually sent;
/// zero when every account already exists.
pub async fn setup_wallet(
    rpc: &SolanaRpcClient,
    wallet: &Keypair,
    pairs: &[PairConfig],
) -> Result<u32, ArbError> {
    let mut mints = HashSet::new();
    for pair in pairs {
        for mint in pair.mints() {
            mints.insert(mint.to_string());
        }
    }

    let owner = wallet.pubkey();
    let mut created = 0u32;
    for mint_str in mints {
        let mint = Pubkey::from_str(&mint_str)
            .map_err(|e| ArbError::ConfigError(format!("mint {mint_str}: {e}")))?;
        let ata = get_associated_token_address(&owner, &mint);
        if rpc.get_account_data(&ata).await?.is_some() {
            info!("token account {ata} for mint {mint_str} already exists");
            continue;
        }

        let ix = create_associated_token_account_idempotent(
            &owner,
            &owner,
            &mint,
            &spl_token::id(),
        );
        let (blockhash, last_valid_block_height) = rpc.latest_blockhash().await?;
        let tx =
            Transaction::new_signed_with_payer(&[ix], Some(&owner), &[wallet], blockhash);
        let signature = rpc
            .inner()
            .send_transaction(&tx)
            .await
            .map_err(ArbError::from)?;
        rpc.confirm_signature(&signature, last_valid_block_height).await?;
        info!("created token account {ata} for mint {mint_str} ({signature})");
        created += 1;
    }
    Ok(created)
}
