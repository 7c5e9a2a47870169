use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use log::warn;
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use solana_sdk::compute_budget::ComputeBudgetInstruction;
use solana_sdk::instruction::Instruction;
use solana_sdk::message::{v0::Message, VersionedMessage};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer};
use solana_sdk::system_instruction;
use solana_sdk::transaction::VersionedTransaction;

use crate::aggregator::lut::LookupTableCache;
use crate::aggregator::SwapInstructionSet;
use crate::error::ArbError;
use crate::solana::rpc::SolanaRpcClient;

/// Well-known block-engine tip accounts, used when no explicit tip account
/// is configured.
static DEFAULT_TIP_ACCOUNTS: Lazy<Vec<Pubkey>> = Lazy::new(|| {
    [
        "96gYZGLnJYVFmbjzopPSU6QiEV5fGqZNyN9nmNhvrZU5",
        "HFqU5x63VTqvQss8hp11i4wVV8bD44PvwucfZ2bU7gRe",
        "Cw8CFyM9FkoMi7K7Crf6HNQqf4uEMzpKw6QNghXLvLkY",
        "ADaUMid9yfUytqMBgopwjb2DTLSokTSzL1zt6iGPaS49",
        "DfXygSm4jCyNCybVYYK6DwvWqjKee8pbDmJGcLWNDXjh",
        "ADuUkR4vqLUMWXxW9gh6D6L8pMSawimctcNZ5pGwDcEt",
        "DttWaMuVvTiduZRnguLF7jNxTgiMBZ1hyAumKUiL2KRL",
        "3AVi9Tg9Uo68tJfuvoKvqKNWKkC5wPdSSdeBnizKZ6jT",
    ]
    .iter()
    .map(|s| Pubkey::from_str(s).expect("static tip account"))
    .collect()
});

/// Use the configured account when it parses; otherwise pick one of the
/// defaults at random.
pub fn resolve_tip_account(configured: Option<&str>) -> Pubkey {
    if let Some(raw) = configured {
        match Pubkey::from_str(raw.trim()) {
            Ok(pk) => return pk,
            Err(_) => warn!("invalid tip account '{raw}', picking a default"),
        }
    }
    *DEFAULT_TIP_ACCOUNTS
        .choose(&mut rand::thread_rng())
        .expect("non-empty tip account table")
}

/// Identity of an instruction for dedup purposes: program, payload, and the
/// full account list with flags, order-insensitive.
pub fn instruction_dedup_key(ix: &Instruction) -> String {
    let mut accounts: Vec<String> = ix
        .accounts
        .iter()
        .map(|meta| format!("{}:{}:{}", meta.pubkey, meta.is_signer, meta.is_writable))
        .collect();
    accounts.sort();
    format!(
        "{}|{}|{}",
        ix.program_id,
        general_purpose::STANDARD.encode(&ix.data),
        accounts.join(",")
    )
}

fn dedup_extend(out: &mut Vec<Instruction>, seen: &mut HashSet<String>, instructions: &[Instruction]) {
    for ix in instructions {
        if seen.insert(instruction_dedup_key(ix)) {
            out.push(ix.clone());
        }
    }
}

/// Merge per-leg instruction bundles into one atomic sequence:
///
/// 1. a single normalized compute budget (per-leg ones are discarded; they
///    cannot be duplicated safely in one transaction),
/// 2. leg-1 "other" instructions only (later legs' duplicates clash on
///    account keys),
/// 3. setup, deduplicated across legs,
/// 4. every leg's swap, in path order,
/// 5. cleanup, deduplicated across legs,
/// 6. the tip transfer last, so a native-unwrap cleanup refunds rent before
///    the tip is paid.
pub fn merge_leg_instructions(
    legs: &[SwapInstructionSet],
    cu_limit: u32,
    cu_price_micro_lamports: u64,
    tip: Option<(Pubkey, Pubkey, u64)>,
) -> Vec<Instruction> {
    let mut merged = Vec::new();

    merged.push(ComputeBudgetInstruction::set_compute_unit_limit(cu_limit));
    if cu_price_micro_lamports > 0 {
        merged.push(ComputeBudgetInstruction::set_compute_unit_price(
            cu_price_micro_lamports,
        ));
    }

    if let Some(first) = legs.first() {
        merged.extend(first.other.iter().cloned());
    }

    let mut seen_setup = HashSet::new();
    let mut setup = Vec::new();
    for leg in legs {
        dedup_extend(&mut setup, &mut seen_setup, &leg.setup);
    }
    merged.append(&mut setup);

    for leg in legs {
        merged.push(leg.swap.clone());
    }

    let mut seen_cleanup = HashSet::new();
    let mut cleanup = Vec::new();
    for leg in legs {
        dedup_extend(&mut cleanup, &mut seen_cleanup, &leg.cleanup);
    }
    merged.append(&mut cleanup);

    if let Some((payer, tip_account, lamports)) = tip {
        merged.push(system_instruction::transfer(&payer, &tip_account, lamports));
    }

    merged
}

pub fn collect_lookup_table_addresses(legs: &[SwapInstructionSet]) -> Vec<Pubkey> {
    let mut seen = HashSet::new();
    legs.iter()
        .flat_map(|leg| leg.lookup_table_addresses.iter().copied())
        .filter(|address| seen.insert(*address))
        .collect()
}

/// A signed atomic transaction plus its confirmation horizon.
pub struct BuiltAtomicTransaction {
    pub transaction: VersionedTransaction,
    pub last_valid_block_height: u64,
}

/// Resolve lookup tables, compile a v0 message at the latest blockhash, and
/// sign with the wallet.
pub async fn build_atomic_transaction(
    rpc: &Arc<SolanaRpcClient>,
    lut_cache: &LookupTableCache,
    wallet: &Keypair,
    legs: &[SwapInstructionSet],
    cu_limit: u32,
    cu_price_micro_lamports: u64,
    tip: Option<(Pubkey, u64)>,
) -> Result<BuiltAtomicTransaction, ArbError> {
    let payer = wallet.pubkey();
    let instructions = merge_leg_instructions(
        legs,
        cu_limit,
        cu_price_micro_lamports,
        tip.map(|(account, lamports)| (payer, account, lamports)),
    );

    let lookup_addresses = collect_lookup_table_addresses(legs);
    let tables = lut_cache.get_many(rpc, &lookup_addresses).await?;
    let (blockhash, last_valid_block_height) = rpc.latest_blockhash().await?;

    let message = Message::try_compile(&payer, &instructions, &tables, blockhash)
        .map_err(|e| ArbError::TransactionError(format!("compile: {e}")))?;
    let transaction = VersionedTransaction::try_new(VersionedMessage::V0(message), &[wallet])
        .map_err(|e| ArbError::TransactionError(format!("sign: {e}")))?;

    Ok(BuiltAtomicTransaction {
        transaction,
        last_valid_block_height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::instruction::AccountMeta;

    fn ix(program: Pubkey, data: &[u8], keys: &[(Pubkey, bool, bool)]) -> Instruction {
        Instruction {
            program_id: program,
            accounts: keys
                .iter()
                .map(|(pk, signer, writable)| AccountMeta {
                    pubkey: *pk,
                    is_signer: *signer,
                    is_writable: *writable,
                })
                .collect(),
            data: data.to_vec(),
        }
    }

    fn leg(
        setup: Vec<Instruction>,
        other: Vec<Instruction>,
        swap: Instruction,
        cleanup: Vec<Instruction>,
    ) -> SwapInstructionSet {
        SwapInstructionSet {
            compute_budget: vec![ComputeBudgetInstruction::set_compute_unit_limit(1)],
            setup,
            other,
            swap,
            cleanup,
            lookup_table_addresses: vec![],
        }
    }

    #[test]
    fn merge_order_is_budget_other_setup_swaps_cleanup_tip() {
        let program = Pubkey::new_unique();
        let user = Pubkey::new_unique();
        let shared_setup = ix(program, &[1], &[(user, false, true)]);
        let cleanup = ix(program, &[9], &[(user, false, true)]);
        let other1 = ix(program, &[7], &[]);
        let other2 = ix(program, &[8], &[]);
        let swap1 = ix(program, &[101], &[]);
        let swap2 = ix(program, &[102], &[]);

        let legs = vec![
            leg(vec![shared_setup.clone()], vec![other1.clone()], swap1.clone(), vec![cleanup.clone()]),
            leg(vec![shared_setup.clone()], vec![other2], swap2.clone(), vec![cleanup.clone()]),
        ];
        let tip_account = Pubkey::new_unique();
        let payer = Pubkey::new_unique();
        let merged = merge_leg_instructions(&legs, 600_000, 1_000, Some((payer, tip_account, 5_000)));

        // limit + price + other1 + setup + swap1 + swap2 + cleanup + tip
        assert_eq!(merged.len(), 8);
        assert_eq!(merged[0].program_id, solana_sdk::compute_budget::id());
        assert_eq!(merged[1].program_id, solana_sdk::compute_budget::id());
        assert_eq!(merged[2].data, vec![7]); // leg-1 other only
        assert_eq!(merged[3].data, vec![1]); // deduped setup
        assert_eq!(merged[4].data, vec![101]);
        assert_eq!(merged[5].data, vec![102]);
        assert_eq!(merged[6].data, vec![9]); // deduped cleanup
        assert_eq!(merged[7].program_id, solana_sdk::system_program::id());
        // Tip is strictly last.
        assert_eq!(
            merged.last().unwrap().accounts[1].pubkey,
            tip_account
        );
    }

    #[test]
    fn per_leg_compute_budget_is_discarded() {
        let program = Pubkey::new_unique();
        let legs = vec![leg(vec![], vec![], ix(program, &[1], &[]), vec![])];
        let merged = merge_leg_instructions(&legs, 400_000, 0, None);
        let budget_count = merged
            .iter()
            .filter(|ix| ix.program_id == solana_sdk::compute_budget::id())
            .count();
        // exactly one limit, no price (price == 0), leg budgets gone
        assert_eq!(budget_count, 1);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn dedup_is_keyed_on_program_data_and_accounts() {
        let program = Pubkey::new_unique();
        let user = Pubkey::new_unique();
        let a = ix(program, &[1], &[(user, false, true)]);
        // same data, different writability: distinct
        let b = ix(program, &[1], &[(user, false, false)]);
        assert_ne!(instruction_dedup_key(&a), instruction_dedup_key(&b));
        // account order does not matter
        let other = Pubkey::new_unique();
        let c = ix(program, &[2], &[(user, false, true), (other, true, false)]);
        let d = ix(program, &[2], &[(other, true, false), (user, false, true)]);
        assert_eq!(instruction_dedup_key(&c), instruction_dedup_key(&d));
    }

    #[test]
    fn no_duplicates_within_setup_or_cleanup() {
        let program = Pubkey::new_unique();
        let user = Pubkey::new_unique();
        let setup = ix(program, &[1], &[(user, false, true)]);
        let legs = vec![
            leg(vec![setup.clone(), setup.clone()], vec![], ix(program, &[3], &[]), vec![]),
            leg(vec![setup.clone()], vec![], ix(program, &[4], &[]), vec![]),
        ];
        let merged = merge_leg_instructions(&legs, 100, 0, None);
        let setup_count = merged.iter().filter(|i| i.data == vec![1]).count();
        assert_eq!(setup_count, 1);
    }

    #[test]
    fn lookup_tables_are_deduped_in_order() {
        let t1 = Pubkey::new_unique();
        let t2 = Pubkey::new_unique();
        let mut leg1 = leg(vec![], vec![], ix(Pubkey::new_unique(), &[1], &[]), vec![]);
        leg1.lookup_table_addresses = vec![t1, t2];
        let mut leg2 = leg(vec![], vec![], ix(Pubkey::new_unique(), &[2], &[]), vec![]);
        leg2.lookup_table_addresses = vec![t2, t1];
        assert_eq!(collect_lookup_table_addresses(&[leg1, leg2]), vec![t1, t2]);
    }

    #[test]
    fn tip_account_resolution() {
        let explicit = Pubkey::new_unique().to_string();
        assert_eq!(
            resolve_tip_account(Some(&explicit)),
            Pubkey::from_str(&explicit).unwrap()
        );
        let fallback = resolve_tip_account(Some("not-a-pubkey"));
        assert!(DEFAULT_TIP_ACCOUNTS.contains(&fallback));
        let random = resolve_tip_account(None);
        assert!(DEFAULT_TIP_ACCOUNTS.contains(&random));
    }
}
