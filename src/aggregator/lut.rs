use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use solana_sdk::address_lookup_table::state::AddressLookupTable;
use solana_sdk::address_lookup_table::AddressLookupTableAccount;
use solana_sdk::pubkey::Pubkey;

use crate::aggregator::cache::CoalescingCache;
use crate::error::ArbError;
use crate::solana::rpc::SolanaRpcClient;

pub const LOOKUP_TABLE_TTL: Duration = Duration::from_secs(60);

/// TTL cache of resolved address lookup tables with per-address in-flight
/// coalescing. Tables that do not exist resolve to `None` and are dropped
/// from `get_many` results.
pub struct LookupTableCache {
    ttl: Duration,
    entries: CoalescingCache<Pubkey, Option<AddressLookupTableAccount>>,
}

impl LookupTableCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: CoalescingCache::new(),
        }
    }

    pub async fn get(
        &self,
        rpc: &Arc<SolanaRpcClient>,
        address: Pubkey,
    ) -> Result<Option<AddressLookupTableAccount>, ArbError> {
        let rpc = rpc.clone();
        self.entries
            .get_or_fetch(address, self.ttl, move || async move {
                fetch_lookup_table(&rpc, address).await
            })
            .await
    }

    /// Resolve a deduplicated set of tables, dropping addresses that do not
    /// resolve to a live table.
    pub async fn get_many(
        &self,
        rpc: &Arc<SolanaRpcClient>,
        addresses: &[Pubkey],
    ) -> Result<Vec<AddressLookupTableAccount>, ArbError> {
        let mut seen = HashSet::new();
        let mut resolved = Vec::new();
        for address in addresses {
            if !seen.insert(*address) {
                continue;
            }
            match self.get(rpc, *address).await? {
                Some(table) => resolved.push(table),
                None => warn!("lookup table {address} not found, dropping"),
            }
        }
        Ok(resolved)
    }
}

async fn fetch_lookup_table(
    rpc: &Arc<SolanaRpcClient>,
    address: Pubkey,
) -> Result<Option<AddressLookupTableAccount>, ArbError> {
    let Some(account) = rpc.get_account_data(&address).await? else {
        return Ok(None);
    };
    let table = AddressLookupTable::deserialize(&account)
        .map_err(|e| ArbError::RpcError(format!("lookup table {address}: {e}")))?;
    Ok(Some(AddressLookupTableAccount {
        key: address,
        addresses: table.addresses.to_vec(),
    }))
}
