use std::future::Future;
use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::error::ArbError;

type SharedResult<V> = Shared<BoxFuture<'static, Result<V, ArbError>>>;

/// TTL cache that stores the in-flight future itself, so concurrent callers
/// for the same key coalesce onto one upstream request. Failed entries are
/// evicted immediately so the next caller retries.
pub struct CoalescingCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + 'static,
{
    entries: DashMap<K, (Instant, SharedResult<V>)>,
}

impl<K, V> CoalescingCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    pub async fn get_or_fetch<F, Fut>(&self, key: K, ttl: Duration, fetch: F) -> Result<V, ArbError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, ArbError>> + Send + 'static,
    {
        let shared = {
            let now = Instant::now();
            match self.entries.entry(key.clone()) {
                dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                    let (inserted_at, existing) = occupied.get();
                    if now.duration_since(*inserted_at) < ttl {
                        existing.clone()
                    } else {
                        let fresh = fetch().boxed().shared();
                        occupied.insert((now, fresh.clone()));
                        fresh
                    }
                }
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    let fresh = fetch().boxed().shared();
                    vacant.insert((now, fresh.clone()));
                    fresh
                }
            }
        };

        let result = shared.await;
        if result.is_err() {
            self.entries.remove(&key);
        }
        result
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> Default for CoalescingCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Cache key for exact-in quotes. Venue filters are sorted so logically equal
/// sets hit the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuoteKey {
    pub input_mint: String,
    pub output_mint: String,
    pub amount: u128,
    pub slippage_bps: u16,
    pub include_dexes: Vec<String>,
    pub exclude_dexes: Vec<String>,
}

impl QuoteKey {
    pub fn new(request: &crate::aggregator::QuoteRequest) -> Self {
        let mut include = request.include_dexes.clone().unwrap_or_default();
        let mut exclude = request.exclude_dexes.clone().unwrap_or_default();
        include.sort();
        exclude.sort();
        Self {
            input_mint: request.input_mint.clone(),
            output_mint: request.output_mint.clone(),
            amount: request.amount,
            slippage_bps: request.slippage_bps,
            include_dexes: include,
            exclude_dexes: exclude,
        }
    }
}

/// Cache key for the lamport->A reference conversion.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeeConversionKey {
    pub pair_name: String,
    pub a_mint: String,
    pub slippage_bps: u16,
    pub provider: &'static str,
}

pub const QUOTE_CACHE_TTL: Duration = Duration::from_millis(250);
pub const FEE_CONVERSION_TTL: Duration = Duration::from_secs(60);
pub const FEE_CONVERSION_TTL_FLOOR: Duration = Duration::from_secs(10);

/// Fee-conversion entries must outlive the pair's cooldown so a cooling pair
/// does not re-spend quote budget just to reprice fees.
pub fn fee_conversion_ttl(pair_cooldown: Duration) -> Duration {
    FEE_CONVERSION_TTL.max(FEE_CONVERSION_TTL_FLOOR).max(pair_cooldown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn coalesces_concurrent_fetches() {
        let cache: Arc<CoalescingCache<&'static str, u32>> = Arc::new(CoalescingCache::new());
        let fetches = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let fetches = fetches.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("k", Duration::from_secs(5), move || async move {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(42u32)
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 42);
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_evicted() {
        let cache: CoalescingCache<&'static str, u32> = CoalescingCache::new();
        let fetches = Arc::new(AtomicU32::new(0));

        let f = fetches.clone();
        let first = cache
            .get_or_fetch("k", Duration::from_secs(5), move || async move {
                f.fetch_add(1, Ordering::SeqCst);
                Err::<u32, _>(ArbError::TimeoutError("upstream".into()))
            })
            .await;
        assert!(first.is_err());

        let f = fetches.clone();
        let second = cache
            .get_or_fetch("k", Duration::from_secs(5), move || async move {
                f.fetch_add(1, Ordering::SeqCst);
                Ok(7u32)
            })
            .await;
        assert_eq!(second.unwrap(), 7);
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expired_entries_refetch() {
        let cache: CoalescingCache<&'static str, u32> = CoalescingCache::new();
        let fetches = Arc::new(AtomicU32::new(0));

        for expected in [1u32, 2] {
            let f = fetches.clone();
            let got = cache
                .get_or_fetch("k", Duration::ZERO, move || async move {
                    Ok(f.fetch_add(1, Ordering::SeqCst) + 1)
                })
                .await
                .unwrap();
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn quote_key_sorts_venue_filters() {
        let req = crate::aggregator::QuoteRequest {
            input_mint: "A".into(),
            output_mint: "B".into(),
            amount: 10,
            slippage_bps: 50,
            include_dexes: Some(vec!["Whirlpool".into(), "Meteora".into()]),
            exclude_dexes: None,
        };
        let mut flipped = req.clone();
        flipped.include_dexes = Some(vec!["Meteora".into(), "Whirlpool".into()]);
        assert_eq!(QuoteKey::new(&req), QuoteKey::new(&flipped));
    }

    #[test]
    fn fee_conversion_ttl_respects_cooldown() {
        assert_eq!(fee_conversion_ttl(Duration::ZERO), Duration::from_secs(60));
        assert_eq!(
            fee_conversion_ttl(Duration::from_secs(300)),
            Duration::from_secs(300)
        );
    }
}
