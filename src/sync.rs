use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::api::RateSource;
use crate::cache::{History, KeyValueStore, RateCache};
use crate::error::{Error, Result};
use crate::models::{Generation, RateRecord, Snapshot};

/// Fetches fresh rates, merges them into the cache and composes the snapshot
/// the board renders.
pub struct Synchronizer<R, S> {
    source: R,
    cache: RateCache<S>,
    in_flight: Mutex<()>,
}

impl<R: RateSource, S: KeyValueStore> Synchronizer<R, S> {
    pub fn new(source: R, store: S) -> Self {
        Self {
            source,
            cache: RateCache::new(store),
            in_flight: Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &RateCache<S> {
        &self.cache
    }

    /// Fetch, merge and return the current board. Falls back to the cached
    /// generations when the fetch fails; errors only when there is nothing to
    /// show at all.
    ///
    /// Overlapping calls run one at a time.
    pub async fn refresh(&self) -> Result<Snapshot> {
        let _guard = self.in_flight.lock().await;
        let baseline = self.cache.history().await;

        match self.source.fetch_rates().await {
            Ok(rates) => {
                let changed = self.cache.merge(&rates).await;
                debug!(changed, "merged fetched rates");
                let merged = self.cache.history().await;
                Ok(compose_fetched(&merged, rates))
            }
            Err(e) => {
                warn!(error = %e, "Rate fetch failed, using cache");
                compose(&baseline)
            }
        }
    }

    /// The cached board, without touching the network.
    pub async fn cached_snapshot(&self) -> Result<Snapshot> {
        compose(&self.cache.history().await)
    }
}

fn compose(history: &History) -> Result<Snapshot> {
    let current = history.current().ok_or(Error::NoData)?;
    Ok(Snapshot::from_generations(current, history.previous()))
}

// If the merge could not be persisted the fetched rates are still shown.
fn compose_fetched(history: &History, fetched: Vec<RateRecord>) -> Snapshot {
    match history.current() {
        Some(current) => Snapshot::from_generations(current, history.previous()),
        None => Snapshot::from_generations(&Generation::new(fetched, Utc::now()), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::error::{SourceError, StoreError};
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    /// Source that replays a script of responses, failing once exhausted.
    struct ScriptedSource {
        script: Mutex<VecDeque<std::result::Result<Vec<RateRecord>, SourceError>>>,
        delay: Duration,
    }

    impl ScriptedSource {
        fn new(
            script: impl IntoIterator<Item = std::result::Result<Vec<RateRecord>, SourceError>>,
        ) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl RateSource for ScriptedSource {
        async fn fetch_rates(&self) -> std::result::Result<Vec<RateRecord>, SourceError> {
            let next = self.script.lock().await.pop_front();
            tokio::time::sleep(self.delay).await;
            next.unwrap_or(Err(SourceError::Empty))
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl KeyValueStore for BrokenStore {
        async fn get(&self, _key: &str) -> std::result::Result<Option<String>, StoreError> {
            Err(std::io::Error::other("unreadable").into())
        }

        async fn set_many(&self, _entries: &[(&str, String)]) -> std::result::Result<(), StoreError> {
            Err(std::io::Error::other("read-only").into())
        }

        async fn remove_many(&self, _keys: &[&str]) -> std::result::Result<(), StoreError> {
            Err(std::io::Error::other("read-only").into())
        }
    }

    fn gold(prices: &[(&str, u64)]) -> Vec<RateRecord> {
        prices
            .iter()
            .map(|(code, price)| RateRecord::new(*code, format!("Au {code}"), *price))
            .collect()
    }

    fn offline() -> std::result::Result<Vec<RateRecord>, SourceError> {
        Err(SourceError::Status(StatusCode::SERVICE_UNAVAILABLE))
    }

    #[tokio::test]
    async fn failing_fetch_with_empty_cache_is_no_data() {
        let sync = Synchronizer::new(ScriptedSource::new([offline()]), MemoryStore::new());

        assert!(matches!(sync.refresh().await, Err(Error::NoData)));
    }

    #[tokio::test]
    async fn first_fetch_has_no_previous() {
        let rates = gold(&[("999", 41000)]);
        let sync = Synchronizer::new(ScriptedSource::new([Ok(rates.clone())]), MemoryStore::new());

        let snap = sync.refresh().await.unwrap();
        assert_eq!(snap.current, rates);
        assert!(snap.previous.is_empty());
        assert_eq!(snap.previous_updated, None);
    }

    #[tokio::test]
    async fn failing_fetch_returns_cached_snapshot_unchanged() {
        let sync = Synchronizer::new(
            ScriptedSource::new([
                Ok(gold(&[("999", 41000)])),
                Ok(gold(&[("999", 41500)])),
                offline(),
            ]),
            MemoryStore::new(),
        );
        sync.refresh().await.unwrap();
        let online = sync.refresh().await.unwrap();

        let cached = sync.refresh().await.unwrap();
        assert_eq!(cached, online);
    }

    #[tokio::test]
    async fn changed_rates_expose_previous_generation() {
        let old = gold(&[("999", 41000), ("585", 24000)]);
        let new = gold(&[("999", 41500), ("585", 24000)]);
        let sync = Synchronizer::new(
            ScriptedSource::new([Ok(old.clone()), Ok(new.clone())]),
            MemoryStore::new(),
        );

        let first = sync.refresh().await.unwrap();
        let second = sync.refresh().await.unwrap();

        assert_eq!(second.current, new);
        assert_eq!(second.previous, old);
        assert_eq!(second.previous_updated, Some(first.last_updated));
    }

    #[tokio::test]
    async fn unchanged_rates_keep_timestamps() {
        let rates = gold(&[("999", 41000)]);
        let sync = Synchronizer::new(
            ScriptedSource::new([Ok(rates.clone()), Ok(rates.clone())]),
            MemoryStore::new(),
        );

        let first = sync.refresh().await.unwrap();
        let second = sync.refresh().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn unwritable_store_still_shows_fetched_rates() {
        let rates = gold(&[("999", 41000)]);
        let sync = Synchronizer::new(ScriptedSource::new([Ok(rates.clone())]), BrokenStore);

        let snap = sync.refresh().await.unwrap();
        assert_eq!(snap.current, rates);
        assert!(snap.previous.is_empty());
    }

    #[tokio::test]
    async fn cached_snapshot_does_not_fetch() {
        let sync = Synchronizer::new(ScriptedSource::new([offline()]), MemoryStore::new());
        assert!(matches!(sync.cached_snapshot().await, Err(Error::NoData)));

        sync.cache().merge(&gold(&[("585", 24000)])).await;
        let snap = sync.cached_snapshot().await.unwrap();
        assert_eq!(snap.current, gold(&[("585", 24000)]));
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_refreshes_rotate_once_per_change() {
        let old = gold(&[("999", 41000)]);
        let new = gold(&[("999", 41500)]);
        let mut source = ScriptedSource::new([Ok(old.clone()), Ok(new.clone()), Ok(new.clone())]);
        source.delay = Duration::from_millis(50);
        let sync = Arc::new(Synchronizer::new(source, MemoryStore::new()));
        sync.refresh().await.unwrap();

        let a = tokio::spawn({
            let sync = Arc::clone(&sync);
            async move { sync.refresh().await }
        });
        let b = tokio::spawn({
            let sync = Arc::clone(&sync);
            async move { sync.refresh().await }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let history = sync.cache().history().await;
        assert_eq!(history.current().unwrap().rates, new);
        assert_eq!(history.previous().unwrap().rates, old);
    }
}
