//! Latency-first location cache.
//!
//! Holds a single most-recent position for the whole process. A fresh entry
//! is served immediately while a high-accuracy refresh runs in the
//! background; otherwise a best-effort fetch (last known, then current) is
//! made inline.
//!
//! # Concurrency
//!
//! - The slot is replaced wholesale; readers always receive a copy.
//! - At most one background refresh is in flight. Triggers that arrive while
//!   one is running are dropped, not queued.
//! - The persisted entry is loaded once, lazily, before the first freshness
//!   check.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::location::{fetch_guarded, FetchRequest, LocationProvider, PermissionStatus};
use crate::storage::{KeyValueStore, StorageResult};
use crate::types::{AccuracyTier, Coordinate, LocationSample};

/// Storage key of the persisted entry.
pub const CACHE_KEY: &str = "location_cache";

/// Default maximum age of a cached entry served without a fetch.
pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Default maximum age accepted from the provider's last-known fix.
pub const DEFAULT_LAST_KNOWN_MAX_AGE: Duration = Duration::from_secs(15 * 60);

/// Default timeout for a single provider fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Tuning for [`LocationCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    /// Maximum entry age served without fetching.
    pub freshness_window: Duration,
    /// Maximum age accepted for a last-known fix.
    pub last_known_max_age: Duration,
    /// Timeout applied to each provider call.
    pub fetch_timeout: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            freshness_window: DEFAULT_FRESHNESS_WINDOW,
            last_known_max_age: DEFAULT_LAST_KNOWN_MAX_AGE,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

/// The cached position and when it was stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The cached fix.
    pub sample: LocationSample,
    /// When the fix entered the cache.
    pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Whether the entry is younger than `window` at `now`.
    #[must_use]
    pub fn is_fresh_at(&self, now: DateTime<Utc>, window: Duration) -> bool {
        (now - self.cached_at)
            .to_std()
            .map_or(true, |age| age < window)
    }
}

/// Background refresh state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RefreshState {
    Idle = 0,
    Refreshing = 1,
}

/// Resets the refresh state when the refresh task ends, even on panic.
struct RefreshGuard<'a>(&'a AtomicU8);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(RefreshState::Idle as u8, Ordering::Release);
    }
}

/// Single-slot location cache. Cloning yields another handle to the same
/// cache.
#[derive(Clone)]
pub struct LocationCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    provider: Arc<dyn LocationProvider>,
    store: Arc<dyn KeyValueStore>,
    settings: CacheSettings,
    slot: RwLock<Option<CacheEntry>>,
    loaded: OnceCell<()>,
    refresh: AtomicU8,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LocationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationCache")
            .field("settings", &self.inner.settings)
            .field("entry", &self.read_slot())
            .field("refreshing", &self.is_refreshing())
            .finish_non_exhaustive()
    }
}

impl LocationCache {
    /// Create a cache over a provider and a persistent store.
    #[must_use]
    pub fn new(
        provider: Arc<dyn LocationProvider>,
        store: Arc<dyn KeyValueStore>,
        settings: CacheSettings,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                provider,
                store,
                settings,
                slot: RwLock::new(None),
                loaded: OnceCell::new(),
                refresh: AtomicU8::new(RefreshState::Idle as u8),
                refresh_task: Mutex::new(None),
            }),
        }
    }

    /// The settings this cache was built with.
    #[must_use]
    pub fn settings(&self) -> CacheSettings {
        self.inner.settings
    }

    /// Best position available without waiting for a fresh fix.
    ///
    /// A fresh entry is returned immediately and a background refresh is
    /// started. Otherwise one inline fetch is attempted: last known first,
    /// then a high-accuracy fix. Returns `None` only when both fail or
    /// permission is not granted.
    pub async fn get_fast(&self) -> Option<Coordinate> {
        self.ensure_loaded().await;

        if let Some(entry) = self.read_slot() {
            if entry.is_fresh_at(Utc::now(), self.inner.settings.freshness_window) {
                debug!(cached_at = %entry.cached_at, "Serving cached location");
                self.refresh_in_background();
                return Some(entry.sample.coordinate());
            }
            debug!(cached_at = %entry.cached_at, "Cached location is stale");
        }

        self.fetch_inline().await.map(|sample| sample.coordinate())
    }

    /// Copy of the current entry, without fetching.
    pub async fn peek(&self) -> Option<CacheEntry> {
        self.ensure_loaded().await;
        self.read_slot()
    }

    /// Current provider permission.
    pub async fn permission(&self) -> PermissionStatus {
        self.inner.provider.permission().await
    }

    /// Whether a background refresh is in flight.
    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.inner.refresh.load(Ordering::Acquire) == RefreshState::Refreshing as u8
    }

    /// Start a background high-accuracy refresh unless one is running.
    ///
    /// Returns `true` if a refresh was started.
    pub fn refresh_in_background(&self) -> bool {
        // Held until the handle is stored so `settle` never sees a stale one.
        let mut task = self
            .inner
            .refresh_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if self
            .inner
            .refresh
            .compare_exchange(
                RefreshState::Idle as u8,
                RefreshState::Refreshing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!("Location refresh already in flight");
            return false;
        }

        let cache = self.clone();
        *task = Some(tokio::spawn(async move {
            let _guard = RefreshGuard(&cache.inner.refresh);
            cache.run_refresh().await;
        }));
        true
    }

    /// Wait until no background refresh is in flight.
    pub async fn settle(&self) {
        loop {
            let handle = self
                .inner
                .refresh_task
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            let Some(handle) = handle else {
                return;
            };
            if let Err(e) = handle.await {
                warn!(error = %e, "Location refresh task ended abnormally");
            }
        }
    }

    /// Drop the cached entry and its persisted copy.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted entry cannot be deleted.
    pub async fn clear(&self) -> StorageResult<()> {
        self.ensure_loaded().await;
        *self
            .inner
            .slot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.inner.store.delete(CACHE_KEY)
    }

    async fn ensure_loaded(&self) {
        self.inner
            .loaded
            .get_or_init(|| async {
                let entry = match self.inner.store.get(CACHE_KEY) {
                    Ok(Some(bytes)) => match serde_json::from_slice::<CacheEntry>(&bytes) {
                        Ok(entry) => Some(entry),
                        Err(e) => {
                            warn!(error = %e, "Ignoring unreadable persisted location");
                            None
                        }
                    },
                    Ok(None) => None,
                    Err(e) => {
                        warn!(error = %e, "Failed to load persisted location");
                        None
                    }
                };

                if let Some(entry) = entry {
                    info!(cached_at = %entry.cached_at, "Restored persisted location");
                    let mut slot = self
                        .inner
                        .slot
                        .write()
                        .unwrap_or_else(PoisonError::into_inner);
                    if slot.is_none() {
                        *slot = Some(entry);
                    }
                }
            })
            .await;
    }

    async fn fetch_inline(&self) -> Option<LocationSample> {
        let provider = &self.inner.provider;
        let permission = match provider.permission().await {
            PermissionStatus::Undetermined => provider.request_permission().await,
            status => status,
        };
        if permission != PermissionStatus::Granted {
            debug!(?permission, "Location permission not granted");
            return None;
        }

        let timeout = self.inner.settings.fetch_timeout;
        let last_known = FetchRequest::LastKnown(self.inner.settings.last_known_max_age);
        match fetch_guarded(provider, last_known, timeout).await {
            Ok(sample) => {
                self.store_sample(sample.clone());
                // A last-known fix may be old; chase a better one.
                self.refresh_in_background();
                return Some(sample);
            }
            Err(e) => debug!(error = %e, "No last-known location"),
        }

        match fetch_guarded(provider, FetchRequest::Current(AccuracyTier::High), timeout).await {
            Ok(sample) => {
                self.store_sample(sample.clone());
                Some(sample)
            }
            Err(e) => {
                warn!(error = %e, "Unable to obtain a location fix");
                None
            }
        }
    }

    async fn run_refresh(&self) {
        let provider = &self.inner.provider;
        if provider.permission().await != PermissionStatus::Granted {
            debug!("Skipping location refresh without permission");
            return;
        }

        let request = FetchRequest::Current(AccuracyTier::High);
        match fetch_guarded(provider, request, self.inner.settings.fetch_timeout).await {
            Ok(sample) => {
                debug!(lat = sample.lat, lng = sample.lng, "Background location refresh complete");
                self.store_sample(sample);
            }
            Err(e) => warn!(error = %e, "Background location refresh failed"),
        }
    }

    fn read_slot(&self) -> Option<CacheEntry> {
        self.inner
            .slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store_sample(&self, sample: LocationSample) {
        let entry = CacheEntry {
            sample,
            cached_at: Utc::now(),
        };

        match serde_json::to_vec(&entry) {
            Ok(bytes) => {
                if let Err(e) = self.inner.store.set(CACHE_KEY, &bytes) {
                    warn!(error = %e, "Failed to persist cached location");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize cached location"),
        }

        *self
            .inner
            .slot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::{LocationError, MockLocationProvider};
    use crate::storage::{FileStore, MemoryStore};
    use tempfile::TempDir;

    const A: Coordinate = Coordinate::new(28.6139, 77.2090);
    const B: Coordinate = Coordinate::new(28.6200, 77.2100);

    fn settings() -> CacheSettings {
        CacheSettings {
            fetch_timeout: Duration::from_secs(1),
            ..CacheSettings::default()
        }
    }

    fn cache_with(
        provider: &Arc<MockLocationProvider>,
        store: Arc<dyn KeyValueStore>,
    ) -> LocationCache {
        LocationCache::new(
            Arc::clone(provider) as Arc<dyn LocationProvider>,
            store,
            settings(),
        )
    }

    fn persisted(store: &MemoryStore, coordinate: Coordinate, cached_at: DateTime<Utc>) {
        let entry = CacheEntry {
            sample: LocationSample::now(coordinate, Some(5.0)),
            cached_at,
        };
        store
            .set(CACHE_KEY, &serde_json::to_vec(&entry).unwrap())
            .unwrap();
    }

    async fn let_tasks_run() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_fresh_entry_is_served_identically_and_refresh_coalesces() {
        let store = Arc::new(MemoryStore::new());
        persisted(&store, A, Utc::now());

        let provider = Arc::new(MockLocationProvider::new());
        provider.set_current(Ok(LocationSample::now(B, Some(3.0))));
        provider.hold_current();
        let cache = cache_with(&provider, store);

        assert_eq!(cache.get_fast().await, Some(A));
        assert_eq!(cache.get_fast().await, Some(A));
        let_tasks_run().await;

        assert!(cache.is_refreshing());
        assert_eq!(provider.current_calls(), 1);
        assert_eq!(provider.last_known_calls(), 0);

        provider.release_current();
        cache.settle().await;

        assert!(!cache.is_refreshing());
        assert_eq!(cache.get_fast().await, Some(B));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_settle_covers_refreshes_triggered_concurrently() {
        let provider = Arc::new(MockLocationProvider::new());
        provider.set_current(Ok(LocationSample::now(B, Some(3.0))));
        let cache = cache_with(&provider, Arc::new(MemoryStore::new()));

        for round in 0..200 {
            let triggers: Vec<_> = (0..4)
                .map(|_| {
                    let cache = cache.clone();
                    tokio::spawn(async move { cache.refresh_in_background() })
                })
                .collect();
            for trigger in triggers {
                trigger.await.unwrap();
            }

            cache.settle().await;
            assert!(!cache.is_refreshing(), "refresh still running after settle in round {round}");
        }

        assert!(provider.current_calls() >= 200);
        assert_eq!(cache.peek().await.map(|e| e.sample.coordinate()), Some(B));
    }

    #[tokio::test]
    async fn test_empty_cache_uses_last_known() {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockLocationProvider::new());
        provider.set_last_known(Ok(LocationSample::now(A, Some(50.0))));
        provider.set_current(Err(LocationError::Timeout { timeout_ms: 1 }));
        let cache = cache_with(&provider, store.clone());

        assert_eq!(cache.get_fast().await, Some(A));
        assert_eq!(provider.last_known_calls(), 1);
        assert!(store.get(CACHE_KEY).unwrap().is_some());

        // The follow-up refresh fails quietly and leaves the entry alone.
        cache.settle().await;
        assert_eq!(cache.peek().await.map(|e| e.sample.coordinate()), Some(A));
    }

    #[tokio::test]
    async fn test_falls_back_to_current_fix() {
        let provider = Arc::new(MockLocationProvider::new());
        provider.set_last_known(Err(LocationError::Unavailable("none".into())));
        provider.set_current(Ok(LocationSample::now(B, Some(4.0))));
        let cache = cache_with(&provider, Arc::new(MemoryStore::new()));

        assert_eq!(cache.get_fast().await, Some(B));
        assert_eq!(provider.current_calls(), 1);
    }

    #[tokio::test]
    async fn test_none_when_every_fetch_fails() {
        let provider = Arc::new(MockLocationProvider::new());
        let cache = cache_with(&provider, Arc::new(MemoryStore::new()));

        assert_eq!(cache.get_fast().await, None);
        assert_eq!(cache.peek().await, None);
    }

    #[tokio::test]
    async fn test_none_when_permission_denied() {
        let provider = Arc::new(MockLocationProvider::new());
        provider.set_permission(PermissionStatus::Denied, PermissionStatus::Denied);
        provider.set_last_known(Ok(LocationSample::now(A, None)));
        let cache = cache_with(&provider, Arc::new(MemoryStore::new()));

        assert_eq!(cache.get_fast().await, None);
        assert_eq!(provider.last_known_calls(), 0);
    }

    #[tokio::test]
    async fn test_undetermined_permission_is_requested() {
        let provider = Arc::new(MockLocationProvider::new());
        provider.set_permission(PermissionStatus::Undetermined, PermissionStatus::Granted);
        provider.set_last_known(Ok(LocationSample::now(A, None)));
        let cache = cache_with(&provider, Arc::new(MemoryStore::new()));

        assert_eq!(cache.get_fast().await, Some(A));
        assert_eq!(cache.permission().await, PermissionStatus::Granted);
    }

    #[tokio::test]
    async fn test_stale_entry_is_not_served() {
        let store = Arc::new(MemoryStore::new());
        persisted(&store, A, Utc::now() - chrono::Duration::minutes(10));

        let provider = Arc::new(MockLocationProvider::new());
        provider.set_last_known(Ok(LocationSample::now(B, None)));
        let cache = cache_with(&provider, store);

        assert_eq!(cache.get_fast().await, Some(B));
        assert_eq!(provider.last_known_calls(), 1);
    }

    #[tokio::test]
    async fn test_entry_survives_restart() {
        let dir = TempDir::new().unwrap();

        let provider = Arc::new(MockLocationProvider::new());
        provider.set_last_known(Ok(LocationSample::now(A, None)));
        let first = cache_with(&provider, Arc::new(FileStore::new(dir.path())));
        assert_eq!(first.get_fast().await, Some(A));
        first.settle().await;

        let offline = Arc::new(MockLocationProvider::new());
        let second = cache_with(&offline, Arc::new(FileStore::new(dir.path())));
        assert_eq!(second.get_fast().await, Some(A));
        assert_eq!(offline.last_known_calls(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_persisted_entry_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        store.set(CACHE_KEY, b"not json").unwrap();

        let provider = Arc::new(MockLocationProvider::new());
        let cache = cache_with(&provider, store);
        assert_eq!(cache.peek().await, None);
    }

    #[tokio::test]
    async fn test_clear_removes_persisted_entry() {
        let store = Arc::new(MemoryStore::new());
        persisted(&store, A, Utc::now());

        let provider = Arc::new(MockLocationProvider::new());
        let cache = cache_with(&provider, store.clone());
        assert!(cache.peek().await.is_some());

        cache.clear().await.unwrap();
        assert_eq!(cache.peek().await, None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_entry_freshness() {
        let now = Utc::now();
        let entry = CacheEntry {
            sample: LocationSample::now(A, None),
            cached_at: now - chrono::Duration::seconds(299),
        };
        assert!(entry.is_fresh_at(now, DEFAULT_FRESHNESS_WINDOW));
        assert!(!entry.is_fresh_at(now + chrono::Duration::seconds(1), DEFAULT_FRESHNESS_WINDOW));
    }
}
