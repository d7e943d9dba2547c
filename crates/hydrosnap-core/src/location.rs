//! Location provider collaborator.
//!
//! The core never talks to positioning hardware directly. It consumes a
//! [`LocationProvider`] offering a near-instant "last known" fix and a
//! slower "current" fix at a chosen [`AccuracyTier`], both fallible.
//!
//! All core calls go through [`fetch_guarded`], which enforces a timeout and
//! converts a panicking provider into [`LocationError::Provider`] so provider
//! faults never cross the core boundary raw.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;
use utoipa::ToSchema;

use crate::types::{AccuracyTier, LocationSample};

/// Errors reported by location providers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocationError {
    /// The user has not granted location access.
    #[error("Location permission denied")]
    PermissionDenied,

    /// No fix arrived within the allowed time.
    #[error("Location fix timed out after {timeout_ms} ms")]
    Timeout {
        /// How long the fetch waited.
        timeout_ms: u64,
    },

    /// The provider has no fix to offer.
    #[error("Location unavailable: {0}")]
    Unavailable(String),

    /// The provider failed unexpectedly.
    #[error("Location provider error: {0}")]
    Provider(String),
}

/// Result type alias for location operations.
pub type LocationResult<T> = std::result::Result<T, LocationError>;

/// Location permission state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    /// Location may be read.
    Granted,
    /// The user refused access.
    Denied,
    /// The user has not been asked yet.
    #[default]
    Undetermined,
}

/// Source of device positions.
#[async_trait]
pub trait LocationProvider: Send + Sync + 'static {
    /// Current permission state, without prompting.
    async fn permission(&self) -> PermissionStatus;

    /// Ask for permission if it is undetermined.
    async fn request_permission(&self) -> PermissionStatus {
        self.permission().await
    }

    /// Last fix known to the provider, if not older than `max_age`.
    async fn last_known(&self, max_age: Duration) -> LocationResult<LocationSample>;

    /// A fresh fix at the requested accuracy.
    async fn current(&self, accuracy: AccuracyTier) -> LocationResult<LocationSample>;
}

/// The two kinds of fix the core asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchRequest {
    /// [`LocationProvider::last_known`] bounded by a maximum age.
    LastKnown(Duration),
    /// [`LocationProvider::current`] at an accuracy tier.
    Current(AccuracyTier),
}

/// Fetch a fix with a timeout, isolating provider panics.
///
/// The provider call runs on its own task; a panic there surfaces as
/// [`LocationError::Provider`] and a slow call as [`LocationError::Timeout`].
pub async fn fetch_guarded(
    provider: &Arc<dyn LocationProvider>,
    request: FetchRequest,
    timeout: Duration,
) -> LocationResult<LocationSample> {
    let provider = Arc::clone(provider);
    let mut task = AbortOnDrop(tokio::spawn(async move {
        match request {
            FetchRequest::LastKnown(max_age) => provider.last_known(max_age).await,
            FetchRequest::Current(tier) => provider.current(tier).await,
        }
    }));

    match tokio::time::timeout(timeout, &mut task.0).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => {
            warn!(?request, error = %join_error, "Location provider task failed");
            Err(LocationError::Provider(join_error.to_string()))
        }
        Err(_) => {
            Err(LocationError::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })
        }
    }
}

/// Aborts the provider call when the fetch is dropped or times out.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Provider fed by fixes the field device reports in.
///
/// Used where positions arrive over the network rather than from local
/// hardware: the latest report is kept, `last_known` serves it within its
/// age bound, and `current` serves it if recent enough or otherwise waits
/// for the next report.
#[derive(Debug)]
pub struct ReportedLocationProvider {
    latest: watch::Sender<Option<LocationSample>>,
    permission: std::sync::RwLock<PermissionStatus>,
    fresh_within: Duration,
}

impl ReportedLocationProvider {
    /// Create a provider that treats reports younger than `fresh_within` as
    /// current.
    #[must_use]
    pub fn new(fresh_within: Duration) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            latest,
            permission: std::sync::RwLock::new(PermissionStatus::Granted),
            fresh_within,
        }
    }

    /// Record a new fix from the device.
    pub fn report(&self, sample: LocationSample) {
        self.latest.send_replace(Some(sample));
    }

    /// Update the permission state reported by the device.
    pub fn set_permission(&self, status: PermissionStatus) {
        *self
            .permission
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = status;
    }

    /// Latest reported fix, regardless of age.
    #[must_use]
    pub fn latest(&self) -> Option<LocationSample> {
        self.latest.borrow().clone()
    }

    fn permission_now(&self) -> PermissionStatus {
        *self
            .permission
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn ensure_granted(&self) -> LocationResult<()> {
        match self.permission_now() {
            PermissionStatus::Granted => Ok(()),
            _ => Err(LocationError::PermissionDenied),
        }
    }

    fn within(sample: &LocationSample, max_age: Duration) -> bool {
        sample
            .age_at(Utc::now())
            .to_std()
            .is_ok_and(|age| age <= max_age)
    }
}

#[async_trait]
impl LocationProvider for ReportedLocationProvider {
    async fn permission(&self) -> PermissionStatus {
        self.permission_now()
    }

    async fn last_known(&self, max_age: Duration) -> LocationResult<LocationSample> {
        self.ensure_granted()?;
        match self.latest() {
            Some(sample) if Self::within(&sample, max_age) => Ok(sample),
            Some(_) => Err(LocationError::Unavailable(
                "last reported fix is too old".to_string(),
            )),
            None => Err(LocationError::Unavailable("no fix reported yet".to_string())),
        }
    }

    async fn current(&self, _accuracy: AccuracyTier) -> LocationResult<LocationSample> {
        self.ensure_granted()?;
        let mut rx = self.latest.subscribe();
        if let Some(sample) = rx.borrow_and_update().clone() {
            if Self::within(&sample, self.fresh_within) {
                return Ok(sample);
            }
        }

        rx.changed()
            .await
            .map_err(|e| LocationError::Provider(e.to_string()))?;
        let next = rx.borrow_and_update().clone();
        next.ok_or_else(|| LocationError::Unavailable("fix report was cleared".to_string()))
    }
}

#[cfg(any(test, feature = "mock-location"))]
pub use mock::MockLocationProvider;

#[cfg(any(test, feature = "mock-location"))]
mod mock {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::watch;

    use super::{LocationError, LocationProvider, LocationResult, PermissionStatus};
    use crate::types::{AccuracyTier, LocationSample};

    /// Scripted provider for tests.
    ///
    /// `current` pops queued results, then repeats the fallback result.
    /// It can be held shut to simulate a slow GNSS fix.
    #[derive(Debug)]
    pub struct MockLocationProvider {
        script: Mutex<Script>,
        gate: watch::Sender<bool>,
        last_known_calls: AtomicUsize,
        current_calls: AtomicUsize,
    }

    #[derive(Debug)]
    struct Script {
        permission: PermissionStatus,
        permission_on_request: PermissionStatus,
        last_known: LocationResult<LocationSample>,
        queued: VecDeque<LocationResult<LocationSample>>,
        fallback: LocationResult<LocationSample>,
        panic_on_current: bool,
    }

    impl Default for MockLocationProvider {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockLocationProvider {
        /// A provider with permission granted and no fixes.
        #[must_use]
        pub fn new() -> Self {
            let unavailable = || Err(LocationError::Unavailable("mock has no fix".to_string()));
            let (gate, _) = watch::channel(true);
            Self {
                script: Mutex::new(Script {
                    permission: PermissionStatus::Granted,
                    permission_on_request: PermissionStatus::Granted,
                    last_known: unavailable(),
                    queued: VecDeque::new(),
                    fallback: unavailable(),
                    panic_on_current: false,
                }),
                gate,
                last_known_calls: AtomicUsize::new(0),
                current_calls: AtomicUsize::new(0),
            }
        }

        fn script(&self) -> std::sync::MutexGuard<'_, Script> {
            self.script
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
        }

        /// Set the permission state and what a permission request resolves to.
        pub fn set_permission(&self, now: PermissionStatus, on_request: PermissionStatus) {
            let mut script = self.script();
            script.permission = now;
            script.permission_on_request = on_request;
        }

        /// Set the result of every `last_known` call.
        pub fn set_last_known(&self, result: LocationResult<LocationSample>) {
            self.script().last_known = result;
        }

        /// Queue a one-shot result for `current`.
        pub fn push_current(&self, result: LocationResult<LocationSample>) {
            self.script().queued.push_back(result);
        }

        /// Set the result `current` returns once the queue is empty.
        pub fn set_current(&self, result: LocationResult<LocationSample>) {
            self.script().fallback = result;
        }

        /// Make `current` panic.
        pub fn panic_on_current(&self) {
            self.script().panic_on_current = true;
        }

        /// Block `current` calls until [`Self::release_current`].
        pub fn hold_current(&self) {
            self.gate.send_replace(false);
        }

        /// Let blocked and future `current` calls proceed.
        pub fn release_current(&self) {
            self.gate.send_replace(true);
        }

        /// Number of `last_known` calls so far.
        pub fn last_known_calls(&self) -> usize {
            self.last_known_calls.load(Ordering::SeqCst)
        }

        /// Number of `current` calls so far.
        pub fn current_calls(&self) -> usize {
            self.current_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LocationProvider for MockLocationProvider {
        async fn permission(&self) -> PermissionStatus {
            self.script().permission
        }

        async fn request_permission(&self) -> PermissionStatus {
            let mut script = self.script();
            if script.permission == PermissionStatus::Undetermined {
                script.permission = script.permission_on_request;
            }
            script.permission
        }

        async fn last_known(&self, _max_age: Duration) -> LocationResult<LocationSample> {
            self.last_known_calls.fetch_add(1, Ordering::SeqCst);
            self.script().last_known.clone()
        }

        async fn current(&self, _accuracy: AccuracyTier) -> LocationResult<LocationSample> {
            self.current_calls.fetch_add(1, Ordering::SeqCst);

            let mut gate = self.gate.subscribe();
            if gate.wait_for(|open| *open).await.is_err() {
                return Err(LocationError::Provider("mock gate closed".to_string()));
            }

            let mut script = self.script();
            assert!(!script.panic_on_current, "mock provider panic");
            script
                .queued
                .pop_front()
                .unwrap_or_else(|| script.fallback.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Coordinate;

    fn sample(lat: f64) -> LocationSample {
        LocationSample::now(Coordinate::new(lat, 77.0), Some(5.0))
    }

    fn as_dyn<P: LocationProvider>(provider: &Arc<P>) -> Arc<dyn LocationProvider> {
        Arc::clone(provider) as Arc<dyn LocationProvider>
    }

    #[tokio::test]
    async fn test_fetch_guarded_passes_results_through() {
        let mock = Arc::new(MockLocationProvider::new());
        mock.set_current(Ok(sample(28.0)));
        mock.set_last_known(Err(LocationError::PermissionDenied));

        let provider = as_dyn(&mock);
        let fix = fetch_guarded(
            &provider,
            FetchRequest::Current(AccuracyTier::High),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(fix.lat, 28.0);

        let err = fetch_guarded(
            &provider,
            FetchRequest::LastKnown(Duration::from_secs(60)),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert_eq!(err, LocationError::PermissionDenied);
    }

    #[tokio::test]
    async fn test_fetch_guarded_times_out() {
        let mock = Arc::new(MockLocationProvider::new());
        mock.hold_current();

        let err = fetch_guarded(
            &as_dyn(&mock),
            FetchRequest::Current(AccuracyTier::High),
            Duration::from_millis(20),
        )
        .await
        .unwrap_err();
        assert_eq!(err, LocationError::Timeout { timeout_ms: 20 });
    }

    #[tokio::test]
    async fn test_fetch_guarded_converts_panics() {
        let mock = Arc::new(MockLocationProvider::new());
        mock.panic_on_current();

        let err = fetch_guarded(
            &as_dyn(&mock),
            FetchRequest::Current(AccuracyTier::High),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LocationError::Provider(_)));
    }

    #[tokio::test]
    async fn test_reported_provider_last_known_respects_age() {
        let provider = ReportedLocationProvider::new(Duration::from_secs(10));
        assert!(matches!(
            provider.last_known(Duration::from_secs(60)).await,
            Err(LocationError::Unavailable(_))
        ));

        let mut old = sample(28.0);
        old.captured_at = Utc::now() - chrono::Duration::minutes(10);
        provider.report(old);
        assert!(provider.last_known(Duration::from_secs(60)).await.is_err());
        assert!(provider.last_known(Duration::from_secs(3600)).await.is_ok());
    }

    #[tokio::test]
    async fn test_reported_provider_current_serves_fresh_fix() {
        let provider = ReportedLocationProvider::new(Duration::from_secs(10));
        provider.report(sample(28.5));

        let fix = provider.current(AccuracyTier::High).await.unwrap();
        assert_eq!(fix.lat, 28.5);
    }

    #[tokio::test]
    async fn test_reported_provider_current_waits_for_next_report() {
        let provider = Arc::new(ReportedLocationProvider::new(Duration::from_secs(10)));
        let waiter = {
            let provider = Arc::clone(&provider);
            tokio::spawn(async move { provider.current(AccuracyTier::High).await })
        };

        tokio::task::yield_now().await;
        provider.report(sample(29.0));

        let fix = waiter.await.unwrap().unwrap();
        assert_eq!(fix.lat, 29.0);
    }

    #[tokio::test]
    async fn test_reported_provider_permission() {
        let provider = ReportedLocationProvider::new(Duration::from_secs(10));
        provider.report(sample(28.0));
        provider.set_permission(PermissionStatus::Denied);

        assert_eq!(provider.permission().await, PermissionStatus::Denied);
        assert_eq!(
            provider.current(AccuracyTier::High).await,
            Err(LocationError::PermissionDenied)
        );
    }
}
