//! Geofence monitoring sessions.
//!
//! While an operator records a reading, the device position is sampled on a
//! fixed interval and compared against the site's geofence. Each successful
//! sample updates running aggregates and is pushed to the caller; `stop`
//! returns the accumulated [`Statistics`] for the audit trail.
//!
//! The monitor moves `Idle → Monitoring → Idle`. At most one session runs at
//! a time.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::cache::DEFAULT_FETCH_TIMEOUT;
use crate::geodesy;
use crate::location::{fetch_guarded, FetchRequest, LocationProvider, PermissionStatus};
use crate::types::{AccuracyTier, Coordinate, LocationSample};

/// Interval between position samples.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Errors raised when starting a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartError {
    /// A session is already running.
    #[error("Geofence monitoring already active for site {site_id}")]
    AlreadyActive {
        /// Site of the running session.
        site_id: String,
    },

    /// Location permission is not granted.
    #[error("Location permission unavailable ({0:?})")]
    PermissionUnavailable(PermissionStatus),
}

/// What to monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct GeofenceConfig {
    /// Site being monitored.
    #[schema(example = "CWC-DEL-001")]
    pub site_id: String,
    /// Geofence center.
    pub center: Coordinate,
    /// Geofence radius in meters. `0` disables the geofence.
    #[schema(example = 125.0)]
    pub radius_meters: f64,
    /// Whether readings outside the geofence should be refused downstream.
    #[serde(default)]
    pub strict_mode: bool,
}

/// Position relative to the geofence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum GeofenceStatus {
    /// Within the radius.
    Inside,
    /// Beyond the radius.
    Outside,
    /// No sample yet.
    #[default]
    Unknown,
}

/// Live view of a session, emitted after every successful sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StatusSnapshot {
    /// Session identifier.
    pub session_id: Uuid,
    /// Site being monitored.
    pub site_id: String,
    /// Current position relative to the geofence.
    pub status: GeofenceStatus,
    /// Distance to the center at the last sample.
    pub distance_meters: Option<f64>,
    /// Reported accuracy of the last sample.
    pub accuracy_meters: Option<f64>,
    /// Geofence radius.
    pub radius_meters: f64,
    /// Strict mode flag of the session.
    pub strict_mode: bool,
    /// Successful samples so far.
    pub sample_count: u64,
    /// Samples taken outside the geofence.
    pub breach_count: u64,
    /// Ticks whose fetch failed.
    pub missed_ticks: u64,
    /// Accumulated time credited inside the geofence.
    pub time_in_geofence_ms: u64,
    /// Capture time of the last sample.
    pub last_sample_at: Option<DateTime<Utc>>,
    /// When the session started.
    pub started_at: DateTime<Utc>,
}

/// Aggregates returned when a session stops.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Statistics {
    /// Site of the session; `None` before any session.
    pub site_id: Option<String>,
    /// Strict mode flag of the session.
    pub strict_mode: bool,
    /// Samples taken outside the geofence.
    pub breach_count: u64,
    /// Mean distance to the center.
    pub avg_distance: f64,
    /// Smallest observed distance.
    pub min_distance: f64,
    /// Largest observed distance.
    pub max_distance: f64,
    /// Mean reported accuracy; samples without accuracy count as zero.
    pub avg_accuracy: f64,
    /// Time credited inside the geofence.
    pub time_in_geofence_ms: u64,
    /// Successful samples.
    pub total_updates: u64,
    /// Ticks whose fetch failed.
    pub missed_ticks: u64,
}

/// Running state of one monitoring session.
///
/// Pure bookkeeping: the monitor feeds it samples, it never fetches.
#[derive(Debug, Clone)]
pub struct GeofenceSession {
    id: Uuid,
    config: GeofenceConfig,
    started_at: DateTime<Utc>,
    status: GeofenceStatus,
    sample_count: u64,
    breach_count: u64,
    missed_ticks: u64,
    sum_distance: f64,
    min_distance: Option<f64>,
    max_distance: f64,
    sum_accuracy: f64,
    time_in_geofence_ms: u64,
    last_distance: Option<f64>,
    last_accuracy: Option<f64>,
    last_sample_at: Option<DateTime<Utc>>,
}

impl GeofenceSession {
    /// Begin a session with zeroed aggregates.
    #[must_use]
    pub fn new(config: GeofenceConfig) -> Self {
        Self {
            id: Uuid::now_v7(),
            config,
            started_at: Utc::now(),
            status: GeofenceStatus::Unknown,
            sample_count: 0,
            breach_count: 0,
            missed_ticks: 0,
            sum_distance: 0.0,
            min_distance: None,
            max_distance: 0.0,
            sum_accuracy: 0.0,
            time_in_geofence_ms: 0,
            last_distance: None,
            last_accuracy: None,
            last_sample_at: None,
        }
    }

    /// Session identifier.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Session configuration.
    #[must_use]
    pub const fn config(&self) -> &GeofenceConfig {
        &self.config
    }

    /// Fold one sample into the aggregates.
    ///
    /// An inside sample credits `interval` to the time in the geofence; an
    /// outside sample counts as a breach.
    pub fn record_sample(&mut self, sample: &LocationSample, interval: Duration) -> StatusSnapshot {
        let distance = geodesy::distance(self.config.center, sample.coordinate());
        let inside = geodesy::within_radius(distance, self.config.radius_meters);

        self.sample_count += 1;
        self.sum_distance += distance;
        self.min_distance = Some(self.min_distance.map_or(distance, |min| min.min(distance)));
        self.max_distance = self.max_distance.max(distance);
        self.sum_accuracy += sample.accuracy_meters.unwrap_or(0.0);
        self.last_distance = Some(distance);
        self.last_accuracy = sample.accuracy_meters;
        self.last_sample_at = Some(sample.captured_at);

        if inside {
            self.status = GeofenceStatus::Inside;
            let credit = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
            self.time_in_geofence_ms = self.time_in_geofence_ms.saturating_add(credit);
        } else {
            self.status = GeofenceStatus::Outside;
            self.breach_count += 1;
        }

        self.snapshot()
    }

    /// Count a tick whose fetch failed. Aggregates are untouched.
    pub fn record_miss(&mut self) {
        self.missed_ticks += 1;
    }

    /// Current live view.
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            session_id: self.id,
            site_id: self.config.site_id.clone(),
            status: self.status,
            distance_meters: self.last_distance,
            accuracy_meters: self.last_accuracy,
            radius_meters: self.config.radius_meters,
            strict_mode: self.config.strict_mode,
            sample_count: self.sample_count,
            breach_count: self.breach_count,
            missed_ticks: self.missed_ticks,
            time_in_geofence_ms: self.time_in_geofence_ms,
            last_sample_at: self.last_sample_at,
            started_at: self.started_at,
        }
    }

    /// Final aggregates.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn statistics(&self) -> Statistics {
        let mean = |sum: f64| {
            if self.sample_count == 0 {
                0.0
            } else {
                sum / self.sample_count as f64
            }
        };

        Statistics {
            site_id: Some(self.config.site_id.clone()),
            strict_mode: self.config.strict_mode,
            breach_count: self.breach_count,
            avg_distance: mean(self.sum_distance),
            min_distance: self.min_distance.unwrap_or(0.0),
            max_distance: self.max_distance,
            avg_accuracy: mean(self.sum_accuracy),
            time_in_geofence_ms: self.time_in_geofence_ms,
            total_updates: self.sample_count,
            missed_ticks: self.missed_ticks,
        }
    }
}

struct ActiveSession {
    site_id: String,
    session: Arc<Mutex<GeofenceSession>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct MonitorSlot {
    active: Option<ActiveSession>,
    last_stats: Statistics,
}

/// Runs at most one geofence monitoring session.
pub struct GeofenceMonitor {
    provider: Arc<dyn LocationProvider>,
    sample_interval: Duration,
    fetch_timeout: Duration,
    slot: tokio::sync::Mutex<MonitorSlot>,
}

impl std::fmt::Debug for GeofenceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeofenceMonitor")
            .field("sample_interval", &self.sample_interval)
            .field("fetch_timeout", &self.fetch_timeout)
            .finish_non_exhaustive()
    }
}

fn lock_session(session: &Mutex<GeofenceSession>) -> std::sync::MutexGuard<'_, GeofenceSession> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

impl GeofenceMonitor {
    /// Create an idle monitor sampling every [`SAMPLE_INTERVAL`].
    #[must_use]
    pub fn new(provider: Arc<dyn LocationProvider>) -> Self {
        Self {
            provider,
            sample_interval: SAMPLE_INTERVAL,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            slot: tokio::sync::Mutex::new(MonitorSlot::default()),
        }
    }

    /// Override the per-sample fetch timeout.
    #[must_use]
    pub const fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    #[cfg(test)]
    const fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    /// Start monitoring `config`, calling `on_update` after every
    /// successful sample.
    ///
    /// # Errors
    ///
    /// - [`StartError::AlreadyActive`] if a session is running
    /// - [`StartError::PermissionUnavailable`] if location access is not
    ///   granted (an undetermined permission is requested first)
    pub async fn start<F>(&self, config: GeofenceConfig, on_update: F) -> Result<Uuid, StartError>
    where
        F: Fn(StatusSnapshot) + Send + 'static,
    {
        let mut slot = self.slot.lock().await;
        if let Some(active) = &slot.active {
            return Err(StartError::AlreadyActive {
                site_id: active.site_id.clone(),
            });
        }

        let permission = match self.provider.permission().await {
            PermissionStatus::Undetermined => self.provider.request_permission().await,
            status => status,
        };
        if permission != PermissionStatus::Granted {
            return Err(StartError::PermissionUnavailable(permission));
        }

        let session = GeofenceSession::new(config);
        let session_id = session.id();
        let site_id = session.config().site_id.clone();
        let session = Arc::new(Mutex::new(session));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(sample_loop(
            Arc::clone(&self.provider),
            Arc::clone(&session),
            cancel.clone(),
            self.sample_interval,
            self.fetch_timeout,
            on_update,
        ));

        info!(%session_id, %site_id, "Geofence monitoring started");
        slot.active = Some(ActiveSession {
            site_id,
            session,
            cancel,
            task,
        });
        Ok(session_id)
    }

    /// Stop the running session and return its statistics.
    ///
    /// The sampling task is cancelled and joined before returning, so no
    /// update is delivered afterwards. When idle, returns the statistics of
    /// the previous session (zeroed if there was none).
    pub async fn stop(&self) -> Statistics {
        let mut slot = self.slot.lock().await;
        let Some(active) = slot.active.take() else {
            return slot.last_stats.clone();
        };

        active.cancel.cancel();
        if let Err(e) = active.task.await {
            warn!(error = %e, site_id = %active.site_id, "Geofence sampling task ended abnormally");
        }

        let stats = lock_session(&active.session).statistics();
        info!(
            site_id = %active.site_id,
            total_updates = stats.total_updates,
            breach_count = stats.breach_count,
            missed_ticks = stats.missed_ticks,
            "Geofence monitoring stopped"
        );
        slot.last_stats = stats.clone();
        stats
    }

    /// Live snapshot of the running session, if any.
    pub async fn status(&self) -> Option<StatusSnapshot> {
        let slot = self.slot.lock().await;
        slot.active
            .as_ref()
            .map(|active| lock_session(&active.session).snapshot())
    }

    /// Whether a session is running.
    pub async fn is_active(&self) -> bool {
        self.slot.lock().await.active.is_some()
    }
}

async fn sample_loop<F>(
    provider: Arc<dyn LocationProvider>,
    session: Arc<Mutex<GeofenceSession>>,
    cancel: CancellationToken,
    interval: Duration,
    fetch_timeout: Duration,
    on_update: F,
) where
    F: Fn(StatusSnapshot) + Send + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let fetched = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = fetch_guarded(&provider, FetchRequest::Current(AccuracyTier::High), fetch_timeout) => result,
        };

        let snapshot = {
            let mut session = lock_session(&session);
            match fetched {
                Ok(sample) => Some(session.record_sample(&sample, interval)),
                Err(e) => {
                    session.record_miss();
                    warn!(error = %e, site_id = %session.config().site_id, "Geofence sample missed");
                    None
                }
            }
        };

        if let Some(snapshot) = snapshot {
            if cancel.is_cancelled() {
                break;
            }
            debug!(
                site_id = %snapshot.site_id,
                status = ?snapshot.status,
                distance_meters = snapshot.distance_meters,
                "Geofence sample"
            );
            on_update(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::{LocationError, MockLocationProvider};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    const CENTER: Coordinate = Coordinate::new(28.6139, 77.2090);
    const TICK: Duration = Duration::from_millis(10);

    fn config(radius: f64) -> GeofenceConfig {
        GeofenceConfig {
            site_id: "CWC-DEL-001".to_string(),
            center: CENTER,
            radius_meters: radius,
            strict_mode: false,
        }
    }

    /// A point `meters` due north of the center.
    fn north_of_center(meters: f64) -> LocationSample {
        let dlat = meters / geodesy::EARTH_RADIUS_METERS * (180.0 / std::f64::consts::PI);
        LocationSample::now(Coordinate::new(CENTER.lat + dlat, CENTER.lng), Some(4.0))
    }

    fn monitor(provider: &Arc<MockLocationProvider>) -> GeofenceMonitor {
        GeofenceMonitor::new(Arc::clone(provider) as Arc<dyn LocationProvider>)
            .with_sample_interval(TICK)
            .with_fetch_timeout(Duration::from_secs(1))
    }

    fn channel_callback() -> (
        impl Fn(StatusSnapshot) + Send + 'static,
        mpsc::UnboundedReceiver<StatusSnapshot>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            move |snapshot| {
                let _ = tx.send(snapshot);
            },
            rx,
        )
    }

    #[test]
    fn test_session_aggregates() {
        let mut session = GeofenceSession::new(config(100.0));
        let distances = [10.0, 50.0, 150.0, 90.0, 300.0];
        for meters in distances {
            session.record_sample(&north_of_center(meters), SAMPLE_INTERVAL);
        }

        let stats = session.statistics();
        assert_eq!(stats.total_updates, 5);
        assert_eq!(stats.breach_count, 2);
        assert_eq!(stats.time_in_geofence_ms, 15_000);
        assert!((stats.avg_distance - 120.0).abs() < 0.5);
        assert!((stats.min_distance - 10.0).abs() < 0.5);
        assert!((stats.max_distance - 300.0).abs() < 0.5);
        assert!((stats.avg_accuracy - 4.0).abs() < f64::EPSILON);
        assert_eq!(session.snapshot().status, GeofenceStatus::Outside);
    }

    #[test]
    fn test_zero_radius_is_always_inside() {
        let mut session = GeofenceSession::new(config(0.0));
        let snapshot = session.record_sample(&north_of_center(5_000.0), SAMPLE_INTERVAL);
        assert_eq!(snapshot.status, GeofenceStatus::Inside);
        assert_eq!(session.statistics().breach_count, 0);
    }

    #[test]
    fn test_missing_accuracy_counts_as_zero() {
        let mut session = GeofenceSession::new(config(100.0));
        session.record_sample(&north_of_center(10.0), SAMPLE_INTERVAL);
        let mut blind = north_of_center(10.0);
        blind.accuracy_meters = None;
        session.record_sample(&blind, SAMPLE_INTERVAL);

        assert!((session.statistics().avg_accuracy - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_session_statistics_are_zero() {
        let stats = GeofenceSession::new(config(100.0)).statistics();
        assert_eq!(stats.total_updates, 0);
        assert_eq!(stats.avg_distance, 0.0);
        assert_eq!(stats.min_distance, 0.0);
        assert_eq!(stats.avg_accuracy, 0.0);
    }

    #[tokio::test]
    async fn test_five_ticks_three_inside_two_outside() {
        let provider = Arc::new(MockLocationProvider::new());
        for meters in [10.0, 20.0, 150.0, 30.0, 200.0] {
            provider.push_current(Ok(north_of_center(meters)));
        }
        let monitor = monitor(&provider);
        let (callback, mut updates) = channel_callback();

        monitor.start(config(100.0), callback).await.unwrap();
        let mut last = None;
        for _ in 0..5 {
            last = updates.recv().await;
        }
        let stats = monitor.stop().await;

        assert_eq!(last.map(|s| s.sample_count), Some(5));
        assert_eq!(stats.total_updates, 5);
        assert_eq!(stats.breach_count, 2);
        assert!((stats.avg_distance - 82.0).abs() < 0.5);
        assert_eq!(stats.time_in_geofence_ms, 30);
        assert_eq!(stats.site_id.as_deref(), Some("CWC-DEL-001"));
        assert!(!monitor.is_active().await);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_a_missed_tick() {
        let provider = Arc::new(MockLocationProvider::new());
        provider.push_current(Err(LocationError::Unavailable("no sky".into())));
        provider.push_current(Ok(north_of_center(10.0)));
        let monitor = monitor(&provider);
        let (callback, mut updates) = channel_callback();

        monitor.start(config(100.0), callback).await.unwrap();
        let first = updates.recv().await.unwrap();
        let stats = monitor.stop().await;

        assert_eq!(first.sample_count, 1);
        assert!(first.missed_ticks >= 1);
        assert_eq!(stats.total_updates, 1);
        assert!(stats.missed_ticks >= 1);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let provider = Arc::new(MockLocationProvider::new());
        let monitor = monitor(&provider);

        monitor.start(config(100.0), |_| {}).await.unwrap();
        let err = monitor.start(config(50.0), |_| {}).await.unwrap_err();
        assert_eq!(
            err,
            StartError::AlreadyActive {
                site_id: "CWC-DEL-001".to_string()
            }
        );
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_start_requires_permission() {
        let provider = Arc::new(MockLocationProvider::new());
        provider.set_permission(PermissionStatus::Undetermined, PermissionStatus::Denied);
        let monitor = monitor(&provider);

        let err = monitor.start(config(100.0), |_| {}).await.unwrap_err();
        assert_eq!(err, StartError::PermissionUnavailable(PermissionStatus::Denied));
        assert!(!monitor.is_active().await);
    }

    #[tokio::test]
    async fn test_stop_when_idle_returns_last_statistics() {
        let provider = Arc::new(MockLocationProvider::new());
        provider.set_current(Ok(north_of_center(10.0)));
        let monitor = monitor(&provider);

        assert_eq!(monitor.stop().await, Statistics::default());

        let (callback, mut updates) = channel_callback();
        monitor.start(config(100.0), callback).await.unwrap();
        updates.recv().await.unwrap();
        let stats = monitor.stop().await;

        assert!(stats.total_updates >= 1);
        assert_eq!(monitor.stop().await, stats);
        assert!(monitor.status().await.is_none());
    }

    #[tokio::test]
    async fn test_no_updates_after_stop() {
        let provider = Arc::new(MockLocationProvider::new());
        provider.set_current(Ok(north_of_center(10.0)));
        let monitor = monitor(&provider);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        monitor
            .start(config(100.0), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        tokio::time::sleep(TICK * 3).await;
        assert!(monitor.status().await.is_some());
        monitor.stop().await;

        let after_stop = calls.load(Ordering::SeqCst);
        tokio::time::sleep(TICK * 5).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_stop_interrupts_a_slow_fetch() {
        let provider = Arc::new(MockLocationProvider::new());
        provider.set_current(Ok(north_of_center(10.0)));
        provider.hold_current();
        let monitor = GeofenceMonitor::new(Arc::clone(&provider) as Arc<dyn LocationProvider>)
            .with_sample_interval(TICK)
            .with_fetch_timeout(Duration::from_secs(60));

        monitor.start(config(100.0), |_| {}).await.unwrap();
        tokio::time::sleep(TICK * 2).await;

        let stats = tokio::time::timeout(Duration::from_secs(5), monitor.stop())
            .await
            .unwrap();
        assert_eq!(stats.total_updates, 0);
    }
}
