//! Application state shared across handlers.
//!
//! The server owns exactly one of each core component and hands them to
//! handlers by reference. Positions arrive from the field device through
//! `PUT /api/location/fix` and feed a [`ReportedLocationProvider`] that backs
//! both the location cache and the geofence monitor.

use std::sync::Arc;
use std::time::Instant;

use hydrosnap_core::{
    Config, FileStore, GeofenceMonitor, KeyValueStore, LocationCache, LocationProvider,
    QrValidationService, ReportedLocationProvider,
};
use tracing::info;

/// Shared handle to the application state.
pub type SharedState = Arc<AppState>;

/// Application state.
pub struct AppState {
    /// Effective configuration.
    pub config: Config,
    /// QR validation pipeline.
    pub validation: QrValidationService,
    /// Latency-first location cache.
    pub cache: LocationCache,
    /// Geofence monitoring sessions.
    pub monitor: GeofenceMonitor,
    /// Provider fed by device location reports.
    pub reports: Arc<ReportedLocationProvider>,
    /// When the server started.
    pub started_at: Instant,
}

impl AppState {
    /// Build the state over an explicit key-value store.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured QR secret cannot produce a key.
    pub fn new(config: Config, store: Arc<dyn KeyValueStore>) -> anyhow::Result<Self> {
        let validation = QrValidationService::new(config.codec()?, config.validator());
        if !validation.codec().has_key() {
            tracing::warn!("No QR secret configured; encrypted QR codes will be rejected");
        }

        let reports = Arc::new(ReportedLocationProvider::new(config.report_fresh_within()));
        let provider: Arc<dyn LocationProvider> = reports.clone();
        let cache = LocationCache::new(Arc::clone(&provider), store, config.cache_settings());
        let monitor = GeofenceMonitor::new(provider).with_fetch_timeout(config.fetch_timeout());

        Ok(Self {
            config,
            validation,
            cache,
            monitor,
            reports,
            started_at: Instant::now(),
        })
    }

    /// Build the state with a file store under the configured data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory or the QR key cannot be resolved.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let data_dir = config.data_dir()?;
        info!(data_dir = %data_dir.display(), "Using data directory");
        let store = Arc::new(FileStore::new(data_dir));
        Self::new(config, store)
    }

    /// Wrap the state for sharing with handlers.
    #[must_use]
    pub fn shared(self) -> SharedState {
        Arc::new(self)
    }

    /// Stop background work before the process exits.
    pub async fn shutdown(&self) {
        if self.monitor.is_active().await {
            let stats = self.monitor.stop().await;
            info!(
                site_id = ?stats.site_id,
                total_updates = stats.total_updates,
                "Stopped geofence monitoring for shutdown"
            );
        }
        self.cache.settle().await;
    }
}
