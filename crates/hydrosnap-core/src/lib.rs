//! # hydrosnap-core
//!
//! Core logic for verifying that a field operator is physically present at a
//! registered water-level monitoring site before a reading is accepted.
//!
//! This crate provides:
//! - Decoding and validation of the QR plates mounted at each site
//! - Geofence checks against the site's coordinates
//! - Continuous geofence monitoring while a reading is captured
//! - A latency-first location cache persisted across restarts
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`types`] - Coordinates, location samples and accuracy tiers
//! - [`geodesy`] - Great-circle distance
//! - [`codec`] - QR payload decoding (Fernet tokens, plain records, site codes)
//! - [`descriptor`] - Site descriptor validation, integrity and expiry checks
//! - [`issuer`] - Encrypted QR token issuing
//! - [`orchestrator`] - The `validate_qr` pipeline
//! - [`location`] - Location provider trait, guarded fetches and providers
//! - [`storage`] - Persistent key-value stores
//! - [`cache`] - Single-slot location cache with coalesced background refresh
//! - [`monitor`] - Geofence monitoring sessions
//! - [`config`] - Layered configuration loading and validation
//! - [`error`] - Unified error types for the crate
//!
//! Components are constructed explicitly and shared by handle; there are no
//! process-wide singletons.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod cache;
pub mod codec;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod geodesy;
pub mod issuer;
pub mod location;
pub mod monitor;
pub mod orchestrator;
pub mod storage;
pub mod types;

// Re-export primary types for convenience
pub use cache::{CacheEntry, CacheSettings, LocationCache};
pub use codec::{
    is_recognized_format, DecodeError, KeyError, Payload, PayloadCodec, RawSiteRecord, SiteKey,
};
pub use config::{Config, ConfigError, ConfigResult};
pub use descriptor::{DescriptorValidator, Levels, SiteDescriptor, ValidationError};
pub use error::{HydroSnapError, Result};
pub use issuer::{IssueError, TokenIssuer};
#[cfg(any(test, feature = "mock-location"))]
pub use location::MockLocationProvider;
pub use location::{
    LocationError, LocationProvider, LocationResult, PermissionStatus, ReportedLocationProvider,
};
pub use monitor::{
    GeofenceConfig, GeofenceMonitor, GeofenceStatus, StartError, Statistics, StatusSnapshot,
    SAMPLE_INTERVAL,
};
pub use orchestrator::{QrValidationService, ValidationOutcome, Verified};
pub use storage::{default_data_dir, FileStore, KeyValueStore, MemoryStore, StorageError};
pub use types::{AccuracyTier, Coordinate, LocationSample};
