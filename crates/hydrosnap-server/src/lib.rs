//! # hydrosnap-server
//!
//! HTTP server library for HydroSnap site presence verification.
//!
//! This library provides the API handlers and state management; the
//! `hydrosnap-server` binary wires them to a listener.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod logging;
pub mod state;
