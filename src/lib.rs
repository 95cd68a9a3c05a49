//! Library crate for tabletop-live-back, exposing modules for binaries and integration tests.

/// Reconciler configuration.
pub mod config;
/// Session persistence.
pub mod dao;
/// Request and response payloads.
pub mod dto;
/// Service and HTTP error types.
pub mod error;
/// HTTP routing.
pub mod routes;
/// Reconciler, request paths and background tasks.
pub mod services;
/// Shared in-process state.
pub mod state;
