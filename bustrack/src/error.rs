//! Engine error types.
//!
//! Four kinds cover the whole surface: `Validation` for caller-fixable input
//! problems, `InvalidState` for operations not legal in the trip's current
//! lifecycle state, `NotFound` for unknown identifiers, and
//! `TransientCompute` for single-item failures inside multi-trip aggregates.
//! The last kind is always recovered locally (the item is skipped and logged)
//! and never surfaced as a whole-request failure.
//!
//! Anomalies are deliberately not errors: they are recorded observations and
//! never block ingestion.

use serde::Serialize;
use thiserror::Error;

use crate::geo::GeoError;

/// Errors produced by the tracking engine.
#[derive(Debug, Error)]
pub enum TrackError {
    /// Malformed or out-of-range input; always caller-fixable.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Operation not legal for the trip's current state.
    #[error("invalid trip state: {0}")]
    InvalidState(String),

    /// Unknown trip, stop, line, bus, or driver identifier.
    #[error("not found: {0}")]
    NotFound(String),

    /// A single item failed during an aggregate computation.
    ///
    /// Recovered locally by skipping the item; callers never see this kind
    /// for a whole request.
    #[error("transient compute failure: {0}")]
    TransientCompute(String),
}

impl TrackError {
    /// Machine-readable kind for surfacing to API layers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TrackError::Validation(_) => ErrorKind::Validation,
            TrackError::InvalidState(_) => ErrorKind::InvalidState,
            TrackError::NotFound(_) => ErrorKind::NotFound,
            TrackError::TransientCompute(_) => ErrorKind::TransientCompute,
        }
    }
}

impl From<GeoError> for TrackError {
    fn from(e: GeoError) -> Self {
        TrackError::Validation(e.to_string())
    }
}

/// Machine-readable error kind, serialized in API error bodies.
///
/// `Validation` maps to a 4xx equivalent, `InvalidState` to a 409 conflict,
/// `NotFound` to a 404.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    InvalidState,
    NotFound,
    TransientCompute,
}
