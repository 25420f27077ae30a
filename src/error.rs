//! Unified error handling for the clustering engine.
//!
//! Every ingestion either completes with an outcome or fails with one of these
//! variants. None of them leave the store half-updated.

use thiserror::Error;

use crate::{ClusterId, RouteId};

/// Unified error type for clustering operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClusterError {
    /// Ping lies outside the tolerance of the route it was checked against
    #[error("Ping is outside the corridor of route {route_id} ({offset_meters:.0}m, heading delta {heading_delta_degrees:.0}°)")]
    OutOfCorridor {
        route_id: RouteId,
        offset_meters: f64,
        heading_delta_degrees: f64,
    },
    /// Ping presents a plate different from the one recorded on the cluster
    #[error("Plate '{presented}' conflicts with plate '{recorded}' on cluster {cluster_id}")]
    PlateMismatch {
        cluster_id: ClusterId,
        recorded: String,
        presented: String,
    },
    /// Another ping for the same user is still being processed
    #[error("A ping for user '{user_id}' is already in flight")]
    DuplicateInFlight { user_id: String },
    /// Underlying storage cannot be reached
    #[error("Cluster store unavailable: {message}")]
    StoreUnavailable { message: String },
    /// Route id is not present in the catalog
    #[error("Route {route_id} is not known")]
    UnknownRoute { route_id: RouteId },
    /// Route geometry cannot be used for corridor matching
    #[error("Route {route_id} is invalid: {message}")]
    InvalidRoute { route_id: RouteId, message: String },
    /// Request failed validation before touching any state
    #[error("Invalid ping: {message}")]
    InvalidPing { message: String },
    /// Configuration value could not be parsed or is inconsistent
    #[error("Configuration error: {message}")]
    Config { message: String },
    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ClusterError {
    /// Whether the caller can carry on (the data is intact and the request may be
    /// retried or answered with an outcome).
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ClusterError::StoreUnavailable { .. } | ClusterError::Internal { .. }
        )
    }

    /// HTTP-equivalent status code for the transport layer.
    pub fn status_code(&self) -> u16 {
        match self {
            ClusterError::OutOfCorridor { .. } | ClusterError::PlateMismatch { .. } => 200,
            ClusterError::DuplicateInFlight { .. } => 429,
            ClusterError::UnknownRoute { .. } => 404,
            ClusterError::InvalidPing { .. } => 422,
            ClusterError::InvalidRoute { .. } => 500,
            ClusterError::StoreUnavailable { .. } => 503,
            ClusterError::Config { .. } | ClusterError::Internal { .. } => 500,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ClusterError::OutOfCorridor { .. } => "OUT_OF_CORRIDOR",
            ClusterError::PlateMismatch { .. } => "PLATE_MISMATCH",
            ClusterError::DuplicateInFlight { .. } => "DUPLICATE_IN_FLIGHT",
            ClusterError::StoreUnavailable { .. } => "STORE_UNAVAILABLE",
            ClusterError::UnknownRoute { .. } => "UNKNOWN_ROUTE",
            ClusterError::InvalidPing { .. } => "INVALID_PING",
            ClusterError::InvalidRoute { .. } => "INVALID_ROUTE",
            ClusterError::Config { .. } => "CONFIG_ERROR",
            ClusterError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    pub(crate) fn store(message: impl Into<String>) -> Self {
        ClusterError::StoreUnavailable {
            message: message.into(),
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        ClusterError::InvalidPing {
            message: message.into(),
        }
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for ClusterError {
    fn from(err: rusqlite::Error) -> Self {
        ClusterError::store(err.to_string())
    }
}

/// Result type alias for clustering operations.
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Extension trait for converting Option to ClusterError.
pub trait OptionExt<T> {
    /// Convert Option to Result with an unknown route error.
    fn ok_or_unknown_route(self, route_id: RouteId) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_unknown_route(self, route_id: RouteId) -> Result<T> {
        self.ok_or(ClusterError::UnknownRoute { route_id })
    }
}
