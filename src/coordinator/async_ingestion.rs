//! Tokio wrapper around the blocking coordinator.

use std::sync::Arc;

use futures::future::join_all;

use super::IngestionCoordinator;
use crate::api::{IngestionRequest, IngestionResponse};
use crate::error::{ClusterError, Result};

/// Runs ingestion on tokio's blocking pool so the per-user gate and route
/// locks never park an async worker thread.
#[derive(Debug, Clone)]
pub struct AsyncIngestion {
    inner: Arc<IngestionCoordinator>,
}

impl AsyncIngestion {
    pub fn new(coordinator: Arc<IngestionCoordinator>) -> Self {
        Self { inner: coordinator }
    }

    pub fn coordinator(&self) -> &Arc<IngestionCoordinator> {
        &self.inner
    }

    pub async fn ingest(&self, request: IngestionRequest) -> Result<IngestionResponse> {
        let coordinator = self.inner.clone();
        tokio::task::spawn_blocking(move || coordinator.ingest(request))
            .await
            .map_err(|e| ClusterError::Internal {
                message: format!("ingestion task failed: {}", e),
            })?
    }

    /// Ingest several requests concurrently. Results keep the input order.
    pub async fn ingest_batch(
        &self,
        requests: Vec<IngestionRequest>,
    ) -> Vec<Result<IngestionResponse>> {
        join_all(requests.into_iter().map(|request| self.ingest(request))).await
    }
}
