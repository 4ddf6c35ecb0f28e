use std::time::Duration;
use thiserror::Error;

pub mod aggregator;
pub mod client;
pub mod handoff;
pub mod monitor;
pub mod poller;
pub mod sidecar;
pub mod tracker;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-export for convenience
pub use aggregator::{AggregationProgress, ResultAggregator, StoredResults};
pub use client::{JobBackend, RemoteJobClient};
pub use handoff::{DirHandoffStore, HandoffRecord, HandoffStore, MemoryHandoffStore};
pub use monitor::JobMonitor;
pub use poller::{PollSession, SessionSlot, StatusBoard, StatusPoller, StatusView};
pub use sidecar::{SidecarExtractor, SidecarSplit};
pub use tracker::{
    AnalysisState, AnalysisStatus, SubJobState, SubJobTracker, TranslationState, TranslationStatus,
};
pub use types::{
    DateRange, FetchQuery, GalleryImage, JobHandle, JobRequest, JobStatus, Paper, ResultsPage,
    StatusReport, StatusTarget, Translation,
};

#[derive(Error, Debug)]
pub enum CoreError {
    /// The backend could not be reached (connect failure, DNS, timeout).
    #[error("network error: {0}")]
    Network(String),
    /// The backend answered with an error status. Displays the backend's
    /// message verbatim.
    #[error("{message}")]
    Remote {
        status: Option<u16>,
        message: String,
    },
    #[error("handoff record not found: {0}")]
    NotFound(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("a task is already in progress")]
    Busy,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Whether this is a connectivity failure rather than an answer from the backend.
    pub fn is_network(&self) -> bool {
        matches!(self, CoreError::Network(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::NotFound(_))
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            CoreError::MalformedPayload(err.to_string())
        } else if let Some(status) = err.status() {
            CoreError::Remote {
                status: Some(status.as_u16()),
                message: err.to_string(),
            }
        } else {
            CoreError::Network(err.to_string())
        }
    }
}

/// Configuration for talking to the paper service.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_base_url: String,
    /// Page size used when draining `/api/results`.
    pub page_size: usize,
    pub status_poll_interval: Duration,
    pub analysis_poll_interval: Duration,
    /// Per-request timeout. `None` lets a hung request stay pending.
    pub request_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:5001".to_string(),
            page_size: aggregator::DEFAULT_PAGE_SIZE,
            status_poll_interval: poller::STATUS_POLL_INTERVAL,
            analysis_poll_interval: poller::ANALYSIS_POLL_INTERVAL,
            request_timeout: None,
        }
    }
}
