//! Owner of the coarse job: the fetch and bulk-analysis jobs observed through
//! `/api/status`.
//!
//! A [`JobMonitor`] starts a job, holds the single polling session that
//! observes it, and, when the job ends in `review_ready`, drains the result set
//! into the handoff store. Everything it shows is published on a
//! [`StatusBoard`].

use std::sync::Arc;

use tokio::sync::watch;

use crate::handoff::HandoffStore;
use crate::poller::{SessionSlot, StatusBoard, StatusPoller, StatusView};
use crate::{
    Config, CoreError, FetchQuery, JobBackend, JobHandle, JobRequest, JobStatus, Paper,
    ResultAggregator, StatusReport, StatusTarget,
};

pub struct JobMonitor {
    backend: Arc<dyn JobBackend>,
    store: Arc<dyn HandoffStore>,
    poller: StatusPoller,
    aggregator: ResultAggregator,
    board: StatusBoard,
    session: SessionSlot,
}

impl JobMonitor {
    pub fn new(
        backend: Arc<dyn JobBackend>,
        store: Arc<dyn HandoffStore>,
        config: &Config,
    ) -> Self {
        Self {
            poller: StatusPoller::new(backend.clone(), config.status_poll_interval),
            aggregator: ResultAggregator::new(backend.clone(), store.clone(), config.page_size),
            backend,
            store,
            board: StatusBoard::default(),
            session: SessionSlot::new(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusView> {
        self.board.subscribe()
    }

    pub fn status(&self) -> StatusView {
        self.board.current()
    }

    pub fn store(&self) -> &Arc<dyn HandoffStore> {
        &self.store
    }

    /// Start a paper fetch and begin polling it.
    pub async fn run_fetch(&self, query: FetchQuery) -> Result<JobHandle, CoreError> {
        self.start(JobRequest::Fetch(query), "Fetching papers...".to_string())
            .await
    }

    /// Start the bulk analyze-and-email job for `papers` and begin polling it.
    pub async fn analyze_and_email(
        &self,
        papers: Vec<Paper>,
        email: Option<String>,
    ) -> Result<JobHandle, CoreError> {
        if papers.is_empty() {
            return Err(CoreError::InvalidRequest(
                "select at least one paper to analyze".to_string(),
            ));
        }
        let message = format!("Starting analysis of {} papers...", papers.len());
        self.start(JobRequest::AnalyzeAndEmail { papers, email }, message)
            .await
    }

    async fn start(&self, request: JobRequest, message: String) -> Result<JobHandle, CoreError> {
        self.ensure_idle()?;
        self.board.reset(JobStatus::Running, message);

        match self.backend.start(&request).await {
            Ok(handle) => {
                log::info!("started {:?}: {}", handle.target, handle.message);
                self.start_polling(handle.target.clone());
                Ok(handle)
            }
            Err(e) => {
                self.board.fail(e.to_string());
                Err(e)
            }
        }
    }

    fn ensure_idle(&self) -> Result<(), CoreError> {
        let current = self.board.current();
        if current.status == JobStatus::Running || current.aggregating {
            return Err(CoreError::Busy);
        }
        Ok(())
    }

    /// Observe `target` until it ends, replacing any session already running.
    pub fn start_polling(&self, target: StatusTarget) {
        // A drain owned by the superseded session ends with it.
        self.session.stop();
        self.board.abort_aggregation();

        let poller = self.poller.clone();
        let aggregator = self.aggregator.clone();
        let board = self.board.clone();

        self.session.start(move |cancel| async move {
            let on_tick = |report: &StatusReport| {
                // review_ready is applied together with the aggregation guard below.
                if report.status != JobStatus::ReviewReady {
                    board.observe(report);
                }
            };
            let Some(report) = poller.poll_until_terminal(&target, &cancel, on_tick).await else {
                return;
            };
            if report.status != JobStatus::ReviewReady {
                return;
            }
            if !board.begin_aggregation(&report) {
                log::warn!("results are already being loaded; ignoring second review_ready");
                return;
            }

            let progress_board = board.clone();
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = aggregator.aggregate(move |p| progress_board.progress(p)) => result,
            };
            if cancel.is_cancelled() {
                return;
            }
            match result {
                Ok(stored) => board.complete_aggregation(stored.key, stored.count),
                Err(e) => board.fail(format!("Error loading results from backend: {e}")),
            }
        });
    }

    /// Stop observing the current job. Returns whether a session was running.
    ///
    /// The display leaves `running` or an unfinished drain for `idle`, so a
    /// new job can be started. The backend job itself is not cancelled.
    pub fn stop_polling(&self) -> bool {
        let stopped = self.session.stop();
        self.board.interrupt();
        stopped
    }

    pub fn is_polling(&self) -> bool {
        self.session.is_live()
    }

    /// The "view results" action: the key of the ready result set, if any.
    /// Resets the display to `idle`.
    pub fn take_ready_handoff(&self) -> Option<String> {
        self.board.acknowledge_handoff()
    }

    /// Read a handed-off result set. The record is gone afterwards.
    pub fn open_results(&self, key: &str) -> Result<Vec<Paper>, CoreError> {
        self.store.take(key)?.decode()
    }

    /// Ask the backend to drop its cached results.
    pub async fn clear_cache(&self) -> Result<String, CoreError> {
        self.ensure_idle()?;
        self.board.reset(JobStatus::Running, "Clearing cache...");
        match self.backend.clear_cache().await {
            Ok(message) => {
                self.board.reset(JobStatus::Success, message.clone());
                Ok(message)
            }
            Err(e) => {
                self.board.fail(e.to_string());
                Err(e)
            }
        }
    }

    /// Wait until the display is terminal and no results are being loaded.
    ///
    /// Returns at once if nothing is running.
    pub async fn wait_until_settled(&self) -> StatusView {
        let mut rx = self.board.subscribe();
        match rx.wait_for(StatusView::is_settled).await {
            Ok(view) => view.clone(),
            Err(_) => self.board.current(),
        }
    }
}

impl Drop for JobMonitor {
    fn drop(&mut self) {
        self.session.stop();
    }
}
