//! Status polling for backend jobs.
//!
//! - [`StatusPoller`] turns a started job into a stream of status observations
//!   ending at the first terminal status.
//! - [`PollSession`] is one spawned polling task plus the token that kills it.
//! - [`SessionSlot`] holds at most one live session for an owner; starting a new
//!   session cancels the previous one first.
//! - [`StatusBoard`] is the displayed status of the coarse job, including the
//!   rule that a `review_ready` display is never overwritten by later ticks.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::aggregator::AggregationProgress;
use crate::{JobBackend, JobStatus, StatusReport, StatusTarget};

/// Poll interval for the coarse fetch / bulk-analysis job.
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// Poll interval for a single paper's analysis.
pub const ANALYSIS_POLL_INTERVAL: Duration = Duration::from_millis(3000);

/// Polls one status endpoint on a fixed interval.
///
/// The next tick is only scheduled once the previous query has returned, so
/// ticks of one session never overlap even when a query outlasts the interval.
#[derive(Clone)]
pub struct StatusPoller {
    backend: Arc<dyn JobBackend>,
    interval: Duration,
}

impl StatusPoller {
    pub fn new(backend: Arc<dyn JobBackend>, interval: Duration) -> Self {
        Self { backend, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Query `target` every interval until a terminal status is observed.
    ///
    /// `on_tick` sees every observation, the terminal one included. Network
    /// failures are logged and skipped; any other failure ends polling with an
    /// `error` report carrying the failure's message. Returns `None` if
    /// `cancel` fires first. A query already in flight when `cancel` fires is
    /// allowed to finish, but its answer is dropped.
    pub async fn poll_until_terminal<F>(
        &self,
        target: &StatusTarget,
        cancel: &CancellationToken,
        mut on_tick: F,
    ) -> Option<StatusReport>
    where
        F: FnMut(&StatusReport) + Send,
    {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = ticker.tick() => {}
            }

            let result = self.backend.query_status(target).await;
            if cancel.is_cancelled() {
                log::debug!("dropping status for cancelled session {target:?}");
                return None;
            }

            let report = match result {
                Ok(report) => report,
                Err(e) if e.is_network() => {
                    log::debug!("status poll for {target:?} failed: {e}");
                    continue;
                }
                Err(e) => StatusReport::new(JobStatus::Error, e.to_string()),
            };

            on_tick(&report);
            if report.status.is_terminal() {
                log::info!("{target:?} reached {}", report.status);
                return Some(report);
            }
        }
    }
}

/// A spawned polling task and its liveness token.
///
/// Dropping the session cancels it.
pub struct PollSession {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PollSession {
    /// Spawn `f` with a fresh token. `f` must stop applying effects once the
    /// token is cancelled.
    pub fn spawn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(f(cancel.clone()));
        Self { cancel, task }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Not cancelled and still running.
    pub fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && !self.task.is_finished()
    }
}

impl Drop for PollSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for PollSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollSession")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

/// Owner-side holder guaranteeing at most one live session.
#[derive(Debug, Default)]
pub struct SessionSlot {
    current: Mutex<Option<PollSession>>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the current session (if any), then spawn `f` as the new one.
    pub fn start<F, Fut>(&self, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = current.take() {
            previous.cancel();
        }
        *current = Some(PollSession::spawn(f));
    }

    /// Cancel the current session. Returns whether one was held.
    pub fn stop(&self) -> bool {
        let previous = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match previous {
            Some(session) => {
                session.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_live(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(PollSession::is_live)
    }
}

/// What the coarse job currently displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusView {
    pub status: JobStatus,
    pub message: String,
    /// Handoff key of a drained result set waiting to be opened.
    pub handoff_key: Option<String>,
    /// A result set is being drained.
    pub aggregating: bool,
    pub progress: Option<AggregationProgress>,
}

impl Default for StatusView {
    fn default() -> Self {
        Self {
            status: JobStatus::Idle,
            message: "Welcome! Configure your query and start the process.".to_string(),
            handoff_key: None,
            aggregating: false,
            progress: None,
        }
    }
}

impl StatusView {
    /// Terminal and not draining results: nothing more will change on its own.
    pub fn is_settled(&self) -> bool {
        self.status.is_terminal() && !self.aggregating
    }
}

/// Shared, observable display state for the coarse job.
#[derive(Debug, Clone)]
pub struct StatusBoard {
    tx: Arc<watch::Sender<StatusView>>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new(StatusView::default())
    }
}

impl StatusBoard {
    pub fn new(view: StatusView) -> Self {
        let (tx, _) = watch::channel(view);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusView> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> StatusView {
        self.tx.borrow().clone()
    }

    /// Unconditionally replace the display, dropping any pending handoff.
    pub fn reset(&self, status: JobStatus, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_modify(|view| {
            *view = StatusView {
                status,
                message,
                handoff_key: None,
                aggregating: false,
                progress: None,
            };
        });
    }

    /// Apply one poll observation.
    ///
    /// Once the display shows `review_ready`, observations are suppressed so
    /// the display cannot fall back to `running` while results are drained
    /// or waiting to be opened. Returns whether the display changed.
    pub fn observe(&self, report: &StatusReport) -> bool {
        self.tx.send_if_modified(|view| {
            if view.status == JobStatus::ReviewReady {
                return false;
            }
            view.status = report.status;
            view.message = report.message.clone();
            true
        })
    }

    /// Enter `review_ready` from `report` and mark a result drain as started,
    /// in one update. Returns `false` if a drain is already in progress.
    pub fn begin_aggregation(&self, report: &StatusReport) -> bool {
        self.tx.send_if_modified(|view| {
            if view.aggregating {
                return false;
            }
            view.status = report.status;
            view.aggregating = true;
            view.handoff_key = None;
            view.progress = Some(AggregationProgress::default());
            view.message = "Loading results page 1...".to_string();
            true
        })
    }

    pub fn progress(&self, progress: AggregationProgress) {
        self.tx.send_modify(|view| {
            view.message = progress.message();
            view.progress = Some(progress);
        });
    }

    /// Drain finished: hold `review_ready` with the handoff key until acknowledged.
    pub fn complete_aggregation(&self, key: String, total: usize) {
        self.tx.send_modify(|view| {
            view.status = JobStatus::ReviewReady;
            view.message = format!("All {total} results loaded.");
            view.handoff_key = Some(key);
            view.aggregating = false;
        });
    }

    /// Release the aggregation guard after its drain was cancelled. The
    /// display goes back to `idle`. Returns whether a drain was in progress.
    pub fn abort_aggregation(&self) -> bool {
        self.tx.send_if_modified(|view| {
            if !view.aggregating {
                return false;
            }
            *view = StatusView {
                status: JobStatus::Idle,
                message: "Loading results cancelled.".to_string(),
                ..StatusView::default()
            };
            true
        })
    }

    /// Stop showing a job as in progress once nothing observes it anymore:
    /// a drain is aborted and a `running` display goes back to `idle`.
    /// Returns whether the display changed.
    pub fn interrupt(&self) -> bool {
        if self.abort_aggregation() {
            return true;
        }
        self.tx.send_if_modified(|view| {
            if view.status != JobStatus::Running {
                return false;
            }
            *view = StatusView {
                status: JobStatus::Idle,
                message: "Stopped watching the job.".to_string(),
                ..StatusView::default()
            };
            true
        })
    }

    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_modify(|view| {
            view.status = JobStatus::Error;
            view.message = message;
            view.aggregating = false;
            view.progress = None;
        });
    }

    /// Hand the ready result set to its viewer: returns the key and resets the
    /// display to `idle`. `None` if no result set is waiting.
    pub fn acknowledge_handoff(&self) -> Option<String> {
        let mut key = None;
        self.tx.send_if_modified(|view| {
            if view.status != JobStatus::ReviewReady {
                return false;
            }
            key = view.handoff_key.take();
            if key.is_none() {
                return false;
            }
            view.status = JobStatus::Idle;
            view.message = "Results opened.".to_string();
            view.progress = None;
            true
        });
        key
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::testing::{network_error, report, ScriptedBackend};
    use crate::CoreError;

    fn poller(backend: &Arc<ScriptedBackend>) -> StatusPoller {
        StatusPoller::new(backend.clone(), STATUS_POLL_INTERVAL)
    }

    #[test]
    fn board_freezes_on_review_ready() {
        let board = StatusBoard::default();
        board.reset(JobStatus::Running, "Fetching papers...");

        let sequence = [
            JobStatus::Running,
            JobStatus::Running,
            JobStatus::ReviewReady,
            JobStatus::Running,
        ];
        let applied: Vec<bool> = sequence
            .iter()
            .map(|s| board.observe(&report(*s)))
            .collect();

        assert_eq!(applied, vec![true, true, true, false]);
        let view = board.current();
        assert_eq!(view.status, JobStatus::ReviewReady);
        assert_eq!(view.message, "review_ready message");
    }

    #[test]
    fn board_reset_unfreezes() {
        let board = StatusBoard::default();
        board.observe(&report(JobStatus::ReviewReady));
        board.reset(JobStatus::Running, "again");
        assert!(board.observe(&report(JobStatus::Success)));
        assert_eq!(board.current().status, JobStatus::Success);
    }

    #[test]
    fn board_aggregation_guard() {
        let board = StatusBoard::default();
        let ready = report(JobStatus::ReviewReady);
        assert!(board.begin_aggregation(&ready));
        assert!(!board.begin_aggregation(&ready));
        let view = board.current();
        assert_eq!(view.status, JobStatus::ReviewReady);
        assert!(!view.is_settled());
        assert_eq!(view.message, "Loading results page 1...");

        board.complete_aggregation("results_1".into(), 3);
        let view = board.current();
        assert!(!view.aggregating);
        assert_eq!(view.status, JobStatus::ReviewReady);
        assert_eq!(view.message, "All 3 results loaded.");
        assert!(view.is_settled());
        assert!(board.begin_aggregation(&ready));
    }

    #[test]
    fn abort_releases_aggregation_guard() {
        let board = StatusBoard::default();
        assert!(!board.abort_aggregation());
        assert!(board.begin_aggregation(&report(JobStatus::ReviewReady)));

        assert!(board.abort_aggregation());
        let view = board.current();
        assert_eq!(view.status, JobStatus::Idle);
        assert!(!view.aggregating);
        assert!(view.progress.is_none());
        assert!(view.is_settled());
        assert!(board.begin_aggregation(&report(JobStatus::ReviewReady)));
    }

    #[test]
    fn interrupt_only_touches_work_in_progress() {
        let board = StatusBoard::default();
        board.reset(JobStatus::Running, "Fetching papers...");
        assert!(board.interrupt());
        assert_eq!(board.current().status, JobStatus::Idle);
        assert_eq!(board.current().message, "Stopped watching the job.");

        board.reset(JobStatus::Error, "boom");
        assert!(!board.interrupt());
        assert_eq!(board.current().message, "boom");
    }

    #[test]
    fn acknowledge_handoff_resets_to_idle() {
        let board = StatusBoard::default();
        assert!(board.acknowledge_handoff().is_none());

        board.complete_aggregation("results_9".into(), 1);
        assert_eq!(board.acknowledge_handoff().as_deref(), Some("results_9"));
        let view = board.current();
        assert_eq!(view.status, JobStatus::Idle);
        assert!(view.handoff_key.is_none());
        assert!(board.acknowledge_handoff().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn polling_stops_at_first_terminal_status() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script_status(
            StatusTarget::Coarse,
            vec![
                Ok(report(JobStatus::Running)),
                Ok(report(JobStatus::Running)),
                Ok(report(JobStatus::Success)),
                Ok(report(JobStatus::Running)),
            ],
        );

        let ticks = AtomicUsize::new(0);
        let cancel = CancellationToken::new();
        let terminal = poller(&backend)
            .poll_until_terminal(&StatusTarget::Coarse, &cancel, |_| {
                ticks.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        assert_eq!(terminal.status, JobStatus::Success);
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert_eq!(backend.status_call_count(&StatusTarget::Coarse), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_are_spaced_by_interval() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script_status(
            StatusTarget::Coarse,
            vec![Ok(report(JobStatus::Running)), Ok(report(JobStatus::Idle))],
        );

        let started = Instant::now();
        poller(&backend)
            .poll_until_terminal(&StatusTarget::Coarse, &CancellationToken::new(), |_| {})
            .await;

        let calls = backend.status_calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].1 - started >= STATUS_POLL_INTERVAL);
        assert!(calls[1].1 - calls[0].1 >= STATUS_POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn network_errors_are_swallowed() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script_status(
            StatusTarget::Coarse,
            vec![
                Err(network_error()),
                Ok(report(JobStatus::Running)),
                Err(network_error()),
                Ok(report(JobStatus::ReviewReady)),
            ],
        );

        let mut seen = Vec::new();
        let terminal = poller(&backend)
            .poll_until_terminal(&StatusTarget::Coarse, &CancellationToken::new(), |r| {
                seen.push(r.status)
            })
            .await
            .unwrap();

        assert_eq!(terminal.status, JobStatus::ReviewReady);
        assert_eq!(seen, vec![JobStatus::Running, JobStatus::ReviewReady]);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_errors_end_polling_with_message() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script_status(
            StatusTarget::Coarse,
            vec![Err(CoreError::Remote {
                status: Some(500),
                message: "backend exploded".into(),
            })],
        );

        let terminal = poller(&backend)
            .poll_until_terminal(&StatusTarget::Coarse, &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(terminal.status, JobStatus::Error);
        assert_eq!(terminal.message, "backend exploded");
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_poll_returns_none() {
        let backend = Arc::new(ScriptedBackend::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = poller(&backend)
            .poll_until_terminal(&StatusTarget::Coarse, &cancel, |_| {})
            .await;
        assert!(result.is_none());
        assert_eq!(backend.status_call_count(&StatusTarget::Coarse), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slot_start_supersedes_previous_session() {
        let backend = Arc::new(ScriptedBackend::new());
        let slot = SessionSlot::new();
        let first_ticks = Arc::new(AtomicUsize::new(0));

        let p = poller(&backend);
        let ticks = first_ticks.clone();
        slot.start(move |cancel| async move {
            p.poll_until_terminal(&StatusTarget::Coarse, &cancel, |_| {
                ticks.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        });
        tokio::time::sleep(STATUS_POLL_INTERVAL * 2 + Duration::from_millis(10)).await;
        let before = first_ticks.load(Ordering::SeqCst);
        assert_eq!(before, 2);

        // Replace with a session that never ticks.
        slot.start(|cancel| async move { cancel.cancelled().await });
        tokio::time::sleep(STATUS_POLL_INTERVAL * 5).await;
        assert_eq!(first_ticks.load(Ordering::SeqCst), before);
        assert!(slot.is_live());

        assert!(slot.stop());
        tokio::task::yield_now().await;
        assert!(!slot.is_live());
        assert!(!slot.stop());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_session_cancels_it() {
        let backend = Arc::new(ScriptedBackend::new());
        let ticks = Arc::new(AtomicUsize::new(0));
        let p = poller(&backend);
        let counter = ticks.clone();
        let session = PollSession::spawn(move |cancel| async move {
            p.poll_until_terminal(&StatusTarget::Coarse, &cancel, |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        });
        tokio::time::sleep(STATUS_POLL_INTERVAL + Duration::from_millis(10)).await;
        assert!(session.is_live());
        drop(session);

        tokio::time::sleep(STATUS_POLL_INTERVAL * 3).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }
}
