//! Per-paper sub-jobs: translation and single-paper analysis.
//!
//! Every paper gets its own [`SubJobState`], keyed by its short id. An
//! operation on one paper only ever touches that paper's entry, so a failed
//! translation or analysis never leaks into another paper's state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;

use crate::handoff::HandoffStore;
use crate::poller::{PollSession, StatusPoller};
use crate::sidecar::SidecarExtractor;
use crate::{
    Config, CoreError, GalleryImage, JobBackend, JobRequest, JobStatus, Paper, StatusReport,
    StatusTarget, Translation,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TranslationStatus {
    #[default]
    Idle,
    Translating,
    Translated,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TranslationState {
    pub status: TranslationStatus,
    pub translated_title: Option<String>,
    pub translated_abstract: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisStatus {
    Running,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisState {
    pub status: AnalysisStatus,
    /// Analysis text with the gallery sidecar removed.
    pub content: Option<String>,
    pub gallery: Vec<GalleryImage>,
    pub error: Option<String>,
}

impl AnalysisState {
    fn running() -> Self {
        Self {
            status: AnalysisStatus::Running,
            content: None,
            gallery: Vec::new(),
            error: None,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            status: AnalysisStatus::Error,
            error: Some(message),
            ..Self::running()
        }
    }
}

/// Everything tracked for one paper.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubJobState {
    pub translation: TranslationState,
    /// `None` until an analysis is opened for the paper.
    pub analysis: Option<AnalysisState>,
}

/// An analysis session tagged with the open call that created it.
struct TrackedSession {
    seq: u64,
    session: PollSession,
}

pub struct SubJobTracker {
    backend: Arc<dyn JobBackend>,
    store: Arc<dyn HandoffStore>,
    poller: StatusPoller,
    extractor: SidecarExtractor,
    entries: Arc<DashMap<String, SubJobState>>,
    sessions: Arc<DashMap<String, TrackedSession>>,
    next_seq: AtomicU64,
    changed: Arc<Notify>,
}

impl SubJobTracker {
    pub fn new(
        backend: Arc<dyn JobBackend>,
        store: Arc<dyn HandoffStore>,
        config: &Config,
    ) -> Self {
        Self {
            poller: StatusPoller::new(backend.clone(), config.analysis_poll_interval),
            backend,
            store,
            extractor: SidecarExtractor::default(),
            entries: Arc::new(DashMap::new()),
            sessions: Arc::new(DashMap::new()),
            next_seq: AtomicU64::new(0),
            changed: Arc::new(Notify::new()),
        }
    }

    /// Use a different sidecar marker for analysis payloads.
    pub fn with_extractor(mut self, extractor: SidecarExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn state(&self, entity_id: &str) -> Option<SubJobState> {
        self.entries.get(entity_id).map(|e| e.value().clone())
    }

    pub fn translation(&self, entity_id: &str) -> TranslationState {
        self.entries
            .get(entity_id)
            .map(|e| e.translation.clone())
            .unwrap_or_default()
    }

    pub fn analysis(&self, entity_id: &str) -> Option<AnalysisState> {
        self.entries.get(entity_id).and_then(|e| e.analysis.clone())
    }

    /// Translate `paper`'s title and abstract.
    ///
    /// Can be called again from any state. Overlapping calls for the same
    /// paper are not serialized: whichever answer arrives last is kept.
    pub async fn translate(&self, paper: &Paper) -> Result<Translation, CoreError> {
        let id = paper.short_id().to_string();
        update_translation(&self.entries, &id, |t| {
            t.status = TranslationStatus::Translating;
            t.error = None;
        });

        let result = self.backend.translate(&paper.title, &paper.summary).await;
        match &result {
            Ok(translation) => update_translation(&self.entries, &id, |t| {
                *t = TranslationState {
                    status: TranslationStatus::Translated,
                    translated_title: Some(translation.display_title()),
                    translated_abstract: Some(translation.translated_abstract.clone()),
                    error: None,
                };
            }),
            Err(e) => {
                log::debug!("translation of {id} failed: {e}");
                update_translation(&self.entries, &id, |t| {
                    t.status = TranslationStatus::Error;
                    t.error = Some(e.to_string());
                });
            }
        }
        self.changed.notify_waiters();
        result
    }

    /// Producer side of an analysis: stage `paper` so another context can open
    /// it. Returns the entity id to open.
    pub fn launch_analysis(&self, paper: &Paper) -> Result<String, CoreError> {
        let id = paper.short_id().to_string();
        self.store.put_entity(&id, serde_json::to_value(paper)?)?;
        Ok(id)
    }

    /// Consumer side of an analysis: read the staged paper, start its analysis
    /// and poll it until it ends or [`close_analysis`](Self::close_analysis)
    /// is called. An earlier session for the same entity is replaced.
    pub async fn open_analysis(&self, entity_id: &str) -> Result<(), CoreError> {
        let paper: Paper = self.store.peek_entity(entity_id)?.decode()?;
        self.remove_session(entity_id);
        set_analysis(&self.entries, entity_id, AnalysisState::running());

        let handle = match self.backend.start(&JobRequest::AnalyzePaper(paper)).await {
            Ok(handle) => handle,
            Err(e) => {
                set_analysis(&self.entries, entity_id, AnalysisState::failed(e.to_string()));
                self.changed.notify_waiters();
                return Err(e);
            }
        };
        log::info!("analysis of {entity_id} started: {}", handle.message);

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let id = entity_id.to_string();
        let target = StatusTarget::Entity(id.clone());
        let poller = self.poller.clone();
        let extractor = self.extractor.clone();
        let entries = self.entries.clone();
        let sessions = self.sessions.clone();
        let changed = self.changed.clone();

        let session = PollSession::spawn(move |cancel| async move {
            let Some(report) = poller.poll_until_terminal(&target, &cancel, |_| {}).await else {
                return;
            };
            {
                // Checked under the entry lock: a reopen sets `running` under
                // the same lock only after this session was cancelled.
                let mut entry = entries.entry(id.clone()).or_default();
                if cancel.is_cancelled() {
                    log::debug!("dropping analysis result for closed session {id}");
                    return;
                }
                entry.analysis = Some(finished_analysis(&extractor, report));
            }
            sessions.remove_if(&id, |_, tracked| tracked.seq == seq);
            changed.notify_waiters();
        });
        self.sessions
            .insert(entity_id.to_string(), TrackedSession { seq, session });
        Ok(())
    }

    /// Tear down the analysis session for `entity_id`, whatever its state.
    /// Returns whether a session existed.
    pub fn close_analysis(&self, entity_id: &str) -> bool {
        let closed = self.remove_session(entity_id);
        if closed {
            self.changed.notify_waiters();
        }
        closed
    }

    fn remove_session(&self, entity_id: &str) -> bool {
        match self.sessions.remove(entity_id) {
            Some((_, tracked)) => {
                tracked.session.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_analysis_live(&self, entity_id: &str) -> bool {
        self.sessions
            .get(entity_id)
            .is_some_and(|tracked| tracked.session.is_live())
    }

    /// Wait for `entity_id`'s analysis to leave `running`.
    ///
    /// Returns `None` if no analysis was opened for it. If its session was
    /// closed while still running, the running state is returned as is.
    pub async fn wait_for_analysis(&self, entity_id: &str) -> Option<AnalysisState> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let state = self.analysis(entity_id)?;
            if state.status != AnalysisStatus::Running {
                // Sessions that finished before they were registered.
                self.sessions
                    .remove_if(entity_id, |_, tracked| !tracked.session.is_live());
                return Some(state);
            }
            if !self.sessions.contains_key(entity_id) {
                return Some(state);
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for SubJobTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubJobTracker")
            .field("entries", &self.entries.len())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

fn update_translation(
    entries: &DashMap<String, SubJobState>,
    id: &str,
    f: impl FnOnce(&mut TranslationState),
) {
    f(&mut entries.entry(id.to_string()).or_default().translation);
}

fn set_analysis(entries: &DashMap<String, SubJobState>, id: &str, state: AnalysisState) {
    entries.entry(id.to_string()).or_default().analysis = Some(state);
}

fn finished_analysis(extractor: &SidecarExtractor, report: StatusReport) -> AnalysisState {
    match report.status {
        JobStatus::Success => {
            let split = extractor.split(report.payload.as_deref().unwrap_or_default());
            AnalysisState {
                status: AnalysisStatus::Success,
                content: Some(split.content),
                gallery: split.gallery,
                error: None,
            }
        }
        JobStatus::Error => AnalysisState::failed(report.message),
        other => AnalysisState::failed(format!("analysis ended with status {other}")),
    }
}
