//! Scripted in-memory [`JobBackend`] for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{
    CoreError, JobBackend, JobHandle, JobRequest, JobStatus, Paper, ResultsPage, StatusReport,
    StatusTarget, Translation,
};

pub(crate) fn paper(id: &str) -> Paper {
    Paper {
        entry_id: format!("http://arxiv.org/abs/{id}"),
        title: format!("Paper {id}"),
        summary: format!("Summary of {id}"),
        authors: vec!["A. Author".to_string()],
        pdf_url: Some(format!("http://arxiv.org/pdf/{id}")),
        published: Some("2024-01-01T00:00:00".to_string()),
        categories: vec!["cs.AI".to_string()],
        extra: Default::default(),
    }
}

pub(crate) fn papers(n: usize) -> Vec<Paper> {
    (0..n).map(|i| paper(&format!("2401.{i:05}"))).collect()
}

pub(crate) fn report(status: JobStatus) -> StatusReport {
    StatusReport::new(status, format!("{status} message"))
}

pub(crate) fn network_error() -> CoreError {
    CoreError::Network("connection refused".to_string())
}

#[derive(Default)]
pub(crate) struct ScriptedBackend {
    statuses: Mutex<HashMap<StatusTarget, VecDeque<Result<StatusReport, CoreError>>>>,
    results: Mutex<Vec<Paper>>,
    failing_page: Mutex<Option<usize>>,
    page_delay: Mutex<Option<Duration>>,
    status_delays: Mutex<HashMap<StatusTarget, Duration>>,
    translations: Mutex<HashMap<String, VecDeque<Result<Translation, CoreError>>>>,
    translate_delays: Mutex<HashMap<String, Duration>>,
    start_errors: Mutex<HashMap<StatusTarget, CoreError>>,
    clear_cache_error: Mutex<Option<CoreError>>,
    pub started: Mutex<Vec<StatusTarget>>,
    pub status_calls: Mutex<Vec<(StatusTarget, Instant)>>,
    pub page_calls: Mutex<Vec<usize>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue status answers for `target`. Once exhausted, `running` is returned.
    pub fn script_status(
        &self,
        target: StatusTarget,
        answers: Vec<Result<StatusReport, CoreError>>,
    ) -> &Self {
        self.statuses
            .lock()
            .unwrap()
            .entry(target)
            .or_default()
            .extend(answers);
        self
    }

    pub fn with_results(&self, papers: Vec<Paper>) -> &Self {
        *self.results.lock().unwrap() = papers;
        self
    }

    pub fn fail_page(&self, page: usize) -> &Self {
        *self.failing_page.lock().unwrap() = Some(page);
        self
    }

    /// Every page fetch takes `delay` before answering.
    pub fn delay_pages(&self, delay: Duration) -> &Self {
        *self.page_delay.lock().unwrap() = Some(delay);
        self
    }

    /// Status queries for `target` take `delay` before answering. The answer
    /// is picked when the query is made.
    pub fn delay_status(&self, target: StatusTarget, delay: Duration) -> &Self {
        self.status_delays.lock().unwrap().insert(target, delay);
        self
    }

    pub fn script_translation(
        &self,
        title: &str,
        answer: Result<Translation, CoreError>,
    ) -> &Self {
        self.translations
            .lock()
            .unwrap()
            .entry(title.to_string())
            .or_default()
            .push_back(answer);
        self
    }

    pub fn delay_translation(&self, title: &str, delay: Duration) -> &Self {
        self.translate_delays
            .lock()
            .unwrap()
            .insert(title.to_string(), delay);
        self
    }

    pub fn fail_start(&self, target: StatusTarget, err: CoreError) -> &Self {
        self.start_errors.lock().unwrap().insert(target, err);
        self
    }

    pub fn fail_clear_cache(&self, err: CoreError) -> &Self {
        *self.clear_cache_error.lock().unwrap() = Some(err);
        self
    }

    pub fn status_call_count(&self, target: &StatusTarget) -> usize {
        self.status_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == target)
            .count()
    }
}

#[async_trait]
impl JobBackend for ScriptedBackend {
    async fn start(&self, request: &JobRequest) -> Result<JobHandle, CoreError> {
        let target = request.target();
        if let Some(err) = self.start_errors.lock().unwrap().remove(&target) {
            return Err(err);
        }
        self.started.lock().unwrap().push(target.clone());
        Ok(JobHandle {
            target,
            message: "started".to_string(),
        })
    }

    async fn query_status(&self, target: &StatusTarget) -> Result<StatusReport, CoreError> {
        self.status_calls
            .lock()
            .unwrap()
            .push((target.clone(), Instant::now()));
        let answer = self
            .statuses
            .lock()
            .unwrap()
            .get_mut(target)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(report(JobStatus::Running)));
        let delay = self.status_delays.lock().unwrap().get(target).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        answer
    }

    async fn fetch_page(&self, page: usize, per_page: usize) -> Result<ResultsPage, CoreError> {
        self.page_calls.lock().unwrap().push(page);
        let delay = *self.page_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.failing_page.lock().unwrap() == Some(page) {
            return Err(CoreError::Remote {
                status: Some(500),
                message: format!("page {page} exploded"),
            });
        }
        let results = self.results.lock().unwrap();
        let start = (page - 1) * per_page;
        let papers = results
            .iter()
            .skip(start)
            .take(per_page)
            .cloned()
            .collect();
        Ok(ResultsPage {
            papers,
            total_papers: results.len(),
            page: Some(page),
            per_page: Some(per_page),
        })
    }

    async fn translate(&self, title: &str, summary: &str) -> Result<Translation, CoreError> {
        let delay = self.translate_delays.lock().unwrap().get(title).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .translations
            .lock()
            .unwrap()
            .get_mut(title)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| {
            Ok(Translation {
                translated_title: format!("T({title})"),
                translated_abstract: format!("T({summary})"),
            })
        })
    }

    async fn clear_cache(&self) -> Result<String, CoreError> {
        match self.clear_cache_error.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok("Cache cleared successfully.".to_string()),
        }
    }
}
