//! Draining of the paginated result set behind a `review_ready` job.

use std::sync::Arc;

use chrono::Utc;

use crate::handoff::{results_key, HandoffStore};
use crate::{CoreError, JobBackend, Paper};

/// Page size used against `/api/results`.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Progress of one drain. Every field only grows within a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregationProgress {
    pub items_loaded: usize,
    pub items_total: usize,
    pub pages_fetched: usize,
}

impl AggregationProgress {
    pub fn message(&self) -> String {
        if self.pages_fetched == 0 {
            "Loading results page 1...".to_string()
        } else {
            format!(
                "Loading results... ({} / {})",
                self.items_loaded, self.items_total
            )
        }
    }

    pub fn is_complete(&self) -> bool {
        self.pages_fetched > 0 && self.items_loaded >= self.items_total
    }
}

/// A result set written to the handoff store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResults {
    pub key: String,
    pub count: usize,
}

/// Walks `/api/results` page by page and hands the full set off under a fresh key.
#[derive(Clone)]
pub struct ResultAggregator {
    backend: Arc<dyn JobBackend>,
    store: Arc<dyn HandoffStore>,
    page_size: usize,
}

impl ResultAggregator {
    pub fn new(
        backend: Arc<dyn JobBackend>,
        store: Arc<dyn HandoffStore>,
        page_size: usize,
    ) -> Self {
        Self {
            backend,
            store,
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Fetch every page in order and concatenate them.
    ///
    /// Page 1 fixes the total; pages `2..=ceil(total / page_size)` follow
    /// strictly sequentially because the backend paginates by offset. The
    /// first failing page aborts the whole run.
    pub async fn drain<F>(&self, mut progress: F) -> Result<Vec<Paper>, CoreError>
    where
        F: FnMut(AggregationProgress) + Send,
    {
        let mut state = AggregationProgress::default();
        progress(state);

        let first = self.backend.fetch_page(1, self.page_size).await?;
        let total = first.total_papers;
        let pages_total = total.div_ceil(self.page_size);

        let mut papers = Vec::with_capacity(total);
        papers.extend(first.papers);
        state = AggregationProgress {
            items_loaded: papers.len(),
            items_total: total,
            pages_fetched: 1,
        };
        progress(state);

        for page in 2..=pages_total {
            let next = self.backend.fetch_page(page, self.page_size).await?;
            papers.extend(next.papers);
            state.items_loaded = papers.len();
            state.pages_fetched = page;
            progress(state);
        }

        if papers.len() != total {
            return Err(CoreError::MalformedPayload(format!(
                "backend reported {total} results but {} were returned",
                papers.len()
            )));
        }
        Ok(papers)
    }

    /// Drain the result set and store it for a consumer.
    ///
    /// Nothing is stored unless every page arrived.
    pub async fn aggregate<F>(&self, progress: F) -> Result<StoredResults, CoreError>
    where
        F: FnMut(AggregationProgress) + Send,
    {
        let papers = self.drain(progress).await?;
        let key = results_key(Utc::now());
        self.store.put(&key, serde_json::to_value(&papers)?)?;
        log::info!("stored {} results under {key}", papers.len());
        Ok(StoredResults {
            key,
            count: papers.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{papers, ScriptedBackend};
    use crate::MemoryHandoffStore;

    fn aggregator(
        backend: &Arc<ScriptedBackend>,
        store: &Arc<MemoryHandoffStore>,
    ) -> ResultAggregator {
        ResultAggregator::new(backend.clone(), store.clone(), DEFAULT_PAGE_SIZE)
    }

    #[tokio::test]
    async fn drains_all_pages_in_order() {
        let backend = Arc::new(ScriptedBackend::new());
        let expected = papers(110);
        backend.with_results(expected.clone());
        let store = Arc::new(MemoryHandoffStore::new());

        let drained = aggregator(&backend, &store).drain(|_| {}).await.unwrap();

        assert_eq!(drained, expected);
        assert_eq!(*backend.page_calls.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn aggregate_stores_full_set_once() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.with_results(papers(110));
        let store = Arc::new(MemoryHandoffStore::new());

        let stored = aggregator(&backend, &store).aggregate(|_| {}).await.unwrap();
        assert!(stored.key.starts_with("results_"));
        assert_eq!(stored.count, 110);

        let key = stored.key;
        let record = store.take(&key).unwrap();
        let stored: Vec<Paper> = record.decode().unwrap();
        assert_eq!(stored.len(), 110);
        assert_eq!(stored[50].entry_id, "http://arxiv.org/abs/2401.00050");
        assert!(store.take(&key).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn page_failure_leaves_no_record() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.with_results(papers(110)).fail_page(2);
        let store = Arc::new(MemoryHandoffStore::new());

        let err = aggregator(&backend, &store)
            .aggregate(|_| {})
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "page 2 exploded");
        assert!(store.is_empty());
        assert_eq!(*backend.page_calls.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn progress_is_monotonic() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.with_results(papers(110));
        let store = Arc::new(MemoryHandoffStore::new());

        let mut seen = Vec::new();
        aggregator(&backend, &store)
            .drain(|p| seen.push(p))
            .await
            .unwrap();

        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0].message(), "Loading results page 1...");
        assert!(seen.windows(2).all(|w| {
            w[0].items_loaded <= w[1].items_loaded && w[0].pages_fetched <= w[1].pages_fetched
        }));
        assert_eq!(
            seen[1].message(),
            "Loading results... (50 / 110)"
        );
        let last = seen.last().unwrap();
        assert_eq!((last.items_loaded, last.items_total, last.pages_fetched), (110, 110, 3));
        assert!(last.is_complete());
    }

    #[tokio::test]
    async fn empty_result_set() {
        let backend = Arc::new(ScriptedBackend::new());
        let store = Arc::new(MemoryHandoffStore::new());

        let result = aggregator(&backend, &store).aggregate(|_| {}).await.unwrap();

        assert_eq!(result.count, 0);
        assert_eq!(*backend.page_calls.lock().unwrap(), vec![1]);
        let stored: Vec<Paper> = store.take(&result.key).unwrap().decode().unwrap();
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn exact_multiple_of_page_size() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.with_results(papers(100));
        let store = Arc::new(MemoryHandoffStore::new());

        let drained = aggregator(&backend, &store).drain(|_| {}).await.unwrap();
        assert_eq!(drained.len(), 100);
        assert_eq!(*backend.page_calls.lock().unwrap(), vec![1, 2]);
    }
}
