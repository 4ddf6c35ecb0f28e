//! HTTP client for the paper service.
//!
//! [`RemoteJobClient`] wraps every endpoint the service exposes. The subset the
//! polling and aggregation machinery needs is captured by the [`JobBackend`]
//! trait so those components can be driven by any implementation.
//!
//! No call is retried here: network failures surface as
//! [`CoreError::Network`], non-2xx answers as [`CoreError::Remote`] carrying the
//! backend's own message.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::types::{Acknowledgement, AnalysisReport};
use crate::{
    Config, CoreError, JobHandle, JobRequest, Paper, ResultsPage, StatusReport, StatusTarget,
    Translation,
};

/// The job-tracking operations of the paper service.
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Start a job; the returned handle names the status endpoint to poll.
    async fn start(&self, request: &JobRequest) -> Result<JobHandle, CoreError>;

    /// Query the current status of the job behind `target`.
    async fn query_status(&self, target: &StatusTarget) -> Result<StatusReport, CoreError>;

    /// Fetch one page (1-based) of the coarse job's result set.
    async fn fetch_page(&self, page: usize, per_page: usize) -> Result<ResultsPage, CoreError>;

    /// Translate a title and abstract.
    async fn translate(&self, title: &str, summary: &str) -> Result<Translation, CoreError>;

    /// Drop the backend's cached results. Returns its confirmation message.
    async fn clear_cache(&self) -> Result<String, CoreError>;
}

/// Client for the paper service's `/api` surface.
#[derive(Debug, Clone)]
pub struct RemoteJobClient {
    base_url: String,
    http: reqwest::Client,
}

impl RemoteJobClient {
    pub fn new(config: &Config) -> Result<Self, CoreError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().map_err(|e| {
            CoreError::InvalidRequest(format!("could not build HTTP client: {e}"))
        })?;
        Ok(Self::with_client(&config.api_base_url, http))
    }

    /// Use an existing `reqwest::Client` (shared connection pool).
    pub fn with_client(base_url: &str, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `GET /api/status`
    pub async fn status(&self) -> Result<StatusReport, CoreError> {
        let resp = self.http.get(self.url("/api/status")).send().await?;
        decode(resp).await
    }

    /// `GET /api/analysis-status/{id}`
    pub async fn analysis_status(&self, entity_id: &str) -> Result<StatusReport, CoreError> {
        let url = self.url(&format!(
            "/api/analysis-status/{}",
            urlencoding::encode(entity_id)
        ));
        let resp = self.http.get(url).send().await?;
        let report: AnalysisReport = decode(resp).await?;
        Ok(report.into())
    }

    /// `GET /api/results?page=N&per_page=M`
    pub async fn results_page(&self, page: usize, per_page: usize) -> Result<ResultsPage, CoreError> {
        let resp = self
            .http
            .get(self.url("/api/results"))
            .query(&[("page", page), ("per_page", per_page)])
            .send()
            .await?;
        decode(resp).await
    }

    /// `POST /api/clear-cache`, returning the backend's confirmation message.
    pub async fn clear_results_cache(&self) -> Result<String, CoreError> {
        let resp = self.http.post(self.url("/api/clear-cache")).send().await?;
        let ack: Acknowledgement = decode(resp).await?;
        Ok(ack.message)
    }

    /// `GET /api/recent-analyses`, cache-busted with the current time.
    pub async fn recent_analyses(&self) -> Result<Vec<Paper>, CoreError> {
        let now = chrono::Utc::now().timestamp_millis();
        let resp = self
            .http
            .get(self.url("/api/recent-analyses"))
            .query(&[("_", now)])
            .send()
            .await?;
        decode(resp).await
    }

    /// `GET /api/all-analyses?query=`
    pub async fn all_analyses(&self, query: &str) -> Result<Vec<Paper>, CoreError> {
        let resp = self
            .http
            .get(self.url("/api/all-analyses"))
            .query(&[("query", query)])
            .send()
            .await?;
        decode(resp).await
    }

    /// `POST /api/translate`
    pub async fn translate_text(&self, title: &str, summary: &str) -> Result<Translation, CoreError> {
        let resp = self
            .http
            .post(self.url("/api/translate"))
            .json(&json!({ "title": title, "abstract": summary }))
            .send()
            .await?;
        decode(resp).await
    }

    /// `POST /api/email-result` for a single analyzed paper.
    pub async fn email_result(&self, paper: &Paper, email: &str) -> Result<String, CoreError> {
        let resp = self
            .http
            .post(self.url("/api/email-result"))
            .json(&json!({ "paper": paper, "email": email }))
            .send()
            .await?;
        let ack: Acknowledgement = decode(resp).await?;
        Ok(ack.message)
    }

    async fn post_start(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<String, CoreError> {
        let resp = self.http.post(self.url(path)).json(&body).send().await?;
        let ack: Acknowledgement = decode(resp).await?;
        Ok(ack.message)
    }
}

#[async_trait]
impl JobBackend for RemoteJobClient {
    async fn start(&self, request: &JobRequest) -> Result<JobHandle, CoreError> {
        let message = match request {
            JobRequest::Fetch(query) => {
                self.post_start("/api/run-fetch", serde_json::to_value(query)?)
                    .await?
            }
            JobRequest::AnalyzeAndEmail { papers, email } => {
                if papers.is_empty() {
                    return Err(CoreError::InvalidRequest(
                        "no papers selected for analysis".to_string(),
                    ));
                }
                self.post_start(
                    "/api/analyze-and-email",
                    json!({ "papers": papers, "email": email }),
                )
                .await?
            }
            JobRequest::AnalyzePaper(paper) => {
                self.post_start("/api/analyze-paper", json!({ "paper": paper }))
                    .await?
            }
        };
        Ok(JobHandle {
            target: request.target(),
            message,
        })
    }

    async fn query_status(&self, target: &StatusTarget) -> Result<StatusReport, CoreError> {
        match target {
            StatusTarget::Coarse => self.status().await,
            StatusTarget::Entity(id) => self.analysis_status(id).await,
        }
    }

    async fn fetch_page(&self, page: usize, per_page: usize) -> Result<ResultsPage, CoreError> {
        self.results_page(page, per_page).await
    }

    async fn translate(&self, title: &str, summary: &str) -> Result<Translation, CoreError> {
        self.translate_text(title, summary).await
    }

    async fn clear_cache(&self) -> Result<String, CoreError> {
        self.clear_results_cache().await
    }
}

/// Decode a JSON body, turning non-2xx answers into [`CoreError::Remote`].
async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, CoreError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        let message = remote_message(&body).unwrap_or_else(|| status.to_string());
        return Err(CoreError::Remote {
            status: Some(status.as_u16()),
            message,
        });
    }

    // Acknowledgement endpoints may answer with an empty body.
    let bytes = resp.bytes().await?;
    let body: &[u8] = if bytes.iter().all(u8::is_ascii_whitespace) {
        b"{}"
    } else {
        &bytes
    };
    serde_json::from_slice(body).map_err(|e| CoreError::MalformedPayload(e.to_string()))
}

/// Pull `message` (or `error`) out of an error body.
fn remote_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("message")
        .or_else(|| value.get("error"))
        .and_then(|m| m.as_str())
        .map(str::to_string)
}
