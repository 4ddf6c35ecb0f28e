//! Wire types for the paper service's HTTP API.
//!
//! Each endpoint gets an explicit shape; anything that fails to decode into
//! these types surfaces as [`CoreError::MalformedPayload`] at the client
//! boundary instead of leaking half-populated values to callers.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Prefix the translation service sometimes leaves on translated titles.
static TITLE_LABEL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^标题[:：]?\s*").unwrap());

/// A paper record as returned by the fetch results and analysis history endpoints.
///
/// Fields the client does not interpret are kept in `extra` so a record survives
/// a handoff round trip unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paper {
    pub entry_id: String,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub pdf_url: Option<String>,
    #[serde(default)]
    pub published: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Paper {
    /// Short identifier: the last path segment of `entry_id`
    /// (`http://arxiv.org/abs/2401.00001v1` -> `2401.00001v1`).
    pub fn short_id(&self) -> &str {
        self.entry_id
            .rsplit('/')
            .next()
            .unwrap_or(self.entry_id.as_str())
    }
}

/// Status of a backend-tracked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Idle,
    Running,
    ReviewReady,
    Success,
    Error,
}

impl JobStatus {
    /// Every status except `Running` ends a polling session.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::ReviewReady => "review_ready",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One observation of a job's status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: JobStatus,
    #[serde(default)]
    pub message: String,
    /// Result body delivered with the status (per-entity analysis content).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl StatusReport {
    pub fn new(status: JobStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            payload: None,
        }
    }
}

/// One page of `/api/results`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResultsPage {
    pub papers: Vec<Paper>,
    pub total_papers: usize,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub per_page: Option<usize>,
}

/// Publication window for a fetch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DateRange {
    #[default]
    #[serde(rename = "recent")]
    Recent,
    #[serde(rename = "last_month")]
    LastMonth,
    #[serde(rename = "last_3_months")]
    Last3Months,
    #[serde(rename = "last_year")]
    LastYear,
    #[serde(rename = "last_2_years")]
    Last2Years,
}

impl DateRange {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recent => "recent",
            Self::LastMonth => "last_month",
            Self::Last3Months => "last_3_months",
            Self::LastYear => "last_year",
            Self::Last2Years => "last_2_years",
        }
    }
}

impl FromStr for DateRange {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "recent" => Ok(Self::Recent),
            "last_month" => Ok(Self::LastMonth),
            "last_3_months" => Ok(Self::Last3Months),
            "last_year" => Ok(Self::LastYear),
            "last_2_years" => Ok(Self::Last2Years),
            other => Err(CoreError::InvalidRequest(format!(
                "unknown date range '{other}' (expected recent, last_month, last_3_months, last_year or last_2_years)"
            ))),
        }
    }
}

/// Body of `POST /api/run-fetch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchQuery {
    pub date_range: Option<DateRange>,
    pub categories: Option<Vec<String>>,
    pub keywords: Vec<String>,
}

impl FetchQuery {
    /// Build a query from a comma-separated keyword list.
    ///
    /// Keywords are trimmed and empty entries dropped; at least one must remain.
    /// `Recent` and an empty category list are sent as null so the backend
    /// applies its own defaults.
    pub fn new(
        keywords: &str,
        categories: Vec<String>,
        date_range: DateRange,
    ) -> Result<Self, CoreError> {
        let keywords: Vec<String> = keywords
            .split(',')
            .map(str::trim)
            .filter(|kw| !kw.is_empty())
            .map(str::to_string)
            .collect();
        if keywords.is_empty() {
            return Err(CoreError::InvalidRequest(
                "please enter at least one keyword".to_string(),
            ));
        }

        let categories: Vec<String> = categories
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();

        Ok(Self {
            date_range: (date_range != DateRange::Recent).then_some(date_range),
            categories: (!categories.is_empty()).then_some(categories),
            keywords,
        })
    }
}

/// Which status endpoint observes a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StatusTarget {
    /// The single backend-wide task behind `/api/status`.
    Coarse,
    /// A per-paper analysis behind `/api/analysis-status/{id}`.
    Entity(String),
}

/// A job-start request.
#[derive(Debug, Clone)]
pub enum JobRequest {
    Fetch(FetchQuery),
    AnalyzeAndEmail {
        papers: Vec<Paper>,
        email: Option<String>,
    },
    AnalyzePaper(Paper),
}

impl JobRequest {
    /// The status endpoint that reports on this job once started.
    pub fn target(&self) -> StatusTarget {
        match self {
            Self::Fetch(_) | Self::AnalyzeAndEmail { .. } => StatusTarget::Coarse,
            Self::AnalyzePaper(paper) => StatusTarget::Entity(paper.short_id().to_string()),
        }
    }
}

/// Returned by a successful job start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub target: StatusTarget,
    pub message: String,
}

/// Body of a `POST /api/translate` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Translation {
    pub translated_title: String,
    pub translated_abstract: String,
}

impl Translation {
    /// Translated title with any leading "标题:" label removed.
    pub fn display_title(&self) -> String {
        TITLE_LABEL_RE
            .replace(&self.translated_title, "")
            .trim()
            .to_string()
    }
}

/// One figure of an analysis gallery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GalleryImage {
    pub src: String,
    pub alt: String,
}

/// `{"message": ...}` acknowledgement bodies (run-fetch, clear-cache, email).
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct Acknowledgement {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum RemoteAnalysisStatus {
    Success,
    Error,
    #[serde(other)]
    Running,
}

/// Body of `GET /api/analysis-status/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct AnalysisReport {
    pub status: RemoteAnalysisStatus,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl From<AnalysisReport> for StatusReport {
    fn from(report: AnalysisReport) -> Self {
        match report.status {
            RemoteAnalysisStatus::Success => StatusReport {
                status: JobStatus::Success,
                message: report.message.unwrap_or_default(),
                payload: Some(report.content.unwrap_or_default()),
            },
            RemoteAnalysisStatus::Error => StatusReport {
                status: JobStatus::Error,
                message: report
                    .message
                    .unwrap_or_else(|| "analysis failed".to_string()),
                payload: None,
            },
            RemoteAnalysisStatus::Running => StatusReport {
                status: JobStatus::Running,
                message: report.message.unwrap_or_default(),
                payload: None,
            },
        }
    }
}
