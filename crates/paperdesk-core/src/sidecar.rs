//! Extraction of structured sidecar data embedded in analysis text.
//!
//! The analysis service appends its figure gallery to the markdown body as an
//! HTML comment:
//!
//! ```text
//! <!-- FIGURES_GALLERY_DATA: [{"src": "...", "alt": "..."}] -->
//! ```
//!
//! [`SidecarExtractor::split`] removes that comment from the text and decodes
//! the JSON blob. A blob that does not decode never fails the analysis; the
//! gallery just comes back empty.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::{CoreError, GalleryImage};

/// Marker name the analysis service uses for its figure gallery.
pub const GALLERY_MARKER: &str = "FIGURES_GALLERY_DATA";

static GALLERY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<!--\s*FIGURES_GALLERY_DATA:\s*(.*?)\s*-->").unwrap());

/// Primary content with the sidecar span removed, plus the decoded gallery.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SidecarSplit {
    pub content: String,
    pub gallery: Vec<GalleryImage>,
}

/// Finds `<!-- MARKER: <json> -->` spans for one marker name.
#[derive(Debug, Clone)]
pub struct SidecarExtractor {
    marker: String,
    pattern: Regex,
}

impl Default for SidecarExtractor {
    fn default() -> Self {
        Self {
            marker: GALLERY_MARKER.to_string(),
            pattern: GALLERY_PATTERN.clone(),
        }
    }
}

impl SidecarExtractor {
    /// Extractor for `marker`. Fails only if the pattern exceeds the regex
    /// size limit.
    pub fn new(marker: &str) -> Result<Self, CoreError> {
        let pattern = Regex::new(&format!(
            r"(?s)<!--\s*{}:\s*(.*?)\s*-->",
            regex::escape(marker)
        ))
        .map_err(|e| CoreError::InvalidRequest(format!("sidecar marker {marker:?}: {e}")))?;
        Ok(Self {
            marker: marker.to_string(),
            pattern,
        })
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Split `text` into cleaned content and gallery.
    ///
    /// - no marker: content unchanged, empty gallery
    /// - one marker: span removed, blob decoded (empty gallery if it does not parse)
    /// - several markers: all spans removed, gallery rejected as ambiguous
    pub fn split(&self, text: &str) -> SidecarSplit {
        let mut spans = self.pattern.captures_iter(text);
        let Some(first) = spans.next() else {
            return SidecarSplit {
                content: text.to_string(),
                gallery: Vec::new(),
            };
        };

        let extra = spans.count();
        let gallery = if extra > 0 {
            log::warn!(
                "{} {} markers in one payload; ignoring gallery data",
                extra + 1,
                self.marker
            );
            Vec::new()
        } else {
            let blob = first.get(1).map_or("", |m| m.as_str());
            parse_gallery(blob).unwrap_or_else(|e| {
                log::warn!("discarding {} sidecar: {e}", self.marker);
                Vec::new()
            })
        };

        let content = self.pattern.replace_all(text, "").trim_end().to_string();
        SidecarSplit { content, gallery }
    }
}

/// Split with the analysis service's gallery marker.
pub fn extract_gallery(text: &str) -> SidecarSplit {
    SidecarExtractor::default().split(text)
}

/// Decode a gallery blob: a JSON array of `{src, alt}` objects.
pub fn parse_gallery(blob: &str) -> Result<Vec<GalleryImage>, CoreError> {
    serde_json::from_str(blob).map_err(|e| CoreError::MalformedPayload(e.to_string()))
}
