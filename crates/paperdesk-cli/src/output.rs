//! Plain-text rendering of papers, analyses and status.

use owo_colors::OwoColorize;

use paperdesk_core::{AnalysisState, AnalysisStatus, JobStatus, Paper, StatusView, TranslationState};

const MAX_AUTHORS: usize = 3;

/// Colors on or off for one invocation.
#[derive(Debug, Clone, Copy)]
pub struct Style {
    color: bool,
}

impl Style {
    pub fn new(color: bool) -> Self {
        Self { color }
    }

    pub fn bold(&self, text: &str) -> String {
        if self.color {
            text.bold().to_string()
        } else {
            text.to_string()
        }
    }

    pub fn dim(&self, text: &str) -> String {
        if self.color {
            text.dimmed().to_string()
        } else {
            text.to_string()
        }
    }

    pub fn ok(&self, text: &str) -> String {
        if self.color {
            text.green().to_string()
        } else {
            text.to_string()
        }
    }

    pub fn err(&self, text: &str) -> String {
        if self.color {
            text.red().to_string()
        } else {
            text.to_string()
        }
    }

    pub fn key(&self, text: &str) -> String {
        if self.color {
            text.cyan().to_string()
        } else {
            text.to_string()
        }
    }

    pub fn status(&self, status: JobStatus) -> String {
        let label = format!("[{}]", status.label());
        match status {
            JobStatus::Success | JobStatus::ReviewReady => self.ok(&label),
            JobStatus::Error => self.err(&label),
            JobStatus::Running | JobStatus::Idle => self.dim(&label),
        }
    }
}

pub fn authors_line(authors: &[String]) -> String {
    if authors.len() > MAX_AUTHORS {
        format!("{} et al.", authors[..MAX_AUTHORS].join(", "))
    } else {
        authors.join(", ")
    }
}

/// One numbered entry of a paper list.
pub fn paper_block(index: usize, paper: &Paper, style: Style) -> String {
    let mut meta = vec![style.key(paper.short_id())];
    if let Some(published) = &paper.published {
        meta.push(published.chars().take(10).collect());
    }
    if !paper.authors.is_empty() {
        meta.push(authors_line(&paper.authors));
    }

    let mut block = format!(
        "{:>3}. {}\n     {}",
        index + 1,
        style.bold(&paper.title),
        meta.join(" | ")
    );
    if !paper.categories.is_empty() {
        block.push_str(&format!("\n     {}", style.dim(&paper.categories.join(", "))));
    }
    block
}

pub fn status_line(view: &StatusView, style: Style) -> String {
    format!("{} {}", style.status(view.status), view.message)
}

pub fn translation_block(paper: &Paper, state: &TranslationState, style: Style) -> String {
    match (&state.translated_title, &state.error) {
        (_, Some(error)) => format!(
            "{} {}: {}",
            style.err("✗"),
            paper.short_id(),
            error
        ),
        (Some(title), None) => format!(
            "{} {}: {}\n     {}",
            style.ok("✓"),
            paper.short_id(),
            style.bold(title),
            state.translated_abstract.as_deref().unwrap_or_default()
        ),
        (None, None) => format!("{} {}: not translated", style.dim("-"), paper.short_id()),
    }
}

pub fn analysis_block(entity_id: &str, state: &AnalysisState, style: Style) -> String {
    match state.status {
        AnalysisStatus::Success => {
            let mut block = format!(
                "{} {}\n\n{}",
                style.ok("==>"),
                style.bold(entity_id),
                state.content.as_deref().unwrap_or_default()
            );
            if !state.gallery.is_empty() {
                block.push_str(&format!("\n\n{}", style.bold("Figures:")));
                for image in &state.gallery {
                    block.push_str(&format!("\n  - {} {}", image.alt, style.dim(&image.src)));
                }
            }
            block
        }
        AnalysisStatus::Error => format!(
            "{} {}: {}",
            style.err("==>"),
            style.bold(entity_id),
            state.error.as_deref().unwrap_or("analysis failed")
        ),
        AnalysisStatus::Running => format!(
            "{} {}: still running",
            style.dim("==>"),
            style.bold(entity_id)
        ),
    }
}

#[cfg(test)]
mod tests {
    use paperdesk_core::GalleryImage;

    use super::*;

    fn paper() -> Paper {
        serde_json::from_value(serde_json::json!({
            "entry_id": "http://arxiv.org/abs/1706.03762v7",
            "title": "Attention Is All You Need",
            "authors": ["Vaswani", "Shazeer", "Parmar", "Uszkoreit"],
            "published": "2017-06-12T17:57:34",
            "categories": ["cs.CL", "cs.LG"]
        }))
        .unwrap()
    }

    #[test]
    fn paper_block_plain() {
        let block = paper_block(0, &paper(), Style::new(false));
        assert_eq!(
            block,
            "  1. Attention Is All You Need\n     1706.03762v7 | 2017-06-12 | Vaswani, Shazeer, Parmar et al.\n     cs.CL, cs.LG"
        );
    }

    #[test]
    fn short_author_lists_are_complete() {
        assert_eq!(authors_line(&["A".into(), "B".into()]), "A, B");
        assert_eq!(authors_line(&[]), "");
    }

    #[test]
    fn analysis_block_lists_figures() {
        let state = AnalysisState {
            status: AnalysisStatus::Success,
            content: Some("# Findings".into()),
            gallery: vec![GalleryImage {
                src: "http://h/fig1.png".into(),
                alt: "fig1.png".into(),
            }],
            error: None,
        };
        let block = analysis_block("1706.03762v7", &state, Style::new(false));
        assert_eq!(
            block,
            "==> 1706.03762v7\n\n# Findings\n\nFigures:\n  - fig1.png http://h/fig1.png"
        );
    }

    #[test]
    fn translation_error_is_reported() {
        let state = TranslationState {
            error: Some("network error: timed out".into()),
            ..Default::default()
        };
        let block = translation_block(&paper(), &state, Style::new(false));
        assert_eq!(block, "✗ 1706.03762v7: network error: timed out");
    }
}
