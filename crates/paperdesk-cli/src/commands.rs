use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use futures_util::future::join_all;
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio_stream::wrappers::WatchStream;

use paperdesk_core::{
    AnalysisStatus, DirHandoffStore, FetchQuery, HandoffStore, JobMonitor, JobStatus, Paper,
    RemoteJobClient, StatusView, SubJobTracker,
};

use crate::config::Settings;
use crate::output::{self, Style};

/// Shared handles for one invocation.
pub struct App {
    settings: Settings,
    client: Arc<RemoteJobClient>,
    store: Arc<DirHandoffStore>,
    style: Style,
}

impl App {
    pub fn new(settings: Settings, style: Style) -> anyhow::Result<Self> {
        let client = RemoteJobClient::new(&settings.core).context("building HTTP client")?;
        let store = DirHandoffStore::open(settings.handoff_dir.clone()).with_context(|| {
            format!(
                "opening handoff directory {}",
                settings.handoff_dir.display()
            )
        })?;
        log::debug!(
            "using {} with handoff directory {}",
            client.base_url(),
            store.root().display()
        );
        Ok(Self {
            settings,
            client: Arc::new(client),
            store: Arc::new(store),
            style,
        })
    }

    fn monitor(&self) -> JobMonitor {
        JobMonitor::new(self.client.clone(), self.store.clone(), &self.settings.core)
    }

    fn tracker(&self) -> SubJobTracker {
        SubJobTracker::new(self.client.clone(), self.store.clone(), &self.settings.core)
    }

    fn email(&self, flag: Option<String>) -> Option<String> {
        flag.or_else(|| self.settings.email.clone())
    }
}

pub struct ResultsArgs {
    pub key: String,
    pub translate: bool,
    pub analyze: Vec<String>,
    pub email_selected: Vec<String>,
    pub email: Option<String>,
}

pub async fn fetch(app: &App, query: FetchQuery) -> anyhow::Result<()> {
    let monitor = app.monitor();
    let handle = monitor.run_fetch(query).await.context("starting fetch")?;
    log::info!("fetch started: {}", handle.message);

    let view = follow(&monitor, app.style).await?;
    match view.status {
        JobStatus::ReviewReady => {
            let Some(key) = monitor.take_ready_handoff() else {
                bail!("results were loaded but no handoff key was recorded");
            };
            println!("{}", output::status_line(&view, app.style));
            println!("Results stored under {}", app.style.key(&key));
            println!("Open them with: paperdesk results {key}");
        }
        JobStatus::Error => bail!("{}", view.message),
        _ => println!("{}", output::status_line(&view, app.style)),
    }
    Ok(())
}

pub async fn results(app: &App, args: ResultsArgs) -> anyhow::Result<()> {
    let papers: Vec<Paper> = match app.store.take(&args.key) {
        Ok(record) => record.decode()?,
        Err(e) if e.is_not_found() => {
            println!(
                "Nothing to show: {} was already opened or never existed.",
                args.key
            );
            return Ok(());
        }
        Err(e) => return Err(e).context("reading handoff record"),
    };

    print_list(&papers, app.style);

    if args.translate {
        translate_all(app, &papers).await;
    }
    if !args.analyze.is_empty() {
        stage(app, &papers, &args.analyze)?;
    }
    if !args.email_selected.is_empty() {
        let selected = pick(app, &papers, &args.email_selected);
        if selected.is_empty() {
            bail!("none of the selected papers are in this result set");
        }
        let email = app.email(args.email);
        let monitor = app.monitor();
        monitor
            .analyze_and_email(selected, email)
            .await
            .context("starting analysis")?;
        let view = follow(&monitor, app.style).await?;
        if view.status == JobStatus::Error {
            bail!("{}", view.message);
        }
        println!("{}", output::status_line(&view, app.style));
    }
    Ok(())
}

pub async fn analyze(app: &App, ids: &[String], email: Option<String>) -> anyhow::Result<()> {
    let tracker = app.tracker();
    let style = app.style;

    let mut opened = Vec::new();
    for id in ids {
        match tracker.open_analysis(id).await {
            Ok(()) => opened.push(id.as_str()),
            Err(e) if e.is_not_found() => eprintln!(
                "{} {id}: not staged for analysis (stage it with `paperdesk results <key> --analyze {id}`)",
                style.err("!")
            ),
            Err(e) => eprintln!("{} {id}: {e}", style.err("!")),
        }
    }
    if opened.is_empty() {
        bail!("no analysis could be started");
    }

    let spinner = spinner();
    spinner.set_message(format!("Analyzing {} papers...", opened.len()));
    let finished = tokio::select! {
        states = join_all(opened.iter().map(|id| tracker.wait_for_analysis(id))) => states,
        _ = tokio::signal::ctrl_c() => {
            for id in &opened {
                tracker.close_analysis(id);
            }
            spinner.abandon_with_message("interrupted");
            bail!("interrupted");
        }
    };
    spinner.finish_and_clear();

    let email = app.email(email);
    let mut failures = 0;
    for (id, state) in opened.iter().zip(finished) {
        let Some(state) = state else { continue };
        println!("{}\n", output::analysis_block(id, &state, style));
        if state.status != AnalysisStatus::Success {
            failures += 1;
            continue;
        }
        if let Some(address) = &email {
            let paper: Paper = app.store.peek_entity(id)?.decode()?;
            match app.client.email_result(&paper, address).await {
                Ok(message) => println!("{} {id}: {message}", style.ok("✓")),
                Err(e) => eprintln!("{} {id}: emailing failed: {e}", style.err("✗")),
            }
        }
    }

    if failures > 0 {
        bail!("{failures} of {} analyses failed", opened.len());
    }
    Ok(())
}

pub async fn recent(app: &App, analyze: &[String]) -> anyhow::Result<()> {
    let papers = app
        .client
        .recent_analyses()
        .await
        .context("loading recent analyses")?;
    show_history(app, &papers, analyze)
}

pub async fn warehouse(app: &App, query: &str, analyze: &[String]) -> anyhow::Result<()> {
    let papers = app
        .client
        .all_analyses(query)
        .await
        .context("loading analysis history")?;
    show_history(app, &papers, analyze)
}

pub async fn clear_cache(app: &App, yes: bool) -> anyhow::Result<()> {
    if !yes && !confirm("Clear all cached results on the backend?")? {
        println!("Cancelled.");
        return Ok(());
    }
    let monitor = app.monitor();
    let message = monitor.clear_cache().await.context("clearing cache")?;
    println!("{} {message}", app.style.ok("✓"));
    Ok(())
}

pub async fn translate(app: &App, title: &str, summary: &str) -> anyhow::Result<()> {
    let translation = app
        .client
        .translate_text(title, summary)
        .await
        .context("translating")?;
    println!("{}\n", app.style.bold(&translation.display_title()));
    println!("{}", translation.translated_abstract);
    Ok(())
}

fn show_history(app: &App, papers: &[Paper], analyze: &[String]) -> anyhow::Result<()> {
    if papers.is_empty() {
        println!("No analyses yet.");
        return Ok(());
    }
    print_list(papers, app.style);
    if !analyze.is_empty() {
        stage(app, papers, analyze)?;
    }
    Ok(())
}

fn print_list(papers: &[Paper], style: Style) {
    println!("{}\n", style.bold(&format!("{} papers", papers.len())));
    for (i, paper) in papers.iter().enumerate() {
        println!("{}\n", output::paper_block(i, paper, style));
    }
}

async fn translate_all(app: &App, papers: &[Paper]) {
    let tracker = app.tracker();
    let spinner = spinner();
    spinner.set_message(format!("Translating {} papers...", papers.len()));
    let outcomes = join_all(papers.iter().map(|p| tracker.translate(p))).await;
    spinner.finish_and_clear();

    for paper in papers {
        let state = tracker.translation(paper.short_id());
        println!("{}", output::translation_block(paper, &state, app.style));
    }
    let failed = outcomes.iter().filter(|r| r.is_err()).count();
    if failed > 0 {
        log::warn!("{failed} of {} translations failed", papers.len());
    }
}

fn stage(app: &App, papers: &[Paper], ids: &[String]) -> anyhow::Result<()> {
    let tracker = app.tracker();
    let mut staged = Vec::new();
    for paper in pick(app, papers, ids) {
        staged.push(tracker.launch_analysis(&paper)?);
    }
    if !staged.is_empty() {
        println!(
            "Staged {} papers. Start the analysis with:\n  paperdesk analyze {}",
            staged.len(),
            staged.join(" ")
        );
    }
    Ok(())
}

/// Selected papers in list order; unknown ids are reported and skipped.
fn pick(app: &App, papers: &[Paper], ids: &[String]) -> Vec<Paper> {
    let (selected, missing) = select_papers(papers, ids);
    for id in missing {
        eprintln!("{} {id} is not in this list", app.style.err("!"));
    }
    selected.into_iter().cloned().collect()
}

/// Match ids against short ids or full entry ids.
fn select_papers<'a, 'b>(papers: &'a [Paper], ids: &'b [String]) -> (Vec<&'a Paper>, Vec<&'b str>) {
    let wanted = |p: &Paper| {
        ids.iter()
            .any(|id| id == p.short_id() || *id == p.entry_id)
    };
    let selected: Vec<&Paper> = papers.iter().filter(|p| wanted(p)).collect();
    let missing = ids
        .iter()
        .filter(|id| {
            !papers
                .iter()
                .any(|p| *id == p.short_id() || **id == p.entry_id)
        })
        .map(String::as_str)
        .collect();
    (selected, missing)
}

/// Follow the monitor's status on a spinner until it settles.
async fn follow(monitor: &JobMonitor, style: Style) -> anyhow::Result<StatusView> {
    let spinner = spinner();
    let mut updates = WatchStream::new(monitor.subscribe());
    let view = loop {
        tokio::select! {
            update = updates.next() => match update {
                Some(view) => {
                    spinner.set_message(output::status_line(&view, style));
                    if view.is_settled() {
                        break view;
                    }
                }
                None => break monitor.status(),
            },
            _ = tokio::signal::ctrl_c() => {
                monitor.stop_polling();
                spinner.abandon_with_message("interrupted");
                bail!("interrupted; the job keeps running on the backend");
            }
        }
    };
    spinner.finish_and_clear();
    Ok(view)
}

fn spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_draw_target(ProgressDrawTarget::stderr_with_hz(12));
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

fn confirm(question: &str) -> anyhow::Result<bool> {
    print!("{question} [y/N] ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes" | "Yes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paper(id: &str) -> Paper {
        serde_json::from_value(serde_json::json!({
            "entry_id": format!("http://arxiv.org/abs/{id}"),
            "title": format!("Paper {id}"),
        }))
        .unwrap()
    }

    #[test]
    fn select_by_short_or_full_id() {
        let papers = vec![paper("1"), paper("2"), paper("3")];
        let ids = vec![
            "3".to_string(),
            "http://arxiv.org/abs/1".to_string(),
            "9".to_string(),
        ];

        let (selected, missing) = select_papers(&papers, &ids);
        let selected: Vec<&str> = selected.iter().map(|p| p.short_id()).collect();
        assert_eq!(selected, vec!["1", "3"]);
        assert_eq!(missing, vec!["9"]);
    }

    #[test]
    fn select_nothing() {
        let papers = vec![paper("1")];
        let (selected, missing) = select_papers(&papers, &[]);
        assert!(selected.is_empty());
        assert!(missing.is_empty());
    }
}
