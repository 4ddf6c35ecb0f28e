use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use paperdesk_core::{DateRange, FetchQuery};

mod commands;
mod config;
mod output;

use commands::{App, ResultsArgs};
use config::{FileConfig, Overrides, Settings};
use output::Style;

/// paperdesk - fetch, review and analyze papers through a paperdesk service
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Base URL of the paper service
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Directory used to hand results between invocations
    #[arg(long, global = true)]
    handoff_dir: Option<PathBuf>,

    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Per-request timeout in seconds (0 disables it)
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a paper fetch and wait for its results
    Fetch {
        /// Comma-separated keywords
        #[arg(long)]
        keywords: String,

        /// Comma-separated arXiv categories
        #[arg(long, value_delimiter = ',')]
        categories: Vec<String>,

        /// recent, last_month, last_3_months, last_year or last_2_years
        #[arg(long, default_value = "recent")]
        date_range: DateRange,
    },
    /// Open a fetched result set (each set can be opened once)
    Results {
        /// Handoff key printed by `fetch`
        key: String,

        /// Translate every paper in the set
        #[arg(long)]
        translate: bool,

        /// Stage papers (comma-separated ids) for `analyze`
        #[arg(long, value_delimiter = ',')]
        analyze: Vec<String>,

        /// Analyze papers (comma-separated ids) on the backend and email the results
        #[arg(long, value_delimiter = ',')]
        email_selected: Vec<String>,

        /// Recipient for --email-selected
        #[arg(long)]
        email: Option<String>,
    },
    /// Analyze staged papers and print the results
    Analyze {
        /// Ids of staged papers
        #[arg(required = true)]
        ids: Vec<String>,

        /// Email each finished analysis to this address
        #[arg(long)]
        email: Option<String>,
    },
    /// List recently analyzed papers
    Recent {
        /// Stage papers (comma-separated ids) for `analyze`
        #[arg(long, value_delimiter = ',')]
        analyze: Vec<String>,
    },
    /// Search every analyzed paper
    Warehouse {
        /// Search text
        #[arg(long, default_value = "")]
        query: String,

        /// Stage papers (comma-separated ids) for `analyze`
        #[arg(long, value_delimiter = ',')]
        analyze: Vec<String>,
    },
    /// Clear the backend's cached results
    ClearCache {
        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },
    /// Translate a single title and abstract
    Translate {
        #[arg(long)]
        title: String,

        #[arg(long = "abstract")]
        summary: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "paperdesk=info,paperdesk_core=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    // Resolve config from CLI flags > env vars > config file > defaults
    let flags = Overrides {
        api_url: args.api_url,
        handoff_dir: args.handoff_dir,
        request_timeout: args.timeout,
    };
    let file = FileConfig::discover(args.config.as_deref())?;
    let settings = Settings::resolve(flags, Overrides::from_env()?, file);

    let app = App::new(settings, Style::new(!args.no_color))?;

    match args.command {
        Command::Fetch {
            keywords,
            categories,
            date_range,
        } => {
            let query = FetchQuery::new(&keywords, categories, date_range)?;
            commands::fetch(&app, query).await
        }
        Command::Results {
            key,
            translate,
            analyze,
            email_selected,
            email,
        } => {
            commands::results(
                &app,
                ResultsArgs {
                    key,
                    translate,
                    analyze,
                    email_selected,
                    email,
                },
            )
            .await
        }
        Command::Analyze { ids, email } => commands::analyze(&app, &ids, email).await,
        Command::Recent { analyze } => commands::recent(&app, &analyze).await,
        Command::Warehouse { query, analyze } => {
            commands::warehouse(&app, &query, &analyze).await
        }
        Command::ClearCache { yes } => commands::clear_cache(&app, yes).await,
        Command::Translate { title, summary } => {
            commands::translate(&app, &title, &summary).await
        }
    }
}
