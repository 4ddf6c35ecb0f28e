use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use paperdesk_core::Config;

/// Optional settings file, `<config_dir>/paperdesk/config.toml` by default.
#[derive(Debug, Default, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub api_url: Option<String>,
    pub handoff_dir: Option<PathBuf>,
    /// Per-request timeout in seconds.
    pub request_timeout: Option<u64>,
    pub page_size: Option<usize>,
    /// Default recipient for the email actions.
    pub email: Option<String>,
}

impl FileConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Load `explicit` (which must exist), or the default file if there is one.
    pub fn discover(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("paperdesk").join("config.toml"))
}

pub fn default_handoff_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("paperdesk")
        .join("handoff")
}

/// Values that override the config file: command-line flags, or the
/// `PAPERDESK_*` environment.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Overrides {
    pub api_url: Option<String>,
    pub handoff_dir: Option<PathBuf>,
    pub request_timeout: Option<u64>,
}

impl Overrides {
    pub fn from_env() -> anyhow::Result<Self> {
        let request_timeout = match std::env::var("PAPERDESK_REQUEST_TIMEOUT") {
            Ok(raw) => Some(raw.trim().parse::<u64>().with_context(|| {
                format!("PAPERDESK_REQUEST_TIMEOUT={raw:?} is not a number of seconds")
            })?),
            Err(_) => None,
        };
        Ok(Self {
            api_url: std::env::var("PAPERDESK_API_URL").ok(),
            handoff_dir: std::env::var("PAPERDESK_HANDOFF_DIR").ok().map(PathBuf::from),
            request_timeout,
        })
    }
}

/// Fully resolved settings for one invocation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub core: Config,
    pub handoff_dir: PathBuf,
    pub email: Option<String>,
}

impl Settings {
    /// Resolve flags > environment > config file > defaults.
    pub fn resolve(flags: Overrides, env: Overrides, file: FileConfig) -> Self {
        let defaults = Config::default();

        let api_base_url = flags
            .api_url
            .or(env.api_url)
            .or(file.api_url)
            .unwrap_or_else(|| defaults.api_base_url.clone());
        let handoff_dir = flags
            .handoff_dir
            .or(env.handoff_dir)
            .or(file.handoff_dir)
            .unwrap_or_else(default_handoff_dir);
        // Zero disables the timeout.
        let request_timeout = flags
            .request_timeout
            .or(env.request_timeout)
            .or(file.request_timeout)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Self {
            core: Config {
                api_base_url,
                page_size: file.page_size.unwrap_or(defaults.page_size),
                request_timeout,
                ..defaults
            },
            handoff_dir,
            email: file.email,
        }
    }
}
