use crate::jenkins::{Auth, DEFAULT_SERVER};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

static CONFIG_FILE_NAME: &str = ".jenkins_jobs.toml";
static ENV_PREFIX: &str = "JENKINS_JOBS";

/// Configuration as it appears in the file and environment. Every field is optional.
#[derive(Debug, Deserialize)]
struct RawConfig {
    server: Option<String>,
    username: Option<String>,
    api_token: Option<String>,
    outdir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// `host:port` or URL of the Jenkins server
    pub server: String,
    /// Credentials, present only when both a username and an API token are configured
    pub jenkins_auth: Option<Auth>,
    /// Root directory for dumped configs
    pub outdir: PathBuf,
}

impl From<RawConfig> for Config {
    fn from(raw: RawConfig) -> Self {
        let jenkins_auth = match (raw.username, raw.api_token) {
            (Some(username), Some(api_token)) => Some(Auth::new(username, api_token)),
            _ => None,
        };
        Self {
            server: raw.server.unwrap_or_else(|| DEFAULT_SERVER.to_string()),
            jenkins_auth,
            outdir: raw.outdir.unwrap_or_else(std::env::temp_dir),
        }
    }
}

impl Config {
    /// Load from `$HOME/.jenkins_jobs.toml` and `JENKINS_JOBS_*` environment variables
    pub fn load_from_default_file() -> Result<Self> {
        let path = dirs::home_dir().map(|home| home.join(CONFIG_FILE_NAME));
        Self::load(path.as_deref())
    }

    /// Load from an optional TOML file, overridden by environment variables. A missing file is
    /// not an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let raw: RawConfig = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()?
            .try_deserialize()
            .context("Invalid configuration")?;
        Ok(raw.into())
    }
}
