//! # jenkins-jobs
//!
//! Manages Jenkins job definitions over the Jenkins HTTP API: create, delete, enable, disable,
//! show, dump to disk and restore from disk.
//!
//! ## Usage
//!
//! ```text
//! jenkins-jobs [--server host:port] [--job name] [--config path] [--config_dir path]
//!              [--outdir path] [--verbose[=bool]] <create|delete|enable|disable|show|dump|restore>
//! ```
//!
//! * `create` uploads `--config` as `--job`, or a placeholder freestyle job if no config is given.
//! * `dump` writes `<outdir>/<server>/<job>.xml` for `--job`, or for every job on the server.
//! * `restore` walks `--config_dir`, where each `<job>/config.xml` (or `<job>.xml`) holds the
//!   desired config. Unknown jobs are created and jobs whose config text differs are updated.
//!
//! ## Configuration
//!
//! In `$HOME/.jenkins_jobs.toml`:
//!
//! ```toml
//! # Jenkins server, as host:port or URL
//! server = "ci.makewhat.is:8080"
//! # Credentials. Requests are anonymous unless both are set.
//! username = ""
//! api_token = ""
//! # Root directory for dump. Defaults to the system temp directory.
//! outdir = "/tmp"
//! ```
//!
//! Each key can also be given as an environment variable prefixed with `JENKINS_JOBS`, e.g.
//! `JENKINS_JOBS_API_TOKEN`. Command-line flags take precedence over both.

use jenkins_jobs::commands::{self, Options};
use jenkins_jobs::jenkins::{Client, JobStore, Server};
use jenkins_jobs::Config;

use anyhow::{anyhow, Result};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, Subcommand};
use log::*;
use simple_logger::SimpleLogger;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "jenkins-jobs", version, about, long_about = None, arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Jenkins server as host:port or URL.
    #[arg(long, global = true, value_name = "HOST:PORT")]
    server: Option<String>,

    /// job name.
    #[arg(long, global = true)]
    job: Option<String>,

    /// config path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// config directory for restore.
    #[arg(
        long = "config_dir",
        visible_alias = "config-dir",
        global = true,
        value_name = "PATH"
    )]
    config_dir: Option<PathBuf>,

    /// config dump output path.
    #[arg(long, global = true, value_name = "PATH")]
    outdir: Option<PathBuf>,

    /// print more things.
    #[arg(
        long,
        global = true,
        value_name = "BOOL",
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_value = "false",
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    verbose: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Create a job from --config, or from a placeholder template.
    Create,
    /// Delete a job.
    Delete,
    /// Enable a job.
    Enable,
    /// Disable a job.
    Disable,
    /// Print --config, or the remote config of --job.
    Show,
    /// Write job configs to <outdir>/<server>/<job>.xml.
    Dump,
    /// Create or update jobs from the configs in --config_dir.
    Restore,
}

impl Cli {
    fn options(&self, config: &Config, server: &Server) -> Options {
        Options {
            job: self.job.clone(),
            config: self.config.clone(),
            config_dir: self.config_dir.clone(),
            outdir: self.outdir.clone().unwrap_or_else(|| config.outdir.clone()),
            server_label: server.label().to_string(),
            verbose: self.verbose,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
#[doc(hidden)]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    SimpleLogger::new()
        .with_level(if cli.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .init()?;

    let config = Config::load_from_default_file()?;
    let server = Server::parse(cli.server.as_deref().unwrap_or(&config.server))?;
    let options = cli.options(&config, &server);
    debug!("Using {}", server.base_url());

    let jenkins = Client::new(server, config.jenkins_auth)?;
    run(cli.command, &jenkins, &options).await
}

async fn run(command: Command, jenkins: &dyn JobStore, options: &Options) -> Result<()> {
    let mut stdout = std::io::stdout();
    match command {
        Command::Create => commands::create(jenkins, options).await,
        Command::Delete => commands::delete(jenkins, options).await,
        Command::Enable => commands::enable(jenkins, options, &mut stdout)
            .await
            .map(|_| ()),
        Command::Disable => commands::disable(jenkins, options, &mut stdout)
            .await
            .map(|_| ()),
        Command::Show => commands::show(jenkins, options, &mut stdout).await,
        Command::Dump => {
            let written = commands::dump(jenkins, options, &mut stdout).await?;
            info!("Dumped {} job(s)", written.len());
            Ok(())
        }
        Command::Restore => {
            let report = commands::restore(jenkins, options).await?;
            if report.failed.is_empty() {
                Ok(())
            } else {
                Err(anyhow!(
                    "Failed to restore {} job(s): {}",
                    report.failed.len(),
                    report.failed.join(", ")
                ))
            }
        }
    }
}
