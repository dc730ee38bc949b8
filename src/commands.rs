use crate::jenkins::JobStore;
use anyhow::{anyhow, bail, Context, Result};
use log::*;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Name of the per-job config file inside a restore directory
pub const CONFIG_FILE_NAME: &str = "config.xml";

/// Freestyle job submitted by `create` when no config file is given
pub const PLACEHOLDER_JOB_XML: &str = r#"<project>
<actions/>
<description/>
<keepDependencies>false</keepDependencies>
<properties/>
<scm class="hudson.scm.NullSCM"/>
<canRoam>true</canRoam>
<disabled>false</disabled>
<blockBuildWhenDownstreamBuilding>false</blockBuildWhenDownstreamBuilding>
<blockBuildWhenUpstreamBuilding>false</blockBuildWhenUpstreamBuilding>
<triggers/>
<concurrentBuild>false</concurrentBuild>
<builders>
<hudson.tasks.Shell>
<command>sleep 60</command>
</hudson.tasks.Shell>
</builders>
<publishers/>
<buildWrappers/>
</project>"#;

/// Everything a command needs besides the Jenkins connection
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub job: Option<String>,
    /// Local config file for `create` and `show`
    pub config: Option<PathBuf>,
    /// Directory of job configs for `restore`
    pub config_dir: Option<PathBuf>,
    /// Root directory for `dump`
    pub outdir: PathBuf,
    /// Server label, used as the dump subdirectory
    pub server_label: String,
    pub verbose: bool,
}

impl Options {
    fn job_name(&self) -> Result<&str> {
        self.job
            .as_deref()
            .ok_or_else(|| anyhow!("No job name given. Use --job"))
    }
}

/// Read a config file as text
pub fn read_config(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Could not read {}", path.display()))
}

/// Create `--job` from `--config`, or from [`PLACEHOLDER_JOB_XML`]. Remote failures are logged,
/// not returned.
pub async fn create(jenkins: &dyn JobStore, options: &Options) -> Result<()> {
    let name = options.job_name()?;
    let job_xml = match &options.config {
        Some(path) => read_config(path)?,
        None => PLACEHOLDER_JOB_XML.to_string(),
    };

    info!("Creating {}", name);
    if let Err(e) = jenkins.create_job(name, &job_xml).await {
        error!("Error creating job {}: {:#}", name, e);
    }
    Ok(())
}

/// Delete `--job`. Remote failures are logged, not returned.
pub async fn delete(jenkins: &dyn JobStore, options: &Options) -> Result<()> {
    let name = options.job_name()?;
    info!("Deleting {}", name);
    if let Err(e) = jenkins.delete_job(name).await {
        error!("Error deleting job {}: {:#}", name, e);
    }
    Ok(())
}

pub async fn enable(
    jenkins: &dyn JobStore,
    options: &Options,
    out: &mut impl Write,
) -> Result<u16> {
    toggle(jenkins, options, true, out).await
}

pub async fn disable(
    jenkins: &dyn JobStore,
    options: &Options,
    out: &mut impl Write,
) -> Result<u16> {
    toggle(jenkins, options, false, out).await
}

async fn toggle(
    jenkins: &dyn JobStore,
    options: &Options,
    enabled: bool,
    out: &mut impl Write,
) -> Result<u16> {
    let name = options.job_name()?;
    let status = jenkins.set_enabled(name, enabled).await?;
    writeln!(out, "result: {}", status)?;
    Ok(status)
}

/// Print the local `--config` file if given, otherwise the remote config of `--job`
pub async fn show(jenkins: &dyn JobStore, options: &Options, out: &mut impl Write) -> Result<()> {
    let text = match (&options.config, &options.job) {
        (Some(path), _) => read_config(path)?,
        (None, Some(name)) => jenkins
            .get_config(name)
            .await?
            .ok_or_else(|| anyhow!("Unknown job {}", name))?,
        (None, None) => bail!("could not find a config to show. Use --config or --job"),
    };
    writeln!(out, "{}", text)?;
    Ok(())
}

/// Write the config of `--job`, or of every job on the server, to
/// `<outdir>/<server label>/<job>.xml`. Returns the paths written.
///
/// A job that cannot be fetched or written is logged and skipped.
pub async fn dump(
    jenkins: &dyn JobStore,
    options: &Options,
    out: &mut impl Write,
) -> Result<Vec<PathBuf>> {
    let outpath = options.outdir.join(&options.server_label);
    fs::create_dir_all(&outpath)
        .with_context(|| format!("Problem making dir {}", outpath.display()))?;

    let jobs = match &options.job {
        Some(name) => vec![name.clone()],
        None => jenkins.list_jobs().await?,
    };

    let mut written = Vec::with_capacity(jobs.len());
    for job in jobs {
        let outfile = outpath.join(format!("{}.xml", job));
        match write_config(jenkins, &job, &outfile).await {
            Ok(config) => {
                if options.verbose {
                    writeln!(out, "{}", config)?;
                }
                written.push(outfile);
            }
            Err(e) => error!("Error dumping {}: {:#}", job, e),
        }
    }
    Ok(written)
}

async fn write_config(jenkins: &dyn JobStore, job: &str, outfile: &Path) -> Result<String> {
    info!("Dumping job {} to {}", job, outfile.display());
    let config = jenkins
        .get_config(job)
        .await?
        .ok_or_else(|| anyhow!("Unknown job {}", job))?;
    fs::write(outfile, &config)
        .with_context(|| format!("Error writing {}", outfile.display()))?;
    Ok(config)
}

/// Desired config of one job, read from disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalJob {
    pub name: String,
    pub config: String,
}

/// Discover and read every job config under `config_dir`, sorted by job name
///
/// `<job>/config.xml` and `<job>.xml` are both accepted. A subdirectory without `config.xml`
/// is an error. Hidden entries and other files are skipped.
pub fn collect_local_jobs(config_dir: &Path) -> Result<Vec<LocalJob>> {
    let mut sources: BTreeMap<String, PathBuf> = BTreeMap::new();

    let entries = fs::read_dir(config_dir)
        .with_context(|| format!("Could not list {}", config_dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
            warn!("Skipping {}", path.display());
            continue;
        };
        if file_name.starts_with('.') {
            continue;
        }

        let (name, config_file) = if path.is_dir() {
            let config_file = path.join(CONFIG_FILE_NAME);
            if !config_file.is_file() {
                bail!("config file does not exist: {}", config_file.display());
            }
            (file_name.to_string(), config_file)
        } else if let Some(name) = file_name.strip_suffix(".xml") {
            (name.to_string(), path.clone())
        } else {
            debug!("Skipping {}", path.display());
            continue;
        };

        if let Some(previous) = sources.insert(name.clone(), config_file) {
            bail!(
                "Job {} is defined twice, also in {}",
                name,
                previous.display()
            );
        }
    }

    sources
        .into_iter()
        .map(|(name, path)| {
            Ok(LocalJob {
                config: read_config(&path)?,
                name,
            })
        })
        .collect()
}

/// Per-job results of a restore run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Make every job under `--config_dir` match its local config
///
/// All local configs are read before the first remote call, so a missing `config.xml` aborts
/// the run with nothing written. Remote failures are logged per job and the run continues.
pub async fn restore(jenkins: &dyn JobStore, options: &Options) -> Result<RestoreReport> {
    let config_dir = options
        .config_dir
        .as_deref()
        .ok_or_else(|| anyhow!("no config_dir defined. Use --config_dir"))?;
    if !config_dir.is_dir() {
        bail!("config path does not exist: {}", config_dir.display());
    }

    let jobs = collect_local_jobs(config_dir)?;
    let mut report = RestoreReport::default();
    for job in jobs {
        match sync_job(jenkins, &job).await {
            Ok(SyncOutcome::Created) => report.created.push(job.name),
            Ok(SyncOutcome::Updated) => report.updated.push(job.name),
            Ok(SyncOutcome::Unchanged) => report.unchanged.push(job.name),
            Err(e) => {
                error!("Error restoring {}: {:#}", job.name, e);
                report.failed.push(job.name);
            }
        }
    }

    info!(
        "Restored from {}: {} created, {} updated, {} unchanged, {} failed",
        config_dir.display(),
        report.created.len(),
        report.updated.len(),
        report.unchanged.len(),
        report.failed.len()
    );
    Ok(report)
}

async fn sync_job(jenkins: &dyn JobStore, job: &LocalJob) -> Result<SyncOutcome> {
    match jenkins.get_config(&job.name).await? {
        Some(remote) if remote == job.config => {
            debug!("{} is up to date", job.name);
            Ok(SyncOutcome::Unchanged)
        }
        Some(_) => {
            info!("Updating {}", job.name);
            jenkins.update_config(&job.name, &job.config).await?;
            Ok(SyncOutcome::Updated)
        }
        None => {
            info!("Job {} doesn't exist. Creating", job.name);
            jenkins.create_job(&job.name, &job.config).await?;
            Ok(SyncOutcome::Created)
        }
    }
}
