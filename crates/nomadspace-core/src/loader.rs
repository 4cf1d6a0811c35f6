//! Input directory loading.
//!
//! Entries are processed in file-name order. Job files are parsed right
//! away, templates are only registered; every per-file failure is collected
//! and reported together once the whole directory has been scanned.

use std::path::Path;

use tracing::{debug, info};

use crate::config::NomadSpaceConfig;
use crate::error::{ErrorList, NomadSpaceError, Result};
use crate::job::Job;
use crate::scheduler::Scheduler;
use crate::template::{JobFormat, TemplateSpec, TEMPLATE_SUFFIX};

/// How an input file is handled, by suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Job(JobFormat),
    Template,
    Ignored,
}

impl FileKind {
    pub fn classify(name: &str) -> Self {
        if name.ends_with(TEMPLATE_SUFFIX) {
            FileKind::Template
        } else {
            JobFormat::from_file_name(name)
                .map(FileKind::Job)
                .unwrap_or(FileKind::Ignored)
        }
    }
}

/// A job parsed from the input directory.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedJob {
    /// Source file name, used in logs and error messages
    pub file: String,
    pub job: Job,
}

/// Everything found in the input directory.
#[derive(Debug, Default)]
pub struct LoadedSpecs {
    /// Static jobs, in file-name order
    pub jobs: Vec<LoadedJob>,
    /// Templates, in file-name order
    pub templates: Vec<TemplateSpec>,
}

/// Parse a job document in the given format.
///
/// `file` only labels errors.
pub async fn parse_job(
    scheduler: &dyn Scheduler,
    format: JobFormat,
    file: &str,
    content: &[u8],
) -> Result<Job> {
    match format {
        JobFormat::Json => {
            serde_json::from_slice(content).map_err(|source| NomadSpaceError::ParseJson {
                file: file.to_string(),
                source,
            })
        }
        JobFormat::Native => {
            let source = String::from_utf8_lossy(content);
            scheduler
                .parse_native(&source)
                .await
                .map_err(|e| NomadSpaceError::ParseNative {
                    file: file.to_string(),
                    reason: e.to_string(),
                })
        }
    }
}

/// Reads and classifies the input directory.
pub struct SpecLoader<'a> {
    config: &'a NomadSpaceConfig,
    scheduler: &'a dyn Scheduler,
}

impl<'a> SpecLoader<'a> {
    pub fn new(config: &'a NomadSpaceConfig, scheduler: &'a dyn Scheduler) -> Self {
        Self { config, scheduler }
    }

    /// Load every recognised file of the input directory.
    ///
    /// Fails if the directory cannot be listed, or with the combined error
    /// of every file that failed to load. No partial result is returned when
    /// any file fails.
    pub async fn load(&self) -> Result<LoadedSpecs> {
        let dir = &self.config.input_dir;
        let mut names = list_dir(dir).await?;
        names.sort();

        info!("Found {} files in input dir {}", names.len(), dir.display());

        let mut specs = LoadedSpecs::default();
        let mut errors = ErrorList::new();

        for name in names {
            let path = dir.join(&name);
            match FileKind::classify(&name) {
                FileKind::Job(format) => {
                    debug!(file = %path.display(), ?format, "Reading job");
                    if let Some(job) = errors.push_result(self.read_job(&path, format).await) {
                        specs.jobs.push(LoadedJob { file: name, job });
                    }
                }
                FileKind::Template => {
                    debug!(file = %path.display(), "Registering template");
                    specs.templates.push(TemplateSpec::new(&path, self.config));
                }
                FileKind::Ignored => {
                    info!(file = %path.display(), "Ignore {}", name);
                }
            }
        }

        errors.into_result()?;
        Ok(specs)
    }

    async fn read_job(&self, path: &Path, format: JobFormat) -> Result<Job> {
        let content = tokio::fs::read(path)
            .await
            .map_err(|e| NomadSpaceError::io(path, e))?;
        parse_job(self.scheduler, format, &path.display().to_string(), &content).await
    }
}

async fn list_dir(dir: &Path) -> Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| NomadSpaceError::io(dir, e))?;
    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| NomadSpaceError::io(dir, e))?
    {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}
