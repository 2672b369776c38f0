use std::collections::HashSet;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::ase_map::{self, AseMapOptions, AseMapSummary};
use crate::batch::ScriptTargets;
use crate::config::ResolvedConfig;
use crate::domain::FileId;
use crate::error::PipelineError;
use crate::fs_util::{remove_if_exists, write_atomic};
use crate::stage::{FreshnessViolation, Stage};
use crate::world::{WorldSnapshot, format_bytes};

pub const DOWNLOAD_SCRIPT: &str = "download.cmd";

#[derive(Debug, Clone, Copy, Default)]
pub struct PlanOptions {
    /// Verify freshness of every done unit before planning.
    pub check_dependencies: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRow {
    pub name: String,
    pub done: usize,
    pub added: usize,
    pub waiting: usize,
    /// Downloads this stage asked for that no earlier stage did.
    pub downloads: usize,
    /// Skipped because no cases are known yet.
    pub skipped: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Totals {
    pub done: usize,
    pub added: usize,
    pub waiting: usize,
    pub downloads: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanResult {
    pub stages: Vec<StageRow>,
    pub totals: Totals,
    pub downloads: Vec<FileId>,
    pub download_bytes: u64,
    pub scripts: Vec<Utf8PathBuf>,
    pub download_script: Option<Utf8PathBuf>,
    pub failed_stages: usize,
    #[serde(skip)]
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone)]
pub struct App {
    config: ResolvedConfig,
}

impl App {
    pub fn new(config: ResolvedConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn download_script_path(&self) -> Utf8PathBuf {
        self.config.script_output_directory.join(DOWNLOAD_SCRIPT)
    }

    /// Freshness violations of every stage that can run against `world`.
    pub fn check_freshness(&self, world: &WorldSnapshot, stages: &[Stage]) -> Vec<FreshnessViolation> {
        stages
            .iter()
            .filter(|stage| world.has_cases() || !stage.needs_cases())
            .flat_map(|stage| stage.check_freshness(world))
            .collect()
    }

    /// Runs every stage once, in order, and writes the resulting scripts.
    ///
    /// A stage that fails is reported in its row and the remaining stages
    /// still run; see [`PlanResult::failed_stages`].
    pub fn plan(
        &self,
        world: &WorldSnapshot,
        stages: &[Stage],
        options: PlanOptions,
        sink: &dyn ProgressSink,
    ) -> Result<PlanResult, PipelineError> {
        let start = Instant::now();
        let mut targets = ScriptTargets::from_config(&self.config);
        let download_script = self.download_script_path();

        sink.event(ProgressEvent {
            message: "phase=Prepare; removing stale scripts".to_string(),
            elapsed: None,
        });
        for (_, path) in targets.destinations() {
            remove_if_exists(path)?;
        }
        remove_if_exists(&download_script)?;

        if options.check_dependencies {
            sink.event(ProgressEvent {
                message: "phase=Verify; checking freshness".to_string(),
                elapsed: None,
            });
            let violations = self.check_freshness(world, stages);
            for violation in &violations {
                match &violation.input {
                    Some(input) => warn!(
                        "{}: {} is older than its input {input}",
                        violation.stage, violation.output
                    ),
                    None => warn!(
                        "{}: {} exists but one of its inputs is missing",
                        violation.stage, violation.output
                    ),
                }
            }
            if !violations.is_empty() {
                return Err(PipelineError::FreshnessViolations {
                    count: violations.len(),
                });
            }
        }

        sink.event(ProgressEvent {
            message: format!("phase=Plan; evaluating {} stages", stages.len()),
            elapsed: None,
        });
        let mut rows = Vec::with_capacity(stages.len());
        let mut totals = Totals::default();
        let mut downloads: Vec<FileId> = Vec::new();
        let mut requested: HashSet<FileId> = HashSet::new();
        let mut failed_stages = 0;

        for stage in stages {
            let row = if stage.needs_cases() && !world.has_cases() {
                StageRow {
                    name: stage.name().to_string(),
                    done: 0,
                    added: 0,
                    waiting: 1,
                    downloads: 0,
                    skipped: true,
                    error: None,
                }
            } else {
                match stage.evaluate(world, &mut targets) {
                    Ok(outcome) => {
                        let mut new_downloads = 0;
                        for file_id in outcome.downloads {
                            if requested.insert(file_id.clone()) {
                                downloads.push(file_id);
                                new_downloads += 1;
                            }
                        }
                        StageRow {
                            name: stage.name().to_string(),
                            done: outcome.done,
                            added: outcome.added,
                            waiting: outcome.waiting,
                            downloads: new_downloads,
                            skipped: false,
                            error: None,
                        }
                    }
                    Err(err) => {
                        error!("stage {} failed: {err}", stage.name());
                        failed_stages += 1;
                        StageRow {
                            name: stage.name().to_string(),
                            done: 0,
                            added: 0,
                            waiting: 0,
                            downloads: 0,
                            skipped: false,
                            error: Some(err.to_string()),
                        }
                    }
                }
            };
            totals.done += row.done;
            totals.added += row.added;
            totals.waiting += row.waiting;
            totals.downloads += row.downloads;
            rows.push(row);
        }

        sink.event(ProgressEvent {
            message: "phase=Store; writing scripts".to_string(),
            elapsed: None,
        });
        let scripts = targets.write_all()?;

        let download_script = if downloads.is_empty() {
            None
        } else {
            write_atomic(&download_script, &self.render_download_script(&downloads))?;
            info!("wrote {} download(s) to {download_script}", downloads.len());
            Some(download_script)
        };

        let download_bytes = world.declared_size(&downloads);
        let elapsed = start.elapsed();
        sink.event(ProgressEvent {
            message: format!(
                "Downloading {} in {} files",
                format_bytes(download_bytes),
                downloads.len()
            ),
            elapsed: Some(elapsed),
        });

        Ok(PlanResult {
            stages: rows,
            totals,
            downloads,
            download_bytes,
            scripts,
            download_script,
            failed_stages,
            elapsed,
        })
    }

    fn render_download_script(&self, downloads: &[FileId]) -> String {
        let mut content = String::new();
        for file_id in downloads {
            content.push_str(&format!(
                "{}gdc-client download --no-file-md5sum --token-file {} {file_id}\r\n",
                self.config.binaries_directory, self.config.access_token_path
            ));
        }
        content
    }

    pub fn ase_map(
        &self,
        world: &WorldSnapshot,
        options: AseMapOptions,
        sink: &dyn ProgressSink,
    ) -> Result<AseMapSummary, PipelineError> {
        let start = Instant::now();
        sink.event(ProgressEvent {
            message: format!("phase=Map; {} worker thread(s)", options.threads),
            elapsed: None,
        });
        let summary = ase_map::run(world, &self.config, options)?;
        sink.event(ProgressEvent {
            message: format!(
                "mapped {} case(s) into {} tumor and {} normal region(s)",
                summary.cases_read, summary.tumor_regions, summary.normal_regions
            ),
            elapsed: Some(start.elapsed()),
        });
        Ok(summary)
    }
}
