//! Packs ready work into bounded command lines and writes them to the script
//! destinations.
//!
//! Batching is decided once per call and then rendered for every destination,
//! so two items that share a line in the local script share a line in the
//! cluster, Unix and cloud scripts as well.

use std::ops::Range;

use camino::Utf8PathBuf;
use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::info;

use crate::config::ResolvedConfig;
use crate::error::PipelineError;
use crate::fs_util::write_atomic;

pub const LOCAL_SCRIPT: &str = "pipeline.cmd";
pub const UNIX_SCRIPT: &str = "pipeline.sh";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Local,
    Cluster,
    Unix,
    Cloud,
}

/// The fixed part of a command: an external program and its leading
/// arguments. Work-item tokens are appended after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub binary: String,
    pub params: String,
    /// Append `-configuration <path>` when the run was given an explicit
    /// configuration file.
    pub pass_configuration: bool,
}

impl CommandTemplate {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            params: String::new(),
            pass_configuration: true,
        }
    }

    pub fn params(mut self, params: impl Into<String>) -> Self {
        self.params = params.into();
        self
    }

    pub fn without_configuration(mut self) -> Self {
        self.pass_configuration = false;
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    pub max_items: usize,
    pub max_chars: usize,
    pub parallelism: usize,
}

/// Number of lines for `n` items at most `cap` per line: the minimum line
/// count rounded up to a multiple of `parallelism`, never more than one line
/// per item.
pub fn line_count(n: usize, cap: usize, parallelism: usize) -> usize {
    if n == 0 {
        return 0;
    }
    let cap = cap.max(1);
    let parallelism = parallelism.max(1);
    let min_lines = n.div_ceil(cap);
    let desired = min_lines.div_ceil(parallelism) * parallelism;
    desired.min(n).max(min_lines)
}

/// Splits `n` items of `item_width` characters each (separator included)
/// behind a `prefix_len` command prefix into contiguous line ranges. The first
/// `n % lines` lines get one extra item.
pub fn plan_batches(
    stage: &str,
    n: usize,
    item_width: usize,
    prefix_len: usize,
    limits: BatchLimits,
) -> Result<Vec<Range<usize>>, PipelineError> {
    if n == 0 {
        return Ok(Vec::new());
    }
    let room = limits.max_chars.saturating_sub(prefix_len);
    let by_chars = room / item_width.max(1);
    if by_chars == 0 {
        return Err(PipelineError::BatchItemTooWide {
            stage: stage.to_string(),
            needed: prefix_len + item_width,
            cap: limits.max_chars,
        });
    }
    let cap = by_chars.min(limits.max_items.max(1));
    let lines = line_count(n, cap, limits.parallelism);

    let base = n / lines;
    let extra = n % lines;
    let mut ranges = Vec::with_capacity(lines);
    let mut start = 0;
    for line in 0..lines {
        let len = base + usize::from(line < extra);
        ranges.push(start..start + len);
        start += len;
    }
    Ok(ranges)
}

#[derive(Debug, Clone)]
struct Script {
    destination: Destination,
    path: Utf8PathBuf,
    binaries_directory: String,
    job_prefix: String,
    terminator: &'static str,
    lines: Vec<String>,
}

impl Script {
    fn command_prefix(&self, template: &CommandTemplate, configuration_argument: &str) -> String {
        let mut prefix = format!(
            "{}{}{}",
            self.job_prefix, self.binaries_directory, template.binary
        );
        if template.pass_configuration {
            prefix.push_str(configuration_argument);
        }
        if !template.params.is_empty() {
            prefix.push(' ');
            prefix.push_str(&template.params);
        }
        prefix
    }

    fn render(&self, lines: &[String]) -> String {
        let mut content = String::new();
        for line in lines {
            content.push_str(line);
            content.push_str(self.terminator);
        }
        content
    }
}

/// Per-destination line counts taken by [`ScriptTargets::checkpoint`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint(Vec<usize>);

/// The set of script destinations a run writes to. Lines are buffered in
/// memory until [`ScriptTargets::write_all`].
#[derive(Debug, Clone)]
pub struct ScriptTargets {
    scripts: Vec<Script>,
    configuration_argument: String,
    max_chars_per_line: usize,
    parallelism: usize,
}

impl ScriptTargets {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        let dir = &config.script_output_directory;
        let mut scripts = vec![
            Script {
                destination: Destination::Local,
                path: dir.join(LOCAL_SCRIPT),
                binaries_directory: config.binaries_directory.clone(),
                job_prefix: String::new(),
                terminator: "\r\n",
                lines: Vec::new(),
            },
            Script {
                destination: Destination::Unix,
                path: dir.join(UNIX_SCRIPT),
                binaries_directory: config.unix_binaries_directory.clone(),
                job_prefix: String::new(),
                terminator: "\n",
                lines: Vec::new(),
            },
        ];
        if let Some(name) = &config.cluster_script_filename {
            scripts.push(Script {
                destination: Destination::Cluster,
                path: dir.join(name),
                binaries_directory: config.cluster_binaries_directory.clone(),
                job_prefix: format!(
                    "job add %1 /exclusive /numnodes:1-1 /scheduler:{} ",
                    config.cluster_scheduler
                ),
                terminator: "\r\n",
                lines: Vec::new(),
            });
        }
        if let Some(name) = &config.cloud_script_filename {
            scripts.push(Script {
                destination: Destination::Cloud,
                path: dir.join(name),
                binaries_directory: config.cloud_binaries_directory.clone(),
                job_prefix: String::new(),
                terminator: "\n",
                lines: Vec::new(),
            });
        }
        Self {
            scripts,
            configuration_argument: config.configuration_argument.clone(),
            max_chars_per_line: config.max_chars_per_line,
            parallelism: config.n_worker_machines,
        }
    }

    pub fn destinations(&self) -> impl Iterator<Item = (Destination, &Utf8PathBuf)> {
        self.scripts
            .iter()
            .map(|script| (script.destination, &script.path))
    }

    pub fn lines(&self, destination: Destination) -> Option<&[String]> {
        self.scripts
            .iter()
            .find(|script| script.destination == destination)
            .map(|script| script.lines.as_slice())
    }

    /// Lines buffered so far for the local destination; every destination
    /// holds the same number.
    pub fn line_count(&self) -> usize {
        self.lines(Destination::Local).map_or(0, <[String]>::len)
    }

    /// Marks how many lines every destination holds, for [`rollback`].
    ///
    /// [`rollback`]: ScriptTargets::rollback
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.scripts.iter().map(|script| script.lines.len()).collect())
    }

    /// Drops every line appended since `checkpoint` was taken.
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        for (script, len) in self.scripts.iter_mut().zip(checkpoint.0) {
            script.lines.truncate(len);
        }
    }

    /// Batches `items` behind `template` and appends the lines to every
    /// destination. Returns the number of lines per destination.
    pub fn emit_batched(
        &mut self,
        stage: &str,
        template: &CommandTemplate,
        items: &[String],
        max_items_per_line: usize,
    ) -> Result<usize, PipelineError> {
        if items.is_empty() {
            return Ok(0);
        }
        // Batch against the longest prefix so every destination fits the cap.
        let prefix_len = self
            .scripts
            .iter()
            .map(|script| {
                script
                    .command_prefix(template, &self.configuration_argument)
                    .len()
            })
            .max()
            .unwrap_or(0);
        let item_width = items.iter().map(String::len).max().unwrap_or(0) + 1;
        let ranges = plan_batches(
            stage,
            items.len(),
            item_width,
            prefix_len,
            BatchLimits {
                max_items: max_items_per_line,
                max_chars: self.max_chars_per_line,
                parallelism: self.parallelism,
            },
        )?;

        for script in &mut self.scripts {
            let prefix = script.command_prefix(template, &self.configuration_argument);
            for range in &ranges {
                let mut line = prefix.clone();
                for item in &items[range.clone()] {
                    line.push(' ');
                    line.push_str(item);
                }
                script.lines.push(line);
            }
        }
        Ok(ranges.len())
    }

    /// Appends one unbatched command, e.g. for a single disease.
    pub fn emit_one(
        &mut self,
        stage: &str,
        template: &CommandTemplate,
        arguments: &str,
    ) -> Result<(), PipelineError> {
        let items = if arguments.is_empty() {
            Vec::new()
        } else {
            vec![arguments.to_string()]
        };
        if items.is_empty() {
            for script in &mut self.scripts {
                let line = script.command_prefix(template, &self.configuration_argument);
                script.lines.push(line);
            }
            return Ok(());
        }
        self.emit_batched(stage, template, &items, 1).map(|_| ())
    }

    /// Appends a command whose shape differs per destination. `render` gets
    /// the destination and its binaries directory; the job prefix is added
    /// here.
    pub fn emit_custom(&mut self, render: impl Fn(Destination, &str) -> String) {
        for script in &mut self.scripts {
            let body = render(script.destination, &script.binaries_directory);
            script.lines.push(format!("{}{body}", script.job_prefix));
        }
    }

    /// Writes every destination. The cluster queue gets its lines in random
    /// order so one stage's heavy jobs are spread across the queue.
    pub fn write_all(&self) -> Result<Vec<Utf8PathBuf>, PipelineError> {
        let mut written = Vec::with_capacity(self.scripts.len());
        for script in &self.scripts {
            let content = if script.destination == Destination::Cluster {
                let mut lines = script.lines.clone();
                lines.shuffle(&mut rand::thread_rng());
                script.render(&lines)
            } else {
                script.render(&script.lines)
            };
            write_atomic(&script.path, &content)?;
            info!(
                "wrote {} line(s) to {}",
                script.lines.len(),
                script.path
            );
            written.push(script.path.clone());
        }
        Ok(written)
    }
}
