//! Stage variants and their readiness rules.
//!
//! Every stage classifies its units of work as done, waiting or ready and
//! hands the ready ones to the [`ScriptTargets`]. A stage is plain data: the
//! artifacts it reads and writes are described by locator closures over the
//! [`WorldSnapshot`].

use std::collections::BTreeSet;
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::batch::{CommandTemplate, Destination, ScriptTargets};
use crate::domain::{Chromosome, ChromosomeDisease, Disease, FileId};
use crate::error::PipelineError;
use crate::manifest::Case;
use crate::scan::FileStamp;
use crate::world::{Artifact, DownloadState, DownloadableArtifact, WorldSnapshot};

pub const DEFAULT_MAX_ITEMS_PER_LINE: usize = 100;

/// A partial download this old is probably abandoned.
const STALE_PARTIAL_AGE: Duration = Duration::from_secs(24 * 60 * 60);

pub type CaseLocator = Box<dyn Fn(&WorldSnapshot, &Case) -> Artifact>;
pub type GlobalLocator = Box<dyn Fn(&WorldSnapshot) -> Artifact>;
pub type DiseaseLocator = Box<dyn Fn(&WorldSnapshot, &Disease) -> Artifact>;
pub type ChromosomeDiseaseLocator = Box<dyn Fn(&WorldSnapshot, Chromosome, &Disease) -> Artifact>;
/// `None` when the case has no such remote file.
pub type DownloadLocator = Box<dyn Fn(&WorldSnapshot, &Case) -> Option<DownloadableArtifact>>;
/// The token a ready case contributes to its command line.
pub type CaseToken = Box<dyn Fn(&WorldSnapshot, &Case) -> Option<String>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageOutcome {
    pub done: usize,
    pub added: usize,
    pub waiting: usize,
    /// Remote files this stage is waiting on, in first-seen order.
    pub downloads: Vec<FileId>,
}

/// A done unit whose output is older than one of its inputs, or whose
/// declared input is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FreshnessViolation {
    pub stage: String,
    pub output: Utf8PathBuf,
    /// `None` when a declared input no longer exists.
    pub input: Option<Utf8PathBuf>,
}

pub enum Stage {
    PerCase(PerCaseStage),
    PerDisease(PerDiseaseStage),
    PerChromosomeDisease(PerChromosomeDiseaseStage),
    SingleOutput(SingleOutputStage),
    Download(DownloadStage),
    Checksum(ChecksumStage),
}

impl Stage {
    pub fn name(&self) -> &str {
        match self {
            Stage::PerCase(stage) => &stage.name,
            Stage::PerDisease(stage) => &stage.name,
            Stage::PerChromosomeDisease(stage) => &stage.name,
            Stage::SingleOutput(stage) => &stage.name,
            Stage::Download(stage) => &stage.name,
            Stage::Checksum(stage) => &stage.name,
        }
    }

    /// Whether the stage has nothing to do until the cases are known.
    pub fn needs_cases(&self) -> bool {
        match self {
            Stage::SingleOutput(stage) => stage.needs_cases,
            _ => true,
        }
    }

    pub fn evaluate(
        &self,
        world: &WorldSnapshot,
        targets: &mut ScriptTargets,
    ) -> Result<StageOutcome, PipelineError> {
        // A stage that fails partway leaves no lines behind.
        let checkpoint = targets.checkpoint();
        let evaluated = match self {
            Stage::PerCase(stage) => stage.evaluate(world, targets),
            Stage::PerDisease(stage) => stage.evaluate(world, targets),
            Stage::PerChromosomeDisease(stage) => stage.evaluate(world, targets),
            Stage::SingleOutput(stage) => stage.evaluate(world, targets),
            Stage::Download(stage) => Ok(stage.evaluate(world)),
            Stage::Checksum(stage) => Ok(stage.evaluate(world, targets)),
        };
        let outcome = match evaluated {
            Ok(outcome) => outcome,
            Err(err) => {
                targets.rollback(checkpoint);
                return Err(err);
            }
        };
        debug!(
            stage = self.name(),
            done = outcome.done,
            added = outcome.added,
            waiting = outcome.waiting,
            "evaluated stage"
        );
        Ok(outcome)
    }

    /// Every done unit's outputs must be at least as new as its inputs, and
    /// its declared inputs must still exist.
    pub fn check_freshness(&self, world: &WorldSnapshot) -> Vec<FreshnessViolation> {
        match self {
            Stage::PerCase(stage) => stage.check_freshness(world),
            Stage::PerDisease(stage) => stage.check_freshness(world),
            Stage::PerChromosomeDisease(stage) => stage.check_freshness(world),
            Stage::SingleOutput(stage) => stage.check_freshness(world),
            Stage::Download(_) => Vec::new(),
            Stage::Checksum(stage) => stage.check_freshness(world),
        }
    }
}

enum Completion {
    /// Every output is not applicable; the unit is left out of all counts.
    Excluded,
    Done,
    Pending,
}

fn completion(outputs: &[Artifact]) -> Completion {
    let mut applicable = outputs
        .iter()
        .filter(|artifact| !matches!(artifact, Artifact::NotApplicable))
        .peekable();
    if applicable.peek().is_none() {
        return Completion::Excluded;
    }
    if applicable.any(Artifact::is_present) {
        Completion::Done
    } else {
        Completion::Pending
    }
}

#[derive(Default)]
struct Prerequisites {
    missing: bool,
    downloads: Vec<FileId>,
}

impl Prerequisites {
    fn require(&mut self, artifact: &Artifact) {
        if artifact.is_absent() {
            self.missing = true;
        }
    }

    fn require_download(&mut self, world: &WorldSnapshot, artifact: Option<DownloadableArtifact>) {
        let Some(artifact) = artifact else {
            return;
        };
        match world.download_state(&artifact) {
            DownloadState::Verified(_) => {}
            DownloadState::Missing => {
                self.missing = true;
                self.downloads.push(artifact.file_id);
            }
            DownloadState::InProgress | DownloadState::Unverified(_) => self.missing = true,
        }
    }

    fn satisfied(&self) -> bool {
        !self.missing
    }
}

fn download_as_artifact(world: &WorldSnapshot, artifact: Option<DownloadableArtifact>) -> Artifact {
    match artifact.map(|artifact| world.download_state(&artifact)) {
        None => Artifact::NotApplicable,
        Some(DownloadState::Verified(stamp)) | Some(DownloadState::Unverified(stamp)) => {
            Artifact::Present(stamp)
        }
        Some(DownloadState::Missing) | Some(DownloadState::InProgress) => Artifact::Absent,
    }
}

fn stale_pairs<'a>(
    stage: &str,
    outputs: &[Artifact],
    inputs: impl IntoIterator<Item = &'a FileStamp> + Clone,
    violations: &mut Vec<FreshnessViolation>,
) {
    for output in outputs.iter().filter_map(Artifact::stamp) {
        for input in inputs.clone() {
            if output.modified < input.modified {
                violations.push(FreshnessViolation {
                    stage: stage.to_string(),
                    output: output.path.clone(),
                    input: Some(input.path.clone()),
                });
            }
        }
    }
}

/// Reports each present output once when any declared input is absent.
/// Not-applicable inputs are skipped.
fn missing_inputs(
    stage: &str,
    outputs: &[Artifact],
    inputs: &[Artifact],
    violations: &mut Vec<FreshnessViolation>,
) {
    if !inputs.iter().any(Artifact::is_absent) {
        return;
    }
    for output in outputs.iter().filter_map(Artifact::stamp) {
        violations.push(FreshnessViolation {
            stage: stage.to_string(),
            output: output.path.clone(),
            input: None,
        });
    }
}

fn present_stamps(artifacts: &[Artifact]) -> Vec<&FileStamp> {
    artifacts.iter().filter_map(Artifact::stamp).collect()
}

/// One unit of work per case, batched many cases to a line.
pub struct PerCaseStage {
    name: String,
    template: CommandTemplate,
    max_items_per_line: usize,
    inputs: Vec<CaseLocator>,
    downloads: Vec<DownloadLocator>,
    outputs: Vec<CaseLocator>,
    token: Option<CaseToken>,
}

impl PerCaseStage {
    pub fn new(name: impl Into<String>, template: CommandTemplate) -> Self {
        Self {
            name: name.into(),
            template,
            max_items_per_line: DEFAULT_MAX_ITEMS_PER_LINE,
            inputs: Vec::new(),
            downloads: Vec::new(),
            outputs: Vec::new(),
            token: None,
        }
    }

    pub fn max_items_per_line(mut self, max: usize) -> Self {
        self.max_items_per_line = max;
        self
    }

    pub fn input(mut self, locator: impl Fn(&WorldSnapshot, &Case) -> Artifact + 'static) -> Self {
        self.inputs.push(Box::new(locator));
        self
    }

    pub fn download(
        mut self,
        locator: impl Fn(&WorldSnapshot, &Case) -> Option<DownloadableArtifact> + 'static,
    ) -> Self {
        self.downloads.push(Box::new(locator));
        self
    }

    pub fn output(mut self, locator: impl Fn(&WorldSnapshot, &Case) -> Artifact + 'static) -> Self {
        self.outputs.push(Box::new(locator));
        self
    }

    /// Replaces the default case-id token.
    pub fn token(mut self, token: impl Fn(&WorldSnapshot, &Case) -> Option<String> + 'static) -> Self {
        self.token = Some(Box::new(token));
        self
    }

    fn outputs_of(&self, world: &WorldSnapshot, case: &Case) -> Vec<Artifact> {
        self.outputs.iter().map(|locator| locator(world, case)).collect()
    }

    fn evaluate(
        &self,
        world: &WorldSnapshot,
        targets: &mut ScriptTargets,
    ) -> Result<StageOutcome, PipelineError> {
        let mut outcome = StageOutcome::default();
        let mut ready = Vec::new();

        for case in world.cases() {
            match completion(&self.outputs_of(world, case)) {
                Completion::Excluded => continue,
                Completion::Done => {
                    outcome.done += 1;
                    continue;
                }
                Completion::Pending => {}
            }

            let mut prerequisites = Prerequisites::default();
            for locator in &self.inputs {
                prerequisites.require(&locator(world, case));
            }
            for locator in &self.downloads {
                prerequisites.require_download(world, locator(world, case));
            }
            if !prerequisites.satisfied() {
                outcome.waiting += 1;
                outcome.downloads.extend(prerequisites.downloads);
                continue;
            }

            let token = match &self.token {
                Some(token) => token(world, case),
                None => Some(case.case_id.to_string()),
            };
            match token {
                Some(token) => ready.push(token),
                None => outcome.waiting += 1,
            }
        }

        targets.emit_batched(&self.name, &self.template, &ready, self.max_items_per_line)?;
        outcome.added = ready.len();
        Ok(outcome)
    }

    fn check_freshness(&self, world: &WorldSnapshot) -> Vec<FreshnessViolation> {
        let mut violations = Vec::new();
        for case in world.cases() {
            let outputs = self.outputs_of(world, case);
            if !matches!(completion(&outputs), Completion::Done) {
                continue;
            }
            let inputs: Vec<Artifact> = self.inputs.iter().map(|locator| locator(world, case)).collect();
            missing_inputs(&self.name, &outputs, &inputs, &mut violations);
            // Downloads are only compared by age; a removed download is not
            // a violation.
            let downloads: Vec<Artifact> = self
                .downloads
                .iter()
                .map(|locator| download_as_artifact(world, locator(world, case)))
                .collect();
            let stamps = present_stamps(&inputs).into_iter().chain(present_stamps(&downloads));
            stale_pairs(&self.name, &outputs, stamps, &mut violations);
        }
        violations
    }
}

/// Inputs shared by the per-disease shapes: global one-offs, per-disease
/// files and the per-case files of every case with that disease.
#[derive(Default)]
struct DiseaseInputs {
    one_offs: Vec<GlobalLocator>,
    disease_inputs: Vec<DiseaseLocator>,
    case_inputs: Vec<CaseLocator>,
}

impl DiseaseInputs {
    fn collect(&self, world: &WorldSnapshot, disease: &Disease) -> Vec<Artifact> {
        let mut artifacts: Vec<Artifact> = self.one_offs.iter().map(|locator| locator(world)).collect();
        artifacts.extend(self.disease_inputs.iter().map(|locator| locator(world, disease)));
        for case in world.cases_with_disease(disease) {
            artifacts.extend(self.case_inputs.iter().map(|locator| locator(world, case)));
        }
        artifacts
    }

    fn satisfied(&self, world: &WorldSnapshot, disease: &Disease) -> bool {
        let mut prerequisites = Prerequisites::default();
        for artifact in self.collect(world, disease) {
            prerequisites.require(&artifact);
        }
        prerequisites.satisfied()
    }
}

/// One command per disease.
pub struct PerDiseaseStage {
    name: String,
    template: CommandTemplate,
    inputs: DiseaseInputs,
    outputs: Vec<DiseaseLocator>,
}

impl PerDiseaseStage {
    pub fn new(name: impl Into<String>, template: CommandTemplate) -> Self {
        Self {
            name: name.into(),
            template,
            inputs: DiseaseInputs::default(),
            outputs: Vec::new(),
        }
    }

    pub fn one_off(mut self, locator: impl Fn(&WorldSnapshot) -> Artifact + 'static) -> Self {
        self.inputs.one_offs.push(Box::new(locator));
        self
    }

    pub fn disease_input(
        mut self,
        locator: impl Fn(&WorldSnapshot, &Disease) -> Artifact + 'static,
    ) -> Self {
        self.inputs.disease_inputs.push(Box::new(locator));
        self
    }

    pub fn case_input(mut self, locator: impl Fn(&WorldSnapshot, &Case) -> Artifact + 'static) -> Self {
        self.inputs.case_inputs.push(Box::new(locator));
        self
    }

    pub fn output(mut self, locator: impl Fn(&WorldSnapshot, &Disease) -> Artifact + 'static) -> Self {
        self.outputs.push(Box::new(locator));
        self
    }

    fn outputs_of(&self, world: &WorldSnapshot, disease: &Disease) -> Vec<Artifact> {
        self.outputs.iter().map(|locator| locator(world, disease)).collect()
    }

    fn evaluate(
        &self,
        world: &WorldSnapshot,
        targets: &mut ScriptTargets,
    ) -> Result<StageOutcome, PipelineError> {
        let mut outcome = StageOutcome::default();
        for disease in world.diseases() {
            match completion(&self.outputs_of(world, disease)) {
                Completion::Excluded => continue,
                Completion::Done => outcome.done += 1,
                Completion::Pending if !self.inputs.satisfied(world, disease) => {
                    outcome.waiting += 1
                }
                Completion::Pending => {
                    targets.emit_one(&self.name, &self.template, disease.as_str())?;
                    outcome.added += 1;
                }
            }
        }
        Ok(outcome)
    }

    fn check_freshness(&self, world: &WorldSnapshot) -> Vec<FreshnessViolation> {
        let mut violations = Vec::new();
        for disease in world.diseases() {
            let outputs = self.outputs_of(world, disease);
            if !matches!(completion(&outputs), Completion::Done) {
                continue;
            }
            let inputs = self.inputs.collect(world, disease);
            missing_inputs(&self.name, &outputs, &inputs, &mut violations);
            stale_pairs(&self.name, &outputs, present_stamps(&inputs), &mut violations);
        }
        violations
    }
}

/// One command per (chromosome, disease) pair.
pub struct PerChromosomeDiseaseStage {
    name: String,
    template: CommandTemplate,
    inputs: DiseaseInputs,
    outputs: Vec<ChromosomeDiseaseLocator>,
}

impl PerChromosomeDiseaseStage {
    pub fn new(name: impl Into<String>, template: CommandTemplate) -> Self {
        Self {
            name: name.into(),
            template,
            inputs: DiseaseInputs::default(),
            outputs: Vec::new(),
        }
    }

    pub fn one_off(mut self, locator: impl Fn(&WorldSnapshot) -> Artifact + 'static) -> Self {
        self.inputs.one_offs.push(Box::new(locator));
        self
    }

    pub fn disease_input(
        mut self,
        locator: impl Fn(&WorldSnapshot, &Disease) -> Artifact + 'static,
    ) -> Self {
        self.inputs.disease_inputs.push(Box::new(locator));
        self
    }

    pub fn case_input(mut self, locator: impl Fn(&WorldSnapshot, &Case) -> Artifact + 'static) -> Self {
        self.inputs.case_inputs.push(Box::new(locator));
        self
    }

    pub fn output(
        mut self,
        locator: impl Fn(&WorldSnapshot, Chromosome, &Disease) -> Artifact + 'static,
    ) -> Self {
        self.outputs.push(Box::new(locator));
        self
    }

    fn outputs_of(&self, world: &WorldSnapshot, chromosome: Chromosome, disease: &Disease) -> Vec<Artifact> {
        self.outputs
            .iter()
            .map(|locator| locator(world, chromosome, disease))
            .collect()
    }

    fn evaluate(
        &self,
        world: &WorldSnapshot,
        targets: &mut ScriptTargets,
    ) -> Result<StageOutcome, PipelineError> {
        let mut outcome = StageOutcome::default();
        for disease in world.diseases() {
            // Inputs do not depend on the chromosome.
            let mut inputs_ready = None;
            for chromosome in Chromosome::all() {
                match completion(&self.outputs_of(world, chromosome, disease)) {
                    Completion::Excluded => continue,
                    Completion::Done => {
                        outcome.done += 1;
                        continue;
                    }
                    Completion::Pending => {}
                }
                if *inputs_ready.get_or_insert_with(|| self.inputs.satisfied(world, disease)) {
                    let unit = ChromosomeDisease {
                        chromosome,
                        disease: disease.clone(),
                    };
                    targets.emit_one(&self.name, &self.template, &unit.to_string())?;
                    outcome.added += 1;
                } else {
                    outcome.waiting += 1;
                }
            }
        }
        Ok(outcome)
    }

    fn check_freshness(&self, world: &WorldSnapshot) -> Vec<FreshnessViolation> {
        let mut violations = Vec::new();
        for disease in world.diseases() {
            let inputs = self.inputs.collect(world, disease);
            for chromosome in Chromosome::all() {
                let outputs = self.outputs_of(world, chromosome, disease);
                if matches!(completion(&outputs), Completion::Done) {
                    missing_inputs(&self.name, &outputs, &inputs, &mut violations);
                    stale_pairs(&self.name, &outputs, present_stamps(&inputs), &mut violations);
                }
            }
        }
        violations
    }
}

/// A global step with exactly one unit of work.
pub struct SingleOutputStage {
    name: String,
    template: CommandTemplate,
    arguments: String,
    needs_cases: bool,
    needs_common_data: bool,
    one_offs: Vec<GlobalLocator>,
    case_inputs: Vec<CaseLocator>,
    outputs: Vec<GlobalLocator>,
}

impl SingleOutputStage {
    pub fn new(name: impl Into<String>, template: CommandTemplate) -> Self {
        Self {
            name: name.into(),
            template,
            arguments: String::new(),
            needs_cases: true,
            needs_common_data: false,
            one_offs: Vec::new(),
            case_inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn arguments(mut self, arguments: impl Into<String>) -> Self {
        self.arguments = arguments.into();
        self
    }

    /// The stage can run before any case is known.
    pub fn without_cases(mut self) -> Self {
        self.needs_cases = false;
        self
    }

    /// Wait until the global precomputed tables are in place.
    pub fn needs_common_data(mut self) -> Self {
        self.needs_common_data = true;
        self
    }

    pub fn one_off(mut self, locator: impl Fn(&WorldSnapshot) -> Artifact + 'static) -> Self {
        self.one_offs.push(Box::new(locator));
        self
    }

    pub fn case_input(mut self, locator: impl Fn(&WorldSnapshot, &Case) -> Artifact + 'static) -> Self {
        self.case_inputs.push(Box::new(locator));
        self
    }

    pub fn output(mut self, locator: impl Fn(&WorldSnapshot) -> Artifact + 'static) -> Self {
        self.outputs.push(Box::new(locator));
        self
    }

    fn inputs_of(&self, world: &WorldSnapshot) -> Vec<Artifact> {
        let mut artifacts: Vec<Artifact> = self.one_offs.iter().map(|locator| locator(world)).collect();
        for case in world.cases() {
            artifacts.extend(self.case_inputs.iter().map(|locator| locator(world, case)));
        }
        artifacts
    }

    fn evaluate(
        &self,
        world: &WorldSnapshot,
        targets: &mut ScriptTargets,
    ) -> Result<StageOutcome, PipelineError> {
        let mut outcome = StageOutcome::default();
        let outputs: Vec<Artifact> = self.outputs.iter().map(|locator| locator(world)).collect();
        match completion(&outputs) {
            Completion::Excluded => {}
            Completion::Done => outcome.done = 1,
            Completion::Pending => {
                let mut prerequisites = Prerequisites::default();
                for artifact in self.inputs_of(world) {
                    prerequisites.require(&artifact);
                }
                if self.needs_common_data && !world.common_data_ready() {
                    prerequisites.missing = true;
                }
                if prerequisites.satisfied() {
                    targets.emit_one(&self.name, &self.template, &self.arguments)?;
                    outcome.added = 1;
                } else {
                    outcome.waiting = 1;
                }
            }
        }
        Ok(outcome)
    }

    fn check_freshness(&self, world: &WorldSnapshot) -> Vec<FreshnessViolation> {
        let mut violations = Vec::new();
        let outputs: Vec<Artifact> = self.outputs.iter().map(|locator| locator(world)).collect();
        if !matches!(completion(&outputs), Completion::Done) {
            return violations;
        }
        let inputs = self.inputs_of(world);
        missing_inputs(&self.name, &outputs, &inputs, &mut violations);
        let mut stamps = present_stamps(&inputs);
        if self.needs_common_data {
            stamps.extend(world.common_data_files());
        }
        stale_pairs(&self.name, &outputs, stamps, &mut violations);
        violations
    }
}

/// Queues every remote file the cases refer to that is not on disk yet.
pub struct DownloadStage {
    name: String,
}

impl DownloadStage {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn evaluate(&self, world: &WorldSnapshot) -> StageOutcome {
        let mut outcome = StageOutcome::default();
        let mut seen = BTreeSet::new();
        for remote in world.cases().flat_map(Case::remote_files) {
            if !seen.insert(&remote.file_id) {
                continue;
            }
            if world.downloaded_file(&remote.file_id).is_some() {
                outcome.done += 1;
            } else {
                outcome.downloads.push(remote.file_id.clone());
            }
        }
        outcome
    }
}

/// Computes the stored checksum of every downloaded file that has an
/// expected one.
pub struct ChecksumStage {
    name: String,
    binary: String,
    cluster_script: String,
    enabled: bool,
}

impl ChecksumStage {
    pub fn new(
        name: impl Into<String>,
        binary: impl Into<String>,
        cluster_script: impl Into<String>,
        enabled: bool,
    ) -> Self {
        Self {
            name: name.into(),
            binary: binary.into(),
            cluster_script: cluster_script.into(),
            enabled,
        }
    }

    fn evaluate(&self, world: &WorldSnapshot, targets: &mut ScriptTargets) -> StageOutcome {
        let mut outcome = StageOutcome::default();
        if !self.enabled {
            return outcome;
        }

        let now = SystemTime::now();
        let mut seen = BTreeSet::new();
        for remote in world.cases().flat_map(Case::remote_files) {
            let Some(expected) = &remote.md5 else {
                continue;
            };
            if !seen.insert(&remote.file_id) {
                continue;
            }
            let Some(file) = world.downloaded_file(&remote.file_id) else {
                outcome.waiting += 1;
                continue;
            };
            if file.partial {
                if now
                    .duration_since(file.stamp.modified)
                    .is_ok_and(|age| age > STALE_PARTIAL_AGE)
                {
                    warn!(
                        "partial download {} was last written {}; it may have been abandoned",
                        file.stamp.path,
                        DateTime::<Utc>::from(file.stamp.modified).format("%Y-%m-%d %H:%M")
                    );
                }
                outcome.waiting += 1;
                continue;
            }
            if let Some(stored) = &file.stored_md5 {
                if stored != expected {
                    warn!(
                        "checksum mismatch for {}: expected {expected}, computed {stored}",
                        file.stamp.path
                    );
                }
                outcome.done += 1;
                continue;
            }

            let path = file.stamp.path.clone();
            targets.emit_custom(|destination, binaries| {
                checksum_command(destination, binaries, &self.binary, &self.cluster_script, &path)
            });
            outcome.added += 1;
        }
        outcome
    }

    fn check_freshness(&self, world: &WorldSnapshot) -> Vec<FreshnessViolation> {
        if !self.enabled {
            return Vec::new();
        }
        let mut seen = BTreeSet::new();
        world
            .cases()
            .flat_map(Case::remote_files)
            .filter(|remote| seen.insert(remote.file_id.clone()))
            .filter_map(|remote| world.downloaded_file(&remote.file_id))
            .filter_map(|file| {
                let md5 = file.md5_stamp.as_ref()?;
                (md5.modified < file.stamp.modified).then(|| FreshnessViolation {
                    stage: self.name.clone(),
                    output: md5.path.clone(),
                    input: Some(file.stamp.path.clone()),
                })
            })
            .collect()
    }
}

fn checksum_command(
    destination: Destination,
    binaries: &str,
    binary: &str,
    cluster_script: &str,
    path: &Utf8Path,
) -> String {
    match destination {
        Destination::Cluster => format!("{binaries}{cluster_script} {path}"),
        _ => format!("{binaries}{binary} {path} > {path}.md5"),
    }
}

impl From<PerCaseStage> for Stage {
    fn from(stage: PerCaseStage) -> Self {
        Stage::PerCase(stage)
    }
}

impl From<PerDiseaseStage> for Stage {
    fn from(stage: PerDiseaseStage) -> Self {
        Stage::PerDisease(stage)
    }
}

impl From<PerChromosomeDiseaseStage> for Stage {
    fn from(stage: PerChromosomeDiseaseStage) -> Self {
        Stage::PerChromosomeDisease(stage)
    }
}

impl From<SingleOutputStage> for Stage {
    fn from(stage: SingleOutputStage) -> Self {
        Stage::SingleOutput(stage)
    }
}

impl From<DownloadStage> for Stage {
    fn from(stage: DownloadStage) -> Self {
        Stage::Download(stage)
    }
}

impl From<ChecksumStage> for Stage {
    fn from(stage: ChecksumStage) -> Self {
        Stage::Checksum(stage)
    }
}
