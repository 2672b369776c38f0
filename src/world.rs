//! The once-per-run inventory of entities and artifact states.
//!
//! A [`WorldSnapshot`] is built from a file-system scan plus the cases
//! manifest and is read-only afterwards. Inconsistencies are logged and
//! degrade to fewer known entities; building a snapshot never fails.

use std::collections::{BTreeMap, BTreeSet};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{info, warn};

use crate::config::ResolvedConfig;
use crate::domain::{CaseId, Chromosome, ChromosomeDisease, DerivedKind, Disease, FileId, Sample};
use crate::manifest::{Case, CasesManifest};
use crate::scan::{DerivedFile, DownloadedFile, FileStamp, Inventory, list_dir};

pub const EXPRESSION_PREFIX: &str = "expression_";
pub const EXPRESSION_DISTRIBUTION_PREFIX: &str = "expression_distribution_";

pub fn expression_file_name(disease: &Disease) -> String {
    format!("{EXPRESSION_PREFIX}{disease}")
}

pub fn expression_distribution_file_name(chromosome: Chromosome, disease: &Disease) -> String {
    format!(
        "{EXPRESSION_DISTRIBUTION_PREFIX}{}_{disease}",
        chromosome.short_name()
    )
}

/// State of an artifact an entity may need or produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    Present(FileStamp),
    /// Expected but not produced yet.
    Absent,
    /// Not needed for this entity at all, e.g. a normal-RNA result for a case
    /// that has no normal RNA sample.
    NotApplicable,
}

impl Artifact {
    pub fn is_present(&self) -> bool {
        matches!(self, Artifact::Present(_))
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Artifact::Absent)
    }

    pub fn stamp(&self) -> Option<&FileStamp> {
        match self {
            Artifact::Present(stamp) => Some(stamp),
            _ => None,
        }
    }

    fn from_stamp(stamp: Option<&FileStamp>) -> Self {
        stamp.cloned().map_or(Artifact::Absent, Artifact::Present)
    }
}

/// A remote file whose absence means "queue a download" rather than "blocked
/// on upstream computation".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadableArtifact {
    pub file_id: FileId,
    pub expected_md5: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadState {
    Missing,
    /// A `.partial` transfer is on disk.
    InProgress,
    /// On disk, but the stored checksum does not (yet) match the expected one.
    Unverified(FileStamp),
    Verified(FileStamp),
}

#[derive(Debug, Clone, Default)]
pub struct WorldSnapshot {
    cases: BTreeMap<CaseId, Case>,
    diseases: BTreeSet<Disease>,
    downloaded: BTreeMap<FileId, DownloadedFile>,
    derived: BTreeMap<(CaseId, DerivedKind), DerivedFile>,
    global_files: BTreeMap<Utf8PathBuf, FileStamp>,
    expression_files: BTreeMap<Disease, FileStamp>,
    expression_distributions: BTreeMap<ChromosomeDisease, FileStamp>,
    common_data: Vec<FileStamp>,
    common_data_ready: bool,
    derived_subdirectory: String,
}

impl WorldSnapshot {
    pub fn builder(derived_subdirectory: impl Into<String>) -> WorldBuilder {
        WorldBuilder {
            world: WorldSnapshot {
                derived_subdirectory: derived_subdirectory.into(),
                ..WorldSnapshot::default()
            },
            pending_derived: Vec::new(),
            pending_distributions: Vec::new(),
            pending_expression: Vec::new(),
            common_data_expected: 0,
        }
    }

    /// Scans the configured directories and parses the cases manifest.
    pub fn load(config: &ResolvedConfig) -> Self {
        let inventory = Inventory::scan(
            &config.data_directories,
            &config.downloaded_files_directory,
            &config.derived_files_directory,
        );

        let mut builder = WorldSnapshot::builder(config.derived_files_directory.clone());

        if config.cases_file.as_std_path().exists() {
            match CasesManifest::load(&config.cases_file) {
                Ok(cases) => {
                    for case in cases.into_values() {
                        builder = builder.case(case);
                    }
                }
                Err(err) => warn!("ignoring cases manifest: {err}"),
            }
        } else {
            info!("no cases manifest at {}", config.cases_file);
        }

        for file in inventory.downloaded.into_values() {
            builder = builder.downloaded(file);
        }
        for file in inventory.derived.into_values().flatten() {
            builder = builder.derived(file);
        }

        let mut global_roots = vec![config.final_results_directory.clone()];
        if let Some(parent) = config.cases_file.parent() {
            global_roots.push(Utf8PathBuf::from(parent));
        }
        for root in global_roots {
            for path in list_dir(&root) {
                if let Some(stamp) = FileStamp::stat(&path) {
                    builder = builder.global_file(stamp);
                }
            }
        }

        for path in list_dir(&config.expression_files_directory) {
            let Some(stamp) = FileStamp::stat(&path) else {
                continue;
            };
            builder = builder.expression_file_candidate(stamp);
        }
        for path in list_dir(&config.expression_distribution_directory) {
            let Some(stamp) = FileStamp::stat(&path) else {
                continue;
            };
            builder = builder.expression_distribution_candidate(stamp);
        }

        let common: Vec<Option<FileStamp>> = config
            .common_data_files
            .iter()
            .map(|path| FileStamp::stat(path))
            .collect();
        builder = builder.common_data(common);

        let world = builder.build();
        world.log_census();
        world
    }

    pub fn has_cases(&self) -> bool {
        !self.cases.is_empty()
    }

    pub fn cases(&self) -> impl Iterator<Item = &Case> {
        self.cases.values()
    }

    pub fn case(&self, case_id: &CaseId) -> Option<&Case> {
        self.cases.get(case_id)
    }

    pub fn diseases(&self) -> impl Iterator<Item = &Disease> {
        self.diseases.iter()
    }

    pub fn cases_with_disease<'a>(&'a self, disease: &'a Disease) -> impl Iterator<Item = &'a Case> {
        self.cases.values().filter(move |case| &case.disease == disease)
    }

    pub fn common_data_ready(&self) -> bool {
        self.common_data_ready
    }

    pub fn common_data_files(&self) -> &[FileStamp] {
        &self.common_data
    }

    pub fn downloaded_file(&self, file_id: &FileId) -> Option<&DownloadedFile> {
        self.downloaded.get(file_id)
    }

    pub fn download_state(&self, artifact: &DownloadableArtifact) -> DownloadState {
        let Some(file) = self.downloaded.get(&artifact.file_id) else {
            return DownloadState::Missing;
        };
        if file.partial {
            return DownloadState::InProgress;
        }
        match &artifact.expected_md5 {
            Some(expected) if file.stored_md5.as_deref() != Some(expected.as_str()) => {
                DownloadState::Unverified(file.stamp.clone())
            }
            _ => DownloadState::Verified(file.stamp.clone()),
        }
    }

    /// A derived file of `kind` for the case: Present or Absent.
    pub fn derived(&self, case_id: &CaseId, kind: DerivedKind) -> Artifact {
        Artifact::from_stamp(
            self.derived
                .get(&(case_id.clone(), kind))
                .map(|file| &file.stamp),
        )
    }

    /// Where a derived file of `kind`, computed from the remote file `source`,
    /// belongs: next to the data directory that holds `source`.
    pub fn expected_derived_path(
        &self,
        case_id: &CaseId,
        source: &FileId,
        kind: DerivedKind,
    ) -> Option<Utf8PathBuf> {
        let downloaded = self.downloaded.get(source)?;
        Some(
            downloaded
                .data_directory
                .join(&self.derived_subdirectory)
                .join(case_id.as_str())
                .join(format!("{source}{}", kind.extension())),
        )
    }

    /// A global (one-off) file at `path`.
    pub fn global(&self, path: &Utf8Path) -> Artifact {
        Artifact::from_stamp(self.global_files.get(path))
    }

    pub fn expression_file(&self, disease: &Disease) -> Artifact {
        Artifact::from_stamp(self.expression_files.get(disease))
    }

    pub fn expression_distribution(&self, chromosome: Chromosome, disease: &Disease) -> Artifact {
        let key = ChromosomeDisease {
            chromosome,
            disease: disease.clone(),
        };
        Artifact::from_stamp(self.expression_distributions.get(&key))
    }

    /// Sum of manifest-declared sizes for the given remote files.
    pub fn declared_size<'a>(&self, file_ids: impl IntoIterator<Item = &'a FileId>) -> u64 {
        let sizes: BTreeMap<&FileId, u64> = self
            .cases
            .values()
            .flat_map(|case| case.remote_files())
            .filter_map(|remote| remote.size.map(|size| (&remote.file_id, size)))
            .collect();
        file_ids
            .into_iter()
            .filter_map(|id| sizes.get(id))
            .sum()
    }

    fn log_census(&self) {
        for sample in Sample::ALL {
            let (count, bytes) = self
                .cases
                .values()
                .filter_map(|case| case.sample(sample))
                .filter_map(|remote| self.downloaded.get(&remote.file_id))
                .fold((0usize, 0u64), |(n, bytes), file| (n + 1, bytes + file.stamp.size));
            info!("{count} {} files downloaded ({})", sample.label(), format_bytes(bytes));
        }
    }
}

/// Accumulates scan results and resolves cross references in [`build`].
///
/// [`build`]: WorldBuilder::build
pub struct WorldBuilder {
    world: WorldSnapshot,
    pending_derived: Vec<DerivedFile>,
    pending_distributions: Vec<FileStamp>,
    pending_expression: Vec<FileStamp>,
    common_data_expected: usize,
}

impl WorldBuilder {
    pub fn case(mut self, case: Case) -> Self {
        self.world.cases.insert(case.case_id.clone(), case);
        self
    }

    pub fn downloaded(mut self, file: DownloadedFile) -> Self {
        self.world.downloaded.insert(file.file_id.clone(), file);
        self
    }

    pub fn derived(mut self, file: DerivedFile) -> Self {
        self.pending_derived.push(file);
        self
    }

    pub fn global_file(mut self, stamp: FileStamp) -> Self {
        self.world.global_files.insert(stamp.path.clone(), stamp);
        self
    }

    /// A file from the expression directory; only `expression_<disease>`
    /// names for known diseases are kept.
    pub fn expression_file_candidate(mut self, stamp: FileStamp) -> Self {
        self.pending_expression.push(stamp);
        self
    }

    /// A file from the per-chromosome expression distribution directory.
    pub fn expression_distribution_candidate(mut self, stamp: FileStamp) -> Self {
        self.pending_distributions.push(stamp);
        self
    }

    /// Configured global tables; `None` marks one that is missing.
    pub fn common_data(mut self, files: Vec<Option<FileStamp>>) -> Self {
        self.common_data_expected = files.len();
        self.world.common_data = files.into_iter().flatten().collect();
        self
    }

    pub fn build(mut self) -> WorldSnapshot {
        self.world.diseases = self
            .world
            .cases
            .values()
            .map(|case| case.disease.clone())
            .collect();

        self.resolve_derived();
        self.resolve_expression_files();
        self.resolve_distributions();

        self.world.common_data_ready = self.world.has_cases()
            && self.world.common_data.len() == self.common_data_expected;

        self.world
    }

    fn resolve_derived(&mut self) {
        let mut unknown: BTreeMap<CaseId, BTreeSet<Utf8PathBuf>> = BTreeMap::new();
        for file in std::mem::take(&mut self.pending_derived) {
            if !self.world.cases.contains_key(&file.case_id) {
                if let Some(parent) = file.stamp.path.parent() {
                    unknown
                        .entry(file.case_id.clone())
                        .or_default()
                        .insert(Utf8PathBuf::from(parent));
                }
                continue;
            }
            let key = (file.case_id.clone(), file.kind);
            if let Some(existing) = self.world.derived.get(&key) {
                warn!(
                    "case {} has more than one {:?} file: {} and {}; keeping the first",
                    file.case_id, file.kind, existing.stamp.path, file.stamp.path
                );
                continue;
            }
            self.world.derived.insert(key, file);
        }

        for (case_id, directories) in unknown {
            let listed = directories
                .iter()
                .map(|dir| dir.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            warn!("derived files exist for case {case_id}, which isn't a known case: {listed}");
        }
    }

    fn resolve_expression_files(&mut self) {
        for stamp in std::mem::take(&mut self.pending_expression) {
            let name = stamp.path.file_name().unwrap_or_default();
            let Some(label) = name.strip_prefix(EXPRESSION_PREFIX) else {
                continue;
            };
            if label.starts_with("distribution_") {
                continue;
            }
            let disease = match label.parse::<Disease>() {
                Ok(disease) if self.world.diseases.contains(&disease) => disease,
                _ => {
                    warn!(
                        "expression file {} doesn't correspond to a known disease",
                        stamp.path
                    );
                    continue;
                }
            };
            self.world.expression_files.insert(disease, stamp);
        }
    }

    fn resolve_distributions(&mut self) {
        for stamp in std::mem::take(&mut self.pending_distributions) {
            let name = stamp.path.file_name().unwrap_or_default();
            let Some(rest) = name.strip_prefix(EXPRESSION_DISTRIBUTION_PREFIX) else {
                continue;
            };
            let fields: Vec<&str> = rest.split('_').collect();
            let parsed = match fields.as_slice() {
                [chromosome, disease] => chromosome
                    .parse::<Chromosome>()
                    .ok()
                    .zip(disease.parse::<Disease>().ok()),
                _ => None,
            };
            let Some((chromosome, disease)) = parsed else {
                warn!("malformed file name in expression distribution directory: {}", stamp.path);
                continue;
            };
            if !self.world.diseases.contains(&disease) {
                warn!(
                    "expression distribution file {} has an unknown disease",
                    stamp.path
                );
                continue;
            }
            let key = ChromosomeDisease {
                chromosome,
                disease,
            };
            if let Some(existing) = self.world.expression_distributions.get(&key) {
                warn!(
                    "duplicate expression distribution files: {} and {}",
                    stamp.path, existing.path
                );
                continue;
            }
            self.world.expression_distributions.insert(key, stamp);
        }
    }
}

/// Formats a byte count with binary units, e.g. `1.5 GiB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
