use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

static GUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
        .expect("static GUID pattern")
});

/// Width of a GUID-shaped identifier as it appears on a command line.
pub const GUID_LEN: usize = 36;

fn normalize_guid(value: &str) -> Option<String> {
    let normalized = value.trim().to_ascii_lowercase();
    GUID_RE.is_match(&normalized).then_some(normalized)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CaseId(String);

impl CaseId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CaseId {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        normalize_guid(value)
            .map(Self)
            .ok_or_else(|| PipelineError::InvalidCaseId(value.to_string()))
    }
}

/// Remote identifier of a downloadable file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(String);

impl FileId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FileId {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        normalize_guid(value)
            .map(Self)
            .ok_or_else(|| PipelineError::InvalidFileId(value.to_string()))
    }
}

/// Lower-case disease label, e.g. `brca`. Never contains `_`, which separates
/// chromosome and disease in per-chromosome file names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Disease(String);

impl Disease {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derives the disease from a project label such as `TCGA-BRCA`.
    pub fn from_project(project: &str) -> Result<Self, PipelineError> {
        let label = project
            .trim()
            .rsplit_once('-')
            .map(|(_, tail)| tail)
            .unwrap_or(project.trim());
        label.parse()
    }
}

impl fmt::Display for Disease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Disease {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        let is_valid = !normalized.is_empty()
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-');
        if !is_valid {
            return Err(PipelineError::InvalidDisease(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Chromosome {
    Autosome(u8),
    X,
    Y,
}

impl Chromosome {
    pub const AUTOSOMES: u8 = 22;

    /// The fixed enumeration used by per-chromosome stages.
    pub fn all() -> impl Iterator<Item = Chromosome> {
        (1..=Self::AUTOSOMES)
            .map(Chromosome::Autosome)
            .chain([Chromosome::X, Chromosome::Y])
    }

    /// Name without the `chr` prefix, as used inside file names.
    pub fn short_name(&self) -> String {
        match self {
            Chromosome::Autosome(n) => n.to_string(),
            Chromosome::X => "x".to_string(),
            Chromosome::Y => "y".to_string(),
        }
    }

    /// 1-based position in [`Chromosome::all`].
    pub fn index(&self) -> u64 {
        match self {
            Chromosome::Autosome(n) => u64::from(*n),
            Chromosome::X => u64::from(Self::AUTOSOMES) + 1,
            Chromosome::Y => u64::from(Self::AUTOSOMES) + 2,
        }
    }
}

impl fmt::Display for Chromosome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chromosome::Autosome(n) => write!(f, "chr{n}"),
            Chromosome::X => write!(f, "chrX"),
            Chromosome::Y => write!(f, "chrY"),
        }
    }
}

impl FromStr for Chromosome {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let lowered = value.trim().to_ascii_lowercase();
        let bare = lowered.strip_prefix("chr").unwrap_or(&lowered);
        match bare {
            "x" => Ok(Chromosome::X),
            "y" => Ok(Chromosome::Y),
            digits => digits
                .parse::<u8>()
                .ok()
                .filter(|n| (1..=Self::AUTOSOMES).contains(n))
                .map(Chromosome::Autosome)
                .ok_or_else(|| PipelineError::InvalidChromosome(value.to_string())),
        }
    }
}

/// The unit of work of a per-chromosome stage, written `chr7 luad`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChromosomeDisease {
    pub chromosome: Chromosome,
    pub disease: Disease,
}

impl fmt::Display for ChromosomeDisease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.chromosome, self.disease)
    }
}

/// Which of a case's four sequencing samples a file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Sample {
    TumorDna,
    NormalDna,
    TumorRna,
    NormalRna,
}

impl Sample {
    pub const ALL: [Sample; 4] = [
        Sample::TumorDna,
        Sample::NormalDna,
        Sample::TumorRna,
        Sample::NormalRna,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Sample::TumorDna => "tumor DNA",
            Sample::NormalDna => "normal DNA",
            Sample::TumorRna => "tumor RNA",
            Sample::NormalRna => "normal RNA",
        }
    }

    pub fn flags(&self) -> &'static str {
        match self {
            Sample::TumorDna => "-d -t",
            Sample::NormalDna => "-d -n",
            Sample::TumorRna => "-r -t",
            Sample::NormalRna => "-r -n",
        }
    }
}

/// Type tag of a derived file. The tag is encoded as the file-name suffix that
/// follows the id of the file it was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum DerivedKind {
    Allcount(Sample),
    ReadsAtSelectedVariants(Sample),
    ReadsAtSelectedVariantsIndex(Sample),
    Vcf,
    CompressedVcf,
    VcfStatistics,
    SelectedVariants,
    AnnotatedSelectedVariants,
    ExtractedMafLines,
    RegionalExpression,
    GeneExpression,
    TumorAlleleSpecificExpression,
    NormalAlleleSpecificExpression,
    TumorRnaMappedBaseCount,
    NormalRnaMappedBaseCount,
    AseMeasurements,
    CaseMetadata,
    VariantPhasing,
    ReadStatistics,
}

impl DerivedKind {
    pub fn all() -> Vec<DerivedKind> {
        let mut kinds = Vec::new();
        for sample in Sample::ALL {
            kinds.push(DerivedKind::Allcount(sample));
            kinds.push(DerivedKind::ReadsAtSelectedVariants(sample));
            kinds.push(DerivedKind::ReadsAtSelectedVariantsIndex(sample));
        }
        kinds.extend([
            DerivedKind::Vcf,
            DerivedKind::CompressedVcf,
            DerivedKind::VcfStatistics,
            DerivedKind::SelectedVariants,
            DerivedKind::AnnotatedSelectedVariants,
            DerivedKind::ExtractedMafLines,
            DerivedKind::RegionalExpression,
            DerivedKind::GeneExpression,
            DerivedKind::TumorAlleleSpecificExpression,
            DerivedKind::NormalAlleleSpecificExpression,
            DerivedKind::TumorRnaMappedBaseCount,
            DerivedKind::NormalRnaMappedBaseCount,
            DerivedKind::AseMeasurements,
            DerivedKind::CaseMetadata,
            DerivedKind::VariantPhasing,
            DerivedKind::ReadStatistics,
        ]);
        kinds
    }

    pub fn extension(&self) -> String {
        match self {
            DerivedKind::Allcount(sample) => format!(".{}.allcount.gz", sample_tag(*sample)),
            DerivedKind::ReadsAtSelectedVariants(sample) => {
                format!(".{}-reads-at-selected-variants.txt", sample_tag(*sample))
            }
            DerivedKind::ReadsAtSelectedVariantsIndex(sample) => {
                format!(".{}-reads-at-selected-variants.index", sample_tag(*sample))
            }
            DerivedKind::Vcf => ".vcf".to_string(),
            DerivedKind::CompressedVcf => ".vcf.gz".to_string(),
            DerivedKind::VcfStatistics => ".vcf-statistics.txt".to_string(),
            DerivedKind::SelectedVariants => ".selected-variants".to_string(),
            DerivedKind::AnnotatedSelectedVariants => ".annotated-selected-variants".to_string(),
            DerivedKind::ExtractedMafLines => ".extracted-maf-lines".to_string(),
            DerivedKind::RegionalExpression => ".regional-expression.txt".to_string(),
            DerivedKind::GeneExpression => ".gene-expression.txt".to_string(),
            DerivedKind::TumorAlleleSpecificExpression => {
                ".tumor-allele-specific-expression.txt".to_string()
            }
            DerivedKind::NormalAlleleSpecificExpression => {
                ".normal-allele-specific-expression.txt".to_string()
            }
            DerivedKind::TumorRnaMappedBaseCount => ".tumor-rna-mapped-base-count.txt".to_string(),
            DerivedKind::NormalRnaMappedBaseCount => {
                ".normal-rna-mapped-base-count.txt".to_string()
            }
            DerivedKind::AseMeasurements => ".ase-measurements.txt".to_string(),
            DerivedKind::CaseMetadata => ".case-metadata.txt".to_string(),
            DerivedKind::VariantPhasing => ".variant-phasing.txt".to_string(),
            DerivedKind::ReadStatistics => ".read-statistics.txt".to_string(),
        }
    }

    /// Splits a derived file name into the source id and the kind. The longest
    /// matching suffix wins, so `.vcf.gz` is never mistaken for another kind.
    pub fn parse_file_name(name: &str) -> Option<(FileId, DerivedKind)> {
        let (kind, stem) = Self::all()
            .into_iter()
            .filter_map(|kind| {
                let ext = kind.extension();
                name.strip_suffix(ext.as_str()).map(|stem| (kind, stem, ext.len()))
            })
            .max_by_key(|(_, _, len)| *len)
            .map(|(kind, stem, _)| (kind, stem))?;
        let id = stem.parse().ok()?;
        Some((id, kind))
    }
}

fn sample_tag(sample: Sample) -> &'static str {
    match sample {
        Sample::TumorDna => "tumor-dna",
        Sample::NormalDna => "normal-dna",
        Sample::TumorRna => "tumor-rna",
        Sample::NormalRna => "normal-rna",
    }
}
