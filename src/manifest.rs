use std::collections::{BTreeMap, HashMap};
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use csv::StringRecord;
use serde::Serialize;
use tracing::warn;

use crate::domain::{CaseId, Disease, FileId, Sample};
use crate::error::PipelineError;
use crate::tsv;

/// A file held by the remote archive, referenced from the cases table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteFile {
    pub file_id: FileId,
    pub md5: Option<String>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Case {
    pub case_id: CaseId,
    pub disease: Disease,
    /// Sequencing samples; a case without matched-normal RNA has no
    /// `Sample::NormalRna` entry.
    pub samples: BTreeMap<Sample, RemoteFile>,
    pub maf: Option<RemoteFile>,
    pub copy_number: Option<RemoteFile>,
}

impl Case {
    pub fn sample(&self, sample: Sample) -> Option<&RemoteFile> {
        self.samples.get(&sample)
    }

    pub fn has_normal_rna(&self) -> bool {
        self.samples.contains_key(&Sample::NormalRna)
    }

    /// Every remote file this case refers to.
    pub fn remote_files(&self) -> impl Iterator<Item = &RemoteFile> {
        self.samples
            .values()
            .chain(self.maf.iter())
            .chain(self.copy_number.iter())
    }
}

const CASE_ID: &str = "case_id";
const PROJECT_ID: &str = "project_id";

fn file_id_column(sample: Sample) -> &'static str {
    match sample {
        Sample::TumorDna => "tumor_dna_file_id",
        Sample::NormalDna => "normal_dna_file_id",
        Sample::TumorRna => "tumor_rna_file_id",
        Sample::NormalRna => "normal_rna_file_id",
    }
}

fn sample_prefix(sample: Sample) -> &'static str {
    match sample {
        Sample::TumorDna => "tumor_dna",
        Sample::NormalDna => "normal_dna",
        Sample::TumorRna => "tumor_rna",
        Sample::NormalRna => "normal_rna",
    }
}

pub struct CasesManifest;

impl CasesManifest {
    pub fn load(path: &Utf8Path) -> Result<BTreeMap<CaseId, Case>, PipelineError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| PipelineError::Filesystem(format!("read {path}: {err}")))?;
        Self::parse(path, &content)
    }

    /// Parses a tab-delimited cases table. Header problems fail the whole
    /// table; a bad row is logged and skipped.
    pub fn parse(path: &Utf8Path, content: &str) -> Result<BTreeMap<CaseId, Case>, PipelineError> {
        let malformed = |line: usize, message: String| PipelineError::MalformedRow {
            path: Utf8PathBuf::from(path),
            line,
            message,
        };

        let mut reader = tsv::reader(content);
        let headers = reader
            .headers()
            .map_err(|err| malformed(tsv::error_line(&err), err.to_string()))?;
        if headers.is_empty() {
            return Ok(BTreeMap::new());
        }
        let columns = Columns::new(path, headers)?;

        let mut cases = BTreeMap::new();
        for record in reader.records() {
            // Rows whose field count differs from the header fail here.
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    warn!("{}", malformed(tsv::error_line(&err), err.to_string()));
                    continue;
                }
            };
            let line_number = record.position().map_or(0, |pos| pos.line() as usize);
            match columns
                .parse_row(&record)
                .map_err(|message| malformed(line_number, message))
            {
                Ok(case) => {
                    if cases.contains_key(&case.case_id) {
                        warn!(
                            "{path} line {line_number}: duplicate case {}, keeping the first row",
                            case.case_id
                        );
                        continue;
                    }
                    cases.insert(case.case_id.clone(), case);
                }
                Err(err) => warn!("{err}"),
            }
        }
        Ok(cases)
    }
}

/// Column positions by lower-cased header name.
struct Columns {
    index: HashMap<String, usize>,
}

impl Columns {
    fn new(path: &Utf8Path, headers: &StringRecord) -> Result<Self, PipelineError> {
        let index: HashMap<String, usize> = headers
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_ascii_lowercase(), i))
            .collect();
        let required = [
            CASE_ID,
            PROJECT_ID,
            file_id_column(Sample::TumorDna),
            file_id_column(Sample::NormalDna),
            file_id_column(Sample::TumorRna),
        ];
        for column in required {
            if !index.contains_key(column) {
                return Err(PipelineError::MissingColumn {
                    path: Utf8PathBuf::from(path),
                    column: column.to_string(),
                });
            }
        }
        Ok(Self { index })
    }

    fn field<'a>(&self, record: &'a StringRecord, column: &str) -> Option<&'a str> {
        self.index
            .get(column)
            .and_then(|i| record.get(*i))
            .filter(|value| !value.is_empty())
    }

    fn remote(
        &self,
        record: &StringRecord,
        id_column: &str,
        prefix: &str,
    ) -> Result<Option<RemoteFile>, PipelineError> {
        let Some(raw_id) = self.field(record, id_column) else {
            return Ok(None);
        };
        let file_id: FileId = raw_id.parse()?;
        let md5 = self
            .field(record, &format!("{prefix}_md5"))
            .map(|value| value.to_ascii_lowercase());
        let size = self
            .field(record, &format!("{prefix}_size"))
            .and_then(|value| value.parse::<u64>().ok());
        Ok(Some(RemoteFile { file_id, md5, size }))
    }

    /// Builds the case of one row; the error is the reason it was rejected.
    fn parse_row(&self, record: &StringRecord) -> Result<Case, String> {
        let case_id: CaseId = self
            .field(record, CASE_ID)
            .ok_or_else(|| "empty case_id".to_string())?
            .parse()
            .map_err(|err: PipelineError| err.to_string())?;
        let disease = self
            .field(record, PROJECT_ID)
            .ok_or_else(|| "empty project_id".to_string())
            .and_then(|project| Disease::from_project(project).map_err(|err| err.to_string()))?;

        let mut samples = BTreeMap::new();
        for sample in Sample::ALL {
            let remote = self
                .remote(record, file_id_column(sample), sample_prefix(sample))
                .map_err(|err| err.to_string())?;
            match remote {
                Some(remote) => {
                    samples.insert(sample, remote);
                }
                None if sample == Sample::NormalRna => {}
                None => return Err(format!("missing {} file id", sample.label())),
            }
        }

        let maf = self
            .remote(record, "maf_file_id", "maf")
            .map_err(|err| err.to_string())?;
        let copy_number = self
            .remote(record, "copy_number_file_id", "copy_number")
            .map_err(|err| err.to_string())?;

        Ok(Case {
            case_id,
            disease,
            samples,
            maf,
            copy_number,
        })
    }
}
