#![allow(dead_code)]

use std::fs::{self, File};
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use kira_pipeline::app::{App, PlanOptions, PlanResult};
use kira_pipeline::catalog::pipeline_stages;
use kira_pipeline::config::{Config, ConfigLoader, ResolvedConfig};
use kira_pipeline::domain::{CaseId, DerivedKind, FileId, Sample};
use kira_pipeline::error::PipelineError;
use kira_pipeline::output::JsonOutput;
use kira_pipeline::world::WorldSnapshot;

pub const DATA_DIRECTORY: &str = "data";

const CASES_HEADER: &str = "case_id\tproject_id\ttumor_dna_file_id\tnormal_dna_file_id\ttumor_rna_file_id\tnormal_rna_file_id";

pub fn guid(n: u32) -> String {
    format!("00000000-0000-4000-8000-{n:012}")
}

pub fn case_id(case: u32) -> CaseId {
    guid(case * 10).parse().unwrap()
}

/// Remote id of one of a case's four samples, in `Sample::ALL` order.
pub fn sample_file(case: u32, sample: Sample) -> FileId {
    let offset = Sample::ALL
        .iter()
        .position(|candidate| *candidate == sample)
        .unwrap() as u32;
    guid(case * 10 + offset + 1).parse().unwrap()
}

pub fn at(secs: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
}

/// Creates `path` with `content` and sets its modification time.
pub fn touch(path: &Utf8Path, content: &str, modified: SystemTime) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(modified)
        .unwrap();
}

/// A data tree in a temp directory with a configuration pointing at it.
pub struct Dataset {
    _dir: TempDir,
    pub root: Utf8PathBuf,
    pub config: ResolvedConfig,
}

impl Dataset {
    pub fn new() -> Self {
        Self::with_parallelism(1)
    }

    pub fn with_parallelism(n_worker_machines: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        for sub in ["scripts", "results", "cases", DATA_DIRECTORY] {
            fs::create_dir_all(root.join(sub)).unwrap();
        }
        let config = ConfigLoader::resolve_config(Config {
            binaries_directory: "/bin/".to_string(),
            script_output_directory: root.join("scripts"),
            data_directories: vec![root.join(DATA_DIRECTORY)],
            cases_file: root.join("cases").join("cases.txt"),
            final_results_directory: root.join("results"),
            n_worker_machines: Some(n_worker_machines),
            ..Config::default()
        })
        .unwrap();
        Self {
            _dir: dir,
            root,
            config,
        }
    }

    /// Writes the cases table. Cases listed in `tumor_only` get no normal RNA.
    pub fn write_cases(&self, cases: &[u32], tumor_only: &[u32]) {
        let mut content = format!("{CASES_HEADER}\n");
        for &case in cases {
            let normal_rna = if tumor_only.contains(&case) {
                String::new()
            } else {
                sample_file(case, Sample::NormalRna).to_string()
            };
            content.push_str(&format!(
                "{}\tTCGA-LUAD\t{}\t{}\t{}\t{normal_rna}\n",
                case_id(case),
                sample_file(case, Sample::TumorDna),
                sample_file(case, Sample::NormalDna),
                sample_file(case, Sample::TumorRna),
            ));
        }
        touch(&self.config.cases_file, &content, at(100));
    }

    pub fn download(&self, file_id: &FileId, modified: SystemTime) -> Utf8PathBuf {
        let path = self
            .root
            .join(DATA_DIRECTORY)
            .join(&self.config.downloaded_files_directory)
            .join(file_id.as_str())
            .join("reads.bam");
        touch(&path, "reads", modified);
        path
    }

    pub fn derive(
        &self,
        case: u32,
        source: &FileId,
        kind: DerivedKind,
        content: &str,
        modified: SystemTime,
    ) -> Utf8PathBuf {
        let path = self
            .root
            .join(DATA_DIRECTORY)
            .join(&self.config.derived_files_directory)
            .join(case_id(case).as_str())
            .join(format!("{source}{}", kind.extension()));
        touch(&path, content, modified);
        path
    }

    pub fn world(&self) -> WorldSnapshot {
        WorldSnapshot::load(&self.config)
    }

    pub fn app(&self) -> App {
        App::new(self.config.clone())
    }

    pub fn plan(&self, check_dependencies: bool) -> Result<PlanResult, PipelineError> {
        let world = self.world();
        let stages = pipeline_stages(&self.config);
        self.app()
            .plan(&world, &stages, PlanOptions { check_dependencies }, &JsonOutput)
    }

    pub fn script(&self, name: &str) -> Option<String> {
        fs::read_to_string(self.config.script_output_directory.join(name)).ok()
    }
}
