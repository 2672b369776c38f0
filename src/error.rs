use camino::Utf8PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error("invalid case id: {0}")]
    InvalidCaseId(String),

    #[error("invalid file id: {0}")]
    InvalidFileId(String),

    #[error("invalid chromosome: {0}")]
    InvalidChromosome(String),

    #[error("invalid disease label: {0}")]
    InvalidDisease(String),

    #[error("missing config file kira-pipeline.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cases manifest {path} has no column named {column}")]
    MissingColumn { path: Utf8PathBuf, column: String },

    #[error("cases manifest {path} line {line}: {message}")]
    MalformedRow {
        path: Utf8PathBuf,
        line: usize,
        message: String,
    },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error(
        "stage {stage}: a single item needs {needed} characters but lines are capped at {cap}"
    )]
    #[diagnostic(help("raise max_chars_per_line or shorten the command prefix"))]
    BatchItemTooWide {
        stage: String,
        needed: usize,
        cap: usize,
    },

    #[error("{count} freshness violation(s); not generating scripts")]
    #[diagnostic(help("delete the stale generated files and rerun"))]
    FreshnessViolations { count: usize },

    #[error("{count} stage(s) failed to plan")]
    StagesFailed { count: usize },

    #[error("ASE measurements {path} line {line}: {message}")]
    AseInput {
        path: Utf8PathBuf,
        line: usize,
        message: String,
    },
}
