use std::fs;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

pub const DEFAULT_CONFIG_FILE: &str = "kira-pipeline.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    pub binaries_directory: String,
    #[serde(default)]
    pub unix_binaries_directory: Option<String>,
    #[serde(default)]
    pub cluster_binaries_directory: Option<String>,
    #[serde(default)]
    pub cloud_binaries_directory: Option<String>,
    #[serde(default)]
    pub cluster_scheduler: Option<String>,
    pub script_output_directory: Utf8PathBuf,
    #[serde(default)]
    pub cluster_script_filename: Option<String>,
    #[serde(default)]
    pub cloud_script_filename: Option<String>,
    #[serde(default)]
    pub data_directories: Vec<Utf8PathBuf>,
    #[serde(default)]
    pub downloaded_files_directory: Option<String>,
    #[serde(default)]
    pub derived_files_directory: Option<String>,
    pub cases_file: Utf8PathBuf,
    pub final_results_directory: Utf8PathBuf,
    #[serde(default)]
    pub expression_files_directory: Option<Utf8PathBuf>,
    #[serde(default)]
    pub expression_distribution_directory: Option<Utf8PathBuf>,
    #[serde(default)]
    pub access_token_path: Option<Utf8PathBuf>,
    #[serde(default)]
    pub n_worker_machines: Option<usize>,
    #[serde(default)]
    pub max_chars_per_line: Option<usize>,
    #[serde(default)]
    pub downloaded_files_have_md5_sums: Option<bool>,
    #[serde(default)]
    pub common_data_files: Vec<Utf8PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub binaries_directory: String,
    pub unix_binaries_directory: String,
    pub cluster_binaries_directory: String,
    pub cloud_binaries_directory: String,
    pub cluster_scheduler: String,
    pub script_output_directory: Utf8PathBuf,
    pub cluster_script_filename: Option<String>,
    pub cloud_script_filename: Option<String>,
    pub data_directories: Vec<Utf8PathBuf>,
    pub downloaded_files_directory: String,
    pub derived_files_directory: String,
    pub cases_file: Utf8PathBuf,
    pub final_results_directory: Utf8PathBuf,
    pub expression_files_directory: Utf8PathBuf,
    pub expression_distribution_directory: Utf8PathBuf,
    pub access_token_path: Utf8PathBuf,
    pub n_worker_machines: usize,
    pub max_chars_per_line: usize,
    pub downloaded_files_have_md5_sums: bool,
    pub common_data_files: Vec<Utf8PathBuf>,
    /// Appended to every emitted command when the configuration file was named
    /// explicitly, so the external programs read the same one.
    pub configuration_argument: String,
    /// The configuration file, when it was named explicitly.
    pub config_path: Option<Utf8PathBuf>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, PipelineError> {
        let config_path = match path {
            Some(path) => Utf8PathBuf::from(path),
            None => Utf8PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.as_std_path().exists() {
            return Err(PipelineError::MissingConfig);
        }

        let content = fs::read_to_string(config_path.as_std_path())
            .map_err(|_| PipelineError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| PipelineError::ConfigParse(err.to_string()))?;

        let mut resolved = Self::resolve_config(config)?;
        if path.is_some() {
            resolved.configuration_argument = format!(" -configuration {config_path}");
            resolved.config_path = Some(config_path);
        }
        Ok(resolved)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, PipelineError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let n_worker_machines = config.n_worker_machines.unwrap_or(1);
        if n_worker_machines == 0 {
            return Err(PipelineError::InvalidConfig(
                "n_worker_machines must be at least 1".to_string(),
            ));
        }

        let max_chars_per_line = config.max_chars_per_line.unwrap_or(5000);
        if max_chars_per_line == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_chars_per_line must be positive".to_string(),
            ));
        }

        let binaries_directory = with_trailing_separator(&config.binaries_directory, '\\');
        let unix_binaries_directory = config
            .unix_binaries_directory
            .map(|dir| with_trailing_separator(&dir, '/'))
            .unwrap_or_else(|| binaries_directory.clone());
        let cluster_binaries_directory = config
            .cluster_binaries_directory
            .map(|dir| with_trailing_separator(&dir, '\\'))
            .unwrap_or_else(|| binaries_directory.clone());
        let cloud_binaries_directory = config
            .cloud_binaries_directory
            .map(|dir| with_trailing_separator(&dir, '/'))
            .unwrap_or_else(|| unix_binaries_directory.clone());

        let expression_files_directory = config
            .expression_files_directory
            .unwrap_or_else(|| config.final_results_directory.join("expression"));
        let expression_distribution_directory = config
            .expression_distribution_directory
            .unwrap_or_else(|| {
                config
                    .final_results_directory
                    .join("expression_distribution_by_chromosome")
            });

        Ok(ResolvedConfig {
            schema_version,
            binaries_directory,
            unix_binaries_directory,
            cluster_binaries_directory,
            cloud_binaries_directory,
            cluster_scheduler: config
                .cluster_scheduler
                .unwrap_or_else(|| "localhost".to_string()),
            script_output_directory: config.script_output_directory,
            cluster_script_filename: config.cluster_script_filename.filter(|s| !s.is_empty()),
            cloud_script_filename: config.cloud_script_filename.filter(|s| !s.is_empty()),
            data_directories: config.data_directories,
            downloaded_files_directory: config
                .downloaded_files_directory
                .unwrap_or_else(|| "downloaded_files".to_string()),
            derived_files_directory: config
                .derived_files_directory
                .unwrap_or_else(|| "derived_files".to_string()),
            cases_file: config.cases_file,
            final_results_directory: config.final_results_directory,
            expression_files_directory,
            expression_distribution_directory,
            access_token_path: config
                .access_token_path
                .unwrap_or_else(|| Utf8PathBuf::from("access_token.txt")),
            n_worker_machines,
            max_chars_per_line,
            downloaded_files_have_md5_sums: config.downloaded_files_have_md5_sums.unwrap_or(true),
            common_data_files: config.common_data_files,
            configuration_argument: String::new(),
            config_path: None,
        })
    }
}

fn with_trailing_separator(dir: &str, separator: char) -> String {
    if dir.is_empty() || dir.ends_with('/') || dir.ends_with('\\') {
        dir.to_string()
    } else {
        format!("{dir}{separator}")
    }
}
