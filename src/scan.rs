use std::collections::BTreeMap;
use std::fs;
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::{CaseId, DerivedKind, FileId};

const PARTIAL_SUFFIX: &str = ".partial";
const MD5_SUFFIX: &str = ".md5";
const INDEX_SUFFIX: &str = ".bai";

/// Path, modification time and size of a file observed during the scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStamp {
    pub path: Utf8PathBuf,
    #[serde(skip)]
    pub modified: SystemTime,
    pub size: u64,
}

impl FileStamp {
    pub fn new(path: impl Into<Utf8PathBuf>, modified: SystemTime, size: u64) -> Self {
        Self {
            path: path.into(),
            modified,
            size,
        }
    }

    /// Stats `path`; `None` when it does not exist or cannot be read.
    pub fn stat(path: &Utf8Path) -> Option<Self> {
        let metadata = fs::metadata(path.as_std_path()).ok()?;
        if !metadata.is_file() {
            return None;
        }
        let modified = metadata.modified().ok()?;
        Some(Self::new(path, modified, metadata.len()))
    }
}

#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub file_id: FileId,
    pub stamp: FileStamp,
    /// The transfer has not finished; the data file still carries `.partial`.
    pub partial: bool,
    pub stored_md5: Option<String>,
    pub md5_stamp: Option<FileStamp>,
    /// The data directory the file was found under.
    pub data_directory: Utf8PathBuf,
}

#[derive(Debug, Clone)]
pub struct DerivedFile {
    pub case_id: CaseId,
    pub derived_from: FileId,
    pub kind: DerivedKind,
    pub stamp: FileStamp,
}

/// Raw inventory of downloaded and derived files across all data directories.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub downloaded: BTreeMap<FileId, DownloadedFile>,
    pub derived: BTreeMap<CaseId, Vec<DerivedFile>>,
}

impl Inventory {
    pub fn scan(
        data_directories: &[Utf8PathBuf],
        downloaded_subdirectory: &str,
        derived_subdirectory: &str,
    ) -> Self {
        let mut inventory = Inventory::default();
        for data_directory in data_directories {
            if !data_directory.as_std_path().is_dir() {
                debug!("data directory {data_directory} does not exist, skipping");
                continue;
            }
            inventory.scan_downloaded(data_directory, &data_directory.join(downloaded_subdirectory));
            inventory.scan_derived(&data_directory.join(derived_subdirectory));
        }
        inventory
    }

    fn scan_downloaded(&mut self, data_directory: &Utf8Path, root: &Utf8Path) {
        for file_dir in list_dir(root) {
            if !file_dir.as_std_path().is_dir() {
                continue;
            }
            let Some(name) = file_dir.file_name() else {
                continue;
            };
            let Ok(file_id) = name.parse::<FileId>() else {
                warn!("downloaded files directory {file_dir} is not named for a file id, ignoring");
                continue;
            };

            let mut candidates: Vec<Utf8PathBuf> = list_dir(&file_dir)
                .into_iter()
                .filter(|path| {
                    let name = path.file_name().unwrap_or_default();
                    path.as_std_path().is_file()
                        && !name.ends_with(MD5_SUFFIX)
                        && !name.ends_with(INDEX_SUFFIX)
                })
                .collect();
            candidates.sort();
            let Some(data_file) = candidates.first() else {
                debug!("downloaded files directory {file_dir} is empty");
                continue;
            };
            if candidates.len() > 1 {
                warn!(
                    "downloaded files directory {file_dir} holds {} data files, using {data_file}",
                    candidates.len()
                );
            }
            let Some(stamp) = FileStamp::stat(data_file) else {
                continue;
            };

            let partial = data_file.as_str().ends_with(PARTIAL_SUFFIX);
            let md5_path = Utf8PathBuf::from(format!("{data_file}{MD5_SUFFIX}"));
            let md5_stamp = FileStamp::stat(&md5_path);
            let stored_md5 = md5_stamp.as_ref().and_then(|_| read_md5(&md5_path));

            if let Some(previous) = self.downloaded.get(&file_id) {
                warn!(
                    "file {file_id} is downloaded twice: {} and {}; keeping the first",
                    previous.stamp.path, stamp.path
                );
                continue;
            }

            self.downloaded.insert(
                file_id.clone(),
                DownloadedFile {
                    file_id,
                    stamp,
                    partial,
                    stored_md5,
                    md5_stamp,
                    data_directory: Utf8PathBuf::from(data_directory),
                },
            );
        }
    }

    fn scan_derived(&mut self, root: &Utf8Path) {
        for case_dir in list_dir(root) {
            if !case_dir.as_std_path().is_dir() {
                continue;
            }
            let Some(name) = case_dir.file_name() else {
                continue;
            };
            let Ok(case_id) = name.parse::<CaseId>() else {
                warn!("derived files directory {case_dir} is not named for a case id, ignoring");
                continue;
            };

            for path in list_dir(&case_dir) {
                let Some(file_name) = path.file_name() else {
                    continue;
                };
                let Some((derived_from, kind)) = DerivedKind::parse_file_name(file_name) else {
                    debug!("unrecognized derived file {path}");
                    continue;
                };
                let Some(stamp) = FileStamp::stat(&path) else {
                    continue;
                };
                self.derived
                    .entry(case_id.clone())
                    .or_default()
                    .push(DerivedFile {
                        case_id: case_id.clone(),
                        derived_from,
                        kind,
                        stamp,
                    });
            }
        }
    }
}

fn read_md5(path: &Utf8Path) -> Option<String> {
    let content = fs::read_to_string(path.as_std_path()).ok()?;
    let digest = content.split_whitespace().next()?.to_ascii_lowercase();
    (!digest.is_empty()).then_some(digest)
}

/// Immediate children of `dir`, sorted. A missing or unreadable directory is
/// treated as empty.
pub fn list_dir(dir: &Utf8Path) -> Vec<Utf8PathBuf> {
    let Ok(entries) = fs::read_dir(dir.as_std_path()) else {
        return Vec::new();
    };
    let mut items: Vec<Utf8PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| Utf8PathBuf::from_path_buf(entry.path()).ok())
        .collect();
    items.sort();
    items
}
