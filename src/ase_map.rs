//! Per-megabase allele-specific expression map over all cases.
//!
//! Cases are read by a fixed pool of workers. Each worker pops case files off
//! a shared queue, accumulates into its own [`AseAccumulator`] and merges it
//! into the shared one once the queue is empty.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::fs;
use std::sync::{Mutex, PoisonError};
use std::thread;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ResolvedConfig;
use crate::domain::{CaseId, Chromosome, DerivedKind};
use crate::error::PipelineError;
use crate::fs_util::write_atomic;
use crate::tsv::{self, DONE_MARKER};
use crate::world::WorldSnapshot;

pub const ASE_MAP_FILE: &str = "ASEMap.txt";
pub const ASE_DIFFERENCE_MAP_FILE: &str = "ASEDifferenceMap.txt";
pub const REGION_SIZE: u64 = 1_000_000;
pub const DEFAULT_MIN_CASES: usize = 100;
/// Spacing between chromosomes in the genome-wide region index.
const CHROMOSOME_STRIDE: u64 = 300_000_000;

const MEASUREMENTS_HEADER: &str = "Chromosome\tLocus\tSomatic\tTumor ASE\tNormal ASE";
const MAP_HEADER: &str = "Chromosome\tlocus\ttumor\tn cases\tindex\tmean\tstandard deviation";
const DIFFERENCE_HEADER: &str = "Chromosome\tlocus\tnormal ASE\ttumor ASE\tdifference";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AseMeasurement {
    pub chromosome: Chromosome,
    pub locus: u64,
    pub somatic: bool,
    pub tumor_ase: Option<f64>,
    pub normal_ase: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct MeasurementRow {
    #[serde(rename = "Chromosome")]
    chromosome: String,
    #[serde(rename = "Locus")]
    locus: u64,
    #[serde(rename = "Somatic")]
    somatic: String,
    #[serde(rename = "Tumor ASE")]
    tumor_ase: String,
    #[serde(rename = "Normal ASE")]
    normal_ase: String,
}

/// Reads an ASE measurements file up to its `**done**` trailer. `*` marks a
/// value that could not be measured.
pub fn parse_measurements(path: &Utf8Path, content: &str) -> Result<Vec<AseMeasurement>, PipelineError> {
    let error = |line: usize, message: String| PipelineError::AseInput {
        path: Utf8PathBuf::from(path),
        line,
        message,
    };

    let mut reader = tsv::reader(content);
    let headers = reader
        .headers()
        .map_err(|err| error(tsv::error_line(&err), err.to_string()))?
        .clone();
    if !headers.iter().eq(MEASUREMENTS_HEADER.split('\t')) {
        return Err(error(1, "unexpected header".to_string()));
    }

    let mut measurements = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| error(tsv::error_line(&err), err.to_string()))?;
        let line_number = record.position().map_or(0, |pos| pos.line() as usize);
        let row: MeasurementRow = record
            .deserialize(Some(&headers))
            .map_err(|err| error(line_number, err.to_string()))?;
        let value = |field: &str| -> Result<Option<f64>, PipelineError> {
            match field {
                "*" => Ok(None),
                raw => raw
                    .parse::<f64>()
                    .map(Some)
                    .map_err(|_| error(line_number, format!("bad ASE value {raw}"))),
            }
        };
        measurements.push(AseMeasurement {
            chromosome: row
                .chromosome
                .parse()
                .map_err(|err: PipelineError| error(line_number, err.to_string()))?,
            locus: row.locus,
            somatic: match row.somatic.to_ascii_lowercase().as_str() {
                "true" => true,
                "false" => false,
                other => return Err(error(line_number, format!("bad somatic flag {other}"))),
            },
            tumor_ase: value(&row.tumor_ase)?,
            normal_ase: value(&row.normal_ase)?,
        });
    }
    Ok(measurements)
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RegionStats {
    pub n: usize,
    pub total: f64,
    pub total_squared: f64,
}

impl RegionStats {
    fn add(&mut self, value: f64) {
        self.n += 1;
        self.total += value;
        self.total_squared += value * value;
    }

    fn merge(&mut self, other: &RegionStats) {
        self.n += other.n;
        self.total += other.total;
        self.total_squared += other.total_squared;
    }

    pub fn mean(&self) -> f64 {
        self.total / self.n as f64
    }

    pub fn standard_deviation(&self) -> f64 {
        let n = self.n as f64;
        (n * self.total_squared - self.total * self.total).max(0.0).sqrt() / n
    }
}

pub type RegionKey = (Chromosome, u64);

/// Tumor and normal statistics keyed by (chromosome, region start).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AseAccumulator {
    pub tumor: BTreeMap<RegionKey, RegionStats>,
    pub normal: BTreeMap<RegionKey, RegionStats>,
    pub cases: usize,
}

impl AseAccumulator {
    /// Adds one case's germline measurements.
    pub fn add_case(&mut self, measurements: &[AseMeasurement]) {
        for measurement in measurements.iter().filter(|m| !m.somatic) {
            let key = (
                measurement.chromosome,
                measurement.locus - measurement.locus % REGION_SIZE,
            );
            if let Some(ase) = measurement.tumor_ase {
                self.tumor.entry(key).or_default().add(ase);
            }
            if let Some(ase) = measurement.normal_ase {
                self.normal.entry(key).or_default().add(ase);
            }
        }
        self.cases += 1;
    }

    pub fn merge(&mut self, other: AseAccumulator) {
        for (key, stats) in &other.tumor {
            self.tumor.entry(*key).or_default().merge(stats);
        }
        for (key, stats) in &other.normal {
            self.normal.entry(*key).or_default().merge(stats);
        }
        self.cases += other.cases;
    }

    pub fn render_map(&self, min_cases: usize) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{MAP_HEADER}");
        for (tumor, regions) in [(true, &self.tumor), (false, &self.normal)] {
            for ((chromosome, region), stats) in regions {
                if stats.n < min_cases {
                    continue;
                }
                let index = ((chromosome.index() - 1) * CHROMOSOME_STRIDE + region) / REGION_SIZE;
                let _ = writeln!(
                    out,
                    "{chromosome}\t{region}\t{tumor}\t{}\t{index}\t{}\t{}",
                    stats.n,
                    stats.mean(),
                    stats.standard_deviation()
                );
            }
        }
        let _ = writeln!(out, "{DONE_MARKER}");
        out
    }

    pub fn render_difference_map(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{DIFFERENCE_HEADER}");
        for ((chromosome, region), normal) in &self.normal {
            let Some(tumor) = self.tumor.get(&(*chromosome, *region)) else {
                continue;
            };
            let _ = writeln!(
                out,
                "{chromosome}\t{region}\t{}\t{}\t{}",
                normal.mean(),
                tumor.mean(),
                tumor.mean() - normal.mean()
            );
        }
        let _ = writeln!(out, "{DONE_MARKER}");
        out
    }
}

fn read_case(path: &Utf8Path) -> Result<Vec<AseMeasurement>, PipelineError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| PipelineError::Filesystem(format!("read {path}: {err}")))?;
    parse_measurements(path, &content)
}

/// Accumulates every case file with `threads` workers.
pub fn accumulate(cases: Vec<(CaseId, Utf8PathBuf)>, threads: usize) -> AseAccumulator {
    let queue = Mutex::new(VecDeque::from(cases));
    let merged = Mutex::new(AseAccumulator::default());

    thread::scope(|scope| {
        for _ in 0..threads.max(1) {
            scope.spawn(|| {
                let mut local = AseAccumulator::default();
                loop {
                    let next = queue
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .pop_front();
                    let Some((case_id, path)) = next else {
                        break;
                    };
                    match read_case(&path) {
                        Ok(measurements) => local.add_case(&measurements),
                        Err(err) => warn!("skipping case {case_id}: {err}"),
                    }
                }
                merged
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .merge(local);
            });
        }
    });

    merged.into_inner().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy)]
pub struct AseMapOptions {
    pub threads: usize,
    pub min_cases: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AseMapSummary {
    pub cases_queued: usize,
    pub cases_read: usize,
    pub tumor_regions: usize,
    pub normal_regions: usize,
    pub map_path: Utf8PathBuf,
    pub difference_map_path: Utf8PathBuf,
}

pub fn run(
    world: &WorldSnapshot,
    config: &ResolvedConfig,
    options: AseMapOptions,
) -> Result<AseMapSummary, PipelineError> {
    let cases: Vec<(CaseId, Utf8PathBuf)> = world
        .cases()
        .filter_map(|case| {
            let artifact = world.derived(&case.case_id, DerivedKind::AseMeasurements);
            artifact
                .stamp()
                .map(|stamp| (case.case_id.clone(), stamp.path.clone()))
        })
        .collect();
    let cases_queued = cases.len();
    info!(
        "processing {cases_queued} case(s) with {} thread(s)",
        options.threads
    );

    let accumulator = accumulate(cases, options.threads);

    let map_path = config.final_results_directory.join(ASE_MAP_FILE);
    let difference_map_path = config.final_results_directory.join(ASE_DIFFERENCE_MAP_FILE);
    write_atomic(&map_path, &accumulator.render_map(options.min_cases))?;
    write_atomic(&difference_map_path, &accumulator.render_difference_map())?;

    Ok(AseMapSummary {
        cases_queued,
        cases_read: accumulator.cases,
        tumor_regions: accumulator.tumor.len(),
        normal_regions: accumulator.normal.len(),
        map_path,
        difference_map_path,
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn measurement(locus: u64, somatic: bool, tumor: Option<f64>, normal: Option<f64>) -> AseMeasurement {
        AseMeasurement {
            chromosome: Chromosome::Autosome(2),
            locus,
            somatic,
            tumor_ase: tumor,
            normal_ase: normal,
        }
    }

    #[test]
    fn parses_measurements() {
        let content = format!(
            "{MEASUREMENTS_HEADER}\nchr2\t1500000\tfalse\t0.25\t*\nchrX\t10\tTrue\t0.5\t0.1\n{DONE_MARKER}\nignored\n"
        );
        let parsed = parse_measurements(Utf8Path::new("m.txt"), &content).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], measurement(1_500_000, false, Some(0.25), None));
        assert_eq!(parsed[1].chromosome, Chromosome::X);
        assert!(parsed[1].somatic);
    }

    #[test]
    fn bad_rows_are_errors() {
        let content = format!("{MEASUREMENTS_HEADER}\nchr2\tabc\tfalse\t0.1\t0.1\n");
        assert_matches!(
            parse_measurements(Utf8Path::new("m.txt"), &content),
            Err(PipelineError::AseInput { line: 2, .. })
        );
        assert_matches!(
            parse_measurements(Utf8Path::new("m.txt"), "wrong header\n"),
            Err(PipelineError::AseInput { line: 1, .. })
        );
    }

    #[test]
    fn somatic_variants_are_ignored_and_regions_bucket_by_megabase() {
        let mut accumulator = AseAccumulator::default();
        accumulator.add_case(&[
            measurement(1_000_001, false, Some(0.2), Some(0.1)),
            measurement(1_999_999, false, Some(0.4), None),
            measurement(1_500_000, true, Some(0.9), Some(0.9)),
        ]);
        let tumor = accumulator.tumor[&(Chromosome::Autosome(2), 1_000_000)];
        assert_eq!(tumor.n, 2);
        assert!((tumor.mean() - 0.3).abs() < 1e-12);
        assert!((tumor.standard_deviation() - 0.1).abs() < 1e-9);
        assert_eq!(accumulator.normal[&(Chromosome::Autosome(2), 1_000_000)].n, 1);
        assert_eq!(accumulator.cases, 1);
    }

    #[test]
    fn map_skips_sparse_regions_and_reports_the_index() {
        let mut accumulator = AseAccumulator::default();
        for _ in 0..3 {
            accumulator.add_case(&[measurement(5_000_000, false, Some(0.5), Some(0.25))]);
        }
        accumulator.add_case(&[measurement(9_000_000, false, Some(0.5), None)]);

        let map = accumulator.render_map(2);
        let lines: Vec<&str> = map.lines().collect();
        assert_eq!(lines[0], MAP_HEADER);
        assert_eq!(lines[1], "chr2\t5000000\ttrue\t3\t305\t0.5\t0");
        assert_eq!(lines[2], "chr2\t5000000\tfalse\t3\t305\t0.25\t0");
        assert_eq!(lines[3], DONE_MARKER);
        assert_eq!(lines.len(), 4);

        let difference = accumulator.render_difference_map();
        assert!(difference.contains("chr2\t5000000\t0.25\t0.5\t0.25\n"));
    }

    #[test]
    fn pool_matches_serial_accumulation() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let mut cases = Vec::new();
        let mut serial = AseAccumulator::default();
        for n in 0..12u64 {
            let path = root.join(format!("case{n}.txt"));
            let rows = vec![
                measurement(n * 700_000, false, Some(n as f64 / 16.0), Some(0.125)),
                measurement(3_000_000, false, Some(0.5), None),
            ];
            let mut content = format!("{MEASUREMENTS_HEADER}\n");
            for row in &rows {
                let tumor = row.tumor_ase.map_or("*".to_string(), |v| v.to_string());
                let normal = row.normal_ase.map_or("*".to_string(), |v| v.to_string());
                content.push_str(&format!("chr2\t{}\tfalse\t{tumor}\t{normal}\n", row.locus));
            }
            fs::write(&path, content).unwrap();
            serial.add_case(&rows);
            let case_id: CaseId = format!("00000000-0000-4000-8000-{n:012}").parse().unwrap();
            cases.push((case_id, path));
        }
        cases.push((
            "00000000-0000-4000-8000-999999999999".parse().unwrap(),
            root.join("missing.txt"),
        ));

        let pooled = accumulate(cases, 4);
        assert_eq!(pooled.cases, 12);
        assert_eq!(pooled.tumor.keys().collect::<Vec<_>>(), serial.tumor.keys().collect::<Vec<_>>());
        for (key, stats) in &serial.tumor {
            let other = pooled.tumor[key];
            assert_eq!(other.n, stats.n);
            assert!((other.total - stats.total).abs() < 1e-9);
        }
    }
}
