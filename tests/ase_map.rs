mod common;

use std::fs;

use kira_pipeline::ase_map::{ASE_DIFFERENCE_MAP_FILE, ASE_MAP_FILE, AseMapOptions};
use kira_pipeline::domain::{DerivedKind, Sample};
use kira_pipeline::output::JsonOutput;

use common::{Dataset, at, sample_file};

const HEADER: &str = "Chromosome\tLocus\tSomatic\tTumor ASE\tNormal ASE";

fn measurements(dataset: &Dataset, case: u32, rows: &[&str]) {
    let mut content = format!("{HEADER}\n");
    for row in rows {
        content.push_str(row);
        content.push('\n');
    }
    content.push_str("**done**\n");
    dataset.derive(
        case,
        &sample_file(case, Sample::TumorRna),
        DerivedKind::AseMeasurements,
        &content,
        at(1000),
    );
}

#[test]
fn maps_germline_measurements_by_region() {
    let dataset = Dataset::new();
    dataset.write_cases(&[1, 2, 3, 4], &[]);
    measurements(
        &dataset,
        1,
        &["chr1\t1500000\tfalse\t0.25\t0.5", "chr1\t100\ttrue\t0.9\t0.9"],
    );
    measurements(&dataset, 2, &["chr1\t1200000\tfalse\t0.75\t*"]);
    measurements(&dataset, 3, &["chr1\tnot-a-locus\tfalse\t0.1\t0.1"]);

    let summary = dataset
        .app()
        .ase_map(
            &dataset.world(),
            AseMapOptions {
                threads: 2,
                min_cases: 1,
            },
            &JsonOutput,
        )
        .unwrap();

    assert_eq!(summary.cases_queued, 3, "case 4 has no measurements yet");
    assert_eq!(summary.cases_read, 2, "the malformed case is skipped");
    assert_eq!((summary.tumor_regions, summary.normal_regions), (1, 1));

    let results = &dataset.config.final_results_directory;
    assert_eq!(summary.map_path, results.join(ASE_MAP_FILE));
    let map = fs::read_to_string(&summary.map_path).unwrap();
    let lines: Vec<&str> = map.lines().collect();
    assert_eq!(
        lines,
        vec![
            "Chromosome\tlocus\ttumor\tn cases\tindex\tmean\tstandard deviation",
            "chr1\t1000000\ttrue\t2\t1\t0.5\t0.25",
            "chr1\t1000000\tfalse\t1\t1\t0.5\t0",
            "**done**",
        ]
    );

    let difference = fs::read_to_string(results.join(ASE_DIFFERENCE_MAP_FILE)).unwrap();
    assert_eq!(
        difference.lines().collect::<Vec<_>>(),
        vec![
            "Chromosome\tlocus\tnormal ASE\ttumor ASE\tdifference",
            "chr1\t1000000\t0.5\t0.5\t0",
            "**done**",
        ]
    );
}

#[test]
fn sparse_regions_are_left_out() {
    let dataset = Dataset::new();
    dataset.write_cases(&[1], &[]);
    measurements(&dataset, 1, &["chrX\t5\tfalse\t0.5\t*"]);

    let summary = dataset
        .app()
        .ase_map(
            &dataset.world(),
            AseMapOptions {
                threads: 1,
                min_cases: 2,
            },
            &JsonOutput,
        )
        .unwrap();
    assert_eq!(summary.tumor_regions, 1);

    let map = fs::read_to_string(&summary.map_path).unwrap();
    assert_eq!(map.lines().count(), 2, "header and trailer only");
}
