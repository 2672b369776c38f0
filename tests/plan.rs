mod common;

use assert_matches::assert_matches;

use kira_pipeline::app::{DOWNLOAD_SCRIPT, PlanResult, StageRow};
use kira_pipeline::batch::{LOCAL_SCRIPT, UNIX_SCRIPT};
use kira_pipeline::domain::{DerivedKind, Sample};
use kira_pipeline::error::PipelineError;

use common::{Dataset, at, case_id, sample_file, touch};

fn row<'a>(result: &'a PlanResult, name: &str) -> &'a StageRow {
    result
        .stages
        .iter()
        .find(|row| row.name == name)
        .unwrap_or_else(|| panic!("no stage named {name}"))
}

fn counts(result: &PlanResult) -> Vec<(String, usize, usize, usize)> {
    result
        .stages
        .iter()
        .map(|row| (row.name.clone(), row.done, row.added, row.waiting))
        .collect()
}

#[test]
fn fresh_dataset_requests_every_file_once() {
    let dataset = Dataset::new();
    dataset.write_cases(&[1, 2], &[2]);

    let result = dataset.plan(false).unwrap();
    assert_eq!(result.failed_stages, 0);
    assert_eq!(row(&result, "Generate Cases").done, 1);

    let download = row(&result, "Download");
    assert_eq!((download.done, download.downloads), (0, 7));

    let tumor_dna = row(&result, "Allcount tumor DNA");
    assert_eq!((tumor_dna.added, tumor_dna.waiting, tumor_dna.downloads), (0, 2, 0));
    // The tumor-only case has nothing to count for normal RNA.
    assert_eq!(row(&result, "Allcount normal RNA").waiting, 1);

    assert_eq!(result.downloads.len(), 7);
    assert_eq!(result.totals.downloads, 7);

    let script = dataset.script(DOWNLOAD_SCRIPT).unwrap();
    assert_eq!(script.lines().count(), 7);
    for case in [1, 2] {
        for sample in Sample::ALL {
            if case == 2 && sample == Sample::NormalRna {
                continue;
            }
            let file_id = sample_file(case, sample).to_string();
            assert_eq!(
                script.matches(file_id.as_str()).count(),
                1,
                "{file_id} requested once"
            );
        }
    }
    assert!(script.starts_with(
        "/bin/gdc-client download --no-file-md5sum --token-file access_token.txt "
    ));
    assert!(script.ends_with("\r\n"));
}

#[test]
fn download_script_is_removed_when_nothing_is_missing() {
    let dataset = Dataset::new();
    dataset.write_cases(&[1], &[]);
    dataset.plan(false).unwrap();
    assert!(dataset.script(DOWNLOAD_SCRIPT).is_some());

    for sample in Sample::ALL {
        dataset.download(&sample_file(1, sample), at(1000));
    }
    let result = dataset.plan(false).unwrap();
    assert!(result.downloads.is_empty());
    assert!(result.download_script.is_none());
    assert!(dataset.script(DOWNLOAD_SCRIPT).is_none());
}

#[test]
fn second_run_adds_nothing_once_outputs_exist() {
    let dataset = Dataset::new();
    dataset.write_cases(&[1], &[]);
    for sample in Sample::ALL {
        dataset.download(&sample_file(1, sample), at(1000));
    }

    let first = dataset.plan(false).unwrap();
    for sample in Sample::ALL {
        assert_eq!(row(&first, &format!("Allcount {}", sample.label())).added, 1);
    }
    let local = dataset.script(LOCAL_SCRIPT).unwrap();
    assert!(local.contains(&format!("/bin/GenerateAllcount -d -t {}\r\n", case_id(1))));

    for sample in Sample::ALL {
        dataset.derive(
            1,
            &sample_file(1, sample),
            DerivedKind::Allcount(sample),
            "",
            at(2000),
        );
    }

    let second = dataset.plan(false).unwrap();
    for sample in Sample::ALL {
        let allcount = row(&second, &format!("Allcount {}", sample.label()));
        assert_eq!((allcount.done, allcount.added, allcount.waiting), (1, 0, 0));
    }
    assert!(!dataset.script(LOCAL_SCRIPT).unwrap().contains("GenerateAllcount"));

    let third = dataset.plan(false).unwrap();
    assert_eq!(counts(&second), counts(&third));
}

#[test]
fn stale_output_fails_the_freshness_gate() {
    let dataset = Dataset::new();
    dataset.write_cases(&[1], &[]);
    let source = sample_file(1, Sample::TumorDna);
    dataset.derive(1, &source, DerivedKind::Vcf, "", at(3000));
    dataset.derive(1, &source, DerivedKind::SelectedVariants, "", at(2000));
    touch(
        &dataset.config.script_output_directory.join(LOCAL_SCRIPT),
        "stale\r\n",
        at(10),
    );

    assert_matches!(
        dataset.plan(true),
        Err(PipelineError::FreshnessViolations { count: 1 })
    );
    assert!(dataset.script(LOCAL_SCRIPT).is_none(), "stale scripts are removed");
    assert!(dataset.script(UNIX_SCRIPT).is_none());

    let result = dataset.plan(false).unwrap();
    assert_eq!(row(&result, "Select Variants").done, 1);
}

#[test]
fn fresh_outputs_pass_the_freshness_gate() {
    let dataset = Dataset::new();
    dataset.write_cases(&[1], &[]);
    let source = sample_file(1, Sample::TumorDna);
    dataset.derive(1, &source, DerivedKind::Vcf, "", at(2000));
    dataset.derive(1, &source, DerivedKind::SelectedVariants, "", at(3000));

    let result = dataset.plan(true).unwrap();
    assert_eq!(row(&result, "Select Variants").done, 1);
    assert!(dataset.script(LOCAL_SCRIPT).is_some());
}

#[test]
fn lines_are_spread_across_worker_machines() {
    let dataset = Dataset::with_parallelism(3);
    let cases = [1, 2, 3, 4];
    dataset.write_cases(&cases, &[]);
    for case in cases {
        dataset.download(&sample_file(case, Sample::TumorDna), at(1000));
    }

    let result = dataset.plan(false).unwrap();
    assert_eq!(row(&result, "Allcount tumor DNA").added, 4);

    let mut expected: Vec<String> = cases.iter().map(|case| case_id(*case).to_string()).collect();
    expected.sort();
    for script in [LOCAL_SCRIPT, UNIX_SCRIPT] {
        let content = dataset.script(script).unwrap();
        let lines: Vec<Vec<&str>> = content
            .lines()
            .filter_map(|line| line.strip_prefix("/bin/GenerateAllcount -d -t "))
            .map(|items| items.split_whitespace().collect())
            .collect();
        let sizes: Vec<usize> = lines.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 1, 1], "{script}");

        let mut emitted: Vec<String> = lines.concat().into_iter().map(str::to_string).collect();
        emitted.sort();
        assert_eq!(emitted, expected, "every ready case on exactly one line");
    }
    assert!(!dataset.script(UNIX_SCRIPT).unwrap().contains('\r'));
}

#[test]
fn empty_manifest_skips_case_stages() {
    let dataset = Dataset::new();

    let result = dataset.plan(false).unwrap();
    let generate = row(&result, "Generate Cases");
    assert_eq!((generate.skipped, generate.added), (false, 1));

    let allcount = row(&result, "Allcount tumor DNA");
    assert!(allcount.skipped);
    assert_eq!(allcount.waiting, 1);
    assert!(result.downloads.is_empty());
    assert!(
        dataset
            .script(LOCAL_SCRIPT)
            .unwrap()
            .starts_with("/bin/GenerateCases")
    );
}

#[test]
fn failing_stage_does_not_stop_the_run() {
    let mut dataset = Dataset::new();
    dataset.write_cases(&[1], &[]);
    for sample in Sample::ALL {
        dataset.download(&sample_file(1, sample), at(1000));
    }
    dataset.derive(1, &sample_file(1, Sample::NormalDna), DerivedKind::Vcf, "", at(2000));
    // Case ids fit; a case id followed by an output path does not.
    dataset.config.max_chars_per_line = 100;

    let result = dataset.plan(false).unwrap();
    assert_eq!(result.failed_stages, 1);
    let failed = row(&result, "Count Mapped Bases");
    assert!(failed.error.as_deref().is_some_and(|err| err.contains("Count Mapped Bases")));
    assert_eq!((failed.done, failed.added, failed.waiting), (0, 0, 0));

    let names: Vec<&str> = result.stages.iter().map(|row| row.name.as_str()).collect();
    let failed_at = names.iter().position(|name| *name == "Count Mapped Bases").unwrap();
    assert!(failed_at < names.len() - 1);
    for later in &result.stages[failed_at + 1..] {
        assert!(later.error.is_none(), "{} evaluated after the failure", later.name);
    }
    assert_eq!(row(&result, "Compress VCF").added, 1);
    assert_eq!(row(&result, "Extract VCF Statistics").added, 1);

    for script in [LOCAL_SCRIPT, UNIX_SCRIPT] {
        let content = dataset.script(script).unwrap();
        assert!(content.contains("/bin/GenerateAllcount -d -t "), "{script}");
        assert!(content.contains("/bin/CompressVCF "), "{script}");
        assert!(content.contains("/bin/ExtractVCFStatistics "), "{script}");
        assert!(!content.contains("CountMappedBases"), "{script}");
    }
}
