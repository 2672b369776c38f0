//! The hand-ordered list of pipeline stages.
//!
//! Order matters only for how quickly a fresh dataset converges: a stage that
//! runs before its producer simply reports everything waiting until the next
//! invocation.

use camino::Utf8PathBuf;

use crate::ase_map::{ASE_DIFFERENCE_MAP_FILE, ASE_MAP_FILE};
use crate::batch::CommandTemplate;
use crate::config::ResolvedConfig;
use crate::domain::{DerivedKind, Sample};
use crate::manifest::Case;
use crate::stage::{
    ChecksumStage, DownloadStage, PerCaseStage, PerChromosomeDiseaseStage, PerDiseaseStage,
    SingleOutputStage, Stage,
};
use crate::world::{Artifact, DownloadableArtifact, WorldSnapshot};

pub const MANN_WHITNEY_FILE: &str = "MannWhitney.txt";
pub const CONSOLIDATED_CASE_METADATA_FILE: &str = "ConsolidatedCaseMetadata.txt";
pub const OVERALL_VCF_STATISTICS_FILE: &str = "OverallVCFStatistics.txt";

fn derived(kind: DerivedKind) -> impl Fn(&WorldSnapshot, &Case) -> Artifact + 'static {
    move |world, case| world.derived(&case.case_id, kind)
}

/// `kind` for cases that have the sample, not applicable otherwise.
fn derived_for_sample(
    sample: Sample,
    kind: DerivedKind,
) -> impl Fn(&WorldSnapshot, &Case) -> Artifact + 'static {
    move |world, case| match case.sample(sample) {
        Some(_) => world.derived(&case.case_id, kind),
        None => Artifact::NotApplicable,
    }
}

fn global(path: Utf8PathBuf) -> impl Fn(&WorldSnapshot) -> Artifact + 'static {
    move |world| world.global(&path)
}

fn sample_download(
    sample: Sample,
    verify: bool,
) -> impl Fn(&WorldSnapshot, &Case) -> Option<DownloadableArtifact> + 'static {
    move |_, case| {
        case.sample(sample).map(|remote| DownloadableArtifact {
            file_id: remote.file_id.clone(),
            expected_md5: remote.md5.clone().filter(|_| verify),
        })
    }
}

fn maf_download(verify: bool) -> impl Fn(&WorldSnapshot, &Case) -> Option<DownloadableArtifact> + 'static {
    move |_, case| {
        case.maf.as_ref().map(|remote| DownloadableArtifact {
            file_id: remote.file_id.clone(),
            expected_md5: remote.md5.clone().filter(|_| verify),
        })
    }
}

/// `<case id> <output path>`: the output goes next to the sample it is
/// computed from.
fn case_and_output_token(
    sample: Sample,
    kind: DerivedKind,
) -> impl Fn(&WorldSnapshot, &Case) -> Option<String> + 'static {
    move |world, case| {
        let source = &case.sample(sample)?.file_id;
        let path = world.expected_derived_path(&case.case_id, source, kind)?;
        Some(format!("{} {path}", case.case_id))
    }
}

pub fn pipeline_stages(config: &ResolvedConfig) -> Vec<Stage> {
    let verify = config.downloaded_files_have_md5_sums;
    let results = &config.final_results_directory;
    let mut stages: Vec<Stage> = Vec::new();

    stages.push(
        SingleOutputStage::new("Generate Cases", CommandTemplate::new("GenerateCases"))
            .without_cases()
            .output(global(config.cases_file.clone()))
            .into(),
    );
    stages.push(DownloadStage::new("Download").into());
    stages.push(
        ChecksumStage::new("MD5 Computation", "ComputeMD5", "ComputeMD5IntoFile.cmd", verify).into(),
    );

    for sample in Sample::ALL {
        stages.push(
            PerCaseStage::new(
                format!("Allcount {}", sample.label()),
                CommandTemplate::new("GenerateAllcount").params(sample.flags()),
            )
            .download(sample_download(sample, verify))
            .output(derived_for_sample(sample, DerivedKind::Allcount(sample)))
            .into(),
        );
    }

    stages.push(
        PerCaseStage::new("Germline Variant Calling", CommandTemplate::new("GermlineVariantCalling"))
            .max_items_per_line(1)
            .download(sample_download(Sample::NormalDna, verify))
            .output(derived(DerivedKind::Vcf))
            .into(),
    );
    stages.push(
        PerCaseStage::new("Select Variants", CommandTemplate::new("SelectGermlineVariants"))
            .input(derived(DerivedKind::Vcf))
            .output(derived(DerivedKind::SelectedVariants))
            .into(),
    );
    stages.push({
        let mut stage =
            PerCaseStage::new("Annotate Variants", CommandTemplate::new("AnnotateVariants"))
                .input(derived(DerivedKind::SelectedVariants));
        for sample in Sample::ALL {
            stage = stage.input(derived_for_sample(sample, DerivedKind::Allcount(sample)));
        }
        stage
            .output(derived(DerivedKind::AnnotatedSelectedVariants))
            .into()
    });

    stages.push(
        PerDiseaseStage::new("Expression Distribution", CommandTemplate::new("ExpressionDistribution"))
            .case_input(derived(DerivedKind::Allcount(Sample::TumorRna)))
            .output(|world, disease| world.expression_file(disease))
            .into(),
    );

    stages.push(
        PerCaseStage::new("Extract MAF Lines", CommandTemplate::new("ExtractMAFLines"))
            .download(maf_download(verify))
            .output(derived(DerivedKind::ExtractedMafLines))
            .into(),
    );
    stages.push(
        PerCaseStage::new("Regional Expression", CommandTemplate::new("RegionalExpression"))
            .input(derived(DerivedKind::ExtractedMafLines))
            .input(derived(DerivedKind::Allcount(Sample::TumorRna)))
            .input(|world, case| world.expression_file(&case.disease))
            .output(derived(DerivedKind::RegionalExpression))
            .into(),
    );
    stages.push(
        PerCaseStage::new("Expression Near Mutations", CommandTemplate::new("ExpressionNearMutations"))
            .input(derived(DerivedKind::RegionalExpression))
            .output(derived(DerivedKind::GeneExpression))
            .into(),
    );
    stages.push(
        PerCaseStage::new(
            "Allele Specific Expression Near Mutations",
            CommandTemplate::new("ExpressionNearMutations").params("-a"),
        )
        .input(derived(DerivedKind::AnnotatedSelectedVariants))
        .output(derived(DerivedKind::TumorAlleleSpecificExpression))
        .output(derived_for_sample(
            Sample::NormalRna,
            DerivedKind::NormalAlleleSpecificExpression,
        ))
        .into(),
    );

    for sample in Sample::ALL {
        let kind = DerivedKind::ReadsAtSelectedVariants(sample);
        stages.push(
            PerCaseStage::new(
                format!("Extract {} Reads", sample.label()),
                CommandTemplate::new("GenerateReadsAtSelectedVariants").params(sample.flags()),
            )
            .max_items_per_line(20)
            .download(sample_download(sample, verify))
            .input(derived(DerivedKind::AnnotatedSelectedVariants))
            .output(derived_for_sample(sample, kind))
            .token(case_and_output_token(sample, kind))
            .into(),
        );
    }

    stages.push(
        PerCaseStage::new("Count Mapped Bases", CommandTemplate::new("CountMappedBases"))
            .download(sample_download(Sample::TumorRna, verify))
            .output(derived(DerivedKind::TumorRnaMappedBaseCount))
            .token(case_and_output_token(
                Sample::TumorRna,
                DerivedKind::TumorRnaMappedBaseCount,
            ))
            .into(),
    );
    stages.push(
        PerCaseStage::new("Extract ASE Measurements", CommandTemplate::new("ExtractASEMeasurements"))
            .input(derived(DerivedKind::AnnotatedSelectedVariants))
            .input(derived(DerivedKind::ReadsAtSelectedVariants(Sample::TumorRna)))
            .input(derived_for_sample(
                Sample::NormalRna,
                DerivedKind::ReadsAtSelectedVariants(Sample::NormalRna),
            ))
            .output(derived(DerivedKind::AseMeasurements))
            .into(),
    );

    stages.push(
        PerChromosomeDiseaseStage::new(
            "Expression Deciles by Chromosome",
            CommandTemplate::new("ExpressionDecilesByChromosome"),
        )
        .disease_input(|world, disease| world.expression_file(disease))
        .case_input(derived(DerivedKind::Allcount(Sample::TumorRna)))
        .output(|world, chromosome, disease| world.expression_distribution(chromosome, disease))
        .into(),
    );

    let ase_map_arguments = match &config.config_path {
        Some(path) => format!("--config {path} ase-map"),
        None => "ase-map".to_string(),
    };
    stages.push(
        SingleOutputStage::new(
            "ASE Map",
            CommandTemplate::new("kira-pipeline").without_configuration(),
        )
        .arguments(ase_map_arguments)
        .case_input(derived(DerivedKind::AseMeasurements))
        .output(global(results.join(ASE_MAP_FILE)))
        .output(global(results.join(ASE_DIFFERENCE_MAP_FILE)))
        .into(),
    );
    stages.push(
        SingleOutputStage::new("Mann Whitney", CommandTemplate::new("MannWhitney"))
            .needs_common_data()
            .case_input(derived(DerivedKind::GeneExpression))
            .output(global(results.join(MANN_WHITNEY_FILE)))
            .into(),
    );

    stages.push(
        PerCaseStage::new("Case Metadata", CommandTemplate::new("GenerateCaseMetadata"))
            .input(derived(DerivedKind::ReadsAtSelectedVariants(Sample::TumorDna)))
            .input(derived(DerivedKind::ReadsAtSelectedVariants(Sample::TumorRna)))
            .output(derived(DerivedKind::CaseMetadata))
            .into(),
    );
    stages.push(
        SingleOutputStage::new(
            "Consolidated Case Metadata",
            CommandTemplate::new("ConsolidateCaseMetadata"),
        )
        .case_input(derived(DerivedKind::CaseMetadata))
        .output(global(results.join(CONSOLIDATED_CASE_METADATA_FILE)))
        .into(),
    );

    stages.push(
        PerCaseStage::new("Compress VCF", CommandTemplate::new("CompressVCF"))
            .input(derived(DerivedKind::Vcf))
            .output(derived(DerivedKind::CompressedVcf))
            .into(),
    );
    stages.push(
        PerCaseStage::new("Extract VCF Statistics", CommandTemplate::new("ExtractVCFStatistics"))
            .input(derived(DerivedKind::Vcf))
            .output(derived(DerivedKind::VcfStatistics))
            .into(),
    );
    stages.push(
        SingleOutputStage::new("Overall VCF Statistics", CommandTemplate::new("OverallVCFStatistics"))
            .case_input(derived(DerivedKind::VcfStatistics))
            .output(global(results.join(OVERALL_VCF_STATISTICS_FILE)))
            .into(),
    );

    stages
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::time::{Duration, SystemTime};

    use super::*;
    use crate::config::{Config, ConfigLoader};
    use crate::domain::{CaseId, Chromosome, Disease, FileId};
    use crate::manifest::RemoteFile;
    use crate::scan::{DerivedFile, DownloadedFile, FileStamp};
    use crate::world::{expression_distribution_file_name, expression_file_name};

    fn config() -> ResolvedConfig {
        ConfigLoader::resolve_config(Config {
            binaries_directory: "/bin/".to_string(),
            script_output_directory: Utf8PathBuf::from("/scripts"),
            cases_file: Utf8PathBuf::from("/data/cases.txt"),
            final_results_directory: Utf8PathBuf::from("/results"),
            ..Config::default()
        })
        .unwrap()
    }

    #[test]
    fn stage_names_are_unique_and_ordered() {
        let stages = pipeline_stages(&config());
        let names: Vec<&str> = stages.iter().map(Stage::name).collect();
        let unique: BTreeSet<&str> = names.iter().copied().collect();
        assert_eq!(unique.len(), names.len());
        assert_eq!(names[0], "Generate Cases");
        assert_eq!(names[1], "Download");
        assert!(
            names.iter().position(|n| *n == "Select Variants")
                > names.iter().position(|n| *n == "Germline Variant Calling")
        );
    }

    #[test]
    fn only_case_generation_runs_without_cases() {
        let stages = pipeline_stages(&config());
        let without: Vec<&str> = stages
            .iter()
            .filter(|stage| !stage.needs_cases())
            .map(Stage::name)
            .collect();
        assert_eq!(without, ["Generate Cases"]);
    }

    fn guid(n: u32) -> String {
        format!("00000000-0000-4000-8000-{n:012}")
    }

    /// One case with every sample and a MAF, and every per-case and
    /// per-disease file on disk. `globals` are present too; all files share
    /// one modification time except `aged`, which is older.
    fn complete_world(
        config: &ResolvedConfig,
        globals: &[Utf8PathBuf],
        aged: Option<&Utf8PathBuf>,
    ) -> WorldSnapshot {
        let stamp = |path: Utf8PathBuf| {
            let secs = if Some(&path) == aged { 1 } else { 1000 };
            FileStamp::new(path, SystemTime::UNIX_EPOCH + Duration::from_secs(secs), 1)
        };
        let remote = |n: u32| RemoteFile {
            file_id: guid(n).parse().unwrap(),
            md5: None,
            size: Some(1),
        };
        let samples: BTreeMap<Sample, RemoteFile> = Sample::ALL
            .into_iter()
            .zip(1..)
            .map(|(sample, n)| (sample, remote(n)))
            .collect();
        let case_id: CaseId = guid(10).parse().unwrap();
        let disease: Disease = "luad".parse().unwrap();
        let case = Case {
            case_id: case_id.clone(),
            disease: disease.clone(),
            samples,
            maf: Some(remote(5)),
            copy_number: None,
        };

        let mut builder = WorldSnapshot::builder("derived_files");
        for file in case.remote_files() {
            let file_id: &FileId = &file.file_id;
            builder = builder.downloaded(DownloadedFile {
                file_id: file_id.clone(),
                stamp: stamp(Utf8PathBuf::from(format!("/data/{file_id}/reads.bam"))),
                partial: false,
                stored_md5: None,
                md5_stamp: None,
                data_directory: Utf8PathBuf::from("/data"),
            });
        }
        for kind in DerivedKind::all() {
            builder = builder.derived(DerivedFile {
                case_id: case_id.clone(),
                derived_from: case.samples[&Sample::TumorDna].file_id.clone(),
                kind,
                stamp: stamp(Utf8PathBuf::from(format!("/derived/{case_id}{}", kind.extension()))),
            });
        }
        builder = builder.expression_file_candidate(stamp(
            Utf8PathBuf::from("/expression").join(expression_file_name(&disease)),
        ));
        for chromosome in Chromosome::all() {
            builder = builder.expression_distribution_candidate(stamp(
                Utf8PathBuf::from("/distribution")
                    .join(expression_distribution_file_name(chromosome, &disease)),
            ));
        }
        builder = builder.global_file(stamp(config.cases_file.clone()));
        for path in globals {
            builder = builder.global_file(stamp(path.clone()));
        }
        builder.case(case).build()
    }

    #[test]
    fn every_global_input_is_produced_by_a_stage() {
        let config = config();
        let stages = pipeline_stages(&config);
        let produced: Vec<Utf8PathBuf> = [
            ASE_MAP_FILE,
            ASE_DIFFERENCE_MAP_FILE,
            MANN_WHITNEY_FILE,
            CONSOLIDATED_CASE_METADATA_FILE,
            OVERALL_VCF_STATISTICS_FILE,
        ]
        .into_iter()
        .map(|name| config.final_results_directory.join(name))
        .collect();

        // Only stage outputs are on disk; no done unit may lack an input.
        let world = complete_world(&config, &produced, None);
        let lacking: Vec<String> = stages
            .iter()
            .flat_map(|stage| stage.check_freshness(&world))
            .filter(|violation| violation.input.is_none())
            .map(|violation| violation.stage)
            .collect();
        assert!(lacking.is_empty(), "inputs nothing produces: {lacking:?}");

        // Aging a global file makes the stage that writes it stale.
        for path in &produced {
            let world = complete_world(&config, &produced, Some(path));
            assert!(
                stages
                    .iter()
                    .flat_map(|stage| stage.check_freshness(&world))
                    .any(|violation| &violation.output == path),
                "no stage writes {path}"
            );
        }
    }
}
