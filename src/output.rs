use std::fmt::Write as _;
use std::io::{self, Write};

use serde::Serialize;

use crate::app::{PlanResult, ProgressEvent, ProgressSink};
use crate::ase_map::AseMapSummary;

const STAGE_NAME_HEADER: &str = "Stage Name";
const COUNT_HEADER: &str = " # Done  # Added  # Waiting  # Downloads";
const COUNT_RULE: &str = " ------  -------  ---------  -----------";

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Table,
    Json,
}

/// Fixed-width stage table with a totals row.
pub fn render_table(result: &PlanResult) -> String {
    let width = result
        .stages
        .iter()
        .map(|row| row.name.len())
        .max()
        .unwrap_or(0)
        .max(STAGE_NAME_HEADER.len());

    let mut out = String::new();
    let _ = writeln!(out, "{STAGE_NAME_HEADER:<width$}{COUNT_HEADER}");
    let _ = writeln!(out, "{}{COUNT_RULE}", "-".repeat(width));
    for row in &result.stages {
        let _ = write!(
            out,
            "{:>width$} {:>6} {:>8} {:>10} {:>11}",
            row.name, row.done, row.added, row.waiting, row.downloads
        );
        if let Some(error) = &row.error {
            let _ = write!(out, "  failed: {error}");
        }
        out.push('\n');
    }
    let _ = writeln!(out, "{}{COUNT_RULE}", " ".repeat(width));
    let totals = &result.totals;
    let _ = writeln!(
        out,
        "{} {:>6} {:>8} {:>10} {:>11}",
        " ".repeat(width),
        totals.done,
        totals.added,
        totals.waiting,
        totals.downloads
    );
    out
}

pub struct TableOutput;

impl TableOutput {
    pub fn print_plan(result: &PlanResult) -> io::Result<()> {
        let mut stdout = io::stdout();
        stdout.write_all(render_table(result).as_bytes())?;
        for script in result.scripts.iter().chain(result.download_script.iter()) {
            writeln!(stdout, "wrote {script}")?;
        }
        Ok(())
    }

    pub fn print_ase_map(summary: &AseMapSummary) -> io::Result<()> {
        let mut stdout = io::stdout();
        writeln!(
            stdout,
            "{} of {} case(s) read; {} tumor and {} normal region(s)",
            summary.cases_read, summary.cases_queued, summary.tumor_regions, summary.normal_regions
        )?;
        writeln!(stdout, "wrote {}", summary.map_path)?;
        writeln!(stdout, "wrote {}", summary.difference_map_path)?;
        Ok(())
    }
}

impl ProgressSink for TableOutput {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("{} ({:.1}s)", event.message, elapsed.as_secs_f64()),
            None => eprintln!("{}", event.message),
        }
    }
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_plan(result: &PlanResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_ase_map(summary: &AseMapSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::app::{StageRow, Totals};

    fn row(name: &str, done: usize, added: usize, waiting: usize, downloads: usize) -> StageRow {
        StageRow {
            name: name.to_string(),
            done,
            added,
            waiting,
            downloads,
            skipped: false,
            error: None,
        }
    }

    #[test]
    fn table_layout() {
        let mut failing = row("Expression Deciles", 0, 0, 0, 0);
        failing.error = Some("too wide".to_string());
        let result = PlanResult {
            stages: vec![row("Download", 4, 0, 0, 2), failing],
            totals: Totals {
                done: 4,
                added: 0,
                waiting: 0,
                downloads: 2,
            },
            downloads: Vec::new(),
            download_bytes: 0,
            scripts: Vec::new(),
            download_script: None,
            failed_stages: 1,
            elapsed: Duration::ZERO,
        };

        let table = render_table(&result);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "Stage Name         # Done  # Added  # Waiting  # Downloads");
        assert_eq!(lines[1], "------------------ ------  -------  ---------  -----------");
        assert_eq!(lines[2], "          Download      4        0          0           2");
        assert!(lines[3].ends_with("  failed: too wide"));
        assert_eq!(lines[4], "                   ------  -------  ---------  -----------");
        assert_eq!(lines[5], "                        4        0          0           2");
    }
}
