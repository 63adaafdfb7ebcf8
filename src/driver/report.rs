use crate::sweep::{fmt_reading, SweepRow};
use crate::tsc::CalibratedFrequency;
use anyhow::{Context, Result};
use chrono::{Local, SecondsFormat};
use log::trace;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

const CSV_HEADER: &str = "timestamp,\
    tsc_mhz,\
    active_cores,\
    tested_core,\
    tested_mhz,\
    reference_mhz,\
    tested_mv";

/// Append one CSV line per sweep row, writing a header if the file is new.
pub fn log_results(path: &Path, frequency: CalibratedFrequency, rows: &[SweepRow]) -> Result<()> {
    trace!("Writing results to: {path:?}");
    if path.exists() {
        trace!("Log file exists...");
    } else {
        trace!("Log file doesn't exist, creating...");
        create_csv_file(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
    }

    let mut log_file = OpenOptions::new()
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let timestamp = Local::now().to_rfc3339_opts(SecondsFormat::Secs, false);
    for row in rows {
        writeln!(log_file, "{}", csv_line(&timestamp, frequency, row))?;
    }
    Ok(())
}

fn create_csv_file(path: &Path) -> std::io::Result<()> {
    let mut log_file = OpenOptions::new().create_new(true).write(true).open(path)?;
    writeln!(log_file, "{CSV_HEADER}")
}

fn csv_line(timestamp: &str, frequency: CalibratedFrequency, row: &SweepRow) -> String {
    format!(
        "{},{},{},{},{},{},{}",
        timestamp,
        frequency.mhz(),
        row.level(),
        row.tested,
        fmt_reading(row.tested_result.max_frequency_mhz),
        fmt_reading(row.reference_result.max_frequency_mhz),
        fmt_reading(row.tested_result.avg_voltage_mv),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::CoreId;
    use crate::worker::SampleResult;
    use std::fs;
    use tempfile::TempDir;

    fn row(level: u32, mhz: u64) -> SweepRow {
        let active: Vec<CoreId> = (0..level).map(|core| CoreId { package: 0, core }).collect();
        let result = SampleResult {
            max_frequency_mhz: Some(mhz),
            avg_voltage_mv: Some(1_300),
            frequency_samples: 10,
            voltage_samples: 10,
        };
        SweepRow {
            tested: active[active.len() - 1],
            active,
            tested_result: result,
            reference_result: SampleResult {
                max_frequency_mhz: Some(4_500),
                ..result
            },
            results: vec![result; level as usize],
        }
    }

    #[test]
    fn test_csv_line() {
        let line = csv_line("T", CalibratedFrequency::from_hz(3_700_000_000), &row(2, 4_400));
        assert_eq!(line, "T,3700,2,1,4400,4500,1300");
    }

    #[test]
    fn test_header_written_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sweep.csv");
        let frequency = CalibratedFrequency::from_hz(3_700_000_000);

        log_results(&path, frequency, &[row(1, 4_500), row(2, 4_400)]).unwrap();
        log_results(&path, frequency, &[row(1, 4_450)]).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("timestamp,tsc_mhz,"));
        assert!(lines[3].ends_with(",1,0,4450,4500,1300"));
    }
}
