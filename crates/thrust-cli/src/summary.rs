//! Averages a run log per PWM value and writes a reduced table restricted to
//! a fixed set of representative PWM points.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

pub const SUMMARY_PWMS: &[i64] = &[
    1000, 1001, 1012, 1024, 1038, 1051, 1065, 1078, 1092, 1105, 1118, 1130, 1145, 1158, 1172,
    1186, 1198, 1212, 1225, 1239, 1252, 1266, 1279, 1292, 1306, 1319, 1332, 1346, 1360, 1373,
    1386, 1400, 1414, 1429, 1443, 1457, 1470, 1484, 1498, 1512, 1526, 1540, 1555, 1568, 1583,
    1596, 1609, 1623, 1636, 1650, 1664, 1676, 1690, 1704, 1717, 1730, 1746, 1759, 1773, 1786,
    1800, 1814, 1827, 1840, 1854, 1867, 1881, 1895, 1909, 1923, 1937, 1950, 1963, 1977, 1989, 2000,
];

/// Mean thrust per pwm, ordered by pwm, rounded to 3 decimals.
pub fn average_by_pwm(csv: &str) -> Result<Vec<(i64, f64)>> {
    let mut lines = csv.lines().enumerate();
    let (_, header) = lines.next().context("empty csv")?;
    let cols: Vec<&str> = header.split(',').map(str::trim).collect();
    let pwm_col = cols.iter().position(|c| *c == "pwm").context("csv has no 'pwm' column")?;
    let thrust_col = cols.iter().position(|c| *c == "thrust").context("csv has no 'thrust' column")?;

    let mut groups: BTreeMap<i64, (f64, u32)> = BTreeMap::new();
    for (i, line) in lines {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let get = |col: usize| {
            fields.get(col).copied().with_context(|| format!("line {}: missing column {}", i + 1, col))
        };
        let pwm: i64 = get(pwm_col)?.parse().with_context(|| format!("line {}: bad pwm", i + 1))?;
        let thrust: f64 = get(thrust_col)?.parse().with_context(|| format!("line {}: bad thrust", i + 1))?;
        let e = groups.entry(pwm).or_insert((0.0, 0));
        e.0 += thrust;
        e.1 += 1;
    }

    Ok(groups
        .into_iter()
        .map(|(pwm, (sum, n))| (pwm, (sum / n as f64 * 1000.0).round() / 1000.0))
        .collect())
}

pub fn render(rows: &[(i64, f64)]) -> String {
    let mut out = String::from("pwm,thrust\n");
    for (pwm, thrust) in rows {
        let _ = writeln!(out, "{},{}", pwm, thrust);
    }
    out
}

pub fn summarized_path(output: &Path) -> PathBuf {
    let stem = output.to_string_lossy();
    let base = stem.strip_suffix(".csv").unwrap_or(&stem);
    PathBuf::from(format!("{}_summarized.csv", base))
}

pub fn summarize(input: &Path, output: &Path) -> Result<()> {
    let text = std::fs::read_to_string(input).with_context(|| format!("read {}", input.display()))?;
    let rows = average_by_pwm(&text)?;
    std::fs::write(output, render(&rows)).with_context(|| format!("write {}", output.display()))?;
    info!("summary: averaged results written to {}", output.display());

    let picked: Vec<(i64, f64)> = rows.into_iter().filter(|(pwm, _)| SUMMARY_PWMS.contains(pwm)).collect();
    let reduced = summarized_path(output);
    std::fs::write(&reduced, render(&picked)).with_context(|| format!("write {}", reduced.display()))?;
    info!("summary: summarized results written to {}", reduced.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUN: &str = "timestamp,pwm,thrust,thrust_raw\n\
        10,1000,0.000,0\n\
        20,1000,0.002,-900\n\
        30,1001,0.010,-4490\n\
        40,1002,0.020,-8980\n\
        50,1001,0.012,-5388\n";

    #[test]
    fn averages_per_pwm() {
        let rows = average_by_pwm(RUN).unwrap();
        assert_eq!(rows, vec![(1000, 0.001), (1001, 0.011), (1002, 0.02)]);
    }

    #[test]
    fn summary_keeps_only_listed_pwms() {
        let rows = average_by_pwm(RUN).unwrap();
        let picked: Vec<_> = rows.into_iter().filter(|(p, _)| SUMMARY_PWMS.contains(p)).collect();
        assert_eq!(render(&picked), "pwm,thrust\n1000,0.001\n1001,0.011\n");
    }

    #[test]
    fn missing_column_is_an_error() {
        assert!(average_by_pwm("timestamp,thrust\n1,0.1\n").is_err());
        assert!(average_by_pwm("timestamp,pwm,thrust\n1,abc,0.1\n").is_err());
    }

    #[test]
    fn summarized_sibling_name() {
        assert_eq!(summarized_path(Path::new("out/avg.csv")), PathBuf::from("out/avg_summarized.csv"));
        assert_eq!(summarized_path(Path::new("avg")), PathBuf::from("avg_summarized.csv"));
    }
}
