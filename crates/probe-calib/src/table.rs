//! Calibration table: ordered rows, the piecewise-linear adjustment built
//! from a selected `(frequency, ref-power)` bucket, and the on-disk TOML
//! encoding (one file per table under the calibration folder).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use probe_proto::CalibrationRow;
use serde::{Deserialize, Serialize};

/// Piecewise-linear function over `(ref_value, adjustment)` points.
/// Outside the covered range the endpoint segment slopes extrapolate.
#[derive(Debug, Clone, Default)]
pub struct PiecewiseLinear {
    /// Sorted by x.
    points: Vec<(f64, f64)>,
}

impl PiecewiseLinear {
    pub fn from_points(mut points: Vec<(f64, f64)>) -> Self {
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        points.dedup_by(|a, b| a.0 == b.0);
        Self { points }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn eval(&self, x: f64) -> f64 {
        let pts = &self.points;
        match pts.len() {
            0 => 0.0,
            1 => pts[0].1,
            _ => {
                // Pick the segment: first, last, or the one containing x.
                let seg = if x <= pts[0].0 {
                    (pts[0], pts[1])
                } else if x >= pts[pts.len() - 1].0 {
                    (pts[pts.len() - 2], pts[pts.len() - 1])
                } else {
                    let i = pts.partition_point(|p| p.0 <= x);
                    (pts[i - 1], pts[i])
                };
                let ((x0, y0), (x1, y1)) = seg;
                y0 + (y1 - y0) * (x - x0) / (x1 - x0)
            }
        }
    }
}

/// Serialized form of one table file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableFile {
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub updated_unix_us: i64,
    #[serde(default)]
    pub rows: Vec<CalibrationRow>,
}

pub fn table_path(folder: &Path, name: &str) -> PathBuf {
    folder.join(format!("{name}.toml"))
}

pub fn load_table(folder: &Path, name: &str) -> Result<Option<TableFile>> {
    let path = table_path(folder, name);
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("read calibration table {path:?}"))?;
    let file: TableFile =
        toml::from_str(&raw).with_context(|| format!("parse calibration table {path:?}"))?;
    Ok(Some(file))
}

pub fn save_table(folder: &Path, file: &TableFile) -> Result<()> {
    std::fs::create_dir_all(folder)?;
    let raw = toml::to_string_pretty(file).context("encode calibration table")?;
    std::fs::write(table_path(folder, &file.name), raw)
        .with_context(|| format!("write calibration table {}", file.name))?;
    Ok(())
}

/// Two-step nearest-neighbor bucket selection, then the PWL over
/// `(ref_value, adjustment)` of the chosen bucket.
pub fn select(rows: &[CalibrationRow], frequency_hz: u64, ref_power: f32) -> PiecewiseLinear {
    if rows.is_empty() {
        return PiecewiseLinear::default();
    }
    let freq = *rows
        .iter()
        .map(|r| &r.frequency_hz)
        .min_by_key(|f| f.abs_diff(frequency_hz))
        .unwrap();
    let in_freq: Vec<&CalibrationRow> =
        rows.iter().filter(|r| r.frequency_hz == freq).collect();
    let rp = in_freq
        .iter()
        .map(|r| r.ref_power)
        .min_by(|a, b| {
            (a - ref_power)
                .abs()
                .total_cmp(&(b - ref_power).abs())
        })
        .unwrap();
    PiecewiseLinear::from_points(
        in_freq
            .iter()
            .filter(|r| r.ref_power == rp)
            .map(|r| (r.ref_value, r.adjustment))
            .collect(),
    )
}
