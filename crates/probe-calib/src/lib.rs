//! Calibration engine: named adjustment tables selected by `(frequency,
//! ref-power)` proximity on every mode change, applied to measurements as a
//! piecewise-linear correction. Tables persist one TOML file each under the
//! calibration folder; a global in-progress flag disables all adjustment
//! while a calibration session runs.

pub mod doctor;
mod table;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use parking_lot::RwLock;
use probe_proto::{CalibState, CalibrationTableInfo, RequestError};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::info;

pub use probe_proto::CalibrationRow;
pub use table::PiecewiseLinear;

use table::{load_table, save_table, select, TableFile};

fn default_folder() -> String {
    "calibration".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalibConfig {
    /// Directory holding one TOML file per table.
    #[serde(default = "default_folder")]
    pub calibration_folder: String,
}

impl Default for CalibConfig {
    fn default() -> Self {
        Self {
            calibration_folder: default_folder(),
        }
    }
}

/// Table registration: name plus the factory row set restored when a client
/// writes an empty row set.
#[derive(Debug, Clone)]
pub struct TableSpec {
    pub name: String,
    pub factory_rows: Vec<CalibrationRow>,
}

impl TableSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            factory_rows: Vec::new(),
        }
    }
}

struct TableState {
    name: String,
    enabled: bool,
    updated_unix_us: i64,
    rows: Vec<CalibrationRow>,
    factory: Vec<CalibrationRow>,
    selected: PiecewiseLinear,
}

struct Selection {
    frequency_hz: u64,
    ref_power: f32,
}

pub struct CalibrationEngine {
    folder: PathBuf,
    tables: RwLock<Vec<TableState>>,
    selection: RwLock<Selection>,
    in_progress: AtomicBool,
    in_progress_tx: watch::Sender<bool>,
}

impl CalibrationEngine {
    /// Load registered tables from the calibration folder, falling back to
    /// each table's factory rows when no file exists yet.
    pub fn open(cfg: &CalibConfig, specs: Vec<TableSpec>) -> Result<Self> {
        let folder = PathBuf::from(&cfg.calibration_folder);
        std::fs::create_dir_all(&folder)?;

        let mut tables = Vec::with_capacity(specs.len());
        for spec in specs {
            let (enabled, updated, rows) = match load_table(&folder, &spec.name)? {
                Some(file) => (file.enabled, file.updated_unix_us, file.rows),
                None => (true, 0, spec.factory_rows.clone()),
            };
            tables.push(TableState {
                name: spec.name,
                enabled,
                updated_unix_us: updated,
                rows,
                factory: spec.factory_rows,
                selected: PiecewiseLinear::default(),
            });
        }
        info!("calibration: {} tables loaded", tables.len());

        let (in_progress_tx, _) = watch::channel(false);
        Ok(Self {
            folder,
            tables: RwLock::new(tables),
            selection: RwLock::new(Selection {
                frequency_hz: 0,
                ref_power: f32::NAN,
            }),
            in_progress: AtomicBool::new(false),
            in_progress_tx,
        })
    }

    /// Rebuild every table's selected function for the new mode parameters.
    pub fn set_mode(&self, frequency_hz: u64, ref_power: f32) {
        *self.selection.write() = Selection {
            frequency_hz,
            ref_power,
        };
        let mut tables = self.tables.write();
        for t in tables.iter_mut() {
            t.selected = select(&t.rows, frequency_hz, ref_power);
        }
    }

    /// Corrected value for `measured` through the named table. Identity when
    /// the table is unknown, disabled, empty, or calibration is in progress.
    pub fn adjust(&self, table: &str, measured: f64) -> f64 {
        if self.in_progress.load(Ordering::Relaxed) {
            return measured;
        }
        let tables = self.tables.read();
        match tables.iter().find(|t| t.name == table) {
            Some(t) if t.enabled => measured + t.selected.eval(measured),
            _ => measured,
        }
    }

    pub fn start_calibration(&self) {
        self.in_progress.store(true, Ordering::Relaxed);
        self.in_progress_tx.send_replace(true);
    }

    pub fn stop_calibration(&self) {
        self.in_progress.store(false, Ordering::Relaxed);
        self.in_progress_tx.send_replace(false);
    }

    pub fn in_progress_rx(&self) -> watch::Receiver<bool> {
        self.in_progress_tx.subscribe()
    }

    pub fn state(&self) -> CalibState {
        if self.tables.read().is_empty() {
            CalibState::NotSupported
        } else if self.in_progress.load(Ordering::Relaxed) {
            CalibState::Progress
        } else {
            CalibState::Ok
        }
    }

    pub fn table_count(&self) -> u16 {
        self.tables.read().len() as u16
    }

    pub fn table_info(&self, index: u16) -> Result<CalibrationTableInfo, RequestError> {
        let tables = self.tables.read();
        let t = tables
            .get(index as usize)
            .ok_or_else(|| RequestError::NotFound(format!("calibration table {index}")))?;
        Ok(CalibrationTableInfo {
            index,
            name: t.name.clone(),
            row_count: t.rows.len() as u16,
            enabled: t.enabled,
            updated_unix_us: t.updated_unix_us,
        })
    }

    pub fn table_row(&self, index: u16, row: u16) -> Result<CalibrationRow, RequestError> {
        let tables = self.tables.read();
        let t = tables
            .get(index as usize)
            .ok_or_else(|| RequestError::NotFound(format!("calibration table {index}")))?;
        t.rows.get(row as usize).copied().ok_or_else(|| {
            RequestError::NotFound(format!("calibration table {index} row {row}"))
        })
    }

    /// Replace a table's rows (empty set reverts to the factory rows),
    /// persist the table file and recompute its selected function.
    pub fn write_table(
        &self,
        index: u16,
        rows: Vec<CalibrationRow>,
        updated_unix_us: i64,
    ) -> Result<(), RequestError> {
        let mut tables = self.tables.write();
        let Some(t) = tables.get_mut(index as usize) else {
            return Err(RequestError::NotFound(format!("calibration table {index}")));
        };
        t.rows = if rows.is_empty() {
            t.factory.clone()
        } else {
            rows
        };
        t.updated_unix_us = updated_unix_us;
        let sel = self.selection.read();
        t.selected = select(&t.rows, sel.frequency_hz, sel.ref_power);
        drop(sel);

        let file = TableFile {
            name: t.name.clone(),
            enabled: t.enabled,
            updated_unix_us: t.updated_unix_us,
            rows: t.rows.clone(),
        };
        save_table(&self.folder, &file).map_err(|e| RequestError::Failed(e.to_string()))?;
        info!("calibration: table {} updated ({} rows)", file.name, file.rows.len());
        Ok(())
    }
}
