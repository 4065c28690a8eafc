//! Work-mode layer: per-mode signal analyzers behind one trait, an explicit
//! registry resolving `(mode, impl-name)` to a constructor, and the payload
//! composition that merges analyzer measurements with the telemetry
//! snapshot and calibration corrections.

pub mod analyzers;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use probe_calib::{CalibrationEngine, TableSpec};
use probe_proto::payload::{AttitudeFields, GnssFields, ModeFields, PositionFields};
use probe_proto::{PagePayload, RecordId, RequestError, WorkMode};
use probe_telemetry::TelemetrySource;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Per-mode analyzer selection: mode key ("llz", "gp", "vor") to a map of
/// impl-name -> enabled. Exactly one impl should be enabled per mode; a
/// missing section falls back to the sole registered impl for that mode.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SdrConfig {
    #[serde(default)]
    pub analyzers: HashMap<String, HashMap<String, bool>>,
}

fn mode_key(mode: WorkMode) -> &'static str {
    match mode {
        WorkMode::Idle => "idle",
        WorkMode::Llz => "llz",
        WorkMode::Gp => "gp",
        WorkMode::Vor => "vor",
    }
}

/// One live signal analyzer. `init` tunes the hardware; `fill` runs on every
/// sample tick and must not block.
#[async_trait]
pub trait SignalAnalyzer: Send + Sync {
    fn mode(&self) -> WorkMode;

    async fn init(
        &mut self,
        frequency_hz: u64,
        ref_power: f32,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Fill the measurement fields for the current sample.
    fn fill(&mut self, fields: &mut ModeFields);

    /// Latest input-overflow indicator; NaN when unknown.
    fn overflow(&self) -> f32;
}

pub type AnalyzerCtor = fn() -> Box<dyn SignalAnalyzer>;

struct RegistryEntry {
    mode: WorkMode,
    name: &'static str,
    ctor: AnalyzerCtor,
}

/// Explicit analyzer registry built at startup.
#[derive(Default)]
pub struct AnalyzerRegistry {
    entries: Vec<RegistryEntry>,
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the in-tree simulated analyzers for every mode.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.register(WorkMode::Llz, "sim", analyzers::simulated_llz);
        reg.register(WorkMode::Gp, "sim", analyzers::simulated_gp);
        reg.register(WorkMode::Vor, "sim", analyzers::simulated_vor);
        reg
    }

    pub fn register(&mut self, mode: WorkMode, name: &'static str, ctor: AnalyzerCtor) {
        self.entries.push(RegistryEntry { mode, name, ctor });
    }

    /// OR of the flags of every mode with at least one registered impl.
    pub fn supported_modes_mask(&self) -> u32 {
        self.entries.iter().fold(0, |m, e| m | e.mode.flag())
    }

    /// Resolve and construct the configured analyzer for `mode`.
    pub fn create(
        &self,
        mode: WorkMode,
        cfg: &SdrConfig,
    ) -> Result<Box<dyn SignalAnalyzer>, RequestError> {
        let in_mode: Vec<&RegistryEntry> =
            self.entries.iter().filter(|e| e.mode == mode).collect();
        if in_mode.is_empty() {
            return Err(RequestError::Unsupported(format!(
                "no analyzer registered for mode {mode}"
            )));
        }
        let entry = match cfg.analyzers.get(mode_key(mode)) {
            Some(impls) => {
                let enabled: Vec<&str> = impls
                    .iter()
                    .filter(|(_, on)| **on)
                    .map(|(name, _)| name.as_str())
                    .collect();
                match enabled.as_slice() {
                    [name] => in_mode
                        .iter()
                        .copied()
                        .find(|e| e.name == *name)
                        .ok_or_else(|| {
                            RequestError::Unsupported(format!(
                                "analyzer {name:?} not registered for mode {mode}"
                            ))
                        })?,
                    [] => {
                        return Err(RequestError::Unsupported(format!(
                            "no analyzer enabled for mode {mode}"
                        )))
                    }
                    many => {
                        return Err(RequestError::Unsupported(format!(
                            "multiple analyzers enabled for mode {mode}: {many:?}"
                        )))
                    }
                }
            }
            // No config section: unambiguous only with a single impl.
            None if in_mode.len() == 1 => in_mode[0],
            None => {
                return Err(RequestError::Unsupported(format!(
                    "analyzer for mode {mode} is ambiguous without configuration"
                )))
            }
        };
        info!("sdr: using analyzer {:?} for mode {mode}", entry.name);
        Ok((entry.ctor)())
    }
}

/// Calibration tables the work modes consult, registered at boot.
pub fn calibration_specs() -> Vec<TableSpec> {
    [
        "llz_power", "llz_ddm", "llz_sdm", "gp_power", "gp_ddm", "gp_sdm", "vor_power",
        "vor_bearing",
    ]
    .into_iter()
    .map(TableSpec::new)
    .collect()
}

/// Host of the single live analyzer for the active mode.
pub struct WorkModeHost {
    mode: WorkMode,
    frequency_hz: u64,
    ref_power: f32,
    analyzer: Mutex<Box<dyn SignalAnalyzer>>,
}

impl WorkModeHost {
    /// Construct the configured analyzer and initialize it.
    pub async fn init(
        registry: &AnalyzerRegistry,
        cfg: &SdrConfig,
        mode: WorkMode,
        frequency_hz: u64,
        ref_power: f32,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, RequestError> {
        let mut analyzer = registry.create(mode, cfg)?;
        analyzer
            .init(frequency_hz, ref_power, cancel)
            .await
            .map_err(|e| RequestError::Failed(format!("analyzer init: {e:#}")))?;
        Ok(Arc::new(Self {
            mode,
            frequency_hz,
            ref_power,
            analyzer: Mutex::new(analyzer),
        }))
    }

    pub fn mode(&self) -> WorkMode {
        self.mode
    }

    pub fn frequency_hz(&self) -> u64 {
        self.frequency_hz
    }

    pub fn ref_power(&self) -> f32 {
        self.ref_power
    }

    pub fn overflow(&self) -> f32 {
        self.analyzer.lock().overflow()
    }

    /// Compose a page payload for one sample: ids, telemetry snapshot
    /// (zero-filled when absent), analyzer measurements, calibration.
    pub fn read_data(
        &self,
        telemetry: &TelemetrySource,
        calibration: &CalibrationEngine,
        record_id: RecordId,
        page_index: u32,
    ) -> PagePayload {
        let gnss = *telemetry.gnss().borrow();
        let position = *telemetry.position().borrow();
        let attitude = *telemetry.attitude().borrow();
        self.compose(
            record_id,
            page_index,
            telemetry.now_unix_us(),
            gnss,
            position,
            attitude,
            calibration,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn compose(
        &self,
        record_id: RecordId,
        page_index: u32,
        time_unix_us: i64,
        gnss: Option<probe_telemetry::GnssSnapshot>,
        position: Option<probe_telemetry::PositionSnapshot>,
        attitude: Option<probe_telemetry::AttitudeSnapshot>,
        calibration: &CalibrationEngine,
    ) -> PagePayload {
        // fix_type 0 = no GPS; zero-fill is the documented absent form.
        let gnss = gnss
            .map(|g| GnssFields {
                fix_type: g.fix_type,
                satellites: g.satellites,
                lat_1e7: g.lat_1e7,
                lon_1e7: g.lon_1e7,
                alt_mm: g.alt_mm,
                eph: g.eph,
                epv: g.epv,
                vel_cms: g.vel_cms,
                cog_cdeg: g.cog_cdeg,
            })
            .unwrap_or_default();
        let position = position
            .map(|p| PositionFields {
                lat_1e7: p.lat_1e7,
                lon_1e7: p.lon_1e7,
                alt_mm: p.alt_mm,
                relative_alt_mm: p.relative_alt_mm,
                vx_cms: p.vx_cms,
                vy_cms: p.vy_cms,
                vz_cms: p.vz_cms,
                hdg_cdeg: p.hdg_cdeg,
            })
            .unwrap_or_default();
        let attitude = attitude
            .map(|a| AttitudeFields {
                roll: a.roll,
                pitch: a.pitch,
                yaw: a.yaw,
            })
            .unwrap_or_default();

        let mut mode = ModeFields::empty(self.mode).expect("host never runs in Idle");
        self.analyzer.lock().fill(&mut mode);
        apply_calibration(&mut mode, calibration);

        PagePayload {
            record_id,
            page_index,
            time_unix_us,
            gnss,
            position,
            attitude,
            mode,
        }
    }
}

fn apply_calibration(fields: &mut ModeFields, calib: &CalibrationEngine) {
    match fields {
        ModeFields::Llz(f) => {
            f.power_dbm = calib.adjust("llz_power", f.power_dbm as f64) as f32;
            f.ddm = calib.adjust("llz_ddm", f.ddm as f64) as f32;
            f.sdm = calib.adjust("llz_sdm", f.sdm as f64) as f32;
        }
        ModeFields::Gp(f) => {
            f.power_dbm = calib.adjust("gp_power", f.power_dbm as f64) as f32;
            f.ddm = calib.adjust("gp_ddm", f.ddm as f64) as f32;
            f.sdm = calib.adjust("gp_sdm", f.sdm as f64) as f32;
        }
        ModeFields::Vor(f) => {
            f.power_dbm = calib.adjust("vor_power", f.power_dbm as f64) as f32;
            f.bearing_deg = calib.adjust("vor_bearing", f.bearing_deg as f64) as f32;
        }
    }
}
