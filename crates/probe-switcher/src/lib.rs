//! Device mode switcher: the state machine over work modes.
//!
//! Owns the active [`WorkModeHost`], the current record writer and the
//! periodic sample loop. A single transition mutex serializes SetMode,
//! StartRecord, StopRecord and shutdown; the sample loop runs single-flight
//! and is paused around record mutations by claiming its flight slot, so a
//! page write can never race the writer's finalization.

pub mod requests;
pub mod system;
mod tick;

use std::sync::Arc;

use parking_lot::Mutex;
use probe_calib::CalibrationEngine;
use probe_proto::{
    CommandResult, GatewayLink, MissionState, RecordId, RequestError, SdrStatus, TagKind,
    TagValue, WorkMode,
};
use probe_sdr::{AnalyzerRegistry, SdrConfig, WorkModeHost};
use probe_store::RecordStore;
use probe_telemetry::TelemetrySource;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use tick::{tick_period, TickCounters, TickStats, MIN_TICK_PERIOD, TICK_RING_SLOTS};

fn default_send_delay_ms() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwitcherConfig {
    /// Pacing between items of a paginated response.
    #[serde(default = "default_send_delay_ms")]
    pub record_send_delay_ms: u64,
}

impl Default for SwitcherConfig {
    fn default() -> Self {
        Self {
            record_send_delay_ms: default_send_delay_ms(),
        }
    }
}

#[derive(Clone)]
pub(crate) struct CurrentRecord {
    pub(crate) name: String,
    pub(crate) writer: Arc<probe_store::RecordWriter>,
}

struct TickHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub(crate) struct Inner {
    pub(crate) cfg: SwitcherConfig,
    pub(crate) store: RecordStore,
    pub(crate) calibration: Arc<CalibrationEngine>,
    pub(crate) telemetry: Arc<TelemetrySource>,
    pub(crate) registry: AnalyzerRegistry,
    pub(crate) sdr_cfg: SdrConfig,
    pub(crate) gateway: Arc<dyn GatewayLink>,
    pub(crate) shutdown: CancellationToken,
    /// Serializes mode / record transitions.
    transition: tokio::sync::Mutex<()>,
    pub(crate) active: Mutex<Option<Arc<WorkModeHost>>>,
    pub(crate) current_record: Mutex<Option<CurrentRecord>>,
    pub(crate) stats: TickStats,
    tick_task: Mutex<Option<TickHandle>>,
    status_tx: watch::Sender<SdrStatus>,
    mission_state: Mutex<MissionState>,
}

/// Handle to the switcher; cheap to clone.
#[derive(Clone)]
pub struct ModeSwitcher {
    inner: Arc<Inner>,
}

impl ModeSwitcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: SwitcherConfig,
        store: RecordStore,
        calibration: Arc<CalibrationEngine>,
        telemetry: Arc<TelemetrySource>,
        registry: AnalyzerRegistry,
        sdr_cfg: SdrConfig,
        gateway: Arc<dyn GatewayLink>,
    ) -> Self {
        let (status_tx, _) = watch::channel(SdrStatus {
            supported_modes: registry.supported_modes_mask(),
            ..SdrStatus::default()
        });
        let switcher = Self {
            inner: Arc::new(Inner {
                cfg,
                store,
                calibration,
                telemetry,
                registry,
                sdr_cfg,
                gateway,
                shutdown: CancellationToken::new(),
                transition: tokio::sync::Mutex::new(()),
                active: Mutex::new(None),
                current_record: Mutex::new(None),
                stats: TickStats::new(),
                tick_task: Mutex::new(None),
                status_tx,
                mission_state: Mutex::new(MissionState::Idle),
            }),
        };
        switcher.publish_status();
        switcher
    }

    /// Token cancelled at switcher shutdown; long-running collaborators link
    /// their own tokens under it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn status_rx(&self) -> watch::Receiver<SdrStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Recompute, publish and return the current status.
    pub fn status(&self) -> SdrStatus {
        self.publish_status()
    }

    pub fn tick_counters(&self) -> TickCounters {
        self.inner.stats.counters()
    }

    pub fn tick_durations(&self) -> Vec<std::time::Duration> {
        self.inner.stats.tick_durations()
    }

    pub fn current_record_id(&self) -> Option<RecordId> {
        self.inner.current_record.lock().as_ref().map(|r| r.writer.id())
    }

    pub fn current_mode(&self) -> WorkMode {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|h| h.mode())
            .unwrap_or(WorkMode::Idle)
    }

    pub fn current_frequency_hz(&self) -> Option<u64> {
        self.inner.active.lock().as_ref().map(|h| h.frequency_hz())
    }

    /// Mission executor reports its state here for the extended heartbeat.
    pub fn set_mission_state(&self, state: MissionState) {
        *self.inner.mission_state.lock() = state;
        self.publish_status();
    }

    /// Switch the work mode. Implicitly stops any running record, disposes
    /// the previous analyzer and awaits its timer before arming the new one.
    /// Any failure resets to Idle with RefPower/SignalOverflow published as
    /// NaN.
    pub async fn set_mode(
        &self,
        mode: WorkMode,
        frequency_hz: u64,
        record_rate_hz: f32,
        thinning_ratio: u32,
        ref_power: f32,
    ) -> CommandResult {
        let inner = &self.inner;
        let _guard = inner.transition.lock().await;
        if inner.shutdown.is_cancelled() {
            return CommandResult::Denied;
        }

        let was_idle = inner.active.lock().is_none();
        if mode.is_idle() && was_idle {
            // Idle is a singleton with no side effects.
            return CommandResult::Accepted;
        }

        self.stop_record_locked().await;
        self.stop_tick_locked().await;
        *inner.active.lock() = None;

        if mode.is_idle() {
            info!("mode -> IDLE");
            self.publish_status();
            return CommandResult::Accepted;
        }

        let Some(period) = tick_period(record_rate_hz) else {
            warn!("set_mode {mode}: invalid record rate {record_rate_hz}");
            self.publish_status();
            return CommandResult::Failed;
        };
        let ratio = thinning_ratio.max(1);

        inner.calibration.set_mode(frequency_hz, ref_power);
        let cancel = inner.shutdown.child_token();
        match WorkModeHost::init(
            &inner.registry,
            &inner.sdr_cfg,
            mode,
            frequency_hz,
            ref_power,
            cancel.clone(),
        )
        .await
        {
            Ok(host) => {
                inner.stats.reset_counter();
                *inner.active.lock() = Some(host.clone());
                let task =
                    tick::spawn_tick_loop(inner.clone(), host, period, ratio, cancel.clone());
                *inner.tick_task.lock() = Some(TickHandle { cancel, task });
                info!(
                    "mode -> {mode} ({frequency_hz} Hz, period {period:?}, ratio {ratio})"
                );
                self.publish_status();
                CommandResult::Accepted
            }
            Err(e) => {
                warn!("set_mode {mode} failed: {e}");
                self.publish_status();
                match e {
                    RequestError::Unsupported(_) => CommandResult::Unsupported,
                    _ => CommandResult::Failed,
                }
            }
        }
    }

    /// Open a record in the active mode; denied while Idle or recording.
    /// Sample numbering restarts at zero for the new record.
    pub async fn start_record(&self, name: &str) -> CommandResult {
        let inner = &self.inner;
        let _guard = inner.transition.lock().await;
        let Some(host) = inner.active.lock().clone() else {
            return CommandResult::Denied;
        };
        if inner.current_record.lock().is_some() {
            return CommandResult::Denied;
        }

        let id = RecordId::new();
        let created = inner.telemetry.now_unix_us();
        // Claim the flight slot so counter reset and record visibility are
        // atomic with respect to the sample loop.
        inner.stats.acquire_slot().await;
        let result = match inner
            .store
            .create(id, name, host.mode(), host.frequency_hz(), created)
        {
            Ok(writer) => {
                inner.stats.reset_counter();
                *inner.current_record.lock() = Some(CurrentRecord {
                    name: name.to_owned(),
                    writer,
                });
                info!("record {id} ({name:?}) started");
                CommandResult::Accepted
            }
            Err(e) => {
                warn!("start_record {name:?} failed: {e}");
                CommandResult::Failed
            }
        };
        inner.stats.release_slot();
        self.publish_status();
        result
    }

    /// Close the current record. Idempotent: accepted with no record open.
    pub async fn stop_record(&self) -> CommandResult {
        let inner = &self.inner;
        let _guard = inner.transition.lock().await;
        self.stop_record_locked().await;
        self.publish_status();
        CommandResult::Accepted
    }

    /// Tag the current record; denied when none is open or on a tag-name
    /// collision (tag ids are deterministic, re-tagging is rejected).
    pub async fn set_record_tag(
        &self,
        kind: TagKind,
        name: &str,
        value: TagValue,
    ) -> CommandResult {
        let inner = &self.inner;
        let _guard = inner.transition.lock().await;
        let Some(record) = inner.current_record.lock().clone() else {
            return CommandResult::Denied;
        };
        match record.writer.write_tag(kind, name, value) {
            Ok(id) => {
                info!("record {}: tag {name:?} -> {id}", record.writer.id());
                CommandResult::Accepted
            }
            Err(
                e @ (probe_store::StoreError::TagExists { .. }
                | probe_store::StoreError::InvalidTagName(_)),
            ) => {
                warn!("set_record_tag {name:?} denied: {e}");
                CommandResult::Denied
            }
            Err(e) => {
                warn!("set_record_tag {name:?} failed: {e}");
                CommandResult::Failed
            }
        }
    }

    /// Stop everything and release the analyzer. Further commands are denied.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        let _guard = inner.transition.lock().await;
        self.stop_record_locked().await;
        self.stop_tick_locked().await;
        *inner.active.lock() = None;
        self.publish_status();
        info!("switcher shut down");
    }

    /// Must hold the transition lock. Waits the in-flight sample out before
    /// clearing the record, then finalizes the writer.
    async fn stop_record_locked(&self) {
        let inner = &self.inner;
        inner.stats.acquire_slot().await;
        let record = inner.current_record.lock().take();
        inner.stats.release_slot();
        if let Some(record) = record {
            let id = record.writer.id();
            let stopped = inner.telemetry.now_unix_us();
            match record.writer.finalize(stopped) {
                Ok(()) => info!(
                    "record {id} ({:?}) stopped, {} pages",
                    record.name,
                    record.writer.data_count()
                ),
                Err(e) => warn!("record {id} finalize failed: {e}"),
            }
        }
    }

    /// Must hold the transition lock. Cancels the tick loop, awaits it and
    /// drains any outstanding flight.
    async fn stop_tick_locked(&self) {
        let handle = self.inner.tick_task.lock().take();
        if let Some(h) = handle {
            h.cancel.cancel();
            let _ = h.task.await;
        }
        self.inner.stats.acquire_slot().await;
        self.inner.stats.release_slot();
    }

    fn publish_status(&self) -> SdrStatus {
        let inner = &self.inner;
        let active = inner.active.lock().clone();
        let record = inner.current_record.lock().clone();
        let status = SdrStatus {
            supported_modes: inner.registry.supported_modes_mask(),
            current_mode: active.as_ref().map(|h| h.mode()).unwrap_or(WorkMode::Idle),
            record_count: inner.store.count(),
            size_bytes: inner.store.size_bytes(),
            current_record: record.as_ref().map(|r| r.writer.id()),
            current_record_name: record.as_ref().map(|r| r.name.clone()),
            ref_power: active.as_ref().map(|h| h.ref_power()).unwrap_or(f32::NAN),
            signal_overflow: active.as_ref().map(|h| h.overflow()).unwrap_or(f32::NAN),
            calib_state: inner.calibration.state(),
            calib_table_count: inner.calibration.table_count(),
            mission_state: *inner.mission_state.lock(),
        };
        inner.status_tx.send_replace(status.clone());
        status
    }
}
