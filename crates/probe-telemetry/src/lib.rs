//! Autopilot telemetry source.
//!
//! Consumes the MAVLink packet stream from a configured `(system, component)`
//! pair and publishes last-known GNSS / attitude / global-position snapshots
//! plus a heartbeat-driven link indicator as watch cells. On every
//! reconnect it re-requests the autopilot data streams. Best-effort by
//! design: I/O errors are logged and swallowed, readers always get the
//! current (possibly stale) snapshot.

pub mod autodetect;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use mavlink::common::{
    MavMessage, ATTITUDE_DATA, GLOBAL_POSITION_INT_DATA, GPS_RAW_INT_DATA,
    REQUEST_DATA_STREAM_DATA,
};
use mavlink::MavHeader;
use parking_lot::Mutex;
use serde::Deserialize;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_id() -> u8 {
    1
}

fn default_rate() -> u16 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Autopilot link timeout before the indicator goes Disconnected.
    #[serde(default = "default_timeout_ms")]
    pub device_timeout_ms: u64,
    /// MAVLink ids of the autopilot we listen to.
    #[serde(default = "default_id")]
    pub gnss_system_id: u8,
    #[serde(default = "default_id")]
    pub gnss_component_id: u8,
    /// Message rate requested from the autopilot on reconnect.
    #[serde(default = "default_rate")]
    pub req_message_rate: u16,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            device_timeout_ms: default_timeout_ms(),
            gnss_system_id: default_id(),
            gnss_component_id: default_id(),
            req_message_rate: default_rate(),
        }
    }
}

/// Latest raw GNSS fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GnssSnapshot {
    pub time_usec: u64,
    pub fix_type: u8,
    pub lat_1e7: i32,
    pub lon_1e7: i32,
    pub alt_mm: i32,
    pub eph: u16,
    pub epv: u16,
    pub vel_cms: u16,
    pub cog_cdeg: u16,
    pub satellites: u8,
}

/// Latest vehicle attitude (radians).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttitudeSnapshot {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

/// Latest fused global position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionSnapshot {
    pub lat_1e7: i32,
    pub lon_1e7: i32,
    pub alt_mm: i32,
    pub relative_alt_mm: i32,
    pub vx_cms: i16,
    pub vy_cms: i16,
    pub vz_cms: i16,
    pub hdg_cdeg: u16,
}

/// Three-state link indicator driven by heartbeat age.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Degraded,
    Disconnected,
}

/// Transport seam towards the autopilot. `recv` must be cancel-safe: the
/// run loop races it against a timeout and drops the future on expiry.
#[async_trait]
pub trait AutopilotPort: Send + Sync {
    async fn recv(&self) -> Result<(MavHeader, MavMessage)>;
    async fn send(&self, msg: MavMessage) -> Result<()>;
}

pub struct TelemetrySource {
    cfg: TelemetryConfig,
    gnss_tx: watch::Sender<Option<GnssSnapshot>>,
    attitude_tx: watch::Sender<Option<AttitudeSnapshot>>,
    position_tx: watch::Sender<Option<PositionSnapshot>>,
    link_tx: watch::Sender<LinkState>,
    reached_tx: watch::Sender<Option<u16>>,
    last_heartbeat: Mutex<Option<Instant>>,
    clock_offset_us: Mutex<i64>,
    /// Set while Disconnected; armed request fires on the next reconnect.
    request_pending: AtomicBool,
    /// Coalesces concurrent stream requests to one in flight.
    request_in_flight: AtomicBool,
}

impl TelemetrySource {
    pub fn new(cfg: TelemetryConfig) -> Arc<Self> {
        let (gnss_tx, _) = watch::channel(None);
        let (attitude_tx, _) = watch::channel(None);
        let (position_tx, _) = watch::channel(None);
        let (link_tx, _) = watch::channel(LinkState::Disconnected);
        let (reached_tx, _) = watch::channel(None);
        Arc::new(Self {
            cfg,
            gnss_tx,
            attitude_tx,
            position_tx,
            link_tx,
            reached_tx,
            last_heartbeat: Mutex::new(None),
            clock_offset_us: Mutex::new(0),
            request_pending: AtomicBool::new(true),
            request_in_flight: AtomicBool::new(false),
        })
    }

    pub fn gnss(&self) -> watch::Receiver<Option<GnssSnapshot>> {
        self.gnss_tx.subscribe()
    }

    pub fn attitude(&self) -> watch::Receiver<Option<AttitudeSnapshot>> {
        self.attitude_tx.subscribe()
    }

    pub fn position(&self) -> watch::Receiver<Option<PositionSnapshot>> {
        self.position_tx.subscribe()
    }

    pub fn link(&self) -> watch::Receiver<LinkState> {
        self.link_tx.subscribe()
    }

    /// Index of the last waypoint the autopilot reported reached.
    pub fn reached_waypoint(&self) -> watch::Receiver<Option<u16>> {
        self.reached_tx.subscribe()
    }

    /// Wall clock corrected by the settable offset (GNSS UTC sync).
    pub fn now_utc(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc() + time::Duration::microseconds(*self.clock_offset_us.lock())
    }

    pub fn now_unix_us(&self) -> i64 {
        (self.now_utc().unix_timestamp_nanos() / 1_000) as i64
    }

    pub fn set_clock_offset_us(&self, offset_us: i64) {
        *self.clock_offset_us.lock() = offset_us;
    }

    /// Drive the source until cancelled. Spawn this once per link.
    pub async fn run(self: Arc<Self>, port: Arc<dyn AutopilotPort>, cancel: CancellationToken) {
        let poll = Duration::from_millis(200);
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match tokio::time::timeout(poll, port.recv()).await {
                Ok(Ok((hdr, msg))) => self.handle(&hdr, msg, port.as_ref()).await,
                Ok(Err(e)) => {
                    debug!("telemetry: recv failed: {e:#}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(_) => {} // poll tick
            }
            self.update_link_state(port.as_ref()).await;
        }
    }

    async fn handle(&self, hdr: &MavHeader, msg: MavMessage, port: &dyn AutopilotPort) {
        if hdr.system_id != self.cfg.gnss_system_id
            || hdr.component_id != self.cfg.gnss_component_id
        {
            return;
        }
        match msg {
            MavMessage::HEARTBEAT(_) => {
                *self.last_heartbeat.lock() = Some(Instant::now());
                self.update_link_state(port).await;
            }
            MavMessage::GPS_RAW_INT(d) => self.on_gps_raw(&d),
            MavMessage::ATTITUDE(d) => self.on_attitude(&d),
            MavMessage::GLOBAL_POSITION_INT(d) => self.on_global_position(&d),
            MavMessage::MISSION_ITEM_REACHED(d) => {
                self.reached_tx.send_replace(Some(d.seq));
            }
            MavMessage::SYSTEM_TIME(d) if d.time_unix_usec > 0 => {
                // Sync the payload clock to the autopilot's GNSS-backed UTC.
                let local_us = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000) as i64;
                self.set_clock_offset_us(d.time_unix_usec as i64 - local_us);
            }
            _ => {}
        }
    }

    fn on_gps_raw(&self, d: &GPS_RAW_INT_DATA) {
        self.gnss_tx.send_replace(Some(GnssSnapshot {
            time_usec: d.time_usec,
            fix_type: d.fix_type as u8,
            lat_1e7: d.lat,
            lon_1e7: d.lon,
            alt_mm: d.alt,
            eph: d.eph,
            epv: d.epv,
            vel_cms: d.vel,
            cog_cdeg: d.cog,
            satellites: d.satellites_visible,
        }));
    }

    fn on_attitude(&self, d: &ATTITUDE_DATA) {
        self.attitude_tx.send_replace(Some(AttitudeSnapshot {
            roll: d.roll,
            pitch: d.pitch,
            yaw: d.yaw,
        }));
    }

    fn on_global_position(&self, d: &GLOBAL_POSITION_INT_DATA) {
        self.position_tx.send_replace(Some(PositionSnapshot {
            lat_1e7: d.lat,
            lon_1e7: d.lon,
            alt_mm: d.alt,
            relative_alt_mm: d.relative_alt,
            vx_cms: d.vx,
            vy_cms: d.vy,
            vz_cms: d.vz,
            hdg_cdeg: d.hdg,
        }));
    }

    async fn update_link_state(&self, port: &dyn AutopilotPort) {
        let timeout = Duration::from_millis(self.cfg.device_timeout_ms);
        let age = self.last_heartbeat.lock().map(|t| t.elapsed());
        let new = match age {
            Some(age) if age < timeout / 2 => LinkState::Connected,
            Some(age) if age < timeout => LinkState::Degraded,
            _ => LinkState::Disconnected,
        };
        let old = *self.link_tx.borrow();
        if old == new {
            return;
        }
        info!("telemetry: link {:?} -> {:?}", old, new);
        self.link_tx.send_replace(new);
        if new == LinkState::Disconnected {
            self.request_pending.store(true, Ordering::SeqCst);
        }
        if old == LinkState::Disconnected
            && new == LinkState::Connected
            && self.request_pending.load(Ordering::SeqCst)
        {
            self.send_stream_request(port).await;
        }
    }

    /// Ask the autopilot for all data streams at the configured rate.
    /// One retry 5 ms after a failed send; never more than one in flight.
    async fn send_stream_request(&self, port: &dyn AutopilotPort) {
        if self.request_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }
        let msg = MavMessage::REQUEST_DATA_STREAM(REQUEST_DATA_STREAM_DATA {
            req_message_rate: self.cfg.req_message_rate,
            target_system: self.cfg.gnss_system_id,
            target_component: self.cfg.gnss_component_id,
            req_stream_id: 0, // all streams
            start_stop: 1,
        });
        let mut sent = port.send(msg.clone()).await;
        if let Err(e) = &sent {
            warn!("telemetry: stream request failed: {e:#}, retrying once");
            tokio::time::sleep(Duration::from_millis(5)).await;
            sent = port.send(msg).await;
        }
        match sent {
            Ok(()) => {
                info!(
                    "telemetry: requested all streams at {} Hz",
                    self.cfg.req_message_rate
                );
                self.request_pending.store(false, Ordering::SeqCst);
            }
            Err(e) => warn!("telemetry: stream request retry failed: {e:#}"),
        }
        self.request_in_flight.store(false, Ordering::SeqCst);
    }
}
