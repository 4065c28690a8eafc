//! Periodic sample loop: a skipping interval fires flights, a single-flight
//! busy flag rejects overlap, and counters plus a 100-slot duration ring
//! make the loop's health observable.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use probe_proto::{DataPageFrame, GatewayLink, LinkFrame, RecordId, RequestError};
use probe_sdr::WorkModeHost;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Inner;

/// Slots kept in the tick-duration ring.
pub const TICK_RING_SLOTS: usize = 100;

/// Shortest allowed tick period.
pub const MIN_TICK_PERIOD: Duration = Duration::from_millis(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickCounters {
    pub completed: u64,
    pub skipped: u64,
    pub errored: u64,
}

#[derive(Default)]
struct DurationRing {
    slots: Vec<Duration>,
    pos: usize,
}

impl DurationRing {
    fn push(&mut self, d: Duration) {
        if self.slots.len() < TICK_RING_SLOTS {
            self.slots.push(d);
        } else {
            self.slots[self.pos] = d;
        }
        self.pos = (self.pos + 1) % TICK_RING_SLOTS;
    }
}

/// Sample-loop shared state: the monotonically increasing sample counter,
/// the single-flight flag, and the outcome counters.
pub struct TickStats {
    counter: AtomicU64,
    completed: AtomicU64,
    skipped: AtomicU64,
    errored: AtomicU64,
    busy: AtomicBool,
    idle: Notify,
    ring: Mutex<DurationRing>,
}

impl TickStats {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            errored: AtomicU64::new(0),
            busy: AtomicBool::new(false),
            idle: Notify::new(),
            ring: Mutex::new(DurationRing::default()),
        }
    }

    /// Claim the single-flight slot; false means a flight is running.
    fn try_begin(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn add_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
    }

    fn next_index(&self) -> u32 {
        self.counter.fetch_add(1, Ordering::SeqCst) as u32
    }

    /// Record a finished flight and release the slot.
    fn end(&self, elapsed: Duration, ok: bool) {
        if ok {
            self.completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.errored.fetch_add(1, Ordering::SeqCst);
        }
        self.ring.lock().push(elapsed);
        self.release();
    }

    fn release(&self) {
        self.busy.store(false, Ordering::SeqCst);
        self.idle.notify_waiters();
    }

    /// Wait until no flight is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if !self.busy.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    /// Claim the slot for a state mutation (record start/stop), waiting out
    /// any running flight. Pair with [`release_slot`](Self::release_slot).
    pub async fn acquire_slot(&self) {
        loop {
            if self.try_begin() {
                return;
            }
            self.wait_idle().await;
        }
    }

    pub fn release_slot(&self) {
        self.release();
    }

    /// Restart sample numbering (record start, mode change).
    pub fn reset_counter(&self) {
        self.counter.store(0, Ordering::SeqCst);
    }

    pub fn counters(&self) -> TickCounters {
        TickCounters {
            completed: self.completed.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            errored: self.errored.load(Ordering::SeqCst),
        }
    }

    /// Copy of the recent flight durations (up to 100 entries).
    pub fn tick_durations(&self) -> Vec<Duration> {
        self.ring.lock().slots.clone()
    }
}

impl Default for TickStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Clamp the configured record rate into a tick period.
pub fn tick_period(record_rate_hz: f32) -> Option<Duration> {
    if !record_rate_hz.is_finite() || record_rate_hz <= 0.0 {
        return None;
    }
    let ms = (1000.0 / record_rate_hz).floor() as u64;
    Some(Duration::from_millis(ms).max(MIN_TICK_PERIOD))
}

/// Arm the periodic loop for the active mode. Ticks that land while a
/// flight is still running are counted as skipped, never queued.
pub(crate) fn spawn_tick_loop(
    inner: Arc<Inner>,
    host: Arc<WorkModeHost>,
    period: Duration,
    ratio: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if !inner.stats.try_begin() {
                inner.stats.add_skipped();
                continue;
            }
            let inner = inner.clone();
            let host = host.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                let result = run_flight(&inner, &host, ratio).await;
                if let Err(e) = &result {
                    debug!("sample tick failed: {e}");
                }
                inner.stats.end(started.elapsed(), result.is_ok());
            });
        }
    })
}

/// One sample flight: compose, persist, and (every `ratio`-th sample)
/// transmit. The page write is synchronous and precedes the only await in
/// the flight, so a cancelled send never leaves a partial page.
async fn run_flight(
    inner: &Inner,
    host: &WorkModeHost,
    ratio: u32,
) -> Result<(), RequestError> {
    let index = inner.stats.next_index();
    let record = inner.current_record.lock().clone();
    let record_id = record
        .as_ref()
        .map(|r| r.writer.id())
        .unwrap_or(RecordId::nil());

    let payload = host.read_data(&inner.telemetry, &inner.calibration, record_id, index);
    let bytes = payload.encode();

    if let Some(record) = &record {
        record.writer.write_page(index, &bytes)?;
    }
    if index % ratio == 0 {
        inner
            .gateway
            .send(LinkFrame::DataItem(DataPageFrame {
                record: record_id,
                page_index: index,
                payload: bytes,
            }))
            .await
            .map_err(|e| RequestError::Failed(format!("gateway send: {e:#}")))?;
    }
    Ok(())
}
