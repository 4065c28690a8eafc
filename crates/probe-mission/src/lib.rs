//! Mission executor: interprets a pre-loaded mission sequence, driving the
//! mode switcher and waiting on external events (delays, waypoint
//! arrivals). One long-running task per mission; items advance by dense
//! sequence number; any item error halts with state Error until the
//! operator stops the mission.

use std::sync::Arc;

use parking_lot::Mutex;
use probe_proto::{
    CommandResult, GatewayLink, LinkFrame, MissionState, TagKind, TagValue, WorkMode,
};
use probe_switcher::ModeSwitcher;
use probe_telemetry::TelemetrySource;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One mission command with its parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum MissionCommand {
    SetMode {
        mode: WorkMode,
        frequency_hz: u64,
        record_rate_hz: f32,
        thinning_ratio: u32,
        ref_power: f32,
    },
    StartRecord {
        name: String,
    },
    StopRecord,
    SetRecordTag {
        kind: TagKind,
        name: String,
        value: TagValue,
    },
    Delay {
        ms: u64,
    },
    WaitVehicleWaypoint {
        index: u16,
    },
    /// Anything the executor does not understand: logged and skipped.
    Unknown {
        command: u16,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MissionItem {
    pub seq: u16,
    pub command: MissionCommand,
}

/// Shared observable mission plan. `replace` renumbers items densely from
/// zero; the executor snapshots the plan when a mission starts.
pub struct MissionStore {
    items_tx: watch::Sender<Arc<Vec<MissionItem>>>,
}

impl MissionStore {
    pub fn new() -> Self {
        let (items_tx, _) = watch::channel(Arc::new(Vec::new()));
        Self { items_tx }
    }

    pub fn replace(&self, commands: Vec<MissionCommand>) {
        let items: Vec<MissionItem> = commands
            .into_iter()
            .enumerate()
            .map(|(i, command)| MissionItem {
                seq: i as u16,
                command,
            })
            .collect();
        info!("mission: plan replaced, {} items", items.len());
        self.items_tx.send_replace(Arc::new(items));
    }

    pub fn snapshot(&self) -> Arc<Vec<MissionItem>> {
        self.items_tx.borrow().clone()
    }

    pub fn items_rx(&self) -> watch::Receiver<Arc<Vec<MissionItem>>> {
        self.items_tx.subscribe()
    }
}

impl Default for MissionStore {
    fn default() -> Self {
        Self::new()
    }
}

/// File form of a mission plan (`mission.toml`): an `[[items]]` array.
#[derive(Debug, Deserialize)]
struct MissionFile {
    #[serde(default)]
    items: Vec<MissionItemFile>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum MissionItemFile {
    SetMode {
        mode: WorkMode,
        frequency_hz: u64,
        record_rate_hz: f32,
        thinning_ratio: u32,
        ref_power: f32,
    },
    StartRecord {
        name: String,
    },
    StopRecord,
    SetRecordTag {
        kind: TagKind,
        name: String,
        value: String,
    },
    Delay {
        ms: u64,
    },
    WaitVehicleWaypoint {
        index: u16,
    },
}

/// Load a mission plan from a TOML file.
pub fn load_mission_file(path: &str) -> anyhow::Result<Vec<MissionCommand>> {
    use anyhow::Context;
    let raw = std::fs::read_to_string(path).with_context(|| format!("read mission {path}"))?;
    let file: MissionFile = toml::from_str(&raw).with_context(|| format!("parse mission {path}"))?;
    Ok(file
        .items
        .into_iter()
        .map(|i| match i {
            MissionItemFile::SetMode {
                mode,
                frequency_hz,
                record_rate_hz,
                thinning_ratio,
                ref_power,
            } => MissionCommand::SetMode {
                mode,
                frequency_hz,
                record_rate_hz,
                thinning_ratio,
                ref_power,
            },
            MissionItemFile::StartRecord { name } => MissionCommand::StartRecord { name },
            MissionItemFile::StopRecord => MissionCommand::StopRecord,
            MissionItemFile::SetRecordTag { kind, name, value } => MissionCommand::SetRecordTag {
                kind,
                name,
                value: probe_proto::tag_value_from_str(&value),
            },
            MissionItemFile::Delay { ms } => MissionCommand::Delay { ms },
            MissionItemFile::WaitVehicleWaypoint { index } => {
                MissionCommand::WaitVehicleWaypoint { index }
            }
        })
        .collect())
}

enum ItemError {
    Cancelled,
    Failed(String),
}

struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct ExecInner {
    store: Arc<MissionStore>,
    switcher: ModeSwitcher,
    telemetry: Arc<TelemetrySource>,
    gateway: Arc<dyn GatewayLink>,
    state_tx: watch::Sender<MissionState>,
    run: Mutex<Option<RunHandle>>,
    shutdown: CancellationToken,
}

impl ExecInner {
    fn set_state(&self, state: MissionState) {
        self.state_tx.send_replace(state);
        self.switcher.set_mission_state(state);
    }
}

#[derive(Clone)]
pub struct MissionExecutor {
    inner: Arc<ExecInner>,
}

impl MissionExecutor {
    /// The executor's cancellation tree hangs off the switcher's shutdown
    /// token, so payload shutdown also stops a running mission.
    pub fn new(
        store: Arc<MissionStore>,
        switcher: ModeSwitcher,
        telemetry: Arc<TelemetrySource>,
        gateway: Arc<dyn GatewayLink>,
    ) -> Self {
        let (state_tx, _) = watch::channel(MissionState::Idle);
        let shutdown = switcher.shutdown_token();
        Self {
            inner: Arc::new(ExecInner {
                store,
                switcher,
                telemetry,
                gateway,
                state_tx,
                run: Mutex::new(None),
                shutdown,
            }),
        }
    }

    pub fn state(&self) -> MissionState {
        *self.inner.state_tx.borrow()
    }

    pub fn state_rx(&self) -> watch::Receiver<MissionState> {
        self.inner.state_tx.subscribe()
    }

    /// Start executing at the item with sequence number `index`.
    /// Idempotent while InProgress; denied in Error state until StopMission.
    pub fn start(&self, index: u16) -> CommandResult {
        let inner = &self.inner;
        let mut run = inner.run.lock();
        match self.state() {
            MissionState::InProgress => return CommandResult::Accepted,
            MissionState::Error => {
                warn!("mission: start denied, previous run errored; stop first");
                return CommandResult::Denied;
            }
            MissionState::Idle => {}
        }
        let items = inner.store.snapshot();
        let Some(pos) = items.iter().position(|i| i.seq == index) else {
            warn!("mission: no item with seq {index}");
            return CommandResult::Failed;
        };

        let cancel = inner.shutdown.child_token();
        inner.set_state(MissionState::InProgress);
        info!("mission: starting at item {index}");
        let task = tokio::spawn(run_mission(inner.clone(), items, pos, cancel.clone()));
        *run = Some(RunHandle { cancel, task });
        CommandResult::Accepted
    }

    /// Cancel the running mission, if any, and clear an Error state.
    pub async fn stop(&self) -> CommandResult {
        let handle = self.inner.run.lock().take();
        if let Some(h) = handle {
            h.cancel.cancel();
            let _ = h.task.await;
        }
        self.inner.set_state(MissionState::Idle);
        info!("mission: stopped");
        CommandResult::Accepted
    }
}

async fn run_mission(
    inner: Arc<ExecInner>,
    items: Arc<Vec<MissionItem>>,
    start_pos: usize,
    cancel: CancellationToken,
) {
    let mut pos = start_pos;
    loop {
        let item = &items[pos];
        match execute_item(&inner, item, &cancel).await {
            Ok(()) => {}
            Err(ItemError::Cancelled) => {
                info!("mission: cancelled at item {}", item.seq);
                return;
            }
            Err(ItemError::Failed(e)) => {
                warn!("mission: item {} failed: {e}", item.seq);
                inner.set_state(MissionState::Error);
                return;
            }
        }
        let _ = inner
            .gateway
            .send(LinkFrame::MissionCurrent { seq: item.seq })
            .await;
        let _ = inner
            .gateway
            .send(LinkFrame::MissionReached { seq: item.seq })
            .await;

        let next_seq = item.seq + 1;
        match items.iter().position(|i| i.seq == next_seq) {
            Some(next) => pos = next,
            None => {
                info!("mission: complete");
                inner.set_state(MissionState::Idle);
                return;
            }
        }
    }
}

async fn execute_item(
    inner: &ExecInner,
    item: &MissionItem,
    cancel: &CancellationToken,
) -> Result<(), ItemError> {
    if cancel.is_cancelled() {
        return Err(ItemError::Cancelled);
    }
    match &item.command {
        MissionCommand::SetMode {
            mode,
            frequency_hz,
            record_rate_hz,
            thinning_ratio,
            ref_power,
        } => require_accepted(
            inner
                .switcher
                .set_mode(
                    *mode,
                    *frequency_hz,
                    *record_rate_hz,
                    *thinning_ratio,
                    *ref_power,
                )
                .await,
            "set_mode",
        ),
        MissionCommand::StartRecord { name } => {
            require_accepted(inner.switcher.start_record(name).await, "start_record")
        }
        MissionCommand::StopRecord => {
            require_accepted(inner.switcher.stop_record().await, "stop_record")
        }
        MissionCommand::SetRecordTag { kind, name, value } => require_accepted(
            inner.switcher.set_record_tag(*kind, name, *value).await,
            "set_record_tag",
        ),
        MissionCommand::Delay { ms } => {
            tokio::select! {
                _ = cancel.cancelled() => Err(ItemError::Cancelled),
                _ = tokio::time::sleep(std::time::Duration::from_millis(*ms)) => Ok(()),
            }
        }
        MissionCommand::WaitVehicleWaypoint { index } => {
            let mut reached = inner.telemetry.reached_waypoint();
            loop {
                if *reached.borrow_and_update() == Some(*index) {
                    return Ok(());
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ItemError::Cancelled),
                    changed = reached.changed() => {
                        if changed.is_err() {
                            return Err(ItemError::Failed("telemetry source gone".into()));
                        }
                    }
                }
            }
        }
        MissionCommand::Unknown { command } => {
            warn!("mission: unknown command {command}, skipped");
            Ok(())
        }
    }
}

fn require_accepted(result: CommandResult, what: &str) -> Result<(), ItemError> {
    if result == CommandResult::Accepted {
        Ok(())
    } else {
        Err(ItemError::Failed(format!("{what}: {result:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_renumbers_densely() {
        let store = MissionStore::new();
        store.replace(vec![
            MissionCommand::StopRecord,
            MissionCommand::Delay { ms: 10 },
        ]);
        let items = store.snapshot();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].seq, 0);
        assert_eq!(items[1].seq, 1);
    }

    #[test]
    fn mission_file_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mission.toml");
        std::fs::write(
            &path,
            r#"
[[items]]
command = "set_mode"
mode = "GP"
frequency_hz = 329150000
record_rate_hz = 5.0
thinning_ratio = 1
ref_power = -30.0

[[items]]
command = "start_record"
name = "m0"

[[items]]
command = "delay"
ms = 500

[[items]]
command = "wait_vehicle_waypoint"
index = 3

[[items]]
command = "stop_record"
"#,
        )
        .unwrap();
        let commands = load_mission_file(path.to_str().unwrap()).unwrap();
        assert_eq!(commands.len(), 5);
        assert!(matches!(
            commands[0],
            MissionCommand::SetMode {
                mode: WorkMode::Gp,
                frequency_hz: 329_150_000,
                ..
            }
        ));
        assert_eq!(
            commands[3],
            MissionCommand::WaitVehicleWaypoint { index: 3 }
        );
    }
}
