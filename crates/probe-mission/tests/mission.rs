//! Mission executor scenarios against a real switcher, temp-dir store and a
//! channel-fed telemetry source.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mavlink::common::{MavMessage, MISSION_ITEM_REACHED_DATA};
use mavlink::MavHeader;
use probe_calib::{CalibConfig, CalibrationEngine};
use probe_mission::{MissionCommand, MissionExecutor, MissionStore};
use probe_proto::{
    CommandResult, LinkFrame, LoopbackLink, MissionState, TagKind, WorkMode,
};
use probe_sdr::{calibration_specs, AnalyzerRegistry, SdrConfig};
use probe_store::{RecordStore, StoreConfig};
use probe_switcher::{ModeSwitcher, SwitcherConfig};
use probe_telemetry::{AutopilotPort, TelemetryConfig, TelemetrySource};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct ChannelPort {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(MavHeader, MavMessage)>>,
}

#[async_trait]
impl AutopilotPort for ChannelPort {
    async fn recv(&self) -> anyhow::Result<(MavHeader, MavMessage)> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("closed"))
    }

    async fn send(&self, _msg: MavMessage) -> anyhow::Result<()> {
        Ok(())
    }
}

struct Harness {
    executor: MissionExecutor,
    mission: Arc<MissionStore>,
    switcher: ModeSwitcher,
    store: RecordStore,
    ap_tx: mpsc::UnboundedSender<(MavHeader, MavMessage)>,
    rx: mpsc::UnboundedReceiver<LinkFrame>,
    _tmp: tempfile::TempDir,
}

fn harness() -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let store = RecordStore::open(&StoreConfig {
        record_store_folder: tmp.path().join("records").to_string_lossy().into_owned(),
        file_cache_time_ms: 5000,
    })
    .unwrap();
    let calibration = Arc::new(
        CalibrationEngine::open(
            &CalibConfig {
                calibration_folder: tmp.path().join("calibration").to_string_lossy().into_owned(),
            },
            calibration_specs(),
        )
        .unwrap(),
    );
    let telemetry = TelemetrySource::new(TelemetryConfig::default());
    let (ap_tx, ap_rx) = mpsc::unbounded_channel();
    tokio::spawn(telemetry.clone().run(
        Arc::new(ChannelPort {
            rx: tokio::sync::Mutex::new(ap_rx),
        }),
        CancellationToken::new(),
    ));

    let (gateway, rx) = LoopbackLink::new();
    let gateway = Arc::new(gateway);
    let switcher = ModeSwitcher::new(
        SwitcherConfig::default(),
        store.clone(),
        calibration,
        telemetry.clone(),
        AnalyzerRegistry::with_defaults(),
        SdrConfig::default(),
        gateway.clone(),
    );
    let mission = Arc::new(MissionStore::new());
    let executor = MissionExecutor::new(mission.clone(), switcher.clone(), telemetry, gateway);
    Harness {
        executor,
        mission,
        switcher,
        store,
        ap_tx,
        rx,
        _tmp: tmp,
    }
}

fn reached(seq: u16) -> (MavHeader, MavMessage) {
    (
        MavHeader {
            system_id: 1,
            component_id: 1,
            sequence: 0,
        },
        MavMessage::MISSION_ITEM_REACHED(MISSION_ITEM_REACHED_DATA { seq }),
    )
}

fn scenario_plan() -> Vec<MissionCommand> {
    vec![
        MissionCommand::SetMode {
            mode: WorkMode::Gp,
            frequency_hz: 329_150_000,
            record_rate_hz: 5.0,
            thinning_ratio: 1,
            ref_power: -30.0,
        },
        MissionCommand::StartRecord { name: "m0".into() },
        MissionCommand::Delay { ms: 500 },
        MissionCommand::WaitVehicleWaypoint { index: 3 },
        MissionCommand::StopRecord,
    ]
}

#[tokio::test(start_paused = true)]
async fn full_mission_runs_to_completion() {
    let mut h = harness();
    h.mission.replace(scenario_plan());
    let mut state = h.executor.state_rx();
    assert_eq!(*state.borrow(), MissionState::Idle);

    assert_eq!(h.executor.start(0), CommandResult::Accepted);
    state.changed().await.unwrap();
    assert_eq!(*state.borrow(), MissionState::InProgress);

    // Let SetMode + StartRecord + the 500 ms delay run, then report the
    // waypoint the mission is waiting on.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(*state.borrow(), MissionState::InProgress);
    h.ap_tx.send(reached(3)).unwrap();

    state.changed().await.unwrap();
    assert_eq!(*state.borrow(), MissionState::Idle);

    // One record named m0 with at least two pages recorded.
    let ids = h.store.records();
    assert_eq!(ids.len(), 1);
    let entry = h.store.entry(ids[0]).unwrap();
    assert_eq!(entry.name, "m0");
    assert_eq!(entry.mode, WorkMode::Gp);
    assert!(entry.data_count >= 2, "expected >= 2 pages, got {entry:?}");

    // Item notifications were broadcast in order.
    let mut frames = Vec::new();
    while let Ok(f) = h.rx.try_recv() {
        frames.push(f);
    }
    let reached_seqs: Vec<u16> = frames
        .iter()
        .filter_map(|f| match f {
            LinkFrame::MissionReached { seq } => Some(*seq),
            _ => None,
        })
        .collect();
    assert_eq!(reached_seqs, vec![0, 1, 2, 3, 4]);

    // Switcher heartbeat state mirrors the executor.
    assert_eq!(h.switcher.status().mission_state, MissionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn start_is_idempotent_and_bad_index_fails() {
    let h = harness();
    h.mission.replace(vec![MissionCommand::Delay { ms: 10_000 }]);
    assert_eq!(h.executor.start(7), CommandResult::Failed);
    assert_eq!(h.executor.start(0), CommandResult::Accepted);
    assert_eq!(h.executor.start(0), CommandResult::Accepted, "idempotent");
    assert_eq!(h.executor.state(), MissionState::InProgress);
    h.executor.stop().await;
    assert_eq!(h.executor.state(), MissionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_a_waiting_mission() {
    let h = harness();
    h.mission
        .replace(vec![MissionCommand::WaitVehicleWaypoint { index: 9 }]);
    h.executor.start(0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.executor.state(), MissionState::InProgress);
    assert_eq!(h.executor.stop().await, CommandResult::Accepted);
    assert_eq!(h.executor.state(), MissionState::Idle);
    // Stopping again is a no-op.
    assert_eq!(h.executor.stop().await, CommandResult::Accepted);
}

#[tokio::test(start_paused = true)]
async fn failed_item_halts_with_error_state() {
    let h = harness();
    // StartRecord while Idle is denied by the switcher -> mission Error.
    h.mission
        .replace(vec![MissionCommand::StartRecord { name: "x".into() }]);
    let mut state = h.executor.state_rx();
    h.executor.start(0);
    state.changed().await.unwrap(); // InProgress
    state.changed().await.unwrap(); // Error
    assert_eq!(*state.borrow(), MissionState::Error);

    // New start denied until the operator stops the errored mission.
    assert_eq!(h.executor.start(0), CommandResult::Denied);
    h.executor.stop().await;
    assert_eq!(h.executor.state(), MissionState::Idle);
    assert_eq!(h.executor.start(0), CommandResult::Accepted);
    h.executor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn unknown_command_is_skipped() {
    let h = harness();
    h.mission.replace(vec![
        MissionCommand::Unknown { command: 999 },
        MissionCommand::Delay { ms: 50 },
    ]);
    let mut state = h.executor.state_rx();
    h.executor.start(0);
    state.changed().await.unwrap(); // InProgress
    state.changed().await.unwrap(); // Idle after both items
    assert_eq!(*state.borrow(), MissionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn set_record_tag_item_tags_current_record() {
    let h = harness();
    h.mission.replace(vec![
        MissionCommand::SetMode {
            mode: WorkMode::Llz,
            frequency_hz: 109_500_000,
            record_rate_hz: 10.0,
            thinning_ratio: 1,
            ref_power: -40.0,
        },
        MissionCommand::StartRecord { name: "tagged".into() },
        MissionCommand::SetRecordTag {
            kind: TagKind::String8,
            name: "leg".into(),
            value: probe_proto::tag_value_from_str("leg-1"),
        },
        MissionCommand::Delay { ms: 250 },
        MissionCommand::StopRecord,
    ]);
    let mut state = h.executor.state_rx();
    h.executor.start(0);
    state.changed().await.unwrap();
    while *state.borrow() == MissionState::InProgress {
        state.changed().await.unwrap();
    }
    assert_eq!(*state.borrow(), MissionState::Idle);

    let ids = h.store.records();
    let entry = h.store.entry(ids[0]).unwrap();
    assert_eq!(entry.tag_count, 1);
}
