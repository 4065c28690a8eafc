use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mavlink::common::{
    MavAutopilot, MavMessage, MavModeFlag, MavState, MavType, HEARTBEAT_DATA,
};
use tracing::{info, warn};

use probe_calib::CalibrationEngine;
use probe_mission::{load_mission_file, MissionExecutor, MissionStore};
use probe_proto::{AckOp, ClientRequest, GatewayLink, LinkFrame};
use probe_sdr::{calibration_specs, AnalyzerRegistry};
use probe_store::RecordStore;
use probe_switcher::ModeSwitcher;
use probe_telemetry::autodetect::{autodetect_link, default_candidate_urls};
use probe_telemetry::TelemetrySource;

mod config;
mod gateway;
mod modules;

use config::{load_config, Config};

#[derive(Debug, Parser)]
#[command(
    name = "sigprobe",
    version,
    about = "sigprobe - SDR nav-aid inspection payload controller"
)]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate configuration and on-disk folders.
    Doctor,
    /// Run the payload controller.
    Run,
    Records {
        #[command(subcommand)]
        cmd: RecordsCmd,
    },
    Link {
        #[command(subcommand)]
        cmd: LinkCmd,
    },
}

#[derive(Debug, Subcommand)]
enum RecordsCmd {
    /// Print the record store inventory.
    List,
}

#[derive(Debug, Subcommand)]
enum LinkCmd {
    /// Probe candidate MAVLink connection strings for a heartbeat.
    Autodetect,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg),
        Command::Run => run(cfg).await,
        Command::Records { cmd: RecordsCmd::List } => records_list(&cfg),
        Command::Link { cmd: LinkCmd::Autodetect } => link_autodetect(&cfg),
    }
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    probe_store::doctor::check_store(&cfg.store)?;
    probe_calib::doctor::check_calibration(&cfg.calibration)?;

    anyhow::ensure!(!cfg.link.url.is_empty(), "link.url missing");
    for mode in cfg.sdr.analyzers.keys() {
        anyhow::ensure!(
            matches!(mode.as_str(), "llz" | "gp" | "vor"),
            "unknown mode {mode:?} in [sdr.analyzers]"
        );
    }
    if let Some(path) = &cfg.mission_file {
        let items = load_mission_file(path)?;
        anyhow::ensure!(!items.is_empty(), "mission file {path} is empty");
        info!("doctor: mission plan OK ({} items)", items.len());
    }

    info!("doctor: OK");
    Ok(())
}

fn records_list(cfg: &Config) -> Result<()> {
    let store = RecordStore::open(&cfg.store)?;
    println!(
        "records: {} entries, {} bytes",
        store.count(),
        store.size_bytes()
    );
    for id in store.records() {
        match store.entry(id) {
            Ok(e) => println!(
                "{}  {:<16} mode={} freq={} pages={} tags={} dur={:.1}s",
                e.id, e.name, e.mode, e.frequency_hz, e.data_count, e.tag_count, e.duration_sec
            ),
            Err(err) => println!("{id}  <unreadable: {err}>"),
        }
    }
    Ok(())
}

fn link_autodetect(cfg: &Config) -> Result<()> {
    let timeout = Duration::from_millis(cfg.link.heartbeat_timeout_ms.unwrap_or(1500));
    let res = autodetect_link(default_candidate_urls(), timeout)?;
    match &res.chosen {
        Some(url) => println!("CHOSEN: {url}"),
        None => println!("CHOSEN: none"),
    }
    for p in res.probes {
        println!(
            "probe url={} hb={} {}ms note={}",
            p.url, p.hb_seen, p.elapsed_ms, p.note
        );
    }
    Ok(())
}

fn resolve_link_url(cfg: &Config) -> Result<String> {
    if cfg.link.url != "auto" {
        return Ok(cfg.link.url.clone());
    }
    let timeout = Duration::from_millis(cfg.link.heartbeat_timeout_ms.unwrap_or(1500));
    let res = autodetect_link(default_candidate_urls(), timeout)?;
    res.chosen
        .context("link autodetect found no MAVLink heartbeat")
}

async fn run(cfg: Config) -> Result<()> {
    info!("sigprobe v{} starting", env!("CARGO_PKG_VERSION"));

    let order = modules::boot_order(&modules::payload_modules())?;
    info!("module boot order: {}", order.join(" -> "));

    let store = RecordStore::open(&cfg.store).context("open record store")?;
    let calibration = Arc::new(
        CalibrationEngine::open(&cfg.calibration, calibration_specs())
            .context("open calibration engine")?,
    );
    let telemetry = TelemetrySource::new(cfg.telemetry.clone());

    let url = resolve_link_url(&cfg)?;
    let conn: gateway::Conn = mavlink::connect::<MavMessage>(&url)
        .with_context(|| format!("mavlink connect {url}"))?
        .into();
    info!("link up at {url}");
    let link = gateway::start_link(conn, cfg.link.system_id, cfg.link.component_id);

    let switcher = ModeSwitcher::new(
        cfg.switcher.clone(),
        store,
        calibration,
        telemetry.clone(),
        AnalyzerRegistry::with_defaults(),
        cfg.sdr.clone(),
        link.gateway.clone(),
    );

    let mission_store = Arc::new(MissionStore::new());
    if let Some(path) = &cfg.mission_file {
        mission_store.replace(load_mission_file(path)?);
    }
    let executor = MissionExecutor::new(
        mission_store,
        switcher.clone(),
        telemetry.clone(),
        link.gateway.clone(),
    );

    let shutdown = switcher.shutdown_token();
    tokio::spawn(
        telemetry
            .clone()
            .run(link.telemetry_port.clone(), shutdown.child_token()),
    );
    tokio::spawn(dispatch_requests(
        link.requests,
        switcher.clone(),
        executor.clone(),
        link.gateway.clone(),
    ));
    tokio::spawn(heartbeat_loop(
        link.gateway.clone(),
        switcher.clone(),
        shutdown.child_token(),
    ));

    info!("payload up; press Ctrl+C to exit");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    executor.stop().await;
    switcher.shutdown().await;
    Ok(())
}

/// Route remote requests: mission control to the executor, everything else
/// to the switcher. Each switcher request runs in its own task so paginated
/// responses do not serialize behind each other.
async fn dispatch_requests(
    mut requests: tokio::sync::mpsc::UnboundedReceiver<ClientRequest>,
    switcher: ModeSwitcher,
    executor: MissionExecutor,
    gw: Arc<gateway::MavGateway>,
) {
    while let Some(req) = requests.recv().await {
        match req {
            ClientRequest::StartMission { index } => {
                let result = executor.start(index);
                let _ = gw
                    .send(LinkFrame::Ack {
                        op: AckOp::StartMission,
                        result,
                        text: None,
                    })
                    .await;
            }
            ClientRequest::StopMission => {
                let result = executor.stop().await;
                let _ = gw
                    .send(LinkFrame::Ack {
                        op: AckOp::StopMission,
                        result,
                        text: None,
                    })
                    .await;
            }
            other => {
                let switcher = switcher.clone();
                tokio::spawn(async move { switcher.handle_request(other).await });
            }
        }
    }
}

/// 1 Hz: a companion HEARTBEAT plus the extended payload status frame.
async fn heartbeat_loop(
    gw: Arc<gateway::MavGateway>,
    switcher: ModeSwitcher,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        let hb = MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_ONBOARD_CONTROLLER,
            autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
            base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        });
        if let Err(e) = gw.send_message(hb).await {
            warn!("heartbeat send failed: {e:#}");
            continue;
        }
        let status = switcher.status();
        if let Err(e) = gw.send(LinkFrame::Heartbeat(status)).await {
            warn!("status send failed: {e:#}");
        }
    }
}
