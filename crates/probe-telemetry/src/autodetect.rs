//! Autopilot link autodetect: probe candidate MAVLink connection strings
//! and pick the first that yields a HEARTBEAT.

use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::Result;
use mavlink::common::MavMessage;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub url: String,
    pub hb_seen: bool,
    pub elapsed_ms: u64,
    pub note: String,
}

#[derive(Debug, Clone)]
pub struct AutodetectResult {
    pub chosen: Option<String>,
    pub probes: Vec<ProbeResult>,
}

pub fn default_candidate_urls() -> Vec<String> {
    vec![
        "serial:/dev/serial0:57600".into(),
        "serial:/dev/ttyAMA0:57600".into(),
        "serial:/dev/ttyUSB0:57600".into(),
        "serial:/dev/ttyUSB0:115200".into(),
        "serial:/dev/ttyACM0:115200".into(),
        "udpin:0.0.0.0:14550".into(),
    ]
}

/// Try each candidate in order, waiting up to `heartbeat_timeout` for a
/// heartbeat. Reader threads for silent candidates stay parked on a
/// blocking recv and exit with the process.
pub fn autodetect_link(
    candidates: Vec<String>,
    heartbeat_timeout: Duration,
) -> Result<AutodetectResult> {
    let mut probes = Vec::new();

    for url in candidates {
        let start = Instant::now();
        let mut hb_seen = false;
        let note;

        match mavlink::connect::<MavMessage>(&url) {
            Ok(conn) => {
                let (tx, rx) = mpsc::channel();
                std::thread::spawn(move || {
                    while let Ok((_, msg)) = conn.recv() {
                        if tx.send(msg).is_err() {
                            break;
                        }
                    }
                });

                while start.elapsed() < heartbeat_timeout {
                    match rx.recv_timeout(Duration::from_millis(25)) {
                        Ok(MavMessage::HEARTBEAT(_)) => {
                            hb_seen = true;
                            break;
                        }
                        Ok(_) => {}
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
                note = if hb_seen {
                    "heartbeat".to_string()
                } else {
                    "no heartbeat".to_string()
                };
            }
            Err(e) => {
                note = format!("connect failed: {e}");
                warn!("link autodetect probe failed url={url} err={e}");
            }
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        probes.push(ProbeResult {
            url: url.clone(),
            hb_seen,
            elapsed_ms,
            note,
        });
        if hb_seen {
            info!("link autodetect: OK {url}");
            return Ok(AutodetectResult {
                chosen: Some(url),
                probes,
            });
        }
    }

    Ok(AutodetectResult {
        chosen: None,
        probes,
    })
}
