use anyhow::{Context, Result};
use probe_calib::CalibConfig;
use probe_sdr::SdrConfig;
use probe_store::StoreConfig;
use probe_switcher::SwitcherConfig;
use probe_telemetry::TelemetryConfig;
use serde::Deserialize;

fn default_url() -> String {
    "udpin:0.0.0.0:14550".into()
}

fn default_system_id() -> u8 {
    1
}

fn default_component_id() -> u8 {
    // MAV_COMP_ID_USER1: the payload is a component of the vehicle system.
    25
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    /// MAVLink connection string, or "auto" to probe common candidates.
    #[serde(default = "default_url")]
    pub url: String,
    /// Ids the payload itself uses on the link.
    #[serde(default = "default_system_id")]
    pub system_id: u8,
    #[serde(default = "default_component_id")]
    pub component_id: u8,
    /// Per-candidate heartbeat wait when url = "auto".
    pub heartbeat_timeout_ms: Option<u64>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            system_id: default_system_id(),
            component_id: default_component_id(),
            heartbeat_timeout_ms: None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub calibration: CalibConfig,
    #[serde(default)]
    pub sdr: SdrConfig,
    #[serde(default)]
    pub switcher: SwitcherConfig,
    /// Optional mission plan loaded into the mission store at boot.
    pub mission_file: Option<String>,
}

pub fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    toml::from_str(&s).context("parse config toml")
}
