//! System control: map {Reboot, Shutdown, Restart} onto host OS actions.

use probe_proto::{CommandResult, SystemControlAction};
use tracing::{info, warn};

/// Restart exits the process (the supervisor relaunches it); reboot and
/// shutdown invoke the host facilities. Unsupported hosts report Failed.
pub fn execute(action: SystemControlAction) -> CommandResult {
    if action == SystemControlAction::Restart {
        info!("system control: restart, exiting with code 0");
        std::process::exit(0);
    }
    match host_command(action) {
        Some((program, args)) => {
            info!("system control: {action:?} via {program} {args:?}");
            match std::process::Command::new(program).args(args).spawn() {
                Ok(_) => CommandResult::Accepted,
                Err(e) => {
                    warn!("system control {action:?} failed: {e}");
                    CommandResult::Failed
                }
            }
        }
        None => {
            warn!("system control {action:?} unsupported on this host");
            CommandResult::Failed
        }
    }
}

#[cfg(unix)]
fn host_command(action: SystemControlAction) -> Option<(&'static str, Vec<&'static str>)> {
    match action {
        SystemControlAction::Reboot => Some(("sudo", vec!["systemctl", "reboot"])),
        SystemControlAction::Shutdown => Some(("sudo", vec!["systemctl", "poweroff"])),
        SystemControlAction::Restart => None,
    }
}

#[cfg(windows)]
fn host_command(action: SystemControlAction) -> Option<(&'static str, Vec<&'static str>)> {
    match action {
        SystemControlAction::Reboot => Some(("shutdown", vec!["/r", "/t", "0"])),
        SystemControlAction::Shutdown => Some(("shutdown", vec!["/s", "/t", "0"])),
        SystemControlAction::Restart => None,
    }
}

#[cfg(not(any(unix, windows)))]
fn host_command(_action: SystemControlAction) -> Option<(&'static str, Vec<&'static str>)> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn unix_maps_to_systemctl() {
        assert_eq!(
            host_command(SystemControlAction::Reboot),
            Some(("sudo", vec!["systemctl", "reboot"]))
        );
        assert_eq!(
            host_command(SystemControlAction::Shutdown),
            Some(("sudo", vec!["systemctl", "poweroff"]))
        );
        assert_eq!(host_command(SystemControlAction::Restart), None);
    }
}
