//! Windows service-manager commands and output parsing.
//!
//! Commands are issued from the guest's Cygwin shell, so every `sc`/`net`
//! invocation is wrapped in `cmd.exe /c "..."`.

use std::fmt;
use std::str::FromStr;

/// `sc config <svc> start= disabled`
pub fn disable_command(service: &str) -> String {
    format!(r#"cmd.exe /c "sc config {service} start= disabled""#)
}

/// `net stop <svc>`
pub fn stop_command(service: &str) -> String {
    format!(r#"cmd.exe /c "net stop {service}""#)
}

/// `sc create <svc> start= auto binPath= <path>`
pub fn create_auto_command(service: &str, bin_path: &str) -> String {
    format!(r#"cmd.exe /c "sc create {service} start= auto binPath= {bin_path}""#)
}

/// `sc query <svc>`
pub fn query_command(service: &str) -> String {
    format!(r#"cmd.exe /c "sc query {service}""#)
}

/// Current state of a Windows service as reported by `sc query`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    StartPending,
    StopPending,
    Running,
    ContinuePending,
    PausePending,
    Paused,
}

impl FromStr for ServiceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let r = match s {
            "STOPPED" => Self::Stopped,
            "START_PENDING" => Self::StartPending,
            "STOP_PENDING" => Self::StopPending,
            "RUNNING" => Self::Running,
            "CONTINUE_PENDING" => Self::ContinuePending,
            "PAUSE_PENDING" => Self::PausePending,
            "PAUSED" => Self::Paused,
            o => return Err(format!("unknown service state: {o}")),
        };
        Ok(r)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "STOPPED",
            Self::StartPending => "START_PENDING",
            Self::StopPending => "STOP_PENDING",
            Self::Running => "RUNNING",
            Self::ContinuePending => "CONTINUE_PENDING",
            Self::PausePending => "PAUSE_PENDING",
            Self::Paused => "PAUSED",
        };
        f.write_str(s)
    }
}

/// Extract the service state from `sc query` output.
///
/// Looks for the first line of the form `STATE : <code>  <NAME>` anywhere
/// in the output (on stock Windows 7 it is the fourth line, after a blank
/// line, `SERVICE_NAME` and `TYPE`). Returns `None` when there is no such
/// line, e.g. because the service does not exist, or the name is unknown.
pub fn parse_service_state(output: &str) -> Option<ServiceState> {
    output.lines().find_map(|line| {
        let (key, value) = line.trim().split_once(':')?;
        if key.trim() != "STATE" {
            return None;
        }
        let mut fields = value.split_whitespace();
        let _code = fields.next()?;
        fields.next()?.parse().ok()
    })
}
