//! Guest configuration, reboot detection and agent verification.
//!
//! Configuration is optimistic: a failing step is logged and the sequence
//! carries on. Whether the guest ended up in the right state is decided
//! once, after the reboot, by [`verify_agent_running`].

use camino::Utf8Path;
use tracing::{debug, error, info, warn};

use crate::config::{AGENT_BINARY, AGENT_SERVICE_NAME, GUEST_STAGING_DIR};
use crate::errors::{ProvisionError, Result};
use crate::poll::{self, CancelToken, Clock, PollError, PollPolicy};
use crate::ssh::{OutputMode, RemoteShell};
use crate::winsvc::{self, ServiceState};

/// Windows update service.
pub const UPDATE_SERVICE: &str = "wuauserv";
/// Windows Defender.
pub const DEFENSE_SERVICE: &str = "windefend";

/// Services forced to disabled/stopped, in order.
pub const HARDENED_SERVICES: [&str; 2] = [UPDATE_SERVICE, DEFENSE_SERVICE];

const ARCHIVER_INSTALLER: &str = "7z-setup.exe /S";
const DOTNET_INSTALLER: &str = "dotnetframeworkinstaller.exe /q";

/// Steps that failed during [`configure_guest`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GuestReport {
    pub failed_steps: Vec<String>,
}

impl GuestReport {
    pub fn is_clean(&self) -> bool {
        self.failed_steps.is_empty()
    }
}

/// Wraps a shell so each step's failure is logged and recorded, never raised.
struct Sequencer<'a, S: RemoteShell + ?Sized> {
    shell: &'a mut S,
    report: GuestReport,
}

impl<S: RemoteShell + ?Sized> Sequencer<'_, S> {
    fn run(&mut self, step: &str, command: &str, mode: OutputMode) {
        match self.shell.execute(command, mode) {
            Ok(out) if out.success() => {}
            Ok(out) => {
                warn!("{step}: command exited with {:?}", out.exit_status);
                if !out.stderr.trim().is_empty() {
                    debug!("{}", out.stderr.trim());
                }
                self.report.failed_steps.push(step.to_owned());
            }
            Err(e) => {
                error!("{step}: {e}");
                self.report.failed_steps.push(step.to_owned());
            }
        }
    }
}

fn in_staging_dir(command: &str) -> String {
    format!("cd {GUEST_STAGING_DIR} && {command}")
}

fn agent_windows_path() -> String {
    let drive_path = GUEST_STAGING_DIR
        .strip_prefix("/cygdrive/")
        .unwrap_or(GUEST_STAGING_DIR);
    let (drive, rest) = drive_path.split_once('/').unwrap_or((drive_path, ""));
    format!(
        "{}:\\{}\\{AGENT_BINARY}",
        drive.to_uppercase(),
        rest.replace('/', "\\")
    )
}

/// Run the fixed guest configuration script.
///
/// 1. Upload the agent tree into the staging directory.
/// 2. For each hardened service: disable its start mode, *then* stop it, so
///    the service manager cannot restart it behind our back.
/// 3. Register the agent as an auto-start service.
/// 4. Install the archiver (waited on) and the .NET runtime (detached; its
///    installer triggers the reboot).
pub fn configure_guest<S: RemoteShell + ?Sized>(
    shell: &mut S,
    binaries_dir: &Utf8Path,
) -> GuestReport {
    let mut seq = Sequencer {
        shell,
        report: GuestReport::default(),
    };

    info!("Copying files into the Windows VM...");
    if let Err(e) = seq.shell.upload_dir(binaries_dir, GUEST_STAGING_DIR) {
        error!("Could not copy files to the VM: {e}");
        seq.report.failed_steps.push("upload".to_owned());
    }

    for svc in HARDENED_SERVICES {
        info!("Disabling Windows service: {svc}");
        seq.run(
            &format!("disable {svc}"),
            &winsvc::disable_command(svc),
            OutputMode::Capture,
        );
        info!("Stopping Windows service: {svc}");
        seq.run(
            &format!("stop {svc}"),
            &winsvc::stop_command(svc),
            OutputMode::Capture,
        );
    }

    info!("Creating AutoDetours service...");
    seq.run(
        "chmod agent",
        &in_staging_dir(&format!("chmod +x {AGENT_BINARY}")),
        OutputMode::Capture,
    );
    seq.run(
        "create agent service",
        &winsvc::create_auto_command(AGENT_SERVICE_NAME, &agent_windows_path()),
        OutputMode::Capture,
    );

    info!("Installing AutoDetours dependencies...");
    seq.run(
        "install 7-Zip",
        &in_staging_dir(&format!(r#"cmd.exe /c "start /wait {ARCHIVER_INSTALLER}""#)),
        OutputMode::Capture,
    );
    seq.run(
        "install .NET framework",
        &in_staging_dir(&format!(r#"cmd.exe /c "start /wait {DOTNET_INSTALLER}""#)),
        OutputMode::Detach,
    );

    seq.report
}

/// Block until the guest stops answering, i.e. it went down for reboot.
pub fn await_reboot<S: RemoteShell + ?Sized>(
    shell: &mut S,
    policy: &PollPolicy,
    clock: &dyn Clock,
    cancel: &CancelToken,
) -> Result<()> {
    info!("Waiting for Windows reboot...");
    let r = poll::poll_until::<std::convert::Infallible>(policy, clock, cancel, |attempt| {
        match shell.probe() {
            Ok(()) => {
                debug!("Guest still up (probe {attempt})");
                Ok(false)
            }
            Err(e) => {
                debug!("Probe failed: {e}");
                Ok(true)
            }
        }
    });
    match r {
        Ok(_) => {
            info!("Windows VM just rebooted!");
            Ok(())
        }
        Err(PollError::DeadlineExceeded(d)) => Err(ProvisionError::RebootTimeout(d)),
        Err(PollError::Cancelled) => Err(ProvisionError::Cancelled),
        Err(PollError::Probe(never)) | Err(PollError::Exhausted { last: never, .. }) => {
            match never {}
        }
    }
}

/// Confirm the agent service reports `RUNNING`.
pub fn verify_agent_running<S: RemoteShell + ?Sized>(shell: &mut S) -> Result<()> {
    info!("Checking if AutoDetours service is running...");
    let out = shell
        .execute(&winsvc::query_command(AGENT_SERVICE_NAME), OutputMode::Capture)
        .map_err(|e| ProvisionError::AgentNotRunning {
            state: format!("query failed: {e}"),
        })?;
    match winsvc::parse_service_state(&out.stdout) {
        Some(ServiceState::Running) => Ok(()),
        Some(state) => Err(ProvisionError::AgentNotRunning {
            state: state.to_string(),
        }),
        None => Err(ProvisionError::AgentNotRunning {
            state: "unknown".to_owned(),
        }),
    }
}
