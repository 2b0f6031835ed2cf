//! Stage sequencing for a provisioning run.
//!
//! lock → clean → acquire → worker 0 → container → connect → configure →
//! reboot → reconnect → verify → snapshot → container exit → replicate →
//! env file. Each stage gates the next and the first error ends the run.

use std::fs;

use tracing::{debug, info, warn};

use crate::acquire::{self, HttpFetcher};
use crate::config::{
    ProvisionConfig, WorkerLayout, QEMU_CONTAINER_NAME, QEMU_IMAGE_TAG, SNAPSHOT_NAME,
};
use crate::container::{self, ContainerGuard, ContainerRuntime};
use crate::envfile;
use crate::errors::{ProvisionError, Result};
use crate::guest;
use crate::lock::RunLock;
use crate::poll::{CancelToken, Clock};
use crate::qmp::{QmpSnapshotter, Snapshotter};
use crate::ssh::{self, ExecError, RemoteShell, SshSession};
use crate::workers::{self, WorkerImage};

fn check_cancelled(cancel: &CancelToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(ProvisionError::Cancelled);
    }
    Ok(())
}

/// Everything between the VM starting and the snapshot being committed.
///
/// `connector` opens one SSH session per call; it is retried under the
/// connect policy, once before configuration and once after the reboot.
pub fn provision_guest<S, C, P>(
    cfg: &ProvisionConfig,
    clock: &dyn Clock,
    cancel: &CancelToken,
    mut connector: C,
    snapshotter: &mut P,
) -> Result<()>
where
    S: RemoteShell,
    C: FnMut() -> Result<S, ExecError>,
    P: Snapshotter + ?Sized,
{
    let policy = cfg.connect_policy();
    let mut shell = ssh::connect_with_retry(&policy, clock, cancel, &mut connector)?;

    let report = guest::configure_guest(&mut shell, &cfg.binaries_dir);
    if !report.is_clean() {
        warn!(
            "{} guest configuration step(s) failed: {}",
            report.failed_steps.len(),
            report.failed_steps.join(", ")
        );
    }

    guest::await_reboot(&mut shell, &cfg.reboot_policy(), clock, cancel)?;
    drop(shell);

    let mut shell = ssh::connect_with_retry(&policy, clock, cancel, &mut connector)?;
    guest::verify_agent_running(&mut shell)?;
    info!("AutoDetours service is running.");
    drop(shell);

    check_cancelled(cancel)?;
    snapshotter.snapshot(SNAPSHOT_NAME, &cfg.snapshot_policy(), clock, cancel)
}

/// Take the run lock, then clean and recreate the workers directory.
///
/// A run that loses the race for the lock touches nothing.
pub fn prepare_workspace(layout: &WorkerLayout, complete_clean: bool) -> Result<RunLock> {
    let lock = RunLock::acquire(&layout.lock_file())?;
    workers::clean(layout, complete_clean)?;
    fs::create_dir_all(layout.dir())?;
    Ok(lock)
}

/// Replicate the snapshotted image and emit the environment file.
pub fn publish(cfg: &ProvisionConfig) -> Result<Vec<WorkerImage>> {
    let fleet = workers::replicate(&cfg.layout(), cfg.workers)?;
    for w in &fleet {
        debug!("Worker {}: {}", w.index, w.path);
    }
    envfile::write_env_file(cfg)?;
    Ok(fleet)
}

/// Run the whole pipeline against the real container runtime, guest and
/// hypervisor.
pub fn run(cfg: &ProvisionConfig, clock: &dyn Clock, cancel: &CancelToken) -> Result<Vec<WorkerImage>> {
    let layout = cfg.layout();
    let _lock = prepare_workspace(&layout, cfg.complete_clean)?;

    check_cancelled(cancel)?;
    let mut fetcher = HttpFetcher::new(cancel.clone());
    let base = acquire::ensure_base_image(&layout, &cfg.image, &mut fetcher)?;
    debug!("Base image {} ({:?})", base.path, base.format);
    check_cancelled(cancel)?;
    workers::prepare_worker0(&layout)?;

    let runtime = ContainerRuntime::new(cfg.container_runtime.as_str());
    runtime.ensure_image(QEMU_IMAGE_TAG, &cfg.qemu_context)?;
    check_cancelled(cancel)?;
    let id = runtime.run_vm(cfg)?;
    let guard = ContainerGuard::new(&runtime, QEMU_CONTAINER_NAME);
    info!("Started container {id}");

    let mut snapshotter = QmpSnapshotter::new(cfg.endpoints.clone());
    provision_guest(
        cfg,
        clock,
        cancel,
        || SshSession::open(&cfg.endpoints, &cfg.credentials),
        &mut snapshotter,
    )?;
    container::wait_for_exit(QEMU_CONTAINER_NAME, &cfg.exit_policy(), clock, cancel, || {
        runtime.is_running(QEMU_CONTAINER_NAME)
    })?;
    guard.disarm();

    publish(cfg)
}
