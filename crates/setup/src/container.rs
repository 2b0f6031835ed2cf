//! Container orchestration for the QEMU-in-container VM.
//!
//! Drives the `docker` CLI (any podman-compatible binary works) the same way
//! for image checks, builds, launches and teardown.

use std::process::{Command, Stdio};

use camino::Utf8Path;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::config::{ProvisionConfig, CONTAINER_IMAGE_DIR, QEMU_CONTAINER_NAME, QEMU_IMAGE_TAG};
use crate::errors::{ProvisionError, Result};
use crate::poll::{self, CancelToken, Clock, PollError, PollPolicy};
use crate::qemu::QemuConfig;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageInspect {
    pub id: String,
    #[serde(default)]
    pub repo_tags: Vec<String>,
}

/// A container runtime CLI.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    binary: String,
}

impl ContainerRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    /// Inspect a local image by tag, `None` if there is no such image.
    pub fn inspect_image(&self, tag: &str) -> Result<Option<ImageInspect>> {
        let output = self
            .command()
            .args(["image", "inspect", tag])
            .stderr(Stdio::null())
            .output()
            .map_err(|e| ProvisionError::Container(format!("failed to run {}: {e}", self.binary)))?;
        if !output.status.success() {
            return Ok(None);
        }
        let mut r: Vec<ImageInspect> = serde_json::from_slice(&output.stdout)
            .map_err(|e| ProvisionError::Container(format!("parsing image inspect: {e}")))?;
        Ok(r.pop())
    }

    pub fn build_image(&self, tag: &str, context: &Utf8Path) -> Result<()> {
        let status = self
            .command()
            .args(["build", "-t", tag, context.as_str()])
            .status()
            .map_err(|e| ProvisionError::Container(format!("failed to run {}: {e}", self.binary)))?;
        if !status.success() {
            return Err(ProvisionError::Container(format!(
                "building image {tag} from {context} failed: {status}"
            )));
        }
        Ok(())
    }

    /// Build `tag` from `context` unless an image with that tag exists.
    ///
    /// The check is by tag only; a stale image is never rebuilt.
    #[instrument(skip(self))]
    pub fn ensure_image(&self, tag: &str, context: &Utf8Path) -> Result<()> {
        info!("Building qemu docker image...");
        if let Some(existing) = self.inspect_image(tag)? {
            debug!("Found {tag} as {} {:?}", existing.id, existing.repo_tags);
            info!("Image not rebuilt because it already exists.");
            return Ok(());
        }
        self.build_image(tag, context)
    }

    /// Launch the provisioning VM detached and return the container ID.
    ///
    /// This does not wait for the guest to boot.
    pub fn run_vm(&self, cfg: &ProvisionConfig) -> Result<String> {
        info!("Running qemu container...");
        let args = vm_run_args(cfg);
        debug!("Executing: {} {}", self.binary, args.join(" "));
        let output = self
            .command()
            .args(&args)
            .output()
            .map_err(|e| ProvisionError::Container(format!("failed to run {}: {e}", self.binary)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProvisionError::Container(format!(
                "starting {QEMU_CONTAINER_NAME} failed: {}",
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    /// Whether `name` is still running; a container that no longer exists
    /// (the `--rm` launch removes it on exit) is not.
    pub fn is_running(&self, name: &str) -> Result<bool> {
        let output = self
            .command()
            .args(["container", "inspect", "--format", "{{.State.Running}}", name])
            .stderr(Stdio::null())
            .output()
            .map_err(|e| ProvisionError::Container(format!("failed to run {}: {e}", self.binary)))?;
        if !output.status.success() {
            return Ok(false);
        }
        parse_running_state(&String::from_utf8_lossy(&output.stdout))
    }

    /// Force-remove a container.
    pub fn remove(&self, name: &str) -> Result<()> {
        let status = self
            .command()
            .args(["rm", "-f", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| ProvisionError::Container(format!("failed to run {}: {e}", self.binary)))?;
        if !status.success() {
            return Err(ProvisionError::Container(format!(
                "removing {name} failed: {status}"
            )));
        }
        Ok(())
    }
}

/// Full `run` argument list for the provisioning container.
pub fn vm_run_args(cfg: &ProvisionConfig) -> Vec<String> {
    let volume = format!("{}:{CONTAINER_IMAGE_DIR}:rw", cfg.workers_dir);
    let mut args: Vec<String> = [
        "run",
        "--detach",
        "--rm",
        "--name",
        QEMU_CONTAINER_NAME,
        "--network",
        "host",
        "--privileged",
        "--device",
        "/dev/kvm",
        "-v",
        &volume,
        QEMU_IMAGE_TAG,
    ]
    .into_iter()
    .map(ToOwned::to_owned)
    .collect();
    args.extend(QemuConfig::for_worker0(cfg).args());
    args
}

fn parse_running_state(stdout: &str) -> Result<bool> {
    match stdout.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(ProvisionError::Container(format!(
            "unexpected container state {other:?}"
        ))),
    }
}

/// Block until `is_running` reports the container gone, so nothing reads
/// the disk images while QEMU may still be writing them.
pub fn wait_for_exit(
    name: &str,
    policy: &PollPolicy,
    clock: &dyn Clock,
    cancel: &CancelToken,
    mut is_running: impl FnMut() -> Result<bool>,
) -> Result<()> {
    info!("Waiting for {name} to exit...");
    match poll::poll_until(policy, clock, cancel, |_| is_running().map(|r| !r)) {
        Ok(_) => {
            debug!("{name} has exited");
            Ok(())
        }
        Err(PollError::DeadlineExceeded(d)) => Err(ProvisionError::Container(format!(
            "{name} still running {}s after quit",
            d.as_secs()
        ))),
        Err(PollError::Cancelled) => Err(ProvisionError::Cancelled),
        Err(PollError::Probe(e)) | Err(PollError::Exhausted { last: e, .. }) => Err(e),
    }
}

/// Removes the provisioning container on drop unless disarmed.
///
/// Held from launch until QEMU has been told to quit, so a fatal error in
/// between does not leave the VM running.
#[derive(Debug)]
pub struct ContainerGuard<'a> {
    runtime: &'a ContainerRuntime,
    name: &'static str,
    armed: bool,
}

impl<'a> ContainerGuard<'a> {
    pub fn new(runtime: &'a ContainerRuntime, name: &'static str) -> Self {
        Self {
            runtime,
            name,
            armed: true,
        }
    }

    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("Tearing down container {}...", self.name);
        if let Err(e) = self.runtime.remove(self.name) {
            warn!("Could not remove container {}: {e}", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::config::test_config;
    use crate::poll::testutil::FakeClock;

    #[test]
    fn test_vm_run_args() {
        let cfg = test_config(Utf8Path::new("/srv/autodetours/workers"));
        let args = vm_run_args(&cfg);
        let image_pos = args.iter().position(|a| a == QEMU_IMAGE_TAG).unwrap();
        assert_eq!(
            args[..image_pos].join(" "),
            "run --detach --rm --name autodetours_qemu_gen --network host --privileged \
             --device /dev/kvm -v /srv/autodetours/workers:/image:rw"
        );
        assert_eq!(args[image_pos + 1], "-nographic");
        assert!(args.contains(&"tcp:127.0.0.1:2223,server,nowait".to_string()));
    }

    #[test]
    fn test_parse_image_inspect() {
        let json = r#"[{"Id":"sha256:0123","RepoTags":["autodetours_qemu:latest"],"Size":1}]"#;
        let mut r: Vec<ImageInspect> = serde_json::from_str(json).unwrap();
        let img = r.pop().unwrap();
        assert_eq!(img.id, "sha256:0123");
        assert_eq!(img.repo_tags, vec!["autodetours_qemu:latest".to_string()]);
    }

    #[test]
    fn test_missing_runtime_binary() {
        let rt = ContainerRuntime::new("/nonexistent/docker");
        assert!(matches!(
            rt.inspect_image("autodetours_qemu"),
            Err(ProvisionError::Container(_))
        ));
    }

    #[test]
    fn test_parse_running_state() {
        assert!(parse_running_state("true\n").unwrap());
        assert!(!parse_running_state("false").unwrap());
        assert!(parse_running_state("<no value>").is_err());
    }

    #[test]
    fn test_wait_for_exit_polls_until_gone() {
        let clock = FakeClock::new();
        let mut answers = vec![false, true, true];
        let policy = test_config(Utf8Path::new("/tmp/w")).exit_policy();
        wait_for_exit("vm", &policy, &clock, &CancelToken::new(), || {
            Ok(answers.pop().unwrap_or(false))
        })
        .unwrap();
        assert!(answers.is_empty());
        assert_eq!(clock.sleeps.borrow().len(), 2);
    }

    #[test]
    fn test_wait_for_exit_times_out() {
        let clock = FakeClock::new();
        let policy = PollPolicy::every(std::time::Duration::from_secs(2))
            .with_deadline(Some(std::time::Duration::from_secs(10)));
        let r = wait_for_exit("vm", &policy, &clock, &CancelToken::new(), || Ok(true));
        assert!(matches!(r, Err(ProvisionError::Container(_))), "{r:?}");
        assert_eq!(clock.elapsed(), std::time::Duration::from_secs(10));
    }

    #[test]
    fn test_wait_for_exit_missing_runtime() {
        let rt = ContainerRuntime::new("/nonexistent/docker");
        let clock = FakeClock::new();
        let policy = test_config(Utf8Path::new("/tmp/w")).exit_policy();
        let r = wait_for_exit("vm", &policy, &clock, &CancelToken::new(), || rt.is_running("vm"));
        assert!(matches!(r, Err(ProvisionError::Container(_))), "{r:?}");
        assert!(clock.sleeps.borrow().is_empty());
    }
}
