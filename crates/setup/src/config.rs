//! The immutable configuration for one provisioning run.
//!
//! Built once from the command line in `main` and passed by reference to
//! every stage.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use crate::poll::PollPolicy;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_SSH_PORT: u16 = 2222;
pub const DEFAULT_QMP_PORT: u16 = 2223;
pub const DEFAULT_SSH_USER: &str = "IEUser";
pub const DEFAULT_SSH_PASSWORD: &str = "Passw0rd!";
pub const DEFAULT_IMAGE_URL: &str =
    "https://az792536.vo.msecnd.net/vms/VMBuild_20150916/VirtualBox/IE9/IE9.Win7.VirtualBox.zip";
pub const DEFAULT_OVA_NAME: &str = "IE9 - Win7.ova";
pub const DEFAULT_VMDK_NAME: &str = "IE9 - Win7-disk1.vmdk";
pub const QEMU_IMAGE_TAG: &str = "autodetours_qemu";
pub const QEMU_CONTAINER_NAME: &str = "autodetours_qemu_gen";
/// Directory the workers directory is bind-mounted at inside the container.
pub const CONTAINER_IMAGE_DIR: &str = "/image";
/// Where the agent tree lands in the guest, as seen from its Cygwin shell.
pub const GUEST_STAGING_DIR: &str = "/cygdrive/c/Temp";
pub const AGENT_SERVICE_NAME: &str = "AgentDetours";
pub const AGENT_BINARY: &str = "AutoDetoursAgent.exe";
pub const SNAPSHOT_NAME: &str = "agent";

pub const CONNECT_ATTEMPTS: u32 = 10;
pub const CONNECT_DELAY: Duration = Duration::from_secs(10);
pub const REBOOT_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const SNAPSHOT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_REBOOT_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_SNAPSHOT_TIMEOUT_SECS: u64 = 60 * 60;
pub const EXIT_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// How long QEMU gets to flush its disks and exit after `quit`.
pub const EXIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// The QEMU container build context shipped next to this crate.
pub const DEFAULT_QEMU_CONTEXT: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/qemu");

/// Where the guest's SSH server and QEMU's QMP server are reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub host: String,
    pub ssh_port: u16,
    pub qmp_port: u16,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            ssh_port: DEFAULT_SSH_PORT,
            qmp_port: DEFAULT_QMP_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshCredentials {
    pub user: String,
    pub password: String,
}

/// The vendor archive and the members nested inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSource {
    pub url: String,
    /// OVA (tar) member of the downloaded zip.
    pub ova_name: String,
    /// VMDK member of the OVA.
    pub vmdk_name: String,
}

impl Default for ImageSource {
    fn default() -> Self {
        Self {
            url: DEFAULT_IMAGE_URL.to_owned(),
            ova_name: DEFAULT_OVA_NAME.to_owned(),
            vmdk_name: DEFAULT_VMDK_NAME.to_owned(),
        }
    }
}

impl ImageSource {
    /// File name the archive is saved under: the last URL path segment.
    pub fn archive_name(&self) -> &str {
        let path = self.url.split(['?', '#']).next().unwrap_or(&self.url);
        path.rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or("image.zip")
    }
}

/// Everything a run needs, resolved up front.
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// Write `DEBUG=True` into the environment file.
    pub dev: bool,
    /// Remove the whole workers directory rather than just `win7*` images.
    pub complete_clean: bool,
    /// Requested fleet size; values `<= 0` produce no extra copies.
    pub workers: i64,
    pub workers_dir: Utf8PathBuf,
    /// Local agent tree copied into the guest.
    pub binaries_dir: Utf8PathBuf,
    /// Build context for the QEMU container image.
    pub qemu_context: Utf8PathBuf,
    pub env_file: Utf8PathBuf,
    pub image: ImageSource,
    pub endpoints: Endpoints,
    pub credentials: SshCredentials,
    pub memory_mb: u32,
    pub container_runtime: String,
    pub reboot_timeout: Option<Duration>,
    pub snapshot_timeout: Option<Duration>,
}

impl ProvisionConfig {
    pub fn layout(&self) -> WorkerLayout {
        WorkerLayout::new(&self.workers_dir)
    }

    pub fn connect_policy(&self) -> PollPolicy {
        PollPolicy::every(CONNECT_DELAY).with_max_attempts(CONNECT_ATTEMPTS)
    }

    pub fn reboot_policy(&self) -> PollPolicy {
        PollPolicy::every(REBOOT_POLL_INTERVAL).with_deadline(self.reboot_timeout)
    }

    pub fn snapshot_policy(&self) -> PollPolicy {
        PollPolicy::every(SNAPSHOT_POLL_INTERVAL).with_deadline(self.snapshot_timeout)
    }

    pub fn exit_policy(&self) -> PollPolicy {
        PollPolicy::every(EXIT_POLL_INTERVAL).with_deadline(Some(EXIT_TIMEOUT))
    }
}

/// Convert a `--*-timeout` value in seconds; zero means unbounded.
pub fn timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Paths of the images inside the workers directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLayout {
    dir: Utf8PathBuf,
}

impl WorkerLayout {
    pub const BASE_IMAGE: &'static str = "base.qcow2";
    pub const WORKER_PREFIX: &'static str = "win7";

    pub fn new(dir: impl AsRef<Utf8Path>) -> Self {
        Self {
            dir: dir.as_ref().to_owned(),
        }
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    pub fn base_image(&self) -> Utf8PathBuf {
        self.dir.join(Self::BASE_IMAGE)
    }

    pub fn worker_file_name(index: i64) -> String {
        format!("{}-{index}.qcow2", Self::WORKER_PREFIX)
    }

    pub fn worker_image(&self, index: i64) -> Utf8PathBuf {
        self.dir.join(Self::worker_file_name(index))
    }

    /// Sits next to the workers directory so that cleaning never removes it.
    pub fn lock_file(&self) -> Utf8PathBuf {
        let dir = self.dir.as_str().trim_end_matches('/');
        let dir = if dir.is_empty() { "/" } else { dir };
        Utf8PathBuf::from(format!("{dir}.lock"))
    }
}

#[cfg(test)]
pub(crate) fn test_config(workers_dir: &Utf8Path) -> ProvisionConfig {
    ProvisionConfig {
        dev: false,
        complete_clean: false,
        workers: 1,
        workers_dir: workers_dir.to_owned(),
        binaries_dir: "./binaries".into(),
        qemu_context: "./qemu".into(),
        env_file: workers_dir.join(".env"),
        image: ImageSource::default(),
        endpoints: Endpoints::default(),
        credentials: SshCredentials {
            user: DEFAULT_SSH_USER.to_owned(),
            password: DEFAULT_SSH_PASSWORD.to_owned(),
        },
        memory_mb: 1024,
        container_runtime: "docker".to_owned(),
        reboot_timeout: timeout_from_secs(DEFAULT_REBOOT_TIMEOUT_SECS),
        snapshot_timeout: timeout_from_secs(DEFAULT_SNAPSHOT_TIMEOUT_SECS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_name() {
        let src = ImageSource::default();
        assert_eq!(src.archive_name(), "IE9.Win7.VirtualBox.zip");

        let src = ImageSource {
            url: "http://mirror.local/images/win7.zip?token=abc".into(),
            ..Default::default()
        };
        assert_eq!(src.archive_name(), "win7.zip");
    }

    #[test]
    fn test_worker_layout() {
        let layout = WorkerLayout::new("/srv/workers");
        assert_eq!(layout.base_image(), "/srv/workers/base.qcow2");
        assert_eq!(layout.worker_image(0), "/srv/workers/win7-0.qcow2");
        assert_eq!(layout.worker_image(12), "/srv/workers/win7-12.qcow2");
        assert_eq!(layout.lock_file(), "/srv/workers.lock");
        assert_eq!(WorkerLayout::new("workers/").lock_file(), "workers.lock");
        assert!(!layout.lock_file().starts_with(layout.dir()));
    }

    #[test]
    fn test_default_qemu_context_is_shipped() {
        let context = Utf8Path::new(DEFAULT_QEMU_CONTEXT);
        assert!(context.is_absolute());
        assert!(context.join("Dockerfile").is_file());
    }

    #[test]
    fn test_policies() {
        let cfg = test_config(Utf8Path::new("/tmp/w"));
        let connect = cfg.connect_policy();
        assert_eq!(connect.max_attempts, Some(10));
        assert_eq!(connect.interval, Duration::from_secs(10));
        assert_eq!(cfg.snapshot_policy().interval, Duration::from_secs(5));
        assert_eq!(cfg.exit_policy().deadline, Some(EXIT_TIMEOUT));
        assert_eq!(timeout_from_secs(0), None);
        assert_eq!(timeout_from_secs(3), Some(Duration::from_secs(3)));
    }
}
