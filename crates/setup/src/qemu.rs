//! Command line for the QEMU process running inside the provisioning container.

use crate::config::{ProvisionConfig, WorkerLayout, CONTAINER_IMAGE_DIR};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QemuConfig {
    pub memory_mb: u32,
    /// Disk image path as seen inside the container.
    pub disk_path: String,
    /// Loopback address the forwarded ports bind to.
    pub host: String,
    pub ssh_port: u16,
    pub qmp_port: u16,
}

impl QemuConfig {
    /// The VM that boots (and is snapshotted into) worker image 0.
    pub fn for_worker0(cfg: &ProvisionConfig) -> Self {
        Self {
            memory_mb: cfg.memory_mb,
            disk_path: format!(
                "{CONTAINER_IMAGE_DIR}/{}",
                WorkerLayout::worker_file_name(0)
            ),
            host: cfg.endpoints.host.clone(),
            ssh_port: cfg.endpoints.ssh_port,
            qmp_port: cfg.endpoints.qmp_port,
        }
    }

    /// Arguments passed to the container's QEMU entrypoint.
    ///
    /// The guest's port 22 is forwarded to `host:ssh_port`; QMP listens on
    /// `host:qmp_port` without waiting for a client, and the human monitor
    /// is disabled so QMP is the only control channel.
    pub fn args(&self) -> Vec<String> {
        let memory = self.memory_mb.to_string();
        let hostfwd = format!(
            "user,hostfwd=tcp:{}:{}-:22",
            self.host, self.ssh_port
        );
        let qmp = format!("tcp:{}:{},server,nowait", self.host, self.qmp_port);
        [
            "-nographic",
            "-hda",
            &self.disk_path,
            "-m",
            &memory,
            "-enable-kvm",
            "-net",
            "nic",
            "-net",
            &hostfwd,
            "-monitor",
            "none",
            "-qmp",
            &qmp,
        ]
        .into_iter()
        .map(ToOwned::to_owned)
        .collect()
    }
}
