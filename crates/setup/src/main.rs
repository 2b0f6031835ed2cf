use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::{Report, Result};
use tracing::{debug, info, warn};

mod acquire;
mod config;
mod container;
mod envfile;
mod errors;
mod guest;
mod lock;
mod logging;
mod pipeline;
mod poll;
mod qemu;
mod qmp;
mod ssh;
mod winsvc;
mod workers;

use config::{
    timeout_from_secs, Endpoints, ImageSource, ProvisionConfig, SshCredentials, DEFAULT_HOST,
    DEFAULT_IMAGE_URL, DEFAULT_QEMU_CONTEXT, DEFAULT_QMP_PORT, DEFAULT_REBOOT_TIMEOUT_SECS,
    DEFAULT_SNAPSHOT_TIMEOUT_SECS, DEFAULT_SSH_PASSWORD, DEFAULT_SSH_PORT, DEFAULT_SSH_USER,
    QEMU_CONTAINER_NAME,
};
use container::ContainerRuntime;
use poll::{CancelToken, SystemClock};

const HEADER: &str = r"
    ___         __        ____       __
   /   | __  __/ /_____  / __ \___  / /_____  __  ____________
  / /| |/ / / / __/ __ \/ / / / _ \/ __/ __ \/ / / / ___/ ___/
 / ___ / /_/ / /_/ /_/ / /_/ /  __/ /_/ /_/ / /_/ / /  (__  )
/_/  |_\__,_/\__/\____/_____/\___/\__/\____/\__,_/_/  /____/
==============================================================
";

/// Build the AutoDetours worker images.
///
/// Downloads and converts the Windows 7 base image, boots it once to install
/// and start the tracing agent, snapshots the running VM and copies the
/// result into one qcow2 image per worker. Finally writes the `.env` file
/// used by the rest of the stack.
#[derive(Parser, Debug)]
#[command(version)]
struct Cli {
    /// Set up the environment for development (DEBUG=True)
    #[clap(long)]
    dev: bool,

    /// Verbose logging
    #[clap(long)]
    debug: bool,

    /// Remove everything, including the base image, before starting
    #[clap(short, long)]
    clean: bool,

    /// Number of worker images to generate
    #[clap(short, long, allow_negative_numbers = true)]
    workers: i64,

    /// Directory holding the base and worker images
    #[clap(long, default_value = "workers")]
    workers_dir: Utf8PathBuf,

    /// Local directory uploaded into the guest
    #[clap(long, default_value = "binaries")]
    binaries_dir: Utf8PathBuf,

    /// Build context of the QEMU container image
    #[clap(long, default_value = DEFAULT_QEMU_CONTEXT)]
    qemu_context: Utf8PathBuf,

    /// Environment file to (over)write
    #[clap(long, default_value = ".env")]
    env_file: Utf8PathBuf,

    /// URL of the zipped base VM
    #[clap(long, default_value = DEFAULT_IMAGE_URL)]
    image_url: String,

    /// Address the guest SSH and QMP ports are forwarded to
    #[clap(long, default_value = DEFAULT_HOST)]
    host: String,

    /// Host port forwarded to the guest's SSH server
    #[clap(long, default_value_t = DEFAULT_SSH_PORT)]
    ssh_port: u16,

    /// Host port of QEMU's QMP server
    #[clap(long, default_value_t = DEFAULT_QMP_PORT)]
    qmp_port: u16,

    /// Guest account used for SSH
    #[clap(long, default_value = DEFAULT_SSH_USER)]
    ssh_user: String,

    /// Password of the guest SSH account
    #[clap(long, env = "AUTODETOURS_SSH_PASSWORD", default_value = DEFAULT_SSH_PASSWORD, hide_env_values = true)]
    ssh_password: String,

    /// Guest memory in MiB
    #[clap(long, default_value_t = 1024)]
    memory: u32,

    /// Container runtime CLI
    #[clap(long, default_value = "docker")]
    container_runtime: String,

    /// Seconds to wait for the guest to reboot (0: forever)
    #[clap(long, default_value_t = DEFAULT_REBOOT_TIMEOUT_SECS)]
    reboot_timeout: u64,

    /// Seconds to wait for the snapshot to complete (0: forever)
    #[clap(long, default_value_t = DEFAULT_SNAPSHOT_TIMEOUT_SECS)]
    snapshot_timeout: u64,
}

fn absolute(p: Utf8PathBuf) -> Result<Utf8PathBuf> {
    let abs = std::path::absolute(&p).wrap_err_with(|| format!("resolving {p}"))?;
    Utf8PathBuf::from_path_buf(abs).map_err(|p| eyre!("non-UTF-8 path {}", p.display()))
}

impl Cli {
    fn into_config(self) -> Result<ProvisionConfig> {
        let image = ImageSource {
            url: self.image_url,
            ..Default::default()
        };
        Ok(ProvisionConfig {
            dev: self.dev,
            complete_clean: self.clean,
            workers: self.workers,
            // Written verbatim into the env file, so it must not depend on
            // the consumer's working directory.
            workers_dir: absolute(self.workers_dir)?,
            binaries_dir: self.binaries_dir,
            qemu_context: self.qemu_context,
            env_file: self.env_file,
            image,
            endpoints: Endpoints {
                host: self.host,
                ssh_port: self.ssh_port,
                qmp_port: self.qmp_port,
            },
            credentials: SshCredentials {
                user: self.ssh_user,
                password: self.ssh_password,
            },
            memory_mb: self.memory,
            container_runtime: self.container_runtime,
            reboot_timeout: timeout_from_secs(self.reboot_timeout),
            snapshot_timeout: timeout_from_secs(self.snapshot_timeout),
        })
    }
}

fn main() -> Result<(), Report> {
    println!("{HEADER}");
    let cli = Cli::parse();
    logging::install_tracing(cli.debug);
    color_eyre::install()?;

    let cfg = cli.into_config()?;
    let cancel = CancelToken::new();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let interrupt = cancel.clone();
    let runtime = ContainerRuntime::new(cfg.container_runtime.as_str());
    rt.spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupted, stopping at the next checkpoint (Ctrl-C again to abort)...");
        interrupt.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Aborting.");
            if let Err(e) = runtime.remove(QEMU_CONTAINER_NAME) {
                debug!("Removing {QEMU_CONTAINER_NAME}: {e}");
            }
            std::process::exit(130);
        }
    });

    info!("Starting the installation...");
    let fleet = rt.block_on(tokio::task::spawn_blocking(move || {
        pipeline::run(&cfg, &SystemClock, &cancel)
    }))??;

    info!("{} worker image(s) ready.", fleet.len());
    info!("Done!");
    println!();
    info!("You can now start the project using: docker-compose up -d");
    Ok(())
}
