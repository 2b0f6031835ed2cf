//! Developer tasks for the AutoDetours provisioning workspace, run as
//! `cargo xtask <task>`.

use std::path::{Path, PathBuf};

use color_eyre::eyre::{eyre, Report};
use color_eyre::Result;
use tracing::info;
use xshell::{cmd, Shell};

/// Tag the provisioning pipeline looks up before building its own copy.
const QEMU_IMAGE_TAG: &str = "autodetours_qemu";
const QEMU_CONTEXT: &str = "crates/setup/qemu";
const SETUP_PACKAGE: &str = "autodetours-setup";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    /// Release build of the provisioning tool.
    Build,
    /// Prebuild the QEMU container image so the first run skips it.
    QemuImage,
    /// Run the integration suite against a fresh debug build.
    TestIntegration,
}

impl Task {
    const ALL: [Task; 3] = [Task::Build, Task::QemuImage, Task::TestIntegration];

    fn name(self) -> &'static str {
        match self {
            Task::Build => "build",
            Task::QemuImage => "qemu-image",
            Task::TestIntegration => "test-integration",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    fn run(self, sh: &Shell) -> Result<()> {
        info!("Running {}", self.name());
        match self {
            Task::Build => build(sh),
            Task::QemuImage => qemu_image(sh),
            Task::TestIntegration => test_integration(sh),
        }
    }
}

fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().without_time().with_target(false))
        .with(ErrorLayer::default())
        .init();
}

/// The workspace root, two levels above this crate's manifest.
fn workspace_root() -> Result<PathBuf> {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map(Path::to_path_buf)
        .ok_or_else(|| eyre!("xtask is not inside a workspace"))
}

fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let sh = Shell::new()?;
    sh.change_dir(workspace_root()?);

    match std::env::args().nth(1).as_deref().map(Task::from_name) {
        Some(Some(task)) => task.run(&sh),
        Some(None) | None => {
            print_help();
            Ok(())
        }
    }
}

fn build(sh: &Shell) -> Result<()> {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            // The provisioning VM needs /dev/kvm.
        } else {
            compile_error!("Unsupported OS - only Linux is supported")
        }
    }
    cmd!(sh, "cargo build -p {SETUP_PACKAGE} --release").run()?;
    Ok(())
}

fn qemu_image(sh: &Shell) -> Result<()> {
    let runtime = sh
        .var("AUTODETOURS_CONTAINER_RUNTIME")
        .unwrap_or_else(|_| "docker".into());
    cmd!(sh, "{runtime} build -t {QEMU_IMAGE_TAG} {QEMU_CONTEXT}").run()?;
    Ok(())
}

fn test_integration(sh: &Shell) -> Result<()> {
    cmd!(sh, "cargo build -p {SETUP_PACKAGE}").run()?;
    let bin = sh.current_dir().join("target/debug").join(SETUP_PACKAGE);
    let _env = sh.push_env("AUTODETOURS_SETUP_PATH", &bin);
    cmd!(sh, "cargo test -p integration-tests").run()?;
    Ok(())
}

fn print_help() {
    println!("Usage: cargo xtask <task>");
    println!("Tasks:");
    for task in Task::ALL {
        println!("  - {}", task.name());
    }
}
