use std::path::Path;

use color_eyre::eyre::eyre;
use color_eyre::Result;
use libtest_mimic::{Arguments, Trial};

/// Name of the provisioning container, removed after the suite runs.
pub(crate) const QEMU_CONTAINER_NAME: &str = "autodetours_qemu_gen";

/// Remove a provisioning container a failed run may have left behind.
pub(crate) fn cleanup_provisioning_container() {
    println!("Cleaning up provisioning container...");
    let runtime = std::env::var("AUTODETOURS_CONTAINER_RUNTIME").unwrap_or("docker".into());
    let _ = std::process::Command::new(runtime)
        .args(["rm", "-f", QEMU_CONTAINER_NAME])
        .output();
}

mod tests {
    pub mod cli;
    pub mod offline_run;
}

/// Path of the binary under test, from AUTODETOURS_SETUP_PATH or `$PATH`.
pub(crate) fn get_setup_command() -> Result<String> {
    if let Ok(path) = std::env::var("AUTODETOURS_SETUP_PATH") {
        return Ok(path);
    }
    // Force the user to set this if we're running from the project dir
    if let Some(path) = [
        "target/debug/autodetours-setup",
        "target/release/autodetours-setup",
    ]
    .into_iter()
    .find(|p| Path::new(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set AUTODETOURS_SETUP_PATH={path} to run using this binary"
        ));
    }
    Ok("autodetours-setup".to_owned())
}

fn main() {
    let args = Arguments::from_args();

    let tests = vec![
        Trial::test("cli_help_lists_flags", || {
            tests::cli::test_help_lists_flags();
            Ok(())
        }),
        Trial::test("cli_workers_required", || {
            tests::cli::test_workers_required();
            Ok(())
        }),
        Trial::test("cli_workers_must_be_integer", || {
            tests::cli::test_workers_must_be_integer();
            Ok(())
        }),
        Trial::test("offline_download_failure", || {
            tests::offline_run::test_download_failure();
            Ok(())
        }),
        Trial::test("offline_complete_clean", || {
            tests::offline_run::test_complete_clean();
            Ok(())
        }),
        Trial::test("offline_partial_clean_and_worker0", || {
            tests::offline_run::test_partial_clean_and_worker0();
            Ok(())
        }),
    ];

    let exit_code = libtest_mimic::run(&args, tests);

    cleanup_provisioning_container();

    exit_code.exit();
}
