use std::process::Command;

/// Container started by the provisioning pipeline.
const QEMU_CONTAINER_NAME: &str = "autodetours_qemu_gen";

fn cleanup_provisioning_container() -> Result<(), Box<dyn std::error::Error>> {
    let runtime = std::env::var("AUTODETOURS_CONTAINER_RUNTIME").unwrap_or("docker".into());
    println!("Cleaning up {QEMU_CONTAINER_NAME} with {runtime}...");

    let list_output = Command::new(&runtime)
        .args([
            "ps",
            "-a",
            "--filter",
            &format!("name=^{QEMU_CONTAINER_NAME}$"),
            "-q",
        ])
        .output()?;

    if !list_output.status.success() {
        eprintln!("Warning: Failed to list containers");
        return Ok(());
    }

    let container_ids = String::from_utf8_lossy(&list_output.stdout);
    let Some(container_id) = container_ids.lines().find(|l| !l.is_empty()) else {
        println!("No provisioning container found");
        return Ok(());
    };

    let rm_output = Command::new(&runtime)
        .args(["rm", "-f", container_id])
        .output()?;
    if !rm_output.status.success() {
        return Err(format!(
            "removing {container_id}: {}",
            String::from_utf8_lossy(&rm_output.stderr)
        )
        .into());
    }
    println!("Removed {container_id}");
    Ok(())
}

fn main() {
    if let Err(e) = cleanup_provisioning_container() {
        eprintln!("Error during cleanup: {}", e);
        std::process::exit(1);
    }
}
