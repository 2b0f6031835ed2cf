//! Argument parsing; none of these reach the pipeline.

use xshell::{cmd, Shell};

use crate::get_setup_command;

pub fn test_help_lists_flags() {
    let sh = Shell::new().unwrap();
    let bin = get_setup_command().unwrap();
    let out = cmd!(sh, "{bin} --help").read().unwrap();
    for flag in [
        "--dev",
        "--debug",
        "--clean",
        "--workers",
        "--workers-dir",
        "--env-file",
        "--reboot-timeout",
        "--snapshot-timeout",
    ] {
        assert!(out.contains(flag), "{flag} missing from help:\n{out}");
    }
}

pub fn test_workers_required() {
    let sh = Shell::new().unwrap();
    let bin = get_setup_command().unwrap();
    let output = cmd!(sh, "{bin} --dev").ignore_status().output().unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--workers"), "{stderr}");
}

pub fn test_workers_must_be_integer() {
    let sh = Shell::new().unwrap();
    let bin = get_setup_command().unwrap();
    let output = cmd!(sh, "{bin} -w three").ignore_status().output().unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid value 'three'"), "{stderr}");
}
