//! Shared test infrastructure for btrfs-dedup-helper.
//!
//! Provides:
//! - `CmdResult` + `run_cli_case()` — integration test CLI runner
//! - `isolated_env()` — per-case HOME/XDG sandbox so the tracking store
//!   never touches the developer's real state directory

// Not every test binary uses every item; suppress dead-code warnings for the
// shared module.
#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::process::{Command, ExitStatus};
use std::time::{SystemTime, UNIX_EPOCH};

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_bdh") {
        let p = PathBuf::from(path);
        if p.exists() {
            return p;
        }
    }

    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join("bdh"));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!(
            "unable to resolve bdh binary path for integration test (checked CARGO_BIN_EXE_bdh and debug sibling path)"
        ),
    }
}

/// Environment isolation: a throwaway directory serving as HOME and both
/// XDG bases, so config and tracking database land in the sandbox.
pub fn isolated_env() -> (tempfile::TempDir, Vec<(String, String)>) {
    let dir = tempfile::tempdir().expect("create sandbox dir");
    let home = dir.path().to_string_lossy().to_string();
    let envs = vec![
        ("HOME".to_string(), home.clone()),
        ("XDG_DATA_HOME".to_string(), format!("{home}/.local/share")),
        ("XDG_CONFIG_HOME".to_string(), format!("{home}/.config")),
    ];
    (dir, envs)
}

pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    let (sandbox, envs) = isolated_env();
    let result = run_cli_case_with_env(case_name, args, &envs);
    drop(sandbox);
    result
}

pub fn run_cli_case_with_env(
    case_name: &str,
    args: &[&str],
    envs: &[(String, String)],
) -> CmdResult {
    let root = std::env::temp_dir().join("bdh-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let mut command = Command::new(&bin_path);
    command.args(args).env("RUST_BACKTRACE", "1");
    for (key, value) in envs {
        command.env(key, value);
    }
    let output = command.output().expect("execute bdh command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}
