#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};

// ──────────────────── time ────────────────────

pub fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 6, h, m, 0).unwrap()
}

// ──────────────────── tachograph fixtures ────────────────────

pub const DRIVING: u8 = 3;
pub const WORK: u8 = 2;
pub const AVAILABILITY: u8 = 1;
pub const BREAK: u8 = 0;

fn padded(text: &str, len: usize) -> Vec<u8> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.resize(len, 0);
    bytes
}

/// Vehicle unit file with one 6-byte record per `(timestamp, slot, code)`.
pub fn vehicle_unit(
    registration: &str,
    session_open: bool,
    records: &[(DateTime<Utc>, u8, u8)],
) -> Vec<u8> {
    let mut bytes = vec![0x76, 0x03, 1, u8::from(session_open)];
    bytes.extend(padded(registration, 14));
    bytes.extend_from_slice(&u16::try_from(records.len()).unwrap().to_be_bytes());
    for &(ts, slot, code) in records {
        bytes.push(6);
        bytes.extend_from_slice(&u32::try_from(ts.timestamp()).unwrap().to_be_bytes());
        bytes.push(slot);
        bytes.push(code);
    }
    bytes
}

fn driver_card_header(card: &str, layout: u8, base: DateTime<Utc>, count: usize) -> Vec<u8> {
    let mut bytes = vec![0x76, 0x01, layout, 0];
    bytes.extend_from_slice(&u32::try_from(base.timestamp()).unwrap().to_be_bytes());
    bytes.extend(padded(card, 16));
    bytes.extend_from_slice(&u16::try_from(count).unwrap().to_be_bytes());
    bytes
}

/// Driver card with one 2-bit code per minute, most significant pair first.
pub fn driver_card_packed(card: &str, base: DateTime<Utc>, minutes: &[u8]) -> Vec<u8> {
    let mut bytes = driver_card_header(card, 1, base, minutes.len());
    for chunk in minutes.chunks(4) {
        let mut byte = 0u8;
        for (i, code) in chunk.iter().enumerate() {
            byte |= (code & 0b11) << (6 - 2 * i);
        }
        bytes.push(byte);
    }
    bytes
}

/// Driver card as `(code, minutes)` runs.
pub fn driver_card_runs(card: &str, base: DateTime<Utc>, runs: &[(u8, u16)]) -> Vec<u8> {
    let mut bytes = driver_card_header(card, 2, base, runs.len());
    for &(code, minutes) in runs {
        bytes.push(code);
        bytes.extend_from_slice(&minutes.to_be_bytes());
    }
    bytes
}

// ──────────────────── CLI harness ────────────────────

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

impl CmdResult {
    /// The single JSON line the command printed.
    pub fn json(&self) -> serde_json::Value {
        let line = self.stdout.lines().last().unwrap_or_default();
        serde_json::from_str(line).unwrap_or_else(|e| {
            panic!("stdout is not JSON ({e}); see {}", self.log_path.display())
        })
    }
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
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_ffx") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "ffx.exe" } else { "ffx" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve ffx binary path for integration test"),
    }
}

/// Run `ffx` with its database and journal under `data_dir`.
pub fn run_cli_case(case_name: &str, data_dir: &Path, args: &[&str]) -> CmdResult {
    let root = std::env::temp_dir().join("ffx-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let output = Command::new(&bin_path)
        .args(args)
        .env("HOME", data_dir)
        .env("FFX_SQLITE_DB", data_dir.join("fleet.sqlite3"))
        .env("FFX_JSONL_LOG", data_dir.join("events.jsonl"))
        .env("RUST_BACKTRACE", "1")
        .output()
        .expect("execute ffx command");

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
