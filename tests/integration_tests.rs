//! CLI end-to-end tests: every command runs against a fresh SQLite database
//! and journal under a temp dir.

mod common;

use std::fs;
use std::path::Path;

use common::{CmdResult, at, run_cli_case, vehicle_unit};
use common::{BREAK, DRIVING, WORK};

fn assert_ok(result: &CmdResult) {
    assert!(
        result.status.success(),
        "expected success; stderr: {}; log: {}",
        result.stderr,
        result.log_path.display()
    );
}

fn assert_exit(result: &CmdResult, code: i32) {
    assert_eq!(
        result.status.code(),
        Some(code),
        "unexpected exit; log: {}",
        result.log_path.display()
    );
}

fn seed_directory(case: &str, dir: &Path) {
    assert_ok(&run_cli_case(case, dir, &["register-driver", "D1"]));
    assert_ok(&run_cli_case(case, dir, &["register-vehicle", "V1"]));
    assert_ok(&run_cli_case(
        case,
        dir,
        &[
            "assign",
            "--driver",
            "D1",
            "--vehicle",
            "V1",
            "--from",
            "2024-05-06T00:00:00Z",
        ],
    ));
}

fn write_unit_file(dir: &Path) -> String {
    let path = dir.join("shift.tgd");
    let bytes = vehicle_unit(
        "AB-123-CD",
        false,
        &[(at(10, 0), 1, DRIVING), (at(10, 30), 1, BREAK), (at(10, 45), 1, WORK)],
    );
    fs::write(&path, bytes).unwrap();
    path.to_string_lossy().into_owned()
}

fn write_reports(dir: &Path, lines: &[&str]) -> String {
    let path = dir.join("reports.jsonl");
    fs::write(&path, lines.join("\n")).unwrap();
    path.to_string_lossy().into_owned()
}

// ──────────────────── smoke ────────────────────

#[test]
fn help_command_prints_usage() {
    let dir = tempfile::tempdir().unwrap();
    let result = run_cli_case("help_command_prints_usage", dir.path(), &["--help"]);
    assert_ok(&result);
    assert!(
        result.stdout.contains("Usage: ffx"),
        "missing help banner; log: {}",
        result.log_path.display()
    );
}

#[test]
fn config_validate_accepts_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let result = run_cli_case("config_validate_accepts_defaults", dir.path(), &["config", "validate"]);
    assert_ok(&result);
    let json = result.json();
    assert_eq!(json["valid"], true);
    assert!(json["hash"].as_str().is_some_and(|h| !h.is_empty()));
}

#[test]
fn config_validate_rejects_broken_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("broken.toml");
    fs::write(&config, "[telemetry\nmax_batch = ").unwrap();
    let config = config.to_string_lossy().into_owned();

    let result = run_cli_case(
        "config_validate_rejects_broken_file",
        dir.path(),
        &["--config", &config, "config", "validate"],
    );
    assert_exit(&result, 1);
    assert_eq!(result.json()["valid"], false);
}

// ──────────────────── upload ────────────────────

#[test]
fn upload_then_reupload_skips_everything() {
    let case = "upload_then_reupload_skips_everything";
    let dir = tempfile::tempdir().unwrap();
    seed_directory(case, dir.path());
    let file = write_unit_file(dir.path());

    let first = run_cli_case(case, dir.path(), &["upload", &file, "--driver", "D1"]);
    assert_ok(&first);
    let response = &first.json()["response"];
    assert_eq!(response["success"], true);
    assert_eq!(response["activities_created"], 2);
    assert_eq!(response["parse_result"]["vehicle_registration"], "AB-123-CD");

    let second = run_cli_case(case, dir.path(), &["upload", &file, "--driver", "D1"]);
    assert_ok(&second);
    let response = &second.json()["response"];
    assert_eq!(response["activities_created"], 0);
    assert_eq!(response["activities_skipped"], 2);

    let listed = run_cli_case(case, dir.path(), &["activities", "--driver", "D1"]);
    assert_ok(&listed);
    let json = listed.json();
    assert_eq!(json["count"], 2);
    assert_eq!(json["activities"][0]["state"], "BREAK");
}

#[test]
fn upload_for_unknown_driver_is_user_error() {
    let case = "upload_for_unknown_driver_is_user_error";
    let dir = tempfile::tempdir().unwrap();
    let file = write_unit_file(dir.path());

    let result = run_cli_case(case, dir.path(), &["upload", &file, "--driver", "GHOST"]);
    assert_exit(&result, 1);
    let response = &result.json()["response"];
    assert_eq!(response["success"], false);
    assert!(response["errors"][0].as_str().unwrap().contains("FFX-2002"));
}

#[test]
fn upload_with_unsupported_extension_is_rejected() {
    let case = "upload_with_unsupported_extension_is_rejected";
    let dir = tempfile::tempdir().unwrap();
    seed_directory(case, dir.path());
    let path = dir.path().join("notes.txt");
    fs::write(&path, b"hello").unwrap();
    let path = path.to_string_lossy().into_owned();

    let result = run_cli_case(case, dir.path(), &["upload", &path, "--driver", "D1"]);
    assert_exit(&result, 1);
    assert_eq!(result.json()["response"]["activities_created"], 0);
}

// ──────────────────── telemetry ────────────────────

#[test]
fn ingest_reports_rejections_per_line() {
    let case = "ingest_reports_rejections_per_line";
    let dir = tempfile::tempdir().unwrap();
    seed_directory(case, dir.path());
    let reports = write_reports(
        dir.path(),
        &[
            r#"{"vehicle_id":"V1","timestamp":"2024-05-06T10:00:00Z","latitude":0.0,"longitude":0.0,"speed_kmh":60.0}"#,
            r#"{"vehicle_id":"V1","timestamp":"2024-05-06T10:01:00Z","latitude":91.0,"longitude":0.0}"#,
            r#"{"vehicle_id":"V404","timestamp":"2024-05-06T10:02:00Z","latitude":0.0,"longitude":0.0}"#,
            r#"{"vehicle_id":"V1","timestamp":"yesterday","latitude":0.0,"longitude":0.0}"#,
            "not json",
        ],
    );

    let result = run_cli_case(case, dir.path(), &["ingest", &reports]);
    assert_ok(&result);
    let json = result.json();
    assert_eq!(json["accepted"], 1);
    assert_eq!(json["rejected"], 4);
    let codes: Vec<&str> = json["errors"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["code"].as_str().unwrap())
        .collect();
    for expected in ["FFX-5002", "FFX-5001", "FFX-5005", "FFX-2101"] {
        assert!(codes.contains(&expected), "missing {expected} in {codes:?}");
    }
}

#[test]
fn ping_brings_vehicle_online() {
    let case = "ping_brings_vehicle_online";
    let dir = tempfile::tempdir().unwrap();
    seed_directory(case, dir.path());

    let before = run_cli_case(case, dir.path(), &["status", "V1"]);
    assert_ok(&before);
    assert_eq!(before.json()["status"]["is_online"], false);
    assert!(before.json()["status"]["last_seen"].is_null());

    let ping = run_cli_case(case, dir.path(), &["ping", "V1", "--lat", "48.2", "--lon", "-16.4"]);
    assert_ok(&ping);

    let after = run_cli_case(case, dir.path(), &["status", "V1"]);
    assert_ok(&after);
    let status = &after.json()["status"];
    assert_eq!(status["is_online"], true);
    assert_eq!(status["current_position"]["longitude"], -16.4);

    let fleet = run_cli_case(case, dir.path(), &["fleet"]);
    assert_ok(&fleet);
    let counts = &fleet.json()["counts"];
    assert_eq!(counts["online"], 1);
    assert_eq!(counts["total"], 1);
}

// ──────────────────── fusion ────────────────────

#[test]
fn fuse_joins_uploaded_activity_with_ingested_positions() {
    let case = "fuse_joins_uploaded_activity_with_ingested_positions";
    let dir = tempfile::tempdir().unwrap();
    seed_directory(case, dir.path());
    let file = write_unit_file(dir.path());
    assert_ok(&run_cli_case(case, dir.path(), &["upload", &file, "--driver", "D1"]));

    let reports = write_reports(
        dir.path(),
        &[
            r#"{"vehicle_id":"V1","timestamp":"2024-05-06T10:00:00Z","latitude":0.0,"longitude":0.0}"#,
            r#"{"vehicle_id":"V1","timestamp":"2024-05-06T10:10:00Z","latitude":0.1,"longitude":0.0}"#,
            r#"{"vehicle_id":"V1","timestamp":"2024-05-06T10:20:00Z","latitude":0.2,"longitude":0.0}"#,
        ],
    );
    assert_ok(&run_cli_case(case, dir.path(), &["ingest", &reports]));

    let result = run_cli_case(
        case,
        dir.path(),
        &[
            "fuse",
            "--driver",
            "D1",
            "--start",
            "2024-05-06T10:00:00Z",
            "--end",
            "2024-05-06T11:00:00Z",
        ],
    );
    assert_ok(&result);
    let report = &result.json()["report"];
    let activities = report["activities"].as_array().unwrap();
    assert_eq!(activities.len(), 2);

    let driving = activities
        .iter()
        .find(|a| a["interval"]["state"] == "DRIVING")
        .unwrap();
    assert_eq!(driving["positions"].as_array().unwrap().len(), 3);
    let distance = driving["distance_travelled_m"].as_f64().unwrap();
    assert!((distance - 22_239.0).abs() < 5.0, "distance {distance}");
    assert_eq!(report["summary"]["total_driving_minutes"], 30);
    assert_eq!(report["summary"]["total_rest_minutes"], 15);
}

#[test]
fn fuse_with_inverted_range_is_user_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = run_cli_case(
        "fuse_with_inverted_range_is_user_error",
        dir.path(),
        &[
            "fuse",
            "--driver",
            "D1",
            "--start",
            "2024-05-06T11:00:00Z",
            "--end",
            "2024-05-06T10:00:00Z",
        ],
    );
    assert_exit(&result, 1);
}

#[test]
fn commands_append_to_the_journal() {
    let case = "commands_append_to_the_journal";
    let dir = tempfile::tempdir().unwrap();
    seed_directory(case, dir.path());
    let file = write_unit_file(dir.path());
    assert_ok(&run_cli_case(case, dir.path(), &["upload", &file, "--driver", "D1"]));

    let journal = fs::read_to_string(dir.path().join("events.jsonl")).unwrap();
    assert!(journal.lines().count() >= 2);
    assert!(journal.contains("upload_processed"), "journal: {journal}");
}
