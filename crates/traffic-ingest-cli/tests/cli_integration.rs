use std::ffi::OsStr;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::TempDir;

fn temp_dir() -> TempDir {
    tempfile::tempdir().unwrap_or_else(|err| panic!("failed to create temp dir: {err}"))
}

fn run_ti<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_ti"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute ti binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_ti(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "ti command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn ingest(db: &Path, entities: &str, start: &str, end: &str, seed: &str) -> Value {
    run_json([
        "--db",
        path_str(db),
        "ingest",
        "--entities",
        entities,
        "--start",
        start,
        "--end",
        end,
        "--seed",
        seed,
    ])
}

#[test]
fn schema_status_then_ensure_schema() {
    let dir = temp_dir();
    let db = dir.path().join("traffic.sqlite3");

    let before = run_json(["--db", path_str(&db), "db", "schema-status"]);
    assert_eq!(as_str(&before, "contract_version"), "cli.v1");
    assert_eq!(as_i64(&before, "current_version"), 0);
    assert_eq!(before["up_to_date"], Value::Bool(false));

    let ensured = run_json(["--db", path_str(&db), "db", "ensure-schema"]);
    assert_eq!(as_i64(&ensured, "before_version"), 0);
    assert_eq!(as_i64(&ensured, "after_version"), 1);
    assert_eq!(ensured["up_to_date"], Value::Bool(true));

    let again = run_json(["--db", path_str(&db), "db", "ensure-schema"]);
    assert_eq!(as_i64(&again, "before_version"), 1);
    assert_eq!(again["applied_versions"], serde_json::json!([]));
}

#[test]
fn ingest_two_entities_over_three_minutes() {
    let dir = temp_dir();
    let db = dir.path().join("traffic.sqlite3");

    let ingested = ingest(&db, "2", "01.01.2024 00:00", "01.01.2024 00:03", "7");
    let summary = &ingested["summary"];
    assert_eq!(as_i64(summary, "entities"), 2);
    assert_eq!(as_i64(summary, "created_entities"), 2);
    assert_eq!(as_i64(summary, "traffic_records"), 6);
    assert_eq!(as_i64(&ingested["params"], "entity_count"), 2);

    let report = run_json(["--db", path_str(&db), "report"]);
    assert_eq!(report["schema_ready"], Value::Bool(true));
    assert_eq!(as_i64(&report, "entity_count"), 2);
    assert_eq!(as_i64(&report, "traffic_count"), 6);

    let entities = report["entities"]
        .as_array()
        .unwrap_or_else(|| panic!("report entities should be an array: {report}"));
    assert_eq!(entities.len(), 2);
    for entity in entities {
        assert_eq!(as_i64(entity, "traffic_records"), 3);
        assert_eq!(as_str(entity, "first_minute"), "2024-01-01T00:00:00Z");
        assert_eq!(as_str(entity, "last_minute"), "2024-01-01T00:02:00Z");
        assert!(!as_str(entity, "first_name").is_empty());
        assert!(!as_str(entity, "address").is_empty());
    }
}

#[test]
fn same_seed_reuses_entities_on_a_later_interval() {
    let dir = temp_dir();
    let db = dir.path().join("traffic.sqlite3");

    ingest(&db, "3", "01.01.2024 00:00", "01.01.2024 00:02", "11");
    let second = ingest(&db, "3", "02.01.2024 00:00", "02.01.2024 00:02", "11");

    assert_eq!(as_i64(&second["summary"], "created_entities"), 0);
    let report = run_json(["--db", path_str(&db), "report"]);
    assert_eq!(as_i64(&report, "entity_count"), 3);
    assert_eq!(as_i64(&report, "traffic_count"), 12);
}

#[test]
fn invalid_parameters_fail_before_touching_storage() {
    let dir = temp_dir();
    let db = dir.path().join("traffic.sqlite3");

    let cases = [
        ("0", "01.01.2024 00:00", "01.01.2024 00:03", "entity count is less than 1"),
        ("2", "01.01.2024 00:05", "01.01.2024 00:03", "start date goes after end date"),
        ("2", "2024-01-01 00:00", "01.01.2024 00:03", "validation error"),
        ("two", "01.01.2024 00:00", "01.01.2024 00:03", "is not a number"),
        ("1000000", "01.01.2024 00:00", "01.01.2024 00:03", "exceeds the limit"),
        ("1", "01.01.0000 00:00", "31.12.9999 23:59", "above the limit"),
    ];

    for (entities, start, end, expected) in cases {
        let output = run_ti([
            "--db",
            path_str(&db),
            "ingest",
            "--entities",
            entities,
            "--start",
            start,
            "--end",
            end,
        ]);
        assert!(!output.status.success(), "ingest {entities} {start} {end} should fail");
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains(expected), "stderr should mention `{expected}`:\n{stderr}");
    }

    assert!(!db.exists(), "validation failures must not create the database");
}

#[test]
fn report_on_fresh_database_leaves_schema_untouched() {
    let dir = temp_dir();
    let db = dir.path().join("traffic.sqlite3");

    let report = run_json(["--db", path_str(&db), "report"]);
    assert_eq!(report["schema_ready"], Value::Bool(false));
    assert_eq!(as_i64(&report, "entity_count"), 0);
    assert_eq!(report["entities"], serde_json::json!([]));

    let status = run_json(["--db", path_str(&db), "db", "schema-status"]);
    assert_eq!(as_i64(&status, "current_version"), 0);
    assert_eq!(status["up_to_date"], Value::Bool(false));
}

#[test]
fn integrity_check_after_ingest_is_clean() {
    let dir = temp_dir();
    let db = dir.path().join("traffic.sqlite3");
    ingest(&db, "4", "15.06.2024 12:00", "15.06.2024 12:30", "3");

    let report = run_json(["--db", path_str(&db), "db", "integrity-check"]);
    assert_eq!(report["quick_check_ok"], Value::Bool(true));
    assert_eq!(report["foreign_key_violations"], serde_json::json!([]));
    assert_eq!(as_i64(&report["schema_status"], "current_version"), 1);
}

#[test]
fn missing_database_directory_is_a_connection_error() {
    let dir = temp_dir();
    let db = dir.path().join("absent").join("traffic.sqlite3");

    let output = run_ti(["--db", path_str(&db), "db", "schema-status"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("connection error"), "unexpected stderr:\n{stderr}");
}
