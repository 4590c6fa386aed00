// neura/tests/cli.rs

use assert_cmd::Command;
use predicates::prelude::*;

fn neura(temp: &tempfile::TempDir) -> Command {
    let mut cmd = Command::cargo_bin("neura").expect("binary builds");
    cmd.env("NEURA_STATE_DIR", temp.path().join("state"))
        .env("UPLOAD_ROOT", temp.path().join("uploads"))
        .env("NEURA_ALLOW_MISSING_OPENAI", "1")
        .env_remove("OPENAI_API_KEY")
        .env_remove("NR_DEFAULT_DB")
        .env_remove("DB_PATH");
    cmd
}

#[test]
fn test_help_lists_pipeline_commands() {
    let temp = tempfile::tempdir().unwrap();
    neura(&temp)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("verify"))
        .stdout(predicate::str::contains("map"))
        .stdout(predicate::str::contains("generate"))
        .stdout(predicate::str::contains("worker"));
}

#[test]
fn test_jobs_list_on_empty_state() {
    let temp = tempfile::tempdir().unwrap();
    neura(&temp).args(["jobs", "list"]).assert().success();
}

#[test]
fn test_connect_registers_sqlite_connection() {
    let temp = tempfile::tempdir().unwrap();
    let db = temp.path().join("data.sqlite3");
    let conn = rusqlite::Connection::open(&db).unwrap();
    conn.execute_batch("CREATE TABLE readings (id INTEGER, amount REAL)").unwrap();
    drop(conn);

    neura(&temp)
        .args(["connect", "local-db", "--db-path"])
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("Connection 'local-db' registered"));
}

#[test]
fn test_schedules_create_requires_known_template() {
    let temp = tempfile::tempdir().unwrap();
    neura(&temp)
        .args([
            "schedules",
            "create",
            "ghost-template",
            "--start-date",
            "2024-01-01",
            "--end-date",
            "2024-12-31",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("template not found"));
}

#[test]
fn test_run_without_template_fails_cleanly() {
    let temp = tempfile::tempdir().unwrap();
    neura(&temp)
        .args([
            "run",
            "ghost-template",
            "--start-date",
            "2024-01-01",
            "--end-date",
            "2024-01-31",
        ])
        .assert()
        .failure();
}
