use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;

struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("failed to create tempdir"),
        }
    }

    fn migrations_dir(&self) -> PathBuf {
        self.dir.path().join("migrations")
    }

    fn write_migration(&self, name: &str, sql: &str) {
        fs::create_dir_all(self.migrations_dir()).expect("failed to create migrations dir");
        fs::write(self.migrations_dir().join(name), sql).expect("failed to write migration");
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("kseekers-migrate").expect("binary should build");
        cmd.current_dir(self.dir.path())
            .env_remove("KSEEKERS_CONFIG_PATH")
            .env("KSEEKERS_DB_PATH", self.dir.path().join("cli.db"))
            .env("KSEEKERS_MIGRATIONS_DIR", self.migrations_dir())
            .env("KSEEKERS_LOG_LEVEL", "warn")
            .args(["--env-file", "absent.env"]);
        cmd
    }
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .expect("failed to read dir")
        .map(|entry| {
            entry
                .expect("failed to read entry")
                .file_name()
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    names.sort();
    names
}

#[test]
fn up_then_status_reports_everything_applied() {
    let ws = Workspace::new();
    ws.write_migration("01_init.sql", "CREATE TABLE users (id INTEGER PRIMARY KEY);");
    ws.write_migration("02_add_col.sql", "ALTER TABLE users ADD COLUMN email TEXT;");

    ws.cmd()
        .arg("up")
        .assert()
        .success()
        .stdout(predicate::str::contains("Applied 2 migration(s)"));

    ws.cmd()
        .arg("up")
        .assert()
        .success()
        .stdout(predicate::str::contains("No pending migrations"));

    let output = ws
        .cmd()
        .args(["status", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let status: serde_json::Value =
        serde_json::from_slice(&output).expect("status output should be JSON");
    assert_eq!(status["applied_count"], 2);
    assert_eq!(status["pending_count"], 0);
    assert_eq!(status["applied"][0]["version"], "01");
}

#[test]
fn text_status_lists_pending_migrations() {
    let ws = Workspace::new();
    ws.write_migration("01_init.sql", "CREATE TABLE users (id INTEGER PRIMARY KEY);");

    ws.cmd()
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Pending migrations: 1"))
        .stdout(predicate::str::contains("01: init"));
}

#[test]
fn up_with_target_stops_early() {
    let ws = Workspace::new();
    ws.write_migration("01_a.sql", "CREATE TABLE a (id INTEGER);");
    ws.write_migration("02_b.sql", "CREATE TABLE b (id INTEGER);");

    ws.cmd()
        .args(["up", "--target", "01"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Applied 1 migration(s)"));
}

#[test]
fn failing_migration_exits_with_one() {
    let ws = Workspace::new();
    ws.write_migration("01_broken.sql", "CREATE TABLE;");

    ws.cmd()
        .arg("up")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("halted at 01"));
}

#[test]
fn down_without_rollback_script_exits_with_one() {
    let ws = Workspace::new();
    ws.write_migration("01_init.sql", "CREATE TABLE users (id INTEGER PRIMARY KEY);");
    ws.cmd().arg("up").assert().success();

    ws.cmd()
        .arg("down")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("rollback script not found"));
}

#[test]
fn down_with_rollback_script_succeeds() {
    let ws = Workspace::new();
    ws.write_migration("01_init.sql", "CREATE TABLE users (id INTEGER PRIMARY KEY);");
    ws.write_migration("R01.sql", "DROP TABLE users;");
    ws.cmd().arg("up").assert().success();

    ws.cmd()
        .arg("down")
        .assert()
        .success()
        .stdout(predicate::str::contains("Rolled back 1 migration(s)"));
}

#[test]
fn down_with_target_keeps_older_migrations() {
    let ws = Workspace::new();
    ws.write_migration("01_init.sql", "CREATE TABLE users (id INTEGER PRIMARY KEY);");
    ws.write_migration("02_roles.sql", "CREATE TABLE roles (id INTEGER PRIMARY KEY);");
    ws.write_migration("R01.sql", "DROP TABLE users;");
    ws.write_migration("R02.sql", "DROP TABLE roles;");
    ws.cmd().arg("up").assert().success();

    ws.cmd()
        .args(["down", "--target", "001"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Rolled back 1 migration(s)"));

    let output = ws
        .cmd()
        .args(["status", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let status: serde_json::Value =
        serde_json::from_slice(&output).expect("status output should be JSON");
    assert_eq!(status["applied_count"], 1);
    assert_eq!(status["applied"][0]["version"], "01");
    assert_eq!(status["pending"][0]["version"], "02");
}

#[test]
fn create_writes_numbered_files() {
    let ws = Workspace::new();

    ws.cmd()
        .args(["create", "--name", "add user roles", "--with-rollback"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created migration 01"));
    ws.cmd()
        .args(["create", "--name", "seed lookups"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created migration 02"));

    assert_eq!(
        file_names(&ws.migrations_dir()),
        ["01_add_user_roles.sql", "02_seed_lookups.sql", "R01.sql"]
    );
}

#[test]
fn create_without_name_exits_with_one() {
    let ws = Workspace::new();
    ws.cmd().arg("create").assert().code(1);
}

#[test]
fn verify_flags_edited_migrations() {
    let ws = Workspace::new();
    ws.write_migration("01_init.sql", "CREATE TABLE users (id INTEGER PRIMARY KEY);");
    ws.cmd().arg("up").assert().success();
    ws.cmd().arg("verify").assert().success();

    ws.write_migration(
        "01_init.sql",
        "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT);",
    );
    ws.cmd()
        .arg("verify")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("changed on disk"));
}

#[test]
fn config_file_is_honoured() {
    let ws = Workspace::new();
    let custom = ws.dir.path().join("sql");
    fs::create_dir_all(&custom).expect("failed to create custom dir");
    fs::write(custom.join("01_init.sql"), "CREATE TABLE t (id INTEGER);")
        .expect("failed to write migration");
    fs::write(
        ws.dir.path().join("kseekers.toml"),
        "[migrations]\ndir = \"sql\"\n",
    )
    .expect("failed to write config");

    ws.cmd()
        .env_remove("KSEEKERS_MIGRATIONS_DIR")
        .arg("up")
        .assert()
        .success()
        .stdout(predicate::str::contains("Applied 1 migration(s)"));
}
