//! End-to-end tests for the `vigil` binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn vigil(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("vigil");
    cmd.current_dir(dir.path())
        .env_remove("VIGIL_CONFIG_PATH")
        .env_remove("VIGIL_DATA_PATH")
        .env_remove("RUST_LOG")
        .arg("--config")
        .arg(dir.path().join("config.toml"))
        .arg("--data-dir")
        .arg(dir.path().join("data"));
    cmd
}

fn write_config(dir: &TempDir, content: &str) {
    fs::write(dir.path().join("config.toml"), content).unwrap();
}

fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Upstream repository on branch `main` with one commit per `(file, message)`.
fn upstream(path: &Path, commits: &[(&str, &str)]) {
    let repo = git2::Repository::init(path).unwrap();
    repo.set_head("refs/heads/main").unwrap();
    let sig = git2::Signature::now("Dev", "dev@example.com").unwrap();
    for (file, message) in commits {
        fs::write(path.join(file), message).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(file)).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .unwrap();
    }
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_vigil_help() {
        let dir = TempDir::new().unwrap();
        vigil(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("build"))
            .stdout(predicate::str::contains("watch"));
    }

    #[test]
    fn test_vigil_version() {
        let dir = TempDir::new().unwrap();
        vigil(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_force_requires_slug() {
        let dir = TempDir::new().unwrap();
        vigil(&dir)
            .args(["build", "--force", "abc123"])
            .assert()
            .failure();
    }
}

// =============================================================================
// Configuration Errors
// =============================================================================

mod configuration {
    use super::*;

    #[test]
    fn test_missing_config_fails() {
        let dir = TempDir::new().unwrap();
        vigil(&dir)
            .arg("projects")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Configuration file not found"));
    }

    #[test]
    fn test_duplicate_slugs_fail_before_any_build() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            r#"
            [[projects]]
            name = "App"
            repository = "/nonexistent/a"
            command = "true"

            [[projects]]
            name = "Other"
            slug = "app"
            repository = "/nonexistent/b"
            command = "true"
            "#,
        );
        vigil(&dir)
            .arg("build")
            .assert()
            .failure()
            .stderr(predicate::str::contains("duplicate"));
        assert!(!dir.path().join("data").join("vigil.db").exists());
    }

    #[test]
    fn test_every_violation_is_reported() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            r#"
            [build]
            timeout_secs = 0

            [[projects]]
            name = "App"
            repository = ""
            command = ""
            "#,
        );
        vigil(&dir)
            .arg("projects")
            .assert()
            .failure()
            .stderr(predicate::str::contains("timeout"))
            .stderr(predicate::str::contains("repository"))
            .stderr(predicate::str::contains("command"));
    }

    #[test]
    fn test_unusable_git_binary_is_reported_with_other_violations() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            r#"
            [git]
            path = "/nonexistent/git"

            [build]
            timeout_secs = 0

            [[projects]]
            name = "App"
            repository = "/nonexistent/a"
            command = "true"
            "#,
        );
        vigil(&dir)
            .arg("build")
            .assert()
            .failure()
            .stderr(predicate::str::contains("git binary"))
            .stderr(predicate::str::contains("timeout_secs"));
    }
}

// =============================================================================
// Listing
// =============================================================================

mod listing {
    use super::*;

    #[test]
    fn test_projects_lists_configured_projects() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            r#"
            [[projects]]
            name = "My App"
            repository = "https://example.com/app.git@develop"
            command = "make test"
            "#,
        );
        vigil(&dir)
            .arg("projects")
            .assert()
            .success()
            .stdout(predicate::str::contains("my-app"))
            .stdout(predicate::str::contains("develop"))
            .stdout(predicate::str::contains("never"));
    }

    #[test]
    fn test_commits_for_unknown_project_fails() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            r#"
            [[projects]]
            name = "App"
            repository = "https://example.com/app.git"
            command = "true"
            "#,
        );
        vigil(&dir)
            .args(["commits", "nope"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }

    #[test]
    fn test_status_json_before_any_build() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            r#"
            [[projects]]
            name = "App"
            repository = "https://example.com/app.git"
            command = "true"
            "#,
        );
        let out = vigil(&dir)
            .args(["status", "--json"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value[0]["slug"], "app");
        assert!(value[0]["latest"].is_null());
    }
}

// =============================================================================
// Building
// =============================================================================

mod building {
    use super::*;

    fn project_config(dir: &TempDir, upstream: &Path, command: &str) {
        write_config(
            dir,
            &format!(
                r#"
                [build]
                timeout_secs = 30

                [[projects]]
                name = "App"
                repository = "{}@main"
                command = "{}"
                url_pattern = "https://example.com/app/commit/%commit%"
                "#,
                upstream.display(),
                command
            ),
        );
    }

    #[test]
    fn test_build_records_every_commit_and_is_idempotent() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let up = dir.path().join("upstream");
        fs::create_dir(&up).unwrap();
        upstream(&up, &[("a.txt", "first"), ("b.txt", "second")]);
        project_config(&dir, &up, "test -f b.txt");

        vigil(&dir)
            .arg("build")
            .assert()
            .success()
            .stdout(predicate::str::contains("2 commit(s)"))
            .stdout(predicate::str::contains("passed"))
            .stdout(predicate::str::contains("failed"));

        let out = vigil(&dir)
            .args(["commits", "app", "--asc", "--json"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let rows: serde_json::Value = serde_json::from_slice(&out).unwrap();
        let rows = rows.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["message"], "first");
        assert_eq!(rows[0]["status"], "failed");
        assert_eq!(rows[1]["message"], "second");
        assert_eq!(rows[1]["status"], "passed");
        assert!(
            rows[1]["url"]
                .as_str()
                .unwrap()
                .starts_with("https://example.com/app/commit/")
        );

        vigil(&dir)
            .arg("build")
            .assert()
            .success()
            .stdout(predicate::str::contains("up to date"));
    }

    #[test]
    fn test_output_prints_build_log() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let up = dir.path().join("upstream");
        fs::create_dir(&up).unwrap();
        upstream(&up, &[("a.txt", "hello from the build")]);
        project_config(&dir, &up, "cat a.txt");

        vigil(&dir).args(["build", "app"]).assert().success();
        vigil(&dir)
            .args(["output", "app"])
            .assert()
            .success()
            .stdout(predicate::str::contains("hello from the build"));
    }

    #[test]
    fn test_unreachable_repository_exits_non_zero() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        project_config(&dir, &dir.path().join("missing"), "true");

        vigil(&dir)
            .arg("build")
            .assert()
            .failure()
            .stdout(predicate::str::contains("unavailable"));
    }

    #[test]
    fn test_forget_removes_history() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let up = dir.path().join("upstream");
        fs::create_dir(&up).unwrap();
        upstream(&up, &[("a.txt", "first")]);
        project_config(&dir, &up, "true");

        vigil(&dir).arg("build").assert().success();
        vigil(&dir)
            .args(["forget", "app"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Removed app"));
        vigil(&dir)
            .args(["commits", "app"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No builds recorded"));
    }
}
