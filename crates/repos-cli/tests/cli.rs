//! End-to-end CLI tests over scratch repositories.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;

fn write(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn repos(root: &Path) -> Command {
    let mut cmd = Command::cargo_bin("repos").unwrap();
    cmd.arg("-C").arg(root).arg("--script");
    cmd
}

/// Two projects with a shared bare target name plus a runnable app.
fn fixture() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    write(&root.join("REPOS.yaml"), "absolute-root: true\n");
    write(
        &root.join("liba/.repos/project.yaml"),
        r#"
name: liba
description: first library
targets:
  lib:
    rule:
      exec:
        out: liba.txt
        command: 'printf liba > "$REPOS_OUTPUT_DIR"/liba.txt'
"#,
    );
    write(
        &root.join("libb/.repos/project.yaml"),
        r#"
name: libb
targets:
  lib:
    rule:
      exec:
        out: libb.txt
        command: 'printf libb > "$REPOS_OUTPUT_DIR"/libb.txt'
"#,
    );
    write(&root.join("app/run.sh"), "#!/bin/sh\necho running \"$@\"\nexit 7\n");
    write(
        &root.join("app/.repos/project.yaml"),
        r#"
name: app
targets:
  tool:
    launch: true
    deps: ['liba:lib']
    rule:
      exec:
        srcs: [run.sh]
        out: bin/tool
        command: 'mkdir -p "$REPOS_OUTPUT_DIR"/bin && install -m 755 run.sh "$REPOS_OUTPUT_DIR"/bin/tool'
"#,
    );
    (dir, root)
}

#[test]
fn lists_projects_and_targets() {
    let (_dir, root) = fixture();
    repos(&root)
        .arg("projects")
        .assert()
        .success()
        .stdout(predicate::str::contains("liba"))
        .stdout(predicate::str::contains("first library"));

    repos(&root)
        .arg("targets")
        .assert()
        .success()
        .stdout(predicate::str::contains("liba:lib"))
        .stdout(predicate::str::contains("libb:lib"))
        .stdout(predicate::str::contains("app:tool"));
}

#[test]
fn targets_alias_and_patterns() {
    let (_dir, root) = fixture();
    repos(&root)
        .arg("t")
        .arg("app:*")
        .assert()
        .success()
        .stdout(predicate::str::contains("app:tool"))
        .stdout(predicate::str::contains("liba:lib").not());
}

#[test]
fn ambiguous_bare_name_suggests_star_pattern() {
    let (_dir, root) = fixture();
    repos(&root)
        .arg("targets")
        .arg("lib")
        .assert()
        .failure()
        .stderr(predicate::str::contains("ambiguous match"))
        .stderr(predicate::str::contains("\"*:lib\""));

    repos(&root)
        .arg("targets")
        .arg("*:lib")
        .assert()
        .success()
        .stdout(predicate::str::contains("liba:lib"))
        .stdout(predicate::str::contains("libb:lib"));
}

#[test]
fn build_then_skip_then_force() {
    let (_dir, root) = fixture();
    repos(&root)
        .args(["build", "app:tool"])
        .assert()
        .success()
        .stdout(predicate::str::contains("OK    app:tool"));

    repos(&root)
        .args(["build", "app:tool"])
        .assert()
        .success()
        .stdout(predicate::str::contains("SKIP  app:tool"));

    repos(&root)
        .args(["build", "--force", "app:tool"])
        .assert()
        .success()
        .stdout(predicate::str::contains("OK    app:tool"));
}

#[test]
fn build_failure_echoes_task_log_unless_quiet() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(&root.join("REPOS.yaml"), "absolute-root: true\n");
    write(
        &root.join("p/.repos/project.yaml"),
        r#"
name: p
targets:
  broken:
    rule:
      exec:
        command: 'echo diagnostics here; exit 3'
"#,
    );

    repos(root)
        .args(["build", "p:broken"])
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::contains("FAIL  p:broken"))
        .stdout(predicate::str::contains("diagnostics here"))
        .stderr(predicate::str::contains("some tasks failed"));

    repos(root)
        .args(["build", "--quiet", "p:broken"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("diagnostics here").not());
}

#[test]
fn check_reports_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(&root.join("REPOS.yaml"), "absolute-root: true\n");
    write(
        &root.join("p/.repos/project.yaml"),
        "name: p\ntargets:\n  a:\n    deps: [b]\n  b:\n    deps: [a]\n",
    );
    repos(root)
        .arg("check")
        .assert()
        .failure()
        .stderr(predicate::str::contains("cyclic dependencies"))
        .stderr(predicate::str::contains("p:a"))
        .stderr(predicate::str::contains("p:b"));

    let (_dir, root) = fixture();
    repos(&root).arg("check").assert().success();
}

#[test]
fn run_propagates_exit_code_and_args() {
    let (_dir, root) = fixture();
    repos(&root)
        .args(["run", "tool", "hello"])
        .assert()
        .code(7)
        .stdout(predicate::str::contains("running hello"));
}

#[test]
fn status_and_log_after_build() {
    let (_dir, root) = fixture();
    repos(&root).args(["build", "liba:lib"]).assert().success();

    repos(&root)
        .args(["status", "liba:lib"])
        .assert()
        .success()
        .stdout(predicate::str::contains("liba:lib"))
        .stdout(predicate::str::contains("last success"))
        .stdout(predicate::str::contains("output: liba.txt"));

    // The exec command writes nothing to stdout, so the log is empty but
    // must exist and stream cleanly.
    repos(&root).args(["log", "liba:lib"]).assert().success();

    repos(&root)
        .args(["status", "*:lib"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("more than one target matches"));
}

#[test]
fn status_unbuilt_target_reports_never() {
    let (_dir, root) = fixture();
    repos(&root)
        .args(["status", "libb:lib"])
        .assert()
        .success()
        .stdout(predicate::str::contains("last run: never"));
}

#[test]
fn missing_root_fails() {
    let dir = tempfile::tempdir().unwrap();
    repos(dir.path())
        .arg("projects")
        .assert()
        .failure()
        .stderr(predicate::str::contains("root file not found"));
}
