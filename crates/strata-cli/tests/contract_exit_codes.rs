#![allow(deprecated)]
//! Exit-code and `--json` contract of the `strata` binary, over local
//! working directories only.

use assert_cmd::Command;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::{tempdir, TempDir};

const SPEC: &str = r#"
apiVersion: strata/v1
kind: Bundle
metadata:
  name: team/churn
  version: "1.4.0"
spec:
  layers:
    - name: code
      files: ["src/**"]
    - name: config
      files: ["config/**"]
  roles:
    default: [code, config]
    serving: [code]
"#;

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let work = dir.path().join("work");
        fs::create_dir_all(work.join("src")).unwrap();
        fs::create_dir_all(work.join("config")).unwrap();
        fs::write(work.join("src/model.py"), "def predict(x):\n    return x\n").unwrap();
        fs::write(work.join("config/serving.yaml"), "replicas: 2\n").unwrap();
        fs::write(work.join("strata.yaml"), SPEC).unwrap();
        fs::create_dir_all(dir.path().join("cache")).unwrap();
        Self { dir }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn strata(&self) -> Command {
        let mut cmd = Command::cargo_bin("strata").expect("strata binary");
        cmd.current_dir(self.path())
            .env_remove("STRATA_REGISTRY_URL")
            .env_remove("STRATA_REGISTRY_REPO")
            .env("STRATA_CACHE_DIR", self.path().join("cache"))
            .env("SOURCE_DATE_EPOCH", "1700000000")
            .env("RUST_LOG", "warn");
        cmd
    }

    fn json(&self, args: &[&str]) -> Value {
        let output = self.strata().args(args).arg("--json").assert().success();
        serde_json::from_slice(&output.get_output().stdout).expect("stdout is JSON")
    }
}

#[test]
fn plan_and_materialize_succeed() {
    let fx = Fixture::new();
    let plan = fx.json(&["plan", "work"]);
    let digest = plan["manifestDigest"].as_str().unwrap().to_string();
    assert!(digest.starts_with("sha256:"));
    assert_eq!(plan["summary"]["inlineFiles"], 2);

    let report = fx.json(&["materialize", "./work", "out"]);
    assert_eq!(report["manifestDigest"], digest.as_str());
    assert_eq!(report["role"], "default");
    assert_eq!(report["counts"]["created"], 2);
    assert_eq!(
        fs::read_to_string(fx.path().join("out/config/serving.yaml")).unwrap(),
        "replicas: 2\n"
    );

    // Second run changes nothing.
    let again = fx.json(&["materialize", "./work", "out"]);
    assert_eq!(again["counts"]["unchanged"], 2);
    assert_eq!(again["counts"]["created"], 0);
}

#[test]
fn materialize_failures_map_to_exit_codes() {
    let fx = Fixture::new();

    fx.strata()
        .args(["materialize", "./missing", "out"])
        .assert()
        .code(1);

    fx.strata()
        .args(["materialize", "./work", "out", "--role", "training"])
        .assert()
        .code(11);

    fx.strata()
        .args(["materialize", "./work#serving", "out"])
        .assert()
        .success();
    // Cached files are read-only hardlinks; edit the way an editor saves.
    let edited = fx.path().join("out/src/model.py");
    fs::remove_file(&edited).unwrap();
    fs::write(&edited, "edited\n").unwrap();
    fx.strata()
        .args(["materialize", "./work#serving", "out"])
        .assert()
        .code(12);
    fx.strata()
        .args(["materialize", "./work#serving", "out", "--overwrite"])
        .assert()
        .success();
}

#[test]
fn registry_references_need_a_registry() {
    let fx = Fixture::new();
    fx.strata()
        .args(["resolve", "team/churn:1.4.0"])
        .assert()
        .code(2);
    fx.strata().args(["resolve", "not a reference"]).assert().code(2);
    fx.strata().args(["push", "work"]).assert().code(2);

    let dry = fx.json(&["push", "work", "--dry-run"]);
    assert_eq!(dry["dryRun"], true);
    assert_eq!(dry["tags"].as_array().unwrap().len(), 2);
}

#[test]
fn export_import_round_trip_and_tamper() {
    let fx = Fixture::new();
    fx.strata()
        .args(["materialize", "./work", "out", "--no-cache"])
        .assert()
        .success();

    let first = fx.json(&["export", "out", "a.tar.gz", "--compression", "gzip"]);
    let second = fx.json(&["export", "out", "b.tar.gz", "--compression", "gzip"]);
    assert_eq!(first["digest"], second["digest"]);

    let imported = fx.json(&["import", "a.tar.gz", "restored"]);
    assert_eq!(imported["verified"], 2);
    assert!(fx.path().join("restored/src/model.py").is_file());

    fx.strata()
        .args(["import", "a.tar.gz", "restored"])
        .assert()
        .code(2);

    fs::write(fx.path().join("out/src/model.py"), "tampered\n").unwrap();
    fx.strata()
        .args(["export", "out", "c.tar"])
        .assert()
        .success();
    fx.strata()
        .args(["import", "c.tar", "tampered"])
        .assert()
        .code(2);
    assert!(!fx.path().join("tampered").exists());

    fx.strata()
        .args(["export", "out", "d.tar", "--compression", "zstd", "--level", "40"])
        .assert()
        .code(2);
}
