// CLI integration tests for the load / merge / dump flows.
use std::path::Path;
use std::process::Command;

use serde_json::Value;

fn cmd() -> Command {
    let exe = env!("CARGO_BIN_EXE_countmerge");
    Command::new(exe)
}

fn parse_json(value: &str) -> Value {
    serde_json::from_str(value).expect("valid json")
}

fn load_store(dir: &Path, name: &str, json: &str) -> String {
    let store = dir.join(name).to_str().expect("utf8 path").to_string();
    let file = dir.join(format!("{name}.json"));
    std::fs::write(&file, json).expect("write json");

    let load = cmd()
        .args(["load", &store, file.to_str().unwrap()])
        .output()
        .expect("load");
    assert!(load.status.success(), "load failed: {load:?}");
    store
}

fn dump_store(store: &str) -> Value {
    let dump = cmd().args(["dump", store]).output().expect("dump");
    assert!(dump.status.success(), "dump failed: {dump:?}");
    parse_json(std::str::from_utf8(&dump.stdout).expect("utf8"))
}

#[test]
fn load_merge_dump_flow() {
    let temp = tempfile::tempdir().expect("tempdir");
    let a = load_store(
        temp.path(),
        "a.store",
        r#"{"ENST1": {"exon": {"5": 10}}, "geneX": 3}"#,
    );
    let b = load_store(
        temp.path(),
        "b.store",
        r#"{"ENST1": {"exon": {"5": 7, "3": 2}}, "geneY": {"counts": [1, 1, 1]}}"#,
    );
    let out = temp.path().join("merged.store");

    let merge = cmd()
        .args(["merge", "-i", &a, &b, "-o", out.to_str().unwrap()])
        .output()
        .expect("merge");
    assert!(merge.status.success(), "merge failed: {merge:?}");

    let summary = parse_json(std::str::from_utf8(&merge.stdout).expect("utf8"));
    let merged = summary.get("merge").expect("merge envelope");
    assert_eq!(merged["inputs"], 2);
    assert_eq!(merged["keys_seen"], 4);
    assert_eq!(merged["keys_merged"], 1);
    assert_eq!(merged["keys_copied"], 3);
    assert_eq!(merged["anomalies"], 0);

    let dumped = dump_store(out.to_str().unwrap());
    assert_eq!(
        dumped,
        parse_json(
            r#"{
                "ENST1": {"exon": {"5": 17, "3": 2}},
                "geneX": 3,
                "geneY": {"counts": [1, 1, 1]}
            }"#
        )
    );
}

#[test]
fn merge_refuses_existing_output_without_force() {
    let temp = tempfile::tempdir().expect("tempdir");
    let a = load_store(temp.path(), "a.store", r#"{"geneX": 1}"#);
    let out = temp.path().join("merged.store");
    std::fs::write(&out, b"stale").expect("write stale file");

    let merge = cmd()
        .args(["merge", "-i", &a, "-o", out.to_str().unwrap()])
        .output()
        .expect("merge");
    assert_eq!(merge.status.code().unwrap(), 4);
    let err = parse_json(std::str::from_utf8(&merge.stderr).expect("utf8"));
    assert_eq!(err["error"]["kind"], "AlreadyExists");

    let forced = cmd()
        .args(["merge", "-i", &a, "-o", out.to_str().unwrap(), "--force"])
        .output()
        .expect("merge --force");
    assert!(forced.status.success(), "forced merge failed: {forced:?}");
    assert_eq!(dump_store(out.to_str().unwrap()), parse_json(r#"{"geneX": 1}"#));
}

#[test]
fn missing_input_store_exit_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let out = temp.path().join("merged.store");

    let merge = cmd()
        .args([
            "merge",
            "-i",
            temp.path().join("absent.store").to_str().unwrap(),
            "-o",
            out.to_str().unwrap(),
        ])
        .output()
        .expect("merge");
    assert_eq!(merge.status.code().unwrap(), 3);
}

#[test]
fn usage_exit_code_when_output_missing() {
    let temp = tempfile::tempdir().expect("tempdir");
    let a = load_store(temp.path(), "a.store", r#"{"geneX": 1}"#);

    let merge = cmd().args(["merge", "-i", &a]).output().expect("merge");
    assert_eq!(merge.status.code().unwrap(), 2);
}

#[test]
fn get_prints_one_record_and_misses_with_exit_3() {
    let temp = tempfile::tempdir().expect("tempdir");
    let a = load_store(temp.path(), "a.store", r#"{"ENST1": {"exon": {"5": 10}}}"#);

    let get = cmd().args(["get", &a, "ENST1"]).output().expect("get");
    assert!(get.status.success());
    assert_eq!(
        parse_json(std::str::from_utf8(&get.stdout).expect("utf8")),
        parse_json(r#"{"exon": {"5": 10}}"#)
    );

    let missing = cmd().args(["get", &a, "ENST2"]).output().expect("get");
    assert_eq!(missing.status.code().unwrap(), 3);
}

#[test]
fn anomalies_notice_on_stderr_and_run_continues() {
    let temp = tempfile::tempdir().expect("tempdir");
    let a = load_store(
        temp.path(),
        "a.store",
        r#"{"bad": "some text", "geneZ": 1}"#,
    );
    let b = load_store(temp.path(), "b.store", r#"{"bad": 5, "geneZ": 2}"#);
    let out = temp.path().join("merged.store");

    let merge = cmd()
        .args(["merge", "-i", &a, &b, "-o", out.to_str().unwrap(), "--quiet"])
        .output()
        .expect("merge");
    assert!(merge.status.success(), "merge failed: {merge:?}");

    let stderr = String::from_utf8_lossy(&merge.stderr);
    let anomaly = stderr
        .lines()
        .map(parse_json)
        .find(|line| line["notice"]["kind"] == "anomaly")
        .expect("anomaly notice");
    assert_eq!(anomaly["notice"]["details"]["key"], "bad");
    assert_eq!(
        anomaly["notice"]["details"]["anomaly"],
        "unmergeable-key"
    );

    let dumped = dump_store(out.to_str().unwrap());
    assert_eq!(dumped["geneZ"], 3);
    assert_eq!(dumped["bad"], "some text");
}

#[test]
fn quiet_suppresses_progress_and_generic_key_notices() {
    let temp = tempfile::tempdir().expect("tempdir");
    let a = load_store(temp.path(), "a.store", r#"{"geneX": 1}"#);
    let out = temp.path().join("merged.store");

    let merge = cmd()
        .args(["merge", "-i", &a, "-o", out.to_str().unwrap(), "--quiet"])
        .output()
        .expect("merge");
    assert!(merge.status.success());
    assert!(merge.stderr.is_empty(), "stderr: {merge:?}");

    let b = load_store(temp.path(), "b.store", r#"{"geneX": 2}"#);
    let loud = cmd()
        .args(["merge", "-i", &b, "-o", out.to_str().unwrap(), "--force"])
        .output()
        .expect("merge");
    assert!(loud.status.success());
    let stderr = String::from_utf8_lossy(&loud.stderr);
    assert!(
        stderr
            .lines()
            .map(parse_json)
            .any(|line| line["notice"]["kind"] == "generic-key"),
        "stderr: {stderr}"
    );
}

#[test]
fn custom_transcript_prefix_routes_keys() {
    let temp = tempfile::tempdir().expect("tempdir");
    let a = load_store(
        temp.path(),
        "a.store",
        r#"{"ENSMUST1": {"exon": {"5": 1}}}"#,
    );
    let b = load_store(
        temp.path(),
        "b.store",
        r#"{"ENSMUST1": {"exon": {"5": 2}}}"#,
    );
    let out = temp.path().join("merged.store");

    let merge = cmd()
        .args([
            "merge",
            "-i",
            &a,
            &b,
            "-o",
            out.to_str().unwrap(),
            "--transcript-prefix",
            "ENSMUST",
            "--quiet",
        ])
        .output()
        .expect("merge");
    assert!(merge.status.success());

    let summary = parse_json(std::str::from_utf8(&merge.stdout).expect("utf8"));
    assert_eq!(summary["merge"]["generic_keys"], 0);
    assert_eq!(
        dump_store(out.to_str().unwrap())["ENSMUST1"],
        parse_json(r#"{"exon": {"5": 3}}"#)
    );
}

#[test]
fn info_reports_key_count() {
    let temp = tempfile::tempdir().expect("tempdir");
    let a = load_store(temp.path(), "a.store", r#"{"geneX": 1, "geneY": 2}"#);

    let info = cmd().args(["info", &a, "--json"]).output().expect("info");
    assert!(info.status.success());
    let value = parse_json(std::str::from_utf8(&info.stdout).expect("utf8"));
    assert_eq!(value["info"]["keys"], 2);
    assert_eq!(value["info"]["format_version"], 1);
}

#[test]
fn version_emits_json() {
    let version = cmd().args(["version"]).output().expect("version");
    assert!(version.status.success());
    let value = parse_json(std::str::from_utf8(&version.stdout).expect("utf8"));
    assert_eq!(value["version"]["name"], "countmerge");
}

#[test]
fn load_appends_and_overwrites_existing_keys() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = load_store(temp.path(), "a.store", r#"{"geneX": 1, "geneY": 2}"#);

    let file = temp.path().join("more.json");
    std::fs::write(&file, r#"{"geneX": 9, "geneZ": 5}"#).expect("write json");
    let load = cmd()
        .args(["load", &store, file.to_str().unwrap()])
        .output()
        .expect("load");
    assert!(load.status.success());

    assert_eq!(
        dump_store(&store),
        parse_json(r#"{"geneX": 9, "geneY": 2, "geneZ": 5}"#)
    );
}
