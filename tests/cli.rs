use std::fs;
use std::path::Path;

use assert_cmd::Command;
use tempfile::tempdir;

const QUARTERLY_REPORT: &str = "\
ACME Corp quarterly report, fiscal Q1
Revenue increased 12% to $4.2 million on strong demand.
Operating margin improved to 18% while net income reached $0.6 million.
Risk factors: debt refinancing and currency volatility remain a risk.
";

fn write_config(dir: &Path, variant: &str) -> std::path::PathBuf {
    let path = dir.join("docpipe.yaml");
    let body = format!(
        "version: 1\nworkers: 2\ncapabilities:\n  default: {variant}\npipeline:\n  retry:\n    initial_backoff_ms: 1\n    max_backoff_ms: 5\nstore:\n  path: {}\n",
        dir.join("jobs.json").display()
    );
    fs::write(&path, body).unwrap();
    path
}

fn docpipe() -> Command {
    Command::cargo_bin("docpipe").expect("binary present")
}

#[test]
fn run_processes_inputs_and_persists_jobs() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("q1.txt"), QUARTERLY_REPORT).unwrap();
    fs::write(temp.path().join("q2.txt"), QUARTERLY_REPORT).unwrap();
    let config = write_config(temp.path(), "live");
    let metrics_json = temp.path().join("metrics").join("run.json");
    let metrics_prom = temp.path().join("metrics").join("run.prom");

    let output = docpipe()
        .current_dir(temp.path())
        .args(["run", "--config"])
        .arg(&config)
        .args(["--query", "Analyze Q1 report", "*.txt"])
        .arg("--metrics-json")
        .arg(&metrics_json)
        .arg("--metrics-prometheus")
        .arg(&metrics_prom)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines.iter().all(|line| line.contains("\tcompleted\t")));

    let metrics: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&metrics_json).unwrap()).unwrap();
    assert_eq!(metrics["jobs_completed"], 2);
    let prom = fs::read_to_string(&metrics_prom).unwrap();
    assert!(prom.contains("docpipe_jobs_total{outcome=\"completed\"} 2"));
    assert!(prom.contains("docpipe_stage_calls_total{stage=\"verification\"} 2"));

    let job_id = lines[0].split('\t').next().unwrap();
    let store = temp.path().join("jobs.json");

    let status = docpipe()
        .args(["status", job_id, "--store"])
        .arg(&store)
        .output()
        .unwrap();
    assert!(status.status.success());
    let body: serde_json::Value = serde_json::from_slice(&status.stdout).unwrap();
    assert_eq!(body["job"]["status"], "completed");
    assert_eq!(body["stages"].as_array().unwrap().len(), 4);
    assert_eq!(body["stages"][3]["stage"], "verification");

    let result = docpipe()
        .args(["result", job_id, "--store"])
        .arg(&store)
        .output()
        .unwrap();
    assert!(result.status.success());
    let analysis = String::from_utf8(result.stdout).unwrap();
    assert!(analysis.contains("$4.2 million"));
    assert!(analysis.contains("sha256"));

    let listed = docpipe()
        .args(["list", "--status", "completed", "--store"])
        .arg(&store)
        .output()
        .unwrap();
    assert!(listed.status.success());
    assert_eq!(String::from_utf8(listed.stdout).unwrap().lines().count(), 2);

    let stats = docpipe()
        .args(["stats", "--store"])
        .arg(&store)
        .output()
        .unwrap();
    assert!(stats.status.success());
    let stats: serde_json::Value = serde_json::from_slice(&stats.stdout).unwrap();
    assert_eq!(stats["total"], 2);
    assert_eq!(stats["completed"], 2);
    assert_eq!(stats["failed"], 0);
    assert_eq!(stats["metrics_entries"], 2);
    assert!(stats["total_tokens"].as_u64().unwrap() > 0);
    assert!(stats["average_duration_seconds"].is_number());
}

#[test]
fn stats_requires_an_existing_store() {
    let temp = tempdir().unwrap();
    docpipe()
        .args(["stats", "--store"])
        .arg(temp.path().join("missing.json"))
        .assert()
        .failure();
}

#[test]
fn run_rejects_zero_workers_override() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("q1.txt"), QUARTERLY_REPORT).unwrap();
    let config = write_config(temp.path(), "stub");

    let output = docpipe()
        .current_dir(temp.path())
        .args(["run", "--config"])
        .arg(&config)
        .args(["--workers", "0", "q1.txt"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("At least one worker is required"));
    assert!(!temp.path().join("jobs.json").exists());
}

#[test]
fn run_reports_failed_jobs_with_nonzero_exit() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("recipe.txt"), "Mix flour and water, then bake.\n").unwrap();
    let config = write_config(temp.path(), "live");

    let output = docpipe()
        .current_dir(temp.path())
        .args(["run", "--config"])
        .arg(&config)
        .arg("recipe.txt")
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("\tfailed\t"));
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("1 of 1 job(s) failed"));
}

#[test]
fn run_with_stub_capabilities_needs_no_real_documents() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("empty.pdf"), b"").unwrap();
    let config = write_config(temp.path(), "stub");

    docpipe()
        .current_dir(temp.path())
        .args(["run", "--config"])
        .arg(&config)
        .arg("empty.pdf")
        .assert()
        .success();
}

#[test]
fn validate_accepts_good_and_rejects_bad_settings() {
    let temp = tempdir().unwrap();
    let good = write_config(temp.path(), "stub");
    docpipe().arg("validate").arg(&good).assert().success();

    let bad = temp.path().join("bad.yaml");
    fs::write(&bad, "version: 1\nworkers: 0\n").unwrap();
    docpipe().arg("validate").arg(&bad).assert().failure();
}

#[test]
fn stages_lists_bindings_in_order() {
    let output = docpipe().arg("stages").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    let financial = stdout.find("financial_analysis").unwrap();
    let investment = stdout.find("investment_analysis").unwrap();
    let risk = stdout.find("risk_assessment").unwrap();
    let verification = stdout.find("verification").unwrap();
    assert!(financial < investment && investment < risk && risk < verification);
    assert!(stdout.contains("-> stub"));
}

#[test]
fn status_of_unknown_job_fails() {
    let temp = tempdir().unwrap();
    let store = temp.path().join("jobs.json");
    fs::write(&store, r#"{"jobs":[],"stage_results":{},"metrics":{}}"#).unwrap();

    docpipe()
        .args(["status", "6f1c2a7e-3f0b-4d55-9a51-2b1f0c8e4d11", "--store"])
        .arg(&store)
        .assert()
        .failure();
}
