use std::{path::Path, process::Command};

use serde_json::Value;

fn medrag(data_dir: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_medrag"));
    cmd.env("MEDRAG_DATA_DIR", data_dir)
        .env("MEDRAG_LOCAL_URL", "http://127.0.0.1:9")
        .env("MEDRAG_PROBE_TIMEOUT_SECS", "1")
        .env("MEDRAG_LOG", "warn")
        .env_remove("MEDRAG_API_KEY")
        .env_remove("GROQ_API_KEY")
        .env_remove("MEDRAG_INDEX_DIR")
        .env_remove("MEDRAG_EMBEDDER");
    cmd
}

fn run_json(cmd: &mut Command) -> Value {
    let output = cmd.output().unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn build_then_ask_offline() {
    let tmp = tempfile::tempdir().unwrap();
    let data_dir = tmp.path().join("data");
    let docs = tmp.path().join("docs");
    std::fs::create_dir(&docs).unwrap();
    std::fs::write(
        docs.join("diabetes.txt"),
        "Metformin is the first-line treatment for type 2 diabetes. Lifestyle changes support glucose control.",
    )
    .unwrap();
    std::fs::write(docs.join(".hidden.txt"), "ignored").unwrap();

    let status = medrag(&data_dir).arg("build").arg(&docs).status().unwrap();
    assert!(status.success());
    assert!(data_dir.join("index").join("manifest.json").is_file());

    let search = run_json(medrag(&data_dir).args(["search", "diabetes", "--json"]));
    assert_eq!(search["result_count"], 1);
    assert_eq!(search["results"][0]["document"], "diabetes.txt");

    let ask = run_json(medrag(&data_dir).args([
        "ask",
        "What is the first-line treatment for diabetes?",
        "--json",
        "--show-context",
    ]));
    assert_eq!(ask["answer"]["backend_used"], "fallback");
    assert!(ask["answer"]["text"].as_str().unwrap().contains("Metformin"));
    assert_eq!(ask["citations"][0]["page_number"], 1);
    assert!(
        ask["context"]
            .as_str()
            .unwrap()
            .starts_with("[Source: diabetes.txt - Page 1]")
    );

    let status = run_json(medrag(&data_dir).args(["status", "--json"]));
    assert_eq!(status["index"]["chunk_count"], 1);
    assert_eq!(status["backend"]["kind"], "fallback");
}

#[test]
fn ask_without_index_fails_cleanly() {
    let tmp = tempfile::tempdir().unwrap();
    let output = medrag(tmp.path())
        .args(["ask", "What is sepsis?"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error: "), "stderr: {stderr}");
}

#[test]
fn status_reports_missing_index() {
    let tmp = tempfile::tempdir().unwrap();
    let status = run_json(medrag(tmp.path()).args(["status", "--json"]));
    assert!(status["index"].is_null());
}
