//! Sandbox tests against a real Docker engine
//!
//! Ignored by default. Run with `cargo test --test sandbox -- --ignored`
//! on a host where the current user can reach the Docker daemon.

mod helpers;

use cmon_dh::config::{HostConfig, HostPaths};
use cmon_dh::DetectorService;
use helpers::{manifest, png_header, write_archive};
use serde_json::{json, Map};
use std::time::Duration;
use tempfile::TempDir;

/// Answers every frame pair with a report on its own sandbox
const INSPECT_DETECTOR: &str = r#"import json
import os
import time

INPUT = os.path.join("/comm", "input")
OUTPUT = os.path.join("/comm", "output")


def respond(request):
    report = {
        "uid": os.getuid(),
        "root_writable": os.access("/usr", os.W_OK),
        "interfaces": sorted(os.listdir("/sys/class/net")),
    }
    return {
        "id": request["id"],
        "type": "result",
        "timestamp": time.time(),
        "processing_time": 0.0,
        "results": [{
            "error_type": "sandbox_report",
            "confidence": 0.5,
            "description": "sandbox report",
            "details": report,
        }],
    }


while True:
    for name in sorted(os.listdir(INPUT)):
        if not name.endswith(".json") or name.startswith("."):
            continue
        path = os.path.join(INPUT, name)
        with open(path) as handle:
            request = json.load(handle)
        os.remove(path)
        if request.get("type") == "shutdown":
            raise SystemExit(0)
        target = os.path.join(OUTPUT, request["id"] + ".json")
        staged = os.path.join(OUTPUT, "." + request["id"] + ".tmp")
        with open(staged, "w") as handle:
            json.dump(respond(request), handle)
        os.replace(staged, target)
    time.sleep(0.05)
"#;

#[tokio::test]
#[ignore = "requires a running Docker engine"]
async fn test_detector_runs_unprivileged_on_read_only_root() {
    let dir = TempDir::new().unwrap();
    let paths = HostPaths::new(dir.path().join("root"));
    for take in [1, 2] {
        let take_dir = paths.frames_dir.join(take.to_string());
        std::fs::create_dir_all(&take_dir).unwrap();
        std::fs::write(take_dir.join("0.png"), png_header(4, 3)).unwrap();
    }

    let service = DetectorService::connect(HostConfig::default(), paths).await.unwrap();
    assert!(service.availability().is_available(), "Docker engine not reachable");

    let body = serde_json::to_vec(&manifest("sandboxcheck", "1.0.0")).unwrap();
    let archive = write_archive(
        dir.path(),
        "sandboxcheck.zip",
        &[("manifest.json", &body), ("detector.py", INSPECT_DETECTOR.as_bytes())],
    );
    service.install_detector(&archive, false).await.unwrap();
    service.enable_detector("sandboxcheck", &Map::new()).await.unwrap();

    let submissions = service.process_frame_pair(1, 2, 0).await.unwrap();
    assert_eq!(submissions.len(), 1);
    let completion = tokio::time::timeout(
        Duration::from_secs(120),
        submissions.into_iter().next().unwrap().ticket.wait(),
    )
    .await
    .unwrap();
    let results = completion.results().unwrap();
    assert!(!results[0].is_failure(), "{}", results[0].description);

    let report = &results[0].metadata["details"];
    assert_ne!(report["uid"], json!(0), "detector must not run as root");
    assert_eq!(report["root_writable"], json!(false));
    assert_eq!(report["interfaces"], json!(["lo"]), "no network beyond loopback");

    let report = service.uninstall_detector("sandboxcheck").await.unwrap();
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    service.shutdown().await;
}
