//! Integration tests for the frame-pair scheduler
//!
//! Jobs run end to end: scheduler lane, process manager, filesystem
//! channel and the fake engine's responder.

mod helpers;

use cmon_dh::config::HostConfig;
use cmon_dh::scheduler::{DropReason, JobCompletion, SubmitOutcome};
use futures::future::join_all;
use helpers::{finding, test_config, wait_until, Behavior, FakeRuntime, TestHost};
use serde_json::{json, Map};
use std::time::Duration;

async fn running_host(config: HostConfig) -> TestHost {
    let host = TestHost::with_config(FakeRuntime::available(), config).await;
    host.install("props", "1.0.0").await;
    host.service.enable_detector("props", &Map::new()).await.unwrap();
    host
}

#[tokio::test]
async fn test_identical_submissions_share_one_round_trip() {
    let host = running_host(test_config()).await;
    let scheduler = host.service.scheduler();

    let receipts = join_all((0..8).map(|_| scheduler.submit("props", 1, 2, 50))).await;
    let accepted = receipts
        .iter()
        .filter(|r| r.outcome == SubmitOutcome::Accepted)
        .count();
    assert_eq!(accepted, 1);

    let completions = join_all(receipts.into_iter().map(|r| r.ticket.wait())).await;
    let first = completions[0].results().expect("finished").clone();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].description, "Cup moved");
    for completion in &completions {
        assert_eq!(completion.results().unwrap()[..], first[..]);
    }
    assert_eq!(host.runtime.round_trips(), 1);

    // Later identical submission comes from the cache
    let again = scheduler.submit("props", 1, 2, 50).await;
    assert_eq!(again.outcome, SubmitOutcome::Deduped);
    assert!(again.ticket.wait().await.results().is_some());
    assert_eq!(host.runtime.round_trips(), 1);

    let stats = scheduler.stats().await;
    let lane = &stats.detectors["props"];
    assert_eq!(lane.accepted, 1);
    assert_eq!(lane.deduped, 8);
}

#[tokio::test]
async fn test_findings_become_results() {
    let host = running_host(test_config()).await;
    let mut grouped = finding("Jacket collar flipped", 1.7);
    grouped.details.insert("group_id".to_string(), json!("collar-1"));
    host.runtime.set_behavior(
        "props",
        Behavior::Respond {
            findings: vec![grouped, finding("", 0.4)],
            delay: Duration::from_millis(5),
        },
    );

    let receipt = host.service.scheduler().submit("props", 1, 2, 30).await;
    let completion = receipt.ticket.wait().await;
    let results = completion.results().unwrap();
    assert_eq!(results.len(), 2);

    assert_eq!(results[0].confidence, 1.0);
    assert_eq!(results[0].error_group_id.as_deref(), Some("collar-1"));
    assert_eq!(results[0].take_id, 2);
    assert_eq!(results[0].frame_id, 30);
    assert_eq!(results[0].metadata["reference_take_id"], json!(1));
    assert_eq!(results[0].bounding_boxes.len(), 1);
    assert_eq!(results[1].description, "prop_moved");
}

#[tokio::test]
async fn test_silent_detector_yields_timeout_result() {
    let host = running_host(test_config()).await;
    host.runtime.set_behavior("props", Behavior::Silent);

    let receipt = host.service.scheduler().submit("props", 1, 2, 50).await;
    let completion = tokio::time::timeout(Duration::from_secs(10), receipt.ticket.wait())
        .await
        .expect("job must finish within its timeout");

    let results = completion.results().unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].is_failure());
    assert_eq!(results[0].confidence, -1.0);
    assert_eq!(results[0].metadata["failure"], json!("timeout"));

    // Failures are never cached; a resubmission runs again
    host.runtime.set_behavior("props", Behavior::default());
    let retry = host.service.scheduler().submit("props", 1, 2, 50).await;
    assert_eq!(retry.outcome, SubmitOutcome::Accepted);
    let results = retry.ticket.wait().await.results().unwrap().clone();
    assert!(!results[0].is_failure());
}

#[tokio::test]
async fn test_slow_detector_gets_a_longer_timeout() {
    let mut config = test_config();
    config.scheduler.initial_timeout_secs = 1;
    config.scheduler.max_timeout_secs = 10;
    config.scheduler.max_in_flight_per_detector = 1;
    let host = running_host(config).await;
    host.runtime.set_behavior(
        "props",
        Behavior::Respond {
            findings: vec![finding("Cup moved", 0.8)],
            delay: Duration::from_millis(1500),
        },
    );
    let scheduler = host.service.scheduler();

    let first = scheduler.submit("props", 1, 2, 10).await.ticket.wait().await;
    assert_eq!(first.results().unwrap()[0].failure_kind(), Some("timeout"));
    let raised = scheduler.stats().await.detectors["props"].current_timeout_secs;
    assert_eq!(raised, 2.0);

    // Late answer to the first request drains from the responder
    tokio::time::sleep(Duration::from_millis(800)).await;

    for frame_id in 11..14 {
        let completion = scheduler.submit("props", 1, 2, frame_id).await.ticket.wait().await;
        let results = completion.results().unwrap();
        assert!(!results[0].is_failure(), "frame {}: {}", frame_id, results[0].description);
        assert_eq!(results[0].description, "Cup moved");
    }
    assert!(scheduler.stats().await.detectors["props"].current_timeout_secs >= 2.0);
}

#[tokio::test]
async fn test_disable_mid_job_cancels_waiting_callers() {
    let mut config = test_config();
    config.scheduler.max_in_flight_per_detector = 1;
    let host = running_host(config).await;
    host.runtime.set_behavior(
        "props",
        Behavior::Respond {
            findings: vec![finding("Cup moved", 0.8)],
            delay: Duration::from_secs(5),
        },
    );
    let scheduler = host.service.scheduler();

    let in_flight = scheduler.submit("props", 1, 2, 50).await;
    let queued = scheduler.submit("props", 1, 2, 51).await;
    assert_eq!(in_flight.outcome, SubmitOutcome::Accepted);
    assert_eq!(queued.outcome, SubmitOutcome::Accepted);
    let sent = wait_until(Duration::from_secs(2), || async {
        host.service
            .get_detector_status("props")
            .await
            .map(|status| status.pending_jobs == 1)
            .unwrap_or(false)
    })
    .await;
    assert!(sent, "first job should be waiting on the container");

    assert!(host.service.disable_detector("props").await.unwrap());

    let (in_flight, queued) = tokio::time::timeout(
        Duration::from_secs(3),
        futures::future::join(in_flight.ticket.wait(), queued.ticket.wait()),
    )
    .await
    .expect("waiting callers are released on disable");

    let results = in_flight.results().expect("in-flight job finishes");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].failure_kind(), Some("cancelled"));
    assert!(matches!(queued, JobCompletion::Dropped(DropReason::Cancelled)));
    assert_eq!(host.runtime.round_trips(), 0);
}

#[tokio::test]
async fn test_error_response_becomes_failure_result() {
    let host = running_host(test_config()).await;
    host.runtime.set_behavior("props", Behavior::Error("model weights missing".to_string()));

    let receipt = host.service.scheduler().submit("props", 1, 2, 50).await;
    let completion = receipt.ticket.wait().await;
    let result = &completion.results().unwrap()[0];
    assert!(result.is_failure());
    assert_eq!(result.metadata["failure"], json!("process_error"));
    assert!(result.description.contains("model weights missing"), "{}", result.description);

    let status = host.service.get_detector_status("props").await.unwrap();
    assert_eq!(status.error_count, 1);
}

#[tokio::test]
async fn test_stopped_detector_yields_not_running_result() {
    let host = running_host(test_config()).await;
    host.service.manager().stop_detector("props").await.unwrap();

    let receipt = host.service.scheduler().submit("props", 1, 2, 50).await;
    let completion = receipt.ticket.wait().await;
    assert_eq!(completion.results().unwrap()[0].metadata["failure"], json!("not_running"));
}

#[tokio::test]
async fn test_boundary_frames_survive_overload() {
    let mut config = test_config();
    config.scheduler.queue_capacity = 32;
    config.scheduler.high_water_mark = 24;
    config.scheduler.max_in_flight_per_detector = 1;
    config.scheduler.boundary_window = 10;
    let host = running_host(config).await;
    host.runtime.set_behavior("props", Behavior::Silent);
    let scheduler = host.service.scheduler();

    // Occupies the only in-flight slot so nothing leaves the queue
    let busy = scheduler.submit("props", 1, 3, 500).await;
    assert_eq!(busy.outcome, SubmitOutcome::Accepted);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(scheduler.queue_snapshot("props").await.is_empty());

    let mut middle = Vec::new();
    for frame in 10..90 {
        middle.push(scheduler.submit("props", 1, 2, frame).await);
    }
    let mut boundary = Vec::new();
    for frame in (0..10).chain(90..100) {
        boundary.push(scheduler.submit("props", 1, 2, frame).await);
    }

    for receipt in &boundary {
        assert_eq!(receipt.outcome, SubmitOutcome::Accepted, "{:?}", receipt.ticket.fingerprint());
    }
    let queued = scheduler.queue_snapshot("props").await;
    assert!(queued.len() <= 32);
    assert_eq!(queued.iter().filter(|job| job.boundary).count(), 20);

    let dropped = middle
        .iter()
        .filter(|r| matches!(r.outcome, SubmitOutcome::Dropped(_)))
        .count();
    assert!(dropped > 0, "overload should shed or reject middle frames");

    let stats = scheduler.stats().await;
    let lane = &stats.detectors["props"];
    assert!(lane.evicted >= 1);
    assert!(lane.shed as f64 <= 0.5 * lane.submitted as f64);

    // Queued work is released when the detector goes away
    let cancelled = scheduler.cancel_detector("props").await;
    assert_eq!(cancelled, queued.len());
    for receipt in boundary {
        match receipt.ticket.wait().await {
            JobCompletion::Dropped(reason) => assert_eq!(reason, DropReason::Cancelled),
            JobCompletion::Finished(results) => assert!(results[0].is_failure()),
        }
    }
}

#[tokio::test]
async fn test_evicted_job_completes_as_dropped() {
    let mut config = test_config();
    config.scheduler.queue_capacity = 2;
    config.scheduler.high_water_mark = 2;
    config.scheduler.max_in_flight_per_detector = 1;
    let host = running_host(config).await;
    host.runtime.set_behavior("props", Behavior::Silent);
    let scheduler = host.service.scheduler();

    // Occupies the only in-flight slot
    let busy = scheduler.submit("props", 1, 2, 49).await;
    assert_eq!(busy.outcome, SubmitOutcome::Accepted);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let worst = scheduler.submit("props", 1, 2, 50).await;
    let other = scheduler.submit("props", 1, 2, 45).await;
    assert_eq!(worst.outcome, SubmitOutcome::Accepted);
    assert_eq!(other.outcome, SubmitOutcome::Accepted);

    let urgent = scheduler.submit("props", 1, 2, 1).await;
    assert_eq!(urgent.outcome, SubmitOutcome::Accepted);
    assert!(matches!(worst.ticket.wait().await, JobCompletion::Dropped(DropReason::Evicted)));

    scheduler.cancel_detector("props").await;
}
