//! Integration tests for the detector service facade
//!
//! End-to-end flows: install, enable, analyse frame pairs, group the
//! findings and record operator false-positive decisions.

mod helpers;

use cmon_common::events::{CmonEvent, ProcessState};
use cmon_common::Envelope;
use cmon_dh::aggregation::MatchCriteria;
use cmon_dh::error::DetectorError;
use cmon_dh::scheduler::SubmitOutcome;
use futures::future::join_all;
use helpers::{clean_package, FakeRuntime, TestHost};
use serde_json::{json, Map};
use std::time::Duration;

async fn analyse(host: &TestHost, frames: std::ops::Range<i64>) {
    let mut tickets = Vec::new();
    for frame in frames {
        for submission in host.service.process_frame_pair(1, 2, frame).await.unwrap() {
            tickets.push(submission.ticket);
        }
    }
    join_all(tickets.into_iter().map(|t| t.wait())).await;
}

#[tokio::test]
async fn test_unavailable_engine_fails_fast() {
    let host = TestHost::new(FakeRuntime::unavailable()).await;
    let archive = clean_package(host.dir.path(), "props", "1.0.0");

    let checks = async {
        let install = host.service.install_detector(&archive, false).await.unwrap_err();
        assert!(install.is_unavailable(), "{}", install);
        let enable = host.service.enable_detector("props", &Map::new()).await.unwrap_err();
        assert!(matches!(enable, DetectorError::RuntimeUnavailable(_)), "{}", enable);
        let status = host.service.get_detector_status("props").await.unwrap_err();
        assert!(status.is_unavailable());
        let process = host.service.process_frame_pair(1, 2, 3).await.err().unwrap();
        assert!(process.is_unavailable());
        let start = host.service.start_enabled().await.unwrap_err();
        assert!(start.is_unavailable());
    };
    tokio::time::timeout(Duration::from_secs(1), checks)
        .await
        .expect("unavailable engine must not block");

    // Read-only queries keep working
    assert!(host.service.list_detectors().await.unwrap().is_empty());
    assert_eq!(host.service.get_cache_stats().await.entries, 0);
    assert_eq!(std::fs::read_dir(&host.paths().staging_dir).unwrap().count(), 0);
}

#[tokio::test]
async fn test_only_enabled_running_detectors_receive_work() {
    let host = TestHost::new(FakeRuntime::available()).await;
    host.install("props", "1.0.0").await;
    host.install("wardrobe", "1.0.0").await;

    assert!(host.service.process_frame_pair(1, 2, 10).await.unwrap().is_empty());

    assert!(host.service.enable_detector("props", &Map::new()).await.unwrap());
    // Running but never enabled
    host.service.manager().start_detector("wardrobe", &Map::new()).await.unwrap();

    let submissions = host.service.process_frame_pair(1, 2, 10).await.unwrap();
    let names: Vec<&str> = submissions.iter().map(|s| s.detector_name.as_str()).collect();
    assert_eq!(names, vec!["props"]);
    assert_eq!(submissions[0].outcome, SubmitOutcome::Accepted);
}

#[tokio::test]
async fn test_enable_unknown_detector() {
    let host = TestHost::new(FakeRuntime::available()).await;
    let err = host.service.enable_detector("ghost", &Map::new()).await.unwrap_err();
    assert!(matches!(err, DetectorError::NotFound(_)));
    let err = host.service.enable_detector("../etc", &Map::new()).await.unwrap_err();
    assert!(matches!(err, DetectorError::Configuration(_)), "{}", err);
}

#[tokio::test]
async fn test_disable_reports_change_once() {
    let host = TestHost::new(FakeRuntime::available()).await;
    host.install("props", "1.0.0").await;
    host.service.enable_detector("props", &Map::new()).await.unwrap();

    assert!(host.service.disable_detector("props").await.unwrap());
    assert!(!host.service.disable_detector("props").await.unwrap());

    let entry = &host.service.list_detectors().await.unwrap()[0];
    assert!(!entry.enabled);
    assert_eq!(host.runtime.running_containers(), 0);
    let status = host.service.get_detector_status("props").await.unwrap();
    assert_eq!(status.state, ProcessState::Stopped);
}

#[tokio::test]
async fn test_frames_group_into_continuous_errors() {
    let host = TestHost::new(FakeRuntime::available()).await;
    host.install("props", "1.0.0").await;
    host.service.enable_detector("props", &Map::new()).await.unwrap();

    analyse(&host, 10..15).await;
    analyse(&host, 20..22).await;

    let groups = host.service.group_results(2, false).await;
    assert_eq!(groups.len(), 2);
    assert_eq!((groups[0].start_frame, groups[0].end_frame), (10, 14));
    assert_eq!(groups[0].occurrence_count, 5);
    assert_eq!(groups[0].frame_ids, vec![10, 11, 12, 13, 14]);
    assert!((groups[0].average_confidence - 0.8).abs() < 1e-9);
    assert_eq!((groups[1].start_frame, groups[1].end_frame), (20, 21));
    assert_ne!(groups[0].group_id, groups[1].group_id);

    assert_eq!(host.service.take_results(2, Some("props")).await.len(), 7);
    assert!(host.service.take_results(2, Some("wardrobe")).await.is_empty());
    assert!(host.service.group_results(99, true).await.is_empty());
}

#[tokio::test]
async fn test_false_positive_flow() {
    let host = TestHost::new(FakeRuntime::available()).await;
    host.install("props", "1.0.0").await;
    host.service.enable_detector("props", &Map::new()).await.unwrap();
    analyse(&host, 10..15).await;
    let mut events = host.service.events().subscribe();

    let group_id = host.service.group_results(2, false).await[0].group_id.clone();
    let affected = host
        .service
        .mark_false_positive(2, "props", &MatchCriteria::GroupId(group_id), "cup is a replacement prop")
        .await
        .unwrap();
    assert_eq!(affected, 5);

    assert!(host.service.group_results(2, false).await.is_empty());
    let all = host.service.group_results(2, true).await;
    assert_eq!(all.len(), 1);
    assert!(all[0].is_false_positive);
    assert_eq!(all[0].false_positive_reason.as_deref(), Some("cup is a replacement prop"));

    let mut announced = false;
    while let Ok(event) = events.try_recv() {
        if let CmonEvent::FalsePositiveMarked { affected, .. } = event {
            assert_eq!(affected, 5);
            announced = true;
        }
    }
    assert!(announced);

    // Flagged frames drop out of the cache; re-analysis keeps the decision
    let round_trips = host.runtime.round_trips();
    let submissions = host.service.process_frame_pair(1, 2, 12).await.unwrap();
    assert_eq!(submissions[0].outcome, SubmitOutcome::Accepted);
    let completion = submissions.into_iter().next().unwrap().ticket.wait().await;
    let results = completion.results().unwrap();
    assert!(!results.is_empty());
    for result in results.iter() {
        assert!(result.is_false_positive);
    }
    assert_eq!(host.runtime.round_trips(), round_trips + 1);
    assert!(host.service.group_results(2, false).await.is_empty());

    let err = host
        .service
        .mark_false_positive(2, "props", &MatchCriteria::FrameId(99), "nothing there")
        .await
        .unwrap_err();
    assert!(matches!(err, DetectorError::NotFound(_)));
}

#[tokio::test]
async fn test_clear_cache_forces_reanalysis() {
    let host = TestHost::new(FakeRuntime::available()).await;
    host.install("props", "1.0.0").await;
    host.service.enable_detector("props", &Map::new()).await.unwrap();
    analyse(&host, 10..13).await;
    assert_eq!(host.service.get_cache_stats().await.entries, 3);

    let mut events = host.service.events().subscribe();
    assert_eq!(host.service.clear_cache(Some("props")).await, 3);
    assert!(matches!(events.try_recv(), Ok(CmonEvent::CacheCleared { .. })));

    let round_trips = host.runtime.round_trips();
    analyse(&host, 10..11).await;
    assert_eq!(host.runtime.round_trips(), round_trips + 1);
}

#[tokio::test]
async fn test_push_channel_carries_events_as_envelopes() {
    let host = TestHost::new(FakeRuntime::available()).await;
    let mut push = host.service.push_envelopes(16);
    host.service.clear_cache(Some("props")).await;

    let bytes = tokio::time::timeout(Duration::from_secs(1), push.recv())
        .await
        .expect("pushed in time")
        .expect("push channel open");
    let envelope = Envelope::decode(&bytes).unwrap();
    assert_eq!(envelope.message_type, "CacheCleared");
    match envelope.decode_json::<CmonEvent>().unwrap() {
        CmonEvent::CacheCleared { detector_name, .. } => assert_eq!(detector_name.as_deref(), Some("props")),
        other => panic!("unexpected event {:?}", other),
    }

    host.service.shutdown().await;
    let closed = tokio::time::timeout(Duration::from_secs(1), push.recv()).await;
    assert!(matches!(closed, Ok(None)), "push channel closes on shutdown");
}

#[tokio::test]
async fn test_upgrade_restarts_running_detector_with_its_config() {
    let host = TestHost::new(FakeRuntime::available()).await;
    host.install("props", "1.0.0").await;
    let mut config = Map::new();
    config.insert("threshold".to_string(), json!(0.7));
    host.service.enable_detector("props", &config).await.unwrap();
    analyse(&host, 10..11).await;

    let archive = clean_package(host.dir.path(), "props", "1.1.0");
    let outcome = host.service.install_detector(&archive, false).await.unwrap();
    assert!(outcome.message.contains("upgraded from 1.0.0 to 1.1.0"), "{}", outcome.message);
    assert!(outcome.detector.enabled, "upgrade keeps the enabled flag");

    let process = host.service.manager().process("props").await.expect("restarted");
    assert_eq!(process.container().image_ref, "cmon-detector/props:1.1.0");
    assert_eq!(process.config().get("threshold"), Some(&json!(0.7)));
    assert_eq!(host.runtime.running_containers(), 1);
    assert_eq!(host.service.get_cache_stats().await.entries, 0);
}

#[tokio::test]
async fn test_start_enabled_and_shutdown() {
    let host = TestHost::new(FakeRuntime::available()).await;
    host.install("props", "1.0.0").await;
    host.install("wardrobe", "1.0.0").await;
    host.service.enable_detector("props", &Map::new()).await.unwrap();
    host.service.manager().stop_detector("props").await.unwrap();

    let started = host.service.start_enabled().await.unwrap();
    assert_eq!(started, vec!["props".to_string()]);
    assert_eq!(host.runtime.running_containers(), 1);

    host.service.shutdown().await;
    assert!(host.service.manager().running_detectors().await.is_empty());
    assert_eq!(host.runtime.container_count(), 0);
}
