//! Result aggregation
//!
//! Collects per-frame [`DetectionResult`]s per take and folds them into
//! [`ErrorGroup`]s: one group per detector and finding key, split wherever
//! the frame ids jump by more than `max_frame_gap`.
//!
//! The finding key is the detector-supplied `error_group_id` when present,
//! otherwise the exact description text. Description matching is fragile
//! against wording changes in a detector; detectors that want stable
//! grouping should send a group id.
//!
//! Each take has its own lock and a cached grouping that is dropped on any
//! change to the take's results.

use crate::error::{DetectorError, Result};
use crate::models::{DetectionResult, JobFingerprint};
use crate::scheduler::ResultCache;
use chrono::Utc;
use cmon_common::events::{CmonEvent, EventBus};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// One continuous error: the same finding over a contiguous frame range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorGroup {
    pub group_id: String,
    pub detector_name: String,
    pub description: String,
    pub start_frame: i64,
    pub end_frame: i64,
    /// Results folded into the group
    pub occurrence_count: usize,
    pub average_confidence: f64,
    /// Distinct frames, ascending
    pub frame_ids: Vec<i64>,
    /// Every member result is flagged
    pub is_false_positive: bool,
    pub false_positive_reason: Option<String>,
}

/// Selects the results a false-positive decision applies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "by", content = "value")]
pub enum MatchCriteria {
    /// Every member of one group
    GroupId(String),
    /// Every result with exactly this description
    Description(String),
    /// Every result on one frame
    FrameId(i64),
}

#[derive(Debug, Clone)]
struct GroupMembers {
    group: ErrorGroup,
    /// Indices into `TakeResults::results`
    members: Vec<usize>,
}

#[derive(Debug, Default)]
struct TakeResults {
    results: Vec<DetectionResult>,
    /// Cached grouping, keyed by "include false positives"
    groups: HashMap<bool, Arc<Vec<ErrorGroup>>>,
}

impl TakeResults {
    fn invalidate(&mut self) {
        self.groups.clear();
    }
}

/// Take-level result store
pub struct ResultAggregator {
    max_frame_gap: i64,
    cache: Arc<ResultCache>,
    events: EventBus,
    takes: RwLock<HashMap<i64, Arc<Mutex<TakeResults>>>>,
}

impl ResultAggregator {
    pub fn new(max_frame_gap: i64, cache: Arc<ResultCache>, events: EventBus) -> Self {
        Self {
            max_frame_gap: max_frame_gap.max(0),
            cache,
            events,
            takes: RwLock::new(HashMap::new()),
        }
    }

    async fn take(&self, take_id: i64) -> Option<Arc<Mutex<TakeResults>>> {
        self.takes.read().await.get(&take_id).cloned()
    }

    async fn take_or_insert(&self, take_id: i64) -> Arc<Mutex<TakeResults>> {
        if let Some(existing) = self.take(take_id).await {
            return existing;
        }
        Arc::clone(self.takes.write().await.entry(take_id).or_default())
    }

    fn announce(&self, result: &DetectionResult) {
        let event = if result.is_failure() {
            CmonEvent::DetectorFailure {
                detector_name: result.detector_name.clone(),
                take_id: result.take_id,
                frame_id: result.frame_id,
                description: result.description.clone(),
                timestamp: Utc::now(),
            }
        } else {
            CmonEvent::ResultRecorded {
                detector_name: result.detector_name.clone(),
                take_id: result.take_id,
                frame_id: result.frame_id,
                confidence: result.confidence,
                timestamp: Utc::now(),
            }
        };
        self.events.emit_lossy(event);
    }

    /// Append one result to its take
    ///
    /// A failure result (confidence -1.0) is announced as a detector
    /// failure, not as a finding.
    pub async fn record_result(&self, result: DetectionResult) {
        self.announce(&result);
        let take = self.take_or_insert(result.take_id).await;
        let mut take = take.lock().await;
        take.results.push(result);
        take.invalidate();
    }

    /// Replace everything one detector reported for one frame
    ///
    /// Used when a frame pair is (re)analysed. False-positive decisions on
    /// the previous results carry over to new results with the same
    /// description. A failed re-analysis never displaces real results: the
    /// frame keeps its earlier findings, flags included, and only the
    /// caller sees the failure. Returns the results of this analysis.
    pub async fn record_frame_results(
        &self,
        fingerprint: &JobFingerprint,
        results: Vec<DetectionResult>,
    ) -> Vec<DetectionResult> {
        for result in &results {
            self.announce(result);
        }
        let take = self.take_or_insert(fingerprint.current_take_id).await;
        let mut take = take.lock().await;

        let same_frame = |existing: &DetectionResult| {
            existing.detector_name == fingerprint.detector_name && existing.frame_id == fingerprint.frame_id
        };
        let failed = !results.is_empty() && results.iter().all(DetectionResult::is_failure);
        if failed && take.results.iter().any(|existing| same_frame(existing) && !existing.is_failure()) {
            debug!(job = %fingerprint, "Failed re-analysis; earlier results kept");
            return results;
        }

        let mut decisions: HashMap<String, Option<String>> = HashMap::new();
        take.results.retain(|existing| {
            if !same_frame(existing) {
                return true;
            }
            if existing.is_false_positive {
                decisions.insert(existing.description.clone(), existing.false_positive_reason.clone());
            }
            false
        });

        let mut stored = Vec::with_capacity(results.len());
        for mut result in results {
            if let Some(reason) = decisions.get(&result.description) {
                if !result.is_failure() {
                    result.is_false_positive = true;
                    result.false_positive_reason = reason.clone();
                }
            }
            stored.push(result.clone());
            take.results.push(result);
        }
        take.invalidate();
        stored
    }

    /// Raw results of a take, optionally for one detector
    pub async fn results(&self, take_id: i64, detector: Option<&str>) -> Vec<DetectionResult> {
        let Some(take) = self.take(take_id).await else {
            return Vec::new();
        };
        let take = take.lock().await;
        take.results
            .iter()
            .filter(|r| detector.map(|d| r.detector_name == d).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Error groups of a take, ordered by start frame
    ///
    /// Failures never form groups. False positives are left out unless
    /// `include_false_positives` is set.
    pub async fn group_results(&self, take_id: i64, include_false_positives: bool) -> Arc<Vec<ErrorGroup>> {
        let Some(take) = self.take(take_id).await else {
            return Arc::new(Vec::new());
        };
        let mut take = take.lock().await;
        if let Some(cached) = take.groups.get(&include_false_positives) {
            return Arc::clone(cached);
        }

        let groups: Vec<ErrorGroup> = build_groups(&take.results, include_false_positives, self.max_frame_gap)
            .into_iter()
            .map(|g| g.group)
            .collect();
        let groups = Arc::new(groups);
        take.groups.insert(include_false_positives, Arc::clone(&groups));
        debug!(take_id, groups = groups.len(), "Grouped take results");
        groups
    }

    /// Flag matching results of one detector as false positives
    ///
    /// All matches flip together under the take's lock; the take's grouping
    /// and any cached detector output that no longer matches are
    /// invalidated. Returns the number of results flagged.
    pub async fn mark_false_positive(
        &self,
        take_id: i64,
        detector_name: &str,
        criteria: &MatchCriteria,
        reason: &str,
    ) -> Result<usize> {
        if reason.trim().is_empty() {
            return Err(DetectorError::Validation(
                "a false-positive reason is required".to_string(),
            ));
        }
        let not_found = || {
            DetectorError::NotFound(format!(
                "no results of '{}' in take {} match {:?}",
                detector_name, take_id, criteria
            ))
        };
        let take = self.take(take_id).await.ok_or_else(not_found)?;

        let (affected, current) = {
            let mut take = take.lock().await;
            let matches: Vec<usize> = match criteria {
                MatchCriteria::GroupId(group_id) => build_groups(&take.results, true, self.max_frame_gap)
                    .into_iter()
                    .find(|g| &g.group.group_id == group_id && g.group.detector_name == detector_name)
                    .map(|g| g.members)
                    .unwrap_or_default(),
                MatchCriteria::Description(description) => matching(&take.results, |r| {
                    r.detector_name == detector_name && &r.description == description
                }),
                MatchCriteria::FrameId(frame_id) => matching(&take.results, |r| {
                    r.detector_name == detector_name && r.frame_id == *frame_id
                }),
            };
            if matches.is_empty() {
                return Err(not_found());
            }

            let mut frames: Vec<i64> = Vec::with_capacity(matches.len());
            for index in &matches {
                let result = &mut take.results[*index];
                result.is_false_positive = true;
                result.false_positive_reason = Some(reason.to_string());
                frames.push(result.frame_id);
            }
            take.invalidate();
            frames.sort_unstable();
            frames.dedup();

            let mut current: HashMap<JobFingerprint, Vec<DetectionResult>> = HashMap::new();
            for frame_id in &frames {
                let fingerprint = JobFingerprint::new(detector_name, take_id, *frame_id);
                let frame_results = take
                    .results
                    .iter()
                    .filter(|r| r.detector_name == detector_name && r.frame_id == *frame_id)
                    .cloned()
                    .collect();
                current.insert(fingerprint, frame_results);
            }
            (matches.len(), current)
        };

        let invalidated = self.cache.reconcile(&current).await;
        info!(
            take_id,
            detector = %detector_name,
            affected,
            cache_invalidated = invalidated,
            "Results marked as false positive"
        );
        self.events.emit_lossy(CmonEvent::FalsePositiveMarked {
            take_id,
            detector_name: detector_name.to_string(),
            affected,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
        Ok(affected)
    }

    /// Forget every stored result of a take
    pub async fn clear_take(&self, take_id: i64) -> bool {
        self.takes.write().await.remove(&take_id).is_some()
    }
}

fn matching(results: &[DetectionResult], predicate: impl Fn(&DetectionResult) -> bool) -> Vec<usize> {
    results
        .iter()
        .enumerate()
        .filter(|(_, r)| !r.is_failure() && predicate(r))
        .map(|(index, _)| index)
        .collect()
}

/// Stable id for a description-keyed group
fn derived_group_id(detector: &str, description: &str, start_frame: i64) -> String {
    let digest = Sha256::digest(description.as_bytes());
    let short: String = digest.iter().take(4).map(|b| format!("{:02x}", b)).collect();
    format!("{}-{}-{}", detector, short, start_frame)
}

/// Group results
///
/// **Algorithm:**
/// 1. Drop failures (and false positives unless included)
/// 2. Bucket by (detector, group id or description)
/// 3. Sort each bucket by frame and cut it wherever consecutive frames are
///    more than `max_gap` apart
fn build_groups(results: &[DetectionResult], include_false_positives: bool, max_gap: i64) -> Vec<GroupMembers> {
    // (detector, explicit?, key) keeps explicit ids apart from descriptions
    let mut buckets: BTreeMap<(&str, bool, &str), Vec<usize>> = BTreeMap::new();
    for (index, result) in results.iter().enumerate() {
        if result.is_failure() || (result.is_false_positive && !include_false_positives) {
            continue;
        }
        let key = match &result.error_group_id {
            Some(id) => (result.detector_name.as_str(), true, id.as_str()),
            None => (result.detector_name.as_str(), false, result.description.as_str()),
        };
        buckets.entry(key).or_default().push(index);
    }

    let mut groups = Vec::new();
    for ((detector, explicit, key), mut members) in buckets {
        members.sort_by_key(|index| (results[*index].frame_id, *index));

        let mut run: Vec<usize> = Vec::new();
        for index in members {
            if let Some(last) = run.last() {
                if results[index].frame_id - results[*last].frame_id > max_gap {
                    groups.push(finish_group(results, detector, explicit, key, std::mem::take(&mut run)));
                }
            }
            run.push(index);
        }
        if !run.is_empty() {
            groups.push(finish_group(results, detector, explicit, key, run));
        }
    }

    groups.sort_by(|a, b| {
        a.group
            .start_frame
            .cmp(&b.group.start_frame)
            .then_with(|| a.group.detector_name.cmp(&b.group.detector_name))
            .then_with(|| a.group.group_id.cmp(&b.group.group_id))
    });
    groups
}

fn finish_group(
    results: &[DetectionResult],
    detector: &str,
    explicit: bool,
    key: &str,
    members: Vec<usize>,
) -> GroupMembers {
    let first = &results[members[0]];
    let start_frame = first.frame_id;
    let end_frame = members
        .iter()
        .map(|i| results[*i].frame_id)
        .max()
        .unwrap_or(start_frame);

    let mut frame_ids: Vec<i64> = members.iter().map(|i| results[*i].frame_id).collect();
    frame_ids.dedup();

    let total: f64 = members.iter().map(|i| results[*i].confidence).sum();
    let all_flagged = members.iter().all(|i| results[*i].is_false_positive);
    let reason = members
        .iter()
        .find_map(|i| results[*i].false_positive_reason.clone());

    let group_id = if explicit {
        key.to_string()
    } else {
        derived_group_id(detector, key, start_frame)
    };

    GroupMembers {
        group: ErrorGroup {
            group_id,
            detector_name: detector.to_string(),
            description: first.description.clone(),
            start_frame,
            end_frame,
            occurrence_count: members.len(),
            average_confidence: total / members.len() as f64,
            frame_ids,
            is_false_positive: all_flagged,
            false_positive_reason: if all_flagged { reason } else { None },
        },
        members,
    }
}
