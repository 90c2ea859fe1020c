//! Bounded priority queue with load shedding
//!
//! One queue per detector. Admission rules:
//!
//! - fill below the high-water mark: accept
//! - between high-water and capacity: non-boundary jobs are dropped with
//!   probability `fill_ratio * score`, while the running drop ratio stays at
//!   or below `max_drop_ratio`
//! - at capacity: evict the worst-scoring non-boundary resident if the
//!   incoming job scores strictly better, otherwise reject
//!
//! Boundary jobs are never shed or evicted.

use crate::models::FramePairJob;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;

/// Why a submission did not make it into the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Probabilistically shed above the high-water mark
    LoadShed,
    /// Queue full and nothing evictable scores worse
    QueueFull,
    /// Pushed out of a full queue by a better-scoring job
    Evicted,
    /// Detector stopped before the job ran
    Cancelled,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::LoadShed => "load_shed",
            DropReason::QueueFull => "queue_full",
            DropReason::Evicted => "evicted",
            DropReason::Cancelled => "cancelled",
        }
    }
}

/// Result of [`BoundedJobQueue::push`]
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Accepted,
    /// Accepted by evicting `evicted`
    AcceptedWithEviction { evicted: FramePairJob },
    Dropped(DropReason),
}

/// Admission counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounters {
    pub submitted: u64,
    pub accepted: u64,
    pub shed: u64,
    pub rejected: u64,
    pub evicted: u64,
}

#[derive(Debug)]
struct Slot {
    job: FramePairJob,
    sequence: u64,
}

/// Per-detector job queue
#[derive(Debug)]
pub struct BoundedJobQueue {
    slots: VecDeque<Slot>,
    capacity: usize,
    high_water_mark: usize,
    max_drop_ratio: f64,
    next_sequence: u64,
    counters: QueueCounters,
    rng: StdRng,
}

impl BoundedJobQueue {
    pub fn new(capacity: usize, high_water_mark: usize, max_drop_ratio: f64, seed: Option<u64>) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: VecDeque::with_capacity(capacity),
            capacity,
            high_water_mark: high_water_mark.min(capacity),
            max_drop_ratio: max_drop_ratio.clamp(0.0, 1.0),
            next_sequence: 0,
            counters: QueueCounters::default(),
            rng: match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            },
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn counters(&self) -> QueueCounters {
        self.counters
    }

    /// Offer a job to the queue
    pub fn push(&mut self, job: FramePairJob) -> Admission {
        self.counters.submitted += 1;
        let fill = self.slots.len();

        if fill >= self.capacity {
            return match self.eviction_candidate(job.priority) {
                Some(index) => {
                    let evicted = self.slots.remove(index).map(|slot| slot.job);
                    self.insert(job);
                    self.counters.evicted += 1;
                    match evicted {
                        Some(evicted) => Admission::AcceptedWithEviction { evicted },
                        None => Admission::Accepted,
                    }
                }
                None => {
                    self.counters.rejected += 1;
                    Admission::Dropped(DropReason::QueueFull)
                }
            };
        }

        if fill >= self.high_water_mark && !job.boundary && self.should_shed(fill, job.priority) {
            self.counters.shed += 1;
            return Admission::Dropped(DropReason::LoadShed);
        }

        self.insert(job);
        Admission::Accepted
    }

    fn should_shed(&mut self, fill: usize, score: f64) -> bool {
        // Shedding this job must keep shed/submitted within the cap
        let shed_after = (self.counters.shed + 1) as f64;
        if shed_after > self.max_drop_ratio * self.counters.submitted as f64 {
            return false;
        }
        let fill_ratio = fill as f64 / self.capacity as f64;
        let probability = (fill_ratio * score).clamp(0.0, 1.0);
        self.rng.gen_bool(probability)
    }

    /// Worst-scoring non-boundary resident that scores worse than `incoming`
    fn eviction_candidate(&self, incoming: f64) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.job.boundary && slot.job.priority > incoming)
            .max_by(|(_, a), (_, b)| {
                a.job
                    .priority
                    .total_cmp(&b.job.priority)
                    // Among equals evict the newest
                    .then(a.sequence.cmp(&b.sequence))
            })
            .map(|(index, _)| index)
    }

    fn insert(&mut self, job: FramePairJob) {
        self.counters.accepted += 1;
        self.slots.push_back(Slot {
            job,
            sequence: self.next_sequence,
        });
        self.next_sequence += 1;
    }

    /// Remove and return the most urgent job (lowest score, FIFO on ties)
    pub fn pop(&mut self) -> Option<FramePairJob> {
        let index = self
            .slots
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.job
                    .priority
                    .total_cmp(&b.job.priority)
                    .then(a.sequence.cmp(&b.sequence))
            })
            .map(|(index, _)| index)?;
        self.slots.remove(index).map(|slot| slot.job)
    }

    /// Remove every job; returns them in queue order
    pub fn drain(&mut self) -> Vec<FramePairJob> {
        self.slots.drain(..).map(|slot| slot.job).collect()
    }

    /// Jobs currently queued, in queue order
    pub fn snapshot(&self) -> Vec<FramePairJob> {
        self.slots.iter().map(|slot| slot.job.clone()).collect()
    }
}
