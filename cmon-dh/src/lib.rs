//! # Continuity Monitor Detector Host (cmon-dh)
//!
//! Runs untrusted third-party detector plugins inside hardened containers
//! and schedules frame-pair analysis across them.
//!
//! **Architecture:**
//! - `runtime`: container engine adapter (build, run with profile, stats, stop)
//! - `channel`: filesystem request/response channel into each container
//! - `installer`: package validation, security scan, image build, registry
//! - `manager`: detector process lifecycle and communication loops
//! - `scheduler`: prioritised, deduplicated frame-pair work plus result cache
//! - `aggregation`: continuity-error groups and false-positive moderation
//! - `service`: composition root used by the API gateway and the CLI

pub mod aggregation;
pub mod channel;
pub mod config;
pub mod error;
pub mod frames;
pub mod installer;
pub mod manager;
pub mod models;
pub mod runtime;
pub mod scheduler;
pub mod service;

pub use error::{DetectorError, Result};
pub use service::DetectorService;
