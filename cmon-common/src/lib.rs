//! # Continuity Monitor Common Library
//!
//! Shared code for the continuity-monitoring services including:
//! - Common error type
//! - Configuration loading and root folder resolution
//! - Logging initialisation
//! - Event types (CmonEvent enum) and the EventBus
//! - The binary transport envelope
//! - Utility functions

pub mod config;
pub mod envelope;
pub mod error;
pub mod events;
pub mod logging;
pub mod time;

pub use envelope::Envelope;
pub use error::{Error, Result};
