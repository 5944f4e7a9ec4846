//! Shared data models for the GoodTape orchestrator.
//!
//! This crate provides Serde-serializable types for:
//! - Conversion jobs and their lifecycle status graph
//! - Output formats and quality selectors
//! - Source platform tags and platform-aware error classification
//! - Progress event schemas pushed to subscribed viewers

pub mod job;
pub mod platform;
pub mod progress;

// Re-export common types
pub use job::{
    CompletionMetadata, Job, JobId, JobSpec, JobStatus, JobValidation, OutputFormat, Quality,
};
pub use platform::{classify_error, ErrorClassification, ErrorKind, Platform, Severity};
pub use progress::ProgressMessage;
