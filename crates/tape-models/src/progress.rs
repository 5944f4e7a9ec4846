//! Progress event schema pushed to subscribed viewers.
//!
//! These events are a best-effort optimization; the durable job record
//! remains the source of truth and clients recover by polling the
//! status endpoint after a dropped connection.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::job::JobStatus;

/// Progress message envelope pushed over the wire.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressMessage {
    /// Status changed (queued/processing/completed/failed)
    Status {
        status: JobStatus,
        progress: u8,
    },

    /// Progress update (0-100)
    Progress {
        value: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        step: Option<String>,
    },

    /// Conversion complete, result available
    Done {
        #[serde(rename = "downloadUrl")]
        download_url: String,
    },

    /// Conversion failed
    Error {
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Informational log line
    Log {
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl ProgressMessage {
    /// Create a status-change message.
    pub fn status(status: JobStatus, progress: u8) -> Self {
        Self::Status { status, progress }
    }

    /// Create a progress message.
    pub fn progress(value: u8, step: Option<String>) -> Self {
        Self::Progress { value, step }
    }

    /// Create a done message.
    pub fn done(download_url: impl Into<String>) -> Self {
        Self::Done {
            download_url: download_url.into(),
        }
    }

    /// Create an error message.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a log message.
    pub fn log(message: impl Into<String>) -> Self {
        Self::Log {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// True for messages after which no further events will arrive.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressMessage::Done { .. } | ProgressMessage::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let msg = ProgressMessage::progress(40, Some("transcoding".into()));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["value"], 40);
        assert_eq!(json["step"], "transcoding");
    }

    #[test]
    fn done_and_error_are_terminal() {
        assert!(ProgressMessage::done("https://cdn.example.com/x.mp3").is_terminal());
        assert!(ProgressMessage::error("boom").is_terminal());
        assert!(!ProgressMessage::progress(10, None).is_terminal());
        assert!(!ProgressMessage::status(JobStatus::Processing, 10).is_terminal());
    }
}
