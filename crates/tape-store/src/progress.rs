//! Progress events via Redis Pub/Sub.
//!
//! Publishing is fire-and-forget relative to the durable job record: the
//! record is already persisted before anything is published here, and a
//! publish failure is logged by the caller, never propagated into the
//! state transition.

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::debug;

use tape_models::{JobId, JobStatus, ProgressMessage};

use crate::error::StoreResult;

/// Progress event published to Redis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Job ID
    pub job_id: JobId,
    /// Progress message
    pub message: ProgressMessage,
}

/// Channel for publishing/subscribing to progress events.
pub struct ProgressChannel {
    client: redis::Client,
}

impl ProgressChannel {
    /// Create a new progress channel.
    pub fn new(redis_url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    /// Create from the `REDIS_URL` environment variable.
    pub fn from_env() -> StoreResult<Self> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        Self::new(&url)
    }

    /// Get the channel name for a job.
    pub fn channel_name(job_id: &JobId) -> String {
        format!("progress:{}", job_id)
    }

    /// Publish a progress event.
    pub async fn publish(&self, event: &ProgressEvent) -> StoreResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let channel = Self::channel_name(&event.job_id);
        let payload = serde_json::to_string(event)?;

        debug!("Publishing progress event to {}", channel);
        conn.publish::<_, _, ()>(channel, payload).await?;

        Ok(())
    }

    /// Publish a status change.
    pub async fn status(&self, job_id: &JobId, status: JobStatus, progress: u8) -> StoreResult<()> {
        self.publish(&ProgressEvent {
            job_id: job_id.clone(),
            message: ProgressMessage::status(status, progress),
        })
        .await
    }

    /// Publish a progress update.
    pub async fn progress(&self, job_id: &JobId, value: u8, step: Option<String>) -> StoreResult<()> {
        self.publish(&ProgressEvent {
            job_id: job_id.clone(),
            message: ProgressMessage::progress(value, step),
        })
        .await
    }

    /// Publish a done message.
    pub async fn done(&self, job_id: &JobId, download_url: &str) -> StoreResult<()> {
        self.publish(&ProgressEvent {
            job_id: job_id.clone(),
            message: ProgressMessage::done(download_url),
        })
        .await
    }

    /// Publish an error message.
    pub async fn error(&self, job_id: &JobId, message: impl Into<String>) -> StoreResult<()> {
        self.publish(&ProgressEvent {
            job_id: job_id.clone(),
            message: ProgressMessage::error(message),
        })
        .await
    }

    /// Publish a log message.
    pub async fn log(&self, job_id: &JobId, message: impl Into<String>) -> StoreResult<()> {
        self.publish(&ProgressEvent {
            job_id: job_id.clone(),
            message: ProgressMessage::log(message),
        })
        .await
    }

    /// Subscribe to progress events for a job.
    /// Returns a pinned stream that can be polled with `.next()`.
    pub async fn subscribe(
        &self,
        job_id: &JobId,
    ) -> StoreResult<std::pin::Pin<Box<dyn futures_util::Stream<Item = ProgressEvent> + Send>>> {
        use futures_util::StreamExt;

        let mut pubsub = self.client.get_async_pubsub().await?;
        let channel = Self::channel_name(job_id);

        pubsub.subscribe(&channel).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            serde_json::from_str(&payload).ok()
        });

        Ok(Box::pin(stream))
    }
}
