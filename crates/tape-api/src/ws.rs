//! WebSocket progress push with backpressure support.
//!
//! Subscriptions are connection-scoped and purely in memory: the
//! registry is rebuilt from nothing on restart and a dropped connection
//! just disappears from it. Push is an optimization: clients that lose
//! the socket recover from `GET /status/{job_id}`, which reads the
//! durable record.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, info, warn};

use tape_models::{JobId, ProgressMessage};

use crate::metrics;
use crate::state::AppState;

/// Bounded send buffer per connection.
const WS_SEND_BUFFER_SIZE: usize = 32;
const WS_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Global counter for active WebSocket connections.
static ACTIVE_WS_CONNECTIONS: AtomicI64 = AtomicI64::new(0);

/// Connection-scoped subscriber counts keyed by job id. Only used for
/// push bookkeeping and admin statistics; never durable.
pub struct SubscriberRegistry {
    inner: RwLock<HashMap<String, usize>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Register one subscriber for a job.
    pub async fn add(&self, job_id: &JobId) {
        let mut map = self.inner.write().await;
        *map.entry(job_id.to_string()).or_insert(0) += 1;
    }

    /// Remove one subscriber for a job.
    pub async fn remove(&self, job_id: &JobId) {
        let mut map = self.inner.write().await;
        if let Some(count) = map.get_mut(job_id.as_str()) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                map.remove(job_id.as_str());
            }
        }
    }

    /// Total subscribers across all jobs.
    pub async fn total(&self) -> usize {
        self.inner.read().await.values().sum()
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Query parameters for the progress socket.
#[derive(Debug, Deserialize)]
pub struct WsProgressQuery {
    pub job_id: String,
}

/// WebSocket progress endpoint.
pub async fn ws_progress(
    ws: WebSocketUpgrade,
    Query(query): Query<WsProgressQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let count = ACTIVE_WS_CONNECTIONS.fetch_add(1, Ordering::SeqCst) + 1;
    metrics::set_ws_active_connections(count);
    metrics::record_ws_connection();

    ws.on_upgrade(|socket| async move {
        handle_progress_socket(socket, state, query.job_id).await;
        let count = ACTIVE_WS_CONNECTIONS.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::set_ws_active_connections(count);
    })
}

/// Send a message with backpressure handling.
async fn send_ws_message(tx: &mpsc::Sender<Message>, msg: &ProgressMessage) -> bool {
    let json = match serde_json::to_string(msg) {
        Ok(j) => j,
        Err(_) => return false,
    };
    match tx.try_send(Message::Text(json.clone())) {
        Ok(_) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            debug!("WebSocket send buffer full, applying backpressure");
            tx.send(Message::Text(json)).await.is_ok()
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// Handle one progress connection.
async fn handle_progress_socket(socket: WebSocket, state: AppState, job_id: String) {
    let (ws_sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::channel::<Message>(WS_SEND_BUFFER_SIZE);

    let send_task = tokio::spawn(async move {
        let mut ws_sender = ws_sender;
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let job_id = JobId::from_string(job_id);

    // The job must exist before we hold a subscription open for it.
    let job = match state.manager.get_job(&job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            let error = ProgressMessage::error("Job not found");
            send_ws_message(&tx, &error).await;
            drop(tx);
            let _ = send_task.await;
            return;
        }
        Err(e) => {
            let error = ProgressMessage::error(format!("Failed to load job: {e}"));
            send_ws_message(&tx, &error).await;
            drop(tx);
            let _ = send_task.await;
            return;
        }
    };

    info!(job_id = %job_id, "WebSocket progress subscription started");
    state.subscribers.add(&job_id).await;

    // Release the registry slot however this connection ends.
    let registry = state.subscribers.clone();
    let registry_job = job_id.clone();
    let _guard = scopeguard::guard((), move |_| {
        tokio::spawn(async move {
            registry.remove(&registry_job).await;
        });
    });

    // Current snapshot first, so a reconnecting client catches up even
    // if no further events arrive.
    send_ws_message(&tx, &ProgressMessage::status(job.status, job.progress)).await;
    if job.is_terminal() {
        let last = match (&job.download_url, &job.error_message) {
            (Some(url), _) => ProgressMessage::done(url.clone()),
            (_, Some(message)) => ProgressMessage::error(message.clone()),
            _ => ProgressMessage::status(job.status, job.progress),
        };
        send_ws_message(&tx, &last).await;
        drop(tx);
        let _ = send_task.await;
        return;
    }

    match state.manager.progress().subscribe(&job_id).await {
        Ok(mut stream) => {
            let mut heartbeat = interval(WS_HEARTBEAT_INTERVAL);
            let mut last_activity = std::time::Instant::now();

            loop {
                tokio::select! {
                    event = stream.next() => {
                        match event {
                            Some(event) => {
                                last_activity = std::time::Instant::now();
                                let msg_type = match &event.message {
                                    ProgressMessage::Status { .. } => "status",
                                    ProgressMessage::Progress { .. } => "progress",
                                    ProgressMessage::Done { .. } => "done",
                                    ProgressMessage::Error { .. } => "error",
                                    ProgressMessage::Log { .. } => "log",
                                };
                                metrics::record_ws_message_sent(msg_type);

                                if !send_ws_message(&tx, &event.message).await {
                                    warn!(job_id = %job_id, "WebSocket send failed, dropping subscriber");
                                    break;
                                }
                                if event.message.is_terminal() {
                                    break;
                                }
                            }
                            None => break, // Stream ended
                        }
                    }
                    _ = heartbeat.tick() => {
                        if last_activity.elapsed() > WS_HEARTBEAT_INTERVAL / 2 {
                            if tx.send(Message::Ping(vec![])).await.is_err() {
                                warn!(job_id = %job_id, "Heartbeat failed, client disconnected");
                                break;
                            }
                        }
                    }
                    client_msg = receiver.next() => {
                        match client_msg {
                            Some(Ok(Message::Pong(_))) => {
                                last_activity = std::time::Instant::now();
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                info!(job_id = %job_id, "Client closed connection");
                                break;
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
        Err(e) => {
            let error = ProgressMessage::error(format!("Failed to subscribe to progress: {e}"));
            send_ws_message(&tx, &error).await;
        }
    }

    drop(tx);
    let _ = send_task.await;
    info!(job_id = %job_id, "WebSocket progress subscription ended");
}
