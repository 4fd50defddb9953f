//! Outbound webhook notifications.
//!
//! Producers (the frame pipeline and motion threads) enqueue without
//! blocking; a single queue task hands each notification to a bounded pool
//! of delivery tasks. Failures are logged and dropped, never retried.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use facewatch_core::jpeg;
use facewatch_core::types::JPEG_MIME_TYPE;
use image::RgbImage;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

#[derive(Debug, Clone, PartialEq)]
pub struct NotifyConfig {
    /// Receives a `PUT` for every roster match.
    pub match_url: Option<String>,
    /// Receives a `POST` for every motion event.
    pub motion_url: Option<String>,
    pub timeout: Duration,
    /// Maximum deliveries in flight.
    pub workers: usize,
    /// Queue depth; further notifications are dropped.
    pub queue: usize,
    pub jpeg_quality: u8,
}

#[derive(Debug)]
pub enum Notification {
    Match {
        name: String,
        jpeg: Vec<u8>,
        at: DateTime<Utc>,
    },
    Motion {
        active: usize,
        at: DateTime<Utc>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MatchPayload<'a> {
    name: &'a str,
    image: String,
    date_time: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MotionPayload {
    motion: &'static str,
    count: usize,
    date_time: String,
}

/// Cheap, cloneable handle used by producers.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<Notification>,
    match_enabled: bool,
    motion_enabled: bool,
    jpeg_quality: u8,
}

impl Dispatcher {
    /// Queue a match notification for `name` with the face crop attached.
    /// Returns whether it was queued.
    pub fn notify_match(&self, name: &str, face: &RgbImage) -> bool {
        if !self.match_enabled {
            return false;
        }
        let jpeg = match jpeg::encode(face, self.jpeg_quality) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(name, error = %e, "failed to encode match image, dropping");
                return false;
            }
        };
        self.enqueue(Notification::Match {
            name: name.to_string(),
            jpeg,
            at: Utc::now(),
        })
    }

    /// Queue a motion notification carrying the active macroblock count.
    pub fn notify_motion(&self, active: usize) -> bool {
        if !self.motion_enabled {
            return false;
        }
        self.enqueue(Notification::Motion {
            active,
            at: Utc::now(),
        })
    }

    fn enqueue(&self, notification: Notification) -> bool {
        match self.tx.try_send(notification) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(n)) => {
                tracing::warn!(kind = n.kind(), "notification queue full, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(n)) => {
                tracing::warn!(kind = n.kind(), "notification queue closed, dropping");
                false
            }
        }
    }
}

/// Dispatcher with both kinds enabled whose queue is handed back to the
/// caller instead of a delivery task.
#[cfg(test)]
pub(crate) fn channel(queue: usize) -> (Dispatcher, mpsc::Receiver<Notification>) {
    let (tx, rx) = mpsc::channel(queue);
    let dispatcher = Dispatcher {
        tx,
        match_enabled: true,
        motion_enabled: true,
        jpeg_quality: 75,
    };
    (dispatcher, rx)
}

impl Notification {
    fn kind(&self) -> &'static str {
        match self {
            Notification::Match { .. } => "match",
            Notification::Motion { .. } => "motion",
        }
    }
}

/// Handle to the running queue task.
pub struct Workers {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Workers {
    /// Close the queue, deliver what is already queued, and wait up to
    /// `grace` for in-flight requests.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.stop.send(());
        match tokio::time::timeout(grace, self.task).await {
            Ok(Ok(())) => tracing::debug!("notification queue drained"),
            Ok(Err(e)) => tracing::warn!(error = %e, "notification task failed"),
            Err(_) => tracing::warn!(
                grace_ms = grace.as_millis() as u64,
                "notification queue not drained before shutdown"
            ),
        }
    }
}

/// Start the delivery task. Must be called from within a tokio runtime.
pub fn spawn(config: NotifyConfig) -> Result<(Dispatcher, Workers), reqwest::Error> {
    let client = reqwest::Client::builder().timeout(config.timeout).build()?;
    let (tx, rx) = mpsc::channel(config.queue.max(1));
    let (stop_tx, stop_rx) = oneshot::channel();

    let dispatcher = Dispatcher {
        tx,
        match_enabled: config.match_url.is_some(),
        motion_enabled: config.motion_url.is_some(),
        jpeg_quality: config.jpeg_quality,
    };

    tracing::info!(
        match_url = config.match_url.as_deref().unwrap_or("-"),
        motion_url = config.motion_url.as_deref().unwrap_or("-"),
        workers = config.workers,
        queue = config.queue,
        "notification dispatcher started"
    );

    let targets = Arc::new(Targets {
        match_url: config.match_url,
        motion_url: config.motion_url,
    });
    let task = tokio::spawn(run_queue(rx, stop_rx, client, targets, config.workers.max(1)));

    Ok((dispatcher, Workers { stop: stop_tx, task }))
}

struct Targets {
    match_url: Option<String>,
    motion_url: Option<String>,
}

async fn run_queue(
    mut rx: mpsc::Receiver<Notification>,
    mut stop: oneshot::Receiver<()>,
    client: reqwest::Client,
    targets: Arc<Targets>,
    workers: usize,
) {
    let permits = Arc::new(Semaphore::new(workers));
    let mut in_flight = JoinSet::new();
    let mut stopping = false;

    loop {
        let next = if stopping {
            rx.recv().await
        } else {
            tokio::select! {
                n = rx.recv() => n,
                _ = &mut stop => {
                    rx.close();
                    stopping = true;
                    continue;
                }
            }
        };
        let Some(notification) = next else { break };

        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let client = client.clone();
        let targets = Arc::clone(&targets);
        in_flight.spawn(async move {
            deliver(&client, &targets, notification).await;
            drop(permit);
        });
        while in_flight.try_join_next().is_some() {}
    }

    while in_flight.join_next().await.is_some() {}
}

async fn deliver(client: &reqwest::Client, targets: &Targets, notification: Notification) {
    let kind = notification.kind();
    let request = match notification {
        Notification::Match { name, jpeg, at } => {
            let Some(url) = targets.match_url.as_deref() else { return };
            let payload = MatchPayload {
                name: &name,
                image: format!(
                    "{JPEG_MIME_TYPE};base64,{}",
                    base64::engine::general_purpose::STANDARD.encode(&jpeg)
                ),
                date_time: at.to_rfc3339(),
            };
            tracing::debug!(url, name = %name, "sending match notification");
            client.put(url).json(&payload)
        }
        Notification::Motion { active, at } => {
            let Some(url) = targets.motion_url.as_deref() else { return };
            let payload = MotionPayload {
                motion: "on",
                count: active,
                date_time: at.to_rfc3339(),
            };
            tracing::debug!(url, active, "sending motion notification");
            client.post(url).json(&payload)
        }
    };

    match request.send().await {
        Ok(resp) if resp.status().is_success() => {
            tracing::debug!(kind, status = %resp.status(), "notification delivered");
        }
        Ok(resp) => {
            tracing::warn!(kind, status = %resp.status(), "notification rejected");
        }
        Err(e) => {
            tracing::warn!(kind, error = %e, "notification failed");
        }
    }
}
