use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::{JobStatus, JobSummary, UsageCost};

/// Reserved channel id for process-wide lifecycle events.
pub const GLOBAL_CHANNEL: &str = "global";

/// Per-job stream events, delivered on the channel named by the job id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum JobEvent {
    Connected {
        job_id: String,
    },
    StatusChanged {
        job_id: String,
        status: JobStatus,
    },
    AssistantText {
        job_id: String,
        text: String,
    },
    ToolUse {
        job_id: String,
        tool: String,
        summary: String,
    },
    ToolResult {
        job_id: String,
        summary: String,
    },
    Result {
        job_id: String,
        status: JobStatus,
        usage: Option<UsageCost>,
    },
    Error {
        job_id: String,
        message: String,
    },
}

/// Global lifecycle events. These carry only the minimal `JobSummary`
/// projection, never the full record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LifecycleEvent {
    JobCreated { job: JobSummary },
    JobStatusChanged { job: JobSummary },
    JobCompleted { job: JobSummary },
    JobFailed { job: JobSummary },
    WorkflowUpdated { repo: String, issue_number: i64 },
}

struct Subscriber {
    id: Uuid,
    tx: mpsc::UnboundedSender<String>,
}

/// Concurrency-safe registry of live subscribers per channel.
///
/// Each subscriber owns the receiving half of an unbounded channel, so
/// delivery happens on the subscriber's own task — a slow or dead consumer
/// never blocks the broadcasting state transition.
#[derive(Default)]
pub struct Broadcaster {
    channels: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber on a channel. Returns the subscriber id (for
    /// `unsubscribe`) and the receiving end of its private queue.
    pub fn subscribe(&self, channel: &str) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.lock()
            .entry(channel.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        (id, rx)
    }

    /// Subscribe to a job's event channel. The new subscriber immediately
    /// receives a [`JobEvent::Connected`] ack on its own queue, ahead of
    /// any job events.
    pub fn subscribe_job(&self, job_id: &str) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let ack = JobEvent::Connected {
            job_id: job_id.to_string(),
        };
        match serde_json::to_string(&ack) {
            Ok(json) => {
                let _ = tx.send(json);
            }
            Err(e) => tracing::warn!(job_id, error = %e, "failed to serialize connect ack"),
        }
        self.lock()
            .entry(job_id.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        (id, rx)
    }

    /// Remove a subscriber. Idempotent; an emptied channel is removed
    /// entirely so the registry never accumulates dead channel keys.
    pub fn unsubscribe(&self, channel: &str, id: Uuid) {
        let mut channels = self.lock();
        if let Some(subs) = channels.get_mut(channel) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                channels.remove(channel);
            }
        }
    }

    /// Serialize once and fan out to every live subscriber on the channel.
    /// No-op with zero subscribers; serialization failure is swallowed
    /// (logged) rather than propagated into the caller's state transition.
    pub fn broadcast<T: Serialize>(&self, channel: &str, event: &T) {
        let mut channels = self.lock();
        let Some(subs) = channels.get_mut(channel) else {
            return;
        };

        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(channel, error = %e, "failed to serialize event; dropping");
                return;
            }
        };

        // Prune subscribers whose receiver is gone as we go.
        subs.retain(|sub| sub.tx.send(json.clone()).is_ok());
        if subs.is_empty() {
            channels.remove(channel);
        }
    }

    /// Number of live subscribers on a channel (diagnostics and tests).
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.lock().get(channel).map_or(0, |subs| subs.len())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Subscriber>>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Command, Job};

    fn summary() -> JobSummary {
        Job::new("acme/widget", 7, "Add dark mode", Command::Plan).summary()
    }

    #[test]
    fn test_broadcast_without_subscribers_is_noop() {
        let broadcaster = Broadcaster::new();
        broadcaster.broadcast(
            "widget-7-plan",
            &JobEvent::Connected {
                job_id: "widget-7-plan".to_string(),
            },
        );
        assert_eq!(broadcaster.subscriber_count("widget-7-plan"), 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_subscribers() {
        let broadcaster = Broadcaster::new();
        let (_, mut rx1) = broadcaster.subscribe("widget-7-plan");
        let (_, mut rx2) = broadcaster.subscribe("widget-7-plan");

        broadcaster.broadcast(
            "widget-7-plan",
            &JobEvent::StatusChanged {
                job_id: "widget-7-plan".to_string(),
                status: JobStatus::Running,
            },
        );

        let a = rx1.recv().await.unwrap();
        let b = rx2.recv().await.unwrap();
        assert_eq!(a, b);
        assert!(a.contains("\"type\":\"StatusChanged\""));
        assert!(a.contains("\"status\":\"running\""));
    }

    #[tokio::test]
    async fn test_subscribe_job_acks_before_any_event() {
        let broadcaster = Broadcaster::new();
        let (_, mut rx) = broadcaster.subscribe_job("widget-7-plan");
        broadcaster.broadcast(
            "widget-7-plan",
            &JobEvent::StatusChanged {
                job_id: "widget-7-plan".to_string(),
                status: JobStatus::Running,
            },
        );

        let first = rx.recv().await.unwrap();
        assert!(first.contains("\"type\":\"Connected\""));
        assert!(first.contains("widget-7-plan"));
        let second = rx.recv().await.unwrap();
        assert!(second.contains("\"type\":\"StatusChanged\""));
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let broadcaster = Broadcaster::new();
        let (_, mut job_rx) = broadcaster.subscribe("widget-7-plan");
        let (_, mut global_rx) = broadcaster.subscribe(GLOBAL_CHANNEL);

        broadcaster.broadcast(GLOBAL_CHANNEL, &LifecycleEvent::JobCreated { job: summary() });

        let msg = global_rx.recv().await.unwrap();
        assert!(msg.contains("\"type\":\"JobCreated\""));
        assert!(job_rx.try_recv().is_err());
    }

    #[test]
    fn test_unsubscribe_removes_empty_channel() {
        let broadcaster = Broadcaster::new();
        let (id, _rx) = broadcaster.subscribe("widget-7-plan");
        assert_eq!(broadcaster.subscriber_count("widget-7-plan"), 1);
        broadcaster.unsubscribe("widget-7-plan", id);
        assert_eq!(broadcaster.subscriber_count("widget-7-plan"), 0);
        // Repeat unsubscribe is a no-op.
        broadcaster.unsubscribe("widget-7-plan", id);
    }

    #[test]
    fn test_dead_subscriber_is_pruned_on_broadcast() {
        let broadcaster = Broadcaster::new();
        let (_, rx) = broadcaster.subscribe("widget-7-plan");
        drop(rx);
        broadcaster.broadcast(
            "widget-7-plan",
            &JobEvent::Connected {
                job_id: "widget-7-plan".to_string(),
            },
        );
        assert_eq!(broadcaster.subscriber_count("widget-7-plan"), 0);
    }

    #[test]
    fn test_lifecycle_event_carries_summary_not_record() {
        let json =
            serde_json::to_value(LifecycleEvent::JobCompleted { job: summary() }).unwrap();
        assert_eq!(json["type"], "JobCompleted");
        assert_eq!(json["data"]["job"]["id"], "widget-7-plan");
        assert!(json["data"]["job"].get("issue_title").is_none());
    }
}
