//! Typed event channels for the integration core.
//!
//! Three event families (job, device, file lifecycle) with strongly typed
//! payloads, fanned out through a central [`Broadcaster`]. The WebSocket sink
//! and any in-process subscriber receive the same stream; when nobody is
//! listening, publishing is a no-op rather than an error.

use chrono::{DateTime, Utc};
use oculink_model::{DeviceId, PatientId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Job lifecycle events emitted by the priority queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobEvent {
    Added {
        job_id: String,
        job_type: String,
        priority: u8,
    },
    Started {
        job_id: String,
        job_type: String,
        attempt: u32,
    },
    Completed {
        job_id: String,
        job_type: String,
        duration_ms: u64,
    },
    Failed {
        job_id: String,
        job_type: String,
        error: String,
    },
    Retry {
        job_id: String,
        job_type: String,
        retries_left: u32,
        delay_ms: u64,
    },
}

/// Device lifecycle events: sync progress, webhooks, reconnect state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceEvent {
    SyncStarted {
        device: DeviceId,
    },
    SyncCompleted {
        device: DeviceId,
        files_queued: u32,
        directories_seen: u32,
    },
    SyncError {
        device: DeviceId,
        error: String,
    },
    /// One full scheduler tick over the fleet finished.
    SyncCycleComplete {
        devices: u32,
        succeeded: u32,
        failed: u32,
        skipped: u32,
    },
    WebhookReceived {
        device: DeviceId,
        event_type: String,
    },
    Reconnecting {
        device: DeviceId,
        attempt: u32,
        delay_ms: u64,
    },
    Reconnected {
        device: DeviceId,
        attempts: u32,
    },
    ReconnectFailed {
        device: DeviceId,
        attempts: u32,
        error: String,
    },
}

/// File lifecycle and indexing events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileEvent {
    Detected {
        device: DeviceId,
        path: String,
        size: u64,
    },
    Removed {
        device: DeviceId,
        path: String,
    },
    Processed {
        device: DeviceId,
        path: String,
        measurements: u32,
    },
    PatientMatched {
        folder_name: String,
        patient: PatientId,
        confidence: f64,
    },
    FoldersIndexed {
        device: DeviceId,
        count: u32,
    },
}

/// Union of all event families carried by the broadcaster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CoreEvent {
    Job(JobEvent),
    Device(DeviceEvent),
    File(FileEvent),
}

impl CoreEvent {
    /// Wire name used in the broadcast envelope's `type` field.
    pub fn event_type(&self) -> &'static str {
        match self {
            CoreEvent::Job(JobEvent::Added { .. }) => "job_added",
            CoreEvent::Job(JobEvent::Started { .. }) => "job_started",
            CoreEvent::Job(JobEvent::Completed { .. }) => "job_completed",
            CoreEvent::Job(JobEvent::Failed { .. }) => "job_failed",
            CoreEvent::Job(JobEvent::Retry { .. }) => "job_retry",
            CoreEvent::Device(DeviceEvent::SyncStarted { .. }) => "device_sync_started",
            CoreEvent::Device(DeviceEvent::SyncCompleted { .. }) => "device_sync_completed",
            CoreEvent::Device(DeviceEvent::SyncError { .. }) => "device_sync_error",
            CoreEvent::Device(DeviceEvent::SyncCycleComplete { .. }) => "sync_complete",
            CoreEvent::Device(DeviceEvent::WebhookReceived { .. }) => "webhook_received",
            CoreEvent::Device(DeviceEvent::Reconnecting { .. }) => "reconnecting",
            CoreEvent::Device(DeviceEvent::Reconnected { .. }) => "reconnected",
            CoreEvent::Device(DeviceEvent::ReconnectFailed { .. }) => "reconnect_failed",
            CoreEvent::File(FileEvent::Detected { .. }) => "file_detected",
            CoreEvent::File(FileEvent::Removed { .. }) => "file_removed",
            CoreEvent::File(FileEvent::Processed { .. }) => "file_processed",
            CoreEvent::File(FileEvent::PatientMatched { .. }) => "patient_matched",
            CoreEvent::File(FileEvent::FoldersIndexed { .. }) => "folders_indexed",
        }
    }

    /// Serialize into the `{type, data, timestamp}` broadcast envelope.
    pub fn envelope(&self) -> EventEnvelope {
        let data = match self {
            CoreEvent::Job(inner) => serde_json::to_value(inner),
            CoreEvent::Device(inner) => serde_json::to_value(inner),
            CoreEvent::File(inner) => serde_json::to_value(inner),
        }
        .unwrap_or(Value::Null);

        // Enum payloads serialize as {"VariantName": {..fields}}; the sink
        // wants the bare field object.
        let data = match data {
            Value::Object(map) if map.len() == 1 => {
                map.into_iter().next().map(|(_, v)| v).unwrap_or(Value::Null)
            }
            other => other,
        };

        EventEnvelope {
            event_type: self.event_type().to_string(),
            data,
            timestamp: Utc::now(),
        }
    }
}

impl From<JobEvent> for CoreEvent {
    fn from(event: JobEvent) -> Self {
        CoreEvent::Job(event)
    }
}

impl From<DeviceEvent> for CoreEvent {
    fn from(event: DeviceEvent) -> Self {
        CoreEvent::Device(event)
    }
}

impl From<FileEvent> for CoreEvent {
    fn from(event: FileEvent) -> Self {
        CoreEvent::File(event)
    }
}

/// Serialized broadcast envelope shared with the WebSocket sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

/// Central fan-out for core events.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<CoreEvent>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish to all current subscribers. Lagging receivers drop the oldest
    /// events; publishing never blocks or fails.
    pub fn publish(&self, event: impl Into<CoreEvent>) {
        let _ = self.tx.send(event.into());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oculink_model::DeviceId;

    #[tokio::test]
    async fn envelope_unwraps_variant_payload() {
        let event = CoreEvent::Device(DeviceEvent::Reconnecting {
            device: DeviceId::from_trusted("device-000000000001"),
            attempt: 2,
            delay_ms: 1000,
        });
        let envelope = event.envelope();
        assert_eq!(envelope.event_type, "reconnecting");
        assert_eq!(envelope.data["attempt"], 2);
        assert_eq!(envelope.data["delayMs"], 1000);
    }

    #[tokio::test]
    async fn broadcast_reaches_all_subscribers() {
        let broadcaster = Broadcaster::new(16);
        let mut first = broadcaster.subscribe();
        let mut second = broadcaster.subscribe();

        broadcaster.publish(JobEvent::Added {
            job_id: "file_process_1_aaaa".into(),
            job_type: "file_process".into(),
            priority: 1,
        });

        for receiver in [&mut first, &mut second] {
            let event = receiver.recv().await.unwrap();
            assert_eq!(event.event_type(), "job_added");
        }
    }
}
