//! Webhook ingress scenarios: signature verification, dispatch, and the
//! integration-state bookkeeping around them.

mod support;

use oculink_core::events::{Broadcaster, CoreEvent, JobEvent};
use oculink_core::orchestrator::{
    SyncOrchestrator, SyncSettings, WebhookOutcome, WebhookRequest,
};
use oculink_core::queue::{DeviceSyncQueue, QueueConfig};
use oculink_core::smb::{FileCache, SmbClientPool, SmbPoolConfig};
use oculink_core::webhook;
use oculink_model::{DeviceId, IntegrationStatus, SyncOutcome};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use support::{FakeDeviceStore, FakeLogStore, FakeTransport, smb_device};

struct Fixture {
    orchestrator: SyncOrchestrator,
    devices: Arc<FakeDeviceStore>,
    logs: Arc<FakeLogStore>,
    broadcaster: Broadcaster,
}

fn fixture(secret: Option<&str>) -> Fixture {
    let broadcaster = Broadcaster::new(256);
    let devices = Arc::new(FakeDeviceStore::with_device(smb_device("device-000000000001", secret)));
    let logs = Arc::new(FakeLogStore::default());

    let cache_dir = std::env::temp_dir().join(format!("oculink-webhook-test-{}", std::process::id()));
    std::fs::create_dir_all(&cache_dir).unwrap();
    let pool = SmbClientPool::new(
        Arc::new(FakeTransport::default()),
        FileCache::new(cache_dir, Duration::from_secs(300)),
        broadcaster.clone(),
        SmbPoolConfig::default(),
    );
    let queue = DeviceSyncQueue::without_redis(broadcaster.clone(), QueueConfig::default());

    let orchestrator = SyncOrchestrator::new(
        devices.clone(),
        pool,
        queue,
        logs.clone(),
        broadcaster.clone(),
        SyncSettings::default(),
    );
    Fixture {
        orchestrator,
        devices,
        logs,
        broadcaster,
    }
}

fn request(signature: Option<String>, payload: serde_json::Value) -> WebhookRequest {
    WebhookRequest {
        device_id: DeviceId::from_trusted("device-000000000001"),
        signature,
        headers: BTreeMap::new(),
        payload,
        source_ip: Some("10.0.0.8".to_string()),
        user_agent: Some("DeviceAgent/2.1".to_string()),
    }
}

#[tokio::test]
async fn valid_signature_enqueues_priority_one_file_process() {
    let fixture = fixture(Some("abc"));
    let mut events = fixture.broadcaster.subscribe();

    let payload = json!({
        "eventType": "file_created",
        "filePath": "/exports/img1.dcm",
        "patientId": "patient-0000000042",
    });
    let signature = webhook::sign(&webhook::canonical_body(&payload), "abc");

    let outcome = fixture
        .orchestrator
        .handle_webhook(request(Some(signature), payload))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        WebhookOutcome::Processed { ref event_type } if event_type == "file_created"
    ));

    let mut added_priority = None;
    let mut webhook_received = false;
    while let Ok(event) = events.try_recv() {
        match event {
            CoreEvent::Job(JobEvent::Added { priority, job_type, .. })
                if job_type == "file_process" =>
            {
                added_priority = Some(priority);
            }
            ref e if e.event_type() == "webhook_received" => webhook_received = true,
            _ => {}
        }
    }
    assert_eq!(added_priority, Some(1));
    assert!(webhook_received);

    let integration = fixture
        .devices
        .integration(&DeviceId::from_trusted("device-000000000001"));
    assert_eq!(integration.webhook_count, 1);
    assert_eq!(integration.consecutive_errors, 0);
    assert_eq!(integration.last_sync_status, Some(SyncOutcome::Success));
}

#[tokio::test]
async fn invalid_signature_is_rejected_and_logged() {
    let fixture = fixture(Some("abc"));
    let mut events = fixture.broadcaster.subscribe();

    let payload = json!({
        "eventType": "file_created",
        "filePath": "/exports/img1.dcm",
    });
    let outcome = fixture
        .orchestrator
        .handle_webhook(request(Some("deadbeef".to_string()), payload))
        .await
        .unwrap();
    assert!(matches!(outcome, WebhookOutcome::InvalidSignature));

    let entries = fixture.logs.entries.lock().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, IntegrationStatus::Failed);
    assert_eq!(
        entries[0].error_details.as_ref().unwrap().code,
        "INVALID_SIGNATURE"
    );
    let audit = entries[0].webhook.as_ref().unwrap();
    assert!(!audit.signature_verified);
    drop(entries);

    while let Ok(event) = events.try_recv() {
        assert_ne!(event.event_type(), "job_added", "no job may be enqueued");
    }

    let integration = fixture
        .devices
        .integration(&DeviceId::from_trusted("device-000000000001"));
    assert_eq!(integration.consecutive_errors, 1);
    assert_eq!(integration.last_sync_status, Some(SyncOutcome::Failed));
    assert_eq!(integration.webhook_count, 0);
}

#[tokio::test]
async fn missing_secret_fails_closed() {
    let fixture = fixture(None);
    let payload = json!({"eventType": "file_created", "filePath": "/exports/a.dcm"});
    let signature = webhook::sign(&webhook::canonical_body(&payload), "abc");

    let outcome = fixture
        .orchestrator
        .handle_webhook(request(Some(signature), payload))
        .await
        .unwrap();
    assert!(matches!(outcome, WebhookOutcome::InvalidSignature));
}

#[tokio::test]
async fn unknown_event_types_are_dropped_but_acknowledged() {
    let fixture = fixture(Some("abc"));
    let mut events = fixture.broadcaster.subscribe();

    let payload = json!({"eventType": "firmware_update", "version": "2.0"});
    let signature = webhook::sign(&webhook::canonical_body(&payload), "abc");

    let outcome = fixture
        .orchestrator
        .handle_webhook(request(Some(signature), payload))
        .await
        .unwrap();
    assert!(matches!(outcome, WebhookOutcome::Processed { .. }));

    while let Ok(event) = events.try_recv() {
        assert_ne!(event.event_type(), "job_added");
    }
}

#[tokio::test]
async fn unknown_device_reports_not_found() {
    let fixture = fixture(Some("abc"));
    let mut request = request(None, json!({"eventType": "file_created"}));
    request.device_id = DeviceId::from_trusted("device-does-not-exist");

    let outcome = fixture.orchestrator.handle_webhook(request).await.unwrap();
    assert!(matches!(outcome, WebhookOutcome::UnknownDevice));
}
