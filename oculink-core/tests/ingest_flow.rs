//! End-to-end ingestion: a specular-microscope export travels from the SMB
//! share through the strategy chain and adapter into the measurement sink.

mod support;

use oculink_core::adapters::{AdapterRegistry, AdapterService};
use oculink_core::events::Broadcaster;
use oculink_core::indexer::PatientFolderIndexer;
use oculink_core::processor::{HttpOcrClient, OcrClient, UniversalFileProcessor};
use oculink_core::queue::handlers::{HandlerContext, register_builtin_handlers};
use oculink_core::queue::{
    AddJobOptions, DeviceSyncQueue, FileProcessJob, JobPayload, JobStatus, QueueConfig,
};
use oculink_core::smb::{FileCache, SmbClientPool, SmbPoolConfig};
use oculink_model::{IntegrationStatus, MeasurementType, PatientCandidate, PatientId, SourceChannel};
use std::sync::Arc;
use std::time::Duration;
use support::{
    FakeDeviceStore, FakeDirectory, FakeLogStore, FakeSink, FakeTransport, FakeUnmatched,
    smb_device,
};

const SPECULAR_EXPORT: &str = "\
NAME: DUPONT, Jean
ID: A12345
DOB: 15/01/1980
DATE: 2023-09-05
EYE: OD
ECD: 2512
CV: 32
HEX: 58
CCT: 543,2
NUM: 104
";

#[tokio::test]
async fn specular_export_lands_in_the_measurement_sink() {
    let broadcaster = Broadcaster::new(256);
    let device = smb_device("device-000000000001", None);

    let transport = Arc::new(FakeTransport::with_tree(&[(
        "",
        &[("exam1.txt", false, 256)][..],
    )]));
    transport
        .file_contents
        .lock()
        .unwrap()
        .insert("exam1.txt".to_string(), SPECULAR_EXPORT.as_bytes().to_vec());

    let cache_dir = std::env::temp_dir().join(format!("oculink-ingest-test-{}", std::process::id()));
    std::fs::create_dir_all(&cache_dir).unwrap();
    let pool = SmbClientPool::new(
        transport,
        FileCache::new(cache_dir, Duration::from_secs(300)),
        broadcaster.clone(),
        SmbPoolConfig::default(),
    );

    let devices = Arc::new(FakeDeviceStore::with_device(device.clone()));
    let sink = Arc::new(FakeSink::default());
    let logs = Arc::new(FakeLogStore::default());
    let directory = Arc::new(FakeDirectory::default());
    directory.legacy.lock().unwrap().insert(
        "A12345".to_string(),
        PatientCandidate {
            patient: PatientId::from_trusted("patient-0000000042"),
            display_name: "DUPONT Jean".to_string(),
            score: 1.0,
        },
    );

    let registry = AdapterRegistry::with_builtin();
    let adapters = AdapterService::new(registry.clone(), sink.clone(), logs.clone());
    // The OCR service is never reached for text exports; a dead endpoint
    // proves the chain stops at the adapter.
    let ocr: Arc<dyn OcrClient> = Arc::new(HttpOcrClient::new("http://127.0.0.1:1").unwrap());
    let processor = UniversalFileProcessor::new(registry, ocr);
    let indexer = PatientFolderIndexer::new(
        directory.clone(),
        Arc::new(FakeUnmatched::default()),
        broadcaster.clone(),
    );

    let queue = DeviceSyncQueue::without_redis(broadcaster.clone(), QueueConfig::default());
    register_builtin_handlers(
        &queue,
        Arc::new(HandlerContext {
            devices,
            directory,
            pool,
            processor,
            adapters,
            indexer,
            broadcaster: broadcaster.clone(),
        }),
    )
    .await;

    let receipt = queue
        .add_job(
            JobPayload::FileProcess(FileProcessJob {
                device: device.id.clone(),
                path: "exam1.txt".to_string(),
                patient: None,
                source: SourceChannel::ScheduledSync,
            }),
            AddJobOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(receipt.status, JobStatus::Completed);

    let job = queue.get_job(&receipt.job_id).await.unwrap().unwrap();
    let result = job.result.unwrap();
    assert_eq!(result["patient_resolved"], true);
    assert_eq!(result["measurements"], 1);

    let measurements = sink.measurements.lock().unwrap();
    assert_eq!(measurements.len(), 1);
    let measurement = &measurements[0];
    assert_eq!(measurement.measurement_type, MeasurementType::SpecularMicroscopy);
    assert_eq!(measurement.patient.as_str(), "patient-0000000042");
    assert_eq!(measurement.values["ecd"], 2512.0);
    assert_eq!(measurement.quality.overall, 100.0);
    drop(measurements);

    let entries = logs.entries.lock().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, IntegrationStatus::Success);
    assert_eq!(entries[0].processing.unwrap().records_processed, 1);
}
