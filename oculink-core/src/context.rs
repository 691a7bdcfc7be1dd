//! Composition root.
//!
//! Builds the whole integration core from configuration plus the external
//! store ports, with no global singletons: everything the server (or a
//! test) needs hangs off one [`IntegrationContext`].

use crate::adapters::{AdapterRegistry, AdapterService};
use crate::error::Result;
use crate::events::Broadcaster;
use crate::indexer::PatientFolderIndexer;
use crate::orchestrator::{SyncOrchestrator, SyncSettings};
use crate::ports::{
    DeviceStore, IntegrationLogStore, MeasurementSink, PatientDirectory, UnmatchedFolderStore,
};
use crate::processor::{HttpOcrClient, OcrClient, UniversalFileProcessor};
use crate::queue::handlers::{HandlerContext, register_builtin_handlers};
use crate::queue::{DeviceSyncQueue, QueueConfig, RedisQueueStore};
use crate::records::{GranularRecordUpdater, RecordPatchStore};
use crate::smb::{FileCache, ReconnectPolicy, SmbClientPool, SmbPoolConfig, SmbclientTransport};
use oculink_config::Config;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Ports to the external document store, provided by the embedding
/// application.
pub struct ExternalPorts {
    pub devices: Arc<dyn DeviceStore>,
    pub measurements: Arc<dyn MeasurementSink>,
    pub logs: Arc<dyn IntegrationLogStore>,
    pub directory: Arc<dyn PatientDirectory>,
    pub unmatched: Arc<dyn UnmatchedFolderStore>,
    pub record_patches: Arc<dyn RecordPatchStore>,
}

/// Fully wired integration core.
#[derive(Clone)]
pub struct IntegrationContext {
    pub broadcaster: Broadcaster,
    pub pool: SmbClientPool,
    pub queue: DeviceSyncQueue,
    pub processor: UniversalFileProcessor,
    pub adapters: AdapterService,
    pub indexer: PatientFolderIndexer,
    pub orchestrator: SyncOrchestrator,
    pub records: GranularRecordUpdater,
    pub devices: Arc<dyn DeviceStore>,
}

impl std::fmt::Debug for IntegrationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrationContext").finish()
    }
}

impl IntegrationContext {
    /// Wire the core. Redis is attempted once here; failure selects the
    /// non-durable fallback rather than aborting startup.
    pub async fn initialize(config: &Config, ports: ExternalPorts) -> Result<Self> {
        let broadcaster = Broadcaster::default();

        let cache_dir: PathBuf = match &config.cache_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                dir.clone()
            }
            None => {
                let dir = std::env::temp_dir().join("oculink-smb-cache");
                tokio::fs::create_dir_all(&dir).await?;
                dir
            }
        };

        let transport = Arc::new(SmbclientTransport::new(
            config.smb.client_path.clone(),
            Duration::from_secs(config.smb.command_timeout_secs),
        ));
        let cache = FileCache::new(
            cache_dir,
            Duration::from_secs(config.smb.cache_timeout_secs),
        );
        let pool = SmbClientPool::new(
            transport,
            cache,
            broadcaster.clone(),
            SmbPoolConfig {
                cache_timeout: Duration::from_secs(config.smb.cache_timeout_secs),
                reconnect: ReconnectPolicy {
                    max_attempts: config.smb.reconnect.max_attempts,
                    base_delay_ms: config.smb.reconnect.base_delay_ms,
                    max_delay_ms: config.smb.reconnect.max_delay_ms,
                    backoff_multiplier: config.smb.reconnect.backoff_multiplier,
                },
                auto_reconnect: config.smb.auto_reconnect,
            },
        );

        let queue_config = QueueConfig {
            concurrency: config.queue.concurrency,
            seen_ttl: Duration::from_secs(config.queue.seen_ttl_secs),
            ..QueueConfig::default()
        };
        let queue = match &config.redis.url {
            Some(url) => match RedisQueueStore::connect(url).await {
                Ok(store) => DeviceSyncQueue::with_store(
                    Arc::new(store),
                    broadcaster.clone(),
                    queue_config.clone(),
                ),
                Err(e) => {
                    warn!(error = %e, "Redis unreachable, using in-process fallback queue");
                    DeviceSyncQueue::without_redis(broadcaster.clone(), queue_config.clone())
                }
            },
            None => DeviceSyncQueue::without_redis(broadcaster.clone(), queue_config),
        };

        let registry = AdapterRegistry::with_builtin();
        let adapters = AdapterService::new(
            registry.clone(),
            ports.measurements.clone(),
            ports.logs.clone(),
        );
        let ocr: Arc<dyn OcrClient> = Arc::new(HttpOcrClient::new(config.ocr.base_url.clone())?);
        let processor = UniversalFileProcessor::new(registry, ocr);

        let indexer = PatientFolderIndexer::new(
            ports.directory.clone(),
            ports.unmatched.clone(),
            broadcaster.clone(),
        );

        let orchestrator = SyncOrchestrator::new(
            ports.devices.clone(),
            pool.clone(),
            queue.clone(),
            ports.logs.clone(),
            broadcaster.clone(),
            SyncSettings {
                poll_interval: Duration::from_secs(config.sync.poll_interval_minutes * 60),
                watch_interval: Duration::from_secs(config.sync.watch_interval_secs),
            },
        );

        let handler_ctx = Arc::new(HandlerContext {
            devices: ports.devices.clone(),
            directory: ports.directory.clone(),
            pool: pool.clone(),
            processor: processor.clone(),
            adapters: adapters.clone(),
            indexer: indexer.clone(),
            broadcaster: broadcaster.clone(),
        });
        register_builtin_handlers(&queue, handler_ctx).await;

        let records = GranularRecordUpdater::new(ports.record_patches.clone());

        info!(durable = queue.is_durable(), "integration core initialized");
        Ok(Self {
            broadcaster,
            pool,
            queue,
            processor,
            adapters,
            indexer,
            orchestrator,
            records,
            devices: ports.devices,
        })
    }

    /// Start background processing: queue workers and, when configured,
    /// the scheduled poller plus device watchers.
    pub fn start(&self, auto_sync: bool) {
        self.queue.start_processing();
        if auto_sync {
            self.orchestrator.start_scheduler();
            let orchestrator = self.orchestrator.clone();
            tokio::spawn(async move {
                orchestrator.start_watchers().await;
            });
        }
    }

    pub async fn shutdown(&self) {
        self.orchestrator.shutdown().await;
    }
}
