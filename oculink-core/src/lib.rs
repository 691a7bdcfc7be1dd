//! Oculink integration core.
//!
//! The device-facing heart of the EMR: pooled SMB access to ophthalmology
//! devices, a durable priority job queue, format adapters, multi-strategy
//! patient-identity extraction, folder indexing, sync orchestration, and
//! granular clinical-record updates. The HTTP surface lives in
//! `oculink-server`; the document store is reached only through the ports
//! in [`ports`].
#![allow(missing_docs)]

pub mod adapters;
pub mod context;
pub mod error;
pub mod events;
pub mod indexer;
pub mod orchestrator;
pub mod ports;
pub mod processor;
pub mod queue;
pub mod records;
pub mod safety;
pub mod smb;
pub mod webhook;

pub use context::{ExternalPorts, IntegrationContext};
pub use error::{IntegrationError, Result};
pub use events::{Broadcaster, CoreEvent, DeviceEvent, EventEnvelope, FileEvent, JobEvent};
