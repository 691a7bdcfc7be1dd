//! Patient folder indexer.
//!
//! Devices that export per-patient folders name them with some mix of
//! legacy id and patient name. The indexer resolves folder names to
//! patient records through the directory port: stored mappings first, then
//! legacy-id lookup, then name heuristics. Unresolved folders are staged
//! as tickets for operator review.

use crate::error::Result;
use crate::events::{Broadcaster, FileEvent};
use crate::ports::{PatientDirectory, UnmatchedFolderStore};
use crate::smb::{ScanOptions, SmbClientPool};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use oculink_model::{
    Device, DeviceType, PatientCandidate, PatientId, UnmatchedFolderTicket, UserId,
};

const INDEX_SCAN_DEPTH: u32 = 5;
const INDEX_SCAN_MAX_FILES: usize = 2000;
const MAX_SUGGESTIONS: usize = 5;
/// Name-heuristic score required for an automatic match.
const AUTO_MATCH_SCORE: f64 = 0.85;

static ID_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z]{0,3}\d{3,12}$").expect("static regex"));

/// How a folder resolved.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FolderMatch {
    Matched {
        patient: PatientId,
        confidence: f64,
        via: &'static str,
    },
    Unmatched {
        suggestions: Vec<PatientCandidate>,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexerStats {
    pub folders_seen: u64,
    pub matched: u64,
    pub unmatched: u64,
    pub manual_links: u64,
}

/// Folder-name → patient resolution.
#[derive(Clone)]
pub struct PatientFolderIndexer {
    directory: Arc<dyn PatientDirectory>,
    unmatched: Arc<dyn UnmatchedFolderStore>,
    broadcaster: Broadcaster,
    folders_seen: Arc<AtomicU64>,
    matched: Arc<AtomicU64>,
    unmatched_count: Arc<AtomicU64>,
    manual_links: Arc<AtomicU64>,
}

impl std::fmt::Debug for PatientFolderIndexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatientFolderIndexer").finish()
    }
}

impl PatientFolderIndexer {
    pub fn new(
        directory: Arc<dyn PatientDirectory>,
        unmatched: Arc<dyn UnmatchedFolderStore>,
        broadcaster: Broadcaster,
    ) -> Self {
        Self {
            directory,
            unmatched,
            broadcaster,
            folders_seen: Arc::new(AtomicU64::new(0)),
            matched: Arc::new(AtomicU64::new(0)),
            unmatched_count: Arc::new(AtomicU64::new(0)),
            manual_links: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Resolve one folder name. Heuristic order: stored mapping, legacy-id
    /// token, name search.
    pub async fn find_patient_match(&self, folder_name: &str) -> Result<FolderMatch> {
        let folder_name = folder_name.trim();

        if let Some(patient) = self.directory.folder_mapping(folder_name).await? {
            return Ok(FolderMatch::Matched {
                patient,
                confidence: 1.0,
                via: "folder-mapping",
            });
        }

        let tokens: Vec<&str> = folder_name
            .split(['_', '-', ' ', '.'])
            .filter(|t| !t.is_empty())
            .collect();

        for token in &tokens {
            if ID_TOKEN.is_match(token) && token.bytes().any(|b| b.is_ascii_digit()) {
                if let Some(candidate) = self.directory.find_by_legacy_id(token).await? {
                    return Ok(FolderMatch::Matched {
                        patient: candidate.patient,
                        confidence: 0.9,
                        via: "legacy-id",
                    });
                }
            }
        }

        let name_tokens: Vec<&str> = tokens
            .iter()
            .filter(|t| t.len() >= 2 && t.chars().all(char::is_alphabetic))
            .copied()
            .collect();
        let mut suggestions = Vec::new();
        if let Some(last_name) = name_tokens.first() {
            let first_name = name_tokens.get(1).copied();
            suggestions = self.directory.search_by_name(last_name, first_name).await?;
            suggestions.truncate(MAX_SUGGESTIONS);

            // A lone strong candidate is safe to take automatically; ties go
            // to the operator.
            let strong: Vec<&PatientCandidate> = suggestions
                .iter()
                .filter(|c| c.score >= AUTO_MATCH_SCORE)
                .collect();
            if let [only] = strong.as_slice() {
                return Ok(FolderMatch::Matched {
                    patient: only.patient.clone(),
                    confidence: only.score,
                    via: "name-heuristic",
                });
            }
        }

        Ok(FolderMatch::Unmatched { suggestions })
    }

    /// Resolve one device folder, persisting the outcome: a confident match
    /// saves a folder mapping, a miss stages a review ticket.
    pub async fn index_folder(&self, device: &Device, folder_path: &str) -> Result<FolderMatch> {
        self.folders_seen.fetch_add(1, Ordering::Relaxed);
        let folder_name = folder_path.rsplit('/').next().unwrap_or(folder_path);

        let outcome = self.find_patient_match(folder_name).await?;
        match &outcome {
            FolderMatch::Matched {
                patient,
                confidence,
                via,
            } => {
                self.matched.fetch_add(1, Ordering::Relaxed);
                if *via != "folder-mapping" {
                    self.directory
                        .save_folder_mapping(folder_name, patient, device.device_type, None)
                        .await?;
                }
                self.broadcaster.publish(FileEvent::PatientMatched {
                    folder_name: folder_name.to_string(),
                    patient: patient.clone(),
                    confidence: *confidence,
                });
                info!(folder = folder_name, patient = %patient, via, "folder matched");
            }
            FolderMatch::Unmatched { suggestions } => {
                self.unmatched_count.fetch_add(1, Ordering::Relaxed);
                let ticket = UnmatchedFolderTicket::new(
                    folder_name,
                    device.device_type,
                    suggestions.clone(),
                );
                self.unmatched.stage(&ticket).await?;
                debug!(folder = folder_name, suggestions = suggestions.len(), "folder staged for review");
            }
        }
        Ok(outcome)
    }

    /// Scan one device for patient folders and index each directory found.
    /// Returns (folders seen, folders matched).
    pub async fn index_device_folder(
        &self,
        pool: &SmbClientPool,
        device: &Device,
        base_path: &str,
    ) -> Result<(u32, u32)> {
        let options = ScanOptions::shallow(INDEX_SCAN_DEPTH, INDEX_SCAN_MAX_FILES);
        let scan = pool.scan_directory_recursive(device, base_path, &options).await?;

        let mut seen = 0u32;
        let mut matched = 0u32;
        for directory in &scan.directories {
            seen += 1;
            if let FolderMatch::Matched { .. } = self.index_folder(device, &directory.path).await? {
                matched += 1;
            }
        }
        self.broadcaster.publish(FileEvent::FoldersIndexed {
            device: device.id.clone(),
            count: seen,
        });
        Ok((seen, matched))
    }

    /// Index every pollable device. Per-device failures are isolated.
    pub async fn index_all_devices(
        &self,
        pool: &SmbClientPool,
        devices: &[Device],
    ) -> Vec<(oculink_model::DeviceId, Result<(u32, u32)>)> {
        let mut results = Vec::with_capacity(devices.len());
        for device in devices.iter().filter(|d| d.is_pollable()) {
            let outcome = self
                .index_device_folder(pool, device, &device.export_path)
                .await;
            results.push((device.id.clone(), outcome));
        }
        results
    }

    /// Operator override: bind a folder to a patient explicitly.
    pub async fn manual_link_folder(
        &self,
        folder_path: &str,
        patient: PatientId,
        device_type: DeviceType,
        user: UserId,
    ) -> Result<()> {
        let folder_name = folder_path.rsplit('/').next().unwrap_or(folder_path);
        self.directory
            .save_folder_mapping(folder_name, &patient, device_type, Some(&user))
            .await?;
        self.manual_links.fetch_add(1, Ordering::Relaxed);
        info!(folder = folder_name, patient = %patient, user = %user, "folder linked manually");
        self.broadcaster.publish(FileEvent::PatientMatched {
            folder_name: folder_name.to_string(),
            patient,
            confidence: 1.0,
        });
        Ok(())
    }

    pub fn get_stats(&self) -> IndexerStats {
        IndexerStats {
            folders_seen: self.folders_seen.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            unmatched: self.unmatched_count.load(Ordering::Relaxed),
            manual_links: self.manual_links.load(Ordering::Relaxed),
        }
    }

    pub async fn get_unmatched_folders(&self) -> Result<Vec<UnmatchedFolderTicket>> {
        self.unmatched.list().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeDirectory {
        legacy: HashMap<String, PatientCandidate>,
        by_name: HashMap<String, Vec<PatientCandidate>>,
        mappings: Mutex<HashMap<String, PatientId>>,
    }

    #[async_trait]
    impl PatientDirectory for FakeDirectory {
        async fn find_by_legacy_id(&self, legacy_id: &str) -> Result<Option<PatientCandidate>> {
            Ok(self.legacy.get(legacy_id).cloned())
        }

        async fn search_by_name(
            &self,
            last_name: &str,
            _first_name: Option<&str>,
        ) -> Result<Vec<PatientCandidate>> {
            Ok(self
                .by_name
                .get(&last_name.to_ascii_uppercase())
                .cloned()
                .unwrap_or_default())
        }

        async fn folder_mapping(&self, folder_name: &str) -> Result<Option<PatientId>> {
            Ok(self.mappings.lock().unwrap().get(folder_name).cloned())
        }

        async fn save_folder_mapping(
            &self,
            folder_name: &str,
            patient: &PatientId,
            _device_type: DeviceType,
            _linked_by: Option<&UserId>,
        ) -> Result<()> {
            self.mappings
                .lock()
                .unwrap()
                .insert(folder_name.to_string(), patient.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeUnmatched {
        tickets: Mutex<Vec<UnmatchedFolderTicket>>,
    }

    #[async_trait]
    impl UnmatchedFolderStore for FakeUnmatched {
        async fn stage(&self, ticket: &UnmatchedFolderTicket) -> Result<()> {
            self.tickets.lock().unwrap().push(ticket.clone());
            Ok(())
        }

        async fn list(&self) -> Result<Vec<UnmatchedFolderTicket>> {
            Ok(self.tickets.lock().unwrap().clone())
        }
    }

    fn candidate(id: &str, name: &str, score: f64) -> PatientCandidate {
        PatientCandidate {
            patient: PatientId::from_trusted(id),
            display_name: name.to_string(),
            score,
        }
    }

    fn indexer(directory: FakeDirectory) -> (PatientFolderIndexer, Arc<FakeUnmatched>) {
        let unmatched = Arc::new(FakeUnmatched::default());
        (
            PatientFolderIndexer::new(
                Arc::new(directory),
                unmatched.clone(),
                Broadcaster::new(64),
            ),
            unmatched,
        )
    }

    #[tokio::test]
    async fn legacy_id_token_resolves() {
        let mut directory = FakeDirectory::default();
        directory
            .legacy
            .insert("A12345".into(), candidate("patient-000000001", "DUPONT Jean", 1.0));
        let (indexer, _) = indexer(directory);

        let outcome = indexer.find_patient_match("A12345_DUPONT").await.unwrap();
        match outcome {
            FolderMatch::Matched { confidence, via, .. } => {
                assert_eq!(via, "legacy-id");
                assert!((confidence - 0.9).abs() < 1e-9);
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn single_strong_name_candidate_auto_matches() {
        let mut directory = FakeDirectory::default();
        directory.by_name.insert(
            "DUPONT".into(),
            vec![candidate("patient-000000001", "DUPONT Jean", 0.92)],
        );
        let (indexer, _) = indexer(directory);

        let outcome = indexer.find_patient_match("DUPONT Jean").await.unwrap();
        assert!(matches!(
            outcome,
            FolderMatch::Matched { via: "name-heuristic", .. }
        ));
    }

    #[tokio::test]
    async fn ambiguous_candidates_stay_unmatched_with_suggestions() {
        let mut directory = FakeDirectory::default();
        directory.by_name.insert(
            "MARTIN".into(),
            vec![
                candidate("patient-000000001", "MARTIN Sophie", 0.9),
                candidate("patient-000000002", "MARTIN Simon", 0.88),
            ],
        );
        let (indexer, _) = indexer(directory);

        let outcome = indexer.find_patient_match("MARTIN").await.unwrap();
        match outcome {
            FolderMatch::Unmatched { suggestions } => assert_eq!(suggestions.len(), 2),
            other => panic!("expected unmatched, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stored_mapping_short_circuits() {
        let directory = FakeDirectory::default();
        directory.mappings.lock().unwrap().insert(
            "DUPONT_JEAN".into(),
            PatientId::from_trusted("patient-000000001"),
        );
        let (indexer, _) = indexer(directory);

        let outcome = indexer.find_patient_match("DUPONT_JEAN").await.unwrap();
        assert!(matches!(
            outcome,
            FolderMatch::Matched { via: "folder-mapping", confidence, .. } if confidence == 1.0
        ));
    }

    #[tokio::test]
    async fn unmatched_folder_stages_seven_day_ticket() {
        let (indexer, unmatched) = indexer(FakeDirectory::default());
        let device = oculink_model::Device {
            id: oculink_model::DeviceId::from_trusted("device-000000000009"),
            name: "Archive".into(),
            device_type: DeviceType::ArchiveNas,
            manufacturer: None,
            model: None,
            protocol: oculink_model::ConnectionProtocol::Smb,
            share: None,
            export_path: String::new(),
            mount_path: None,
            webhook_secret: None,
            integration: Default::default(),
            active: true,
        };
        let outcome = indexer.index_folder(&device, "exports/UNKNOWN_XYZ").await.unwrap();
        assert!(matches!(outcome, FolderMatch::Unmatched { .. }));

        let tickets = unmatched.list().await.unwrap();
        assert_eq!(tickets.len(), 1);
        let ttl = tickets[0].expires_at - tickets[0].created_at;
        assert_eq!(ttl.num_days(), 7);
        assert_eq!(indexer.get_stats().unmatched, 1);
    }
}
