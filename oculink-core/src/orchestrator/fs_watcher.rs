//! Filesystem watcher for locally mounted shares.
//!
//! When a device share is also mounted on this host, inotify-class events
//! beat polling. Events wait out a 2 s quiet period (write stabilization)
//! so half-copied exports are not processed. On hosts where the mount is a
//! network filesystem the watcher refuses to start, leaving polling and
//! webhooks as the change sources, and says so.

use crate::error::{IntegrationError, Result};
use crate::events::{Broadcaster, FileEvent};
use crate::queue::{
    AddJobOptions, DeviceSyncQueue, FileProcessJob, JobPayload, JobPriority, PatientMatchJob,
};
use crate::safety::validate_mount_path;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use oculink_model::{Device, SourceChannel};
use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Quiet period before a changed file is considered fully written.
const STABILIZATION: Duration = Duration::from_secs(2);
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Running local watcher; dropping it stops both the notify backend and
/// the stabilization task.
#[derive(Debug)]
pub struct LocalWatchHandle {
    _watcher: RecommendedWatcher,
    stop_tx: watch::Sender<bool>,
}

impl LocalWatchHandle {
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

#[derive(Debug)]
enum FsChange {
    FileWritten(PathBuf),
    FileRemoved(PathBuf),
    DirAdded(PathBuf),
}

fn is_dotfile(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(true)
}

/// Determine if a path resides on a network filesystem (Linux).
fn is_network_filesystem(path: &Path) -> bool {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let Ok(file) = fs::File::open("/proc/mounts") else {
        return false;
    };

    let mut best_match: Option<(PathBuf, String)> = None;
    for line in BufReader::new(file).lines().map_while(|l| l.ok()) {
        // /proc/mounts format: src mountpoint fstype options 0 0
        let mut parts = line.split_whitespace();
        let _src = parts.next();
        let (Some(mountpoint), Some(fstype)) = (parts.next(), parts.next()) else {
            continue;
        };
        let mountpoint = PathBuf::from(mountpoint);
        if canonical.starts_with(&mountpoint) {
            let take = match &best_match {
                None => true,
                Some((best, _)) => mountpoint.as_os_str().len() > best.as_os_str().len(),
            };
            if take {
                best_match = Some((mountpoint, fstype.to_string()));
            }
        }
    }

    match best_match {
        Some((_, fstype)) => {
            matches!(
                fstype.as_str(),
                "nfs" | "nfs4" | "cifs" | "smbfs" | "smb3" | "sshfs" | "fuse.sshfs"
            )
        }
        None => false,
    }
}

fn priority_for(path: &Path) -> JobPriority {
    let structured = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            matches!(
                ext.to_ascii_lowercase().as_str(),
                "xml" | "dcm" | "dicom" | "dic"
            )
        })
        .unwrap_or(false);
    JobPriority::new(if structured { 2 } else { 5 }).expect("static priority")
}

/// Start watching a device's locally mounted export path. Errors when the
/// path is missing or sits on a network filesystem; callers fall back to
/// polling + webhooks.
pub fn start_local_watcher(
    device: Device,
    mount_path: &str,
    queue: DeviceSyncQueue,
    broadcaster: Broadcaster,
) -> Result<LocalWatchHandle> {
    validate_mount_path(mount_path)?;
    let root = PathBuf::from(mount_path);
    if !root.is_dir() {
        return Err(IntegrationError::validation(
            "mountPath",
            format!("{mount_path} is not a local directory"),
        ));
    }
    if is_network_filesystem(&root) {
        warn!(
            device = %device.id,
            path = mount_path,
            "mount is a network filesystem; local watcher disabled, polling + webhooks remain active"
        );
        return Err(IntegrationError::validation(
            "mountPath",
            "network filesystem, inotify events are unreliable",
        ));
    }

    let (change_tx, mut change_rx) = mpsc::unbounded_channel::<FsChange>();
    let (stop_tx, mut stop_rx) = watch::channel(false);

    let notify_tx = change_tx.clone();
    let mut watcher = notify::recommended_watcher(
        move |result: std::result::Result<Event, notify::Error>| {
            let event = match result {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "notify backend error");
                    return;
                }
            };
            let Some(path) = event.paths.first().cloned() else {
                return;
            };
            if is_dotfile(&path) {
                return;
            }
            let change = match event.kind {
                EventKind::Create(_) | EventKind::Modify(_) => {
                    if path.is_dir() {
                        FsChange::DirAdded(path)
                    } else {
                        FsChange::FileWritten(path)
                    }
                }
                EventKind::Remove(_) => FsChange::FileRemoved(path),
                _ => return,
            };
            let _ = notify_tx.send(change);
        },
    )
    .map_err(|e| IntegrationError::Internal(format!("failed to create watcher: {e}")))?;

    watcher
        .watch(&root, RecursiveMode::Recursive)
        .map_err(|e| IntegrationError::Internal(format!("failed to watch {mount_path}: {e}")))?;
    info!(device = %device.id, path = mount_path, "local filesystem watcher started");

    tokio::spawn(async move {
        // Pending writes awaiting their quiet period.
        let mut pending: HashMap<PathBuf, Instant> = HashMap::new();
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = stop_rx.changed() => {
                    // A dropped handle counts as a stop.
                    if changed.is_err() || *stop_rx.borrow() {
                        debug!(device = %device.id, "local watcher stopped");
                        return;
                    }
                }
                change = change_rx.recv() => {
                    let Some(change) = change else { return };
                    match change {
                        FsChange::FileWritten(path) => {
                            pending.insert(path, Instant::now());
                        }
                        FsChange::FileRemoved(path) => {
                            pending.remove(&path);
                            broadcaster.publish(FileEvent::Removed {
                                device: device.id.clone(),
                                path: path.to_string_lossy().into_owned(),
                            });
                        }
                        FsChange::DirAdded(path) => {
                            let payload = JobPayload::PatientMatch(PatientMatchJob {
                                device: device.id.clone(),
                                folder_path: path.to_string_lossy().into_owned(),
                            });
                            let options = AddJobOptions {
                                priority: Some(JobPriority::new(3).expect("static priority")),
                                ..Default::default()
                            };
                            if let Err(e) = queue.add_job(payload, options).await {
                                warn!(device = %device.id, error = %e, "folder enqueue failed");
                            }
                        }
                    }
                }
                _ = sweep.tick() => {
                    let now = Instant::now();
                    let ready: Vec<PathBuf> = pending
                        .iter()
                        .filter(|(_, last)| now.duration_since(**last) >= STABILIZATION)
                        .map(|(path, _)| path.clone())
                        .collect();
                    for path in ready {
                        pending.remove(&path);
                        let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                        broadcaster.publish(FileEvent::Detected {
                            device: device.id.clone(),
                            path: path.to_string_lossy().into_owned(),
                            size,
                        });
                        let payload = JobPayload::FileProcess(FileProcessJob {
                            device: device.id.clone(),
                            path: path.to_string_lossy().into_owned(),
                            patient: None,
                            source: SourceChannel::Watcher,
                        });
                        let options = AddJobOptions {
                            priority: Some(priority_for(&path)),
                            ..Default::default()
                        };
                        if let Err(e) = queue.add_job(payload, options).await {
                            warn!(device = %device.id, error = %e, "watcher enqueue failed");
                        }
                    }
                }
            }
        }
    });

    Ok(LocalWatchHandle {
        _watcher: watcher,
        stop_tx,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotfiles_are_ignored() {
        assert!(is_dotfile(Path::new("/mnt/exports/.tmp_upload")));
        assert!(!is_dotfile(Path::new("/mnt/exports/DUPONT.xml")));
    }

    #[test]
    fn structured_formats_get_priority_two() {
        assert_eq!(priority_for(Path::new("a/scan.XML")).as_u8(), 2);
        assert_eq!(priority_for(Path::new("a/scan.dcm")).as_u8(), 2);
        assert_eq!(priority_for(Path::new("a/photo.jpg")).as_u8(), 5);
    }
}
