//! Polling change watcher for SMB shares.
//!
//! SMB exposes no inotify-class API, so the watcher runs a shallow recursive
//! scan on an interval and diffs the result against the previously known
//! paths. Some servers report mtime unreliably; entries are therefore
//! compared as `(size, mtime)` tuples.

use crate::smb::RemoteEntry;
use crate::smb::scan::{DirectoryLister, ScanOptions, scan_recursive};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

const WATCH_SCAN_DEPTH: u32 = 5;
const WATCH_SCAN_MAX_FILES: usize = 1000;

/// Change observed by the watcher.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(RemoteEntry),
    Changed(RemoteEntry),
    Removed { path: String },
    /// The scan failed this tick; the watcher keeps running.
    Error(String),
}

/// Running watcher. Dropping the handle or calling [`WatchHandle::stop`]
/// ends the polling task.
#[derive(Debug)]
pub struct WatchHandle {
    pub events: mpsc::Receiver<WatchEvent>,
    stop_tx: watch::Sender<bool>,
}

impl WatchHandle {
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

type KnownFiles = HashMap<String, (u64, Option<DateTime<Utc>>)>;

/// Diff one scan against the known set, emitting events and updating state.
fn diff_scan(known: &mut KnownFiles, files: Vec<RemoteEntry>) -> Vec<WatchEvent> {
    let mut events = Vec::new();
    let mut seen: KnownFiles = HashMap::with_capacity(files.len());

    for file in files {
        let fingerprint = (file.size, file.modified);
        match known.get(&file.path) {
            None => events.push(WatchEvent::Added(file.clone())),
            Some(previous) if *previous != fingerprint => {
                events.push(WatchEvent::Changed(file.clone()));
            }
            Some(_) => {}
        }
        seen.insert(file.path, fingerprint);
    }

    for path in known.keys() {
        if !seen.contains_key(path) {
            events.push(WatchEvent::Removed { path: path.clone() });
        }
    }

    *known = seen;
    events
}

/// Spawn the polling loop. The first scan primes the known set without
/// emitting, so a fresh watcher does not replay the whole share as "added".
pub fn start_polling_watcher(
    lister: Arc<dyn DirectoryLister>,
    base: String,
    interval: Duration,
) -> WatchHandle {
    let (event_tx, event_rx) = mpsc::channel(256);
    let (stop_tx, mut stop_rx) = watch::channel(false);

    tokio::spawn(async move {
        let options = ScanOptions::shallow(WATCH_SCAN_DEPTH, WATCH_SCAN_MAX_FILES);
        let mut known: KnownFiles = HashMap::new();
        let mut primed = false;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = stop_rx.changed() => {
                    // A dropped handle counts as a stop.
                    if changed.is_err() || *stop_rx.borrow() {
                        debug!(base = %base, "smb watcher stopped");
                        return;
                    }
                    continue;
                }
            }

            let result = scan_recursive(lister.as_ref(), &base, &options).await;
            if result.scanned_paths == 0 {
                // Even the base listing failed; report but keep polling.
                warn!(base = %base, "smb watcher scan failed");
                if event_tx
                    .send(WatchEvent::Error(format!("scan of {base:?} failed")))
                    .await
                    .is_err()
                {
                    return;
                }
                continue;
            }

            let events = diff_scan(&mut known, result.files);
            if !primed {
                primed = true;
                continue;
            }
            for event in events {
                if event_tx.send(event).await.is_err() {
                    // Receiver gone; nothing left to watch for.
                    return;
                }
            }
        }
    });

    WatchHandle {
        events: event_rx,
        stop_tx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::smb::DirectoryListing;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn file(path: &str, size: u64, mtime: &str) -> RemoteEntry {
        RemoteEntry::file(path.to_string(), size, Some(mtime.parse().unwrap()))
    }

    #[test]
    fn diff_detects_added_removed_changed() {
        let mut known = KnownFiles::new();

        let events = diff_scan(&mut known, vec![file("a.jpg", 1, "2023-09-05T10:00:00Z")]);
        assert!(matches!(events.as_slice(), [WatchEvent::Added(e)] if e.path == "a.jpg"));

        // Same tuple: silence.
        let events = diff_scan(&mut known, vec![file("a.jpg", 1, "2023-09-05T10:00:00Z")]);
        assert!(events.is_empty());

        // Same mtime but different size still registers as a change.
        let events = diff_scan(&mut known, vec![file("a.jpg", 2, "2023-09-05T10:00:00Z")]);
        assert!(matches!(events.as_slice(), [WatchEvent::Changed(_)]));

        let events = diff_scan(&mut known, vec![]);
        assert!(matches!(events.as_slice(), [WatchEvent::Removed { path }] if path == "a.jpg"));
    }

    /// Lister that replays a scripted sequence of listings.
    struct SequenceLister {
        steps: Mutex<Vec<Vec<RemoteEntry>>>,
    }

    #[async_trait]
    impl DirectoryLister for SequenceLister {
        async fn list(&self, _path: &str) -> Result<DirectoryListing> {
            let mut steps = self.steps.lock().unwrap();
            let files = if steps.len() > 1 {
                steps.remove(0)
            } else {
                steps[0].clone()
            };
            Ok(DirectoryListing {
                directories: vec![],
                files,
            })
        }
    }

    #[tokio::test]
    async fn first_scan_primes_without_events() {
        let lister = Arc::new(SequenceLister {
            steps: Mutex::new(vec![
                vec![file("pre-existing.jpg", 1, "2023-09-05T10:00:00Z")],
                vec![
                    file("pre-existing.jpg", 1, "2023-09-05T10:00:00Z"),
                    file("fresh.jpg", 9, "2023-09-06T10:00:00Z"),
                ],
            ]),
        });

        let mut handle =
            start_polling_watcher(lister, String::new(), Duration::from_millis(10));
        let event = tokio::time::timeout(Duration::from_secs(2), handle.events.recv())
            .await
            .expect("watcher produced no event")
            .expect("channel closed");

        match event {
            WatchEvent::Added(entry) => assert_eq!(entry.name, "fresh.jpg"),
            other => panic!("expected Added, got {other:?}"),
        }
        handle.stop();
    }
}
