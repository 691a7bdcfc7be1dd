//! Bounded recursive directory scan.
//!
//! Extracted over a listing trait so the traversal, filters, and truncation
//! logic test without an SMB server behind them.

use crate::error::Result;
use crate::smb::{DirectoryListing, RemoteEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Anything that can list one remote directory.
#[async_trait]
pub trait DirectoryLister: Send + Sync {
    async fn list(&self, path: &str) -> Result<DirectoryListing>;
}

/// Filters and bounds for a recursive scan.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Directory levels below the base that will be entered.
    pub max_depth: u32,
    pub max_files: usize,
    pub file_pattern: Option<Regex>,
    /// Lower-cased extension whitelist, no leading dot.
    pub extensions: Option<Vec<String>>,
    pub modified_after: Option<DateTime<Utc>>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_files: 5000,
            file_pattern: None,
            extensions: None,
            modified_after: None,
        }
    }
}

impl ScanOptions {
    /// Bounds used by the change watcher and full device syncs.
    pub fn shallow(max_depth: u32, max_files: usize) -> Self {
        Self {
            max_depth,
            max_files,
            ..Self::default()
        }
    }

    fn accepts(&self, entry: &RemoteEntry) -> bool {
        if let Some(pattern) = &self.file_pattern
            && !pattern.is_match(&entry.name)
        {
            return false;
        }
        if let Some(extensions) = &self.extensions {
            match &entry.extension {
                Some(ext) if extensions.iter().any(|allowed| allowed == ext) => {}
                _ => return false,
            }
        }
        if let Some(threshold) = self.modified_after {
            match entry.modified {
                Some(modified) if modified > threshold => {}
                _ => return false,
            }
        }
        true
    }
}

/// Result of a bounded scan. `truncated` is set iff a bound was hit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanResult {
    pub files: Vec<RemoteEntry>,
    pub directories: Vec<RemoteEntry>,
    pub scanned_paths: u32,
    pub truncated: bool,
}

/// Depth-first walk from `base`. Errors inside a subtree are logged and the
/// walk continues with its siblings.
pub async fn scan_recursive(
    lister: &dyn DirectoryLister,
    base: &str,
    options: &ScanOptions,
) -> ScanResult {
    let mut result = ScanResult::default();
    // Stack of (path, depth); depth counts levels below base.
    let mut stack: Vec<(String, u32)> = vec![(base.to_string(), 0)];

    while let Some((path, depth)) = stack.pop() {
        let listing = match lister.list(&path).await {
            Ok(listing) => listing,
            Err(e) => {
                warn!(path = %path, error = %e, "scan skipping unreadable directory");
                continue;
            }
        };
        result.scanned_paths += 1;

        for file in listing.files {
            if result.files.len() >= options.max_files {
                result.truncated = true;
                return result;
            }
            if options.accepts(&file) {
                result.files.push(file);
            }
        }

        // Reverse so the name-ascending listing order is preserved by the
        // LIFO stack.
        for directory in listing.directories.into_iter().rev() {
            let child_depth = depth + 1;
            if child_depth > options.max_depth {
                result.truncated = true;
                continue;
            }
            result.directories.push(directory.clone());
            stack.push((directory.path, child_depth));
        }
    }

    result
}
