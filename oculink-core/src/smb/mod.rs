//! Pooled SMB device access.
//!
//! External callers use POSIX paths throughout; the transport converts to
//! the backslash wire form. The pool owns connection health, reconnect
//! backoff, the temp-file read cache, bounded recursive scans, and the
//! polling change watcher.

pub mod command;
pub mod file_cache;
pub mod pool;
pub mod scan;
pub mod watch;

pub use command::{SmbOutput, SmbTransport, SmbclientTransport};
pub use file_cache::FileCache;
pub use pool::{FileReadResult, PoolStats, ReconnectPolicy, SmbClientPool, SmbPoolConfig};
pub use scan::{DirectoryLister, ScanOptions, ScanResult, scan_recursive};
pub use watch::{WatchEvent, WatchHandle};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tif", "tiff", "gif"];
const DICOM_EXTENSIONS: &[&str] = &["dcm", "dicom", "dic"];

/// One entry from a remote listing, POSIX-normalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Path relative to the share root, `/`-separated, no leading slash.
    pub path: String,
    pub name: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    pub is_directory: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    pub is_image: bool,
    pub is_pdf: bool,
    pub is_xml: bool,
    pub is_dicom: bool,
}

impl RemoteEntry {
    pub fn file(path: String, size: u64, modified: Option<DateTime<Utc>>) -> Self {
        let name = path.rsplit('/').next().unwrap_or(&path).to_string();
        let extension = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| !ext.is_empty());

        let ext = extension.as_deref().unwrap_or("");
        Self {
            is_image: IMAGE_EXTENSIONS.contains(&ext),
            is_pdf: ext == "pdf",
            is_xml: ext == "xml",
            is_dicom: DICOM_EXTENSIONS.contains(&ext),
            path,
            name,
            size,
            modified,
            is_directory: false,
            extension,
        }
    }

    pub fn directory(path: String, modified: Option<DateTime<Utc>>) -> Self {
        let name = path.rsplit('/').next().unwrap_or(&path).to_string();
        Self {
            path,
            name,
            size: 0,
            modified,
            is_directory: true,
            extension: None,
            is_image: false,
            is_pdf: false,
            is_xml: false,
            is_dicom: false,
        }
    }
}

/// Listing of one remote directory: directories name-ascending, files
/// modified-descending.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryListing {
    pub directories: Vec<RemoteEntry>,
    pub files: Vec<RemoteEntry>,
}

impl DirectoryListing {
    pub fn sorted(mut self) -> Self {
        self.directories.sort_by(|a, b| a.name.cmp(&b.name));
        self.files
            .sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.name.cmp(&b.name)));
        self
    }
}

/// Normalize an externally supplied path to the internal POSIX form:
/// forward slashes, no leading or trailing separator, no empty segments.
pub fn normalize_remote_path(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Convert a normalized POSIX path to the SMB wire form.
pub fn to_wire_path(path: &str) -> String {
    normalize_remote_path(path).replace('/', "\\")
}

/// Join a base path and a child name in POSIX form.
pub fn join_remote(base: &str, name: &str) -> String {
    let base = normalize_remote_path(base);
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{base}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_separators_and_anchors() {
        assert_eq!(normalize_remote_path("/exports/oct/img.dcm"), "exports/oct/img.dcm");
        assert_eq!(normalize_remote_path("\\exports\\oct\\"), "exports/oct");
        assert_eq!(normalize_remote_path("exports//oct/./img"), "exports/oct/img");
        assert_eq!(normalize_remote_path(""), "");
    }

    #[test]
    fn wire_path_uses_backslashes() {
        assert_eq!(to_wire_path("/exports/oct"), "exports\\oct");
    }

    #[test]
    fn classification_booleans() {
        let entry = RemoteEntry::file("exports/scan.DCM".into(), 10, None);
        assert!(entry.is_dicom);
        assert_eq!(entry.extension.as_deref(), Some("dcm"));
        let entry = RemoteEntry::file("exports/report.pdf".into(), 10, None);
        assert!(entry.is_pdf && !entry.is_image);
        let entry = RemoteEntry::file("exports/noext".into(), 10, None);
        assert_eq!(entry.extension, None);
    }

    #[test]
    fn listing_sort_orders() {
        let older = Some("2023-09-01T10:00:00Z".parse().unwrap());
        let newer = Some("2023-09-05T10:00:00Z".parse().unwrap());
        let listing = DirectoryListing {
            directories: vec![
                RemoteEntry::directory("b".into(), None),
                RemoteEntry::directory("a".into(), None),
            ],
            files: vec![
                RemoteEntry::file("old.jpg".into(), 1, older),
                RemoteEntry::file("new.jpg".into(), 1, newer),
            ],
        }
        .sorted();
        assert_eq!(listing.directories[0].name, "a");
        assert_eq!(listing.files[0].name, "new.jpg");
    }
}
