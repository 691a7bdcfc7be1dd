//! Validation of external strings that flow into subprocess arguments or
//! filesystem paths.
//!
//! Every SMB host, share name, and path crosses one of these functions before
//! it can reach `tokio::process::Command` or a path join. The spawn layer
//! only accepts argv arrays, so a string that passes here can never be
//! re-interpreted by a shell.

use crate::error::{IntegrationError, Result};

/// Characters that must never appear in a value handed to a subprocess.
const SHELL_METACHARACTERS: &[char] = &[';', '&', '|', '$', '`', '<', '>', '\n', '\r', '\0'];

const MAX_HOST_LEN: usize = 253;
const MAX_SHARE_LEN: usize = 80;
const MAX_SANITIZED_LEN: usize = 128;

fn contains_shell_metacharacter(value: &str) -> bool {
    value.chars().any(|c| SHELL_METACHARACTERS.contains(&c))
}

fn contains_traversal(value: &str) -> bool {
    value.contains("..")
}

/// Reject any string carrying shell metacharacters or traversal segments.
/// `field` names the offending input in the error.
pub fn validate_shell_safe<'a>(value: &'a str, field: &str) -> Result<&'a str> {
    if value.is_empty() {
        return Err(IntegrationError::validation(field, "must not be empty"));
    }
    if contains_shell_metacharacter(value) {
        return Err(IntegrationError::validation(
            field,
            "contains shell metacharacters",
        ));
    }
    if contains_traversal(value) {
        return Err(IntegrationError::validation(
            field,
            "contains path traversal segment",
        ));
    }
    Ok(value)
}

/// Hostname or IPv4/IPv6 literal: `[A-Za-z0-9.:\-]`, no traversal, no
/// leading dash, bounded length.
pub fn validate_host(host: &str) -> Result<&str> {
    validate_shell_safe(host, "host")?;
    if host.len() > MAX_HOST_LEN {
        return Err(IntegrationError::validation("host", "too long"));
    }
    if host.starts_with('-') {
        return Err(IntegrationError::validation("host", "must not start with '-'"));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '-');
    if !host.chars().all(allowed) {
        return Err(IntegrationError::validation(
            "host",
            "contains characters outside the host alphabet",
        ));
    }
    Ok(host)
}

/// SMB share name: `[A-Za-z0-9._\-]`, bounded, no separators.
pub fn validate_share_name(share: &str) -> Result<&str> {
    validate_shell_safe(share, "share")?;
    if share.len() > MAX_SHARE_LEN {
        return Err(IntegrationError::validation("share", "too long"));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-');
    if !share.chars().all(allowed) {
        return Err(IntegrationError::validation(
            "share",
            "contains characters outside the share alphabet",
        ));
    }
    Ok(share)
}

/// Locally mounted share path: absolute POSIX path without traversal.
pub fn validate_mount_path(path: &str) -> Result<&str> {
    validate_shell_safe(path, "mountPath")?;
    if !path.starts_with('/') {
        return Err(IntegrationError::validation(
            "mountPath",
            "must be an absolute path",
        ));
    }
    let allowed =
        |c: char| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | ' ');
    if !path.chars().all(allowed) {
        return Err(IntegrationError::validation(
            "mountPath",
            "contains characters outside the path alphabet",
        ));
    }
    Ok(path)
}

/// Reduce an arbitrary string to a bounded ASCII token usable as a file or
/// directory name. Identity on `[A-Za-z0-9._\-]`; everything else becomes
/// `_`. Leading dots are stripped so the result can never be a dotfile or a
/// traversal segment.
pub fn sanitize_for_filesystem(value: &str) -> String {
    let mut sanitized: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    while sanitized.starts_with('.') || sanitized.starts_with('-') {
        sanitized.remove(0);
    }
    // A lone run of dots would survive the char filter; collapse it.
    while sanitized.contains("..") {
        sanitized = sanitized.replace("..", ".");
    }
    sanitized.truncate(MAX_SANITIZED_LEN);

    if sanitized.is_empty() {
        "unnamed".to_string()
    } else {
        sanitized
    }
}
