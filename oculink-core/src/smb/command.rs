//! `smbclient` transport.
//!
//! Each operation spawns `smbclient` with an argv array built from validated
//! inputs; the password travels in the `PASSWD` environment variable and
//! never appears in argv. The trait is the seam unit tests substitute with a
//! scripted fake.

use crate::error::{IntegrationError, Result};
use crate::safety::{validate_host, validate_share_name, validate_shell_safe};
use crate::smb::{DirectoryListing, RemoteEntry, join_remote, normalize_remote_path, to_wire_path};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use oculink_model::ShareCredentials;

/// Captured output of one smbclient invocation.
#[derive(Debug, Clone)]
pub struct SmbOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl SmbOutput {
    fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }

    /// Surface NT_STATUS failures even when the exit code lies.
    fn ensure_ok(&self, context: &str) -> Result<()> {
        if let Some(status) = first_nt_status(&self.combined()) {
            return Err(IntegrationError::Transport(format!("{context}: {status}")));
        }
        if !self.success {
            let detail = self.stderr.lines().next().unwrap_or("exit status non-zero");
            return Err(IntegrationError::Transport(format!("{context}: {detail}")));
        }
        Ok(())
    }
}

static NT_STATUS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"NT_STATUS_[A-Z_]+").expect("static regex"));

fn first_nt_status(output: &str) -> Option<String> {
    NT_STATUS
        .find_iter(output)
        .map(|m| m.as_str().to_string())
        .find(|status| status != "NT_STATUS_OK")
}

fn is_not_found(output: &str) -> bool {
    output.contains("NT_STATUS_OBJECT_NAME_NOT_FOUND")
        || output.contains("NT_STATUS_OBJECT_PATH_NOT_FOUND")
        || output.contains("NT_STATUS_NO_SUCH_FILE")
}

/// Remote path fragment embedded in an smbclient `-c` command string.
/// Shell-safety is already guaranteed by argv spawning; this guards the
/// smbclient command parser itself.
fn validate_remote_path(path: &str) -> Result<&str> {
    if path.is_empty() {
        return Ok(path);
    }
    validate_shell_safe(path, "remotePath")?;
    if path.contains('"') {
        return Err(IntegrationError::validation(
            "remotePath",
            "contains a double quote",
        ));
    }
    Ok(path)
}

/// Seam over the SMB wire. Paths are POSIX-normalized relative paths.
#[async_trait]
pub trait SmbTransport: Send + Sync {
    /// Cheap reachability probe (root listing).
    async fn probe(&self, creds: &ShareCredentials) -> Result<()>;
    /// List one directory; returned entries carry full normalized paths.
    async fn list_directory(
        &self,
        creds: &ShareCredentials,
        path: &str,
    ) -> Result<DirectoryListing>;
    /// Download a remote file; returns its byte size.
    async fn fetch_file(
        &self,
        creds: &ShareCredentials,
        path: &str,
        local: &Path,
    ) -> Result<u64>;
    /// Upload a local file to the share.
    async fn store_file(
        &self,
        creds: &ShareCredentials,
        local: &Path,
        path: &str,
    ) -> Result<()>;
    async fn exists(&self, creds: &ShareCredentials, path: &str) -> Result<bool>;
    async fn make_directory(&self, creds: &ShareCredentials, path: &str) -> Result<()>;
    async fn remove_file(&self, creds: &ShareCredentials, path: &str) -> Result<()>;
}

/// Production transport backed by the `smbclient` binary.
#[derive(Debug, Clone)]
pub struct SmbclientTransport {
    binary: String,
    command_timeout: Duration,
}

impl SmbclientTransport {
    pub fn new(binary: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            command_timeout,
        }
    }

    async fn run(&self, creds: &ShareCredentials, commands: &[String]) -> Result<SmbOutput> {
        let host = validate_host(&creds.host)?;
        let share = validate_share_name(&creds.share)?;
        let username = validate_shell_safe(&creds.username, "username")?;

        let service = format!("//{host}/{share}");
        let script = commands.join("; ");

        let mut cmd = Command::new(&self.binary);
        cmd.arg(&service);
        if let Some(domain) = creds.domain.as_deref().filter(|d| !d.is_empty()) {
            validate_shell_safe(domain, "domain")?;
            cmd.arg("-W").arg(domain);
        }
        cmd.arg("-U").arg(username);
        if creds.password.is_empty() {
            cmd.arg("-N");
        }
        cmd.arg("-c").arg(&script);
        cmd.env("PASSWD", &creds.password);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(service = %service, script = %script, "smbclient invocation");

        let output = tokio::time::timeout(self.command_timeout, cmd.output())
            .await
            .map_err(|_| {
                IntegrationError::Timeout(format!("smbclient {script} on {service}"))
            })?
            .map_err(|e| IntegrationError::Transport(format!("spawn smbclient: {e}")))?;

        Ok(SmbOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            success: output.status.success(),
        })
    }
}

#[async_trait]
impl SmbTransport for SmbclientTransport {
    async fn probe(&self, creds: &ShareCredentials) -> Result<()> {
        let output = self.run(creds, &["ls".to_string()]).await?;
        output.ensure_ok("probe")
    }

    async fn list_directory(
        &self,
        creds: &ShareCredentials,
        path: &str,
    ) -> Result<DirectoryListing> {
        let normalized = normalize_remote_path(path);
        validate_remote_path(&normalized)?;

        let commands = if normalized.is_empty() {
            vec!["ls".to_string()]
        } else {
            vec![format!("cd \"{}\"", to_wire_path(&normalized)), "ls".to_string()]
        };
        let output = self.run(creds, &commands).await?;
        output.ensure_ok("list")?;

        Ok(parse_listing(&output.stdout, &normalized))
    }

    async fn fetch_file(
        &self,
        creds: &ShareCredentials,
        path: &str,
        local: &Path,
    ) -> Result<u64> {
        let normalized = normalize_remote_path(path);
        validate_remote_path(&normalized)?;
        let local_str = local
            .to_str()
            .ok_or_else(|| IntegrationError::validation("localPath", "not valid UTF-8"))?;

        let command = format!("get \"{}\" \"{}\"", to_wire_path(&normalized), local_str);
        let output = self.run(creds, &[command]).await?;
        output.ensure_ok("get")?;

        let metadata = tokio::fs::metadata(local).await?;
        Ok(metadata.len())
    }

    async fn store_file(
        &self,
        creds: &ShareCredentials,
        local: &Path,
        path: &str,
    ) -> Result<()> {
        let normalized = normalize_remote_path(path);
        validate_remote_path(&normalized)?;
        let local_str = local
            .to_str()
            .ok_or_else(|| IntegrationError::validation("localPath", "not valid UTF-8"))?;

        let command = format!("put \"{}\" \"{}\"", local_str, to_wire_path(&normalized));
        let output = self.run(creds, &[command]).await?;
        output.ensure_ok("put")
    }

    async fn exists(&self, creds: &ShareCredentials, path: &str) -> Result<bool> {
        let normalized = normalize_remote_path(path);
        validate_remote_path(&normalized)?;

        let command = format!("ls \"{}\"", to_wire_path(&normalized));
        let output = self.run(creds, &[command]).await?;
        if is_not_found(&output.combined()) {
            return Ok(false);
        }
        output.ensure_ok("ls")?;
        Ok(true)
    }

    async fn make_directory(&self, creds: &ShareCredentials, path: &str) -> Result<()> {
        let normalized = normalize_remote_path(path);
        validate_remote_path(&normalized)?;

        let command = format!("mkdir \"{}\"", to_wire_path(&normalized));
        let output = self.run(creds, &[command]).await?;
        if output.combined().contains("NT_STATUS_OBJECT_NAME_COLLISION") {
            // Already present; mkdir is idempotent for our callers.
            return Ok(());
        }
        output.ensure_ok("mkdir")
    }

    async fn remove_file(&self, creds: &ShareCredentials, path: &str) -> Result<()> {
        let normalized = normalize_remote_path(path);
        validate_remote_path(&normalized)?;

        let command = format!("del \"{}\"", to_wire_path(&normalized));
        let output = self.run(creds, &[command]).await?;
        output.ensure_ok("del")
    }
}

static LS_LINE: Lazy<Regex> = Lazy::new(|| {
    // "  IMG_001.jpg      A   482913  Tue Sep  5 09:12:44 2023"
    Regex::new(r"^\s{2}(.+?)\s+([A-Z]+)\s+(\d+)\s+(\w{3}\s+\w{3}\s+\d{1,2}\s+\d{2}:\d{2}:\d{2}\s+\d{4})\s*$")
        .expect("static regex")
});

fn parse_ls_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    // smbclient prints the server's local time; we treat it as UTC since the
    // scan comparisons only need a consistent ordering per server.
    let squeezed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&squeezed, "%a %b %d %H:%M:%S %Y")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Parse `smbclient ls` output into a sorted listing. `.` and `..` are
/// dropped; unparseable lines are skipped with a warning.
pub fn parse_listing(stdout: &str, base: &str) -> DirectoryListing {
    let mut listing = DirectoryListing::default();

    for line in stdout.lines() {
        if line.trim().is_empty() || line.contains("blocks of size") {
            continue;
        }
        let Some(captures) = LS_LINE.captures(line) else {
            if line.starts_with("  ") {
                warn!(line, "unparseable smbclient ls line");
            }
            continue;
        };

        let name = captures[1].trim_end().to_string();
        if name == "." || name == ".." {
            continue;
        }
        let attributes = &captures[2];
        let size: u64 = captures[3].parse().unwrap_or(0);
        let modified = parse_ls_timestamp(&captures[4]);
        let path = join_remote(base, &name);

        if attributes.contains('D') {
            listing.directories.push(RemoteEntry::directory(path, modified));
        } else {
            listing.files.push(RemoteEntry::file(path, size, modified));
        }
    }

    listing.sorted()
}
