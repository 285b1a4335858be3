//! Information packets: handles to one on-disk artifact each.
//!
//! A packet knows its final path plus the derived temp, FIFO and audit-file
//! paths. Writers produce the temp path and `atomize` renames it to the
//! final path, so downstream observers see a commit boundary. Streaming
//! packets use a named pipe at the FIFO path instead of a regular file.

use crate::error::IpError;
use crate::port::PortId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const ATOMIZE_RETRY: Duration = Duration::from_secs(1);

/// Audit record persisted next to an artifact as `<path>.audit.json`.
///
/// The wire format uses PascalCase keys; unknown fields are ignored so the
/// schema can grow outside the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AuditInfo {
    /// Formatted command that produced the artifact.
    pub command: String,
    /// Parameter values the producing task ran with.
    pub params: HashMap<String, String>,
    /// User-supplied annotations.
    pub keys: HashMap<String, String>,
    /// When the record was created.
    pub created: Option<DateTime<Utc>>,
}

impl AuditInfo {
    pub fn new() -> Self {
        Self {
            created: Some(Utc::now()),
            ..Self::default()
        }
    }
}

/// Handle to one on-disk artifact. Cheap to clone; clones share state, so a
/// packet fanned out to several consumers is one packet.
#[derive(Clone)]
pub struct Ip {
    inner: Arc<IpInner>,
}

struct IpInner {
    path: String,
    do_stream: bool,
    /// Serializes path-state checks, atomize and FIFO create/remove.
    lock: Mutex<()>,
    audit: Mutex<Option<AuditInfo>>,
    sub_stream: std::sync::Mutex<Option<PortId>>,
}

impl Ip {
    /// New packet for a regular file artifact.
    pub fn new(path: impl Into<String>) -> Self {
        Self::with_streaming(path, false)
    }

    /// New packet whose artifact is a named pipe at the FIFO path.
    pub fn streaming(path: impl Into<String>) -> Self {
        Self::with_streaming(path, true)
    }

    fn with_streaming(path: impl Into<String>, do_stream: bool) -> Self {
        Self {
            inner: Arc::new(IpInner {
                path: path.into(),
                do_stream,
                lock: Mutex::new(()),
                audit: Mutex::new(None),
                sub_stream: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Final path of the artifact.
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Path written while the producing command runs.
    pub fn temp_path(&self) -> String {
        format!("{}.tmp", self.inner.path)
    }

    /// Path of the named pipe used when streaming.
    pub fn fifo_path(&self) -> String {
        format!("{}.fifo", self.inner.path)
    }

    /// Path of the JSON audit record.
    pub fn audit_file_path(&self) -> String {
        format!("{}.audit.json", self.inner.path)
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.do_stream
    }

    /// Record the port carrying this packet's nested stream. The token is a
    /// non-owning back-reference for introspection only.
    pub fn set_sub_stream(&self, port: PortId) {
        *self
            .inner
            .sub_stream
            .lock()
            .expect("sub-stream lock poisoned") = Some(port);
    }

    pub fn sub_stream(&self) -> Option<PortId> {
        *self
            .inner
            .sub_stream
            .lock()
            .expect("sub-stream lock poisoned")
    }

    /// Whether the artifact exists at its final path.
    pub async fn exists(&self) -> bool {
        let _guard = self.inner.lock.lock().await;
        path_exists(&self.inner.path).await
    }

    /// Whether the temp file exists.
    pub async fn temp_exists(&self) -> bool {
        let _guard = self.inner.lock.lock().await;
        path_exists(&self.temp_path()).await
    }

    /// Whether the FIFO exists.
    pub async fn fifo_exists(&self) -> bool {
        let _guard = self.inner.lock.lock().await;
        path_exists(&self.fifo_path()).await
    }

    /// Size of the final file, in bytes.
    pub async fn size(&self) -> Result<u64, IpError> {
        let meta = tokio::fs::metadata(&self.inner.path)
            .await
            .map_err(|e| self.io_err("stat", self.inner.path.clone(), e))?;
        Ok(meta.len())
    }

    /// Read the whole final file.
    pub async fn read(&self) -> Result<Vec<u8>, IpError> {
        tokio::fs::read(&self.inner.path)
            .await
            .map_err(|e| self.io_err("read", self.inner.path.clone(), e))
    }

    /// Read the whole final file as UTF-8.
    pub async fn read_to_string(&self) -> Result<String, IpError> {
        tokio::fs::read_to_string(&self.inner.path)
            .await
            .map_err(|e| self.io_err("read", self.inner.path.clone(), e))
    }

    /// Write bytes to the temp path; a later `atomize` commits them.
    pub async fn write_temp(&self, data: &[u8]) -> Result<(), IpError> {
        tokio::fs::write(self.temp_path(), data)
            .await
            .map_err(|e| self.io_err("write", self.temp_path(), e))
    }

    /// Rename the temp file to the final path.
    ///
    /// Retries with a one-second sleep until the temp file is observed on
    /// disk, which guards against filesystem metadata lag after the
    /// producing command exits.
    pub async fn atomize(&self) -> Result<(), IpError> {
        debug!(from = %self.temp_path(), to = %self.inner.path, "atomizing");
        loop {
            {
                let _guard = self.inner.lock.lock().await;
                if path_exists(&self.temp_path()).await {
                    match tokio::fs::rename(self.temp_path(), &self.inner.path).await {
                        Ok(()) => {
                            debug!(path = %self.inner.path, "done atomizing");
                            return Ok(());
                        }
                        // The temp file can vanish between the check and
                        // the rename when several tasks share one output
                        // path; the next sweep settles against the final
                        // file instead.
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(self.io_err("rename", self.temp_path(), e)),
                    }
                }
                if path_exists(&self.inner.path).await {
                    debug!(path = %self.inner.path, "already committed by a concurrent task");
                    return Ok(());
                }
            }
            debug!(path = %self.temp_path(), "temp file not yet visible, sleeping before atomizing");
            tokio::time::sleep(ATOMIZE_RETRY).await;
        }
    }

    /// Create the named pipe for this packet. If it already exists some
    /// other participant created it first and the call is a no-op.
    pub async fn create_fifo(&self) -> Result<(), IpError> {
        let _guard = self.inner.lock.lock().await;
        if path_exists(&self.fifo_path()).await {
            warn!(path = %self.fifo_path(), "FIFO already exists, so not creating a new one");
            return Ok(());
        }
        run_shell(&format!("mkfifo {}", self.fifo_path())).await
    }

    /// Remove the named pipe.
    pub async fn remove_fifo(&self) -> Result<(), IpError> {
        let _guard = self.inner.lock.lock().await;
        run_shell(&format!("rm {}", self.fifo_path())).await
    }

    /// A copy of the audit record, loading `<path>.audit.json` on first use.
    pub async fn audit_info(&self) -> Result<AuditInfo, IpError> {
        self.with_audit(|record| record.clone()).await
    }

    /// Replace the in-memory audit record.
    pub async fn set_audit_info(&self, info: AuditInfo) {
        *self.inner.audit.lock().await = Some(info);
    }

    /// Persist the audit record to `<path>.audit.json`.
    pub async fn write_audit_log(&self) -> Result<(), IpError> {
        let record = self.audit_info().await?;
        let json = serde_json::to_string_pretty(&record).map_err(|e| IpError::AuditJson {
            path: self.audit_file_path(),
            source: e,
        })?;
        tokio::fs::write(self.audit_file_path(), json)
            .await
            .map_err(|e| self.io_err("write", self.audit_file_path(), e))
    }

    /// Value of one parameter recorded in the audit record.
    pub async fn param(&self, name: &str) -> Result<String, IpError> {
        self.with_audit(|record| record.params.get(name).cloned())
            .await?
            .ok_or_else(|| IpError::MissingParam {
                name: name.to_string(),
                path: self.inner.path.clone(),
            })
    }

    /// Value of one annotation key in the audit record.
    pub async fn key(&self, name: &str) -> Result<String, IpError> {
        self.with_audit(|record| record.keys.get(name).cloned())
            .await?
            .ok_or_else(|| IpError::MissingKey {
                name: name.to_string(),
                path: self.inner.path.clone(),
            })
    }

    /// All annotation keys in the audit record.
    pub async fn keys(&self) -> Result<HashMap<String, String>, IpError> {
        self.with_audit(|record| record.keys.clone()).await
    }

    /// Add one annotation key. Re-adding an existing key with a different
    /// value is an error.
    pub async fn add_key(&self, key: &str, value: &str) -> Result<(), IpError> {
        let mut slot = self.inner.audit.lock().await;
        let mut record = match slot.take() {
            Some(record) => record,
            None => self.load_audit_record().await?,
        };
        let result = match record.keys.get(key) {
            Some(existing) if existing != value => Err(IpError::KeyConflict {
                key: key.to_string(),
                new: value.to_string(),
                existing: existing.clone(),
            }),
            _ => {
                record.keys.insert(key.to_string(), value.to_string());
                Ok(())
            }
        };
        *slot = Some(record);
        result
    }

    /// Add a batch of annotation keys.
    pub async fn add_keys(&self, keys: &HashMap<String, String>) -> Result<(), IpError> {
        for (key, value) in keys {
            self.add_key(key, value).await?;
        }
        Ok(())
    }

    async fn with_audit<R>(&self, f: impl FnOnce(&AuditInfo) -> R) -> Result<R, IpError> {
        let mut slot = self.inner.audit.lock().await;
        let record = match slot.take() {
            Some(record) => record,
            None => self.load_audit_record().await?,
        };
        let result = f(&record);
        *slot = Some(record);
        Ok(result)
    }

    /// Read the audit file if it exists, else start a fresh record. An IO
    /// error on a file that exists is fatal.
    async fn load_audit_record(&self) -> Result<AuditInfo, IpError> {
        let path = self.audit_file_path();
        if !path_exists(&path).await {
            return Ok(AuditInfo::new());
        }
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| self.io_err("read", path.clone(), e))?;
        serde_json::from_slice(&data).map_err(|e| IpError::AuditJson { path, source: e })
    }

    fn io_err(&self, action: &'static str, path: String, source: std::io::Error) -> IpError {
        IpError::Io {
            action,
            path,
            source,
        }
    }
}

impl std::fmt::Debug for Ip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ip")
            .field("path", &self.inner.path)
            .field("do_stream", &self.inner.do_stream)
            .finish()
    }
}

async fn path_exists(path: &str) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

async fn run_shell(command: &str) -> Result<(), IpError> {
    debug!(%command, "running shell command");
    let output = Command::new("bash")
        .arg("-c")
        .arg(command)
        .output()
        .await
        .map_err(|e| IpError::Io {
            action: "spawn shell for",
            path: command.to_string(),
            source: e,
        })?;
    if !output.status.success() {
        return Err(IpError::Shell {
            command: command.to_string(),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}
