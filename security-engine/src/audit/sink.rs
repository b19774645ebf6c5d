//! Audit persistence, archival and alerting seams

use super::AuditEvent;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::files;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Append-only event persistence.
///
/// No update API exists; `delete` is reserved for retention.
pub trait EventSink: Send + Sync {
    /// Chain and persist an event, returning it as stored
    fn append(&self, event: AuditEvent) -> Result<AuditEvent>;

    /// All events in write order
    fn scan(&self) -> Result<Vec<AuditEvent>>;

    /// Remove events by id. Returns the number removed.
    fn delete(&self, ids: &HashSet<Uuid>) -> Result<usize>;
}

/// In-memory sink
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: RwLock<Vec<AuditEvent>>,
}

impl MemoryEventSink {
    /// Create empty sink
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventSink for MemoryEventSink {
    fn append(&self, mut event: AuditEvent) -> Result<AuditEvent> {
        let mut events = self.events.write();
        let previous = events.last().map(|e| e.hash.clone()).unwrap_or_default();
        event.seal(previous)?;
        events.push(event.clone());
        Ok(event)
    }

    fn scan(&self) -> Result<Vec<AuditEvent>> {
        Ok(self.events.read().clone())
    }

    fn delete(&self, ids: &HashSet<Uuid>) -> Result<usize> {
        let mut events = self.events.write();
        let before = events.len();
        events.retain(|e| !ids.contains(&e.id));
        Ok(before - events.len())
    }
}

/// JSON-lines file sink with a SHA-256 hash chain
#[derive(Debug)]
pub struct JsonLinesEventSink {
    path: PathBuf,
    last_hash: Mutex<String>,
}

impl JsonLinesEventSink {
    /// Open (or create) a log file
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                files::ensure_private_dir(parent)?;
            }
        }
        let last_hash = Self::read_last_hash(&path)?;

        Ok(Self {
            path,
            last_hash: Mutex::new(last_hash),
        })
    }

    fn read_last_hash(path: &Path) -> Result<String> {
        if !path.exists() {
            return Ok(String::new());
        }
        let file = File::open(path)?;
        let mut last = String::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if !line.trim().is_empty() {
                last = line;
            }
        }
        if last.is_empty() {
            return Ok(String::new());
        }
        let event: AuditEvent = serde_json::from_str(&last)?;
        Ok(event.hash)
    }

    fn read_all(&self) -> Result<Vec<AuditEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)?;
        let mut events = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event: AuditEvent = serde_json::from_str(&line).map_err(|e| {
                Error::Serialization(format!("Audit log line {}: {}", idx + 1, e))
            })?;
            events.push(event);
        }
        Ok(events)
    }

    /// Verify every event hash and every chain link.
    ///
    /// The first remaining event anchors the chain, so verification still
    /// passes after retention removed older rows.
    pub fn verify_integrity(&self) -> Result<bool> {
        let events = self.read_all()?;
        let mut previous: Option<&str> = None;

        for (idx, event) in events.iter().enumerate() {
            if !event.verify_hash()? {
                error!("Audit event hash mismatch at line {}", idx + 1);
                return Ok(false);
            }
            if let Some(previous) = previous {
                if event.previous_hash != previous {
                    error!("Audit hash chain broken at line {}", idx + 1);
                    return Ok(false);
                }
            }
            previous = Some(event.hash.as_str());
        }
        Ok(true)
    }
}

impl EventSink for JsonLinesEventSink {
    fn append(&self, mut event: AuditEvent) -> Result<AuditEvent> {
        let mut last_hash = self.last_hash.lock();
        event.seal(last_hash.clone())?;

        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        files::set_mode(&self.path, 0o600)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;

        *last_hash = event.hash.clone();
        Ok(event)
    }

    fn scan(&self) -> Result<Vec<AuditEvent>> {
        self.read_all()
    }

    fn delete(&self, ids: &HashSet<Uuid>) -> Result<usize> {
        // hold the append lock while the file is rewritten
        let mut last_hash = self.last_hash.lock();
        let events = self.read_all()?;
        let before = events.len();

        let mut buffer = Vec::new();
        let mut kept = 0;
        let mut kept_last = String::new();
        for event in events.iter().filter(|e| !ids.contains(&e.id)) {
            buffer.extend_from_slice(serde_json::to_string(event)?.as_bytes());
            buffer.push(b'\n');
            kept_last = event.hash.clone();
            kept += 1;
        }
        let removed = before - kept;

        files::write_atomic(&self.path, &buffer)?;
        *last_hash = kept_last;
        Ok(removed)
    }
}

/// Cold storage for events leaving the retention window
pub trait ArchiveSink: Send + Sync {
    /// Persist a batch. An error must leave the batch undeleted.
    fn archive(&self, events: &[AuditEvent]) -> Result<()>;
}

/// Writes each batch to its own pretty-printed JSON file
#[derive(Debug, Clone)]
pub struct JsonArchiveSink {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl JsonArchiveSink {
    /// Archive into `dir`, created on first use. File names carry the clock's date.
    pub fn new(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: dir.into(),
            clock,
        }
    }
}

impl ArchiveSink for JsonArchiveSink {
    fn archive(&self, events: &[AuditEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        files::ensure_private_dir(&self.dir)?;
        let file_name = format!(
            "audit_archive_{}_{}.json",
            self.clock.now().format("%Y_%m_%d_%H%M%S"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let body = serde_json::to_vec_pretty(events)?;
        files::write_atomic(&self.dir.join(&file_name), &body)?;

        info!("Archived {} audit events to {}", events.len(), file_name);
        Ok(())
    }
}

/// Receives critical events synchronously
pub trait AlertHook: Send + Sync {
    /// Notify operators. Failures are logged by the caller, never propagated.
    fn critical(&self, event: &AuditEvent) -> Result<()>;
}

/// Alert hook writing to the process log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertHook;

impl AlertHook for LogAlertHook {
    fn critical(&self, event: &AuditEvent) -> Result<()> {
        error!(
            target: "security_alert",
            event_type = %event.event_type,
            action = %event.action,
            actor = ?event.actor.as_ref().map(|a| a.id.as_str()),
            ip = ?event.ip,
            correlation_id = %event.correlation_id,
            "Critical security event detected"
        );
        Ok(())
    }
}
