//! Configuration store
//! Versioned, validated proxy-core configuration with atomic on-disk
//! persistence and single-step rollback

use crate::domain::{BackendDescriptor, DomainError, Result};
use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use tracing::{debug, info};

/// Structural validator for one config schema version
type Validator = fn(&Value) -> std::result::Result<(), String>;

/// Validator table keyed by schema version. Adding a backend config
/// shape is an additive change here.
static VALIDATORS: Lazy<HashMap<&'static str, Validator>> = Lazy::new(|| {
    let mut table: HashMap<&'static str, Validator> = HashMap::new();
    table.insert("xray.v1", validate_core_document);
    table.insert("singbox.v1", validate_core_document);
    table
});

/// Both engines share the same structural envelope: a JSON object whose
/// optional `inbounds` is an array of tagged objects and whose optional
/// `log` is an object. Semantic validation belongs to the engine itself.
fn validate_core_document(doc: &Value) -> std::result::Result<(), String> {
    let obj = doc
        .as_object()
        .ok_or_else(|| "document root must be an object".to_string())?;

    if let Some(inbounds) = obj.get("inbounds") {
        let entries = inbounds
            .as_array()
            .ok_or_else(|| "'inbounds' must be an array".to_string())?;
        for (i, entry) in entries.iter().enumerate() {
            if !entry.is_object() {
                return Err(format!("'inbounds[{i}]' must be an object"));
            }
        }
    }

    if let Some(log) = obj.get("log") {
        if !log.is_object() {
            return Err("'log' must be an object".to_string());
        }
    }

    Ok(())
}

/// One immutable, revisioned configuration blob
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub revision: u64,
    pub schema_version: String,
    pub blob: Vec<u8>,
    pub created_at: SystemTime,
}

#[derive(Default)]
struct Snapshots {
    active: Option<Arc<ConfigSnapshot>>,
    previous: Option<Arc<ConfigSnapshot>>,
}

/// Owns the active configuration snapshot for one backend and the file
/// the proxy-core executable reads
///
/// Writers serialize through `write_gate`; a second in-flight proposal
/// fails fast with `Conflict` instead of queueing. Readers clone the
/// active snapshot handle and never wait on a writer's I/O.
pub struct ConfigStore {
    descriptor: BackendDescriptor,
    snapshots: RwLock<Snapshots>,
    write_gate: tokio::sync::Mutex<()>,
}

impl ConfigStore {
    pub fn new(descriptor: BackendDescriptor) -> Self {
        Self {
            descriptor,
            snapshots: RwLock::new(Snapshots::default()),
            write_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Validate `blob`, persist it atomically, and activate it.
    /// Returns the new revision. The active snapshot is untouched on
    /// any failure.
    pub async fn propose(&self, schema_version: &str, blob: &[u8]) -> Result<u64> {
        let _gate = self
            .write_gate
            .try_lock()
            .map_err(|_| DomainError::Conflict(self.descriptor.id.clone()))?;

        if schema_version != self.descriptor.schema_version {
            return Err(DomainError::InvalidConfig(format!(
                "backend '{}' expects schema '{}', got '{}'",
                self.descriptor.id, self.descriptor.schema_version, schema_version
            )));
        }

        let validator = VALIDATORS.get(schema_version.trim()).ok_or_else(|| {
            DomainError::InvalidConfig(format!("unknown schema version '{schema_version}'"))
        })?;

        let mut doc: Value = serde_json::from_slice(blob)
            .map_err(|e| DomainError::InvalidConfig(format!("malformed JSON: {e}")))?;

        validator(&doc).map_err(DomainError::InvalidConfig)?;
        normalize_document(&mut doc, &self.descriptor);

        let bytes = serde_json::to_vec_pretty(&doc)
            .map_err(|e| DomainError::InvalidConfig(format!("re-serialization failed: {e}")))?;

        let revision = self.next_revision();
        self.write_atomic(&bytes).await?;

        let snapshot = Arc::new(ConfigSnapshot {
            revision,
            schema_version: schema_version.to_string(),
            blob: bytes,
            created_at: SystemTime::now(),
        });
        self.activate(snapshot);

        info!(
            backend = %self.descriptor.id,
            revision = revision,
            "configuration snapshot activated"
        );
        Ok(revision)
    }

    /// Active snapshot handle; never blocks on a concurrent propose
    pub fn current(&self) -> Option<Arc<ConfigSnapshot>> {
        self.snapshots.read().unwrap().active.clone()
    }

    /// Re-activate the previous snapshot under a new, higher revision.
    /// Revisions never move backwards.
    pub async fn rollback(&self) -> Result<u64> {
        let _gate = self
            .write_gate
            .try_lock()
            .map_err(|_| DomainError::Conflict(self.descriptor.id.clone()))?;

        let prior = self
            .snapshots
            .read()
            .unwrap()
            .previous
            .clone()
            .ok_or_else(|| DomainError::NoPriorSnapshot(self.descriptor.id.clone()))?;

        let revision = self.next_revision();
        self.write_atomic(&prior.blob).await?;

        let snapshot = Arc::new(ConfigSnapshot {
            revision,
            schema_version: prior.schema_version.clone(),
            blob: prior.blob.clone(),
            created_at: SystemTime::now(),
        });
        self.activate(snapshot);

        info!(
            backend = %self.descriptor.id,
            revision = revision,
            "rolled back to previous snapshot"
        );
        Ok(revision)
    }

    fn next_revision(&self) -> u64 {
        self.snapshots
            .read()
            .unwrap()
            .active
            .as_ref()
            .map(|s| s.revision + 1)
            .unwrap_or(1)
    }

    fn activate(&self, snapshot: Arc<ConfigSnapshot>) {
        let mut snapshots = self.snapshots.write().unwrap();
        snapshots.previous = snapshots.active.take();
        snapshots.active = Some(snapshot);
    }

    /// Temp file + rename so the executable never observes a torn file
    async fn write_atomic(&self, bytes: &[u8]) -> Result<()> {
        let path = &self.descriptor.config_path;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DomainError::io("creating config directory", e))?;
        }

        let tmp = temp_sibling(path);
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| DomainError::io("writing config temp file", e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| DomainError::io("activating config file", e))?;

        debug!(
            backend = %self.descriptor.id,
            path = %path.display(),
            bytes = bytes.len(),
            "config file replaced atomically"
        );
        Ok(())
    }
}

fn temp_sibling(path: &Path) -> std::path::PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config".to_string());
    path.with_file_name(format!(".{file_name}.tmp"))
}

/// Node-local adjustments applied to every accepted document:
/// keep only the descriptor's allowed inbound tags, and lift a
/// `silent` log level to `warn` so the backend still emits telemetry.
fn normalize_document(doc: &mut Value, descriptor: &BackendDescriptor) {
    if let Some(obj) = doc.as_object_mut() {
        if !descriptor.inbound_filter.is_empty() {
            if let Some(inbounds) = obj.get_mut("inbounds").and_then(Value::as_array_mut) {
                inbounds.retain(|inbound| {
                    inbound
                        .get("tag")
                        .and_then(Value::as_str)
                        .map(|tag| descriptor.inbound_filter.iter().any(|f| f == tag))
                        .unwrap_or(false)
                });
            }
        }

        if let Some(level) = obj
            .get_mut("log")
            .and_then(Value::as_object_mut)
            .and_then(|log| log.get_mut("level"))
        {
            if level.as_str() == Some("silent") {
                *level = Value::String("warn".to_string());
            }
        }
    }
}
