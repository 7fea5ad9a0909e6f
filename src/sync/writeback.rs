//! Write-back of user edits
//!
//! An edit is validated locally, merged into the record's override map
//! (read-modify-write of the whole `/user_inputs/{id}` entry), written back,
//! and then patched into the local snapshot so the edit is visible before the
//! change notification round-trips.

use chrono::Local;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

use super::snapshot::SnapshotStore;
use crate::{
    config::SyncConfig,
    error::{PatchError, WriteBackError},
    models::number_value,
    remote::{join_path, RemoteStore},
    schema,
};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Characters the remote key syntax does not allow in a single path segment
const FORBIDDEN_KEY_CHARS: [char; 6] = ['/', '.', '#', '$', '[', ']'];

/// Stamped on every write; a user value would be overwritten
const READ_ONLY_FIELDS: [&str; 2] = [schema::LAST_MODIFIED, schema::MODIFIED_BY];

/// Acknowledgement of a successful edit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteAck {
    pub record_id: String,
    /// Canonical field name, as edited
    pub field: String,
    /// Field name as stored remotely
    pub remote_field: String,
    pub value: f64,
    pub modified_at: String,
    /// Snapshot version carrying the edit; None when the record was not in
    /// the local snapshot (the remote write still happened)
    pub patched_version: Option<u64>,
}

impl WriteAck {
    pub fn patched_locally(&self) -> bool {
        self.patched_version.is_some()
    }

    pub fn message(&self) -> String {
        format!("Saved {} = {} for {}", self.field, self.value, self.record_id)
    }
}

pub struct WriteBackGateway {
    remote: Arc<dyn RemoteStore>,
    snapshot: Arc<SnapshotStore>,
    overrides_path: String,
    modifier_tag: String,
}

impl WriteBackGateway {
    pub fn new(remote: Arc<dyn RemoteStore>, snapshot: Arc<SnapshotStore>, config: &SyncConfig) -> Self {
        Self {
            remote,
            snapshot,
            overrides_path: config.overrides_path.clone(),
            modifier_tag: config.modifier_tag.clone(),
        }
    }

    /// Apply one field edit. `field` is a canonical field name; `value` may be
    /// a JSON number or a numeric string.
    pub async fn update_field(
        &self,
        record_id: &str,
        field: &str,
        value: &Value,
    ) -> Result<WriteAck, WriteBackError> {
        let result = self.apply(record_id, field, value).await;
        match &result {
            Ok(ack) => info!(
                record_id,
                field,
                value = ack.value,
                patched_locally = ack.patched_locally(),
                "Field updated"
            ),
            Err(e) => warn!(record_id, field, error = %e, "Field update rejected"),
        }
        result
    }

    async fn apply(&self, record_id: &str, field: &str, value: &Value) -> Result<WriteAck, WriteBackError> {
        if record_id.trim().is_empty() || record_id.contains(FORBIDDEN_KEY_CHARS) {
            return Err(WriteBackError::InvalidRecordId {
                record_id: record_id.to_string(),
            });
        }
        if READ_ONLY_FIELDS.contains(&field) {
            return Err(WriteBackError::ReadOnlyField {
                field: field.to_string(),
            });
        }
        let number = parse_numeric(field, value)?;

        if let Some(ds) = self.snapshot.read() {
            if ds.get(record_id).is_some_and(|r| r.is_forecast) {
                return Err(WriteBackError::ForecastRecord {
                    record_id: record_id.to_string(),
                });
            }
        }

        let remote_field = schema::to_external(field);
        let path = join_path(&self.overrides_path, record_id);

        let current = self
            .remote
            .get(&path)
            .await
            .map_err(|e| WriteBackError::Remote {
                reason: format!("{:#}", e),
            })?;
        let mut entry = match current {
            Some(Value::Object(map)) => map,
            Some(other) => {
                warn!(record_id, existing = %other, "Override entry is not an object, replacing");
                Map::new()
            }
            None => Map::new(),
        };

        let modified_at = Local::now().format(TIMESTAMP_FORMAT).to_string();
        entry.insert(remote_field.to_string(), number_value(number));
        entry.insert(schema::LAST_MODIFIED.to_string(), Value::from(modified_at.clone()));
        entry.insert(schema::MODIFIED_BY.to_string(), Value::from(self.modifier_tag.clone()));

        self.remote
            .set(&path, Value::Object(entry))
            .await
            .map_err(|e| WriteBackError::Remote {
                reason: format!("{:#}", e),
            })?;

        let patched_version = match self.snapshot.patch_field(record_id, field, number_value(number)) {
            Ok(version) => Some(version),
            Err(e @ PatchError::NotFound { .. }) | Err(e @ PatchError::Empty) => {
                warn!(record_id, error = %e, "Remote write succeeded but local snapshot not patched");
                None
            }
        };

        Ok(WriteAck {
            record_id: record_id.to_string(),
            field: field.to_string(),
            remote_field: remote_field.to_string(),
            value: number,
            modified_at,
            patched_version,
        })
    }
}

fn parse_numeric(field: &str, value: &Value) -> Result<f64, WriteBackError> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .filter(|v| v.is_finite())
        .ok_or_else(|| WriteBackError::InvalidValue {
            field: field.to_string(),
            raw: match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        })
}
