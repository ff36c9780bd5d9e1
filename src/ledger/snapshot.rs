//! JSON ledger snapshots with schema migration
//!
//! Schema history:
//! - v1: no `schema_version`; curves carry no `holder_count` and paused
//!   curves do not record the status they were paused from.
//! - v2: both fields are required. Migration derives them from the holder
//!   table and treats legacy paused curves as paused from `active`.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::memory::EntityBook;
use crate::error::{Error, Result};

pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Serialized ledger contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub schema_version: u32,
    pub saved_at: DateTime<Utc>,
    pub entities: Vec<EntityBook>,
}

impl LedgerSnapshot {
    pub fn new(entities: Vec<EntityBook>) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            saved_at: Utc::now(),
            entities,
        }
    }
}

/// Read and migrate a snapshot file
pub async fn read(path: &Path) -> Result<LedgerSnapshot> {
    let data = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Persistence(format!("{}: {}", path.display(), e)))?;

    let raw: Value =
        serde_json::from_str(&data).map_err(|e| Error::Deserialization(e.to_string()))?;

    parse(raw)
}

/// Write a snapshot through a temporary file so readers never see a partial file
pub async fn write(path: &Path, snapshot: &LedgerSnapshot) -> Result<()> {
    let data = serde_json::to_string_pretty(snapshot)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::Persistence(format!("{}: {}", parent.display(), e)))?;
    }

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, data)
        .await
        .map_err(|e| Error::Persistence(format!("{}: {}", tmp.display(), e)))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| Error::Persistence(format!("{}: {}", path.display(), e)))?;
    Ok(())
}

/// Migrate a raw snapshot value to the current schema and decode it
pub fn parse(raw: Value) -> Result<LedgerSnapshot> {
    let migrated = migrate(raw)?;
    serde_json::from_value(migrated).map_err(|e| Error::Deserialization(e.to_string()))
}

fn migrate(mut raw: Value) -> Result<Value> {
    let version = raw
        .get("schema_version")
        .and_then(Value::as_u64)
        .unwrap_or(1) as u32;

    if version > CURRENT_SCHEMA_VERSION {
        return Err(Error::Deserialization(format!(
            "snapshot schema {} is newer than supported {}",
            version, CURRENT_SCHEMA_VERSION
        )));
    }

    if version < 2 {
        migrate_v1_to_v2(&mut raw)?;
        info!(from = version, to = 2, "Migrated ledger snapshot");
    }

    Ok(raw)
}

fn migrate_v1_to_v2(raw: &mut Value) -> Result<()> {
    let root = raw
        .as_object_mut()
        .ok_or_else(|| Error::Deserialization("snapshot root is not an object".to_string()))?;

    root.insert("schema_version".to_string(), Value::from(2u32));
    root.entry("saved_at")
        .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));

    let entities = root
        .get_mut("entities")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| Error::Deserialization("snapshot has no entities array".to_string()))?;

    for book in entities.iter_mut() {
        let holder_count = book
            .get("holders")
            .and_then(Value::as_object)
            .map(|holders| {
                holders
                    .values()
                    .filter(|h| h.get("balance").and_then(Value::as_u64).unwrap_or(0) > 0)
                    .count()
            })
            .unwrap_or(0);

        let curve = book
            .pointer_mut("/entity/curve")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| Error::Deserialization("entity without curve state".to_string()))?;

        curve
            .entry("holder_count")
            .or_insert_with(|| Value::from(holder_count as u64));

        let paused = curve.get("status").and_then(Value::as_str) == Some("paused");
        let missing_origin = curve.get("paused_from").map(Value::is_null).unwrap_or(true);
        if paused && missing_origin {
            curve.insert("paused_from".to_string(), Value::String("active".to_string()));
        }
    }

    Ok(())
}
