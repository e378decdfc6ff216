use std::path::Path;

use rusqlite::Connection;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::db::{read_meta, write_meta, META_PREBUILT_VERSION};
use crate::errors::{AppError, AppResult};
use crate::parcels::{backfill_bounding_boxes, count_parcels};

const SNAPSHOT_SCHEMA: &str = "snapshot";
const PARCEL_DATA_COLUMNS: &[&str] = &[
    "num_parcel",
    "parcel_type",
    "typ_pers",
    "prenom",
    "nom",
    "prenom_m",
    "nom_m",
    "denominat",
    "village",
    "geometry",
    "properties",
    "min_lat",
    "min_lng",
    "max_lat",
    "max_lng",
];

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BundledMetadata {
    #[serde(deserialize_with = "string_or_number")]
    pub version: String,
    pub counts: BundledCounts,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct BundledCounts {
    pub total: i64,
}

impl BundledMetadata {
    pub fn from_json(text: &str) -> AppResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected version string, found {other}"
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshOutcome {
    pub refreshed: bool,
    pub previous_version: Option<String>,
    pub version: String,
    pub parcel_count: i64,
}

/// True when the bundled dataset is newer than, or larger than, what the
/// local database holds.
pub fn needs_refresh(conn: &Connection, bundled: &BundledMetadata) -> AppResult<bool> {
    let local_version = read_meta(conn, META_PREBUILT_VERSION)?;
    if local_version.as_deref() != Some(bundled.version.as_str()) {
        return Ok(true);
    }
    Ok(count_parcels(conn)? < bundled.counts.total)
}

/// Replaces the parcels table with the snapshot's rows. Complaints and
/// every other table are untouched.
pub fn refresh_parcels_from_snapshot(
    conn: &mut Connection,
    snapshot_path: &Path,
    bundled: &BundledMetadata,
) -> AppResult<RefreshOutcome> {
    let previous_version = read_meta(conn, META_PREBUILT_VERSION)?;
    if !needs_refresh(conn, bundled)? {
        return Ok(RefreshOutcome {
            refreshed: false,
            previous_version: previous_version.clone(),
            version: bundled.version.clone(),
            parcel_count: count_parcels(conn)?,
        });
    }
    if !snapshot_path.exists() {
        return Err(AppError::Path(format!(
            "bundled snapshot missing at {}",
            snapshot_path.display()
        )));
    }

    let path = snapshot_path.to_string_lossy().to_string();
    conn.execute(&format!("ATTACH DATABASE ?1 AS {SNAPSHOT_SCHEMA}"), [path])?;
    let copied = copy_snapshot(conn, bundled);
    if let Err(err) = conn.execute(&format!("DETACH DATABASE {SNAPSHOT_SCHEMA}"), []) {
        warn!(target: "bundle_refresh", ?err, "failed to detach snapshot");
    }
    let copied = copied?;

    let backfilled = backfill_bounding_boxes(conn)?;
    info!(
        target: "bundle_refresh",
        version = %bundled.version,
        previous = ?previous_version,
        copied,
        backfilled,
        "parcels refreshed from bundled snapshot"
    );
    Ok(RefreshOutcome {
        refreshed: true,
        previous_version,
        version: bundled.version.clone(),
        parcel_count: copied,
    })
}

fn copy_snapshot(conn: &mut Connection, bundled: &BundledMetadata) -> AppResult<i64> {
    let available = snapshot_columns(conn)?;
    if available.is_empty() {
        return Err(AppError::Config("bundled snapshot has no parcels table".into()));
    }
    let columns = PARCEL_DATA_COLUMNS
        .iter()
        .filter(|column| available.iter().any(|c| c == *column))
        .copied()
        .collect::<Vec<_>>()
        .join(", ");

    let tx = conn.transaction()?;
    tx.execute("DELETE FROM parcels", [])?;
    let copied = tx.execute(
        &format!(
            "INSERT INTO main.parcels ({columns}) SELECT {columns} FROM {SNAPSHOT_SCHEMA}.parcels"
        ),
        [],
    )?;
    write_meta(&tx, META_PREBUILT_VERSION, &bundled.version)?;
    tx.commit()?;
    Ok(copied as i64)
}

fn snapshot_columns(conn: &Connection) -> AppResult<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA {SNAPSHOT_SCHEMA}.table_info(parcels)"))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}
