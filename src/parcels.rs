use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Serialize, Serializer};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::cache::{QueryCache, STATS_TTL, VILLAGE_TTL};
use crate::config::AppConfig;
use crate::db::SharedConnection;
use crate::errors::{AppError, AppResult};
use crate::geometry::{normalize_axis_order, resolve_geometry, BoundingBox, Geometry};
use crate::normalize::{
    ensure_collective_keys, normalize_properties, properties_or_empty, value_text, PropertyBag,
};

pub(crate) const PARCEL_COLUMNS: &str = "id, num_parcel, parcel_type, typ_pers, prenom, nom, \
     prenom_m, nom_m, denominat, village, geometry, properties, min_lat, min_lng, max_lat, max_lng";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParcelType {
    Individual,
    Collective,
    Other(String),
}

impl ParcelType {
    pub fn as_tag(&self) -> &str {
        match self {
            ParcelType::Individual => "individuel",
            ParcelType::Collective => "collectif",
            ParcelType::Other(tag) => tag.as_str(),
        }
    }

    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_lowercase().as_str() {
            "individuel" | "individual" => ParcelType::Individual,
            "collectif" | "collective" => ParcelType::Collective,
            _ => ParcelType::Other(tag.to_string()),
        }
    }
}

impl fmt::Display for ParcelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

impl Serialize for ParcelType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_tag())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Parcel {
    pub id: i64,
    pub num_parcel: Option<String>,
    pub parcel_type: Option<ParcelType>,
    pub typ_pers: Option<String>,
    pub prenom: Option<String>,
    pub nom: Option<String>,
    pub prenom_m: Option<String>,
    pub nom_m: Option<String>,
    pub denominat: Option<String>,
    pub village: Option<String>,
    pub geometry: Option<String>,
    pub properties: PropertyBag,
    pub bbox: Option<BoundingBox>,
}

impl Parcel {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let bbox = match (
            row.get::<_, Option<f64>>(12)?,
            row.get::<_, Option<f64>>(13)?,
            row.get::<_, Option<f64>>(14)?,
            row.get::<_, Option<f64>>(15)?,
        ) {
            (Some(min_lat), Some(min_lng), Some(max_lat), Some(max_lng)) => Some(BoundingBox {
                min_lat,
                min_lng,
                max_lat,
                max_lng,
            }),
            _ => None,
        };
        Ok(Self {
            id: row.get(0)?,
            num_parcel: text_at(row, 1)?,
            parcel_type: text_at(row, 2)?.map(|tag| ParcelType::from_tag(&tag)),
            typ_pers: text_at(row, 3)?,
            prenom: text_at(row, 4)?,
            nom: text_at(row, 5)?,
            prenom_m: text_at(row, 6)?,
            nom_m: text_at(row, 7)?,
            denominat: text_at(row, 8)?,
            village: text_at(row, 9)?,
            geometry: text_at(row, 10)?,
            properties: properties_or_empty(text_at(row, 11)?.as_deref()),
            bbox,
        })
    }

    /// Expands the property bag, guarantees the collective keys and copies
    /// property values into empty columns.
    pub fn hydrate(mut self) -> Self {
        let mut normalized = normalize_properties(&self.properties);
        ensure_collective_keys(&mut normalized);
        self.properties = normalized;

        let props = &self.properties;
        fill(&mut self.num_parcel, props, &["num_parcel", "Num_parcel"]);
        fill(&mut self.typ_pers, props, &["typ_pers", "Typ_pers"]);
        fill(&mut self.prenom, props, &["prenom", "Prenom"]);
        fill(&mut self.nom, props, &["nom", "Nom"]);
        fill(&mut self.prenom_m, props, &["prenom_m", "Prenom_M"]);
        fill(&mut self.nom_m, props, &["nom_m", "Nom_M"]);
        fill(&mut self.denominat, props, &["denominat", "Denominat"]);
        fill(&mut self.village, props, &["village", "Village"]);
        self
    }

    /// Flat key/value view: columns first, then every property key that
    /// does not shadow a populated column.
    pub fn flattened(&self) -> PropertyBag {
        let mut row = PropertyBag::new();
        row.insert("id".into(), Value::from(self.id));
        let columns = [
            ("num_parcel", &self.num_parcel),
            ("typ_pers", &self.typ_pers),
            ("prenom", &self.prenom),
            ("nom", &self.nom),
            ("prenom_m", &self.prenom_m),
            ("nom_m", &self.nom_m),
            ("denominat", &self.denominat),
            ("village", &self.village),
        ];
        for (name, value) in columns {
            row.insert(name.into(), value.clone().map(Value::from).unwrap_or(Value::Null));
        }
        row.insert(
            "parcel_type".into(),
            self.parcel_type
                .as_ref()
                .map(|t| Value::from(t.as_tag()))
                .unwrap_or(Value::Null),
        );
        for (key, value) in &self.properties {
            if matches!(key.as_str(), "id" | "geometry" | "properties") {
                continue;
            }
            let vacant = match row.get(key) {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.is_empty(),
                Some(_) => false,
            };
            if vacant {
                row.insert(key.clone(), value.clone());
            }
        }
        row
    }

    pub fn resolved_geometry(&self) -> Option<Geometry> {
        resolve_geometry(self.geometry.as_deref(), &self.properties)
    }
}

fn fill(slot: &mut Option<String>, props: &PropertyBag, names: &[&str]) {
    if slot.as_deref().map_or(false, |s| !s.is_empty()) {
        return;
    }
    if let Some(found) = names.iter().find_map(|name| props.get(*name).and_then(value_text)) {
        *slot = Some(found);
    }
}

/// Reads a column as text regardless of the storage class the dataset used.
fn text_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<String>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
    })
}

/// A parcel ready to be written, derived from a GeoJSON feature.
#[derive(Debug, Clone)]
pub struct NewParcel {
    pub num_parcel: Option<String>,
    pub parcel_type: ParcelType,
    pub typ_pers: Option<String>,
    pub prenom: Option<String>,
    pub nom: Option<String>,
    pub prenom_m: Option<String>,
    pub nom_m: Option<String>,
    pub denominat: Option<String>,
    pub village: Option<String>,
    pub geometry: Option<String>,
    pub properties: PropertyBag,
    pub bbox: Option<BoundingBox>,
}

impl NewParcel {
    pub fn from_feature(feature: &Value, kind: ParcelType) -> Self {
        let raw = feature
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let props = normalize_properties(&raw);

        let geometry = feature
            .get("geometry")
            .filter(|g| !g.is_null())
            .and_then(|g| Geometry::from_value(g).ok())
            .map(|g| normalize_axis_order(&g))
            .or_else(|| resolve_geometry(None, &props));
        let bbox = geometry.as_ref().and_then(BoundingBox::from_geometry);

        let (prenom, nom, prenom_m, nom_m) = match kind {
            ParcelType::Collective => (
                None,
                None,
                pick(&props, &["Prenom_M", "prenom_m", "Prenom", "prenom"]),
                pick(&props, &["Nom_M", "nom_m", "Nom", "nom"]),
            ),
            _ => (
                pick(&props, &["Prenom", "prenom"]),
                pick(&props, &["Nom", "nom"]),
                None,
                None,
            ),
        };

        Self {
            num_parcel: pick(&props, &["Num_parcel", "num_parcel"]),
            parcel_type: kind,
            typ_pers: pick(&props, &["Typ_pers", "typ_pers"]),
            prenom,
            nom,
            prenom_m,
            nom_m,
            denominat: pick(&props, &["Denominat", "denominat"]),
            village: pick(&props, &["Village", "village"]),
            geometry: geometry.map(|g| g.to_value().to_string()),
            properties: props,
            bbox,
        }
    }
}

fn pick(props: &PropertyBag, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        props
            .get(*name)
            .and_then(value_text)
            .or_else(|| props.get(&name.to_lowercase()).and_then(value_text))
    })
}

pub(crate) fn insert_parcel(conn: &Connection, parcel: &NewParcel) -> AppResult<i64> {
    let properties = serde_json::to_string(&parcel.properties)?;
    conn.execute(
        "INSERT INTO parcels (num_parcel, parcel_type, typ_pers, prenom, nom, prenom_m, nom_m,
            denominat, village, geometry, properties, min_lat, min_lng, max_lat, max_lng)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        rusqlite::params![
            parcel.num_parcel,
            parcel.parcel_type.as_tag(),
            parcel.typ_pers,
            parcel.prenom,
            parcel.nom,
            parcel.prenom_m,
            parcel.nom_m,
            parcel.denominat,
            parcel.village,
            parcel.geometry,
            properties,
            parcel.bbox.map(|b| b.min_lat),
            parcel.bbox.map(|b| b.min_lng),
            parcel.bbox.map(|b| b.max_lat),
            parcel.bbox.map(|b| b.max_lng),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParcelStats {
    pub total_parcels: i64,
    pub individual_parcels: i64,
    pub collective_parcels: i64,
    pub villages: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParcelSummary {
    pub id: i64,
    pub num_parcel: Option<String>,
    pub parcel_type: Option<String>,
    pub nom: Option<String>,
    pub prenom: Option<String>,
    pub nom_m: Option<String>,
    pub prenom_m: Option<String>,
    pub village: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub is_initialized: bool,
    pub has_parcel_table: bool,
    pub row_count: i64,
    pub sample: Vec<ParcelSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SeedProgress {
    pub inserted: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SeedSummary {
    pub inserted: usize,
    pub failed: usize,
    pub skipped: bool,
}

pub type SeedObserver = Arc<dyn Fn(SeedProgress) + Send + Sync>;

/// Source features for an initial load, split by parcel type.
#[derive(Debug, Clone, Default)]
pub struct SeedDataset {
    pub individuels: Vec<Value>,
    pub collectifs: Vec<Value>,
}

impl SeedDataset {
    pub fn len(&self) -> usize {
        self.individuels.len() + self.collectifs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reads a feature list from a JSON array or a `FeatureCollection`.
pub fn load_features(path: &Path) -> AppResult<Vec<Value>> {
    let text = std::fs::read_to_string(path)?;
    match serde_json::from_str::<Value>(&text)? {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("features") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(AppError::Config(format!(
                "{} is neither a feature array nor a FeatureCollection",
                path.display()
            ))),
        },
        _ => Err(AppError::Config(format!(
            "{} does not contain parcel features",
            path.display()
        ))),
    }
}

pub struct ParcelRepository {
    db: Option<SharedConnection>,
    batch_size: usize,
    batch_delay: Duration,
    village_cache: QueryCache<Vec<Parcel>>,
    stats_cache: QueryCache<ParcelStats>,
}

impl ParcelRepository {
    pub fn new(db: Option<SharedConnection>, config: &AppConfig) -> Self {
        Self {
            db,
            batch_size: config.seed_batch_size.max(1),
            batch_delay: Duration::from_millis(config.seed_batch_delay_ms),
            village_cache: QueryCache::new(),
            stats_cache: QueryCache::new(),
        }
    }

    fn require_db(&self) -> AppResult<&SharedConnection> {
        self.db.as_ref().ok_or(AppError::NotInitialized)
    }

    fn query_parcels(&self, sql: &str, params: impl rusqlite::Params) -> AppResult<Vec<Parcel>> {
        let conn = self.require_db()?.lock();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt
            .query_map(params, Parcel::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn parcel_by_id(&self, id: i64) -> Option<Parcel> {
        let sql = format!("SELECT {PARCEL_COLUMNS} FROM parcels WHERE id = ?1");
        first_or_log(self.query_parcels(&sql, [id]), "parcel_by_id")
    }

    pub fn parcel_by_number(&self, num_parcel: &str) -> Option<Parcel> {
        let sql = format!("SELECT {PARCEL_COLUMNS} FROM parcels WHERE num_parcel = ?1 LIMIT 1");
        first_or_log(self.query_parcels(&sql, [num_parcel.trim()]), "parcel_by_number")
    }

    pub fn parcels_by_type(&self, parcel_type: &ParcelType) -> Vec<Parcel> {
        let sql = format!("SELECT {PARCEL_COLUMNS} FROM parcels WHERE parcel_type = ?1 ORDER BY id");
        all_or_log(self.query_parcels(&sql, [parcel_type.as_tag()]), "parcels_by_type")
            .into_iter()
            .map(Parcel::hydrate)
            .collect()
    }

    pub fn parcels_by_village(&self, village: &str) -> Vec<Parcel> {
        let key = format!("village_{village}");
        if let Some(cached) = self.village_cache.get(&key, VILLAGE_TTL) {
            return cached;
        }
        let sql = format!(
            "SELECT {PARCEL_COLUMNS} FROM parcels WHERE village = ?1 COLLATE NOCASE ORDER BY id"
        );
        let parcels: Vec<Parcel> = all_or_log(self.query_parcels(&sql, [village]), "parcels_by_village")
            .into_iter()
            .map(Parcel::hydrate)
            .collect();
        self.village_cache.insert(key, parcels.clone());
        parcels
    }

    pub fn geometry_for(&self, num_parcel: &str) -> Option<Geometry> {
        self.parcel_by_number(num_parcel)?.resolved_geometry()
    }

    pub fn stats(&self) -> AppResult<ParcelStats> {
        let db = self.require_db()?;
        if let Some(cached) = self.stats_cache.get("stats", STATS_TTL) {
            return Ok(cached);
        }
        let stats = {
            let conn = db.lock();
            let count = |sql: &str| -> AppResult<i64> { Ok(conn.query_row(sql, [], |row| row.get(0))?) };
            let total_parcels = count("SELECT COUNT(*) FROM parcels")?;
            let individual_parcels =
                count("SELECT COUNT(*) FROM parcels WHERE parcel_type = 'individuel'")?;
            let collective_parcels =
                count("SELECT COUNT(*) FROM parcels WHERE parcel_type = 'collectif'")?;
            let mut stmt = conn.prepare(
                "SELECT DISTINCT village FROM parcels WHERE village IS NOT NULL AND village <> '' ORDER BY village",
            )?;
            let villages = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ParcelStats {
                total_parcels,
                individual_parcels,
                collective_parcels,
                villages,
            }
        };
        self.stats_cache.insert("stats", stats.clone());
        Ok(stats)
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let mut report = Diagnostics {
            is_initialized: self.db.is_some(),
            has_parcel_table: false,
            row_count: 0,
            sample: Vec::new(),
        };
        let Some(db) = &self.db else {
            return report;
        };
        let conn = db.lock();
        if let Err(err) = collect_diagnostics(&conn, &mut report) {
            warn!(target: "parcels", ?err, "diagnostics query failed");
        }
        report
    }

    pub fn clear_cache(&self) {
        self.village_cache.clear();
        self.stats_cache.clear();
    }

    /// Bulk-loads features in one transaction per batch, yielding between
    /// batches. A populated table is left alone unless `force_reload`.
    pub async fn seed(
        &self,
        dataset: SeedDataset,
        force_reload: bool,
        observer: Option<SeedObserver>,
    ) -> AppResult<SeedSummary> {
        let db = Arc::clone(self.require_db()?);
        {
            let conn = db.lock();
            let existing: i64 = conn.query_row("SELECT COUNT(*) FROM parcels", [], |row| row.get(0))?;
            if existing > 0 && !force_reload {
                debug!(target: "parcel_seed", existing, "parcels already present; skipping seed");
                return Ok(SeedSummary {
                    inserted: 0,
                    failed: 0,
                    skipped: true,
                });
            }
            if existing > 0 {
                conn.execute("DELETE FROM parcels", [])?;
                info!(target: "parcel_seed", existing, "cleared parcels for reload");
            }
        }

        let total = dataset.len();
        let mut progress = SeedProgress { inserted: 0, total };
        let mut failed = 0;
        if let Some(callback) = &observer {
            callback(progress);
        }

        let batches = [
            (ParcelType::Individual, dataset.individuels),
            (ParcelType::Collective, dataset.collectifs),
        ];
        for (kind, features) in batches {
            for chunk in features.chunks(self.batch_size) {
                {
                    let mut conn = db.lock();
                    let tx = conn.transaction()?;
                    for feature in chunk {
                        let parcel = NewParcel::from_feature(feature, kind.clone());
                        match insert_parcel(&tx, &parcel) {
                            Ok(_) => progress.inserted += 1,
                            Err(err) => {
                                failed += 1;
                                warn!(target: "parcel_seed", ?err, kind = %kind, "parcel insert failed");
                            }
                        }
                    }
                    tx.commit()?;
                }
                if let Some(callback) = &observer {
                    callback(progress);
                }
                sleep(self.batch_delay).await;
            }
        }

        self.clear_cache();
        info!(
            target: "parcel_seed",
            inserted = progress.inserted,
            failed,
            "parcel seed complete"
        );
        Ok(SeedSummary {
            inserted: progress.inserted,
            failed,
            skipped: false,
        })
    }

    /// Fills bounding-box columns for rows that predate them.
    pub fn backfill_bounding_boxes(&self) -> AppResult<usize> {
        let db = self.require_db()?;
        let mut conn = db.lock();
        backfill_bounding_boxes(&mut conn)
    }
}

fn collect_diagnostics(conn: &Connection, report: &mut Diagnostics) -> AppResult<()> {
    let tables: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'parcels'",
        [],
        |row| row.get(0),
    )?;
    report.has_parcel_table = tables > 0;
    if !report.has_parcel_table {
        return Ok(());
    }
    report.row_count = conn.query_row("SELECT COUNT(*) FROM parcels", [], |row| row.get(0))?;
    let mut stmt = conn.prepare(
        "SELECT id, num_parcel, parcel_type, nom, prenom, nom_m, prenom_m, village
        FROM parcels ORDER BY id LIMIT 5",
    )?;
    report.sample = stmt
        .query_map([], |row| {
            Ok(ParcelSummary {
                id: row.get(0)?,
                num_parcel: text_at(row, 1)?,
                parcel_type: text_at(row, 2)?,
                nom: text_at(row, 3)?,
                prenom: text_at(row, 4)?,
                nom_m: text_at(row, 5)?,
                prenom_m: text_at(row, 6)?,
                village: text_at(row, 7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(())
}

pub(crate) fn backfill_bounding_boxes(conn: &mut Connection) -> AppResult<usize> {
    let pending = {
        let mut stmt = conn.prepare(
            "SELECT id, geometry, properties FROM parcels
            WHERE min_lat IS NULL OR min_lng IS NULL OR max_lat IS NULL OR max_lng IS NULL",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, text_at(row, 1)?, text_at(row, 2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let tx = conn.transaction()?;
    let mut updated = 0;
    {
        let mut stmt = tx.prepare(
            "UPDATE parcels SET min_lat = ?2, min_lng = ?3, max_lat = ?4, max_lng = ?5 WHERE id = ?1",
        )?;
        for (id, geometry, properties) in pending {
            let props = properties_or_empty(properties.as_deref());
            let Some(bbox) = resolve_geometry(geometry.as_deref(), &props)
                .as_ref()
                .and_then(BoundingBox::from_geometry)
            else {
                continue;
            };
            stmt.execute(rusqlite::params![
                id,
                bbox.min_lat,
                bbox.min_lng,
                bbox.max_lat,
                bbox.max_lng
            ])?;
            updated += 1;
        }
    }
    tx.commit()?;
    debug!(target: "parcels", updated, "bounding boxes backfilled");
    Ok(updated)
}

pub(crate) fn count_parcels(conn: &Connection) -> AppResult<i64> {
    conn.query_row("SELECT COUNT(*) FROM parcels", [], |row| row.get(0))
        .optional()
        .map(|count| count.unwrap_or(0))
        .map_err(AppError::from)
}

fn first_or_log(result: AppResult<Vec<Parcel>>, op: &'static str) -> Option<Parcel> {
    all_or_log(result, op).into_iter().next().map(Parcel::hydrate)
}

fn all_or_log(result: AppResult<Vec<Parcel>>, op: &'static str) -> Vec<Parcel> {
    match result {
        Ok(rows) => rows,
        Err(AppError::NotInitialized) => {
            debug!(target: "parcels", op, "database unavailable; returning no parcels");
            Vec::new()
        }
        Err(err) => {
            warn!(target: "parcels", op, ?err, "parcel query failed");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::db::{open_in_memory, shared};

    fn feature(num: &str, village: &str, lng: f64, lat: f64) -> Value {
        json!({
            "type": "Feature",
            "properties": {"Num_parcel": num, "Village_IND": village, "Prenom": "Awa", "Nom": "Diallo"},
            "geometry": {"type": "Polygon", "coordinates": [[[lng, lat], [lng + 0.001, lat], [lng + 0.001, lat + 0.001], [lng, lat]]]}
        })
    }

    fn repository() -> ParcelRepository {
        let config = AppConfig {
            seed_batch_size: 2,
            seed_batch_delay_ms: 0,
            ..AppConfig::default()
        };
        ParcelRepository::new(Some(shared(open_in_memory().unwrap())), &config)
    }

    #[tokio::test]
    async fn seeds_in_batches_and_reports_progress() {
        let repo = repository();
        let calls = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&calls);
        let observer: SeedObserver = Arc::new(move |_progress: SeedProgress| {
            observed.fetch_add(1, Ordering::SeqCst);
        });
        let dataset = SeedDataset {
            individuels: vec![
                feature("0522010200001", "Sare", -16.2, 12.5),
                feature("0522010200002", "Sare", -16.19, 12.5),
                feature("0522010200003", "Dioulacolon", -16.18, 12.5),
            ],
            collectifs: vec![json!({
                "properties": {"Num_parcel": "0522010200099", "Prenom_M_COL": "Mamadou", "Nom_M_COL": "Kane"},
                "geometry": {"type": "Polygon", "coordinates": [[[12.5, -16.2], [12.5, -16.199], [12.501, -16.199], [12.5, -16.2]]]}
            })],
        };

        let summary = repo.seed(dataset, false, Some(observer)).await.unwrap();
        assert_eq!(summary.inserted, 4);
        assert!(!summary.skipped);
        // initial report plus one per batch (2 individual, 1 collective)
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let collective = repo.parcel_by_number("0522010200099").unwrap();
        assert_eq!(collective.parcel_type, Some(ParcelType::Collective));
        assert_eq!(collective.prenom_m.as_deref(), Some("Mamadou"));
        let bbox = collective.bbox.unwrap();
        assert!((bbox.min_lng + 16.2).abs() < 1e-9);
        assert!((bbox.max_lat - 12.501).abs() < 1e-9);

        let again = repo.seed(SeedDataset::default(), false, None).await.unwrap();
        assert!(again.skipped);
    }

    #[tokio::test]
    async fn stats_and_village_listing_are_cached() {
        let repo = repository();
        let dataset = SeedDataset {
            individuels: vec![
                feature("0522010200001", "Sare", -16.2, 12.5),
                feature("0522010200002", "Dioulacolon", -16.19, 12.5),
            ],
            collectifs: Vec::new(),
        };
        repo.seed(dataset, false, None).await.unwrap();

        let stats = repo.stats().unwrap();
        assert_eq!(stats.total_parcels, 2);
        assert_eq!(stats.individual_parcels, 2);
        assert_eq!(stats.collective_parcels, 0);
        assert_eq!(stats.villages, vec!["Dioulacolon", "Sare"]);

        let sare = repo.parcels_by_village("sare");
        assert_eq!(sare.len(), 1);
        assert!(sare[0].properties.contains_key("Prenom_027"));

        {
            let conn = repo.db.as_ref().unwrap().lock();
            insert_parcel(
                &conn,
                &NewParcel::from_feature(&feature("0522010200003", "Sare", -16.0, 12.0), ParcelType::Individual),
            )
            .unwrap();
        }
        assert_eq!(repo.parcels_by_village("sare").len(), 1);
        assert_eq!(repo.stats().unwrap().total_parcels, 2);

        repo.clear_cache();
        assert_eq!(repo.parcels_by_village("sare").len(), 2);
        assert_eq!(repo.stats().unwrap().total_parcels, 3);
        assert_eq!(repo.parcels_by_type(&ParcelType::Individual).len(), 3);
    }

    #[test]
    fn administrative_operations_require_database() {
        let repo = ParcelRepository::new(None, &AppConfig::default());
        assert!(matches!(repo.stats(), Err(AppError::NotInitialized)));
        assert!(matches!(
            repo.backfill_bounding_boxes(),
            Err(AppError::NotInitialized)
        ));
        assert!(repo.parcel_by_number("0522010200001").is_none());
        assert!(repo.parcels_by_village("Sare").is_empty());
        let report = repo.diagnostics();
        assert!(!report.is_initialized);
        assert_eq!(report.row_count, 0);
    }

    #[test]
    fn hydrate_fills_only_empty_columns() {
        let conn = open_in_memory().unwrap();
        conn.execute(
            "INSERT INTO parcels (num_parcel, parcel_type, prenom, village, properties)
            VALUES (522010200001, 'individuel', 'Awa', '', ?1)",
            [json!({"Prenom": "Other", "Village_COL": "Sare", "nom_1": "Ba"}).to_string()],
        )
        .unwrap();
        let sql = format!("SELECT {PARCEL_COLUMNS} FROM parcels");
        let parcel = conn
            .query_row(&sql, [], Parcel::from_row)
            .unwrap()
            .hydrate();

        assert_eq!(parcel.num_parcel.as_deref(), Some("522010200001"));
        assert_eq!(parcel.prenom.as_deref(), Some("Awa"));
        assert_eq!(parcel.village.as_deref(), Some("Sare"));
        assert_eq!(parcel.properties["Nom_001"], json!("Ba"));

        let flat = parcel.flattened();
        assert_eq!(flat["prenom"], json!("Awa"));
        assert_eq!(flat["Nom_001"], json!("Ba"));
        assert_eq!(flat["Enqueteur"], Value::Null);
        assert_eq!(flat["parcel_type"], json!("individuel"));
    }

    #[test]
    fn backfills_missing_bounding_boxes() {
        let mut conn = open_in_memory().unwrap();
        conn.execute(
            "INSERT INTO parcels (num_parcel, geometry, properties) VALUES ('A', ?1, '{}'), ('B', NULL, 'garbage')",
            [json!({"type": "Polygon", "coordinates": [[[-16.2, 12.5], [-16.1, 12.5], [-16.1, 12.6], [-16.2, 12.5]]]}).to_string()],
        )
        .unwrap();
        assert_eq!(backfill_bounding_boxes(&mut conn).unwrap(), 1);
        let max_lat: f64 = conn
            .query_row("SELECT max_lat FROM parcels WHERE num_parcel = 'A'", [], |row| row.get(0))
            .unwrap();
        assert!((max_lat - 12.6).abs() < 1e-9);
        assert_eq!(count_parcels(&conn).unwrap(), 2);
    }

    #[test]
    fn diagnostics_sample_existing_rows() {
        let repo = repository();
        {
            let conn = repo.db.as_ref().unwrap().lock();
            for n in 0..7 {
                let num = format!("05220102000{n:02}");
                insert_parcel(
                    &conn,
                    &NewParcel::from_feature(&feature(&num, "Sare", -16.2, 12.5), ParcelType::Individual),
                )
                .unwrap();
            }
        }
        let report = repo.diagnostics();
        assert!(report.is_initialized && report.has_parcel_table);
        assert_eq!(report.row_count, 7);
        assert_eq!(report.sample.len(), 5);
        assert_eq!(report.sample[0].village.as_deref(), Some("Sare"));
    }
}
