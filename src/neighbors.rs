use std::cmp::Ordering;

use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::{QueryCache, NEIGHBOR_TTL};
use crate::db::SharedConnection;
use crate::errors::{AppError, AppResult};
use crate::geometry::{haversine_m, resolve_centroid, LatLng};
use crate::normalize::canonical_view;
use crate::parcels::{Parcel, PARCEL_COLUMNS};
use crate::search::escape_like;

pub const DEFAULT_NEIGHBOR_LIMIT: usize = 6;
pub const ONE_KM_M: f64 = 1000.0;
const BBOX_PAD_DEG: f64 = 0.01;
const DEPARTMENT_FACTOR: usize = 5;
const SCAN_CAP: i64 = 2000;

#[derive(Debug, Clone, Serialize)]
pub struct Neighbor {
    pub parcel: Parcel,
    pub distance_m: Option<f64>,
    pub within_one_km: bool,
}

impl Neighbor {
    fn unranked(parcel: Parcel) -> Self {
        Self {
            parcel,
            distance_m: None,
            within_one_km: false,
        }
    }
}

pub struct NeighborFinder {
    db: Option<SharedConnection>,
    cache: QueryCache<Vec<Neighbor>>,
    default_limit: usize,
}

impl NeighborFinder {
    pub fn new(db: Option<SharedConnection>, default_limit: usize) -> Self {
        Self {
            db,
            cache: QueryCache::new(),
            default_limit: if default_limit == 0 {
                DEFAULT_NEIGHBOR_LIMIT
            } else {
                default_limit
            },
        }
    }

    /// Nearby parcels ordered by distance from the target's centroid.
    /// Degrades to unranked candidates, or an empty list, instead of failing.
    pub fn find_neighbors(&self, parcel_number: &str, limit: Option<usize>) -> Vec<Neighbor> {
        let parcel_number = parcel_number.trim();
        if parcel_number.is_empty() {
            return Vec::new();
        }
        let limit = limit.filter(|l| *l > 0).unwrap_or(self.default_limit);
        let key = format!("neighbors_{parcel_number}_{limit}");
        if let Some(cached) = self.cache.get(&key, NEIGHBOR_TTL) {
            return cached;
        }

        let neighbors = match self.try_find(parcel_number, limit) {
            Ok(found) => found,
            Err(AppError::NotInitialized) => {
                debug!(target: "neighbors", parcel_number, "database unavailable; no neighbors");
                return Vec::new();
            }
            Err(err) => {
                warn!(target: "neighbors", parcel_number, ?err, "neighbor lookup failed");
                return Vec::new();
            }
        };
        self.cache.insert(key, neighbors.clone());
        neighbors
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    fn try_find(&self, parcel_number: &str, limit: usize) -> AppResult<Vec<Neighbor>> {
        let db = self.db.as_ref().ok_or(AppError::NotInitialized)?;
        let (target, candidates) = {
            let conn = db.lock();
            let Some(target) = load_target(&conn, parcel_number)? else {
                debug!(target: "neighbors", parcel_number, "target parcel not found");
                return Ok(Vec::new());
            };
            let candidates = candidate_pool(&conn, &target, limit)?;
            (target, candidates)
        };

        let origin = target
            .resolved_geometry()
            .as_ref()
            .and_then(resolve_centroid)
            .filter(|c| c.plausible)
            .map(|c| c.point);
        let Some(origin) = origin else {
            debug!(target: "neighbors", parcel_number, candidates = candidates.len(), "target centroid unusable; returning unranked candidates");
            return Ok(unranked(candidates, limit));
        };

        let ranked = rank_by_distance(origin, &candidates, limit);
        if ranked.is_empty() {
            return Ok(unranked(candidates, limit));
        }
        debug!(target: "neighbors", parcel_number, returned = ranked.len(), "neighbors ranked");
        Ok(ranked)
    }
}

fn load_target(conn: &Connection, parcel_number: &str) -> AppResult<Option<Parcel>> {
    let sql = format!("SELECT {PARCEL_COLUMNS} FROM parcels WHERE num_parcel = ?1 ORDER BY id LIMIT 1");
    let mut rows = query(conn, &sql, rusqlite::params![parcel_number])?;
    Ok(rows.pop().map(Parcel::hydrate))
}

/// Layers the cheap textual pools first; an overlapping bounding-box pool
/// replaces them when it finds anything. Rows sharing the target's number
/// are never candidates.
fn candidate_pool(conn: &Connection, target: &Parcel, limit: usize) -> AppResult<Vec<Parcel>> {
    let divisions = canonical_view(&target.properties).divisions;
    let mut pool = Vec::new();

    if let Some(commune) = divisions.commune.as_deref() {
        pool = properties_matching(conn, target, commune, limit)?;
    }
    if pool.is_empty() {
        if let Some(department) = divisions.department.as_deref() {
            pool = properties_matching(conn, target, department, limit * DEPARTMENT_FACTOR)?;
        }
    }
    if let Some(bbox) = target.bbox {
        let padded = bbox.padded(BBOX_PAD_DEG);
        let sql = format!(
            "SELECT {PARCEL_COLUMNS} FROM parcels
            WHERE id <> ?1 AND num_parcel IS NOT ?6
              AND min_lat <= ?2 AND max_lat >= ?3 AND min_lng <= ?4 AND max_lng >= ?5
            ORDER BY id"
        );
        let overlapping = query(
            conn,
            &sql,
            rusqlite::params![
                target.id,
                padded.max_lat,
                padded.min_lat,
                padded.max_lng,
                padded.min_lng,
                target.num_parcel
            ],
        )?;
        if !overlapping.is_empty() {
            pool = overlapping;
        }
    }
    if pool.is_empty() {
        let sql = format!(
            "SELECT {PARCEL_COLUMNS} FROM parcels
            WHERE id <> ?1 AND num_parcel IS NOT ?3 AND geometry IS NOT NULL AND geometry <> ''
            ORDER BY id LIMIT ?2"
        );
        pool = query(conn, &sql, rusqlite::params![target.id, SCAN_CAP, target.num_parcel])?;
    }
    Ok(pool.into_iter().map(Parcel::hydrate).collect())
}

fn properties_matching(conn: &Connection, target: &Parcel, needle: &str, limit: usize) -> AppResult<Vec<Parcel>> {
    let sql = format!(
        "SELECT {PARCEL_COLUMNS} FROM parcels
        WHERE id <> ?1 AND num_parcel IS NOT ?4 AND properties LIKE ?2 ESCAPE '\\'
        ORDER BY id LIMIT ?3"
    );
    let pattern = format!("%{}%", escape_like(needle));
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    query(conn, &sql, rusqlite::params![target.id, pattern, limit, target.num_parcel])
}

fn query(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> AppResult<Vec<Parcel>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt
        .query_map(params, Parcel::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn rank_by_distance(origin: LatLng, candidates: &[Parcel], limit: usize) -> Vec<Neighbor> {
    let mut scored: Vec<(f64, &Parcel)> = candidates
        .iter()
        .filter_map(|parcel| {
            let centroid = resolve_centroid(&parcel.resolved_geometry()?)?;
            Some((haversine_m(origin, centroid.point), parcel))
        })
        .collect();
    scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
    scored
        .into_iter()
        .take(limit)
        .map(|(distance, parcel)| Neighbor {
            parcel: parcel.clone(),
            distance_m: Some(distance),
            within_one_km: distance <= ONE_KM_M,
        })
        .collect()
}

fn unranked(candidates: Vec<Parcel>, limit: usize) -> Vec<Neighbor> {
    candidates.into_iter().take(limit).map(Neighbor::unranked).collect()
}
