use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, warn};

use crate::db::SharedConnection;
use crate::errors::{AppError, AppResult};
use crate::parcels::{Parcel, PARCEL_COLUMNS};

pub const DEFAULT_SEARCH_LIMIT: usize = 50;

static LONG_NUMERIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{10,}$").expect("numeric identifier pattern"));

const NAME_MATCH: &str = "prenom LIKE ?3 ESCAPE '\\' OR nom LIKE ?3 ESCAPE '\\' \
     OR prenom_m LIKE ?3 ESCAPE '\\' OR nom_m LIKE ?3 ESCAPE '\\'";

const RANKED_FILTER: &str = "num_parcel LIKE ?3 ESCAPE '\\' \
     OR prenom LIKE ?3 ESCAPE '\\' OR nom LIKE ?3 ESCAPE '\\' \
     OR prenom_m LIKE ?3 ESCAPE '\\' OR nom_m LIKE ?3 ESCAPE '\\' \
     OR denominat LIKE ?3 ESCAPE '\\' OR village LIKE ?3 ESCAPE '\\' \
     OR properties LIKE ?3 ESCAPE '\\'";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchOptions {
    pub limit: usize,
    pub offset: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_SEARCH_LIMIT,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchPage {
    pub rows: Vec<Parcel>,
    pub total: usize,
}

pub struct ParcelSearch {
    db: Option<SharedConnection>,
}

impl ParcelSearch {
    pub fn new(db: Option<SharedConnection>) -> Self {
        Self { db }
    }

    /// Ranked parcel search. Never fails: storage problems yield an empty page.
    pub fn search(&self, query: &str, options: SearchOptions) -> SearchPage {
        let query = query.trim();
        if query.is_empty() {
            return SearchPage::default();
        }
        match self.try_search(query, options) {
            Ok(page) => {
                debug!(target: "parcel_search", query, total = page.total, returned = page.rows.len(), "search complete");
                page
            }
            Err(AppError::NotInitialized) => {
                debug!(target: "parcel_search", query, "database unavailable; empty search page");
                SearchPage::default()
            }
            Err(err) => {
                warn!(target: "parcel_search", query, ?err, "search failed; returning empty page");
                SearchPage::default()
            }
        }
    }

    fn try_search(&self, query: &str, options: SearchOptions) -> AppResult<SearchPage> {
        let db = self.db.as_ref().ok_or(AppError::NotInitialized)?;
        let conn = db.lock();

        if LONG_NUMERIC.is_match(query) {
            if let Some(parcel) = exact_identifier(&conn, query)? {
                return Ok(SearchPage {
                    rows: vec![parcel.hydrate()],
                    total: 1,
                });
            }
            debug!(target: "parcel_search", query, "no exact identifier match; using ranked search");
        }

        ranked(&conn, query, options)
    }
}

fn exact_identifier(conn: &Connection, query: &str) -> AppResult<Option<Parcel>> {
    let attempts = [
        "num_parcel = ?1",
        "num_parcel LIKE ?1",
        "properties LIKE '%' || ?1 || '%'",
    ];
    for predicate in attempts {
        let sql = format!("SELECT {PARCEL_COLUMNS} FROM parcels WHERE {predicate} ORDER BY id LIMIT 1");
        let found = conn
            .prepare_cached(&sql)?
            .query_row([query], Parcel::from_row)
            .optional()?;
        if found.is_some() {
            return Ok(found);
        }
    }
    Ok(None)
}

fn ranked(conn: &Connection, query: &str, options: SearchOptions) -> AppResult<SearchPage> {
    let escaped = escape_like(query);
    let prefix = format!("{escaped}%");
    let contains = format!("%{escaped}%");

    let sql = format!(
        "SELECT {PARCEL_COLUMNS},
            CASE
                WHEN num_parcel = ?1 COLLATE NOCASE THEN 0
                WHEN num_parcel LIKE ?2 ESCAPE '\\' THEN 1
                WHEN num_parcel LIKE ?3 ESCAPE '\\' THEN 2
                WHEN {NAME_MATCH} THEN 3
                ELSE 4
            END AS tier
        FROM parcels
        WHERE {RANKED_FILTER}
        ORDER BY tier ASC, id ASC
        LIMIT ?4 OFFSET ?5"
    );
    let limit = i64::try_from(options.limit).unwrap_or(i64::MAX);
    let offset = i64::try_from(options.offset).unwrap_or(0);
    let rows = conn
        .prepare_cached(&sql)?
        .query_map(
            rusqlite::params![query, prefix, contains, limit, offset],
            Parcel::from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;

    // Same predicate as the page query; ?1 and ?2 are bound but unused.
    let count_sql = format!("SELECT COUNT(*) FROM parcels WHERE {RANKED_FILTER}");
    let total: i64 = conn
        .prepare_cached(&count_sql)?
        .query_row(rusqlite::params![query, prefix, contains], |row| row.get(0))?;

    Ok(SearchPage {
        rows: rows.into_iter().map(Parcel::hydrate).collect(),
        total: usize::try_from(total).unwrap_or(0),
    })
}

pub(crate) fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
