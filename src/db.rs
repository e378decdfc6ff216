use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};

pub type SharedConnection = Arc<Mutex<Connection>>;

pub const META_PREBUILT_VERSION: &str = "prebuilt_version";

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

impl DatabaseContext {
    pub fn into_shared(self) -> (SharedConnection, PathBuf) {
        (Arc::new(Mutex::new(self.connection)), self.path)
    }
}

pub fn bootstrap<P: AsRef<Path>>(data_dir: P, database_file: &str) -> AppResult<DatabaseContext> {
    let data_dir = data_dir.as_ref();
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join(database_file);

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(&db_path, flags)?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        "#,
    )?;
    run_migrations(&connection)?;

    info!(
        target: "database_bootstrap",
        path = %db_path.display(),
        "parcel database ready"
    );
    Ok(DatabaseContext {
        connection,
        path: db_path,
    })
}

pub fn open_in_memory() -> AppResult<Connection> {
    let connection = Connection::open_in_memory()?;
    run_migrations(&connection)?;
    Ok(connection)
}

pub fn shared(connection: Connection) -> SharedConnection {
    Arc::new(Mutex::new(connection))
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS parcels (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            num_parcel TEXT,
            parcel_type TEXT,
            typ_pers TEXT,
            prenom TEXT,
            nom TEXT,
            prenom_m TEXT,
            nom_m TEXT,
            denominat TEXT,
            village TEXT,
            geometry TEXT,
            properties TEXT
        );

        CREATE TABLE IF NOT EXISTS complaints (
            id TEXT PRIMARY KEY,
            parcel_number TEXT,
            created_at TEXT NOT NULL DEFAULT (DATETIME('now')),
            data TEXT NOT NULL DEFAULT '{}'
        );

        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT
        );
        "#,
    )?;

    for definition in ["min_lat REAL", "min_lng REAL", "max_lat REAL", "max_lng REAL"] {
        ensure_column(connection, "parcels", definition)?;
    }
    ensure_column(connection, "complaints", "backend_id TEXT")?;
    ensure_column(
        connection,
        "complaints",
        "status TEXT NOT NULL DEFAULT 'pending'",
    )?;
    ensure_column(
        connection,
        "complaints",
        "sent_remote INTEGER NOT NULL DEFAULT 0",
    )?;
    ensure_column(connection, "complaints", "remote_response TEXT")?;
    ensure_column(connection, "complaints", "updated_at TEXT")?;

    connection.execute_batch(
        r#"
        CREATE INDEX IF NOT EXISTS idx_parcels_num ON parcels(num_parcel);
        CREATE INDEX IF NOT EXISTS idx_parcels_type ON parcels(parcel_type);
        CREATE INDEX IF NOT EXISTS idx_parcels_village ON parcels(village);
        CREATE INDEX IF NOT EXISTS idx_parcels_bbox ON parcels(min_lat, max_lat, min_lng, max_lng);
        CREATE INDEX IF NOT EXISTS idx_complaints_parcel ON complaints(parcel_number);
        CREATE INDEX IF NOT EXISTS idx_complaints_created ON complaints(created_at);
        "#,
    )?;
    debug!(target: "database_bootstrap", "migrations applied");
    Ok(())
}

fn ensure_column(connection: &Connection, table: &str, definition: &str) -> AppResult<()> {
    let column_name = definition
        .split_whitespace()
        .next()
        .ok_or_else(|| AppError::Config(format!("invalid column definition: {definition}")))?;
    if column_exists(connection, table, column_name)? {
        return Ok(());
    }
    let sql = format!("ALTER TABLE {table} ADD COLUMN {definition}");
    connection.execute(&sql, [])?;
    Ok(())
}

pub(crate) fn column_exists(connection: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({table})");
    let mut stmt = connection.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn read_meta(connection: &Connection, key: &str) -> AppResult<Option<String>> {
    connection
        .query_row("SELECT value FROM meta WHERE key = ?1", [key], |row| {
            row.get::<_, Option<String>>(0)
        })
        .optional()
        .map(Option::flatten)
        .map_err(AppError::from)
}

pub fn write_meta(connection: &Connection, key: &str, value: &str) -> AppResult<()> {
    connection.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, value),
    )?;
    Ok(())
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn runs_migrations_and_creates_tables() {
        let dir = tempdir().unwrap();
        let ctx = bootstrap(dir.path(), "test.db").unwrap();

        let mut stmt = ctx
            .connection
            .prepare(
                "SELECT name FROM sqlite_master WHERE type='table' AND name IN ('parcels','complaints','meta')",
            )
            .unwrap();
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .count();
        assert_eq!(rows, 3);
        assert!(ctx.path.ends_with("test.db"));
        assert!(column_exists(&ctx.connection, "parcels", "max_lng").unwrap());
        assert!(column_exists(&ctx.connection, "complaints", "sent_remote").unwrap());
    }

    #[test]
    fn upgrades_legacy_tables_in_place() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("legacy.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE complaints (id TEXT PRIMARY KEY, parcel_number TEXT, created_at TEXT, data TEXT);
                 INSERT INTO complaints VALUES ('c-1', '0522010200001', '2024-01-01T00:00:00Z', '{}');",
            )
            .unwrap();
        }

        let ctx = bootstrap(dir.path(), "legacy.db").unwrap();
        let (status, sent): (String, i64) = ctx
            .connection
            .query_row(
                "SELECT status, sent_remote FROM complaints WHERE id = 'c-1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(status, "pending");
        assert_eq!(sent, 0);
    }

    #[test]
    fn meta_values_overwrite() {
        let conn = open_in_memory().unwrap();
        assert_eq!(read_meta(&conn, META_PREBUILT_VERSION).unwrap(), None);
        write_meta(&conn, META_PREBUILT_VERSION, "v1").unwrap();
        write_meta(&conn, META_PREBUILT_VERSION, "v2").unwrap();
        assert_eq!(
            read_meta(&conn, META_PREBUILT_VERSION).unwrap().as_deref(),
            Some("v2")
        );
    }
}
