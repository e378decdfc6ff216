pub mod bundle;
pub mod cache;
pub mod complaints;
pub mod config;
pub mod db;
pub mod errors;
pub mod fallback;
pub mod geometry;
pub mod neighbors;
pub mod normalize;
pub mod parcels;
pub mod remote;
pub mod search;
pub mod worker;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::bundle::{refresh_parcels_from_snapshot, BundledMetadata, RefreshOutcome};
use crate::config::PublicAppConfig;
use crate::db::bootstrap;

pub use crate::complaints::{
    AddOptions, Complaint, ComplaintStatus, ComplaintSyncEngine, RetrySummary, SubmitOutcome,
    UpdateOutcome,
};
pub use crate::config::AppConfig;
pub use crate::db::SharedConnection;
pub use crate::errors::{AppError, AppResult};
pub use crate::fallback::FallbackComplaintStore;
pub use crate::neighbors::{Neighbor, NeighborFinder};
pub use crate::parcels::{Parcel, ParcelRepository, ParcelType};
pub use crate::remote::{HttpRemoteStore, RemoteComplaintStore, RemoteOutcome};
pub use crate::search::{ParcelSearch, SearchOptions, SearchPage};
pub use crate::worker::{SyncCommand, SyncWorker};

#[derive(Debug, Clone, Serialize)]
pub struct AppHealth {
    pub database_path: Option<String>,
    pub database_available: bool,
    pub fallback_path: String,
    pub remote_configured: bool,
    pub background_sync: bool,
    pub complaints: usize,
    pub config: PublicAppConfig,
}

/// Owns the database handle and every component built on it.
pub struct ParcelApp {
    config: AppConfig,
    db: Option<SharedConnection>,
    db_path: Option<PathBuf>,
    repository: ParcelRepository,
    search: ParcelSearch,
    neighbors: NeighborFinder,
    complaints: Arc<ComplaintSyncEngine>,
    worker: Mutex<Option<SyncWorker>>,
}

impl ParcelApp {
    /// Opens the database under `data_dir` and wires the components. When the
    /// database cannot be opened, complaints are kept in the fallback file
    /// and parcel reads return nothing.
    pub fn initialize(config: AppConfig, data_dir: impl AsRef<Path>) -> AppResult<Self> {
        let remote = HttpRemoteStore::from_config(&config)?
            .map(|store| Arc::new(store) as Arc<dyn RemoteComplaintStore>);
        Self::initialize_with_remote(config, data_dir, remote)
    }

    pub fn initialize_with_remote(
        config: AppConfig,
        data_dir: impl AsRef<Path>,
        remote: Option<Arc<dyn RemoteComplaintStore>>,
    ) -> AppResult<Self> {
        init_tracing();
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;

        let (db, db_path) = match bootstrap(data_dir, &config.database_file_name) {
            Ok(context) => {
                let (connection, path) = context.into_shared();
                (Some(connection), Some(path))
            }
            Err(err) => {
                warn!(target: "database_bootstrap", ?err, "database unavailable; complaints use the fallback file");
                (None, None)
            }
        };

        let fallback = FallbackComplaintStore::new(data_dir.join(&config.fallback_file_name));
        let complaints = Arc::new(ComplaintSyncEngine::new(db.clone(), fallback, remote));
        if config.fallback_gc_days > 0 {
            if let Err(err) =
                complaints.collect_fallback_garbage(ChronoDuration::days(config.fallback_gc_days))
            {
                warn!(target: "complaint_fallback", ?err, "fallback garbage collection failed");
            }
        }

        info!(
            target: "parcel_app",
            database = db.is_some(),
            remote = complaints.remote_configured(),
            "parcel app initialized"
        );
        Ok(Self {
            repository: ParcelRepository::new(db.clone(), &config),
            search: ParcelSearch::new(db.clone()),
            neighbors: NeighborFinder::new(db.clone(), config.neighbor_limit),
            complaints,
            worker: Mutex::new(None),
            db,
            db_path,
            config,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn repository(&self) -> &ParcelRepository {
        &self.repository
    }

    pub fn search(&self) -> &ParcelSearch {
        &self.search
    }

    pub fn neighbors(&self) -> &NeighborFinder {
        &self.neighbors
    }

    pub fn complaints(&self) -> &Arc<ComplaintSyncEngine> {
        &self.complaints
    }

    pub fn database_available(&self) -> bool {
        self.db.is_some()
    }

    pub fn health(&self) -> AppHealth {
        AppHealth {
            database_path: self
                .db_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
            database_available: self.db.is_some(),
            fallback_path: self
                .complaints
                .fallback_store()
                .path()
                .to_string_lossy()
                .to_string(),
            remote_configured: self.complaints.remote_configured(),
            background_sync: self.worker.lock().is_some(),
            complaints: self.complaints.count_complaints(),
            config: self.config.public_profile(),
        }
    }

    /// Replaces the parcels table from a bundled snapshot when the bundled
    /// metadata says the local copy is stale.
    pub fn refresh_bundled_parcels(
        &self,
        metadata_path: &Path,
        snapshot_path: &Path,
    ) -> AppResult<RefreshOutcome> {
        let db = self.db.as_ref().ok_or(AppError::NotInitialized)?;
        let bundled = BundledMetadata::load(metadata_path)?;
        let outcome = {
            let mut conn = db.lock();
            refresh_parcels_from_snapshot(&mut conn, snapshot_path, &bundled)?
        };
        if outcome.refreshed {
            self.repository.clear_cache();
            self.neighbors.clear_cache();
        }
        Ok(outcome)
    }

    /// Starts the retry worker. Returns false when no remote store is
    /// configured or no runtime is available.
    pub fn start_background_sync(&self) -> bool {
        if !self.complaints.remote_configured() {
            return false;
        }
        let mut worker = self.worker.lock();
        if worker.as_ref().map_or(false, SyncWorker::is_running) {
            return true;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(target: "remote_sync", "background sync requested outside a runtime");
            return false;
        }
        *worker = Some(SyncWorker::spawn(
            Arc::clone(&self.complaints),
            self.config.retry_interval(),
        ));
        true
    }

    pub async fn stop_background_sync(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.shutdown().await;
        }
    }

    /// Stops the worker and closes the database once no component holds it.
    pub async fn shutdown(self) {
        self.stop_background_sync().await;
        let Self {
            db,
            repository,
            search,
            neighbors,
            complaints,
            ..
        } = self;
        drop((repository, search, neighbors, complaints));

        let Some(db) = db else {
            return;
        };
        match Arc::try_unwrap(db) {
            Ok(mutex) => {
                if let Err((_, err)) = mutex.into_inner().close() {
                    warn!(target: "parcel_app", ?err, "database close failed");
                }
            }
            Err(_) => warn!(target: "parcel_app", "database still shared at shutdown; leaving it to drop"),
        }
        info!(target: "parcel_app", "parcel app shut down");
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,parcelapp_data=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}
