use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::complaints::Complaint;
use crate::errors::AppResult;

/// Newest-first JSON array of complaints, used when the database cannot be
/// reached. Every mutation rewrites the whole file.
pub struct FallbackComplaintStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FallbackComplaintStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list(&self) -> AppResult<Vec<Complaint>> {
        let _guard = self.lock.lock();
        self.read_locked()
    }

    pub fn get(&self, id: &str) -> AppResult<Option<Complaint>> {
        Ok(self.list()?.into_iter().find(|c| c.id == id))
    }

    pub fn count(&self) -> AppResult<usize> {
        Ok(self.list()?.len())
    }

    /// Replaces a record with the same id in place, otherwise prepends.
    pub fn upsert(&self, complaint: Complaint) -> AppResult<()> {
        let _guard = self.lock.lock();
        let mut items = self.read_locked()?;
        match items.iter_mut().find(|c| c.id == complaint.id) {
            Some(existing) => *existing = complaint,
            None => items.insert(0, complaint),
        }
        self.write_locked(&items)
    }

    /// Applies `edit` to the record with `id` under one lock, so concurrent
    /// writers cannot interleave between read and write. False when absent.
    pub fn update_with(&self, id: &str, edit: impl FnOnce(&mut Complaint)) -> AppResult<bool> {
        let _guard = self.lock.lock();
        let mut items = self.read_locked()?;
        let Some(record) = items.iter_mut().find(|c| c.id == id) else {
            return Ok(false);
        };
        edit(record);
        self.write_locked(&items)?;
        Ok(true)
    }

    pub fn delete(&self, id: &str) -> AppResult<bool> {
        let _guard = self.lock.lock();
        let mut items = self.read_locked()?;
        let before = items.len();
        items.retain(|c| c.id != id);
        if items.len() == before {
            return Ok(false);
        }
        self.write_locked(&items)?;
        Ok(true)
    }

    /// Drops records already sent to the remote store and older than `max_age`.
    pub fn collect_garbage(&self, max_age: Duration) -> AppResult<usize> {
        self.collect_garbage_at(max_age, Utc::now())
    }

    fn collect_garbage_at(&self, max_age: Duration, now: DateTime<Utc>) -> AppResult<usize> {
        let _guard = self.lock.lock();
        let mut items = self.read_locked()?;
        let before = items.len();
        let cutoff = now - max_age;
        items.retain(|c| !(c.sent_remote && created_before(&c.created_at, cutoff)));
        let removed = before - items.len();
        if removed > 0 {
            self.write_locked(&items)?;
            debug!(target: "complaint_fallback", removed, "fallback complaints collected");
        }
        Ok(removed)
    }

    fn read_locked(&self) -> AppResult<Vec<Complaint>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&self.path)?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<Value> = serde_json::from_str(&text)?;
        let items = raw
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<Complaint>(value) {
                Ok(complaint) => Some(complaint),
                Err(err) => {
                    warn!(target: "complaint_fallback", ?err, "skipping unreadable fallback record");
                    None
                }
            })
            .collect();
        Ok(items)
    }

    fn write_locked(&self, items: &[Complaint]) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, serde_json::to_vec(items)?)?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }
}

fn created_before(created_at: &str, cutoff: DateTime<Utc>) -> bool {
    match DateTime::parse_from_rfc3339(created_at) {
        Ok(ts) => ts.with_timezone(&Utc) < cutoff,
        Err(_) => false,
    }
}
