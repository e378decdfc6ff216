use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::Duration;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{now_timestamp, SharedConnection};
use crate::errors::{AppError, AppResult};
use crate::fallback::FallbackComplaintStore;
use crate::normalize::{parse_properties, value_text, PropertyBag};
use crate::remote::RemoteComplaintStore;
use crate::worker::SyncCommand;

const COMPLAINT_COLUMNS: &str =
    "id, parcel_number, created_at, updated_at, status, sent_remote, backend_id, remote_response, data";

/// Keys owned by the row's columns; never kept inside the payload blob.
const BOOKKEEPING_KEYS: &[&str] = &[
    "backend_id",
    "backendId",
    "sent_remote",
    "sentRemote",
    "remote_response",
];

const PARCEL_NUMBER_KEYS: &[&str] = &[
    "parcel_number",
    "parcelNumber",
    "num_parcel",
    "Num_parcel",
    "numero_parcelle",
    "parcel_num",
];
const NESTED_PARCEL_KEYS: &[&str] = &["data", "parcel", "selectedParcel"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplaintStatus {
    #[default]
    Pending,
    Validated,
    Rejected,
}

impl ComplaintStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplaintStatus::Pending => "pending",
            ComplaintStatus::Validated => "validated",
            ComplaintStatus::Rejected => "rejected",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "pending" => Some(ComplaintStatus::Pending),
            "validated" => Some(ComplaintStatus::Validated),
            "rejected" => Some(ComplaintStatus::Rejected),
            _ => None,
        }
    }
}

impl fmt::Display for ComplaintStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Complaint {
    pub id: String,
    #[serde(default)]
    pub parcel_number: Option<String>,
    pub created_at: String,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub status: ComplaintStatus,
    #[serde(default)]
    pub sent_remote: bool,
    #[serde(default)]
    pub backend_id: Option<String>,
    #[serde(default)]
    pub remote_response: Option<String>,
    #[serde(default)]
    pub data: PropertyBag,
}

impl Complaint {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let data: Option<String> = row.get(8)?;
        Ok(Self {
            id: row.get(0)?,
            parcel_number: row.get(1)?,
            created_at: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            updated_at: row.get(3)?,
            status: row
                .get::<_, Option<String>>(4)?
                .as_deref()
                .and_then(ComplaintStatus::parse)
                .unwrap_or_default(),
            sent_remote: row.get::<_, Option<i64>>(5)?.unwrap_or(0) != 0,
            backend_id: row.get(6)?,
            remote_response: row.get(7)?,
            data: payload_or_empty(data.as_deref()),
        })
    }

    /// Row shape sent to the remote table: the payload plus identifying columns.
    pub fn remote_body(&self) -> Value {
        let mut body = self.data.clone();
        strip_bookkeeping(&mut body);
        body.insert("id".into(), Value::from(self.id.clone()));
        body.insert(
            "parcel_number".into(),
            self.parcel_number.clone().map(Value::from).unwrap_or(Value::Null),
        );
        body.insert("status".into(), Value::from(self.status.as_str()));
        body.insert("created_at".into(), Value::from(self.created_at.clone()));
        Value::Object(body)
    }
}

fn payload_or_empty(raw: Option<&str>) -> PropertyBag {
    let Some(raw) = raw else {
        return PropertyBag::new();
    };
    match parse_properties(raw) {
        Ok(bag) => bag,
        Err(err) => {
            warn!(target: "complaints", ?err, "unreadable complaint payload; using empty object");
            PropertyBag::new()
        }
    }
}

/// Caller-supplied ids are kept as long as they are a single token, so ids
/// minted by older clients stay idempotent.
fn is_usable_id(raw: &str) -> bool {
    !raw.is_empty() && !raw.chars().any(char::is_whitespace)
}

fn strip_bookkeeping(bag: &mut PropertyBag) {
    for key in BOOKKEEPING_KEYS {
        bag.remove(*key);
    }
}

/// Best-effort parcel number: direct keys, then nested parcel objects, then
/// any key that reads like a parcel identifier.
pub fn extract_parcel_number(data: &PropertyBag) -> Option<String> {
    fn direct(map: &PropertyBag) -> Option<String> {
        PARCEL_NUMBER_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(value_text))
    }

    direct(data)
        .or_else(|| {
            NESTED_PARCEL_KEYS.iter().find_map(|key| {
                let nested = data.get(*key)?.as_object()?;
                direct(nested).or_else(|| {
                    nested
                        .get("properties")
                        .and_then(Value::as_object)
                        .and_then(direct)
                })
            })
        })
        .or_else(|| {
            data.iter()
                .filter(|(key, _)| looks_like_parcel_key(key))
                .find_map(|(_, value)| value_text(value))
        })
}

fn looks_like_parcel_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    lower.contains("parcel") && (lower.contains("num") || lower.contains("no") || lower.ends_with("id"))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddOptions {
    pub skip_background_submit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Sent { backend_id: Option<String> },
    Failed { error: String },
    AlreadySending,
    NotConfigured,
    NotFound,
}

impl SubmitOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, SubmitOutcome::Sent { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    pub attempted: usize,
    pub sent: usize,
    pub failed: usize,
    pub already_sent: usize,
    pub busy: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateOutcome {
    pub id: String,
    pub created_new: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Database,
    File,
}

/// Holds a complaint id in the in-flight map until released. The flag
/// records that another submit for the same id arrived meanwhile.
struct SendGuard<'a> {
    in_flight: &'a Mutex<HashMap<String, bool>>,
    id: String,
    released: bool,
}

impl<'a> SendGuard<'a> {
    /// `None` when a send is already running; that send is then asked to
    /// run once more.
    fn acquire(in_flight: &'a Mutex<HashMap<String, bool>>, id: &str) -> Option<Self> {
        let mut slots = in_flight.lock();
        if let Some(resend) = slots.get_mut(id) {
            *resend = true;
            return None;
        }
        slots.insert(id.to_string(), false);
        Some(Self {
            in_flight,
            id: id.to_string(),
            released: false,
        })
    }

    /// Consumes a pending resend request, or frees the slot when there is none.
    fn resend_requested(&mut self) -> bool {
        let mut slots = self.in_flight.lock();
        if let Some(resend) = slots.get_mut(&self.id) {
            if *resend {
                *resend = false;
                return true;
            }
        }
        slots.remove(&self.id);
        self.released = true;
        false
    }
}

impl Drop for SendGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.in_flight.lock().remove(&self.id);
        }
    }
}

/// Local-first complaint storage with idempotent remote submission.
///
/// The database is the source of truth; the fallback file takes over when
/// the database is missing or rejects a new complaint. Remote submits for a
/// given id never overlap.
pub struct ComplaintSyncEngine {
    db: Option<SharedConnection>,
    fallback: FallbackComplaintStore,
    remote: Option<Arc<dyn RemoteComplaintStore>>,
    in_flight: Mutex<HashMap<String, bool>>,
    dispatcher: Mutex<Option<UnboundedSender<SyncCommand>>>,
}

impl ComplaintSyncEngine {
    pub fn new(
        db: Option<SharedConnection>,
        fallback: FallbackComplaintStore,
        remote: Option<Arc<dyn RemoteComplaintStore>>,
    ) -> Self {
        Self {
            db,
            fallback,
            remote,
            in_flight: Mutex::new(HashMap::new()),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn remote_configured(&self) -> bool {
        self.remote.is_some()
    }

    pub fn fallback_store(&self) -> &FallbackComplaintStore {
        &self.fallback
    }

    pub(crate) fn attach_dispatcher(&self, sender: UnboundedSender<SyncCommand>) {
        *self.dispatcher.lock() = Some(sender);
    }

    pub(crate) fn detach_dispatcher(&self) {
        self.dispatcher.lock().take();
    }

    /// Persists a new complaint and returns its id. Unless told otherwise,
    /// a remote submit is queued afterwards.
    pub fn add_complaint(self: &Arc<Self>, payload: Value, options: AddOptions) -> AppResult<String> {
        let Value::Object(mut data) = payload else {
            return Err(AppError::Config("complaint payload must be a JSON object".into()));
        };
        let id = data
            .get("id")
            .and_then(Value::as_str)
            .filter(|raw| is_usable_id(raw))
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        strip_bookkeeping(&mut data);
        data.insert("id".into(), Value::from(id.clone()));

        let status = data
            .get("status")
            .and_then(Value::as_str)
            .and_then(ComplaintStatus::parse)
            .unwrap_or_default();
        let created_at = data
            .get("created_at")
            .and_then(value_text)
            .unwrap_or_else(now_timestamp);
        let complaint = Complaint {
            id: id.clone(),
            parcel_number: extract_parcel_number(&data),
            created_at,
            updated_at: None,
            status,
            sent_remote: false,
            backend_id: None,
            remote_response: None,
            data,
        };

        if self
            .with_db("add_complaint", |conn| insert_complaint(conn, &complaint))
            .is_none()
        {
            self.add_to_fallback(complaint)?;
        }
        info!(target: "complaints", id = %id, "complaint stored");

        if !options.skip_background_submit {
            self.schedule_submit(&id);
        }
        Ok(id)
    }

    fn add_to_fallback(&self, mut complaint: Complaint) -> AppResult<()> {
        if let Some(existing) = self.fallback.get(&complaint.id)? {
            complaint.backend_id = existing.backend_id;
            complaint.sent_remote = existing.sent_remote;
        }
        warn!(target: "complaints", id = %complaint.id, "storing complaint in fallback file");
        self.fallback.upsert(complaint)
    }

    /// Replaces the payload. A sent complaint whose parcel number changes is
    /// filed as a new complaint instead; otherwise the row keeps its send
    /// state and backend id.
    pub fn update_complaint(
        self: &Arc<Self>,
        id: &str,
        payload: Value,
        options: AddOptions,
    ) -> AppResult<UpdateOutcome> {
        let Value::Object(mut data) = payload else {
            return Err(AppError::Config("complaint payload must be a JSON object".into()));
        };
        let (existing, location) = self
            .locate(id)?
            .ok_or_else(|| AppError::NotFound(format!("complaint {id}")))?;

        strip_bookkeeping(&mut data);
        let parcel_number = extract_parcel_number(&data);
        let moved = parcel_number.is_some() && parcel_number != existing.parcel_number;
        if existing.sent_remote && moved {
            data.remove("id");
            data.remove("created_at");
            let new_id = self.add_complaint(Value::Object(data), options)?;
            info!(target: "complaints", previous = %id, id = %new_id, "parcel changed on sent complaint; filed as new");
            return Ok(UpdateOutcome {
                id: new_id,
                created_new: true,
            });
        }

        data.insert("id".into(), Value::from(id.to_string()));
        let status = data
            .get("status")
            .and_then(Value::as_str)
            .and_then(ComplaintStatus::parse)
            .unwrap_or(existing.status);
        let updated_at = now_timestamp();
        match location {
            Location::Database => {
                let db = self.require_db()?;
                let conn = db.lock();
                conn.execute(
                    "UPDATE complaints SET data = ?2, parcel_number = COALESCE(?3, parcel_number),
                        status = ?4, updated_at = ?5
                    WHERE id = ?1",
                    rusqlite::params![
                        id,
                        serde_json::to_string(&data)?,
                        parcel_number,
                        status.as_str(),
                        updated_at
                    ],
                )?;
            }
            Location::File => {
                let found = self.fallback.update_with(id, |record| {
                    record.parcel_number = parcel_number.or(record.parcel_number.take());
                    record.status = status;
                    record.updated_at = Some(updated_at);
                    record.data = data;
                })?;
                if !found {
                    return Err(AppError::NotFound(format!("complaint {id}")));
                }
            }
        }
        debug!(target: "complaints", id, "complaint updated");

        if !options.skip_background_submit {
            self.schedule_submit(id);
        }
        Ok(UpdateOutcome {
            id: id.to_string(),
            created_new: false,
        })
    }

    pub fn update_complaint_status(&self, id: &str, status: ComplaintStatus) -> AppResult<()> {
        let (_, location) = self
            .locate(id)?
            .ok_or_else(|| AppError::NotFound(format!("complaint {id}")))?;
        let updated_at = now_timestamp();
        match location {
            Location::Database => {
                let db = self.require_db()?;
                db.lock().execute(
                    "UPDATE complaints SET status = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, status.as_str(), updated_at],
                )?;
            }
            Location::File => {
                let found = self.fallback.update_with(id, |record| {
                    record.status = status;
                    record.updated_at = Some(updated_at);
                })?;
                if !found {
                    return Err(AppError::NotFound(format!("complaint {id}")));
                }
            }
        }
        debug!(target: "complaints", id, status = %status, "complaint status updated");
        Ok(())
    }

    /// Removes the complaint wherever it is stored. A failing database
    /// statement still lets the fallback copy be removed.
    pub fn delete_complaint(&self, id: &str) -> AppResult<bool> {
        let mut removed = self
            .with_db("delete_complaint", |conn| {
                Ok(conn.execute("DELETE FROM complaints WHERE id = ?1", [id])? > 0)
            })
            .unwrap_or(false);
        removed |= self.fallback.delete(id)?;
        debug!(target: "complaints", id, removed, "complaint deleted");
        Ok(removed)
    }

    pub fn get_complaint(&self, id: &str) -> Option<Complaint> {
        match self.locate(id) {
            Ok(found) => found.map(|(complaint, _)| complaint),
            Err(err) => {
                warn!(target: "complaints", id, ?err, "complaint lookup failed");
                None
            }
        }
    }

    /// All complaints, newest first. Records stranded in the fallback file
    /// are merged in.
    pub fn list_complaints(&self) -> Vec<Complaint> {
        let mut items = self
            .with_db("list_complaints", |conn| {
                let sql = format!(
                    "SELECT {COMPLAINT_COLUMNS} FROM complaints ORDER BY created_at DESC, rowid DESC"
                );
                let mut stmt = conn.prepare_cached(&sql)?;
                let rows = stmt
                    .query_map([], Complaint::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .unwrap_or_default();

        match self.fallback.list() {
            Ok(stranded) if !stranded.is_empty() => {
                let known: HashSet<String> = items.iter().map(|c| c.id.clone()).collect();
                items.extend(stranded.into_iter().filter(|c| !known.contains(&c.id)));
                items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            }
            Ok(_) => {}
            Err(err) => warn!(target: "complaints", ?err, "fallback complaints unreadable"),
        }
        items
    }

    pub fn count_complaints(&self) -> usize {
        self.list_complaints().len()
    }

    /// Drops old, already-sent records from the fallback file.
    pub fn collect_fallback_garbage(&self, max_age: Duration) -> AppResult<usize> {
        self.fallback.collect_garbage(max_age)
    }

    /// Queues a remote submit on the worker, or runs it as a detached task
    /// when no worker is attached.
    pub fn schedule_submit(self: &Arc<Self>, id: &str) {
        if self.remote.is_none() {
            return;
        }
        if let Some(sender) = self.dispatcher.lock().as_ref() {
            if sender.send(SyncCommand::Submit(id.to_string())).is_ok() {
                return;
            }
        }
        match Handle::try_current() {
            Ok(handle) => {
                let engine = Arc::clone(self);
                let id = id.to_string();
                handle.spawn(async move {
                    let outcome = engine.try_remote_submit(&id).await;
                    debug!(target: "remote_sync", id = %id, ?outcome, "detached submit finished");
                });
            }
            Err(_) => {
                debug!(target: "remote_sync", id, "no async runtime; submit left for the retry pass");
            }
        }
    }

    /// Sends one complaint. The in-flight slot is claimed before any await,
    /// so a concurrent caller for the same id gets `AlreadySending` and the
    /// running send goes round again once it succeeds, picking up any edit
    /// made in between.
    pub async fn try_remote_submit(&self, id: &str) -> SubmitOutcome {
        let Some(remote) = self.remote.clone() else {
            return SubmitOutcome::NotConfigured;
        };
        let Some(mut guard) = SendGuard::acquire(&self.in_flight, id) else {
            debug!(target: "remote_sync", id, "submit already in flight; resend requested");
            return SubmitOutcome::AlreadySending;
        };
        loop {
            let outcome = self.submit_once(remote.as_ref(), id).await;
            if !outcome.is_sent() || !guard.resend_requested() {
                return outcome;
            }
            debug!(target: "remote_sync", id, "complaint changed during send; sending again");
        }
    }

    async fn submit_once(&self, remote: &dyn RemoteComplaintStore, id: &str) -> SubmitOutcome {
        let (complaint, location) = match self.locate(id) {
            Ok(Some(found)) => found,
            Ok(None) => return SubmitOutcome::NotFound,
            Err(err) => {
                warn!(target: "remote_sync", id, ?err, "could not load complaint for submit");
                return SubmitOutcome::NotFound;
            }
        };

        let body = complaint.remote_body();
        let result = match complaint.backend_id.as_deref() {
            None => remote.insert(&body).await,
            Some(backend_id) => remote.update(backend_id, &body).await,
        };

        match result {
            Ok(accepted) => {
                // The local id doubles as the remote id, so a silent insert still identifies the row.
                let backend_id = accepted
                    .id
                    .or_else(|| complaint.backend_id.clone())
                    .or_else(|| Some(complaint.id.clone()));
                if let Err(err) =
                    self.record_success(&complaint, location, backend_id.as_deref(), &accepted.response)
                {
                    warn!(target: "remote_sync", id, ?err, "failed to record successful submit");
                }
                info!(target: "remote_sync", id, backend_id = ?backend_id, "complaint sent");
                SubmitOutcome::Sent { backend_id }
            }
            Err(err) => {
                let error = err.to_string();
                if let Err(store_err) = self.record_failure(&complaint, location, &error) {
                    warn!(target: "remote_sync", id, ?store_err, "failed to record submit error");
                }
                warn!(target: "remote_sync", id, error = %error, "complaint submit failed");
                SubmitOutcome::Failed { error }
            }
        }
    }

    /// Submits every complaint not yet marked as sent.
    pub async fn retry_unsent_complaints(&self) -> RetrySummary {
        let mut summary = RetrySummary::default();
        if self.remote.is_none() {
            return summary;
        }
        for complaint in self.list_complaints() {
            if complaint.sent_remote {
                summary.already_sent += 1;
                continue;
            }
            summary.attempted += 1;
            match self.try_remote_submit(&complaint.id).await {
                SubmitOutcome::Sent { .. } => summary.sent += 1,
                SubmitOutcome::AlreadySending => summary.busy += 1,
                _ => summary.failed += 1,
            }
        }
        if summary.attempted > 0 {
            info!(
                target: "remote_sync",
                attempted = summary.attempted,
                sent = summary.sent,
                failed = summary.failed,
                busy = summary.busy,
                "retry pass complete"
            );
        }
        summary
    }

    fn record_success(
        &self,
        complaint: &Complaint,
        location: Location,
        backend_id: Option<&str>,
        response: &str,
    ) -> AppResult<()> {
        // a row edited since it was loaded stays unsent so the edit goes out too
        let updated_at = now_timestamp();
        match location {
            Location::Database => {
                let db = self.require_db()?;
                db.lock().execute(
                    "UPDATE complaints SET
                        sent_remote = CASE WHEN updated_at IS ?6 THEN 1 ELSE 0 END,
                        status = CASE WHEN status = 'pending' THEN 'validated' ELSE status END,
                        backend_id = COALESCE(?2, backend_id),
                        parcel_number = COALESCE(parcel_number, ?3),
                        remote_response = ?4, updated_at = ?5
                    WHERE id = ?1",
                    rusqlite::params![
                        complaint.id,
                        backend_id,
                        complaint.parcel_number,
                        response,
                        updated_at,
                        complaint.updated_at
                    ],
                )?;
            }
            Location::File => {
                let found = self.fallback.update_with(&complaint.id, |record| {
                    record.sent_remote = record.updated_at == complaint.updated_at;
                    if record.status == ComplaintStatus::Pending {
                        record.status = ComplaintStatus::Validated;
                    }
                    record.backend_id = backend_id.map(str::to_string).or(record.backend_id.take());
                    record.parcel_number = record.parcel_number.take().or_else(|| complaint.parcel_number.clone());
                    record.remote_response = Some(response.to_string());
                    record.updated_at = Some(updated_at);
                })?;
                if !found {
                    debug!(target: "remote_sync", id = %complaint.id, "complaint removed while sending");
                }
            }
        }
        Ok(())
    }

    fn record_failure(&self, complaint: &Complaint, location: Location, error: &str) -> AppResult<()> {
        let updated_at = now_timestamp();
        match location {
            Location::Database => {
                let db = self.require_db()?;
                db.lock().execute(
                    "UPDATE complaints SET remote_response = ?2, sent_remote = 0,
                        backend_id = COALESCE(backend_id, ?3),
                        parcel_number = COALESCE(parcel_number, ?4),
                        updated_at = ?5
                    WHERE id = ?1",
                    rusqlite::params![
                        complaint.id,
                        error,
                        complaint.backend_id,
                        complaint.parcel_number,
                        updated_at
                    ],
                )?;
            }
            Location::File => {
                self.fallback.update_with(&complaint.id, |record| {
                    record.sent_remote = false;
                    record.remote_response = Some(error.to_string());
                    record.updated_at = Some(updated_at);
                })?;
            }
        }
        Ok(())
    }

    fn require_db(&self) -> AppResult<&SharedConnection> {
        self.db.as_ref().ok_or(AppError::NotInitialized)
    }

    /// Runs `op` against the database; `None` when there is no database or
    /// the statement failed.
    fn with_db<T>(&self, op: &'static str, f: impl FnOnce(&Connection) -> AppResult<T>) -> Option<T> {
        let db = self.db.as_ref()?;
        let conn = db.lock();
        match f(&conn) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(target: "complaints", op, ?err, "complaint statement failed; using fallback file");
                None
            }
        }
    }

    fn locate(&self, id: &str) -> AppResult<Option<(Complaint, Location)>> {
        let from_db = self
            .with_db("locate_complaint", |conn| {
                let sql = format!("SELECT {COMPLAINT_COLUMNS} FROM complaints WHERE id = ?1");
                Ok(conn
                    .prepare_cached(&sql)?
                    .query_row([id], Complaint::from_row)
                    .optional()?)
            })
            .flatten();
        if let Some(found) = from_db {
            return Ok(Some((found, Location::Database)));
        }
        Ok(self.fallback.get(id)?.map(|c| (c, Location::File)))
    }
}

/// `INSERT OR REPLACE` that keeps a previously recorded backend id and send flag.
fn insert_complaint(conn: &Connection, complaint: &Complaint) -> AppResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO complaints
            (id, parcel_number, created_at, data, status, sent_remote, backend_id, remote_response, updated_at)
        VALUES (
            ?1, ?2, ?3, ?4, ?5,
            COALESCE((SELECT sent_remote FROM complaints WHERE id = ?1), 0),
            (SELECT backend_id FROM complaints WHERE id = ?1),
            NULL, NULL
        )",
        rusqlite::params![
            complaint.id,
            complaint.parcel_number,
            complaint.created_at,
            serde_json::to_string(&complaint.data)?,
            complaint.status.as_str(),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};
    use tokio::sync::Notify;

    use super::*;
    use crate::db::{open_in_memory, shared};
    use crate::remote::RemoteOutcome;

    #[derive(Default)]
    struct RecordingRemote {
        inserts: AtomicUsize,
        updates: AtomicUsize,
        fail: bool,
        returned_id: Option<String>,
        gate: Option<(Notify, Notify)>,
        bodies: Mutex<Vec<Value>>,
    }

    impl RecordingRemote {
        fn gated() -> Self {
            Self {
                gate: Some((Notify::new(), Notify::new())),
                ..Self::default()
            }
        }

        async fn pass_gate(&self) {
            if let Some((entered, release)) = &self.gate {
                entered.notify_one();
                release.notified().await;
            }
        }

        fn outcome(&self) -> AppResult<RemoteOutcome> {
            if self.fail {
                return Err(AppError::Remote {
                    status: 401,
                    body: "permission denied".into(),
                });
            }
            Ok(RemoteOutcome {
                id: self.returned_id.clone(),
                response: "201".into(),
            })
        }
    }

    #[async_trait]
    impl RemoteComplaintStore for RecordingRemote {
        async fn insert(&self, body: &Value) -> AppResult<RemoteOutcome> {
            self.inserts.fetch_add(1, Ordering::SeqCst);
            self.bodies.lock().push(body.clone());
            self.pass_gate().await;
            self.outcome()
        }

        async fn update(&self, _backend_id: &str, body: &Value) -> AppResult<RemoteOutcome> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            self.bodies.lock().push(body.clone());
            self.pass_gate().await;
            self.outcome()
        }
    }

    fn engine(remote: Option<Arc<RecordingRemote>>) -> (Arc<ComplaintSyncEngine>, TempDir) {
        let dir = tempdir().unwrap();
        let fallback = FallbackComplaintStore::new(dir.path().join("fallback.json"));
        let remote = remote.map(|r| r as Arc<dyn RemoteComplaintStore>);
        let engine = ComplaintSyncEngine::new(Some(shared(open_in_memory().unwrap())), fallback, remote);
        (Arc::new(engine), dir)
    }

    const SKIP: AddOptions = AddOptions {
        skip_background_submit: true,
    };

    #[test]
    fn extracts_parcel_numbers_from_many_shapes() {
        let bag = |value: Value| value.as_object().cloned().unwrap();
        assert_eq!(
            extract_parcel_number(&bag(json!({"parcelNumber": "0522010200001"}))).as_deref(),
            Some("0522010200001")
        );
        assert_eq!(
            extract_parcel_number(&bag(json!({"selectedParcel": {"num_parcel": 522010200002u64}})))
                .as_deref(),
            Some("522010200002")
        );
        assert_eq!(
            extract_parcel_number(&bag(json!({"parcel": {"properties": {"Num_parcel": "P-3"}}})))
                .as_deref(),
            Some("P-3")
        );
        assert_eq!(
            extract_parcel_number(&bag(json!({"Parcelle_NO": "P-4", "nom": "Diallo"}))).as_deref(),
            Some("P-4")
        );
        assert_eq!(extract_parcel_number(&bag(json!({"nom": "Diallo"}))), None);
    }

    #[test]
    fn add_assigns_ids_and_strips_backend_id() {
        let (engine, _dir) = engine(None);
        let kept = Uuid::new_v4().to_string();
        let id = engine
            .add_complaint(json!({"id": kept, "parcel_number": "P-1", "backend_id": "remote-9"}), SKIP)
            .unwrap();
        assert_eq!(id, kept);
        let stored = engine.get_complaint(&id).unwrap();
        assert_eq!(stored.parcel_number.as_deref(), Some("P-1"));
        assert_eq!(stored.status, ComplaintStatus::Pending);
        assert!(!stored.sent_remote);
        assert_eq!(stored.backend_id, None);
        assert!(!stored.data.contains_key("backend_id"));

        let generated = engine.add_complaint(json!({"id": "two words"}), SKIP).unwrap();
        assert!(Uuid::parse_str(&generated).is_ok());
        let generated = engine.add_complaint(json!({"id": ""}), SKIP).unwrap();
        assert!(Uuid::parse_str(&generated).is_ok());
        assert!(engine.add_complaint(json!(["array"]), SKIP).is_err());
    }

    #[test]
    fn legacy_ids_are_kept_and_re_adding_them_is_idempotent() {
        let (engine, _dir) = engine(None);
        let legacy = "lx9k2p7f-q3z8w1";
        let first = engine.add_complaint(json!({"id": legacy, "parcel_number": "P-1"}), SKIP).unwrap();
        assert_eq!(first, legacy);
        let again = engine
            .add_complaint(json!({"id": legacy, "parcel_number": "P-1", "motif": "bornage"}), SKIP)
            .unwrap();
        assert_eq!(again, legacy);
        assert_eq!(engine.count_complaints(), 1);
        assert_eq!(engine.get_complaint(legacy).unwrap().data["motif"], json!("bornage"));
    }

    #[tokio::test]
    async fn concurrent_submit_for_same_id_sends_once() {
        let remote = Arc::new(RecordingRemote::gated());
        let (engine, _dir) = engine(Some(Arc::clone(&remote)));
        let id = engine.add_complaint(json!({"parcel_number": "P-1"}), SKIP).unwrap();

        let first = tokio::spawn({
            let engine = Arc::clone(&engine);
            let id = id.clone();
            async move { engine.try_remote_submit(&id).await }
        });
        let (entered, release) = remote.gate.as_ref().unwrap();
        entered.notified().await;

        assert_eq!(engine.try_remote_submit(&id).await, SubmitOutcome::AlreadySending);
        release.notify_one();
        assert!(first.await.unwrap().is_sent());
        assert_eq!(remote.inserts.load(Ordering::SeqCst), 1);

        let stored = engine.get_complaint(&id).unwrap();
        assert!(stored.sent_remote);
        assert_eq!(stored.status, ComplaintStatus::Validated);
        assert_eq!(stored.backend_id.as_deref(), Some(id.as_str()));
    }

    fn motifs(remote: &RecordingRemote) -> Vec<Value> {
        remote.bodies.lock().iter().map(|body| body["motif"].clone()).collect()
    }

    #[tokio::test]
    async fn resubmit_during_a_send_sends_the_edit_afterwards() {
        let remote = Arc::new(RecordingRemote::gated());
        let (engine, _dir) = engine(Some(Arc::clone(&remote)));
        let id = engine.add_complaint(json!({"parcel_number": "P-1", "motif": "bornage"}), SKIP).unwrap();

        let first = tokio::spawn({
            let engine = Arc::clone(&engine);
            let id = id.clone();
            async move { engine.try_remote_submit(&id).await }
        });
        let (entered, release) = remote.gate.as_ref().unwrap();
        entered.notified().await;

        engine
            .update_complaint(&id, json!({"parcel_number": "P-1", "motif": "limites"}), SKIP)
            .unwrap();
        assert_eq!(engine.try_remote_submit(&id).await, SubmitOutcome::AlreadySending);
        release.notify_one();
        entered.notified().await;
        release.notify_one();
        assert!(first.await.unwrap().is_sent());

        assert_eq!(motifs(&remote), vec![json!("bornage"), json!("limites")]);
        assert_eq!(remote.inserts.load(Ordering::SeqCst), 1);
        assert_eq!(remote.updates.load(Ordering::SeqCst), 1);
        let stored = engine.get_complaint(&id).unwrap();
        assert!(stored.sent_remote);
        assert_eq!(stored.data["motif"], json!("limites"));
        assert_eq!(engine.retry_unsent_complaints().await.attempted, 0);
    }

    #[tokio::test]
    async fn edit_during_a_send_leaves_the_row_for_the_retry_pass() {
        let remote = Arc::new(RecordingRemote::gated());
        let (engine, _dir) = engine(Some(Arc::clone(&remote)));
        let id = engine.add_complaint(json!({"parcel_number": "P-1", "motif": "bornage"}), SKIP).unwrap();

        let first = tokio::spawn({
            let engine = Arc::clone(&engine);
            let id = id.clone();
            async move { engine.try_remote_submit(&id).await }
        });
        let (entered, release) = remote.gate.as_ref().unwrap();
        entered.notified().await;
        engine
            .update_complaint(&id, json!({"parcel_number": "P-1", "motif": "limites"}), SKIP)
            .unwrap();
        release.notify_one();
        assert!(first.await.unwrap().is_sent());
        assert!(!engine.get_complaint(&id).unwrap().sent_remote);

        release.notify_one();
        let summary = engine.retry_unsent_complaints().await;
        assert_eq!(summary.attempted, 1);
        assert_eq!(summary.sent, 1);
        assert_eq!(motifs(&remote), vec![json!("bornage"), json!("limites")]);
        assert!(engine.get_complaint(&id).unwrap().sent_remote);
    }

    #[tokio::test]
    async fn file_records_keep_edits_made_during_a_send() {
        let dir = tempdir().unwrap();
        let remote = Arc::new(RecordingRemote::gated());
        let engine = Arc::new(ComplaintSyncEngine::new(
            None,
            FallbackComplaintStore::new(dir.path().join("fallback.json")),
            Some(Arc::clone(&remote) as Arc<dyn RemoteComplaintStore>),
        ));
        let id = engine.add_complaint(json!({"parcel_number": "P-1", "motif": "bornage"}), SKIP).unwrap();

        let first = tokio::spawn({
            let engine = Arc::clone(&engine);
            let id = id.clone();
            async move { engine.try_remote_submit(&id).await }
        });
        let (entered, release) = remote.gate.as_ref().unwrap();
        entered.notified().await;
        engine
            .update_complaint(&id, json!({"parcel_number": "P-1", "motif": "limites"}), SKIP)
            .unwrap();
        release.notify_one();
        assert!(first.await.unwrap().is_sent());

        let stored = engine.fallback.get(&id).unwrap().unwrap();
        assert_eq!(stored.data["motif"], json!("limites"));
        assert!(!stored.sent_remote);
        assert_eq!(stored.backend_id.as_deref(), Some(id.as_str()));
        assert_eq!(stored.status, ComplaintStatus::Validated);
    }

    #[test]
    fn delete_reaches_the_fallback_file_when_the_table_is_unusable() {
        let (engine, _dir) = engine(None);
        engine
            .db
            .as_ref()
            .unwrap()
            .lock()
            .execute_batch("DROP TABLE complaints")
            .unwrap();
        let id = engine.add_complaint(json!({"parcel_number": "P-1"}), SKIP).unwrap();
        assert!(engine.fallback.get(&id).unwrap().is_some());

        assert!(engine.delete_complaint(&id).unwrap());
        assert!(engine.fallback.get(&id).unwrap().is_none());
        assert_eq!(engine.count_complaints(), 0);
    }

    #[tokio::test]
    async fn edits_keep_send_state_and_backend_id() {
        let remote = Arc::new(RecordingRemote {
            returned_id: Some("remote-77".into()),
            ..RecordingRemote::default()
        });
        let (engine, _dir) = engine(Some(Arc::clone(&remote)));
        let id = engine.add_complaint(json!({"parcel_number": "P-1", "motif": "bornage"}), SKIP).unwrap();
        assert!(engine.try_remote_submit(&id).await.is_sent());

        let outcome = engine
            .update_complaint(&id, json!({"parcel_number": "P-1", "motif": "limites", "backend_id": null}), SKIP)
            .unwrap();
        assert!(!outcome.created_new);
        let stored = engine.get_complaint(&id).unwrap();
        assert!(stored.sent_remote);
        assert_eq!(stored.backend_id.as_deref(), Some("remote-77"));
        assert_eq!(stored.data["motif"], json!("limites"));

        assert!(engine.try_remote_submit(&id).await.is_sent());
        assert_eq!(remote.updates.load(Ordering::SeqCst), 1);
        assert_eq!(engine.get_complaint(&id).unwrap().backend_id.as_deref(), Some("remote-77"));

        let moved = engine
            .update_complaint(&id, json!({"parcel_number": "P-2"}), SKIP)
            .unwrap();
        assert!(moved.created_new);
        assert_ne!(moved.id, id);
        let fresh = engine.get_complaint(&moved.id).unwrap();
        assert!(!fresh.sent_remote);
        assert_eq!(fresh.backend_id, None);
        assert_eq!(engine.get_complaint(&id).unwrap().parcel_number.as_deref(), Some("P-1"));
    }

    #[tokio::test]
    async fn failures_are_recorded_and_retried_without_resending_sent_rows() {
        let failing = Arc::new(RecordingRemote {
            fail: true,
            ..RecordingRemote::default()
        });
        let (engine, _dir) = engine(Some(Arc::clone(&failing)));
        let id = engine.add_complaint(json!({"parcel_number": "P-1"}), SKIP).unwrap();

        let outcome = engine.try_remote_submit(&id).await;
        assert!(matches!(outcome, SubmitOutcome::Failed { .. }));
        let stored = engine.get_complaint(&id).unwrap();
        assert!(!stored.sent_remote);
        assert_eq!(stored.status, ComplaintStatus::Pending);
        assert!(stored.remote_response.unwrap().contains("permission denied"));

        let summary = engine.retry_unsent_complaints().await;
        assert_eq!(summary.attempted, 1);
        assert_eq!(summary.failed, 1);

        engine.update_complaint_status(&id, ComplaintStatus::Rejected).unwrap();
        {
            let db = engine.db.as_ref().unwrap();
            db.lock()
                .execute("UPDATE complaints SET sent_remote = 1 WHERE id = ?1", [&id])
                .unwrap();
        }
        let summary = engine.retry_unsent_complaints().await;
        assert_eq!(summary.attempted, 0);
        assert_eq!(summary.already_sent, 1);
        assert_eq!(failing.inserts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rejected_status_survives_a_successful_send() {
        let remote = Arc::new(RecordingRemote::default());
        let (engine, _dir) = engine(Some(Arc::clone(&remote)));
        let id = engine.add_complaint(json!({"parcel_number": "P-1", "status": "rejected"}), SKIP).unwrap();
        assert!(engine.try_remote_submit(&id).await.is_sent());
        assert_eq!(engine.get_complaint(&id).unwrap().status, ComplaintStatus::Rejected);
        let body = remote.bodies.lock()[0].clone();
        assert_eq!(body["id"], json!(id));
        assert_eq!(body["parcel_number"], json!("P-1"));
    }

    #[tokio::test]
    async fn submit_outcomes_for_missing_pieces() {
        let (unconfigured, _dir) = engine(None);
        assert_eq!(unconfigured.try_remote_submit("x").await, SubmitOutcome::NotConfigured);
        let (engine, _dir2) = engine(Some(Arc::new(RecordingRemote::default())));
        assert_eq!(engine.try_remote_submit("missing").await, SubmitOutcome::NotFound);
    }

    #[tokio::test]
    async fn falls_back_to_file_without_a_database() {
        let dir = tempdir().unwrap();
        let remote = Arc::new(RecordingRemote::default());
        let engine = Arc::new(ComplaintSyncEngine::new(
            None,
            FallbackComplaintStore::new(dir.path().join("fallback.json")),
            Some(Arc::clone(&remote) as Arc<dyn RemoteComplaintStore>),
        ));

        let first = engine.add_complaint(json!({"parcel_number": "P-1", "created_at": "2024-01-01T00:00:00Z"}), SKIP).unwrap();
        let second = engine.add_complaint(json!({"parcel_number": "P-2", "created_at": "2024-02-01T00:00:00Z"}), SKIP).unwrap();
        let ids: Vec<_> = engine.list_complaints().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![second.clone(), first.clone()]);
        assert_eq!(engine.count_complaints(), 2);

        assert!(engine.try_remote_submit(&first).await.is_sent());
        let sent = engine.get_complaint(&first).unwrap();
        assert!(sent.sent_remote);
        assert_eq!(sent.backend_id.as_deref(), Some(first.as_str()));

        assert!(engine.delete_complaint(&second).unwrap());
        assert_eq!(engine.count_complaints(), 1);
        assert_eq!(engine.collect_fallback_garbage(Duration::days(30)).unwrap(), 1);
        assert_eq!(engine.count_complaints(), 0);
    }

    #[test]
    fn re_adding_an_id_keeps_backend_id() {
        let (engine, _dir) = engine(None);
        let id = Uuid::new_v4().to_string();
        engine.add_complaint(json!({"id": id, "parcel_number": "P-1"}), SKIP).unwrap();
        engine
            .db
            .as_ref()
            .unwrap()
            .lock()
            .execute(
                "UPDATE complaints SET backend_id = 'remote-1', sent_remote = 1 WHERE id = ?1",
                [&id],
            )
            .unwrap();
        engine.add_complaint(json!({"id": id, "parcel_number": "P-1", "backend_id": "other"}), SKIP).unwrap();
        let stored = engine.get_complaint(&id).unwrap();
        assert_eq!(stored.backend_id.as_deref(), Some("remote-1"));
        assert!(stored.sent_remote);
    }
}
