//! The document store seam.
//!
//! The scheduling core only talks to [`Store`]. [`DocumentStore`] is the
//! bundled implementation: an in-memory document map made durable by the
//! append-only log in [`crate::wal`].

mod document;

pub use document::DocumentStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::model::{Appointment, UserRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),
    /// Slot precondition failed: a live visit already holds the slot.
    #[error("slot already taken by appointment {0}")]
    SlotTaken(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("log error: {0}")]
    Log(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Inclusive date range with a result cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub cap: usize,
}

impl DateWindow {
    pub fn new(from: NaiveDate, to: NaiveDate, cap: usize) -> Self {
        Self { from, to, cap }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.from && date <= self.to
    }
}

/// One write inside an atomic [`Store::commit`].
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Insert a new document; the store assigns its id.
    Create(Appointment),
    /// Replace an existing document with a fully merged record.
    Update { id: String, appointment: Appointment },
    /// Stamp `deletedAt`/`deletedBy`, leaving the document in place.
    SoftDelete { id: String, at: DateTime<Utc>, by: String },
}

/// A live query. Each item is a full snapshot of the matching documents.
/// Dropping the subscription tears it down.
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
    task: JoinHandle<()>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::Receiver<T>, task: JoinHandle<()>) -> Self {
        Self { rx, task }
    }

    /// Next snapshot, or `None` once the feed has ended.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Point read by document id.
    async fn get(&self, id: &str) -> Result<Option<Appointment>, StoreError>;

    /// Documents whose `date` falls in the window, ordered by date and start.
    async fn query_range(&self, window: DateWindow) -> Result<Vec<Appointment>, StoreError>;

    /// Up to `cap` documents, including soft-deleted ones.
    async fn query_all(&self, cap: usize) -> Result<Vec<Appointment>, StoreError>;

    /// Apply all ops or none. Every resulting live, non-event visit must hold
    /// its broker/date slot exclusively; otherwise the whole batch fails with
    /// [`StoreError::SlotTaken`]. Returns the document id of each op.
    async fn commit(&self, ops: Vec<WriteOp>) -> Result<Vec<String>, StoreError>;

    /// Hard delete.
    async fn remove(&self, id: &str) -> Result<(), StoreError>;

    /// Live query over a date window. Emits an initial snapshot, then one
    /// per change touching the window.
    fn subscribe(self: Arc<Self>, window: DateWindow) -> Subscription<Vec<Appointment>>;

    async fn get_user(&self, doc_id: &str) -> Result<Option<UserRecord>, StoreError>;

    /// Equality query on the stored `email` field.
    async fn find_users_by_email(&self, email: &str) -> Result<Vec<(String, UserRecord)>, StoreError>;

    async fn list_users(&self) -> Result<Vec<(String, UserRecord)>, StoreError>;

    async fn put_user(&self, doc_id: &str, user: UserRecord) -> Result<(), StoreError>;

    /// Move a user document to a new key atomically (delete old, create new).
    async fn rekey_user(&self, old_doc_id: &str, new_doc_id: &str, user: UserRecord) -> Result<(), StoreError>;

    async fn remove_user(&self, doc_id: &str) -> Result<(), StoreError>;

    /// Live query over the whole users collection.
    fn subscribe_users(self: Arc<Self>) -> Subscription<Vec<(String, UserRecord)>>;
}
