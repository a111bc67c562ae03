use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use ulid::Ulid;

use crate::limits::{MAX_BATCH_SIZE, SUBSCRIPTION_BUFFER};
use crate::model::*;
use crate::notify::{Change, Collection, NotifyHub};
use crate::wal::Wal;

use super::{DateWindow, Store, StoreError, Subscription, WriteOp};

// ── Group-commit log channel ─────────────────────────────

enum WalCommand {
    /// Records of one commit. They are written and synced together.
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the log and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then syncs once for the whole group.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut group = vec![(events, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => group.push((events, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                flush_group(&mut wal, &mut group);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_group(wal: &mut Wal, group: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(group.len() as f64);
    let started = std::time::Instant::now();
    let result = write_group(wal, group);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    for (_, tx) in group.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn write_group(wal: &mut Wal, group: &[PendingAppend]) -> io::Result<()> {
    let mut append_err = None;
    'outer: for (events, _) in group {
        for event in events {
            if let Err(e) = wal.append_buffered(event) {
                append_err = Some(e);
                break 'outer;
            }
        }
    }
    // Always flush, even after an append error, so partial bytes don't leak
    // into the next group.
    let flush_err = wal.flush_sync().err();
    match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Visits occupy their broker/date slot; events and soft-deleted documents
/// never do.
fn holds_slot(appt: &Appointment) -> bool {
    !appt.is_event && !appt.is_deleted()
}

fn slot_key(appt: &Appointment) -> (String, NaiveDate) {
    (normalize_email(&appt.broker_id), appt.date)
}

/// In-memory document store, durable when opened on a log file.
pub struct DocumentStore {
    appointments: DashMap<String, Appointment>,
    users: DashMap<String, UserRecord>,
    /// Slot index: live visit ids per (broker, date).
    slots: DashMap<(String, NaiveDate), Vec<String>>,
    /// Serializes writers so the slot precondition and the write are atomic.
    commit_lock: Mutex<()>,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
    notify: Arc<NotifyHub>,
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl DocumentStore {
    /// A store with no log. Contents vanish with the process.
    pub fn in_memory() -> Self {
        Self {
            appointments: DashMap::new(),
            users: DashMap::new(),
            slots: DashMap::new(),
            commit_lock: Mutex::new(()),
            wal_tx: None,
            notify: Arc::new(NotifyHub::new()),
        }
    }

    /// Replay the log at `path` and keep appending to it. Must be called
    /// inside a Tokio runtime (spawns the log writer).
    pub fn open(path: &Path) -> io::Result<Self> {
        let events = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut store = Self::in_memory();
        store.wal_tx = Some(wal_tx);
        for event in &events {
            store.apply(event);
        }
        tracing::debug!(records = events.len(), path = %path.display(), "document log replayed");
        Ok(store)
    }

    pub fn appointment_count(&self) -> usize {
        self.appointments.len()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Apply a record to the maps (caller holds the commit lock, or is replaying).
    fn apply(&self, event: &Event) {
        match event {
            Event::AppointmentPut { appointment } => {
                let id = appointment.id.clone().unwrap_or_default();
                if let Some(old) = self.appointments.insert(id.clone(), appointment.clone()) {
                    self.unindex(&id, &old);
                }
                self.index(&id, appointment);
            }
            Event::AppointmentRemoved { id } => {
                if let Some((_, old)) = self.appointments.remove(id) {
                    self.unindex(id, &old);
                }
            }
            Event::UserPut { doc_id, user } => {
                self.users.insert(doc_id.clone(), user.clone());
            }
            Event::UserRemoved { doc_id } => {
                self.users.remove(doc_id);
            }
        }
    }

    fn index(&self, id: &str, appt: &Appointment) {
        if holds_slot(appt) {
            self.slots.entry(slot_key(appt)).or_default().push(id.to_string());
        }
    }

    fn unindex(&self, id: &str, appt: &Appointment) {
        if let Some(mut ids) = self.slots.get_mut(&slot_key(appt)) {
            ids.retain(|i| i != id);
        }
    }

    /// First stored visit, outside `exempt`, overlapping `appt` on its slot.
    fn slot_conflict(&self, appt: &Appointment, exempt: &HashSet<&str>) -> Option<String> {
        let ids = self.slots.get(&slot_key(appt))?.value().clone();
        let span = appt.span();
        ids.into_iter().find(|id| {
            !exempt.contains(id.as_str())
                && self
                    .appointments
                    .get(id)
                    .is_some_and(|other| holds_slot(&other) && other.span().overlaps(&span))
        })
    }

    /// Write records to the log. No-op for an in-memory store.
    async fn log(&self, events: Vec<Event>) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Append { events, response: tx })
            .await
            .map_err(|_| StoreError::Log("log writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Log("log writer dropped response".into()))?
            .map_err(|e| StoreError::Log(e.to_string()))
    }

    fn snapshot(&self, window: DateWindow) -> Vec<Appointment> {
        let mut docs: Vec<Appointment> = self
            .appointments
            .iter()
            .filter(|e| window.contains(e.value().date))
            .map(|e| e.value().clone())
            .collect();
        docs.sort_by(|a, b| (a.date, a.start_time).cmp(&(b.date, b.start_time)));
        docs.truncate(window.cap);
        docs
    }

    fn user_snapshot(&self) -> Vec<(String, UserRecord)> {
        let mut users: Vec<(String, UserRecord)> = self
            .users
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        users.sort_by(|a, b| a.0.cmp(&b.0));
        users
    }

    /// Rewrite the log with only what the current state needs.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let _guard = self.commit_lock.lock().await;
        let mut events: Vec<Event> = self
            .user_snapshot()
            .into_iter()
            .map(|(doc_id, user)| Event::UserPut { doc_id, user })
            .collect();
        events.extend(
            self.appointments
                .iter()
                .map(|e| Event::AppointmentPut { appointment: e.value().clone() }),
        );

        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Log("log writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Log("log writer dropped response".into()))?
            .map_err(|e| StoreError::Log(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let Some(wal_tx) = &self.wal_tx else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl Store for DocumentStore {
    async fn get(&self, id: &str) -> Result<Option<Appointment>, StoreError> {
        Ok(self.appointments.get(id).map(|e| e.value().clone()))
    }

    async fn query_range(&self, window: DateWindow) -> Result<Vec<Appointment>, StoreError> {
        Ok(self.snapshot(window))
    }

    async fn query_all(&self, cap: usize) -> Result<Vec<Appointment>, StoreError> {
        Ok(self
            .appointments
            .iter()
            .take(cap)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn commit(&self, ops: Vec<WriteOp>) -> Result<Vec<String>, StoreError> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        if ops.len() > MAX_BATCH_SIZE {
            return Err(StoreError::LimitExceeded("batch too large"));
        }
        let _guard = self.commit_lock.lock().await;

        // Phase 1: resolve every op to its final document.
        let mut staged: Vec<(String, Appointment)> = Vec::with_capacity(ops.len());
        let mut touched_dates = Vec::new();
        for op in ops {
            match op {
                WriteOp::Create(mut appointment) => {
                    let id = Ulid::new().to_string();
                    appointment.id = Some(id.clone());
                    staged.push((id, appointment));
                }
                WriteOp::Update { id, mut appointment } => {
                    let old_date = self
                        .appointments
                        .get(&id)
                        .map(|e| e.value().date)
                        .ok_or_else(|| StoreError::NotFound(id.clone()))?;
                    touched_dates.push(old_date);
                    appointment.id = Some(id.clone());
                    staged.push((id, appointment));
                }
                WriteOp::SoftDelete { id, at, by } => {
                    let mut doc = self
                        .appointments
                        .get(&id)
                        .map(|e| e.value().clone())
                        .ok_or_else(|| StoreError::NotFound(id.clone()))?;
                    doc.deleted_at = Some(at);
                    doc.deleted_by = Some(by);
                    staged.push((id, doc));
                }
            }
        }

        // Phase 2: slot precondition against stored state and within the batch.
        let batch_ids: HashSet<&str> = staged.iter().map(|(id, _)| id.as_str()).collect();
        for (i, (_, doc)) in staged.iter().enumerate() {
            if !holds_slot(doc) {
                continue;
            }
            if let Some(taken) = self.slot_conflict(doc, &batch_ids) {
                return Err(StoreError::SlotTaken(taken));
            }
            for (other_id, other) in &staged[i + 1..] {
                if holds_slot(other)
                    && slot_key(other) == slot_key(doc)
                    && other.span().overlaps(&doc.span())
                {
                    return Err(StoreError::SlotTaken(other_id.clone()));
                }
            }
        }

        // Phase 3: log, apply, notify.
        let events: Vec<Event> = staged
            .iter()
            .map(|(_, doc)| Event::AppointmentPut { appointment: doc.clone() })
            .collect();
        self.log(events.clone()).await?;
        for event in &events {
            self.apply(event);
        }
        touched_dates.extend(staged.iter().map(|(_, doc)| doc.date));
        self.notify.send(Change::Appointments { dates: touched_dates });

        Ok(staged.into_iter().map(|(id, _)| id).collect())
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self.commit_lock.lock().await;
        let date = self
            .appointments
            .get(id)
            .map(|e| e.value().date)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let event = Event::AppointmentRemoved { id: id.to_string() };
        self.log(vec![event.clone()]).await?;
        self.apply(&event);
        self.notify.send(Change::Appointments { dates: vec![date] });
        Ok(())
    }

    fn subscribe(self: Arc<Self>, window: DateWindow) -> Subscription<Vec<Appointment>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut changes = self.notify.subscribe(Collection::Appointments);
        let store = self;
        let task = tokio::spawn(async move {
            if tx.send(store.snapshot(window)).await.is_err() {
                return;
            }
            loop {
                match changes.recv().await {
                    Ok(change) if !change.touches(window.from, window.to) => continue,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                if tx.send(store.snapshot(window)).await.is_err() {
                    break;
                }
            }
        });
        Subscription::new(rx, task)
    }

    async fn get_user(&self, doc_id: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.users.get(doc_id).map(|e| e.value().clone()))
    }

    async fn find_users_by_email(&self, email: &str) -> Result<Vec<(String, UserRecord)>, StoreError> {
        Ok(self
            .users
            .iter()
            .filter(|e| e.value().email == email)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect())
    }

    async fn list_users(&self) -> Result<Vec<(String, UserRecord)>, StoreError> {
        Ok(self.user_snapshot())
    }

    async fn put_user(&self, doc_id: &str, user: UserRecord) -> Result<(), StoreError> {
        let _guard = self.commit_lock.lock().await;
        let event = Event::UserPut { doc_id: doc_id.to_string(), user };
        self.log(vec![event.clone()]).await?;
        self.apply(&event);
        self.notify.send(Change::Users);
        Ok(())
    }

    async fn rekey_user(&self, old_doc_id: &str, new_doc_id: &str, user: UserRecord) -> Result<(), StoreError> {
        let _guard = self.commit_lock.lock().await;
        if !self.users.contains_key(old_doc_id) {
            return Err(StoreError::NotFound(old_doc_id.to_string()));
        }
        let events = vec![
            Event::UserRemoved { doc_id: old_doc_id.to_string() },
            Event::UserPut { doc_id: new_doc_id.to_string(), user },
        ];
        self.log(events.clone()).await?;
        for event in &events {
            self.apply(event);
        }
        self.notify.send(Change::Users);
        Ok(())
    }

    async fn remove_user(&self, doc_id: &str) -> Result<(), StoreError> {
        let _guard = self.commit_lock.lock().await;
        if !self.users.contains_key(doc_id) {
            return Err(StoreError::NotFound(doc_id.to_string()));
        }
        let event = Event::UserRemoved { doc_id: doc_id.to_string() };
        self.log(vec![event.clone()]).await?;
        self.apply(&event);
        self.notify.send(Change::Users);
        Ok(())
    }

    fn subscribe_users(self: Arc<Self>) -> Subscription<Vec<(String, UserRecord)>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut changes = self.notify.subscribe(Collection::Users);
        let store = self;
        let task = tokio::spawn(async move {
            if tx.send(store.user_snapshot()).await.is_err() {
                return;
            }
            loop {
                match changes.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                if tx.send(store.user_snapshot()).await.is_err() {
                    break;
                }
            }
        });
        Subscription::new(rx, task)
    }
}
