//! Client-side application state and the live feeds that keep it current.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{Duration, NaiveDate};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::directory::Directory;
use crate::limits::{QUERY_CAP, SUBSCRIPTION_WINDOW_DAYS};
use crate::model::*;
use crate::store::{DateWindow, Store};

/// Appointment cache plus people registries, shared by the scheduler and
/// the live feed. Only [`LiveFeed`] writes to it.
#[derive(Default)]
pub struct AppState {
    appointments: RwLock<Vec<Appointment>>,
    directory: RwLock<Directory>,
    window: RwLock<Option<DateWindow>>,
    generation: AtomicU64,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn appointments(&self) -> Vec<Appointment> {
        self.appointments.read().await.clone()
    }

    pub async fn appointment(&self, id: &str) -> Option<Appointment> {
        self.appointments
            .read()
            .await
            .iter()
            .find(|a| a.id.as_deref() == Some(id))
            .cloned()
    }

    pub async fn directory(&self) -> Directory {
        self.directory.read().await.clone()
    }

    /// Window of the active appointment subscription, if any.
    pub async fn window(&self) -> Option<DateWindow> {
        *self.window.read().await
    }

    /// Start a new subscription generation. Snapshots from older ones are
    /// discarded from here on.
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn replace_appointments(&self, generation: u64, window: DateWindow, rows: Vec<Appointment>) -> bool {
        let mut guard = self.appointments.write().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        metrics::gauge!(crate::observability::CACHE_APPOINTMENTS).set(rows.len() as f64);
        *guard = rows;
        *self.window.write().await = Some(window);
        true
    }

    async fn replace_directory(&self, directory: Directory) {
        *self.directory.write().await = directory;
    }
}

/// Rows a viewer gets to see: never soft-deleted ones, and for brokers only
/// their own. Broker ids are normalized on the way in.
pub fn visible_to(viewer: &UserProfile, rows: Vec<Appointment>) -> Vec<Appointment> {
    let own = normalize_email(&viewer.email);
    rows.into_iter()
        .filter(|a| !a.is_deleted())
        .map(|mut a| {
            a.broker_id = normalize_email(&a.broker_id);
            a
        })
        .filter(|a| viewer.role != Role::Broker || a.broker_id == own)
        .collect()
}

/// The window subscribed to when the board is centred on `center`.
pub fn window_around(center: NaiveDate) -> DateWindow {
    let span = Duration::days(SUBSCRIPTION_WINDOW_DAYS);
    DateWindow::new(center - span, center + span, QUERY_CAP)
}

/// Push-based feeds into [`AppState`]: one appointment subscription over a
/// rolling window, and one over the users collection.
pub struct LiveFeed {
    store: Arc<dyn Store>,
    state: Arc<AppState>,
    viewer: UserProfile,
    super_admins: SuperAdmins,
    appointments_task: Option<JoinHandle<()>>,
    users_task: Option<JoinHandle<()>>,
}

impl LiveFeed {
    pub fn new(store: Arc<dyn Store>, state: Arc<AppState>, viewer: UserProfile, super_admins: SuperAdmins) -> Self {
        Self {
            store,
            state,
            viewer,
            super_admins,
            appointments_task: None,
            users_task: None,
        }
    }

    /// Re-subscribe around `center`. The previous subscription is torn down
    /// first; at most one is ever active.
    pub fn recenter(&mut self, center: NaiveDate) {
        if let Some(task) = self.appointments_task.take() {
            task.abort();
        }
        let generation = self.state.next_generation();
        let window = window_around(center);
        let mut sub = self.store.clone().subscribe(window);
        let state = self.state.clone();
        let viewer = self.viewer.clone();

        tracing::debug!(from = %window.from, to = %window.to, "appointment feed recentred");
        self.appointments_task = Some(tokio::spawn(async move {
            while let Some(snapshot) = sub.next().await {
                let rows = visible_to(&viewer, snapshot);
                if !state.replace_appointments(generation, window, rows).await {
                    break;
                }
            }
        }));
    }

    /// Keep the people registries in sync with the users collection.
    pub fn watch_users(&mut self) {
        if self.users_task.is_some() {
            return;
        }
        let mut sub = self.store.clone().subscribe_users();
        let state = self.state.clone();
        let super_admins = self.super_admins.clone();
        self.users_task = Some(tokio::spawn(async move {
            while let Some(users) = sub.next().await {
                state.replace_directory(Directory::from_users(&users, &super_admins)).await;
            }
        }));
    }

    pub fn is_active(&self) -> bool {
        self.appointments_task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for LiveFeed {
    fn drop(&mut self) {
        if let Some(task) = self.appointments_task.take() {
            task.abort();
        }
        if let Some(task) = self.users_task.take() {
            task.abort();
        }
    }
}
