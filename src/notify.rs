use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// Document collections a listener can watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Appointments,
    Users,
}

/// What changed. Appointment changes carry the dates they touched so a
/// windowed listener can skip unrelated writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Appointments { dates: Vec<NaiveDate> },
    Users,
}

impl Change {
    pub fn collection(&self) -> Collection {
        match self {
            Change::Appointments { .. } => Collection::Appointments,
            Change::Users => Collection::Users,
        }
    }

    /// True if this change may affect a listener on `[from, to]`.
    pub fn touches(&self, from: NaiveDate, to: NaiveDate) -> bool {
        match self {
            Change::Appointments { dates } => dates.iter().any(|d| *d >= from && *d <= to),
            Change::Users => true,
        }
    }
}

/// Broadcast hub for change notifications, one channel per collection.
pub struct NotifyHub {
    channels: DashMap<Collection, broadcast::Sender<Change>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a collection. Creates the channel if needed.
    pub fn subscribe(&self, collection: Collection) -> broadcast::Receiver<Change> {
        let sender = self
            .channels
            .entry(collection)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, change: Change) {
        if let Some(sender) = self.channels.get(&change.collection()) {
            let _ = sender.send(change);
        }
    }
}
