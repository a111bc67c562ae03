use std::sync::RwLock;

use chrono::{DateTime, Local, NaiveDateTime, Utc};

/// Source of "now". Lock rules are evaluated against it at the moment of
/// access, never cached.
pub trait Clock: Send + Sync {
    /// Local wall-clock time (the board's frame of reference).
    fn now_local(&self) -> NaiveDateTime;

    /// Absolute instant, used for stored timestamps.
    fn now_utc(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_local(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock. Local time and UTC coincide.
#[derive(Debug)]
pub struct ManualClock {
    at: RwLock<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(at: NaiveDateTime) -> Self {
        Self { at: RwLock::new(at) }
    }

    pub fn set(&self, at: NaiveDateTime) {
        if let Ok(mut guard) = self.at.write() {
            *guard = at;
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut guard) = self.at.write() {
            *guard += by;
        }
    }
}

impl Clock for ManualClock {
    fn now_local(&self) -> NaiveDateTime {
        self.at.read().map(|g| *g).unwrap_or_default()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        self.now_local().and_utc()
    }
}
