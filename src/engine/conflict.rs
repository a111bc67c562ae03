use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike, Weekday};

use crate::limits::{LOCK_GRACE_SECS, SATURDAY_CUTOFF, WEEKDAY_CUTOFF};
use crate::model::*;

pub const CONFLICT_MESSAGE: &str =
    "Conflito de horário: o corretor já possui uma visita neste intervalo.";

pub const LOCK_MESSAGE: &str = "Horário passado. Contate o admin para alterar.";

/// An existing visit that collides with a proposed slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub id: Option<String>,
    pub message: String,
}

/// Scan `appointments` for a live visit of `broker_id` on `date` overlapping
/// `[start, end)`. Events are exempt both as the subject and as obstacles.
pub fn check_overlap<'a>(
    appointments: impl IntoIterator<Item = &'a Appointment>,
    broker_id: &str,
    date: NaiveDate,
    start: ClockTime,
    end: ClockTime,
    exclude_id: Option<&str>,
    is_event: bool,
) -> Option<Conflict> {
    if is_event {
        return None;
    }
    let broker = normalize_email(broker_id);
    let span = Span::between(start, end);
    appointments
        .into_iter()
        .find(|a| {
            !a.is_event
                && !a.is_deleted()
                && (exclude_id.is_none() || a.id.as_deref() != exclude_id)
                && a.date == date
                && normalize_email(&a.broker_id) == broker
                && a.span().overlaps(&span)
        })
        .map(|a| Conflict {
            id: a.id.clone(),
            message: CONFLICT_MESSAGE.to_string(),
        })
}

/// True once the slot start is more than the grace window in the past.
pub fn is_time_locked(date: NaiveDate, time: ClockTime, now: NaiveDateTime) -> bool {
    date.and_time(time.to_naive_time()) < now - Duration::seconds(LOCK_GRACE_SECS)
}

/// Creation lock for the board: past dates, and today once the business-day
/// cutoff has passed. Admins and masters are never locked.
pub fn check_date_lock(date: NaiveDate, role: Role, now: NaiveDateTime) -> bool {
    if role.has_admin_rights() {
        return false;
    }
    let today = now.date();
    if date < today {
        return true;
    }
    if date > today {
        return false;
    }
    let cutoff = match today.weekday() {
        Weekday::Sat => SATURDAY_CUTOFF,
        Weekday::Sun => return false,
        _ => WEEKDAY_CUTOFF,
    };
    (now.hour(), now.minute()) >= cutoff
}

pub fn lock_message() -> &'static str {
    LOCK_MESSAGE
}

/// Same broker, same day, overlapping times. Used to lay out cards side by
/// side; unlike [`check_overlap`] it does not exempt events.
pub fn visual_clash(a: &Appointment, b: &Appointment) -> bool {
    a.date == b.date
        && normalize_email(&a.broker_id) == normalize_email(&b.broker_id)
        && a.span().overlaps(&b.span())
}
