use chrono::{Datelike, NaiveDate};

use crate::limits::MAX_RECURRENCE_DAYS;

use super::ScheduleError;

pub const NO_DATES_MESSAGE: &str = "Nenhuma data gerada para a recorrência selecionada.";

/// A weekly recurrence request: every listed weekday (0 = Sunday … 6 =
/// Saturday) from the template's date through `end_date`, inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recurrence {
    pub weekdays: Vec<u32>,
    pub end_date: NaiveDate,
}

/// Every date in `[start, end]` whose weekday is in `weekdays`, ascending.
/// Calendar dates carry no time zone, so there is no day shift to guard
/// against.
pub fn expand(start: NaiveDate, end: NaiveDate, weekdays: &[u32]) -> Vec<NaiveDate> {
    start
        .iter_days()
        .take_while(|d| *d <= end)
        .filter(|d| weekdays.contains(&d.weekday().num_days_from_sunday()))
        .collect()
}

/// [`expand`] with the range cap and the empty-result check applied.
pub(crate) fn expand_checked(start: NaiveDate, rule: &Recurrence) -> Result<Vec<NaiveDate>, ScheduleError> {
    if (rule.end_date - start).num_days() > MAX_RECURRENCE_DAYS {
        return Err(ScheduleError::validation(format!(
            "A recorrência pode cobrir no máximo {MAX_RECURRENCE_DAYS} dias."
        )));
    }
    let dates = expand(start, rule.end_date, &rule.weekdays);
    if dates.is_empty() {
        return Err(ScheduleError::validation(NO_DATES_MESSAGE));
    }
    Ok(dates)
}
