use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use futures::future::join_all;
use ulid::Ulid;

use crate::directory::Directory;
use crate::limits::{MAX_PROPERTIES, QUERY_CAP};
use crate::model::*;
use crate::observability::*;
use crate::store::WriteOp;

use super::audit::{detect_changes, history_entry, CREATION_ACTION};
use super::conflict::{check_date_lock, check_overlap, is_time_locked, LOCK_MESSAGE};
use super::recurrence::expand_checked;
use super::*;

/// Result of one retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub failed: usize,
}

impl Scheduler {
    /// Create or update an appointment. Every check runs before the first
    /// write; on `Err` nothing was persisted.
    pub async fn save_appointment(
        &self,
        actor: &UserProfile,
        form: AppointmentForm,
    ) -> Result<SaveOutcome, ScheduleError> {
        let now = self.clock.now_local();
        let stamp = self.clock.now_utc();
        let directory = self.state.directory().await;

        if actor.role == Role::Broker {
            return Err(ScheduleError::validation(BROKER_READ_ONLY_MESSAGE));
        }

        let old = match &form.id {
            None => None,
            Some(id) => match self.store.get(id).await? {
                Some(found) if !found.is_deleted() => Some(found),
                _ => return Err(ScheduleError::NotFound(ORIGINAL_MISSING_MESSAGE.to_string())),
            },
        };
        let caps = Capabilities::evaluate(actor, old.as_ref(), now, &self.super_admins);

        if old.is_none() && check_date_lock(form.date, actor.role, now) {
            metrics::counter!(LOCK_REJECTED_TOTAL).increment(1);
            return Err(ScheduleError::validation(DATE_LOCKED_MESSAGE));
        }
        if !caps.can_save_any {
            return Err(ScheduleError::validation(NO_PERMISSION_MESSAGE));
        }

        let recurrence = form.recurrence.clone();
        let mut appt = self.merge(actor, &form, old.as_ref(), &directory, now, stamp);

        if let Some(old) = &old {
            self.check_edit_rights(&caps, old, &appt)?;
        }
        if appt.end_time <= appt.start_time {
            return Err(ScheduleError::validation(INVALID_RANGE_MESSAGE));
        }
        if appt.properties.len() > MAX_PROPERTIES {
            return Err(ScheduleError::validation(TOO_MANY_PROPERTIES_MESSAGE));
        }

        let id = old.as_ref().and_then(|o| o.id.clone());
        let recurrence = recurrence.filter(|r| old.is_none() && actor.role.has_admin_rights() && !r.weekdays.is_empty());
        // A recurrence checks each generated date instead of the template's.
        if recurrence.is_none() {
            self.reject_cached_overlap(&appt, id.as_deref()).await?;
        }

        match old {
            None => {
                appt.history = vec![history_entry(now, &actor.name, CREATION_ACTION)];
                match recurrence {
                    Some(rule) => self.create_recurring(appt, &rule).await,
                    None => self.create_single(appt).await,
                }
            }
            Some(old) => {
                let changes = detect_changes(&old, &appt, &directory);
                if !changes.is_empty() {
                    appt.history.push(history_entry(now, &actor.name, changes.join("; ")));
                }
                let id = id.unwrap_or_default();
                self.store
                    .commit(vec![WriteOp::Update { id: id.clone(), appointment: appt.clone() }])
                    .await?;
                metrics::counter!(APPOINTMENTS_UPDATED_TOTAL).increment(1);
                tracing::info!(%id, changes = changes.len(), by = %actor.email, "appointment updated");
                Ok(SaveOutcome {
                    message: SAVED_MESSAGE.to_string(),
                    action_type: ActionType::Update,
                    appointment: appt,
                })
            }
        }
    }

    /// Build the record to persist: the stored one (if any) with the form
    /// applied, ownership and linked consultant resolved, and stamps set.
    fn merge(
        &self,
        actor: &UserProfile,
        form: &AppointmentForm,
        old: Option<&Appointment>,
        directory: &Directory,
        now: NaiveDateTime,
        stamp: DateTime<Utc>,
    ) -> Appointment {
        let (mut owner_email, mut owner_name) = match old {
            Some(o) => (o.created_by.clone(), o.created_by_name.clone()),
            None => (actor.email.clone(), actor.name.clone()),
        };
        if actor.role.has_admin_rights()
            && let Some(selected) = form.admin_selected_owner.as_deref().map(normalize_email)
            && !selected.is_empty()
        {
            owner_name = match directory.consultant(&selected) {
                Some(c) => c.name.clone(),
                None if old.is_some_and(|o| normalize_email(&o.created_by) == selected) => owner_name,
                None => selected.clone(),
            };
            owner_email = selected;
        }

        let linked_email = match normalize_email(&form.linked_consultant_email) {
            e if e.is_empty() => owner_email.clone(),
            e => e,
        };
        let linked_name = match directory.consultant(&linked_email) {
            Some(c) => c.name.clone(),
            None if linked_email == owner_email => owner_name.clone(),
            None => linked_email.clone(),
        };

        let mut appt = old.cloned().unwrap_or_else(|| {
            let mut fresh = Appointment::draft(&form.broker_id, form.date, form.start_time, form.end_time);
            fresh.created_at = Some(stamp);
            fresh
        });
        appt.broker_id = normalize_email(&form.broker_id);
        appt.date = form.date;
        appt.start_time = form.start_time;
        appt.end_time = form.end_time;
        appt.is_event = form.is_event;
        appt.status = form.status;
        appt.status_observation = form.status_observation.trim().to_string();
        appt.is_rented = form.is_rented;
        appt.event_comment = form.event_comment.clone();
        appt.properties = form.properties.iter().filter(|p| !p.is_blank()).cloned().collect();
        appt.reference = form.reference.clone();
        appt.property_address = form.property_address.clone();
        appt.clients = form
            .clients
            .iter()
            .cloned()
            .map(|mut c| {
                if c.added_by.is_empty() {
                    c.added_by = actor.email.clone();
                    c.added_by_name = actor.name.clone();
                    c.added_at = super::audit::format_timestamp(now);
                }
                c
            })
            .collect();
        let mut shared: Vec<String> = Vec::new();
        for email in form.shared_with.iter().map(|e| normalize_email(e)) {
            if !email.is_empty() && !shared.contains(&email) {
                shared.push(email);
            }
        }
        appt.shared_with = shared;
        appt.linked_consultant_email = linked_email;
        appt.linked_consultant_name = linked_name;
        appt.created_by = owner_email;
        appt.created_by_name = owner_name;
        appt.updated_at = Some(stamp);
        appt.updated_by = actor.email.clone();
        appt.is_edited = old.is_some();
        appt.edited_at = old.map(|_| stamp);
        appt.normalize_outcome();
        appt
    }

    async fn reject_cached_overlap(&self, appt: &Appointment, exclude_id: Option<&str>) -> Result<(), ScheduleError> {
        match self
            .check_overlap(&appt.broker_id, appt.date, appt.start_time, appt.end_time, exclude_id, appt.is_event)
            .await
        {
            Some(conflict) => {
                metrics::counter!(CONFLICTS_REJECTED_TOTAL, "stage" => "cache").increment(1);
                Err(ScheduleError::Validation(conflict.message))
            }
            None => Ok(()),
        }
    }

    /// Field-level gate for updates: locked records take outcome edits only;
    /// shared (non-core) users cannot touch sharing or other people's
    /// client rows.
    fn check_edit_rights(&self, caps: &Capabilities, old: &Appointment, new: &Appointment) -> Result<(), ScheduleError> {
        if caps.is_locked && !(caps.can_edit_status && only_outcome_changed(old, new)) {
            metrics::counter!(LOCK_REJECTED_TOTAL).increment(1);
            return Err(ScheduleError::validation(LOCK_MESSAGE));
        }
        if caps.is_core_editor {
            return Ok(());
        }
        if shared_emails(old) != new.shared_with {
            return Err(ScheduleError::validation(SHARING_RESTRICTED_MESSAGE));
        }
        let kept = new.client_list();
        let foreign_rows_intact = old
            .client_list()
            .iter()
            .filter(|row| !caps.can_edit_client(row))
            .all(|row| kept.iter().any(|k| k.name == row.name && k.phone == row.phone));
        if !foreign_rows_intact {
            return Err(ScheduleError::validation(CLIENT_ROW_RESTRICTED_MESSAGE));
        }
        Ok(())
    }

    async fn create_single(&self, appt: Appointment) -> Result<SaveOutcome, ScheduleError> {
        let ids = self.store.commit(vec![WriteOp::Create(appt.clone())]).await?;
        let mut appointment = appt;
        appointment.id = ids.into_iter().next();
        metrics::counter!(APPOINTMENTS_CREATED_TOTAL, "kind" => "single").increment(1);
        tracing::info!(
            id = appointment.id.as_deref().unwrap_or_default(),
            broker = %appointment.broker_id,
            date = %appointment.date,
            "appointment created"
        );
        Ok(SaveOutcome {
            message: SAVED_MESSAGE.to_string(),
            action_type: ActionType::Create,
            appointment,
        })
    }

    /// One instance per generated date, committed as a single batch under a
    /// shared group id.
    async fn create_recurring(&self, template: Appointment, rule: &Recurrence) -> Result<SaveOutcome, ScheduleError> {
        let dates = expand_checked(template.date, rule)?;
        let cache = self.state.appointments().await;
        let group_id = Ulid::new().to_string();

        let mut instances = Vec::with_capacity(dates.len());
        for date in &dates {
            let mut instance = template.clone();
            instance.date = *date;
            instance.is_edited = false;
            instance.edited_at = None;
            instance.group_id = Some(group_id.clone());
            if let Some(conflict) = check_overlap(
                &cache,
                &instance.broker_id,
                instance.date,
                instance.start_time,
                instance.end_time,
                None,
                instance.is_event,
            ) {
                metrics::counter!(CONFLICTS_REJECTED_TOTAL, "stage" => "cache").increment(1);
                return Err(ScheduleError::Validation(format!("{} ({})", conflict.message, date.format("%d/%m/%Y"))));
            }
            instances.push(instance);
        }

        let ops = instances.iter().cloned().map(WriteOp::Create).collect();
        let ids = self.store.commit(ops).await?;
        let mut first = instances.swap_remove(0);
        first.id = ids.into_iter().next();

        metrics::counter!(APPOINTMENTS_CREATED_TOTAL, "kind" => "recurrence").increment(dates.len() as u64);
        tracing::info!(%group_id, count = dates.len(), "recurring appointments created");
        Ok(SaveOutcome {
            message: format!("{} agendamentos criados com recorrência!", dates.len()),
            action_type: ActionType::Create,
            appointment: first,
        })
    }

    /// Soft delete. Refused once the slot has started, whoever asks.
    ///
    /// Only the id of `appt` is used; lock and ownership are judged on the
    /// stored record.
    pub async fn delete_appointment(&self, actor: &UserProfile, appt: &Appointment) -> Result<bool, ScheduleError> {
        let Some(id) = appt.id.clone() else {
            return Err(ScheduleError::NotFound(ORIGINAL_MISSING_MESSAGE.to_string()));
        };
        let stored = match self.store.get(&id).await? {
            Some(found) if !found.is_deleted() => found,
            _ => return Err(ScheduleError::NotFound(ORIGINAL_MISSING_MESSAGE.to_string())),
        };
        let now = self.clock.now_local();
        if is_time_locked(stored.date, stored.start_time, now) {
            metrics::counter!(LOCK_REJECTED_TOTAL).increment(1);
            return Err(ScheduleError::validation(LOCK_MESSAGE));
        }
        if !Capabilities::evaluate(actor, Some(&stored), now, &self.super_admins).can_delete {
            return Err(ScheduleError::validation(NO_DELETE_PERMISSION_MESSAGE));
        }

        let by = match actor.email.as_str() {
            "" => "unknown".to_string(),
            email => email.to_string(),
        };
        self.store
            .commit(vec![WriteOp::SoftDelete { id: id.clone(), at: self.clock.now_utc(), by }])
            .await?;
        metrics::counter!(APPOINTMENTS_DELETED_TOTAL).increment(1);
        tracing::info!(%id, by = %actor.email, "appointment soft-deleted");
        Ok(true)
    }

    /// Hard-delete soft-deleted documents older than `retention`. Failures
    /// are logged and counted, never returned.
    pub async fn sweep_expired(&self, retention: Duration) -> SweepReport {
        let cutoff = self.clock.now_utc() - retention;
        let docs = match self.store.query_all(QUERY_CAP).await {
            Ok(docs) => docs,
            Err(e) => {
                tracing::error!("retention sweep: scan failed: {e}");
                return SweepReport::default();
            }
        };
        let expired: Vec<String> = docs
            .into_iter()
            .filter(|a| a.deleted_at.is_some_and(|at| at < cutoff))
            .filter_map(|a| a.id)
            .collect();
        if expired.is_empty() {
            return SweepReport::default();
        }

        let results = join_all(expired.iter().map(|id| self.store.remove(id))).await;
        let mut report = SweepReport::default();
        for (id, result) in expired.iter().zip(results) {
            match result {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(%id, "retention sweep: delete failed: {e}");
                }
            }
        }
        metrics::counter!(SWEEP_REMOVED_TOTAL).increment(report.removed as u64);
        metrics::counter!(SWEEP_FAILURES_TOTAL).increment(report.failed as u64);
        tracing::info!(removed = report.removed, failed = report.failed, "retention sweep finished");
        report
    }
}

/// True if nothing but the outcome (status, its observation, the rented
/// flag) differs between the stored record and the merged one.
fn only_outcome_changed(old: &Appointment, new: &Appointment) -> bool {
    let people = |a: &Appointment| -> Vec<(String, String)> {
        a.client_list().into_iter().map(|c| (c.name, c.phone)).collect()
    };

    normalize_email(&old.broker_id) == new.broker_id
        && old.date == new.date
        && old.start_time == new.start_time
        && old.end_time == new.end_time
        && old.is_event == new.is_event
        && old.event_comment == new.event_comment
        && old.property_list() == new.property_list()
        && people(old) == people(new)
        && shared_emails(old) == shared_emails(new)
        && normalize_email(&old.created_by) == normalize_email(&new.created_by)
}

fn shared_emails(appt: &Appointment) -> Vec<String> {
    appt.shared_with.iter().map(|e| normalize_email(e)).collect()
}
