mod audit;
mod conflict;
mod error;
mod mutations;
mod permissions;
mod recurrence;
#[cfg(test)]
mod tests;

pub use audit::{detect_changes, format_timestamp, history_entry, CREATION_ACTION};
pub use conflict::{
    check_date_lock, check_overlap, is_time_locked, lock_message, visual_clash, Conflict, CONFLICT_MESSAGE,
    LOCK_MESSAGE,
};
pub use error::ScheduleError;
pub use mutations::SweepReport;
pub use permissions::Capabilities;
pub use recurrence::{expand, Recurrence, NO_DATES_MESSAGE};

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;

use crate::clock::Clock;
use crate::model::*;
use crate::state::AppState;
use crate::store::Store;

pub const ORIGINAL_MISSING_MESSAGE: &str = "Erro: Visita original não encontrada.";
pub const SAVED_MESSAGE: &str = "Agendamento salvo com sucesso!";
pub const DATE_LOCKED_MESSAGE: &str = "Agendamentos encerrados para esta data.";
pub const BROKER_READ_ONLY_MESSAGE: &str = "Corretores não podem criar ou editar agendamentos.";
pub const NO_PERMISSION_MESSAGE: &str = "Você não tem permissão para editar este agendamento.";
pub const NO_DELETE_PERMISSION_MESSAGE: &str = "Você não tem permissão para excluir este agendamento.";
pub const SHARING_RESTRICTED_MESSAGE: &str = "Apenas o responsável pode alterar o compartilhamento.";
pub const CLIENT_ROW_RESTRICTED_MESSAGE: &str = "Você só pode alterar clientes adicionados por você.";
pub const INVALID_RANGE_MESSAGE: &str = "O horário de término deve ser posterior ao início.";
pub const TOO_MANY_PROPERTIES_MESSAGE: &str = "Máximo de 4 imóveis por visita.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Create,
    Update,
    Delete,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::Create => "create",
            ActionType::Update => "update",
            ActionType::Delete => "delete",
        }
    }
}

/// Everything the appointment form submits. `id` is `None` for a new one.
#[derive(Debug, Clone, PartialEq)]
pub struct AppointmentForm {
    pub id: Option<String>,
    pub broker_id: String,
    pub date: NaiveDate,
    pub start_time: ClockTime,
    pub end_time: ClockTime,
    pub is_event: bool,
    pub status: Status,
    pub status_observation: String,
    pub is_rented: bool,
    pub event_comment: String,
    pub properties: Vec<PropertyRef>,
    pub reference: String,
    pub property_address: String,
    pub clients: Vec<ClientEntry>,
    pub shared_with: Vec<String>,
    /// Empty means "the owner".
    pub linked_consultant_email: String,
    /// Admin-only ownership transfer.
    pub admin_selected_owner: Option<String>,
    /// Admin-only, new appointments only.
    pub recurrence: Option<Recurrence>,
}

impl AppointmentForm {
    pub fn new(broker_id: &str, date: NaiveDate, start_time: ClockTime, end_time: ClockTime) -> Self {
        Self {
            id: None,
            broker_id: broker_id.to_string(),
            date,
            start_time,
            end_time,
            is_event: false,
            status: Status::Agendada,
            status_observation: String::new(),
            is_rented: false,
            event_comment: String::new(),
            properties: Vec::new(),
            reference: String::new(),
            property_address: String::new(),
            clients: Vec::new(),
            shared_with: Vec::new(),
            linked_consultant_email: String::new(),
            admin_selected_owner: None,
            recurrence: None,
        }
    }

    /// The form as it opens on an existing appointment.
    pub fn from_appointment(appt: &Appointment) -> Self {
        Self {
            id: appt.id.clone(),
            broker_id: appt.broker_id.clone(),
            date: appt.date,
            start_time: appt.start_time,
            end_time: appt.end_time,
            is_event: appt.is_event,
            status: appt.status,
            status_observation: appt.status_observation.clone(),
            is_rented: appt.is_rented,
            event_comment: appt.event_comment.clone(),
            properties: appt.properties.clone(),
            reference: appt.reference.clone(),
            property_address: appt.property_address.clone(),
            clients: appt.clients.clone(),
            shared_with: appt.shared_with.clone(),
            linked_consultant_email: appt.linked_consultant_email.clone(),
            admin_selected_owner: None,
            recurrence: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaveOutcome {
    pub message: String,
    pub action_type: ActionType,
    /// The saved record; for a recurrence, its first instance.
    pub appointment: Appointment,
}

/// The appointment write pipeline. Reads the cache in [`AppState`] for
/// fast-path checks and writes through the [`Store`], whose commit
/// re-validates slots authoritatively.
pub struct Scheduler {
    store: Arc<dyn Store>,
    state: Arc<AppState>,
    clock: Arc<dyn Clock>,
    super_admins: SuperAdmins,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, state: Arc<AppState>, clock: Arc<dyn Clock>, super_admins: SuperAdmins) -> Self {
        Self {
            store,
            state,
            clock,
            super_admins,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn super_admins(&self) -> &SuperAdmins {
        &self.super_admins
    }

    /// Capabilities of `actor` on `appointment` at this instant.
    pub fn capabilities(&self, actor: &UserProfile, appointment: Option<&Appointment>) -> Capabilities {
        Capabilities::evaluate(actor, appointment, self.clock.now_local(), &self.super_admins)
    }

    /// Cache-backed overlap check, as the board uses it while a form is open.
    pub async fn check_overlap(
        &self,
        broker_id: &str,
        date: NaiveDate,
        start: ClockTime,
        end: ClockTime,
        exclude_id: Option<&str>,
        is_event: bool,
    ) -> Option<Conflict> {
        let cache = self.state.appointments().await;
        check_overlap(&cache, broker_id, date, start, end, exclude_id, is_event)
    }

    pub fn is_time_locked(&self, date: NaiveDate, time: ClockTime) -> bool {
        is_time_locked(date, time, self.clock.now_local())
    }
}
