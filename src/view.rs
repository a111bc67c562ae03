//! What the appointment form shows and unlocks for a given user.
//!
//! Pure: the renderer applies a [`ViewModel`] and never re-derives
//! permissions itself.

use serde::Serialize;

use crate::engine::{Capabilities, Scheduler, lock_message};
use crate::limits::MAX_PROPERTIES;
use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldState {
    pub editable: bool,
    pub visible: bool,
}

impl FieldState {
    fn new(visible: bool, editable: bool) -> Self {
        Self {
            editable: visible && editable,
            visible,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Fields {
    pub broker: FieldState,
    pub date: FieldState,
    pub start_time: FieldState,
    pub end_time: FieldState,
    pub is_event: FieldState,
    pub event_comment: FieldState,
    pub properties: FieldState,
    pub clients: FieldState,
    pub status: FieldState,
    pub status_observation: FieldState,
    pub is_rented: FieldState,
    pub owner: FieldState,
    pub shared_with: FieldState,
    pub recurrence: FieldState,
    pub history: FieldState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Actions {
    pub save: bool,
    pub delete: bool,
    pub share: bool,
    pub add_property: bool,
    pub add_client: bool,
}

/// Per client row, in list order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClientRowState {
    pub editable: bool,
    pub removable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewModel {
    pub title: &'static str,
    pub fields: Fields,
    pub actions: Actions,
    pub client_rows: Vec<ClientRowState>,
    /// Shown above the form when the record is time-locked.
    pub lock_warning: Option<&'static str>,
}

/// Form state for `actor` on `appointment` (`None` opens a blank draft).
/// `caps` must have been evaluated for the same pair.
pub fn compute_view_model(actor: &UserProfile, appointment: Option<&Appointment>, caps: &Capabilities) -> ViewModel {
    let is_admin = actor.role.has_admin_rights();
    let is_event = caps.is_event;
    let core = caps.is_core_editor && !caps.is_locked;
    let status = appointment.map(|a| a.status).unwrap_or_default();

    let properties_len = appointment.map(|a| a.property_list().len()).unwrap_or(0);
    let clients = appointment.map(Appointment::client_list).unwrap_or_default();
    let client_rows = if is_event {
        Vec::new()
    } else {
        clients
            .iter()
            .map(|row| {
                let editable = caps.can_edit_client(row);
                ClientRowState {
                    editable,
                    removable: editable && clients.len() > 1,
                }
            })
            .collect()
    };

    let fields = Fields {
        broker: FieldState::new(true, core),
        date: FieldState::new(true, core),
        start_time: FieldState::new(true, core),
        end_time: FieldState::new(true, core),
        is_event: FieldState::new(caps.can_save_any, core),
        event_comment: FieldState::new(is_event, core),
        properties: FieldState::new(!is_event, caps.can_interact_general),
        clients: FieldState::new(!is_event, caps.can_interact_general),
        status: FieldState::new(!is_event, caps.can_edit_status),
        status_observation: FieldState::new(!is_event && status != Status::Agendada, caps.can_edit_status),
        is_rented: FieldState::new(!is_event && status == Status::Realizada, caps.can_edit_status),
        owner: FieldState::new(is_admin, core),
        shared_with: FieldState::new(!is_event, caps.can_manage_sharing),
        recurrence: FieldState::new(is_admin && appointment.is_none(), true),
        history: FieldState::new(is_admin && appointment.is_some_and(|a| !a.history.is_empty()), false),
    };

    let actions = Actions {
        save: caps.show_save_button,
        delete: appointment.is_some() && caps.can_delete,
        share: caps.can_manage_sharing,
        add_property: !is_event && caps.can_interact_general && properties_len < MAX_PROPERTIES,
        add_client: !is_event && caps.can_interact_general,
    };

    ViewModel {
        title: match appointment {
            None => "Novo Agendamento",
            Some(a) if a.is_event => "Evento/Aviso",
            Some(_) => "Detalhes da Visita",
        },
        fields,
        actions,
        client_rows,
        lock_warning: caps.is_locked.then(lock_message),
    }
}

impl Scheduler {
    /// [`compute_view_model`] evaluated at the current instant.
    pub fn view_model(&self, actor: &UserProfile, appointment: Option<&Appointment>) -> ViewModel {
        let caps = self.capabilities(actor, appointment);
        compute_view_model(actor, appointment, &caps)
    }
}
