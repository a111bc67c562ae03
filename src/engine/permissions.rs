use chrono::NaiveDateTime;

use crate::model::*;

use super::conflict::is_time_locked;

/// What one user may do to one appointment, right now.
///
/// Fields are evaluated independently: a locked visit can still take a
/// status update from its creator while every structural field is frozen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub is_creator: bool,
    /// Admin or creator.
    pub is_core_editor: bool,
    /// Listed in `sharedWith`.
    pub can_share: bool,
    pub can_save_any: bool,
    pub is_locked: bool,
    pub can_edit_status: bool,
    /// Properties and client rows, while unlocked.
    pub can_interact_general: bool,
    pub can_delete: bool,
    pub can_manage_sharing: bool,
    pub show_save_button: bool,
    pub is_event: bool,
    actor_email: String,
}

impl Capabilities {
    /// `appointment` is `None` for a new draft; the actor then counts as its
    /// creator. Masters and allow-listed accounts are never time-locked.
    pub fn evaluate(
        actor: &UserProfile,
        appointment: Option<&Appointment>,
        now: NaiveDateTime,
        super_admins: &SuperAdmins,
    ) -> Self {
        let is_admin = actor.role.has_admin_rights();
        let is_super = actor.role == Role::Master || super_admins.contains(&actor.email);

        let is_creator = appointment.is_none_or(|a| a.is_creator(&actor.email));
        let can_share = appointment.is_some_and(|a| a.is_shared_with(&actor.email));
        let is_event = appointment.is_some_and(|a| a.is_event);
        let is_locked = !is_super
            && appointment.is_some_and(|a| is_time_locked(a.date, a.start_time, now));

        let is_core_editor = is_admin || is_creator;
        let can_save_any = is_core_editor || can_share;
        let can_interact_general = can_save_any && !is_locked;

        Self {
            is_creator,
            is_core_editor,
            can_share,
            can_save_any,
            is_locked,
            can_edit_status: is_core_editor || can_interact_general,
            can_interact_general,
            can_delete: is_core_editor && !is_locked,
            can_manage_sharing: is_core_editor && !is_locked && !is_event,
            show_save_button: can_interact_general || (is_locked && is_core_editor),
            is_event,
            actor_email: normalize_email(&actor.email),
        }
    }

    /// Client rows are editable by core editors, or by whoever added them.
    pub fn can_edit_client(&self, row: &ClientEntry) -> bool {
        !self.is_locked && (self.is_core_editor || normalize_email(&row.added_by) == self.actor_email)
    }
}
