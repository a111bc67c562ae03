//! Human-readable audit trail for appointment edits.

use chrono::NaiveDateTime;

use crate::directory::Directory;
use crate::model::*;

pub const CREATION_ACTION: &str = "Criação do Agendamento";

const EMPTY: &str = "Vazio";
const NONE: &str = "Nenhum";
const NOBODY: &str = "Ninguém";

/// `dd/mm/yyyy, HH:MM:SS`, as written into `history[].date`.
pub fn format_timestamp(at: NaiveDateTime) -> String {
    at.format("%d/%m/%Y, %H:%M:%S").to_string()
}

pub fn history_entry(at: NaiveDateTime, user: &str, action: impl Into<String>) -> HistoryEntry {
    HistoryEntry {
        date: format_timestamp(at),
        user: user.to_string(),
        action: action.into(),
    }
}

/// One line per field that differs, in a fixed field order. List fields are
/// compared through their formatted summaries, so reordering counts as a
/// change.
pub fn detect_changes(old: &Appointment, new: &Appointment, directory: &Directory) -> Vec<String> {
    let mut changes = Vec::new();
    let mut push = |label: &str, from: String, to: String| {
        if from != to {
            changes.push(format!("{label}: de '{from}' para '{to}'"));
        }
    };

    if normalize_email(&old.broker_id) != normalize_email(&new.broker_id) {
        push("Corretor", name_or_none(directory, &old.broker_id), name_or_none(directory, &new.broker_id));
    }
    push("Data", scalar(&old.date.to_string()), scalar(&new.date.to_string()));
    push("Início", scalar(&old.start_time.to_string()), scalar(&new.start_time.to_string()));
    push("Fim", scalar(&old.end_time.to_string()), scalar(&new.end_time.to_string()));
    push("Status", scalar(old.status.as_str()), scalar(new.status.as_str()));
    push("Obs. Status", scalar(&old.status_observation), scalar(&new.status_observation));
    push("Imóvel Alugado", yes_no(old.is_rented), yes_no(new.is_rented));
    if normalize_email(&old.created_by) != normalize_email(&new.created_by) {
        push("Responsável", owner_name(directory, old), owner_name(directory, new));
    }
    push("Imóveis", format_properties(&old.properties), format_properties(&new.properties));
    push("Clientes", format_clients(&old.clients), format_clients(&new.clients));
    push(
        "Partilhado com",
        format_shared(directory, &old.shared_with),
        format_shared(directory, &new.shared_with),
    );

    changes
}

fn scalar(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() { EMPTY.to_string() } else { value.to_string() }
}

fn yes_no(value: bool) -> String {
    if value { "Sim" } else { "Não" }.to_string()
}

fn name_or_none(directory: &Directory, id: &str) -> String {
    let name = directory.resolve_name(id);
    if name.is_empty() { NONE.to_string() } else { name }
}

fn owner_name(directory: &Directory, appt: &Appointment) -> String {
    if appt.created_by_name.is_empty() {
        name_or_none(directory, &appt.created_by)
    } else {
        appt.created_by_name.clone()
    }
}

fn format_properties(properties: &[PropertyRef]) -> String {
    if properties.is_empty() {
        return NONE.to_string();
    }
    properties
        .iter()
        .map(|p| {
            let reference = (!p.reference.is_empty()).then(|| format!("Ref: {}", p.reference));
            let address = (!p.property_address.is_empty()).then(|| format!("End: {}", p.property_address));
            let body: Vec<String> = reference.into_iter().chain(address).collect();
            format!("[{}]", body.join(" - "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_clients(clients: &[ClientEntry]) -> String {
    if clients.is_empty() {
        return NONE.to_string();
    }
    clients
        .iter()
        .map(|c| match c.name.trim() {
            "" => "Sem Nome",
            name => name,
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_shared(directory: &Directory, shared: &[String]) -> String {
    if shared.is_empty() {
        return NOBODY.to_string();
    }
    shared
        .iter()
        .map(|email| directory.resolve_name(email))
        .collect::<Vec<_>>()
        .join(", ")
}
