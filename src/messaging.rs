//! WhatsApp deep links telling a broker about a new or removed visit.
//!
//! Best effort throughout: nothing here can fail the operation that
//! triggered it.

use async_trait::async_trait;

use crate::directory::Directory;
use crate::engine::{ActionType, Scheduler};
use crate::model::*;

/// Asks the acting user a yes/no question.
#[async_trait]
pub trait Prompt: Send + Sync {
    async fn confirm(&self, title: &str, message: &str) -> bool;

    /// Informational notice; the default does nothing.
    async fn notice(&self, _title: &str, _message: &str) {}
}

/// Hands a URL to whatever can open it (browser, share sheet).
#[async_trait]
pub trait LinkOpener: Send + Sync {
    async fn open(&self, url: &str) -> Result<(), String>;
}

/// What came of a notification attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// Events, missing broker, or an action that doesn't notify.
    Skipped,
    NoPhone,
    Declined,
    Sent(String),
    Failed(String),
}

pub fn prompt_text(action: ActionType, broker_name: &str) -> String {
    let verb = match action {
        ActionType::Delete => "excluído",
        _ => "criado",
    };
    format!("Deseja enviar mensagem no WhatsApp para {broker_name} informando que o agendamento foi {verb}?")
}

/// Message body for the broker. `dd/mm` date, first property, first named
/// client.
pub fn compose_message(action: ActionType, appt: &Appointment, broker_name: &str, client_name: &str) -> String {
    let first = appt.property_list().into_iter().next().unwrap_or_default();
    let (title, lead) = match action {
        ActionType::Delete => ("*VISITA EXCLUÍDA*", "um agendamento foi excluído:"),
        _ => ("*NOVA VISITA AGENDADA*", "um novo agendamento foi criado:"),
    };
    let mut msg = format!(
        "{title}\nOlá {broker_name}, {lead}\n📅 Data: {}\n⏰ Hora: {}\n📍 Endereço: {}\n👤 Cliente: {client_name}",
        appt.date.format("%d/%m"),
        appt.start_time,
        first.property_address,
    );
    if !first.reference.is_empty() {
        msg.push_str(&format!("\nRef: {}", first.reference));
    }
    msg
}

pub fn whatsapp_link(phone: &str, text: &str) -> Option<String> {
    let digits = normalize_phone(phone);
    if digits.is_empty() {
        return None;
    }
    Some(format!("https://wa.me/{digits}?text={}", urlencoding::encode(text)))
}

/// Offer to message the appointment's broker after a create or delete.
pub async fn notify_broker(
    directory: &Directory,
    prompt: &dyn Prompt,
    opener: &dyn LinkOpener,
    action: ActionType,
    appt: &Appointment,
) -> NotifyOutcome {
    if appt.is_event || appt.broker_id.is_empty() || action == ActionType::Update {
        return NotifyOutcome::Skipped;
    }
    let broker = directory.broker_by_id_or_name(&appt.broker_id, "");
    let broker_name = broker.map(|b| b.name.clone()).unwrap_or_else(|| "Corretor".to_string());
    let phone = broker.map(|b| b.phone.clone()).unwrap_or_default();
    if normalize_phone(&phone).is_empty() {
        tracing::warn!(broker = %appt.broker_id, "broker has no phone on file");
        prompt
            .notice("Aviso", &format!("O corretor {broker_name} não possui telefone cadastrado no perfil."))
            .await;
        return NotifyOutcome::NoPhone;
    }

    if !prompt.confirm("Enviar notificação ao corretor", &prompt_text(action, &broker_name)).await {
        return NotifyOutcome::Declined;
    }

    let client = appt
        .client_list()
        .into_iter()
        .map(|c| c.name.trim().to_string())
        .find(|n| !n.is_empty())
        .unwrap_or_else(|| "Cliente".to_string());
    let text = compose_message(action, appt, &broker_name, &client);
    let Some(url) = whatsapp_link(&phone, &text) else {
        return NotifyOutcome::NoPhone;
    };
    match opener.open(&url).await {
        Ok(()) => NotifyOutcome::Sent(url),
        Err(e) => {
            tracing::error!("broker notification failed (ignored): {e}");
            NotifyOutcome::Failed(e)
        }
    }
}

impl Scheduler {
    /// [`notify_broker`] against the live directory.
    pub async fn notify_broker(
        &self,
        prompt: &dyn Prompt,
        opener: &dyn LinkOpener,
        action: ActionType,
        appt: &Appointment,
    ) -> NotifyOutcome {
        let directory = self.state().directory().await;
        notify_broker(&directory, prompt, opener, action, appt).await
    }
}
