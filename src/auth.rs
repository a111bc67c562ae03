//! Credential lookup and user administration over the users collection.
//!
//! Passwords are stored and compared as plain text. This is a lookup, not
//! a security boundary.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::model::*;
use crate::observability::AUTH_FAILURES_TOTAL;
use crate::store::{Store, StoreError};

/// `local@domain.tld`: no whitespace or `@` inside any part.
static EMAIL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email pattern"));

/// Accounts nobody may remove, on top of the super-admin allow-list.
pub const PROTECTED_ACCOUNTS: &[&str] = &["admin@admin.com"];

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Preencha e-mail e senha.")]
    MissingCredentials,
    #[error("E-mail ou senha incorretos.")]
    InvalidCredentials,
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("{0}")]
    Validation(String),
    #[error("Este utilizador mestre não pode ser excluído.")]
    Protected,
    #[error("Falha ao se comunicar com o banco de dados.")]
    Store(#[from] StoreError),
}

fn same_password(saved: &str, typed: &str) -> bool {
    saved.trim() == typed.trim()
}

/// Find the account for `email` and check `password`.
///
/// Tries the document id (as typed, then normalized), then the `email`
/// field, then a full scan on normalized email. The first match whose
/// password agrees wins.
pub async fn login(
    store: &dyn Store,
    email: &str,
    password: &str,
    super_admins: &SuperAdmins,
) -> Result<UserProfile, AuthError> {
    let typed = email.trim();
    let normalized = normalize_email(email);
    if normalized.is_empty() || password.trim().is_empty() {
        return Err(AuthError::MissingCredentials);
    }

    let mut candidates = vec![typed.to_string()];
    if normalized != typed {
        candidates.push(normalized.clone());
    }

    for doc_id in &candidates {
        if let Some(record) = store.get_user(doc_id).await?
            && same_password(&record.password, password)
        {
            return Ok(UserProfile::from_record(doc_id, &record, super_admins));
        }
    }

    for candidate in &candidates {
        let found = store.find_users_by_email(candidate).await?;
        if let Some((doc_id, record)) = found.iter().find(|(_, r)| same_password(&r.password, password)) {
            return Ok(UserProfile::from_record(doc_id, record, super_admins));
        }
    }

    let all = store.list_users().await?;
    let hit = all.iter().find(|(doc_id, r)| {
        let stored = if r.email.trim().is_empty() { doc_id.as_str() } else { r.email.as_str() };
        normalize_email(stored) == normalized && same_password(&r.password, password)
    });
    match hit {
        Some((doc_id, record)) => Ok(UserProfile::from_record(doc_id, record, super_admins)),
        None => {
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            tracing::info!(email = %normalized, "login rejected");
            Err(AuthError::InvalidCredentials)
        }
    }
}

fn validate_role(role: &str) -> Result<(), ValidationError> {
    if role.trim().is_empty() {
        return Err(ValidationError::new("required")
            .with_message("Por favor, selecione uma Função para o utilizador.".into()));
    }
    if Role::from_known(role).is_none() {
        return Err(ValidationError::new("role").with_message(
            "Nesta tela, só é permitido cadastrar Corretor, Consultora, Admin ou Master.".into(),
        ));
    }
    Ok(())
}

fn validate_password_strength(password: &str) -> Result<(), ValidationError> {
    let weak = |msg: &'static str| Err(ValidationError::new("password").with_message(msg.into()));
    let is_symbol = |c: char| !c.is_ascii_alphanumeric();
    if password.chars().count() < 8 {
        return weak("A senha precisa ter no mínimo 8 caracteres.");
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return weak("A senha precisa ter uma letra Maiúscula.");
    }
    if !password.chars().any(is_symbol) {
        return weak("A senha precisa ter um Símbolo (!@#$).");
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return weak("A senha precisa ter um Número.");
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        return weak("Senha fraca. Use letras, números e símbolos.");
    }
    Ok(())
}

fn validate_broker_phone(user: &NewUser) -> Result<(), ValidationError> {
    if Role::from_known(&user.role) == Some(Role::Broker) && normalize_phone(&user.phone).len() < 10 {
        return Err(ValidationError::new("phone")
            .with_message("Por favor, informe um telefone válido para o Corretor.".into()));
    }
    Ok(())
}

/// The user-admin registration form.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[validate(schema(function = "validate_broker_phone"))]
pub struct NewUser {
    #[validate(regex(path = *EMAIL_PATTERN, message = "E-mail inválido. Verifique o formato."))]
    pub email: String,
    #[validate(custom(function = "validate_password_strength"))]
    pub password: String,
    #[validate(length(min = 3, message = "O nome deve ter pelo menos 3 letras."))]
    pub name: String,
    #[validate(custom(function = "validate_role"))]
    pub role: String,
    #[serde(default)]
    pub phone: String,
}

impl NewUser {
    fn trimmed(&self) -> Self {
        Self {
            email: self.email.trim().to_string(),
            password: self.password.trim().to_string(),
            name: self.name.trim().to_string(),
            role: self.role.trim().to_lowercase(),
            phone: self.phone.trim().to_string(),
        }
    }
}

/// The one message shown for a rejected form, in the order the form is
/// checked: role, broker phone, email, password, name.
fn first_message(errors: &ValidationErrors) -> String {
    let fields = errors.field_errors();
    ["role", "__all__", "email", "password", "name"]
        .iter()
        .filter_map(|key| fields.get(*key))
        .flat_map(|list| list.iter())
        .find_map(|e| e.message.as_ref().map(|m| m.to_string()))
        .unwrap_or_else(|| "Dados inválidos.".to_string())
}

/// Trim and check a registration. Returns the cleaned form.
pub fn validate_new_user(user: &NewUser) -> Result<NewUser, AuthError> {
    let user = user.trimmed();
    user.validate().map_err(|e| AuthError::Validation(first_message(&e)))?;
    Ok(user)
}

/// Register a user, keyed by email. Masters only.
pub async fn register_user(store: &dyn Store, actor: &UserProfile, user: &NewUser) -> Result<UserRecord, AuthError> {
    if actor.role != Role::Master {
        return Err(AuthError::Forbidden("Apenas usuários de TI (Master) podem cadastrar novos perfis."));
    }
    let user = validate_new_user(user)?;
    let record = UserRecord {
        email: user.email.clone(),
        name: user.name,
        phone: user.phone,
        role: Role::canonicalize(&user.role).as_str().to_string(),
        password: user.password,
    };
    store.put_user(&user.email, record.clone()).await?;
    tracing::info!(email = %record.email, role = %record.role, "user registered");
    Ok(record)
}

/// Save an edited user. A changed email moves the document to the new key.
pub async fn update_user(
    store: &dyn Store,
    actor: &UserProfile,
    doc_id: &str,
    record: UserRecord,
) -> Result<(), AuthError> {
    if !actor.role.has_admin_rights() {
        return Err(AuthError::Forbidden("Acesso restrito a administradores."));
    }
    let record = UserRecord {
        email: record.email.trim().to_string(),
        name: record.name.trim().to_string(),
        phone: record.phone.trim().to_string(),
        password: record.password.trim().to_string(),
        role: record.role,
    };
    if !record.email.is_empty() && record.email != doc_id {
        let new_id = record.email.clone();
        store.rekey_user(doc_id, &new_id, record).await?;
        tracing::info!(from = %doc_id, to = %new_id, "user rekeyed");
    } else {
        store.put_user(doc_id, record).await?;
    }
    Ok(())
}

pub fn is_protected(doc_id: &str, super_admins: &SuperAdmins) -> bool {
    let id = normalize_email(doc_id);
    PROTECTED_ACCOUNTS.contains(&id.as_str()) || super_admins.contains(&id)
}

pub async fn remove_user(
    store: &dyn Store,
    actor: &UserProfile,
    doc_id: &str,
    super_admins: &SuperAdmins,
) -> Result<(), AuthError> {
    if !actor.role.has_admin_rights() {
        return Err(AuthError::Forbidden("Acesso restrito a administradores."));
    }
    if is_protected(doc_id, super_admins) {
        return Err(AuthError::Protected);
    }
    store.remove_user(doc_id).await?;
    tracing::info!(email = %doc_id, "user removed");
    Ok(())
}
