//! People registries derived from the users collection.

use crate::model::*;

/// Brokers, consultants and users as the board sees them. Rebuilt wholesale
/// from each users snapshot.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    brokers: Vec<Broker>,
    consultants: Vec<Consultant>,
    users: Vec<UserProfile>,
}

impl Directory {
    /// Materialize the registries. Brokers are users whose role canonicalizes
    /// to broker; consultants are consultant or admin users, minus the
    /// super-admin accounts, which stay out of every picker.
    pub fn from_users(records: &[(String, UserRecord)], super_admins: &SuperAdmins) -> Self {
        let users: Vec<UserProfile> = records
            .iter()
            .map(|(doc_id, record)| UserProfile::from_record(doc_id, record, super_admins))
            .filter(|u| !u.email.is_empty())
            .collect();

        let mut brokers: Vec<Broker> = users
            .iter()
            .filter(|u| u.role == Role::Broker)
            .map(|u| Broker {
                id: u.email.clone(),
                doc_id: u.id.clone(),
                name: u.name.clone(),
                phone: u.phone.clone(),
            })
            .collect();
        brokers.sort_by(|a, b| a.name.cmp(&b.name));

        let mut consultants: Vec<Consultant> = users
            .iter()
            .filter(|u| matches!(u.role, Role::Consultant | Role::Admin))
            .filter(|u| !super_admins.contains(&u.email))
            .map(|u| Consultant {
                email: u.email.clone(),
                name: u.name.clone(),
                phone: u.phone.clone(),
            })
            .collect();
        consultants.sort_by(|a, b| a.name.cmp(&b.name));

        Self { brokers, consultants, users }
    }

    pub fn brokers(&self) -> &[Broker] {
        &self.brokers
    }

    pub fn consultants(&self) -> &[Consultant] {
        &self.consultants
    }

    pub fn users(&self) -> &[UserProfile] {
        &self.users
    }

    pub fn broker(&self, id: &str) -> Option<&Broker> {
        let id = normalize_email(id);
        self.brokers.iter().find(|b| b.id == id || normalize_email(&b.doc_id) == id)
    }

    /// Broker by id first, then by display name (case-insensitive).
    pub fn broker_by_id_or_name(&self, id: &str, name: &str) -> Option<&Broker> {
        let name = name.trim().to_lowercase();
        self.broker(id).or_else(|| {
            if name.is_empty() {
                return None;
            }
            self.brokers.iter().find(|b| b.name.trim().to_lowercase() == name)
        })
    }

    pub fn consultant(&self, email: &str) -> Option<&Consultant> {
        let email = normalize_email(email);
        self.consultants.iter().find(|c| c.email == email)
    }

    /// Display name for an id or email: broker registry, then consultants,
    /// then all users, then the raw value.
    pub fn resolve_name(&self, id_or_email: &str) -> String {
        if id_or_email.is_empty() {
            return String::new();
        }
        let key = normalize_email(id_or_email);
        let named = |name: &str| (!name.is_empty()).then(|| name.to_string());

        self.broker(&key)
            .and_then(|b| named(&b.name))
            .or_else(|| self.consultant(&key).and_then(|c| named(&c.name)))
            .or_else(|| {
                self.users
                    .iter()
                    .find(|u| u.email == key || u.id == id_or_email)
                    .and_then(|u| named(&u.name))
            })
            .unwrap_or_else(|| id_or_email.to_string())
    }

    /// Consultant display name, falling back to the capitalized local part
    /// of the email ("ana.souza@x" → "Ana.souza").
    pub fn consultant_name(&self, email: &str) -> String {
        if email.is_empty() {
            return String::new();
        }
        if let Some(c) = self.consultant(email) {
            return c.name.clone();
        }
        let local = email.split('@').next().unwrap_or_default();
        let mut chars = local.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }
}
