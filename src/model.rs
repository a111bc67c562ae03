use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Minutes since midnight, the only time-of-day unit.
pub type Minutes = u32;

/// Time of day as written on the board (`HH:MM`).
///
/// `24:00` is accepted so the last slot of the day can end at midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClockTime(Minutes);

impl ClockTime {
    pub const MIDNIGHT: ClockTime = ClockTime(0);
    pub const END_OF_DAY: ClockTime = ClockTime(24 * 60);

    pub fn from_hm(hour: u32, minute: u32) -> Option<Self> {
        if minute >= 60 || hour > 24 || (hour == 24 && minute != 0) {
            return None;
        }
        Some(Self(hour * 60 + minute))
    }

    pub fn minutes(self) -> Minutes {
        self.0
    }

    pub fn hour(self) -> u32 {
        self.0 / 60
    }

    pub fn minute(self) -> u32 {
        self.0 % 60
    }

    /// Wall-clock time; `24:00` saturates to the last second of the day.
    pub fn to_naive_time(self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour(), self.minute(), 0)
            .unwrap_or(NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN))
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseClockTimeError(pub String);

impl fmt::Display for ParseClockTimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid time of day: {:?}", self.0)
    }
}

impl std::error::Error for ParseClockTimeError {}

impl FromStr for ClockTime {
    type Err = ParseClockTimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseClockTimeError(s.to_string());
        let (h, m) = s.trim().split_once(':').ok_or_else(err)?;
        let hour: u32 = h.parse().map_err(|_| err())?;
        // Tolerate a trailing seconds component ("09:30:00").
        let m = m.split(':').next().unwrap_or(m);
        let minute: u32 = m.parse().map_err(|_| err())?;
        ClockTime::from_hm(hour, minute).ok_or_else(err)
    }
}

impl TryFrom<String> for ClockTime {
    type Error = ParseClockTimeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ClockTime> for String {
    fn from(value: ClockTime) -> Self {
        value.to_string()
    }
}

/// Half-open interval `[start, end)` in minutes of a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Minutes,
    pub end: Minutes,
}

impl Span {
    pub fn new(start: Minutes, end: Minutes) -> Self {
        Self { start, end }
    }

    pub fn between(start: ClockTime, end: ClockTime) -> Self {
        Self::new(start.minutes(), end.minutes())
    }

    pub fn duration(&self) -> Minutes {
        self.end.saturating_sub(self.start)
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Roles ────────────────────────────────────────────────────────

/// Closed set of roles. Stored role strings are free text and always go
/// through [`Role::canonicalize`] before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Broker,
    Consultant,
    Admin,
    Master,
}

impl Role {
    /// Recognized role strings only. Case- and whitespace-insensitive,
    /// Portuguese synonyms included.
    pub fn from_known(raw: &str) -> Option<Role> {
        match raw.trim().to_lowercase().as_str() {
            "broker" | "corretor" | "corretora" => Some(Role::Broker),
            "consultant" | "consultora" | "consultor" => Some(Role::Consultant),
            "admin" | "administrador" | "administradora" => Some(Role::Admin),
            "master" | "ti" => Some(Role::Master),
            _ => None,
        }
    }

    /// Anything unrecognized falls back to the least privileged role.
    pub fn canonicalize(raw: &str) -> Role {
        Role::from_known(raw).unwrap_or(Role::Broker)
    }

    /// Admin and master share the administrative capabilities.
    pub fn has_admin_rights(self) -> bool {
        matches!(self, Role::Admin | Role::Master)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Broker => "broker",
            Role::Consultant => "consultant",
            Role::Admin => "admin",
            Role::Master => "master",
        }
    }

    /// Display label used across the board.
    pub fn label(self) -> &'static str {
        match self {
            Role::Broker => "Corretor",
            Role::Consultant => "Consultora",
            Role::Admin => "Administrador",
            Role::Master => "Master",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Normalization helpers ────────────────────────────────────────

/// Stable identity key shared by brokers, consultants and users.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Keep digits only.
pub fn normalize_phone(phone: &str) -> String {
    phone.chars().filter(char::is_ascii_digit).collect()
}

/// Emails that are always promoted to master, whatever their stored role.
#[derive(Debug, Clone, Default)]
pub struct SuperAdmins(HashSet<String>);

impl SuperAdmins {
    pub fn new<I, S>(emails: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            emails
                .into_iter()
                .map(|e| normalize_email(e.as_ref()))
                .filter(|e| !e.is_empty())
                .collect(),
        )
    }

    pub fn contains(&self, email: &str) -> bool {
        self.0.contains(&normalize_email(email))
    }
}

// ── Users ────────────────────────────────────────────────────────

/// A document of the users collection, as stored.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub role: String,
    #[serde(default, alias = "senha")]
    pub password: String,
}

/// A logged-in or listed user after role canonicalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub name: String,
    pub phone: String,
    pub role: Role,
}

impl UserProfile {
    /// Build a profile from a stored record. The super-admin override is
    /// applied here and nowhere else.
    pub fn from_record(doc_id: &str, record: &UserRecord, super_admins: &SuperAdmins) -> Self {
        let email = if record.email.trim().is_empty() {
            normalize_email(doc_id)
        } else {
            normalize_email(&record.email)
        };
        let role = if super_admins.contains(&email) {
            Role::Master
        } else {
            Role::canonicalize(&record.role)
        };
        Self {
            id: doc_id.to_string(),
            name: if record.name.trim().is_empty() { email.clone() } else { record.name.clone() },
            email,
            phone: record.phone.clone(),
            role,
        }
    }
}

/// A broker as seen by the board. `id` is the normalized email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Broker {
    pub id: String,
    pub doc_id: String,
    pub name: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consultant {
    pub email: String,
    pub name: String,
    pub phone: String,
}

// ── Appointments ─────────────────────────────────────────────────

/// Outcome of a visit. `Alugada` only exists in legacy documents and is
/// never written by the pipeline. Unrecognized stored values read as
/// `Agendada`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Status {
    #[default]
    Agendada,
    Realizada,
    Cancelada,
    Alugada,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Agendada => "agendada",
            Status::Realizada => "realizada",
            Status::Cancelada => "cancelada",
            Status::Alugada => "alugada",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "agendada" => Ok(Status::Agendada),
            "realizada" => Ok(Status::Realizada),
            "cancelada" => Ok(Status::Cancelada),
            "alugada" | "alugado" => Ok(Status::Alugada),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

impl From<String> for Status {
    fn from(value: String) -> Self {
        value.parse().unwrap_or_else(|err: String| {
            tracing::warn!(%err, "reading stored status as agendada");
            Status::Agendada
        })
    }
}

impl From<Status> for String {
    fn from(value: Status) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyRef {
    #[serde(default)]
    pub reference: String,
    #[serde(default)]
    pub property_address: String,
}

impl PropertyRef {
    pub fn is_blank(&self) -> bool {
        self.reference.trim().is_empty() && self.property_address.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub added_by: String,
    #[serde(default)]
    pub added_by_name: String,
    #[serde(default)]
    pub added_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub date: String,
    pub user: String,
    pub action: String,
}

/// A calendar entry: a property visit or an informational event.
///
/// Field names are the stored document's, so existing documents round-trip
/// unchanged. Legacy single-property and single-client fields are still read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    #[serde(default)]
    pub id: Option<String>,
    pub date: NaiveDate,
    pub start_time: ClockTime,
    pub end_time: ClockTime,
    #[serde(default)]
    pub is_event: bool,
    #[serde(default)]
    pub broker_id: String,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub created_by_name: String,
    #[serde(default)]
    pub linked_consultant_email: String,
    #[serde(default)]
    pub linked_consultant_name: String,
    #[serde(default)]
    pub properties: Vec<PropertyRef>,
    #[serde(default)]
    pub reference: String,
    #[serde(default)]
    pub property_address: String,
    #[serde(default)]
    pub clients: Vec<ClientEntry>,
    #[serde(default)]
    pub client_name: String,
    #[serde(default)]
    pub client_phone: String,
    #[serde(default)]
    pub event_comment: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub status_observation: String,
    #[serde(default, alias = "rented", alias = "alugado")]
    pub is_rented: bool,
    #[serde(default)]
    pub shared_with: Vec<String>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_by: String,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_by: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
}

impl Appointment {
    /// A bare draft on the given slot. Everything else is empty/default.
    pub fn draft(broker_id: &str, date: NaiveDate, start: ClockTime, end: ClockTime) -> Self {
        Self {
            id: None,
            date,
            start_time: start,
            end_time: end,
            is_event: false,
            broker_id: broker_id.to_string(),
            created_by: String::new(),
            created_by_name: String::new(),
            linked_consultant_email: String::new(),
            linked_consultant_name: String::new(),
            properties: Vec::new(),
            reference: String::new(),
            property_address: String::new(),
            clients: Vec::new(),
            client_name: String::new(),
            client_phone: String::new(),
            event_comment: String::new(),
            status: Status::Agendada,
            status_observation: String::new(),
            is_rented: false,
            shared_with: Vec::new(),
            history: Vec::new(),
            created_at: None,
            updated_at: None,
            updated_by: String::new(),
            is_edited: false,
            edited_at: None,
            deleted_at: None,
            deleted_by: None,
            group_id: None,
        }
    }

    pub fn span(&self) -> Span {
        Span::between(self.start_time, self.end_time)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_creator(&self, email: &str) -> bool {
        !self.created_by.is_empty() && normalize_email(&self.created_by) == normalize_email(email)
    }

    pub fn is_shared_with(&self, email: &str) -> bool {
        let email = normalize_email(email);
        self.shared_with.iter().any(|e| normalize_email(e) == email)
    }

    /// Properties with blank rows dropped, falling back to the legacy
    /// single-property fields.
    pub fn property_list(&self) -> Vec<PropertyRef> {
        let list: Vec<PropertyRef> = self
            .properties
            .iter()
            .map(|p| PropertyRef {
                reference: p.reference.trim().to_string(),
                property_address: p.property_address.trim().to_string(),
            })
            .filter(|p| !p.is_blank())
            .collect();
        if !self.properties.is_empty() {
            return list;
        }
        let legacy = PropertyRef {
            reference: self.reference.trim().to_string(),
            property_address: self.property_address.trim().to_string(),
        };
        if legacy.is_blank() { Vec::new() } else { vec![legacy] }
    }

    /// Clients, falling back to the legacy single-client fields.
    pub fn client_list(&self) -> Vec<ClientEntry> {
        if !self.clients.is_empty() {
            return self.clients.clone();
        }
        if self.client_name.is_empty() {
            return Vec::new();
        }
        vec![ClientEntry {
            name: self.client_name.clone(),
            phone: self.client_phone.clone(),
            added_by: self.created_by.clone(),
            ..ClientEntry::default()
        }]
    }

    /// `isRented` only means something on a completed visit.
    pub fn normalize_outcome(&mut self) {
        if self.status != Status::Realizada {
            self.is_rented = false;
        }
    }

    /// Both encodings of a rented outcome: the current
    /// `realizada + isRented` and the legacy `alugada` status.
    pub fn counts_as_rented(&self) -> bool {
        match self.status {
            Status::Realizada => self.is_rented,
            Status::Alugada => true,
            _ => false,
        }
    }
}

/// Store-level change records. This is the log record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    AppointmentPut { appointment: Appointment },
    AppointmentRemoved { id: String },
    UserPut { doc_id: String, user: UserRecord },
    UserRemoved { doc_id: String },
}
