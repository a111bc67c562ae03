use super::*;
use super::recurrence::expand_checked;
use crate::clock::ManualClock;
use crate::directory::Directory;
use crate::limits::QUERY_CAP;
use crate::model::*;
use crate::state::LiveFeed;
use crate::store::{DateWindow, DocumentStore, StoreError, Subscription, WriteOp};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDateTime};

fn date(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

fn t(s: &str) -> ClockTime {
    s.parse().unwrap()
}

fn at(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .unwrap()
}

fn profile(email: &str, name: &str, role: Role) -> UserProfile {
    UserProfile {
        id: email.into(),
        email: email.into(),
        name: name.into(),
        phone: String::new(),
        role,
    }
}

fn ana() -> UserProfile {
    profile("ana@nunes.com", "Ana", Role::Consultant)
}

fn bia() -> UserProfile {
    profile("bia@nunes.com", "Bia", Role::Consultant)
}

fn caio() -> UserProfile {
    profile("caio@nunes.com", "Caio", Role::Consultant)
}

fn adm() -> UserProfile {
    profile("adm@nunes.com", "Adm", Role::Admin)
}

fn master() -> UserProfile {
    profile("ti@nunes.com", "TI", Role::Master)
}

fn supers() -> SuperAdmins {
    SuperAdmins::new(["master@nunes.com.br"])
}

/// Visit on the board as it is laid out in memory, for the pure checks.
fn appt(id: &str, broker: &str, day: &str, start: &str, end: &str) -> Appointment {
    let mut a = Appointment::draft(broker, date(day), t(start), t(end));
    a.id = Some(id.into());
    a.created_by = "ana@nunes.com".into();
    a
}

fn visit_form(broker: &str, day: &str, start: &str, end: &str) -> AppointmentForm {
    let mut form = AppointmentForm::new(broker, date(day), t(start), t(end));
    form.properties = vec![PropertyRef { reference: "AP-12".into(), property_address: "Rua A, 10".into() }];
    form.clients = vec![ClientEntry { name: "João".into(), phone: "11999990000".into(), ..Default::default() }];
    form
}

// ── Store double ─────────────────────────────────────────

/// Wraps a [`DocumentStore`], counting commits and failing on demand.
struct FlakyStore {
    inner: Arc<DocumentStore>,
    commits: AtomicUsize,
    failing: AtomicBool,
}

impl FlakyStore {
    fn new(inner: Arc<DocumentStore>) -> Self {
        Self {
            inner,
            commits: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    fn fail(&self, on: bool) {
        self.failing.store(on, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection reset".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn get(&self, id: &str) -> Result<Option<Appointment>, StoreError> {
        self.check()?;
        self.inner.get(id).await
    }

    async fn query_range(&self, window: DateWindow) -> Result<Vec<Appointment>, StoreError> {
        self.check()?;
        self.inner.query_range(window).await
    }

    async fn query_all(&self, cap: usize) -> Result<Vec<Appointment>, StoreError> {
        self.check()?;
        self.inner.query_all(cap).await
    }

    async fn commit(&self, ops: Vec<WriteOp>) -> Result<Vec<String>, StoreError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.commit(ops).await
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.remove(id).await
    }

    fn subscribe(self: Arc<Self>, window: DateWindow) -> Subscription<Vec<Appointment>> {
        self.inner.clone().subscribe(window)
    }

    async fn get_user(&self, doc_id: &str) -> Result<Option<UserRecord>, StoreError> {
        self.inner.get_user(doc_id).await
    }

    async fn find_users_by_email(&self, email: &str) -> Result<Vec<(String, UserRecord)>, StoreError> {
        self.inner.find_users_by_email(email).await
    }

    async fn list_users(&self) -> Result<Vec<(String, UserRecord)>, StoreError> {
        self.inner.list_users().await
    }

    async fn put_user(&self, doc_id: &str, user: UserRecord) -> Result<(), StoreError> {
        self.inner.put_user(doc_id, user).await
    }

    async fn rekey_user(&self, old_doc_id: &str, new_doc_id: &str, user: UserRecord) -> Result<(), StoreError> {
        self.inner.rekey_user(old_doc_id, new_doc_id, user).await
    }

    async fn remove_user(&self, doc_id: &str) -> Result<(), StoreError> {
        self.inner.remove_user(doc_id).await
    }

    fn subscribe_users(self: Arc<Self>) -> Subscription<Vec<(String, UserRecord)>> {
        self.inner.clone().subscribe_users()
    }
}

// ── Harness ──────────────────────────────────────────────

struct Harness {
    store: Arc<FlakyStore>,
    state: Arc<AppState>,
    clock: Arc<ManualClock>,
    scheduler: Scheduler,
    _feed: LiveFeed,
}

fn record(email: &str, name: &str, role: &str, phone: &str) -> UserRecord {
    UserRecord {
        email: email.into(),
        name: name.into(),
        phone: phone.into(),
        role: role.into(),
        password: "Segura#2024".into(),
    }
}

/// Store seeded with the office's people, a live feed centred on Monday
/// 2024-01-08 and the clock on the Friday before, 10:00.
async fn harness() -> Harness {
    let inner = Arc::new(DocumentStore::in_memory());
    for user in [
        record("lima@nunes.com", "Lima", "corretor", "11988887777"),
        record("braga@nunes.com", "Braga", "corretor", "11977776666"),
        record("ana@nunes.com", "Ana", "consultora", ""),
        record("bia@nunes.com", "Bia", "consultora", ""),
        record("caio@nunes.com", "Caio", "consultora", ""),
        record("adm@nunes.com", "Adm", "admin", ""),
        record("ti@nunes.com", "TI", "master", ""),
    ] {
        inner.put_user(&user.email.clone(), user).await.unwrap();
    }

    let store = Arc::new(FlakyStore::new(inner));
    let state = Arc::new(AppState::new());
    let clock = Arc::new(ManualClock::new(at("2024-01-05 10:00")));
    let mut feed = LiveFeed::new(store.clone(), state.clone(), adm(), supers());
    feed.watch_users();
    feed.recenter(date("2024-01-08"));
    let scheduler = Scheduler::new(store.clone(), state.clone(), clock.clone(), supers());

    let h = Harness {
        store,
        state,
        clock,
        scheduler,
        _feed: feed,
    };
    for _ in 0..200 {
        if h.state.directory().await.brokers().len() == 2 {
            return h;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("directory never loaded");
}

impl Harness {
    /// Wait until the cache holds exactly `rows` appointments.
    async fn settle(&self, rows: usize) {
        for _ in 0..200 {
            if self.state.appointments().await.len() == rows {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("cache never reached {rows} rows");
    }

    async fn stored(&self, id: &str) -> Appointment {
        self.store.get(id).await.unwrap().unwrap()
    }

    async fn create(&self, actor: &UserProfile, form: AppointmentForm) -> String {
        let outcome = self.scheduler.save_appointment(actor, form).await.unwrap();
        assert_eq!(outcome.action_type, ActionType::Create);
        outcome.appointment.id.unwrap()
    }

    /// Stored visits, excluding events and soft-deleted rows, by date and start.
    async fn live_visits(&self) -> Vec<Appointment> {
        let mut visits: Vec<Appointment> = self
            .store
            .query_all(QUERY_CAP)
            .await
            .unwrap()
            .into_iter()
            .filter(|a| !a.is_event && !a.is_deleted())
            .collect();
        visits.sort_by_key(|a| (a.date, a.start_time));
        visits
    }

    /// A scheduler over the same store whose cache never fills, so every
    /// conflict has to be caught by the store itself.
    fn cold_scheduler(&self) -> Scheduler {
        Scheduler::new(self.store.clone(), Arc::new(AppState::new()), self.clock.clone(), supers())
    }
}

// ── Overlap policy ───────────────────────────────────────

#[test]
fn overlap_is_strict() {
    let board = vec![appt("a", "lima@nunes.com", "2024-01-08", "09:00", "10:00")];
    let hit = check_overlap(&board, "lima@nunes.com", date("2024-01-08"), t("09:30"), t("10:30"), None, false);
    assert_eq!(hit.map(|c| c.id), Some(Some("a".to_string())));

    // Touching ends do not overlap.
    assert!(check_overlap(&board, "lima@nunes.com", date("2024-01-08"), t("10:00"), t("10:30"), None, false).is_none());
    assert!(check_overlap(&board, "lima@nunes.com", date("2024-01-08"), t("08:30"), t("09:00"), None, false).is_none());
    // Enclosing and enclosed both clash.
    assert!(check_overlap(&board, "lima@nunes.com", date("2024-01-08"), t("08:00"), t("11:00"), None, false).is_some());
    assert!(check_overlap(&board, "lima@nunes.com", date("2024-01-08"), t("09:10"), t("09:20"), None, false).is_some());
}

#[test]
fn overlap_scoped_to_broker_and_date() {
    let board = vec![appt("a", " Lima@Nunes.com ", "2024-01-08", "09:00", "10:00")];
    assert!(check_overlap(&board, "lima@nunes.com", date("2024-01-08"), t("09:00"), t("10:00"), None, false).is_some());
    assert!(check_overlap(&board, "braga@nunes.com", date("2024-01-08"), t("09:00"), t("10:00"), None, false).is_none());
    assert!(check_overlap(&board, "lima@nunes.com", date("2024-01-09"), t("09:00"), t("10:00"), None, false).is_none());
}

#[test]
fn overlap_skips_self_deleted_and_events() {
    let mut deleted = appt("d", "lima@nunes.com", "2024-01-08", "09:00", "10:00");
    deleted.deleted_at = Some(chrono::Utc::now());
    let mut event = appt("e", "lima@nunes.com", "2024-01-08", "09:00", "10:00");
    event.is_event = true;
    let own = appt("a", "lima@nunes.com", "2024-01-08", "09:00", "10:00");
    let board = vec![deleted, event, own];

    assert!(check_overlap(&board, "lima@nunes.com", date("2024-01-08"), t("09:00"), t("10:00"), Some("a"), false).is_none());
    assert!(check_overlap(&board, "lima@nunes.com", date("2024-01-08"), t("09:00"), t("10:00"), None, false).is_some());
    // An event is never blocked.
    assert!(check_overlap(&board, "lima@nunes.com", date("2024-01-08"), t("09:00"), t("10:00"), None, true).is_none());
}

#[test]
fn visual_clash_includes_events() {
    let visit = appt("a", "lima@nunes.com", "2024-01-08", "09:00", "10:00");
    let mut event = appt("e", "lima@nunes.com", "2024-01-08", "09:30", "10:30");
    event.is_event = true;
    assert!(visual_clash(&visit, &event));
    let later = appt("b", "lima@nunes.com", "2024-01-08", "10:00", "10:30");
    assert!(!visual_clash(&visit, &later));
}

// ── Lock policy ──────────────────────────────────────────

#[test]
fn time_lock_grace_window() {
    let day = date("2024-01-08");
    assert!(!is_time_locked(day, t("09:00"), at("2024-01-08 08:00")));
    assert!(!is_time_locked(day, t("09:00"), at("2024-01-08 09:01:00")));
    assert!(is_time_locked(day, t("09:00"), at("2024-01-08 09:01:01")));
    assert!(is_time_locked(day, t("09:00"), at("2024-01-09 00:00")));
}

#[test]
fn time_lock_never_releases() {
    let day = date("2024-01-08");
    let start = at("2024-01-08 07:00");
    let mut locked_once = false;
    for secs in (0..4 * 3600).step_by(7) {
        let now = start + chrono::Duration::seconds(secs);
        let locked = is_time_locked(day, t("09:00"), now);
        assert!(!(locked_once && !locked), "unlocked again at {now}");
        locked_once |= locked;
    }
    assert!(locked_once);
}

#[test]
fn creation_cutoffs() {
    let c = Role::Consultant;
    // Friday
    assert!(!check_date_lock(date("2024-01-05"), c, at("2024-01-05 17:59")));
    assert!(check_date_lock(date("2024-01-05"), c, at("2024-01-05 18:00")));
    // Saturday
    assert!(!check_date_lock(date("2024-01-06"), c, at("2024-01-06 12:29")));
    assert!(check_date_lock(date("2024-01-06"), c, at("2024-01-06 12:30")));
    // Sunday has no cutoff.
    assert!(!check_date_lock(date("2024-01-07"), c, at("2024-01-07 23:00")));
    // Past dates are always closed, future ones always open.
    assert!(check_date_lock(date("2024-01-04"), c, at("2024-01-05 08:00")));
    assert!(!check_date_lock(date("2024-01-08"), c, at("2024-01-05 23:00")));
    // Admins and masters bypass.
    assert!(!check_date_lock(date("2024-01-04"), Role::Admin, at("2024-01-05 08:00")));
    assert!(!check_date_lock(date("2024-01-05"), Role::Master, at("2024-01-05 19:00")));
    assert_eq!(lock_message(), LOCK_MESSAGE);
}

// ── Recurrence ───────────────────────────────────────────

#[test]
fn recurrence_mondays_and_wednesdays_of_january() {
    let dates = expand(date("2024-01-01"), date("2024-01-31"), &[1, 3]);
    let expected: Vec<NaiveDate> = [1, 3, 8, 10, 15, 17, 22, 24, 29, 31]
        .iter()
        .map(|d| NaiveDate::from_ymd_opt(2024, 1, *d).unwrap())
        .collect();
    assert_eq!(dates, expected);
}

#[test]
fn recurrence_edges() {
    // Sunday = 0, Saturday = 6, inclusive end.
    assert_eq!(
        expand(date("2024-01-06"), date("2024-01-07"), &[0, 6]),
        vec![date("2024-01-06"), date("2024-01-07")]
    );
    assert!(expand(date("2024-01-08"), date("2024-01-01"), &[1]).is_empty());

    let none = Recurrence { weekdays: vec![0], end_date: date("2024-01-06") };
    assert_eq!(expand_checked(date("2024-01-01"), &none), Err(ScheduleError::validation(NO_DATES_MESSAGE)));
    let too_long = Recurrence { weekdays: vec![1], end_date: date("2026-01-01") };
    assert!(matches!(expand_checked(date("2024-01-01"), &too_long), Err(ScheduleError::Validation(_))));
}

// ── Capabilities ─────────────────────────────────────────

fn shared_visit() -> Appointment {
    let mut a = appt("a", "lima@nunes.com", "2024-01-08", "09:00", "09:30");
    a.shared_with = vec!["bia@nunes.com".into()];
    a
}

#[test]
fn capability_matrix_before_the_slot() {
    let a = shared_visit();
    let now = at("2024-01-05 10:00");

    let owner = Capabilities::evaluate(&ana(), Some(&a), now, &supers());
    assert!(owner.is_core_editor && owner.can_delete && owner.can_interact_general && owner.can_manage_sharing);

    let shared = Capabilities::evaluate(&bia(), Some(&a), now, &supers());
    assert!(!shared.is_core_editor && shared.can_share && shared.can_save_any);
    assert!(shared.can_edit_status && shared.can_interact_general);
    assert!(!shared.can_delete && !shared.can_manage_sharing);

    let outsider = Capabilities::evaluate(&caio(), Some(&a), now, &supers());
    assert!(!outsider.can_save_any && !outsider.can_edit_status && !outsider.show_save_button);

    let admin = Capabilities::evaluate(&adm(), Some(&a), now, &supers());
    assert!(admin.is_core_editor && !admin.is_creator && admin.can_delete);

    let draft = Capabilities::evaluate(&caio(), None, now, &supers());
    assert!(draft.is_creator && draft.can_save_any && !draft.is_locked);
}

#[test]
fn capability_matrix_after_the_slot() {
    let a = shared_visit();
    let now = at("2024-01-08 12:00");

    let owner = Capabilities::evaluate(&ana(), Some(&a), now, &supers());
    assert!(owner.is_locked && owner.can_edit_status && owner.show_save_button);
    assert!(!owner.can_interact_general && !owner.can_delete);

    let shared = Capabilities::evaluate(&bia(), Some(&a), now, &supers());
    assert!(!shared.can_edit_status && !shared.show_save_button);

    let row_by_bia = ClientEntry { name: "Maria".into(), added_by: "bia@nunes.com".into(), ..Default::default() };
    assert!(!shared.can_edit_client(&row_by_bia));
    let fresh = Capabilities::evaluate(&bia(), Some(&a), at("2024-01-05 10:00"), &supers());
    assert!(fresh.can_edit_client(&row_by_bia));
    let row_by_ana = ClientEntry { name: "João".into(), added_by: "ana@nunes.com".into(), ..Default::default() };
    assert!(!fresh.can_edit_client(&row_by_ana));

    // Masters and allow-listed accounts are never locked.
    let m = Capabilities::evaluate(&master(), Some(&a), now, &supers());
    assert!(!m.is_locked && m.can_delete);
    let listed = profile("master@nunes.com.br", "Master", Role::Consultant);
    assert!(!Capabilities::evaluate(&listed, Some(&a), now, &supers()).is_locked);
}

// ── Write pipeline: create ───────────────────────────────

#[tokio::test]
async fn create_stamps_owner_and_history() {
    let h = harness().await;
    let outcome = h
        .scheduler
        .save_appointment(&ana(), visit_form(" Lima@Nunes.com", "2024-01-08", "09:00", "09:30"))
        .await
        .unwrap();
    assert_eq!(outcome.message, SAVED_MESSAGE);
    let stored = h.stored(outcome.appointment.id.as_deref().unwrap()).await;

    assert_eq!(stored.broker_id, "lima@nunes.com");
    assert_eq!(stored.created_by, "ana@nunes.com");
    assert_eq!(stored.created_by_name, "Ana");
    assert_eq!(stored.linked_consultant_email, "ana@nunes.com");
    assert_eq!(stored.linked_consultant_name, "Ana");
    assert_eq!(stored.history.len(), 1);
    assert_eq!(stored.history[0].action, CREATION_ACTION);
    assert_eq!(stored.history[0].date, "05/01/2024, 10:00:00");
    assert_eq!(stored.clients[0].added_by, "ana@nunes.com");
    assert!(!stored.is_edited && stored.created_at.is_some());
    assert_eq!(stored.group_id, None);
}

#[tokio::test]
async fn brokers_are_read_only() {
    let h = harness().await;
    let lima = profile("lima@nunes.com", "Lima", Role::Broker);
    let err = h
        .scheduler
        .save_appointment(&lima, visit_form("lima@nunes.com", "2024-01-08", "09:00", "09:30"))
        .await
        .unwrap_err();
    assert_eq!(err, ScheduleError::validation(BROKER_READ_ONLY_MESSAGE));
    assert_eq!(h.store.commits(), 0);
}

#[tokio::test]
async fn creation_respects_date_lock() {
    let h = harness().await;
    let err = h
        .scheduler
        .save_appointment(&ana(), visit_form("lima@nunes.com", "2024-01-04", "09:00", "09:30"))
        .await
        .unwrap_err();
    assert_eq!(err, ScheduleError::validation(DATE_LOCKED_MESSAGE));

    h.clock.set(at("2024-01-05 18:00"));
    assert!(h
        .scheduler
        .save_appointment(&ana(), visit_form("lima@nunes.com", "2024-01-05", "19:00", "19:30"))
        .await
        .is_err());
    // Admin may still book today.
    h.create(&adm(), visit_form("lima@nunes.com", "2024-01-05", "19:00", "19:30")).await;
}

#[tokio::test]
async fn rejects_bad_range_and_too_many_properties() {
    let h = harness().await;
    let err = h
        .scheduler
        .save_appointment(&ana(), visit_form("lima@nunes.com", "2024-01-08", "10:00", "10:00"))
        .await
        .unwrap_err();
    assert_eq!(err, ScheduleError::validation(INVALID_RANGE_MESSAGE));

    let mut form = visit_form("lima@nunes.com", "2024-01-08", "10:00", "10:30");
    form.properties = (0..5)
        .map(|i| PropertyRef { reference: format!("AP-{i}"), property_address: String::new() })
        .collect();
    let err = h.scheduler.save_appointment(&ana(), form).await.unwrap_err();
    assert_eq!(err, ScheduleError::validation(TOO_MANY_PROPERTIES_MESSAGE));
    assert_eq!(h.store.commits(), 0);
}

#[tokio::test]
async fn outcome_flag_cleared_unless_completed() {
    let h = harness().await;
    let mut form = visit_form("lima@nunes.com", "2024-01-08", "09:00", "09:30");
    form.status = Status::Cancelada;
    form.is_rented = true;
    let id = h.create(&ana(), form).await;
    assert!(!h.stored(&id).await.is_rented);
}

// ── Write pipeline: overlap ──────────────────────────────

#[tokio::test]
async fn store_rejects_overlap_with_cold_cache() {
    let h = harness().await;
    let cold = h.cold_scheduler();
    cold.save_appointment(&ana(), visit_form("lima@nunes.com", "2024-01-08", "09:00", "10:00"))
        .await
        .unwrap();

    let err = cold
        .save_appointment(&bia(), visit_form("lima@nunes.com", "2024-01-08", "09:30", "10:30"))
        .await
        .unwrap_err();
    assert_eq!(err, ScheduleError::validation(CONFLICT_MESSAGE));
    // Reached the store, which refused it.
    assert_eq!(h.store.commits(), 2);
    assert_eq!(h.live_visits().await.len(), 1);
}

#[tokio::test]
async fn cache_rejects_overlap_before_writing() {
    let h = harness().await;
    h.create(&ana(), visit_form("lima@nunes.com", "2024-01-08", "09:00", "10:00")).await;
    h.settle(1).await;

    let hit = h
        .scheduler
        .check_overlap("lima@nunes.com", date("2024-01-08"), t("09:30"), t("10:30"), None, false)
        .await;
    assert!(hit.is_some());

    let err = h
        .scheduler
        .save_appointment(&bia(), visit_form("lima@nunes.com", "2024-01-08", "09:30", "10:30"))
        .await
        .unwrap_err();
    assert_eq!(err, ScheduleError::validation(CONFLICT_MESSAGE));
    assert_eq!(h.store.commits(), 1);

    h.create(&bia(), visit_form("lima@nunes.com", "2024-01-08", "10:00", "10:30")).await;
    h.create(&bia(), visit_form("braga@nunes.com", "2024-01-08", "09:30", "10:30")).await;
}

#[tokio::test]
async fn events_never_block_or_get_blocked() {
    let h = harness().await;
    let mut event = visit_form("lima@nunes.com", "2024-01-08", "09:00", "09:30");
    event.is_event = true;
    event.event_comment = "Reunião geral".into();

    h.create(&adm(), event.clone()).await;
    h.settle(1).await;
    h.create(&ana(), visit_form("lima@nunes.com", "2024-01-08", "09:00", "09:30")).await;
    h.settle(2).await;
    h.create(&adm(), event).await;
    assert_eq!(h.live_visits().await.len(), 1);
}

#[tokio::test]
async fn overlap_invariant_holds_after_mixed_writes() {
    let h = harness().await;
    let slots = [
        ("lima@nunes.com", "09:00", "10:00"),
        ("lima@nunes.com", "09:30", "10:30"),
        ("lima@nunes.com", "10:00", "11:00"),
        ("braga@nunes.com", "09:00", "12:00"),
        ("lima@nunes.com", "08:00", "09:30"),
        ("braga@nunes.com", "11:30", "12:30"),
        ("lima@nunes.com", "11:00", "11:30"),
    ];
    let mut ids = Vec::new();
    for (i, (broker, start, end)) in slots.iter().enumerate() {
        // Alternate between a warm and a cold cache.
        let result = if i % 2 == 0 {
            h.scheduler.save_appointment(&adm(), visit_form(broker, "2024-01-08", start, end)).await
        } else {
            h.cold_scheduler().save_appointment(&adm(), visit_form(broker, "2024-01-08", start, end)).await
        };
        if let Ok(outcome) = result {
            ids.push(outcome.appointment.id.unwrap());
        }
    }
    // Try to drag every survivor onto 09:15–09:45.
    for id in &ids {
        let mut form = AppointmentForm::from_appointment(&h.stored(id).await);
        form.start_time = t("09:15");
        form.end_time = t("09:45");
        let _ = h.cold_scheduler().save_appointment(&adm(), form).await;
    }

    let visits = h.live_visits().await;
    for a in &visits {
        for b in &visits {
            if a.id != b.id && a.broker_id == b.broker_id && a.date == b.date {
                assert!(!a.span().overlaps(&b.span()), "{:?} overlaps {:?}", a.id, b.id);
            }
        }
    }
    assert!(visits.len() >= 3);
}

// ── Write pipeline: update ───────────────────────────────

#[tokio::test]
async fn update_of_missing_record() {
    let h = harness().await;
    let mut form = visit_form("lima@nunes.com", "2024-01-08", "09:00", "09:30");
    form.id = Some("01HZZZZZZZZZZZZZZZZZZZZZZZ".into());
    let err = h.scheduler.save_appointment(&ana(), form).await.unwrap_err();
    assert_eq!(err, ScheduleError::NotFound(ORIGINAL_MISSING_MESSAGE.into()));
}

#[tokio::test]
async fn outsider_rejected_before_any_write() {
    let h = harness().await;
    let id = h.create(&ana(), visit_form("lima@nunes.com", "2024-01-08", "09:00", "09:30")).await;
    let before = h.store.commits();

    let mut form = AppointmentForm::from_appointment(&h.stored(&id).await);
    form.status_observation = "mudando".into();
    let err = h.scheduler.save_appointment(&caio(), form).await.unwrap_err();
    assert!(matches!(err, ScheduleError::Validation(_)));
    assert_eq!(err, ScheduleError::validation(NO_PERMISSION_MESSAGE));
    assert_eq!(h.store.commits(), before);
}

#[tokio::test]
async fn history_grows_only_on_real_changes() {
    let h = harness().await;
    let id = h.create(&ana(), visit_form("lima@nunes.com", "2024-01-08", "09:00", "09:30")).await;

    let edits: Vec<Box<dyn Fn(&mut AppointmentForm)>> = vec![
        Box::new(|f: &mut AppointmentForm| {
            f.start_time = t("10:00");
            f.end_time = t("10:30");
        }),
        Box::new(|_: &mut AppointmentForm| {}),
        Box::new(|f: &mut AppointmentForm| {
            f.status = Status::Cancelada;
            f.status_observation = "Cliente desistiu".into();
        }),
        Box::new(|_: &mut AppointmentForm| {}),
        Box::new(|f: &mut AppointmentForm| f.shared_with = vec!["bia@nunes.com".into()]),
    ];

    let mut seen: Vec<HistoryEntry> = h.stored(&id).await.history;
    let mut changed = 0;
    for (i, edit) in edits.iter().enumerate() {
        h.clock.advance(chrono::Duration::minutes(1));
        let mut form = AppointmentForm::from_appointment(&h.stored(&id).await);
        edit(&mut form);
        let outcome = h.scheduler.save_appointment(&ana(), form).await.unwrap();
        assert_eq!(outcome.action_type, ActionType::Update);

        let history = h.stored(&id).await.history;
        assert_eq!(&history[..seen.len()], &seen[..], "entry rewritten at edit {i}");
        if history.len() > seen.len() {
            changed += 1;
        }
        seen = history;
    }

    assert_eq!(changed, 3);
    assert_eq!(seen.len(), 1 + changed);
    assert_eq!(seen[1].action, "Início: de '09:00' para '10:00'; Fim: de '09:30' para '10:30'");
    assert_eq!(seen[1].user, "Ana");
    assert_eq!(
        seen[2].action,
        "Status: de 'agendada' para 'cancelada'; Obs. Status: de 'Vazio' para 'Cliente desistiu'"
    );
    assert_eq!(seen[3].action, "Partilhado com: de 'Ninguém' para 'Bia'");
    assert!(h.stored(&id).await.is_edited);
}

#[tokio::test]
async fn admin_reassigns_owner() {
    let h = harness().await;
    let id = h.create(&ana(), visit_form("lima@nunes.com", "2024-01-08", "09:00", "09:30")).await;

    let mut form = AppointmentForm::from_appointment(&h.stored(&id).await);
    form.admin_selected_owner = Some("Bia@Nunes.com".into());
    h.scheduler.save_appointment(&adm(), form.clone()).await.unwrap();

    let stored = h.stored(&id).await;
    assert_eq!(stored.created_by, "bia@nunes.com");
    assert_eq!(stored.created_by_name, "Bia");
    assert_eq!(stored.history.last().unwrap().action, "Responsável: de 'Ana' para 'Bia'");
    assert_eq!(stored.history.last().unwrap().user, "Adm");

    // Ignored for anyone else.
    let mut form = AppointmentForm::from_appointment(&stored);
    form.admin_selected_owner = Some("caio@nunes.com".into());
    h.scheduler.save_appointment(&bia(), form).await.unwrap();
    assert_eq!(h.stored(&id).await.created_by, "bia@nunes.com");
}

#[tokio::test]
async fn shared_user_limits() {
    let h = harness().await;
    let mut form = visit_form("lima@nunes.com", "2024-01-08", "09:00", "09:30");
    form.shared_with = vec!["bia@nunes.com".into()];
    let id = h.create(&ana(), form).await;

    // Outcome and own client rows are fine.
    let mut form = AppointmentForm::from_appointment(&h.stored(&id).await);
    form.status = Status::Realizada;
    form.clients.push(ClientEntry { name: "Maria".into(), ..Default::default() });
    h.scheduler.save_appointment(&bia(), form).await.unwrap();
    let stored = h.stored(&id).await;
    assert_eq!(stored.clients[1].added_by, "bia@nunes.com");
    assert_eq!(stored.updated_by, "bia@nunes.com");

    let mut form = AppointmentForm::from_appointment(&stored);
    form.shared_with.push("caio@nunes.com".into());
    let err = h.scheduler.save_appointment(&bia(), form).await.unwrap_err();
    assert_eq!(err, ScheduleError::validation(SHARING_RESTRICTED_MESSAGE));

    let mut form = AppointmentForm::from_appointment(&stored);
    form.clients.remove(0);
    let err = h.scheduler.save_appointment(&bia(), form).await.unwrap_err();
    assert_eq!(err, ScheduleError::validation(CLIENT_ROW_RESTRICTED_MESSAGE));

    let mut form = AppointmentForm::from_appointment(&stored);
    form.clients.remove(1);
    h.scheduler.save_appointment(&bia(), form).await.unwrap();
    assert_eq!(h.stored(&id).await.clients.len(), 1);
}

#[tokio::test]
async fn locked_record_takes_outcome_only() {
    let h = harness().await;
    let mut form = visit_form("lima@nunes.com", "2024-01-08", "09:00", "09:30");
    form.shared_with = vec!["bia@nunes.com".into()];
    let id = h.create(&ana(), form).await;
    h.clock.set(at("2024-01-08 11:00"));
    assert!(h.scheduler.is_time_locked(date("2024-01-08"), t("09:00")));

    let stored = h.stored(&id).await;
    let mut moved = AppointmentForm::from_appointment(&stored);
    moved.start_time = t("10:00");
    moved.end_time = t("10:30");
    let err = h.scheduler.save_appointment(&ana(), moved.clone()).await.unwrap_err();
    assert_eq!(err, ScheduleError::validation(LOCK_MESSAGE));

    let mut outcome = AppointmentForm::from_appointment(&stored);
    outcome.status = Status::Realizada;
    outcome.is_rented = true;
    let err = h.scheduler.save_appointment(&bia(), outcome.clone()).await.unwrap_err();
    assert_eq!(err, ScheduleError::validation(LOCK_MESSAGE));

    h.scheduler.save_appointment(&ana(), outcome).await.unwrap();
    let stored = h.stored(&id).await;
    assert!(stored.counts_as_rented());
    assert_eq!(stored.start_time, t("09:00"));

    // Masters are never locked out.
    h.scheduler.save_appointment(&master(), moved).await.unwrap();
    assert_eq!(h.stored(&id).await.start_time, t("10:00"));
}

// ── Recurrence through the pipeline ──────────────────────

fn recurring_form(start: &str, end: &str) -> AppointmentForm {
    let mut form = visit_form("lima@nunes.com", "2024-01-01", start, end);
    form.recurrence = Some(Recurrence { weekdays: vec![1, 3], end_date: date("2024-01-31") });
    form
}

#[tokio::test]
async fn admin_recurrence_creates_group() {
    let h = harness().await;
    let outcome = h.scheduler.save_appointment(&adm(), recurring_form("09:00", "09:30")).await.unwrap();
    assert_eq!(outcome.message, "10 agendamentos criados com recorrência!");
    assert_eq!(outcome.appointment.date, date("2024-01-01"));
    assert_eq!(h.store.commits(), 1);

    let visits = h.live_visits().await;
    assert_eq!(visits.len(), 10);
    let group = outcome.appointment.group_id.clone().unwrap();
    assert!(visits.iter().all(|v| v.group_id.as_deref() == Some(group.as_str())));
    assert!(visits.iter().all(|v| !v.is_edited && v.edited_at.is_none() && v.history.len() == 1));
    let days: Vec<u32> = visits.iter().map(|v| v.date.day()).collect();
    assert_eq!(days, vec![1, 3, 8, 10, 15, 17, 22, 24, 29, 31]);
}

#[tokio::test]
async fn recurrence_conflict_is_all_or_nothing() {
    let h = harness().await;
    h.create(&ana(), visit_form("lima@nunes.com", "2024-01-17", "09:00", "09:30")).await;
    h.settle(1).await;

    let err = h.scheduler.save_appointment(&adm(), recurring_form("09:00", "09:30")).await.unwrap_err();
    assert_eq!(err, ScheduleError::Validation(format!("{CONFLICT_MESSAGE} (17/01/2024)")));
    assert_eq!(h.live_visits().await.len(), 1);

    // Same outcome when only the store sees the clash.
    let err = h.cold_scheduler().save_appointment(&adm(), recurring_form("09:15", "09:45")).await.unwrap_err();
    assert_eq!(err, ScheduleError::validation(CONFLICT_MESSAGE));
    assert_eq!(h.live_visits().await.len(), 1);
}

#[tokio::test]
async fn recurrence_skips_clash_on_ungenerated_template_date() {
    let h = harness().await;
    // Tuesday; the rule below only generates Mondays and Wednesdays.
    h.create(&adm(), visit_form("lima@nunes.com", "2024-01-02", "09:00", "09:30")).await;
    h.settle(1).await;

    let mut form = visit_form("lima@nunes.com", "2024-01-02", "09:00", "09:30");
    form.recurrence = Some(Recurrence { weekdays: vec![1, 3], end_date: date("2024-01-31") });
    let outcome = h.scheduler.save_appointment(&adm(), form).await.unwrap();
    assert_eq!(outcome.message, "9 agendamentos criados com recorrência!");
    assert_eq!(outcome.appointment.date, date("2024-01-03"));
    assert_eq!(h.live_visits().await.len(), 10);
}

#[tokio::test]
async fn recurrence_ignored_for_consultants() {
    let h = harness().await;
    h.clock.set(at("2023-12-29 10:00"));
    let outcome = h.scheduler.save_appointment(&ana(), recurring_form("09:00", "09:30")).await.unwrap();
    assert_eq!(outcome.message, SAVED_MESSAGE);
    assert_eq!(h.live_visits().await.len(), 1);
}

// ── Delete ───────────────────────────────────────────────

#[tokio::test]
async fn soft_delete_hides_and_blocks_updates() {
    let h = harness().await;
    let id = h.create(&ana(), visit_form("lima@nunes.com", "2024-01-08", "09:00", "09:30")).await;
    h.settle(1).await;

    let stored = h.stored(&id).await;
    assert!(h.scheduler.delete_appointment(&ana(), &stored).await.unwrap());
    let deleted = h.stored(&id).await;
    assert!(deleted.is_deleted());
    assert_eq!(deleted.deleted_by.as_deref(), Some("ana@nunes.com"));
    h.settle(0).await;

    // The freed slot can be booked again.
    h.create(&bia(), visit_form("lima@nunes.com", "2024-01-08", "09:00", "09:30")).await;

    let err = h
        .scheduler
        .save_appointment(&ana(), AppointmentForm::from_appointment(&stored))
        .await
        .unwrap_err();
    assert_eq!(err, ScheduleError::NotFound(ORIGINAL_MISSING_MESSAGE.into()));
}

#[tokio::test]
async fn delete_rules() {
    let h = harness().await;
    let mut form = visit_form("lima@nunes.com", "2024-01-08", "09:00", "09:30");
    form.shared_with = vec!["bia@nunes.com".into()];
    let id = h.create(&ana(), form).await;
    let stored = h.stored(&id).await;

    let err = h.scheduler.delete_appointment(&bia(), &stored).await.unwrap_err();
    assert_eq!(err, ScheduleError::validation(NO_DELETE_PERMISSION_MESSAGE));

    let draft = Appointment::draft("lima@nunes.com", date("2024-01-08"), t("11:00"), t("11:30"));
    assert!(matches!(h.scheduler.delete_appointment(&ana(), &draft).await, Err(ScheduleError::NotFound(_))));

    // Once the slot has passed nobody deletes it, masters included.
    h.clock.set(at("2024-01-08 09:02"));
    let err = h.scheduler.delete_appointment(&master(), &stored).await.unwrap_err();
    assert_eq!(err, ScheduleError::validation(LOCK_MESSAGE));
    assert!(!h.stored(&id).await.is_deleted());
}

#[tokio::test]
async fn delete_judges_the_stored_record_not_the_copy() {
    let h = harness().await;
    let id = h.create(&ana(), visit_form("lima@nunes.com", "2024-01-08", "09:00", "09:30")).await;
    let mut tampered = h.stored(&id).await;
    tampered.date = date("2024-01-20");
    tampered.created_by = "caio@nunes.com".into();

    let err = h.scheduler.delete_appointment(&caio(), &tampered).await.unwrap_err();
    assert_eq!(err, ScheduleError::validation(NO_DELETE_PERMISSION_MESSAGE));

    h.clock.set(at("2024-01-08 11:00"));
    let err = h.scheduler.delete_appointment(&caio(), &tampered).await.unwrap_err();
    assert_eq!(err, ScheduleError::validation(LOCK_MESSAGE));
    assert!(!h.stored(&id).await.is_deleted());

    // A record already soft-deleted is gone for a second delete.
    h.clock.set(at("2024-01-05 10:00"));
    assert!(h.scheduler.delete_appointment(&ana(), &tampered).await.unwrap());
    let err = h.scheduler.delete_appointment(&ana(), &tampered).await.unwrap_err();
    assert_eq!(err, ScheduleError::NotFound(ORIGINAL_MISSING_MESSAGE.into()));
}

#[tokio::test]
async fn legacy_broker_casing_leaves_no_history_line() {
    let h = harness().await;
    let mut legacy = Appointment::draft("Lima@Nunes.com", date("2024-01-08"), t("09:00"), t("09:30"));
    legacy.created_by = "ana@nunes.com".into();
    legacy.created_by_name = "Ana".into();
    let ids = h.store.commit(vec![WriteOp::Create(legacy)]).await.unwrap();
    h.settle(1).await;

    let mut form = AppointmentForm::from_appointment(&h.stored(&ids[0]).await);
    form.status_observation = "cliente confirmou".into();
    let outcome = h.scheduler.save_appointment(&ana(), form).await.unwrap();
    assert_eq!(outcome.appointment.broker_id, "lima@nunes.com");
    let last = outcome.appointment.history.last().unwrap();
    assert_eq!(last.action, "Obs. Status: de 'Vazio' para 'cliente confirmou'");
}

// ── Store failures ───────────────────────────────────────

#[tokio::test]
async fn store_failure_surfaces_as_communication_error() {
    let h = harness().await;
    let id = h.create(&ana(), visit_form("lima@nunes.com", "2024-01-08", "09:00", "09:30")).await;
    let stored = h.stored(&id).await;

    h.store.fail(true);
    let err = h
        .scheduler
        .save_appointment(&ana(), visit_form("braga@nunes.com", "2024-01-08", "09:00", "09:30"))
        .await
        .unwrap_err();
    assert_eq!(err, ScheduleError::StoreCommunication);
    assert_eq!(err.to_string(), "Falha ao se comunicar com o banco de dados.");

    let err = h
        .scheduler
        .save_appointment(&ana(), AppointmentForm::from_appointment(&stored))
        .await
        .unwrap_err();
    assert_eq!(err, ScheduleError::StoreCommunication);

    let err = h.scheduler.delete_appointment(&ana(), &stored).await.unwrap_err();
    assert_eq!(err, ScheduleError::StoreCommunication);

    assert_eq!(h.scheduler.sweep_expired(chrono::Duration::days(30)).await, SweepReport::default());

    h.store.fail(false);
    assert!(!h.stored(&id).await.is_deleted());
}

// ── Retention sweep ──────────────────────────────────────

#[tokio::test]
async fn sweep_removes_only_expired_soft_deletes() {
    let h = harness().await;
    let a = h.create(&ana(), visit_form("lima@nunes.com", "2024-03-01", "09:00", "09:30")).await;
    let b = h.create(&ana(), visit_form("lima@nunes.com", "2024-03-02", "09:00", "09:30")).await;
    let c = h.create(&ana(), visit_form("lima@nunes.com", "2024-03-03", "09:00", "09:30")).await;

    h.scheduler.delete_appointment(&ana(), &h.stored(&a).await).await.unwrap();
    h.clock.advance(chrono::Duration::days(20));
    h.scheduler.delete_appointment(&ana(), &h.stored(&b).await).await.unwrap();
    h.clock.advance(chrono::Duration::days(11));

    let report = h.scheduler.sweep_expired(chrono::Duration::days(30)).await;
    assert_eq!(report, SweepReport { removed: 1, failed: 0 });
    assert!(h.store.get(&a).await.unwrap().is_none());
    assert!(h.stored(&b).await.is_deleted());
    assert!(!h.stored(&c).await.is_deleted());

    let again = h.scheduler.sweep_expired(chrono::Duration::days(30)).await;
    assert_eq!(again.removed, 0);
}

// ── Registry lookups used by the pipeline ────────────────

#[tokio::test]
async fn directory_follows_users_collection() {
    let h = harness().await;
    let dir: Directory = h.state.directory().await;
    assert_eq!(dir.resolve_name("lima@nunes.com"), "Lima");
    assert!(dir.consultant("adm@nunes.com").is_some());

    h.store
        .put_user("neto@nunes.com", record("neto@nunes.com", "Neto", "corretor", "11955554444"))
        .await
        .unwrap();
    for _ in 0..200 {
        if h.state.directory().await.brokers().len() == 3 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("new broker never showed up");
}
