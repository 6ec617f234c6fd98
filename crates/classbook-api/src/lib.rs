use std::path::PathBuf;

use classbook_core::{
    apply_schedule_edit, calendar_window_start, demo_chat_feed, format_iso_date,
    parse_calendar_period, reconcile_calendar_window, reconcile_periods, window_dates,
    CalendarEntry, CalendarScope, ChatMessage, ClassRecord, ClassbookError, ScheduleEntry,
    WINDOW_SIZE,
};
use classbook_store_sqlite::SqliteStore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::Date;

mod identity;

pub use identity::{
    IdentityConfig, IdentityToolkitVerifier, IdentityVerifier, DEFAULT_IDENTITY_ENDPOINT,
};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("write failure: {0:#}")]
    WriteFailure(anyhow::Error),
    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl From<ClassbookError> for ApiError {
    fn from(err: ClassbookError) -> Self {
        match err {
            ClassbookError::Validation(message) => Self::Validation(message),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Calendar lookup parameters as they arrive from a form or query string.
///
/// `period` stays raw so that a non-numeric value can be rejected as a validation error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CalendarQuery {
    #[serde(rename = "class", default)]
    pub class_name: String,
    #[serde(default)]
    pub period: String,
    #[serde(default)]
    pub semester: String,
}

/// Body of a schedule edit: the class to hold in its period, for user `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassesEditRequest {
    pub classes: ClassRecord,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredCalendarEntry {
    pub entry_id: String,
    #[serde(flatten)]
    pub entry: CalendarEntry,
}

#[derive(Debug, Clone)]
pub struct ClassbookApi {
    db_path: PathBuf,
}

impl ClassbookApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> anyhow::Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// The five weekly periods of a user's schedule, with empty periods filled in.
    ///
    /// A user without a stored schedule gets five placeholders.
    ///
    /// # Errors
    /// Returns [`ApiError::NotFound`] when the schedule references a class that no
    /// longer exists, or [`ApiError::Store`] when reads fail.
    pub fn schedule_classes(&self, user_id: &str, semester: &str) -> ApiResult<Vec<ClassRecord>> {
        let store = self.open_store()?;
        let Some(schedule) = store.get_schedule(user_id, semester)? else {
            tracing::info!(user_id, semester, "no stored schedule");
            return Ok(reconcile_periods(&[], semester));
        };

        let resolved = store.get_classes(&schedule.class_keys)?;
        let mut classes = Vec::with_capacity(resolved.len());
        for (class_key, record) in schedule.class_keys.iter().zip(resolved) {
            let Some(record) = record else {
                return Err(ApiError::NotFound(format!(
                    "class {class_key} referenced by schedule {} does not exist",
                    schedule.key()
                )));
            };
            classes.push(record);
        }

        Ok(reconcile_periods(&classes, semester))
    }

    /// Classes offered in one period of one semester.
    ///
    /// # Errors
    /// Returns [`ApiError::Store`] when reads fail.
    pub fn class_list(&self, period: &str, semester: &str) -> ApiResult<Vec<ClassRecord>> {
        let store = self.open_store()?;
        Ok(store.query_classes(period, semester)?)
    }

    /// Homework for the calendar window around `today`, one entry per day.
    ///
    /// # Errors
    /// Returns [`ApiError::Validation`] when `period` is not numeric or the window
    /// around `today` leaves the supported date range, or [`ApiError::Store`] when
    /// reads fail.
    pub fn calendar(&self, query: &CalendarQuery, today: Date) -> ApiResult<Vec<CalendarEntry>> {
        let scope = CalendarScope {
            class_name: query.class_name.clone(),
            period: parse_calendar_period(&query.period)?,
            semester: query.semester.clone(),
        };

        let window_start = calendar_window_start(today)?;
        let first = format_iso_date(window_start);
        let last = window_dates(window_start, WINDOW_SIZE).pop().unwrap_or_else(|| first.clone());

        let store = self.open_store()?;
        let entries = store.query_calendar(&scope, &first, &last)?;
        Ok(reconcile_calendar_window(&entries, window_start, WINDOW_SIZE))
    }

    /// Add or overwrite one class offering.
    ///
    /// # Errors
    /// Returns [`ApiError::Validation`] for blank period/semester, or
    /// [`ApiError::WriteFailure`] when the write fails.
    pub fn add_class(&self, record: ClassRecord) -> ApiResult<ClassRecord> {
        record.validate()?;
        let mut store = self.open_store()?;
        store.put_class(&record).map_err(ApiError::WriteFailure)?;
        Ok(record)
    }

    /// Put `record` into the user's schedule for its semester.
    ///
    /// The read and the write happen in one store transaction, so concurrent
    /// assignments to the same schedule are applied one after the other.
    ///
    /// # Errors
    /// Returns [`ApiError::Validation`] for a blank user id or invalid record, or
    /// [`ApiError::WriteFailure`] when the schedule cannot be written.
    pub fn assign_class(&self, user_id: &str, record: &ClassRecord) -> ApiResult<ScheduleEntry> {
        if user_id.trim().is_empty() {
            return Err(ApiError::Validation("id MUST be provided".to_string()));
        }
        record.validate()?;

        let mut store = self.open_store()?;
        let schedule = store
            .update_schedule(user_id, &record.semester, |current| {
                apply_schedule_edit(current, user_id, record)
            })
            .map_err(ApiError::WriteFailure)?;
        tracing::info!(schedule = %schedule.key(), class_keys = ?schedule.class_keys, "schedule updated");
        Ok(schedule)
    }

    /// Post homework for one day.
    ///
    /// # Errors
    /// Returns [`ApiError::Validation`] for a malformed date, or
    /// [`ApiError::WriteFailure`] when the write fails.
    pub fn add_calendar_entry(&self, entry: CalendarEntry) -> ApiResult<StoredCalendarEntry> {
        entry.validate()?;
        let mut store = self.open_store()?;
        let entry_id = store.put_calendar_entry(&entry).map_err(ApiError::WriteFailure)?;
        Ok(StoredCalendarEntry { entry_id: entry_id.to_string(), entry })
    }

    /// Authenticated schedule edit: verify `token`, decode `body`, then assign the class.
    ///
    /// # Errors
    /// Returns [`ApiError::Unauthorized`] before touching the store when the token is
    /// rejected, [`ApiError::Validation`] for a malformed body, or any error of
    /// [`Self::assign_class`].
    pub fn edit_schedule(
        &self,
        verifier: &dyn IdentityVerifier,
        token: &str,
        body: &[u8],
    ) -> ApiResult<ScheduleEntry> {
        authorize(verifier, token)?;
        let request: ClassesEditRequest = decode_body(body)?;
        self.assign_class(&request.id, &request.classes)
    }

    /// Authenticated calendar edit: verify `token`, decode `body`, then store the entry.
    ///
    /// # Errors
    /// Returns [`ApiError::Unauthorized`] before touching the store when the token is
    /// rejected, [`ApiError::Validation`] for a malformed body, or any error of
    /// [`Self::add_calendar_entry`].
    pub fn edit_calendar(
        &self,
        verifier: &dyn IdentityVerifier,
        token: &str,
        body: &[u8],
    ) -> ApiResult<StoredCalendarEntry> {
        authorize(verifier, token)?;
        let entry: CalendarEntry = decode_body(body)?;
        self.add_calendar_entry(entry)
    }

    /// Check a token without performing any write.
    ///
    /// # Errors
    /// Returns [`ApiError::Unauthorized`] when the token is blank or rejected.
    pub fn verify_token(&self, verifier: &dyn IdentityVerifier, token: &str) -> ApiResult<()> {
        authorize(verifier, token)
    }

    #[must_use]
    pub fn chat_feed(&self) -> Vec<ChatMessage> {
        demo_chat_feed()
    }
}

/// Reject blank or unverifiable identity tokens.
///
/// # Errors
/// Returns [`ApiError::Unauthorized`] when the token is blank or the verifier rejects it.
pub fn authorize(verifier: &dyn IdentityVerifier, token: &str) -> ApiResult<()> {
    let token = token.trim();
    if token.is_empty() {
        return Err(ApiError::Unauthorized("identity token MUST be provided".to_string()));
    }
    if !verifier.verify(token) {
        tracing::warn!("identity token failed verification");
        return Err(ApiError::Unauthorized("identity token is not valid".to_string()));
    }
    Ok(())
}

fn decode_body<T: DeserializeOwned>(body: &[u8]) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|err| ApiError::Validation(format!("bad json: {err}")))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use time::macros::date;

    use super::*;

    #[derive(Debug, Default)]
    struct StaticVerifier {
        tokens: BTreeSet<String>,
        calls: AtomicUsize,
    }

    impl StaticVerifier {
        fn allowing(token: &str) -> Self {
            Self { tokens: BTreeSet::from([token.to_string()]), calls: AtomicUsize::new(0) }
        }
    }

    impl IdentityVerifier for StaticVerifier {
        fn verify(&self, token: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.tokens.contains(token)
        }
    }

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("classbook-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn migrated_store(db_path: &std::path::Path) -> anyhow::Result<SqliteStore> {
        let mut store = SqliteStore::open(db_path)?;
        store.migrate()?;
        Ok(store)
    }

    fn reject_inserts(db_path: &std::path::Path, table: &str) -> anyhow::Result<()> {
        migrated_store(db_path)?;
        let conn = rusqlite::Connection::open(db_path)?;
        conn.execute_batch(&format!(
            "CREATE TRIGGER reject_{table}_inserts BEFORE INSERT ON {table}
             BEGIN SELECT RAISE(ABORT, '{table} is read-only'); END;"
        ))?;
        Ok(())
    }

    fn class(period: &str, class_name: &str) -> ClassRecord {
        ClassRecord {
            period: period.to_string(),
            class_name: class_name.to_string(),
            classroom: "Room 511".to_string(),
            semester: "2017-2".to_string(),
        }
    }

    fn csp_query(period: &str) -> CalendarQuery {
        CalendarQuery {
            class_name: "CSP".to_string(),
            period: period.to_string(),
            semester: "2017-2".to_string(),
        }
    }

    // Test IDs: TAPI-001
    #[test]
    fn schedule_without_store_record_returns_placeholders() -> ApiResult<()> {
        let db_path = unique_temp_db_path();
        let api = ClassbookApi::new(db_path.clone());

        let classes = api.schedule_classes("uid-1", "2017-2")?;
        assert_eq!(classes.len(), 5);
        assert!(classes.iter().all(ClassRecord::is_placeholder));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn assigned_classes_are_resolved_and_reconciled() -> ApiResult<()> {
        let db_path = unique_temp_db_path();
        let api = ClassbookApi::new(db_path.clone());
        api.add_class(class("2nd", "CSP"))?;
        api.add_class(class("5th", "Gym"))?;
        api.assign_class("uid-1", &class("5th", "Gym"))?;
        api.assign_class("uid-1", &class("2nd", "CSP"))?;

        let classes = api.schedule_classes("uid-1", "2017-2")?;
        let names = classes.iter().map(|record| record.class_name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["", "CSP", "", "", "Gym"]);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn schedule_referencing_missing_class_is_not_found() -> ApiResult<()> {
        let db_path = unique_temp_db_path();
        let api = ClassbookApi::new(db_path.clone());
        api.assign_class("uid-1", &class("1st", "Ghost"))?;

        let result = api.schedule_classes("uid-1", "2017-2");
        assert!(matches!(result, Err(ApiError::NotFound(_))), "unexpected result: {result:?}");

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-004
    #[test]
    fn calendar_window_overlays_stored_homework() -> ApiResult<()> {
        let db_path = unique_temp_db_path();
        let api = ClassbookApi::new(db_path.clone());
        let today = date!(2024 - 01 - 06);
        api.add_calendar_entry(CalendarEntry {
            date: "2024-01-03".to_string(),
            homework: "Read ch.2".to_string(),
            period: 2,
            class_name: "CSP".to_string(),
            semester: "2017-2".to_string(),
        })?;

        let window = api.calendar(&csp_query("2"), today)?;
        assert_eq!(window.len(), WINDOW_SIZE);
        assert_eq!(window[0].date, "2024-01-01");
        assert_eq!(window[29].date, "2024-01-30");
        assert_eq!(window[2].homework, "Read ch.2");
        assert_eq!(window.iter().filter(|entry| !entry.homework.is_empty()).count(), 1);

        let other_period = api.calendar(&csp_query("3"), today)?;
        assert!(other_period.iter().all(|entry| entry.homework.is_empty()));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-005
    #[test]
    fn calendar_rejects_non_numeric_period() {
        let db_path = unique_temp_db_path();
        let api = ClassbookApi::new(db_path.clone());

        let result = api.calendar(&csp_query("2nd"), date!(2024 - 01 - 06));
        assert!(matches!(result, Err(ApiError::Validation(_))), "unexpected result: {result:?}");

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TAPI-006
    #[test]
    fn edits_reject_bad_tokens_before_decoding() -> ApiResult<()> {
        let db_path = unique_temp_db_path();
        let api = ClassbookApi::new(db_path.clone());
        let verifier = StaticVerifier::allowing("good-token");

        let blank = api.edit_calendar(&verifier, "  ", b"not json");
        assert!(matches!(blank, Err(ApiError::Unauthorized(_))), "unexpected result: {blank:?}");
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);

        let rejected = api.edit_schedule(&verifier, "bad-token", b"not json");
        assert!(
            matches!(rejected, Err(ApiError::Unauthorized(_))),
            "unexpected result: {rejected:?}"
        );
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);

        let calendar_body =
            br#"{"date":"2024-01-03","hw":"Read ch.2","period":2,"class":"CSP","semester":"2017-2"}"#;
        let schedule_body = br#"{"classes":{"period":"3rd","class":"Art","classroom":"Room 2","semester":"2017-2"},"id":"uid-1"}"#;
        assert!(matches!(
            api.edit_calendar(&verifier, "bad-token", calendar_body),
            Err(ApiError::Unauthorized(_))
        ));
        assert!(matches!(
            api.edit_schedule(&verifier, "bad-token", schedule_body),
            Err(ApiError::Unauthorized(_))
        ));

        let store = migrated_store(&db_path)?;
        assert!(store.list_calendar_entries()?.is_empty());
        assert_eq!(store.get_schedule("uid-1", "2017-2")?, None);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-007
    #[test]
    fn authorized_schedule_edit_replaces_same_period() -> ApiResult<()> {
        let db_path = unique_temp_db_path();
        let api = ClassbookApi::new(db_path.clone());
        let verifier = StaticVerifier::allowing("good-token");

        let body = |class_name: &str| {
            serde_json::json!({
                "classes": {"period": "3rd", "class": class_name, "classroom": "Room 2", "semester": "2017-2"},
                "id": "uid-1"
            })
            .to_string()
        };

        let first = api.edit_schedule(&verifier, "good-token", body("Chemistry").as_bytes())?;
        assert_eq!(first.class_keys.len(), 1);
        let second = api.edit_schedule(&verifier, "good-token", body("Physics").as_bytes())?;
        assert_eq!(second.class_keys, vec!["3rd-Physics-Room 2-2017-2".to_string()]);

        let malformed = api.edit_schedule(&verifier, "good-token", b"{\"id\": 7}");
        assert!(
            matches!(malformed, Err(ApiError::Validation(_))),
            "unexpected result: {malformed:?}"
        );

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-008
    #[test]
    fn authorized_calendar_edit_validates_date() -> ApiResult<()> {
        let db_path = unique_temp_db_path();
        let api = ClassbookApi::new(db_path.clone());
        let verifier = StaticVerifier::allowing("good-token");

        let stored = api.edit_calendar(
            &verifier,
            "good-token",
            br#"{"date":"2024-01-03","hw":"Read ch.2","period":2,"class":"CSP","semester":"2017-2"}"#,
        )?;
        assert_eq!(stored.entry.homework, "Read ch.2");
        assert!(!stored.entry_id.is_empty());

        let bad_date = api.edit_calendar(&verifier, "good-token", br#"{"date":"Jan 3","hw":"x"}"#);
        assert!(
            matches!(bad_date, Err(ApiError::Validation(_))),
            "unexpected result: {bad_date:?}"
        );

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-009
    #[test]
    fn calendar_window_outside_date_range_is_validation_error() {
        let db_path = unique_temp_db_path();
        let api = ClassbookApi::new(db_path.clone());

        let result = api.calendar(&csp_query("2"), date!(9999 - 12 - 20));
        assert!(matches!(result, Err(ApiError::Validation(_))), "unexpected result: {result:?}");

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TAPI-010
    #[test]
    fn failed_store_writes_surface_as_write_failure() -> ApiResult<()> {
        let db_path = unique_temp_db_path();
        let api = ClassbookApi::new(db_path.clone());
        let verifier = StaticVerifier::allowing("good-token");
        reject_inserts(&db_path, "classes")?;
        reject_inserts(&db_path, "schedules")?;
        reject_inserts(&db_path, "calendar_entries")?;

        let class_result = api.add_class(class("2nd", "CSP"));
        assert!(
            matches!(class_result, Err(ApiError::WriteFailure(_))),
            "unexpected result: {class_result:?}"
        );

        let schedule_result = api.edit_schedule(
            &verifier,
            "good-token",
            br#"{"classes":{"period":"3rd","class":"Art","classroom":"Room 2","semester":"2017-2"},"id":"uid-1"}"#,
        );
        assert!(
            matches!(schedule_result, Err(ApiError::WriteFailure(_))),
            "unexpected result: {schedule_result:?}"
        );

        let calendar_result = api.edit_calendar(
            &verifier,
            "good-token",
            br#"{"date":"2024-01-03","hw":"Read ch.2"}"#,
        );
        assert!(
            matches!(calendar_result, Err(ApiError::WriteFailure(_))),
            "unexpected result: {calendar_result:?}"
        );

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-011
    #[test]
    fn concurrent_assignments_to_one_schedule_are_all_kept() -> ApiResult<()> {
        let db_path = unique_temp_db_path();
        let api = Arc::new(ClassbookApi::new(db_path.clone()));
        api.schedule_classes("uid-1", "2017-2")?;

        let handles = classbook_core::PERIOD_SLOTS
            .iter()
            .map(|period| {
                let api = Arc::clone(&api);
                let record = class(period, &format!("Class {period}"));
                thread::spawn(move || api.assign_class("uid-1", &record))
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap_or_else(|_| panic!("assignment thread panicked"))?;
        }

        let store = migrated_store(&db_path)?;
        let schedule = store
            .get_schedule("uid-1", "2017-2")?
            .unwrap_or_else(|| panic!("schedule should exist"));
        assert_eq!(schedule.class_keys.len(), classbook_core::PERIOD_SLOTS.len());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }
}
