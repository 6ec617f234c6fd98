use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::{Date, Duration};

/// Canonical weekly period slots, in display order.
pub const PERIOD_SLOTS: [&str; 5] = ["1st", "2nd", "3rd", "4th", "5th"];

/// Number of days shown in the homework calendar.
pub const WINDOW_SIZE: usize = 30;

/// Days of history shown before "today" in the homework calendar.
pub const WINDOW_LEAD_DAYS: i64 = 5;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ClassbookError {
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Classes,
    Calendar,
    Schedule,
}

impl DocumentKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Classes => "classes",
            Self::Calendar => "calendar",
            Self::Schedule => "schedule",
        }
    }
}

/// One class offered in a period of a semester.
///
/// Example: `{"period":"1st","class":"Math","classroom":"Room 511","semester":"2017-2"}`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct ClassRecord {
    pub period: String,
    #[serde(rename = "class")]
    pub class_name: String,
    pub classroom: String,
    pub semester: String,
}

impl ClassRecord {
    /// Placeholder for a period slot with no assigned class.
    #[must_use]
    pub fn placeholder(period: &str, semester: &str) -> Self {
        Self {
            period: period.to_string(),
            class_name: String::new(),
            classroom: String::new(),
            semester: semester.to_string(),
        }
    }

    /// Composite key used to reference this class from a schedule.
    #[must_use]
    pub fn identity_key(&self) -> String {
        format!("{}-{}-{}-{}", self.period, self.class_name, self.classroom, self.semester)
    }

    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.class_name.is_empty() && self.classroom.is_empty()
    }

    /// Validate a class record before it is written or assigned.
    ///
    /// # Errors
    /// Returns [`ClassbookError::Validation`] when `period` or `semester` is blank.
    pub fn validate(&self) -> Result<(), ClassbookError> {
        if self.period.trim().is_empty() {
            return Err(ClassbookError::Validation("period MUST be provided".to_string()));
        }
        if self.semester.trim().is_empty() {
            return Err(ClassbookError::Validation("semester MUST be provided".to_string()));
        }
        Ok(())
    }
}

/// The classes a user takes in one semester, stored as class identity keys.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct ScheduleEntry {
    pub user_id: String,
    pub semester: String,
    #[serde(default)]
    pub class_keys: Vec<String>,
}

impl ScheduleEntry {
    #[must_use]
    pub fn new(user_id: &str, semester: &str) -> Self {
        Self { user_id: user_id.to_string(), semester: semester.to_string(), class_keys: Vec::new() }
    }

    /// Storage key for this schedule.
    #[must_use]
    pub fn key(&self) -> String {
        schedule_key(&self.user_id, &self.semester)
    }
}

#[must_use]
pub fn schedule_key(user_id: &str, semester: &str) -> String {
    format!("{user_id}-{semester}")
}

/// Homework posted for one day.
///
/// `period`, `class` and `semester` are optional on input so that the reduced
/// `{date, hw}` shape still decodes; they are always serialized.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct CalendarEntry {
    pub date: String,
    #[serde(rename = "hw", default)]
    pub homework: String,
    #[serde(default)]
    pub period: i64,
    #[serde(rename = "class", default)]
    pub class_name: String,
    #[serde(default)]
    pub semester: String,
}

impl CalendarEntry {
    #[must_use]
    pub fn placeholder(date: &str) -> Self {
        Self { date: date.to_string(), ..Self::default() }
    }

    /// Validate a calendar entry before it is written.
    ///
    /// # Errors
    /// Returns [`ClassbookError::Validation`] when `date` is not a `YYYY-MM-DD` calendar date.
    pub fn validate(&self) -> Result<(), ClassbookError> {
        parse_iso_date(&self.date).map(|_| ())
    }
}

/// Scope of a calendar lookup: one class in one period of one semester.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CalendarScope {
    pub class_name: String,
    pub period: i64,
    pub semester: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChatMessage {
    pub user: String,
    pub message: String,
}

/// Canned messages for the chat panel.
#[must_use]
pub fn demo_chat_feed() -> Vec<ChatMessage> {
    [
        ("Ms. Alvarez", "Reminder: lab reports are due Friday."),
        ("jordan", "Does anyone have the notes from 3rd period?"),
        ("sam", "Posted them on the calendar under today."),
        ("Ms. Alvarez", "Quiz on chapter 4 moved to next Tuesday."),
    ]
    .into_iter()
    .map(|(user, message)| ChatMessage { user: user.to_string(), message: message.to_string() })
    .collect()
}

/// Fill every missing period slot with a placeholder and order the result by period label.
///
/// Existing records are kept as-is, duplicates included. Ordering is a plain
/// string comparison on `period`, so labels outside [`PERIOD_SLOTS`] sort
/// lexicographically ("10th" before "2nd").
#[must_use]
pub fn reconcile_periods(existing: &[ClassRecord], semester: &str) -> Vec<ClassRecord> {
    let mut classes = existing.to_vec();
    for slot in PERIOD_SLOTS {
        if !existing.iter().any(|record| record.period == slot) {
            classes.push(ClassRecord::placeholder(slot, semester));
        }
    }
    classes.sort_by(|lhs, rhs| lhs.period.cmp(&rhs.period));
    classes
}

/// Assign `record` to a schedule, replacing the class already held in the same period.
///
/// The period match is a prefix test on the stored identity key, so a period
/// label that prefixes another label ("1" and "10th") also matches it.
#[must_use]
pub fn apply_schedule_edit(
    current: Option<ScheduleEntry>,
    user_id: &str,
    record: &ClassRecord,
) -> ScheduleEntry {
    let mut schedule = current.unwrap_or_else(|| ScheduleEntry::new(user_id, &record.semester));
    let key = record.identity_key();

    match schedule.class_keys.iter_mut().find(|existing| existing.starts_with(&record.period)) {
        Some(slot) => *slot = key,
        None => schedule.class_keys.push(key),
    }
    schedule
}

/// First day of the calendar window for a given "today".
///
/// # Errors
/// Returns [`ClassbookError::Validation`] when the full window starting
/// [`WINDOW_LEAD_DAYS`] before `today` does not fit in the supported date range.
pub fn calendar_window_start(today: Date) -> Result<Date, ClassbookError> {
    let out_of_range = || {
        ClassbookError::Validation(format!(
            "calendar window around {} is outside the supported date range",
            format_iso_date(today)
        ))
    };
    let start = today.checked_sub(Duration::days(WINDOW_LEAD_DAYS)).ok_or_else(out_of_range)?;
    let last_offset = i64::try_from(WINDOW_SIZE - 1).map_err(|_| out_of_range())?;
    start.checked_add(Duration::days(last_offset)).ok_or_else(out_of_range)?;
    Ok(start)
}

/// Consecutive `YYYY-MM-DD` dates starting at `start`.
#[must_use]
pub fn window_dates(start: Date, window_size: usize) -> Vec<String> {
    std::iter::successors(Some(start), |date| date.next_day())
        .take(window_size)
        .map(format_iso_date)
        .collect()
}

/// Produce one entry per day of the window, overlaying stored homework by date.
///
/// Later entries for the same date replace earlier ones. Entries dated outside
/// the window are dropped.
#[must_use]
pub fn reconcile_calendar_window(
    existing: &[CalendarEntry],
    window_start: Date,
    window_size: usize,
) -> Vec<CalendarEntry> {
    let dates = window_dates(window_start, window_size);
    let mut lookup = dates
        .iter()
        .map(|date| (date.clone(), CalendarEntry::placeholder(date)))
        .collect::<BTreeMap<_, _>>();

    for entry in existing {
        if let Some(slot) = lookup.get_mut(&entry.date) {
            *slot = entry.clone();
        }
    }

    dates.iter().filter_map(|date| lookup.remove(date)).collect()
}

#[must_use]
pub fn format_iso_date(date: Date) -> String {
    format!("{:04}-{:02}-{:02}", date.year(), u8::from(date.month()), date.day())
}

/// Parse a strict `YYYY-MM-DD` date.
///
/// # Errors
/// Returns [`ClassbookError::Validation`] when the value is not a valid calendar date.
pub fn parse_iso_date(value: &str) -> Result<Date, ClassbookError> {
    let format = time::macros::format_description!("[year]-[month]-[day]");
    Date::parse(value, &format)
        .map_err(|err| ClassbookError::Validation(format!("invalid date `{value}`: {err}")))
}

/// Parse the numeric period used to scope calendar lookups.
///
/// # Errors
/// Returns [`ClassbookError::Validation`] when the value is not an integer.
pub fn parse_calendar_period(value: &str) -> Result<i64, ClassbookError> {
    value
        .trim()
        .parse::<i64>()
        .map_err(|err| ClassbookError::Validation(format!("invalid period `{value}`: {err}")))
}
