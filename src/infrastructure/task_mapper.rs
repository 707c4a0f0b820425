use crate::domain::models::{
    normalize_tags, parse_weekday, weekday_name, CalendarLink, EndCondition, Frequency, Priority,
    RecurrenceRule, SyncSource, Task, TaskTiming,
};
use crate::domain::timezone::{
    format_calendar_date, instant_to_local_time_of_day, parse_calendar_date, parse_instant,
    utc_midnight, DisplayDate,
};
use crate::infrastructure::error::InfraError;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Flat storage representation of a task, one column per field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskRow {
    pub id: String,
    pub user_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub priority: String,
    pub due_date: String,
    pub completed: bool,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub is_all_day: bool,
    pub google_calendar_event_id: Option<String>,
    pub google_calendar_id: Option<String>,
    pub sync_source: Option<String>,
    pub last_synced_at: Option<String>,
    pub recurring_frequency: Option<String>,
    pub recurring_custom_days: Option<Vec<String>>,
    pub recurring_end_date: Option<String>,
    pub recurring_end_after: Option<i64>,
    #[serde(default)]
    pub recurring_occurrence_index: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    pub updated_at: String,
}

/// Column-level partial write. `None` leaves a column untouched; for
/// nullable columns `Some(None)` writes NULL.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TaskRowPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_all_day: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub google_calendar_event_id: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub google_calendar_id: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurring_frequency: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurring_custom_days: Option<Option<Vec<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurring_end_date: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurring_end_after: Option<Option<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurring_occurrence_index: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl TaskRow {
    /// Builds a fresh row from an insert payload; title and due date are required.
    pub fn from_insert(
        id: &str,
        user_id: &str,
        patch: &TaskRowPatch,
        now: DateTime<Utc>,
    ) -> Result<Self, InfraError> {
        let title = patch
            .title
            .clone()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| InfraError::Validation("task.title is required".to_string()))?;
        let due_date = patch
            .due_date
            .clone()
            .ok_or_else(|| InfraError::Validation("task.due_date is required".to_string()))?;
        let now = format_storage_instant(now);

        let mut row = Self {
            id: id.to_string(),
            user_id: user_id.to_string(),
            title,
            description: None,
            priority: Priority::default().as_str().to_string(),
            due_date,
            completed: false,
            start_time: None,
            end_time: None,
            is_all_day: true,
            google_calendar_event_id: None,
            google_calendar_id: None,
            sync_source: Some(SyncSource::App.as_str().to_string()),
            last_synced_at: None,
            recurring_frequency: None,
            recurring_custom_days: None,
            recurring_end_date: None,
            recurring_end_after: None,
            recurring_occurrence_index: 0,
            tags: Vec::new(),
            updated_at: now.clone(),
        };
        row.apply(patch, &now);
        Ok(row)
    }

    /// Merges a patch; `updated_at` falls back to `now` unless the patch pins it.
    pub fn apply(&mut self, patch: &TaskRowPatch, now: &str) {
        if let Some(value) = &patch.title {
            self.title = value.clone();
        }
        if let Some(value) = &patch.description {
            self.description = Some(value.clone());
        }
        if let Some(value) = &patch.priority {
            self.priority = value.clone();
        }
        if let Some(value) = &patch.due_date {
            self.due_date = value.clone();
        }
        if let Some(value) = patch.completed {
            self.completed = value;
        }
        if let Some(value) = &patch.start_time {
            self.start_time = value.clone();
        }
        if let Some(value) = &patch.end_time {
            self.end_time = value.clone();
        }
        if let Some(value) = patch.is_all_day {
            self.is_all_day = value;
        }
        if let Some(value) = &patch.google_calendar_event_id {
            self.google_calendar_event_id = value.clone();
        }
        if let Some(value) = &patch.google_calendar_id {
            self.google_calendar_id = value.clone();
        }
        if let Some(value) = &patch.sync_source {
            self.sync_source = Some(value.clone());
        }
        if let Some(value) = &patch.last_synced_at {
            self.last_synced_at = value.clone();
        }
        if let Some(value) = &patch.recurring_frequency {
            self.recurring_frequency = value.clone();
        }
        if let Some(value) = &patch.recurring_custom_days {
            self.recurring_custom_days = value.clone();
        }
        if let Some(value) = &patch.recurring_end_date {
            self.recurring_end_date = value.clone();
        }
        if let Some(value) = patch.recurring_end_after {
            self.recurring_end_after = value;
        }
        if let Some(value) = patch.recurring_occurrence_index {
            self.recurring_occurrence_index = value;
        }
        if let Some(value) = &patch.tags {
            self.tags = value.clone();
        }
        self.updated_at = patch.updated_at.clone().unwrap_or_else(|| now.to_string());
    }
}

/// A due date as it arrives from callers: a bare calendar date, an instant,
/// or unparsed text in either form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DueDateInput {
    Date(NaiveDate),
    Instant(DateTime<FixedOffset>),
    Text(String),
}

impl DueDateInput {
    /// The calendar day meant by the input. Instants keep the wall-clock
    /// date of their own offset.
    pub fn calendar_date(&self) -> Result<NaiveDate, String> {
        match self {
            Self::Date(date) => Ok(*date),
            Self::Instant(instant) => Ok(instant.date_naive()),
            Self::Text(raw) => {
                let raw = raw.trim();
                if let Some(date) = parse_calendar_date(raw) {
                    return Ok(date);
                }
                if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
                    return Ok(instant.date_naive());
                }
                NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                    .map(|value| value.date())
                    .map_err(|_| format!("task.due_date '{raw}' is not a date or instant"))
            }
        }
    }
}

impl From<NaiveDate> for DueDateInput {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

/// Partial task used for inserts and updates; absent fields are not written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub due_date: Option<DueDateInput>,
    pub timing: Option<TaskTiming>,
    pub completed: Option<bool>,
    pub tags: Option<BTreeSet<String>>,
    pub recurring: Option<Option<RecurrenceRule>>,
    pub occurrence_index: Option<u32>,
    pub calendar_link: Option<Option<CalendarLink>>,
    pub sync_source: Option<SyncSource>,
    pub last_synced_at: Option<Option<DateTime<Utc>>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TaskPatch {
    /// Every user-visible field of `task`; bookkeeping timestamps are left out.
    pub fn from_task(task: &Task) -> Self {
        Self {
            title: Some(task.title.clone()),
            description: Some(task.description.clone()),
            priority: Some(task.priority),
            due_date: Some(DueDateInput::Date(task.due_date)),
            timing: Some(task.timing),
            completed: Some(task.completed),
            tags: Some(task.tags.clone()),
            recurring: Some(task.recurring.clone()),
            occurrence_index: Some(task.occurrence_index),
            calendar_link: Some(task.calendar_link.clone()),
            sync_source: Some(task.sync_source),
            last_synced_at: None,
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskDisplay {
    pub due_date: String,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

pub fn format_storage_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn to_storage_row(patch: &TaskPatch) -> Result<TaskRowPatch, InfraError> {
    let mut row = TaskRowPatch::default();

    if let Some(title) = &patch.title {
        let title = title.trim();
        if title.is_empty() {
            return Err(InfraError::Validation("task.title must not be empty".to_string()));
        }
        row.title = Some(title.to_string());
    }
    row.description = patch.description.clone();
    row.priority = patch.priority.map(|priority| priority.as_str().to_string());
    if let Some(due_date) = &patch.due_date {
        let date = due_date.calendar_date().map_err(InfraError::Validation)?;
        row.due_date = Some(format_storage_instant(utc_midnight(date)));
    }
    if let Some(timing) = &patch.timing {
        row.is_all_day = Some(timing.is_all_day());
        row.start_time = Some(timing.start().map(format_storage_instant));
        row.end_time = Some(timing.end().map(format_storage_instant));
    }
    row.completed = patch.completed;
    row.tags = patch
        .tags
        .as_ref()
        .map(|tags| normalize_tags(tags).into_iter().collect());

    if let Some(recurring) = &patch.recurring {
        match recurring {
            Some(rule) => {
                rule.validate().map_err(InfraError::Validation)?;
                row.recurring_frequency = Some(Some(rule.frequency.as_str().to_string()));
                row.recurring_custom_days = Some(if rule.frequency == Frequency::Custom {
                    Some(
                        rule.custom_days
                            .iter()
                            .map(|day| weekday_name(*day).to_string())
                            .collect(),
                    )
                } else {
                    None
                });
                let (end_date, end_after) = match rule.end_condition {
                    EndCondition::Never => (None, None),
                    EndCondition::EndDate(date) => (Some(date.format("%Y-%m-%d").to_string()), None),
                    EndCondition::EndAfter(count) => (None, Some(i64::from(count))),
                };
                row.recurring_end_date = Some(end_date);
                row.recurring_end_after = Some(end_after);
            }
            None => {
                row.recurring_frequency = Some(None);
                row.recurring_custom_days = Some(None);
                row.recurring_end_date = Some(None);
                row.recurring_end_after = Some(None);
            }
        }
    }
    row.recurring_occurrence_index = patch.occurrence_index.map(i64::from);

    if let Some(link) = &patch.calendar_link {
        row.google_calendar_id = Some(link.as_ref().map(|link| link.calendar_id.clone()));
        row.google_calendar_event_id = Some(link.as_ref().map(|link| link.event_id.clone()));
    }
    row.sync_source = patch.sync_source.map(|source| source.as_str().to_string());
    row.last_synced_at = patch
        .last_synced_at
        .map(|value| value.map(format_storage_instant));
    row.updated_at = patch.updated_at.map(format_storage_instant);

    Ok(row)
}

pub fn from_storage_row(row: &TaskRow) -> Result<Task, InfraError> {
    let due_date = parse_storage_date(&row.due_date, "due_date")?;
    let start = parse_optional_instant(row.start_time.as_deref(), "start_time")?;
    let end = parse_optional_instant(row.end_time.as_deref(), "end_time")?;
    let timing = TaskTiming::from_parts(row.is_all_day, start, end)
        .map_err(|error| InfraError::Validation(format!("task {}: {error}", row.id)))?;
    let priority = Priority::parse(&row.priority).map_err(InfraError::Validation)?;
    let calendar_link = CalendarLink::from_parts(
        row.google_calendar_id.as_deref(),
        row.google_calendar_event_id.as_deref(),
    )
    .map_err(|error| InfraError::Validation(format!("task {}: {error}", row.id)))?;
    let last_synced_at = parse_optional_instant(row.last_synced_at.as_deref(), "last_synced_at")?;
    let updated_at = parse_required_instant(&row.updated_at, "updated_at")?;
    let occurrence_index = u32::try_from(row.recurring_occurrence_index.max(0)).map_err(|_| {
        InfraError::Validation(format!(
            "task {}: recurring_occurrence_index out of range",
            row.id
        ))
    })?;

    Ok(Task {
        id: row.id.clone(),
        user_id: row.user_id.clone(),
        title: row.title.clone(),
        description: row.description.clone().unwrap_or_default(),
        priority,
        due_date,
        timing,
        completed: row.completed,
        tags: normalize_tags(&row.tags),
        recurring: recurrence_from_row(row)?,
        occurrence_index,
        calendar_link,
        sync_source: SyncSource::from_storage(row.sync_source.as_deref()),
        last_synced_at,
        updated_at,
    })
}

pub fn display_fields(task: &Task, timezone: Tz) -> TaskDisplay {
    TaskDisplay {
        due_date: format_calendar_date(DisplayDate::Date(task.due_date), timezone),
        start_time: task
            .timing
            .start()
            .map(|start| instant_to_local_time_of_day(start, timezone)),
        end_time: task
            .timing
            .effective_end()
            .map(|end| instant_to_local_time_of_day(end, timezone)),
    }
}

fn recurrence_from_row(row: &TaskRow) -> Result<Option<RecurrenceRule>, InfraError> {
    let Some(frequency) = row
        .recurring_frequency
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    else {
        return Ok(None);
    };

    let custom_days = row
        .recurring_custom_days
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|day| {
            parse_weekday(day).ok_or_else(|| {
                InfraError::Validation(format!("task {}: invalid recurring day '{day}'", row.id))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let end_condition = if let Some(end_date) = row
        .recurring_end_date
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        EndCondition::EndDate(parse_storage_date(end_date, "recurring_end_date")?)
    } else if let Some(count) = row.recurring_end_after {
        let count = u32::try_from(count).ok().filter(|count| *count > 0).ok_or_else(|| {
            InfraError::Validation(format!(
                "task {}: recurring_end_after must be a positive count",
                row.id
            ))
        })?;
        EndCondition::EndAfter(count)
    } else {
        EndCondition::Never
    };

    let frequency = Frequency::from_storage(frequency);
    let rule = if frequency == Frequency::Custom {
        RecurrenceRule::custom(custom_days)
    } else {
        RecurrenceRule::new(frequency)
    };
    Ok(Some(rule.with_end_condition(end_condition)))
}

/// Dates are stored as UTC-midnight instants; date-only text is accepted too.
fn parse_storage_date(value: &str, field_name: &str) -> Result<NaiveDate, InfraError> {
    if let Some(date) = parse_calendar_date(value) {
        return Ok(date);
    }
    parse_instant(value)
        .map(|instant| instant.date_naive())
        .ok_or_else(|| InfraError::Validation(format!("invalid task.{field_name} '{value}'")))
}

fn parse_required_instant(value: &str, field_name: &str) -> Result<DateTime<Utc>, InfraError> {
    parse_instant(value)
        .ok_or_else(|| InfraError::Validation(format!("invalid task.{field_name} '{value}'")))
}

fn parse_optional_instant(
    value: Option<&str>,
    field_name: &str,
) -> Result<Option<DateTime<Utc>>, InfraError> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| parse_required_instant(value, field_name))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::timezone::{combine_date_and_time_of_day, parse_timezone};
    use chrono::{TimeZone, Weekday};
    use proptest::prelude::*;

    const NOW: &str = "2024-03-01T08:00:00.000Z";

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn date(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").expect("valid date")
    }

    fn stored(patch: &TaskPatch) -> Task {
        let row_patch = to_storage_row(patch).expect("serializable patch");
        let row = TaskRow::from_insert("tsk-1", "user-1", &row_patch, fixed_time(NOW))
            .expect("insertable row");
        from_storage_row(&row).expect("readable row")
    }

    fn base_patch(due_date: DueDateInput, timing: TaskTiming) -> TaskPatch {
        TaskPatch {
            title: Some("Pay rent".to_string()),
            due_date: Some(due_date),
            timing: Some(timing),
            ..TaskPatch::default()
        }
    }

    fn local_midnight(day: &str, zone: &str) -> DateTime<FixedOffset> {
        let timezone = parse_timezone(zone).expect("known timezone");
        let instant = combine_date_and_time_of_day(day, None, timezone).expect("valid date");
        instant.with_timezone(&timezone).fixed_offset()
    }

    #[test]
    fn all_day_date_survives_roundtrip_in_every_offset() {
        for zone in ["Pacific/Honolulu", "America/New_York", "UTC", "Europe/Berlin", "Asia/Tokyo", "Pacific/Auckland"] {
            for day in ["2024-06-15", "2024-03-10", "2024-03-31", "2024-11-03"] {
                let task = stored(&base_patch(
                    DueDateInput::Instant(local_midnight(day, zone)),
                    TaskTiming::AllDay,
                ));
                assert_eq!(task.due_date, date(day), "zone {zone} day {day}");
                assert!(task.timing.is_all_day());
            }
        }
    }

    #[test]
    fn due_date_is_stored_as_utc_midnight() {
        let patch = base_patch(DueDateInput::Text("2024-03-10".to_string()), TaskTiming::AllDay);
        let row = to_storage_row(&patch).expect("serializable patch");
        assert_eq!(row.due_date.as_deref(), Some("2024-03-10T00:00:00.000Z"));

        let patch = base_patch(
            DueDateInput::Text("2024-03-10T23:30:00-05:00".to_string()),
            TaskTiming::AllDay,
        );
        let row = to_storage_row(&patch).expect("serializable patch");
        assert_eq!(row.due_date.as_deref(), Some("2024-03-10T00:00:00.000Z"));
    }

    #[test]
    fn malformed_due_date_is_rejected() {
        let patch = base_patch(DueDateInput::Text("next tuesday".to_string()), TaskTiming::AllDay);
        assert!(matches!(to_storage_row(&patch), Err(InfraError::Validation(_))));
    }

    #[test]
    fn timed_task_roundtrips_to_the_minute() {
        let start = fixed_time("2024-06-15T13:00:00Z");
        let end = fixed_time("2024-06-15T14:15:00Z");
        let task = stored(&base_patch(
            DueDateInput::Date(date("2024-06-15")),
            TaskTiming::Timed {
                start,
                end: Some(end),
            },
        ));
        assert_eq!(task.timing.start(), Some(start));
        assert_eq!(task.timing.end(), Some(end));
        assert!(!task.timing.is_all_day());
        assert_eq!(task.due_date, date("2024-06-15"));
    }

    #[test]
    fn partial_patch_only_serializes_present_fields() {
        let patch = TaskPatch {
            completed: Some(true),
            ..TaskPatch::default()
        };
        let row = to_storage_row(&patch).expect("serializable patch");
        let json = serde_json::to_value(&row).expect("serialize patch");
        let object = json.as_object().expect("object");
        assert_eq!(object.len(), 1);
        assert_eq!(object.get("completed"), Some(&serde_json::json!(true)));
    }

    #[test]
    fn switching_to_all_day_nulls_times_in_same_write() {
        let mut row = TaskRow::from_insert(
            "tsk-1",
            "user-1",
            &to_storage_row(&base_patch(
                DueDateInput::Date(date("2024-06-15")),
                TaskTiming::Timed {
                    start: fixed_time("2024-06-15T13:00:00Z"),
                    end: None,
                },
            ))
            .expect("serializable patch"),
            fixed_time(NOW),
        )
        .expect("insertable row");
        assert!(row.start_time.is_some());

        let patch = to_storage_row(&TaskPatch {
            timing: Some(TaskTiming::AllDay),
            ..TaskPatch::default()
        })
        .expect("serializable patch");
        let json = serde_json::to_value(&patch).expect("serialize patch");
        assert_eq!(json.get("start_time"), Some(&serde_json::Value::Null));
        assert_eq!(json.get("end_time"), Some(&serde_json::Value::Null));

        row.apply(&patch, NOW);
        assert!(row.is_all_day);
        assert_eq!(row.start_time, None);
        assert_eq!(row.end_time, None);
        assert_eq!(row.title, "Pay rent");
    }

    #[test]
    fn recurrence_columns_roundtrip() {
        let mut patch = base_patch(DueDateInput::Date(date("2024-03-12")), TaskTiming::AllDay);
        patch.recurring = Some(Some(
            RecurrenceRule::custom([Weekday::Mon, Weekday::Fri])
                .with_end_condition(EndCondition::EndAfter(4)),
        ));
        patch.occurrence_index = Some(2);
        let task = stored(&patch);
        let rule = task.recurring.expect("recurring");
        assert_eq!(rule.frequency, Frequency::Custom);
        assert_eq!(rule.custom_days, vec![Weekday::Mon, Weekday::Fri]);
        assert_eq!(rule.end_condition, EndCondition::EndAfter(4));
        assert_eq!(task.occurrence_index, 2);

        let mut patch = base_patch(DueDateInput::Date(date("2024-03-12")), TaskTiming::AllDay);
        patch.recurring = Some(Some(
            RecurrenceRule::new(Frequency::Monthly)
                .with_end_condition(EndCondition::EndDate(date("2024-12-31"))),
        ));
        let rule = stored(&patch).recurring.expect("recurring");
        assert_eq!(rule.end_condition, EndCondition::EndDate(date("2024-12-31")));
        assert!(rule.custom_days.is_empty());
    }

    #[test]
    fn unknown_frequency_reads_as_custom() {
        let patch = base_patch(DueDateInput::Date(date("2024-03-12")), TaskTiming::AllDay);
        let mut row = TaskRow::from_insert(
            "tsk-1",
            "user-1",
            &to_storage_row(&patch).expect("serializable patch"),
            fixed_time(NOW),
        )
        .expect("insertable row");
        assert!(from_storage_row(&row).expect("readable").recurring.is_none());

        row.recurring_frequency = Some("fortnightly".to_string());
        row.recurring_custom_days = Some(vec!["tuesday".to_string()]);
        let rule = from_storage_row(&row).expect("readable").recurring.expect("recurring");
        assert_eq!(rule.frequency, Frequency::Custom);
        assert_eq!(rule.custom_days, vec![Weekday::Tue]);
    }

    #[test]
    fn inconsistent_rows_are_rejected() {
        let patch = base_patch(DueDateInput::Date(date("2024-03-12")), TaskTiming::AllDay);
        let base = TaskRow::from_insert(
            "tsk-1",
            "user-1",
            &to_storage_row(&patch).expect("serializable patch"),
            fixed_time(NOW),
        )
        .expect("insertable row");

        let mut all_day_with_time = base.clone();
        all_day_with_time.start_time = Some("2024-03-12T10:00:00.000Z".to_string());
        assert!(from_storage_row(&all_day_with_time).is_err());

        let mut half_link = base.clone();
        half_link.google_calendar_id = Some("primary".to_string());
        assert!(from_storage_row(&half_link).is_err());

        let mut bad_priority = base;
        bad_priority.priority = "urgent".to_string();
        assert!(from_storage_row(&bad_priority).is_err());
    }

    #[test]
    fn insert_requires_title_and_due_date() {
        let missing_due = TaskRowPatch {
            title: Some("Title".to_string()),
            ..TaskRowPatch::default()
        };
        assert!(TaskRow::from_insert("id", "user", &missing_due, fixed_time(NOW)).is_err());
        assert!(to_storage_row(&TaskPatch {
            title: Some("  ".to_string()),
            ..TaskPatch::default()
        })
        .is_err());
    }

    #[test]
    fn apply_respects_pinned_updated_at() {
        let patch = base_patch(DueDateInput::Date(date("2024-03-12")), TaskTiming::AllDay);
        let mut row = TaskRow::from_insert(
            "tsk-1",
            "user-1",
            &to_storage_row(&patch).expect("serializable patch"),
            fixed_time(NOW),
        )
        .expect("insertable row");
        let synced_at = fixed_time("2024-03-02T09:00:00Z");
        let pinned = to_storage_row(&TaskPatch {
            last_synced_at: Some(Some(synced_at)),
            updated_at: Some(synced_at),
            ..TaskPatch::default()
        })
        .expect("serializable patch");
        row.apply(&pinned, "2024-03-02T09:00:05.000Z");
        let task = from_storage_row(&row).expect("readable");
        assert_eq!(task.updated_at, synced_at);
        assert_eq!(task.last_synced_at, Some(synced_at));
    }

    #[test]
    fn display_fields_use_target_timezone() {
        let new_york = parse_timezone("America/New_York").expect("known timezone");
        let task = stored(&base_patch(
            DueDateInput::Date(date("2024-06-15")),
            TaskTiming::Timed {
                start: fixed_time("2024-06-15T13:00:00Z"),
                end: None,
            },
        ));
        let display = display_fields(&task, new_york);
        assert_eq!(display.due_date, "Sat, Jun 15, 2024");
        assert_eq!(display.start_time.as_deref(), Some("09:00"));
        assert_eq!(display.end_time.as_deref(), Some("09:30"));
    }

    proptest! {
        #[test]
        fn all_day_roundtrip_is_offset_independent(
            day_offset in 0i64..1500i64,
            offset_hours in -11i32..14i32
        ) {
            let day = date("2022-01-01") + chrono::Duration::days(day_offset);
            let offset = FixedOffset::east_opt(offset_hours * 3600).expect("valid offset");
            let local_midnight = offset
                .from_local_datetime(&day.and_time(chrono::NaiveTime::MIN))
                .single()
                .expect("fixed offsets are unambiguous");
            let task = stored(&base_patch(DueDateInput::Instant(local_midnight), TaskTiming::AllDay));
            prop_assert_eq!(task.due_date, day);
        }

        #[test]
        fn timed_roundtrip_preserves_minutes(minutes in 0i64..1_000_000i64, length in 1i64..600i64) {
            let start = fixed_time("2023-01-01T00:00:00Z") + chrono::Duration::minutes(minutes);
            let end = start + chrono::Duration::minutes(length);
            let task = stored(&base_patch(
                DueDateInput::Date(start.date_naive()),
                TaskTiming::Timed { start, end: Some(end) },
            ));
            prop_assert_eq!(task.timing.start(), Some(start));
            prop_assert_eq!(task.timing.end(), Some(end));
        }
    }
}
