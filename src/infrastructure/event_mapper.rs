use crate::domain::models::{Task, TaskTiming};
use crate::domain::timezone::{format_instant, local_date_of, parse_calendar_date, parse_instant};
use crate::infrastructure::error::InfraError;
use chrono::{DateTime, Days, NaiveDate, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;

pub const KEY_TASK_ID: &str = "taskcal_task_id";
const STATUS_CONFIRMED: &str = "confirmed";
const STATUS_CANCELLED: &str = "cancelled";
const UNTITLED_EVENT: &str = "(No title)";

/// Either `date` (all-day) or `dateTime` is set on a well-formed boundary.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq, Default)]
pub struct CalendarEventDateTime {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(rename = "dateTime", default, skip_serializing_if = "Option::is_none")]
    pub date_time: Option<String>,
    #[serde(rename = "timeZone", default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq, Default)]
pub struct CalendarEventExtendedProperties {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub private: HashMap<String, String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq, Default)]
pub struct GoogleCalendarEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<CalendarEventDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<CalendarEventDateTime>,
    #[serde(rename = "extendedProperties", default, skip_serializing_if = "Option::is_none")]
    pub extended_properties: Option<CalendarEventExtendedProperties>,
}

impl GoogleCalendarEvent {
    pub fn is_cancelled(&self) -> bool {
        self.status.as_deref() == Some(STATUS_CANCELLED)
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated.as_deref().and_then(parse_instant)
    }
}

/// Task fields carried by an external event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedEvent {
    pub event_id: String,
    pub title: String,
    pub description: String,
    pub due_date: NaiveDate,
    pub timing: TaskTiming,
    pub updated: Option<DateTime<Utc>>,
}

/// Builds the outbound payload. Tasks without times become single-day
/// events; the API's end date is exclusive, so it is the following day.
pub fn encode_task_event(task: &Task, timezone: Tz) -> GoogleCalendarEvent {
    let (start, end) = match task.timing {
        TaskTiming::Timed { start, .. } => {
            let end = task.timing.effective_end().unwrap_or(start);
            (
                timed_boundary(start, timezone),
                timed_boundary(end, timezone),
            )
        }
        TaskTiming::AllDay | TaskTiming::Unscheduled => {
            let end_date = task
                .due_date
                .checked_add_days(Days::new(1))
                .unwrap_or(task.due_date);
            (date_boundary(task.due_date), date_boundary(end_date))
        }
    };

    let description = Some(task.description.trim())
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned);

    GoogleCalendarEvent {
        id: None,
        summary: Some(task.title.clone()),
        description,
        status: Some(STATUS_CONFIRMED.to_string()),
        updated: None,
        etag: None,
        start: Some(start),
        end: Some(end),
        extended_properties: Some(CalendarEventExtendedProperties {
            private: HashMap::from([(KEY_TASK_ID.to_string(), task.id.clone())]),
        }),
    }
}

/// `Ok(None)` for events that cannot become tasks: cancelled, id-less, or
/// missing a start or end.
pub fn decode_event(
    event: &GoogleCalendarEvent,
    timezone: Tz,
) -> Result<Option<ImportedEvent>, InfraError> {
    if event.is_cancelled() {
        return Ok(None);
    }
    let Some(event_id) = event
        .id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    else {
        return Ok(None);
    };
    let (Some(start), Some(end)) = (event.start.as_ref(), event.end.as_ref()) else {
        return Ok(None);
    };

    let (due_date, timing) = if let Some(date) = non_empty(start.date.as_deref()) {
        let due_date = parse_calendar_date(date).ok_or_else(|| {
            InfraError::Provider(format!("invalid calendar event {event_id} start.date '{date}'"))
        })?;
        (due_date, TaskTiming::AllDay)
    } else if let Some(date_time) = non_empty(start.date_time.as_deref()) {
        let start_at = parse_event_instant(date_time, event_id, "start.dateTime")?;
        let end_at = non_empty(end.date_time.as_deref())
            .map(|value| parse_event_instant(value, event_id, "end.dateTime"))
            .transpose()?
            .filter(|end_at| *end_at > start_at);
        (
            local_date_of(start_at, timezone),
            TaskTiming::Timed {
                start: start_at,
                end: end_at,
            },
        )
    } else {
        return Ok(None);
    };

    if non_empty(end.date.as_deref()).is_none() && non_empty(end.date_time.as_deref()).is_none() {
        return Ok(None);
    }

    let title = event
        .summary
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(UNTITLED_EVENT)
        .to_string();

    Ok(Some(ImportedEvent {
        event_id: event_id.to_string(),
        title,
        description: event.description.clone().unwrap_or_default(),
        due_date,
        timing,
        updated: event.updated_at(),
    }))
}

pub fn task_id_of(event: &GoogleCalendarEvent) -> Option<&str> {
    event
        .extended_properties
        .as_ref()
        .and_then(|properties| properties.private.get(KEY_TASK_ID))
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn timed_boundary(instant: DateTime<Utc>, timezone: Tz) -> CalendarEventDateTime {
    CalendarEventDateTime {
        date: None,
        date_time: Some(format_instant(instant, timezone)),
        time_zone: Some(timezone.name().to_string()),
    }
}

fn date_boundary(date: NaiveDate) -> CalendarEventDateTime {
    CalendarEventDateTime {
        date: Some(date.format("%Y-%m-%d").to_string()),
        date_time: None,
        time_zone: None,
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn parse_event_instant(
    value: &str,
    event_id: &str,
    field_name: &str,
) -> Result<DateTime<Utc>, InfraError> {
    parse_instant(value).ok_or_else(|| {
        InfraError::Provider(format!(
            "invalid calendar event {event_id} {field_name} '{value}'"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Priority, SyncSource};
    use crate::domain::timezone::parse_timezone;
    use std::collections::BTreeSet;

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn new_york() -> Tz {
        parse_timezone("America/New_York").expect("known timezone")
    }

    fn sample_task(timing: TaskTiming) -> Task {
        Task {
            id: "tsk-1".to_string(),
            user_id: "user-1".to_string(),
            title: "Dentist".to_string(),
            description: String::new(),
            priority: Priority::High,
            due_date: NaiveDate::from_ymd_opt(2024, 6, 15).expect("valid date"),
            timing,
            completed: false,
            tags: BTreeSet::new(),
            recurring: None,
            occurrence_index: 0,
            calendar_link: None,
            sync_source: SyncSource::App,
            last_synced_at: None,
            updated_at: fixed_time("2024-06-01T00:00:00Z"),
        }
    }

    fn timed_event(start: &str, end: Option<&str>) -> GoogleCalendarEvent {
        GoogleCalendarEvent {
            id: Some("evt-1".to_string()),
            summary: Some("Standup".to_string()),
            status: Some("confirmed".to_string()),
            updated: Some("2024-06-10T12:00:00.000Z".to_string()),
            start: Some(CalendarEventDateTime {
                date_time: Some(start.to_string()),
                ..CalendarEventDateTime::default()
            }),
            end: end.map(|end| CalendarEventDateTime {
                date_time: Some(end.to_string()),
                ..CalendarEventDateTime::default()
            }),
            ..GoogleCalendarEvent::default()
        }
    }

    #[test]
    fn timed_task_without_end_gets_default_duration() {
        let task = sample_task(TaskTiming::Timed {
            start: fixed_time("2024-06-15T13:00:00Z"),
            end: None,
        });
        let event = encode_task_event(&task, new_york());
        let start = event.start.expect("start");
        let end = event.end.expect("end");
        assert_eq!(start.date_time.as_deref(), Some("2024-06-15T09:00:00-04:00"));
        assert_eq!(end.date_time.as_deref(), Some("2024-06-15T09:30:00-04:00"));
        assert_eq!(start.time_zone.as_deref(), Some("America/New_York"));
        assert_eq!(event.description, None);
    }

    #[test]
    fn all_day_task_encodes_single_day_date_event() {
        let task = sample_task(TaskTiming::AllDay);
        let event = encode_task_event(&task, new_york());
        let start = event.start.expect("start");
        assert_eq!(start.date.as_deref(), Some("2024-06-15"));
        assert_eq!(start.date_time, None);
        assert_eq!(event.end.expect("end").date.as_deref(), Some("2024-06-16"));
        assert_eq!(event.id, None);

        let json = serde_json::to_value(encode_task_event(&task, new_york())).expect("serialize");
        assert_eq!(
            json["extendedProperties"]["private"][KEY_TASK_ID],
            serde_json::json!("tsk-1")
        );
        assert!(json["start"].get("dateTime").is_none());
    }

    #[test]
    fn decode_date_only_event_as_all_day() {
        let event: GoogleCalendarEvent = serde_json::from_value(serde_json::json!({
            "id": "evt-2",
            "summary": "Holiday",
            "status": "confirmed",
            "updated": "2024-06-10T12:00:00.000Z",
            "start": { "date": "2024-07-04" },
            "end": { "date": "2024-07-05" }
        }))
        .expect("deserialize event");
        let imported = decode_event(&event, new_york())
            .expect("decode")
            .expect("importable");
        assert_eq!(imported.timing, TaskTiming::AllDay);
        assert_eq!(imported.due_date, NaiveDate::from_ymd_opt(2024, 7, 4).expect("valid date"));
        assert_eq!(imported.updated, Some(fixed_time("2024-06-10T12:00:00Z")));
    }

    #[test]
    fn decode_timed_event_uses_local_due_date() {
        let event = timed_event("2024-06-15T22:30:00-04:00", Some("2024-06-15T23:00:00-04:00"));
        let imported = decode_event(&event, new_york())
            .expect("decode")
            .expect("importable");
        assert_eq!(imported.due_date, NaiveDate::from_ymd_opt(2024, 6, 15).expect("valid date"));
        assert_eq!(imported.timing.start(), Some(fixed_time("2024-06-16T02:30:00Z")));
        assert_eq!(imported.timing.end(), Some(fixed_time("2024-06-16T03:00:00Z")));
    }

    #[test]
    fn decode_skips_cancelled_and_incomplete_events() {
        let mut cancelled = timed_event("2024-06-15T09:00:00Z", Some("2024-06-15T10:00:00Z"));
        cancelled.status = Some("cancelled".to_string());
        assert_eq!(decode_event(&cancelled, new_york()).expect("decode"), None);

        let missing_end = timed_event("2024-06-15T09:00:00Z", None);
        assert_eq!(decode_event(&missing_end, new_york()).expect("decode"), None);

        let mut missing_id = timed_event("2024-06-15T09:00:00Z", Some("2024-06-15T10:00:00Z"));
        missing_id.id = None;
        assert_eq!(decode_event(&missing_id, new_york()).expect("decode"), None);
    }

    #[test]
    fn decode_returns_error_when_datetime_is_invalid() {
        let event = timed_event("invalid-timestamp", Some("2024-06-15T10:00:00Z"));
        assert!(matches!(
            decode_event(&event, new_york()),
            Err(InfraError::Provider(_))
        ));
    }

    #[test]
    fn task_id_is_read_from_private_properties() {
        let event = encode_task_event(&sample_task(TaskTiming::AllDay), new_york());
        assert_eq!(task_id_of(&event), Some("tsk-1"));
        assert_eq!(task_id_of(&GoogleCalendarEvent::default()), None);
    }
}
