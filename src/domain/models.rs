use chrono::{DateTime, Duration, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const DEFAULT_EVENT_DURATION_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("invalid task.priority value: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncSource {
    #[default]
    App,
    GoogleCalendar,
}

impl SyncSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::App => "app",
            Self::GoogleCalendar => "google_calendar",
        }
    }

    /// Unset or unrecognized sources count as app-authored.
    pub fn from_storage(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("google_calendar") => Self::GoogleCalendar,
            _ => Self::App,
        }
    }
}

/// When a task happens within its due date.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskTiming {
    AllDay,
    Unscheduled,
    Timed {
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    },
}

impl TaskTiming {
    /// The only way to build a timing from loose flat fields.
    pub fn from_parts(
        is_all_day: bool,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Self, String> {
        if is_all_day {
            if start.is_some() || end.is_some() {
                return Err("all-day task must not carry start_time or end_time".to_string());
            }
            return Ok(Self::AllDay);
        }
        match (start, end) {
            (None, None) => Ok(Self::Unscheduled),
            (None, Some(_)) => Err("task.end_time requires task.start_time".to_string()),
            (Some(start), Some(end)) if end <= start => {
                Err("task.end_time must be after task.start_time".to_string())
            }
            (Some(start), end) => Ok(Self::Timed { start, end }),
        }
    }

    pub fn is_all_day(&self) -> bool {
        matches!(self, Self::AllDay)
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timed { start, .. } => Some(*start),
            _ => None,
        }
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timed { end, .. } => *end,
            _ => None,
        }
    }

    pub fn effective_end(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timed { start, end } => Some(
                end.unwrap_or_else(|| *start + Duration::minutes(DEFAULT_EVENT_DURATION_MINUTES)),
            ),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Custom,
}

impl Frequency {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Custom => "custom",
        }
    }

    /// Values written by newer clients fall back to `Custom`.
    pub fn from_storage(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "daily" => Self::Daily,
            "weekly" => Self::Weekly,
            "monthly" => Self::Monthly,
            _ => Self::Custom,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum EndCondition {
    #[default]
    Never,
    EndDate(NaiveDate),
    EndAfter(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    #[serde(default)]
    pub custom_days: Vec<Weekday>,
    #[serde(default)]
    pub end_condition: EndCondition,
}

impl RecurrenceRule {
    pub fn new(frequency: Frequency) -> Self {
        Self {
            frequency,
            custom_days: Vec::new(),
            end_condition: EndCondition::Never,
        }
    }

    pub fn custom(days: impl IntoIterator<Item = Weekday>) -> Self {
        let mut rule = Self::new(Frequency::Custom);
        rule.custom_days = normalize_weekdays(days);
        rule
    }

    pub fn with_end_condition(mut self, end_condition: EndCondition) -> Self {
        self.end_condition = end_condition;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.frequency == Frequency::Custom && self.custom_days.is_empty() {
            return Err("recurring.custom_days must not be empty for custom frequency".to_string());
        }
        if let EndCondition::EndAfter(0) = self.end_condition {
            return Err("recurring.end_after must be > 0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CalendarLink {
    pub calendar_id: String,
    pub event_id: String,
}

impl CalendarLink {
    /// Both identifiers or neither.
    pub fn from_parts(
        calendar_id: Option<&str>,
        event_id: Option<&str>,
    ) -> Result<Option<Self>, String> {
        let calendar_id = calendar_id.map(str::trim).filter(|value| !value.is_empty());
        let event_id = event_id.map(str::trim).filter(|value| !value.is_empty());
        match (calendar_id, event_id) {
            (Some(calendar_id), Some(event_id)) => Ok(Some(Self {
                calendar_id: calendar_id.to_string(),
                event_id: event_id.to_string(),
            })),
            (None, None) => Ok(None),
            _ => Err(
                "google_calendar_id and google_calendar_event_id must be set together".to_string(),
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub due_date: NaiveDate,
    pub timing: TaskTiming,
    pub completed: bool,
    pub tags: BTreeSet<String>,
    pub recurring: Option<RecurrenceRule>,
    pub occurrence_index: u32,
    pub calendar_link: Option<CalendarLink>,
    pub sync_source: SyncSource,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.title, "task.title")?;
        if let TaskTiming::Timed {
            start,
            end: Some(end),
        } = self.timing
        {
            if end <= start {
                return Err("task.end_time must be after task.start_time".to_string());
            }
        }
        if let Some(rule) = &self.recurring {
            rule.validate()?;
        }
        Ok(())
    }

    /// An app-side write that has not reached the external calendar yet.
    pub fn has_pending_local_edit(&self) -> bool {
        self.sync_source == SyncSource::App
            && self
                .last_synced_at
                .is_none_or(|last_synced_at| self.updated_at > last_synced_at)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Created,
    Updated,
    Completed,
    Deleted,
    Synced,
}

impl HistoryAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Completed => "completed",
            Self::Deleted => "deleted",
            Self::Synced => "synced",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim() {
            "created" => Ok(Self::Created),
            "updated" => Ok(Self::Updated),
            "completed" => Ok(Self::Completed),
            "deleted" => Ok(Self::Deleted),
            "synced" => Ok(Self::Synced),
            other => Err(format!("invalid history.action value: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskHistoryEntry {
    pub id: String,
    pub task_id: String,
    pub task_title: String,
    pub action: HistoryAction,
    pub timestamp: DateTime<Utc>,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub token_type: String,
    pub scope: Option<String>,
}

impl OAuthToken {
    pub fn is_valid_at(&self, now: DateTime<Utc>, leeway_seconds: i64) -> bool {
        self.expires_at > now + Duration::seconds(leeway_seconds)
            && !self.access_token.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CalendarIntegration {
    pub user_id: String,
    pub token: OAuthToken,
    pub connected: bool,
    pub connected_at: DateTime<Utc>,
}

pub fn parse_weekday(value: &str) -> Option<Weekday> {
    match value.trim().to_ascii_lowercase().as_str() {
        "monday" | "mon" | "1" => Some(Weekday::Mon),
        "tuesday" | "tue" | "2" => Some(Weekday::Tue),
        "wednesday" | "wed" | "3" => Some(Weekday::Wed),
        "thursday" | "thu" | "4" => Some(Weekday::Thu),
        "friday" | "fri" | "5" => Some(Weekday::Fri),
        "saturday" | "sat" | "6" => Some(Weekday::Sat),
        "sunday" | "sun" | "0" | "7" => Some(Weekday::Sun),
        _ => None,
    }
}

pub fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

pub fn normalize_weekdays(days: impl IntoIterator<Item = Weekday>) -> Vec<Weekday> {
    let mut days: Vec<Weekday> = days.into_iter().collect();
    days.sort_by_key(Weekday::num_days_from_monday);
    days.dedup();
    days
}

pub fn normalize_tags<I, S>(tags: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .map(|tag| tag.as_ref().trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect()
}

fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}
