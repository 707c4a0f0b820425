use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveTime, SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;

const DATE_FORMAT: &str = "%Y-%m-%d";
const DISPLAY_DATE_FORMAT: &str = "%a, %b %-d, %Y";
const DISPLAY_TIME_FORMAT: &str = "%-I:%M %p";
const MAX_GAP_MINUTES: i64 = 180;

/// A value to render as a calendar date. A plain date is never shifted
/// through a timezone; an instant is projected into the target zone first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayDate {
    Instant(DateTime<Utc>),
    Date(NaiveDate),
}

pub fn resolve_local_timezone() -> Tz {
    match iana_time_zone::get_timezone() {
        Ok(name) => parse_timezone(&name).unwrap_or_else(|| {
            tracing::warn!(timezone = %name, "unrecognized local timezone; using UTC");
            chrono_tz::UTC
        }),
        Err(error) => {
            tracing::warn!(error = %error, "failed to detect local timezone; using UTC");
            chrono_tz::UTC
        }
    }
}

pub fn parse_timezone(value: &str) -> Option<Tz> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    value.parse::<Tz>().ok()
}

pub fn parse_calendar_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT).ok()
}

pub fn parse_time_of_day(value: &str) -> Option<NaiveTime> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .ok()
}

pub fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|value| value.with_timezone(&Utc))
}

/// Resolves a wall-clock moment in `timezone` to an instant. Times inside a
/// DST gap move forward to the first valid local time; ambiguous times take
/// the earlier of the two instants.
pub fn local_instant(date: NaiveDate, time: NaiveTime, timezone: Tz) -> Option<DateTime<Utc>> {
    let naive = date.and_time(time);
    match timezone.from_local_datetime(&naive) {
        LocalResult::Single(value) | LocalResult::Ambiguous(value, _) => {
            Some(value.with_timezone(&Utc))
        }
        LocalResult::None => (1..=MAX_GAP_MINUTES).find_map(|minutes| {
            match timezone.from_local_datetime(&(naive + Duration::minutes(minutes))) {
                LocalResult::Single(value) | LocalResult::Ambiguous(value, _) => {
                    Some(value.with_timezone(&Utc))
                }
                LocalResult::None => None,
            }
        }),
    }
}

/// Soft-fail conversion for form input: malformed values yield `None`.
/// A missing or blank time of day means local midnight.
pub fn combine_date_and_time_of_day(
    date: &str,
    time_of_day: Option<&str>,
    timezone: Tz,
) -> Option<DateTime<Utc>> {
    let date = parse_calendar_date(date)?;
    let time = match time_of_day.map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => parse_time_of_day(value)?,
        None => NaiveTime::MIN,
    };
    local_instant(date, time, timezone)
}

pub fn instant_to_local_time_of_day(instant: DateTime<Utc>, timezone: Tz) -> String {
    instant.with_timezone(&timezone).format("%H:%M").to_string()
}

pub fn local_date_of(instant: DateTime<Utc>, timezone: Tz) -> NaiveDate {
    instant.with_timezone(&timezone).date_naive()
}

pub fn local_time_of(instant: DateTime<Utc>, timezone: Tz) -> NaiveTime {
    instant.with_timezone(&timezone).time()
}

pub fn format_calendar_date(value: DisplayDate, timezone: Tz) -> String {
    match value {
        DisplayDate::Date(date) => date.format(DISPLAY_DATE_FORMAT).to_string(),
        DisplayDate::Instant(instant) => instant
            .with_timezone(&timezone)
            .format(DISPLAY_DATE_FORMAT)
            .to_string(),
    }
}

pub fn format_time_of_day(instant: DateTime<Utc>, timezone: Tz) -> String {
    instant
        .with_timezone(&timezone)
        .format(DISPLAY_TIME_FORMAT)
        .to_string()
}

/// RFC 3339 rendering carrying the zone's offset at that instant.
pub fn format_instant(instant: DateTime<Utc>, timezone: Tz) -> String {
    instant
        .with_timezone(&timezone)
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn utc_midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}
