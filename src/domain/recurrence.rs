use crate::domain::models::{EndCondition, Frequency, RecurrenceRule, Task, TaskTiming};
use crate::domain::timezone::{local_date_of, local_instant, local_time_of};
use chrono::{DateTime, Datelike, Days, Duration, Months, NaiveDate, Utc};
use chrono_tz::Tz;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecurrenceError {
    #[error("task {0} has no recurrence rule")]
    NotRecurring(String),
    #[error("task {0} must be completed before its series can advance")]
    NotCompleted(String),
    #[error("custom recurrence requires at least one weekday")]
    EmptyCustomDays,
    #[error("end_after must be a positive occurrence count")]
    InvalidEndAfter,
    #[error("date overflow while advancing from {0}")]
    DateOverflow(NaiveDate),
    #[error("no valid local time on {0}")]
    UnresolvableLocalTime(NaiveDate),
}

/// Candidate due date of the occurrence after `current`.
pub fn next_due_date(rule: &RecurrenceRule, current: NaiveDate) -> Result<NaiveDate, RecurrenceError> {
    let next = match rule.frequency {
        Frequency::Daily => current.checked_add_days(Days::new(1)),
        Frequency::Weekly => current.checked_add_days(Days::new(7)),
        // chrono clamps to the last day of a shorter month.
        Frequency::Monthly => current.checked_add_months(Months::new(1)),
        Frequency::Custom => {
            if rule.custom_days.is_empty() {
                return Err(RecurrenceError::EmptyCustomDays);
            }
            (1..=7)
                .filter_map(|offset| current.checked_add_days(Days::new(offset)))
                .find(|candidate| rule.custom_days.contains(&candidate.weekday()))
        }
    };
    next.ok_or(RecurrenceError::DateOverflow(current))
}

/// `occurrence_index` counts from the series start, so `EndAfter(n)` allows
/// indices `0..n`.
pub fn series_has_ended(
    rule: &RecurrenceRule,
    candidate: NaiveDate,
    occurrence_index: u32,
) -> Result<bool, RecurrenceError> {
    match rule.end_condition {
        EndCondition::Never => Ok(false),
        EndCondition::EndDate(end_date) => Ok(candidate > end_date),
        EndCondition::EndAfter(0) => Err(RecurrenceError::InvalidEndAfter),
        EndCondition::EndAfter(count) => Ok(occurrence_index.saturating_add(1) >= count),
    }
}

/// Advances a completed occurrence to the next one in its series.
///
/// `Ok(None)` means the series is finished. Timed occurrences keep their
/// local wall-clock time in `timezone`, even across DST changes.
pub fn schedule_next_occurrence(
    task: &Task,
    occurrence_index: u32,
    timezone: Tz,
) -> Result<Option<Task>, RecurrenceError> {
    let rule = task
        .recurring
        .as_ref()
        .ok_or_else(|| RecurrenceError::NotRecurring(task.id.clone()))?;
    if !task.completed {
        return Err(RecurrenceError::NotCompleted(task.id.clone()));
    }

    let candidate = next_due_date(rule, task.due_date)?;
    if series_has_ended(rule, candidate, occurrence_index)? {
        return Ok(None);
    }

    let shift = candidate.signed_duration_since(task.due_date);
    let timing = shift_timing(task.timing, shift, timezone)?;

    let mut next = task.clone();
    next.due_date = candidate;
    next.timing = timing;
    next.completed = false;
    next.occurrence_index = occurrence_index.saturating_add(1);
    Ok(Some(next))
}

fn shift_timing(timing: TaskTiming, shift: Duration, timezone: Tz) -> Result<TaskTiming, RecurrenceError> {
    let TaskTiming::Timed { start, end } = timing else {
        return Ok(timing);
    };
    let shifted_start = shift_instant(start, shift, timezone)?;
    let end = match end {
        Some(end) => {
            let shifted_end = shift_instant(end, shift, timezone)?;
            if shifted_end > shifted_start {
                Some(shifted_end)
            } else {
                // Both ends landed on the same side of a DST gap.
                tracing::debug!(
                    start = %shifted_start,
                    end = %shifted_end,
                    "shifted end not after start; keeping original duration"
                );
                Some(shifted_start + (end - start))
            }
        }
        None => None,
    };
    Ok(TaskTiming::Timed {
        start: shifted_start,
        end,
    })
}

fn shift_instant(
    instant: DateTime<Utc>,
    shift: Duration,
    timezone: Tz,
) -> Result<DateTime<Utc>, RecurrenceError> {
    let date = local_date_of(instant, timezone);
    let shifted = date
        .checked_add_signed(shift)
        .ok_or(RecurrenceError::DateOverflow(date))?;
    local_instant(shifted, local_time_of(instant, timezone), timezone)
        .ok_or(RecurrenceError::UnresolvableLocalTime(shifted))
}
