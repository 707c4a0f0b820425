use crate::application::calendar_sync::CalendarSync;
use crate::application::oauth::NowProvider;
use crate::application::sync_scheduler::SyncScheduler;
use crate::domain::models::{
    normalize_tags, HistoryAction, Priority, RecurrenceRule, SyncSource, Task, TaskHistoryEntry,
    TaskTiming,
};
use crate::domain::recurrence::schedule_next_occurrence;
use crate::domain::timezone::{local_instant, parse_time_of_day};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::task_mapper::{
    display_fields, from_storage_row, to_storage_row, DueDateInput, TaskDisplay, TaskPatch,
};
use crate::infrastructure::task_storage::{next_id, SubscriptionId, TaskListener, TaskStorage};
use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub due_date: DueDateInput,
    pub timing: TaskTiming,
    pub tags: BTreeSet<String>,
    pub recurring: Option<RecurrenceRule>,
}

impl NewTask {
    /// An all-day, medium-priority task.
    pub fn new(title: impl Into<String>, due_date: impl Into<DueDateInput>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            priority: Priority::default(),
            due_date: due_date.into(),
            timing: TaskTiming::AllDay,
            tags: BTreeSet::new(),
            recurring: None,
        }
    }
}

/// One user's task flows. Every write records history and nudges the
/// sync scheduler.
pub struct TaskService<T, Y>
where
    T: TaskStorage,
    Y: CalendarSync + 'static,
{
    user_id: String,
    storage: Arc<T>,
    timezone: Tz,
    scheduler: Option<SyncScheduler<Y>>,
    now_provider: NowProvider,
}

impl<T, Y> TaskService<T, Y>
where
    T: TaskStorage,
    Y: CalendarSync + 'static,
{
    pub fn new(user_id: impl Into<String>, storage: Arc<T>, timezone: Tz) -> Self {
        Self {
            user_id: user_id.into(),
            storage,
            timezone,
            scheduler: None,
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_scheduler(mut self, scheduler: SyncScheduler<Y>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Builds a timing from form values interpreted in the user's zone.
    pub fn local_timing(
        &self,
        due_date: NaiveDate,
        is_all_day: bool,
        start_time: Option<&str>,
        end_time: Option<&str>,
    ) -> Result<TaskTiming, InfraError> {
        let start = self.local_time_on(due_date, start_time, "start_time")?;
        let end = self.local_time_on(due_date, end_time, "end_time")?;
        TaskTiming::from_parts(is_all_day, start, end).map_err(InfraError::Validation)
    }

    fn local_time_on(
        &self,
        date: NaiveDate,
        value: Option<&str>,
        field_name: &str,
    ) -> Result<Option<chrono::DateTime<Utc>>, InfraError> {
        let Some(value) = value.map(str::trim).filter(|value| !value.is_empty()) else {
            return Ok(None);
        };
        let time = parse_time_of_day(value).ok_or_else(|| {
            InfraError::Validation(format!("task.{field_name} must be HH:MM, got '{value}'"))
        })?;
        local_instant(date, time, self.timezone)
            .map(Some)
            .ok_or_else(|| {
                InfraError::Validation(format!("task.{field_name} does not exist on {date}"))
            })
    }

    pub fn display(&self, task: &Task) -> TaskDisplay {
        display_fields(task, self.timezone)
    }

    pub fn create_task(&self, input: NewTask) -> Result<Task, InfraError> {
        let now = (self.now_provider)();
        let due_date = input.due_date.calendar_date().map_err(InfraError::Validation)?;
        let candidate = Task {
            id: String::new(),
            user_id: self.user_id.clone(),
            title: input.title.trim().to_string(),
            description: input.description,
            priority: input.priority,
            due_date,
            timing: input.timing,
            completed: false,
            tags: normalize_tags(&input.tags),
            recurring: input.recurring,
            occurrence_index: 0,
            calendar_link: None,
            sync_source: SyncSource::App,
            last_synced_at: None,
            updated_at: now,
        };
        candidate.validate().map_err(InfraError::Validation)?;

        let mut patch = TaskPatch::from_task(&candidate);
        patch.updated_at = Some(now);
        let row = self.storage.insert(&self.user_id, &to_storage_row(&patch)?)?;
        let task = from_storage_row(&row)?;

        self.record_history(&task, HistoryAction::Created, None);
        self.notify_change();
        tracing::debug!(user_id = %self.user_id, task_id = %task.id, "task created");
        Ok(task)
    }

    /// User edit. Sync bookkeeping in `patch` is ignored; a change of
    /// `completed` goes through [`Self::set_completed`].
    pub fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Task, InfraError> {
        let current = self.load(id)?;
        let mut patch = patch;
        let completed = patch.completed.take();
        patch.calendar_link = None;
        patch.last_synced_at = None;
        patch.sync_source = None;
        patch.updated_at = None;

        let changed = changed_fields(&patch);
        let mut task = current.clone();
        if !changed.is_empty() {
            let candidate = merge_patch(&current, &patch)?;
            candidate.validate().map_err(InfraError::Validation)?;

            patch.sync_source = Some(SyncSource::App);
            patch.updated_at = Some((self.now_provider)());
            let row = self.storage.update(id, &to_storage_row(&patch)?)?;
            task = from_storage_row(&row)?;
            self.record_history(&task, HistoryAction::Updated, Some(format!("changed {}", changed.join(", "))));
            self.notify_change();
        }

        match completed {
            Some(completed) if completed != task.completed => self.set_completed(id, completed),
            _ => Ok(task),
        }
    }

    /// Completing a recurring task moves the same record to its next
    /// occurrence; the last occurrence stays completed.
    pub fn set_completed(&self, id: &str, completed: bool) -> Result<Task, InfraError> {
        let current = self.load(id)?;
        if current.completed == completed {
            return Ok(current);
        }

        let now = (self.now_provider)();
        let (patch, action, details) = if completed && current.recurring.is_some() {
            let mut done = current.clone();
            done.completed = true;
            match schedule_next_occurrence(&done, current.occurrence_index, self.timezone)? {
                Some(next) => (
                    TaskPatch {
                        due_date: Some(DueDateInput::Date(next.due_date)),
                        timing: Some(next.timing),
                        completed: Some(false),
                        occurrence_index: Some(next.occurrence_index),
                        ..TaskPatch::default()
                    },
                    HistoryAction::Completed,
                    format!(
                        "occurrence {} completed; next due {}",
                        current.occurrence_index + 1,
                        next.due_date.format("%Y-%m-%d")
                    ),
                ),
                None => (
                    TaskPatch {
                        completed: Some(true),
                        ..TaskPatch::default()
                    },
                    HistoryAction::Completed,
                    "recurring series finished".to_string(),
                ),
            }
        } else if completed {
            (
                TaskPatch {
                    completed: Some(true),
                    ..TaskPatch::default()
                },
                HistoryAction::Completed,
                "completed".to_string(),
            )
        } else {
            (
                TaskPatch {
                    completed: Some(false),
                    ..TaskPatch::default()
                },
                HistoryAction::Updated,
                "marked incomplete".to_string(),
            )
        };

        let patch = TaskPatch {
            sync_source: Some(SyncSource::App),
            updated_at: Some(now),
            ..patch
        };
        let row = self.storage.update(id, &to_storage_row(&patch)?)?;
        let task = from_storage_row(&row)?;
        self.record_history(&task, action, Some(details));
        self.notify_change();
        Ok(task)
    }

    /// The local delete always happens; the linked event is removed first,
    /// best-effort, so a concurrent pull cannot re-import it as a new task.
    pub async fn delete_task(&self, id: &str) -> Result<(), InfraError> {
        let task = self.load(id)?;

        if let (Some(link), Some(scheduler)) = (&task.calendar_link, &self.scheduler) {
            if !scheduler
                .calendar()
                .delete_remote_event(&self.user_id, link)
                .await
            {
                tracing::warn!(task_id = %task.id, event_id = %link.event_id, "linked event left behind");
            }
        }

        self.storage.delete(id)?;
        self.record_history(&task, HistoryAction::Deleted, None);
        self.notify_change();
        Ok(())
    }

    /// Ordered by due date, then start time, then title.
    pub fn list_tasks(&self) -> Result<Vec<Task>, InfraError> {
        let mut tasks = self
            .storage
            .list_by_user(&self.user_id)?
            .iter()
            .map(from_storage_row)
            .collect::<Result<Vec<_>, _>>()?;
        tasks.sort_by(|left, right| {
            left.due_date
                .cmp(&right.due_date)
                .then_with(|| left.timing.start().cmp(&right.timing.start()))
                .then_with(|| left.title.cmp(&right.title))
        });
        Ok(tasks)
    }

    pub fn task_history(&self, id: &str) -> Result<Vec<TaskHistoryEntry>, InfraError> {
        self.storage.list_history(id)
    }

    pub fn subscribe(&self, listener: TaskListener) -> Result<SubscriptionId, InfraError> {
        self.storage.subscribe(&self.user_id, listener)
    }

    pub fn unsubscribe(&self, subscription: SubscriptionId) -> Result<(), InfraError> {
        self.storage.unsubscribe(subscription)
    }

    fn load(&self, id: &str) -> Result<Task, InfraError> {
        let row = self
            .storage
            .get(id)?
            .filter(|row| row.user_id == self.user_id)
            .ok_or_else(|| InfraError::TaskNotFound(id.to_string()))?;
        from_storage_row(&row)
    }

    fn record_history(
        &self,
        task: &Task,
        action: HistoryAction,
        details: Option<String>,
    ) {
        let entry = TaskHistoryEntry {
            id: next_id("hst"),
            task_id: task.id.clone(),
            task_title: task.title.clone(),
            action,
            timestamp: (self.now_provider)(),
            details,
        };
        // The row is already committed; history is best-effort.
        if let Err(error) = self.storage.append_history(&entry) {
            tracing::warn!(task_id = %task.id, error = %error, "failed to append task history");
        }
    }

    fn notify_change(&self) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.notify_local_change();
        }
    }
}

fn changed_fields(patch: &TaskPatch) -> Vec<&'static str> {
    let fields = [
        ("title", patch.title.is_some()),
        ("description", patch.description.is_some()),
        ("priority", patch.priority.is_some()),
        ("due_date", patch.due_date.is_some()),
        ("timing", patch.timing.is_some()),
        ("tags", patch.tags.is_some()),
        ("recurring", patch.recurring.is_some()),
        ("occurrence_index", patch.occurrence_index.is_some()),
    ];
    fields
        .into_iter()
        .filter_map(|(name, present)| present.then_some(name))
        .collect()
}

fn merge_patch(task: &Task, patch: &TaskPatch) -> Result<Task, InfraError> {
    let mut merged = task.clone();
    if let Some(title) = &patch.title {
        merged.title = title.trim().to_string();
    }
    if let Some(description) = &patch.description {
        merged.description = description.clone();
    }
    if let Some(priority) = patch.priority {
        merged.priority = priority;
    }
    if let Some(due_date) = &patch.due_date {
        merged.due_date = due_date.calendar_date().map_err(InfraError::Validation)?;
    }
    if let Some(timing) = patch.timing {
        merged.timing = timing;
    }
    if let Some(tags) = &patch.tags {
        merged.tags = normalize_tags(tags);
    }
    if let Some(recurring) = &patch.recurring {
        merged.recurring = recurring.clone();
    }
    if let Some(occurrence_index) = patch.occurrence_index {
        merged.occurrence_index = occurrence_index;
    }
    Ok(merged)
}
