use crate::application::oauth::{EnsureTokenResult, NowProvider, OAuthManager};
use crate::domain::models::{CalendarLink, HistoryAction, SyncSource, Task, TaskHistoryEntry};
use crate::infrastructure::config::SyncSettings;
use crate::infrastructure::credential_store::IntegrationStore;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::event_mapper::{
    decode_event, encode_task_event, task_id_of, GoogleCalendarEvent, ImportedEvent,
};
use crate::infrastructure::google_calendar_client::{
    CalendarProvider, ListEventsRequest, ListEventsResponse,
};
use crate::infrastructure::oauth_client::OAuthHttpClient;
use crate::infrastructure::task_mapper::{
    from_storage_row, to_storage_row, DueDateInput, TaskPatch, TaskRow,
};
use crate::infrastructure::task_storage::{next_id, TaskStorage};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use tokio::time::{sleep, Duration as TokioDuration};

/// Backoff for event page reads. Writes are never retried within a pass.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u8,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    Pull,
    Push,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncItemStatus {
    Created,
    Updated,
    Failed(String),
}

/// Outcome for one event or task touched by a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncItemResult {
    pub direction: SyncDirection,
    pub calendar_id: String,
    pub task_id: Option<String>,
    pub event_id: Option<String>,
    pub status: SyncItemStatus,
}

impl SyncItemResult {
    fn failed(
        direction: SyncDirection,
        calendar_id: &str,
        task_id: Option<String>,
        event_id: Option<String>,
        error: &InfraError,
    ) -> Self {
        Self {
            direction,
            calendar_id: calendar_id.to_string(),
            task_id,
            event_id,
            status: SyncItemStatus::Failed(error.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self.status, SyncItemStatus::Failed(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub items: Vec<SyncItemResult>,
}

impl SyncReport {
    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|item| item.is_success()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &SyncItemResult> {
        self.items.iter().filter(|item| !item.is_success())
    }

    pub fn summary(&self) -> String {
        format!("synced {} of {}", self.succeeded(), self.items.len())
    }

    fn extend(&mut self, other: SyncReport) {
        self.items.extend(other.items);
    }
}

/// What the scheduler and task flows need from a reconciler.
#[async_trait]
pub trait CalendarSync: Send + Sync {
    async fn sync_pass(&self, user_id: &str) -> Result<SyncReport, InfraError>;
    /// Best-effort; `true` when the remote event is gone afterwards.
    async fn delete_remote_event(&self, user_id: &str, link: &CalendarLink) -> bool;
}

pub struct CalendarReconciler<T, P, S, C>
where
    T: TaskStorage,
    P: CalendarProvider,
    S: IntegrationStore,
    C: OAuthHttpClient,
{
    storage: Arc<T>,
    provider: Arc<P>,
    oauth: Arc<OAuthManager<S, C>>,
    settings: SyncSettings,
    timezone: Tz,
    retry_policy: RetryPolicy,
    now_provider: NowProvider,
}

impl<T, P, S, C> CalendarReconciler<T, P, S, C>
where
    T: TaskStorage,
    P: CalendarProvider,
    S: IntegrationStore,
    C: OAuthHttpClient,
{
    pub fn new(
        storage: Arc<T>,
        provider: Arc<P>,
        oauth: Arc<OAuthManager<S, C>>,
        settings: SyncSettings,
        timezone: Tz,
    ) -> Self {
        Self {
            storage,
            provider,
            oauth,
            settings,
            timezone,
            retry_policy: RetryPolicy::default(),
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    /// Token check, then pull, then push.
    pub async fn sync(&self, user_id: &str) -> Result<SyncReport, InfraError> {
        let access_token = self.access_token(user_id).await?;
        let mut report = self.pull(user_id, &access_token).await;
        report.extend(self.push(user_id, &access_token).await?);

        tracing::info!(
            user_id,
            summary = %report.summary(),
            failures = report.failures().count(),
            "calendar sync pass finished"
        );
        Ok(report)
    }

    pub async fn import_events_to_tasks(&self, user_id: &str) -> Result<SyncReport, InfraError> {
        let access_token = self.access_token(user_id).await?;
        Ok(self.pull(user_id, &access_token).await)
    }

    pub async fn export_tasks_to_events(&self, user_id: &str) -> Result<SyncReport, InfraError> {
        let access_token = self.access_token(user_id).await?;
        self.push(user_id, &access_token).await
    }

    /// Never fails; a remote "not found" counts as deleted.
    pub async fn delete_linked_event(&self, user_id: &str, link: &CalendarLink) -> bool {
        let access_token = match self.access_token(user_id).await {
            Ok(access_token) => access_token,
            Err(error) => {
                tracing::warn!(user_id, event_id = %link.event_id, error = %error, "skipping remote event delete");
                return false;
            }
        };

        match self
            .provider
            .delete_event(&access_token, &link.calendar_id, &link.event_id)
            .await
        {
            Ok(()) | Err(InfraError::NotFound(_)) => true,
            Err(error) => {
                tracing::warn!(
                    user_id,
                    calendar_id = %link.calendar_id,
                    event_id = %link.event_id,
                    error = %error,
                    "failed to delete linked calendar event"
                );
                false
            }
        }
    }

    async fn access_token(&self, user_id: &str) -> Result<String, InfraError> {
        match self.oauth.ensure_access_token(user_id).await? {
            EnsureTokenResult::Existing(token) | EnsureTokenResult::Refreshed(token) => {
                Ok(token.access_token)
            }
            EnsureTokenResult::NotConnected => Err(InfraError::SyncUnavailable(format!(
                "calendar is not connected for user {user_id}"
            ))),
            EnsureTokenResult::Disconnected => Err(InfraError::SyncUnavailable(format!(
                "calendar consent was revoked for user {user_id}; reconnect to resume sync"
            ))),
        }
    }

    async fn pull(&self, user_id: &str, access_token: &str) -> SyncReport {
        let now = (self.now_provider)();
        let time_min = now - Duration::days(self.settings.lookback_days);
        let time_max = now + Duration::days(self.settings.lookahead_days);
        let mut report = SyncReport::default();

        for calendar_id in self.settings.enabled_calendar_ids() {
            let events = match self
                .list_window(access_token, &calendar_id, time_min, time_max)
                .await
            {
                Ok(events) => events,
                Err(error) => {
                    tracing::warn!(user_id, calendar_id = %calendar_id, error = %error, "failed to list calendar events");
                    report.items.push(SyncItemResult::failed(
                        SyncDirection::Pull,
                        &calendar_id,
                        None,
                        None,
                        &error,
                    ));
                    continue;
                }
            };

            for event in &events {
                if let Some(result) = self.import_event(user_id, &calendar_id, event) {
                    report.items.push(result);
                }
            }
        }
        report
    }

    fn import_event(
        &self,
        user_id: &str,
        calendar_id: &str,
        event: &GoogleCalendarEvent,
    ) -> Option<SyncItemResult> {
        let imported = match decode_event(event, self.timezone) {
            Ok(Some(imported)) => imported,
            Ok(None) => return None,
            Err(error) => {
                tracing::warn!(user_id, calendar_id, error = %error, "skipping malformed calendar event");
                return Some(SyncItemResult::failed(
                    SyncDirection::Pull,
                    calendar_id,
                    None,
                    event.id.clone(),
                    &error,
                ));
            }
        };

        match self.apply_imported_event(user_id, calendar_id, event, &imported) {
            Ok(Some((task_id, status))) => Some(SyncItemResult {
                direction: SyncDirection::Pull,
                calendar_id: calendar_id.to_string(),
                task_id: Some(task_id),
                event_id: Some(imported.event_id),
                status,
            }),
            Ok(None) => None,
            Err(error) => {
                tracing::warn!(
                    user_id,
                    calendar_id,
                    event_id = %imported.event_id,
                    error = %error,
                    "failed to import calendar event"
                );
                Some(SyncItemResult::failed(
                    SyncDirection::Pull,
                    calendar_id,
                    None,
                    Some(imported.event_id),
                    &error,
                ))
            }
        }
    }

    fn apply_imported_event(
        &self,
        user_id: &str,
        calendar_id: &str,
        event: &GoogleCalendarEvent,
        imported: &ImportedEvent,
    ) -> Result<Option<(String, SyncItemStatus)>, InfraError> {
        let link = CalendarLink {
            calendar_id: calendar_id.to_string(),
            event_id: imported.event_id.clone(),
        };
        let stamp = sync_stamp((self.now_provider)(), imported.updated);

        let existing = match self
            .storage
            .find_by_calendar_event(user_id, calendar_id, &imported.event_id)?
        {
            Some(row) => Some(row),
            None => self.unlinked_origin_task(user_id, event)?,
        };

        let Some(row) = existing else {
            let patch = remote_fields_patch(imported, link, stamp);
            let row = self.storage.insert(user_id, &to_storage_row(&patch)?)?;
            self.record_history(
                &row.id,
                &row.title,
                HistoryAction::Created,
                format!("imported from calendar {calendar_id}"),
            );
            return Ok(Some((row.id, SyncItemStatus::Created)));
        };

        let task = from_storage_row(&row)?;
        if !remote_is_newer(&task, imported.updated) {
            if task.calendar_link.is_none() {
                // Our own event whose link never got stored; keep the local
                // edit pending and let push update the existing event.
                self.storage.update(
                    &task.id,
                    &to_storage_row(&TaskPatch {
                        calendar_link: Some(Some(link)),
                        updated_at: Some(task.updated_at),
                        ..TaskPatch::default()
                    })?,
                )?;
                return Ok(Some((task.id, SyncItemStatus::Updated)));
            }
            return Ok(None);
        }

        self.storage.update(
            &task.id,
            &to_storage_row(&remote_fields_patch(imported, link, stamp))?,
        )?;
        self.record_history(
            &task.id,
            &imported.title,
            HistoryAction::Synced,
            format!("updated from calendar {calendar_id}"),
        );
        Ok(Some((task.id, SyncItemStatus::Updated)))
    }

    fn unlinked_origin_task(
        &self,
        user_id: &str,
        event: &GoogleCalendarEvent,
    ) -> Result<Option<TaskRow>, InfraError> {
        let Some(task_id) = task_id_of(event) else {
            return Ok(None);
        };
        Ok(self.storage.get(task_id)?.filter(|row| {
            row.user_id == user_id && row.google_calendar_event_id.is_none()
        }))
    }

    async fn push(&self, user_id: &str, access_token: &str) -> Result<SyncReport, InfraError> {
        let mut report = SyncReport::default();
        for row in self.storage.list_by_user(user_id)? {
            let task = match from_storage_row(&row) {
                Ok(task) => task,
                Err(error) => {
                    tracing::warn!(user_id, task_id = %row.id, error = %error, "skipping unreadable task");
                    report.items.push(SyncItemResult::failed(
                        SyncDirection::Push,
                        row.google_calendar_id
                            .as_deref()
                            .unwrap_or(&self.settings.default_calendar_id),
                        Some(row.id.clone()),
                        row.google_calendar_event_id.clone(),
                        &error,
                    ));
                    continue;
                }
            };
            if !task.has_pending_local_edit() {
                continue;
            }
            report
                .items
                .push(self.export_task(user_id, access_token, &task).await);
        }
        Ok(report)
    }

    async fn export_task(&self, user_id: &str, access_token: &str, task: &Task) -> SyncItemResult {
        let calendar_id = task
            .calendar_link
            .as_ref()
            .map(|link| link.calendar_id.clone())
            .unwrap_or_else(|| self.settings.default_calendar_id.clone());
        let payload = encode_task_event(task, self.timezone);

        let pushed = match &task.calendar_link {
            Some(link) => match self
                .provider
                .update_event(access_token, &link.calendar_id, &link.event_id, &payload)
                .await
            {
                Ok(event) => Ok((event, SyncItemStatus::Updated)),
                Err(InfraError::NotFound(_)) => {
                    tracing::info!(user_id, task_id = %task.id, event_id = %link.event_id, "linked event is gone; recreating");
                    self.provider
                        .create_event(access_token, &calendar_id, &payload)
                        .await
                        .map(|event| (event, SyncItemStatus::Created))
                }
                Err(error) => Err(error),
            },
            None => self
                .provider
                .create_event(access_token, &calendar_id, &payload)
                .await
                .map(|event| (event, SyncItemStatus::Created)),
        };

        let recorded = pushed.and_then(|(event, status)| {
            self.record_push(task, &calendar_id, &event)
                .map(|event_id| (event_id, status))
        });
        match recorded {
            Ok((event_id, status)) => SyncItemResult {
                direction: SyncDirection::Push,
                calendar_id,
                task_id: Some(task.id.clone()),
                event_id: Some(event_id),
                status,
            },
            Err(error) => {
                tracing::warn!(user_id, task_id = %task.id, error = %error, "failed to push task to calendar");
                SyncItemResult::failed(
                    SyncDirection::Push,
                    &calendar_id,
                    Some(task.id.clone()),
                    task.calendar_link.as_ref().map(|link| link.event_id.clone()),
                    &error,
                )
            }
        }
    }

    fn record_push(
        &self,
        task: &Task,
        calendar_id: &str,
        event: &GoogleCalendarEvent,
    ) -> Result<String, InfraError> {
        let event_id = event
            .id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| InfraError::Provider("pushed event has no id".to_string()))?
            .to_string();
        let stamp = sync_stamp((self.now_provider)(), event.updated_at());

        let current = self
            .storage
            .get(&task.id)?
            .ok_or_else(|| InfraError::TaskNotFound(task.id.clone()))?;
        let current = from_storage_row(&current)?;
        // An edit that landed while the request was in flight stays pending.
        let (last_synced_at, updated_at) = if current.updated_at == task.updated_at {
            (stamp, stamp)
        } else {
            (task.updated_at, current.updated_at)
        };

        self.storage.update(
            &task.id,
            &to_storage_row(&TaskPatch {
                calendar_link: Some(Some(CalendarLink {
                    calendar_id: calendar_id.to_string(),
                    event_id: event_id.clone(),
                })),
                sync_source: Some(SyncSource::App),
                last_synced_at: Some(Some(last_synced_at)),
                updated_at: Some(updated_at),
                ..TaskPatch::default()
            })?,
        )?;
        self.record_history(
            &task.id,
            &task.title,
            HistoryAction::Synced,
            format!("pushed to calendar {calendar_id}"),
        );
        Ok(event_id)
    }

    fn record_history(&self, task_id: &str, task_title: &str, action: HistoryAction, details: String) {
        let entry = TaskHistoryEntry {
            id: next_id("hst"),
            task_id: task_id.to_string(),
            task_title: task_title.to_string(),
            action,
            timestamp: (self.now_provider)(),
            details: Some(details),
        };
        if let Err(error) = self.storage.append_history(&entry) {
            tracing::warn!(task_id, error = %error, "failed to append task history");
        }
    }

    async fn list_window(
        &self,
        access_token: &str,
        calendar_id: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> Result<Vec<GoogleCalendarEvent>, InfraError> {
        let mut events = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let response = self
                .list_events_with_retry(
                    access_token,
                    calendar_id,
                    ListEventsRequest {
                        time_min: Some(time_min),
                        time_max: Some(time_max),
                        page_token: page_token.take(),
                    },
                )
                .await?;
            events.extend(response.events);
            match response.next_page_token {
                Some(next) => page_token = Some(next),
                None => return Ok(events),
            }
        }
    }

    async fn list_events_with_retry(
        &self,
        access_token: &str,
        calendar_id: &str,
        request: ListEventsRequest,
    ) -> Result<ListEventsResponse, InfraError> {
        let max_attempts = self.retry_policy.max_attempts.max(1);
        let mut attempt: u8 = 0;

        loop {
            match self
                .provider
                .list_events(access_token, calendar_id, request.clone())
                .await
            {
                Ok(response) => return Ok(response),
                Err(error) if should_retry(&error) && attempt + 1 < max_attempts => {
                    self.backoff(attempt).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn backoff(&self, attempt: u8) {
        let delay = self
            .retry_policy
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(u32::from(attempt)));
        sleep(TokioDuration::from_millis(delay)).await;
    }
}

#[async_trait]
impl<T, P, S, C> CalendarSync for CalendarReconciler<T, P, S, C>
where
    T: TaskStorage,
    P: CalendarProvider,
    S: IntegrationStore,
    C: OAuthHttpClient,
{
    async fn sync_pass(&self, user_id: &str) -> Result<SyncReport, InfraError> {
        self.sync(user_id).await
    }

    async fn delete_remote_event(&self, user_id: &str, link: &CalendarLink) -> bool {
        self.delete_linked_event(user_id, link).await
    }
}

fn should_retry(error: &InfraError) -> bool {
    match error {
        InfraError::Provider(message) => {
            let message = message.to_ascii_lowercase();
            message.contains("network error")
                || message.contains("timeout")
                || message.contains("timed out")
                || ["http 429", "http 500", "http 502", "http 503", "http 504"]
                    .iter()
                    .any(|status| message.contains(status))
        }
        _ => false,
    }
}

/// Remote data wins only over a synced record that the event has moved past.
fn remote_is_newer(task: &Task, event_updated: Option<DateTime<Utc>>) -> bool {
    if task.has_pending_local_edit() {
        return false;
    }
    match (task.last_synced_at, event_updated) {
        (None, _) => true,
        (Some(last_synced_at), Some(updated)) => updated > last_synced_at,
        (Some(_), None) => false,
    }
}

fn sync_stamp(now: DateTime<Utc>, event_updated: Option<DateTime<Utc>>) -> DateTime<Utc> {
    event_updated.map_or(now, |updated| updated.max(now))
}

fn remote_fields_patch(imported: &ImportedEvent, link: CalendarLink, stamp: DateTime<Utc>) -> TaskPatch {
    TaskPatch {
        title: Some(imported.title.clone()),
        description: Some(imported.description.clone()),
        due_date: Some(DueDateInput::Date(imported.due_date)),
        timing: Some(imported.timing),
        calendar_link: Some(Some(link)),
        sync_source: Some(SyncSource::GoogleCalendar),
        last_synced_at: Some(Some(stamp)),
        updated_at: Some(stamp),
        ..TaskPatch::default()
    }
}
