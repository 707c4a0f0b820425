use crate::domain::models::{HistoryAction, TaskHistoryEntry};
use crate::domain::timezone::parse_instant;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::task_mapper::{format_storage_instant, TaskRow, TaskRowPatch};
use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_id(prefix: &str) -> String {
    let sequence = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{sequence}", Utc::now().timestamp_micros())
}

/// Row-level change pushed to subscribers after a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskChange {
    Inserted(TaskRow),
    Updated(TaskRow),
    Deleted { id: String, user_id: String },
}

impl TaskChange {
    pub fn user_id(&self) -> &str {
        match self {
            Self::Inserted(row) | Self::Updated(row) => &row.user_id,
            Self::Deleted { user_id, .. } => user_id,
        }
    }
}

pub type TaskListener = Arc<dyn Fn(&TaskChange) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub trait TaskStorage: Send + Sync {
    fn insert(&self, user_id: &str, patch: &TaskRowPatch) -> Result<TaskRow, InfraError>;
    fn update(&self, id: &str, patch: &TaskRowPatch) -> Result<TaskRow, InfraError>;
    fn delete(&self, id: &str) -> Result<(), InfraError>;
    fn get(&self, id: &str) -> Result<Option<TaskRow>, InfraError>;
    fn list_by_user(&self, user_id: &str) -> Result<Vec<TaskRow>, InfraError>;
    fn find_by_calendar_event(
        &self,
        user_id: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<Option<TaskRow>, InfraError>;
    fn subscribe(&self, user_id: &str, listener: TaskListener) -> Result<SubscriptionId, InfraError>;
    fn unsubscribe(&self, subscription: SubscriptionId) -> Result<(), InfraError>;
    fn append_history(&self, entry: &TaskHistoryEntry) -> Result<(), InfraError>;
    fn list_history(&self, task_id: &str) -> Result<Vec<TaskHistoryEntry>, InfraError>;
}

#[derive(Default)]
struct Subscribers {
    next: AtomicU64,
    listeners: Mutex<Vec<(SubscriptionId, String, TaskListener)>>,
}

impl Subscribers {
    fn add(&self, user_id: &str, listener: TaskListener) -> Result<SubscriptionId, InfraError> {
        let id = SubscriptionId(self.next.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.lock()?;
        listeners.push((id, user_id.to_string(), listener));
        Ok(id)
    }

    fn remove(&self, subscription: SubscriptionId) -> Result<(), InfraError> {
        let mut listeners = self.lock()?;
        listeners.retain(|(id, _, _)| *id != subscription);
        Ok(())
    }

    fn notify(&self, change: &TaskChange) {
        // Listeners run outside the lock so they may call back into storage.
        let matching: Vec<TaskListener> = match self.listeners.lock() {
            Ok(listeners) => listeners
                .iter()
                .filter(|(_, user_id, _)| user_id == change.user_id())
                .map(|(_, _, listener)| Arc::clone(listener))
                .collect(),
            Err(error) => {
                tracing::warn!(error = %error, "task listener lock poisoned; change not delivered");
                return;
            }
        };
        for listener in matching {
            listener(change);
        }
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, Vec<(SubscriptionId, String, TaskListener)>>, InfraError> {
        self.listeners
            .lock()
            .map_err(|error| InfraError::InvalidConfig(format!("task listener lock poisoned: {error}")))
    }
}

const TASK_COLUMNS: &str = "id, user_id, title, description, priority, due_date, completed, \
     start_time, end_time, is_all_day, google_calendar_event_id, google_calendar_id, \
     sync_source, last_synced_at, recurring_frequency, recurring_custom_days, \
     recurring_end_date, recurring_end_after, recurring_occurrence_index, tags, updated_at";

pub struct SqliteTaskStorage {
    db_path: PathBuf,
    subscribers: Subscribers,
}

impl SqliteTaskStorage {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            subscribers: Subscribers::default(),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        Connection::open(&self.db_path).map_err(InfraError::from)
    }

    fn read_row(connection: &Connection, id: &str) -> Result<Option<TaskRow>, InfraError> {
        connection
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                task_row_from_sql,
            )
            .optional()
            .map_err(InfraError::from)
    }

    fn write_row(connection: &Connection, row: &TaskRow) -> Result<(), InfraError> {
        let custom_days = row
            .recurring_custom_days
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let tags = serde_json::to_string(&row.tags)?;
        connection.execute(
            "INSERT INTO tasks (id, user_id, title, description, priority, due_date, completed,
               start_time, end_time, is_all_day, google_calendar_event_id, google_calendar_id,
               sync_source, last_synced_at, recurring_frequency, recurring_custom_days,
               recurring_end_date, recurring_end_after, recurring_occurrence_index, tags, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)
             ON CONFLICT(id) DO UPDATE SET
               title = excluded.title,
               description = excluded.description,
               priority = excluded.priority,
               due_date = excluded.due_date,
               completed = excluded.completed,
               start_time = excluded.start_time,
               end_time = excluded.end_time,
               is_all_day = excluded.is_all_day,
               google_calendar_event_id = excluded.google_calendar_event_id,
               google_calendar_id = excluded.google_calendar_id,
               sync_source = excluded.sync_source,
               last_synced_at = excluded.last_synced_at,
               recurring_frequency = excluded.recurring_frequency,
               recurring_custom_days = excluded.recurring_custom_days,
               recurring_end_date = excluded.recurring_end_date,
               recurring_end_after = excluded.recurring_end_after,
               recurring_occurrence_index = excluded.recurring_occurrence_index,
               tags = excluded.tags,
               updated_at = excluded.updated_at",
            params![
                row.id,
                row.user_id,
                row.title,
                row.description,
                row.priority,
                row.due_date,
                row.completed,
                row.start_time,
                row.end_time,
                row.is_all_day,
                row.google_calendar_event_id,
                row.google_calendar_id,
                row.sync_source,
                row.last_synced_at,
                row.recurring_frequency,
                custom_days,
                row.recurring_end_date,
                row.recurring_end_after,
                row.recurring_occurrence_index,
                tags,
                row.updated_at,
            ],
        )?;
        Ok(())
    }
}

impl TaskStorage for SqliteTaskStorage {
    fn insert(&self, user_id: &str, patch: &TaskRowPatch) -> Result<TaskRow, InfraError> {
        let row = TaskRow::from_insert(&next_id("tsk"), user_id, patch, Utc::now())?;
        let connection = self.connect()?;
        Self::write_row(&connection, &row)?;
        self.subscribers.notify(&TaskChange::Inserted(row.clone()));
        Ok(row)
    }

    fn update(&self, id: &str, patch: &TaskRowPatch) -> Result<TaskRow, InfraError> {
        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;
        let mut row = Self::read_row(&transaction, id)?
            .ok_or_else(|| InfraError::TaskNotFound(id.to_string()))?;
        row.apply(patch, &format_storage_instant(Utc::now()));
        Self::write_row(&transaction, &row)?;
        transaction.commit()?;
        self.subscribers.notify(&TaskChange::Updated(row.clone()));
        Ok(row)
    }

    fn delete(&self, id: &str) -> Result<(), InfraError> {
        let connection = self.connect()?;
        let Some(row) = Self::read_row(&connection, id)? else {
            return Err(InfraError::TaskNotFound(id.to_string()));
        };
        connection.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        self.subscribers.notify(&TaskChange::Deleted {
            id: row.id,
            user_id: row.user_id,
        });
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<TaskRow>, InfraError> {
        let connection = self.connect()?;
        Self::read_row(&connection, id)
    }

    fn list_by_user(&self, user_id: &str) -> Result<Vec<TaskRow>, InfraError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE user_id = ?1 ORDER BY due_date, id"
        ))?;
        let rows = statement
            .query_map(params![user_id], task_row_from_sql)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn find_by_calendar_event(
        &self,
        user_id: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<Option<TaskRow>, InfraError> {
        let connection = self.connect()?;
        connection
            .query_row(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE user_id = ?1 AND google_calendar_id = ?2 AND google_calendar_event_id = ?3"
                ),
                params![user_id, calendar_id, event_id],
                task_row_from_sql,
            )
            .optional()
            .map_err(InfraError::from)
    }

    fn subscribe(&self, user_id: &str, listener: TaskListener) -> Result<SubscriptionId, InfraError> {
        self.subscribers.add(user_id, listener)
    }

    fn unsubscribe(&self, subscription: SubscriptionId) -> Result<(), InfraError> {
        self.subscribers.remove(subscription)
    }

    fn append_history(&self, entry: &TaskHistoryEntry) -> Result<(), InfraError> {
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO task_history (id, task_id, task_title, action, timestamp, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.id,
                entry.task_id,
                entry.task_title,
                entry.action.as_str(),
                format_storage_instant(entry.timestamp),
                entry.details,
            ],
        )?;
        Ok(())
    }

    fn list_history(&self, task_id: &str) -> Result<Vec<TaskHistoryEntry>, InfraError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(
            "SELECT id, task_id, task_title, action, timestamp, details
             FROM task_history WHERE task_id = ?1 ORDER BY timestamp, rowid",
        )?;
        let raw_rows = statement
            .query_map(params![task_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw_rows
            .into_iter()
            .map(|(id, task_id, task_title, action, timestamp, details)| {
                let action = HistoryAction::parse(&action).map_err(InfraError::Validation)?;
                let timestamp = parse_instant(&timestamp).ok_or_else(|| {
                    InfraError::Validation(format!("invalid task_history.timestamp '{timestamp}'"))
                })?;
                Ok(TaskHistoryEntry {
                    id,
                    task_id,
                    task_title,
                    action,
                    timestamp,
                    details,
                })
            })
            .collect()
    }
}

fn task_row_from_sql(row: &Row<'_>) -> rusqlite::Result<TaskRow> {
    let custom_days: Option<String> = row.get(15)?;
    let tags: String = row.get(19)?;
    Ok(TaskRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        priority: row.get(4)?,
        due_date: row.get(5)?,
        completed: row.get(6)?,
        start_time: row.get(7)?,
        end_time: row.get(8)?,
        is_all_day: row.get(9)?,
        google_calendar_event_id: row.get(10)?,
        google_calendar_id: row.get(11)?,
        sync_source: row.get(12)?,
        last_synced_at: row.get(13)?,
        recurring_frequency: row.get(14)?,
        recurring_custom_days: custom_days
            .map(|value| decode_json_column(15, &value))
            .transpose()?,
        recurring_end_date: row.get(16)?,
        recurring_end_after: row.get(17)?,
        recurring_occurrence_index: row.get(18)?,
        tags: decode_json_column(19, &tags)?,
        updated_at: row.get(20)?,
    })
}

fn decode_json_column(index: usize, value: &str) -> rusqlite::Result<Vec<String>> {
    serde_json::from_str(value)
        .map_err(|error| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(error)))
}

#[cfg(test)]
pub use fake::InMemoryTaskStorage;
