pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::bootstrap::{bootstrap_workspace, AppContext, BootstrapResult};
pub use application::calendar_sync::{
    CalendarReconciler, CalendarSync, SyncDirection, SyncItemResult, SyncItemStatus, SyncReport,
};
pub use application::oauth::{EnsureTokenResult, OAuthConfig, OAuthManager};
pub use application::sync_scheduler::{SyncAttempt, SyncScheduler, SyncTrigger};
pub use application::task_service::{NewTask, TaskService};
pub use domain::models::{
    CalendarLink, EndCondition, Frequency, HistoryAction, Priority, RecurrenceRule, SyncSource,
    Task, TaskHistoryEntry, TaskTiming,
};
pub use domain::recurrence::{schedule_next_occurrence, RecurrenceError};
pub use infrastructure::error::InfraError;
pub use infrastructure::task_mapper::{
    display_fields, from_storage_row, to_storage_row, DueDateInput, TaskDisplay, TaskPatch, TaskRow,
};
