pub mod bootstrap;
pub mod calendar_sync;
pub mod oauth;
pub mod sync_scheduler;
pub mod task_service;
