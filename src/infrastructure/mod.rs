pub mod config;
pub mod credential_store;
pub mod error;
pub mod event_mapper;
pub mod google_calendar_client;
pub mod logging;
pub mod oauth_client;
pub mod storage;
pub mod task_mapper;
pub mod task_storage;
