use crate::application::calendar_sync::CalendarReconciler;
use crate::application::oauth::{load_oauth_config_from_env, OAuthConfig, OAuthManager};
use crate::application::sync_scheduler::SyncScheduler;
use crate::application::task_service::TaskService;
use crate::domain::timezone::{parse_timezone, resolve_local_timezone};
use crate::infrastructure::config::{
    ensure_default_configs, load_configs, read_sync_settings, read_timezone, SyncSettings,
};
use crate::infrastructure::credential_store::KeyringIntegrationStore;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::google_calendar_client::ReqwestGoogleCalendarClient;
use crate::infrastructure::logging::init_tracing;
use crate::infrastructure::oauth_client::ReqwestOAuthClient;
use crate::infrastructure::storage::initialize_database;
use crate::infrastructure::task_storage::SqliteTaskStorage;
use chrono_tz::Tz;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;

pub type AppOAuthManager = OAuthManager<KeyringIntegrationStore, ReqwestOAuthClient>;
pub type AppReconciler = CalendarReconciler<
    SqliteTaskStorage,
    ReqwestGoogleCalendarClient,
    KeyringIntegrationStore,
    ReqwestOAuthClient,
>;
pub type AppTaskService = TaskService<SqliteTaskStorage, AppReconciler>;

#[derive(Debug)]
pub struct BootstrapResult {
    pub workspace_root: PathBuf,
    pub config_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub database_path: PathBuf,
}

pub fn bootstrap_workspace(workspace_root: &Path) -> Result<BootstrapResult, InfraError> {
    let config_dir = workspace_root.join("config");
    let state_dir = workspace_root.join("state");
    let logs_dir = workspace_root.join("logs");
    let database_path = state_dir.join("taskcal.sqlite");

    fs::create_dir_all(&config_dir)?;
    fs::create_dir_all(&state_dir)?;
    fs::create_dir_all(&logs_dir)?;

    ensure_default_configs(&config_dir)?;
    let _ = load_configs(&config_dir)?;
    initialize_database(&database_path)?;

    Ok(BootstrapResult {
        workspace_root: workspace_root.to_path_buf(),
        config_dir,
        logs_dir,
        database_path,
    })
}

/// Configured zone, or the machine's zone when `app.json` leaves it null.
pub fn configured_timezone(config_dir: &Path) -> Result<Tz, InfraError> {
    match read_timezone(config_dir)? {
        Some(name) => parse_timezone(&name)
            .ok_or_else(|| InfraError::InvalidConfig(format!("unknown app.timezone '{name}'"))),
        None => Ok(resolve_local_timezone()),
    }
}

/// Production wiring: SQLite tasks, keyring tokens, Google over reqwest.
pub struct AppContext {
    pub workspace: BootstrapResult,
    pub timezone: Tz,
    pub settings: SyncSettings,
    pub storage: Arc<SqliteTaskStorage>,
    pub oauth: Arc<AppOAuthManager>,
    pub reconciler: Arc<AppReconciler>,
    _log_guard: Option<WorkerGuard>,
}

impl AppContext {
    pub fn open(workspace_root: &Path) -> Result<Self, InfraError> {
        Self::open_with_oauth_config(workspace_root, load_oauth_config_from_env()?)
    }

    pub fn open_with_oauth_config(
        workspace_root: &Path,
        oauth_config: OAuthConfig,
    ) -> Result<Self, InfraError> {
        let workspace = bootstrap_workspace(workspace_root)?;
        let log_guard = init_tracing(&workspace.logs_dir);
        let timezone = configured_timezone(&workspace.config_dir)?;
        let settings = read_sync_settings(&workspace.config_dir)?;

        let storage = Arc::new(SqliteTaskStorage::new(&workspace.database_path));
        let oauth = Arc::new(OAuthManager::new(
            oauth_config,
            Arc::new(KeyringIntegrationStore::default()),
            Arc::new(ReqwestOAuthClient::new()),
        ));
        let reconciler = Arc::new(CalendarReconciler::new(
            Arc::clone(&storage),
            Arc::new(ReqwestGoogleCalendarClient::new()),
            Arc::clone(&oauth),
            settings.clone(),
            timezone,
        ));

        tracing::info!(
            workspace = %workspace.workspace_root.display(),
            timezone = timezone.name(),
            auto_sync = settings.auto_sync,
            "taskcal core ready"
        );
        Ok(Self {
            workspace,
            timezone,
            settings,
            storage,
            oauth,
            reconciler,
            _log_guard: log_guard,
        })
    }

    /// Scheduler for one signed-in user; the periodic timer is already
    /// running when auto sync is on. Must be called inside a tokio runtime.
    pub fn scheduler(&self, user_id: &str) -> SyncScheduler<AppReconciler> {
        let scheduler = SyncScheduler::new(user_id, Arc::clone(&self.reconciler), &self.settings);
        scheduler.start_periodic(Duration::from_secs(
            self.settings.interval_minutes.saturating_mul(60),
        ));
        scheduler
    }

    pub fn task_service(
        &self,
        user_id: &str,
        scheduler: SyncScheduler<AppReconciler>,
    ) -> AppTaskService {
        TaskService::new(user_id, Arc::clone(&self.storage), self.timezone).with_scheduler(scheduler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::oauth::testing::test_config;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_TEMP_WORKSPACE: AtomicUsize = AtomicUsize::new(0);

    struct TempWorkspace {
        path: PathBuf,
    }

    impl TempWorkspace {
        fn new() -> Self {
            let sequence = NEXT_TEMP_WORKSPACE.fetch_add(1, Ordering::Relaxed);
            let path = std::env::temp_dir().join(format!(
                "taskcal-bootstrap-tests-{}-{}",
                std::process::id(),
                sequence
            ));
            fs::create_dir_all(&path).expect("create temp workspace");
            Self { path }
        }
    }

    impl Drop for TempWorkspace {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn bootstrap_creates_layout_and_is_repeatable() {
        let workspace = TempWorkspace::new();
        let first = bootstrap_workspace(&workspace.path).expect("bootstrap");
        assert!(first.config_dir.join("app.json").exists());
        assert!(first.config_dir.join("sync.json").exists());
        assert!(first.logs_dir.is_dir());
        assert!(first.database_path.ends_with("state/taskcal.sqlite"));
        assert!(first.database_path.exists());

        let second = bootstrap_workspace(&workspace.path).expect("bootstrap again");
        assert_eq!(second.database_path, first.database_path);
    }

    #[test]
    fn configured_timezone_is_validated() {
        let workspace = TempWorkspace::new();
        let result = bootstrap_workspace(&workspace.path).expect("bootstrap");
        fs::write(
            result.config_dir.join("app.json"),
            r#"{"schema":1,"appName":"TaskCal","timezone":"Europe/Berlin"}"#,
        )
        .expect("write app config");
        assert_eq!(
            configured_timezone(&result.config_dir).expect("timezone"),
            chrono_tz::Europe::Berlin
        );

        fs::write(
            result.config_dir.join("app.json"),
            r#"{"schema":1,"appName":"TaskCal","timezone":"Mars/Olympus"}"#,
        )
        .expect("write app config");
        assert!(matches!(
            configured_timezone(&result.config_dir),
            Err(InfraError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn context_wires_services_against_the_workspace() {
        let workspace = TempWorkspace::new();
        let context =
            AppContext::open_with_oauth_config(&workspace.path, test_config()).expect("open");
        let scheduler = context.scheduler("user-1");
        let service = context.task_service("user-1", scheduler.clone());

        let task = service
            .create_task(crate::application::task_service::NewTask::new(
                "Wired",
                chrono::NaiveDate::from_ymd_opt(2024, 6, 12).expect("valid date"),
            ))
            .expect("create");
        assert_eq!(service.list_tasks().expect("list"), vec![task]);
        scheduler.stop();
    }
}
