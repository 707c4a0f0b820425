use crate::application::calendar_sync::{CalendarSync, SyncReport};
use crate::infrastructure::config::SyncSettings;
use crate::infrastructure::error::InfraError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Initial,
    Manual,
    Periodic,
    LocalChange,
}

impl SyncTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Manual => "manual",
            Self::Periodic => "periodic",
            Self::LocalChange => "local_change",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAttempt {
    Completed(SyncReport),
    /// Another pass was already running; nothing was done.
    Coalesced,
    /// A newer request arrived mid-pass; the report was discarded.
    Superseded,
    /// Sync is off until the user reconnects.
    Disabled,
    Failed(String),
}

struct SchedulerState<S: CalendarSync> {
    user_id: String,
    calendar: Arc<S>,
    auto_sync: bool,
    debounce: Duration,
    in_progress: AtomicBool,
    generation: AtomicU64,
    disabled: AtomicBool,
    debounce_task: Mutex<Option<JoinHandle<()>>>,
    periodic_task: Mutex<Option<JoinHandle<()>>>,
    last_report: Mutex<Option<SyncReport>>,
}

impl<S: CalendarSync> Drop for SchedulerState<S> {
    fn drop(&mut self) {
        for slot in [&self.debounce_task, &self.periodic_task] {
            if let Ok(mut handle) = slot.lock() {
                if let Some(handle) = handle.take() {
                    handle.abort();
                }
            }
        }
    }
}

/// Serializes one user's sync triggers: startup, timer, debounced local
/// edits and manual requests.
pub struct SyncScheduler<S: CalendarSync + 'static> {
    state: Arc<SchedulerState<S>>,
}

impl<S: CalendarSync + 'static> Clone for SyncScheduler<S> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<S: CalendarSync + 'static> SyncScheduler<S> {
    pub fn new(user_id: impl Into<String>, calendar: Arc<S>, settings: &SyncSettings) -> Self {
        Self {
            state: Arc::new(SchedulerState {
                user_id: user_id.into(),
                calendar,
                auto_sync: settings.auto_sync,
                debounce: Duration::from_secs(settings.debounce_seconds),
                in_progress: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                disabled: AtomicBool::new(false),
                debounce_task: Mutex::new(None),
                periodic_task: Mutex::new(None),
                last_report: Mutex::new(None),
            }),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.state.user_id
    }

    pub fn calendar(&self) -> &Arc<S> {
        &self.state.calendar
    }

    pub fn is_disabled(&self) -> bool {
        self.state.disabled.load(Ordering::SeqCst)
    }

    /// Most recent report from a pass that was not superseded.
    pub fn last_report(&self) -> Option<SyncReport> {
        self.state
            .last_report
            .lock()
            .ok()
            .and_then(|report| report.clone())
    }

    pub async fn initial_sync(&self) -> SyncAttempt {
        if !self.state.auto_sync {
            return SyncAttempt::Disabled;
        }
        self.sync_now(SyncTrigger::Initial).await
    }

    pub async fn sync_now(&self, trigger: SyncTrigger) -> SyncAttempt {
        let state = &self.state;
        let user_id = state.user_id.as_str();
        if state.disabled.load(Ordering::SeqCst) {
            return SyncAttempt::Disabled;
        }
        if state
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!(user_id, trigger = trigger.as_str(), "sync already running; coalesced");
            return SyncAttempt::Coalesced;
        }

        let started_generation = state.generation.load(Ordering::SeqCst);
        tracing::debug!(user_id, trigger = trigger.as_str(), "sync pass started");
        let result = {
            let _running = InProgress(&state.in_progress);
            state.calendar.sync_pass(user_id).await
        };

        match result {
            Ok(report) => {
                if state.generation.load(Ordering::SeqCst) != started_generation {
                    tracing::debug!(user_id, trigger = trigger.as_str(), "sync pass superseded by a newer request");
                    return SyncAttempt::Superseded;
                }
                if let Ok(mut last_report) = state.last_report.lock() {
                    *last_report = Some(report.clone());
                }
                SyncAttempt::Completed(report)
            }
            Err(InfraError::SyncUnavailable(message)) => {
                tracing::warn!(user_id, reason = %message, "calendar sync disabled until reconnect");
                state.disabled.store(true, Ordering::SeqCst);
                SyncAttempt::Failed(message)
            }
            Err(error) => {
                tracing::warn!(user_id, trigger = trigger.as_str(), error = %error, "sync pass failed");
                SyncAttempt::Failed(error.to_string())
            }
        }
    }

    /// Restarts the debounce timer; a burst of edits yields one pass.
    /// Restarting only cancels the wait. A pass the timer already started
    /// runs to completion on its own task and is superseded instead.
    pub fn notify_local_change(&self) {
        if !self.state.auto_sync || self.is_disabled() {
            return;
        }
        self.state.generation.fetch_add(1, Ordering::SeqCst);

        let weak = Arc::downgrade(&self.state);
        let debounce = self.state.debounce;
        let handle = tokio::spawn(async move {
            loop {
                sleep(debounce).await;
                let Some(scheduler) = upgrade(&weak) else {
                    return;
                };
                let pass = tokio::spawn(async move {
                    scheduler.sync_now(SyncTrigger::LocalChange).await
                });
                match pass.await {
                    Ok(SyncAttempt::Coalesced) => continue,
                    _ => return,
                }
            }
        });
        replace_task(&self.state.debounce_task, handle);
    }

    pub fn start_periodic(&self, every: Duration) {
        if !self.state.auto_sync {
            return;
        }
        let weak = Arc::downgrade(&self.state);
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            loop {
                ticker.tick().await;
                let Some(scheduler) = upgrade(&weak) else {
                    return;
                };
                if !scheduler.is_disabled() {
                    scheduler.sync_now(SyncTrigger::Periodic).await;
                }
            }
        });
        replace_task(&self.state.periodic_task, handle);
    }

    /// Re-enables sync after the user connects the calendar again.
    pub fn reconnected(&self) {
        self.state.disabled.store(false, Ordering::SeqCst);
        tracing::info!(user_id = %self.state.user_id, "calendar sync re-enabled");
    }

    pub fn stop(&self) {
        for slot in [&self.state.debounce_task, &self.state.periodic_task] {
            if let Ok(mut handle) = slot.lock() {
                if let Some(handle) = handle.take() {
                    handle.abort();
                }
            }
        }
    }
}

/// Clears the in-progress flag even when the pass future is dropped.
struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn upgrade<S: CalendarSync + 'static>(weak: &Weak<SchedulerState<S>>) -> Option<SyncScheduler<S>> {
    weak.upgrade().map(|state| SyncScheduler { state })
}

fn replace_task(slot: &Mutex<Option<JoinHandle<()>>>, handle: JoinHandle<()>) {
    match slot.lock() {
        Ok(mut current) => {
            if let Some(previous) = current.replace(handle) {
                previous.abort();
            }
        }
        Err(_) => handle.abort(),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeCalendarSync;
    use super::*;

    fn scheduler(fake: &Arc<FakeCalendarSync>) -> SyncScheduler<FakeCalendarSync> {
        SyncScheduler::new("user-1", Arc::clone(fake), &SyncSettings::default())
    }

    fn calls(fake: &FakeCalendarSync) -> usize {
        fake.sync_calls.load(Ordering::SeqCst)
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_triggers_coalesce() {
        let fake = Arc::new(FakeCalendarSync::with_pass_duration(Duration::from_secs(1)));
        let scheduler = scheduler(&fake);

        let running = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.sync_now(SyncTrigger::Manual).await })
        };
        sleep(Duration::from_millis(10)).await;

        assert_eq!(scheduler.sync_now(SyncTrigger::Periodic).await, SyncAttempt::Coalesced);
        assert!(matches!(running.await.expect("join"), SyncAttempt::Completed(_)));
        assert_eq!(calls(&fake), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_local_changes_runs_one_pass() {
        let fake = Arc::new(FakeCalendarSync::default());
        let scheduler = scheduler(&fake);

        for _ in 0..3 {
            scheduler.notify_local_change();
            sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(calls(&fake), 0);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(calls(&fake), 1);
        assert!(scheduler.last_report().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn newer_request_supersedes_in_flight_pass() {
        let fake = Arc::new(FakeCalendarSync::with_pass_duration(Duration::from_secs(2)));
        let scheduler = scheduler(&fake);

        let running = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.sync_now(SyncTrigger::Manual).await })
        };
        sleep(Duration::from_millis(100)).await;
        scheduler.notify_local_change();

        assert_eq!(running.await.expect("join"), SyncAttempt::Superseded);
        assert!(scheduler.last_report().is_none());

        sleep(Duration::from_secs(10)).await;
        assert_eq!(calls(&fake), 2);
        assert!(scheduler.last_report().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn debounced_pass_waits_out_a_running_one() {
        let fake = Arc::new(FakeCalendarSync::with_pass_duration(Duration::from_secs(8)));
        let scheduler = scheduler(&fake);

        scheduler.notify_local_change();
        let running = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.sync_now(SyncTrigger::Manual).await })
        };
        running.await.expect("join");
        assert_eq!(calls(&fake), 1);

        sleep(Duration::from_secs(20)).await;
        assert_eq!(calls(&fake), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn local_change_during_debounced_pass_does_not_wedge_scheduler() {
        let fake = Arc::new(FakeCalendarSync::with_pass_duration(Duration::from_secs(10)));
        let scheduler = scheduler(&fake);

        scheduler.notify_local_change();
        sleep(Duration::from_secs(6)).await;
        assert_eq!(calls(&fake), 1);
        scheduler.notify_local_change();

        sleep(Duration::from_secs(120)).await;
        assert_eq!(calls(&fake), 2);
        assert!(scheduler.last_report().is_some());
        assert!(matches!(
            scheduler.sync_now(SyncTrigger::Manual).await,
            SyncAttempt::Completed(_)
        ));
        assert_eq!(calls(&fake), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_pass_releases_the_running_flag() {
        let fake = Arc::new(FakeCalendarSync::with_pass_duration(Duration::from_secs(10)));
        let scheduler = scheduler(&fake);

        let running = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.sync_now(SyncTrigger::Manual).await })
        };
        sleep(Duration::from_secs(1)).await;
        running.abort();
        let _ = running.await;

        assert!(matches!(
            scheduler.sync_now(SyncTrigger::Manual).await,
            SyncAttempt::Completed(_)
        ));
        assert_eq!(calls(&fake), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_sync_stays_disabled_until_reconnect() {
        let fake = Arc::new(FakeCalendarSync::default());
        fake.push_result(Err(InfraError::SyncUnavailable("revoked".to_string())));
        let scheduler = scheduler(&fake);

        assert_eq!(
            scheduler.sync_now(SyncTrigger::Manual).await,
            SyncAttempt::Failed("revoked".to_string())
        );
        assert!(scheduler.is_disabled());
        assert_eq!(scheduler.sync_now(SyncTrigger::Manual).await, SyncAttempt::Disabled);
        scheduler.notify_local_change();
        sleep(Duration::from_secs(10)).await;
        assert_eq!(calls(&fake), 1);

        scheduler.reconnected();
        assert!(matches!(
            scheduler.sync_now(SyncTrigger::Manual).await,
            SyncAttempt::Completed(_)
        ));
        assert_eq!(calls(&fake), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn other_failures_keep_sync_enabled() {
        let fake = Arc::new(FakeCalendarSync::default());
        fake.push_result(Err(InfraError::Provider("network error: connection reset".to_string())));
        let scheduler = scheduler(&fake);

        assert!(matches!(
            scheduler.sync_now(SyncTrigger::Manual).await,
            SyncAttempt::Failed(_)
        ));
        assert!(!scheduler.is_disabled());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_timer_fires_each_interval() {
        let fake = Arc::new(FakeCalendarSync::default());
        let scheduler = scheduler(&fake);
        scheduler.start_periodic(Duration::from_secs(60));

        sleep(Duration::from_secs(185)).await;
        assert_eq!(calls(&fake), 3);

        scheduler.stop();
        sleep(Duration::from_secs(120)).await;
        assert_eq!(calls(&fake), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_sync_off_skips_automatic_triggers() {
        let fake = Arc::new(FakeCalendarSync::default());
        let settings = SyncSettings {
            auto_sync: false,
            ..SyncSettings::default()
        };
        let scheduler = SyncScheduler::new("user-1", Arc::clone(&fake), &settings);

        assert_eq!(scheduler.initial_sync().await, SyncAttempt::Disabled);
        scheduler.notify_local_change();
        scheduler.start_periodic(Duration::from_secs(1));
        sleep(Duration::from_secs(30)).await;
        assert_eq!(calls(&fake), 0);

        assert!(matches!(
            scheduler.sync_now(SyncTrigger::Manual).await,
            SyncAttempt::Completed(_)
        ));
    }
}
