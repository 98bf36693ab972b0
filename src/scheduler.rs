//! Wall-clock update scheduler.
//!
//! Fires the update task at fixed local hours and whenever the app comes back
//! to the foreground. The next fire instant is recomputed after every fire,
//! never taken from a repeating interval, so clock drift and DST shifts
//! correct themselves on the following cycle.

use async_trait::async_trait;
use chrono::{DateTime, Days, Local, TimeDelta, TimeZone};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_FIRE_HOURS;
use crate::error::ConfigError;

/// Local hours of the day (minute and second zero) at which updates fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FireHours(Vec<u32>);

impl FireHours {
    pub fn new(hours: impl IntoIterator<Item = u32>) -> Result<Self, ConfigError> {
        let mut hours: Vec<u32> = hours.into_iter().collect();

        if let Some(bad) = hours.iter().find(|h| **h > 23) {
            return Err(ConfigError::InvalidValue {
                field: "fire_hours",
                reason: format!("{bad} is not an hour of the day"),
            });
        }
        if hours.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "fire_hours",
                reason: "at least one hour is required".into(),
            });
        }

        hours.sort_unstable();
        hours.dedup();
        Ok(Self(hours))
    }

    pub fn hours(&self) -> &[u32] {
        &self.0
    }
}

impl Default for FireHours {
    fn default() -> Self {
        Self(DEFAULT_FIRE_HOURS.to_vec())
    }
}

impl FromStr for FireHours {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hours = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<u32>().map_err(|e| ConfigError::InvalidValue {
                    field: "fire_hours",
                    reason: format!("{part:?}: {e}"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(hours)
    }
}

/// First fire hour strictly after `after`, rolling into following days.
///
/// An hour skipped by a DST jump is passed over; a repeated hour fires at its
/// earliest occurrence.
pub fn next_fire_instant<Tz: TimeZone>(after: &DateTime<Tz>, hours: &FireHours) -> DateTime<Tz> {
    let zone = after.timezone();
    let today = after.date_naive();

    for offset in 0..=2 {
        let Some(day) = today.checked_add_days(Days::new(offset)) else {
            continue;
        };
        for &hour in hours.hours() {
            let candidate = day
                .and_hms_opt(hour, 0, 0)
                .and_then(|naive| zone.from_local_datetime(&naive).earliest());
            if let Some(candidate) = candidate {
                if candidate > *after {
                    return candidate;
                }
            }
        }
    }

    after.clone() + TimeDelta::days(1)
}

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Local>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Application lifecycle as reported by the host shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Active,
    Inactive,
    Background,
}

impl AppState {
    /// Whether moving from `self` to `next` brings the app to the foreground.
    pub fn resumes(self, next: AppState) -> bool {
        matches!(self, AppState::Inactive | AppState::Background) && next == AppState::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Scheduled,
    Foreground,
    Manual,
}

/// Work run on every trigger, typically a board refresh.
#[async_trait]
pub trait UpdateTask: Send + Sync {
    async fn run(&self, trigger: Trigger);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Waiting(DateTime<Local>),
    Firing,
}

#[derive(Debug)]
enum SchedulerEvent {
    Lifecycle(AppState),
    Manual,
}

pub struct Scheduler<C = SystemClock> {
    hours: FireHours,
    clock: C,
}

impl Scheduler<SystemClock> {
    pub fn new(hours: FireHours) -> Self {
        Self::with_clock(hours, SystemClock)
    }
}

impl<C: Clock> Scheduler<C> {
    pub fn with_clock(hours: FireHours, clock: C) -> Self {
        Self { hours, clock }
    }

    /// Spawn the scheduler loop on the current tokio runtime.
    pub fn start(self, task: Arc<dyn UpdateTask>) -> SchedulerHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(SchedulerState::Idle);

        let join = tokio::spawn(self.run(task, events_rx, shutdown_rx, state_tx));

        SchedulerHandle {
            events: events_tx,
            state: state_rx,
            shutdown: shutdown_tx,
            join,
        }
    }

    async fn run(
        self,
        task: Arc<dyn UpdateTask>,
        mut events: mpsc::UnboundedReceiver<SchedulerEvent>,
        mut shutdown: oneshot::Receiver<()>,
        state: watch::Sender<SchedulerState>,
    ) {
        let mut app_state = AppState::Active;
        let mut last_fired: Option<DateTime<Local>> = None;
        let mut listening = true;

        loop {
            let now = self.clock.now();
            let reference = match last_fired {
                Some(fired) if fired > now => fired,
                _ => now,
            };
            let target = next_fire_instant(&reference, &self.hours);
            let delay = (target - now).to_std().unwrap_or_default();

            info!(next = %target, "Next scheduled update");
            state.send_replace(SchedulerState::Waiting(target));

            let timer = tokio::time::sleep(delay);
            tokio::pin!(timer);

            // Lifecycle and manual triggers do not touch the pending timer.
            loop {
                tokio::select! {
                    _ = &mut shutdown => {
                        state.send_replace(SchedulerState::Idle);
                        debug!("Scheduler stopped");
                        return;
                    }
                    () = &mut timer => break,
                    event = events.recv(), if listening => {
                        listening = dispatch(event, &mut app_state, &task);
                    }
                }
            }

            state.send_replace(SchedulerState::Firing);
            info!("Running scheduled update");
            let mut firing = spawn_update(&task, Trigger::Scheduled);

            // The scheduled update is awaited before the next timer is armed,
            // but other triggers are still served while it runs.
            loop {
                tokio::select! {
                    result = &mut firing => {
                        if let Err(e) = result {
                            warn!(error = %e, "Scheduled update ended abnormally");
                        }
                        break;
                    }
                    event = events.recv(), if listening => {
                        listening = dispatch(event, &mut app_state, &task);
                    }
                }
            }
            last_fired = Some(target);
        }
    }
}

/// Handle one trigger event. Returns whether the event channel is still open.
fn dispatch(
    event: Option<SchedulerEvent>,
    app_state: &mut AppState,
    task: &Arc<dyn UpdateTask>,
) -> bool {
    match event {
        Some(SchedulerEvent::Lifecycle(next)) => {
            if app_state.resumes(next) {
                info!("App active, updating");
                spawn_update(task, Trigger::Foreground);
            }
            *app_state = next;
            true
        }
        Some(SchedulerEvent::Manual) => {
            spawn_update(task, Trigger::Manual);
            true
        }
        None => false,
    }
}

fn spawn_update(task: &Arc<dyn UpdateTask>, trigger: Trigger) -> JoinHandle<()> {
    let task = Arc::clone(task);
    tokio::spawn(async move { task.run(trigger).await })
}

/// Control surface of a running scheduler. Dropping it stops the loop.
pub struct SchedulerHandle {
    events: mpsc::UnboundedSender<SchedulerEvent>,
    state: watch::Receiver<SchedulerState>,
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Report a lifecycle change; a background/inactive to active transition
    /// fires an immediate update.
    pub fn notify_lifecycle(&self, next: AppState) {
        let _ = self.events.send(SchedulerEvent::Lifecycle(next));
    }

    /// User-initiated refresh.
    pub fn trigger_now(&self) {
        let _ = self.events.send(SchedulerEvent::Manual);
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SchedulerState> {
        self.state.clone()
    }

    /// Cancel the pending timer and wait for the loop to exit. An update that
    /// is already running completes first.
    pub async fn shutdown(self) {
        let Self { shutdown, join, .. } = self;
        let _ = shutdown.send(());
        if let Err(e) = join.await {
            warn!(error = %e, "Scheduler task ended abnormally");
        }
    }
}
