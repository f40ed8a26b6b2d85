//! Timer-driven entity action scheduler.
//!
//! # Responsibilities
//! - Periodically invoke an async action on registered entities
//! - Guarantee at most one in-flight action per entity at any instant
//! - Change periods without racing a pending timer fire
//! - Evict an entity whose action fails, leaving the rest untouched
//!
//! # Design Decisions
//! - Every arming spawns a fresh one-shot timer carrying a version
//!   number; a stale fire sees a mismatched version and exits without
//!   touching state
//! - Entries hold only a weak reference to the scheduler, so in-flight
//!   timers never extend its lifetime: once every external owner is
//!   gone, pending fires observe the absence and wind down
//! - Action failures are logged, never propagated; the callbacks run on
//!   executor threads where a propagated panic would take out unrelated
//!   entities

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::BoxError;

/// How often an entity's action runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerMode {
    /// Each entity fires once and is removed before its action runs.
    RunOnce,
    /// Each entity is rearmed with its current period after every
    /// successful action, until unscheduled.
    Periodic,
}

const NOT_STARTED: u8 = 0;
const STARTED: u8 = 1;
const DISPOSED: u8 = 2;

type ActionFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;
type Action<E> = Arc<dyn Fn(E) -> ActionFuture + Send + Sync>;

struct EntryState {
    period: Duration,
    /// Monotonic arming counter; a timer fire with a stale version is
    /// ignored.
    version: u64,
    timer: Option<JoinHandle<()>>,
    running_callback: bool,
    disposed: bool,
}

struct Entry<E> {
    key: E,
    scheduler: Weak<SchedulerInner<E>>,
    state: Mutex<EntryState>,
}

impl<E> Entry<E> {
    fn dispose(&self) {
        let mut state = self.state.lock().expect("scheduler entry mutex poisoned");
        state.disposed = true;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }
}

struct SchedulerInner<E> {
    mode: SchedulerMode,
    action: Action<E>,
    state: AtomicU8,
    entries: Mutex<HashMap<E, Arc<Entry<E>>>>,
}

/// Invokes an injected async action on registered entities, one timer
/// per entity. Cloning shares the scheduler; `shutdown` (or dropping the
/// last handle) stops everything.
pub struct ActionScheduler<E>
where
    E: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    inner: Arc<SchedulerInner<E>>,
}

impl<E> Clone for ActionScheduler<E>
where
    E: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> ActionScheduler<E>
where
    E: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    pub fn new<F, Fut>(mode: SchedulerMode, action: F) -> Self
    where
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let action: Action<E> = Arc::new(move |entity| Box::pin(action(entity)) as ActionFuture);
        Self {
            inner: Arc::new(SchedulerInner {
                mode,
                action,
                state: AtomicU8::new(NOT_STARTED),
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register an entity with its initial period. Arms immediately when
    /// the scheduler is already started, otherwise at `start`. A second
    /// registration of the same entity is silently rejected; the
    /// existing entry keeps its period.
    pub fn schedule(&self, entity: E, period: Duration) {
        if self.inner.state.load(Ordering::Acquire) == DISPOSED {
            tracing::warn!(entity = ?entity, "Schedule on disposed scheduler ignored");
            return;
        }

        let entry = {
            let mut entries = self
                .inner
                .entries
                .lock()
                .expect("scheduler entries mutex poisoned");
            if entries.contains_key(&entity) {
                return;
            }
            let entry = Arc::new(Entry {
                key: entity.clone(),
                scheduler: Arc::downgrade(&self.inner),
                state: Mutex::new(EntryState {
                    period,
                    version: 0,
                    timer: None,
                    running_callback: false,
                    disposed: false,
                }),
            });
            entries.insert(entity, Arc::clone(&entry));
            entry
        };

        if self.inner.state.load(Ordering::Acquire) == STARTED {
            arm(&entry);
        }
    }

    /// Update an entity's period. A live timer is rearmed with the new
    /// period; otherwise the new period takes effect at the next arming.
    /// Meaningless in run-once mode.
    pub fn change_period(&self, entity: &E, period: Duration) {
        debug_assert!(
            self.inner.mode != SchedulerMode::RunOnce,
            "change_period is not supported in run-once mode"
        );

        let entry = self
            .inner
            .entries
            .lock()
            .expect("scheduler entries mutex poisoned")
            .get(entity)
            .cloned();

        let Some(entry) = entry else { return };

        let mut state = entry.state.lock().expect("scheduler entry mutex poisoned");
        state.period = period;
        if state.disposed || state.running_callback {
            // The next arming picks the new period up.
            return;
        }
        if let Some(timer) = state.timer.take() {
            timer.abort();
            arm_locked(&entry, &mut state);
        }
    }

    /// Remove an entity. A currently executing callback runs to
    /// completion, but no further timer arms.
    pub fn unschedule(&self, entity: &E) {
        let removed = self
            .inner
            .entries
            .lock()
            .expect("scheduler entries mutex poisoned")
            .remove(entity);
        if let Some(entry) = removed {
            entry.dispose();
        }
    }

    pub fn is_scheduled(&self, entity: &E) -> bool {
        self.inner
            .entries
            .lock()
            .expect("scheduler entries mutex poisoned")
            .contains_key(entity)
    }

    /// Begin firing timers. The first call wins and arms every entity
    /// registered so far; later calls are no-ops.
    pub fn start(&self) {
        if self
            .inner
            .state
            .compare_exchange(NOT_STARTED, STARTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let entries: Vec<_> = self
                .inner
                .entries
                .lock()
                .expect("scheduler entries mutex poisoned")
                .values()
                .cloned()
                .collect();
            for entry in entries {
                arm(&entry);
            }
        }
    }

    /// Cancel and dispose every entry. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.state.swap(DISPOSED, Ordering::AcqRel) == DISPOSED {
            return;
        }
        let entries: Vec<_> = {
            let mut map = self
                .inner
                .entries
                .lock()
                .expect("scheduler entries mutex poisoned");
            map.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.dispose();
        }
    }
}

impl<E> Drop for ActionScheduler<E>
where
    E: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    fn drop(&mut self) {
        // Last external owner going away cancels timers eagerly. Fires
        // already in flight observe the weak reference instead.
        if Arc::strong_count(&self.inner) == 1 {
            self.shutdown();
        }
    }
}

fn arm<E>(entry: &Arc<Entry<E>>)
where
    E: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    let mut state = entry.state.lock().expect("scheduler entry mutex poisoned");
    if state.disposed || state.timer.is_some() {
        return;
    }
    arm_locked(entry, &mut state);
}

fn arm_locked<E>(entry: &Arc<Entry<E>>, state: &mut EntryState)
where
    E: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    state.version += 1;
    let version = state.version;
    let period = state.period;
    let entry = Arc::clone(entry);

    // One-shot timer. Spawned without the caller's span: timers outlive
    // requests, and captured request-scoped context would live with them.
    let timer = tokio::spawn(
        async move {
            tokio::time::sleep(period).await;
            timer_fired(entry, version).await;
        }
        .instrument(tracing::Span::none()),
    );
    state.timer = Some(timer);
}

async fn timer_fired<E>(entry: Arc<Entry<E>>, version: u64)
where
    E: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    // A scheduler with no remaining owners is winding down; do nothing.
    let Some(scheduler) = entry.scheduler.upgrade() else {
        return;
    };

    {
        let mut state = entry.state.lock().expect("scheduler entry mutex poisoned");
        if state.disposed || state.version != version {
            // Stale fire from a timer that was since rearmed.
            return;
        }
        state.timer = None;
        state.running_callback = true;
    }

    if scheduler.mode == SchedulerMode::RunOnce {
        // Removed and disposed before the action runs; the action
        // observing `is_scheduled == false` is expected.
        scheduler
            .entries
            .lock()
            .expect("scheduler entries mutex poisoned")
            .remove(&entry.key);
        entry
            .state
            .lock()
            .expect("scheduler entry mutex poisoned")
            .disposed = true;
    }

    let result = (scheduler.action)(entry.key.clone()).await;

    match result {
        Ok(()) => {
            if scheduler.mode == SchedulerMode::Periodic {
                let still_scheduled = scheduler
                    .entries
                    .lock()
                    .expect("scheduler entries mutex poisoned")
                    .get(&entry.key)
                    .map(|e| Arc::ptr_eq(e, &entry))
                    .unwrap_or(false);

                let mut state = entry.state.lock().expect("scheduler entry mutex poisoned");
                state.running_callback = false;
                if still_scheduled
                    && !state.disposed
                    && scheduler.state.load(Ordering::Acquire) == STARTED
                {
                    arm_locked(&entry, &mut state);
                }
            } else {
                entry
                    .state
                    .lock()
                    .expect("scheduler entry mutex poisoned")
                    .running_callback = false;
            }
        }
        Err(e) => {
            tracing::error!(entity = ?entry.key, error = %e, "Scheduled action failed; entity evicted");
            let removed = {
                let mut map = scheduler
                    .entries
                    .lock()
                    .expect("scheduler entries mutex poisoned");
                match map.get(&entry.key) {
                    Some(e) if Arc::ptr_eq(e, &entry) => map.remove(&entry.key),
                    _ => None,
                }
            };
            if let Some(removed) = removed {
                removed.dispose();
            }
            entry
                .state
                .lock()
                .expect("scheduler entry mutex poisoned")
                .running_callback = false;
        }
    }
}
