//! Debounced reply scheduling: at most one not-yet-started reply job per conversation.
//!
//! Each `schedule` call supersedes the pending job for the same key. Jobs that
//! already started are left alone and run to completion; only the next slot is
//! replaced. Every job carries a generation number, and a job only starts if
//! its generation is still the pending one for its key when the delay elapses.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::{sync::watch, task::JoinHandle};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
/// One scheduling slot: a user talking in a particular chat.
pub struct ConversationKey {
    pub user_id: String,
    pub chat_id: i64,
}

impl ConversationKey {
    pub fn new(user_id: impl Into<String>, chat_id: i64) -> Self {
        Self {
            user_id: user_id.into(),
            chat_id,
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user={} chat={}", self.user_id, self.chat_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Observable state of a key. A key can be `Running` an older job while a
/// newer one waits; `slot_state` reports the pending one first.
pub enum SlotState {
    Idle,
    Scheduled,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Cancelled,
}

impl JobOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

struct Slot {
    generation: u64,
    cancel_tx: watch::Sender<bool>,
}

#[derive(Default)]
struct SchedulerSlots {
    scheduled: HashMap<ConversationKey, Slot>,
    /// Started jobs in start order; an older job may still run when a newer one starts.
    running: HashMap<ConversationKey, Vec<Slot>>,
}

fn lock_slots(slots: &Mutex<SchedulerSlots>) -> Result<MutexGuard<'_, SchedulerSlots>> {
    slots
        .lock()
        .map_err(|_| anyhow!("reply scheduler mutex is poisoned"))
}

/// Handle returned by `DebounceScheduler::schedule`.
pub struct ScheduledReply {
    pub generation: u64,
    pub handle: JoinHandle<JobOutcome>,
}

#[derive(Clone)]
/// Passed to a started job so it can observe shutdown cancellation.
pub struct ReplyTicket {
    key: ConversationKey,
    generation: u64,
    cancel_rx: watch::Receiver<bool>,
    slots: Arc<Mutex<SchedulerSlots>>,
}

impl ReplyTicket {
    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True once cancellation was requested for this job.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// True while no newer job has been scheduled for the same key.
    pub fn is_current(&self) -> bool {
        let Ok(slots) = lock_slots(&self.slots) else {
            return false;
        };
        match slots.scheduled.get(&self.key) {
            Some(pending) => pending.generation == self.generation,
            None => slots
                .running
                .get(&self.key)
                .and_then(|running| running.last())
                .is_some_and(|newest| newest.generation == self.generation),
        }
    }

    async fn cancelled(&mut self) {
        // A closed channel means the slot was dropped, which only happens on supersede.
        let _ = self.cancel_rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Scheduled -> Running, only if this generation is still the pending one.
    fn begin(&self) -> bool {
        let Ok(mut slots) = lock_slots(&self.slots) else {
            return false;
        };
        let is_pending = slots
            .scheduled
            .get(&self.key)
            .is_some_and(|pending| pending.generation == self.generation);
        if !is_pending || self.is_cancelled() {
            return false;
        }
        if let Some(slot) = slots.scheduled.remove(&self.key) {
            slots.running.entry(self.key.clone()).or_default().push(slot);
        }
        true
    }

    fn finish(&self) {
        let Ok(mut slots) = lock_slots(&self.slots) else {
            return;
        };
        let Some(running) = slots.running.get_mut(&self.key) else {
            return;
        };
        running.retain(|slot| slot.generation != self.generation);
        if running.is_empty() {
            slots.running.remove(&self.key);
        }
    }
}

/// Keyed table of cancellable delayed reply jobs.
pub struct DebounceScheduler {
    slots: Arc<Mutex<SchedulerSlots>>,
    next_generation: AtomicU64,
}

impl Default for DebounceScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl DebounceScheduler {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(SchedulerSlots::default())),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Records `job` as the pending reply for `key`, cancelling any job for the
    /// same key that has not started yet. The job runs after `delay`.
    pub fn schedule<F, Fut>(
        &self,
        key: ConversationKey,
        delay: Duration,
        job: F,
    ) -> Result<ScheduledReply>
    where
        F: FnOnce(ReplyTicket) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut slots = lock_slots(&self.slots)?;
            let previous = slots.scheduled.insert(
                key.clone(),
                Slot {
                    generation,
                    cancel_tx,
                },
            );
            if let Some(previous) = previous {
                let _ = previous.cancel_tx.send(true);
                tracing::debug!(
                    user_id = %key.user_id,
                    chat_id = key.chat_id,
                    superseded_generation = previous.generation,
                    generation,
                    "pending reply superseded"
                );
            }
        }

        let ticket = ReplyTicket {
            key,
            generation,
            cancel_rx,
            slots: Arc::clone(&self.slots),
        };
        let handle = tokio::spawn(run_scheduled_job(ticket, delay, job));
        Ok(ScheduledReply { generation, handle })
    }

    pub fn slot_state(&self, key: &ConversationKey) -> SlotState {
        let Ok(slots) = lock_slots(&self.slots) else {
            return SlotState::Idle;
        };
        if slots.scheduled.contains_key(key) {
            SlotState::Scheduled
        } else if slots.running.contains_key(key) {
            SlotState::Running
        } else {
            SlotState::Idle
        }
    }

    pub fn pending_count(&self) -> usize {
        lock_slots(&self.slots)
            .map(|slots| slots.scheduled.len())
            .unwrap_or(0)
    }

    /// Requests cancellation of every pending and running job. Pending jobs
    /// exit without side effects; running jobs see `is_cancelled()`.
    pub fn cancel_all(&self) -> Result<usize> {
        let mut slots = lock_slots(&self.slots)?;
        let pending = slots.scheduled.drain().collect::<Vec<_>>();
        for (_, slot) in &pending {
            let _ = slot.cancel_tx.send(true);
        }
        for slot in slots.running.values().flatten() {
            let _ = slot.cancel_tx.send(true);
        }
        Ok(pending.len())
    }
}

async fn run_scheduled_job<F, Fut>(mut ticket: ReplyTicket, delay: Duration, job: F) -> JobOutcome
where
    F: FnOnce(ReplyTicket) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tracing::info!(
        user_id = %ticket.key.user_id,
        chat_id = ticket.key.chat_id,
        generation = ticket.generation,
        delay_secs = delay.as_secs_f64(),
        "waiting before replying"
    );
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = ticket.cancelled() => {}
    }

    if !ticket.begin() {
        tracing::info!(
            user_id = %ticket.key.user_id,
            chat_id = ticket.key.chat_id,
            generation = ticket.generation,
            "reply timer cancelled, reset"
        );
        return JobOutcome::Cancelled;
    }

    job(ticket.clone()).await;
    ticket.finish();
    JobOutcome::Completed
}
