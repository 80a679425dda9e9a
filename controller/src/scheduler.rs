//! Coalesces change notifications into serialized reconciliation cycles.
//!
//! Producers hand [`Update`]s to a [`Scheduler`]; a single worker ([`Scheduler::run`]) takes them
//! one at a time. The mailbox holds at most one pending update and a newer update replaces the
//! pending one, so any burst of notifications costs at most the cycle already running plus one
//! more.

use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use std::{fmt, sync::Arc};
use tokio::sync::Notify;

/// How much work an update requires. A full update subsumes a weight-only one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Kind {
    /// Only operator weights changed.
    Weights,
    /// Orchestrator state may have changed.
    Full,
}

/// What caused an update to be scheduled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Trigger {
    Startup,
    Marathon { event_type: String },
    WeightStore,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Update {
    pub kind: Kind,
    pub trigger: Trigger,
}

/// The terminal state of one cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// A new configuration was written and the proxy reloaded.
    Reloaded,
    /// Weights were pushed to the running proxy without a reload.
    Reweighted,
    /// The rendered configuration matched the file on disk.
    Skipped,
    Failed,
}

/// Work performed by the scheduler's worker for each update.
#[async_trait::async_trait]
pub trait Cycle: Send + 'static {
    async fn run(&mut self, update: Update) -> Outcome;
}

/// A cloneable handle to the coalescing mailbox.
#[derive(Clone, Default)]
pub struct Scheduler {
    mailbox: Arc<Mailbox>,
}

struct Mailbox {
    /// Serializes producers. Draining and refilling the slot are two operations, and two
    /// unguarded producers could each leave an update behind.
    guard: Mutex<()>,
    slot: ArrayQueue<Update>,
    ready: Notify,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self {
            guard: Mutex::new(()),
            slot: ArrayQueue::new(1),
            ready: Notify::new(),
        }
    }
}

// === impl Update ===

impl Update {
    pub fn full(trigger: Trigger) -> Self {
        Self {
            kind: Kind::Full,
            trigger,
        }
    }

    pub fn weights() -> Self {
        Self {
            kind: Kind::Weights,
            trigger: Trigger::WeightStore,
        }
    }

    /// Replaces `stale`, keeping the stronger of the two kinds.
    fn supersede(self, stale: Update) -> Self {
        Self {
            kind: self.kind.max(stale.kind),
            trigger: self.trigger,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Startup => f.write_str("startup"),
            Self::Marathon { event_type } => write!(f, "marathon:{event_type}"),
            Self::WeightStore => f.write_str("weights"),
        }
    }
}

// === impl Scheduler ===

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `update`, replacing any update that is still waiting for the worker.
    pub fn schedule(&self, update: Update) {
        let _guard = self.mailbox.guard.lock();

        let update = match self.mailbox.slot.pop() {
            Some(stale) => {
                tracing::debug!(
                    superseded = %stale.trigger,
                    by = %update.trigger,
                    "found pending update; replacing it"
                );
                update.supersede(stale)
            }
            None => {
                tracing::debug!(trigger = %update.trigger, kind = ?update.kind, "queuing update");
                update
            }
        };

        if let Some(lost) = self.mailbox.slot.force_push(update) {
            tracing::error!(trigger = %lost.trigger, "update slot was refilled concurrently");
        }
        self.mailbox.ready.notify_one();
    }

    /// Returns true if an update is waiting for the worker.
    pub fn is_pending(&self) -> bool {
        !self.mailbox.slot.is_empty()
    }

    pub(crate) async fn next(&self) -> Update {
        loop {
            if let Some(update) = self.mailbox.slot.pop() {
                return update;
            }
            self.mailbox.ready.notified().await;
        }
    }

    /// Runs `cycle` for each update, one at a time, forever. A cycle is never interrupted once
    /// it has started.
    pub async fn run<C: Cycle>(self, mut cycle: C) {
        tracing::info!("starting update loop");
        loop {
            let update = self.next().await;
            let trigger = update.trigger.clone();
            let kind = update.kind;
            let start = tokio::time::Instant::now();

            let outcome = cycle.run(update).await;
            let elapsed = start.elapsed();
            match outcome {
                Outcome::Reloaded => {
                    tracing::info!(%trigger, ?kind, ?elapsed, "reloaded proxy configuration")
                }
                Outcome::Reweighted => {
                    tracing::info!(%trigger, ?kind, ?elapsed, "updated server weights")
                }
                Outcome::Skipped => {
                    tracing::info!(%trigger, ?kind, "skipped reload; configuration unchanged")
                }
                Outcome::Failed => {
                    tracing::warn!(%trigger, ?kind, ?elapsed, "failed to update proxy configuration")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::{mpsc, Semaphore};

    fn event(n: usize) -> Update {
        Update::full(Trigger::Marathon {
            event_type: format!("event-{n}"),
        })
    }

    /// Reports each update it starts and then waits for a permit before finishing.
    struct Gated {
        started: mpsc::UnboundedSender<Update>,
        gate: Arc<Semaphore>,
    }

    #[async_trait::async_trait]
    impl Cycle for Gated {
        async fn run(&mut self, update: Update) -> Outcome {
            let _ = self.started.send(update);
            self.gate.acquire().await.unwrap().forget();
            Outcome::Skipped
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_to_latest_update() {
        let scheduler = Scheduler::new();
        let (started, mut rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(0));
        tokio::spawn(scheduler.clone().run(Gated {
            started,
            gate: gate.clone(),
        }));

        scheduler.schedule(event(0));
        assert_eq!(rx.recv().await.unwrap(), event(0));

        for n in 1..=10 {
            scheduler.schedule(event(n));
        }
        assert!(scheduler.is_pending());

        gate.add_permits(1);
        assert_eq!(rx.recv().await.unwrap(), event(10));
        assert!(!scheduler.is_pending());

        gate.add_permits(1);
        let more = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv()).await;
        assert!(more.is_err(), "no further cycles expected");
    }

    #[tokio::test]
    async fn superseding_keeps_full_kind() {
        let scheduler = Scheduler::new();
        scheduler.schedule(Update::full(Trigger::Startup));
        scheduler.schedule(Update::weights());

        let next = scheduler.next().await;
        assert_eq!(next.kind, Kind::Full);
        assert_eq!(next.trigger, Trigger::WeightStore);
        assert!(!scheduler.is_pending());

        scheduler.schedule(Update::weights());
        assert_eq!(scheduler.next().await.kind, Kind::Weights);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_producers_leave_one_pending() {
        let scheduler = Scheduler::new();
        let producers = (0..64)
            .map(|n| {
                let scheduler = scheduler.clone();
                tokio::spawn(async move { scheduler.schedule(event(n)) })
            })
            .collect::<Vec<_>>();
        for p in producers {
            p.await.unwrap();
        }

        assert!(scheduler.is_pending());
        scheduler.next().await;
        assert!(!scheduler.is_pending());
    }

    #[tokio::test]
    async fn worker_waits_for_updates() {
        let scheduler = Scheduler::new();
        let mut next = tokio_test::task::spawn(scheduler.next());
        tokio_test::assert_pending!(next.poll());

        scheduler.schedule(event(1));
        assert!(next.is_woken());
        assert_eq!(tokio_test::assert_ready!(next.poll()), event(1));
    }
}
