//! Protocol task engine: tracks outstanding multi-message exchanges, routes
//! matching replies to them, and restarts the ones that stall.
//!
//! A task is indexed by the packet types it waits for plus its correlation
//! key (`name:epoch`). The executor is generic over the context `C` that the
//! owning core hands to every task callback, so tasks can read and mutate
//! node state without holding references into it.

use std::collections::HashMap;

use crate::packets::{Envelope, PacketType, ReconMsg};

use tokio::time::{Duration, Instant};

/// Outcome of feeding an event to a task.
pub enum TaskStep<C> {
    /// Still waiting; send these.
    Pending(Vec<Envelope>),

    /// Done; send these and start the follow-on tasks.
    Complete {
        sends: Vec<Envelope>,
        spawn: Vec<Box<dyn ProtocolTask<C>>>,
    },

    /// Abandoned; remove without follow-ons.
    Cancel,
}

impl<C> TaskStep<C> {
    /// Completion with no follow-on task.
    pub fn done(sends: Vec<Envelope>) -> Self {
        TaskStep::Complete {
            sends,
            spawn: Vec::new(),
        }
    }

    /// Completion chaining into one follow-on task.
    pub fn then(sends: Vec<Envelope>, next: Box<dyn ProtocolTask<C>>) -> Self {
        TaskStep::Complete {
            sends,
            spawn: vec![next],
        }
    }
}

/// A retryable multi-message exchange.
pub trait ProtocolTask<C>: Send {
    /// Task kind, e.g. "WaitAckStopEpoch".
    fn kind(&self) -> &'static str;

    /// Correlation key, matched against `ReconMsg::task_key()` of events.
    fn key(&self) -> String;

    /// Packet types this task consumes.
    fn event_types(&self) -> &'static [PacketType];

    /// Sends the initial messages.
    fn start(&mut self, ctx: &mut C) -> Vec<Envelope>;

    /// Called when no progress happened within the current backoff period.
    fn restart(&mut self, ctx: &mut C) -> TaskStep<C> {
        TaskStep::Pending(self.start(ctx))
    }

    /// Consumes one matching event.
    fn handle_event(&mut self, msg: &ReconMsg, ctx: &mut C) -> TaskStep<C>;

    /// True once the exchange no longer matters, e.g. the name moved on to a
    /// later epoch.
    fn is_obviated(&self, _ctx: &C) -> bool {
        false
    }

    /// Called when the task is dropped as obviated.
    fn on_obviated(&mut self, _ctx: &mut C) -> Vec<Envelope> {
        Vec::new()
    }
}

/// Unique ID of a task of `kind` at correlation key `key`.
pub fn task_id(kind: &str, key: &str) -> String {
    format!("{}/{}", kind, key)
}

/// Bookkeeping of one running task.
struct TaskSlot<C> {
    task: Box<dyn ProtocolTask<C>>,

    /// When the next restart is due.
    due: Instant,

    /// Current backoff multiplier of the restart period.
    backoff: u32,

    /// Number of restarts so far.
    restarts: u64,
}

/// Executor of protocol tasks over context `C`.
pub struct ProtocolExecutor<C> {
    /// Map from task ID -> running task.
    tasks: HashMap<String, TaskSlot<C>>,

    /// Map from (packet type, correlation key) -> task ID.
    index: HashMap<(PacketType, String), String>,

    /// Base restart period.
    period: Duration,

    /// Cap on the backoff multiplier.
    max_backoff: u32,
}

impl<C> ProtocolExecutor<C> {
    pub fn new(period: Duration, max_backoff: u32) -> Self {
        ProtocolExecutor {
            tasks: HashMap::new(),
            index: HashMap::new(),
            period,
            max_backoff: max_backoff.max(1),
        }
    }

    /// Registers a task and returns its initial messages. A running task
    /// with the same ID is replaced.
    pub fn spawn(
        &mut self,
        mut task: Box<dyn ProtocolTask<C>>,
        ctx: &mut C,
    ) -> Vec<Envelope> {
        let key = task.key();
        let id = task_id(task.kind(), &key);
        if self.remove(&id) {
            pf_warn!("task {} replaced", id);
        }

        for ptype in task.event_types() {
            if let Some(other) = self.index.insert((*ptype, key.clone()), id.clone()) {
                pf_warn!("task {} takes over {} events from {}", id, ptype, other);
            }
        }
        let sends = task.start(ctx);
        pf_debug!("task {} started, {} sends", id, sends.len());
        self.tasks.insert(
            id,
            TaskSlot {
                task,
                due: Instant::now() + self.period,
                backoff: 1,
                restarts: 0,
            },
        );
        sends
    }

    /// Spawns the task unless one with the same ID is running. Returns
    /// `None` if it was already running.
    pub fn spawn_if_not_running(
        &mut self,
        task: Box<dyn ProtocolTask<C>>,
        ctx: &mut C,
    ) -> Option<Vec<Envelope>> {
        if self.is_running(&task_id(task.kind(), &task.key())) {
            return None;
        }
        Some(self.spawn(task, ctx))
    }

    /// Routes an inbound message to the task waiting for it, if any.
    pub fn handle_event(&mut self, msg: &ReconMsg, ctx: &mut C) -> Vec<Envelope> {
        let Some(key) = msg.task_key() else {
            return Vec::new();
        };
        let Some(id) = self.index.get(&(msg.packet_type(), key)).cloned() else {
            pf_debug!("no task waiting for {} of '{}'", msg.packet_type(), msg.name());
            return Vec::new();
        };
        let step = match self.tasks.get_mut(&id) {
            Some(slot) => slot.task.handle_event(msg, ctx),
            None => return Vec::new(),
        };
        self.settle(&id, step, ctx)
    }

    /// Applies a task's step: keeps it, completes it, or cancels it.
    fn settle(&mut self, id: &str, step: TaskStep<C>, ctx: &mut C) -> Vec<Envelope> {
        match step {
            TaskStep::Pending(sends) => sends,
            TaskStep::Complete { mut sends, spawn } => {
                self.remove(id);
                pf_debug!("task {} complete", id);
                for next in spawn {
                    sends.extend(self.spawn(next, ctx));
                }
                sends
            }
            TaskStep::Cancel => {
                self.remove(id);
                pf_debug!("task {} cancelled", id);
                Vec::new()
            }
        }
    }

    /// Removes a task; returns whether it was running.
    pub fn remove(&mut self, id: &str) -> bool {
        match self.tasks.remove(id) {
            Some(slot) => {
                let key = slot.task.key();
                for ptype in slot.task.event_types() {
                    let entry = (*ptype, key.clone());
                    if self.index.get(&entry).is_some_and(|owner| owner == id) {
                        self.index.remove(&entry);
                    }
                }
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    /// IDs of all running tasks, sorted.
    pub fn outstanding(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tasks.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drops obviated tasks and restarts every task whose backoff period
    /// has elapsed, doubling its period up to the cap.
    pub fn on_tick(&mut self, now: Instant, ctx: &mut C) -> Vec<Envelope> {
        let mut sends = Vec::new();
        for id in self.outstanding() {
            let Some(slot) = self.tasks.get_mut(&id) else {
                continue;
            };

            if slot.task.is_obviated(ctx) {
                sends.extend(slot.task.on_obviated(ctx));
                self.remove(&id);
                pf_debug!("task {} obviated", id);
                continue;
            }
            if now < slot.due {
                continue;
            }

            slot.restarts += 1;
            slot.backoff = (slot.backoff * 2).min(self.max_backoff);
            slot.due = now + self.period * slot.backoff;
            pf_warn!("task {} restart #{}", id, slot.restarts);
            let step = slot.task.restart(ctx);
            sends.extend(self.settle(&id, step, ctx));
        }
        sends
    }
}
