//! Timer Scheduler
//!
//! Cooperative scheduler owning every named timer in the process. All expiry
//! decisions run through one coordinator task, so deliveries are serialized
//! and timers with equal deadlines fire in allocation order. Expirations are
//! delivered as [`TimerEvent`]s over the channel supplied at schedule time;
//! each module forwards its channel into its own actor mailbox, which keeps
//! callbacks non-blocking and one-at-a-time per module.

use dashmap::DashMap;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

/// Opaque handle to a scheduled future wakeup.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// When a scheduled timer should fire.
#[derive(Debug, Clone, Copy)]
pub enum Delay {
    /// Fire on the next scheduler turn.
    Immediate,
    After(Duration),
}

/// Delivered once per schedule: either the expiry, or the cancellation.
#[derive(Debug, Clone, Copy)]
pub struct TimerEvent {
    pub id: TimerId,
    pub cancelled: bool,
}

enum Cmd {
    Schedule {
        id: TimerId,
        delay: Delay,
        sink: mpsc::UnboundedSender<TimerEvent>,
    },
    Cancel {
        id: TimerId,
    },
}

/// Cheap cloneable handle to the scheduler coordinator.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Cmd>,
    next_id: Arc<AtomicU64>,
    names: Arc<DashMap<TimerId, String>>,
}

impl SchedulerHandle {
    /// Spawn the coordinator task and return its handle. The coordinator
    /// exits when the last handle is dropped.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));
        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(0)),
            names: Arc::new(DashMap::new()),
        }
    }

    /// Allocate a timer for the named module. Ids are never reused, so the
    /// allocation order also fixes the tie-break order for equal deadlines.
    pub fn allocate_timer(&self, module: &str) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.names.insert(id, module.to_string());
        debug!(%id, module, "timer allocated");
        id
    }

    /// Arm `id` to deliver one [`TimerEvent`] on `sink` after `delay`.
    /// Re-scheduling a pending timer replaces the pending expiry.
    pub fn schedule(&self, id: TimerId, delay: Delay, sink: mpsc::UnboundedSender<TimerEvent>) {
        if self.tx.send(Cmd::Schedule { id, delay, sink }).is_err() {
            warn!(%id, "scheduler is gone, timer not armed");
        }
    }

    /// Cancel a pending timer: its event is delivered once with the
    /// cancellation flag set. Cancelling an idle or already-fired timer is a
    /// no-op.
    pub fn cancel(&self, id: TimerId) {
        let _ = self.tx.send(Cmd::Cancel { id });
    }

    pub fn module_of(&self, id: TimerId) -> Option<String> {
        self.names.get(&id).map(|n| n.clone())
    }
}

struct Pending {
    seq: u64,
    sink: mpsc::UnboundedSender<TimerEvent>,
}

async fn run(mut rx: mpsc::UnboundedReceiver<Cmd>) {
    let mut pending: HashMap<TimerId, Pending> = HashMap::new();
    // Min-heap on (deadline, timer id, seq): id order breaks deadline ties.
    let mut heap: BinaryHeap<Reverse<(Instant, u64, u64)>> = BinaryHeap::new();
    let mut seq: u64 = 0;

    loop {
        // Drop entries whose schedule has since been replaced or cancelled.
        let next = loop {
            match heap.peek() {
                Some(Reverse((deadline, raw, entry_seq))) => {
                    match pending.get(&TimerId(*raw)) {
                        Some(p) if p.seq == *entry_seq => break Some(*deadline),
                        _ => {
                            heap.pop();
                        }
                    }
                }
                None => break None,
            }
        };

        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(Cmd::Schedule { id, delay, sink }) => {
                    seq += 1;
                    let deadline = match delay {
                        Delay::Immediate => Instant::now(),
                        Delay::After(d) => Instant::now() + d,
                    };
                    pending.insert(id, Pending { seq, sink });
                    heap.push(Reverse((deadline, id.0, seq)));
                    trace!(%id, "timer armed");
                }
                Some(Cmd::Cancel { id }) => {
                    if let Some(p) = pending.remove(&id) {
                        trace!(%id, "timer cancelled");
                        let _ = p.sink.send(TimerEvent { id, cancelled: true });
                    }
                }
                None => break,
            },
            _ = sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                let now = Instant::now();
                while let Some(Reverse((deadline, raw, entry_seq))) = heap.peek().copied() {
                    if deadline > now {
                        break;
                    }
                    heap.pop();
                    let id = TimerId(raw);
                    if pending.get(&id).map(|p| p.seq) == Some(entry_seq) {
                        if let Some(p) = pending.remove(&id) {
                            trace!(%id, "timer fired");
                            let _ = p.sink.send(TimerEvent { id, cancelled: false });
                        }
                    }
                }
            }
        }
    }
}
