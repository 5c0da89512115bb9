use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use super::DriverInput;
use crate::transport::{Scheduler, TimerKey};

struct Armed {
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Table {
    armed: HashMap<TimerKey, Armed>,
    next_generation: u64,
}

/// Armed timers, shared between the scheduler the channel owns and the actor
/// that receives firings.
///
/// Every arming gets a fresh generation. A firing is only delivered when its
/// generation is still the armed one, so a timer that was cancelled or
/// replaced after its sleep finished never reaches the channel.
#[derive(Clone, Default)]
pub(crate) struct TimerTable(Arc<Mutex<Table>>);

impl TimerTable {
    /// Consumes the firing of `key` at `generation`. False when stale.
    pub(crate) fn claim(&self, key: TimerKey, generation: u64) -> bool {
        let mut table = self.0.lock();
        match table.armed.get(&key) {
            Some(armed) if armed.generation == generation => {
                table.armed.remove(&key);
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn armed_count(&self) -> usize {
        self.0.lock().armed.len()
    }

    /// Stops every pending sleep.
    pub(crate) fn clear(&self) {
        for (_, armed) in self.0.lock().armed.drain() {
            armed.task.abort();
        }
    }
}

/// [`Scheduler`] on tokio sleeps that report back through the actor queue.
pub struct TokioScheduler {
    table: TimerTable,
    inputs: mpsc::UnboundedSender<DriverInput>,
}

impl TokioScheduler {
    pub(crate) fn new(table: TimerTable, inputs: mpsc::UnboundedSender<DriverInput>) -> Self {
        Self { table, inputs }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&mut self, key: TimerKey, after: Duration) {
        let mut table = self.table.0.lock();
        let generation = table.next_generation;
        table.next_generation += 1;
        let inputs = self.inputs.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = inputs.send(DriverInput::Timer { key, generation });
        });
        trace!(target = "webchannel.runtime", key = ?key, generation, after_ms = after.as_millis() as u64, "timer armed");
        if let Some(previous) = table.armed.insert(key, Armed { generation, task }) {
            previous.task.abort();
        }
    }

    fn cancel(&mut self, key: TimerKey) {
        if let Some(armed) = self.table.0.lock().armed.remove(&key) {
            armed.task.abort();
        }
    }
}
