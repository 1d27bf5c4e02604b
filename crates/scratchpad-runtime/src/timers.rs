//! Timer queue behind `setTimeout`, `setInterval` and `setImmediate`.
//!
//! Callbacks stay on the JS side, keyed by id. The worker owns the schedule
//! and calls back into the guest when an id comes due.

use rquickjs::{Ctx, Function, Object};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use std::time::{Duration, Instant};

pub type TimerId = u32;

const MAX_DELAY_MS: f64 = 2_147_483_647.0;

#[derive(Debug, Clone, Copy)]
struct TimerEntry {
    due: Instant,
    interval: Option<Duration>,
}

#[derive(Debug)]
pub struct TimerQueue {
    next_id: TimerId,
    entries: HashMap<TimerId, TimerEntry>,
    /// Ordered by due time, then by id so equal deadlines fire in creation order.
    schedule: BTreeSet<(Instant, TimerId)>,
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            entries: HashMap::new(),
            schedule: BTreeSet::new(),
        }
    }

    pub fn start(&mut self, delay: Duration, repeat: bool) -> TimerId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);

        let due = Instant::now() + delay;
        let interval = repeat.then(|| delay.max(Duration::from_millis(1)));
        self.entries.insert(id, TimerEntry { due, interval });
        self.schedule.insert((due, id));
        id
    }

    pub fn clear(&mut self, id: TimerId) -> bool {
        match self.entries.remove(&id) {
            Some(entry) => {
                self.schedule.remove(&(entry.due, id));
                true
            }
            None => false,
        }
    }

    /// Time until the earliest timer fires, zero if one is already due.
    pub fn next_delay(&self) -> Option<Duration> {
        self.schedule
            .first()
            .map(|(due, _)| due.saturating_duration_since(Instant::now()))
    }

    /// Remove the earliest due timer, rescheduling it if it repeats.
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerId> {
        let &(due, id) = self.schedule.first()?;
        if due > now {
            return None;
        }
        self.schedule.remove(&(due, id));

        let entry = self.entries.get_mut(&id)?;
        match entry.interval {
            Some(interval) => {
                let next = now + interval;
                entry.due = next;
                self.schedule.insert((next, id));
            }
            None => {
                self.entries.remove(&id);
            }
        }
        Some(id)
    }

    pub fn is_active(&self, id: TimerId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear_all(&mut self) {
        self.entries.clear();
        self.schedule.clear();
    }
}

pub type SharedTimers = Rc<RefCell<TimerQueue>>;

/// Register `timerStart(delayMs, repeat)` and `timerClear(id)` on the host object.
pub(crate) fn register<'js>(
    ctx: &Ctx<'js>,
    host: &Object<'js>,
    timers: &SharedTimers,
) -> rquickjs::Result<()> {
    let queue = timers.clone();
    host.set(
        "timerStart",
        Function::new(ctx.clone(), move |delay: f64, repeat: bool| -> TimerId {
            // Out-of-range delays behave like 1ms.
            let delay = if !delay.is_finite() || delay > MAX_DELAY_MS {
                Duration::from_millis(1)
            } else if delay > 0.0 {
                Duration::from_secs_f64(delay / 1000.0)
            } else {
                Duration::ZERO
            };
            queue.borrow_mut().start(delay, repeat)
        })?,
    )?;

    let queue = timers.clone();
    host.set(
        "timerClear",
        Function::new(ctx.clone(), move |id: TimerId| -> bool {
            queue.borrow_mut().clear(id)
        })?,
    )?;

    Ok(())
}
