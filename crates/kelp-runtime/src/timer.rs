//! Timeout and interval registry.
//!
//! Timers are reference counted: the registry holds one reference while the
//! timer is linked, and every [`TimerHandle`] holds another. A timer is
//! unlinked when a one-shot fires or when it is cancelled, but its callback
//! stays alive as long as a handle does.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::Instant;

use tracing::trace;

/// Millisecond monotonic time source
pub trait Clock {
    /// Milliseconds since an arbitrary fixed origin
    fn now_ms(&self) -> u64;
}

/// [`Clock`] backed by [`Instant`]
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Hand-driven [`Clock`]; clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<u64>>,
}

impl ManualClock {
    /// Clock starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward
    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }

    /// Jump to an absolute time
    pub fn set(&self, ms: u64) {
        self.now.set(ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }
}

struct Timer<C> {
    id: u64,
    deadline: Cell<u64>,
    /// zero for one-shot timers
    interval: u64,
    callback: C,
    linked: Cell<bool>,
}

/// Reference to a scheduled timer
pub struct TimerHandle<C> {
    timer: Rc<Timer<C>>,
}

impl<C> TimerHandle<C> {
    /// Registry-unique timer id
    pub fn id(&self) -> u64 {
        self.timer.id
    }

    /// Whether the timer is still scheduled
    pub fn is_active(&self) -> bool {
        self.timer.linked.get()
    }

    /// Absolute deadline in clock milliseconds
    pub fn deadline(&self) -> u64 {
        self.timer.deadline.get()
    }

    /// Repeat interval, `None` for one-shot timers
    pub fn interval(&self) -> Option<u64> {
        (self.timer.interval > 0).then_some(self.timer.interval)
    }

    /// The callback this timer invokes
    pub fn callback(&self) -> &C {
        &self.timer.callback
    }
}

impl<C> Clone for TimerHandle<C> {
    fn clone(&self) -> Self {
        Self {
            timer: Rc::clone(&self.timer),
        }
    }
}

impl<C> fmt::Debug for TimerHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("id", &self.timer.id)
            .field("deadline", &self.timer.deadline.get())
            .field("interval", &self.timer.interval)
            .field("active", &self.timer.linked.get())
            .finish()
    }
}

/// Pending timers of one runtime
pub struct TimerRegistry<C> {
    clock: Box<dyn Clock>,
    timers: RefCell<Vec<Rc<Timer<C>>>>,
    next_id: Cell<u64>,
}

impl<C: Clone> TimerRegistry<C> {
    /// Registry driven by the monotonic clock
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock::default())
    }

    /// Registry driven by a custom clock
    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            clock: Box::new(clock),
            timers: RefCell::new(Vec::new()),
            next_id: Cell::new(1),
        }
    }

    /// Current clock time
    pub fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Schedule `callback` after `delay_ms`, repeating every `interval_ms`
    /// when it is non-zero.
    pub fn schedule(&self, callback: C, delay_ms: u64, interval_ms: u64) -> TimerHandle<C> {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let timer = Rc::new(Timer {
            id,
            deadline: Cell::new(self.now().saturating_add(delay_ms)),
            interval: interval_ms,
            callback,
            linked: Cell::new(true),
        });
        self.timers.borrow_mut().push(Rc::clone(&timer));
        trace!(id, delay_ms, interval_ms, "timer scheduled");
        TimerHandle { timer }
    }

    /// Unlink a timer. Cancelling an unlinked timer does nothing.
    pub fn cancel(&self, handle: &TimerHandle<C>) {
        if handle.timer.linked.replace(false) {
            self.unlink(handle.timer.id);
            trace!(id = handle.timer.id, "timer cancelled");
        }
    }

    fn unlink(&self, id: u64) {
        self.timers.borrow_mut().retain(|t| t.id != id);
    }

    /// Earliest deadline among linked timers
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.borrow().iter().map(|t| t.deadline.get()).min()
    }

    /// Handles of the timers whose deadline has elapsed, earliest first
    pub fn due(&self) -> Vec<TimerHandle<C>> {
        let now = self.now();
        let mut due: Vec<_> = self
            .timers
            .borrow()
            .iter()
            .filter(|t| t.deadline.get() <= now)
            .map(|t| TimerHandle {
                timer: Rc::clone(t),
            })
            .collect();
        due.sort_by_key(|h| h.timer.deadline.get());
        due
    }

    /// Fire every elapsed timer once, returning how many fired.
    ///
    /// The due set is snapshotted first. `invoke` may schedule or cancel any
    /// timer, including the one being fired; timers cancelled by an earlier
    /// callback in the same pass are skipped. After its callback a one-shot
    /// timer is unlinked and an interval timer is re-armed relative to the
    /// current time.
    pub fn fire_due(&self, mut invoke: impl FnMut(C)) -> usize {
        let mut fired = 0;
        for handle in self.due() {
            let timer = &handle.timer;
            if !timer.linked.get() {
                continue;
            }
            if timer.interval == 0 {
                timer.linked.set(false);
                self.unlink(timer.id);
            }
            trace!(id = timer.id, "timer fired");
            invoke(timer.callback.clone());
            fired += 1;

            if timer.interval > 0 && timer.linked.get() {
                timer
                    .deadline
                    .set(self.now().saturating_add(timer.interval));
            }
        }
        fired
    }

    /// Number of linked timers
    pub fn len(&self) -> usize {
        self.timers.borrow().len()
    }

    /// Whether no timer is linked
    pub fn is_empty(&self) -> bool {
        self.timers.borrow().is_empty()
    }

    /// Callbacks of all linked timers
    pub fn callbacks(&self) -> Vec<C> {
        self.timers
            .borrow()
            .iter()
            .map(|t| t.callback.clone())
            .collect()
    }

    /// Unlink every timer
    pub fn clear(&self) {
        let timers = std::mem::take(&mut *self.timers.borrow_mut());
        for timer in &timers {
            timer.linked.set(false);
        }
    }
}

impl<C: Clone> Default for TimerRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for TimerRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerRegistry")
            .field("timers", &self.timers.borrow().len())
            .finish()
    }
}
