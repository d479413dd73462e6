//! OS signal dispatch and the SIGINT interrupt guard.
//!
//! Signal handlers run in async-signal context, so the only thing the OS-level
//! handler does is set a bit in a process-wide pending mask. Script callbacks
//! run later from the coordinating thread's poll step. The mask and the SIGINT
//! bookkeeping are the only process-global state in the runtime: a signal
//! handler has no way to reach a runtime instance.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{RuntimeError, RuntimeResult};

/// Signals `0..MAX_SIGNAL` can carry handlers
pub const MAX_SIGNAL: i32 = 64;

static PENDING_SIGNALS: AtomicU64 = AtomicU64::new(0);

/// SIGINT bookkeeping shared by every runtime in the process
struct SigintState {
    /// Runtimes currently inside an interrupt guard
    users: usize,
    /// Disposition to put back once the last guard exits
    previous: libc::sighandler_t,
}

static SIGINT: Mutex<SigintState> = Mutex::new(SigintState {
    users: 0,
    previous: libc::SIG_DFL,
});

extern "C" fn on_signal(sig: libc::c_int) {
    if (0..MAX_SIGNAL).contains(&sig) {
        PENDING_SIGNALS.fetch_or(1 << sig, Ordering::SeqCst);
    }
}

fn handler() -> libc::sighandler_t {
    on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t
}

/// Set the disposition of `sig`, returning the one it replaced
fn set_disposition(sig: i32, disposition: libc::sighandler_t) -> libc::sighandler_t {
    // SAFETY: `on_signal` only touches an atomic; the other dispositions
    // have no memory effects.
    let previous = unsafe { libc::signal(sig, disposition) };
    if previous == libc::SIG_ERR {
        libc::SIG_DFL
    } else {
        previous
    }
}

/// Route `sig` to the pending mask for a script handler
fn install(sig: i32) {
    if sig == libc::SIGINT {
        let mut sigint = SIGINT.lock();
        set_disposition(sig, handler());
        if sigint.users > 0 {
            // Must survive the last guard exit
            sigint.previous = handler();
        }
        return;
    }
    set_disposition(sig, handler());
}

/// Hand `sig` back to the OS default once its script handler is gone
fn restore_default(sig: i32) {
    if sig == libc::SIGINT {
        let mut sigint = SIGINT.lock();
        if sigint.users > 0 {
            // The guard still routes SIGINT; the default comes back when the
            // last guard exits.
            sigint.previous = libc::SIG_DFL;
        } else {
            set_disposition(sig, libc::SIG_DFL);
        }
        return;
    }
    set_disposition(sig, libc::SIG_DFL);
}

/// Clear `sig`'s pending bit, returning whether it was set
pub fn take_pending(sig: i32) -> bool {
    if !(0..MAX_SIGNAL).contains(&sig) {
        return false;
    }
    let bit = 1u64 << sig;
    PENDING_SIGNALS.fetch_and(!bit, Ordering::SeqCst) & bit != 0
}

/// Mark `sig` pending as if it had been delivered
pub fn mark_pending(sig: i32) {
    on_signal(sig);
}

/// Script callbacks for OS signals
#[derive(Debug)]
pub struct SignalHandlers<V> {
    handlers: RefCell<Vec<(i32, V)>>,
}

impl<V: Clone> SignalHandlers<V> {
    /// No handlers
    pub fn new() -> Self {
        Self {
            handlers: RefCell::new(Vec::new()),
        }
    }

    /// Install (`Some`) or remove (`None`) the handler for `sig`.
    ///
    /// Removing restores the default disposition.
    pub fn set(&self, sig: i32, callback: Option<V>) -> RuntimeResult<()> {
        if !(0..MAX_SIGNAL).contains(&sig) {
            return Err(RuntimeError::InvalidSignal(sig));
        }
        let mut handlers = self.handlers.borrow_mut();
        handlers.retain(|(s, _)| *s != sig);
        match callback {
            Some(callback) => {
                handlers.push((sig, callback));
                install(sig);
                debug!(sig, "signal handler installed");
            }
            None => {
                restore_default(sig);
                debug!(sig, "signal handler removed");
            }
        }
        Ok(())
    }

    /// Take the callbacks of every signal delivered since the last call
    pub fn take_pending(&self) -> Vec<(i32, V)> {
        let handlers = self.handlers.borrow();
        let mut ready = Vec::new();
        for (sig, callback) in handlers.iter() {
            if take_pending(*sig) {
                trace!(sig, "signal pending");
                ready.push((*sig, callback.clone()));
            }
        }
        ready
    }

    /// Whether any handler is installed
    pub fn is_empty(&self) -> bool {
        self.handlers.borrow().is_empty()
    }

    /// Every installed callback
    pub fn callbacks(&self) -> Vec<V> {
        self.handlers
            .borrow()
            .iter()
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Remove every handler, restoring default dispositions
    pub fn clear(&self) {
        for (sig, _) in self.handlers.borrow_mut().drain(..) {
            restore_default(sig);
        }
    }
}

impl<V: Clone> Default for SignalHandlers<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Nesting counter for SIGINT interruption.
///
/// Only the outermost [`InterruptGuard::enter`] of a runtime routes SIGINT to
/// the pending mask. Once no runtime in the process is inside a guard, the
/// disposition found by the first guard comes back, or the script handler
/// installed in the meantime. A disabled guard never touches SIGINT.
#[derive(Debug, Clone)]
pub struct InterruptGuard {
    enabled: bool,
    depth: Rc<Cell<u32>>,
}

impl InterruptGuard {
    /// Guard at depth zero; `enabled` false makes every scope a no-op
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            depth: Rc::new(Cell::new(0)),
        }
    }

    /// Whether entering routes SIGINT
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current nesting depth
    pub fn depth(&self) -> u32 {
        self.depth.get()
    }

    /// Enter a guarded evaluation; leaving happens when the scope drops
    pub fn enter(&self) -> InterruptScope {
        if !self.enabled {
            return InterruptScope { depth: None };
        }
        let depth = self.depth.get();
        self.depth.set(depth + 1);
        if depth == 0 {
            let mut sigint = SIGINT.lock();
            if sigint.users == 0 {
                sigint.previous = set_disposition(libc::SIGINT, handler());
                trace!("SIGINT handler installed");
            }
            sigint.users += 1;
        }
        InterruptScope {
            depth: Some(Rc::clone(&self.depth)),
        }
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Active interrupt guard level
#[derive(Debug)]
pub struct InterruptScope {
    depth: Option<Rc<Cell<u32>>>,
}

impl Drop for InterruptScope {
    fn drop(&mut self) {
        let Some(depth) = &self.depth else {
            return;
        };
        let level = depth.get().saturating_sub(1);
        depth.set(level);
        if level > 0 {
            return;
        }
        let mut sigint = SIGINT.lock();
        sigint.users = sigint.users.saturating_sub(1);
        if sigint.users == 0 {
            let previous = sigint.previous;
            set_disposition(libc::SIGINT, previous);
            if previous != handler() {
                // Nobody is left to consume a late interrupt
                take_pending(libc::SIGINT);
            }
            trace!("SIGINT disposition restored");
        }
    }
}
