//! Poll step of the event loop.
//!
//! [`StdPoll`] is the default step: it dispatches pending OS signals, fires
//! due timers, and otherwise blocks in `poll(2)` on descriptor handlers,
//! the worker completion pipe and message ports until the next timer
//! deadline. Embedders can drive the loop with their own [`Poll`]; any
//! `FnMut(&mut Runtime<E>) -> RuntimeResult<bool>` qualifies.

use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::engine::Engine;
use crate::error::RuntimeResult;
use crate::runtime::{Runtime, RuntimeState};
use crate::unit;

/// One step of the event loop
pub trait Poll<E: Engine> {
    /// Wait for and dispatch one batch of events.
    ///
    /// Returns `Ok(false)` when nothing is left that could produce an event,
    /// which ends the loop.
    fn poll(&mut self, runtime: &mut Runtime<E>) -> RuntimeResult<bool>;
}

impl<E, F> Poll<E> for F
where
    E: Engine,
    F: FnMut(&mut Runtime<E>) -> RuntimeResult<bool>,
{
    fn poll(&mut self, runtime: &mut Runtime<E>) -> RuntimeResult<bool> {
        self(runtime)
    }
}

#[derive(Debug, Clone, Copy)]
enum Source {
    Io(RawFd),
    Workers,
    Port(u64),
}

/// Default poll step
#[derive(Debug, Default, Clone, Copy)]
pub struct StdPoll;

impl StdPoll {
    /// Create the default poll step
    pub fn new() -> Self {
        Self
    }
}

impl<E: Engine> Poll<E> for StdPoll {
    fn poll(&mut self, runtime: &mut Runtime<E>) -> RuntimeResult<bool> {
        let state = Rc::clone(&runtime.state);

        if !state.is_worker() {
            let ready = state.signals.take_pending();
            if !ready.is_empty() {
                for (sig, callback) in ready {
                    debug!(sig, "dispatching signal");
                    let arg = runtime.engine.new_number(f64::from(sig));
                    runtime.invoke_callback(&callback, &[arg]);
                }
                return Ok(true);
            }
        }

        let fired = state.timers.fire_due(|callback| {
            runtime.invoke_callback(&callback, &[]);
        });
        if fired > 0 {
            return Ok(true);
        }

        state.prune_ports();
        let (mut fds, sources) = collect_sources(&state);
        let next_deadline = state.timers.next_deadline();
        if fds.is_empty() && next_deadline.is_none() {
            return Ok(false);
        }

        let timeout = wait_timeout(
            next_deadline.map(|deadline| deadline.saturating_sub(state.timers.now())),
            state.config.max_poll_wait_ms,
        );
        trace!(fds = fds.len(), timeout, "polling");

        // SAFETY: `fds` is a live, correctly sized array of pollfd.
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(true);
            }
            return Err(err.into());
        }

        for (pfd, source) in fds.iter().zip(&sources) {
            if pfd.revents == 0 {
                continue;
            }
            match *source {
                Source::Io(fd) => dispatch_io(runtime, &state, fd, pfd.revents),
                Source::Workers => {
                    let finished = state.tracker.drain_completed();
                    debug!(finished, "workers finished");
                }
                Source::Port(id) => deliver_message(runtime, &state, id),
            }
        }
        Ok(true)
    }
}

fn collect_sources<E: Engine>(state: &RuntimeState<E>) -> (Vec<libc::pollfd>, Vec<Source>) {
    let mut fds = Vec::new();
    let mut sources = Vec::new();
    let mut watch = |fd: RawFd, events: libc::c_short, source: Source| {
        fds.push(libc::pollfd {
            fd,
            events,
            revents: 0,
        });
        sources.push(source);
    };

    for interest in state.io.interests() {
        let mut events = 0;
        if interest.read {
            events |= libc::POLLIN;
        }
        if interest.write {
            events |= libc::POLLOUT;
        }
        watch(interest.fd, events, Source::Io(interest.fd));
    }
    if state.tracker.active_count() > 0
        && let Some(fd) = state.tracker.notify_fd()
    {
        watch(fd, libc::POLLIN, Source::Workers);
    }
    for (id, fd) in state.listening_ports() {
        watch(fd, libc::POLLIN, Source::Port(id));
    }
    (fds, sources)
}

/// Milliseconds to block: until the next deadline, capped by `max_wait`;
/// -1 blocks indefinitely
fn wait_timeout(until_deadline: Option<u64>, max_wait: Option<u64>) -> libc::c_int {
    let clamp = |ms: u64| ms.min(libc::c_int::MAX as u64) as libc::c_int;
    match (until_deadline, max_wait) {
        (Some(until), Some(max)) => clamp(until.min(max)),
        (Some(until), None) => clamp(until),
        (None, Some(max)) => clamp(max),
        (None, None) => -1,
    }
}

/// Conditions `poll(2)` reports whether asked or not; each wakes both
/// handlers so a dead descriptor cannot spin the loop
const FAILED: libc::c_short = libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;

fn read_ready(revents: libc::c_short) -> bool {
    revents & (libc::POLLIN | FAILED) != 0
}

fn write_ready(revents: libc::c_short) -> bool {
    revents & (libc::POLLOUT | FAILED) != 0
}

fn dispatch_io<E: Engine>(
    runtime: &mut Runtime<E>,
    state: &RuntimeState<E>,
    fd: RawFd,
    revents: libc::c_short,
) {
    if read_ready(revents)
        && let Some(callback) = state.io.read_handler(fd)
    {
        runtime.invoke_callback(&callback, &[]);
    }
    if write_ready(revents)
        && let Some(callback) = state.io.write_handler(fd)
    {
        runtime.invoke_callback(&callback, &[]);
    }
}

/// Deliver one queued message to a port's handler
fn deliver_message<E: Engine>(runtime: &mut Runtime<E>, state: &RuntimeState<E>, id: u64) {
    let Some((pipe, Some(handler))) = state.port(id) else {
        return;
    };
    let Some(message) = pipe.try_recv() else {
        return;
    };
    drop(pipe);

    match unit::decode_message(&mut runtime.engine, message) {
        Ok(value) => {
            runtime.invoke_callback(&handler, &[value]);
        }
        Err(e) => state.report_error(&mut runtime.engine, e),
    }
}
