//! Event loop driver.
//!
//! One iteration drains the engine's job queue completely, reports promise
//! rejections nobody handled during the drain, then runs a single poll step.
//! The loop ends when the poll step reports that nothing is left to wait for.

use std::cell::Cell;
use std::mem;

use tracing::{debug, trace};

use crate::engine::{Engine, JobOutcome, PromiseState};
use crate::error::{ReportKind, RuntimeResult};
use crate::poll::Poll;
use crate::runtime::Runtime;

/// What the loop is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopPhase {
    /// Draining jobs
    Running,
    /// Inside a poll step
    Polling,
    /// Not running
    #[default]
    Stopped,
}

/// Exit code bookkeeping
#[derive(Debug, Default)]
pub struct ExitStatus {
    code: Cell<Option<i32>>,
    had_error: Cell<bool>,
}

impl ExitStatus {
    /// Override the exit code
    pub fn set_code(&self, code: i32) {
        self.code.set(Some(code));
    }

    pub(crate) fn mark_error(&self) {
        self.had_error.set(true);
    }

    /// Whether an uncaught error was reported
    pub fn had_error(&self) -> bool {
        self.had_error.get()
    }

    /// The override, else 1 after an uncaught error, else 0
    pub fn code(&self) -> i32 {
        self.code
            .get()
            .unwrap_or(if self.had_error.get() { 1 } else { 0 })
    }
}

impl<E: Engine> Runtime<E> {
    /// Run pending jobs until the queue is empty, returning how many ran.
    ///
    /// A job that throws is reported and the drain continues.
    pub fn run_pending_jobs(&mut self) -> usize {
        let mut ran = 0;
        loop {
            match self.engine.execute_pending_job() {
                JobOutcome::Idle => break,
                JobOutcome::Ran => ran += 1,
                JobOutcome::Failed => {
                    ran += 1;
                    self.report_exception();
                }
            }
        }
        if ran > 0 {
            trace!(ran, "jobs drained");
        }
        ran
    }

    /// Report rejections still unhandled and module evaluations that
    /// rejected since the last check
    pub fn check_rejections(&mut self) {
        let rejections = mem::take(&mut *self.state.rejections.borrow_mut());
        for rejection in rejections {
            let report = self.engine.describe_exception(&rejection.reason);
            self.state.report(ReportKind::UnhandledRejection, &report);
        }

        let evaluations = mem::take(&mut *self.state.evaluations.borrow_mut());
        let mut pending = Vec::new();
        for promise in evaluations {
            match self.engine.promise_state(&promise) {
                PromiseState::Pending => pending.push(promise),
                PromiseState::Rejected(reason) => {
                    let report = self.engine.describe_exception(&reason);
                    self.state.report(ReportKind::Uncaught, &report);
                }
                PromiseState::Fulfilled(_) | PromiseState::NotAPromise => {}
            }
        }
        self.state.evaluations.borrow_mut().extend(pending);
    }

    /// Track a module evaluation promise until it settles
    pub(crate) fn track_evaluation(&self, promise: E::Value) {
        self.state.evaluations.borrow_mut().push(promise);
    }

    /// Drive the loop until `poll` has nothing left to wait for.
    ///
    /// Returns the exit code: the override set with
    /// [`Runtime::set_exit_code`], else 1 if any uncaught error was
    /// reported, else 0.
    pub fn run_loop<P: Poll<E>>(&mut self, poll: &mut P) -> RuntimeResult<i32> {
        debug!(worker = self.is_worker(), "event loop started");
        let result = self.drive(poll);
        self.state.phase.set(LoopPhase::Stopped);
        let code = self.exit_code();
        debug!(code, "event loop finished");
        result.map(|()| code)
    }

    fn drive<P: Poll<E>>(&mut self, poll: &mut P) -> RuntimeResult<()> {
        loop {
            self.state.phase.set(LoopPhase::Running);
            self.run_pending_jobs();
            self.check_rejections();

            self.state.phase.set(LoopPhase::Polling);
            if !poll.poll(self)? {
                // The final poll step may still have queued jobs.
                self.state.phase.set(LoopPhase::Running);
                self.run_pending_jobs();
                self.check_rejections();
                return Ok(());
            }
        }
    }
}
