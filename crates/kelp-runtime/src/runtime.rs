//! Runtime instance and its per-instance state.
//!
//! A [`Runtime`] pairs an engine with a [`RuntimeState`]. The state is shared
//! through an `Rc` so that host functions created by the runtime (`require`,
//! `resolve`, bound units) can reach it; they only keep a `Weak` reference, so
//! dropping the runtime always tears the state down.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::RuntimeConfig;
use crate::engine::{Engine, ExceptionReport};
use crate::error::{ErrorReporter, ReportKind, RuntimeError, RuntimeResult, StderrReporter};
use crate::event_loop::{ExitStatus, LoopPhase};
use crate::handlers::IoHandlers;
use crate::message_pipe::MessagePipe;
use crate::module_loader::{ModuleDelegate, ModuleLoader};
use crate::native::NativeLibraries;
use crate::shared_buffer::ShareRegistry;
use crate::signal::{self, InterruptGuard, SignalHandlers};
use crate::timer::{TimerHandle, TimerRegistry};
use crate::worker::{WorkerFactory, WorkerTracker};

/// A promise rejected with no handler attached yet
#[derive(Debug, Clone)]
pub(crate) struct Rejection<V> {
    pub(crate) promise: V,
    pub(crate) reason: V,
}

/// Receiving end of a message pipe, with the script handler it dispatches to
#[derive(Debug)]
pub(crate) struct Port<V> {
    pub(crate) id: u64,
    pub(crate) incoming: MessagePipe,
    pub(crate) handler: Option<V>,
}

/// Link from a worker runtime back to the runtime that spawned it
#[derive(Debug)]
pub(crate) struct ParentLink {
    pub(crate) port_id: u64,
    pub(crate) outgoing: MessagePipe,
}

/// Everything a runtime owns besides the engine.
pub struct RuntimeState<E: Engine> {
    pub(crate) config: RuntimeConfig,
    pub(crate) loader: ModuleLoader<E>,
    pub(crate) timers: TimerRegistry<E::Value>,
    pub(crate) io: IoHandlers<E::Value>,
    pub(crate) signals: SignalHandlers<E::Value>,
    pub(crate) interrupt: InterruptGuard,
    pub(crate) ports: RefCell<Vec<Port<E::Value>>>,
    next_port_id: Cell<u64>,
    pub(crate) parent: Option<ParentLink>,
    pub(crate) tracker: WorkerTracker,
    pub(crate) shares: ShareRegistry,
    pub(crate) rejections: Rc<RefCell<Vec<Rejection<E::Value>>>>,
    /// Module evaluation promises not settled yet
    pub(crate) evaluations: RefCell<Vec<E::Value>>,
    pub(crate) exit: ExitStatus,
    pub(crate) phase: Cell<LoopPhase>,
    reporter: RefCell<Rc<dyn ErrorReporter>>,
    pub(crate) worker_factory: RefCell<Option<Arc<dyn WorkerFactory<E>>>>,
    pub(crate) script_args: RefCell<Vec<String>>,
}

impl<E: Engine> RuntimeState<E> {
    fn new(
        this: &Weak<Self>,
        config: RuntimeConfig,
        shares: ShareRegistry,
        parent: Option<(MessagePipe, MessagePipe)>,
    ) -> Self {
        let mut ports = Vec::new();
        let mut next_port_id = 1;
        let parent = parent.map(|(incoming, outgoing)| {
            let port_id = next_port_id;
            next_port_id += 1;
            ports.push(Port {
                id: port_id,
                incoming,
                handler: None,
            });
            ParentLink { port_id, outgoing }
        });
        let interrupt = InterruptGuard::new(config.interrupt_on_sigint && parent.is_none());

        Self {
            loader: ModuleLoader::new(this.clone(), &config),
            config,
            timers: TimerRegistry::new(),
            io: IoHandlers::new(),
            signals: SignalHandlers::new(),
            interrupt,
            ports: RefCell::new(ports),
            next_port_id: Cell::new(next_port_id),
            parent,
            tracker: WorkerTracker::new(),
            shares,
            rejections: Rc::new(RefCell::new(Vec::new())),
            evaluations: RefCell::new(Vec::new()),
            exit: ExitStatus::default(),
            phase: Cell::new(LoopPhase::Stopped),
            reporter: RefCell::new(Rc::new(StderrReporter)),
            worker_factory: RefCell::new(None),
            script_args: RefCell::new(Vec::new()),
        }
    }

    /// Settings this runtime was built with
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Module loader
    pub fn loader(&self) -> &ModuleLoader<E> {
        &self.loader
    }

    /// Timer registry
    pub fn timers(&self) -> &TimerRegistry<E::Value> {
        &self.timers
    }

    /// Descriptor handlers
    pub fn io(&self) -> &IoHandlers<E::Value> {
        &self.io
    }

    /// Script signal handlers
    pub fn signals(&self) -> &SignalHandlers<E::Value> {
        &self.signals
    }

    /// Whether this runtime runs on a worker thread
    pub fn is_worker(&self) -> bool {
        self.parent.is_some()
    }

    /// Print an exception through the installed reporter and mark the run as
    /// failed
    pub(crate) fn report(&self, kind: ReportKind, report: &ExceptionReport) {
        match kind {
            ReportKind::Uncaught => warn!(message = %report.message, "uncaught exception"),
            ReportKind::UnhandledRejection => {
                warn!(message = %report.message, "unhandled promise rejection")
            }
        }
        let reporter = Rc::clone(&self.reporter.borrow());
        reporter.report(kind, report);
        self.exit.mark_error();
    }

    /// Take the engine's pending exception and report it as uncaught
    pub(crate) fn report_exception(&self, engine: &mut E) {
        let exception = engine.take_exception();
        let report = engine.describe_exception(&exception);
        self.report(ReportKind::Uncaught, &report);
    }

    /// Report a runtime error as an uncaught exception
    pub(crate) fn report_error(&self, engine: &mut E, error: RuntimeError) {
        let _ = error.throw_into(engine);
        self.report_exception(engine);
    }

    pub(crate) fn allocate_port_id(&self) -> u64 {
        let id = self.next_port_id.get();
        self.next_port_id.set(id + 1);
        id
    }

    pub(crate) fn add_port(&self, id: u64, incoming: MessagePipe, handler: Option<E::Value>) {
        self.ports.borrow_mut().push(Port {
            id,
            incoming,
            handler,
        });
    }

    pub(crate) fn set_port_handler(&self, id: u64, handler: Option<E::Value>) -> bool {
        match self.ports.borrow_mut().iter_mut().find(|p| p.id == id) {
            Some(port) => {
                port.handler = handler;
                true
            }
            None => false,
        }
    }

    /// Drop ports whose sender is gone and whose queue is empty
    pub(crate) fn prune_ports(&self) {
        self.ports.borrow_mut().retain(|port| {
            let live = port.incoming.has_peer() || !port.incoming.is_empty();
            if !live {
                debug!(port = port.id, "message port closed");
            }
            live
        });
    }

    /// Ports that keep the event loop alive: a handler is installed
    pub(crate) fn listening_ports(&self) -> Vec<(u64, RawFd)> {
        self.ports
            .borrow()
            .iter()
            .filter(|p| p.handler.is_some())
            .map(|p| (p.id, p.incoming.wakeup_fd()))
            .collect()
    }

    pub(crate) fn port(&self, id: u64) -> Option<(MessagePipe, Option<E::Value>)> {
        self.ports
            .borrow()
            .iter()
            .find(|p| p.id == id)
            .map(|p| (p.incoming.clone(), p.handler.clone()))
    }

    /// Every engine value this runtime keeps alive
    pub fn held_values(&self) -> Vec<E::Value> {
        let mut values = self.timers.callbacks();
        values.extend(self.io.callbacks());
        values.extend(self.signals.callbacks());
        values.extend(self.ports.borrow().iter().filter_map(|p| p.handler.clone()));
        values.extend(self.loader.held_values());
        for rejection in self.rejections.borrow().iter() {
            values.push(rejection.promise.clone());
            values.push(rejection.reason.clone());
        }
        values.extend(self.evaluations.borrow().iter().cloned());
        values
    }

    /// Release every engine value and OS resource owned by the state
    fn teardown(&self) {
        self.timers.clear();
        self.io.clear();
        self.signals.clear();
        self.ports.borrow_mut().clear();
        self.loader.clear();
        self.rejections.borrow_mut().clear();
        self.evaluations.borrow_mut().clear();
    }
}

impl<E: Engine> fmt::Debug for RuntimeState<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeState")
            .field("timers", &self.timers.len())
            .field("ports", &self.ports.borrow().len())
            .field("workers", &self.tracker.active_count())
            .field("is_worker", &self.is_worker())
            .field("phase", &self.phase.get())
            .finish_non_exhaustive()
    }
}

/// An engine plus the runtime services around it.
pub struct Runtime<E: Engine> {
    pub(crate) state: Rc<RuntimeState<E>>,
    pub(crate) engine: E,
    /// Filled on drop; declared after `engine` so it unloads last
    libraries: Option<NativeLibraries>,
}

impl<E: Engine> Runtime<E> {
    /// Runtime with default settings
    pub fn new(engine: E) -> Self {
        Self::with_config(engine, RuntimeConfig::default())
    }

    /// Runtime with custom settings
    pub fn with_config(engine: E, config: RuntimeConfig) -> Self {
        Self::build(engine, config, ShareRegistry::new(), None)
    }

    pub(crate) fn build(
        mut engine: E,
        config: RuntimeConfig,
        shares: ShareRegistry,
        parent: Option<(MessagePipe, MessagePipe)>,
    ) -> Self {
        let state = Rc::new_cyclic(|this| RuntimeState::new(this, config, shares, parent));

        if state.config.interrupt_on_sigint && !state.is_worker() {
            engine.set_interrupt_handler(Some(Box::new(|| signal::take_pending(libc::SIGINT))));
        }
        if state.config.track_rejections {
            let rejections = Rc::clone(&state.rejections);
            engine.set_rejection_tracker(Some(Box::new(
                move |promise: &E::Value, reason: &E::Value, handled: bool| {
                    let mut pending = rejections.borrow_mut();
                    if handled {
                        pending.retain(|r| &r.promise != promise);
                    } else {
                        pending.push(Rejection {
                            promise: promise.clone(),
                            reason: reason.clone(),
                        });
                    }
                },
            )));
        }

        debug!(worker = state.is_worker(), "runtime initialized");
        Self {
            state,
            engine,
            libraries: None,
        }
    }

    /// The engine
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// The engine, mutably
    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// Shared runtime state
    pub fn state(&self) -> &Rc<RuntimeState<E>> {
        &self.state
    }

    /// Settings this runtime was built with
    pub fn config(&self) -> &RuntimeConfig {
        &self.state.config
    }

    /// Module loader
    pub fn loader(&self) -> &ModuleLoader<E> {
        &self.state.loader
    }

    /// Timer registry
    pub fn timers(&self) -> &TimerRegistry<E::Value> {
        &self.state.timers
    }

    /// Worker lifecycle tracker
    pub fn tracker(&self) -> &WorkerTracker {
        &self.state.tracker
    }

    /// Shared buffer allocator
    pub fn shares(&self) -> &ShareRegistry {
        &self.state.shares
    }

    /// Current event loop phase
    pub fn phase(&self) -> LoopPhase {
        self.state.phase.get()
    }

    /// Whether this runtime runs on a worker thread
    pub fn is_worker(&self) -> bool {
        self.state.is_worker()
    }

    /// Install or remove the module delegate
    pub fn set_module_delegate(&self, delegate: Option<Rc<dyn ModuleDelegate<E>>>) {
        self.state.loader.set_delegate(delegate);
    }

    /// Install the factory used to create worker engines
    pub fn set_worker_factory(&self, factory: Arc<dyn WorkerFactory<E>>) {
        *self.state.worker_factory.borrow_mut() = Some(factory);
    }

    /// Replace the diagnostic reporter
    pub fn set_reporter(&self, reporter: Rc<dyn ErrorReporter>) {
        *self.state.reporter.borrow_mut() = reporter;
    }

    /// Arguments passed to the program by [`Runtime::run_main`]
    pub fn script_args(&self) -> Vec<String> {
        self.state.script_args.borrow().clone()
    }

    /// `setTimeout`/`setInterval`: call `callback` after `delay_ms`, then
    /// every `interval_ms` if it is non-zero
    pub fn set_timer(
        &self,
        callback: E::Value,
        delay_ms: u64,
        interval_ms: u64,
    ) -> TimerHandle<E::Value> {
        self.state.timers.schedule(callback, delay_ms, interval_ms)
    }

    /// `clearTimeout`/`clearInterval`
    pub fn clear_timer(&self, handle: &TimerHandle<E::Value>) {
        self.state.timers.cancel(handle);
    }

    /// Call `callback` whenever `fd` is readable; `None` removes it
    pub fn set_read_handler(&self, fd: RawFd, callback: Option<E::Value>) {
        self.state.io.set_read(fd, callback);
    }

    /// Call `callback` whenever `fd` is writable; `None` removes it
    pub fn set_write_handler(&self, fd: RawFd, callback: Option<E::Value>) {
        self.state.io.set_write(fd, callback);
    }

    /// Call `callback` with the signal number when `sig` is delivered;
    /// `None` restores the default disposition. Coordinating thread only.
    pub fn set_signal_handler(&self, sig: i32, callback: Option<E::Value>) -> RuntimeResult<()> {
        if self.is_worker() {
            return Err(RuntimeError::worker(
                "signal handlers can only be installed on the main thread",
            ));
        }
        self.state.signals.set(sig, callback)
    }

    /// Override the exit code returned by the event loop
    pub fn set_exit_code(&self, code: i32) {
        self.state.exit.set_code(code);
    }

    /// Exit code: the override if set, else 1 after an uncaught error, else 0
    pub fn exit_code(&self) -> i32 {
        self.state.exit.code()
    }

    /// Every engine value the runtime keeps alive, for the embedder's GC
    /// mark hook
    pub fn held_values(&self) -> Vec<E::Value> {
        self.state.held_values()
    }

    /// Report the engine's pending exception as uncaught
    pub fn report_exception(&mut self) {
        self.state.report_exception(&mut self.engine);
    }

    /// Call a script callback, reporting its exception if it throws.
    /// Returns whether the call succeeded.
    pub fn invoke_callback(&mut self, callback: &E::Value, args: &[E::Value]) -> bool {
        match self.engine.call(callback, args) {
            Ok(_) => true,
            Err(_) => {
                self.report_exception();
                false
            }
        }
    }
}

impl<E: Engine> Drop for Runtime<E> {
    fn drop(&mut self) {
        self.engine.set_rejection_tracker(None);
        self.engine.set_interrupt_handler(None);
        self.state.teardown();
        self.libraries = Some(self.state.loader.take_libraries());
        debug!(worker = self.state.is_worker(), "runtime torn down");
    }
}

impl<E: Engine> fmt::Debug for Runtime<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
