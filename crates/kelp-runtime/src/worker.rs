//! Worker threads and their lifecycle tracking.
//!
//! A worker is a thread running its own [`Runtime`] with its own engine,
//! created by the parent's [`WorkerFactory`]. Parent and worker talk over a
//! pair of [`MessagePipe`]s; values cross as serialized units, and shared
//! buffers cross by reference.
//!
//! The parent's [`WorkerTracker`] counts live workers. Each worker writes one
//! byte to the tracker's completion pipe when it finishes, and the parent's
//! poll step consumes one byte per finished worker. The event loop keeps
//! running while the count is non-zero.

use std::fmt;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, bounded};
use parking_lot::Mutex;
use tracing::{debug, error, info_span, trace, warn};

use crate::config::RuntimeConfig;
use crate::engine::{Engine, EngineResult, NativeFunction};
use crate::error::{RuntimeError, RuntimeResult};
use crate::message_pipe::MessagePipe;
use crate::module_loader;
use crate::poll::StdPoll;
use crate::runtime::Runtime;
use crate::shared_buffer::ShareRegistry;
use crate::unit;
use crate::wakeup::WakeupPipe;

/// Counts live workers of one runtime.
#[derive(Debug, Default)]
pub struct WorkerTracker {
    /// Completion pipe, created with the first worker
    pipe: Mutex<Option<Arc<WakeupPipe>>>,
    active: AtomicUsize,
}

impl WorkerTracker {
    /// Tracker with no workers
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new worker and hand out its completion notifier
    pub fn register_worker(&self) -> RuntimeResult<WorkerNotifier> {
        let mut slot = self.pipe.lock();
        let pipe = match slot.as_ref() {
            Some(pipe) => Arc::clone(pipe),
            None => {
                let pipe = Arc::new(WakeupPipe::new()?);
                *slot = Some(Arc::clone(&pipe));
                pipe
            }
        };
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(active, "worker registered");
        Ok(WorkerNotifier { pipe })
    }

    /// Undo a registration whose thread never started
    pub(crate) fn cancel_registration(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Workers registered and not yet seen finishing
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Read end of the completion pipe, once a worker was registered
    pub fn notify_fd(&self) -> Option<RawFd> {
        self.pipe.lock().as_ref().map(|pipe| pipe.read_fd())
    }

    /// Consume one completion byte per finished worker, returning how many
    /// were consumed
    pub fn drain_completed(&self) -> usize {
        let Some(pipe) = self.pipe.lock().clone() else {
            return 0;
        };
        let mut finished = 0;
        while self.active_count() > 0 {
            match pipe.consume_one() {
                Ok(true) => {
                    self.cancel_registration();
                    finished += 1;
                }
                Ok(false) => break,
                Err(e) => {
                    warn!(error = %e, "failed to read worker completion pipe");
                    break;
                }
            }
        }
        finished
    }
}

/// Handle a worker thread uses to report that it finished
#[derive(Debug)]
pub struct WorkerNotifier {
    pipe: Arc<WakeupPipe>,
}

impl WorkerNotifier {
    /// Write the completion byte.
    ///
    /// Interrupted and would-block writes are retried; any other failure is
    /// logged and the notification is lost.
    pub fn signal_done(self) {
        if let Err(e) = self.pipe.notify() {
            warn!(error = %e, "failed to signal worker completion");
        }
    }
}

/// Creates engines for worker threads.
///
/// Shared by every thread of the process, so it must be `Send + Sync`; the
/// engines it creates never leave the thread that called
/// [`WorkerFactory::create_engine`].
pub trait WorkerFactory<E: Engine>: Send + Sync + 'static {
    /// Create a fresh engine on the calling worker thread
    fn create_engine(&self) -> RuntimeResult<E>;

    /// Prepare the worker's runtime (globals, delegates) before the worker
    /// module loads
    fn init_runtime(&self, _runtime: &mut Runtime<E>) -> RuntimeResult<()> {
        Ok(())
    }
}

/// Parent-side handle of a worker
pub struct Worker {
    name: String,
    port_id: u64,
    to_worker: MessagePipe,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Canonical name of the worker's module
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a value to the worker
    pub fn post_message<E: Engine>(
        &self,
        runtime: &mut Runtime<E>,
        value: &E::Value,
    ) -> RuntimeResult<()> {
        let message = unit::encode_message(&mut runtime.engine, value)?;
        self.to_worker.send(message)
    }

    /// Install (`Some`) or remove (`None`) the handler for messages from the
    /// worker.
    ///
    /// Only ports with a handler keep the parent's event loop waiting.
    pub fn set_message_handler<E: Engine>(
        &self,
        runtime: &Runtime<E>,
        handler: Option<E::Value>,
    ) -> bool {
        runtime.state.set_port_handler(self.port_id, handler)
    }

    /// Wait for the worker thread to exit.
    ///
    /// Dropping the handle first lets a worker that only waits for messages
    /// see that its parent is gone.
    pub fn join(mut self) -> RuntimeResult<()> {
        let thread = self.thread.take();
        drop(self);
        match thread {
            Some(thread) => thread
                .join()
                .map_err(|_| RuntimeError::worker("worker thread panicked")),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("port", &self.port_id)
            .finish_non_exhaustive()
    }
}

/// Everything a worker thread takes with it
struct WorkerStart<E: Engine> {
    factory: Arc<dyn WorkerFactory<E>>,
    config: RuntimeConfig,
    shares: ShareRegistry,
    module: String,
    incoming: MessagePipe,
    outgoing: MessagePipe,
    ready: Sender<Result<(), String>>,
    notifier: WorkerNotifier,
}

impl<E: Engine> Runtime<E> {
    /// Start a worker running `specifier`, resolved from the main module.
    ///
    /// Returns once the worker's runtime exists; the module itself loads on
    /// the worker thread. `on_message` receives values the worker posts.
    pub fn spawn_worker(
        &mut self,
        specifier: &str,
        on_message: Option<E::Value>,
    ) -> RuntimeResult<Worker> {
        let factory = self
            .state
            .worker_factory
            .borrow()
            .clone()
            .ok_or_else(|| RuntimeError::worker("no worker factory installed"))?;
        let referrer = self.state.loader.main_module().unwrap_or_default();
        let module = self
            .state
            .loader
            .resolve(&mut self.engine, specifier, &referrer)?;

        let to_worker = MessagePipe::new()?;
        let from_worker = MessagePipe::new()?;
        let notifier = self.state.tracker.register_worker()?;
        let port_id = self.state.allocate_port_id();
        let thread_name = format!("kelp-worker-{port_id}");

        let (ready_tx, ready_rx) = bounded(1);
        let start = WorkerStart {
            factory,
            config: self.state.config.clone(),
            shares: self.state.shares.clone(),
            module: module.clone(),
            incoming: to_worker.clone(),
            outgoing: from_worker.clone(),
            ready: ready_tx,
            notifier,
        };

        let spawned = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || run_worker(start));
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                self.state.tracker.cancel_registration();
                return Err(RuntimeError::worker(format!(
                    "failed to spawn worker thread: {e}"
                )));
            }
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                let _ = thread.join();
                return Err(RuntimeError::Worker(reason));
            }
            Err(_) => {
                let _ = thread.join();
                return Err(RuntimeError::worker("worker exited during startup"));
            }
        }

        self.state.add_port(port_id, from_worker, on_message);
        debug!(worker = %thread_name, module = %module, "worker spawned");
        Ok(Worker {
            name: module,
            port_id,
            to_worker,
            thread: Some(thread),
        })
    }

    /// Send a value to the parent runtime. Worker runtimes only.
    pub fn post_to_parent(&mut self, value: &E::Value) -> RuntimeResult<()> {
        let outgoing = match &self.state.parent {
            Some(parent) => parent.outgoing.clone(),
            None => return Err(RuntimeError::worker("not running in a worker")),
        };
        let message = unit::encode_message(&mut self.engine, value)?;
        outgoing.send(message)
    }

    /// Script function `postMessage(value)` that sends `value` to the parent.
    /// Worker runtimes only.
    pub fn parent_post_function(&mut self) -> RuntimeResult<E::Value> {
        if !self.is_worker() {
            return Err(RuntimeError::worker("not running in a worker"));
        }
        let state = Rc::downgrade(&self.state);
        let post: NativeFunction<E> =
            Rc::new(move |engine: &mut E, args: &[E::Value]| -> EngineResult<E::Value> {
                let state = module_loader::upgrade(&state, engine)?;
                let value = args.first().cloned().unwrap_or_else(|| engine.undefined());
                let sent = match &state.parent {
                    Some(parent) => unit::encode_message(engine, &value)
                        .and_then(|message| parent.outgoing.send(message)),
                    None => Err(RuntimeError::worker("not running in a worker")),
                };
                sent.map_err(|e| e.throw_into(engine))?;
                Ok(engine.undefined())
            });
        Ok(self.engine.new_function("postMessage", 1, post)?)
    }

    /// Install (`Some`) or remove (`None`) the handler for messages from the
    /// parent. Worker runtimes only.
    pub fn set_parent_message_handler(&self, handler: Option<E::Value>) -> RuntimeResult<()> {
        let port_id = match &self.state.parent {
            Some(parent) => parent.port_id,
            None => return Err(RuntimeError::worker("not running in a worker")),
        };
        if !self.state.set_port_handler(port_id, handler) {
            return Err(RuntimeError::worker("parent port is closed"));
        }
        Ok(())
    }
}

fn run_worker<E: Engine>(start: WorkerStart<E>) {
    let thread_name = thread::current()
        .name()
        .unwrap_or("kelp-worker")
        .to_string();
    let _span = info_span!("worker", name = %thread_name).entered();
    debug!("Worker starting");

    let WorkerStart {
        factory,
        config,
        shares,
        module,
        incoming,
        outgoing,
        ready,
        notifier,
    } = start;

    let worker_config = config.interrupt_on_sigint(false);
    let runtime = factory.create_engine().and_then(|engine| {
        let mut runtime = Runtime::build(engine, worker_config, shares, Some((incoming, outgoing)));
        runtime.set_worker_factory(Arc::clone(&factory));
        factory.init_runtime(&mut runtime)?;
        Ok(runtime)
    });

    match runtime {
        Ok(mut runtime) => {
            let _ = ready.send(Ok(()));
            debug!("Worker initialized");

            if let Err(e) = runtime.import_module(&module) {
                runtime.state.report_error(&mut runtime.engine, e);
            }
            match runtime.run_loop(&mut StdPoll) {
                Ok(code) => debug!(code, "Worker event loop finished"),
                Err(e) => warn!(error = %e, "Worker event loop failed"),
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to create worker runtime");
            let _ = ready.send(Err(e.to_string()));
        }
    }

    notifier.signal_done();
    debug!("Worker stopped");
}
