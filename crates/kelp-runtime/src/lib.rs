//! kelp-runtime - host runtime for embedded JavaScript engines.
//!
//! This crate provides everything around an engine that a command-line
//! script runner needs: module resolution and loading, an event loop with
//! timers, descriptor and signal handlers, worker threads with message
//! passing and shared buffers, and a binary format for compiled units.
//!
//! The engine itself plugs in through the [`Engine`] trait.
//!
//! # Example
//!
//! ```no_run
//! use kelp_runtime::{Engine, RunOptions, Runtime};
//!
//! fn run<E: Engine>(engine: E) -> kelp_runtime::RuntimeResult<i32> {
//!     let mut runtime = Runtime::new(engine);
//!     runtime.run_main(&RunOptions::file("main.mjs"))
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Runtime<E>                            │
//! │  ┌──────────────┐ ┌──────────────┐ ┌──────────────┐         │
//! │  │ ModuleLoader │ │ TimerRegistry│ │ IoHandlers / │         │
//! │  │  + delegate  │ │              │ │ Signals      │         │
//! │  └──────────────┘ └──────────────┘ └──────────────┘         │
//! │  ┌──────────────┐ ┌──────────────┐                          │
//! │  │ Ports        │ │ WorkerTracker│ ← completion pipe        │
//! │  └──────────────┘ └──────────────┘                          │
//! └─────────────────────────────────────────────────────────────┘
//!          ↓ drain jobs            ↓ poll(2)
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                               │
//! │  - compile / run / call                                      │
//! │  - job queue                                                 │
//! │  - unit lowering for kelp-unit                               │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod bootstrap;
pub mod config;
pub mod engine;
pub mod error;
pub mod event_loop;
pub mod handlers;
pub mod message_pipe;
pub mod module_loader;
mod native;
pub mod poll;
pub mod runtime;
pub mod shared_buffer;
pub mod signal;
pub mod timer;
pub mod unit;
pub mod wakeup;
pub mod worker;

pub use bootstrap::EVAL_FILENAME;
pub use config::{EvalKind, RunOptions, RuntimeConfig};
pub use engine::{
    Engine, EngineResult, ErrorKind, ExceptionReport, ImportMeta, InterruptHandler, JobOutcome,
    NativeFunction, NativeInit, PromiseState, RejectionTracker, Thrown, Unit, UnitKind,
};
pub use error::{ErrorReporter, ReportKind, RuntimeError, RuntimeResult, StderrReporter};
pub use event_loop::{ExitStatus, LoopPhase};
pub use handlers::{Interest, IoHandlers};
pub use message_pipe::{Message, MessagePipe};
pub use module_loader::{
    MODULE_EXPORTS, ModuleDelegate, ModuleLoader, ModuleRecord, ModuleStatus, ScriptDelegate,
    detect_module,
};
pub use native::NATIVE_INIT_SYMBOL;
pub use poll::{Poll, StdPoll};
pub use runtime::{Runtime, RuntimeState};
pub use shared_buffer::{ShareRegistry, SharedBuffer};
pub use signal::{InterruptGuard, InterruptScope, SignalHandlers};
pub use timer::{Clock, ManualClock, MonotonicClock, TimerHandle, TimerRegistry};
pub use unit::{decode_message, deserialize_unit, encode_message, serialize_unit};
pub use wakeup::WakeupPipe;
pub use worker::{Worker, WorkerFactory, WorkerNotifier, WorkerTracker};

/// Re-export of the unit format crate
pub use kelp_unit;
