//! The seam between the runtime and an embedded script engine.
//!
//! The runtime never looks inside engine values. Everything it needs
//! (compiling, running, calling, draining jobs, raising exceptions) goes
//! through the [`Engine`] trait. Handle types follow the usual embedding
//! convention: cloning a handle duplicates the reference, dropping it frees it.

use std::ffi::{c_char, c_void};
use std::fmt;
use std::rc::Rc;

use kelp_unit::UnitValue;
use thiserror::Error;

use crate::shared_buffer::SharedBuffer;

/// Marker for "an exception is pending inside the engine".
///
/// The exception value itself stays in the engine until
/// [`Engine::take_exception`] retrieves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("exception pending in engine")]
pub struct Thrown;

/// Result of an engine call
pub type EngineResult<T> = Result<T, Thrown>;

/// Host function callable from scripts
pub type NativeFunction<E> =
    Rc<dyn Fn(&mut E, &[<E as Engine>::Value]) -> EngineResult<<E as Engine>::Value>>;

/// Polled by the engine between bytecode steps; returning `true` aborts the
/// running script with an uncatchable interrupt error.
pub type InterruptHandler = Box<dyn FnMut() -> bool>;

/// Called by the engine with `(promise, reason, is_handled)` whenever a
/// promise is rejected without a handler, or a handler is attached later.
pub type RejectionTracker<E> =
    Box<dyn FnMut(&<E as Engine>::Value, &<E as Engine>::Value, bool)>;

/// Entry point exported by native extension modules.
///
/// Receives the engine's raw context and the module name, returns the engine's
/// raw module definition (null on failure).
pub type NativeInit = unsafe extern "C" fn(ctx: *mut c_void, name: *const c_char) -> *mut c_void;

/// How source text should be compiled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// Classic script
    Script,
    /// ES module
    Module,
}

/// A compiled unit, or a plain value produced by deserialization
pub enum Unit<E: Engine> {
    /// Plain data value (worker messages)
    Value(E::Value),
    /// Compiled script, not yet run
    Script(E::Value),
    /// Compiled module, not yet linked or evaluated
    Module(E::Module),
}

impl<E: Engine> Clone for Unit<E> {
    fn clone(&self) -> Self {
        match self {
            Unit::Value(v) => Unit::Value(v.clone()),
            Unit::Script(v) => Unit::Script(v.clone()),
            Unit::Module(m) => Unit::Module(m.clone()),
        }
    }
}

impl<E: Engine> fmt::Debug for Unit<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Unit::Script(v) => f.debug_tuple("Script").field(v).finish(),
            Unit::Module(m) => f.debug_tuple("Module").field(m).finish(),
        }
    }
}

/// Outcome of running one pending job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job queue was empty
    Idle,
    /// A job ran to completion
    Ran,
    /// A job raised; the exception is pending in the engine
    Failed,
}

/// Settlement state of a value that may be a promise
#[derive(Debug, Clone, PartialEq)]
pub enum PromiseState<V> {
    /// The value is not a promise
    NotAPromise,
    /// Not settled yet
    Pending,
    /// Resolved with a value
    Fulfilled(V),
    /// Rejected with a reason
    Rejected(V),
}

/// Script-visible error classes the runtime raises
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// `Error`
    Error,
    /// `TypeError`
    TypeError,
    /// `ReferenceError`
    ReferenceError,
    /// `RangeError`
    RangeError,
    /// `SyntaxError`
    SyntaxError,
    /// `InternalError`
    InternalError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Error => "Error",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::ReferenceError => "ReferenceError",
            ErrorKind::RangeError => "RangeError",
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::InternalError => "InternalError",
        };
        f.write_str(name)
    }
}

/// Printable form of an exception
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExceptionReport {
    /// `String(exception)`
    pub message: String,
    /// Stack trace, when the exception carries one
    pub stack: Option<String>,
}

/// Metadata attached to a module before it runs (`import.meta`)
pub struct ImportMeta<E: Engine> {
    /// Canonical URL
    pub url: String,
    /// Whether this is the main module
    pub main: bool,
    /// Synchronous `require(specifier)` bound to this module
    pub require: E::Value,
    /// `resolve(specifier)` bound to this module
    pub resolve: E::Value,
}

impl<E: Engine> fmt::Debug for ImportMeta<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportMeta")
            .field("url", &self.url)
            .field("main", &self.main)
            .finish_non_exhaustive()
    }
}

/// Operations the runtime consumes from an embedded script engine.
///
/// Every fallible call returns [`Thrown`] with the exception left pending in
/// the engine, the same way embeddable engines report errors through their C
/// APIs.
pub trait Engine: Sized + 'static {
    /// Handle to a script value. Equality is identity for objects.
    type Value: Clone + PartialEq + fmt::Debug + 'static;
    /// Handle to a compiled module
    type Module: Clone + fmt::Debug + 'static;

    // Compilation and execution

    /// Compile source text without running it
    fn compile(&mut self, source: &str, filename: &str, kind: UnitKind) -> EngineResult<Unit<Self>>;

    /// Run a compiled unit.
    ///
    /// Scripts return their completion value. Modules must already be linked
    /// and return their evaluation promise; evaluating twice returns the same
    /// promise.
    fn run(&mut self, unit: Unit<Self>) -> EngineResult<Self::Value>;

    /// Canonical name a module was compiled or registered under
    fn module_name(&self, module: &Self::Module) -> String;

    /// Specifiers requested by a module's static imports, in source order
    fn module_requests(&self, module: &Self::Module) -> Vec<String>;

    /// Bind one of `module`'s requests to an already loaded module
    fn link_module(
        &mut self,
        module: &Self::Module,
        request: &str,
        target: &Self::Module,
    ) -> EngineResult<()>;

    /// Namespace object of an evaluated module
    fn module_namespace(&mut self, module: &Self::Module) -> EngineResult<Self::Value>;

    /// Populate `import.meta` before the module runs
    fn set_import_meta(&mut self, module: &Self::Module, meta: ImportMeta<Self>)
    -> EngineResult<()>;

    /// Build a module from a native extension's init function
    fn instantiate_native(&mut self, init: NativeInit, name: &str) -> EngineResult<Self::Module>;

    // Values

    /// Call a function with `this` undefined
    fn call(&mut self, func: &Self::Value, args: &[Self::Value]) -> EngineResult<Self::Value>;

    /// Wrap a host function
    fn new_function(
        &mut self,
        name: &str,
        arity: u32,
        func: NativeFunction<Self>,
    ) -> EngineResult<Self::Value>;

    /// New string value
    fn new_string(&mut self, s: &str) -> EngineResult<Self::Value>;

    /// New number value
    fn new_number(&mut self, n: f64) -> Self::Value;

    /// The `undefined` value
    fn undefined(&self) -> Self::Value;

    /// Contents of a string value, `None` for any other type
    fn as_string(&mut self, value: &Self::Value) -> Option<String>;

    /// Whether a value is callable
    fn is_function(&self, value: &Self::Value) -> bool;

    /// Whether an object has an own property
    fn has_property(&mut self, object: &Self::Value, key: &str) -> bool;

    /// Read a property
    fn get_property(&mut self, object: &Self::Value, key: &str) -> EngineResult<Self::Value>;

    /// Inspect a possible promise
    fn promise_state(&mut self, value: &Self::Value) -> PromiseState<Self::Value>;

    // Jobs and exceptions

    /// Run the oldest pending job, if any
    fn execute_pending_job(&mut self) -> JobOutcome;

    /// Remove and return the pending exception (`undefined` if none)
    fn take_exception(&mut self) -> Self::Value;

    /// Make `value` the pending exception
    fn throw_value(&mut self, value: Self::Value) -> Thrown;

    /// Raise a new error object of the given class
    fn throw_error(&mut self, kind: ErrorKind, message: &str) -> Thrown;

    /// Raise the engine's out-of-memory error
    fn throw_out_of_memory(&mut self) -> Thrown {
        self.throw_error(ErrorKind::InternalError, "out of memory")
    }

    /// Message and stack of an exception value
    fn describe_exception(&mut self, exception: &Self::Value) -> ExceptionReport;

    // Serialization

    /// Lower a unit into the portable value tree, appending every shared
    /// buffer it references to `shared`
    fn write_unit(
        &mut self,
        unit: &Unit<Self>,
        shared: &mut Vec<SharedBuffer>,
    ) -> EngineResult<UnitValue>;

    /// Rebuild a unit from the portable value tree
    fn read_unit(&mut self, value: UnitValue, shared: &[SharedBuffer]) -> EngineResult<Unit<Self>>;

    // Hooks

    /// Install or remove the interrupt handler
    fn set_interrupt_handler(&mut self, handler: Option<InterruptHandler>);

    /// Install or remove the promise rejection tracker
    fn set_rejection_tracker(&mut self, tracker: Option<RejectionTracker<Self>>);
}
