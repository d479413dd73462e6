//! Module resolution, loading, linking and evaluation.
//!
//! Names flow through three steps: a specifier is *resolved* against its
//! referrer into a canonical name, the canonical name is *loaded* (read,
//! compiled, given its `import.meta`, cached), and the loaded record is
//! *linked* by loading its own requests recursively. Each canonical name is
//! compiled at most once per runtime; failed loads are not cached.
//!
//! Resolution and reading can be overridden by a [`ModuleDelegate`]. Without
//! one, specifiers resolve to themselves and sources are read from disk.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use libloading::Library;
use tracing::{debug, trace};

use crate::config::RuntimeConfig;
use crate::engine::{
    Engine, EngineResult, ErrorKind, ImportMeta, JobOutcome, NativeFunction, PromiseState, Unit,
    UnitKind,
};
use crate::error::{RuntimeError, RuntimeResult};
use crate::native::{self, NativeLibraries};
use crate::runtime::RuntimeState;

/// Namespace key that replaces the whole namespace in `require` results
pub const MODULE_EXPORTS: &str = "module.exports";

/// Where a name is in the load pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
    /// Never requested
    Unresolved,
    /// Specifier being resolved
    Resolving,
    /// Source being read
    Loading,
    /// Source being compiled
    Compiling,
    /// Compiled and cached
    Registered,
    /// The last attempt failed
    Failed,
}

/// Script-level override of module resolution and source reading.
///
/// `None` from either hook falls back to the built-in behavior.
pub trait ModuleDelegate<E: Engine> {
    /// Map `specifier`, requested by `referrer`, to a canonical name
    fn resolve(
        &self,
        _engine: &mut E,
        _specifier: &str,
        _referrer: &str,
    ) -> Option<RuntimeResult<String>> {
        None
    }

    /// Source text of the module named `name`
    fn read(&self, _engine: &mut E, _name: &str) -> Option<RuntimeResult<String>> {
        None
    }

    /// Engine values the delegate keeps alive
    fn held_values(&self) -> Vec<E::Value> {
        Vec::new()
    }
}

/// Delegate backed by two script functions: `resolve(specifier, referrer)`
/// and `read(name)`, both returning strings.
///
/// A hook that is missing or not callable falls back to the built-in
/// behavior.
pub struct ScriptDelegate<E: Engine> {
    resolve: Option<E::Value>,
    read: Option<E::Value>,
}

impl<E: Engine> ScriptDelegate<E> {
    /// Create a delegate from optional hook functions
    pub fn new(resolve: Option<E::Value>, read: Option<E::Value>) -> Self {
        Self { resolve, read }
    }
}

impl<E: Engine> ModuleDelegate<E> for ScriptDelegate<E> {
    fn resolve(
        &self,
        engine: &mut E,
        specifier: &str,
        referrer: &str,
    ) -> Option<RuntimeResult<String>> {
        let hook = self.resolve.as_ref().filter(|f| engine.is_function(f))?;
        Some(call_for_string(engine, hook, &[specifier, referrer], "resolve"))
    }

    fn read(&self, engine: &mut E, name: &str) -> Option<RuntimeResult<String>> {
        let hook = self.read.as_ref().filter(|f| engine.is_function(f))?;
        Some(call_for_string(engine, hook, &[name], "read"))
    }

    fn held_values(&self) -> Vec<E::Value> {
        self.resolve.iter().chain(self.read.iter()).cloned().collect()
    }
}

impl<E: Engine> fmt::Debug for ScriptDelegate<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptDelegate")
            .field("resolve", &self.resolve)
            .field("read", &self.read)
            .finish()
    }
}

fn call_for_string<E: Engine>(
    engine: &mut E,
    hook: &E::Value,
    args: &[&str],
    what: &str,
) -> RuntimeResult<String> {
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        values.push(engine.new_string(arg)?);
    }
    let result = engine.call(hook, &values)?;
    engine
        .as_string(&result)
        .ok_or_else(|| RuntimeError::Type(format!("module {what} hook must return a string")))
}

/// Whether source text looks like an ES module: its first token, after
/// whitespace, comments and a `#!` line, is `export`, or `import` not
/// followed by `(` or `.`.
pub fn detect_module(source: &str) -> bool {
    let mut rest = source.strip_prefix('\u{feff}').unwrap_or(source);
    if rest.starts_with("#!") {
        rest = match rest.find('\n') {
            Some(i) => &rest[i..],
            None => "",
        };
    }
    rest = skip_trivia(rest);

    let ident_len = rest
        .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '$'))
        .unwrap_or(rest.len());
    match &rest[..ident_len] {
        "export" => true,
        "import" => {
            let next = skip_trivia(&rest[ident_len..]);
            !(next.starts_with('(') || next.starts_with('.'))
        }
        _ => false,
    }
}

fn skip_trivia(mut s: &str) -> &str {
    loop {
        s = s.trim_start();
        if let Some(line) = s.strip_prefix("//") {
            s = line.find('\n').map_or("", |i| &line[i..]);
        } else if let Some(block) = s.strip_prefix("/*") {
            s = block.find("*/").map_or("", |i| &block[i + 2..]);
        } else {
            return s;
        }
    }
}

/// `import.meta.url` for a canonical name
pub fn module_url(name: &str) -> String {
    if name.contains("://") {
        name.to_string()
    } else {
        format!("file://{name}")
    }
}

/// A loaded module and its evaluation state
pub struct ModuleRecord<E: Engine> {
    name: String,
    url: String,
    module: E::Module,
    linked: Cell<bool>,
    evaluation: RefCell<Option<E::Value>>,
}

impl<E: Engine> ModuleRecord<E> {
    fn new(name: &str, module: E::Module) -> Self {
        Self {
            name: name.to_string(),
            url: module_url(name),
            module,
            linked: Cell::new(false),
            evaluation: RefCell::new(None),
        }
    }

    /// Canonical name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `import.meta.url`
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Engine module handle
    pub fn module(&self) -> &E::Module {
        &self.module
    }

    /// Whether linking started for this module
    pub fn is_linked(&self) -> bool {
        self.linked.get()
    }

    /// Evaluation promise, once the module has been evaluated
    pub fn evaluation(&self) -> Option<E::Value> {
        self.evaluation.borrow().clone()
    }
}

impl<E: Engine> fmt::Debug for ModuleRecord<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRecord")
            .field("name", &self.name)
            .field("linked", &self.linked.get())
            .field("evaluated", &self.evaluation.borrow().is_some())
            .finish()
    }
}

/// Per-runtime module cache and loader.
pub struct ModuleLoader<E: Engine> {
    state: Weak<RuntimeState<E>>,
    config: RuntimeConfig,
    cache: RefCell<HashMap<String, Rc<ModuleRecord<E>>>>,
    status: RefCell<HashMap<String, ModuleStatus>>,
    delegate: RefCell<Option<Rc<dyn ModuleDelegate<E>>>>,
    main_module: RefCell<Option<String>>,
    libraries: RefCell<Vec<Library>>,
}

impl<E: Engine> ModuleLoader<E> {
    pub(crate) fn new(state: Weak<RuntimeState<E>>, config: &RuntimeConfig) -> Self {
        Self {
            state,
            config: config.clone(),
            cache: RefCell::new(HashMap::new()),
            status: RefCell::new(HashMap::new()),
            delegate: RefCell::new(None),
            main_module: RefCell::new(None),
            libraries: RefCell::new(Vec::new()),
        }
    }

    /// Install or remove the delegate
    pub fn set_delegate(&self, delegate: Option<Rc<dyn ModuleDelegate<E>>>) {
        *self.delegate.borrow_mut() = delegate;
    }

    fn delegate(&self) -> Option<Rc<dyn ModuleDelegate<E>>> {
        self.delegate.borrow().clone()
    }

    fn truncate_name<'a>(&self, name: &'a str) -> &'a str {
        let mut end = self.config.max_main_name_len.min(name.len());
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        &name[..end]
    }

    /// Record the main module's name, truncated to the configured length
    pub fn set_main_module(&self, name: &str) {
        let name = self.truncate_name(name).to_string();
        debug!(module = %name, "main module set");
        *self.main_module.borrow_mut() = Some(name);
    }

    /// Recorded main module name
    pub fn main_module(&self) -> Option<String> {
        self.main_module.borrow().clone()
    }

    /// Whether `name` is the main module
    pub fn is_main_module(&self, name: &str) -> bool {
        self.main_module.borrow().as_deref() == Some(self.truncate_name(name))
    }

    /// Pipeline status of a name
    pub fn status(&self, name: &str) -> ModuleStatus {
        self.status
            .borrow()
            .get(name)
            .copied()
            .unwrap_or(ModuleStatus::Unresolved)
    }

    fn set_status(&self, name: &str, status: ModuleStatus) {
        trace!(module = name, ?status, "module status");
        self.status.borrow_mut().insert(name.to_string(), status);
    }

    /// Whether `name` is in the cache
    pub fn is_cached(&self, name: &str) -> bool {
        self.cache.borrow().contains_key(name)
    }

    /// Cached record of `name`
    pub fn get(&self, name: &str) -> Option<Rc<ModuleRecord<E>>> {
        self.cache.borrow().get(name).cloned()
    }

    /// Number of cached modules
    pub fn len(&self) -> usize {
        self.cache.borrow().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.cache.borrow().is_empty()
    }

    /// Canonical name of `specifier` requested from `referrer`.
    ///
    /// Without a delegate hook the specifier is its own canonical name, the
    /// empty string included; loading such a name fails instead.
    pub fn resolve(&self, engine: &mut E, specifier: &str, referrer: &str) -> RuntimeResult<String> {
        let tracked = !self.status.borrow().contains_key(specifier);
        if tracked {
            self.set_status(specifier, ModuleStatus::Resolving);
        }
        let resolved = match self.delegate() {
            Some(delegate) => delegate.resolve(engine, specifier, referrer),
            None => None,
        }
        .unwrap_or_else(|| Ok(specifier.to_string()));

        if tracked {
            match &resolved {
                Ok(name) if name == specifier => {}
                Ok(_) => {
                    self.status.borrow_mut().remove(specifier);
                }
                Err(_) => self.set_status(specifier, ModuleStatus::Failed),
            }
        }
        resolved
    }

    /// Load, compile and cache `name`; a cached record is returned as is
    pub fn load(&self, engine: &mut E, name: &str) -> RuntimeResult<Rc<ModuleRecord<E>>> {
        if let Some(record) = self.get(name) {
            return Ok(record);
        }

        self.set_status(name, ModuleStatus::Loading);
        match self.load_uncached(engine, name) {
            Ok(record) => {
                self.cache
                    .borrow_mut()
                    .insert(name.to_string(), Rc::clone(&record));
                self.set_status(name, ModuleStatus::Registered);
                debug!(module = name, "module loaded");
                Ok(record)
            }
            Err(e) => {
                self.set_status(name, ModuleStatus::Failed);
                debug!(module = name, error = %e, "module load failed");
                Err(e)
            }
        }
    }

    fn load_uncached(&self, engine: &mut E, name: &str) -> RuntimeResult<Rc<ModuleRecord<E>>> {
        if self.config.is_native(name) {
            self.set_status(name, ModuleStatus::Compiling);
            let (library, module) = native::load_native(engine, name)?;
            self.libraries.borrow_mut().push(library);
            return Ok(Rc::new(ModuleRecord::new(name, module)));
        }

        let source = self.read_source(engine, name)?;
        self.set_status(name, ModuleStatus::Compiling);
        match engine.compile(&source, name, UnitKind::Module)? {
            Unit::Module(module) => self.attach(engine, name, module),
            _ => Err(RuntimeError::Type(format!(
                "'{name}' did not compile to a module"
            ))),
        }
    }

    fn read_source(&self, engine: &mut E, name: &str) -> RuntimeResult<String> {
        if let Some(delegate) = self.delegate()
            && let Some(source) = delegate.read(engine, name)
        {
            return source;
        }
        std::fs::read_to_string(name).map_err(|e| RuntimeError::Load {
            name: name.to_string(),
            reason: e.to_string(),
            fatal: true,
        })
    }

    /// Give a compiled module its `import.meta` and wrap it in a record
    fn attach(
        &self,
        engine: &mut E,
        name: &str,
        module: E::Module,
    ) -> RuntimeResult<Rc<ModuleRecord<E>>> {
        let record = ModuleRecord::new(name, module);
        let meta = ImportMeta {
            url: record.url.clone(),
            main: self.is_main_module(name),
            require: self.require_function(engine, name)?,
            resolve: self.resolve_function(engine, name)?,
        };
        engine.set_import_meta(&record.module, meta)?;
        Ok(Rc::new(record))
    }

    /// Cache a module compiled or deserialized outside the loader under
    /// `name`.
    ///
    /// A name is registered once: when it is already cached, the cached
    /// record is returned and `module` is dropped.
    pub fn register(
        &self,
        engine: &mut E,
        name: &str,
        module: E::Module,
    ) -> RuntimeResult<Rc<ModuleRecord<E>>> {
        if let Some(record) = self.get(name) {
            trace!(module = name, "module already registered");
            return Ok(record);
        }
        let record = self.attach(engine, name, module)?;
        self.cache
            .borrow_mut()
            .insert(name.to_string(), Rc::clone(&record));
        self.set_status(name, ModuleStatus::Registered);
        debug!(module = name, "module registered");
        Ok(record)
    }

    /// Load every request of `record`, recursively, and bind them.
    ///
    /// Cycles terminate because a record is marked linked before its
    /// requests are visited.
    pub fn link(&self, engine: &mut E, record: &Rc<ModuleRecord<E>>) -> RuntimeResult<()> {
        if record.linked.replace(true) {
            return Ok(());
        }
        let result = self.link_requests(engine, record);
        if result.is_err() {
            record.linked.set(false);
        }
        result
    }

    fn link_requests(&self, engine: &mut E, record: &Rc<ModuleRecord<E>>) -> RuntimeResult<()> {
        for request in engine.module_requests(&record.module) {
            let name = self.resolve(engine, &request, &record.name)?;
            let target = self.load(engine, &name)?;
            self.link(engine, &target)?;
            engine.link_module(&record.module, &request, &target.module)?;
            trace!(module = %record.name, request = %request, target = %name, "request linked");
        }
        Ok(())
    }

    /// Resolve, load and link
    pub fn import(
        &self,
        engine: &mut E,
        specifier: &str,
        referrer: &str,
    ) -> RuntimeResult<Rc<ModuleRecord<E>>> {
        let name = self.resolve(engine, specifier, referrer)?;
        let record = self.load(engine, &name)?;
        self.link(engine, &record)?;
        Ok(record)
    }

    /// Evaluate a linked module, returning its evaluation promise.
    ///
    /// Later calls return the same promise.
    pub fn evaluate(&self, engine: &mut E, record: &ModuleRecord<E>) -> RuntimeResult<E::Value> {
        if let Some(promise) = record.evaluation() {
            return Ok(promise);
        }
        let promise = engine.run(Unit::Module(record.module.clone()))?;
        *record.evaluation.borrow_mut() = Some(promise.clone());
        Ok(promise)
    }

    /// Synchronously import and evaluate `specifier`, returning its
    /// namespace.
    ///
    /// Pending jobs are drained until the evaluation settles. A namespace with
    /// a `module.exports` property yields that property instead.
    ///
    /// This drain may run inside a job. It never enters a poll step, and the
    /// runtime is only touched by its own thread.
    pub fn require(&self, engine: &mut E, specifier: &str, referrer: &str) -> RuntimeResult<E::Value> {
        let record = self.import(engine, specifier, referrer)?;
        let promise = self.evaluate(engine, &record)?;

        loop {
            match engine.promise_state(&promise) {
                PromiseState::Pending => match engine.execute_pending_job() {
                    JobOutcome::Ran => {}
                    JobOutcome::Failed => match self.state.upgrade() {
                        Some(state) => state.report_exception(engine),
                        None => {
                            engine.take_exception();
                        }
                    },
                    JobOutcome::Idle => {
                        return Err(RuntimeError::load(
                            record.name(),
                            "module evaluation did not settle",
                        ));
                    }
                },
                PromiseState::Rejected(reason) => {
                    return Err(RuntimeError::Thrown(engine.throw_value(reason)));
                }
                PromiseState::Fulfilled(_) | PromiseState::NotAPromise => break,
            }
        }

        let namespace = engine.module_namespace(&record.module)?;
        if engine.has_property(&namespace, MODULE_EXPORTS) {
            Ok(engine.get_property(&namespace, MODULE_EXPORTS)?)
        } else {
            Ok(namespace)
        }
    }

    fn require_function(&self, engine: &mut E, referrer: &str) -> RuntimeResult<E::Value> {
        let state = self.state.clone();
        let referrer = referrer.to_string();
        let require: NativeFunction<E> =
            Rc::new(move |engine: &mut E, args: &[E::Value]| -> EngineResult<E::Value> {
                let state = upgrade(&state, engine)?;
                let specifier = string_arg(engine, args, "require")?;
                state
                    .loader
                    .require(engine, &specifier, &referrer)
                    .map_err(|e| e.throw_into(engine))
            });
        Ok(engine.new_function("require", 1, require)?)
    }

    fn resolve_function(&self, engine: &mut E, referrer: &str) -> RuntimeResult<E::Value> {
        let state = self.state.clone();
        let referrer = referrer.to_string();
        let resolve: NativeFunction<E> =
            Rc::new(move |engine: &mut E, args: &[E::Value]| -> EngineResult<E::Value> {
                let state = upgrade(&state, engine)?;
                let specifier = string_arg(engine, args, "resolve")?;
                let name = state
                    .loader
                    .resolve(engine, &specifier, &referrer)
                    .map_err(|e| e.throw_into(engine))?;
                engine.new_string(&name)
            });
        Ok(engine.new_function("resolve", 1, resolve)?)
    }

    /// Engine values held by the loader: delegate hooks and evaluation
    /// promises
    pub fn held_values(&self) -> Vec<E::Value> {
        let mut values = self
            .delegate()
            .map(|d| d.held_values())
            .unwrap_or_default();
        values.extend(self.cache.borrow().values().filter_map(|r| r.evaluation()));
        values
    }

    /// Drop every cached module and the delegate.
    ///
    /// Native libraries stay loaded until the runtime has dropped its engine.
    pub fn clear(&self) {
        self.cache.borrow_mut().clear();
        self.status.borrow_mut().clear();
        self.delegate.borrow_mut().take();
    }

    /// Hand over the loaded native libraries
    pub(crate) fn take_libraries(&self) -> NativeLibraries {
        NativeLibraries::new(std::mem::take(&mut *self.libraries.borrow_mut()))
    }
}

impl<E: Engine> fmt::Debug for ModuleLoader<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("cached", &self.len())
            .field("main_module", &self.main_module.borrow())
            .field("delegate", &self.delegate.borrow().is_some())
            .finish()
    }
}

pub(crate) fn upgrade<E: Engine>(
    state: &Weak<RuntimeState<E>>,
    engine: &mut E,
) -> EngineResult<Rc<RuntimeState<E>>> {
    state
        .upgrade()
        .ok_or_else(|| engine.throw_error(ErrorKind::InternalError, "runtime has been torn down"))
}

fn string_arg<E: Engine>(engine: &mut E, args: &[E::Value], func: &str) -> EngineResult<String> {
    let value = match args.first() {
        Some(value) => engine.as_string(value),
        None => None,
    };
    value.ok_or_else(|| {
        engine.throw_error(
            ErrorKind::TypeError,
            &format!("{func}: expected a string argument"),
        )
    })
}
