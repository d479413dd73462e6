//! A small line-oriented script engine used to drive the runtime in tests.
//!
//! Each source line is one statement:
//!
//! ```text
//! log TEXT              append TEXT to the engine log
//! export NAME = EXPR    set a namespace property (modules)
//! import "NAME"         static import (modules)
//! return EXPR           completion value (scripts)
//! throw MSG             raise Error(MSG)
//! await                 suspend; the rest runs in a later job (modules)
//! later TEXT            queue a job that logs TEXT
//! fail_job MSG          queue a job that throws
//! unhandled MSG         reject a promise nobody handles
//! handled_later MSG     reject a promise, attach a handler in a later job
//! interrupt             raise SIGINT and poll the interrupt handler
//! ```
//!
//! Expressions are JSON literals, `meta.url`, `meta.main`, `require("x")` and
//! `resolve("x")`. A line starting with `@@` is a syntax error.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use kelp_runtime::kelp_unit::{FunctionUnit, ModuleUnit, UnitValue};
use kelp_runtime::{
    Engine, EngineResult, ErrorKind, ErrorReporter, ExceptionReport, ImportMeta, InterruptHandler,
    JobOutcome, ModuleDelegate, NativeFunction, NativeInit, PromiseState, RejectionTracker,
    ReportKind, RuntimeError, RuntimeResult, SharedBuffer, Thrown, Unit, UnitKind,
};
use parking_lot::Mutex;

/// Log shared between an engine and the test, possibly across threads
pub type Log = Arc<Mutex<Vec<String>>>;

#[derive(Clone)]
pub enum MockValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Array(Rc<RefCell<Vec<MockValue>>>),
    Object(Rc<RefCell<Vec<(String, MockValue)>>>),
    Function(Rc<MockFunction>),
    Promise(Rc<RefCell<PromiseState<MockValue>>>),
    Shared(SharedBuffer),
    Error(Rc<(ErrorKind, String)>),
}

pub enum MockFunction {
    Native {
        name: String,
        func: NativeFunction<MockEngine>,
    },
    Script {
        filename: String,
        source: String,
        stmts: Vec<Stmt>,
    },
}

impl MockValue {
    pub fn str(s: &str) -> Self {
        MockValue::Str(s.to_string())
    }

    pub fn object<K: Into<String>>(props: impl IntoIterator<Item = (K, MockValue)>) -> Self {
        MockValue::Object(Rc::new(RefCell::new(
            props.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        )))
    }

    pub fn array(items: impl IntoIterator<Item = MockValue>) -> Self {
        MockValue::Array(Rc::new(RefCell::new(items.into_iter().collect())))
    }

    pub fn get(&self, key: &str) -> Option<MockValue> {
        match self {
            MockValue::Object(props) => props
                .borrow()
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone()),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            MockValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Strong references to a function value
    pub fn strong_count(&self) -> usize {
        match self {
            MockValue::Function(f) => Rc::strong_count(f),
            _ => 0,
        }
    }

    fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => MockValue::Null,
            serde_json::Value::Bool(b) => MockValue::Bool(b),
            serde_json::Value::Number(n) => MockValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => MockValue::Str(s),
            serde_json::Value::Array(items) => {
                MockValue::array(items.into_iter().map(MockValue::from_json))
            }
            serde_json::Value::Object(props) => MockValue::object(
                props
                    .into_iter()
                    .map(|(k, v)| (k, MockValue::from_json(v))),
            ),
        }
    }
}

impl PartialEq for MockValue {
    fn eq(&self, other: &Self) -> bool {
        use MockValue::*;
        match (self, other) {
            (Undefined, Undefined) | (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Number(a), Number(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (Array(a), Array(b)) => Rc::ptr_eq(a, b),
            (Object(a), Object(b)) => Rc::ptr_eq(a, b),
            (Function(a), Function(b)) => Rc::ptr_eq(a, b),
            (Promise(a), Promise(b)) => Rc::ptr_eq(a, b),
            (Shared(a), Shared(b)) => SharedBuffer::ptr_eq(a, b),
            (Error(a), Error(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for MockValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MockValue::Undefined => f.write_str("undefined"),
            MockValue::Null => f.write_str("null"),
            MockValue::Bool(b) => write!(f, "{b}"),
            MockValue::Number(n) => write!(f, "{n}"),
            MockValue::Str(s) => write!(f, "{s:?}"),
            MockValue::Array(items) => f.debug_list().entries(items.borrow().iter()).finish(),
            MockValue::Object(props) => f
                .debug_map()
                .entries(props.borrow().iter().map(|(k, v)| (k, v)))
                .finish(),
            MockValue::Function(func) => match &**func {
                MockFunction::Native { name, .. } => write!(f, "[native {name}]"),
                MockFunction::Script { filename, .. } => write!(f, "[script {filename}]"),
            },
            MockValue::Promise(state) => write!(f, "Promise({:?})", state.borrow()),
            MockValue::Shared(buf) => write!(f, "{buf:?}"),
            MockValue::Error(e) => write!(f, "{}: {}", e.0, e.1),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(serde_json::Value),
    MetaUrl,
    MetaMain,
    Require(String),
    Resolve(String),
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Log(String),
    Export(String, Expr),
    Import(String),
    Return(Expr),
    Throw(String),
    Await,
    Later(String),
    FailJob(String),
    Unhandled(String),
    HandledLater(String),
    Interrupt,
}

fn quoted(s: &str) -> Option<String> {
    serde_json::from_str::<String>(s.trim()).ok()
}

fn parse_expr(s: &str) -> Option<Expr> {
    let s = s.trim();
    match s {
        "meta.url" => return Some(Expr::MetaUrl),
        "meta.main" => return Some(Expr::MetaMain),
        _ => {}
    }
    if let Some(arg) = s.strip_prefix("require(").and_then(|r| r.strip_suffix(')')) {
        return quoted(arg).map(Expr::Require);
    }
    if let Some(arg) = s.strip_prefix("resolve(").and_then(|r| r.strip_suffix(')')) {
        return quoted(arg).map(Expr::Resolve);
    }
    serde_json::from_str(s).ok().map(Expr::Literal)
}

fn parse_stmt(line: &str) -> Option<Stmt> {
    let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    let stmt = match word {
        "log" => Stmt::Log(rest.to_string()),
        "export" => {
            let (name, expr) = rest.split_once('=')?;
            Stmt::Export(name.trim().to_string(), parse_expr(expr)?)
        }
        "import" => Stmt::Import(quoted(rest)?),
        "return" => Stmt::Return(parse_expr(rest)?),
        "throw" => Stmt::Throw(rest.to_string()),
        "await" => Stmt::Await,
        "later" => Stmt::Later(rest.to_string()),
        "fail_job" => Stmt::FailJob(rest.to_string()),
        "unhandled" => Stmt::Unhandled(rest.to_string()),
        "handled_later" => Stmt::HandledLater(rest.to_string()),
        "interrupt" => Stmt::Interrupt,
        _ => return None,
    };
    Some(stmt)
}

fn parse(source: &str) -> Result<Vec<Stmt>, String> {
    let mut stmts = Vec::new();
    for line in source.lines().map(str::trim) {
        if line.is_empty() || line.starts_with("//") || line.starts_with("#!") {
            continue;
        }
        match parse_stmt(line) {
            Some(stmt) if !line.starts_with("@@") => stmts.push(stmt),
            _ => return Err(format!("unexpected '{line}'")),
        }
    }
    Ok(stmts)
}

struct ModuleData {
    name: String,
    source: String,
    stmts: Vec<Stmt>,
    requests: Vec<String>,
    has_await: bool,
    links: RefCell<HashMap<String, MockModule>>,
    meta: RefCell<Option<ImportMeta<MockEngine>>>,
    namespace: MockValue,
    evaluation: RefCell<Option<MockValue>>,
}

#[derive(Clone)]
pub struct MockModule(Rc<ModuleData>);

impl MockModule {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn namespace(&self) -> MockValue {
        self.0.namespace.clone()
    }

    pub fn meta_main(&self) -> Option<bool> {
        self.0.meta.borrow().as_ref().map(|m| m.main)
    }

    pub fn is_evaluated(&self) -> bool {
        self.0.evaluation.borrow().is_some()
    }
}

impl fmt::Debug for MockModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MockModule({})", self.0.name)
    }
}

type Job = Box<dyn FnOnce(&mut MockEngine) -> EngineResult<()>>;

pub struct MockEngine {
    pub log: Log,
    jobs: VecDeque<Job>,
    exception: Option<MockValue>,
    compiles: HashMap<String, usize>,
    interrupt: Option<InterruptHandler>,
    tracker: Option<RejectionTracker<MockEngine>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::with_log(Log::default())
    }

    pub fn with_log(log: Log) -> Self {
        Self {
            log,
            jobs: VecDeque::new(),
            exception: None,
            compiles: HashMap::new(),
            interrupt: None,
            tracker: None,
        }
    }

    pub fn logged(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn compile_count(&self, filename: &str) -> usize {
        self.compiles.get(filename).copied().unwrap_or(0)
    }

    pub fn has_interrupt_handler(&self) -> bool {
        self.interrupt.is_some()
    }

    pub fn has_rejection_tracker(&self) -> bool {
        self.tracker.is_some()
    }

    /// Host callback from a closure
    pub fn callback(
        &mut self,
        name: &str,
        func: impl Fn(&mut MockEngine, &[MockValue]) -> EngineResult<MockValue> + 'static,
    ) -> MockValue {
        MockValue::Function(Rc::new(MockFunction::Native {
            name: name.to_string(),
            func: Rc::new(func),
        }))
    }

    /// Callback that appends `text` to the log
    pub fn logger(&mut self, text: &str) -> MockValue {
        let text = text.to_string();
        self.callback("logger", move |engine, args| {
            let line = match args.first() {
                Some(arg) => format!("{text} {arg:?}"),
                None => text.clone(),
            };
            engine.log.lock().push(line);
            Ok(MockValue::Undefined)
        })
    }

    /// Callback that throws `message`
    pub fn thrower(&mut self, message: &str) -> MockValue {
        let message = message.to_string();
        self.callback("thrower", move |engine, _| {
            Err(engine.throw_error(ErrorKind::Error, &message))
        })
    }

    /// Message of the pending exception, taken from the engine
    pub fn exception_message(&mut self) -> String {
        let exception = self.take_exception();
        self.describe_exception(&exception).message
    }

    fn compile_error(&mut self, message: &str) -> Thrown {
        self.throw_error(ErrorKind::SyntaxError, message)
    }

    fn new_promise(state: PromiseState<MockValue>) -> MockValue {
        MockValue::Promise(Rc::new(RefCell::new(state)))
    }

    fn settle(promise: &MockValue, state: PromiseState<MockValue>) {
        if let MockValue::Promise(slot) = promise {
            *slot.borrow_mut() = state;
        }
    }

    fn meta_value(
        &mut self,
        module: Option<&MockModule>,
        pick: impl FnOnce(&ImportMeta<MockEngine>) -> MockValue,
    ) -> EngineResult<MockValue> {
        let value = module.and_then(|m| m.0.meta.borrow().as_ref().map(pick));
        value.ok_or_else(|| self.throw_error(ErrorKind::ReferenceError, "import.meta unavailable"))
    }

    fn eval_expr(&mut self, expr: &Expr, module: Option<&MockModule>) -> EngineResult<MockValue> {
        match expr {
            Expr::Literal(json) => Ok(MockValue::from_json(json.clone())),
            Expr::MetaUrl => self.meta_value(module, |m| MockValue::Str(m.url.clone())),
            Expr::MetaMain => self.meta_value(module, |m| MockValue::Bool(m.main)),
            Expr::Require(spec) => {
                let require = self.meta_value(module, |m| m.require.clone())?;
                self.call(&require, &[MockValue::str(spec)])
            }
            Expr::Resolve(spec) => {
                let resolve = self.meta_value(module, |m| m.resolve.clone())?;
                self.call(&resolve, &[MockValue::str(spec)])
            }
        }
    }

    /// Run statements until the end or an `await`; returns the completion
    /// value and the index after the `await`
    fn exec(
        &mut self,
        stmts: &[Stmt],
        module: Option<&MockModule>,
    ) -> EngineResult<(MockValue, Option<usize>)> {
        for (index, stmt) in stmts.iter().enumerate() {
            match stmt {
                Stmt::Log(text) => self.log.lock().push(text.clone()),
                Stmt::Export(name, expr) => {
                    let value = self.eval_expr(expr, module)?;
                    if let Some(MockValue::Object(props)) = module.map(|m| &m.0.namespace) {
                        let mut props = props.borrow_mut();
                        props.retain(|(k, _)| k != name);
                        props.push((name.clone(), value));
                    }
                }
                Stmt::Import(_) => {}
                Stmt::Return(expr) => return Ok((self.eval_expr(expr, module)?, None)),
                Stmt::Throw(message) => return Err(self.throw_error(ErrorKind::Error, message)),
                Stmt::Await => {
                    if module.is_some() {
                        return Ok((MockValue::Undefined, Some(index + 1)));
                    }
                }
                Stmt::Later(text) => {
                    let text = text.clone();
                    self.jobs.push_back(Box::new(move |engine| {
                        engine.log.lock().push(text);
                        Ok(())
                    }));
                }
                Stmt::FailJob(message) => {
                    let message = message.clone();
                    self.jobs.push_back(Box::new(move |engine| {
                        Err(engine.throw_error(ErrorKind::Error, &message))
                    }));
                }
                Stmt::Unhandled(message) => {
                    self.reject_untracked(message);
                }
                Stmt::HandledLater(message) => {
                    let (promise, reason) = self.reject_untracked(message);
                    self.jobs.push_back(Box::new(move |engine| {
                        if let Some(tracker) = engine.tracker.as_mut() {
                            tracker(&promise, &reason, true);
                        }
                        Ok(())
                    }));
                }
                Stmt::Interrupt => {
                    // SAFETY: raising a signal has no memory effects here.
                    unsafe {
                        libc::raise(libc::SIGINT);
                    }
                    let interrupted = self.interrupt.as_mut().is_some_and(|handler| handler());
                    if interrupted {
                        return Err(self.throw_error(ErrorKind::InternalError, "interrupted"));
                    }
                }
            }
        }
        Ok((MockValue::Undefined, None))
    }

    fn reject_untracked(&mut self, message: &str) -> (MockValue, MockValue) {
        let reason = MockValue::Error(Rc::new((ErrorKind::Error, message.to_string())));
        let promise = Self::new_promise(PromiseState::Rejected(reason.clone()));
        if let Some(tracker) = self.tracker.as_mut() {
            tracker(&promise, &reason, false);
        }
        (promise, reason)
    }

    fn evaluate_module(&mut self, module: &MockModule) -> EngineResult<MockValue> {
        if let Some(promise) = module.0.evaluation.borrow().clone() {
            return Ok(promise);
        }
        let promise = Self::new_promise(PromiseState::Pending);
        *module.0.evaluation.borrow_mut() = Some(promise.clone());

        for request in &module.0.requests {
            let target = module.0.links.borrow().get(request).cloned();
            let Some(target) = target else {
                return Err(self.throw_error(
                    ErrorKind::ReferenceError,
                    &format!("unlinked request '{request}'"),
                ));
            };
            let dependency = self.evaluate_module(&target)?;
            if let PromiseState::Rejected(reason) = self.promise_state(&dependency) {
                Self::settle(&promise, PromiseState::Rejected(reason));
                return Ok(promise);
            }
        }

        self.run_module_body(module, 0, &promise);
        Ok(promise)
    }

    fn run_module_body(&mut self, module: &MockModule, start: usize, promise: &MockValue) {
        match self.exec(&module.0.stmts[start..], Some(module)) {
            Ok((_, Some(resume))) => {
                let module = module.clone();
                let promise = promise.clone();
                let next = start + resume;
                self.jobs.push_back(Box::new(move |engine| {
                    engine.run_module_body(&module, next, &promise);
                    Ok(())
                }));
            }
            Ok((_, None)) => Self::settle(promise, PromiseState::Fulfilled(MockValue::Undefined)),
            Err(Thrown) => {
                let reason = self.take_exception();
                Self::settle(promise, PromiseState::Rejected(reason));
            }
        }
    }

    fn value_to_unit(
        &mut self,
        value: &MockValue,
        shared: &mut Vec<SharedBuffer>,
    ) -> EngineResult<UnitValue> {
        Ok(match value {
            MockValue::Undefined => UnitValue::Undefined,
            MockValue::Null => UnitValue::Null,
            MockValue::Bool(b) => UnitValue::Bool(*b),
            MockValue::Number(n) => UnitValue::Float64(*n),
            MockValue::Str(s) => UnitValue::String(s.clone()),
            MockValue::Array(items) => {
                let items = items.borrow().clone();
                let mut out = Vec::with_capacity(items.len());
                for item in &items {
                    out.push(self.value_to_unit(item, shared)?);
                }
                UnitValue::Array(out)
            }
            MockValue::Object(props) => {
                let props = props.borrow().clone();
                let mut out = Vec::with_capacity(props.len());
                for (key, item) in &props {
                    out.push((key.clone(), self.value_to_unit(item, shared)?));
                }
                UnitValue::Object(out)
            }
            MockValue::Shared(buf) => {
                shared.push(buf.clone());
                UnitValue::SharedBuffer((shared.len() - 1) as u32)
            }
            other => {
                return Err(self.throw_error(
                    ErrorKind::TypeError,
                    &format!("cannot serialize {other:?}"),
                ));
            }
        })
    }

    fn unit_to_value(&mut self, value: UnitValue, shared: &[SharedBuffer]) -> EngineResult<MockValue> {
        Ok(match value {
            UnitValue::Undefined => MockValue::Undefined,
            UnitValue::Null => MockValue::Null,
            UnitValue::Bool(b) => MockValue::Bool(b),
            UnitValue::Int32(n) => MockValue::Number(f64::from(n)),
            UnitValue::Float64(n) => MockValue::Number(n),
            UnitValue::String(s) => MockValue::Str(s),
            UnitValue::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.unit_to_value(item, shared)?);
                }
                MockValue::array(out)
            }
            UnitValue::Object(props) => {
                let mut out = Vec::with_capacity(props.len());
                for (key, item) in props {
                    out.push((key, self.unit_to_value(item, shared)?));
                }
                MockValue::object(out)
            }
            UnitValue::SharedBuffer(index) => match shared.get(index as usize) {
                Some(buf) => MockValue::Shared(buf.clone()),
                None => {
                    return Err(self.throw_error(ErrorKind::RangeError, "bad shared buffer index"));
                }
            },
            other => {
                return Err(self.throw_error(
                    ErrorKind::TypeError,
                    &format!("unexpected unit {other:?}"),
                ));
            }
        })
    }
}

impl Drop for MockEngine {
    fn drop(&mut self) {
        tracing::debug!("mock engine dropped");
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for MockEngine {
    type Value = MockValue;
    type Module = MockModule;

    fn compile(&mut self, source: &str, filename: &str, kind: UnitKind) -> EngineResult<Unit<Self>> {
        *self.compiles.entry(filename.to_string()).or_default() += 1;
        let stmts = match parse(source) {
            Ok(stmts) => stmts,
            Err(message) => return Err(self.compile_error(&message)),
        };
        match kind {
            UnitKind::Script => Ok(Unit::Script(MockValue::Function(Rc::new(
                MockFunction::Script {
                    filename: filename.to_string(),
                    source: source.to_string(),
                    stmts,
                },
            )))),
            UnitKind::Module => {
                let requests = stmts
                    .iter()
                    .filter_map(|s| match s {
                        Stmt::Import(spec) => Some(spec.clone()),
                        _ => None,
                    })
                    .collect();
                let has_await = stmts.iter().any(|s| matches!(s, Stmt::Await));
                Ok(Unit::Module(MockModule(Rc::new(ModuleData {
                    name: filename.to_string(),
                    source: source.to_string(),
                    stmts,
                    requests,
                    has_await,
                    links: RefCell::new(HashMap::new()),
                    meta: RefCell::new(None),
                    namespace: MockValue::object(Vec::<(String, MockValue)>::new()),
                    evaluation: RefCell::new(None),
                }))))
            }
        }
    }

    fn run(&mut self, unit: Unit<Self>) -> EngineResult<MockValue> {
        match unit {
            Unit::Value(value) => Ok(value),
            Unit::Script(func) => self.call(&func, &[]),
            Unit::Module(module) => self.evaluate_module(&module),
        }
    }

    fn module_name(&self, module: &MockModule) -> String {
        module.0.name.clone()
    }

    fn module_requests(&self, module: &MockModule) -> Vec<String> {
        module.0.requests.clone()
    }

    fn link_module(
        &mut self,
        module: &MockModule,
        request: &str,
        target: &MockModule,
    ) -> EngineResult<()> {
        module
            .0
            .links
            .borrow_mut()
            .insert(request.to_string(), target.clone());
        Ok(())
    }

    fn module_namespace(&mut self, module: &MockModule) -> EngineResult<MockValue> {
        Ok(module.0.namespace.clone())
    }

    fn set_import_meta(&mut self, module: &MockModule, meta: ImportMeta<Self>) -> EngineResult<()> {
        *module.0.meta.borrow_mut() = Some(meta);
        Ok(())
    }

    fn instantiate_native(&mut self, _init: NativeInit, name: &str) -> EngineResult<MockModule> {
        Err(self.throw_error(
            ErrorKind::ReferenceError,
            &format!("native module '{name}' not supported"),
        ))
    }

    fn call(&mut self, func: &MockValue, args: &[MockValue]) -> EngineResult<MockValue> {
        match func {
            MockValue::Function(f) => match &**f {
                MockFunction::Native { func, .. } => {
                    let func = Rc::clone(func);
                    func(self, args)
                }
                MockFunction::Script { stmts, .. } => {
                    let stmts = stmts.clone();
                    self.exec(&stmts, None).map(|(value, _)| value)
                }
            },
            other => Err(self.throw_error(
                ErrorKind::TypeError,
                &format!("{other:?} is not a function"),
            )),
        }
    }

    fn new_function(
        &mut self,
        name: &str,
        _arity: u32,
        func: NativeFunction<Self>,
    ) -> EngineResult<MockValue> {
        Ok(MockValue::Function(Rc::new(MockFunction::Native {
            name: name.to_string(),
            func,
        })))
    }

    fn new_string(&mut self, s: &str) -> EngineResult<MockValue> {
        Ok(MockValue::str(s))
    }

    fn new_number(&mut self, n: f64) -> MockValue {
        MockValue::Number(n)
    }

    fn undefined(&self) -> MockValue {
        MockValue::Undefined
    }

    fn as_string(&mut self, value: &MockValue) -> Option<String> {
        match value {
            MockValue::Str(s) => Some(s.clone()),
            _ => None,
        }
    }

    fn is_function(&self, value: &MockValue) -> bool {
        matches!(value, MockValue::Function(_))
    }

    fn has_property(&mut self, object: &MockValue, key: &str) -> bool {
        object.get(key).is_some()
    }

    fn get_property(&mut self, object: &MockValue, key: &str) -> EngineResult<MockValue> {
        Ok(object.get(key).unwrap_or(MockValue::Undefined))
    }

    fn promise_state(&mut self, value: &MockValue) -> PromiseState<MockValue> {
        match value {
            MockValue::Promise(state) => state.borrow().clone(),
            _ => PromiseState::NotAPromise,
        }
    }

    fn execute_pending_job(&mut self) -> JobOutcome {
        match self.jobs.pop_front() {
            None => JobOutcome::Idle,
            Some(job) => match job(self) {
                Ok(()) => JobOutcome::Ran,
                Err(Thrown) => JobOutcome::Failed,
            },
        }
    }

    fn take_exception(&mut self) -> MockValue {
        self.exception.take().unwrap_or(MockValue::Undefined)
    }

    fn throw_value(&mut self, value: MockValue) -> Thrown {
        self.exception = Some(value);
        Thrown
    }

    fn throw_error(&mut self, kind: ErrorKind, message: &str) -> Thrown {
        self.throw_value(MockValue::Error(Rc::new((kind, message.to_string()))))
    }

    fn describe_exception(&mut self, exception: &MockValue) -> ExceptionReport {
        let message = match exception {
            MockValue::Error(e) => format!("{}: {}", e.0, e.1),
            MockValue::Str(s) => s.clone(),
            other => format!("{other:?}"),
        };
        ExceptionReport {
            message,
            stack: None,
        }
    }

    fn write_unit(
        &mut self,
        unit: &Unit<Self>,
        shared: &mut Vec<SharedBuffer>,
    ) -> EngineResult<UnitValue> {
        match unit {
            Unit::Value(value) => self.value_to_unit(value, shared),
            Unit::Script(MockValue::Function(f)) => match &**f {
                MockFunction::Script {
                    filename, source, ..
                } => Ok(UnitValue::Function(FunctionUnit {
                    name: String::new(),
                    filename: filename.clone(),
                    arg_count: 0,
                    bytecode: source.as_bytes().to_vec(),
                    constants: Vec::new(),
                })),
                MockFunction::Native { .. } => {
                    Err(self.throw_error(ErrorKind::TypeError, "cannot serialize native function"))
                }
            },
            Unit::Script(_) => Err(self.throw_error(ErrorKind::TypeError, "not a script")),
            Unit::Module(module) => Ok(UnitValue::Module(ModuleUnit {
                name: module.0.name.clone(),
                requests: module.0.requests.clone(),
                exports: Vec::new(),
                has_top_level_await: module.0.has_await,
                body: FunctionUnit {
                    name: String::new(),
                    filename: module.0.name.clone(),
                    arg_count: 0,
                    bytecode: module.0.source.as_bytes().to_vec(),
                    constants: Vec::new(),
                },
            })),
        }
    }

    fn read_unit(&mut self, value: UnitValue, shared: &[SharedBuffer]) -> EngineResult<Unit<Self>> {
        match value {
            UnitValue::Function(func) => {
                let source = String::from_utf8_lossy(&func.bytecode).into_owned();
                self.compile(&source, &func.filename, UnitKind::Script)
            }
            UnitValue::Module(module) => {
                let source = String::from_utf8_lossy(&module.body.bytecode).into_owned();
                self.compile(&source, &module.name, UnitKind::Module)
            }
            other => self.unit_to_value(other, shared).map(Unit::Value),
        }
    }

    fn set_interrupt_handler(&mut self, handler: Option<InterruptHandler>) {
        self.interrupt = handler;
    }

    fn set_rejection_tracker(&mut self, tracker: Option<RejectionTracker<Self>>) {
        self.tracker = tracker;
    }
}

/// Reporter that records every diagnostic
#[derive(Clone, Default)]
pub struct Recorder(pub Rc<RefCell<Vec<(ReportKind, String)>>>);

impl Recorder {
    pub fn reports(&self) -> Vec<(ReportKind, String)> {
        self.0.borrow().clone()
    }

    pub fn count(&self, kind: ReportKind) -> usize {
        self.0.borrow().iter().filter(|(k, _)| *k == kind).count()
    }
}

impl ErrorReporter for Recorder {
    fn report(&self, kind: ReportKind, report: &ExceptionReport) {
        self.0.borrow_mut().push((kind, report.message.clone()));
    }
}

/// In-memory sources. Bare specifiers resolve under `/mem/`.
#[derive(Clone, Default)]
pub struct MemoryDelegate {
    pub sources: Rc<RefCell<HashMap<String, String>>>,
    pub resolves: Rc<Cell<usize>>,
}

impl MemoryDelegate {
    pub fn new<'a>(sources: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let delegate = Self::default();
        for (name, source) in sources {
            delegate.insert(name, source);
        }
        delegate
    }

    /// Add a source; `name` is given without the `/mem/` prefix
    pub fn insert(&self, name: &str, source: &str) {
        self.sources
            .borrow_mut()
            .insert(format!("/mem/{name}"), source.to_string());
    }
}

impl ModuleDelegate<MockEngine> for MemoryDelegate {
    fn resolve(
        &self,
        _engine: &mut MockEngine,
        specifier: &str,
        _referrer: &str,
    ) -> Option<RuntimeResult<String>> {
        self.resolves.set(self.resolves.get() + 1);
        if specifier.starts_with('/') {
            Some(Ok(specifier.to_string()))
        } else {
            Some(Ok(format!("/mem/{specifier}")))
        }
    }

    fn read(&self, _engine: &mut MockEngine, name: &str) -> Option<RuntimeResult<String>> {
        Some(
            self.sources
                .borrow()
                .get(name)
                .cloned()
                .ok_or_else(|| RuntimeError::load(name, "no such module")),
        )
    }
}

/// Initialize tracing output for a test, honoring `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Collects formatted tracing output
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Run `f` with debug-level events of this thread captured, one line each
pub fn capture_debug(f: impl FnOnce()) -> Vec<String> {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .without_time()
        .with_writer(move || writer.clone())
        .finish();
    tracing::subscriber::with_default(subscriber, f);

    let bytes = captured.0.lock().clone();
    String::from_utf8_lossy(&bytes)
        .lines()
        .map(str::to_string)
        .collect()
}
