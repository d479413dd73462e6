//! Evaluating sources and running a main program.

use std::path::Path;

use tracing::{debug, error};

use crate::config::{EvalKind, RunOptions};
use crate::engine::{Engine, PromiseState, Unit, UnitKind};
use crate::error::{RuntimeError, RuntimeResult};
use crate::module_loader::detect_module;
use crate::poll::StdPoll;
use crate::runtime::Runtime;

/// Name used for `-e` expressions
pub const EVAL_FILENAME: &str = "<cmdline>";

impl<E: Engine> Runtime<E> {
    /// Compile and run source text under the SIGINT interrupt guard.
    ///
    /// Modules are registered under `filename`, linked and evaluated; the
    /// result is their evaluation promise, which is tracked until it settles.
    /// A module already cached under `filename` is reused without compiling
    /// `source`.
    /// Scripts return their completion value. With `as_main` the module is
    /// recorded as the main module first.
    pub fn eval_source(
        &mut self,
        source: &str,
        filename: &str,
        kind: EvalKind,
        as_main: bool,
    ) -> RuntimeResult<E::Value> {
        let _interrupt = self.state.interrupt.enter();
        let is_module = match kind {
            EvalKind::Module => true,
            EvalKind::Script => false,
            EvalKind::Auto => filename.ends_with(".mjs") || detect_module(source),
        };
        debug!(filename, is_module, "evaluating source");

        if !is_module {
            let unit = self.engine.compile(source, filename, UnitKind::Script)?;
            return Ok(self.engine.run(unit)?);
        }

        if as_main {
            self.state.loader.set_main_module(filename);
        }
        let loader = &self.state.loader;
        let record = match loader.get(filename) {
            Some(record) => record,
            None => match self.engine.compile(source, filename, UnitKind::Module)? {
                Unit::Module(module) => loader.register(&mut self.engine, filename, module)?,
                _ => {
                    return Err(RuntimeError::Type(format!(
                        "'{filename}' did not compile to a module"
                    )));
                }
            },
        };
        loader.link(&mut self.engine, &record)?;
        let promise = loader.evaluate(&mut self.engine, &record)?;
        self.settle_evaluation(promise)
    }

    /// Read a file and evaluate it with [`Runtime::eval_source`].
    ///
    /// A file that cannot be read is a fatal load error.
    pub fn eval_file(
        &mut self,
        path: impl AsRef<Path>,
        kind: EvalKind,
        as_main: bool,
    ) -> RuntimeResult<E::Value> {
        let path = path.as_ref();
        let name = path.to_string_lossy().into_owned();
        let source = std::fs::read_to_string(path).map_err(|e| RuntimeError::Load {
            name: name.clone(),
            reason: e.to_string(),
            fatal: true,
        })?;
        self.eval_source(&source, &name, kind, as_main)
    }

    /// Import and evaluate a module through the loader, resolving
    /// `specifier` from the main module
    pub fn import_module(&mut self, specifier: &str) -> RuntimeResult<E::Value> {
        let _interrupt = self.state.interrupt.enter();
        let referrer = self.state.loader.main_module().unwrap_or_default();
        let loader = &self.state.loader;
        let record = loader.import(&mut self.engine, specifier, &referrer)?;
        let promise = loader.evaluate(&mut self.engine, &record)?;
        self.settle_evaluation(promise)
    }

    /// Raise an evaluation promise that already rejected; track one that is
    /// still pending
    pub(crate) fn settle_evaluation(&mut self, promise: E::Value) -> RuntimeResult<E::Value> {
        match self.engine.promise_state(&promise) {
            PromiseState::Rejected(reason) => {
                Err(RuntimeError::Thrown(self.engine.throw_value(reason)))
            }
            PromiseState::Pending => {
                self.track_evaluation(promise.clone());
                Ok(promise)
            }
            PromiseState::Fulfilled(_) | PromiseState::NotAPromise => Ok(promise),
        }
    }

    /// Run a program the way the command line describes it, returning the
    /// process exit code.
    ///
    /// Include files run first, then the `-e` expression or the main file,
    /// then the event loop. An exception during startup is reported and
    /// yields exit code 1 without entering the loop. A startup file that
    /// cannot be read is returned as an error.
    pub fn run_main(&mut self, options: &RunOptions) -> RuntimeResult<i32> {
        let kind = options.eval_kind();
        *self.state.script_args.borrow_mut() = options.args.clone();

        for include in &options.include {
            let result = self.eval_file(include, kind, false);
            if !self.startup_step(result)? {
                return Ok(1);
            }
        }

        let result = if let Some(expr) = &options.eval {
            Some(self.eval_source(expr, EVAL_FILENAME, kind, false))
        } else {
            options
                .file
                .as_ref()
                .map(|file| self.eval_file(file, kind, true))
        };
        if let Some(result) = result
            && !self.startup_step(result)?
        {
            return Ok(1);
        }

        self.run_loop(&mut StdPoll)
    }

    /// Whether startup may continue after one evaluation
    fn startup_step(&mut self, result: RuntimeResult<E::Value>) -> RuntimeResult<bool> {
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.is_fatal() => {
                error!(error = %e, "failed to load startup file");
                Err(e)
            }
            Err(e) => {
                self.state.report_error(&mut self.engine, e);
                Ok(false)
            }
        }
    }
}
