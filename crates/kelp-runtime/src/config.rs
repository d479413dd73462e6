//! Configuration types for the kelp runtime.
//!
//! [`RuntimeConfig`] controls a runtime instance and is inherited by the
//! workers it spawns. [`RunOptions`] is the command-line surface of
//! [`Runtime::run_main`](crate::Runtime::run_main); it derives `clap::Args`
//! so a frontend can flatten it into its own parser.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Runtime instance settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// File suffixes loaded as native extension modules.
    /// Default: `[".so"]`
    pub native_suffixes: Vec<String>,

    /// Longest main-module name kept; longer names are truncated.
    /// Default: 1024
    pub max_main_name_len: usize,

    /// Abort running scripts on SIGINT.
    /// Default: true
    pub interrupt_on_sigint: bool,

    /// Report promises still rejected without a handler after each drain.
    /// Default: true
    pub track_rejections: bool,

    /// Upper bound for one blocking wait of the default poll step, in
    /// milliseconds. `None` waits until the next timer or descriptor event.
    pub max_poll_wait_ms: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            native_suffixes: vec![".so".to_string()],
            max_main_name_len: 1024,
            interrupt_on_sigint: true,
            track_rejections: true,
            max_poll_wait_ms: None,
        }
    }
}

impl RuntimeConfig {
    /// Create a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the native extension suffixes.
    pub fn native_suffixes<I, S>(mut self, suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.native_suffixes = suffixes.into_iter().map(Into::into).collect();
        self
    }

    /// Set the main-module name limit.
    pub fn max_main_name_len(mut self, len: usize) -> Self {
        self.max_main_name_len = len;
        self
    }

    /// Enable or disable SIGINT interruption.
    pub fn interrupt_on_sigint(mut self, enabled: bool) -> Self {
        self.interrupt_on_sigint = enabled;
        self
    }

    /// Enable or disable unhandled rejection tracking.
    pub fn track_rejections(mut self, enabled: bool) -> Self {
        self.track_rejections = enabled;
        self
    }

    /// Cap the blocking wait of the default poll step.
    pub fn max_poll_wait(mut self, wait: Duration) -> Self {
        self.max_poll_wait_ms = Some(wait.as_millis().min(u64::MAX as u128) as u64);
        self
    }

    /// Whether `name` ends with one of the native extension suffixes.
    pub fn is_native(&self, name: &str) -> bool {
        self.native_suffixes
            .iter()
            .any(|suffix| !suffix.is_empty() && name.ends_with(suffix.as_str()))
    }
}

/// How source text is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EvalKind {
    /// `.mjs` files and sources starting with `import`/`export` are modules
    #[default]
    Auto,
    /// Always a classic script
    Script,
    /// Always an ES module
    Module,
}

/// What to run, as given on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq, clap::Args, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Interpret sources as ES modules
    #[arg(short = 'm', long, conflicts_with = "script")]
    pub module: bool,

    /// Interpret sources as classic scripts
    #[arg(long)]
    pub script: bool,

    /// Evaluate FILE before the main program (repeatable)
    #[arg(short = 'I', long = "include", value_name = "FILE")]
    pub include: Vec<PathBuf>,

    /// Evaluate EXPR instead of a file
    #[arg(short = 'e', long = "eval", value_name = "EXPR")]
    pub eval: Option<String>,

    /// Main program
    #[arg(value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// Arguments passed to the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

impl RunOptions {
    /// Run options for a single file
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            file: Some(path.into()),
            ..Default::default()
        }
    }

    /// Run options for an expression
    pub fn eval(expr: impl Into<String>) -> Self {
        Self {
            eval: Some(expr.into()),
            ..Default::default()
        }
    }

    /// Interpretation requested by the `--module`/`--script` flags
    pub fn eval_kind(&self) -> EvalKind {
        if self.module {
            EvalKind::Module
        } else if self.script {
            EvalKind::Script
        } else {
            EvalKind::Auto
        }
    }
}
