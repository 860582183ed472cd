//! Typed leaf error kinds: `ConfigError`, `IntegrityError`,
//! `TransportError`, `SandboxError`, `BuildScriptError`, `CycleError`,
//! `UserAbort`. Everywhere else in the workspace propagates with
//! `anyhow::Result`; these seven kinds give that propagation concrete,
//! matchable types at the fixed points of the error taxonomy, and carry a
//! stack of messages, latest-innermost first, rather than a single flat
//! string.

use std::fmt;

use thiserror::Error;

/// One of the seven error kinds in the taxonomy.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("ConfigError")]
    Config,
    #[error("IntegrityError")]
    Integrity,
    #[error("TransportError")]
    Transport,
    #[error("SandboxError")]
    Sandbox,
    #[error("BuildScriptError")]
    BuildScript,
    #[error("CycleError")]
    Cycle,
    #[error("UserAbort")]
    UserAbort,
}

/// A typed drydock error: a kind, a one-line summary, and an accumulated
/// stack of context messages, most-recently-added (i.e. innermost) first.
///
/// `DrydockError` never silently drops a message: every `.context(...)`-style
/// call pushes onto the stack rather than replacing the summary, and on the
/// user-visible render path the stack is always printed in full under the
/// one-line summary.
#[derive(Debug, Clone)]
pub struct DrydockError {
    kind: ErrorKind,
    summary: String,
    stack: Vec<String>,
}

impl std::error::Error for DrydockError {}

impl DrydockError {
    pub fn new(kind: ErrorKind, summary: impl Into<String>) -> Self {
        Self {
            kind,
            summary: summary.into(),
            stack: Vec::new(),
        }
    }

    pub fn config(summary: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, summary)
    }

    pub fn integrity(summary: impl Into<String>) -> Self {
        Self::new(ErrorKind::Integrity, summary)
    }

    pub fn transport(summary: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, summary)
    }

    pub fn sandbox(summary: impl Into<String>) -> Self {
        Self::new(ErrorKind::Sandbox, summary)
    }

    pub fn build_script(summary: impl Into<String>) -> Self {
        Self::new(ErrorKind::BuildScript, summary)
    }

    pub fn cycle(path: &[String]) -> Self {
        Self::new(
            ErrorKind::Cycle,
            format!("cyclic dependency: {}", path.join(" -> ")),
        )
    }

    pub fn user_abort(summary: impl Into<String>) -> Self {
        Self::new(ErrorKind::UserAbort, summary)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Push an additional context message onto the stack. The most recently
    /// pushed message is the innermost (closest to the original failure);
    /// [`DrydockError::render`] prints them in push order, latest-innermost
    /// first.
    pub fn push_context(mut self, message: impl Into<String>) -> Self {
        self.stack.push(message.into());
        self
    }

    pub fn stack(&self) -> &[String] {
        &self.stack
    }

    /// Render as the user-visible failure shape: a one-line summary,
    /// followed by the indented stack.
    pub fn render(&self) -> String {
        let mut out = format!("{}: {}", self.kind, self.summary);
        for line in &self.stack {
            out.push_str("\n  ");
            out.push_str(line);
        }
        out
    }
}

impl fmt::Display for DrydockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

/// Convenience extension mirroring `anyhow::Context`, for typed
/// `DrydockError`s specifically: wraps an existing `Result<T, DrydockError>`
/// with one more stack frame instead of discarding the original error.
pub trait StackContext<T> {
    fn stack_context(self, message: impl Into<String>) -> Result<T, DrydockError>;
}

impl<T> StackContext<T> for Result<T, DrydockError> {
    fn stack_context(self, message: impl Into<String>) -> Result<T, DrydockError> {
        self.map_err(|e| e.push_context(message))
    }
}
