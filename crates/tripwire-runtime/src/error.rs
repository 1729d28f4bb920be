//! Errors for trigger construction, handler invocation and registry setup.

#![allow(missing_docs)]

use smol_str::SmolStr;
use thiserror::Error;

/// Failure reported by the host runtime (event source or execution context).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HostError(pub SmolStr);

impl HostError {
    pub fn new(message: impl Into<SmolStr>) -> Self {
        Self(message.into())
    }
}

/// Errors raised while building a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TriggerError {
    /// Descriptor of an unsupported shape, or used where it cannot apply.
    #[error("invalid location descriptor: {0}")]
    InvalidDescriptor(SmolStr),

    /// Regex descriptor that does not compile.
    #[error("invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: SmolStr, message: SmolStr },

    /// The target's source no longer hashes to the expected fingerprint.
    #[error("source drifted (expected {expected}, found {actual})")]
    SourceDrifted { expected: SmolStr, actual: SmolStr },

    /// The target has no retrievable source text.
    #[error("no source available for '{0}'")]
    SourceUnavailable(SmolStr),
}

/// Errors raised while running a single action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    /// Callback parameter without a matching local binding.
    #[error("argument '{0}' not found in frame locals")]
    UnboundParameter(SmolStr),

    /// `_retval` requested outside a return event.
    #[error("'_retval' is only available in return events")]
    ReturnValueUnavailable,

    /// Jump target outside the current unit.
    #[error("line {line} is not part of '{unit}'")]
    ControlFlow { unit: SmolStr, line: u32 },

    /// Jump marker that resolves to zero or several lines.
    #[error("jump target must resolve to exactly one line, found {found}")]
    AmbiguousTarget { found: usize },

    /// Marker resolution failed.
    #[error(transparent)]
    Trigger(#[from] TriggerError),

    /// Callback returned an error.
    #[error("callback '{name}' failed: {message}")]
    Callback { name: SmolStr, message: SmolStr },

    /// Host refused the request.
    #[error("host error: {0}")]
    Host(#[from] HostError),
}

/// Errors raised while invoking a handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Condition evaluation failed; no action ran.
    #[error("condition failed: {0}")]
    Condition(ActionError),

    /// An action failed; later actions were skipped.
    #[error("action {index} failed: {source}")]
    Action { index: usize, source: ActionError },

    /// The handler was removed and cannot be submitted again.
    #[error("handler {0} has been removed")]
    Removed(u64),
}

/// Errors raised while setting up the instrumenter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstrumentError {
    /// The event source refused the tool slot.
    #[error("tool id {id} unavailable: {source}")]
    ToolUnavailable { id: u8, source: HostError },

    /// A process-wide instrumenter is already installed.
    #[error("an instrumenter is already installed")]
    AlreadyInstalled,

    /// The background sweep thread could not be started.
    #[error("failed to spawn sweep thread: {0}")]
    ThreadSpawn(SmolStr),
}

/// Configuration loading errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{path}: {message}")]
    Io { path: SmolStr, message: SmolStr },

    #[error("{path}: {message}")]
    Parse { path: SmolStr, message: SmolStr },

    #[error("invalid config: {0}")]
    Invalid(SmolStr),
}
