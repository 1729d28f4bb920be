//! `tripwire-runtime` - event registry and dispatcher for runtime instrumentation.
//!
//! Handlers are attached to program points (a source line, a unit's entry or
//! its return) and run when the host's event source reports that point. The
//! registry holds only weak references to handlers, keeps the host's
//! subscription masks in sync with what is registered, and prunes entries
//! whose handlers were dropped.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

/// Handler actions and callback argument binding.
pub mod action;
/// Bounded self-tuning memoization.
pub mod cache;
/// Instrumenter configuration loading.
pub mod config;
/// Error types.
pub mod error;
/// Event kinds, scopes and the host event-source interface.
pub mod event;
/// Event handlers and their lifecycle.
pub mod handler;
/// Process-wide registry and dispatcher.
pub mod instrument;
/// Location descriptors and line resolution.
pub mod resolve;
/// Triggers: resolved program points plus guards.
pub mod trigger;
/// Program units and instrumentation targets.
pub mod unit;
/// Host values seen by conditions and callbacks.
pub mod value;

pub use action::{Action, Callback, Execute, GotoTarget, Predicate, Reply};
pub use cache::{AdaptiveCache, CacheStats, CacheTuning};
pub use config::{CacheConfig, InstrumenterConfig};
pub use error::{
    ActionError, ConfigError, HandlerError, HostError, InstrumentError, TriggerError,
};
pub use event::{
    DeferredScheduler, DispatchSignal, EventKind, EventSet, EventSource, ExecutionContext,
    RecordingEventSource, Scope,
};
pub use handler::{EventHandler, HandlerId, HandlerState};
pub use instrument::{Instrumenter, RegistryStats, SweepOutcome};
pub use resolve::{LocationDescriptor, LocationResolver, UnitLines};
pub use trigger::{fingerprint, Condition, LineSelector, ProgramPoint, Trigger};
pub use unit::{Callable, Entity, LineRange, ProgramUnit, UnitBuilder, UnitId, UnitKind};
pub use value::Value;

/// Drop every registration held by `instrumenter` and reset the shared
/// resolver caches.
pub fn clear_all(instrumenter: &Instrumenter) {
    instrumenter.clear_all();
}
