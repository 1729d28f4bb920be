//! Event kinds, scopes and the host-side interfaces the instrumenter drives.

mod recording;

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::HostError;
use crate::unit::{ProgramUnit, UnitId};
use crate::value::Value;

pub use recording::{MaskUpdate, RecordingEventSource};

/// Kind of notification emitted by the event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// Execution reached a new source line.
    Line,
    /// A unit started executing.
    Start,
    /// A unit is returning.
    Return,
}

impl EventKind {
    /// All kinds, in bitmask order.
    pub const ALL: [EventKind; 3] = [EventKind::Line, EventKind::Start, EventKind::Return];

    /// Single-kind event set.
    #[must_use]
    pub fn as_set(self) -> EventSet {
        match self {
            EventKind::Line => EventSet::LINE,
            EventKind::Start => EventSet::START,
            EventKind::Return => EventSet::RETURN,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventKind::Line => "line",
            EventKind::Start => "start",
            EventKind::Return => "return",
        })
    }
}

bitflags! {
    /// Subscription bitmask for one scope.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventSet: u8 {
        /// Line events.
        const LINE = 1;
        /// Unit start events.
        const START = 1 << 1;
        /// Unit return events.
        const RETURN = 1 << 2;
    }
}

/// Subscription scope: every unit, or a single one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    /// Events from every unit.
    Global,
    /// Events from one unit only.
    Unit(UnitId),
}

/// Directive returned to the event source after a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchSignal {
    /// Keep delivering events at this site.
    #[default]
    Continue,
    /// Stop delivering events at this site until subscriptions are re-applied.
    Disable,
}

impl DispatchSignal {
    /// Whether the host should silence the site.
    #[must_use]
    pub fn is_disable(self) -> bool {
        matches!(self, DispatchSignal::Disable)
    }
}

/// The host runtime's native event mechanism.
///
/// The instrumenter is the only client of its tool slot: it owns the masks
/// it sets and expects them back unchanged from [`EventSource::events`].
pub trait EventSource: Send + Sync {
    /// Claim the tool slot `id` under `name`.
    fn use_tool(&self, id: u8, name: &str) -> Result<(), HostError>;

    /// Replace the enabled events of `scope` with exactly `events`.
    fn set_events(&self, scope: Scope, events: EventSet);

    /// Currently enabled events of `scope`.
    fn events(&self, scope: Scope) -> EventSet;

    /// Re-enable sites that were silenced by [`DispatchSignal::Disable`].
    fn restart_events(&self);
}

/// Cooperative scheduler of the host, if it has one.
pub trait DeferredScheduler: Send + Sync {
    /// Run `task` at the next safe point (next scheduler tick).
    fn defer(&self, task: Box<dyn FnOnce() + Send>);
}

/// The frame being executed when an event fires.
pub trait ExecutionContext {
    /// Unit currently executing.
    fn unit(&self) -> &Arc<ProgramUnit>;

    /// Line currently executing.
    fn line(&self) -> u32;

    /// Local binding `name`, if any.
    fn local(&self, name: &str) -> Option<Value>;

    /// Write a local binding back into the frame.
    fn set_local(&mut self, name: &str, value: Value) -> Result<(), HostError>;

    /// Evaluate a host-language expression against the frame.
    fn evaluate(&mut self, expr: &str) -> Result<Value, HostError>;

    /// Execute host-language code in the frame.
    fn execute(&mut self, code: &str) -> Result<(), HostError>;

    /// Pause for an interactive debugger. Returns once execution may resume.
    fn pause(&mut self) -> DispatchSignal {
        DispatchSignal::Continue
    }

    /// Resume execution at `line` of the current unit.
    fn jump(&mut self, line: u32) -> Result<(), HostError>;
}
