//! Handler actions and callback argument binding.
//!
//! Native callbacks declare parameter names; at invocation each name is bound
//! from the executing frame. `_retval` is reserved for the value being
//! returned and only exists in return events.

#![allow(missing_docs)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use smol_str::SmolStr;
use tracing::trace;

use crate::error::ActionError;
use crate::event::{DispatchSignal, ExecutionContext};
use crate::resolve::{LocationDescriptor, LocationResolver};
use crate::value::Value;

/// Parameter name bound to the return value in return events.
pub const RETVAL: &str = "_retval";

static NEXT_CALLBACK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a callback or predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

impl CallbackId {
    fn next() -> Self {
        Self(NEXT_CALLBACK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Something whose arguments are bound by parameter name.
pub trait Signature {
    fn callback_id(&self) -> CallbackId;

    /// Parameters as declared, receiver included.
    fn declared_params(&self) -> &[SmolStr];

    /// Whether the first declared parameter is an already supplied receiver.
    fn is_bound(&self) -> bool;
}

/// What a callback asks the dispatcher to do next.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Reply {
    #[default]
    Continue,
    /// Silence the current site.
    Disable,
    /// Write these locals back into the frame.
    Assign(Vec<(SmolStr, Value)>),
}

type CallbackFn = dyn Fn(&[Value]) -> Result<Reply, SmolStr> + Send + Sync;
type PredicateFn = dyn Fn(&[Value]) -> Result<bool, SmolStr> + Send + Sync;

/// Native function run as an action.
#[derive(Clone)]
pub struct Callback {
    id: CallbackId,
    name: SmolStr,
    params: Arc<[SmolStr]>,
    bound: bool,
    func: Arc<CallbackFn>,
}

impl Callback {
    pub fn new<I, S, F>(name: impl Into<SmolStr>, params: I, func: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SmolStr>,
        F: Fn(&[Value]) -> Result<Reply, SmolStr> + Send + Sync + 'static,
    {
        Self {
            id: CallbackId::next(),
            name: name.into(),
            params: params.into_iter().map(Into::into).collect(),
            bound: false,
            func: Arc::new(func),
        }
    }

    /// Treat the first declared parameter as a receiver that is never bound.
    #[must_use]
    pub fn bound(mut self) -> Self {
        self.bound = true;
        self.id = CallbackId::next();
        self
    }

    #[must_use]
    pub fn name(&self) -> &SmolStr {
        &self.name
    }

    fn call(
        &self,
        resolver: &LocationResolver,
        ctx: &mut dyn ExecutionContext,
        retval: Option<&Value>,
    ) -> Result<Reply, ActionError> {
        let args = bind_arguments(resolver, self, &*ctx, retval)?;
        (self.func)(&args).map_err(|message| ActionError::Callback {
            name: self.name.clone(),
            message,
        })
    }
}

impl Signature for Callback {
    fn callback_id(&self) -> CallbackId {
        self.id
    }

    fn declared_params(&self) -> &[SmolStr] {
        &self.params
    }

    fn is_bound(&self) -> bool {
        self.bound
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("bound", &self.bound)
            .finish_non_exhaustive()
    }
}

/// Native condition; parameters are bound like a [`Callback`]'s.
#[derive(Clone)]
pub struct Predicate {
    id: CallbackId,
    name: SmolStr,
    params: Arc<[SmolStr]>,
    func: Arc<PredicateFn>,
}

impl Predicate {
    pub fn new<I, S, F>(name: impl Into<SmolStr>, params: I, func: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SmolStr>,
        F: Fn(&[Value]) -> Result<bool, SmolStr> + Send + Sync + 'static,
    {
        Self {
            id: CallbackId::next(),
            name: name.into(),
            params: params.into_iter().map(Into::into).collect(),
            func: Arc::new(func),
        }
    }

    pub(crate) fn test(
        &self,
        resolver: &LocationResolver,
        ctx: &dyn ExecutionContext,
        retval: Option<&Value>,
    ) -> Result<bool, ActionError> {
        let args = bind_arguments(resolver, self, ctx, retval)?;
        (self.func)(&args).map_err(|message| ActionError::Callback {
            name: self.name.clone(),
            message,
        })
    }
}

impl Signature for Predicate {
    fn callback_id(&self) -> CallbackId {
        self.id
    }

    fn declared_params(&self) -> &[SmolStr] {
        &self.params
    }

    fn is_bound(&self) -> bool {
        false
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Predicate")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Bind each parameter of `signature` from the frame.
pub(crate) fn bind_arguments(
    resolver: &LocationResolver,
    signature: &dyn Signature,
    ctx: &dyn ExecutionContext,
    retval: Option<&Value>,
) -> Result<Vec<Value>, ActionError> {
    resolver
        .parameters(signature)
        .iter()
        .map(|name| {
            if name == RETVAL {
                retval.cloned().ok_or(ActionError::ReturnValueUnavailable)
            } else {
                ctx.local(name)
                    .ok_or_else(|| ActionError::UnboundParameter(name.clone()))
            }
        })
        .collect()
}

/// Code run by an [`Action::Execute`].
#[derive(Debug, Clone)]
pub enum Execute {
    /// Host-language source executed in the frame.
    Source(SmolStr),
    /// Native callback.
    Callback(Callback),
}

/// Destination of an [`Action::Goto`].
#[derive(Debug, Clone)]
pub enum GotoTarget {
    Line(u32),
    /// Descriptor resolved against the executing unit; must name one line.
    Marker(LocationDescriptor),
}

impl From<u32> for GotoTarget {
    fn from(line: u32) -> Self {
        GotoTarget::Line(line)
    }
}

impl From<&str> for GotoTarget {
    fn from(marker: &str) -> Self {
        GotoTarget::Marker(LocationDescriptor::parse(marker))
    }
}

impl From<LocationDescriptor> for GotoTarget {
    fn from(descriptor: LocationDescriptor) -> Self {
        match descriptor {
            LocationDescriptor::Line(line) => GotoTarget::Line(line),
            other => GotoTarget::Marker(other),
        }
    }
}

/// One step of a handler.
#[derive(Debug, Clone)]
pub enum Action {
    Execute(Execute),
    /// Pause for an interactive debugger.
    Breakpoint,
    /// Move execution to another line of the current unit.
    Goto(GotoTarget),
}

impl Action {
    #[must_use]
    pub fn source(code: impl Into<SmolStr>) -> Self {
        Action::Execute(Execute::Source(code.into()))
    }

    #[must_use]
    pub fn callback(callback: Callback) -> Self {
        Action::Execute(Execute::Callback(callback))
    }

    #[must_use]
    pub fn goto(target: impl Into<GotoTarget>) -> Self {
        Action::Goto(target.into())
    }

    /// Run the action against the current frame.
    pub fn invoke(
        &self,
        resolver: &LocationResolver,
        ctx: &mut dyn ExecutionContext,
        retval: Option<&Value>,
    ) -> Result<DispatchSignal, ActionError> {
        match self {
            Action::Execute(Execute::Source(code)) => {
                ctx.execute(code)?;
                Ok(DispatchSignal::Continue)
            }
            Action::Execute(Execute::Callback(callback)) => {
                match callback.call(resolver, ctx, retval)? {
                    Reply::Continue => Ok(DispatchSignal::Continue),
                    Reply::Disable => Ok(DispatchSignal::Disable),
                    Reply::Assign(writes) => {
                        for (name, value) in writes {
                            ctx.set_local(&name, value)?;
                        }
                        Ok(DispatchSignal::Continue)
                    }
                }
            }
            Action::Breakpoint => Ok(ctx.pause()),
            Action::Goto(target) => {
                let line = goto_line(resolver, &*ctx, target)?;
                trace!(unit = %ctx.unit().name(), line, "jump");
                ctx.jump(line)?;
                Ok(DispatchSignal::Continue)
            }
        }
    }
}

fn goto_line(
    resolver: &LocationResolver,
    ctx: &dyn ExecutionContext,
    target: &GotoTarget,
) -> Result<u32, ActionError> {
    let unit = ctx.unit();
    let line = match target {
        GotoTarget::Line(line) => *line,
        GotoTarget::Marker(descriptor) => {
            let resolved = resolver.resolve(unit, std::slice::from_ref(descriptor))?;
            let lines: Vec<u32> = resolved
                .iter()
                .flat_map(|group| group.lines.iter().copied())
                .collect();
            match lines.as_slice() {
                [line] => *line,
                _ => return Err(ActionError::AmbiguousTarget { found: lines.len() }),
            }
        }
    };
    if unit.has_line(line) {
        Ok(line)
    } else {
        Err(ActionError::ControlFlow {
            unit: unit.name().clone(),
            line,
        })
    }
}
