//! Routing of incoming events to registered handlers.

use std::cell::{Cell, RefCell};
use std::sync::{Arc, Weak};

use rustc_hash::FxHashSet;
use tracing::{trace, warn};

use crate::event::{DispatchSignal, EventKind, ExecutionContext, Scope};
use crate::handler::{EventHandler, HandlerState};
use crate::unit::ProgramUnit;
use crate::value::Value;

use super::{Instrumenter, Shared};

thread_local! {
    static DISPATCH_DEPTH: Cell<usize> = const { Cell::new(0) };
    static AFTER_DISPATCH: RefCell<Vec<Weak<Shared>>> = const { RefCell::new(Vec::new()) };
}

pub(super) fn in_dispatch() -> bool {
    DISPATCH_DEPTH.with(Cell::get) > 0
}

/// Queue an apply for when the outermost dispatch on this thread returns.
pub(super) fn apply_after_dispatch(shared: &Arc<Shared>) {
    AFTER_DISPATCH.with(|queue| queue.borrow_mut().push(Arc::downgrade(shared)));
}

struct DispatchGuard;

impl DispatchGuard {
    fn enter() -> Self {
        DISPATCH_DEPTH.with(|depth| depth.set(depth.get() + 1));
        DispatchGuard
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        let depth = DISPATCH_DEPTH.with(|depth| {
            let remaining = depth.get().saturating_sub(1);
            depth.set(remaining);
            remaining
        });
        if depth > 0 {
            return;
        }
        let queued = AFTER_DISPATCH.with(|queue| std::mem::take(&mut *queue.borrow_mut()));
        for shared in queued.iter().filter_map(Weak::upgrade) {
            shared.apply();
        }
    }
}

impl Instrumenter {
    /// Run every live handler registered for this event.
    ///
    /// Handlers run in registration order, each at most once, with no
    /// registry lock held. Returns `Disable` when a handler asks for it, or
    /// when nothing live is registered here.
    pub fn dispatch(
        &self,
        unit: &Arc<ProgramUnit>,
        kind: EventKind,
        line: Option<u32>,
        ctx: &mut dyn ExecutionContext,
        retval: Option<&Value>,
    ) -> DispatchSignal {
        let _guard = DispatchGuard::enter();
        let line = match kind {
            EventKind::Line => line,
            EventKind::Start | EventKind::Return => None,
        };
        let found = self
            .shared
            .registry
            .read()
            .lookup(Scope::Unit(unit.id()), kind, line);

        let mut live: Vec<(u64, Arc<EventHandler>)> = Vec::with_capacity(found.len());
        let mut dead = Vec::new();
        for (key, registration) in found {
            match registration.handler.upgrade() {
                Some(handler) => live.push((registration.seq, handler)),
                None => dead.push(key),
            }
        }
        if !dead.is_empty() {
            let unlinked = self.shared.registry.write().prune(&dead);
            trace!(pruned = unlinked.registrations, "dead handlers pruned");
            self.shared.narrow(&unlinked.narrowed);
        }
        if live.is_empty() {
            trace!(unit = %unit.name(), %kind, ?line, "no live handlers");
            return DispatchSignal::Disable;
        }

        live.sort_by_key(|(seq, _)| *seq);
        let mut seen = FxHashSet::default();
        for (_, handler) in live {
            if !seen.insert(handler.id()) || handler.state() != HandlerState::Active {
                continue;
            }
            match handler.invoke(ctx, retval) {
                Ok(DispatchSignal::Continue) => {}
                Ok(DispatchSignal::Disable) => {
                    trace!(handler = %handler.id(), "dispatch disabled by handler");
                    return DispatchSignal::Disable;
                }
                Err(err) => warn!(
                    handler = %handler.id(),
                    unit = %unit.name(),
                    %kind,
                    ?line,
                    "handler failed: {err}"
                ),
            }
        }
        DispatchSignal::Continue
    }

    /// Line event for the context's current unit and line.
    pub fn on_line(&self, ctx: &mut dyn ExecutionContext) -> DispatchSignal {
        let unit = ctx.unit().clone();
        let line = ctx.line();
        self.dispatch(&unit, EventKind::Line, Some(line), ctx, None)
    }

    /// Start event for the context's current unit.
    pub fn on_start(&self, ctx: &mut dyn ExecutionContext) -> DispatchSignal {
        let unit = ctx.unit().clone();
        self.dispatch(&unit, EventKind::Start, None, ctx, None)
    }

    /// Return event for the context's current unit.
    pub fn on_return(&self, ctx: &mut dyn ExecutionContext, retval: &Value) -> DispatchSignal {
        let unit = ctx.unit().clone();
        self.dispatch(&unit, EventKind::Return, None, ctx, Some(retval))
    }
}
