//! Event handlers and their lifecycle.
//!
//! A handler is `Active` after construction, can be toggled between `Active`
//! and `Disabled`, and ends in `Removed`, from which it never comes back. The
//! registry only keeps weak references, so the caller's `Arc` decides how
//! long a handler stays reachable.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::action::Action;
use crate::error::HandlerError;
use crate::event::{DispatchSignal, ExecutionContext};
use crate::instrument::Instrumenter;
use crate::trigger::Trigger;
use crate::value::Value;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique handler identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of an [`EventHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Runs when its trigger fires.
    Active,
    /// Registered but skipped.
    Disabled,
    /// Unregistered for good.
    Removed,
}

/// A trigger plus the ordered actions it runs.
#[derive(Debug)]
pub struct EventHandler {
    id: HandlerId,
    trigger: Trigger,
    actions: Vec<Action>,
    enabled: AtomicBool,
    removed: AtomicBool,
}

impl EventHandler {
    /// Create an active, not yet registered handler.
    #[must_use]
    pub fn new(trigger: Trigger, actions: Vec<Action>) -> Arc<Self> {
        Arc::new(Self {
            id: HandlerId(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed)),
            trigger,
            actions,
            enabled: AtomicBool::new(true),
            removed: AtomicBool::new(false),
        })
    }

    /// Process-unique identity.
    #[must_use]
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Trigger deciding where and when the handler runs.
    #[must_use]
    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    /// Actions in execution order.
    #[must_use]
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> HandlerState {
        if self.removed.load(Ordering::Acquire) {
            HandlerState::Removed
        } else if self.enabled.load(Ordering::Acquire) {
            HandlerState::Active
        } else {
            HandlerState::Disabled
        }
    }

    /// Whether [`Self::remove`] has run.
    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Resume running. No effect once removed.
    pub fn enable(&self) {
        if !self.is_removed() {
            self.enabled.store(true, Ordering::Release);
        }
    }

    /// Keep the registration but skip this handler. No effect once removed.
    pub fn disable(&self) {
        if !self.is_removed() {
            self.enabled.store(false, Ordering::Release);
        }
    }

    /// Register with `instrumenter` and make the handler active.
    pub fn submit(self: &Arc<Self>, instrumenter: &Instrumenter) -> Result<(), HandlerError> {
        instrumenter.submit(self)?;
        self.enabled.store(true, Ordering::Release);
        Ok(())
    }

    /// Unregister for good. Removing twice is a no-op.
    pub fn remove(&self, instrumenter: &Instrumenter) {
        if !self.removed.swap(true, Ordering::AcqRel) {
            self.enabled.store(false, Ordering::Release);
            instrumenter.remove(self);
        }
    }

    /// Run the handler for the current event.
    ///
    /// Returns `Disable` as soon as one action asks for it; the remaining
    /// actions are skipped. An action error aborts the remaining actions.
    pub fn invoke(
        &self,
        ctx: &mut dyn ExecutionContext,
        retval: Option<&Value>,
    ) -> Result<DispatchSignal, HandlerError> {
        if self.state() != HandlerState::Active {
            return Ok(DispatchSignal::Continue);
        }
        if !self
            .trigger
            .holds(ctx, retval)
            .map_err(HandlerError::Condition)?
        {
            trace!(handler = %self.id, "condition not met");
            return Ok(DispatchSignal::Continue);
        }
        let resolver = self.trigger.resolver();
        for (index, action) in self.actions.iter().enumerate() {
            let signal = action
                .invoke(resolver, ctx, retval)
                .map_err(|source| HandlerError::Action { index, source })?;
            if signal.is_disable() {
                return Ok(DispatchSignal::Disable);
            }
        }
        Ok(DispatchSignal::Continue)
    }
}
