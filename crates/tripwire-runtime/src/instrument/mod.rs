//! Process-wide registry and dispatcher.
//!
//! The [`Instrumenter`] owns the registry of weak handler references, keeps
//! the event source's subscription masks equal to what the registry implies,
//! and routes incoming events to handlers.
//!
//! Mask updates follow two paths. Widening (a submit) is batched: scopes are
//! marked dirty and one coalesced apply pushes their masks and restarts
//! silenced sites. Narrowing (a removal or a prune) is pushed at once.

#![allow(missing_docs)]

mod dispatch;
mod registry;
mod sweep;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::config::{CacheConfig, InstrumenterConfig};
use crate::error::{HandlerError, InstrumentError};
use crate::event::{DeferredScheduler, EventSet, EventSource, Scope};
use crate::handler::EventHandler;
use crate::resolve::LocationResolver;

pub use registry::RegistryStats;
pub use sweep::SweepOutcome;

use registry::Registry;
use sweep::Sweeper;

static GLOBAL: OnceCell<Instrumenter> = OnceCell::new();

pub(crate) struct Shared {
    source: Arc<dyn EventSource>,
    registry: RwLock<Registry>,
    scheduler: RwLock<Option<Arc<dyn DeferredScheduler>>>,
    apply_pending: AtomicBool,
    // Serializes every write to the event source's masks.
    apply_lock: Mutex<()>,
    next_seq: AtomicU64,
    sweep_lock_timeout: Duration,
}

impl Shared {
    fn schedule_apply(shared: &Arc<Shared>) {
        if shared.apply_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let scheduler = shared.scheduler.read().clone();
        if let Some(scheduler) = scheduler {
            let weak = Arc::downgrade(shared);
            scheduler.defer(Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.apply();
                }
            }));
        } else if dispatch::in_dispatch() {
            dispatch::apply_after_dispatch(shared);
        } else {
            shared.apply();
        }
    }

    /// Push the masks of every dirty scope, then re-enable silenced sites.
    fn apply(&self) {
        let _serial = self.apply_lock.lock();
        self.apply_pending.store(false, Ordering::Release);
        let dirty = self.registry.write().take_dirty();
        for (scope, events) in &dirty {
            self.source.set_events(*scope, *events);
        }
        self.source.restart_events();
        debug!(scopes = dirty.len(), "subscriptions applied");
    }

    /// Push the current mask of each scope.
    fn narrow(&self, scopes: &[(Scope, EventSet)]) {
        if scopes.is_empty() {
            return;
        }
        let _serial = self.apply_lock.lock();
        let registry = self.registry.read();
        for (scope, _) in scopes {
            let events = registry.mask(*scope);
            debug!(?scope, ?events, "subscription narrowed");
            self.source.set_events(*scope, events);
        }
    }
}

/// Registry of event handlers bound to one tool slot of an event source.
pub struct Instrumenter {
    shared: Arc<Shared>,
    caches: CacheConfig,
    sweeper: Option<Sweeper>,
}

impl std::fmt::Debug for Instrumenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrumenter")
            .field("stats", &self.stats())
            .field("sweeping", &self.sweeper.is_some())
            .finish_non_exhaustive()
    }
}

impl Instrumenter {
    /// Claim the configured tool slot on `source` and start the sweep thread.
    pub fn new(
        source: Arc<dyn EventSource>,
        config: &InstrumenterConfig,
    ) -> Result<Self, InstrumentError> {
        source
            .use_tool(config.tool_id, &config.tool_name)
            .map_err(|source| InstrumentError::ToolUnavailable {
                id: config.tool_id,
                source,
            })?;
        let shared = Arc::new(Shared {
            source,
            registry: RwLock::new(Registry::default()),
            scheduler: RwLock::new(None),
            apply_pending: AtomicBool::new(false),
            apply_lock: Mutex::new(()),
            next_seq: AtomicU64::new(0),
            sweep_lock_timeout: config.sweep_lock_timeout,
        });
        let sweeper = config
            .sweep_interval
            .map(|interval| Sweeper::spawn(Arc::downgrade(&shared), interval))
            .transpose()?;
        debug!(
            tool_id = config.tool_id,
            tool_name = %config.tool_name,
            sweep_interval = ?config.sweep_interval,
            "instrumenter ready"
        );
        Ok(Self {
            shared,
            caches: config.caches,
            sweeper,
        })
    }

    /// Route subscription applies through the host's scheduler.
    #[must_use]
    pub fn with_scheduler(self, scheduler: Arc<dyn DeferredScheduler>) -> Self {
        self.set_scheduler(scheduler);
        self
    }

    pub fn set_scheduler(&self, scheduler: Arc<dyn DeferredScheduler>) {
        *self.shared.scheduler.write() = Some(scheduler);
    }

    /// Make `instrumenter` the process-wide instance and tune the shared
    /// resolver with its cache configuration.
    pub fn install(instrumenter: Instrumenter) -> Result<&'static Instrumenter, InstrumentError> {
        GLOBAL
            .set(instrumenter)
            .map_err(|_| InstrumentError::AlreadyInstalled)?;
        let installed = GLOBAL.get().ok_or(InstrumentError::AlreadyInstalled)?;
        LocationResolver::configure(&installed.caches);
        Ok(installed)
    }

    /// The process-wide instance, if installed.
    #[must_use]
    pub fn global() -> Option<&'static Instrumenter> {
        GLOBAL.get()
    }

    /// Cache tuning applied to the shared resolver on [`Self::install`].
    #[must_use]
    pub fn caches(&self) -> &CacheConfig {
        &self.caches
    }

    /// Register `handler` under every point of its trigger.
    pub fn submit(&self, handler: &Arc<EventHandler>) -> Result<(), HandlerError> {
        if handler.is_removed() {
            return Err(HandlerError::Removed(handler.id().0));
        }
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        let widened = self.shared.registry.write().insert(handler, seq);
        if handler.is_removed() {
            self.remove(handler);
            return Err(HandlerError::Removed(handler.id().0));
        }
        debug!(
            handler = %handler.id(),
            target = %handler.trigger().target().describe(),
            points = handler.trigger().points().len(),
            widened,
            "handler submitted"
        );
        Shared::schedule_apply(&self.shared);
        Ok(())
    }

    /// Unlink every registration of `handler`. No effect if none exists.
    pub fn remove(&self, handler: &EventHandler) {
        let unlinked = self.shared.registry.write().remove(handler);
        if unlinked.registrations > 0 {
            debug!(
                handler = %handler.id(),
                registrations = unlinked.registrations,
                sites = unlinked.sites,
                "handler removed"
            );
        }
        self.shared.narrow(&unlinked.narrowed);
    }

    /// Drop every registration, unsubscribe every scope and reset the shared
    /// resolver caches.
    pub fn clear_all(&self) {
        let _serial = self.shared.apply_lock.lock();
        let scopes = self.shared.registry.write().clear();
        for scope in &scopes {
            self.shared.source.set_events(*scope, EventSet::empty());
        }
        LocationResolver::shared().clear();
        debug!(scopes = scopes.len(), "registry cleared");
    }

    /// Apply pending subscription changes now.
    pub fn flush(&self) {
        self.shared.apply();
    }

    /// Run one sweep of dead references.
    pub fn sweep(&self) -> SweepOutcome {
        self.shared.sweep()
    }

    /// Mask the registry currently implies for `scope`.
    #[must_use]
    pub fn subscriptions(&self, scope: Scope) -> EventSet {
        self.shared.registry.read().mask(scope)
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.shared.registry.read().stats()
    }
}
