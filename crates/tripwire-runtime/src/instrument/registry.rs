//! Non-owning handler registry keyed by program point.

use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use rustc_hash::{FxBuildHasher, FxHashMap, FxHashSet};

use crate::event::{EventKind, EventSet, Scope};
use crate::handler::{EventHandler, HandlerId};
use crate::trigger::LineSelector;

type Registrations = IndexMap<HandlerId, Registration, FxBuildHasher>;
type Sites = IndexMap<LineSelector, Registrations, FxBuildHasher>;

#[derive(Debug, Clone)]
pub(crate) struct Registration {
    pub(crate) seq: u64,
    pub(crate) handler: Weak<EventHandler>,
}

/// Location of one registration, used to prune it later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SiteKey {
    pub(crate) scope: Scope,
    pub(crate) kind: EventKind,
    pub(crate) line: LineSelector,
    pub(crate) handler: HandlerId,
}

#[derive(Debug, Default)]
struct ScopeEntry {
    kinds: FxHashMap<EventKind, Sites>,
}

impl ScopeEntry {
    fn mask(&self) -> EventSet {
        self.kinds
            .iter()
            .filter(|(_, sites)| !sites.is_empty())
            .fold(EventSet::empty(), |mask, (kind, _)| mask | kind.as_set())
    }

    fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

/// Counts of what the registry currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryStats {
    /// Scopes with at least one site.
    pub scopes: usize,
    /// `(scope, kind, line)` sites.
    pub sites: usize,
    /// Handler references, live or dead.
    pub registrations: usize,
}

/// Result of removing entries from the registry.
#[derive(Debug, Default)]
pub(crate) struct Unlinked {
    pub(crate) registrations: usize,
    pub(crate) sites: usize,
    /// Scopes whose mask shrank, with their new mask.
    pub(crate) narrowed: Vec<(Scope, EventSet)>,
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    scopes: FxHashMap<Scope, ScopeEntry>,
    dirty: FxHashSet<Scope>,
    known: FxHashSet<Scope>,
}

impl Registry {
    /// Link `handler` under every point of its trigger.
    ///
    /// Points already holding the handler keep their original sequence
    /// number. Returns whether any scope mask widened.
    pub(crate) fn insert(&mut self, handler: &Arc<EventHandler>, seq: u64) -> bool {
        let mut widened = false;
        for point in handler.trigger().points() {
            let scope = point.scope();
            let entry = self.scopes.entry(scope).or_default();
            let before = entry.mask();
            entry
                .kinds
                .entry(point.kind)
                .or_default()
                .entry(point.line)
                .or_default()
                .entry(handler.id())
                .or_insert_with(|| Registration {
                    seq,
                    handler: Arc::downgrade(handler),
                });
            if entry.mask() != before {
                widened = true;
            }
            self.dirty.insert(scope);
            self.known.insert(scope);
        }
        widened
    }

    /// Unlink every registration of `handler`.
    pub(crate) fn remove(&mut self, handler: &EventHandler) -> Unlinked {
        let keys: Vec<SiteKey> = handler
            .trigger()
            .points()
            .iter()
            .map(|point| SiteKey {
                scope: point.scope(),
                kind: point.kind,
                line: point.line,
                handler: handler.id(),
            })
            .collect();
        self.unlink(&keys, |_| true)
    }

    /// Unlink the given registrations if their handler is gone.
    pub(crate) fn prune(&mut self, keys: &[SiteKey]) -> Unlinked {
        self.unlink(keys, |registration| registration.handler.strong_count() == 0)
    }

    /// Unlink every dead registration.
    pub(crate) fn sweep(&mut self) -> Unlinked {
        let mut dead = Vec::new();
        for (scope, entry) in &self.scopes {
            for (kind, sites) in &entry.kinds {
                for (line, registrations) in sites {
                    dead.extend(
                        registrations
                            .iter()
                            .filter(|(_, registration)| registration.handler.strong_count() == 0)
                            .map(|(handler, _)| SiteKey {
                                scope: *scope,
                                kind: *kind,
                                line: *line,
                                handler: *handler,
                            }),
                    );
                }
            }
        }
        self.prune(&dead)
    }

    fn unlink(&mut self, keys: &[SiteKey], should_remove: impl Fn(&Registration) -> bool) -> Unlinked {
        let mut unlinked = Unlinked::default();
        let mut before: FxHashMap<Scope, EventSet> = FxHashMap::default();
        for key in keys {
            let Some(entry) = self.scopes.get_mut(&key.scope) else {
                continue;
            };
            before.entry(key.scope).or_insert_with(|| entry.mask());
            let Some(sites) = entry.kinds.get_mut(&key.kind) else {
                continue;
            };
            let Some(registrations) = sites.get_mut(&key.line) else {
                continue;
            };
            if !registrations
                .get(&key.handler)
                .is_some_and(|registration| should_remove(registration))
            {
                continue;
            }
            registrations.shift_remove(&key.handler);
            unlinked.registrations += 1;
            if registrations.is_empty() {
                sites.shift_remove(&key.line);
                unlinked.sites += 1;
            }
            if sites.is_empty() {
                entry.kinds.remove(&key.kind);
            }
        }

        for (scope, previous) in before {
            let current = self.mask(scope);
            if self.scopes.get(&scope).is_some_and(ScopeEntry::is_empty) {
                self.scopes.remove(&scope);
                self.known.remove(&scope);
            }
            if current != previous {
                unlinked.narrowed.push((scope, current));
            }
        }
        unlinked.narrowed.sort_by_key(|(scope, _)| *scope);
        unlinked
    }

    /// Registrations that may fire for an event, from the global and unit
    /// scopes, for the exact line and for any line.
    pub(crate) fn lookup(
        &self,
        unit: Scope,
        kind: EventKind,
        line: Option<u32>,
    ) -> Vec<(SiteKey, Registration)> {
        let mut selectors = Vec::with_capacity(2);
        if let Some(line) = line {
            selectors.push(LineSelector::At(line));
        }
        selectors.push(LineSelector::Any);

        let mut found = Vec::new();
        for scope in [Scope::Global, unit] {
            let Some(sites) = self.scopes.get(&scope).and_then(|entry| entry.kinds.get(&kind))
            else {
                continue;
            };
            for selector in &selectors {
                let Some(registrations) = sites.get(selector) else {
                    continue;
                };
                found.extend(registrations.iter().map(|(handler, registration)| {
                    (
                        SiteKey {
                            scope,
                            kind,
                            line: *selector,
                            handler: *handler,
                        },
                        registration.clone(),
                    )
                }));
            }
            if scope == unit {
                break;
            }
        }
        found
    }

    /// Exact mask the registry implies for `scope`.
    pub(crate) fn mask(&self, scope: Scope) -> EventSet {
        self.scopes
            .get(&scope)
            .map_or(EventSet::empty(), ScopeEntry::mask)
    }

    /// Scopes touched by submissions since the last apply, with their masks.
    pub(crate) fn take_dirty(&mut self) -> Vec<(Scope, EventSet)> {
        let mut dirty: Vec<Scope> = self.dirty.drain().collect();
        dirty.sort();
        dirty
            .into_iter()
            .map(|scope| (scope, self.mask(scope)))
            .collect()
    }

    /// Drop everything; returns every scope that still has a mask, global first.
    pub(crate) fn clear(&mut self) -> Vec<Scope> {
        self.known.insert(Scope::Global);
        let mut known: Vec<Scope> = self.known.drain().collect();
        known.sort();
        self.scopes.clear();
        self.dirty.clear();
        known
    }

    pub(crate) fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            scopes: self.scopes.len(),
            ..RegistryStats::default()
        };
        for sites in self.scopes.values().flat_map(|entry| entry.kinds.values()) {
            stats.sites += sites.len();
            stats.registrations += sites.values().map(IndexMap::len).sum::<usize>();
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::{LocationDescriptor, LocationResolver};
    use crate::trigger::Trigger;
    use crate::unit::{Entity, ProgramUnit, UnitKind};

    fn unit() -> Arc<ProgramUnit> {
        ProgramUnit::builder("f", UnitKind::Function)
            .source("def f():\n    a = 1\n    return a\n")
            .lines([1, 2, 3])
            .build()
    }

    fn handler(entity: impl Into<Entity>, descriptors: &[LocationDescriptor]) -> Arc<EventHandler> {
        let trigger = Trigger::build_with(
            Arc::new(LocationResolver::default()),
            entity,
            descriptors,
            None,
            None,
        )
        .unwrap();
        EventHandler::new(trigger, Vec::new())
    }

    #[test]
    fn insert_widens_and_remove_narrows() {
        let unit = unit();
        let scope = Scope::Unit(unit.id());
        let mut registry = Registry::default();
        let line = handler(&unit, &[LocationDescriptor::Line(2)]);
        let start = handler(&unit, &[LocationDescriptor::Start]);

        assert!(registry.insert(&line, 1));
        assert!(registry.insert(&start, 2));
        assert_eq!(registry.mask(scope), EventSet::LINE | EventSet::START);
        assert_eq!(registry.take_dirty(), vec![(scope, EventSet::LINE | EventSet::START)]);

        let unlinked = registry.remove(&start);
        assert_eq!(unlinked.registrations, 1);
        assert_eq!(unlinked.narrowed, vec![(scope, EventSet::LINE)]);

        let unlinked = registry.remove(&line);
        assert_eq!(unlinked.narrowed, vec![(scope, EventSet::empty())]);
        assert_eq!(registry.stats(), RegistryStats::default());
    }

    #[test]
    fn removing_absent_handler_changes_nothing() {
        let unit = unit();
        let mut registry = Registry::default();
        let absent = handler(&unit, &[LocationDescriptor::Line(3)]);
        let unlinked = registry.remove(&absent);
        assert_eq!(unlinked.registrations, 0);
        assert!(unlinked.narrowed.is_empty());
    }

    #[test]
    fn lookup_covers_global_and_unit_scopes() {
        let unit = unit();
        let mut registry = Registry::default();
        let global = handler(Entity::Any, &[]);
        let exact = handler(&unit, &[LocationDescriptor::Line(2)]);
        registry.insert(&global, 1);
        registry.insert(&exact, 2);

        let found = registry.lookup(Scope::Unit(unit.id()), EventKind::Line, Some(2));
        let ids: Vec<HandlerId> = found.iter().map(|(key, _)| key.handler).collect();
        assert_eq!(ids, vec![global.id(), exact.id()]);

        let found = registry.lookup(Scope::Unit(unit.id()), EventKind::Line, Some(3));
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn sweep_drops_dead_references_only() {
        let unit = unit();
        let mut registry = Registry::default();
        let kept = handler(&unit, &[LocationDescriptor::Line(2)]);
        let dropped = handler(&unit, &[LocationDescriptor::Line(3)]);
        registry.insert(&kept, 1);
        registry.insert(&dropped, 2);
        drop(dropped);

        let unlinked = registry.sweep();
        assert_eq!(unlinked.registrations, 1);
        assert_eq!(unlinked.sites, 1);
        assert!(unlinked.narrowed.is_empty());
        assert_eq!(registry.stats().registrations, 1);
    }

    #[test]
    fn clear_reports_known_scopes_including_global() {
        let unit = unit();
        let mut registry = Registry::default();
        let h = handler(&unit, &[]);
        registry.insert(&h, 1);
        assert_eq!(registry.clear(), vec![Scope::Global, Scope::Unit(unit.id())]);
        assert_eq!(registry.stats().scopes, 0);
    }

    #[test]
    fn emptied_scopes_are_forgotten() {
        let mut registry = Registry::default();
        let units: Vec<Arc<ProgramUnit>> = (0..5).map(|_| unit()).collect();
        for (seq, unit) in (1u64..).zip(&units) {
            let h = handler(unit, &[LocationDescriptor::Line(2)]);
            registry.insert(&h, seq);
            let unlinked = registry.remove(&h);
            assert_eq!(
                unlinked.narrowed,
                vec![(Scope::Unit(unit.id()), EventSet::empty())]
            );
        }
        assert_eq!(registry.stats().scopes, 0);
        assert_eq!(registry.clear(), vec![Scope::Global]);
    }
}
