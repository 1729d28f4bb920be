//! In-memory event source.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smol_str::SmolStr;

use crate::error::HostError;

use super::{EventSet, EventSource, Scope};

/// One `set_events` call observed by a [`RecordingEventSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskUpdate {
    /// Scope whose mask was replaced.
    pub scope: Scope,
    /// New mask.
    pub events: EventSet,
}

#[derive(Debug, Default)]
struct RecordingState {
    tools: FxHashMap<u8, SmolStr>,
    masks: FxHashMap<Scope, EventSet>,
    updates: Vec<MaskUpdate>,
    restarts: usize,
}

/// Event source that only records what it is asked to do.
///
/// Useful for hosts that poll subscription masks instead of receiving
/// pushes, and for exercising the registry without a live runtime.
#[derive(Debug, Default)]
pub struct RecordingEventSource {
    state: Mutex<RecordingState>,
}

impl RecordingEventSource {
    /// Source with no tool, mask or restart recorded.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every mask update so far, oldest first.
    #[must_use]
    pub fn updates(&self) -> Vec<MaskUpdate> {
        self.state.lock().updates.clone()
    }

    /// Number of `restart_events` calls so far.
    #[must_use]
    pub fn restarts(&self) -> usize {
        self.state.lock().restarts
    }

    /// Name registered for tool `id`.
    #[must_use]
    pub fn tool(&self, id: u8) -> Option<SmolStr> {
        self.state.lock().tools.get(&id).cloned()
    }

    /// Scopes with a non-empty mask.
    #[must_use]
    pub fn subscribed_scopes(&self) -> Vec<Scope> {
        let state = self.state.lock();
        let mut scopes: Vec<Scope> = state
            .masks
            .iter()
            .filter(|(_, events)| !events.is_empty())
            .map(|(scope, _)| *scope)
            .collect();
        scopes.sort();
        scopes
    }
}

impl EventSource for RecordingEventSource {
    fn use_tool(&self, id: u8, name: &str) -> Result<(), HostError> {
        let mut state = self.state.lock();
        match state.tools.get(&id) {
            Some(existing) if existing != name => Err(HostError::new(format!(
                "tool {id} is already in use by '{existing}'"
            ))),
            _ => {
                state.tools.insert(id, name.into());
                Ok(())
            }
        }
    }

    fn set_events(&self, scope: Scope, events: EventSet) {
        let mut state = self.state.lock();
        state.masks.insert(scope, events);
        state.updates.push(MaskUpdate { scope, events });
    }

    fn events(&self, scope: Scope) -> EventSet {
        self.state
            .lock()
            .masks
            .get(&scope)
            .copied()
            .unwrap_or_default()
    }

    fn restart_events(&self) {
        self.state.lock().restarts += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_slots_are_exclusive_per_name() {
        let source = RecordingEventSource::new();
        assert!(source.use_tool(4, "tripwire").is_ok());
        assert!(source.use_tool(4, "tripwire").is_ok());
        assert!(source.use_tool(4, "profiler").is_err());
        assert_eq!(source.tool(4).as_deref(), Some("tripwire"));
    }

    #[test]
    fn masks_are_replaced_not_merged() {
        let source = RecordingEventSource::new();
        source.set_events(Scope::Global, EventSet::LINE | EventSet::START);
        source.set_events(Scope::Global, EventSet::RETURN);
        assert_eq!(source.events(Scope::Global), EventSet::RETURN);
        assert_eq!(source.updates().len(), 2);
    }
}
