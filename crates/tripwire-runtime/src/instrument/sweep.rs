//! Periodic removal of registrations whose handler was dropped.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Weak;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::InstrumentError;

use super::Shared;

/// Result of one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// The registry was scanned.
    Swept {
        /// Dead references dropped.
        pruned: usize,
        /// Sites left empty and deleted.
        sites_removed: usize,
        /// Scopes whose mask shrank.
        scopes_narrowed: usize,
    },
    /// The registry lock was busy; the next tick retries.
    Contended,
}

impl Shared {
    pub(super) fn sweep(&self) -> SweepOutcome {
        let Some(mut registry) = self.registry.try_write_for(self.sweep_lock_timeout) else {
            warn!(
                timeout_ms = u64::try_from(self.sweep_lock_timeout.as_millis()).unwrap_or(u64::MAX),
                "registry busy, sweep skipped"
            );
            return SweepOutcome::Contended;
        };
        let unlinked = registry.sweep();
        drop(registry);
        self.narrow(&unlinked.narrowed);
        if unlinked.registrations > 0 {
            debug!(
                pruned = unlinked.registrations,
                sites = unlinked.sites,
                narrowed = unlinked.narrowed.len(),
                "registry swept"
            );
        }
        SweepOutcome::Swept {
            pruned: unlinked.registrations,
            sites_removed: unlinked.sites,
            scopes_narrowed: unlinked.narrowed.len(),
        }
    }
}

/// Background thread running [`Shared::sweep`] on a fixed interval.
///
/// The thread only holds a weak reference and exits once the instrumenter
/// is gone or the sweeper is dropped.
#[derive(Debug)]
pub(super) struct Sweeper {
    stop: Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl Sweeper {
    pub(super) fn spawn(shared: Weak<Shared>, interval: Duration) -> Result<Self, InstrumentError> {
        let (stop, stop_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name("tripwire-sweep".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let Some(shared) = shared.upgrade() else {
                            break;
                        };
                        shared.sweep();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|err| InstrumentError::ThreadSpawn(err.to_string().into()))?;
        Ok(Self {
            stop,
            join: Some(join),
        })
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        let _ = self.stop.send(());
        if let Some(join) = self.join.take() {
            if join.thread().id() != thread::current().id() {
                let _ = join.join();
            }
        }
    }
}
