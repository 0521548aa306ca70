//! Service Worker Lifecycle Management
//!
//! Handles worker state transitions and lifecycle events.

use std::sync::Arc;

use super::{ServiceWorkerError, ServiceWorkerId};

/// Service Worker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceWorkerState {
    /// Created, install not yet run
    Parsed,
    /// Install in progress
    Installing,
    /// Installed, waiting to activate
    Installed,
    /// Activate in progress
    Activating,
    /// Active and controlling pages
    Activated,
    /// Replaced or retired
    Redundant,
}

impl Default for ServiceWorkerState {
    fn default() -> Self {
        Self::Parsed
    }
}

/// Lifecycle event types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Install started
    Install(ServiceWorkerId),
    /// Activate started
    Activate(ServiceWorkerId),
    /// State change
    StateChange(StateChangeEvent),
    /// Worker claimed the open pages
    ControllerChange(ServiceWorkerId),
}

/// State change event data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChangeEvent {
    /// Worker ID
    pub worker_id: ServiceWorkerId,
    /// Old state
    pub old_state: ServiceWorkerState,
    /// New state
    pub new_state: ServiceWorkerState,
}

pub type LifecycleListener = Box<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// Listener as stored by the manager, cloneable out of its lock.
pub type SharedListener = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// Lifecycle manager for one worker.
///
/// State changes only record their events. Callers hand the returned events
/// to [`notify`] once the manager is no longer borrowed, so a listener may
/// read the worker that owns it.
pub struct LifecycleManager {
    worker_id: ServiceWorkerId,
    state: ServiceWorkerState,
    /// Whether the worker asked to skip the waiting phase
    skip_waiting: bool,
    /// Whether the worker took control of open pages
    clients_claimed: bool,
    /// Dispatched events, oldest first
    pending_events: Vec<LifecycleEvent>,
    /// Event listeners
    listeners: Vec<SharedListener>,
}

impl LifecycleManager {
    /// Create new lifecycle manager
    pub fn new(worker_id: ServiceWorkerId) -> Self {
        Self {
            worker_id,
            state: ServiceWorkerState::Parsed,
            skip_waiting: false,
            clients_claimed: false,
            pending_events: Vec::new(),
            listeners: Vec::new(),
        }
    }

    pub fn state(&self) -> ServiceWorkerState {
        self.state
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting
    }

    pub fn clients_claimed(&self) -> bool {
        self.clients_claimed
    }

    /// Add event listener
    pub fn add_listener(&mut self, listener: LifecycleListener) {
        self.listeners.push(Arc::from(listener));
    }

    /// Snapshot of the registered listeners
    pub fn listeners(&self) -> Vec<SharedListener> {
        self.listeners.clone()
    }

    fn record(&mut self, event: LifecycleEvent, out: &mut Vec<LifecycleEvent>) {
        self.pending_events.push(event.clone());
        out.push(event);
    }

    /// Get pending events
    pub fn pending_events(&self) -> &[LifecycleEvent] {
        &self.pending_events
    }

    /// Clear pending events
    pub fn clear_pending(&mut self) {
        self.pending_events.clear();
    }

    /// Transition worker state, returning the events to deliver
    pub fn transition(
        &mut self,
        new_state: ServiceWorkerState,
    ) -> Result<Vec<LifecycleEvent>, ServiceWorkerError> {
        let old_state = self.state;

        if !is_valid_transition(old_state, new_state) {
            return Err(ServiceWorkerError::InvalidStateTransition {
                from: old_state,
                to: new_state,
            });
        }

        self.state = new_state;
        log::debug!(
            "[ServiceWorker] worker {} {:?} -> {:?}",
            self.worker_id.raw(),
            old_state,
            new_state
        );

        let mut events = Vec::new();
        self.record(
            LifecycleEvent::StateChange(StateChangeEvent {
                worker_id: self.worker_id,
                old_state,
                new_state,
            }),
            &mut events,
        );

        match new_state {
            ServiceWorkerState::Installing => {
                self.record(LifecycleEvent::Install(self.worker_id), &mut events);
            }
            ServiceWorkerState::Activating => {
                self.record(LifecycleEvent::Activate(self.worker_id), &mut events);
            }
            _ => {}
        }

        Ok(events)
    }

    /// Record that the installed worker should not wait for older workers
    /// to release their pages.
    pub fn skip_waiting(&mut self) -> Result<(), ServiceWorkerError> {
        if self.state != ServiceWorkerState::Installed {
            return Err(ServiceWorkerError::InvalidStateTransition {
                from: self.state,
                to: ServiceWorkerState::Activating,
            });
        }
        self.skip_waiting = true;
        Ok(())
    }

    /// Record that the active worker took control of all open pages
    pub fn claim(&mut self) -> Result<Vec<LifecycleEvent>, ServiceWorkerError> {
        if self.state != ServiceWorkerState::Activated {
            return Err(ServiceWorkerError::NotActive(self.state));
        }
        self.clients_claimed = true;
        let mut events = Vec::new();
        self.record(LifecycleEvent::ControllerChange(self.worker_id), &mut events);
        Ok(events)
    }
}

/// Deliver `events` to every listener, in order.
pub fn notify(listeners: &[SharedListener], events: &[LifecycleEvent]) {
    for event in events {
        for listener in listeners {
            listener(event);
        }
    }
}

/// Check if a state transition is valid
fn is_valid_transition(from: ServiceWorkerState, to: ServiceWorkerState) -> bool {
    use ServiceWorkerState::*;

    matches!(
        (from, to),
        (Parsed, Installing)
            | (Installing, Installed)
            | (Installing, Redundant)
            | (Installed, Activating)
            | (Installed, Redundant)
            | (Activating, Activated)
            | (Activating, Redundant)
            | (Activated, Redundant)
    )
}
