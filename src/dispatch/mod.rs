//! Typed Event Dispatch
//!
//! A generic, connection-independent reducer plus effect scheduler. Each
//! event kind has one registered handler that maps the current state to a
//! new state and an optional [`Effect`]:
//!
//! - [`Effect::Immediate`] dispatches another event depth-first before the
//!   current `dispatch` call returns.
//! - [`Effect::Delayed`] schedules a one-shot future dispatch.
//! - [`Effect::Predicate`] registers a guard that fires its event once the
//!   state satisfies it, with a timeout fallback that fires unconditionally.
//!
//! After every state commit the pending guards are evaluated against the new
//! state. Satisfied guards are removed from the pending set *before* any of
//! their events are dispatched, so a guard can never be observed mid-removal
//! or fire twice. A guard's timeout task checks that its registration id is
//! still pending before acting, so the late timer of an already-satisfied
//! guard is inert.
//!
//! Scheduling (`Delayed`, guard timeouts) runs on the ambient Tokio runtime;
//! timer-driven behavior is tested under the paused virtual clock.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

/// Maximum number of nested synchronous dispatches (immediate effects plus
/// guard-triggered events) in one settlement. Exceeding it means a handler
/// or guard re-arms itself unboundedly, which is a programming error.
pub const MAX_CASCADE_DEPTH: usize = 64;

/// A dispatchable event over a closed set of kinds.
pub trait Event: Clone + Send + 'static {
    /// Discriminant used to look up the handler for an event.
    type Kind: Copy + Eq + Hash + fmt::Debug + Send;

    /// This event's kind.
    fn kind(&self) -> Self::Kind;
}

/// Condition over the state that gates a pending guard.
pub type Guard<S> = Box<dyn Fn(&S) -> bool + Send>;

/// Side-scheduling instruction produced by a state transition.
pub enum Effect<S, E> {
    /// Dispatch `event` now, depth-first, before the outer dispatch returns.
    Immediate(E),
    /// Dispatch `event` once `after` has elapsed.
    Delayed {
        /// Delay before the dispatch.
        after: Duration,
        /// Event to dispatch.
        event: E,
    },
    /// Dispatch `event` once `guard` holds, or unconditionally at `timeout`.
    Predicate {
        /// Condition evaluated against each newly committed state.
        guard: Guard<S>,
        /// Fallback deadline.
        timeout: Duration,
        /// Event to dispatch.
        event: E,
    },
}

impl<S, E: fmt::Debug> fmt::Debug for Effect<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::Immediate(event) => f.debug_tuple("Immediate").field(event).finish(),
            Effect::Delayed { after, event } => f
                .debug_struct("Delayed")
                .field("after", after)
                .field("event", event)
                .finish(),
            Effect::Predicate { timeout, event, .. } => f
                .debug_struct("Predicate")
                .field("timeout", timeout)
                .field("event", event)
                .finish(),
        }
    }
}

/// Result of applying a handler: the state to commit plus an optional effect.
pub struct Transition<S, E> {
    /// State to commit.
    pub state: S,
    /// Effect to resolve after the commit.
    pub effect: Option<Effect<S, E>>,
}

impl<S, E> Transition<S, E> {
    /// Transition with no effect.
    pub fn to(state: S) -> Self {
        Self {
            state,
            effect: None,
        }
    }

    /// Transition with an effect.
    pub fn with(state: S, effect: Effect<S, E>) -> Self {
        Self {
            state,
            effect: Some(effect),
        }
    }
}

type Handler<S, E> = Box<dyn Fn(&S, &E) -> Transition<S, E> + Send>;
type Listener<S, E> = Box<dyn Fn(&S, &E) + Send>;

/// A registered predicate effect waiting on its guard or timeout.
struct PendingGuard<S, E> {
    id: Uuid,
    guard: Guard<S>,
    event: E,
}

struct Inner<S, E: Event> {
    state: S,
    handlers: HashMap<E::Kind, Handler<S, E>>,
    listeners: Vec<Listener<S, E>>,
    pending: Vec<PendingGuard<S, E>>,
    depth: usize,
}

/// Generic typed event dispatcher.
///
/// Cheap to clone; clones share state. Handlers, listeners, and `dispatch`
/// run synchronously under an internal lock, so state mutation is serialized
/// the same way whether an event comes from a message callback or a timer.
pub struct Dispatcher<S, E: Event> {
    inner: Arc<Mutex<Inner<S, E>>>,
}

impl<S, E: Event> Clone for Dispatcher<S, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, E> Dispatcher<S, E>
where
    S: Clone + Send + 'static,
    E: Event,
{
    /// Create a dispatcher with an initial state and no handlers.
    pub fn new(initial: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: initial,
                handlers: HashMap::new(),
                listeners: Vec::new(),
                pending: Vec::new(),
                depth: 0,
            })),
        }
    }

    /// Register the handler for one event kind, replacing any previous one.
    pub fn register<F>(&self, kind: E::Kind, handler: F)
    where
        F: Fn(&S, &E) -> Transition<S, E> + Send + 'static,
    {
        self.lock().handlers.insert(kind, Box::new(handler));
    }

    /// Subscribe to every committed state change.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&S, &E) + Send + 'static,
    {
        self.lock().listeners.push(Box::new(listener));
    }

    /// Current state.
    pub fn state(&self) -> S {
        self.lock().state.clone()
    }

    /// Number of guards still pending.
    pub fn pending_guards(&self) -> usize {
        self.lock().pending.len()
    }

    /// Dispatch `event` and return the state once every synchronous cascade
    /// (immediate effects and satisfied guards) has settled. Effects
    /// scheduled for a future tick are not reflected in the returned value.
    ///
    /// # Panics
    ///
    /// Panics if no handler is registered for a dispatched event's kind, or
    /// if the cascade exceeds [`MAX_CASCADE_DEPTH`]. Both are programming
    /// errors in the handler set, not runtime-recoverable conditions.
    pub fn dispatch(&self, event: E) -> S {
        let mut inner = self.lock();
        inner.dispatch_event(self, event);
        inner.state.clone()
    }

    /// Guard-timeout entry point: if `id` is still pending, remove it and
    /// dispatch its event unconditionally. Inert for satisfied guards.
    fn fire_guard_timeout(&self, id: Uuid) {
        let mut inner = self.lock();
        let Some(position) = inner.pending.iter().position(|g| g.id == id) else {
            debug!(%id, "guard timeout after guard was satisfied; ignoring");
            return;
        };
        // Removed before dispatch, same discipline as the satisfied path.
        let pending = inner.pending.remove(position);
        inner.dispatch_event(self, pending.event);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<S, E>> {
        self.inner.lock().expect("dispatcher lock poisoned")
    }
}

impl<S, E> Inner<S, E>
where
    S: Clone + Send + 'static,
    E: Event,
{
    fn dispatch_event(&mut self, handle: &Dispatcher<S, E>, event: E) {
        self.depth += 1;
        assert!(
            self.depth <= MAX_CASCADE_DEPTH,
            "dispatch cascade exceeded {} events; a handler or guard keeps \
             re-arming itself (last kind: {:?})",
            MAX_CASCADE_DEPTH,
            event.kind(),
        );

        let transition = {
            let handler = self
                .handlers
                .get(&event.kind())
                .unwrap_or_else(|| panic!("no handler registered for event kind {:?}", event.kind()));
            handler(&self.state, &event)
        };

        // Commit exactly once, synchronously, before any effect is resolved.
        self.state = transition.state;
        for listener in &self.listeners {
            listener(&self.state, &event);
        }

        match transition.effect {
            None => {}
            Some(Effect::Immediate(next)) => self.dispatch_event(handle, next),
            Some(Effect::Delayed { after, event }) => {
                let weak = Arc::downgrade(&handle.inner);
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    if let Some(inner) = weak.upgrade() {
                        Dispatcher { inner }.dispatch(event);
                    }
                });
            }
            Some(Effect::Predicate {
                guard,
                timeout,
                event,
            }) => {
                let id = Uuid::new_v4();
                self.pending.push(PendingGuard {
                    id,
                    guard,
                    event: event.clone(),
                });
                let weak: Weak<Mutex<Inner<S, E>>> = Arc::downgrade(&handle.inner);
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(inner) = weak.upgrade() {
                        Dispatcher { inner }.fire_guard_timeout(id);
                    }
                });
            }
        }

        // Sweep the pending guards against the newly committed state. Every
        // satisfied guard leaves the pending set before any of the collected
        // events runs, so none can be evaluated twice.
        let mut due = Vec::new();
        let state = &self.state;
        self.pending.retain(|pending| {
            if (pending.guard)(state) {
                due.push(pending.event.clone());
                false
            } else {
                true
            }
        });
        for event in due {
            self.dispatch_event(handle, event);
        }

        self.depth -= 1;
    }
}
