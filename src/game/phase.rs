//! Game Phase Scheduling
//!
//! Drives the shopping/combat timeline through the event dispatcher instead
//! of ad-hoc timers. Each phase-start handler commits the new phase and
//! schedules the next transition as a delayed effect.

use std::time::Duration;

use crate::dispatch::{Dispatcher, Effect, Event, Transition};

/// A named stage of the game timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Before the first phase has started.
    Init,
    /// Players buy and place units.
    Shopping,
    /// Boards fight.
    Combat,
}

/// Dispatcher state for the phase timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseState {
    /// Current phase.
    pub phase: Phase,
}

/// Phase timeline events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseEvent {
    /// The shopping phase begins.
    ShoppingPhaseStart,
    /// The combat phase begins.
    CombatPhaseStart,
}

impl Event for PhaseEvent {
    // Payload-free events are their own discriminant.
    type Kind = PhaseEvent;

    fn kind(&self) -> PhaseEvent {
        *self
    }
}

/// The two-phase game clock.
///
/// Runs independently of any connection; subscribers observe every committed
/// phase change. How notifications reach clients is up to the subscriber.
pub struct PhaseController {
    dispatcher: Dispatcher<PhaseState, PhaseEvent>,
}

impl PhaseController {
    /// Build a controller whose phases last `phase_duration` each.
    pub fn new(phase_duration: Duration) -> Self {
        let dispatcher = Dispatcher::new(PhaseState { phase: Phase::Init });

        dispatcher.register(PhaseEvent::ShoppingPhaseStart, move |_, _| {
            Transition::with(
                PhaseState {
                    phase: Phase::Shopping,
                },
                Effect::Delayed {
                    after: phase_duration,
                    event: PhaseEvent::CombatPhaseStart,
                },
            )
        });

        // Upstream behavior preserved: combat reschedules CombatPhaseStart
        // rather than returning to shopping. Whether the self-loop or a
        // shopping/combat oscillation is intended is unresolved upstream;
        // changing it is a one-line edit here.
        dispatcher.register(PhaseEvent::CombatPhaseStart, move |_, _| {
            Transition::with(
                PhaseState {
                    phase: Phase::Combat,
                },
                Effect::Delayed {
                    after: phase_duration,
                    event: PhaseEvent::CombatPhaseStart,
                },
            )
        });

        Self { dispatcher }
    }

    /// Kick off the timeline with the shopping phase. Returns the committed
    /// state; subsequent transitions run on the dispatcher's timers.
    pub fn start(&self) -> PhaseState {
        self.dispatcher.dispatch(PhaseEvent::ShoppingPhaseStart)
    }

    /// Current phase state.
    pub fn state(&self) -> PhaseState {
        self.dispatcher.state()
    }

    /// Subscribe to every committed phase change.
    pub fn on_phase_change<F>(&self, listener: F)
    where
        F: Fn(&PhaseState, &PhaseEvent) + Send + 'static,
    {
        self.dispatcher.add_listener(listener);
    }

    /// The underlying dispatcher, for instrumentation or manual dispatch.
    pub fn dispatcher(&self) -> &Dispatcher<PhaseState, PhaseEvent> {
        &self.dispatcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_start_enters_shopping() {
        let controller = PhaseController::new(Duration::from_secs(10));
        assert_eq!(controller.state().phase, Phase::Init);

        let state = controller.start();
        assert_eq!(state.phase, Phase::Shopping);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shopping_transitions_to_combat_after_duration() {
        let duration = Duration::from_secs(10);
        let controller = PhaseController::new(duration);
        controller.start();

        tokio::time::sleep(duration - Duration::from_secs(1)).await;
        assert_eq!(controller.state().phase, Phase::Shopping);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(controller.state().phase, Phase::Combat);
    }

    #[tokio::test(start_paused = true)]
    async fn test_combat_reschedules_itself() {
        let duration = Duration::from_secs(10);
        let controller = PhaseController::new(duration);

        let combat_starts = Arc::new(AtomicUsize::new(0));
        let combat_starts2 = combat_starts.clone();
        controller.on_phase_change(move |_, event| {
            if *event == PhaseEvent::CombatPhaseStart {
                combat_starts2.fetch_add(1, Ordering::SeqCst);
            }
        });

        controller.start();

        // Shopping -> combat, then combat keeps re-firing every duration.
        tokio::time::sleep(duration * 3 + Duration::from_secs(1)).await;
        assert_eq!(controller.state().phase, Phase::Combat);
        assert_eq!(combat_starts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_observes_each_commit() {
        let duration = Duration::from_secs(5);
        let controller = PhaseController::new(duration);

        let phases = Arc::new(std::sync::Mutex::new(Vec::new()));
        let phases2 = phases.clone();
        controller.on_phase_change(move |state, _| {
            phases2.lock().unwrap().push(state.phase);
        });

        controller.start();
        tokio::time::sleep(duration + Duration::from_millis(100)).await;

        assert_eq!(*phases.lock().unwrap(), vec![Phase::Shopping, Phase::Combat]);
    }
}
