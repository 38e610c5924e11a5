// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// Coarse lifecycle phase of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Accepting new work.
    Running,
    /// Graceful stop requested; finishing tracked work, refusing new work.
    Draining,
    /// Forceful stop requested; unwinding as fast as possible.
    Stopping,
    /// The run loop and finalizer have completed.
    Stopped,
}

/// Inputs that move a service between phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    GracefulStop,
    ForcefulStop,
    Terminated,
}

impl Phase {
    /// Transition table. Stop requests are latches: repeating one, or asking
    /// for a graceful stop after a forceful one, leaves the phase unchanged.
    pub fn on(self, event: Event) -> Phase {
        match (self, event) {
            (Phase::Stopped, _) => Phase::Stopped,
            (_, Event::Terminated) => Phase::Stopped,
            (Phase::Running, Event::GracefulStop) => Phase::Draining,
            (Phase::Draining, Event::GracefulStop) => Phase::Draining,
            (Phase::Running | Phase::Draining, Event::ForcefulStop) => Phase::Stopping,
            (Phase::Stopping, Event::GracefulStop | Event::ForcefulStop) => Phase::Stopping,
        }
    }

    /// Whether work that must start before draining begins is still accepted.
    pub fn accepts_new_work(self) -> bool {
        self == Phase::Running
    }

    /// Whether work that may continue during a drain is still accepted.
    pub fn accepts_drain_work(self) -> bool {
        matches!(self, Phase::Running | Phase::Draining)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Running => "running",
            Phase::Draining => "draining",
            Phase::Stopping => "stopping",
            Phase::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Phase::Running, Event::GracefulStop, Phase::Draining)]
    #[case(Phase::Running, Event::ForcefulStop, Phase::Stopping)]
    #[case(Phase::Running, Event::Terminated, Phase::Stopped)]
    #[case(Phase::Draining, Event::GracefulStop, Phase::Draining)]
    #[case(Phase::Draining, Event::ForcefulStop, Phase::Stopping)]
    #[case(Phase::Draining, Event::Terminated, Phase::Stopped)]
    #[case(Phase::Stopping, Event::GracefulStop, Phase::Stopping)]
    #[case(Phase::Stopping, Event::ForcefulStop, Phase::Stopping)]
    #[case(Phase::Stopping, Event::Terminated, Phase::Stopped)]
    #[case(Phase::Stopped, Event::GracefulStop, Phase::Stopped)]
    #[case(Phase::Stopped, Event::ForcefulStop, Phase::Stopped)]
    fn test_transitions(#[case] from: Phase, #[case] event: Event, #[case] to: Phase) {
        assert_eq!(from.on(event), to);
    }

    #[test]
    fn test_acceptance() {
        assert!(Phase::Running.accepts_new_work());
        assert!(!Phase::Draining.accepts_new_work());
        assert!(Phase::Draining.accepts_drain_work());
        assert!(!Phase::Stopping.accepts_drain_work());
        assert!(!Phase::Stopped.accepts_drain_work());
    }
}
