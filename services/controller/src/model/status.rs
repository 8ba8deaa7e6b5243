//! Injection status state machine.
//!
//! The aggregate status of a disruption belongs to one of three families
//! (not injected, partially injected, injected). While agents run, the
//! family follows agent readiness. Once the agents stop, the family is kept
//! and only the phase changes: *Paused* when the stop is temporary (the
//! disruption is still live), *Previously* when it is definitive (expired or
//! deleted). Previously states are absorbing.

use serde::{Deserialize, Serialize};

/// Aggregate injection status of a disruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InjectionStatus {
    #[default]
    NotInjected,
    PartiallyInjected,
    Injected,
    PausedPartiallyInjected,
    PausedInjected,
    PreviouslyNotInjected,
    PreviouslyPartiallyInjected,
    PreviouslyInjected,
}

/// Why (and whether) a disruption's agents stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationStatus {
    NotTerminated,

    /// Agents are gone but the disruption is still live.
    TemporarilyTerminated,

    /// Duration elapsed or deletion requested.
    DefinitivelyTerminated,
}

/// Status family, independent of the paused/previously phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusFamily {
    NotInjected,
    PartiallyInjected,
    Injected,
}

impl InjectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InjectionStatus::NotInjected => "NotInjected",
            InjectionStatus::PartiallyInjected => "PartiallyInjected",
            InjectionStatus::Injected => "Injected",
            InjectionStatus::PausedPartiallyInjected => "PausedPartiallyInjected",
            InjectionStatus::PausedInjected => "PausedInjected",
            InjectionStatus::PreviouslyNotInjected => "PreviouslyNotInjected",
            InjectionStatus::PreviouslyPartiallyInjected => "PreviouslyPartiallyInjected",
            InjectionStatus::PreviouslyInjected => "PreviouslyInjected",
        }
    }

    pub fn family(self) -> StatusFamily {
        match self {
            InjectionStatus::NotInjected | InjectionStatus::PreviouslyNotInjected => {
                StatusFamily::NotInjected
            }
            InjectionStatus::PartiallyInjected
            | InjectionStatus::PausedPartiallyInjected
            | InjectionStatus::PreviouslyPartiallyInjected => StatusFamily::PartiallyInjected,
            InjectionStatus::Injected
            | InjectionStatus::PausedInjected
            | InjectionStatus::PreviouslyInjected => StatusFamily::Injected,
        }
    }

    pub fn is_previously(self) -> bool {
        matches!(
            self,
            InjectionStatus::PreviouslyNotInjected
                | InjectionStatus::PreviouslyPartiallyInjected
                | InjectionStatus::PreviouslyInjected
        )
    }

    pub fn is_paused(self) -> bool {
        matches!(
            self,
            InjectionStatus::PausedPartiallyInjected | InjectionStatus::PausedInjected
        )
    }

    /// Whether the disruption is live but some expected injection is missing.
    pub fn not_fully_injected(self) -> bool {
        matches!(
            self,
            InjectionStatus::NotInjected
                | InjectionStatus::PartiallyInjected
                | InjectionStatus::PausedPartiallyInjected
                | InjectionStatus::PausedInjected
        )
    }

    /// Status after a termination verdict.
    ///
    /// Every (status, termination) pair has exactly one successor.
    pub fn on_termination(self, termination: TerminationStatus) -> InjectionStatus {
        use InjectionStatus as S;
        use TerminationStatus as T;

        match (self, termination) {
            (current, T::NotTerminated) => current,

            (S::NotInjected, T::TemporarilyTerminated) => S::NotInjected,
            (S::PartiallyInjected, T::TemporarilyTerminated) => S::PausedPartiallyInjected,
            (S::Injected, T::TemporarilyTerminated) => S::PausedInjected,
            (S::PausedPartiallyInjected, T::TemporarilyTerminated) => S::PausedPartiallyInjected,
            (S::PausedInjected, T::TemporarilyTerminated) => S::PausedInjected,
            (S::PreviouslyNotInjected, T::TemporarilyTerminated) => S::PreviouslyNotInjected,
            (S::PreviouslyPartiallyInjected, T::TemporarilyTerminated) => {
                S::PreviouslyPartiallyInjected
            }
            (S::PreviouslyInjected, T::TemporarilyTerminated) => S::PreviouslyInjected,

            (S::NotInjected, T::DefinitivelyTerminated) => S::PreviouslyNotInjected,
            (S::PartiallyInjected, T::DefinitivelyTerminated) => S::PreviouslyPartiallyInjected,
            (S::Injected, T::DefinitivelyTerminated) => S::PreviouslyInjected,
            (S::PausedPartiallyInjected, T::DefinitivelyTerminated) => {
                S::PreviouslyPartiallyInjected
            }
            (S::PausedInjected, T::DefinitivelyTerminated) => S::PreviouslyInjected,
            (S::PreviouslyNotInjected, T::DefinitivelyTerminated) => S::PreviouslyNotInjected,
            (S::PreviouslyPartiallyInjected, T::DefinitivelyTerminated) => {
                S::PreviouslyPartiallyInjected
            }
            (S::PreviouslyInjected, T::DefinitivelyTerminated) => S::PreviouslyInjected,
        }
    }
}

/// Per-target injection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TargetInjectionStatus {
    #[default]
    NotInjected,
    Injected,
}
