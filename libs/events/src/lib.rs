//! # faultline-events
//!
//! User-visible event vocabulary for the fault-injection controller.
//!
//! ## Design Principles
//!
//! - Every notification the controller emits uses a reason from a fixed
//!   vocabulary ([`EventReason`])
//! - Each reason carries its severity and message templates, so callers
//!   never format free-form text
//! - Events from other components (e.g. a kubelet probe failure) share the
//!   same record type but keep their raw reason string
//!
//! ## Reasons
//!
//! Reasons are grouped by the object they are recorded on:
//! - Target reasons (`TargetPod*`, `TargetNode*`, `Recovered*`): recorded on
//!   the target and mirrored on the disruption
//! - Disruption reasons (`Created`, `Finished`, `StuckOnRemoval`, ...):
//!   recorded on the disruption only
//! - `Disrupted`: recorded on a target when an agent starts working on it

mod error;
mod types;

pub use error::EventError;
pub use types::*;
