//! Controller error taxonomy.
//!
//! Errors fall in a few classes with distinct handling:
//! - user errors (invalid spec or selector): surfaced as events, not retried
//! - conflicts: the object moved under us, the next pass sees the new state
//! - everything else: retried after a jittered delay

use faultline_reconcile::ReconcileError;
use thiserror::Error;

use crate::model::{SelectorError, SpecError};
use crate::platform::PlatformError;
use crate::safety::SafetyNetError;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid disruption: {0}")]
    Spec(#[from] SpecError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error("safety net evaluation failed: {0}")]
    SafetyNet(#[from] SafetyNetError),
}

impl ControllerError {
    /// Errors the user has to fix; retrying cannot help.
    pub fn is_user_error(&self) -> bool {
        matches!(self, ControllerError::Spec(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ControllerError::Platform(e) if e.is_conflict())
    }
}

impl From<SelectorError> for ControllerError {
    fn from(err: SelectorError) -> Self {
        ControllerError::Spec(SpecError::Selector(err))
    }
}

pub type ControllerResult<T> = Result<T, ControllerError>;
