//! faultline disruption controller library.
//!
//! The crate ships a `faultline-controller` binary; the library surface
//! exists for integration testing and for embedding the controller against
//! another [`platform::Platform`].

pub mod api;
pub mod config;
pub mod controller;
pub mod error;
pub mod ipranges;
pub mod lifecycle;
pub mod metrics;
pub mod model;
pub mod platform;
pub mod recorder;
pub mod reconciler;
pub mod safety;
pub mod state;
pub mod targeting;
pub mod watch;
