//! Application state shared across request handlers.

use std::sync::Arc;
use std::time::Duration;

use crate::platform::Platform;
use crate::watch::CacheContextRegistry;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    platform: Arc<dyn Platform>,
    caches: Arc<CacheContextRegistry>,
    default_duration: Duration,
}

impl AppState {
    pub fn new(
        platform: Arc<dyn Platform>,
        caches: Arc<CacheContextRegistry>,
        default_duration: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                platform,
                caches,
                default_duration,
            }),
        }
    }

    pub fn platform(&self) -> &dyn Platform {
        self.inner.platform.as_ref()
    }

    pub fn caches(&self) -> &CacheContextRegistry {
        &self.inner.caches
    }

    /// Duration applied to disruptions that declare none.
    pub fn default_duration(&self) -> Duration {
        self.inner.default_duration
    }
}
