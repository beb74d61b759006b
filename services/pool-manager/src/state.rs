//! Application state shared across request handlers.

use std::sync::Arc;

use crate::allocation::AllocationService;

/// Passed to every handler via axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    allocations: AllocationService,
}

impl AppState {
    pub fn new(allocations: AllocationService) -> Self {
        Self {
            inner: Arc::new(AppStateInner { allocations }),
        }
    }

    pub fn allocations(&self) -> &AllocationService {
        &self.inner.allocations
    }
}
