//! Application state shared across request handlers.

use std::sync::Arc;

use crate::service::ClusterService;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    service: ClusterService,
    max_upload_bytes: usize,
}

impl AppState {
    pub fn new(service: ClusterService, max_upload_bytes: usize) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                service,
                max_upload_bytes,
            }),
        }
    }

    pub fn service(&self) -> &ClusterService {
        &self.inner.service
    }

    /// Largest accepted request body, roster file included.
    pub fn max_upload_bytes(&self) -> usize {
        self.inner.max_upload_bytes
    }
}
