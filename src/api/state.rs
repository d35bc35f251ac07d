//! API server state

use std::sync::Arc;

use crate::media::MediaStorage;

/// API server state
#[derive(Clone)]
pub struct AppState {
    /// Storage gateway shared by all handlers
    pub storage: Arc<MediaStorage>,
}

impl AppState {
    pub fn new(storage: Arc<MediaStorage>) -> Self {
        Self { storage }
    }
}
