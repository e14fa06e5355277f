use std::sync::Arc;

use lfss_core::Engine;

/// Process-wide axum state: the storage engine, shared by every
/// handler for the life of the service as a single `Clone`-cheap
/// bundle passed through `State<AppState>`.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}
