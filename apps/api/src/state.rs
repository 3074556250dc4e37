use crate::screening::service::ScreeningService;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    /// Orchestrator owning the stores, matcher, audit writer and live runs.
    pub screening: ScreeningService,
}
