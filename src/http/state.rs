use crate::processor::Processor;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub processor: Processor,
}

impl AppState {
    pub fn new(processor: Processor) -> Self {
        Self { processor }
    }
}
