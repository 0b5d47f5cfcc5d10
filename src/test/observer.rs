use parking_lot::Mutex;

use crate::error::FetchError;
use crate::traits::Observer;

/// Keeps everything it's told.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    debug:    Mutex<Vec<String>>,
    warnings: Mutex<Vec<String>>,
    errors:   Mutex<Vec<FetchError>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn debug_messages(&self) -> Vec<String> {
        self.debug.lock().clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().clone()
    }

    pub fn errors(&self) -> Vec<FetchError> {
        self.errors.lock().clone()
    }
}

impl Observer for RecordingObserver {
    fn on_warning(&self, message: &str) {
        self.warnings.lock().push(message.to_string());
    }

    fn on_error(&self, error: &FetchError) {
        self.errors.lock().push(error.clone());
    }

    fn on_debug(&self, message: &str) {
        self.debug.lock().push(message.to_string());
    }
}
