//! Audio host abstraction
//!
//! The capture engine talks to the platform only through [`AudioHost`]:
//! microphone access, processor registration and graph construction.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

use super::processor::GraphStages;
use crate::Result;

/// Outcome of registering a processing module
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    /// The module was registered earlier in this process
    #[error("processor '{0}' has already been loaded")]
    AlreadyRegistered(String),

    /// The module could not be loaded
    #[error("failed to load processor: {0}")]
    Failed(String),
}

/// An acquired microphone
pub trait Microphone: Send {
    /// Device label for logging
    fn label(&self) -> String;

    /// Release the device
    fn stop(&mut self);
}

/// A running audio graph
pub trait ActiveGraph: Send {
    /// Stop all streams and disconnect every stage
    ///
    /// Signals the audio context and returns without waiting for it.
    fn disconnect(&mut self);
}

/// Platform audio services used by the capture engine
#[async_trait]
pub trait AudioHost: Send + Sync {
    /// Host name for logging
    fn name(&self) -> &str;

    /// Ask for microphone access
    ///
    /// # Errors
    ///
    /// Returns `Error::Permission` if access is denied or no device exists
    async fn request_microphone(&self) -> Result<Box<dyn Microphone>>;

    /// Register the processing module under `name`
    ///
    /// # Errors
    ///
    /// Returns `RegisterError::AlreadyRegistered` on repeat registration
    fn register_processor(&self, name: &str) -> std::result::Result<(), RegisterError>;

    /// Wire source → analyser → processor → destination and start it
    ///
    /// The host owns `microphone` from here on and must release it on failure.
    /// Waiting for the audio context must not block the calling task.
    ///
    /// # Errors
    ///
    /// Returns `Error::AudioInit` if the graph cannot be built
    async fn build_graph(
        &self,
        microphone: Box<dyn Microphone>,
        stages: GraphStages,
    ) -> Result<Box<dyn ActiveGraph>>;
}

/// Names of processing modules registered in this process
#[derive(Debug, Default)]
pub struct ProcessorRegistry {
    registered: Mutex<HashSet<String>>,
}

impl ProcessorRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a registration
    ///
    /// # Errors
    ///
    /// Returns `RegisterError::AlreadyRegistered` if `name` is already known
    pub fn register(&self, name: &str) -> std::result::Result<(), RegisterError> {
        let mut registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
        if registered.insert(name.to_string()) {
            Ok(())
        } else {
            Err(RegisterError::AlreadyRegistered(name.to_string()))
        }
    }

    /// Whether `name` has been registered
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.registered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
    }
}
