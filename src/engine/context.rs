//! Device context
//!
//! Owns the loaded restoration backend and the fixed-capacity face arena.
//! One execution is in flight at a time; the backend and arena are dropped on
//! [`DeviceContext::release`] or when the context goes out of scope.

use std::time::Instant;

use parking_lot::Mutex;
use tract_onnx::prelude::tract_ndarray::Array4;

use crate::error::ExecutionError;

use super::restorer::Restorer;

/// Backend plus its pre-allocated input buffer.
pub struct LoadedBackend {
    pub restorer: Box<dyn Restorer>,
    /// `[capacity, 3, size, size]`, reused by every execution.
    pub arena: Array4<f32>,
}

/// Process-wide handle on the restoration backend.
pub struct DeviceContext {
    backend: Mutex<Option<LoadedBackend>>,
    capacity: usize,
    size: usize,
    description: String,
}

impl DeviceContext {
    pub fn new(restorer: Box<dyn Restorer>) -> Self {
        let start = Instant::now();
        let capacity = restorer.batch_capacity();
        let size = restorer.canonical_size();
        let description = restorer.describe();
        let arena = Array4::<f32>::zeros((capacity, 3, size, size));
        tracing::info!(
            "Device context ready for {} ({} slots of {}x{}) in {:?}",
            description,
            capacity,
            size,
            size,
            start.elapsed()
        );
        Self {
            backend: Mutex::new(Some(LoadedBackend { restorer, arena })),
            capacity,
            size,
            description,
        }
    }

    pub fn batch_capacity(&self) -> usize {
        self.capacity
    }

    pub fn canonical_size(&self) -> usize {
        self.size
    }

    pub fn describe(&self) -> &str {
        &self.description
    }

    pub fn is_loaded(&self) -> bool {
        self.backend.lock().is_some()
    }

    /// Run `f` with exclusive access to the backend.
    pub fn with_session<T>(
        &self,
        f: impl FnOnce(&mut LoadedBackend) -> Result<T, ExecutionError>,
    ) -> Result<T, ExecutionError> {
        let mut guard = self.backend.lock();
        let backend = guard.as_mut().ok_or(ExecutionError::Released)?;
        f(backend)
    }

    /// Free the backend and arena. Later executions fail with `Released`.
    pub fn release(&self) {
        if self.backend.lock().take().is_some() {
            tracing::info!("Released device context for {}", self.description);
        }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("description", &self.description)
            .field("capacity", &self.capacity)
            .field("size", &self.size)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}
