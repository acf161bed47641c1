use std::fmt;

use thiserror::Error;

use crate::llm::engine::RawHandle;

/// Process-unique identifier of a registered native handle.
///
/// This plain integer is what crosses thread boundaries; the raw handle is
/// re-attached from the registry on the thread that uses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub(crate) u64);

impl HandleId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Process-unique identifier of a callback registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(pub(crate) u64);

impl RegistrationId {
    pub fn get(self) -> u64 {
        self.0
    }

    /// Encodes the id as the opaque context pointer given to the native layer.
    pub fn as_context(self) -> *mut std::ffi::c_void {
        self.0 as usize as *mut std::ffi::c_void
    }

    /// Decodes a context pointer produced by [`RegistrationId::as_context`].
    pub fn from_context(context: *mut std::ffi::c_void) -> Self {
        Self(context as usize as u64)
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Errors raised by registry lookups
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("native handle {0} not found in registry")]
    NotFound(HandleId),

    #[error("native handle {0} already has an active callback registration")]
    AlreadyActive(HandleId),
}

/// A registered native handle and the callback registration currently using it
#[derive(Debug)]
pub(crate) struct HandleEntry {
    pub handle: RawHandle,
    pub active: Option<RegistrationId>,
}
