// Declare submodules
pub mod engine;
pub mod registry;
pub mod session;

// Re-export types for external use
pub use engine::{ContextInfo, NativeEngine, RawHandle, ScriptedEngine};
#[cfg(feature = "native")]
pub use engine::NativeLibrary;
pub use registry::{HandleId, HandleRegistry, RegistrationId, RegistryError};
pub use session::{CancelHandle, GenerationStream, Session, SessionState, StreamEvent};
