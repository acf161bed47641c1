mod native;
mod scripted;
#[cfg(feature = "native")]
mod ffi;

// Re-export the engine interface and its implementations
pub use native::{BufferFree, ContextInfo, NativeBuffer, NativeEngine, NativeError, RawHandle, TokenCallback};
pub use scripted::{ScriptedEngine, UNKNOWN_TOKEN};
#[cfg(feature = "native")]
pub use ffi::NativeLibrary;
