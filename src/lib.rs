//! Streaming text generation over a native inference engine.
//!
//! A [`Session`] owns one native engine handle. Blocking native calls run on
//! background threads and streamed output reaches the caller as a
//! [`GenerationStream`] of [`StreamEvent`]s.

pub mod chat;
pub mod config;
pub mod error;
pub mod llm;
pub mod logging;

pub use error::{Result, SessionError};
pub use llm::{CancelHandle, GenerationStream, NativeEngine, ScriptedEngine, Session, SessionState, StreamEvent};
#[cfg(feature = "native")]
pub use llm::NativeLibrary;
