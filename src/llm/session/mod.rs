mod bridge;
mod session;
mod stream;

pub use bridge::{bridge_callback, CallbackRegistration};
pub use session::{Session, SessionState};
pub use stream::{CancelHandle, GenerationStream, StreamEvent};
