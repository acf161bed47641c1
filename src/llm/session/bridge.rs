//! Translation from the native "chunk produced" callback to stream events.
//!
//! The native engine calls [`bridge_callback`] synchronously on its own thread,
//! once per produced chunk, with the registration id as its opaque context. The
//! bridge is the single place where native callbacks become [`StreamEvent`]s, and
//! the only cancellation path: a cancelled registration declines the next chunk.

use std::ffi::c_void;
use std::os::raw::c_char;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use super::stream::StreamEvent;
use crate::llm::registry::{HandleId, HandleRegistry, RegistrationId};

/// Live link between one generation call and its consumer stream.
pub struct CallbackRegistration {
    id: RegistrationId,
    handle_id: HandleId,
    events: UnboundedSender<StreamEvent>,
    // Set once per generation, never cleared
    cancelled: AtomicBool,
    // Trailing bytes of a character split across chunks
    pending: Mutex<Vec<u8>>,
    delivered: AtomicUsize,
}

impl CallbackRegistration {
    pub fn new(id: RegistrationId, handle_id: HandleId, events: UnboundedSender<StreamEvent>) -> Self {
        Self {
            id,
            handle_id,
            events,
            cancelled: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            delivered: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> RegistrationId {
        self.id
    }

    pub fn handle_id(&self) -> HandleId {
        self.handle_id
    }

    /// Requests cancellation. The native call stops at its next callback.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            debug!(registration_id = %self.id, "Cancellation requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Number of chunk events handed to the consumer so far.
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::Acquire)
    }

    /// Accepts one native chunk. Returns whether the engine should continue.
    pub(crate) fn deliver(&self, bytes: &[u8]) -> bool {
        if self.is_cancelled() {
            return false;
        }
        let text = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.extend_from_slice(bytes);
            take_utf8_prefix(&mut pending)
        };
        if !text.is_empty() && !self.send_token(text) {
            return false;
        }
        !self.is_cancelled()
    }

    /// Emits whatever bytes are still pending once the native call has returned.
    pub(crate) fn flush(&self) {
        let tail = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *pending)
        };
        if !tail.is_empty() && !self.is_cancelled() {
            self.send_token(String::from_utf8_lossy(&tail).into_owned());
        }
    }

    fn send_token(&self, text: String) -> bool {
        if self.events.send(StreamEvent::Token(text)).is_err() {
            // Consumer detached; treat as cancellation
            warn!(registration_id = %self.id, "Stream consumer dropped, cancelling generation");
            self.cancel();
            return false;
        }
        self.delivered.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Sends the terminal event. Failure only means nobody is listening anymore.
    pub(crate) fn finish(&self, event: StreamEvent) {
        debug_assert!(event.is_terminal());
        if self.events.send(event).is_err() {
            debug!(registration_id = %self.id, "Terminal event dropped, consumer already detached");
        }
    }
}

/// Removes and returns the longest decodable prefix, replacing invalid
/// sequences with U+FFFD and keeping an incomplete trailing character.
fn take_utf8_prefix(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        let (valid, invalid) = match std::str::from_utf8(pending) {
            Ok(_) => (pending.len(), None),
            Err(e) => (e.valid_up_to(), Some(e.error_len())),
        };
        out.push_str(&String::from_utf8_lossy(&pending[..valid]));
        match invalid {
            None => {
                pending.clear();
                return out;
            }
            Some(Some(bad)) => {
                out.push(char::REPLACEMENT_CHARACTER);
                pending.drain(..valid + bad);
            }
            Some(None) => {
                pending.drain(..valid);
                return out;
            }
        }
    }
}

/// Callback handed to the native engine for every streaming generation.
///
/// The context is the registration id. Unknown or cancelled registrations stop
/// the engine. Panics never unwind into the native caller.
pub extern "C" fn bridge_callback(chunk: *const c_char, len: usize, context: *mut c_void) -> bool {
    let id = RegistrationId::from_context(context);
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let Some(registration) = HandleRegistry::global().registration(id) else {
            warn!(registration_id = %id, "Native callback for unknown registration, stopping");
            return false;
        };
        if registration.is_cancelled() {
            return false;
        }
        let bytes = if chunk.is_null() || len == 0 {
            &[][..]
        } else {
            unsafe { std::slice::from_raw_parts(chunk as *const u8, len) }
        };
        registration.deliver(bytes)
    }));
    result.unwrap_or(false)
}
