use std::ffi::c_void;
use std::fmt;
use std::os::raw::c_char;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Callback handed to the native engine for streaming generation.
///
/// The native layer calls it once per produced chunk with a pointer/length pair
/// and the opaque `context` it was given. Returning `false` asks the engine to
/// stop producing output; it is the only way to halt a running generation.
pub type TokenCallback = extern "C" fn(chunk: *const c_char, len: usize, context: *mut c_void) -> bool;

/// Releases a buffer previously returned by the native layer.
pub type BufferFree = unsafe extern "C" fn(ptr: *mut c_char, len: usize);

/// Failure sentinel reported by a native call.
#[derive(Debug, Clone, Error)]
#[error("native call `{op}` failed: {reason}")]
pub struct NativeError {
    pub op: &'static str,
    pub reason: String,
}

impl NativeError {
    pub fn new(op: &'static str, reason: impl Into<String>) -> Self {
        Self { op, reason: reason.into() }
    }
}

/// Opaque native engine handle.
///
/// The value is only ever handed back to the engine that produced it; Rust never
/// dereferences it. Access is gated by the handle registry and the owning session.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(usize);

impl RawHandle {
    pub fn from_ptr(ptr: *mut c_void) -> Option<Self> {
        if ptr.is_null() {
            None
        } else {
            Some(Self(ptr as usize))
        }
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    pub fn addr(self) -> usize {
        self.0
    }
}

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawHandle({:#x})", self.0)
    }
}

/// Byte buffer owned by the native layer until dropped.
///
/// Dropping the buffer hands it back to the matching free function exactly once.
pub struct NativeBuffer {
    ptr: *mut c_char,
    len: usize,
    free: BufferFree,
}

// The buffer is uniquely owned; nothing else holds the pointer after hand-off.
unsafe impl Send for NativeBuffer {}

impl NativeBuffer {
    /// Takes ownership of a native buffer.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `len` readable bytes that stay valid until `free` is
    /// called with the same pointer and length, and nobody else may free it.
    pub unsafe fn from_raw(ptr: *mut c_char, len: usize, free: BufferFree) -> Option<Self> {
        if ptr.is_null() {
            None
        } else {
            Some(Self { ptr, len, free })
        }
    }

    /// Wraps bytes allocated on the Rust side, for engines implemented in-process.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let boxed = bytes.into_boxed_slice();
        let len = boxed.len();
        let ptr = Box::into_raw(boxed) as *mut u8 as *mut c_char;
        Self { ptr, len, free: free_boxed_bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies the contents out as text, replacing invalid UTF-8, and releases the buffer.
    pub fn into_string(self) -> String {
        String::from_utf8_lossy(self.as_bytes()).into_owned()
    }
}

impl Drop for NativeBuffer {
    fn drop(&mut self) {
        unsafe { (self.free)(self.ptr, self.len) }
    }
}

unsafe extern "C" fn free_boxed_bytes(ptr: *mut c_char, len: usize) {
    let slice = std::ptr::slice_from_raw_parts_mut(ptr as *mut u8, len);
    drop(Box::from_raw(slice));
}

/// Snapshot of the native context metrics, copied out at read time.
#[derive(Debug, Clone, Serialize)]
pub struct ContextInfo {
    /// Tokens consumed by the last prompt prefill
    pub prompt_tokens: u64,
    /// Tokens produced by the last decode
    pub decode_tokens: u64,
    /// Prefill wall time in microseconds
    pub prompt_micros: u64,
    /// Decode wall time in microseconds
    pub decode_micros: u64,
    /// When the snapshot was taken
    pub captured_at: DateTime<Utc>,
}

impl ContextInfo {
    pub fn new(prompt_tokens: u64, decode_tokens: u64, prompt_micros: u64, decode_micros: u64) -> Self {
        Self {
            prompt_tokens,
            decode_tokens,
            prompt_micros,
            decode_micros,
            captured_at: Utc::now(),
        }
    }

    pub fn prefill_tokens_per_second(&self) -> f64 {
        rate(self.prompt_tokens, self.prompt_micros)
    }

    pub fn decode_tokens_per_second(&self) -> f64 {
        rate(self.decode_tokens, self.decode_micros)
    }
}

fn rate(tokens: u64, micros: u64) -> f64 {
    if micros == 0 {
        0.0
    } else {
        tokens as f64 * 1_000_000.0 / micros as f64
    }
}

/// Operation set of the native inference engine.
///
/// Every call is synchronous. `generate` and `generate_with_callback` block for
/// the whole generation and must only run on a background thread. Implementations
/// are not expected to tolerate concurrent calls on the same handle; callers
/// serialize access per handle.
pub trait NativeEngine: Send + Sync + 'static {
    /// Allocates a handle from a config file path. `None` is the null handle.
    fn create_from_config(&self, config_path: &str) -> Option<RawHandle>;

    /// Applies a JSON configuration payload, passed through unparsed.
    fn configure(&self, handle: RawHandle, json: &str);

    /// Loads model weights. `false` when the native load failed.
    fn load(&self, handle: RawHandle) -> bool;

    /// Runs backend tuning for the loaded model.
    fn tune(&self, handle: RawHandle);

    /// Generates a complete reply. `None` is the failure sentinel.
    fn generate(&self, handle: RawHandle, prompt: &str) -> Option<NativeBuffer>;

    /// Generates a reply, invoking `callback` with `context` for every chunk until
    /// the output ends or the callback returns `false`.
    fn generate_with_callback(
        &self,
        handle: RawHandle,
        prompt: &str,
        callback: TokenCallback,
        context: *mut c_void,
    ) -> Result<(), NativeError>;

    fn tokenize(&self, handle: RawHandle, text: &str) -> Vec<i32>;

    fn detokenize(&self, handle: RawHandle, tokens: &[i32]) -> Option<NativeBuffer>;

    /// Clears the conversation history held by the engine.
    fn reset_history(&self, handle: RawHandle);

    /// Erases history entries in `[begin, end)`.
    fn erase_history(&self, handle: RawHandle, begin: usize, end: usize);

    fn context_info(&self, handle: RawHandle) -> ContextInfo;

    /// Builds a multimodal prompt embedding the given images.
    fn format_vision_prompt(
        &self,
        handle: RawHandle,
        prompt: &str,
        image_paths: &[String],
        width: u32,
        height: u32,
    ) -> Option<NativeBuffer>;

    /// Frees the handle. Must be called exactly once, with no call in flight.
    fn destroy(&self, handle: RawHandle);
}
