//! Bindings to the native inference library.
//!
//! Strings cross the boundary as pointer/length pairs. Buffers returned by the
//! library belong to the caller and go back through `llm_free_buffer` or
//! `llm_free_tokens` exactly once.

use std::ffi::c_void;
use std::os::raw::c_char;

use tracing::{debug, warn};

use super::native::{ContextInfo, NativeBuffer, NativeEngine, NativeError, RawHandle, TokenCallback};

/// Borrowed string slice in the layout the library expects.
#[repr(C)]
struct NativeStr {
    ptr: *const c_char,
    len: usize,
}

impl NativeStr {
    fn new(text: &str) -> Self {
        Self { ptr: text.as_ptr() as *const c_char, len: text.len() }
    }
}

#[repr(C)]
#[derive(Default)]
struct RawContextInfo {
    prompt_tokens: u64,
    decode_tokens: u64,
    prompt_micros: u64,
    decode_micros: u64,
}

#[link(name = "llm_native")]
extern "C" {
    fn llm_create_from_config(path: *const c_char, path_len: usize) -> *mut c_void;
    fn llm_configure(handle: *mut c_void, json: *const c_char, json_len: usize);
    fn llm_load(handle: *mut c_void) -> bool;
    fn llm_tune(handle: *mut c_void);
    fn llm_generate(
        handle: *mut c_void,
        prompt: *const c_char,
        prompt_len: usize,
        out_len: *mut usize,
    ) -> *mut c_char;
    fn llm_generate_with_callback(
        handle: *mut c_void,
        prompt: *const c_char,
        prompt_len: usize,
        callback: TokenCallback,
        context: *mut c_void,
    );
    fn llm_tokenize(
        handle: *mut c_void,
        text: *const c_char,
        text_len: usize,
        out_len: *mut usize,
    ) -> *mut i32;
    fn llm_detokenize(
        handle: *mut c_void,
        tokens: *const i32,
        n_tokens: usize,
        out_len: *mut usize,
    ) -> *mut c_char;
    fn llm_reset_history(handle: *mut c_void);
    fn llm_erase_history(handle: *mut c_void, begin: usize, end: usize);
    fn llm_get_context_info(handle: *mut c_void, out: *mut RawContextInfo);
    fn llm_format_vision_prompt(
        handle: *mut c_void,
        prompt: *const c_char,
        prompt_len: usize,
        image_paths: *const NativeStr,
        n_images: usize,
        width: u32,
        height: u32,
        out_len: *mut usize,
    ) -> *mut c_char;
    fn llm_destroy(handle: *mut c_void);
    fn llm_free_buffer(ptr: *mut c_char, len: usize);
    fn llm_free_tokens(ptr: *mut i32, len: usize);
}

/// The linked native library.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeLibrary;

impl NativeLibrary {
    pub fn new() -> Self {
        Self
    }
}

fn take_buffer(ptr: *mut c_char, len: usize) -> Option<NativeBuffer> {
    unsafe { NativeBuffer::from_raw(ptr, len, llm_free_buffer) }
}

impl NativeEngine for NativeLibrary {
    fn create_from_config(&self, config_path: &str) -> Option<RawHandle> {
        let ptr = unsafe { llm_create_from_config(config_path.as_ptr() as *const c_char, config_path.len()) };
        RawHandle::from_ptr(ptr)
    }

    fn configure(&self, handle: RawHandle, json: &str) {
        unsafe { llm_configure(handle.as_ptr(), json.as_ptr() as *const c_char, json.len()) }
    }

    fn load(&self, handle: RawHandle) -> bool {
        unsafe { llm_load(handle.as_ptr()) }
    }

    fn tune(&self, handle: RawHandle) {
        unsafe { llm_tune(handle.as_ptr()) }
    }

    fn generate(&self, handle: RawHandle, prompt: &str) -> Option<NativeBuffer> {
        let mut out_len = 0usize;
        let ptr = unsafe {
            llm_generate(handle.as_ptr(), prompt.as_ptr() as *const c_char, prompt.len(), &mut out_len)
        };
        take_buffer(ptr, out_len)
    }

    fn generate_with_callback(
        &self,
        handle: RawHandle,
        prompt: &str,
        callback: TokenCallback,
        context: *mut c_void,
    ) -> Result<(), NativeError> {
        unsafe {
            llm_generate_with_callback(
                handle.as_ptr(),
                prompt.as_ptr() as *const c_char,
                prompt.len(),
                callback,
                context,
            )
        };
        Ok(())
    }

    fn tokenize(&self, handle: RawHandle, text: &str) -> Vec<i32> {
        let mut out_len = 0usize;
        let ptr = unsafe {
            llm_tokenize(handle.as_ptr(), text.as_ptr() as *const c_char, text.len(), &mut out_len)
        };
        if ptr.is_null() {
            warn!("llm_tokenize returned null");
            return Vec::new();
        }
        let tokens = unsafe { std::slice::from_raw_parts(ptr, out_len) }.to_vec();
        unsafe { llm_free_tokens(ptr, out_len) };
        tokens
    }

    fn detokenize(&self, handle: RawHandle, tokens: &[i32]) -> Option<NativeBuffer> {
        let mut out_len = 0usize;
        let ptr = unsafe { llm_detokenize(handle.as_ptr(), tokens.as_ptr(), tokens.len(), &mut out_len) };
        take_buffer(ptr, out_len)
    }

    fn reset_history(&self, handle: RawHandle) {
        unsafe { llm_reset_history(handle.as_ptr()) }
    }

    fn erase_history(&self, handle: RawHandle, begin: usize, end: usize) {
        unsafe { llm_erase_history(handle.as_ptr(), begin, end) }
    }

    fn context_info(&self, handle: RawHandle) -> ContextInfo {
        let mut raw = RawContextInfo::default();
        unsafe { llm_get_context_info(handle.as_ptr(), &mut raw) };
        ContextInfo::new(raw.prompt_tokens, raw.decode_tokens, raw.prompt_micros, raw.decode_micros)
    }

    fn format_vision_prompt(
        &self,
        handle: RawHandle,
        prompt: &str,
        image_paths: &[String],
        width: u32,
        height: u32,
    ) -> Option<NativeBuffer> {
        // Keeps the borrowed path slices alive for the duration of the call
        let paths: Vec<NativeStr> = image_paths.iter().map(|p| NativeStr::new(p)).collect();
        let mut out_len = 0usize;
        let ptr = unsafe {
            llm_format_vision_prompt(
                handle.as_ptr(),
                prompt.as_ptr() as *const c_char,
                prompt.len(),
                paths.as_ptr(),
                paths.len(),
                width,
                height,
                &mut out_len,
            )
        };
        take_buffer(ptr, out_len)
    }

    fn destroy(&self, handle: RawHandle) {
        debug!(handle = ?handle, "Destroying native handle");
        unsafe { llm_destroy(handle.as_ptr()) }
    }
}
