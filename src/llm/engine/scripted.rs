use std::collections::HashMap;
use std::ffi::c_void;
use std::os::raw::c_char;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use super::native::{ContextInfo, NativeBuffer, NativeEngine, NativeError, RawHandle, TokenCallback};

/// Token id returned for bytes outside the vocabulary.
pub const UNKNOWN_TOKEN: i32 = 0;

/// Base address for scripted handles. Never dereferenced.
const HANDLE_BASE: usize = 0x1000;

/// Per-handle state kept by the scripted engine
#[derive(Default)]
struct ScriptedHandle {
    loaded: bool,
    tuned: bool,
    history: Vec<String>,
    active_calls: usize,
    last_info: (u64, u64, u64, u64),
}

/// Deterministic in-process engine.
///
/// Stands in for the native library when it is not linked: replies are either a
/// fixed script or an echo of the prompt words, and the tokenizer maps printable
/// ASCII bytes to their own value. The counters record how the engine was driven so
/// callers can check ordering guarantees (for example that a handle was never
/// destroyed while a generation call was still running on it).
pub struct ScriptedEngine {
    reply: Option<Vec<Vec<u8>>>,
    prefill_delay: Duration,
    chunk_delay: Duration,
    fail_create: bool,
    fail_load: bool,
    fail_after: Option<usize>,
    handles: Mutex<HashMap<usize, ScriptedHandle>>,
    next_handle: AtomicUsize,
    configure_payloads: Mutex<Vec<String>>,
    destroy_count: AtomicUsize,
    chunks_emitted: AtomicUsize,
    destroyed_during_call: AtomicBool,
    overlapping_calls: AtomicBool,
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedEngine {
    /// Creates an engine that echoes the prompt back word by word.
    pub fn new() -> Self {
        Self {
            reply: None,
            prefill_delay: Duration::ZERO,
            chunk_delay: Duration::ZERO,
            fail_create: false,
            fail_load: false,
            fail_after: None,
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicUsize::new(0),
            configure_payloads: Mutex::new(Vec::new()),
            destroy_count: AtomicUsize::new(0),
            chunks_emitted: AtomicUsize::new(0),
            destroyed_during_call: AtomicBool::new(false),
            overlapping_calls: AtomicBool::new(false),
        }
    }

    /// Replies with the given chunks, in order, for every prompt.
    pub fn with_reply<I, S>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reply = Some(chunks.into_iter().map(|c| c.into().into_bytes()).collect());
        self
    }

    /// Replies with raw byte chunks, which need not be valid UTF-8 on their own.
    pub fn with_raw_reply(mut self, chunks: Vec<Vec<u8>>) -> Self {
        self.reply = Some(chunks);
        self
    }

    /// Sleeps once while ingesting the prompt, before the first chunk.
    pub fn with_prefill_delay(mut self, delay: Duration) -> Self {
        self.prefill_delay = delay;
        self
    }

    /// Sleeps before each emitted chunk.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Makes `create_from_config` return the null handle.
    pub fn fail_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn fail_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    /// Fails generation after `chunks` chunks have been emitted.
    pub fn fail_generation_after(mut self, chunks: usize) -> Self {
        self.fail_after = Some(chunks);
        self
    }

    pub fn destroy_count(&self) -> usize {
        self.destroy_count.load(Ordering::SeqCst)
    }

    pub fn chunks_emitted(&self) -> usize {
        self.chunks_emitted.load(Ordering::SeqCst)
    }

    /// Whether `destroy` ever ran while a generation call held the same handle.
    pub fn destroyed_during_call(&self) -> bool {
        self.destroyed_during_call.load(Ordering::SeqCst)
    }

    /// Whether two generation calls ever overlapped on one handle.
    pub fn overlapping_calls(&self) -> bool {
        self.overlapping_calls.load(Ordering::SeqCst)
    }

    pub fn configure_payloads(&self) -> Vec<String> {
        self.configure_payloads.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn history_len(&self, handle: RawHandle) -> usize {
        self.with_handle(handle, |h| h.history.len()).unwrap_or(0)
    }

    pub fn is_tuned(&self, handle: RawHandle) -> bool {
        self.with_handle(handle, |h| h.tuned).unwrap_or(false)
    }

    /// Number of live handles.
    pub fn live_handles(&self) -> usize {
        self.handles.lock().map(|h| h.len()).unwrap_or(0)
    }

    fn with_handle<T>(&self, handle: RawHandle, f: impl FnOnce(&mut ScriptedHandle) -> T) -> Option<T> {
        let mut handles = self.handles.lock().ok()?;
        handles.get_mut(&handle.addr()).map(f)
    }

    fn reply_for(&self, prompt: &str) -> Vec<Vec<u8>> {
        match &self.reply {
            Some(chunks) => chunks.clone(),
            None => {
                let words: Vec<&str> = prompt.split_whitespace().collect();
                let last = words.len().saturating_sub(1);
                words
                    .iter()
                    .enumerate()
                    .map(|(i, w)| if i == last { w.to_string() } else { format!("{} ", w) })
                    .map(String::into_bytes)
                    .collect()
            }
        }
    }

    fn begin_call(&self, handle: RawHandle) -> Result<(), NativeError> {
        let entered = self.with_handle(handle, |h| {
            if !h.loaded {
                return Err(NativeError::new("generate", "model not loaded"));
            }
            h.active_calls += 1;
            Ok(h.active_calls)
        });
        match entered {
            Some(Ok(active)) => {
                if active > 1 {
                    self.overlapping_calls.store(true, Ordering::SeqCst);
                }
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Err(NativeError::new("generate", format!("unknown handle {:?}", handle))),
        }
    }

    /// Ingests the prompt. Returns the prompt token count and the prefill time
    /// in microseconds.
    fn prefill(&self, handle: RawHandle, prompt: &str) -> (u64, u64) {
        let started = Instant::now();
        thread::sleep(self.prefill_delay);
        let tokens = self.tokenize(handle, prompt).len() as u64;
        (tokens, started.elapsed().as_micros() as u64)
    }

    fn end_call(&self, handle: RawHandle, prompt: &str, reply: String, info: (u64, u64, u64, u64)) {
        self.with_handle(handle, |h| {
            h.active_calls = h.active_calls.saturating_sub(1);
            h.history.push(prompt.to_string());
            h.history.push(reply);
            h.last_info = info;
        });
    }
}

fn encode_byte(byte: u8) -> i32 {
    match byte {
        b'\n' | b'\t' | 0x20..=0x7e => byte as i32,
        _ => UNKNOWN_TOKEN,
    }
}

fn decode_token(token: i32) -> char {
    match token {
        0x0a | 0x09 | 0x20..=0x7e => token as u8 as char,
        _ => '?',
    }
}

impl NativeEngine for ScriptedEngine {
    fn create_from_config(&self, config_path: &str) -> Option<RawHandle> {
        if self.fail_create || config_path.trim().is_empty() || config_path.contains('\0') {
            return None;
        }
        let slot = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let handle = RawHandle::from_ptr((HANDLE_BASE + slot * 0x10) as *mut c_void)?;
        self.handles.lock().ok()?.insert(handle.addr(), ScriptedHandle::default());
        debug!(handle = ?handle, config_path, "Scripted handle created");
        Some(handle)
    }

    fn configure(&self, _handle: RawHandle, json: &str) {
        if let Ok(mut payloads) = self.configure_payloads.lock() {
            payloads.push(json.to_string());
        }
    }

    fn load(&self, handle: RawHandle) -> bool {
        if self.fail_load {
            return false;
        }
        self.with_handle(handle, |h| h.loaded = true).is_some()
    }

    fn tune(&self, handle: RawHandle) {
        self.with_handle(handle, |h| h.tuned = true);
    }

    fn generate(&self, handle: RawHandle, prompt: &str) -> Option<NativeBuffer> {
        self.begin_call(handle).ok()?;
        let (prompt_tokens, prompt_micros) = self.prefill(handle, prompt);
        let started = Instant::now();
        let chunks = self.reply_for(prompt);
        let emit = self.fail_after.map_or(chunks.len(), |n| n.min(chunks.len()));
        let mut reply = Vec::new();
        for chunk in chunks.iter().take(emit) {
            thread::sleep(self.chunk_delay);
            reply.extend_from_slice(chunk);
        }
        let text = String::from_utf8_lossy(&reply).into_owned();
        let elapsed = started.elapsed().as_micros() as u64;
        self.end_call(handle, prompt, text, (prompt_tokens, emit as u64, prompt_micros, elapsed));
        if self.fail_after.is_some() {
            return None;
        }
        Some(NativeBuffer::from_vec(reply))
    }

    fn generate_with_callback(
        &self,
        handle: RawHandle,
        prompt: &str,
        callback: TokenCallback,
        context: *mut c_void,
    ) -> Result<(), NativeError> {
        self.begin_call(handle)?;
        let (prompt_tokens, prompt_micros) = self.prefill(handle, prompt);
        let started = Instant::now();
        let mut reply = Vec::new();
        let mut emitted = 0usize;
        let mut stopped = false;

        for chunk in self.reply_for(prompt) {
            if self.fail_after == Some(emitted) {
                break;
            }
            thread::sleep(self.chunk_delay);
            emitted += 1;
            self.chunks_emitted.fetch_add(1, Ordering::SeqCst);
            reply.extend_from_slice(&chunk);
            if !callback(chunk.as_ptr() as *const c_char, chunk.len(), context) {
                stopped = true;
                break;
            }
        }
        let failure = match self.fail_after {
            Some(_) if !stopped => Some(NativeError::new("generate_with_callback", "scripted failure")),
            _ => None,
        };

        let text = String::from_utf8_lossy(&reply).into_owned();
        let elapsed = started.elapsed().as_micros() as u64;
        self.end_call(handle, prompt, text, (prompt_tokens, emitted as u64, prompt_micros, elapsed));
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn tokenize(&self, _handle: RawHandle, text: &str) -> Vec<i32> {
        text.bytes().map(encode_byte).collect()
    }

    fn detokenize(&self, _handle: RawHandle, tokens: &[i32]) -> Option<NativeBuffer> {
        let text: String = tokens.iter().copied().map(decode_token).collect();
        Some(NativeBuffer::from_vec(text.into_bytes()))
    }

    fn reset_history(&self, handle: RawHandle) {
        self.with_handle(handle, |h| h.history.clear());
    }

    fn erase_history(&self, handle: RawHandle, begin: usize, end: usize) {
        self.with_handle(handle, |h| {
            let end = end.min(h.history.len());
            if begin < end {
                h.history.drain(begin..end);
            }
        });
    }

    fn context_info(&self, handle: RawHandle) -> ContextInfo {
        let (prompt, decode, prompt_us, decode_us) = self.with_handle(handle, |h| h.last_info).unwrap_or_default();
        ContextInfo::new(prompt, decode, prompt_us, decode_us)
    }

    fn format_vision_prompt(
        &self,
        _handle: RawHandle,
        prompt: &str,
        image_paths: &[String],
        width: u32,
        height: u32,
    ) -> Option<NativeBuffer> {
        if image_paths.iter().any(|p| p.trim().is_empty()) {
            return None;
        }
        let mut formatted = String::new();
        for path in image_paths {
            if width > 0 && height > 0 {
                formatted.push_str(&format!("<img><hw>{}, {}</hw>{}</img>", height, width, path));
            } else {
                formatted.push_str(&format!("<img>{}</img>", path));
            }
        }
        formatted.push_str(prompt);
        Some(NativeBuffer::from_vec(formatted.into_bytes()))
    }

    fn destroy(&self, handle: RawHandle) {
        if let Ok(mut handles) = self.handles.lock() {
            if let Some(state) = handles.remove(&handle.addr()) {
                if state.active_calls > 0 {
                    self.destroyed_during_call.store(true, Ordering::SeqCst);
                }
            }
        }
        self.destroy_count.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    static COLLECTED: StdMutex<Vec<String>> = StdMutex::new(Vec::new());

    extern "C" fn collect(chunk: *const c_char, len: usize, _context: *mut c_void) -> bool {
        let bytes = unsafe { std::slice::from_raw_parts(chunk as *const u8, len) };
        let mut collected = COLLECTED.lock().unwrap();
        collected.push(String::from_utf8_lossy(bytes).into_owned());
        collected.len() < 2
    }

    #[test]
    fn test_create_rejects_empty_path() {
        let engine = ScriptedEngine::new();
        assert!(engine.create_from_config("").is_none());
        assert!(engine.create_from_config("model/config.json").is_some());
        assert!(ScriptedEngine::new().fail_create().create_from_config("config.json").is_none());
    }

    #[test]
    fn test_callback_stop_halts_generation() {
        let engine = ScriptedEngine::new().with_reply(["a", "b", "c", "d"]);
        let handle = engine.create_from_config("config.json").unwrap();
        assert!(engine.load(handle));

        engine.generate_with_callback(handle, "hi", collect, std::ptr::null_mut()).unwrap();

        assert_eq!(*COLLECTED.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(engine.chunks_emitted(), 2);
    }

    #[test]
    fn test_echo_reply_and_history() {
        let engine = ScriptedEngine::new();
        let handle = engine.create_from_config("config.json").unwrap();
        assert!(engine.generate(handle, "not loaded").is_none());

        engine.load(handle);
        let reply = engine.generate(handle, "hello there world").unwrap().into_string();
        assert_eq!(reply, "hello there world");
        assert_eq!(engine.history_len(handle), 2);

        engine.erase_history(handle, 0, 1);
        assert_eq!(engine.history_len(handle), 1);
        engine.reset_history(handle);
        assert_eq!(engine.history_len(handle), 0);
    }

    #[test]
    fn test_tokenizer_vocabulary() {
        let engine = ScriptedEngine::new();
        let handle = engine.create_from_config("config.json").unwrap();
        let tokens = engine.tokenize(handle, "Hi!\n");
        assert_eq!(tokens, vec![72, 105, 33, 10]);
        assert_eq!(engine.tokenize(handle, "é"), vec![UNKNOWN_TOKEN, UNKNOWN_TOKEN]);
        assert_eq!(engine.detokenize(handle, &[72, 105, 999]).unwrap().into_string(), "Hi?");
    }

    #[test]
    fn test_vision_prompt_format() {
        let engine = ScriptedEngine::new();
        let handle = engine.create_from_config("config.json").unwrap();
        let paths = vec!["a.png".to_string()];
        let prompt = engine.format_vision_prompt(handle, "describe", &paths, 448, 224).unwrap();
        assert_eq!(prompt.into_string(), "<img><hw>224, 448</hw>a.png</img>describe");

        let prompt = engine.format_vision_prompt(handle, "describe", &paths, 0, 0).unwrap();
        assert_eq!(prompt.into_string(), "<img>a.png</img>describe");

        assert!(engine.format_vision_prompt(handle, "x", &["".to_string()], 0, 0).is_none());
    }

    #[test]
    fn test_context_info_times_prefill_and_decode() {
        let engine = ScriptedEngine::new().with_reply(["a", "b"]).with_prefill_delay(Duration::from_millis(30));
        let handle = engine.create_from_config("config.json").unwrap();
        engine.load(handle);

        engine.generate(handle, "four").unwrap();
        let info = engine.context_info(handle);
        assert_eq!(info.prompt_tokens, 4);
        assert_eq!(info.decode_tokens, 2);
        assert!(info.prompt_micros >= 30_000, "prefill took {}us", info.prompt_micros);
        // Prefill time is not counted as decode time
        assert!(info.decode_micros < info.prompt_micros);
    }

    #[test]
    fn test_destroy_is_counted() {
        let engine = ScriptedEngine::new();
        let handle = engine.create_from_config("config.json").unwrap();
        engine.destroy(handle);
        assert_eq!(engine.destroy_count(), 1);
        assert_eq!(engine.live_handles(), 0);
        assert!(!engine.destroyed_during_call());
    }
}
