use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::bridge::CallbackRegistration;
use super::stream::{self, GenerationJob, GenerationStream, Worker};
use crate::error::{Result, SessionError};
use crate::llm::engine::{ContextInfo, NativeEngine, RawHandle};
use crate::llm::registry::{HandleId, HandleRegistry};

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Native handle exists, model not loaded yet
    Created,
    /// Loaded and ready for a generation
    Idle,
    /// A generation is running on a background thread
    Busy,
    /// Handle released; terminal
    Disposed,
}

impl SessionState {
    pub fn is_loaded(self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Busy)
    }
}

struct Lifecycle {
    state: SessionState,
    worker: Option<Worker>,
    vision_size: (u32, u32),
}

fn lock(lifecycle: &Mutex<Lifecycle>) -> MutexGuard<'_, Lifecycle> {
    lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Which checks an operation needs before touching the native handle
#[derive(Clone, Copy)]
struct Requires {
    loaded: bool,
}

/// One native engine instance with its lifecycle.
///
/// Blocking work (`generate`, the streaming variants) runs on a dedicated
/// background thread; at most one such call is in flight per session. Every
/// other operation is synchronous and is checked against the current state
/// first: `Disposed`, then `NotLoaded`, then `Busy`.
///
/// Dropping the session disposes it.
pub struct Session<E: NativeEngine> {
    id: Uuid,
    engine: Arc<E>,
    registry: &'static HandleRegistry,
    handle_id: HandleId,
    config_path: String,
    lifecycle: Arc<Mutex<Lifecycle>>,
}

impl<E: NativeEngine> Session<E> {
    /// Creates a native handle from a config file and registers it.
    pub fn create(engine: Arc<E>, config_path: impl Into<String>) -> Result<Self> {
        let config_path = config_path.into();
        let handle = engine
            .create_from_config(&config_path)
            .ok_or_else(|| SessionError::CreateFailed { config_path: config_path.clone() })?;

        let registry = HandleRegistry::global();
        let handle_id = registry.register(handle);
        let id = Uuid::new_v4();
        info!(session_id = %id, handle_id = %handle_id, "Created session from {}", config_path);

        Ok(Self {
            id,
            engine,
            registry,
            handle_id,
            config_path,
            lifecycle: Arc::new(Mutex::new(Lifecycle {
                state: SessionState::Created,
                worker: None,
                vision_size: (0, 0),
            })),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn handle_id(&self) -> HandleId {
        self.handle_id
    }

    pub fn config_path(&self) -> &str {
        &self.config_path
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn state(&self) -> SessionState {
        lock(&self.lifecycle).state
    }

    pub fn is_loaded(&self) -> bool {
        self.state().is_loaded()
    }

    pub fn is_busy(&self) -> bool {
        self.state() == SessionState::Busy
    }

    /// Locks the lifecycle and checks the state in the documented order.
    ///
    /// The guard is held across the synchronous native call that follows, so no
    /// generation can start on the handle in the meantime.
    fn checked(&self, requires: Requires) -> Result<(MutexGuard<'_, Lifecycle>, RawHandle)> {
        let lifecycle = lock(&self.lifecycle);
        match lifecycle.state {
            SessionState::Disposed => return Err(SessionError::Disposed),
            state if requires.loaded && !state.is_loaded() => return Err(SessionError::NotLoaded),
            SessionState::Busy => return Err(SessionError::Busy),
            _ => {}
        }
        let handle = self.registry.lookup(self.handle_id)?;
        Ok((lifecycle, handle))
    }

    /// Applies a JSON configuration payload. Allowed before and after load.
    pub fn configure(&self, json: &str) -> Result<()> {
        let (_guard, handle) = self.checked(Requires { loaded: false })?;
        debug!(session_id = %self.id, "Applying native configuration ({} bytes)", json.len());
        self.engine.configure(handle, json);
        Ok(())
    }

    /// Toggles the chat template's thinking mode.
    pub fn set_thinking(&self, enabled: bool) -> Result<()> {
        let payload = serde_json::json!({ "jinja": { "context": { "enable_thinking": enabled } } });
        self.configure(&payload.to_string())
    }

    /// Loads the model weights.
    ///
    /// Returns `Ok(false)` when the native load failed; the session then stays
    /// in `Created` and load may be retried. Loading an already loaded session
    /// is a no-op returning `Ok(true)`.
    pub fn load(&self) -> Result<bool> {
        let mut lifecycle = lock(&self.lifecycle);
        match lifecycle.state {
            SessionState::Disposed => return Err(SessionError::Disposed),
            SessionState::Idle | SessionState::Busy => return Ok(true),
            SessionState::Created => {}
        }
        let handle = self.registry.lookup(self.handle_id)?;

        info!(session_id = %self.id, "Loading model from {}", self.config_path);
        if self.engine.load(handle) {
            lifecycle.state = SessionState::Idle;
            info!(session_id = %self.id, "Model loaded");
            Ok(true)
        } else {
            warn!(session_id = %self.id, "Native load failed for {}", self.config_path);
            Ok(false)
        }
    }

    /// Runs backend tuning on the loaded model.
    pub fn tune(&self) -> Result<()> {
        let (_guard, handle) = self.checked(Requires { loaded: true })?;
        info!(session_id = %self.id, "Tuning backend");
        self.engine.tune(handle);
        Ok(())
    }

    /// Sets the image size passed along with vision prompts. `0` keeps the
    /// engine default.
    pub fn set_vision_size(&self, width: u32, height: u32) -> Result<()> {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.state == SessionState::Disposed {
            return Err(SessionError::Disposed);
        }
        lifecycle.vision_size = (width, height);
        Ok(())
    }

    /// Generates a complete reply without streaming.
    ///
    /// The native call runs on a background thread; the session is `Busy` until
    /// it returns.
    pub async fn generate(&self, prompt: impl Into<String>) -> Result<String> {
        let prompt = prompt.into();
        let (reply_tx, reply_rx) = oneshot::channel();

        let previous = {
            let (mut lifecycle, _) = self.checked(Requires { loaded: true })?;
            let thread = stream::spawn_blocking_generate(
                Arc::clone(&self.engine),
                self.registry,
                self.handle_id,
                prompt,
                self.settler(),
                reply_tx,
            )
            .map_err(|e| SessionError::GenerationFailed(format!("failed to spawn generation thread: {}", e)))?;
            lifecycle.state = SessionState::Busy;
            lifecycle.worker.replace(Worker { registration: None, thread })
        };
        if let Some(previous) = previous {
            previous.join();
        }

        reply_rx
            .await
            .map_err(|_| SessionError::GenerationFailed("generation worker exited without a reply".to_string()))?
    }

    /// Starts a streaming generation.
    ///
    /// Returns immediately; tokens arrive on the returned stream, which always
    /// ends with exactly one terminal event.
    pub fn generate_stream(&self, prompt: impl Into<String>) -> Result<GenerationStream> {
        let prompt = prompt.into();
        self.start_stream(move |_| Ok(GenerationJob::Text { prompt }))
    }

    /// Starts a streaming generation over a prompt that embeds images.
    ///
    /// The multimodal prompt is built on the background thread; a native
    /// formatting failure ends the stream with an `Error` event.
    pub fn vision_generate_stream<I, S>(&self, prompt: impl Into<String>, image_paths: I) -> Result<GenerationStream>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let prompt = prompt.into();
        let image_paths: Vec<String> = image_paths.into_iter().map(Into::into).collect();
        self.start_stream(move |lifecycle| {
            if image_paths.is_empty() {
                return Err(SessionError::InvalidArgument("at least one image path is required".to_string()));
            }
            let (width, height) = lifecycle.vision_size;
            Ok(GenerationJob::Vision { prompt, image_paths, width, height })
        })
    }

    /// Builds the job only after the state checks pass, so argument errors
    /// never mask `Disposed`, `NotLoaded` or `Busy`.
    fn start_stream<F>(&self, build_job: F) -> Result<GenerationStream>
    where
        F: FnOnce(&Lifecycle) -> Result<GenerationJob>,
    {
        let (mut lifecycle, _) = self.checked(Requires { loaded: true })?;
        let job = build_job(&*lifecycle)?;

        let (events_tx, events_rx) = unbounded_channel();
        let registration = Arc::new(CallbackRegistration::new(
            self.registry.next_registration_id(),
            self.handle_id,
            events_tx,
        ));
        let thread = stream::spawn_stream(
            Arc::clone(&self.engine),
            self.registry,
            Arc::clone(&registration),
            job,
            self.settler(),
        )
        .map_err(|e| SessionError::GenerationFailed(format!("failed to spawn generation thread: {}", e)))?;

        lifecycle.state = SessionState::Busy;
        let previous = lifecycle.worker.replace(Worker { registration: Some(Arc::clone(&registration)), thread });
        drop(lifecycle);
        if let Some(previous) = previous {
            previous.join();
        }

        debug!(session_id = %self.id, registration_id = %registration.id(), "Started streaming generation");
        Ok(GenerationStream::new(registration, events_rx))
    }

    /// Returns the session to `Idle` once a background call is done. Leaves a
    /// disposed session alone.
    fn settler(&self) -> impl FnOnce() + Send + 'static {
        let lifecycle = Arc::clone(&self.lifecycle);
        let session_id = self.id;
        move || {
            let mut lifecycle = lock(&lifecycle);
            if lifecycle.state == SessionState::Busy {
                lifecycle.state = SessionState::Idle;
                debug!(session_id = %session_id, "Generation finished, session idle");
            }
        }
    }

    /// Requests cancellation of the running streaming generation.
    ///
    /// Returns whether a streaming generation was signalled. The non-streaming
    /// `generate` cannot be interrupted and always runs to completion.
    pub fn cancel(&self) -> bool {
        let lifecycle = lock(&self.lifecycle);
        if lifecycle.state != SessionState::Busy {
            return false;
        }
        lifecycle.worker.as_ref().map(Worker::cancel).unwrap_or(false)
    }

    pub fn tokenizer_encode(&self, text: &str) -> Result<Vec<i32>> {
        let (_guard, handle) = self.checked(Requires { loaded: true })?;
        Ok(self.engine.tokenize(handle, text))
    }

    pub fn tokenizer_decode(&self, tokens: &[i32]) -> Result<String> {
        let (_guard, handle) = self.checked(Requires { loaded: true })?;
        self.engine
            .detokenize(handle, tokens)
            .map(|buffer| buffer.into_string())
            .ok_or_else(|| SessionError::GenerationFailed("native detokenize returned null".to_string()))
    }

    /// Clears the conversation history.
    pub fn reset(&self) -> Result<()> {
        let (_guard, handle) = self.checked(Requires { loaded: false })?;
        info!(session_id = %self.id, "Resetting conversation history");
        self.engine.reset_history(handle);
        Ok(())
    }

    /// Erases history entries in `[begin, end)`.
    pub fn erase_history(&self, begin: usize, end: usize) -> Result<()> {
        let (_guard, handle) = self.checked(Requires { loaded: false })?;
        if begin > end {
            return Err(SessionError::InvalidArgument(format!(
                "history range start {} is past its end {}",
                begin, end
            )));
        }
        debug!(session_id = %self.id, begin, end, "Erasing history range");
        self.engine.erase_history(handle, begin, end);
        Ok(())
    }

    pub fn context_info(&self) -> Result<ContextInfo> {
        let (_guard, handle) = self.checked(Requires { loaded: true })?;
        Ok(self.engine.context_info(handle))
    }

    /// Marks the session disposed and cancels a running streaming generation.
    ///
    /// Returns `None` when the session was already disposed, otherwise the
    /// worker (if any) that must settle before the handle is destroyed.
    fn begin_dispose(&self) -> Option<Option<Worker>> {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.state == SessionState::Disposed {
            debug!(session_id = %self.id, "Session already disposed");
            return None;
        }
        let previous = lifecycle.state;
        lifecycle.state = SessionState::Disposed;
        if let Some(worker) = &lifecycle.worker {
            worker.cancel();
        }
        info!(session_id = %self.id, "Disposing session (was {:?})", previous);
        Some(lifecycle.worker.take())
    }

    /// Everything needed to finish disposal on another thread
    fn teardown(&self) -> Teardown<E> {
        Teardown {
            engine: Arc::clone(&self.engine),
            registry: self.registry,
            handle_id: self.handle_id,
            session_id: self.id,
        }
    }

    /// Releases the native handle.
    ///
    /// Cancels a running streaming generation, then awaits its background
    /// thread before destroying the handle, so the handle is never destroyed
    /// while a native call still uses it. A non-streaming `generate` in flight
    /// cannot be cancelled and is awaited to completion. The wait happens on
    /// the blocking pool, so the calling runtime keeps running other tasks.
    /// Calling dispose again does nothing.
    ///
    /// Teardown completes even if this future is dropped early.
    pub async fn dispose(&self) {
        let Some(worker) = self.begin_dispose() else {
            return;
        };
        let teardown = self.teardown();
        match worker {
            Some(worker) => {
                let settled = tokio::task::spawn_blocking(move || teardown.run(Some(worker))).await;
                if let Err(e) = settled {
                    error!(session_id = %self.id, "Session teardown task failed: {}", e);
                }
            }
            None => teardown.run(None),
        }
    }

    /// Blocking variant of [`Session::dispose`] for callers outside an async
    /// context. Blocks the calling thread until the worker has settled.
    pub fn blocking_dispose(&self) {
        if let Some(worker) = self.begin_dispose() {
            self.teardown().run(worker);
        }
    }
}

struct Teardown<E: NativeEngine> {
    engine: Arc<E>,
    registry: &'static HandleRegistry,
    handle_id: HandleId,
    session_id: Uuid,
}

impl<E: NativeEngine> Teardown<E> {
    fn run(self, worker: Option<Worker>) {
        if let Some(worker) = worker {
            worker.join();
        }
        match self.registry.unregister(self.handle_id) {
            Some(handle) => {
                self.engine.destroy(handle);
                debug!(session_id = %self.session_id, handle_id = %self.handle_id, "Native handle destroyed");
            }
            None => warn!(
                session_id = %self.session_id,
                handle_id = %self.handle_id,
                "Native handle was already released"
            ),
        }
    }
}

impl<E: NativeEngine> Drop for Session<E> {
    // Drop cannot await, so an undisposed session blocks here until settled
    fn drop(&mut self) {
        self.blocking_dispose();
    }
}

#[cfg(feature = "native")]
impl Session<crate::llm::engine::NativeLibrary> {
    /// Creates a session over the linked native library.
    pub fn open(config_path: impl Into<String>) -> Result<Self> {
        Self::create(Arc::new(crate::llm::engine::NativeLibrary::new()), config_path)
    }
}
