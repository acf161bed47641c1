//! Background execution of generation calls and the consumer-facing stream.
//!
//! Every generation runs on its own short-lived OS thread so the blocking native
//! call never touches the caller's thread. Chunks travel back over an unbounded
//! FIFO channel, so the producer never blocks on a slow consumer, and every
//! stream ends with exactly one terminal event.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};

use futures::stream::{Stream, StreamExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tracing::{debug, error};

use super::bridge::{bridge_callback, CallbackRegistration};
use crate::error::{Result, SessionError};
use crate::llm::engine::NativeEngine;
use crate::llm::registry::{HandleId, HandleRegistry, RegistrationId};

/// One event of a generation stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A decoded chunk of generated text
    Token(String),
    /// Generation ran to the end of its output
    Completed,
    /// The native call failed after the stream was returned
    Error(String),
    /// Generation stopped because cancellation was requested
    Cancelled,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Token(_))
    }
}

/// Stream of [`StreamEvent`]s for one generation.
///
/// Yields zero or more `Token` events followed by exactly one terminal event.
/// Once cancellation has been requested, queued tokens are discarded and the
/// terminal event is reported as `Cancelled`. Dropping the stream cancels the
/// generation.
pub struct GenerationStream {
    registration: Arc<CallbackRegistration>,
    events: UnboundedReceiver<StreamEvent>,
    finished: bool,
}

impl GenerationStream {
    pub(crate) fn new(registration: Arc<CallbackRegistration>, events: UnboundedReceiver<StreamEvent>) -> Self {
        Self { registration, events, finished: false }
    }

    pub fn registration_id(&self) -> RegistrationId {
        self.registration.id()
    }

    /// Requests cancellation; the stream then drains to a `Cancelled` event.
    pub fn cancel(&self) {
        self.registration.cancel();
    }

    /// Handle that can cancel this stream from another task or thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle { registration: Arc::clone(&self.registration) }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Converts the event stream into a stream of text chunks.
    ///
    /// `Completed` and `Cancelled` end the stream; `Error` becomes a final
    /// `Err(SessionError::GenerationFailed)` item.
    pub fn into_text(mut self) -> impl Stream<Item = Result<String>> + Send {
        async_stream::stream! {
            while let Some(event) = self.next().await {
                match event {
                    StreamEvent::Token(text) => yield Ok(text),
                    StreamEvent::Error(reason) => {
                        yield Err(SessionError::GenerationFailed(reason));
                        break;
                    }
                    StreamEvent::Completed | StreamEvent::Cancelled => break,
                }
            }
        }
    }

    /// Collects the whole reply. A cancelled generation yields the text
    /// received before cancellation.
    pub async fn collect_text(self) -> Result<String> {
        let mut text = String::new();
        let chunks = self.into_text();
        futures::pin_mut!(chunks);
        while let Some(chunk) = chunks.next().await {
            text.push_str(&chunk?);
        }
        Ok(text)
    }
}

impl Stream for GenerationStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        loop {
            let event = match this.events.poll_recv(cx) {
                Poll::Ready(event) => event,
                Poll::Pending => return Poll::Pending,
            };
            let cancelled = this.registration.is_cancelled();
            match event {
                Some(StreamEvent::Token(_)) if cancelled => continue,
                Some(StreamEvent::Token(text)) => return Poll::Ready(Some(StreamEvent::Token(text))),
                Some(StreamEvent::Completed) if cancelled => {
                    this.finished = true;
                    return Poll::Ready(Some(StreamEvent::Cancelled));
                }
                Some(terminal) => {
                    this.finished = true;
                    return Poll::Ready(Some(terminal));
                }
                None => {
                    this.finished = true;
                    return Poll::Ready(Some(StreamEvent::Error(
                        "generation worker exited without a terminal event".to_string(),
                    )));
                }
            }
        }
    }
}

impl Drop for GenerationStream {
    fn drop(&mut self) {
        if !self.finished {
            self.registration.cancel();
        }
    }
}

/// Cloneable cancellation handle for a [`GenerationStream`].
#[derive(Clone)]
pub struct CancelHandle {
    registration: Arc<CallbackRegistration>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.registration.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.registration.is_cancelled()
    }
}

/// What a streaming worker should generate
pub(crate) enum GenerationJob {
    Text {
        prompt: String,
    },
    Vision {
        prompt: String,
        image_paths: Vec<String>,
        width: u32,
        height: u32,
    },
}

/// Background thread currently (or most recently) holding the native handle
pub(crate) struct Worker {
    pub registration: Option<Arc<CallbackRegistration>>,
    pub thread: JoinHandle<()>,
}

impl Worker {
    pub fn cancel(&self) -> bool {
        match &self.registration {
            Some(registration) => {
                registration.cancel();
                true
            }
            None => false,
        }
    }

    pub fn join(self) {
        if self.thread.join().is_err() {
            error!("Generation worker thread panicked");
        }
    }
}

fn worker_name(handle_id: HandleId) -> String {
    format!("native-generate-{}", handle_id)
}

/// Starts a streaming generation on a dedicated thread.
///
/// The worker re-attaches the handle by id, runs the callback-driven native
/// call, detaches its registration as soon as the call returns, runs `settle`,
/// and only then sends the terminal event.
pub(crate) fn spawn_stream<E, F>(
    engine: Arc<E>,
    registry: &'static HandleRegistry,
    registration: Arc<CallbackRegistration>,
    job: GenerationJob,
    settle: F,
) -> io::Result<JoinHandle<()>>
where
    E: NativeEngine,
    F: FnOnce() + Send + 'static,
{
    let handle_id = registration.handle_id();
    thread::Builder::new().name(worker_name(handle_id)).spawn(move || {
        let outcome = run_stream_job(engine.as_ref(), registry, &registration, &job);
        registration.flush();
        settle();

        let terminal = if registration.is_cancelled() {
            StreamEvent::Cancelled
        } else {
            match outcome {
                Ok(()) => StreamEvent::Completed,
                Err(reason) => {
                    error!(handle_id = %handle_id, registration_id = %registration.id(), "Generation failed: {}", reason);
                    StreamEvent::Error(reason)
                }
            }
        };
        debug!(
            handle_id = %handle_id,
            registration_id = %registration.id(),
            chunks = registration.delivered(),
            terminal = ?terminal,
            "Generation settled"
        );
        registration.finish(terminal);
    })
}

fn run_stream_job<E: NativeEngine>(
    engine: &E,
    registry: &HandleRegistry,
    registration: &Arc<CallbackRegistration>,
    job: &GenerationJob,
) -> std::result::Result<(), String> {
    let handle = registry.lookup(registration.handle_id()).map_err(|e| e.to_string())?;

    let prompt = match job {
        GenerationJob::Text { prompt } => prompt.clone(),
        GenerationJob::Vision { prompt, image_paths, width, height } => engine
            .format_vision_prompt(handle, prompt, image_paths, *width, *height)
            .ok_or_else(|| "native vision prompt formatting returned null".to_string())?
            .into_string(),
    };

    if registration.is_cancelled() {
        return Ok(());
    }

    let id = registry.attach(Arc::clone(registration)).map_err(|e| e.to_string())?;
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        engine.generate_with_callback(handle, &prompt, bridge_callback, id.as_context())
    }));
    registry.detach(id);

    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("native generation panicked".to_string()),
    }
}

/// Runs the non-streaming native `generate` on a dedicated thread and replies
/// over `reply` once the session has settled.
pub(crate) fn spawn_blocking_generate<E, F>(
    engine: Arc<E>,
    registry: &'static HandleRegistry,
    handle_id: HandleId,
    prompt: String,
    settle: F,
    reply: oneshot::Sender<Result<String>>,
) -> io::Result<JoinHandle<()>>
where
    E: NativeEngine,
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new().name(worker_name(handle_id)).spawn(move || {
        let result = registry.lookup(handle_id).map_err(SessionError::from).and_then(|handle| {
            panic::catch_unwind(AssertUnwindSafe(|| engine.generate(handle, &prompt)))
                .map_err(|_| SessionError::GenerationFailed("native generation panicked".to_string()))?
                .map(|buffer| buffer.into_string())
                .ok_or_else(|| SessionError::GenerationFailed("native generate returned null".to_string()))
        });
        settle();
        if reply.send(result).is_err() {
            debug!(handle_id = %handle_id, "Generate caller went away before the reply");
        }
    })
}
