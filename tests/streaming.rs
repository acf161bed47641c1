use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use native_llm::llm::{GenerationStream, HandleRegistry, ScriptedEngine, Session, SessionState, StreamEvent};
use native_llm::SessionError;

fn loaded_session(engine: ScriptedEngine) -> (Session<ScriptedEngine>, Arc<ScriptedEngine>) {
    let engine = Arc::new(engine);
    let session = Session::create(Arc::clone(&engine), "models/test/config.json").unwrap();
    assert!(session.load().unwrap());
    (session, engine)
}

fn five_chunks() -> ScriptedEngine {
    ScriptedEngine::new()
        .with_reply(["one ", "two ", "three ", "four ", "five"])
        .with_chunk_delay(Duration::from_millis(30))
}

async fn drain(stream: &mut GenerationStream) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }
    events
}

fn token(text: &str) -> StreamEvent {
    StreamEvent::Token(text.to_string())
}

async fn wait_until_idle<E: native_llm::NativeEngine>(session: &Session<E>) {
    for _ in 0..200 {
        if !session.is_busy() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session never settled");
}

#[tokio::test]
async fn test_tokens_arrive_in_order_then_completed() {
    let (session, _engine) = loaded_session(ScriptedEngine::new().with_reply(["a", "b", "c"]));

    let mut stream = session.generate_stream("anything").unwrap();
    let events = drain(&mut stream).await;

    assert_eq!(events, vec![token("a"), token("b"), token("c"), StreamEvent::Completed]);
}

#[tokio::test]
async fn test_session_is_idle_when_terminal_event_arrives() {
    let (session, _engine) = loaded_session(five_chunks());

    let mut stream = session.generate_stream("go").unwrap();
    assert_eq!(session.state(), SessionState::Busy);
    while let Some(event) = stream.next().await {
        if event.is_terminal() {
            assert_eq!(event, StreamEvent::Completed);
            assert_eq!(session.state(), SessionState::Idle);
        }
    }

    // A fresh generation can start right away
    let again = session.generate_stream("again").unwrap();
    assert_eq!(again.collect_text().await.unwrap(), "one two three four five");
}

#[tokio::test]
async fn test_cancel_after_second_chunk() {
    let (session, engine) = loaded_session(five_chunks());

    let mut stream = session.generate_stream("count").unwrap();
    assert_eq!(stream.next().await, Some(token("one ")));
    assert_eq!(stream.next().await, Some(token("two ")));
    stream.cancel();

    // No tokens are delivered after the cancel request
    let rest = drain(&mut stream).await;
    assert_eq!(rest, vec![StreamEvent::Cancelled]);

    // The engine stops at its next callback
    assert!(engine.chunks_emitted() <= 3, "emitted {}", engine.chunks_emitted());
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_session_cancel_signals_running_stream() {
    let (session, engine) = loaded_session(five_chunks());
    assert!(!session.cancel());

    let mut stream = session.generate_stream("count").unwrap();
    assert_eq!(stream.next().await, Some(token("one ")));
    assert!(session.cancel());

    let rest = drain(&mut stream).await;
    assert_eq!(rest.last(), Some(&StreamEvent::Cancelled));
    assert!(rest.iter().all(|e| e.is_terminal()));
    assert!(engine.chunks_emitted() <= 2);
}

#[tokio::test]
async fn test_cancel_handle_from_another_task() {
    let (session, _engine) = loaded_session(five_chunks());

    let mut stream = session.generate_stream("count").unwrap();
    let cancel = stream.cancel_handle();
    assert_eq!(stream.next().await, Some(token("one ")));

    tokio::spawn(async move { cancel.cancel() }).await.unwrap();

    assert_eq!(drain(&mut stream).await, vec![StreamEvent::Cancelled]);
}

#[tokio::test]
async fn test_second_generation_rejected_while_busy() {
    let (session, _engine) = loaded_session(five_chunks());

    let mut first = session.generate_stream("first").unwrap();
    assert!(matches!(session.generate_stream("second"), Err(SessionError::Busy)));
    assert!(matches!(session.generate("third").await, Err(SessionError::Busy)));
    assert!(matches!(session.vision_generate_stream("look", ["a.png"]), Err(SessionError::Busy)));

    // The rejected calls leave the first stream untouched
    let events = drain(&mut first).await;
    assert_eq!(
        events,
        vec![token("one "), token("two "), token("three "), token("four "), token("five"), StreamEvent::Completed]
    );
}

#[tokio::test]
async fn test_dropping_stream_cancels_generation() {
    let engine = ScriptedEngine::new()
        .with_reply((0..20).map(|i| format!("t{} ", i)))
        .with_chunk_delay(Duration::from_millis(10));
    let (session, engine) = loaded_session(engine);

    let mut stream = session.generate_stream("long").unwrap();
    let registration_id = stream.registration_id();
    assert_eq!(stream.next().await, Some(token("t0 ")));
    drop(stream);

    wait_until_idle(&session).await;
    assert!(engine.chunks_emitted() < 20);
    assert!(HandleRegistry::global().registration(registration_id).is_none());
}

#[tokio::test]
async fn test_native_failure_ends_stream_with_error() {
    let engine = ScriptedEngine::new().with_reply(["a", "b", "c", "d"]).fail_generation_after(2);
    let (session, _engine) = loaded_session(engine);

    let mut stream = session.generate_stream("fail").unwrap();
    let events = drain(&mut stream).await;

    assert_eq!(events.len(), 3);
    assert_eq!(&events[..2], &[token("a"), token("b")]);
    assert!(matches!(&events[2], StreamEvent::Error(reason) if reason.contains("scripted failure")));
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_into_text_surfaces_failure() {
    let engine = ScriptedEngine::new().with_reply(["a", "b"]).fail_generation_after(1);
    let (session, _engine) = loaded_session(engine);

    let chunks: Vec<_> = session.generate_stream("fail").unwrap().into_text().collect().await;
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].as_deref().unwrap(), "a");
    assert!(matches!(chunks[1], Err(SessionError::GenerationFailed(_))));
}

#[tokio::test]
async fn test_split_utf8_character_is_reassembled() {
    let engine = ScriptedEngine::new().with_raw_reply(vec![vec![b'n', 0xc3], vec![0xa9, b'!']]);
    let (session, _engine) = loaded_session(engine);

    let mut stream = session.generate_stream("accent").unwrap();
    let events = drain(&mut stream).await;

    assert_eq!(events, vec![token("n"), token("é!"), StreamEvent::Completed]);
}

#[tokio::test]
async fn test_vision_prompt_is_formatted_before_generation() {
    // The echo engine replies with the prompt it was given
    let (session, _engine) = loaded_session(ScriptedEngine::new());
    session.set_vision_size(448, 224).unwrap();

    let stream = session.vision_generate_stream("describe", ["cat.png"]).unwrap();
    assert_eq!(stream.collect_text().await.unwrap(), "<img><hw>224, 448</hw>cat.png</img>describe");

    session.set_vision_size(0, 0).unwrap();
    let stream = session.vision_generate_stream("both", vec!["a.png".to_string(), "b.png".to_string()]).unwrap();
    assert_eq!(stream.collect_text().await.unwrap(), "<img>a.png</img><img>b.png</img>both");
}

#[tokio::test]
async fn test_vision_formatting_failure_is_an_error_event() {
    let (session, engine) = loaded_session(ScriptedEngine::new());

    let mut stream = session.vision_generate_stream("describe", [" "]).unwrap();
    let events = drain(&mut stream).await;

    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], StreamEvent::Error(reason) if reason.contains("vision")));
    assert_eq!(engine.chunks_emitted(), 0);
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_generate_returns_whole_reply() {
    let (session, _engine) = loaded_session(ScriptedEngine::new());

    let reply = session.generate("hello there world").await.unwrap();
    assert_eq!(reply, "hello there world");
    assert_eq!(session.state(), SessionState::Idle);

    let info = session.context_info().unwrap();
    assert_eq!(info.decode_tokens, 3);
}

#[tokio::test]
async fn test_generate_failure_is_reported() {
    let (session, _engine) = loaded_session(ScriptedEngine::new().fail_generation_after(0));

    assert!(matches!(session.generate("boom").await, Err(SessionError::GenerationFailed(_))));
    assert_eq!(session.state(), SessionState::Idle);
}
