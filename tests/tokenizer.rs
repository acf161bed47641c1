use std::sync::Arc;
use std::time::Duration;

use native_llm::llm::engine::UNKNOWN_TOKEN;
use native_llm::llm::{ScriptedEngine, Session};
use native_llm::SessionError;

fn create_test_session() -> Session<ScriptedEngine> {
    let session = Session::create(Arc::new(ScriptedEngine::new()), "models/test/config.json").unwrap();
    assert!(session.load().unwrap());
    session
}

#[test]
fn test_round_trip() {
    let session = create_test_session();

    let original = "Hello, world!\n\tsecond line";
    let tokens = session.tokenizer_encode(original).unwrap();
    assert_eq!(tokens.len(), original.len());
    assert_eq!(tokens[0], 'H' as i32);

    assert_eq!(session.tokenizer_decode(&tokens).unwrap(), original);
}

#[test]
fn test_out_of_vocabulary() {
    let session = create_test_session();

    // Each byte of a multibyte character is unknown to the byte vocabulary
    let tokens = session.tokenizer_encode("é").unwrap();
    assert_eq!(tokens, vec![UNKNOWN_TOKEN, UNKNOWN_TOKEN]);
    assert_eq!(session.tokenizer_decode(&tokens).unwrap(), "??");
    assert_eq!(session.tokenizer_decode(&[]).unwrap(), "");
}

#[test]
fn test_tokenizer_needs_loaded_model() {
    let session = Session::create(Arc::new(ScriptedEngine::new()), "models/test/config.json").unwrap();
    assert!(matches!(session.tokenizer_encode("hi"), Err(SessionError::NotLoaded)));
    assert!(matches!(session.tokenizer_decode(&[104, 105]), Err(SessionError::NotLoaded)));
}

#[tokio::test]
async fn test_tokenizer_rejected_during_generation() {
    let session = Session::create(
        Arc::new(ScriptedEngine::new().with_reply(["a", "b"]).with_chunk_delay(Duration::from_millis(20))),
        "models/test/config.json",
    )
    .unwrap();
    session.load().unwrap();

    let stream = session.generate_stream("hi").unwrap();
    assert!(matches!(session.tokenizer_decode(&[104]), Err(SessionError::Busy)));
    stream.collect_text().await.unwrap();

    assert_eq!(session.tokenizer_decode(&[104, 105]).unwrap(), "hi");
}
