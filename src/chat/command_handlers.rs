use colored::*;
use futures::StreamExt;
use std::io::{stdout, Write};

use crate::chat::display::{context_report, display_context_info, display_tokens};
use crate::error::SessionError;
use crate::llm::{GenerationStream, NativeEngine, Session, StreamEvent};

/// Shared state for the command handlers
pub(super) struct ChatContext<'a, E: NativeEngine> {
    pub session: &'a Session<E>,
    pub label: &'a str,
}

fn report(error: SessionError) {
    println!("{} {}", "Error:".red(), error);
}

pub(super) fn handle_reset<E: NativeEngine>(context: &ChatContext<'_, E>) {
    match context.session.reset() {
        Ok(()) => println!("{}", "Conversation history cleared".green()),
        Err(e) => report(e),
    }
}

pub(super) fn handle_erase<E: NativeEngine>(context: &ChatContext<'_, E>, begin: usize, end: usize) {
    match context.session.erase_history(begin, end) {
        Ok(()) => println!("{}", format!("Erased history entries {}..{}", begin, end).green()),
        Err(e) => report(e),
    }
}

pub(super) fn handle_info<E: NativeEngine>(context: &ChatContext<'_, E>, json: bool) {
    let session = context.session;
    match session.context_info() {
        Ok(info) if json => match serde_json::to_string_pretty(&context_report(session.id(), session.state(), &info)) {
            Ok(text) => println!("{}", text),
            Err(e) => println!("{} {}", "Error:".red(), e),
        },
        Ok(info) => display_context_info(&info),
        Err(e) => report(e),
    }
}

pub(super) fn handle_thinking<E: NativeEngine>(context: &ChatContext<'_, E>, enabled: bool) {
    match context.session.set_thinking(enabled) {
        Ok(()) => println!("Thinking mode {}", if enabled { "on".green() } else { "off".yellow() }),
        Err(e) => report(e),
    }
}

pub(super) fn handle_tokens<E: NativeEngine>(context: &ChatContext<'_, E>, text: &str) {
    let result = context
        .session
        .tokenizer_encode(text)
        .and_then(|tokens| context.session.tokenizer_decode(&tokens).map(|decoded| (tokens, decoded)));
    match result {
        Ok((tokens, decoded)) => display_tokens(&tokens, &decoded),
        Err(e) => report(e),
    }
}

pub(super) async fn handle_generate<E: NativeEngine>(context: &ChatContext<'_, E>, prompt: &str) {
    match context.session.generate_stream(prompt) {
        Ok(stream) => print_stream(context, stream).await,
        Err(e) => report(e),
    }
}

pub(super) async fn handle_image<E: NativeEngine>(context: &ChatContext<'_, E>, paths: &[&str], prompt: &str) {
    match context.session.vision_generate_stream(prompt, paths.iter().copied()) {
        Ok(stream) => print_stream(context, stream).await,
        Err(e) => report(e),
    }
}

/// Prints a reply as it streams in. Ctrl-C cancels the reply, not the program.
async fn print_stream<E: NativeEngine>(context: &ChatContext<'_, E>, mut stream: GenerationStream) {
    print!("\n{} ", format!("[{}]", context.label).yellow().bold());
    let _ = stdout().flush();

    let cancel = stream.cancel_handle();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        tokio::select! {
            event = stream.next() => match event {
                Some(StreamEvent::Token(text)) => {
                    print!("{}", text.bright_cyan());
                    let _ = stdout().flush();
                }
                Some(StreamEvent::Completed) | None => {
                    println!();
                    break;
                }
                Some(StreamEvent::Cancelled) => {
                    println!("\n{}", "[Generation Interrupted]".yellow());
                    break;
                }
                Some(StreamEvent::Error(reason)) => {
                    println!("\n{} {}", "[Generation Failed]".red(), reason);
                    break;
                }
            },
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                cancel.cancel();
            }
        }
    }
}
