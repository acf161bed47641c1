use anyhow::Result;
use colored::*;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use super::command_handlers::{
    handle_erase, handle_generate, handle_image, handle_info, handle_reset, handle_thinking, handle_tokens,
    ChatContext,
};
use super::display::print_help;
use crate::llm::{NativeEngine, Session};

/// One line of user input, parsed
#[derive(Debug, PartialEq)]
pub(super) enum Command<'a> {
    Help,
    Quit,
    Reset,
    Erase { begin: usize, end: usize },
    Info { json: bool },
    Thinking(bool),
    Tokens(&'a str),
    Image { paths: Vec<&'a str>, prompt: &'a str },
    Prompt(&'a str),
    Usage(&'static str),
}

pub(super) fn parse_command(input: &str) -> Command<'_> {
    let input = input.trim();
    if !input.starts_with('/') {
        return Command::Prompt(input);
    }
    let (name, rest) = match input.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (input, ""),
    };

    match name.to_lowercase().as_str() {
        "/help" => Command::Help,
        "/quit" | "/exit" | "/bye" => Command::Quit,
        "/reset" => Command::Reset,
        "/info" => match rest.to_lowercase().as_str() {
            "" => Command::Info { json: false },
            "json" => Command::Info { json: true },
            _ => Command::Usage("/info [json]"),
        },
        "/erase" => {
            let bounds: Vec<Option<usize>> = rest.split_whitespace().map(|s| s.parse().ok()).collect();
            match bounds.as_slice() {
                [Some(begin), Some(end)] => Command::Erase { begin: *begin, end: *end },
                _ => Command::Usage("/erase <begin> <end>"),
            }
        }
        "/thinking" => match rest.to_lowercase().as_str() {
            "on" => Command::Thinking(true),
            "off" => Command::Thinking(false),
            _ => Command::Usage("/thinking on|off"),
        },
        "/tokens" if !rest.is_empty() => Command::Tokens(rest),
        "/tokens" => Command::Usage("/tokens <text>"),
        "/image" => match rest.split_once(char::is_whitespace) {
            Some((paths, prompt)) if !prompt.trim().is_empty() => Command::Image {
                paths: paths.split(',').filter(|p| !p.is_empty()).collect(),
                prompt: prompt.trim(),
            },
            _ => Command::Usage("/image <path>[,<path>...] <prompt>"),
        },
        _ => Command::Usage("/help"),
    }
}

// --- Main Chat Loop ---

pub async fn chat_loop<E: NativeEngine>(session: &Session<E>, label: &str) -> Result<()> {
    println!("Starting chat session {}", session.id().to_string().bright_black());
    print_help();

    let mut rl = DefaultEditor::new()?;
    let context = ChatContext { session, label };

    loop {
        let input = match rl.readline("[you] > ") {
            Ok(input) => input,
            Err(ReadlineError::Interrupted) => continue,
            Err(_) => {
                println!("Goodbye!");
                break;
            }
        };
        let trimmed = input.trim();
        if trimmed.is_empty() {
            continue;
        }
        let _ = rl.add_history_entry(trimmed);

        match parse_command(trimmed) {
            Command::Help => print_help(),
            Command::Quit => {
                println!("Goodbye!");
                break;
            }
            Command::Reset => handle_reset(&context),
            Command::Erase { begin, end } => handle_erase(&context, begin, end),
            Command::Info { json } => handle_info(&context, json),
            Command::Thinking(enabled) => handle_thinking(&context, enabled),
            Command::Tokens(text) => handle_tokens(&context, text),
            Command::Image { paths, prompt } => handle_image(&context, &paths, prompt).await,
            Command::Prompt(prompt) => handle_generate(&context, prompt).await,
            Command::Usage(usage) => println!("{} {}", "Usage:".yellow(), usage),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_a_prompt() {
        assert_eq!(parse_command("  hello there "), Command::Prompt("hello there"));
    }

    #[test]
    fn test_erase_bounds() {
        assert_eq!(parse_command("/erase 2 4"), Command::Erase { begin: 2, end: 4 });
        assert_eq!(parse_command("/erase 2"), Command::Usage("/erase <begin> <end>"));
        assert_eq!(parse_command("/erase a b"), Command::Usage("/erase <begin> <end>"));
    }

    #[test]
    fn test_image_command() {
        assert_eq!(
            parse_command("/image a.png,b.png what is shown?"),
            Command::Image { paths: vec!["a.png", "b.png"], prompt: "what is shown?" }
        );
        assert!(matches!(parse_command("/image a.png"), Command::Usage(_)));
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(parse_command("/THINKING off"), Command::Thinking(false));
        assert_eq!(parse_command("/tokens hi there"), Command::Tokens("hi there"));
        assert_eq!(parse_command("/quit"), Command::Quit);
        assert_eq!(parse_command("/unknown"), Command::Usage("/help"));
    }

    #[test]
    fn test_info_formats() {
        assert_eq!(parse_command("/info"), Command::Info { json: false });
        assert_eq!(parse_command("/info JSON"), Command::Info { json: true });
        assert_eq!(parse_command("/info yaml"), Command::Usage("/info [json]"));
    }
}
