use colored::*;
use comfy_table::{Attribute, Cell, CellAlignment, ContentArrangement, Table};

use serde_json::{json, Value};
use uuid::Uuid;

use crate::llm::{ContextInfo, SessionState};

pub(super) fn print_help() {
    println!("\n{}", "Chat Commands".cyan());
    println!("{}", "=".repeat(60).bright_cyan());
    println!("{}                 - Show this help message", "/help".green());
    println!("{}                - Clear the conversation history", "/reset".green());
    println!("{}  - Erase history entries [begin, end)", "/erase <begin> <end>".green());
    println!("{}          - Show context metrics", "/info [json]".green());
    println!("{}      - Toggle thinking mode", "/thinking on|off".green());
    println!("{}        - Show how text tokenizes", "/tokens <text>".green());
    println!("{} - Ask about images", "/image <path>[,<path>] <prompt>".green());
    println!("{}                 - Exit the chat", "/quit".green());
    println!("Anything else is sent as a prompt. Ctrl-C stops a reply.\n");
}

fn header(title: &str) -> Cell {
    Cell::new(title).fg(comfy_table::Color::Cyan).add_attribute(Attribute::Bold)
}

/// Displays the native context metrics of the last generation.
pub(super) fn display_context_info(info: &ContextInfo) {
    let mut table = Table::new();
    table
        .set_header(vec![header("Stage"), header("Tokens"), header("Time (ms)"), header("Tokens/s")])
        .load_preset(comfy_table::presets::UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    let rows = [
        ("Prefill", info.prompt_tokens, info.prompt_micros, info.prefill_tokens_per_second()),
        ("Decode", info.decode_tokens, info.decode_micros, info.decode_tokens_per_second()),
    ];
    for (stage, tokens, micros, rate) in rows {
        table.add_row(vec![
            Cell::new(stage).fg(comfy_table::Color::Green),
            Cell::new(tokens).set_alignment(CellAlignment::Right),
            Cell::new(format!("{:.1}", micros as f64 / 1000.0)).set_alignment(CellAlignment::Right),
            Cell::new(format!("{:.2}", rate)).fg(comfy_table::Color::Yellow).set_alignment(CellAlignment::Right),
        ]);
    }

    println!("\n{}", table);
    println!(
        "{}",
        format!("Captured at {}", info.captured_at.format("%Y-%m-%d %H:%M:%S")).bright_black()
    );
}

/// Machine-readable form of the context metrics, tagged with the session.
pub(super) fn context_report(session_id: Uuid, state: SessionState, info: &ContextInfo) -> Value {
    json!({
        "session_id": session_id.to_string(),
        "state": state,
        "context": info,
    })
}

pub(super) fn display_tokens(tokens: &[i32], decoded: &str) {
    let ids: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
    println!("{} [{}]", format!("{} tokens:", tokens.len()).green(), ids.join(", "));
    println!("{} {:?}", "decoded:".green(), decoded);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_report_fields() {
        let id = Uuid::new_v4();
        let report = context_report(id, SessionState::Idle, &ContextInfo::new(12, 3, 4_000, 9_000));

        assert_eq!(report["session_id"], json!(id.to_string()));
        assert_eq!(report["state"], json!("idle"));
        assert_eq!(report["context"]["prompt_tokens"], json!(12));
        assert_eq!(report["context"]["decode_micros"], json!(9_000));
        assert!(report["context"]["captured_at"].is_string());
    }
}
