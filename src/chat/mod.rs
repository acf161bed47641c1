// Interactive prompt loop over a local session
mod chat;

// Per-command handlers
mod command_handlers;

// Tables and help text
mod display;

pub use chat::chat_loop;
