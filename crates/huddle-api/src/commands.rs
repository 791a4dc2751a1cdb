//! Slash commands typed into the message box.
//!
//! Parsing is pure. [`interpret`] decides what a recognised command turns
//! into; the pipeline performs the side effects.

use crate::error::ApiError;

pub const SHRUG: &str = r"¯\_(ツ)_/¯";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command<'a> {
    /// Lowercased, without the leading `/`
    pub name: String,
    /// Everything after the first token, trimmed. May be empty.
    pub args: &'a str,
}

/// What a command asks the pipeline to do instead of storing the raw text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandAction {
    /// Store the user's message with this content instead.
    Rewrite(String),
    /// Rename the topic and announce it with a system message.
    RenameTopic { name: String, announcement: String },
    /// Store a system message and nothing else.
    Announce(String),
}

/// Returns `None` unless the trimmed text starts with `/`.
pub fn parse_command(text: &str) -> Option<Command<'_>> {
    let trimmed = text.trim();
    if !trimmed.starts_with('/') {
        return None;
    }

    let first = trimmed.split_whitespace().next()?;
    let name = first.strip_prefix('/').unwrap_or(first).to_lowercase();
    let args = trimmed[first.len()..].trim();

    Some(Command { name, args })
}

pub fn interpret(command: &Command<'_>) -> Result<CommandAction, ApiError> {
    match command.name.as_str() {
        "shrug" => {
            let content = if command.args.is_empty() {
                SHRUG.to_string()
            } else {
                format!("{} {}", command.args, SHRUG)
            };
            Ok(CommandAction::Rewrite(content))
        }
        "topic" => {
            if command.args.is_empty() {
                return Err(ApiError::InvalidCommand("topic name required"));
            }
            Ok(CommandAction::RenameTopic {
                name: command.args.to_string(),
                announcement: format!("Topic renamed to \"{}\"", command.args),
            })
        }
        "invite" => {
            if command.args.is_empty() {
                return Err(ApiError::InvalidCommand("invite target required"));
            }
            Ok(CommandAction::Announce(format!(
                "Invitation sent to {}",
                command.args
            )))
        }
        other => Err(ApiError::UnknownCommand(other.to_string())),
    }
}
