//! Line-oriented editing commands read from stdin.
//!
//! Lines starting with `:` are commands; anything else is appended to the
//! document as a new paragraph. Positions are Unicode scalar offsets.

use collab_core::{LocalEdit, Mark};
use thiserror::Error;

pub const HELP: &str = "\
:insert <pos> <text>    insert text at a position
:append <text>          append text to the last paragraph
:delete <pos> <len>     delete a range
:bold <start> <end>     bold a range
:italic <start> <end>   italicize a range
:unformat <start> <end> clear bold and italic on a range
:undo / :redo           undo or redo your own edits
:name <name>            set your display name
:color <#rrggbb>        set your cursor color
:show                   print the document
:users                  list active users
:history                print recent changes
:status                 print connection status
:connect                reconnect after a failure
:quit                   leave the room
<text>                  append a paragraph";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command :{0} (try :help)")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Insert { index: usize, text: String },
    Append(String),
    Paragraph(String),
    Delete { index: usize, len: usize },
    Bold { start: usize, end: usize },
    Italic { start: usize, end: usize },
    Unformat { start: usize, end: usize },
    Undo,
    Redo,
    Name(String),
    Color(String),
    Show,
    Users,
    History,
    Status,
    Connect,
    Help,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let Some(rest) = line.strip_prefix(':') else {
            return Ok(Command::Paragraph(line.to_string()));
        };
        let (name, args) = rest.split_once(' ').unwrap_or((rest, ""));

        match name {
            "insert" => {
                let (pos, text) = args.split_once(' ').ok_or(CommandError::Usage(":insert <pos> <text>"))?;
                let index = pos.parse().map_err(|_| CommandError::Usage(":insert <pos> <text>"))?;
                Ok(Command::Insert {
                    index,
                    text: text.to_string(),
                })
            }
            "append" => Ok(Command::Append(args.to_string())),
            "delete" => {
                let (index, len) = two_numbers(args).ok_or(CommandError::Usage(":delete <pos> <len>"))?;
                Ok(Command::Delete { index, len })
            }
            "bold" => {
                let (start, end) = two_numbers(args).ok_or(CommandError::Usage(":bold <start> <end>"))?;
                Ok(Command::Bold { start, end })
            }
            "italic" => {
                let (start, end) = two_numbers(args).ok_or(CommandError::Usage(":italic <start> <end>"))?;
                Ok(Command::Italic { start, end })
            }
            "unformat" => {
                let (start, end) =
                    two_numbers(args).ok_or(CommandError::Usage(":unformat <start> <end>"))?;
                Ok(Command::Unformat { start, end })
            }
            "name" if !args.trim().is_empty() => Ok(Command::Name(args.trim().to_string())),
            "name" => Err(CommandError::Usage(":name <name>")),
            "color" if args.trim().starts_with('#') => Ok(Command::Color(args.trim().to_string())),
            "color" => Err(CommandError::Usage(":color <#rrggbb>")),
            "undo" => Ok(Command::Undo),
            "redo" => Ok(Command::Redo),
            "show" => Ok(Command::Show),
            "users" => Ok(Command::Users),
            "history" => Ok(Command::History),
            "status" => Ok(Command::Status),
            "connect" => Ok(Command::Connect),
            "help" => Ok(Command::Help),
            "quit" | "q" => Ok(Command::Quit),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }

    /// The document edits this command performs, given the current length.
    pub fn edits(&self, doc_len: usize) -> Vec<LocalEdit> {
        match self {
            Command::Insert { index, text } => vec![LocalEdit::Insert {
                index: *index,
                text: text.clone(),
            }],
            Command::Append(text) => vec![LocalEdit::Insert {
                index: doc_len,
                text: text.clone(),
            }],
            Command::Paragraph(text) => {
                let text = if doc_len == 0 {
                    text.clone()
                } else {
                    format!("\n{text}")
                };
                vec![LocalEdit::Insert {
                    index: doc_len,
                    text,
                }]
            }
            Command::Delete { index, len } => vec![LocalEdit::Delete {
                index: *index,
                len: *len,
            }],
            Command::Bold { start, end } => vec![LocalEdit::Format {
                range: *start..*end,
                mark: Mark::Bold,
            }],
            Command::Italic { start, end } => vec![LocalEdit::Format {
                range: *start..*end,
                mark: Mark::Italic,
            }],
            Command::Unformat { start, end } => vec![
                LocalEdit::Unformat {
                    range: *start..*end,
                    mark: Mark::Bold,
                },
                LocalEdit::Unformat {
                    range: *start..*end,
                    mark: Mark::Italic,
                },
            ],
            _ => Vec::new(),
        }
    }
}

fn two_numbers(args: &str) -> Option<(usize, usize)> {
    let mut parts = args.split_whitespace();
    let a = parts.next()?.parse().ok()?;
    let b = parts.next()?.parse().ok()?;
    match parts.next() {
        Some(_) => None,
        None => Some((a, b)),
    }
}
