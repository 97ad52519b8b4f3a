//! Control-plane command grammar.
//!
//! One command per line: a case-insensitive command token followed by
//! whitespace-separated arguments. `START`/`PAUSE`/`RESUME`/`CANCEL` take an
//! optional task id; with no parsable id they apply to all tasks.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Add { url: String, output_path: String },
    Start { task_id: Option<u64> },
    Pause { task_id: Option<u64> },
    Resume { task_id: Option<u64> },
    Cancel { task_id: Option<u64> },
    List,
    Status { task_id: u64 },
    Threads,
}

/// Parse failure; Display yields the text after the `ERROR ` prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    Usage(&'static str),
    Unknown(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Empty => write!(f, "Empty command"),
            ParseError::Usage(usage) => write!(f, "Usage: {}", usage),
            ParseError::Unknown(cmd) => write!(f, "Unknown command: {}", cmd),
        }
    }
}

impl std::error::Error for ParseError {}

pub fn parse(line: &str) -> Result<Command, ParseError> {
    let mut parts = line.split_whitespace();
    let Some(token) = parts.next() else {
        return Err(ParseError::Empty);
    };
    let token = token.to_ascii_uppercase();

    match token.as_str() {
        "HELP" => Ok(Command::Help),
        "ADD" => match (parts.next(), parts.next()) {
            (Some(url), Some(output_path)) => Ok(Command::Add {
                url: url.to_string(),
                output_path: output_path.to_string(),
            }),
            _ => Err(ParseError::Usage("ADD <url> <output_path>")),
        },
        "START" => Ok(Command::Start {
            task_id: optional_id(parts.next()),
        }),
        "PAUSE" => Ok(Command::Pause {
            task_id: optional_id(parts.next()),
        }),
        "RESUME" => Ok(Command::Resume {
            task_id: optional_id(parts.next()),
        }),
        "CANCEL" => Ok(Command::Cancel {
            task_id: optional_id(parts.next()),
        }),
        "LIST" => Ok(Command::List),
        "STATUS" => match optional_id(parts.next()) {
            Some(task_id) => Ok(Command::Status { task_id }),
            None => Err(ParseError::Usage("STATUS <task_id>")),
        },
        "THREADS" => Ok(Command::Threads),
        _ => Err(ParseError::Unknown(token)),
    }
}

fn optional_id(arg: Option<&str>) -> Option<u64> {
    arg.and_then(|s| s.parse().ok())
}
