//! Command documents
//!
//! Every command is a JSON object with a `cmd` discriminator. Parsing is
//! structural validation: a document that does not match the typed models
//! below is rejected and produces no state change.

use serde::Deserialize;
use std::error::Error;
use std::fmt;

#[derive(Debug)]
pub enum CommandError {
    Parse(serde_json::Error),
    Invalid(String),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Parse(err) => write!(f, "malformed command: {}", err),
            CommandError::Invalid(msg) => write!(f, "invalid command: {}", msg),
        }
    }
}

impl Error for CommandError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CommandError::Parse(err) => Some(err),
            CommandError::Invalid(_) => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileAttributes {
    pub file_name: String,
}

/// `FileWriter_new`: start a write job.
#[derive(Debug, Clone, Deserialize)]
pub struct NewCommand {
    pub job_id: String,
    pub file_attributes: FileAttributes,
    pub nexus_structure: serde_json::Value,
    /// Milliseconds since epoch; defaults to "now" when absent.
    #[serde(default)]
    pub start_time: Option<i64>,
    /// Milliseconds since epoch; absent means "run until stopped".
    #[serde(default)]
    pub stop_time: Option<i64>,
}

/// `FileWriter_stop`: set or move a job's stop time. Without an explicit
/// `stop_time` the job stops immediately.
#[derive(Debug, Clone, Deserialize)]
pub struct StopCommand {
    pub job_id: String,
    #[serde(default)]
    pub stop_time: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    #[serde(rename = "FileWriter_new")]
    New(NewCommand),
    #[serde(rename = "FileWriter_exit")]
    Exit,
    #[serde(rename = "FileWriter_stop")]
    Stop(StopCommand),
    #[serde(rename = "file_writer_tasks_clear_all")]
    ClearAll,
}

/// Parses and validates one command document.
pub fn parse_command(payload: &[u8]) -> Result<Command, CommandError> {
    let command: Command = serde_json::from_slice(payload).map_err(CommandError::Parse)?;
    match &command {
        Command::New(new) => {
            if new.job_id.is_empty() {
                return Err(CommandError::Invalid("job_id must not be empty".to_string()));
            }
            if new.file_attributes.file_name.is_empty() {
                return Err(CommandError::Invalid("file_name must not be empty".to_string()));
            }
            if !new.nexus_structure.is_object() {
                return Err(CommandError::Invalid(
                    "nexus_structure must be an object".to_string(),
                ));
            }
            if let (Some(start), Some(stop)) = (new.start_time, new.stop_time) {
                if stop < start {
                    return Err(CommandError::Invalid(format!(
                        "stop_time {} precedes start_time {}",
                        stop, start
                    )));
                }
            }
        }
        Command::Stop(stop) => {
            if stop.job_id.is_empty() {
                return Err(CommandError::Invalid("job_id must not be empty".to_string()));
            }
        }
        Command::Exit | Command::ClearAll => {}
    }
    Ok(command)
}
