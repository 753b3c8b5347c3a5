//! The master: command ingress, job table and status reporting

mod commands;
mod master;
mod status;

pub use commands::{parse_command, Command, CommandError, NewCommand, StopCommand};
pub use master::{Master, MasterError};
pub use status::{JobStatistics, SourceStatistics, StatusReport};
