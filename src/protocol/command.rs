use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown command value {0}")]
pub struct UnknownCommand(pub u8);

/// Commands exchanged between a consumer and its workers.
///
/// The discriminants are part of the wire format and must not change.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    #[default]
    None = 0,
    /// Worker asks for a new work item.
    GetData = 1,
    /// Consumer hands out a work item to be processed.
    Compute = 2,
    /// Worker returns a processed work item.
    Result = 3,
    /// Consumer has no work available right now.
    NoData = 4,
    /// Consumer failed internally; only sent over websockets.
    Error = 5,
}

impl Command {
    /// Whether a well-formed envelope with this command carries a payload.
    pub fn requires_payload(self) -> bool {
        matches!(self, Command::Compute | Command::Result)
    }
}

impl From<Command> for u8 {
    fn from(value: Command) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for Command {
    type Error = UnknownCommand;

    fn try_from(value: u8) -> Result<Self, UnknownCommand> {
        match value {
            0 => Ok(Command::None),
            1 => Ok(Command::GetData),
            2 => Ok(Command::Compute),
            3 => Ok(Command::Result),
            4 => Ok(Command::NoData),
            5 => Ok(Command::Error),
            v => Err(UnknownCommand(v)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::None => "NONE",
            Command::GetData => "GETDATA",
            Command::Compute => "COMPUTE",
            Command::Result => "RESULT",
            Command::NoData => "NODATA",
            Command::Error => "ERROR",
        };
        f.write_str(name)
    }
}
