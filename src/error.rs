// Failure taxonomy shared by the store, the transfer engine and the boot validator

use core::fmt;
use serde::Serialize;

/// Coarse class of a failure; decides how the caller reacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or truncated image. The session is aborted, the running image keeps running.
    Input,
    /// Flash or NVS fault. Recoverable for a session via abort; repeated faults are a health signal.
    Medium,
    /// Caller misuse, e.g. a second concurrent session. Rejected synchronously.
    Protocol,
    /// Bank state could not be read or written during boot validation. Boot must not continue.
    FatalBoot,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Input => "input",
            ErrorKind::Medium => "medium",
            ErrorKind::Protocol => "protocol",
            ErrorKind::FatalBoot => "fatal_boot",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
