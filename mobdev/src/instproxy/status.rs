//! Status messages emitted while a command runs.

use mobdev_proto::DictExt;
use plist::{Dictionary, Value};

use super::error::{InstProxyCode, StatusError};

/// Value of `Status` in the final message of a successful command.
const COMPLETE: &str = "Complete";

/// One status message, tagged with the command it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    /// Command name.
    command: &'static str,
    /// Raw message.
    dict: Dictionary,
}

/// Batch position reported by listing commands such as `Browse`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[non_exhaustive]
pub struct CurrentList<'a> {
    /// Total number of entries.
    pub total: u64,
    /// Index of the first entry in this batch.
    pub current_index: u64,
    /// Number of entries in this batch.
    pub current_amount: u64,
    /// Entries in this batch.
    pub list: &'a [Value],
}

impl Status {
    /// Wraps a received message.
    pub const fn new(command: &'static str, dict: Dictionary) -> Self {
        Self { command, dict }
    }

    /// Name of the command that produced this status.
    pub const fn command(&self) -> &'static str {
        self.command
    }

    /// `Status` field, e.g. `CreatingStagingDirectory` or `Complete`.
    pub fn name(&self) -> Option<&str> {
        self.dict.string("Status")
    }

    /// Whether this is the completion marker.
    pub fn is_complete(&self) -> bool {
        self.name() == Some(COMPLETE)
    }

    /// Whether the command is finished, successfully or not.
    pub fn is_terminal(&self) -> bool {
        self.is_complete() || self.dict.contains_key("Error")
    }

    /// Device-reported failure carried by this status.
    pub fn error(&self) -> Option<StatusError> {
        let name = self.dict.string("Error")?;
        Some(StatusError {
            code: InstProxyCode::from_device_name(name),
            name: name.to_owned(),
            description: self.dict.string("ErrorDescription").map(str::to_owned),
            detail: self.dict.uint("ErrorDetail"),
        })
    }

    /// Completion percentage 0–100, or -1 when absent.
    pub fn percent(&self) -> i32 {
        self.dict
            .uint("PercentComplete")
            .and_then(|p| i32::try_from(p.min(100)).ok())
            .unwrap_or(-1)
    }

    /// Batch information, when this status carries a partial listing.
    pub fn current_list(&self) -> Option<CurrentList<'_>> {
        Some(CurrentList {
            total: self.dict.uint("Total").unwrap_or(0),
            current_index: self.dict.uint("CurrentIndex").unwrap_or(0),
            current_amount: self.dict.uint("CurrentAmount").unwrap_or(0),
            list: self.dict.array("CurrentList")?,
        })
    }

    /// Borrows the raw message.
    pub const fn as_dict(&self) -> &Dictionary {
        &self.dict
    }

    /// Returns the raw message.
    pub fn into_dict(self) -> Dictionary {
        self.dict
    }
}
