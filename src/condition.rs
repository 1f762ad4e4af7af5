use std::fmt;
use std::io;

/// An error condition attached to an endpoint.
///
/// Conditions carry a symbolic name and a human-readable description.
/// They travel with terminal transport and listener events: a failed
/// connect, a mid-stream socket error, a listener that could not bind, or
/// the condition handed to [`Proactor::disconnect`].
///
/// [`Proactor::disconnect`]: crate::Proactor::disconnect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    name: String,
    description: String,
}

impl Condition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Condition {
        Condition {
            name: name.into(),
            description: description.into(),
        }
    }

    /// Formats an OS error the way the transport error taxonomy expects:
    /// the error text first, then what the engine was doing.
    pub(crate) fn from_io(err: &io::Error, doing: &str) -> Condition {
        Condition::new("pio:io", format!("{} - {}", err, doing))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.description)
    }
}
