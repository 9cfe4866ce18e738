use std::{error::Error, fmt, io};

use tokio::{sync::mpsc, task::JoinError};

/// Error raised by the communication layer.
#[derive(Debug)]
pub enum CommunicationError {
    /// The connection to the server has been lost.
    Disconnected,
    /// The connection or the channel has been closed on purpose.
    Closed,
    /// The bundle could not be serialized as a whole.
    NotSerializable(String),
    /// The round trip was interrupted before it could complete.
    Interrupted,
    /// The server answered with something that does not fit the protocol.
    Protocol(String),
    /// Failed to read/write data from/to the connection.
    IoError(io::Error),
}

impl CommunicationError {
    /// Whether the error is caused by a bundle that cannot be serialized.
    pub fn is_serialization(&self) -> bool {
        matches!(self, CommunicationError::NotSerializable(_))
    }

    /// Whether the error is caused by an interrupted round trip.
    pub fn is_interruption(&self) -> bool {
        matches!(self, CommunicationError::Interrupted)
    }

    /// Terminal errors fail the dispatch unit instead of resubmitting it.
    pub fn is_terminal(&self) -> bool {
        self.is_serialization() || self.is_interruption()
    }
}

impl fmt::Display for CommunicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommunicationError::Disconnected => write!(f, "connection lost"),
            CommunicationError::Closed => write!(f, "connection closed"),
            CommunicationError::NotSerializable(msg) => write!(f, "not serializable: {}", msg),
            CommunicationError::Interrupted => write!(f, "round trip interrupted"),
            CommunicationError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            CommunicationError::IoError(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl Error for CommunicationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CommunicationError::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CommunicationError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::Interrupted => CommunicationError::Interrupted,
            _ => CommunicationError::IoError(e),
        }
    }
}

impl<T> From<mpsc::error::SendError<T>> for CommunicationError {
    fn from(_e: mpsc::error::SendError<T>) -> Self {
        CommunicationError::Disconnected
    }
}

impl From<JoinError> for CommunicationError {
    fn from(e: JoinError) -> Self {
        if e.is_cancelled() {
            CommunicationError::Interrupted
        } else {
            CommunicationError::Protocol(format!("server task failed: {}", e))
        }
    }
}
