//! Error model for the `qmp-session` crate.

use std::time::Duration;

use thiserror::Error;

use crate::{message::Message, session::Runstate};

/// Convenience result type.
pub type Result<T> = std::result::Result<T, Error>;

/// High-level error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An I/O level failure (socket, reset, refused).
    Io,
    /// JSON encoding/decoding failure.
    Json,
    /// The peer is not speaking QMP correctly.
    Protocol,
    /// Greeting or capabilities negotiation failed.
    Handshake,
    /// QMP returned an error object for a command.
    Qmp,
    /// A call lost its session before a reply arrived.
    Interrupted,
    /// The peer closed the connection.
    Disconnected,
    /// The call timed out.
    Timeout,
    /// The call was cancelled.
    Cancelled,
    /// The API was used in the wrong order or with invalid input.
    Usage,
}

/// Structured error type.
///
/// Transport, handshake and protocol faults always tear the session down
/// before they are surfaced. [`Error::Qmp`] is the only variant describing a
/// command the server understood and refused; it never affects the session.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Socket / file I/O error.
    #[error("I/O error: {source}")]
    Io {
        /// Lower-level error.
        #[from]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {source}")]
    Json {
        /// Lower-level error.
        #[from]
        source: serde_json::Error,
    },

    /// The QMP peer sent an unexpected or invalid message.
    #[error("QMP protocol error: {message}")]
    Protocol {
        /// Human readable message.
        message: String,
    },

    /// The greeting was missing or not understood.
    #[error("did not understand QMP greeting: {source}")]
    Greeting {
        /// Root cause.
        source: Box<Error>,
    },

    /// `qmp_capabilities` negotiation failed.
    #[error("QMP capabilities negotiation failed: {source}")]
    Negotiation {
        /// Root cause.
        source: Box<Error>,
    },

    /// The server sent a message with neither `event` nor `id`.
    ///
    /// QMP servers answer unparseable input this way; the reply cannot be
    /// matched to a request so the session is torn down.
    #[error("server sent a message without an id, indicating parse failure: {message}")]
    ServerParse {
        /// The offending message.
        message: Message,
    },

    /// A reply was routed to its request but could not be understood.
    #[error("malformed QMP reply: {reason}")]
    BadReply {
        /// What was wrong with the reply.
        reason: String,
        /// The reply as received.
        reply: Message,
        /// The request that prompted it.
        sent: Message,
    },

    /// QMP returned an error for an `execute` request.
    #[error("QMP command failed: {class}: {desc}")]
    Qmp {
        /// Command name.
        command: String,
        /// QMP error class.
        class: String,
        /// QMP error description.
        desc: String,
        /// The request that was sent.
        sent: Message,
        /// The raw error reply.
        received: Message,
    },

    /// The session went away before a reply arrived.
    ///
    /// The root cause is available from `Client::disconnect_reason`.
    #[error("QMP command interrupted by disconnect")]
    Interrupted,

    /// The peer closed the connection.
    #[error("QMP connection closed")]
    Disconnected,

    /// An operation was invoked in the wrong session state.
    #[error("operation requires runstate {expected}, but the session is {actual}")]
    State {
        /// Required state.
        expected: Runstate,
        /// State at the time of the call.
        actual: Runstate,
    },

    /// A request violated a local precondition.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// Human readable message.
        message: String,
    },

    /// A command call exceeded the configured timeout.
    #[error("QMP command timed out after {timeout:?}")]
    Timeout {
        /// Timeout value.
        timeout: Duration,
    },

    /// A command call was cancelled.
    #[error("QMP command cancelled")]
    Cancelled,

    /// A `return` value did not match the requested Rust type.
    #[error("failed to decode response for '{command}': {message}")]
    Decode {
        /// Command name.
        command: String,
        /// Decoder message, including the failing path.
        message: String,
    },
}

impl Error {
    /// Returns a coarse error classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::Io,
            Self::Json { .. } | Self::Decode { .. } => ErrorKind::Json,
            Self::Protocol { .. } | Self::ServerParse { .. } | Self::BadReply { .. } => {
                ErrorKind::Protocol
            }
            Self::Greeting { .. } | Self::Negotiation { .. } => ErrorKind::Handshake,
            Self::Qmp { .. } => ErrorKind::Qmp,
            Self::Interrupted => ErrorKind::Interrupted,
            Self::Disconnected => ErrorKind::Disconnected,
            Self::State { .. } | Self::InvalidRequest { .. } => ErrorKind::Usage,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether this error is likely retryable at the transport/operation layer.
    ///
    /// Note: QMP command errors are typically **not** retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Io | ErrorKind::Disconnected | ErrorKind::Interrupted | ErrorKind::Timeout
        )
    }

    /// The QMP error class, for [`Error::Qmp`].
    #[must_use]
    pub fn qmp_class(&self) -> Option<&str> {
        match self {
            Self::Qmp { class, .. } => Some(class),
            _ => None,
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub(crate) fn greeting(source: Error) -> Self {
        Self::Greeting {
            source: Box::new(source),
        }
    }

    pub(crate) fn negotiation(source: Error) -> Self {
        Self::Negotiation {
            source: Box::new(source),
        }
    }

    pub(crate) fn bad_reply(reason: impl Into<String>, reply: &Message, sent: &Message) -> Self {
        Self::BadReply {
            reason: reason.into(),
            reply: reply.clone(),
            sent: sent.clone(),
        }
    }
}

impl From<tokio_util::codec::LinesCodecError> for Error {
    fn from(e: tokio_util::codec::LinesCodecError) -> Self {
        match e {
            tokio_util::codec::LinesCodecError::MaxLineLengthExceeded => {
                Self::protocol("incoming line exceeds the maximum frame length")
            }
            tokio_util::codec::LinesCodecError::Io(source) => Self::Io { source },
        }
    }
}
