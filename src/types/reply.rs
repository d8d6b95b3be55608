use serde::{Deserialize, Serialize};

/// The `error` member of a failed command reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error class, e.g. `GenericError` or `CommandNotFound`.
    pub class: String,
    /// Human-readable description.
    pub desc: String,
}
