use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed or out-of-range input; never retried.
    Validation(&'static str),
    /// An active reservation already occupies part of the requested interval.
    Conflict(Ulid),
    /// Missing, owned by someone else, or not in the state the transition needs.
    NotFound(Ulid),
    /// The pending reservation outlived its TTL.
    Expired(Ulid),
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::Conflict(id) => write!(f, "conflict with reservation: {id}"),
            EngineError::NotFound(id) => write!(f, "reservation not found or not pending: {id}"),
            EngineError::Expired(id) => {
                write!(f, "reservation expired: {id}; reserve the slot again")
            }
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
