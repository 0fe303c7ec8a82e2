//! Error types and handling for StakeQuiz

use thiserror::Error;

/// Result type alias for StakeQuiz operations
pub type Result<T> = std::result::Result<T, Error>;

/// StakeQuiz error types
///
/// Variants fall into four groups: precondition violations (rejected before
/// any state changes), custody failures (propagated from the token layer),
/// invalid oracle results (the session stays in its waiting phase) and
/// ambient faults (config, serialization, IO).
#[derive(Debug, Error)]
pub enum Error {
    // Precondition violations
    #[error("Session already active for participant {0}")]
    SessionAlreadyActive(String),

    #[error("No active session for participant {0}")]
    SessionNotFound(String),

    #[error("Invalid phase: {0}")]
    InvalidPhase(String),

    #[error("Timeout not elapsed: {0}")]
    TimeoutNotElapsed(String),

    #[error("Answer window closed: {0}")]
    AnswerWindowClosed(String),

    #[error("Invalid topics: {0}")]
    InvalidTopics(String),

    #[error("Invalid answer: {0}")]
    InvalidAnswer(String),

    #[error("Invalid stake: {0}")]
    InvalidStake(String),

    // Custody failures
    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("Insufficient allowance: {0}")]
    InsufficientAllowance(String),

    // Oracle results the engine refuses to apply
    #[error("Invalid oracle result: {0}")]
    InvalidOracleResult(String),

    #[error("Oracle error: {0}")]
    Oracle(String),

    // Ambient
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Arithmetic overflow: {0}")]
    ArithmeticOverflow(String),

    #[error("Corrupt state: {0}")]
    CorruptState(String),
}

impl Error {
    /// True for errors raised because the caller asked for something the
    /// current session state does not allow.
    pub fn is_precondition_violation(&self) -> bool {
        matches!(
            self,
            Error::SessionAlreadyActive(_)
                | Error::SessionNotFound(_)
                | Error::InvalidPhase(_)
                | Error::TimeoutNotElapsed(_)
                | Error::AnswerWindowClosed(_)
                | Error::InvalidTopics(_)
                | Error::InvalidAnswer(_)
                | Error::InvalidStake(_)
        )
    }

    /// True for custody failures (balance or allowance).
    pub fn is_insufficient_funds(&self) -> bool {
        matches!(
            self,
            Error::InsufficientBalance(_) | Error::InsufficientAllowance(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(format!("JSON error: {}", err))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(format!("Failed to parse config: {}", err))
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::Serialization(format!("TOML error: {}", err))
    }
}
