use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LandError {
    InvalidConfig { reason: String },
    Stream { collection: String, reason: String },
    Persistence { reason: String },
    AlreadyRunning,
    NotRunning,
    ThreadSpawnFailed { reason: String },
    ThreadJoinFailed { thread: String },
}

impl fmt::Display for LandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LandError::InvalidConfig { reason } => write!(f, "invalid land config: {}", reason),
            LandError::Stream { collection, reason } => {
                write!(f, "change feed on {} failed: {}", collection, reason)
            }
            LandError::Persistence { reason } => write!(f, "persistence failed: {}", reason),
            LandError::AlreadyRunning => f.write_str("land runtime already running"),
            LandError::NotRunning => f.write_str("land runtime not running"),
            LandError::ThreadSpawnFailed { reason } => {
                write!(f, "failed to spawn land thread: {}", reason)
            }
            LandError::ThreadJoinFailed { thread } => {
                write!(f, "failed to join land thread: {}", thread)
            }
        }
    }
}

impl std::error::Error for LandError {}
