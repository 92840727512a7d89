use thiserror::Error;

/// Engine lifecycle failures.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine for follower {0} is already running")]
    AlreadyRunning(String),

    #[error("no engine registered for follower {0}")]
    NotFound(String),

    #[error("engine for follower {0} cannot start during shutdown")]
    ShuttingDown(String),

    #[error("engine for follower {follower} failed to start: {message}")]
    Startup { follower: String, message: String },
}
