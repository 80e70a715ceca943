use thiserror::Error;

#[derive(Error, Debug)]
pub enum PromptPalError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session error: {0}")]
    Session(#[from] crate::session::SessionError),

    #[error("Other error: {0}")]
    Other(String),
}
