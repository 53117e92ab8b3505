use thiserror::Error;

#[derive(Error, Debug)]
pub enum ObservatoryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Metrics storage unavailable: {0}")]
    Storage(String),

    #[error("Delivery failed with status {status}: {body}")]
    Delivery { status: u16, body: String },

    #[error("Server error: {0}")]
    Server(String),
}

pub type Result<T> = std::result::Result<T, ObservatoryError>;
