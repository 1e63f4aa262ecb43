//! Error types for robot-remote

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RobotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Invalid request: {0}")]
    Request(#[from] http::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid image payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Image decode failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("Failed to read config: {0}")]
    ConfigRead(std::io::Error),

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to write config: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, RobotError>;
