use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Buffer store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Driver archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid subnet '{0}'")]
    Subnet(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Buffer is closed")]
    BufferClosed,

    #[error("Remote returned status {status}: {message}")]
    Remote { status: u16, message: String },
}

pub type Result<T> = std::result::Result<T, GatewayError>;
