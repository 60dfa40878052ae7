//! Wire-level codecs for the industrial protocols the gateway speaks.

pub mod focas;
pub mod modbus;
pub mod mtconnect;
pub mod opcua;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("timed out")]
    Timeout,

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("remote rejected request: {0}")]
    Remote(String),
}
