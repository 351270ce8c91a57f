//! Error types for mailmap

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IMAP error: {0}")]
    Imap(String),

    #[error("Email parsing error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("rule error: {0}")]
    Rule(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("source error: {0}")]
    Source(String),

    #[error("target error: {0}")]
    Target(String),

    #[error("duplex channel error: {0}")]
    Duplex(String),

    #[error("{0} not supported by this backend")]
    NotSupported(&'static str),

    #[error(
        "folder name '{name}' is ambiguous: matches {servers:?} - qualify as 'server:{name}'"
    )]
    AmbiguousFolder { name: String, servers: Vec<String> },
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Llm(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}
