// Error types for sshfwd configuration and setup

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid forward specification: {0}")]
    ForwardSpec(String),

    #[error("Invalid destination: {0}")]
    Destination(String),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
