// sshfwd - Tunnel error types

use thiserror::Error;

/// Failure messages that warrant a reconnect cycle, compared case-insensitively
pub const TRANSIENT_MESSAGES: [&str; 3] = ["No response from server", "Unable to exec", "Not connected"];

/// Error reported by a secure channel client
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Not connected")]
    NotConnected,

    #[error("No response from server")]
    NoResponse,

    #[error("Channel open failed: {0}")]
    OpenFailed(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    /// Message passed through from the SSH layer unchanged
    #[error("{0}")]
    Remote(String),
}

impl ChannelError {
    /// Check if this failure is one of the known transient conditions
    pub fn is_transient(&self) -> bool {
        let message = self.to_string();
        TRANSIENT_MESSAGES
            .iter()
            .any(|m| m.eq_ignore_ascii_case(message.trim()))
    }
}

impl From<russh::Error> for ChannelError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::Disconnect | russh::Error::HUP | russh::Error::SendError => {
                ChannelError::NotConnected
            }
            russh::Error::ConnectionTimeout
            | russh::Error::KeepaliveTimeout
            | russh::Error::InactivityTimeout => ChannelError::NoResponse,
            russh::Error::ChannelOpenFailure(reason) => {
                ChannelError::OpenFailed(format!("{:?}", reason))
            }
            other => ChannelError::Remote(other.to_string()),
        }
    }
}

/// Terminal outcome of a forward attempt that did not produce a pipe
#[derive(Error, Debug)]
pub enum ForwardError {
    /// The tunnel was closed while the attempt was in flight
    #[error("forward cancelled: tunnel closed")]
    Cancelled,

    /// The reconnect budget ran out while the failure was still transient
    #[error("reconnect retries exhausted after {attempts} cycles: {last}")]
    RetriesExhausted { attempts: u32, last: ChannelError },

    /// Non-transient failure, or transient failure with reconnect disabled
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The pipe between the inbound connection and the channel failed
    #[error("pipe error: {0}")]
    Io(#[from] std::io::Error),
}
