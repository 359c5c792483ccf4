// sshfwd - Secure Channel
// Seam between the tunnel manager and the SSH session that carries forwarded streams

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ChannelError;

/// Byte stream multiplexed over the secure channel
pub trait ForwardStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ForwardStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Authenticated connection able to open forwarded sub-streams
#[async_trait]
pub trait SecureChannel: Send + Sync {
    /// Open a sub-stream to `dst_addr:dst_port`, reporting `src_addr:src_port` as originator
    async fn open_forward(
        &self,
        src_addr: &str,
        src_port: u16,
        dst_addr: &str,
        dst_port: u16,
    ) -> Result<Box<dyn ForwardStream>, ChannelError>;

    /// Tear down the connection and every sub-stream it carries; safe to repeat
    async fn end(&self);

    /// Re-establish the connection after `end`
    async fn reconnect(&self) -> Result<(), ChannelError>;
}
