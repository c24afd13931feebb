//! Seams between the connection manager and the socket it runs over

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream to the overseer
#[async_trait]
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Half-close after the terminate acknowledgement was written
    async fn shutdown(&mut self) -> Result<()>;
}

/// Opens streams to one overseer endpoint; called again on every reconnect
#[async_trait]
pub trait TransportConnector: Send + Sync {
    type Stream: TransportStream;

    async fn connect(&self) -> Result<Self::Stream>;

    /// Short transport name for logs ("TCP", "UNIX")
    fn name(&self) -> &'static str;

    /// Where this connector dials, for logs
    fn endpoint(&self) -> String;
}
