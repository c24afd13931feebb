//! UNIX socket transport, the default between an overseer and the drones it spawns

use crate::transport::traits::{TransportConnector, TransportStream};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

#[async_trait]
impl TransportStream for UnixStream {
    async fn shutdown(&mut self) -> Result<()> {
        AsyncWriteExt::shutdown(self).await?;
        Ok(())
    }
}

pub struct UnixConnector {
    path: PathBuf,
}

impl UnixConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TransportConnector for UnixConnector {
    type Stream = UnixStream;

    async fn connect(&self) -> Result<Self::Stream> {
        UnixStream::connect(&self.path)
            .await
            .with_context(|| format!("cannot connect to {}", self.path.display()))
    }

    fn name(&self) -> &'static str {
        "UNIX"
    }

    fn endpoint(&self) -> String {
        self.path.display().to_string()
    }
}
