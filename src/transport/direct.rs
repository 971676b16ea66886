//! Direct TCP dialing

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

use super::{BoxedStream, Dialer};
use crate::error::{Error, Result};

/// Connects straight to the origin with a bounded connect timeout.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    timeout: Duration,
}

impl TcpDialer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub(crate) async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        let addr = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::upstream(format!("Connect to {} timed out", addr)))?
            .map_err(|e| Error::upstream(format!("Failed to connect to {}: {}", addr, e)))?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream> {
        Ok(Box::new(self.connect(host, port).await?))
    }
}
