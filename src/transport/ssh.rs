//! SSH upstream: `direct-tcpip` channels over one shared SSH session

use async_trait::async_trait;
use russh::client;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::reconnect::{Connector, SharedConnection};
use super::{credentials, host_port, BoxedStream, TransportOptions};
use crate::error::{Error, Result};

/// Who we log in as and how.
#[derive(Clone)]
pub struct SshCredentials {
    pub user: String,
    pub password: Option<String>,
    pub private_key: Option<PathBuf>,
}

impl std::fmt::Debug for SshCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshCredentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key)
            .finish()
    }
}

struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    // Host keys are not pinned
    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Dials and authenticates new SSH sessions to `ssh://[user[:password]@]host[:port]`.
#[derive(Debug, Clone)]
pub struct SshConnector {
    host: String,
    port: u16,
    credentials: SshCredentials,
    timeout: Duration,
}

impl SshConnector {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        credentials: SshCredentials,
        timeout: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            credentials,
            timeout,
        }
    }

    /// The user defaults to the login name and the key to `$HOME/.ssh/id_rsa`.
    pub fn from_url(url: &Url, options: &TransportOptions) -> Result<Self> {
        let (host, _) = host_port(url)?;
        let port = url.port().unwrap_or(22);
        let (user, password) = credentials(url);
        let user = match user {
            Some(user) => user,
            None => std::env::var("USER")
                .or_else(|_| std::env::var("LOGNAME"))
                .map_err(|_| Error::config("ssh remote has no user and $USER is not set"))?,
        };
        let private_key = options.private_key.clone().or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".ssh").join("id_rsa"))
        });

        Ok(Self::new(
            host,
            port,
            SshCredentials {
                user,
                password,
                private_key,
            },
            options.connect_timeout,
        ))
    }

    async fn authenticate(&self, handle: &mut client::Handle<ClientHandler>) -> Result<()> {
        let creds = &self.credentials;
        let mut attempted = false;

        if let Some(path) = creds.private_key.as_ref().filter(|p| p.exists()) {
            match russh_keys::load_secret_key(path, None) {
                Ok(key) => {
                    attempted = true;
                    let ok = handle
                        .authenticate_publickey(&creds.user, Arc::new(key))
                        .await
                        .map_err(|e| Error::auth(format!("SSH public key auth failed: {}", e)))?;
                    if ok {
                        tracing::debug!(user = %creds.user, key = %path.display(), "SSH public key accepted");
                        return Ok(());
                    }
                }
                Err(e) => {
                    tracing::warn!(key = %path.display(), error = %e, "Failed to load SSH private key");
                }
            }
        }

        if let Some(password) = &creds.password {
            attempted = true;
            let ok = handle
                .authenticate_password(&creds.user, password)
                .await
                .map_err(|e| Error::auth(format!("SSH password auth failed: {}", e)))?;
            if ok {
                tracing::debug!(user = %creds.user, "SSH password accepted");
                return Ok(());
            }
        }

        if attempted {
            Err(Error::auth(format!(
                "SSH server {}:{} rejected every credential for '{}'",
                self.host, self.port, creds.user
            )))
        } else {
            Err(Error::auth(
                "No SSH credentials: add a password to the remote URL or provide a private key",
            ))
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    type Connection = SshConnection;

    async fn connect(&self) -> Result<SshConnection> {
        let config = Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        });

        let addr = (self.host.as_str(), self.port);
        let connecting = client::connect(config, addr, ClientHandler);
        let mut handle = tokio::time::timeout(self.timeout, connecting)
            .await
            .map_err(|_| {
                Error::upstream(format!("SSH connect to {}:{} timed out", self.host, self.port))
            })?
            .map_err(|e| {
                Error::upstream(format!(
                    "SSH connect to {}:{} failed: {}",
                    self.host, self.port, e
                ))
            })?;

        self.authenticate(&mut handle).await?;
        tracing::info!(host = %self.host, port = self.port, user = %self.credentials.user, "SSH session established");

        Ok(SshConnection { handle })
    }
}

/// One authenticated SSH session; every dial is a new channel on it.
pub struct SshConnection {
    handle: client::Handle<ClientHandler>,
}

#[async_trait]
impl SharedConnection for SshConnection {
    async fn open_stream(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| {
                Error::upstream(format!(
                    "SSH direct-tcpip to {}:{} failed: {}",
                    host, port, e
                ))
            })?;
        Ok(Box::new(channel.into_stream()))
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}
