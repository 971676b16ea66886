//! Per-host certificate pool for TLS interception

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::ca::{CertificateAuthority, KeyPolicy};
use super::store::CertificateStore;
use crate::error::{Error, Result};

/// A leaf certificate ready to be served. Immutable once created.
#[derive(Debug)]
pub struct CertificateEntry {
    pub hostname: String,
    /// `[leaf, ca]`
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub not_before: time::OffsetDateTime,
    pub not_after: time::OffsetDateTime,
}

/// Hostname to certificate map backed by an optional on-disk store.
///
/// Lookups take the read lock; a miss takes the write lock for the whole
/// load-or-mint step, so at most one entry is ever built per hostname.
pub struct CertificatePool {
    ca: Arc<CertificateAuthority>,
    store: CertificateStore,
    policy: KeyPolicy,
    entries: RwLock<HashMap<String, Arc<CertificateEntry>>>,
}

impl std::fmt::Debug for CertificatePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificatePool")
            .field("store", &self.store)
            .field("policy", &self.policy)
            .field("entries", &self.len())
            .finish()
    }
}

impl CertificatePool {
    pub fn new(ca: CertificateAuthority, store: CertificateStore, policy: KeyPolicy) -> Self {
        Self {
            ca: Arc::new(ca),
            store,
            policy,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Return the certificate for `hostname`, loading or minting it on first use.
    pub fn get_or_create(&self, hostname: &str) -> Result<Arc<CertificateEntry>> {
        let hostname = hostname.to_ascii_lowercase();
        validate_hostname(&hostname)?;

        {
            let entries = self
                .entries
                .read()
                .map_err(|_| Error::certificate("certificate pool lock poisoned"))?;
            if let Some(entry) = entries.get(&hostname) {
                return Ok(entry.clone());
            }
        }

        let mut entries = self
            .entries
            .write()
            .map_err(|_| Error::certificate("certificate pool lock poisoned"))?;
        if let Some(entry) = entries.get(&hostname) {
            return Ok(entry.clone());
        }

        let entry = match self.store.load(&hostname, &self.ca, self.policy) {
            Some(stored) => {
                tracing::debug!(host = %hostname, "Loaded stored certificate");
                // Stored leaves are only accepted when issued by this CA
                let (not_before, not_after) = self.ca.validity();
                CertificateEntry {
                    hostname: hostname.clone(),
                    chain: stored.chain,
                    key: stored.key,
                    not_before,
                    not_after,
                }
            }
            None => {
                tracing::debug!(host = %hostname, "Minting certificate");
                let minted = self.ca.mint(&hostname, self.policy)?;
                self.store.save(&hostname, &minted);
                CertificateEntry {
                    hostname: hostname.clone(),
                    chain: minted.chain,
                    key: minted.key,
                    not_before: minted.not_before,
                    not_after: minted.not_after,
                }
            }
        };

        let entry = Arc::new(entry);
        entries.insert(hostname, entry.clone());
        Ok(entry)
    }

    /// Create a rustls ServerConfig presenting the certificate for `hostname`
    pub fn server_config_for_host(&self, hostname: &str) -> Result<Arc<ServerConfig>> {
        let entry = self.get_or_create(hostname)?;

        super::ensure_crypto_provider();
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(entry.chain.clone(), entry.key.clone_key())
            .map_err(|e| Error::tls(format!("Failed to build server config: {}", e)))?;

        // Decrypted traffic is served with the HTTP/1.1 connection handler only
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Arc::new(config))
    }

    /// Get the CA certificate for client trust
    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        self.ca.cert_der()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hostnames become file names in the store.
fn validate_hostname(hostname: &str) -> Result<()> {
    if hostname.is_empty()
        || hostname.contains(['/', '\\', '\0'])
        || hostname.starts_with('.')
        || hostname.contains("..")
    {
        return Err(Error::certificate(format!(
            "Invalid hostname '{}'",
            hostname
        )));
    }
    Ok(())
}
