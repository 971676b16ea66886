//! On-disk certificate store: `<dir>/<hostname>.crt` and `<dir>/<hostname>.key`

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use super::ca::{CertificateAuthority, KeyPolicy, MintedCertificate};

/// A chain and key read back from disk.
pub struct StoredCertificate {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

/// Optional directory of persisted leaf certificates. Without a directory
/// every lookup misses and every save is a no-op.
#[derive(Debug, Clone, Default)]
pub struct CertificateStore {
    dir: Option<PathBuf>,
}

impl CertificateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    pub fn memory_only() -> Self {
        Self { dir: None }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn paths(&self, hostname: &str) -> Option<(PathBuf, PathBuf)> {
        let dir = self.dir.as_ref()?;
        Some((
            dir.join(format!("{}.crt", hostname)),
            dir.join(format!("{}.key", hostname)),
        ))
    }

    /// Load a persisted certificate for `hostname`.
    ///
    /// A missing file is a silent miss. Anything unusable is logged and also
    /// a miss: bad PEM, a chain issued by a different CA, a missing key, or a
    /// leaf whose public key does not belong to the key for `policy`.
    pub fn load(
        &self,
        hostname: &str,
        ca: &CertificateAuthority,
        policy: KeyPolicy,
    ) -> Option<StoredCertificate> {
        let (crt_path, key_path) = self.paths(hostname)?;

        let chain_pem = match std::fs::read(&crt_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(host = %hostname, path = %crt_path.display(), error = %e, "Failed to read stored certificate");
                return None;
            }
        };

        let chain: Vec<CertificateDer<'static>> =
            match rustls_pemfile::certs(&mut BufReader::new(chain_pem.as_slice()))
                .collect::<std::result::Result<_, _>>()
            {
                Ok(chain) => chain,
                Err(e) => {
                    tracing::warn!(host = %hostname, error = %e, "Stored certificate is not valid PEM");
                    return None;
                }
            };

        if chain.len() < 2 || chain[1] != *ca.cert_der() {
            tracing::warn!(host = %hostname, "Stored certificate was not issued by the current CA");
            return None;
        }

        let key = match policy {
            KeyPolicy::ReuseCa => ca.key_der(),
            KeyPolicy::PerHost => match read_key(&key_path) {
                Some(key) => key,
                None => {
                    tracing::warn!(host = %hostname, path = %key_path.display(), "Stored certificate has no usable key");
                    return None;
                }
            },
        };

        // A store written under another key policy pairs the leaf with the wrong key
        if !key_matches_leaf(&chain, &key) {
            tracing::warn!(host = %hostname, ?policy, "Stored certificate does not match the key it would be served with");
            return None;
        }

        Some(StoredCertificate { chain, key })
    }

    /// Persist a freshly minted certificate. Failures are logged and any
    /// partially written file is removed; the caller keeps the in-memory copy.
    pub fn save(&self, hostname: &str, minted: &MintedCertificate) {
        let Some((crt_path, key_path)) = self.paths(hostname) else {
            return;
        };

        if let Err(e) = write_file(&crt_path, minted.chain_pem.as_bytes(), false) {
            tracing::warn!(host = %hostname, path = %crt_path.display(), error = %e, "Failed to persist certificate");
            let _ = std::fs::remove_file(&crt_path);
            return;
        }

        if let Some(key_pem) = &minted.key_pem {
            if let Err(e) = write_file(&key_path, key_pem.as_bytes(), true) {
                tracing::warn!(host = %hostname, path = %key_path.display(), error = %e, "Failed to persist certificate key");
                let _ = std::fs::remove_file(&key_path);
                // A chain without its key would be rejected on load anyway
                let _ = std::fs::remove_file(&crt_path);
                return;
            }
        }

        tracing::debug!(host = %hostname, path = %crt_path.display(), "Persisted certificate");
    }
}

fn key_matches_leaf(chain: &[CertificateDer<'static>], key: &PrivateKeyDer<'static>) -> bool {
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    let Ok(signing_key) = provider.key_provider.load_private_key(key.clone_key()) else {
        return false;
    };
    CertifiedKey::new(chain.to_vec(), signing_key)
        .keys_match()
        .is_ok()
}

fn read_key(path: &Path) -> Option<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path).ok()?;
    rustls_pemfile::private_key(&mut BufReader::new(pem.as_slice()))
        .ok()
        .flatten()
}

fn write_file(path: &Path, contents: &[u8], private: bool) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    #[cfg(unix)]
    {
        if private {
            super::ca::restrict_permissions(path)?;
        }
    }
    #[cfg(not(unix))]
    let _ = private;
    Ok(())
}
