//! TLS and certificate management

mod ca;
mod pool;
mod store;

pub use ca::{CertificateAuthority, GeneratedCa, KeyPolicy, MintedCertificate};
pub use pool::{CertificateEntry, CertificatePool};
pub use store::{CertificateStore, StoredCertificate};

/// Install aws-lc-rs as the process-wide rustls provider unless one is set.
pub(crate) fn ensure_crypto_provider() {
    if rustls::crypto::CryptoProvider::get_default().is_none() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }
}
