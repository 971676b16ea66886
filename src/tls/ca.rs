//! Certificate Authority management

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use ring::digest;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;

use crate::error::{Error, Result};

/// A generated CA certificate and key pair
pub struct GeneratedCa {
    /// PEM-encoded certificate
    pub cert_pem: String,
    /// PEM-encoded private key
    pub key_pem: String,
}

impl GeneratedCa {
    /// Generate a new CA certificate
    pub fn generate() -> Result<Self> {
        let mut params = CertificateParams::default();

        params
            .distinguished_name
            .push(DnType::CommonName, "Tunnelgate Proxy CA");
        params
            .distinguished_name
            .push(DnType::OrganizationName, "Tunnelgate");

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        // Valid for 10 years; every leaf inherits this window
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = params.not_before + time::Duration::days(3650);

        let key_pair = KeyPair::generate().map_err(|e| Error::certificate(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::certificate(e.to_string()))?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Save the certificate and key to files
    pub fn save(&self, cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(cert_path.as_ref(), &self.cert_pem).map_err(|e| {
            Error::certificate(format!(
                "Failed to write certificate to '{}': {}",
                cert_path.as_ref().display(),
                e
            ))
        })?;

        std::fs::write(key_path.as_ref(), &self.key_pem).map_err(|e| {
            Error::certificate(format!(
                "Failed to write key to '{}': {}",
                key_path.as_ref().display(),
                e
            ))
        })?;

        #[cfg(unix)]
        restrict_permissions(key_path.as_ref())?;

        Ok(())
    }
}

/// Set mode 0600 on a private key file.
#[cfg(unix)]
pub(crate) fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    std::fs::set_permissions(path, perms)
}

/// Whether a freshly minted leaf gets its own key or reuses the CA key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyPolicy {
    #[default]
    PerHost,
    ReuseCa,
}

/// A leaf certificate freshly signed by the CA.
pub struct MintedCertificate {
    /// `[leaf, ca]`
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    /// PEM chain as written to the store
    pub chain_pem: String,
    /// PEM key, only for [`KeyPolicy::PerHost`]
    pub key_pem: Option<String>,
    pub not_before: time::OffsetDateTime,
    pub not_after: time::OffsetDateTime,
}

/// A loaded Certificate Authority for signing interception certificates
pub struct CertificateAuthority {
    key_pair: KeyPair,
    /// Issuer reconstructed from the CA's own parameters; used only for signing
    issuer: Certificate,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    not_before: time::OffsetDateTime,
    not_after: time::OffsetDateTime,
}

impl CertificateAuthority {
    /// Load a CA from PEM-encoded certificate and key
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| Error::certificate(format!("Failed to parse CA private key: {}", e)))?;

        let mut cert_reader = BufReader::new(cert_pem.as_bytes());
        let cert_der = rustls_pemfile::certs(&mut cert_reader)
            .filter_map(|r| r.ok())
            .next()
            .ok_or_else(|| Error::certificate("No certificate found in PEM"))?;

        let params = CertificateParams::from_ca_cert_der(&cert_der)
            .map_err(|e| Error::certificate(format!("Failed to parse CA certificate: {}", e)))?;
        let not_before = params.not_before;
        let not_after = params.not_after;
        let issuer = params
            .self_signed(&key_pair)
            .map_err(|e| Error::certificate(format!("Failed to rebuild CA for signing: {}", e)))?;

        Ok(Self {
            key_pair,
            issuer,
            cert_der,
            cert_pem: cert_pem.to_string(),
            not_before,
            not_after,
        })
    }

    /// Load a CA from files
    pub fn from_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path.as_ref()).map_err(|e| {
            Error::certificate(format!(
                "Failed to read CA certificate '{}': {}",
                cert_path.as_ref().display(),
                e
            ))
        })?;

        let key_pem = std::fs::read_to_string(key_path.as_ref()).map_err(|e| {
            Error::certificate(format!(
                "Failed to read CA key '{}': {}",
                key_path.as_ref().display(),
                e
            ))
        })?;

        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Sign a leaf certificate for `hostname`.
    ///
    /// The serial number is derived from the hostname, so two mints for the
    /// same host under the same CA are interchangeable. The validity window
    /// is copied from the CA certificate.
    pub fn mint(&self, hostname: &str, policy: KeyPolicy) -> Result<MintedCertificate> {
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, hostname);
        params.subject_alt_names = vec![san_for(hostname)?];
        params.serial_number = Some(serial_for(hostname));
        params.is_ca = IsCa::NoCa;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.not_before = self.not_before;
        params.not_after = self.not_after;

        let (cert, key_der, key_pem) = match policy {
            KeyPolicy::PerHost => {
                let leaf_key =
                    KeyPair::generate().map_err(|e| Error::certificate(e.to_string()))?;
                let cert = params
                    .signed_by(&leaf_key, &self.issuer, &self.key_pair)
                    .map_err(|e| Error::certificate(format!("Failed to sign certificate: {}", e)))?;
                (cert, leaf_key.serialize_der(), Some(leaf_key.serialize_pem()))
            }
            KeyPolicy::ReuseCa => {
                let cert = params
                    .signed_by(&self.key_pair, &self.issuer, &self.key_pair)
                    .map_err(|e| Error::certificate(format!("Failed to sign certificate: {}", e)))?;
                (cert, self.key_pair.serialize_der(), None)
            }
        };

        let leaf_der = CertificateDer::from(cert.der().to_vec());
        let chain_pem = format!("{}{}", cert.pem(), self.cert_pem_normalized());

        Ok(MintedCertificate {
            chain: vec![leaf_der, self.cert_der.clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der)),
            chain_pem,
            key_pem,
            not_before: self.not_before,
            not_after: self.not_after,
        })
    }

    /// The CA private key, for leaves minted under [`KeyPolicy::ReuseCa`].
    pub fn key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_pair.serialize_der()))
    }

    /// Get the CA certificate in DER format
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Validity window of the CA, copied onto every leaf.
    pub fn validity(&self) -> (time::OffsetDateTime, time::OffsetDateTime) {
        (self.not_before, self.not_after)
    }

    fn cert_pem_normalized(&self) -> String {
        if self.cert_pem.ends_with('\n') {
            self.cert_pem.clone()
        } else {
            format!("{}\n", self.cert_pem)
        }
    }
}

fn san_for(hostname: &str) -> Result<SanType> {
    if let Ok(ip) = hostname.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    let name: rcgen::Ia5String = hostname
        .try_into()
        .map_err(|e| Error::certificate(format!("Invalid hostname '{}': {}", hostname, e)))?;
    Ok(SanType::DnsName(name))
}

/// SHA-1 of the hostname with the top bit cleared so the DER integer stays positive.
fn serial_for(hostname: &str) -> SerialNumber {
    let hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, hostname.as_bytes());
    let mut bytes = hash.as_ref().to_vec();
    bytes[0] &= 0x7f;
    SerialNumber::from(bytes)
}
