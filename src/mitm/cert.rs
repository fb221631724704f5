//! Leaf certificate forging.

use std::fs;
use std::path::Path;

use rcgen::{Certificate, CertificateParams, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use x509_parser::extensions::GeneralName;
use x509_parser::parse_x509_certificate;

use crate::error::CompyError;

/// Signs short-lived leaf certificates with the configured CA so that
/// intercepted clients see a chain they already trust.
pub struct CertFaker {
    ca_cert: Certificate,
    ca_key: KeyPair,
}

impl std::fmt::Debug for CertFaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertFaker").finish_non_exhaustive()
    }
}

impl CertFaker {
    /// Loads the CA certificate and private key from PEM files.
    pub fn new(cert_path: &Path, key_path: &Path) -> Result<Self, CompyError> {
        let cert_pem = fs::read_to_string(cert_path).map_err(|source| CompyError::ReadFile {
            path: cert_path.to_path_buf(),
            source,
        })?;
        let key_pem = fs::read_to_string(key_path).map_err(|source| CompyError::ReadFile {
            path: key_path.to_path_buf(),
            source,
        })?;
        let ca_key = KeyPair::from_pem(&key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)?;
        let ca_cert = params.self_signed(&ca_key)?;
        Ok(Self { ca_cert, ca_key })
    }

    /// Forges a certificate mirroring the origin's leaf. The forged
    /// certificate copies the origin's common name and subject
    /// alternative names; when no origin certificate is available the
    /// dialed hostname is used for both.
    pub fn fake_cert(
        &self,
        origin: Option<&CertificateDer<'_>>,
        fallback_host: &str,
    ) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>), CompyError> {
        let (common_name, sans) = match origin {
            Some(der) => origin_names(der, fallback_host)?,
            None => (fallback_host.to_owned(), vec![fallback_host.to_owned()]),
        };

        let mut params = CertificateParams::new(sans)?;
        params
            .distinguished_name
            .push(DnType::CommonName, &common_name);
        let leaf_key = KeyPair::generate()?;
        let leaf = params.signed_by(&leaf_key, &self.ca_cert, &self.ca_key)?;

        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        Ok((leaf.der().clone(), key))
    }
}

fn origin_names(
    der: &CertificateDer<'_>,
    fallback_host: &str,
) -> Result<(String, Vec<String>), CompyError> {
    let (_, cert) = parse_x509_certificate(der.as_ref())
        .map_err(|e| CompyError::CertForge(format!("origin certificate: {e}")))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or(fallback_host)
        .to_owned();

    let mut sans = Vec::new();
    if let Ok(Some(ext)) = cert.subject_alternative_name() {
        for name in &ext.value.general_names {
            match name {
                GeneralName::DNSName(dns) => sans.push((*dns).to_owned()),
                GeneralName::IPAddress(ip) if ip.len() == 4 => {
                    sans.push(format!("{}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3]));
                }
                _ => {}
            }
        }
    }
    if sans.is_empty() {
        sans.push(common_name.clone());
    }
    Ok((common_name, sans))
}
