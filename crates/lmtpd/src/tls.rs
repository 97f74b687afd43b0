use crate::settings::TlsSettings;
use anyhow::Context;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Build the STARTTLS acceptor. With no key configured we self-sign
/// for the server hostname, which is enough for opportunistic TLS
/// from a front-end on the same network.
pub fn make_tls_acceptor(hostname: &str, tls: &TlsSettings) -> anyhow::Result<TlsAcceptor> {
    let mut certificates = vec![];
    let private_key = match &tls.private_key {
        Some(path) => {
            let data = std::fs::read(path)
                .with_context(|| format!("reading private key from {}", path.display()))?;
            PrivateKeyDer::from_pem_slice(&data)
                .with_context(|| format!("loading private key from {}", path.display()))?
        }
        None => {
            let key = rcgen::generate_simple_self_signed(vec![hostname.to_string()])?;
            certificates.push(CertificateDer::from_slice(key.cert.der()).into_owned());
            PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.key_pair.serialize_der()))
        }
    };

    if let Some(path) = &tls.certificate {
        let data = std::fs::read(path)
            .with_context(|| format!("reading certificates from {}", path.display()))?;
        certificates = CertificateDer::pem_slice_iter(&data)
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("loading certificates from {}", path.display()))?;
    }

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certificates, private_key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
