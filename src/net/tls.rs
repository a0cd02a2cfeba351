//! TLS configuration for both sides of the transport.
//!
//! Certificate lifecycle is out of scope: the server loads a PEM pair once at
//! startup and the client trusts the bundled web PKI roots.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::crypto::{ring, CryptoProvider};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Install ring as the process-wide rustls provider.
///
/// Other crates in the dependency graph enable `aws-lc-rs` as well, and with
/// two providers compiled in rustls cannot pick one on its own. A provider
/// already installed by the embedding process is left in place.
pub fn install_crypto_provider() {
    if CryptoProvider::get_default().is_none() {
        let _ = ring::default_provider().install_default();
    }
}

/// Load a TLS acceptor from certificate and key files.
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, std::io::Error> {
    // Basic validation
    if !cert_path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Certificate file not found: {:?}", cert_path),
        ));
    }
    if !key_path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Private key file not found: {:?}", key_path),
        ));
    }

    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("No private key found in {:?}", key_path),
            )
        })?;

    let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build a client connector trusting the bundled web PKI roots.
pub fn client_connector() -> TlsConnector {
    install_crypto_provider();

    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_certificate_is_not_found() {
        let err = match load_tls_acceptor(Path::new("/nope/cert.pem"), Path::new("/nope/key.pem")) {
            Err(e) => e,
            Ok(_) => panic!("acceptor built from missing files"),
        };
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn client_connector_builds_with_every_provider_compiled_in() {
        let _ = client_connector();
        assert!(CryptoProvider::get_default().is_some());
        // Idempotent once a provider is in place.
        let _ = client_connector();
    }
}
