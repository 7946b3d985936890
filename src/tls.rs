use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;
use tracing::info;

use crate::config::Config;

/// TLS is on only when both `ROOMD_TLS_CERT` and `ROOMD_TLS_KEY` are set.
pub fn load_tls_acceptor(config: &Config) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (config.tls_cert.as_deref(), config.tls_key.as_deref()) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both ROOMD_TLS_CERT and ROOMD_TLS_KEY must be set, or neither",
            ));
        }
    };

    let certs = read_certs(cert_path)?;
    if certs.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("no certificates found in {cert_path}"),
        ));
    }
    let key = read_key(key_path)?;

    let mut server = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    server.alpn_protocols = vec![b"postgresql".to_vec()];

    info!("TLS enabled with certificate {cert_path}");
    Ok(Some(TlsAcceptor::from(Arc::new(server))))
}

fn read_certs(path: &str) -> io::Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut BufReader::new(File::open(path)?)).collect()
}

fn read_key(path: &str) -> io::Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut BufReader::new(File::open(path)?))?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, format!("no private key found in {path}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_tls(cert: Option<&str>, key: Option<&str>) -> Config {
        Config {
            tls_cert: cert.map(String::from),
            tls_key: key.map(String::from),
            ..Config::default()
        }
    }

    #[test]
    fn disabled_without_paths() {
        assert!(load_tls_acceptor(&with_tls(None, None)).unwrap().is_none());
    }

    #[test]
    fn half_configured_is_rejected() {
        let err = load_tls_acceptor(&with_tls(Some("cert.pem"), None)).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        let err = load_tls_acceptor(&with_tls(None, Some("key.pem"))).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn missing_files_surface_io_errors() {
        let dir = std::env::temp_dir().join(format!("roomd_test_tls_{}", ulid::Ulid::new()));
        let cert = dir.join("cert.pem");
        let key = dir.join("key.pem");
        let err = load_tls_acceptor(&with_tls(cert.to_str(), key.to_str())).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn empty_pem_has_no_certificates() {
        let dir = std::env::temp_dir().join(format!("roomd_test_tls_{}", ulid::Ulid::new()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("cert.pem");
        std::fs::write(&cert, "").unwrap();
        let key = dir.join("key.pem");
        std::fs::write(&key, "").unwrap();
        let err = load_tls_acceptor(&with_tls(cert.to_str(), key.to_str())).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
