use std::path::Path;
use std::sync::Arc;

use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::server::danger::ClientCertVerifier;
use tokio_rustls::rustls::version::{TLS12, TLS13};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::session::AuthConfigMethods;
use crate::tls::cipher_suites::restricted_provider;
use crate::tls::mutual::{build_webpki_verifier, load_trust_store, MtlsClientVerifier};

/// Everything a connection needs from the TLS layer: the acceptor for
/// the handshake, and the webpki verifier mutual-TLS identity
/// extraction re-checks chains against.
pub struct TlsContext {
    pub acceptor: TlsAcceptor,
    pub webpki: Option<Arc<dyn ClientCertVerifier>>,
}

/// Build the server TLS context from a combined key + certificate PEM.
///
/// TLS 1.2 minimum, restricted cipher policy, ALPN advertising `h2`
/// then `http/1.1`.  The client-certificate mode follows the auth
/// policy: strict TLS requires a valid chain during the handshake;
/// otherwise a client certificate is only *requested* when no web UI is
/// installed, so browsers are never faced with an mTLS prompt they
/// can't satisfy.
pub fn build_tls_context(
    cert_pem: &str,
    auth_config: &AuthConfigMethods,
    has_webui: bool,
    trust_store_dir: &Path,
) -> Result<TlsContext> {
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_slice_iter(cert_pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::Tls(format!("Failed to parse certificates: {e}")))?;
    if certs.is_empty() {
        return Err(GatewayError::Tls("No certificates found".to_owned()));
    }
    let key: PrivateKeyDer<'static> = PrivateKeyDer::pem_slice_iter(cert_pem.as_bytes())
        .filter_map(|k| k.ok())
        .next()
        .ok_or_else(|| GatewayError::Tls("No private key found".to_owned()))?;

    let provider = Arc::new(restricted_provider());
    let roots = load_trust_store(trust_store_dir);
    let webpki = build_webpki_verifier(roots, &provider);

    let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&[&TLS12, &TLS13])
        .map_err(|e| GatewayError::Tls(format!("Failed to set TLS versions: {e}")))?;

    let builder = if auth_config.tls_strict {
        debug!("requiring verified client certificates");
        builder.with_client_cert_verifier(Arc::new(MtlsClientVerifier::new(
            true,
            webpki.clone(),
            &provider,
        )))
    } else if has_webui {
        // Requesting a client cert here would make browsers pop an mTLS
        // prompt on every visit to the web UI.
        debug!("web UI installed, not requesting client certificates");
        builder.with_no_client_auth()
    } else {
        debug!("requesting optional client certificates");
        builder.with_client_cert_verifier(Arc::new(MtlsClientVerifier::new(
            false,
            webpki.clone(),
            &provider,
        )))
    };

    let mut config = builder
        .with_single_cert(certs, key)
        .map_err(|e| GatewayError::Tls(format!("Failed to build TLS config: {e}")))?;

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(TlsContext { acceptor: TlsAcceptor::from(Arc::new(config)), webpki })
}
