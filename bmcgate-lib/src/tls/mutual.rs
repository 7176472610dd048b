use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use rustls_pki_types::{CertificateDer, UnixTime};
use tokio_rustls::rustls::crypto::{
    verify_tls12_signature, verify_tls13_signature, CryptoProvider, WebPkiSupportedAlgorithms,
};
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{
    DigitallySignedStruct, DistinguishedName, Error as TlsError, RootCertStore, SignatureScheme,
};
use tracing::{debug, info, warn};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::session::{MtlsCommonNameParseMode, SessionStore, SessionType, UserSession};

// Microsoft User Principal Name otherName
const UPN_OID: &str = "1.3.6.1.4.1.311.20.2.3";

/// Client-certificate policy for the handshake.
///
/// In strict mode a client must present a chain that validates against
/// the provisioned CAs or the handshake fails.  Otherwise the
/// certificate request is advisory: any chain (or none) is accepted and
/// identity extraction decides after the handshake whether it grants a
/// login.
#[derive(Debug)]
pub struct MtlsClientVerifier {
    mandatory: bool,
    webpki: Option<Arc<dyn ClientCertVerifier>>,
    supported: WebPkiSupportedAlgorithms,
}

impl MtlsClientVerifier {
    pub fn new(
        mandatory: bool,
        webpki: Option<Arc<dyn ClientCertVerifier>>,
        provider: &CryptoProvider,
    ) -> Self {
        Self { mandatory, webpki, supported: provider.signature_verification_algorithms }
    }
}

impl ClientCertVerifier for MtlsClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        self.mandatory
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, TlsError> {
        match &self.webpki {
            Some(verifier) => match verifier.verify_client_cert(end_entity, intermediates, now) {
                Ok(verified) => Ok(verified),
                Err(e) if !self.mandatory => {
                    debug!("client certificate failed verification, continuing without identity: {e}");
                    Ok(ClientCertVerified::assertion())
                }
                Err(e) => Err(e),
            },
            None if self.mandatory => {
                Err(TlsError::General("no client CA certificates provisioned".into()))
            }
            None => Ok(ClientCertVerified::assertion()),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<tokio_rustls::rustls::client::danger::HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(message, cert, dss, &self.supported)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<tokio_rustls::rustls::client::danger::HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(message, cert, dss, &self.supported)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported.supported_schemes()
    }
}

/// Read every PEM certificate under `dir` into a root store.  An empty
/// or missing directory yields an empty store, which disables mutual
/// TLS identities rather than failing startup.
pub fn load_trust_store(dir: &Path) -> RootCertStore {
    let mut roots = RootCertStore::empty();
    let Ok(entries) = std::fs::read_dir(dir) else {
        debug!(path = %dir.display(), "trust store directory not readable");
        return roots;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Ok(bytes) = std::fs::read(&path) else {
            continue;
        };
        let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_slice_iter(&bytes)
            .filter_map(|c| c.ok())
            .collect();
        let (added, ignored) = roots.add_parsable_certificates(certs);
        if added > 0 || ignored > 0 {
            debug!(path = %path.display(), added, ignored, "loaded trust store file");
        }
    }
    roots
}

/// Build the webpki verifier used both during the handshake and for
/// post-handshake identity preverification.  `None` when no CA
/// certificates are provisioned.
pub fn build_webpki_verifier(
    roots: RootCertStore,
    provider: &Arc<CryptoProvider>,
) -> Option<Arc<dyn ClientCertVerifier>> {
    if roots.is_empty() {
        return None;
    }
    match WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(provider)).build()
    {
        Ok(verifier) => Some(verifier),
        Err(e) => {
            warn!("failed to build client certificate verifier: {e}");
            None
        }
    }
}

/// Derive a session from the peer's certificate chain, applying the
/// configured parse mode.  Any parsing or verification shortfall
/// produces "no identity", never a connection error: the handshake
/// already decided whether a certificate was mandatory.
pub fn verify_mtls_user(
    peer_chain: &[CertificateDer<'_>],
    client_ip: &IpAddr,
    store: &SessionStore,
    webpki: Option<&Arc<dyn ClientCertVerifier>>,
    hostname: &str,
) -> Option<UserSession> {
    let config = store.auth_config();
    if !config.tls {
        debug!("TLS auth_config is disabled");
        return None;
    }

    let (leaf, intermediates) = peer_chain.split_first()?;

    // The OpenSSL-style "preverified" input: the chain must validate
    // against the provisioned CAs before the leaf grants any identity.
    let verifier = webpki?;
    if let Err(e) = verifier.verify_client_cert(leaf, intermediates, UnixTime::now()) {
        info!("client certificate chain did not verify: {e}");
        return None;
    }

    let (_, cert) = X509Certificate::from_der(leaf.as_ref()).ok()?;

    if !check_client_purpose(&cert) {
        debug!("certificate not usable for TLS client authentication");
        return None;
    }

    let username = match config.mtls_common_name_parsing_mode {
        MtlsCommonNameParseMode::CommonName => subject_common_name(&cert),
        MtlsCommonNameParseMode::UserPrincipalName => {
            user_principal_name(&cert).and_then(|upn| match upn.split_once('@') {
                Some((local, domain)) => {
                    if domain == hostname {
                        Some(local.to_owned())
                    } else {
                        warn!(domain, hostname, "UPN domain does not match this host");
                        None
                    }
                }
                None => Some(upn),
            })
        }
        MtlsCommonNameParseMode::Meta => {
            subject_common_name(&cert).and_then(|cn| parse_meta_ssl_user(&cn).map(str::to_owned))
        }
        MtlsCommonNameParseMode::Whole | MtlsCommonNameParseMode::Invalid => None,
    };

    let username = username?;
    if username.is_empty() {
        warn!("failed to get user from certificate subject");
        return None;
    }

    store
        .generate(&username, client_ip, None, SessionType::MutualTls, false)
        .ok()
}

/// keyUsage must include digitalSignature and keyAgreement, and
/// extendedKeyUsage must include clientAuth.
fn check_client_purpose(cert: &X509Certificate<'_>) -> bool {
    let Ok(Some(key_usage)) = cert.key_usage() else {
        return false;
    };
    if !key_usage.value.digital_signature() || !key_usage.value.key_agreement() {
        return false;
    }
    let Ok(Some(eku)) = cert.extended_key_usage() else {
        return false;
    };
    eku.value.client_auth
}

fn subject_common_name(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_owned)
}

/// Extract the UPN otherName from the subject alternative names.
fn user_principal_name(cert: &X509Certificate<'_>) -> Option<String> {
    let san = cert.subject_alternative_name().ok().flatten()?;
    for name in &san.value.general_names {
        if let GeneralName::OtherName(oid, value) = name {
            if oid.to_id_string() == UPN_OID {
                return parse_wrapped_utf8(value);
            }
        }
    }
    None
}

/// The otherName value is `[0] EXPLICIT UTF8String`.  Unwrap the
/// context tag when present and decode the inner UTF8String.
fn parse_wrapped_utf8(bytes: &[u8]) -> Option<String> {
    let (tag, value, _) = read_tlv(bytes)?;
    let (tag, value) = if tag == 0xa0 {
        let (inner_tag, inner, _) = read_tlv(value)?;
        (inner_tag, inner)
    } else {
        (tag, value)
    };
    if tag != 0x0c {
        return None;
    }
    String::from_utf8(value.to_vec()).ok()
}

/// Minimal DER TLV reader for short- and long-form lengths.
pub(crate) fn read_tlv(bytes: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let (&tag, rest) = bytes.split_first()?;
    let (&first_len, rest) = rest.split_first()?;
    let (len, rest) = if first_len < 0x80 {
        (usize::from(first_len), rest)
    } else {
        let count = usize::from(first_len & 0x7f);
        if count == 0 || count > 4 || rest.len() < count {
            return None;
        }
        let mut len = 0usize;
        for &b in &rest[..count] {
            len = (len << 8) | usize::from(b);
        }
        (len, &rest[count..])
    };
    if rest.len() < len {
        return None;
    }
    Some((tag, &rest[..len], &rest[len..]))
}

/// Parse a Meta-internal client certificate subject CN in
/// `<entityType>:<entity>[/<hostname>]` form and return the POSIX user
/// name.  Only `entityType = "user"` is supported.
///
/// Example: "user:a_username/hostname" -> "a_username"
pub fn parse_meta_ssl_user(ssl_user: &str) -> Option<&str> {
    let Some((entity_type, rest)) = ssl_user.split_once(':') else {
        warn!(subject = ssl_user, "invalid Meta TLS client cert subject CN");
        return None;
    };
    if entity_type != "user" {
        warn!(entity_type, "unsupported entityType in Meta TLS client cert subject CN");
        return None;
    }

    let entity = match rest.split_once('/') {
        Some((entity, _hostname)) => entity,
        None => rest,
    };

    if entity.is_empty() {
        debug!(subject = ssl_user, "empty entity in Meta TLS client cert subject CN");
        return None;
    }
    if !entity
        .bytes()
        .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' | b'.'))
    {
        warn!(entity, "invalid entity in Meta TLS client cert subject CN");
        return None;
    }

    Some(entity)
}
