use std::path::Path;

use chrono::Datelike;
use rand::rngs::OsRng;
use rand::TryRngCore;
use rcgen::{
    BasicConstraints, CertificateParams, CustomExtension, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SerialNumber,
};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::PrivateKeyDer;
use tracing::{debug, error, info, warn};
use x509_parser::pem::Pem;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::error::{GatewayError, Result};
use crate::tls::mutual::read_tlv;

/// Default on-disk location of the combined key + certificate PEM.
pub const CERT_FILE: &str = "/etc/ssl/certs/https/server.pem";

/// Certificate location used by very old firmware; removed at startup.
pub const LEGACY_CERT_FILE: &str = "/home/root/server.pem";

/// Marker placed in nsComment so rotation can tell generated
/// certificates from operator-provisioned ones.
pub const GENERATOR_COMMENT: &str = "Generated from OpenBMC service";

const NS_COMMENT_OID: &[u64] = &[2, 16, 840, 1, 113730, 1, 13];
const NS_COMMENT_OID_STR: &str = "2.16.840.1.113730.1.13";

/// Remove the legacy certificate path if present.  The file usually
/// does not exist; failures are ignored.
pub fn remove_legacy_certificate() {
    let _ = std::fs::remove_file(LEGACY_CERT_FILE);
}

/// Load `path` and validate it as a usable key + certificate bundle.
/// Returns the PEM contents on success.
pub fn verify_key_cert(path: &Path) -> Option<String> {
    info!(path = %path.display(), "checking certs in file");
    let contents = std::fs::read_to_string(path).ok()?;
    if !validate_key_cert(&contents) {
        return None;
    }
    Some(contents)
}

/// A bundle is valid when it contains a parseable private key and a
/// certificate inside its validity window.  Trust-chain conditions
/// (self-signed, unknown issuer) are deliberately not failures: the
/// normal state of this file is a self-signed certificate.
fn validate_key_cert(pem: &str) -> bool {
    if PrivateKeyDer::pem_slice_iter(pem.as_bytes())
        .filter_map(|k| k.ok())
        .next()
        .is_none()
    {
        error!("no private key found in certificate file");
        return false;
    }
    let Some(der) = first_certificate_der(pem) else {
        error!("no certificate found in certificate file");
        return false;
    };
    let Ok((_, cert)) = X509Certificate::from_der(&der) else {
        error!("certificate failed to parse");
        return false;
    };
    if !cert.validity().is_valid() {
        error!("certificate is outside its validity window");
        return false;
    }
    info!("certificate verification is success");
    true
}

fn first_certificate_der(pem: &str) -> Option<Vec<u8>> {
    for block in Pem::iter_from_buffer(pem.as_bytes()) {
        let block = block.ok()?;
        if block.label == "CERTIFICATE" {
            return Some(block.contents);
        }
    }
    None
}

/// Generate a fresh self-signed server certificate for `cn` and return
/// the private key and certificate as one PEM string.
///
/// EC P-384 key; X.509 v3; CSPRNG 31-bit serial (a fixed serial makes
/// browsers reject regenerated certificates); 10-year validity;
/// CA:TRUE critical, SAN DNS:cn, subject/authority key identifiers,
/// keyUsage digitalSignature+keyEncipherment, extendedKeyUsage
/// serverAuth, and the generator nsComment marker.
pub fn generate_ssl_certificate(cn: &str) -> Result<String> {
    info!("generating new keys");
    let mut params = CertificateParams::new(vec![cn.to_owned()])
        .map_err(|e| GatewayError::CertLifecycle(format!("invalid certificate params: {e}")))?;

    params.distinguished_name = rcgen::DistinguishedName::new();
    params.distinguished_name.push(DnType::CountryName, "US");
    params.distinguished_name.push(DnType::OrganizationName, "OpenBMC");
    params.distinguished_name.push(DnType::CommonName, cn);

    let serial = OsRng
        .try_next_u32()
        .map_err(|e| GatewayError::Internal(format!("CSPRNG failure: {e}")))?
        & 0x7fff_ffff;
    params.serial_number = Some(SerialNumber::from(u64::from(serial.max(1))));

    // valid from today for 10 years; day clamped so the expiry date
    // exists in every year
    let today = chrono::Utc::now().date_naive();
    let day = today.day().min(28) as u8;
    params.not_before = rcgen::date_time_ymd(today.year(), today.month() as u8, day);
    params.not_after = rcgen::date_time_ymd(today.year() + 10, today.month() as u8, day);

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.use_authority_key_identifier_extension = true;
    params.custom_extensions = vec![CustomExtension::from_oid_content(
        NS_COMMENT_OID,
        der_ia5_string(GENERATOR_COMMENT),
    )];

    let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
        .map_err(|e| GatewayError::CertLifecycle(format!("EC key generation failed: {e}")))?;
    let cert = params
        .self_signed(&key)
        .map_err(|e| GatewayError::CertLifecycle(format!("certificate signing failed: {e}")))?;

    let pem = format!("{}{}", key.serialize_pem(), cert.pem());
    info!(size = pem.len(), "generated certificate");
    Ok(pem)
}

fn der_ia5_string(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 2);
    out.push(0x16);
    out.push(value.len() as u8);
    out.extend_from_slice(value.as_bytes());
    out
}

/// Write a certificate bundle through a sibling temp file and an
/// atomic rename, so a crash never leaves a torn bundle behind.
pub fn write_certificate_to_file(path: &Path, pem: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, pem)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Regenerate the certificate when the system hostname no longer
/// matches its subject CN.  Only certificates this service generated
/// are replaced: the certificate must be self-signed and carry the
/// generator nsComment marker, so an operator-provisioned certificate
/// with an outdated CN is left alone.
pub fn regenerate_if_hostname_changed(path: &Path, hostname: &str) -> Result<()> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        error!(path = %path.display(), "failed to load cert");
        return Ok(());
    };
    let Some(der) = first_certificate_der(&contents) else {
        error!(path = %path.display(), "failed to load cert");
        return Ok(());
    };
    let Ok((_, cert)) = X509Certificate::from_der(&der) else {
        error!(path = %path.display(), "failed to parse cert");
        return Ok(());
    };

    let Some(cn) = subject_common_name(&cert) else {
        error!("failed to read certificate common name");
        return Ok(());
    };
    let self_signed = is_self_signed(&cert);
    let comment = ns_comment(&cert);
    debug!(
        current_cn = %cn,
        new_hostname = %hostname,
        self_signed,
        "checking certificate subject against hostname"
    );

    if comment.as_deref() == Some(GENERATOR_COMMENT) && self_signed && cn != hostname {
        info!(cn = %hostname, "generating new HTTPS certificate for changed hostname");
        let pem = generate_ssl_certificate(hostname)?;
        if let Err(e) = write_certificate_to_file(path, &pem) {
            error!("failed to install regenerated certificate: {e}");
        }
    }
    Ok(())
}

/// Remove the legacy file, make sure the certificate directory exists,
/// and return a validated (possibly freshly generated) bundle.
pub fn ensure_certificate(path: &Path, hostname: &str) -> Result<String> {
    remove_legacy_certificate();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    info!(path = %path.display(), "building SSL context");

    match verify_key_cert(path) {
        Some(_) => {
            regenerate_if_hostname_changed(path, hostname)?;
        }
        None => {
            warn!("error verifying certificate, regenerating");
            let pem = generate_ssl_certificate(hostname)?;
            write_certificate_to_file(path, &pem)?;
        }
    }

    verify_key_cert(path)
        .ok_or_else(|| GatewayError::CertLifecycle("certificate unusable after regeneration".into()))
}

fn subject_common_name(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_owned)
}

fn is_self_signed(cert: &X509Certificate<'_>) -> bool {
    cert.tbs_certificate.subject.as_raw() == cert.tbs_certificate.issuer.as_raw()
}

fn ns_comment(cert: &X509Certificate<'_>) -> Option<String> {
    let ext = cert
        .extensions()
        .iter()
        .find(|e| e.oid.to_id_string() == NS_COMMENT_OID_STR)?;
    let (tag, value, _) = read_tlv(ext.value)?;
    if tag != 0x16 {
        return None;
    }
    String::from_utf8(value.to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::GeneralName;

    fn parse(pem: &str) -> Vec<u8> {
        first_certificate_der(pem).expect("generated bundle must contain a certificate")
    }

    #[test]
    fn generated_bundle_contains_key_and_valid_cert() {
        let pem = generate_ssl_certificate("bmc-host").unwrap();
        assert!(validate_key_cert(&pem));
    }

    #[test]
    fn generated_cert_has_expected_subject_and_extensions() {
        let pem = generate_ssl_certificate("bmc-host").unwrap();
        let der = parse(&pem);
        let (_, cert) = X509Certificate::from_der(&der).unwrap();

        assert_eq!(subject_common_name(&cert).as_deref(), Some("bmc-host"));
        assert!(is_self_signed(&cert));
        assert_eq!(ns_comment(&cert).as_deref(), Some(GENERATOR_COMMENT));

        let san = cert.subject_alternative_name().unwrap().unwrap();
        assert!(san
            .value
            .general_names
            .iter()
            .any(|n| matches!(n, GeneralName::DNSName("bmc-host"))));

        let ku = cert.key_usage().unwrap().unwrap();
        assert!(ku.value.digital_signature());
        assert!(ku.value.key_encipherment());
        let eku = cert.extended_key_usage().unwrap().unwrap();
        assert!(eku.value.server_auth);

        let bc = cert.basic_constraints().unwrap().unwrap();
        assert!(bc.value.ca);
    }

    #[test]
    fn serial_is_31_bit() {
        let pem = generate_ssl_certificate("host").unwrap();
        let der = parse(&pem);
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        let serial = &cert.tbs_certificate.serial;
        assert!(serial.bits() <= 31, "serial must fit 31 bits, got {} bits", serial.bits());
        assert!(serial.bits() >= 1, "serial must be positive");
    }

    #[test]
    fn validate_rejects_garbage() {
        assert!(!validate_key_cert(""));
        assert!(!validate_key_cert("not pem at all"));
        // a key alone is not a usable bundle
        let pem = generate_ssl_certificate("host").unwrap();
        let key_only: String = pem
            .split_inclusive('\n')
            .take_while(|l| !l.contains("BEGIN CERTIFICATE"))
            .collect();
        assert!(!validate_key_cert(&key_only));
    }
}
