use tokio_rustls::rustls::crypto::{aws_lc_rs, CryptoProvider};
use tokio_rustls::rustls::CipherSuite;

// The AEAD subset of the Mozilla Intermediate v5.7 policy that rustls
// implements, plus the TLS 1.3 suites the policy implies.  The DHE-RSA
// suites from the policy have no rustls implementation.
const MOZILLA_INTERMEDIATE: &[CipherSuite] = &[
    CipherSuite::TLS13_AES_128_GCM_SHA256,
    CipherSuite::TLS13_AES_256_GCM_SHA384,
    CipherSuite::TLS13_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
];

/// Crypto provider restricted to the gateway's cipher policy.
pub fn restricted_provider() -> CryptoProvider {
    let mut provider = aws_lc_rs::default_provider();
    provider
        .cipher_suites
        .retain(|suite| MOZILLA_INTERMEDIATE.contains(&suite.suite()));
    provider
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_keeps_only_policy_suites() {
        let provider = restricted_provider();
        assert!(!provider.cipher_suites.is_empty());
        for suite in &provider.cipher_suites {
            assert!(
                MOZILLA_INTERMEDIATE.contains(&suite.suite()),
                "unexpected suite {:?}",
                suite.suite()
            );
        }
    }

    #[test]
    fn provider_retains_tls13_suites() {
        let provider = restricted_provider();
        assert!(provider
            .cipher_suites
            .iter()
            .any(|s| s.suite() == CipherSuite::TLS13_AES_256_GCM_SHA384));
    }
}
