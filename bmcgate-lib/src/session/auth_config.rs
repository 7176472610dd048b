use serde_json::{json, Map, Value};
use tracing::warn;

/// Strategy used to derive a local username from a client certificate
/// subject during mutual TLS authentication.
///
/// The numeric values are persisted to disk and must be kept stable
/// between releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtlsCommonNameParseMode {
    Invalid = 0,
    Whole = 1,
    CommonName = 2,
    UserPrincipalName = 3,
    // Intentional gap for future DMTF-defined values; OEM modes start at 100
    Meta = 100,
}

impl MtlsCommonNameParseMode {
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::Invalid),
            1 => Some(Self::Whole),
            2 => Some(Self::CommonName),
            3 => Some(Self::UserPrincipalName),
            100 => Some(Self::Meta),
            _ => None,
        }
    }
}

/// Per-method authentication policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfigMethods {
    pub basic: bool,
    pub session_token: bool,
    pub xtoken: bool,
    pub cookie: bool,
    pub tls: bool,
    /// When true, connections without a valid client certificate are
    /// rejected during the handshake.  Defaults to false because root
    /// certificates are not provisioned at first boot.
    pub tls_strict: bool,
    pub mtls_common_name_parsing_mode: MtlsCommonNameParseMode,
}

impl Default for AuthConfigMethods {
    fn default() -> Self {
        Self {
            basic: true,
            session_token: true,
            xtoken: true,
            cookie: true,
            tls: true,
            tls_strict: false,
            mtls_common_name_parsing_mode: MtlsCommonNameParseMode::CommonName,
        }
    }
}

impl AuthConfigMethods {
    /// Apply fields from a persisted JSON object.  Unknown members and
    /// members of the wrong type are ignored; an out-of-range parse mode
    /// is ignored with a warning so an older build never crashes on a
    /// newer file.
    pub fn apply_json(&mut self, obj: &Map<String, Value>) {
        for (key, value) in obj {
            if let Some(flag) = value.as_bool() {
                match key.as_str() {
                    "XToken" => self.xtoken = flag,
                    "Cookie" => self.cookie = flag,
                    "SessionToken" => self.session_token = flag,
                    "BasicAuth" => self.basic = flag,
                    "TLS" => self.tls = flag,
                    "TLSStrict" => self.tls_strict = flag,
                    _ => {}
                }
            }
            if let Some(raw) = value.as_u64() {
                if key == "MTLSCommonNameParseMode" {
                    match MtlsCommonNameParseMode::from_u64(raw) {
                        Some(mode) => self.mtls_common_name_parsing_mode = mode,
                        None => {
                            warn!(value = raw, "MTLSCommonNameParseMode out of range, ignoring");
                        }
                    }
                }
            }
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "XToken": self.xtoken,
            "Cookie": self.cookie,
            "SessionToken": self.session_token,
            "BasicAuth": self.basic,
            "TLS": self.tls,
            "TLSStrict": self.tls_strict,
            "MTLSCommonNameParseMode": self.mtls_common_name_parsing_mode as u64,
        })
    }
}
