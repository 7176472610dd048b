use std::path::Path;

use crate::config::Config;
use crate::error::{GatewayError, Result};

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Config> {
    let txt = std::fs::read_to_string(p)
        .map_err(|e| GatewayError::Config(format!("Failed to read config file: {e}")))?;
    let cfg: Config = toml::from_str(&txt)
        .map_err(|e| GatewayError::Config(format!("Failed to parse config: {e}")))?;

    validate_config(&cfg)?;

    Ok(cfg)
}

fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.http.body_limit_mb == 0 {
        return Err(GatewayError::Config("body_limit_mb must be at least 1".to_owned()));
    }
    if let Some(fd) = cfg.listen_fd {
        // 0..2 are the standard streams; an inherited listener is
        // always handed over above them
        if fd < 3 {
            return Err(GatewayError::Config(format!(
                "listen_fd must be an inherited descriptor (>= 3), got {fd}"
            )));
        }
    }
    if cfg.shutdown_secs == 0 {
        return Err(GatewayError::Config("shutdown_secs must be at least 1".to_owned()));
    }
    for route in &cfg.webroutes {
        if !route.starts_with('/') {
            return Err(GatewayError::Config(format!(
                "webroute must be an absolute path: {route}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_empty_config() {
        let cfg: Config = toml::from_str("").unwrap();
        assert!(cfg.tls.enabled);
        assert_eq!(cfg.port(), 443);
        assert_eq!(cfg.body_limit(), 1024 * 1024);
        assert_eq!(cfg.listen.to_string(), "0.0.0.0");
    }

    #[test]
    fn plain_http_defaults_to_port_80() {
        let cfg: Config = toml::from_str("[tls]\nenabled = false\n").unwrap();
        assert_eq!(cfg.port(), 80);
    }

    #[test]
    fn explicit_port_wins() {
        let cfg: Config = toml::from_str("port = 8443\n").unwrap();
        assert_eq!(cfg.port(), 8443);
    }

    #[test]
    fn listen_fd_accepts_inherited_descriptors() {
        let cfg: Config = toml::from_str("listen_fd = 3\n").unwrap();
        assert_eq!(cfg.listen_fd, Some(3));
        assert!(validate_config(&cfg).is_ok());
    }

    #[test]
    fn listen_fd_rejects_standard_streams() {
        for fd in [-1i32, 0, 1, 2] {
            let cfg: Config = toml::from_str(&format!("listen_fd = {fd}\n")).unwrap();
            assert!(validate_config(&cfg).is_err(), "fd {fd}");
        }
    }

    #[test]
    fn webroutes_must_be_absolute() {
        let cfg: Config = toml::from_str("webroutes = [\"index.html\"]\n").unwrap();
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn zero_body_limit_rejected() {
        let cfg: Config = toml::from_str("[http]\nbody_limit_mb = 0\n").unwrap();
        assert!(validate_config(&cfg).is_err());
    }
}
