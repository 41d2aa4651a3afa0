//! Base-URL derivation from the configuration record.

use crate::store::config::Configuration;

/// Derives the externally reachable base URL.
///
/// An empty host means `localhost`; a non-zero proxy port replaces the
/// listen port; 443 implies https; 80 and 443 are omitted from the URL.
#[must_use]
pub fn base_url(cfg: &Configuration) -> String {
    let host = if cfg.host.is_empty() {
        "localhost"
    } else {
        cfg.host.as_str()
    };
    let port = if cfg.proxy_port == 0 {
        cfg.port
    } else {
        cfg.proxy_port
    };
    let scheme = if port == 443 { "https" } else { "http" };

    if port == 80 || port == 443 {
        format!("{scheme}://{host}")
    } else {
        format!("{scheme}://{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(host: &str, port: u16, proxy_port: u16) -> Configuration {
        Configuration {
            host: host.to_string(),
            port,
            proxy_port,
            ..Configuration::default()
        }
    }

    #[test]
    fn test_empty_host_falls_back_to_localhost() {
        assert_eq!(base_url(&cfg("", 8080, 0)), "http://localhost:8080");
    }

    #[test]
    fn test_proxy_port_wins_over_listen_port() {
        assert_eq!(base_url(&cfg("example.com", 8080, 9000)), "http://example.com:9000");
    }

    #[test]
    fn test_well_known_ports_are_hidden() {
        assert_eq!(base_url(&cfg("example.com", 80, 0)), "http://example.com");
        assert_eq!(base_url(&cfg("example.com", 443, 0)), "https://example.com");
        assert_eq!(base_url(&cfg("example.com", 8080, 443)), "https://example.com");
    }
}
