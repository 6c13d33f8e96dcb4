use std::collections::HashMap;

use thiserror::Error;

use crate::config::UpstreamConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    /// The host did not carry a single-label subdomain under any proxy domain.
    #[error("invalid host: missing subdomain")]
    MissingSubdomain,
    /// The subdomain matched no configured upstream.
    #[error("unknown upstream: {0}")]
    UnknownUpstream(String),
}

/// Strips an optional `:port` suffix and lower-cases the host.
fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = match host.rsplit_once(':') {
        // Reject IPv6 literals from the port split; they contain ':' inside brackets.
        Some((h, port)) if port.chars().all(|c| c.is_ascii_digit()) && !h.contains(']') => h,
        _ => host,
    };
    host.to_ascii_lowercase()
}

/// Extracts the upstream name from `<name>.<domain>` for any configured base
/// domain. The prefix must be a single DNS label; deeper prefixes and the bare
/// domain itself select nothing.
pub fn extract_subdomain(host: &str, proxy_domains: &[String]) -> Option<String> {
    let host = normalize_host(host);
    for domain in proxy_domains {
        let domain = domain.trim().to_ascii_lowercase();
        if domain.is_empty() {
            continue;
        }
        let Some(prefix) = host.strip_suffix(&format!(".{domain}")) else {
            continue;
        };
        if !prefix.is_empty() && !prefix.contains('.') {
            return Some(prefix.to_string());
        }
    }
    None
}

/// True when the host is one of the configured console hostnames.
pub fn is_ui_host(host: &str, ui_hosts: &[String]) -> bool {
    let host = normalize_host(host);
    ui_hosts
        .iter()
        .any(|h| h.trim().eq_ignore_ascii_case(&host))
}

/// Resolves the inbound host to `(upstream name, upstream config)`.
pub fn resolve_upstream<'a>(
    host: &str,
    proxy_domains: &[String],
    upstreams: &'a HashMap<String, UpstreamConfig>,
) -> Result<(String, &'a UpstreamConfig), RouteError> {
    let name = extract_subdomain(host, proxy_domains).ok_or(RouteError::MissingSubdomain)?;
    match upstreams.get(&name) {
        Some(upstream) => Ok((name, upstream)),
        None => Err(RouteError::UnknownUpstream(name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn domains(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn extracts_single_label_prefix_ignoring_case_and_port() {
        assert_eq!(
            extract_subdomain("Openai.Localhost:8080", &domains(&["LOCALHOST"])),
            Some("openai".to_string())
        );
        assert_eq!(
            extract_subdomain("anthropic.proxy.example.com", &domains(&["proxy.example.com"])),
            Some("anthropic".to_string())
        );
    }

    #[test]
    fn rejects_multi_label_prefix_and_bare_domain() {
        assert_eq!(
            extract_subdomain("a.b.example.com", &domains(&["example.com"])),
            None
        );
        assert_eq!(extract_subdomain("example.com", &domains(&["example.com"])), None);
        assert_eq!(extract_subdomain("localhost", &domains(&["localhost"])), None);
    }

    #[test]
    fn unrelated_hosts_match_nothing() {
        assert_eq!(extract_subdomain("openai.other.io", &domains(&["localhost"])), None);
        assert_eq!(extract_subdomain("", &domains(&["localhost"])), None);
    }

    #[test]
    fn ui_host_match_is_exact_and_case_insensitive() {
        let ui = domains(&["prismcat.localhost"]);
        assert!(is_ui_host("PrismCat.Localhost:8788", &ui));
        assert!(!is_ui_host("other.localhost", &ui));
        assert!(!is_ui_host("sub.prismcat.localhost", &ui));
    }

    #[test]
    fn resolve_distinguishes_missing_from_unknown() {
        let mut upstreams = HashMap::new();
        upstreams.insert(
            "openai".to_string(),
            UpstreamConfig {
                target: "https://api.openai.com".to_string(),
                timeout_secs: 120,
            },
        );
        let domains = domains(&["localhost"]);

        assert!(matches!(
            resolve_upstream("localhost:8788", &domains, &upstreams),
            Err(RouteError::MissingSubdomain)
        ));
        assert!(matches!(
            resolve_upstream("nope.localhost", &domains, &upstreams),
            Err(RouteError::UnknownUpstream(name)) if name == "nope"
        ));
        let (name, up) = resolve_upstream("OPENAI.localhost:1", &domains, &upstreams).unwrap();
        assert_eq!(name, "openai");
        assert_eq!(up.target, "https://api.openai.com");
    }
}
