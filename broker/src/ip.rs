//! The forwarded-vs-direct client IP trust rule (spec.md §4.2.2).
//!
//! Grounded on `examples/original_source/ssh/session.go`'s `register`: the
//! original resolves `net.LookupIP("ws")` and compares it against the
//! operator's TCP peer address. When they match, the connection arrived
//! through the ingress proxy and the operator-supplied `IP_ADDRESS`
//! environment variable is trusted; otherwise the TCP peer address is used
//! directly and any client-supplied override is ignored.

use std::net::IpAddr;

/// Pure decision function, split out from DNS resolution so the trust rule
/// itself is unit-testable without a real resolver
/// (`examples/AnalyseDeCircuit-oxideterm/src-tauri/src/commands/kbi.rs` and
/// `distant-ssh2`'s `lookup_host` usage do the resolution; the comparison
/// here mirrors the original's `if ipaddr[0].String() == host` branch
/// exactly, including the original's quirk that a forwarded connection with
/// no `IP_ADDRESS` override registers an empty string rather than falling
/// back to the peer address).
pub fn trust_rule(peer_ip: IpAddr, ingress_ip: Option<IpAddr>, ip_override: Option<&str>) -> String {
    match ingress_ip {
        Some(ip) if ip == peer_ip => ip_override.unwrap_or_default().to_string(),
        _ => peer_ip.to_string(),
    }
}

/// Resolves `ingress_hostname` and applies [`trust_rule`]. DNS failures are
/// treated as "not forwarded" (no ingress match), so the peer IP is used
/// directly — the original propagates a hard error from `net.LookupIP`, but
/// since an unresolvable ingress hostname cannot produce a forwarded
/// connection either, falling back is equivalent and avoids failing session
/// setup on a transient resolver hiccup.
pub async fn resolve_client_ip(peer_ip: IpAddr, ingress_hostname: &str, ip_override: Option<&str>) -> String {
    let ingress_ip = tokio::net::lookup_host((ingress_hostname, 0))
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .map(|addr| addr.ip());

    trust_rule(peer_ip, ingress_ip, ip_override)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_connection_honors_override() {
        let peer: IpAddr = "10.0.0.5".parse().unwrap();
        let ingress: IpAddr = "10.0.0.5".parse().unwrap();
        assert_eq!(trust_rule(peer, Some(ingress), Some("203.0.113.9")), "203.0.113.9");
    }

    #[test]
    fn forwarded_connection_without_override_is_empty() {
        let peer: IpAddr = "10.0.0.5".parse().unwrap();
        let ingress: IpAddr = "10.0.0.5".parse().unwrap();
        assert_eq!(trust_rule(peer, Some(ingress), None), "");
    }

    #[test]
    fn direct_connection_uses_peer_ip_even_with_override() {
        let peer: IpAddr = "198.51.100.20".parse().unwrap();
        let ingress: IpAddr = "10.0.0.5".parse().unwrap();
        assert_eq!(
            trust_rule(peer, Some(ingress), Some("203.0.113.9")),
            "198.51.100.20"
        );
    }

    #[test]
    fn unresolvable_ingress_falls_back_to_peer_ip() {
        let peer: IpAddr = "198.51.100.20".parse().unwrap();
        assert_eq!(trust_rule(peer, None, Some("203.0.113.9")), "198.51.100.20");
    }
}
