// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 sshfwd Contributors

// sshfwd - Address helpers shared by the endpoint, the SSH client and the CLI

use std::net::{IpAddr, Ipv6Addr};

/// True when binding `host` keeps the endpoint reachable from this machine only
///
/// Accepts `localhost`, loopback IP literals, bracketed IPv6 and IPv4-mapped
/// IPv6 loopback. Hostnames are never resolved.
pub fn is_loopback_address(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }

    match host.trim_matches(['[', ']']).parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => {
            v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
        }
        Ok(ip) => ip.is_loopback(),
        Err(_) => false,
    }
}

/// Join host and port into an address string, bracketing bare IPv6 literals
pub fn format_host_port(host: &str, port: u16) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_hosts() {
        for host in ["127.0.0.1", "127.8.8.8", "::1", "[::1]", "localhost", "LocalHost", "::ffff:127.0.0.1"] {
            assert!(is_loopback_address(host), "{} should be loopback", host);
        }
    }

    #[test]
    fn test_exposed_hosts() {
        for host in ["0.0.0.0", "::", "10.1.2.3", "::ffff:10.1.2.3", "bastion.example.com", ""] {
            assert!(!is_loopback_address(host), "{} should not be loopback", host);
        }
    }

    #[test]
    fn test_format_host_port() {
        assert_eq!(format_host_port("127.0.0.1", 9000), "127.0.0.1:9000");
        assert_eq!(format_host_port("bastion", 22), "bastion:22");
        assert_eq!(format_host_port("::1", 8080), "[::1]:8080");
        assert_eq!(format_host_port("fe80::1", 443), "[fe80::1]:443");
    }
}
