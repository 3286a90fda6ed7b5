//! Lookups against IANA registries: the root zone TLD list and the
//! special-purpose address registries.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::OnceLock;
use ipnet::IpNet;

static TLDS: OnceLock<HashSet<&'static str>> = OnceLock::new();

fn tlds() -> &'static HashSet<&'static str> {
    TLDS.get_or_init(|| {
        include_str!("tlds.txt")
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect()
    })
}

/// Returns the IANA-registered TLD the domain ends with, or `None` if the
/// rightmost label is not a registered TLD. The caller decides whether a
/// domain equal to its suffix is acceptable.
pub fn extract_suffix(domain: &str) -> Option<&str> {
    let tld = domain.rsplit('.').next()?;
    if tlds().contains(tld) {
        Some(tld)
    } else {
        None
    }
}

static RESERVED_V4: OnceLock<Vec<(IpNet, &'static str)>> = OnceLock::new();
static RESERVED_V6: OnceLock<Vec<(IpNet, &'static str)>> = OnceLock::new();

fn reserved_v4() -> &'static Vec<(IpNet, &'static str)> {
    RESERVED_V4.get_or_init(|| {
        [
            ("0.0.0.0/8", "\"This network\""),
            ("10.0.0.0/8", "Private-Use"),
            ("100.64.0.0/10", "Shared Address Space"),
            ("127.0.0.0/8", "Loopback"),
            ("169.254.0.0/16", "Link Local"),
            ("172.16.0.0/12", "Private-Use"),
            ("192.0.0.0/24", "IETF Protocol Assignments"),
            ("192.0.2.0/24", "Documentation (TEST-NET-1)"),
            ("192.31.196.0/24", "AS112-v4"),
            ("192.52.193.0/24", "AMT"),
            ("192.88.99.0/24", "6to4 Relay Anycast"),
            ("192.168.0.0/16", "Private-Use"),
            ("192.175.48.0/24", "Direct Delegation AS112 Service"),
            ("198.18.0.0/15", "Benchmarking"),
            ("198.51.100.0/24", "Documentation (TEST-NET-2)"),
            ("203.0.113.0/24", "Documentation (TEST-NET-3)"),
            ("224.0.0.0/4", "Multicast"),
            ("240.0.0.0/4", "Reserved"),
            ("255.255.255.255/32", "Limited Broadcast"),
        ]
        .into_iter()
        .map(|(p, name)| (p.parse().unwrap(), name))
        .collect()
    })
}

fn reserved_v6() -> &'static Vec<(IpNet, &'static str)> {
    RESERVED_V6.get_or_init(|| {
        [
            ("::/128", "Unspecified Address"),
            ("::1/128", "Loopback Address"),
            ("::ffff:0:0/96", "IPv4-mapped Address"),
            ("64:ff9b::/96", "IPv4-IPv6 Translation"),
            ("64:ff9b:1::/48", "IPv4-IPv6 Translation"),
            ("100::/64", "Discard-Only Address Block"),
            ("2001::/23", "IETF Protocol Assignments"),
            ("2001:db8::/32", "Documentation"),
            ("2002::/16", "6to4"),
            ("3fff::/20", "Documentation"),
            ("5f00::/16", "Segment Routing (SRv6) SIDs"),
            ("fc00::/7", "Unique-Local"),
            ("fe80::/10", "Link-Local Unicast"),
            ("ff00::/8", "Multicast"),
        ]
        .into_iter()
        .map(|(p, name)| (p.parse().unwrap(), name))
        .collect()
    })
}

/// Returns the name of the special-purpose registry entry covering the
/// address, or `None` when the address is globally routable.
pub fn reserved_addr_registry(addr: IpAddr) -> Option<&'static str> {
    let table = match addr {
        IpAddr::V4(_) => reserved_v4(),
        IpAddr::V6(_) => reserved_v6(),
    };
    table
        .iter()
        .find(|(net, _)| net.contains(&addr))
        .map(|(_, name)| *name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn suffix_extraction() {
        assert_eq!(extract_suffix("www.example.com"), Some("com"));
        assert_eq!(extract_suffix("com"), Some("com"));
        assert_eq!(extract_suffix("example.invalid"), None);
        assert_eq!(extract_suffix("example.notatld"), None);
    }

    #[test]
    fn reserved_addresses() {
        for addr in ["10.1.2.3", "127.0.0.1", "192.0.2.7", "198.51.100.1", "fe80::1", "2001:db8::1", "::1"] {
            let addr = IpAddr::from_str(addr).unwrap();
            assert!(reserved_addr_registry(addr).is_some(), "{} should be reserved", addr);
        }
        for addr in ["93.184.216.34", "8.8.8.8", "2600:1406:3a00:21::173e:2e65"] {
            let addr = IpAddr::from_str(addr).unwrap();
            assert!(reserved_addr_registry(addr).is_none(), "{} should be routable", addr);
        }
    }
}
