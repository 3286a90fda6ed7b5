//! Rate limits: GCRA token buckets over a shared TAT store, with per-limit
//! defaults and per-bucket overrides.

pub mod gcra;
pub mod limit;
pub mod limiter;
pub mod source;

use std::net::{IpAddr, Ipv6Addr};

use crate::errors::{self, Error};
use crate::identifier::{AcmeIdentifier, IdentifierType};

/// The rate limits this service enforces. The numeric value is the wire and
/// bucket-key enum; it must never be reordered.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone)]
pub enum Name {
    NewRegistrationsPerIPAddress = 1,
    NewRegistrationsPerIPv6Range = 2,
    NewOrdersPerAccount = 3,
    FailedAuthorizationsPerDomainPerAccount = 4,
    CertificatesPerDomain = 5,
    CertificatesPerFQDNSet = 6,
    FailedAuthorizationsForPausingPerDomainPerAccount = 7,
}

pub const LIMIT_NAMES: [Name; 7] = [
    Name::NewRegistrationsPerIPAddress,
    Name::NewRegistrationsPerIPv6Range,
    Name::NewOrdersPerAccount,
    Name::FailedAuthorizationsPerDomainPerAccount,
    Name::CertificatesPerDomain,
    Name::CertificatesPerFQDNSet,
    Name::FailedAuthorizationsForPausingPerDomainPerAccount,
];

impl Name {
    pub fn enum_value(&self) -> i64 {
        *self as i64
    }

    pub fn from_enum_value(v: i64) -> Option<Name> {
        LIMIT_NAMES.iter().copied().find(|n| n.enum_value() == v)
    }

    pub fn from_config_name(s: &str) -> Option<Name> {
        LIMIT_NAMES.iter().copied().find(|n| n.to_string() == s)
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Name::NewRegistrationsPerIPAddress => "NewRegistrationsPerIPAddress",
            Name::NewRegistrationsPerIPv6Range => "NewRegistrationsPerIPv6Range",
            Name::NewOrdersPerAccount => "NewOrdersPerAccount",
            Name::FailedAuthorizationsPerDomainPerAccount => "FailedAuthorizationsPerDomainPerAccount",
            Name::CertificatesPerDomain => "CertificatesPerDomain",
            Name::CertificatesPerFQDNSet => "CertificatesPerFQDNSet",
            Name::FailedAuthorizationsForPausingPerDomainPerAccount => {
                "FailedAuthorizationsForPausingPerDomainPerAccount"
            }
        })
    }
}

fn join_with_colon(name: Name, id: &str) -> String {
    format!("{}:{}", name.enum_value(), id)
}

/// Bucket key for NewRegistrationsPerIPAddress.
pub fn new_registrations_per_ip_key(ip: IpAddr) -> String {
    join_with_colon(Name::NewRegistrationsPerIPAddress, &ip.to_string())
}

/// Bucket key for NewRegistrationsPerIPv6Range: the covering /48.
pub fn new_registrations_per_ipv6_range_key(ip: Ipv6Addr) -> errors::Result<String> {
    let prefix = ipnet::Ipv6Net::new(ip, 48)
        .map_err(|e| Error::internal(format!("computing /48 prefix: {}", e)))?
        .trunc();
    Ok(join_with_colon(Name::NewRegistrationsPerIPv6Range, &prefix.to_string()))
}

/// Bucket key for NewOrdersPerAccount.
pub fn new_orders_per_account_key(reg_id: i64) -> String {
    join_with_colon(Name::NewOrdersPerAccount, &reg_id.to_string())
}

/// Bucket key for the failed-authorizations limits: `regID:identifier`.
pub fn failed_authorizations_key(name: Name, reg_id: i64, ident: &AcmeIdentifier) -> String {
    join_with_colon(name, &format!("{}:{}", reg_id, ident.value))
}

/// Bucket key for CertificatesPerDomain: the registered domain for DNS
/// identifiers, or the covering /32 (IPv4) / /64 (IPv6) prefix for IPs.
pub fn certificates_per_domain_key(ident: &AcmeIdentifier) -> errors::Result<String> {
    Ok(join_with_colon(Name::CertificatesPerDomain, &covering_identifier(ident)?))
}

/// Bucket key for CertificatesPerFQDNSet over the whole identifier set.
pub fn certificates_per_fqdn_set_key(idents: &[AcmeIdentifier]) -> String {
    join_with_colon(
        Name::CertificatesPerFQDNSet,
        &hex::encode(crate::identifier::hash_identifiers(idents)),
    )
}

/// The accounting unit covering an identifier: eTLD+1 for DNS names, a /32 or
/// /64 prefix for addresses.
pub fn covering_identifier(ident: &AcmeIdentifier) -> errors::Result<String> {
    match ident.identifier_type {
        IdentifierType::Dns => {
            let base = ident.value.trim_start_matches("*.");
            let tld = crate::iana::extract_suffix(base).ok_or_else(|| {
                Error::internal(format!("no registered suffix for {:?}", ident.value))
            })?;
            if base == tld {
                return Err(Error::internal(format!(
                    "identifier {:?} is a bare public suffix", ident.value
                )));
            }
            let prefix = &base[..base.len() - tld.len() - 1];
            let registered_label = prefix.rsplit('.').next().unwrap_or(prefix);
            Ok(format!("{}.{}", registered_label, tld))
        }
        IdentifierType::Ip => {
            let addr: IpAddr = ident.value.parse()
                .map_err(|_| Error::internal(format!("invalid IP identifier {:?}", ident.value)))?;
            let net = match addr {
                IpAddr::V4(v4) => ipnet::IpNet::V4(
                    ipnet::Ipv4Net::new(v4, 32)
                        .map_err(|e| Error::internal(format!("computing /32 prefix: {}", e)))?,
                ),
                IpAddr::V6(v6) => ipnet::IpNet::V6(
                    ipnet::Ipv6Net::new(v6, 64)
                        .map_err(|e| Error::internal(format!("computing /64 prefix: {}", e)))?
                        .trunc(),
                ),
            };
            Ok(net.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_key_shapes() {
        assert_eq!(
            new_registrations_per_ip_key("192.0.2.1".parse().unwrap()),
            "1:192.0.2.1"
        );
        assert_eq!(
            new_registrations_per_ipv6_range_key("2001:db8:aaaa:bbbb::1".parse().unwrap()).unwrap(),
            "2:2001:db8:aaaa::/48"
        );
        assert_eq!(new_orders_per_account_key(42), "3:42");
        assert_eq!(
            failed_authorizations_key(
                Name::FailedAuthorizationsPerDomainPerAccount,
                7,
                &AcmeIdentifier::dns("foo.example.com"),
            ),
            "4:7:foo.example.com"
        );
    }

    #[test]
    fn covering_identifiers() {
        assert_eq!(
            covering_identifier(&AcmeIdentifier::dns("www.sub.example.com")).unwrap(),
            "example.com"
        );
        assert_eq!(
            covering_identifier(&AcmeIdentifier::dns("example.com")).unwrap(),
            "example.com"
        );
        assert_eq!(
            covering_identifier(&AcmeIdentifier::dns("*.example.com")).unwrap(),
            "example.com"
        );
        assert_eq!(
            covering_identifier(&AcmeIdentifier::ip("93.184.216.34")).unwrap(),
            "93.184.216.34/32"
        );
        assert_eq!(
            covering_identifier(&AcmeIdentifier::ip("2600:1406:3a00:21::173e:2e65")).unwrap(),
            "2600:1406:3a00:21::/64"
        );
    }

    #[test]
    fn fqdn_set_key_is_order_invariant() {
        let a = certificates_per_fqdn_set_key(&[
            AcmeIdentifier::dns("a.example.com"),
            AcmeIdentifier::dns("b.example.com"),
        ]);
        let b = certificates_per_fqdn_set_key(&[
            AcmeIdentifier::dns("b.example.com"),
            AcmeIdentifier::dns("a.example.com"),
        ]);
        assert_eq!(a, b);
        assert!(a.starts_with("6:"));
    }

    #[test]
    fn name_enum_round_trip() {
        for name in LIMIT_NAMES {
            assert_eq!(Name::from_enum_value(name.enum_value()), Some(name));
            assert_eq!(Name::from_config_name(&name.to_string()), Some(name));
        }
        assert_eq!(Name::from_enum_value(0), None);
        assert_eq!(Name::from_config_name("NoSuchLimit"), None);
    }
}
