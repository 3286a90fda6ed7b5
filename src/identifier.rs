use std::cmp::Ordering;
use std::net::IpAddr;
use std::str::FromStr;

/// The kind of an ACME identifier. Stored in Postgres as the
/// `identifier_type` enum.
#[derive(DbEnum, Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierType {
    Dns,
    Ip,
}

/// A challenge type as defined by RFC 8555 and its extensions. Stored in
/// Postgres as the `challenge_type` enum.
#[derive(DbEnum, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Copy, Clone)]
pub enum ChallengeType {
    #[db_rename = "http-01"]
    #[serde(rename = "http-01")]
    Http01,
    #[db_rename = "dns-01"]
    #[serde(rename = "dns-01")]
    Dns01,
    #[db_rename = "tls-alpn-01"]
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
    #[db_rename = "dns-account-01"]
    #[serde(rename = "dns-account-01")]
    DnsAccount01,
}

impl ChallengeType {
    /// Bit used in the authorization row's offered-challenges bitmap.
    pub fn bit(&self) -> i16 {
        match self {
            ChallengeType::Http01 => 1 << 0,
            ChallengeType::Dns01 => 1 << 1,
            ChallengeType::TlsAlpn01 => 1 << 2,
            ChallengeType::DnsAccount01 => 1 << 3,
        }
    }

    pub fn from_bit(bit: i16) -> Option<ChallengeType> {
        match bit {
            0b0001 => Some(ChallengeType::Http01),
            0b0010 => Some(ChallengeType::Dns01),
            0b0100 => Some(ChallengeType::TlsAlpn01),
            0b1000 => Some(ChallengeType::DnsAccount01),
            _ => None,
        }
    }

    pub fn to_pb(&self) -> crate::cert_ra::ChallengeType {
        match self {
            ChallengeType::Http01 => crate::cert_ra::ChallengeType::Http01,
            ChallengeType::Dns01 => crate::cert_ra::ChallengeType::Dns01,
            ChallengeType::TlsAlpn01 => crate::cert_ra::ChallengeType::TlsAlpn01,
            ChallengeType::DnsAccount01 => crate::cert_ra::ChallengeType::DnsAccount01,
        }
    }

    pub fn from_pb(pb: crate::cert_ra::ChallengeType) -> Option<ChallengeType> {
        match pb {
            crate::cert_ra::ChallengeType::Http01 => Some(ChallengeType::Http01),
            crate::cert_ra::ChallengeType::Dns01 => Some(ChallengeType::Dns01),
            crate::cert_ra::ChallengeType::TlsAlpn01 => Some(ChallengeType::TlsAlpn01),
            crate::cert_ra::ChallengeType::DnsAccount01 => Some(ChallengeType::DnsAccount01),
            crate::cert_ra::ChallengeType::Unspecified => None,
        }
    }
}

impl std::fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ChallengeType::Http01 => "http-01",
            ChallengeType::Dns01 => "dns-01",
            ChallengeType::TlsAlpn01 => "tls-alpn-01",
            ChallengeType::DnsAccount01 => "dns-account-01",
        })
    }
}

/// A tagged ACME identifier. Values are held lowercased; `normalize` is
/// applied on every ingress path before storage or comparison.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub struct AcmeIdentifier {
    #[serde(rename = "type")]
    pub identifier_type: IdentifierType,
    pub value: String,
}

impl AcmeIdentifier {
    pub fn dns(value: &str) -> AcmeIdentifier {
        AcmeIdentifier {
            identifier_type: IdentifierType::Dns,
            value: value.to_string(),
        }
    }

    pub fn ip(value: &str) -> AcmeIdentifier {
        AcmeIdentifier {
            identifier_type: IdentifierType::Ip,
            value: value.to_string(),
        }
    }

    pub fn normalize(&self) -> AcmeIdentifier {
        AcmeIdentifier {
            identifier_type: self.identifier_type,
            value: self.value.to_lowercase(),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.identifier_type == IdentifierType::Dns && self.value.starts_with("*.")
    }

    pub fn to_pb(&self) -> crate::cert_ra::Identifier {
        crate::cert_ra::Identifier {
            r#type: match self.identifier_type {
                IdentifierType::Dns => crate::cert_ra::IdentifierType::Dns,
                IdentifierType::Ip => crate::cert_ra::IdentifierType::Ip,
            }.into(),
            value: self.value.clone(),
        }
    }

    pub fn from_pb(pb: &crate::cert_ra::Identifier) -> Option<AcmeIdentifier> {
        let identifier_type = match crate::cert_ra::IdentifierType::from_i32(pb.r#type) {
            Some(crate::cert_ra::IdentifierType::Dns) => IdentifierType::Dns,
            Some(crate::cert_ra::IdentifierType::Ip) => IdentifierType::Ip,
            _ => return None,
        };
        Some(AcmeIdentifier {
            identifier_type,
            value: pb.value.clone(),
        })
    }
}

impl std::fmt::Display for AcmeIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.value)
    }
}

impl PartialOrd for AcmeIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AcmeIdentifier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identifier_type
            .cmp(&other.identifier_type)
            .then_with(|| self.value.cmp(&other.value))
    }
}

/// Lowercases, sorts and de-duplicates a set of identifiers. The result is
/// the canonical form used for FQDN set hashing and order storage.
pub fn normalize_identifiers(idents: &[AcmeIdentifier]) -> Vec<AcmeIdentifier> {
    let mut out = idents.iter().map(AcmeIdentifier::normalize).collect::<Vec<_>>();
    out.sort();
    out.dedup();
    out
}

/// SHA-256 over the sorted, comma-joined, lowercased identifier values.
/// Permutation and case invariant by construction.
pub fn hash_identifiers(idents: &[AcmeIdentifier]) -> Vec<u8> {
    let normalized = normalize_identifiers(idents);
    let joined = normalized.iter()
        .map(|i| i.value.as_str())
        .collect::<Vec<_>>()
        .join(",");
    openssl::sha::sha256(joined.as_bytes()).to_vec()
}

/// Encodes an identifier value for the `issued_names` table: DNS names have
/// their labels reversed (`www.example.com` -> `com.example.www`) so suffix
/// queries become prefix queries; IP addresses stay in canonical text form.
pub fn encode_issued_name(value: &str) -> String {
    if let Ok(addr) = IpAddr::from_str(value) {
        return addr.to_string();
    }
    reverse_fqdn(value)
}

fn reverse_fqdn(fqdn: &str) -> String {
    let mut labels = fqdn.split('.').collect::<Vec<_>>();
    labels.reverse();
    labels.join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_hash_is_permutation_and_case_invariant() {
        let a = vec![AcmeIdentifier::dns("Example.COM"), AcmeIdentifier::dns("www.example.com")];
        let b = vec![AcmeIdentifier::dns("www.example.com"), AcmeIdentifier::dns("example.com")];
        assert_eq!(hash_identifiers(&a), hash_identifiers(&b));

        let c = vec![AcmeIdentifier::dns("www.example.com")];
        assert_ne!(hash_identifiers(&a), hash_identifiers(&c));
    }

    #[test]
    fn identifier_hash_dedups() {
        let a = vec![AcmeIdentifier::dns("example.com"), AcmeIdentifier::dns("EXAMPLE.com")];
        let b = vec![AcmeIdentifier::dns("example.com")];
        assert_eq!(hash_identifiers(&a), hash_identifiers(&b));
    }

    #[test]
    fn issued_name_encoding() {
        assert_eq!(encode_issued_name("www.example.com"), "com.example.www");
        assert_eq!(encode_issued_name("example.com"), "com.example");
        assert_eq!(encode_issued_name("192.0.2.1"), "192.0.2.1");
        assert_eq!(encode_issued_name("2001:db8::1"), "2001:db8::1");
    }

    #[test]
    fn challenge_bits_round_trip() {
        for t in [ChallengeType::Http01, ChallengeType::Dns01, ChallengeType::TlsAlpn01, ChallengeType::DnsAccount01] {
            assert_eq!(ChallengeType::from_bit(t.bit()), Some(t));
        }
        assert_eq!(ChallengeType::from_bit(0), None);
        assert_eq!(ChallengeType::from_bit(0b0011), None);
    }
}
