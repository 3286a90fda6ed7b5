//! Policy decisions: identifier well-formedness, blocklists, and challenge
//! selection.

use std::collections::HashSet;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::RwLock;
use ipnet::IpNet;

use crate::errors::{self, Error, SubError};
use crate::identifier::{AcmeIdentifier, ChallengeType, IdentifierType};

const MAX_LABELS: usize = 10;
// RFC 1035 caps names at 255 octets; the leading length byte and trailing
// root dot leave 253 for the textual form.
const MAX_LABEL_LENGTH: usize = 63;
const MAX_DNS_IDENTIFIER_LENGTH: usize = 253;

pub struct Authority {
    enabled_challenges: HashSet<ChallengeType>,
    enabled_identifiers: HashSet<IdentifierType>,
    blocklists: RwLock<Option<Blocklists>>,
}

struct Blocklists {
    // Label-wise suffix matches: HighRiskBlockedNames + AdminBlockedNames.
    domain: HashSet<String>,
    // Exact matches only.
    fqdn: HashSet<String>,
    // Base domains whose wildcard would cover an entry of `fqdn`.
    wildcard_fqdn: HashSet<String>,
    ip_prefixes: Vec<IpNet>,
}

/// On-disk shape of the identifier policy file.
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct BlockedIdentsPolicy {
    #[serde(rename = "ExactBlockedNames", default)]
    pub exact_blocked_names: Vec<String>,
    #[serde(rename = "HighRiskBlockedNames", default)]
    pub high_risk_blocked_names: Vec<String>,
    #[serde(rename = "AdminBlockedNames", default)]
    pub admin_blocked_names: Vec<String>,
    #[serde(rename = "AdminBlockedPrefixes", default)]
    pub admin_blocked_prefixes: Vec<String>,
}

impl Authority {
    pub fn new(
        enabled_identifiers: HashSet<IdentifierType>,
        enabled_challenges: HashSet<ChallengeType>,
    ) -> Authority {
        Authority {
            enabled_challenges,
            enabled_identifiers,
            blocklists: RwLock::new(None),
        }
    }

    /// Loads the identifier policy YAML at `path` and atomically swaps all
    /// four blocklist tables. Empty HighRisk or Exact lists are a load error.
    pub fn load_ident_policy_file(&self, path: &str) -> errors::Result<()> {
        let raw = std::fs::read(path)
            .map_err(|e| Error::internal(format!("failed to read identifier policy: {}", e)))?;
        let digest = openssl::sha::sha256(&raw);
        info!("loading identifier policy, sha256: {}", hex::encode(digest));
        let policy: BlockedIdentsPolicy = serde_yaml::from_slice(&raw)
            .map_err(|e| Error::internal(format!("failed to parse identifier policy: {}", e)))?;
        self.process_ident_policy(policy)
    }

    /// Validates and installs a parsed policy. Every ExactBlockedNames entry
    /// also registers its parent domain in the wildcard-exact table so that
    /// `*.parent` cannot cover a blocked name.
    pub fn process_ident_policy(&self, policy: BlockedIdentsPolicy) -> errors::Result<()> {
        if policy.high_risk_blocked_names.is_empty() {
            return Err(Error::internal("no entries in HighRiskBlockedNames"));
        }
        if policy.exact_blocked_names.is_empty() {
            return Err(Error::internal("no entries in ExactBlockedNames"));
        }

        let mut domain = HashSet::new();
        for name in policy.high_risk_blocked_names.iter().chain(policy.admin_blocked_names.iter()) {
            domain.insert(name.to_lowercase());
        }

        let mut fqdn = HashSet::new();
        let mut wildcard_fqdn = HashSet::new();
        for name in &policy.exact_blocked_names {
            let name = name.to_lowercase();
            match name.split_once('.') {
                Some((_, parent)) => {
                    wildcard_fqdn.insert(parent.to_string());
                }
                None => {
                    return Err(Error::internal(format!(
                        "malformed ExactBlockedNames entry, only one label: {:?}", name
                    )));
                }
            }
            fqdn.insert(name);
        }

        let mut ip_prefixes = Vec::with_capacity(policy.admin_blocked_prefixes.len());
        for prefix in &policy.admin_blocked_prefixes {
            let prefix = IpNet::from_str(prefix).map_err(|_| {
                Error::internal(format!(
                    "malformed AdminBlockedPrefixes entry, not a prefix: {:?}", prefix
                ))
            })?;
            ip_prefixes.push(prefix);
        }

        let mut lists = self.blocklists.write()
            .map_err(|_| Error::internal("identifier policy lock poisoned"))?;
        *lists = Some(Blocklists { domain, fqdn, wildcard_fqdn, ip_prefixes });
        Ok(())
    }

    /// Determines whether the CA is willing to issue for the identifiers:
    /// everything `well_formed_identifiers` checks, plus the blocklists.
    pub fn willing_to_issue(&self, idents: &[AcmeIdentifier]) -> errors::Result<()> {
        well_formed_identifiers(idents)?;

        let mut sub_errors = vec![];
        for ident in idents {
            if !self.identifier_type_enabled(ident.identifier_type) {
                sub_errors.push(sub_error(ident, Error::rejected_identifier(
                    "The ACME server has disabled this identifier type",
                )));
                continue;
            }

            if ident.is_wildcard() {
                let base = ident.value.trim_start_matches("*.");
                if let Err(err) = self.check_wildcard_blocklist(base) {
                    sub_errors.push(sub_error(ident, err));
                    continue;
                }
            }

            if let Err(err) = self.check_blocklists(ident) {
                sub_errors.push(sub_error(ident, err));
                continue;
            }
        }
        errors::combine_sub_errors(sub_errors)
    }

    fn check_wildcard_blocklist(&self, base: &str) -> errors::Result<()> {
        let lists = self.blocklists.read()
            .map_err(|_| Error::internal("identifier policy lock poisoned"))?;
        let lists = lists.as_ref()
            .ok_or_else(|| Error::internal("identifier policy not yet loaded"))?;
        if lists.wildcard_fqdn.contains(base) {
            return Err(policy_forbidden());
        }
        Ok(())
    }

    fn check_blocklists(&self, ident: &AcmeIdentifier) -> errors::Result<()> {
        let lists = self.blocklists.read()
            .map_err(|_| Error::internal("identifier policy lock poisoned"))?;
        let lists = lists.as_ref()
            .ok_or_else(|| Error::internal("identifier policy not yet loaded"))?;

        match ident.identifier_type {
            IdentifierType::Dns => {
                let labels = ident.value.split('.').collect::<Vec<_>>();
                for i in 0..labels.len() {
                    if lists.domain.contains(&labels[i..].join(".")) {
                        return Err(policy_forbidden());
                    }
                }
                if lists.fqdn.contains(&ident.value) {
                    return Err(policy_forbidden());
                }
            }
            IdentifierType::Ip => {
                let addr = IpAddr::from_str(&ident.value)
                    .map_err(|_| Error::malformed("IP address is invalid"))?;
                for prefix in &lists.ip_prefixes {
                    if prefix.contains(&addr) {
                        return Err(policy_forbidden());
                    }
                }
            }
        }
        Ok(())
    }

    /// The challenge types acceptable for the identifier. Decided purely from
    /// the identifier so filtering by enabled types can happen per request.
    pub fn challenge_types_for(&self, ident: &AcmeIdentifier) -> errors::Result<Vec<ChallengeType>> {
        match ident.identifier_type {
            IdentifierType::Dns => {
                // BRs 3.2.2.4.19/.20: HTTP-01 and TLS-ALPN-01 cannot validate
                // wildcard domains.
                if ident.is_wildcard() {
                    Ok(vec![ChallengeType::Dns01])
                } else {
                    Ok(vec![ChallengeType::Http01, ChallengeType::Dns01, ChallengeType::TlsAlpn01])
                }
            }
            // RFC 8738, Sec. 4.
            IdentifierType::Ip => Ok(vec![ChallengeType::Http01, ChallengeType::TlsAlpn01]),
        }
    }

    pub fn challenge_type_enabled(&self, t: ChallengeType) -> bool {
        self.enabled_challenges.contains(&t)
    }

    pub fn identifier_type_enabled(&self, t: IdentifierType) -> bool {
        self.enabled_identifiers.contains(&t)
    }

    /// Checks that an authorization was fulfilled by a challenge type that is
    /// currently enabled and applicable to its identifier.
    pub fn check_authz_challenges(
        &self,
        ident: &AcmeIdentifier,
        solved_by: ChallengeType,
    ) -> errors::Result<()> {
        if !self.challenge_type_enabled(solved_by) {
            return Err(Error::unauthorized("authorization fulfilled by disabled challenge type"));
        }
        if !self.challenge_types_for(ident)?.contains(&solved_by) {
            return Err(Error::unauthorized("authorization fulfilled by inapplicable challenge type"));
        }
        Ok(())
    }
}

fn policy_forbidden() -> Error {
    Error::rejected_identifier(
        "The ACME server refuses to issue a certificate for this domain name, \
         because it is forbidden by policy",
    )
}

fn sub_error(ident: &AcmeIdentifier, err: Error) -> SubError {
    SubError { identifier: ident.clone(), error: err }
}

/// Checks every identifier for well-formedness, collecting one sub-error per
/// offending identifier.
pub fn well_formed_identifiers(idents: &[AcmeIdentifier]) -> errors::Result<()> {
    let mut sub_errors = vec![];
    for ident in idents {
        let result = match ident.identifier_type {
            IdentifierType::Dns => valid_domain(&ident.value),
            IdentifierType::Ip => valid_ip(&ident.value),
        };
        if let Err(err) = result {
            sub_errors.push(sub_error(ident, err));
        }
    }
    errors::combine_sub_errors(sub_errors)
}

/// Checks that a domain is valid, including at most one wildcard label in the
/// leftmost position. Case-insensitive; blocklists are not consulted.
pub fn valid_domain(domain: &str) -> errors::Result<()> {
    let domain = domain.to_lowercase();

    let wildcards = domain.matches('*').count();
    if wildcards == 0 {
        return valid_non_wildcard_domain(&domain);
    }
    if wildcards > 1 {
        return Err(Error::malformed("Domain name has more than one wildcard"));
    }
    let base = match domain.strip_prefix("*.") {
        Some(base) => base,
        None => {
            return Err(Error::malformed(
                "Domain name contains an invalid wildcard. A wildcard is only \
                 permitted before the first dot in a domain name",
            ));
        }
    };

    // The wildcard label must not sit immediately adjacent to the TLD.
    let tld = crate::iana::extract_suffix(base)
        .ok_or_else(|| Error::malformed("Domain name does not end with a valid public suffix (TLD)"))?;
    if base == tld {
        return Err(Error::malformed("Domain name is a wildcard for an ICANN TLD"));
    }
    valid_non_wildcard_domain(base)
}

/// Checks a non-wildcard domain against Preferred Name Syntax plus the IANA
/// suffix requirement. Case-insensitive; blocklists are not consulted.
pub fn valid_non_wildcard_domain(domain: &str) -> errors::Result<()> {
    let domain = domain.to_lowercase();

    if domain.is_empty() {
        return Err(Error::malformed("Identifier value (name) is empty"));
    }
    if domain.starts_with("*.") {
        return Err(Error::malformed("Wildcard domain names are not supported"));
    }
    for ch in domain.bytes() {
        if !(ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == b'.' || ch == b'-') {
            return Err(Error::malformed("Domain name contains an invalid character"));
        }
    }
    if domain.len() > MAX_DNS_IDENTIFIER_LENGTH {
        return Err(Error::malformed("Domain name is longer than 253 bytes"));
    }
    if IpAddr::from_str(&domain).is_ok() {
        return Err(Error::malformed("Identifier type is DNS but value is an IP address"));
    }
    if domain.ends_with('.') {
        return Err(Error::malformed("Domain name ends in a dot"));
    }

    let labels = domain.split('.').collect::<Vec<_>>();
    if labels.len() > MAX_LABELS {
        return Err(Error::malformed("Domain name has more than 10 labels (parts)"));
    }
    if labels.len() < 2 {
        return Err(Error::malformed("Domain name needs at least one dot"));
    }
    for label in &labels {
        if label.is_empty() {
            return Err(Error::malformed("Domain name can not have two dots in a row"));
        }
        if label.len() > MAX_LABEL_LENGTH {
            return Err(Error::malformed(
                "Domain has a label (component between dots) longer than 63 bytes",
            ));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(Error::malformed("Domain name contains an invalid character"));
        }

        // Reserved LDH labels ("??--", RFC 5890 2.3.1): only valid xn--
        // P-labels whose Unicode form is NFC-normalized are acceptable.
        if label.len() >= 4 && &label[2..4] == "--" {
            if &label[0..2] != "xn" {
                return Err(Error::rejected_identifier(
                    "Domain name contains an invalid label in a reserved format (R-LDH: '??--')",
                ));
            }
            let (ulabel, result) = idna::domain_to_unicode(label);
            if result.is_err() {
                return Err(Error::malformed("Domain name contains malformed punycode"));
            }
            if !unicode_normalization::is_nfc(&ulabel) {
                return Err(Error::malformed("Domain name contains malformed punycode"));
            }
        }
    }

    // Names must end in an IANA TLD, but must not be equal to one.
    let tld = crate::iana::extract_suffix(&domain)
        .ok_or_else(|| Error::malformed("Domain name does not end with a valid public suffix (TLD)"))?;
    if tld == domain {
        return Err(Error::malformed("Domain name is an ICANN TLD"));
    }
    Ok(())
}

/// Checks that an IP address is non-empty, in RFC 5952 canonical text form,
/// carries no scope zone, and sits outside the IANA special-purpose
/// registries. Blocklists are not consulted.
pub fn valid_ip(ip: &str) -> errors::Result<()> {
    if ip.is_empty() {
        return Err(Error::malformed("Identifier value (name) is empty"));
    }

    // RFC 8738, Sec. 3 requires the canonical textual form; parsing and
    // re-serializing detects non-canonical input. Scope zones never parse.
    let addr = match IpAddr::from_str(ip) {
        Ok(addr) if addr.to_string() == ip => addr,
        _ => return Err(Error::malformed("IP address is invalid")),
    };

    if let Some(registry) = crate::iana::reserved_addr_registry(addr) {
        return Err(Error::rejected_identifier(format!(
            "IP address is in the {} special-purpose registry", registry
        )));
    }
    Ok(())
}

// RFC 2606 domains show up whenever a subscriber copy-pastes an example
// configuration; mail to them reaches nobody.
const FORBIDDEN_MAIL_DOMAINS: [&str; 3] = ["example.com", "example.net", "example.org"];

/// Validates a contact email address: parseable, a valid non-wildcard domain
/// after the `@`, and not a documentation domain.
pub fn valid_email(address: &str) -> errors::Result<()> {
    let (local, domain) = address
        .rsplit_once('@')
        .ok_or_else(|| Error::invalid_email("unable to parse email address"))?;
    if local.is_empty() || local.contains(|c: char| c.is_whitespace() || c == '<' || c == '>') {
        return Err(Error::invalid_email("unable to parse email address"));
    }
    let domain = domain.to_lowercase();
    valid_non_wildcard_domain(&domain)
        .map_err(|err| Error::invalid_email(format!("contact email has invalid domain: {}", err)))?;
    if FORBIDDEN_MAIL_DOMAINS.contains(&domain.as_str()) {
        return Err(Error::invalid_email(format!(
            "contact email has forbidden domain {:?}", domain
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    fn test_authority() -> Authority {
        let pa = Authority::new(
            HashSet::from([IdentifierType::Dns, IdentifierType::Ip]),
            HashSet::from([ChallengeType::Http01, ChallengeType::Dns01, ChallengeType::TlsAlpn01]),
        );
        pa.process_ident_policy(BlockedIdentsPolicy {
            exact_blocked_names: vec!["hi.example.com".to_string()],
            high_risk_blocked_names: vec!["highrisk.org".to_string()],
            admin_blocked_names: vec!["blocked.net".to_string()],
            admin_blocked_prefixes: vec!["64.112.117.0/24".to_string()],
        }).unwrap();
        pa
    }

    #[test]
    fn domain_validity_is_case_insensitive() {
        for d in ["example.com", "EXAMPLE.COM", "WwW.ExAmPlE.cOm", "*.EXAMPLE.com"] {
            assert_eq!(
                valid_domain(d).is_ok(),
                valid_domain(&d.to_lowercase()).is_ok(),
                "{}", d
            );
            assert!(valid_domain(d).is_ok(), "{}", d);
        }
    }

    #[test]
    fn rejects_malformed_domains() {
        let cases = [
            ("", "empty"),
            ("com", "bare TLD"),
            ("example.", "trailing dot"),
            ("example..com", "double dot"),
            (".example.com", "leading dot"),
            ("under_score.example.com", "underscore"),
            ("-leading.example.com", "leading hyphen"),
            ("trailing-.example.com", "trailing hyphen"),
            ("example.invalid", "unregistered suffix"),
            ("192.0.2.1", "IP in DNS identifier"),
            ("a.b.c.d.e.f.g.h.i.j.com", "too many labels"),
            ("ab--cd.example.com", "reserved LDH label"),
            ("*.*.example.com", "two wildcards"),
            ("foo.*.example.com", "inner wildcard"),
            ("*.com", "wildcard of a TLD"),
        ];
        for (domain, why) in cases {
            assert!(valid_domain(domain).is_err(), "{} ({})", domain, why);
        }

        let long_label = format!("{}.example.com", "a".repeat(64));
        assert!(valid_domain(&long_label).is_err());
        let long_name = format!("{}.example.com", "a.".repeat(130));
        assert!(valid_domain(&long_name).is_err());
    }

    #[test]
    fn accepts_valid_punycode_labels() {
        // "bücher" in punycode.
        assert!(valid_domain("xn--bcher-kva.example.com").is_ok());
        // R-LDH prefix other than xn-- is reserved.
        assert!(valid_domain("ab--cd.example.com").is_err());
    }

    #[test]
    fn ip_validity() {
        assert!(valid_ip("93.184.216.34").is_ok());
        assert!(valid_ip("2600:1406:3a00:21::173e:2e65").is_ok());

        // Zones, non-canonical forms and reserved space all fail.
        assert!(valid_ip("fe80::1%eth0").is_err());
        assert!(valid_ip("192.168.000.001").is_err());
        assert!(valid_ip("2600:1406:3A00:21::173E:2E65").is_err());
        assert!(valid_ip("2600:1406:3a00:0021:0000:0000:173e:2e65").is_err());
        assert!(valid_ip("10.0.0.1").is_err());
        assert!(valid_ip("2001:db8::1").is_err());
        assert!(valid_ip("").is_err());
    }

    #[test]
    fn exact_blocklist_blocks_name_and_covering_wildcard() {
        let pa = test_authority();

        // The exact name and the wildcard that would cover it.
        assert!(pa.willing_to_issue(&[AcmeIdentifier::dns("hi.example.com")]).is_err());
        assert!(pa.willing_to_issue(&[AcmeIdentifier::dns("*.example.com")]).is_err());

        // Parent, child, and sibling are unaffected.
        assert!(pa.willing_to_issue(&[AcmeIdentifier::dns("example.com")]).is_ok());
        assert!(pa.willing_to_issue(&[AcmeIdentifier::dns("z.hi.example.com")]).is_ok());
        assert!(pa.willing_to_issue(&[AcmeIdentifier::dns("lo.example.com")]).is_ok());
    }

    #[test]
    fn high_risk_blocklist_blocks_whole_subtree() {
        let pa = test_authority();
        for name in ["highrisk.org", "a.highrisk.org", "*.a.highrisk.org", "blocked.net", "www.blocked.net"] {
            assert!(pa.willing_to_issue(&[AcmeIdentifier::dns(name)]).is_err(), "{}", name);
        }
        // Similar but distinct suffixes are unaffected.
        assert!(pa.willing_to_issue(&[AcmeIdentifier::dns("nothighrisk.org")]).is_ok());
    }

    #[test]
    fn ip_prefix_blocklist() {
        let pa = test_authority();
        assert!(pa.willing_to_issue(&[AcmeIdentifier::ip("64.112.117.50")]).is_err());
        assert!(pa.willing_to_issue(&[AcmeIdentifier::ip("64.112.118.50")]).is_ok());
    }

    #[test]
    fn multiple_bad_identifiers_produce_sub_errors() {
        let pa = test_authority();
        let err = pa.willing_to_issue(&[
            AcmeIdentifier::dns("hi.example.com"),
            AcmeIdentifier::dns("highrisk.org"),
            AcmeIdentifier::dns("fine.example.com"),
        ]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::RejectedIdentifier);
        assert_eq!(err.sub_errors.len(), 2);
    }

    #[test]
    fn empty_policy_lists_are_a_load_error() {
        let pa = Authority::new(HashSet::from([IdentifierType::Dns]), HashSet::new());
        assert!(pa.process_ident_policy(BlockedIdentsPolicy {
            exact_blocked_names: vec![],
            high_risk_blocked_names: vec!["x.com".to_string()],
            ..Default::default()
        }).is_err());
        assert!(pa.process_ident_policy(BlockedIdentsPolicy {
            exact_blocked_names: vec!["x.y.com".to_string()],
            high_risk_blocked_names: vec![],
            ..Default::default()
        }).is_err());
    }

    #[test]
    fn challenge_selection() {
        let pa = test_authority();
        assert_eq!(
            pa.challenge_types_for(&AcmeIdentifier::dns("*.example.com")).unwrap(),
            vec![ChallengeType::Dns01]
        );
        assert_eq!(
            pa.challenge_types_for(&AcmeIdentifier::dns("www.example.com")).unwrap(),
            vec![ChallengeType::Http01, ChallengeType::Dns01, ChallengeType::TlsAlpn01]
        );
        assert_eq!(
            pa.challenge_types_for(&AcmeIdentifier::ip("93.184.216.34")).unwrap(),
            vec![ChallengeType::Http01, ChallengeType::TlsAlpn01]
        );
    }

    #[test]
    fn authz_challenge_check() {
        let pa = test_authority();
        let wildcard = AcmeIdentifier::dns("*.example.com");
        assert!(pa.check_authz_challenges(&wildcard, ChallengeType::Dns01).is_ok());
        assert!(pa.check_authz_challenges(&wildcard, ChallengeType::Http01).is_err());
        // dns-account-01 is applicable to nothing while disabled.
        assert!(pa
            .check_authz_challenges(&AcmeIdentifier::dns("a.example.com"), ChallengeType::DnsAccount01)
            .is_err());
    }

    #[test]
    fn email_validation() {
        assert!(valid_email("admin@real-domain.com").is_ok());
        assert!(valid_email("nobody@example.com").is_err());
        assert!(valid_email("not-an-email").is_err());
        assert!(valid_email("user@no-suffix.invalid").is_err());
        assert!(valid_email("@missing-local.com").is_err());
    }
}
