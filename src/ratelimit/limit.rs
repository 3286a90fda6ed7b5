//! Limit configuration: validated defaults and per-bucket overrides, loaded
//! from YAML or the overrides table.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use crate::errors::{self, Error};
use crate::identifier::AcmeIdentifier;
use super::Name;

/// Parses a Go-style duration string: an integer count followed by one of
/// ns/us/ms/s/m/h, repeated ("1h30m").
pub fn parse_duration(s: &str) -> errors::Result<Duration> {
    let malformed = || Error::internal(format!("invalid duration {:?}", s));
    if s.is_empty() {
        return Err(malformed());
    }
    let mut total_ns: u128 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).ok_or_else(malformed)?;
        if digits == 0 {
            return Err(malformed());
        }
        let value: u128 = rest[..digits].parse().map_err(|_| malformed())?;
        rest = &rest[digits..];
        let (unit_ns, len) = if rest.starts_with("ns") {
            (1, 2)
        } else if rest.starts_with("us") {
            (1_000, 2)
        } else if rest.starts_with("ms") {
            (1_000_000, 2)
        } else if rest.starts_with('s') {
            (1_000_000_000, 1)
        } else if rest.starts_with('m') {
            (60 * 1_000_000_000, 1)
        } else if rest.starts_with('h') {
            (3600 * 1_000_000_000u128, 1)
        } else {
            return Err(malformed());
        };
        total_ns += value * unit_ns;
        rest = &rest[len..];
    }
    Ok(Duration::from_nanos(total_ns.try_into().map_err(|_| malformed())?))
}

fn deserialize_duration<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    use serde::Deserialize;
    let s = String::deserialize(d)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

/// The exportable configuration of a limit: the three user-facing knobs
/// without the precomputed internals.
#[derive(Deserialize, Debug, Clone)]
pub struct LimitConfig {
    #[serde(rename = "Burst")]
    pub burst: i64,
    #[serde(rename = "Count")]
    pub count: i64,
    #[serde(rename = "Period", deserialize_with = "deserialize_duration")]
    pub period: Duration,
    /// Whether a TAT store transport failure lets the request through. The
    /// severe certificate-count limits are the candidates for `false`.
    #[serde(rename = "FailOpen", default = "default_fail_open")]
    pub fail_open: bool,
}

fn default_fail_open() -> bool {
    true
}

/// A fully validated limit, default or override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limit {
    pub burst: i64,
    pub count: i64,
    pub period: Duration,
    pub name: Name,
    pub comment: String,
    pub is_override: bool,
    pub fail_open: bool,
    // period / count: the steady-state interval between two permitted
    // requests once the burst is exhausted.
    emission_interval_ns: i64,
    // emission_interval * burst: how long an empty bucket takes to fill.
    burst_offset_ns: i64,
}

impl Limit {
    pub fn new(name: Name, config: &LimitConfig) -> errors::Result<Limit> {
        let mut limit = Limit {
            burst: config.burst,
            count: config.count,
            period: config.period,
            name,
            comment: String::new(),
            is_override: false,
            fail_open: config.fail_open,
            emission_interval_ns: 0,
            burst_offset_ns: 0,
        };
        limit.validate()?;
        limit.precompute();
        Ok(limit)
    }

    fn validate(&self) -> errors::Result<()> {
        if self.burst <= 0 {
            return Err(Error::internal(format!("invalid burst '{}', must be > 0", self.burst)));
        }
        if self.count <= 0 {
            return Err(Error::internal(format!("invalid count '{}', must be > 0", self.count)));
        }
        if self.period.is_zero() {
            return Err(Error::internal("invalid period, must be > 0"));
        }
        Ok(())
    }

    fn precompute(&mut self) {
        self.emission_interval_ns = (self.period.as_nanos() as i64) / self.count;
        self.burst_offset_ns = self.emission_interval_ns * self.burst;
    }

    pub fn emission_interval_ns(&self) -> i64 {
        self.emission_interval_ns
    }

    pub fn burst_offset_ns(&self) -> i64 {
        self.burst_offset_ns
    }
}

/// One override entry in the YAML migration format.
#[derive(Deserialize, Debug)]
pub struct OverrideConfig {
    #[serde(flatten)]
    pub limit: LimitConfig,
    #[serde(rename = "Ids")]
    pub ids: Vec<OverrideId>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct OverrideId {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Comment", default)]
    pub comment: String,
}

/// Holds default limits keyed by name and override limits keyed by
/// `<enum>:<id>` bucket key.
#[derive(Debug, Default)]
pub struct Registry {
    defaults: HashMap<Name, Limit>,
    overrides: HashMap<String, Limit>,
}

impl Registry {
    pub fn from_files(defaults_path: &str, overrides_path: Option<&str>) -> errors::Result<Registry> {
        let raw = std::fs::read(defaults_path)
            .map_err(|e| Error::internal(format!("failed to read limit defaults: {}", e)))?;
        let defaults: HashMap<String, LimitConfig> = serde_yaml::from_slice(&raw)
            .map_err(|e| Error::internal(format!("failed to parse limit defaults: {}", e)))?;

        let overrides = match overrides_path {
            Some(path) => {
                let raw = std::fs::read(path)
                    .map_err(|e| Error::internal(format!("failed to read limit overrides: {}", e)))?;
                serde_yaml::from_slice(&raw)
                    .map_err(|e| Error::internal(format!("failed to parse limit overrides: {}", e)))?
            }
            None => vec![],
        };

        Registry::new(defaults, overrides)
    }

    pub fn new(
        defaults: HashMap<String, LimitConfig>,
        overrides: Vec<HashMap<String, OverrideConfig>>,
    ) -> errors::Result<Registry> {
        let mut registry = Registry::default();

        for (key, config) in &defaults {
            let name = Name::from_config_name(key).ok_or_else(|| {
                Error::internal(format!("unrecognized name {:?} in default limit", key))
            })?;
            registry.defaults.insert(name, Limit::new(name, config)?);
        }

        for entry in &overrides {
            for (key, config) in entry {
                let name = Name::from_config_name(key).ok_or_else(|| {
                    Error::internal(format!("unrecognized name {:?} in override limit", key))
                })?;
                for id in &config.ids {
                    let bucket_key = override_bucket_key(name, &id.id)?;
                    let mut limit = Limit::new(name, &config.limit)?;
                    limit.comment = id.comment.clone();
                    limit.is_override = true;
                    registry.overrides.insert(bucket_key, limit);
                }
            }
        }
        Ok(registry)
    }

    /// Installs an override loaded from the overrides table, replacing any
    /// YAML-sourced entry for the same bucket.
    pub fn set_override(&mut self, bucket_key: String, limit: Limit) {
        self.overrides.insert(bucket_key, limit);
    }

    /// The limit in force for a bucket: the exact-key override when one
    /// exists, the named default otherwise. `None` means the limit is not
    /// configured and therefore not enforced.
    pub fn get_limit(&self, name: Name, bucket_key: &str) -> Option<&Limit> {
        if let Some(limit) = self.overrides.get(bucket_key) {
            return Some(limit);
        }
        self.defaults.get(&name)
    }

    pub fn overrides(&self) -> &HashMap<String, Limit> {
        &self.overrides
    }
}

/// Computes the bucket key for an override id, interpreting the id the way
/// the limit expects: IP addresses become covering prefixes for
/// CertificatesPerDomain, and CertificatesPerFQDNSet ids are hashed from the
/// comma-joined identifier list.
fn override_bucket_key(name: Name, id: &str) -> errors::Result<String> {
    if id.is_empty() {
        return Err(Error::internal(format!("empty id in override for {}", name)));
    }
    let id = match name {
        Name::CertificatesPerDomain => match id.parse::<IpAddr>() {
            Ok(_) => super::covering_identifier(&AcmeIdentifier::ip(id))?,
            Err(_) => id.to_string(),
        },
        Name::CertificatesPerFQDNSet => {
            let idents = id.split(',').map(|v| AcmeIdentifier::dns(v.trim())).collect::<Vec<_>>();
            hex::encode(crate::identifier::hash_identifiers(&idents))
        }
        _ => id.to_string(),
    };
    Ok(format!("{}:{}", name.enum_value(), id))
}

/// A flattened override row for export.
#[derive(Debug, PartialEq, Eq)]
pub struct OverrideRow {
    pub name: String,
    pub id: String,
    pub count: i64,
    pub burst: i64,
    pub period: Duration,
    pub comment: String,
}

/// Flattens the overrides into rows in the canonical export order: name
/// ascending, count descending, burst descending, period ascending, comment
/// ascending, id ascending.
pub fn export_overrides(overrides: &HashMap<String, Limit>) -> Vec<OverrideRow> {
    let mut rows = overrides
        .iter()
        .map(|(bucket_key, limit)| {
            let id = bucket_key.split_once(':').map(|(_, id)| id).unwrap_or(bucket_key);
            OverrideRow {
                name: limit.name.to_string(),
                id: id.to_string(),
                count: limit.count,
                burst: limit.burst,
                period: limit.period,
                comment: limit.comment.clone(),
            }
        })
        .collect::<Vec<_>>();

    rows.sort_by(|a, b| {
        a.name.cmp(&b.name)
            .then_with(|| b.count.cmp(&a.count))
            .then_with(|| b.burst.cmp(&a.burst))
            .then_with(|| a.period.cmp(&b.period))
            .then_with(|| a.comment.cmp(&b.comment))
            .then_with(|| a.id.cmp(&b.id))
    });
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(burst: i64, count: i64, period: &str) -> LimitConfig {
        LimitConfig { burst, count, period: parse_duration(period).unwrap(), fail_open: true }
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("12").is_err());
        assert!(parse_duration("3d").is_err());
    }

    #[test]
    fn limit_validation_and_precompute() {
        let limit = Limit::new(Name::NewOrdersPerAccount, &config(20, 300, "3h")).unwrap();
        assert_eq!(limit.emission_interval_ns(), 36_000_000_000);
        assert_eq!(limit.burst_offset_ns(), 720_000_000_000);

        assert!(Limit::new(Name::NewOrdersPerAccount, &config(0, 300, "3h")).is_err());
        assert!(Limit::new(Name::NewOrdersPerAccount, &config(20, 0, "3h")).is_err());
        assert!(Limit::new(Name::NewOrdersPerAccount, &config(20, 300, "0s")).is_err());
    }

    #[test]
    fn defaults_yaml_shape() {
        let yaml = "
NewOrdersPerAccount:
  Burst: 300
  Count: 300
  Period: 3h
CertificatesPerDomain:
  Burst: 50
  Count: 50
  Period: 168h
";
        let defaults: HashMap<String, LimitConfig> = serde_yaml::from_str(yaml).unwrap();
        let registry = Registry::new(defaults, vec![]).unwrap();
        assert!(registry.get_limit(Name::NewOrdersPerAccount, "3:42").is_some());
        assert!(registry.get_limit(Name::CertificatesPerFQDNSet, "6:abcd").is_none());
    }

    #[test]
    fn overrides_yaml_shape() {
        let yaml = "
- CertificatesPerDomain:
    Burst: 200
    Count: 200
    Period: 168h
    Ids:
      - Id: example.com
        Comment: big host
      - Id: 2600:1406:3a00:21::1
";
        let overrides: Vec<HashMap<String, OverrideConfig>> = serde_yaml::from_str(yaml).unwrap();
        let registry = Registry::new(HashMap::new(), overrides).unwrap();

        let by_domain = registry.get_limit(Name::CertificatesPerDomain, "5:example.com").unwrap();
        assert!(by_domain.is_override);
        assert_eq!(by_domain.comment, "big host");
        assert_eq!(by_domain.burst, 200);

        // The IP id is rewritten to its covering /64.
        assert!(registry
            .get_limit(Name::CertificatesPerDomain, "5:2600:1406:3a00:21::/64")
            .unwrap()
            .is_override);
    }

    #[test]
    fn unknown_limit_names_are_rejected() {
        let defaults = HashMap::from([("NotALimit".to_string(), config(1, 1, "1h"))]);
        assert!(Registry::new(defaults, vec![]).is_err());
    }

    #[test]
    fn export_sorts_canonically() {
        let mut overrides = HashMap::new();
        for (key, name, count, burst, comment) in [
            ("3:9", Name::NewOrdersPerAccount, 10, 10, "b"),
            ("3:1", Name::NewOrdersPerAccount, 20, 20, "a"),
            ("3:5", Name::NewOrdersPerAccount, 20, 20, "a"),
            ("5:example.com", Name::CertificatesPerDomain, 100, 100, ""),
        ] {
            let mut limit = Limit::new(name, &config(burst, count, "1h")).unwrap();
            limit.comment = comment.to_string();
            limit.is_override = true;
            overrides.insert(key.to_string(), limit);
        }

        let rows = export_overrides(&overrides);
        // CertificatesPerDomain sorts before NewOrdersPerAccount; within a
        // name, higher counts first, then id ascending.
        assert_eq!(rows[0].name, "CertificatesPerDomain");
        assert_eq!(rows[1].id, "1");
        assert_eq!(rows[2].id, "5");
        assert_eq!(rows[3].id, "9");
    }
}
