//! Daemon configuration, loaded from TOML plus environment by `main`.

use std::collections::HashMap;
use std::time::Duration;

use crate::identifier::{ChallengeType, IdentifierType};

fn de_duration<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    use serde::Deserialize;
    let s = String::deserialize(d)?;
    crate::ratelimit::limit::parse_duration(&s).map_err(serde::de::Error::custom)
}

fn de_url<'de, D: serde::de::Deserializer<'de>>(d: D) -> Result<reqwest::Url, D::Error> {
    use std::str::FromStr;
    use serde::Deserialize;

    let s = String::deserialize(d)?;
    reqwest::Url::from_str(&s).map_err(serde::de::Error::custom)
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub listen: std::net::SocketAddr,
    pub database_url: String,
    pub va_url: String,
    pub ca_url: String,

    /// Issuer backing this deployment, as known to the CA and the CRL tables.
    pub issuer_id: i64,
    /// Number of CRL shards revocations fan into.
    pub crl_shard_width: i64,

    pub max_contacts_per_registration: usize,
    pub default_profile_name: String,
    pub validation_profiles: HashMap<String, ValidationProfile>,

    /// Network perspectives the VA must corroborate from under MPIC.
    pub required_perspectives: u32,

    #[serde(default)]
    pub features: Features,

    pub policy_path: String,
    pub limits: LimitsConfig,
    #[serde(default)]
    pub zombie: ZombieConfig,
    pub ct_logs: CtPolicy,
    #[serde(default)]
    pub deadlines: Deadlines,

    pub enabled_identifiers: Vec<IdentifierType>,
    pub enabled_challenges: Vec<ChallengeType>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ValidationProfile {
    #[serde(deserialize_with = "de_duration")]
    pub pending_authz_lifetime: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub valid_authz_lifetime: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub order_lifetime: Duration,
    pub max_names: usize,
    pub identifier_types: Vec<IdentifierType>,
    /// Whether orders under this profile may be validated with
    /// multi-perspective corroboration. Legacy single-perspective profiles
    /// set this to false and are rejected outright when MPIC is enforced.
    #[serde(default = "default_true")]
    pub mpic: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Debug, Clone, Copy, Default)]
#[serde(default)]
pub struct Features {
    pub automatically_pause_zombie_clients: bool,
    pub no_pending_authz_reuse: bool,
    pub enforce_mpic: bool,
    pub unsplit_issuance: bool,
}

#[derive(Deserialize, Debug, Clone)]
pub struct LimitsConfig {
    pub defaults_path: String,
    #[serde(default)]
    pub overrides_path: Option<String>,
}

/// Thresholds for pausing clients that retry hopeless validations forever.
#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(default)]
pub struct ZombieConfig {
    pub threshold: i64,
    #[serde(deserialize_with = "de_duration")]
    pub window: Duration,
}

impl Default for ZombieConfig {
    fn default() -> ZombieConfig {
        ZombieConfig {
            threshold: 5,
            window: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct CtLog {
    #[serde(deserialize_with = "de_url")]
    pub url: reqwest::Url,
    pub operator: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CtPolicy {
    /// Delay between starting successive log submissions, capping the load
    /// a single issuance puts on any one log.
    #[serde(deserialize_with = "de_duration")]
    pub stagger: Duration,
    #[serde(deserialize_with = "de_duration", default = "default_per_log_timeout")]
    pub per_log_timeout: Duration,
    /// Logs counted toward the SCT quorum.
    pub sct_logs: Vec<CtLog>,
    /// Logs submitted to for visibility only.
    #[serde(default)]
    pub info_logs: Vec<CtLog>,
    /// Logs that receive the final certificate after issuance.
    #[serde(default)]
    pub final_logs: Vec<CtLog>,
}

fn default_per_log_timeout() -> Duration {
    Duration::from_secs(45)
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(default)]
pub struct Deadlines {
    #[serde(deserialize_with = "de_duration")]
    pub ca: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub va: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub publisher: Duration,
}

impl Default for Deadlines {
    fn default() -> Deadlines {
        Deadlines {
            ca: Duration::from_secs(15),
            va: Duration::from_secs(20),
            publisher: Duration::from_secs(300),
        }
    }
}
