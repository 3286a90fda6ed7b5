//! The limiter: transactional probe-then-spend over any number of buckets.

use std::sync::{Arc, RwLock};
use std::time::Duration;
use chrono::prelude::*;

use crate::errors::{self, Error};
use super::gcra;
use super::limit::{Limit, Registry};
use super::source::Source;
use super::Name;

/// One bucket operation inside a batch. Check-only transactions probe without
/// consuming; spend-only transactions consume without gating (used for
/// failure accounting).
#[derive(Debug, Clone)]
pub struct Transaction {
    pub bucket_key: String,
    pub limit: Limit,
    pub cost: i64,
    pub check: bool,
    pub spend: bool,
}

impl Transaction {
    fn validate(&self) -> errors::Result<()> {
        if self.cost <= 0 || self.cost > self.limit.burst {
            return Err(Error::internal(format!(
                "invalid cost {} for bucket {:?}, must be in [1, {}]",
                self.cost, self.bucket_key, self.limit.burst
            )));
        }
        Ok(())
    }
}

/// The batch verdict. `retry_after` is the earliest time at which every
/// denied bucket would permit the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDecision {
    pub allowed: bool,
    pub retry_after: Duration,
    pub denied: Option<(Name, String)>,
}

impl BatchDecision {
    fn allowed() -> BatchDecision {
        BatchDecision { allowed: true, retry_after: Duration::ZERO, denied: None }
    }
}

pub struct Limiter {
    registry: RwLock<Registry>,
    source: Arc<dyn Source>,
}

impl Limiter {
    pub fn new(registry: Registry, source: Arc<dyn Source>) -> Limiter {
        Limiter { registry: RwLock::new(registry), source }
    }

    /// Builds a transaction against the limit currently in force for the
    /// bucket. `None` means the limit is not configured, and the operation
    /// is not constrained.
    pub fn transaction(
        &self,
        name: Name,
        bucket_key: String,
        cost: i64,
        check: bool,
        spend: bool,
    ) -> errors::Result<Option<Transaction>> {
        let registry = self.registry.read()
            .map_err(|_| Error::internal("limit registry lock poisoned"))?;
        Ok(registry.get_limit(name, &bucket_key).map(|limit| Transaction {
            bucket_key,
            limit: limit.clone(),
            cost,
            check,
            spend,
        }))
    }

    /// Replaces an override at runtime (the overrides table won over YAML).
    pub fn set_override(&self, bucket_key: String, limit: Limit) -> errors::Result<()> {
        let mut registry = self.registry.write()
            .map_err(|_| Error::internal("limit registry lock poisoned"))?;
        registry.set_override(bucket_key, limit);
        Ok(())
    }

    /// Probes every bucket; if all permit, spends all. All-or-nothing: a
    /// single denial spends nothing, so a retry of a denied action cannot
    /// double-spend. Transport failures fail open unless a constrained limit
    /// opts out.
    pub async fn batch_check_and_spend(
        &self,
        txns: &[Transaction],
        now: DateTime<Utc>,
    ) -> errors::Result<BatchDecision> {
        if txns.is_empty() {
            return Ok(BatchDecision::allowed());
        }
        for txn in txns {
            txn.validate()?;
        }
        let now_ns = now_nanos(now)?;

        let keys = txns.iter().map(|t| t.bucket_key.clone()).collect::<Vec<_>>();
        let tats = match self.source.batch_get(&keys).await {
            Ok(tats) => tats,
            Err(err) => return self.transport_failure(txns, err),
        };

        let mut retry_after = Duration::ZERO;
        let mut denied = None;
        let mut writes = vec![];
        for txn in txns {
            let tat = tats.get(&txn.bucket_key).copied();
            let decision = gcra::decide(&txn.limit, tat, txn.cost, now_ns);
            if txn.check && !decision.allowed {
                if decision.retry_in > retry_after {
                    retry_after = decision.retry_in;
                }
                if denied.is_none() {
                    denied = Some((txn.limit.name, txn.bucket_key.clone()));
                }
            }
            if txn.spend {
                writes.push((txn.bucket_key.clone(), decision.new_tat_ns, decision.ttl));
            }
        }

        if let Some(denied) = denied {
            return Ok(BatchDecision { allowed: false, retry_after, denied: Some(denied) });
        }

        if !writes.is_empty() {
            if let Err(err) = self.source.batch_set(writes).await {
                return self.transport_failure(txns, err);
            }
        }
        Ok(BatchDecision::allowed())
    }

    /// Probe only, consuming nothing.
    pub async fn check(&self, txns: &[Transaction], now: DateTime<Utc>) -> errors::Result<BatchDecision> {
        let probes = txns.iter().map(|t| Transaction { spend: false, ..t.clone() }).collect::<Vec<_>>();
        self.batch_check_and_spend(&probes, now).await
    }

    /// Consumes unconditionally and reports, per bucket, whether the spend
    /// exceeded the bucket's capacity. Used for failure accounting, where
    /// exceeding the bucket is the signal rather than a gate. Transport
    /// failures surface to the caller.
    pub async fn spend(
        &self,
        txns: &[Transaction],
        now: DateTime<Utc>,
    ) -> errors::Result<Vec<gcra::Decision>> {
        for txn in txns {
            txn.validate()?;
        }
        let now_ns = now_nanos(now)?;
        let keys = txns.iter().map(|t| t.bucket_key.clone()).collect::<Vec<_>>();
        let tats = self.source.batch_get(&keys).await?;

        let mut decisions = Vec::with_capacity(txns.len());
        let mut writes = vec![];
        for txn in txns {
            let tat = tats.get(&txn.bucket_key).copied();
            let decision = gcra::decide(&txn.limit, tat, txn.cost, now_ns);
            writes.push((txn.bucket_key.clone(), decision.new_tat_ns, decision.ttl));
            decisions.push(decision);
        }
        self.source.batch_set(writes).await?;
        Ok(decisions)
    }

    /// Returns cost to the buckets, clamped so a bucket never ends up more
    /// than full. Best-effort: the TAT store is authoritative and transport
    /// failures surface to the caller.
    pub async fn refund(&self, txns: &[Transaction], now: DateTime<Utc>) -> errors::Result<()> {
        let now_ns = now_nanos(now)?;
        let keys = txns.iter().map(|t| t.bucket_key.clone()).collect::<Vec<_>>();
        let tats = self.source.batch_get(&keys).await?;

        let mut writes = vec![];
        for txn in txns {
            // An absent bucket is already full; nothing to refund.
            let tat = match tats.get(&txn.bucket_key) {
                Some(tat) => *tat,
                None => continue,
            };
            let refunded = gcra::refund_tat(&txn.limit, tat, txn.cost, now_ns);
            if refunded <= now_ns {
                self.source.delete(&txn.bucket_key).await?;
            } else {
                writes.push((
                    txn.bucket_key.clone(),
                    refunded,
                    Duration::from_nanos((refunded - now_ns) as u64),
                ));
            }
        }
        if !writes.is_empty() {
            self.source.batch_set(writes).await?;
        }
        Ok(())
    }

    fn transport_failure(&self, txns: &[Transaction], err: Error) -> errors::Result<BatchDecision> {
        if txns.iter().all(|t| t.limit.fail_open) {
            warn!("rate limit store unavailable, failing open: {}", err);
            return Ok(BatchDecision::allowed());
        }
        Err(err)
    }
}

fn now_nanos(now: DateTime<Utc>) -> errors::Result<i64> {
    now.timestamp_nanos_opt()
        .ok_or_else(|| Error::internal("timestamp outside the nanosecond range"))
}

/// The client-facing denial for a batch decision, with the per-limit detail
/// the WFE surfaces in problem documents.
pub fn rate_limit_error(decision: &BatchDecision) -> Error {
    let detail = match decision.denied {
        Some((Name::NewRegistrationsPerIPAddress, _)) => {
            "too many registrations for this IP address recently"
        }
        Some((Name::NewRegistrationsPerIPv6Range, _)) => {
            "too many registrations for this IPv6 range recently"
        }
        Some((Name::NewOrdersPerAccount, _)) => "too many new orders recently",
        Some((Name::FailedAuthorizationsPerDomainPerAccount, _)) => {
            "too many failed authorizations recently"
        }
        Some((Name::CertificatesPerDomain, _)) => {
            "too many certificates already issued for this registered domain recently"
        }
        Some((Name::CertificatesPerFQDNSet, _)) => {
            "too many certificates already issued for this exact set of identifiers recently"
        }
        Some((Name::FailedAuthorizationsForPausingPerDomainPerAccount, _)) | None => {
            "too many requests recently"
        }
    };
    Error::rate_limit(decision.retry_after, detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::limit::{parse_duration, LimitConfig};
    use super::super::source::MemorySource;
    use super::super::source::testing::UnavailableSource;
    use std::collections::HashMap;

    fn registry(entries: &[(&str, i64, i64, &str)]) -> Registry {
        let defaults = entries
            .iter()
            .map(|(name, burst, count, period)| {
                (name.to_string(), LimitConfig {
                    burst: *burst,
                    count: *count,
                    period: parse_duration(period).unwrap(),
                    fail_open: true,
                })
            })
            .collect::<HashMap<_, _>>();
        Registry::new(defaults, vec![]).unwrap()
    }

    fn limiter(entries: &[(&str, i64, i64, &str)]) -> Limiter {
        Limiter::new(registry(entries), Arc::new(MemorySource::new()))
    }

    #[tokio::test]
    async fn third_order_for_domain_is_denied_with_half_period_retry() {
        let limiter = limiter(&[("CertificatesPerDomain", 2, 2, "24h")]);
        let now = Utc::now();

        let txn = limiter
            .transaction(Name::CertificatesPerDomain, "5:example.com".to_string(), 1, true, true)
            .unwrap()
            .unwrap();

        for _ in 0..2 {
            let decision = limiter.batch_check_and_spend(&[txn.clone()], now).await.unwrap();
            assert!(decision.allowed);
        }

        let denied = limiter.batch_check_and_spend(&[txn.clone()], now).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::from_secs(12 * 3600));
        let err = rate_limit_error(&denied);
        assert_eq!(err.kind, crate::errors::ErrorKind::RateLimit);
        assert_eq!(err.retry_after, Some(Duration::from_secs(12 * 3600)));

        // A refund restores capacity for exactly one more.
        limiter.refund(&[txn.clone()], now).await.unwrap();
        assert!(limiter.batch_check_and_spend(&[txn.clone()], now).await.unwrap().allowed);
        assert!(!limiter.batch_check_and_spend(&[txn.clone()], now).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn one_denial_spends_nothing() {
        let limiter = limiter(&[
            ("NewOrdersPerAccount", 1, 1, "1h"),
            ("CertificatesPerDomain", 10, 10, "1h"),
        ]);
        let now = Utc::now();

        let orders = limiter
            .transaction(Name::NewOrdersPerAccount, "3:1".to_string(), 1, true, true)
            .unwrap().unwrap();
        let domain = limiter
            .transaction(Name::CertificatesPerDomain, "5:example.com".to_string(), 1, true, true)
            .unwrap().unwrap();

        // Exhaust the order bucket.
        assert!(limiter
            .batch_check_and_spend(&[orders.clone()], now).await.unwrap().allowed);

        // The combined batch is denied by the order bucket and must not have
        // debited the domain bucket.
        let denied = limiter
            .batch_check_and_spend(&[orders.clone(), domain.clone()], now)
            .await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.denied, Some((Name::NewOrdersPerAccount, "3:1".to_string())));

        let mut remaining = 0;
        let mut probe = limiter.check(&[domain.clone()], now).await.unwrap();
        while probe.allowed && remaining <= 10 {
            limiter
                .batch_check_and_spend(&[domain.clone()], now).await.unwrap();
            remaining += 1;
            probe = limiter.check(&[domain.clone()], now).await.unwrap();
        }
        assert_eq!(remaining, 10);
    }

    #[tokio::test]
    async fn unconfigured_limits_do_not_constrain() {
        let limiter = limiter(&[("NewOrdersPerAccount", 1, 1, "1h")]);
        assert!(limiter
            .transaction(Name::CertificatesPerFQDNSet, "6:abc".to_string(), 1, true, true)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn spend_only_reports_threshold_crossing() {
        let limiter = limiter(&[("FailedAuthorizationsForPausingPerDomainPerAccount", 5, 5, "1h")]);
        let now = Utc::now();
        let txn = limiter
            .transaction(
                Name::FailedAuthorizationsForPausingPerDomainPerAccount,
                "7:7:foo.example.net".to_string(),
                1,
                false,
                true,
            )
            .unwrap().unwrap();

        for i in 0..5 {
            let decisions = limiter.spend(&[txn.clone()], now).await.unwrap();
            assert!(decisions[0].allowed, "failure {} within threshold", i);
        }
        let decisions = limiter.spend(&[txn.clone()], now).await.unwrap();
        assert!(!decisions[0].allowed, "sixth failure crosses the threshold");
    }

    #[tokio::test]
    async fn transport_failure_fails_open_for_checks() {
        let limiter = Limiter::new(
            registry(&[("NewOrdersPerAccount", 1, 1, "1h")]),
            Arc::new(UnavailableSource),
        );
        let now = Utc::now();
        let txn = limiter
            .transaction(Name::NewOrdersPerAccount, "3:1".to_string(), 1, true, true)
            .unwrap().unwrap();

        let decision = limiter.batch_check_and_spend(&[txn.clone()], now).await.unwrap();
        assert!(decision.allowed);

        // Dedicated spends fail closed: the caller hears about the outage.
        assert!(limiter.spend(&[txn.clone()], now).await.is_err());
    }

    #[tokio::test]
    async fn transport_failure_fails_closed_when_opted_out() {
        let defaults = HashMap::from([(
            "CertificatesPerDomain".to_string(),
            LimitConfig {
                burst: 2,
                count: 2,
                period: parse_duration("24h").unwrap(),
                fail_open: false,
            },
        )]);
        let limiter = Limiter::new(
            Registry::new(defaults, vec![]).unwrap(),
            Arc::new(UnavailableSource),
        );
        let txn = limiter
            .transaction(Name::CertificatesPerDomain, "5:example.com".to_string(), 1, true, true)
            .unwrap().unwrap();
        assert!(limiter.batch_check_and_spend(&[txn], Utc::now()).await.is_err());
    }
}
