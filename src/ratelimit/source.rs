//! The TAT store behind the limiter. One implementation ships: an in-process
//! map, linearizable per key. A networked cache client plugs in behind the
//! same trait; every batch operation is a single round trip there.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::errors::{self, Error};

#[tonic::async_trait]
pub trait Source: Send + Sync {
    /// Returns the TATs for the keys that exist; absent keys are omitted.
    async fn batch_get(&self, keys: &[String]) -> errors::Result<HashMap<String, i64>>;

    /// Stores TATs with their time to live.
    async fn batch_set(&self, entries: Vec<(String, i64, Duration)>) -> errors::Result<()>;

    async fn get(&self, key: &str) -> errors::Result<Option<i64>> {
        let got = self.batch_get(std::slice::from_ref(&key.to_string())).await?;
        Ok(got.get(key).copied())
    }

    async fn set(&self, key: &str, tat_ns: i64, ttl: Duration) -> errors::Result<()> {
        self.batch_set(vec![(key.to_string(), tat_ns, ttl)]).await
    }

    async fn delete(&self, key: &str) -> errors::Result<()>;
}

#[derive(Default)]
pub struct MemorySource {
    buckets: Mutex<HashMap<String, (i64, Instant)>>,
}

impl MemorySource {
    pub fn new() -> MemorySource {
        MemorySource::default()
    }

    fn lock(&self) -> errors::Result<std::sync::MutexGuard<'_, HashMap<String, (i64, Instant)>>> {
        self.buckets.lock().map_err(|_| Error::internal("rate limit store lock poisoned"))
    }
}

#[tonic::async_trait]
impl Source for MemorySource {
    async fn batch_get(&self, keys: &[String]) -> errors::Result<HashMap<String, i64>> {
        let now = Instant::now();
        let mut buckets = self.lock()?;
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            match buckets.get(key) {
                Some((_, expires)) if *expires <= now => {
                    buckets.remove(key);
                }
                Some((tat, _)) => {
                    out.insert(key.clone(), *tat);
                }
                None => {}
            }
        }
        Ok(out)
    }

    async fn batch_set(&self, entries: Vec<(String, i64, Duration)>) -> errors::Result<()> {
        let now = Instant::now();
        let mut buckets = self.lock()?;
        for (key, tat, ttl) in entries {
            buckets.insert(key, (tat, now + ttl));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> errors::Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// A source whose transport is always down, for fail-open/fail-closed
    /// behaviour tests.
    pub struct UnavailableSource;

    #[tonic::async_trait]
    impl Source for UnavailableSource {
        async fn batch_get(&self, _keys: &[String]) -> errors::Result<HashMap<String, i64>> {
            Err(Error::connection_failure("rate limit store unavailable"))
        }

        async fn batch_set(&self, _entries: Vec<(String, i64, Duration)>) -> errors::Result<()> {
            Err(Error::connection_failure("rate limit store unavailable"))
        }

        async fn delete(&self, _key: &str) -> errors::Result<()> {
            Err(Error::connection_failure("rate limit store unavailable"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        let source = MemorySource::new();
        source.set("3:1", 12345, Duration::from_secs(60)).await.unwrap();
        assert_eq!(source.get("3:1").await.unwrap(), Some(12345));
        assert_eq!(source.get("3:2").await.unwrap(), None);
        source.delete("3:1").await.unwrap();
        assert_eq!(source.get("3:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_entries_vanish() {
        let source = MemorySource::new();
        source.set("3:1", 12345, Duration::ZERO).await.unwrap();
        assert_eq!(source.get("3:1").await.unwrap(), None);
    }
}
