//! Certificate Transparency submission: SCT parsing and encoding, and the
//! staggered fanout that collects an operator-diverse quorum.

use std::collections::HashSet;
use std::io::Write;
use byteorder::{BigEndian, WriteBytesExt};
use base64::prelude::*;

use crate::config::{CtLog, CtPolicy};
use crate::errors::{self, Error};

#[derive(Serialize, Clone)]
pub struct CTAddChain {
    pub chain: Vec<String>,
}

#[derive(Deserialize)]
pub struct JsonSCT {
    sct_version: u8,
    id: String,
    timestamp: u64,
    extensions: String,
    signature: String,
}

impl JsonSCT {
    pub fn parse(&self) -> errors::Result<SCT> {
        if self.sct_version != 0 {
            return Err(Error::missing_scts("unsupported SCT version"));
        }

        let id: [u8; 32] = BASE64_STANDARD.decode(&self.id)
            .map_err(|e| Error::missing_scts(format!("error decoding SCT log ID: {}", e)))?
            .try_into().map_err(|_| Error::missing_scts("invalid SCT log ID"))?;

        Ok(SCT {
            version: self.sct_version,
            id,
            timestamp: self.timestamp,
            extensions: BASE64_STANDARD.decode(&self.extensions)
                .map_err(|e| Error::missing_scts(format!("error decoding SCT extensions: {}", e)))?,
            signature: BASE64_STANDARD.decode(&self.signature)
                .map_err(|e| Error::missing_scts(format!("error decoding SCT signature: {}", e)))?,
        })
    }
}

pub struct SCT {
    version: u8,
    id: [u8; 32],
    timestamp: u64,
    extensions: Vec<u8>,
    signature: Vec<u8>,
}

impl SCT {
    /// TLS encoding of one SignedCertificateTimestamp (RFC 6962, 3.2).
    pub fn encode(&self) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());

        cursor.write_u8(self.version).unwrap();
        cursor.write_all(&self.id).unwrap();
        cursor.write_u64::<BigEndian>(self.timestamp).unwrap();
        cursor.write_u16::<BigEndian>(self.extensions.len() as u16).unwrap();
        cursor.write_all(&self.extensions).unwrap();
        cursor.write_all(&self.signature).unwrap();

        cursor.into_inner()
    }
}

/// An SCT collected from a log, tagged with the log's operator for the
/// diversity requirement.
#[derive(Debug, Clone)]
pub struct CollectedSct {
    pub operator: String,
    pub encoded: Vec<u8>,
}

/// Whether the collected SCTs satisfy the policy: one from each of
/// `required_operators` distinct operator groups.
pub fn quorum_met(collected: &[CollectedSct], required_operators: usize) -> bool {
    let operators = collected.iter().map(|s| s.operator.as_str()).collect::<HashSet<_>>();
    operators.len() >= required_operators
}

/// How many distinct operators the policy requires for a log set: two, or
/// every operator when fewer than two run the configured logs.
pub fn required_operators(logs: &[CtLog]) -> usize {
    let distinct = logs.iter().map(|l| l.operator.as_str()).collect::<HashSet<_>>().len();
    distinct.min(2)
}

/// Submits the pre-certificate chain to the policy's SCT logs, starting one
/// submission per stagger interval, and returns as soon as the collected
/// SCTs satisfy operator diversity. Submissions to `info_logs` are fired and
/// forgotten.
pub async fn get_scts(
    client: &reqwest::Client,
    policy: &CtPolicy,
    chain: CTAddChain,
) -> errors::Result<Vec<Vec<u8>>> {
    for log in &policy.info_logs {
        let client = client.clone();
        let log = log.clone();
        let chain = chain.clone();
        let timeout = policy.per_log_timeout;
        tokio::task::spawn(async move {
            if let Err(e) = submit_chain(&client, &log, &chain, "ct/v1/add-pre-chain", timeout).await {
                info!("info log {} did not return an SCT: {}", log.url, e);
            }
        });
    }

    let needed = required_operators(&policy.sct_logs);
    let mut tasks = tokio::task::JoinSet::new();
    for (i, log) in policy.sct_logs.iter().enumerate() {
        let client = client.clone();
        let log = log.clone();
        let chain = chain.clone();
        let stagger = policy.stagger * i as u32;
        let timeout = policy.per_log_timeout;
        tasks.spawn(async move {
            tokio::time::sleep(stagger).await;
            let sct = submit_chain(&client, &log, &chain, "ct/v1/add-pre-chain", timeout).await?;
            Ok::<_, Error>(CollectedSct {
                operator: log.operator.clone(),
                encoded: sct.encode(),
            })
        });
    }

    let mut collected = vec![];
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Ok(sct)) => {
                // One SCT per operator group is enough.
                if !collected.iter().any(|c: &CollectedSct| c.operator == sct.operator) {
                    collected.push(sct);
                }
                if quorum_met(&collected, needed) {
                    tasks.abort_all();
                    return Ok(collected.into_iter().map(|c| c.encoded).collect());
                }
            }
            Ok(Err(e)) => warn!("CT log submission failed: {}", e),
            Err(e) => warn!("CT log submission task failed: {}", e),
        }
    }

    Err(Error::missing_scts(format!(
        "failed to collect SCTs from {} distinct log operators", needed
    )))
}

/// Best-effort submission of the final certificate chain to the configured
/// final logs.
pub async fn submit_final(client: &reqwest::Client, policy: &CtPolicy, chain: CTAddChain) {
    for log in &policy.final_logs {
        if let Err(e) = submit_chain(client, log, &chain, "ct/v1/add-chain", policy.per_log_timeout).await {
            warn!("failed to submit certificate to {}: {}", log.url, e);
        }
    }
}

async fn submit_chain(
    client: &reqwest::Client,
    log: &CtLog,
    chain: &CTAddChain,
    endpoint: &str,
    timeout: std::time::Duration,
) -> errors::Result<SCT> {
    let url = log.url.join(endpoint)
        .map_err(|e| Error::internal(format!("invalid CT log URL: {}", e)))?;
    let response = client.post(url)
        .timeout(timeout)
        .json(chain)
        .send().await
        .and_then(|r| r.error_for_status())
        .map_err(|e| Error::connection_failure(format!("CT submission failed: {}", e)))?;
    let body = response.text().await
        .map_err(|e| Error::connection_failure(format!("failed to read SCT response: {}", e)))?;
    let sct: JsonSCT = serde_json::from_str(&body)
        .map_err(|e| Error::missing_scts(format!("failed to parse SCT response: {}, got: {}", e, body)))?;
    sct.parse()
}

/// Builds the base64 chain body for a leaf plus its issuers.
pub fn build_chain(leaf_der: &[u8], issuer_chain_der: &[Vec<u8>]) -> CTAddChain {
    let mut chain = vec![BASE64_STANDARD.encode(leaf_der)];
    chain.extend(issuer_chain_der.iter().map(|der| BASE64_STANDARD.encode(der)));
    CTAddChain { chain }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sct(timestamp: u64) -> SCT {
        SCT {
            version: 0,
            id: [0xab; 32],
            timestamp,
            extensions: vec![],
            signature: vec![0x04, 0x03, 0x00, 0x02, 0xbe, 0xef],
        }
    }

    #[test]
    fn sct_encoding_layout() {
        let encoded = sct(0x01_02_03_04).encode();
        assert_eq!(encoded[0], 0);
        assert_eq!(&encoded[1..33], &[0xab; 32]);
        assert_eq!(&encoded[33..41], &[0, 0, 0, 0, 1, 2, 3, 4]);
        // Zero-length extensions, then the signature.
        assert_eq!(&encoded[41..43], &[0, 0]);
        assert_eq!(&encoded[43..], &[0x04, 0x03, 0x00, 0x02, 0xbe, 0xef]);
    }

    #[test]
    fn json_sct_parsing() {
        let valid: JsonSCT = serde_json::from_str(
            r#"{"sct_version":0,"id":"q83rq83rq83rq83rq83rq83rq83rq83rq83rq83rq8c=","timestamp":1234,"extensions":"","signature":"BAMASDA="}"#,
        ).unwrap();
        assert!(valid.parse().is_ok());

        let bad_version: JsonSCT = serde_json::from_str(
            r#"{"sct_version":1,"id":"q83rq83rq83rq83rq83rq83rq83rq83rq83rq83rq8c=","timestamp":1234,"extensions":"","signature":"BAMASDA="}"#,
        ).unwrap();
        assert!(bad_version.parse().is_err());

        let bad_id: JsonSCT = serde_json::from_str(
            r#"{"sct_version":0,"id":"dG9vc2hvcnQ=","timestamp":1234,"extensions":"","signature":"BAMASDA="}"#,
        ).unwrap();
        assert!(bad_id.parse().is_err());
    }

    #[test]
    fn quorum_requires_distinct_operators() {
        let a = CollectedSct { operator: "opA".to_string(), encoded: vec![1] };
        let a2 = CollectedSct { operator: "opA".to_string(), encoded: vec![2] };
        let b = CollectedSct { operator: "opB".to_string(), encoded: vec![3] };

        assert!(!quorum_met(&[a.clone()], 2));
        assert!(!quorum_met(&[a.clone(), a2], 2));
        assert!(quorum_met(&[a, b], 2));
    }

    #[test]
    fn required_operators_caps_at_two() {
        let log = |operator: &str| CtLog {
            url: "https://ct.example.net/2025h2/".parse().unwrap(),
            operator: operator.to_string(),
        };
        assert_eq!(required_operators(&[log("a")]), 1);
        assert_eq!(required_operators(&[log("a"), log("b"), log("c")]), 2);
        assert_eq!(required_operators(&[log("a"), log("a")]), 1);
    }

    #[test]
    fn chain_is_base64() {
        let chain = build_chain(&[1, 2, 3], &[vec![4, 5, 6]]);
        assert_eq!(chain.chain, vec!["AQID".to_string(), "BAUG".to_string()]);
    }
}
