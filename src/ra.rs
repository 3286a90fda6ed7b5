//! The registration authority: order intake, validation orchestration, and
//! the issuance pipeline.

use std::collections::HashSet;
use std::sync::Arc;
use base64::prelude::*;
use chrono::prelude::*;

use crate::cert_ra;
use crate::config;
use crate::errors::{self, Error, ErrorKind};
use crate::identifier::{self, AcmeIdentifier, ChallengeType};
use crate::models;
use crate::ratelimit::{self, limiter};
use crate::sa;
use crate::sct;

pub struct ValidatorManager {
    pub endpoint: tonic::transport::Endpoint,
}

#[mobc::async_trait]
impl mobc::Manager for ValidatorManager {
    type Connection = cert_ra::validation_authority_client::ValidationAuthorityClient<tonic::transport::Channel>;
    type Error = tonic::transport::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        cert_ra::validation_authority_client::ValidationAuthorityClient::connect(self.endpoint.clone()).await
    }

    async fn check(&self, conn: Self::Connection) -> Result<Self::Connection, Self::Error> {
        Ok(conn)
    }
}

pub struct SignerManager {
    pub endpoint: tonic::transport::Endpoint,
}

#[mobc::async_trait]
impl mobc::Manager for SignerManager {
    type Connection = cert_ra::certificate_authority_client::CertificateAuthorityClient<tonic::transport::Channel>;
    type Error = tonic::transport::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        cert_ra::certificate_authority_client::CertificateAuthorityClient::connect(self.endpoint.clone()).await
    }

    async fn check(&self, conn: Self::Connection) -> Result<Self::Connection, Self::Error> {
        Ok(conn)
    }
}

#[derive(Clone)]
pub struct RA {
    pub sa: sa::Storage,
    pub pa: Arc<crate::policy::Authority>,
    pub limiter: Arc<limiter::Limiter>,
    pub va: mobc::Pool<ValidatorManager>,
    pub ca: mobc::Pool<SignerManager>,
    pub http_client: Arc<reqwest::Client>,
    pub config: Arc<config::Config>,
}

/// Parsed facts about a certificate the pipeline needs back out of its DER.
struct ParsedCert {
    serial: String,
    issued: NaiveDateTime,
    expires: NaiveDateTime,
}

fn parse_cert_der(der: &[u8]) -> errors::Result<ParsedCert> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| Error::internal(format!("CA returned an unparseable certificate: {}", e)))?;
    let issued = Utc
        .timestamp_opt(cert.validity().not_before.timestamp(), 0)
        .single()
        .ok_or_else(|| Error::internal("certificate notBefore out of range"))?;
    let expires = Utc
        .timestamp_opt(cert.validity().not_after.timestamp(), 0)
        .single()
        .ok_or_else(|| Error::internal("certificate notAfter out of range"))?;
    Ok(ParsedCert {
        serial: hex::encode(cert.raw_serial()),
        issued: issued.naive_utc(),
        expires: expires.naive_utc(),
    })
}

/// Identifiers covered by a certificate, from its subjectAltName.
fn cert_identifiers(der: &[u8]) -> errors::Result<Vec<AcmeIdentifier>> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| Error::internal(format!("unparseable certificate: {}", e)))?;
    let san = cert
        .subject_alternative_name()
        .map_err(|_| Error::internal("certificate has a malformed subjectAltName"))?
        .ok_or_else(|| Error::internal("certificate has no subjectAltName"))?;

    let mut idents = vec![];
    for name in &san.value.general_names {
        match name {
            x509_parser::extensions::GeneralName::DNSName(dns) => {
                idents.push(AcmeIdentifier::dns(dns).normalize());
            }
            x509_parser::extensions::GeneralName::IPAddress(bytes) => {
                let addr: std::net::IpAddr = match bytes.len() {
                    4 => <[u8; 4]>::try_from(*bytes).map(Into::into).ok(),
                    16 => <[u8; 16]>::try_from(*bytes).map(Into::into).ok(),
                    _ => None,
                }
                .ok_or_else(|| Error::internal("certificate has a malformed IP subjectAltName"))?;
                idents.push(AcmeIdentifier::ip(&addr.to_string()));
            }
            _ => {}
        }
    }
    Ok(identifier::normalize_identifiers(&idents))
}

fn error_json(err: &Error) -> serde_json::Value {
    serde_json::to_value(err).unwrap_or_else(|_| serde_json::json!({"kind": "Internal"}))
}

impl RA {
    fn profile(&self, name: &str) -> errors::Result<(String, &config::ValidationProfile)> {
        let name = if name.is_empty() {
            self.config.default_profile_name.as_str()
        } else {
            name
        };
        let profile = self.config.validation_profiles.get(name).ok_or_else(|| {
            Error::invalid_profile(format!("profile {:?} not recognized", name))
        })?;
        Ok((name.to_string(), profile))
    }

    fn validate_contacts(&self, contacts: &[String]) -> errors::Result<()> {
        if contacts.len() > self.config.max_contacts_per_registration {
            return Err(Error::malformed(format!(
                "too many contacts provided: {} > {}",
                contacts.len(),
                self.config.max_contacts_per_registration
            )));
        }
        for contact in contacts {
            let address = contact.strip_prefix("mailto:").ok_or_else(|| {
                Error::unsupported_contact(format!("contact method {:?} is not supported", contact))
            })?;
            if address.contains('?') {
                return Err(Error::unsupported_contact(
                    "contact email contains a question mark",
                ));
            }
            crate::policy::valid_email(address)?;
        }
        Ok(())
    }

    async fn load_order_pb(&self, order: models::Order, idents: Vec<AcmeIdentifier>, authz_ids: Vec<i64>) -> errors::Result<cert_ra::Order> {
        let validities = self.sa.get_authz_validity(&authz_ids).await?;
        let status = models::order_status(&order, &validities, Utc::now())?;
        Ok(order.to_pb(&idents, authz_ids, status))
    }

    async fn new_order_inner(&self, req: cert_ra::NewOrderRequest) -> errors::Result<cert_ra::Order> {
        let now = Utc::now();
        let reg = self.sa.get_registration(req.registration_id).await?;
        if reg.status != models::RegistrationStatus::Valid {
            return Err(Error::unauthorized("account is not valid"));
        }

        if req.identifiers.is_empty() {
            return Err(Error::malformed("NewOrder request did not specify any identifiers"));
        }
        let mut idents = Vec::with_capacity(req.identifiers.len());
        for pb in &req.identifiers {
            idents.push(AcmeIdentifier::from_pb(pb).ok_or_else(|| {
                Error::malformed("NewOrder request included an unsupported identifier type")
            })?);
        }
        let idents = identifier::normalize_identifiers(&idents);

        let (profile_name, profile) = self.profile(&req.profile)?;
        if idents.len() > profile.max_names {
            return Err(Error::malformed(format!(
                "Order cannot contain more than {} identifiers", profile.max_names
            )));
        }
        for ident in &idents {
            if !profile.identifier_types.contains(&ident.identifier_type) {
                return Err(Error::invalid_profile(format!(
                    "profile {:?} does not permit this identifier type", profile_name
                )));
            }
        }
        if self.config.features.enforce_mpic && !profile.mpic {
            return Err(Error::invalid_profile(format!(
                "profile {:?} does not permit multi-perspective validation", profile_name
            )));
        }

        self.pa.willing_to_issue(&idents)?;

        for ident in &idents {
            if self.sa.is_paused(reg.id, ident).await? {
                return Err(Error::new(
                    ErrorKind::RateLimit,
                    format!(
                        "issuance for {:?} is paused for this account after repeated failed \
                         validations; unpause the account to resume",
                        ident.value
                    ),
                ));
            }
        }

        let set_hash = identifier::hash_identifiers(&idents);
        // Renewals (an identical identifier set was issued before) are exempt
        // from the per-domain and per-set counts.
        let is_renewal = self.sa.fqdn_set_exists(&set_hash).await?;

        let mut txns = vec![];
        if let Some(txn) = self.limiter.transaction(
            ratelimit::Name::NewOrdersPerAccount,
            ratelimit::new_orders_per_account_key(reg.id),
            1, true, true,
        )? {
            txns.push(txn);
        }
        if !is_renewal {
            let mut seen = HashSet::new();
            for ident in &idents {
                let key = ratelimit::certificates_per_domain_key(ident)?;
                if seen.insert(key.clone()) {
                    if let Some(txn) = self.limiter.transaction(
                        ratelimit::Name::CertificatesPerDomain, key, 1, true, true,
                    )? {
                        txns.push(txn);
                    }
                }
            }
            if let Some(txn) = self.limiter.transaction(
                ratelimit::Name::CertificatesPerFQDNSet,
                ratelimit::certificates_per_fqdn_set_key(&idents),
                1, true, true,
            )? {
                txns.push(txn);
            }
        }
        for ident in &idents {
            if let Some(txn) = self.limiter.transaction(
                ratelimit::Name::FailedAuthorizationsPerDomainPerAccount,
                ratelimit::failed_authorizations_key(
                    ratelimit::Name::FailedAuthorizationsPerDomainPerAccount, reg.id, ident,
                ),
                1, true, false,
            )? {
                txns.push(txn);
            }
        }

        let decision = self.limiter.batch_check_and_spend(&txns, now).await?;
        if !decision.allowed {
            return Err(limiter::rate_limit_error(&decision));
        }
        let spent = txns.into_iter().filter(|t| t.spend).collect::<Vec<_>>();

        match self
            .create_order_records(&reg, &idents, profile_name, profile, &req.replaces, set_hash, now)
            .await
        {
            Ok((order, authz_ids)) => self.load_order_pb(order, idents, authz_ids).await,
            Err(err) => {
                if let Err(refund_err) = self.limiter.refund(&spent, Utc::now()).await {
                    warn!("failed to refund rate limits for failed order: {}", refund_err);
                }
                Err(err)
            }
        }
    }

    async fn create_order_records(
        &self,
        reg: &models::Registration,
        idents: &[AcmeIdentifier],
        profile_name: String,
        profile: &config::ValidationProfile,
        replaces: &str,
        set_hash: Vec<u8>,
        now: DateTime<Utc>,
    ) -> errors::Result<(models::Order, Vec<i64>)> {
        let replaces_serial = if replaces.is_empty() {
            None
        } else {
            let cert = self.sa.get_certificate(replaces).await?;
            if cert.registration_id != reg.id {
                return Err(Error::unauthorized(
                    "requested certificate was not issued to this account",
                ));
            }
            let status = self.sa.get_certificate_status(replaces).await?;
            if status.status == models::CertStatus::Revoked {
                return Err(Error::conflict("cannot replace a revoked certificate"));
            }
            if self.sa.get_unreplaced_replacement(replaces, now).await?.is_some() {
                return Err(Error::already_replaced(format!(
                    "certificate {} already has an unfinalized replacement order", replaces
                )));
            }
            Some(replaces.to_string())
        };

        let order_lifetime = chrono::Duration::from_std(profile.order_lifetime)
            .map_err(|_| Error::internal("order lifetime out of range"))?;
        let pending_lifetime = chrono::Duration::from_std(profile.pending_authz_lifetime)
            .map_err(|_| Error::internal("pending authorization lifetime out of range"))?;

        // The order can never outlive any of its authorizations.
        let mut order_expires = now + order_lifetime;
        let mut new_authzs = vec![];
        let mut reused_authz_ids = vec![];
        for ident in idents {
            let reusable = self
                .sa
                .get_reusable_authorization(
                    reg.id,
                    ident,
                    &profile_name,
                    !self.config.features.no_pending_authz_reuse,
                    now,
                )
                .await?;
            match reusable {
                Some(authz) => {
                    order_expires = order_expires.min(Utc.from_utc_datetime(&authz.expires));
                    reused_authz_ids.push(authz.id);
                }
                None => {
                    let challenge_types = self
                        .pa
                        .challenge_types_for(ident)?
                        .into_iter()
                        .filter(|t| self.pa.challenge_type_enabled(*t))
                        .collect::<Vec<_>>();
                    if challenge_types.is_empty() {
                        return Err(Error::rejected_identifier(
                            "no enabled challenge types are applicable to this identifier",
                        ));
                    }
                    let expires = now + pending_lifetime;
                    order_expires = order_expires.min(expires);
                    new_authzs.push(models::NewAuthorization {
                        registration_id: reg.id,
                        identifier_type: ident.identifier_type,
                        identifier: ident.value.clone(),
                        status: models::AuthorizationStatus::Pending,
                        expires: expires.naive_utc(),
                        profile: profile_name.clone(),
                        challenges: models::challenges_to_bitmap(&challenge_types),
                        token: models::new_token(),
                    });
                }
            }
        }

        let new_order = models::NewOrder {
            registration_id: reg.id,
            created_at: now.naive_utc(),
            expires: order_expires.naive_utc(),
            profile: profile_name,
            replaces_serial,
            began_processing: false,
            certificate_serial: None,
            error: None,
        };
        self.sa
            .new_order_and_authzs(new_order, idents.to_vec(), new_authzs, reused_authz_ids, set_hash)
            .await
    }

    /// Runs the VA probe and settles the authorization. Spawned; retried with
    /// backoff on transport failure so a successful probe is never lost.
    async fn validation_task(
        &self,
        authz: models::Authorization,
        challenge_type: ChallengeType,
        key_authorization: String,
    ) -> Result<(), backoff::Error<String>> {
        let mut va = self.va.get().await.map_err(|e| backoff::Error::transient(e.to_string()))?;

        let required_perspectives = if self.config.features.enforce_mpic {
            self.config.required_perspectives
        } else {
            0
        };
        let mut request = tonic::Request::new(cert_ra::VaValidationRequest {
            identifier: Some(authz.ident().to_pb()),
            challenge: challenge_type.to_pb().into(),
            token: authz.token.clone(),
            key_authorization,
            required_perspectives,
        });
        request.set_timeout(self.config.deadlines.va);

        let (status, records, problem) = match va.perform_validation(request).await {
            Ok(response) => {
                let response = response.into_inner();
                let records = serde_json::from_slice(&response.records).ok();
                if !response.problem.is_empty() {
                    let problem = serde_json::from_slice(&response.problem).unwrap_or_else(|_| {
                        error_json(&Error::internal("VA returned an unreadable problem"))
                    });
                    (models::AuthorizationStatus::Invalid, records, Some(problem))
                } else if response.perspectives_corroborated < required_perspectives {
                    let problem = error_json(&Error::unauthorized(format!(
                        "validation was corroborated from {} of {} required perspectives",
                        response.perspectives_corroborated, required_perspectives
                    )));
                    (models::AuthorizationStatus::Invalid, records, Some(problem))
                } else {
                    (models::AuthorizationStatus::Valid, records, None)
                }
            }
            Err(status) => {
                let err = Error::from_status(&status);
                if err.kind == ErrorKind::ConnectionFailure {
                    warn!("challenge validation failed: {}", err);
                    return Err(backoff::Error::transient(err.to_string()));
                }
                let problem = error_json(&Error::internal("challenge verification unexpectedly failed"));
                (models::AuthorizationStatus::Invalid, None, Some(problem))
            }
        };

        match self
            .sa
            .finalize_authorization(authz.id, status, challenge_type, Utc::now(), records, problem)
            .await
        {
            Ok(()) => {}
            // Someone else settled it first; nothing left to do.
            Err(err) if err.kind == ErrorKind::Conflict => return Ok(()),
            Err(err) => return Err(backoff::Error::transient(err.to_string())),
        }

        if status == models::AuthorizationStatus::Invalid {
            self.record_validation_failure(&authz).await;
        }
        Ok(())
    }

    /// Debits the failed-authorization buckets and pauses the (account,
    /// identifier) pair once the zombie threshold is crossed.
    async fn record_validation_failure(&self, authz: &models::Authorization) {
        let now = Utc::now();
        let ident = authz.ident();
        let mut txns = vec![];

        match self.limiter.transaction(
            ratelimit::Name::FailedAuthorizationsPerDomainPerAccount,
            ratelimit::failed_authorizations_key(
                ratelimit::Name::FailedAuthorizationsPerDomainPerAccount,
                authz.registration_id,
                &ident,
            ),
            1, false, true,
        ) {
            Ok(Some(txn)) => txns.push(txn),
            Ok(None) => {}
            Err(err) => warn!("failed to build failed-authorization transaction: {}", err),
        }

        let mut pausing_index = None;
        if self.config.features.automatically_pause_zombie_clients {
            let zombie = self.config.zombie;
            match ratelimit::limit::Limit::new(
                ratelimit::Name::FailedAuthorizationsForPausingPerDomainPerAccount,
                &ratelimit::limit::LimitConfig {
                    burst: zombie.threshold,
                    count: zombie.threshold,
                    period: zombie.window,
                    fail_open: true,
                },
            ) {
                Ok(limit) => {
                    pausing_index = Some(txns.len());
                    txns.push(limiter::Transaction {
                        bucket_key: ratelimit::failed_authorizations_key(
                            ratelimit::Name::FailedAuthorizationsForPausingPerDomainPerAccount,
                            authz.registration_id,
                            &ident,
                        ),
                        limit,
                        cost: 1,
                        check: false,
                        spend: true,
                    });
                }
                Err(err) => warn!("failed to build pausing limit: {}", err),
            }
        }

        if txns.is_empty() {
            return;
        }
        match self.limiter.spend(&txns, now).await {
            Ok(decisions) => {
                if let Some(index) = pausing_index {
                    if !decisions[index].allowed {
                        info!(
                            "pausing registration {} for {:?} after repeated validation failures",
                            authz.registration_id, ident.value
                        );
                        if let Err(err) = self.sa.pause_identifier(authz.registration_id, &ident, now).await {
                            warn!("failed to pause identifier: {}", err);
                        }
                    }
                }
            }
            Err(err) => warn!("failed to record validation failure: {}", err),
        }
    }

    /// The must-not-abandon tail of finalization: once a pre-certificate
    /// exists it has to end up published, so every step here retries under
    /// the caller's backoff until terminal.
    async fn finalize_order_task(
        &self,
        order: models::Order,
        idents: Vec<AcmeIdentifier>,
        csr: Vec<u8>,
    ) -> Result<(), backoff::Error<String>> {
        let mut ca = self.ca.get().await.map_err(|e| backoff::Error::transient(e.to_string()))?;
        let set_hash = identifier::hash_identifiers(&idents);
        let is_renewal = self
            .sa
            .fqdn_set_exists(&set_hash)
            .await
            .map_err(|e| backoff::Error::transient(e.to_string()))?;

        let (final_der, chain, parsed) = if self.config.features.unsplit_issuance {
            // Single CA round trip; the CA collects SCTs through our
            // SctProvider surface.
            let mut request = tonic::Request::new(cert_ra::IssueCertificateRequest {
                csr: csr.clone(),
                registration_id: order.registration_id,
                order_id: order.id,
                cert_profile_name: order.profile.clone(),
            });
            request.set_timeout(self.config.deadlines.ca);
            let response = match ca.issue_certificate(request).await {
                Ok(response) => response.into_inner(),
                Err(status) => return self.ca_failure(&order, status).await,
            };
            let parsed = parse_cert_der(&response.der)
                .map_err(|e| backoff::Error::transient(e.to_string()))?;
            let serial_row = models::NewSerial {
                serial: parsed.serial.clone(),
                registration_id: order.registration_id,
                created: parsed.issued,
                expires: parsed.expires,
            };
            let issued_names = idents.iter().map(|ident| models::NewIssuedName {
                reversed_name: identifier::encode_issued_name(&ident.value),
                serial: parsed.serial.clone(),
                not_before: parsed.issued,
                renewal: is_renewal,
            }).collect();
            let cert_row = models::NewCertificate {
                serial: parsed.serial.clone(),
                registration_id: order.registration_id,
                der: response.der.clone(),
                digest: BASE64_URL_SAFE_NO_PAD.encode(openssl::sha::sha256(&response.der)),
                issued: parsed.issued,
                expires: parsed.expires,
                issuer_id: self.config.issuer_id,
            };
            let status_row = models::NewCertificateStatus {
                serial: parsed.serial.clone(),
                status: models::CertStatus::Good,
                revoked_date: None,
                revoked_reason: 0,
                not_after: parsed.expires,
                is_expired: false,
                issuer_id: self.config.issuer_id,
            };
            let fqdn_row = models::NewFqdnSet {
                set_hash: set_hash.clone(),
                serial: parsed.serial.clone(),
                issued: parsed.issued,
                expires: parsed.expires,
            };
            self.sa
                .add_certificate_and_serial(cert_row, status_row, fqdn_row, serial_row, issued_names)
                .await
                .map_err(|e| backoff::Error::transient(e.to_string()))?;
            (response.der, response.chain, parsed)
        } else {
            let mut request = tonic::Request::new(cert_ra::IssuePrecertificateRequest {
                csr: csr.clone(),
                registration_id: order.registration_id,
                order_id: order.id,
                cert_profile_name: order.profile.clone(),
            });
            request.set_timeout(self.config.deadlines.ca);
            let precert = match ca.issue_precertificate(request).await {
                Ok(response) => response.into_inner(),
                Err(status) => return self.ca_failure(&order, status).await,
            };
            let parsed = parse_cert_der(&precert.der)
                .map_err(|e| backoff::Error::transient(e.to_string()))?;

            let precert_row = models::NewPrecertificate {
                serial: parsed.serial.clone(),
                registration_id: order.registration_id,
                der: precert.der.clone(),
                issued: parsed.issued,
                expires: parsed.expires,
                issuer_id: self.config.issuer_id,
                cert_profile_hash: precert.cert_profile_hash.clone(),
            };
            let serial_row = models::NewSerial {
                serial: parsed.serial.clone(),
                registration_id: order.registration_id,
                created: parsed.issued,
                expires: parsed.expires,
            };
            let issued_names = idents.iter().map(|ident| models::NewIssuedName {
                reversed_name: identifier::encode_issued_name(&ident.value),
                serial: parsed.serial.clone(),
                not_before: parsed.issued,
                renewal: is_renewal,
            }).collect();
            self.sa
                .add_precertificate(precert_row, serial_row, issued_names)
                .await
                .map_err(|e| backoff::Error::transient(e.to_string()))?;

            let scts = sct::get_scts(
                &self.http_client,
                &self.config.ct_logs,
                sct::build_chain(&precert.der, &precert.chain),
            )
            .await
            .map_err(|e| backoff::Error::transient(e.to_string()))?;

            let mut request = tonic::Request::new(cert_ra::IssueCertificateForPrecertificateRequest {
                der: precert.der.clone(),
                scts,
                registration_id: order.registration_id,
                order_id: order.id,
                cert_profile_hash: precert.cert_profile_hash.clone(),
            });
            request.set_timeout(self.config.deadlines.ca);
            let response = match ca.issue_certificate_for_precertificate(request).await {
                Ok(response) => response.into_inner(),
                Err(status) => return self.ca_failure(&order, status).await,
            };

            let cert_row = models::NewCertificate {
                serial: parsed.serial.clone(),
                registration_id: order.registration_id,
                der: response.der.clone(),
                digest: BASE64_URL_SAFE_NO_PAD.encode(openssl::sha::sha256(&response.der)),
                issued: parsed.issued,
                expires: parsed.expires,
                issuer_id: self.config.issuer_id,
            };
            let status_row = models::NewCertificateStatus {
                serial: parsed.serial.clone(),
                status: models::CertStatus::Good,
                revoked_date: None,
                revoked_reason: 0,
                not_after: parsed.expires,
                is_expired: false,
                issuer_id: self.config.issuer_id,
            };
            let fqdn_row = models::NewFqdnSet {
                set_hash: set_hash.clone(),
                serial: parsed.serial.clone(),
                issued: parsed.issued,
                expires: parsed.expires,
            };
            self.sa
                .add_certificate(cert_row, status_row, fqdn_row)
                .await
                .map_err(|e| backoff::Error::transient(e.to_string()))?;
            (response.der, response.chain, parsed)
        };

        self.sa
            .finalize_order(order.id, parsed.serial.clone())
            .await
            .map_err(|e| backoff::Error::transient(e.to_string()))?;
        info!("issued certificate {} for order {}", parsed.serial, order.id);

        // Publication of the final certificate is best-effort and must not
        // hold the order in processing.
        let publisher = self.clone();
        tokio::task::spawn(async move {
            let chain = sct::build_chain(&final_der, &chain);
            tokio::select! {
                _ = sct::submit_final(&publisher.http_client, &publisher.config.ct_logs, chain) => {}
                _ = tokio::time::sleep(publisher.config.deadlines.publisher) => {
                    warn!("timed out publishing certificate {}", parsed.serial);
                }
            }
        });

        Ok(())
    }

    /// Classifies a CA failure: transport problems retry, anything else is
    /// terminal for the order.
    async fn ca_failure(
        &self,
        order: &models::Order,
        status: tonic::Status,
    ) -> Result<(), backoff::Error<String>> {
        let err = Error::from_status(&status);
        match err.kind {
            ErrorKind::ConnectionFailure => Err(backoff::Error::transient(err.to_string())),
            ErrorKind::Malformed | ErrorKind::BadCsr => {
                self.fail_order(order, &Error::bad_csr(err.detail)).await
            }
            ErrorKind::BadPublicKey => self.fail_order(order, &err).await,
            _ => {
                self.fail_order(order, &Error::internal("issuance unexpectedly failed")).await
            }
        }
    }

    async fn fail_order(
        &self,
        order: &models::Order,
        err: &Error,
    ) -> Result<(), backoff::Error<String>> {
        warn!("order {} failed: {}", order.id, err);
        self.sa
            .set_order_error(order.id, err)
            .await
            .map_err(|e| backoff::Error::transient(e.to_string()))?;
        Ok(())
    }

    async fn revoke_inner(
        &self,
        serial: &str,
        requested_reason: i64,
        registration_id: Option<i64>,
        by_key: bool,
        admin: bool,
        skip_blocked_key: bool,
    ) -> errors::Result<()> {
        let allowed: &[i64] = if admin { &[0, 1, 3, 4, 5, 9] } else { &[0, 1, 3, 4, 5] };
        if !allowed.contains(&requested_reason) {
            return Err(Error::bad_revocation_reason(requested_reason));
        }
        if requested_reason == 1 && !by_key && !admin {
            return Err(Error::new(
                ErrorKind::BadRevocationReason,
                "revocation with reason keyCompromise requires demonstrating control of the key",
            ));
        }
        let reason = requested_reason as i16;

        let cert = self.sa.get_certificate(serial).await?;
        let status = self.sa.get_certificate_status(serial).await?;

        if let Some(registration_id) = registration_id {
            if !by_key && cert.registration_id != registration_id {
                // Not the issuing account; holding valid authorizations for
                // every identifier in the certificate also suffices.
                let now = Utc::now();
                for ident in cert_identifiers(&cert.der)? {
                    if !self.any_valid_authorization(registration_id, &ident, now).await? {
                        return Err(Error::unauthorized(
                            "account is not authorized to revoke this certificate",
                        ));
                    }
                }
            }
        }

        let now = Utc::now();
        let shard_idx = (status.not_after.and_utc().timestamp() / 3600)
            .rem_euclid(self.config.crl_shard_width.max(1));

        if status.status == models::CertStatus::Revoked {
            // Only the escalation from unspecified to keyCompromise may
            // touch an already-revoked certificate.
            if status.revoked_reason == 0 && reason == 1 && (by_key || admin) {
                self.sa.update_revoked_certificate(serial.to_string(), reason, now).await?;
            } else {
                return Err(Error::already_revoked("certificate is already revoked"));
            }
        } else {
            self.sa
                .revoke_certificate(serial.to_string(), reason, now, shard_idx, status.issuer_id)
                .await?;
        }

        if reason == 1 && !skip_blocked_key {
            let parsed = openssl::x509::X509::from_der(&cert.der)
                .map_err(|e| Error::internal(format!("failed to parse certificate: {}", e)))?;
            let public_key = parsed.public_key()
                .map_err(|e| Error::internal(format!("failed to read certificate key: {}", e)))?;
            self.sa
                .add_blocked_key(models::NewBlockedKey {
                    key_hash: crate::goodkey::spki_sha256(&public_key)?,
                    added: now.naive_utc(),
                    source: if admin { "admin-revoker".to_string() } else { "API".to_string() },
                    comment: None,
                })
                .await?;
        }

        // Administrative key-compromise revocations also take down the
        // authorizations that could re-issue for the same names.
        if admin && reason == 1 {
            let revoked = self
                .sa
                .revoke_authorizations(cert.registration_id, &cert_identifiers(&cert.der)?)
                .await?;
            if revoked > 0 {
                info!("revoked {} authorizations alongside certificate {}", revoked, serial);
            }
        }
        Ok(())
    }

    async fn any_valid_authorization(
        &self,
        registration_id: i64,
        ident: &AcmeIdentifier,
        now: DateTime<Utc>,
    ) -> errors::Result<bool> {
        // Reuse lookups are profile-scoped; revocation authority is not, so
        // probe every configured profile.
        for profile_name in self.config.validation_profiles.keys() {
            if self
                .sa
                .get_reusable_authorization(registration_id, ident, profile_name, false, now)
                .await?
                .is_some()
            {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[tonic::async_trait]
impl cert_ra::registration_authority_server::RegistrationAuthority for RA {
    async fn new_registration(
        &self,
        request: tonic::Request<cert_ra::NewRegistrationRequest>,
    ) -> Result<tonic::Response<cert_ra::Registration>, tonic::Status> {
        let request = request.into_inner();
        let now = Utc::now();

        if request.jwk.is_empty() {
            return Err(Error::malformed("registration JWK is empty").into());
        }
        let jwk: serde_json::Value = serde_json::from_slice(&request.jwk)
            .map_err(|_| Error::malformed("registration JWK is not valid JSON"))?;
        self.validate_contacts(&request.contact)?;

        let mut txns = vec![];
        if let Ok(addr) = request.initial_ip.parse::<std::net::IpAddr>() {
            if let Some(txn) = self.limiter.transaction(
                ratelimit::Name::NewRegistrationsPerIPAddress,
                ratelimit::new_registrations_per_ip_key(addr),
                1, true, true,
            )? {
                txns.push(txn);
            }
            if let std::net::IpAddr::V6(v6) = addr {
                if let Some(txn) = self.limiter.transaction(
                    ratelimit::Name::NewRegistrationsPerIPv6Range,
                    ratelimit::new_registrations_per_ipv6_range_key(v6)?,
                    1, true, true,
                )? {
                    txns.push(txn);
                }
            }
        }
        let decision = self.limiter.batch_check_and_spend(&txns, now).await?;
        if !decision.allowed {
            return Err(limiter::rate_limit_error(&decision).into());
        }

        let reg = self
            .sa
            .new_registration(models::NewRegistration {
                jwk,
                jwk_sha256: openssl::sha::sha256(&request.jwk).to_vec(),
                contact: request.contact,
                agreement: if request.agreement.is_empty() { None } else { Some(request.agreement) },
                created_at: now.naive_utc(),
                status: models::RegistrationStatus::Valid,
            })
            .await?;
        Ok(tonic::Response::new(reg.to_pb()?))
    }

    async fn get_registration(
        &self,
        request: tonic::Request<cert_ra::RegistrationIdRequest>,
    ) -> Result<tonic::Response<cert_ra::Registration>, tonic::Status> {
        let request = request.into_inner();
        let reg = self.sa.get_registration(request.id).await?;
        Ok(tonic::Response::new(reg.to_pb()?))
    }

    async fn update_registration(
        &self,
        request: tonic::Request<cert_ra::UpdateRegistrationRequest>,
    ) -> Result<tonic::Response<cert_ra::Registration>, tonic::Status> {
        let request = request.into_inner();
        let reg = self.sa.get_registration(request.id).await?;
        if reg.status != models::RegistrationStatus::Valid {
            return Err(Error::unauthorized("account is not valid").into());
        }
        self.validate_contacts(&request.contact)?;
        let agreement = if request.agreement.is_empty() {
            reg.agreement.clone()
        } else {
            Some(request.agreement)
        };
        let reg = self.sa.update_registration(request.id, request.contact, agreement).await?;
        Ok(tonic::Response::new(reg.to_pb()?))
    }

    async fn deactivate_registration(
        &self,
        request: tonic::Request<cert_ra::RegistrationIdRequest>,
    ) -> Result<tonic::Response<cert_ra::Registration>, tonic::Status> {
        let request = request.into_inner();
        let reg = self.sa.deactivate_registration(request.id).await?;
        Ok(tonic::Response::new(reg.to_pb()?))
    }

    async fn new_order(
        &self,
        request: tonic::Request<cert_ra::NewOrderRequest>,
    ) -> Result<tonic::Response<cert_ra::Order>, tonic::Status> {
        let order = self.new_order_inner(request.into_inner()).await?;
        Ok(tonic::Response::new(order))
    }

    async fn get_order(
        &self,
        request: tonic::Request<cert_ra::OrderIdRequest>,
    ) -> Result<tonic::Response<cert_ra::Order>, tonic::Status> {
        let request = request.into_inner();
        let (order, identifiers, authz_ids) = self.sa.get_order(request.id).await?;
        let idents = identifiers.iter().map(|i| i.ident()).collect::<Vec<_>>();
        let order = self.load_order_pb(order, idents, authz_ids).await?;
        Ok(tonic::Response::new(order))
    }

    async fn finalize_order(
        &self,
        request: tonic::Request<cert_ra::FinalizeOrderRequest>,
    ) -> Result<tonic::Response<cert_ra::Order>, tonic::Status> {
        let request = request.into_inner();
        let now = Utc::now();

        let (mut order, identifiers, authz_ids) = self.sa.get_order(request.id).await?;
        if order.registration_id != request.registration_id {
            return Err(Error::not_found("order does not exist").into());
        }
        let idents = identifiers.iter().map(|i| i.ident()).collect::<Vec<_>>();

        let validities = self.sa.get_authz_validity(&authz_ids).await?;
        let status = models::order_status(&order, &validities, now)?;
        if status != cert_ra::OrderStatus::Ready {
            return Err(Error::order_not_ready(
                "order is not in a ready state for finalization",
            ).into());
        }

        let public_key = crate::csr::verify_csr(&request.csr, &idents)?;
        if self.sa.is_key_blocked(&crate::goodkey::spki_sha256(&public_key)?).await? {
            return Err(Error::bad_public_key("public key is forbidden").into());
        }

        // Every authorization must have been solved by a challenge type that
        // is still enabled and applicable.
        for authz_id in &authz_ids {
            let authz = self.sa.get_authorization(*authz_id).await?;
            let attempted = authz.attempted.ok_or_else(|| {
                Error::internal(format!("valid authorization {} has no attempted challenge", authz.id))
            })?;
            self.pa.check_authz_challenges(&authz.ident(), attempted)?;
        }

        // The one and only guard against concurrent finalization.
        self.sa.set_order_processing(order.id).await?;
        order.began_processing = true;

        let task_ra = self.clone();
        let task_order = order.clone();
        let task_idents = idents.clone();
        tokio::task::spawn(async move {
            let result = backoff::future::retry(backoff::ExponentialBackoff::default(), || async {
                task_ra
                    .finalize_order_task(task_order.clone(), task_idents.clone(), request.csr.clone())
                    .await
                    .map_err(|e| {
                        warn!("failed to finalize order {}: {:?}", task_order.id, e);
                        e
                    })
            })
            .await;
            if result.is_err() {
                let err = Error::internal("issuance could not be completed");
                if let Err(e) = task_ra.sa.set_order_error(task_order.id, &err).await {
                    warn!("failed to record terminal order error: {}", e);
                }
            }
        });

        let order = order.to_pb(&idents, authz_ids, cert_ra::OrderStatus::Processing);
        Ok(tonic::Response::new(order))
    }

    async fn get_authorization(
        &self,
        request: tonic::Request<cert_ra::AuthorizationIdRequest>,
    ) -> Result<tonic::Response<cert_ra::Authorization>, tonic::Status> {
        let request = request.into_inner();
        let authz = self.sa.get_authorization(request.id).await?;
        Ok(tonic::Response::new(authz.to_pb(Utc::now())))
    }

    async fn perform_validation(
        &self,
        request: tonic::Request<cert_ra::PerformValidationRequest>,
    ) -> Result<tonic::Response<cert_ra::Authorization>, tonic::Status> {
        let request = request.into_inner();
        let now = Utc::now();

        let authz = self.sa.get_authorization(request.id).await?;
        if authz.registration_id != request.registration_id {
            return Err(Error::not_found("authorization does not exist").into());
        }
        if authz.computed_status(now) != cert_ra::AuthorizationStatus::Pending {
            return Err(Error::malformed("authorization is not pending").into());
        }

        let offered = models::bitmap_to_challenges(authz.challenges);
        let challenge_type = offered
            .get(usize::try_from(request.challenge_index).map_err(|_| {
                Error::malformed("challenge index out of range")
            })?)
            .copied()
            .ok_or_else(|| Error::malformed("challenge index out of range"))?;

        if !self.pa.challenge_type_enabled(challenge_type) {
            return Err(Error::malformed("challenge type is not enabled").into());
        }
        if request.account_thumbprint.is_empty() {
            return Err(Error::malformed("account thumbprint is required").into());
        }
        let key_authorization = format!("{}.{}", authz.token, request.account_thumbprint);

        let task_ra = self.clone();
        let task_authz = authz.clone();
        tokio::task::spawn(async move {
            let _ = backoff::future::retry(backoff::ExponentialBackoff::default(), || async {
                task_ra
                    .validation_task(task_authz.clone(), challenge_type, key_authorization.clone())
                    .await
                    .map_err(|e| {
                        warn!("failed to process challenge validation: {:?}", e);
                        e
                    })
            })
            .await;
        });

        Ok(tonic::Response::new(authz.to_pb(now)))
    }

    async fn deactivate_authorization(
        &self,
        request: tonic::Request<cert_ra::AuthorizationIdRequest>,
    ) -> Result<tonic::Response<cert_ra::Authorization>, tonic::Status> {
        let request = request.into_inner();
        let authz = self.sa.deactivate_authorization(request.id).await?;
        Ok(tonic::Response::new(authz.to_pb(Utc::now())))
    }

    async fn revoke_certificate(
        &self,
        request: tonic::Request<cert_ra::RevokeCertificateRequest>,
    ) -> Result<tonic::Response<cert_ra::RevokeCertificateResponse>, tonic::Status> {
        let request = request.into_inner();
        self.revoke_inner(
            &request.serial,
            request.code,
            Some(request.registration_id),
            request.by_key,
            false,
            false,
        )
        .await?;
        Ok(tonic::Response::new(cert_ra::RevokeCertificateResponse {}))
    }

    async fn administratively_revoke_certificate(
        &self,
        request: tonic::Request<cert_ra::AdministrativelyRevokeCertificateRequest>,
    ) -> Result<tonic::Response<cert_ra::RevokeCertificateResponse>, tonic::Status> {
        let request = request.into_inner();
        if request.admin_name.is_empty() {
            return Err(Error::malformed("admin name is required").into());
        }
        info!(
            "administrative revocation of {} (reason {}) by {}",
            request.serial, request.code, request.admin_name
        );
        self.revoke_inner(
            &request.serial,
            request.code,
            None,
            true,
            true,
            request.skip_blocked_key,
        )
        .await?;
        Ok(tonic::Response::new(cert_ra::RevokeCertificateResponse {}))
    }
}

#[tonic::async_trait]
impl cert_ra::sct_provider_server::SctProvider for RA {
    async fn get_sc_ts(
        &self,
        request: tonic::Request<cert_ra::GetScTsRequest>,
    ) -> Result<tonic::Response<cert_ra::GetScTsResponse>, tonic::Status> {
        let request = request.into_inner();
        if request.precert_der.is_empty() {
            return Err(Error::malformed("pre-certificate is required").into());
        }
        let scts = sct::get_scts(
            &self.http_client,
            &self.config.ct_logs,
            sct::build_chain(&request.precert_der, &request.chain),
        )
        .await?;
        Ok(tonic::Response::new(cert_ra::GetScTsResponse { scts }))
    }
}
