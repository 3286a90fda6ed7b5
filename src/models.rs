use super::schema::*;
use diesel::prelude::*;
use chrono::prelude::*;
use base64::prelude::*;
use rand::Rng;

use crate::errors::{self, Error};
use crate::identifier::{AcmeIdentifier, ChallengeType, IdentifierType};

#[derive(DbEnum, Serialize, Deserialize, Debug, PartialEq, Eq, Copy, Clone)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationStatus {
    Valid,
    Deactivated,
    Revoked,
}

#[derive(DbEnum, Serialize, Deserialize, Debug, PartialEq, Eq, Copy, Clone)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Revoked,
}

#[derive(DbEnum, Serialize, Deserialize, Debug, PartialEq, Eq, Copy, Clone)]
#[serde(rename_all = "lowercase")]
pub enum CertStatus {
    Good,
    Revoked,
}

/// A fresh 256-bit challenge token, URL-safe base64 without padding. All of
/// an authorization's challenges share it.
pub fn new_token() -> String {
    let mut token = [0u8; 32];
    rand::thread_rng().fill(&mut token);
    BASE64_URL_SAFE_NO_PAD.encode(token)
}

pub fn challenges_to_bitmap(challenges: &[ChallengeType]) -> i16 {
    challenges.iter().fold(0, |acc, c| acc | c.bit())
}

pub fn bitmap_to_challenges(bitmap: i16) -> Vec<ChallengeType> {
    [ChallengeType::Http01, ChallengeType::Dns01, ChallengeType::TlsAlpn01, ChallengeType::DnsAccount01]
        .into_iter()
        .filter(|c| bitmap & c.bit() != 0)
        .collect()
}

fn pb_time(t: NaiveDateTime) -> prost_wkt_types::Timestamp {
    let t = Utc.from_utc_datetime(&t);
    prost_wkt_types::Timestamp {
        seconds: t.timestamp(),
        nanos: t.timestamp_subsec_nanos() as i32,
    }
}

#[derive(Queryable, Identifiable, AsChangeset, Debug, Clone)]
#[diesel(table_name = registrations)]
pub struct Registration {
    pub id: i64,
    pub jwk: serde_json::Value,
    pub jwk_sha256: Vec<u8>,
    pub contact: Vec<String>,
    pub agreement: Option<String>,
    pub created_at: NaiveDateTime,
    pub status: RegistrationStatus,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = registrations)]
pub struct NewRegistration {
    pub jwk: serde_json::Value,
    pub jwk_sha256: Vec<u8>,
    pub contact: Vec<String>,
    pub agreement: Option<String>,
    pub created_at: NaiveDateTime,
    pub status: RegistrationStatus,
}

impl Registration {
    pub fn to_pb(&self) -> errors::Result<crate::cert_ra::Registration> {
        Ok(crate::cert_ra::Registration {
            id: self.id,
            jwk: serde_json::to_vec(&self.jwk)
                .map_err(|e| Error::internal(format!("failed to encode JWK: {}", e)))?,
            contact: self.contact.clone(),
            agreement: self.agreement.clone().unwrap_or_default(),
            created_at: Some(pb_time(self.created_at)),
            status: match self.status {
                RegistrationStatus::Valid => crate::cert_ra::RegistrationStatus::Valid,
                RegistrationStatus::Deactivated => crate::cert_ra::RegistrationStatus::Deactivated,
                RegistrationStatus::Revoked => crate::cert_ra::RegistrationStatus::Revoked,
            }.into(),
        })
    }
}

#[derive(Queryable, Identifiable, AsChangeset, Debug, Clone)]
#[diesel(table_name = orders)]
pub struct Order {
    pub id: i64,
    pub registration_id: i64,
    pub created_at: NaiveDateTime,
    pub expires: NaiveDateTime,
    pub profile: String,
    pub replaces_serial: Option<String>,
    pub began_processing: bool,
    pub certificate_serial: Option<String>,
    pub error: Option<serde_json::Value>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = orders)]
pub struct NewOrder {
    pub registration_id: i64,
    pub created_at: NaiveDateTime,
    pub expires: NaiveDateTime,
    pub profile: String,
    pub replaces_serial: Option<String>,
    pub began_processing: bool,
    pub certificate_serial: Option<String>,
    pub error: Option<serde_json::Value>,
}

#[derive(Queryable, Identifiable, Debug, Clone)]
#[diesel(table_name = order_identifiers)]
pub struct OrderIdentifier {
    pub id: i64,
    pub order_id: i64,
    pub identifier_type: IdentifierType,
    pub identifier: String,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = order_identifiers)]
pub struct NewOrderIdentifier {
    pub order_id: i64,
    pub identifier_type: IdentifierType,
    pub identifier: String,
}

impl OrderIdentifier {
    pub fn ident(&self) -> AcmeIdentifier {
        AcmeIdentifier {
            identifier_type: self.identifier_type,
            value: self.identifier.clone(),
        }
    }
}

#[derive(Queryable, Identifiable, AsChangeset, Debug, Clone)]
#[diesel(table_name = authorizations)]
pub struct Authorization {
    pub id: i64,
    pub registration_id: i64,
    pub identifier_type: IdentifierType,
    pub identifier: String,
    pub status: AuthorizationStatus,
    pub expires: NaiveDateTime,
    pub profile: String,
    pub challenges: i16,
    pub token: String,
    pub attempted: Option<ChallengeType>,
    pub attempted_at: Option<NaiveDateTime>,
    pub validation_records: Option<serde_json::Value>,
    pub validation_error: Option<serde_json::Value>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = authorizations)]
pub struct NewAuthorization {
    pub registration_id: i64,
    pub identifier_type: IdentifierType,
    pub identifier: String,
    pub status: AuthorizationStatus,
    pub expires: NaiveDateTime,
    pub profile: String,
    pub challenges: i16,
    pub token: String,
}

#[derive(Queryable, Identifiable, Debug, Clone)]
#[diesel(table_name = order_to_authzs)]
pub struct OrderToAuthz {
    pub id: i64,
    pub order_id: i64,
    pub authz_id: i64,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = order_to_authzs)]
pub struct NewOrderToAuthz {
    pub order_id: i64,
    pub authz_id: i64,
}

impl Authorization {
    pub fn ident(&self) -> AcmeIdentifier {
        AcmeIdentifier {
            identifier_type: self.identifier_type,
            value: self.identifier.clone(),
        }
    }

    /// The surfaced status: the stored one, shadowed by expiry.
    pub fn computed_status(&self, now: DateTime<Utc>) -> crate::cert_ra::AuthorizationStatus {
        match self.status {
            AuthorizationStatus::Revoked => crate::cert_ra::AuthorizationStatus::Revoked,
            AuthorizationStatus::Deactivated => crate::cert_ra::AuthorizationStatus::Deactivated,
            _ if self.expires <= now.naive_utc() => crate::cert_ra::AuthorizationStatus::Expired,
            AuthorizationStatus::Invalid => crate::cert_ra::AuthorizationStatus::Invalid,
            AuthorizationStatus::Valid => crate::cert_ra::AuthorizationStatus::Valid,
            AuthorizationStatus::Pending => crate::cert_ra::AuthorizationStatus::Pending,
        }
    }

    pub fn validity(&self) -> AuthzValidity {
        AuthzValidity {
            status: self.status,
            expires: self.expires,
        }
    }

    /// Builds the client-facing view. Before any attempt every offered
    /// challenge is listed; after an attempt only the attempted challenge
    /// remains visible.
    pub fn to_pb(&self, now: DateTime<Utc>) -> crate::cert_ra::Authorization {
        let challenge_status = match self.status {
            AuthorizationStatus::Valid => crate::cert_ra::ChallengeStatus::Valid,
            AuthorizationStatus::Invalid => crate::cert_ra::ChallengeStatus::Invalid,
            _ => crate::cert_ra::ChallengeStatus::Pending,
        };
        let challenges = match self.attempted {
            Some(attempted) => vec![crate::cert_ra::Challenge {
                r#type: attempted.to_pb().into(),
                token: self.token.clone(),
                status: challenge_status.into(),
                validated: match (self.status, self.attempted_at) {
                    (AuthorizationStatus::Valid, Some(at)) => Some(pb_time(at)),
                    _ => None,
                },
                error: self.validation_error.clone()
                    .and_then(|e| serde_json::to_vec(&e).ok())
                    .unwrap_or_default(),
                validation_records: self.validation_records.clone()
                    .and_then(|r| serde_json::to_vec(&r).ok())
                    .unwrap_or_default(),
            }],
            None => bitmap_to_challenges(self.challenges)
                .into_iter()
                .map(|t| crate::cert_ra::Challenge {
                    r#type: t.to_pb().into(),
                    token: self.token.clone(),
                    status: crate::cert_ra::ChallengeStatus::Pending.into(),
                    validated: None,
                    error: vec![],
                    validation_records: vec![],
                })
                .collect(),
        };

        crate::cert_ra::Authorization {
            id: self.id,
            registration_id: self.registration_id,
            identifier: Some(self.ident().to_pb()),
            status: self.computed_status(now).into(),
            expires: Some(pb_time(self.expires)),
            challenges,
            profile: self.profile.clone(),
        }
    }
}

/// The slice of an authorization the order status function needs.
#[derive(Queryable, Debug, Copy, Clone)]
pub struct AuthzValidity {
    pub status: AuthorizationStatus,
    pub expires: NaiveDateTime,
}

/// Computes an order's status from its row, its authorizations' validity and
/// the clock. Pure; the status is never stored. In summary:
///   - An order with a terminal error, past its expiry, or with any
///     non-pending non-valid authorization is invalid.
///   - Any pending authorization makes the order pending.
///   - All valid: the certificate serial makes it valid, began_processing
///     makes it processing, otherwise it is ready.
pub fn order_status(
    order: &Order,
    authzs: &[AuthzValidity],
    now: DateTime<Utc>,
) -> errors::Result<crate::cert_ra::OrderStatus> {
    if order.error.is_some() {
        return Ok(crate::cert_ra::OrderStatus::Invalid);
    }

    // Expired authorizations may already be purged, so an expired order is
    // settled before looking at them.
    let now = now.naive_utc();
    if order.expires < now {
        return Ok(crate::cert_ra::OrderStatus::Invalid);
    }

    let mut pending = 0usize;
    let mut valid = 0usize;
    let mut other = 0usize;
    let mut expired = 0usize;
    for authz in authzs {
        match authz.status {
            AuthorizationStatus::Pending => pending += 1,
            AuthorizationStatus::Valid => valid += 1,
            AuthorizationStatus::Invalid
            | AuthorizationStatus::Deactivated
            | AuthorizationStatus::Revoked => other += 1,
        }
        if authz.expires < now {
            expired += 1;
        }
    }

    if other > 0 || expired > 0 {
        return Ok(crate::cert_ra::OrderStatus::Invalid);
    }
    if pending > 0 {
        return Ok(crate::cert_ra::OrderStatus::Pending);
    }
    if valid != authzs.len() || authzs.is_empty() {
        return Err(Error::internal(format!(
            "order {} has the wrong number of valid authorizations ({} of {})",
            order.id, valid, authzs.len()
        )));
    }

    if order.certificate_serial.is_some() {
        return Ok(crate::cert_ra::OrderStatus::Valid);
    }
    if order.began_processing {
        return Ok(crate::cert_ra::OrderStatus::Processing);
    }
    Ok(crate::cert_ra::OrderStatus::Ready)
}

impl Order {
    pub fn to_pb(
        &self,
        identifiers: &[AcmeIdentifier],
        authz_ids: Vec<i64>,
        status: crate::cert_ra::OrderStatus,
    ) -> crate::cert_ra::Order {
        crate::cert_ra::Order {
            id: self.id,
            registration_id: self.registration_id,
            identifiers: identifiers.iter().map(|i| i.to_pb()).collect(),
            created_at: Some(pb_time(self.created_at)),
            expires: Some(pb_time(self.expires)),
            status: status.into(),
            authorization_ids: authz_ids,
            certificate_serial: self.certificate_serial.clone().unwrap_or_default(),
            profile: self.profile.clone(),
            replaces: self.replaces_serial.clone().unwrap_or_default(),
            error: self.error.clone()
                .and_then(|e| serde_json::to_vec(&e).ok())
                .unwrap_or_default(),
        }
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = serials)]
pub struct NewSerial {
    pub serial: String,
    pub registration_id: i64,
    pub created: NaiveDateTime,
    pub expires: NaiveDateTime,
}

#[derive(Queryable, Identifiable, Debug, Clone)]
#[diesel(table_name = precertificates)]
pub struct Precertificate {
    pub id: i64,
    pub serial: String,
    pub registration_id: i64,
    pub der: Vec<u8>,
    pub issued: NaiveDateTime,
    pub expires: NaiveDateTime,
    pub issuer_id: i64,
    pub cert_profile_hash: Vec<u8>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = precertificates)]
pub struct NewPrecertificate {
    pub serial: String,
    pub registration_id: i64,
    pub der: Vec<u8>,
    pub issued: NaiveDateTime,
    pub expires: NaiveDateTime,
    pub issuer_id: i64,
    pub cert_profile_hash: Vec<u8>,
}

#[derive(Queryable, Identifiable, Debug, Clone)]
#[diesel(table_name = certificates)]
pub struct Certificate {
    pub id: i64,
    pub serial: String,
    pub registration_id: i64,
    pub der: Vec<u8>,
    pub digest: String,
    pub issued: NaiveDateTime,
    pub expires: NaiveDateTime,
    pub issuer_id: i64,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = certificates)]
pub struct NewCertificate {
    pub serial: String,
    pub registration_id: i64,
    pub der: Vec<u8>,
    pub digest: String,
    pub issued: NaiveDateTime,
    pub expires: NaiveDateTime,
    pub issuer_id: i64,
}

#[derive(Queryable, Identifiable, AsChangeset, Debug, Clone)]
#[diesel(table_name = certificate_status)]
pub struct CertificateStatus {
    pub id: i64,
    pub serial: String,
    pub status: CertStatus,
    pub revoked_date: Option<NaiveDateTime>,
    pub revoked_reason: i16,
    pub not_after: NaiveDateTime,
    pub is_expired: bool,
    pub issuer_id: i64,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = certificate_status)]
pub struct NewCertificateStatus {
    pub serial: String,
    pub status: CertStatus,
    pub revoked_date: Option<NaiveDateTime>,
    pub revoked_reason: i16,
    pub not_after: NaiveDateTime,
    pub is_expired: bool,
    pub issuer_id: i64,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = issued_names)]
pub struct NewIssuedName {
    pub reversed_name: String,
    pub serial: String,
    pub not_before: NaiveDateTime,
    pub renewal: bool,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = fqdn_sets)]
pub struct NewFqdnSet {
    pub set_hash: Vec<u8>,
    pub serial: String,
    pub issued: NaiveDateTime,
    pub expires: NaiveDateTime,
}

#[derive(Queryable, Identifiable, Debug, Clone)]
#[diesel(table_name = order_fqdn_sets)]
pub struct OrderFqdnSet {
    pub id: i64,
    pub set_hash: Vec<u8>,
    pub order_id: i64,
    pub expires: NaiveDateTime,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = order_fqdn_sets)]
pub struct NewOrderFqdnSet {
    pub set_hash: Vec<u8>,
    pub order_id: i64,
    pub expires: NaiveDateTime,
}

#[derive(Queryable, Identifiable, Debug, Clone)]
#[diesel(table_name = replacement_orders)]
pub struct ReplacementOrder {
    pub id: i64,
    pub serial: String,
    pub order_id: i64,
    pub order_expires: NaiveDateTime,
    pub replaced: bool,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = replacement_orders)]
pub struct NewReplacementOrder {
    pub serial: String,
    pub order_id: i64,
    pub order_expires: NaiveDateTime,
    pub replaced: bool,
}

#[derive(Queryable, Identifiable, Debug, Clone)]
#[diesel(table_name = rate_limit_overrides)]
pub struct RateLimitOverride {
    pub id: i64,
    pub limit_enum: i64,
    pub bucket_key: String,
    pub count: i64,
    pub burst: i64,
    pub period_ns: i64,
    pub comment: String,
    pub enabled: bool,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = rate_limit_overrides)]
pub struct NewRateLimitOverride {
    pub limit_enum: i64,
    pub bucket_key: String,
    pub count: i64,
    pub burst: i64,
    pub period_ns: i64,
    pub comment: String,
    pub enabled: bool,
    pub updated_at: NaiveDateTime,
}

impl RateLimitOverride {
    pub fn to_limit(&self) -> errors::Result<crate::ratelimit::limit::Limit> {
        let name = crate::ratelimit::Name::from_enum_value(self.limit_enum).ok_or_else(|| {
            Error::internal(format!("override {} has unknown limit enum {}", self.id, self.limit_enum))
        })?;
        let mut limit = crate::ratelimit::limit::Limit::new(
            name,
            &crate::ratelimit::limit::LimitConfig {
                burst: self.burst,
                count: self.count,
                period: std::time::Duration::from_nanos(
                    self.period_ns.try_into().map_err(|_| {
                        Error::internal(format!("override {} has negative period", self.id))
                    })?,
                ),
                fail_open: true,
            },
        )?;
        limit.comment = self.comment.clone();
        limit.is_override = true;
        Ok(limit)
    }
}

#[derive(Queryable, Identifiable, Debug, Clone)]
#[diesel(table_name = revoked_certificates)]
pub struct RevokedCertificate {
    pub id: i64,
    pub serial: String,
    pub issuer_id: i64,
    pub shard_idx: i64,
    pub revoked_date: NaiveDateTime,
    pub revoked_reason: i16,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = revoked_certificates)]
pub struct NewRevokedCertificate {
    pub serial: String,
    pub issuer_id: i64,
    pub shard_idx: i64,
    pub revoked_date: NaiveDateTime,
    pub revoked_reason: i16,
}

#[derive(Queryable, Identifiable, Debug, Clone)]
#[diesel(table_name = crl_shards)]
pub struct CrlShard {
    pub id: i64,
    pub issuer_id: i64,
    pub idx: i64,
    pub this_update: Option<NaiveDateTime>,
    pub next_update: Option<NaiveDateTime>,
    pub leased_until: NaiveDateTime,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = blocked_keys)]
pub struct NewBlockedKey {
    pub key_hash: Vec<u8>,
    pub added: NaiveDateTime,
    pub source: String,
    pub comment: Option<String>,
}

#[derive(Queryable, Identifiable, Debug, Clone)]
#[diesel(table_name = paused)]
pub struct PausedIdentifier {
    pub id: i64,
    pub registration_id: i64,
    pub identifier_type: IdentifierType,
    pub identifier: String,
    pub paused_at: NaiveDateTime,
    pub unpaused_at: Option<NaiveDateTime>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = paused)]
pub struct NewPausedIdentifier {
    pub registration_id: i64,
    pub identifier_type: IdentifierType,
    pub identifier: String,
    pub paused_at: NaiveDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(error: bool, expired: bool, began_processing: bool, serial: Option<&str>) -> Order {
        let now = Utc::now().naive_utc();
        Order {
            id: 1,
            registration_id: 1,
            created_at: now,
            expires: if expired { now - chrono::Duration::hours(1) } else { now + chrono::Duration::hours(1) },
            profile: "legacy".to_string(),
            replaces_serial: None,
            began_processing,
            certificate_serial: serial.map(String::from),
            error: if error { Some(serde_json::json!({"kind": "Internal"})) } else { None },
        }
    }

    fn authz(status: AuthorizationStatus, expired: bool) -> AuthzValidity {
        let now = Utc::now().naive_utc();
        AuthzValidity {
            status,
            expires: if expired { now - chrono::Duration::hours(1) } else { now + chrono::Duration::hours(1) },
        }
    }

    #[test]
    fn order_status_precedence() {
        use crate::cert_ra::OrderStatus;
        let now = Utc::now();
        let valid_authzs = [authz(AuthorizationStatus::Valid, false)];

        // 1. A terminal error wins over everything.
        assert_eq!(order_status(&order(true, false, true, Some("ab")), &valid_authzs, now).unwrap(), OrderStatus::Invalid);
        // 2. Expiry.
        assert_eq!(order_status(&order(false, true, false, None), &valid_authzs, now).unwrap(), OrderStatus::Invalid);
        // 3. A failed authorization.
        for status in [AuthorizationStatus::Invalid, AuthorizationStatus::Deactivated, AuthorizationStatus::Revoked] {
            let authzs = [authz(AuthorizationStatus::Valid, false), authz(status, false)];
            assert_eq!(order_status(&order(false, false, false, None), &authzs, now).unwrap(), OrderStatus::Invalid);
        }
        // 3b. An expired authorization.
        let authzs = [authz(AuthorizationStatus::Valid, true)];
        assert_eq!(order_status(&order(false, false, false, None), &authzs, now).unwrap(), OrderStatus::Invalid);
        // 4. A pending authorization.
        let authzs = [authz(AuthorizationStatus::Valid, false), authz(AuthorizationStatus::Pending, false)];
        assert_eq!(order_status(&order(false, false, false, None), &authzs, now).unwrap(), OrderStatus::Pending);
        // 5-7. All valid: serial, then processing, then ready.
        assert_eq!(order_status(&order(false, false, true, Some("ab")), &valid_authzs, now).unwrap(), OrderStatus::Valid);
        assert_eq!(order_status(&order(false, false, true, None), &valid_authzs, now).unwrap(), OrderStatus::Processing);
        assert_eq!(order_status(&order(false, false, false, None), &valid_authzs, now).unwrap(), OrderStatus::Ready);
    }

    #[test]
    fn order_status_is_pure() {
        let now = Utc::now();
        let o = order(false, false, false, None);
        let authzs = [authz(AuthorizationStatus::Valid, false)];
        assert_eq!(
            order_status(&o, &authzs, now).unwrap(),
            order_status(&o, &authzs, now).unwrap()
        );
    }

    #[test]
    fn order_status_never_retrogrades_under_monotonic_inputs() {
        use crate::cert_ra::OrderStatus;
        let now = Utc::now();
        let authzs = [authz(AuthorizationStatus::Valid, false)];

        // ready -> processing -> valid as began_processing and the serial
        // are set, in that order.
        let ready = order_status(&order(false, false, false, None), &authzs, now).unwrap();
        let processing = order_status(&order(false, false, true, None), &authzs, now).unwrap();
        let valid = order_status(&order(false, false, true, Some("ab")), &authzs, now).unwrap();
        assert_eq!(
            (ready, processing, valid),
            (OrderStatus::Ready, OrderStatus::Processing, OrderStatus::Valid)
        );
    }

    #[test]
    fn order_with_no_authorizations_is_an_internal_error() {
        assert!(order_status(&order(false, false, false, None), &[], Utc::now()).is_err());
    }

    #[test]
    fn authorization_status_shadowed_by_expiry() {
        use crate::cert_ra::AuthorizationStatus as Pb;
        let now = Utc::now();
        let mut authz = Authorization {
            id: 1,
            registration_id: 1,
            identifier_type: IdentifierType::Dns,
            identifier: "example.com".to_string(),
            status: AuthorizationStatus::Valid,
            expires: now.naive_utc() + chrono::Duration::hours(1),
            profile: "legacy".to_string(),
            challenges: challenges_to_bitmap(&[ChallengeType::Http01, ChallengeType::Dns01]),
            token: new_token(),
            attempted: None,
            attempted_at: None,
            validation_records: None,
            validation_error: None,
        };
        assert_eq!(authz.computed_status(now), Pb::Valid);

        authz.expires = now.naive_utc() - chrono::Duration::hours(1);
        assert_eq!(authz.computed_status(now), Pb::Expired);

        // Deactivation is not shadowed.
        authz.status = AuthorizationStatus::Deactivated;
        assert_eq!(authz.computed_status(now), Pb::Deactivated);
    }

    #[test]
    fn attempted_challenge_hides_the_others() {
        let now = Utc::now();
        let mut authz = Authorization {
            id: 1,
            registration_id: 1,
            identifier_type: IdentifierType::Dns,
            identifier: "example.com".to_string(),
            status: AuthorizationStatus::Pending,
            expires: now.naive_utc() + chrono::Duration::hours(1),
            profile: "legacy".to_string(),
            challenges: challenges_to_bitmap(&[
                ChallengeType::Http01,
                ChallengeType::Dns01,
                ChallengeType::TlsAlpn01,
            ]),
            token: new_token(),
            attempted: None,
            attempted_at: None,
            validation_records: None,
            validation_error: None,
        };
        assert_eq!(authz.to_pb(now).challenges.len(), 3);

        authz.status = AuthorizationStatus::Valid;
        authz.attempted = Some(ChallengeType::Dns01);
        authz.attempted_at = Some(now.naive_utc());
        let pb = authz.to_pb(now);
        assert_eq!(pb.challenges.len(), 1);
        assert_eq!(pb.challenges[0].r#type, crate::cert_ra::ChallengeType::Dns01 as i32);
        assert!(pb.challenges[0].validated.is_some());
    }

    #[test]
    fn token_shape() {
        let token = new_token();
        assert_eq!(token.len(), 43);
        assert!(!token.contains('='));
        assert_ne!(new_token(), token);
    }

    #[test]
    fn challenge_bitmap_round_trip() {
        let all = vec![ChallengeType::Http01, ChallengeType::Dns01, ChallengeType::TlsAlpn01];
        assert_eq!(bitmap_to_challenges(challenges_to_bitmap(&all)), all);
        assert_eq!(bitmap_to_challenges(challenges_to_bitmap(&[ChallengeType::Dns01])), vec![ChallengeType::Dns01]);
        assert_eq!(bitmap_to_challenges(0), vec![]);
    }
}
