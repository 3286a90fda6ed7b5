//! The storage authority: every primitive the RA consumes, each one atomic.

use diesel::prelude::*;
use chrono::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};

use crate::errors::{self, Error};
use crate::identifier::AcmeIdentifier;
use crate::models;
use crate::schema;

#[derive(Clone)]
pub struct Storage {
    pub db: crate::DBPool,
}

fn db_err(e: impl std::fmt::Display) -> Error {
    warn!("failed to execute DB query: {}", e);
    Error::internal("storage query failed")
}

impl Storage {
    pub fn new(db: crate::DBPool) -> Storage {
        Storage { db }
    }

    async fn conn(&self) -> errors::Result<crate::DBConn> {
        self.db.get().await.map_err(|e| {
            warn!("failed to get DB connection: {}", e);
            Error::internal("no storage connection available")
        })
    }

    pub async fn get_registration(&self, id: i64) -> errors::Result<models::Registration> {
        let mut conn = self.conn().await?;
        schema::registrations::table
            .find(id)
            .get_result(&mut conn).await
            .optional().map_err(db_err)?
            .ok_or_else(|| Error::not_found("registration does not exist"))
    }

    pub async fn get_registration_by_key_hash(
        &self,
        jwk_sha256: &[u8],
    ) -> errors::Result<Option<models::Registration>> {
        let mut conn = self.conn().await?;
        schema::registrations::table
            .filter(schema::registrations::dsl::jwk_sha256.eq(jwk_sha256))
            .get_result(&mut conn).await
            .optional().map_err(db_err)
    }

    pub async fn new_registration(
        &self,
        new: models::NewRegistration,
    ) -> errors::Result<models::Registration> {
        let mut conn = self.conn().await?;
        diesel::insert_into(schema::registrations::table)
            .values(&new)
            .get_result(&mut conn).await
            .map_err(|e| match e {
                diesel::result::Error::DatabaseError(
                    diesel::result::DatabaseErrorKind::UniqueViolation, _,
                ) => Error::duplicate("account key is already in use for a different account"),
                e => db_err(e),
            })
    }

    pub async fn update_registration(
        &self,
        id: i64,
        contact: Vec<String>,
        agreement: Option<String>,
    ) -> errors::Result<models::Registration> {
        let mut conn = self.conn().await?;
        diesel::update(schema::registrations::table.find(id))
            .set((
                schema::registrations::dsl::contact.eq(contact),
                schema::registrations::dsl::agreement.eq(agreement),
            ))
            .get_result(&mut conn).await
            .optional().map_err(db_err)?
            .ok_or_else(|| Error::not_found("registration does not exist"))
    }

    pub async fn deactivate_registration(&self, id: i64) -> errors::Result<models::Registration> {
        let mut conn = self.conn().await?;
        diesel::update(
            schema::registrations::table
                .find(id)
                .filter(schema::registrations::dsl::status.eq(models::RegistrationStatus::Valid)),
        )
        .set(schema::registrations::dsl::status.eq(models::RegistrationStatus::Deactivated))
        .get_result(&mut conn).await
        .optional().map_err(db_err)?
        .ok_or_else(|| Error::conflict("registration is not in a valid state"))
    }

    /// Creates the order, its identifiers, its fresh pending authorizations,
    /// the order/authorization mapping (reused authorizations included), the
    /// order FQDN set pin, and the optional replacement link, atomically.
    pub async fn new_order_and_authzs(
        &self,
        new_order: models::NewOrder,
        idents: Vec<AcmeIdentifier>,
        new_authzs: Vec<models::NewAuthorization>,
        reused_authz_ids: Vec<i64>,
        set_hash: Vec<u8>,
    ) -> errors::Result<(models::Order, Vec<i64>)> {
        let mut conn = self.conn().await?;
        conn.transaction(|mut conn| Box::pin(async move {
            let order: models::Order = diesel::insert_into(schema::orders::table)
                .values(&new_order)
                .get_result(&mut conn).await?;

            let order_idents = idents.iter().map(|i| models::NewOrderIdentifier {
                order_id: order.id,
                identifier_type: i.identifier_type,
                identifier: i.value.clone(),
            }).collect::<Vec<_>>();
            diesel::insert_into(schema::order_identifiers::table)
                .values(&order_idents)
                .execute(&mut conn).await?;

            let mut authz_ids = reused_authz_ids;
            if !new_authzs.is_empty() {
                let created: Vec<models::Authorization> =
                    diesel::insert_into(schema::authorizations::table)
                        .values(&new_authzs)
                        .get_results(&mut conn).await?;
                authz_ids.extend(created.iter().map(|a| a.id));
            }

            let mappings = authz_ids.iter().map(|authz_id| models::NewOrderToAuthz {
                order_id: order.id,
                authz_id: *authz_id,
            }).collect::<Vec<_>>();
            diesel::insert_into(schema::order_to_authzs::table)
                .values(&mappings)
                .execute(&mut conn).await?;

            diesel::insert_into(schema::order_fqdn_sets::table)
                .values(&models::NewOrderFqdnSet {
                    set_hash,
                    order_id: order.id,
                    expires: order.expires,
                })
                .execute(&mut conn).await?;

            if let Some(serial) = &order.replaces_serial {
                diesel::insert_into(schema::replacement_orders::table)
                    .values(&models::NewReplacementOrder {
                        serial: serial.clone(),
                        order_id: order.id,
                        order_expires: order.expires,
                        replaced: false,
                    })
                    .execute(&mut conn).await?;
            }

            Ok::<_, diesel::result::Error>((order, authz_ids))
        })).await.map_err(db_err)
    }

    pub async fn get_order(
        &self,
        id: i64,
    ) -> errors::Result<(models::Order, Vec<models::OrderIdentifier>, Vec<i64>)> {
        let mut conn = self.conn().await?;
        let order: models::Order = schema::orders::table
            .find(id)
            .get_result(&mut conn).await
            .optional().map_err(db_err)?
            .ok_or_else(|| Error::not_found("order does not exist"))?;

        let identifiers: Vec<models::OrderIdentifier> = schema::order_identifiers::table
            .filter(schema::order_identifiers::dsl::order_id.eq(order.id))
            .get_results(&mut conn).await.map_err(db_err)?;

        let authz_ids: Vec<i64> = schema::order_to_authzs::table
            .filter(schema::order_to_authzs::dsl::order_id.eq(order.id))
            .select(schema::order_to_authzs::dsl::authz_id)
            .get_results(&mut conn).await.map_err(db_err)?;

        if authz_ids.len() != identifiers.len() {
            return Err(Error::internal(format!(
                "order {} has {} authorizations for {} identifiers",
                order.id, authz_ids.len(), identifiers.len()
            )));
        }

        Ok((order, identifiers, authz_ids))
    }

    pub async fn get_authz_validity(
        &self,
        authz_ids: &[i64],
    ) -> errors::Result<Vec<models::AuthzValidity>> {
        let mut conn = self.conn().await?;
        let got: Vec<models::AuthzValidity> = schema::authorizations::table
            .filter(schema::authorizations::dsl::id.eq_any(authz_ids))
            .select((
                schema::authorizations::dsl::status,
                schema::authorizations::dsl::expires,
            ))
            .get_results(&mut conn).await.map_err(db_err)?;
        if got.len() != authz_ids.len() {
            return Err(Error::internal(format!(
                "found {} authorizations, expected {}", got.len(), authz_ids.len()
            )));
        }
        Ok(got)
    }

    /// The linearization point for finalization: flips `began_processing`
    /// only if it was still false. Exactly one concurrent finalize wins; the
    /// rest see `OrderNotReady`.
    pub async fn set_order_processing(&self, id: i64) -> errors::Result<()> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            schema::orders::table
                .find(id)
                .filter(schema::orders::dsl::began_processing.eq(false)),
        )
        .set(schema::orders::dsl::began_processing.eq(true))
        .execute(&mut conn).await.map_err(db_err)?;

        if updated != 1 {
            return Err(Error::order_not_ready("order is already being finalized"));
        }
        Ok(())
    }

    pub async fn set_order_error(
        &self,
        id: i64,
        error: &errors::Error,
    ) -> errors::Result<()> {
        let mut conn = self.conn().await?;
        let encoded = serde_json::to_value(error)
            .map_err(|e| Error::internal(format!("failed to encode order error: {}", e)))?;
        diesel::update(schema::orders::table.find(id))
            .set(schema::orders::dsl::error.eq(encoded))
            .execute(&mut conn).await.map_err(db_err)?;
        Ok(())
    }

    /// Records the issued serial on the order, unpins its FQDN set, and marks
    /// the replaced certificate's link, atomically.
    pub async fn finalize_order(&self, id: i64, serial: String) -> errors::Result<()> {
        let mut conn = self.conn().await?;
        conn.transaction(|mut conn| Box::pin(async move {
            diesel::update(schema::orders::table.find(id))
                .set(schema::orders::dsl::certificate_serial.eq(serial))
                .execute(&mut conn).await?;
            diesel::delete(
                schema::order_fqdn_sets::table
                    .filter(schema::order_fqdn_sets::dsl::order_id.eq(id)),
            )
            .execute(&mut conn).await?;
            diesel::update(
                schema::replacement_orders::table
                    .filter(schema::replacement_orders::dsl::order_id.eq(id)),
            )
            .set(schema::replacement_orders::dsl::replaced.eq(true))
            .execute(&mut conn).await?;
            Ok::<_, diesel::result::Error>(())
        })).await.map_err(db_err)
    }

    pub async fn get_authorization(&self, id: i64) -> errors::Result<models::Authorization> {
        let mut conn = self.conn().await?;
        schema::authorizations::table
            .find(id)
            .get_result(&mut conn).await
            .optional().map_err(db_err)?
            .ok_or_else(|| Error::not_found("authorization does not exist"))
    }

    /// Finds an authorization for `(regID, identifier)` usable by a new
    /// order: valid, or still pending when pending reuse is allowed. The
    /// longest-lived candidate wins.
    pub async fn get_reusable_authorization(
        &self,
        registration_id: i64,
        ident: &AcmeIdentifier,
        profile: &str,
        include_pending: bool,
        now: DateTime<Utc>,
    ) -> errors::Result<Option<models::Authorization>> {
        let mut conn = self.conn().await?;
        let statuses = if include_pending {
            vec![models::AuthorizationStatus::Valid, models::AuthorizationStatus::Pending]
        } else {
            vec![models::AuthorizationStatus::Valid]
        };
        schema::authorizations::table
            .filter(schema::authorizations::dsl::registration_id.eq(registration_id))
            .filter(schema::authorizations::dsl::identifier_type.eq(ident.identifier_type))
            .filter(schema::authorizations::dsl::identifier.eq(&ident.value))
            .filter(schema::authorizations::dsl::profile.eq(profile))
            .filter(schema::authorizations::dsl::status.eq_any(statuses))
            .filter(schema::authorizations::dsl::expires.gt(now.naive_utc()))
            .order(schema::authorizations::dsl::expires.desc())
            .first(&mut conn).await
            .optional().map_err(db_err)
    }

    /// Settles a pending authorization to valid or invalid, recording the
    /// attempted challenge, its time, and the validation evidence in the same
    /// write. At most one attempt ever succeeds in doing this.
    pub async fn finalize_authorization(
        &self,
        id: i64,
        status: models::AuthorizationStatus,
        attempted: crate::identifier::ChallengeType,
        attempted_at: DateTime<Utc>,
        records: Option<serde_json::Value>,
        error: Option<serde_json::Value>,
    ) -> errors::Result<()> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            schema::authorizations::table
                .find(id)
                .filter(schema::authorizations::dsl::status.eq(models::AuthorizationStatus::Pending)),
        )
        .set((
            schema::authorizations::dsl::status.eq(status),
            schema::authorizations::dsl::attempted.eq(Some(attempted)),
            schema::authorizations::dsl::attempted_at.eq(Some(attempted_at.naive_utc())),
            schema::authorizations::dsl::validation_records.eq(records),
            schema::authorizations::dsl::validation_error.eq(error),
        ))
        .execute(&mut conn).await.map_err(db_err)?;

        if updated != 1 {
            return Err(Error::conflict("authorization is not pending"));
        }
        Ok(())
    }

    /// Revokes every pending or valid authorization the account holds for
    /// the identifiers. Only administrative revocation flows reach this.
    pub async fn revoke_authorizations(
        &self,
        registration_id: i64,
        idents: &[AcmeIdentifier],
    ) -> errors::Result<usize> {
        let mut conn = self.conn().await?;
        let mut revoked = 0;
        for ident in idents {
            revoked += diesel::update(
                schema::authorizations::table
                    .filter(schema::authorizations::dsl::registration_id.eq(registration_id))
                    .filter(schema::authorizations::dsl::identifier_type.eq(ident.identifier_type))
                    .filter(schema::authorizations::dsl::identifier.eq(&ident.value))
                    .filter(schema::authorizations::dsl::status.eq_any(vec![
                        models::AuthorizationStatus::Pending,
                        models::AuthorizationStatus::Valid,
                    ])),
            )
            .set(schema::authorizations::dsl::status.eq(models::AuthorizationStatus::Revoked))
            .execute(&mut conn).await.map_err(db_err)?;
        }
        Ok(revoked)
    }

    pub async fn deactivate_authorization(&self, id: i64) -> errors::Result<models::Authorization> {
        let mut conn = self.conn().await?;
        diesel::update(
            schema::authorizations::table
                .find(id)
                .filter(schema::authorizations::dsl::status.eq_any(vec![
                    models::AuthorizationStatus::Pending,
                    models::AuthorizationStatus::Valid,
                ])),
        )
        .set(schema::authorizations::dsl::status.eq(models::AuthorizationStatus::Deactivated))
        .get_result(&mut conn).await
        .optional().map_err(db_err)?
        .ok_or_else(|| Error::conflict("authorization is not pending or valid"))
    }

    /// Records a pre-certificate: its row, the serial reservation, and one
    /// issued-name row per identifier, atomically.
    pub async fn add_precertificate(
        &self,
        precert: models::NewPrecertificate,
        serial: models::NewSerial,
        issued_names: Vec<models::NewIssuedName>,
    ) -> errors::Result<()> {
        let mut conn = self.conn().await?;
        conn.transaction(|mut conn| Box::pin(async move {
            diesel::insert_into(schema::serials::table)
                .values(&serial)
                .execute(&mut conn).await?;
            diesel::insert_into(schema::precertificates::table)
                .values(&precert)
                .execute(&mut conn).await?;
            diesel::insert_into(schema::issued_names::table)
                .values(&issued_names)
                .execute(&mut conn).await?;
            Ok::<_, diesel::result::Error>(())
        })).await.map_err(db_err)
    }

    /// Records a final certificate with its status row and FQDN set row,
    /// atomically. A certificate row implies a status row.
    pub async fn add_certificate(
        &self,
        cert: models::NewCertificate,
        status: models::NewCertificateStatus,
        fqdn_set: models::NewFqdnSet,
    ) -> errors::Result<()> {
        let mut conn = self.conn().await?;
        conn.transaction(|mut conn| Box::pin(async move {
            diesel::insert_into(schema::certificates::table)
                .values(&cert)
                .execute(&mut conn).await?;
            diesel::insert_into(schema::certificate_status::table)
                .values(&status)
                .execute(&mut conn).await?;
            diesel::insert_into(schema::fqdn_sets::table)
                .values(&fqdn_set)
                .execute(&mut conn).await?;
            Ok::<_, diesel::result::Error>(())
        })).await.map_err(db_err)
    }

    /// Single-shot variant for unsplit issuance: the serial reservation, the
    /// issued names, the certificate and its status row, and the FQDN set,
    /// all in one transaction.
    pub async fn add_certificate_and_serial(
        &self,
        cert: models::NewCertificate,
        status: models::NewCertificateStatus,
        fqdn_set: models::NewFqdnSet,
        serial: models::NewSerial,
        issued_names: Vec<models::NewIssuedName>,
    ) -> errors::Result<()> {
        let mut conn = self.conn().await?;
        conn.transaction(|mut conn| Box::pin(async move {
            diesel::insert_into(schema::serials::table)
                .values(&serial)
                .execute(&mut conn).await?;
            diesel::insert_into(schema::issued_names::table)
                .values(&issued_names)
                .execute(&mut conn).await?;
            diesel::insert_into(schema::certificates::table)
                .values(&cert)
                .execute(&mut conn).await?;
            diesel::insert_into(schema::certificate_status::table)
                .values(&status)
                .execute(&mut conn).await?;
            diesel::insert_into(schema::fqdn_sets::table)
                .values(&fqdn_set)
                .execute(&mut conn).await?;
            Ok::<_, diesel::result::Error>(())
        })).await.map_err(db_err)
    }

    pub async fn get_certificate(&self, serial: &str) -> errors::Result<models::Certificate> {
        let mut conn = self.conn().await?;
        schema::certificates::table
            .filter(schema::certificates::dsl::serial.eq(serial))
            .get_result(&mut conn).await
            .optional().map_err(db_err)?
            .ok_or_else(Error::unknown_serial)
    }

    pub async fn get_certificate_status(
        &self,
        serial: &str,
    ) -> errors::Result<models::CertificateStatus> {
        let mut conn = self.conn().await?;
        schema::certificate_status::table
            .filter(schema::certificate_status::dsl::serial.eq(serial))
            .get_result(&mut conn).await
            .optional().map_err(db_err)?
            .ok_or_else(Error::unknown_serial)
    }

    /// Flips a certificate from good to revoked and files it into its CRL
    /// shard, atomically. Flipping an already-revoked certificate reports
    /// `AlreadyRevoked`.
    pub async fn revoke_certificate(
        &self,
        serial: String,
        reason: i16,
        revoked_date: DateTime<Utc>,
        shard_idx: i64,
        issuer_id: i64,
    ) -> errors::Result<()> {
        let mut conn = self.conn().await?;
        conn.transaction(|mut conn| Box::pin(async move {
            let updated = diesel::update(
                schema::certificate_status::table
                    .filter(schema::certificate_status::dsl::serial.eq(&serial))
                    .filter(schema::certificate_status::dsl::status.eq(models::CertStatus::Good)),
            )
            .set((
                schema::certificate_status::dsl::status.eq(models::CertStatus::Revoked),
                schema::certificate_status::dsl::revoked_date.eq(Some(revoked_date.naive_utc())),
                schema::certificate_status::dsl::revoked_reason.eq(reason),
            ))
            .execute(&mut conn).await?;
            if updated != 1 {
                return Ok(false);
            }
            diesel::insert_into(schema::revoked_certificates::table)
                .values(&models::NewRevokedCertificate {
                    serial: serial.clone(),
                    issuer_id,
                    shard_idx,
                    revoked_date: revoked_date.naive_utc(),
                    revoked_reason: reason,
                })
                .execute(&mut conn).await?;
            Ok::<_, diesel::result::Error>(true)
        })).await.map_err(db_err)?
            .then_some(())
            .ok_or_else(|| Error::already_revoked("certificate is already revoked"))
    }

    /// Escalates an existing revocation to keyCompromise, rewriting the
    /// status and shard rows.
    pub async fn update_revoked_certificate(
        &self,
        serial: String,
        reason: i16,
        revoked_date: DateTime<Utc>,
    ) -> errors::Result<()> {
        let mut conn = self.conn().await?;
        conn.transaction(|mut conn| Box::pin(async move {
            diesel::update(
                schema::certificate_status::table
                    .filter(schema::certificate_status::dsl::serial.eq(&serial))
                    .filter(schema::certificate_status::dsl::status.eq(models::CertStatus::Revoked)),
            )
            .set(schema::certificate_status::dsl::revoked_reason.eq(reason))
            .execute(&mut conn).await?;
            diesel::update(
                schema::revoked_certificates::table
                    .filter(schema::revoked_certificates::dsl::serial.eq(&serial)),
            )
            .set((
                schema::revoked_certificates::dsl::revoked_reason.eq(reason),
                schema::revoked_certificates::dsl::revoked_date.eq(revoked_date.naive_utc()),
            ))
            .execute(&mut conn).await?;
            Ok::<_, diesel::result::Error>(())
        })).await.map_err(db_err)
    }

    pub async fn add_blocked_key(&self, new: models::NewBlockedKey) -> errors::Result<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(schema::blocked_keys::table)
            .values(&new)
            .on_conflict(schema::blocked_keys::dsl::key_hash)
            .do_nothing()
            .execute(&mut conn).await.map_err(db_err)?;
        Ok(())
    }

    pub async fn is_key_blocked(&self, key_hash: &[u8]) -> errors::Result<bool> {
        let mut conn = self.conn().await?;
        let count: i64 = schema::blocked_keys::table
            .filter(schema::blocked_keys::dsl::key_hash.eq(key_hash))
            .count()
            .get_result(&mut conn).await.map_err(db_err)?;
        Ok(count > 0)
    }

    /// Issuance count for a registered domain since `since`, via the
    /// reversed-name encoding (suffix queries become prefix queries).
    pub async fn count_certificates_by_name(
        &self,
        registered_domain: &str,
        since: DateTime<Utc>,
    ) -> errors::Result<i64> {
        let mut conn = self.conn().await?;
        let reversed = crate::identifier::encode_issued_name(registered_domain);
        let prefix = format!("{}.%", reversed.replace('%', "\\%").replace('_', "\\_"));
        schema::issued_names::table
            .filter(
                schema::issued_names::dsl::reversed_name.eq(&reversed)
                    .or(schema::issued_names::dsl::reversed_name.like(prefix)),
            )
            .filter(schema::issued_names::dsl::not_before.gt(since.naive_utc()))
            .count()
            .get_result(&mut conn).await.map_err(db_err)
    }

    pub async fn count_fqdn_sets(
        &self,
        set_hash: &[u8],
        since: DateTime<Utc>,
    ) -> errors::Result<i64> {
        let mut conn = self.conn().await?;
        schema::fqdn_sets::table
            .filter(schema::fqdn_sets::dsl::set_hash.eq(set_hash))
            .filter(schema::fqdn_sets::dsl::issued.gt(since.naive_utc()))
            .count()
            .get_result(&mut conn).await.map_err(db_err)
    }

    /// Whether any certificate was ever issued for this exact identifier
    /// set; drives renewal detection for issued-name accounting.
    pub async fn fqdn_set_exists(&self, set_hash: &[u8]) -> errors::Result<bool> {
        let mut conn = self.conn().await?;
        let count: i64 = schema::fqdn_sets::table
            .filter(schema::fqdn_sets::dsl::set_hash.eq(set_hash))
            .count()
            .get_result(&mut conn).await.map_err(db_err)?;
        Ok(count > 0)
    }

    pub async fn count_new_orders_by_account(
        &self,
        registration_id: i64,
        since: DateTime<Utc>,
    ) -> errors::Result<i64> {
        let mut conn = self.conn().await?;
        schema::orders::table
            .filter(schema::orders::dsl::registration_id.eq(registration_id))
            .filter(schema::orders::dsl::created_at.gt(since.naive_utc()))
            .count()
            .get_result(&mut conn).await.map_err(db_err)
    }

    pub async fn count_failed_authorizations(
        &self,
        registration_id: i64,
        ident: &AcmeIdentifier,
        since: DateTime<Utc>,
    ) -> errors::Result<i64> {
        let mut conn = self.conn().await?;
        schema::authorizations::table
            .filter(schema::authorizations::dsl::registration_id.eq(registration_id))
            .filter(schema::authorizations::dsl::identifier_type.eq(ident.identifier_type))
            .filter(schema::authorizations::dsl::identifier.eq(&ident.value))
            .filter(schema::authorizations::dsl::status.eq(models::AuthorizationStatus::Invalid))
            .filter(schema::authorizations::dsl::attempted_at.gt(since.naive_utc()))
            .count()
            .get_result(&mut conn).await.map_err(db_err)
    }

    /// The unfinalized replacement order already registered against a serial,
    /// if one exists. At most one may be live at a time.
    pub async fn get_unreplaced_replacement(
        &self,
        serial: &str,
        now: DateTime<Utc>,
    ) -> errors::Result<Option<models::ReplacementOrder>> {
        let mut conn = self.conn().await?;
        schema::replacement_orders::table
            .filter(schema::replacement_orders::dsl::serial.eq(serial))
            .filter(schema::replacement_orders::dsl::replaced.eq(false))
            .filter(schema::replacement_orders::dsl::order_expires.gt(now.naive_utc()))
            .first(&mut conn).await
            .optional().map_err(db_err)
    }

    pub async fn pause_identifier(
        &self,
        registration_id: i64,
        ident: &AcmeIdentifier,
        now: DateTime<Utc>,
    ) -> errors::Result<()> {
        if self.is_paused(registration_id, ident).await? {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        diesel::insert_into(schema::paused::table)
            .values(&models::NewPausedIdentifier {
                registration_id,
                identifier_type: ident.identifier_type,
                identifier: ident.value.clone(),
                paused_at: now.naive_utc(),
            })
            .execute(&mut conn).await.map_err(db_err)?;
        Ok(())
    }

    pub async fn is_paused(
        &self,
        registration_id: i64,
        ident: &AcmeIdentifier,
    ) -> errors::Result<bool> {
        let mut conn = self.conn().await?;
        let count: i64 = schema::paused::table
            .filter(schema::paused::dsl::registration_id.eq(registration_id))
            .filter(schema::paused::dsl::identifier_type.eq(ident.identifier_type))
            .filter(schema::paused::dsl::identifier.eq(&ident.value))
            .filter(schema::paused::dsl::unpaused_at.is_null())
            .count()
            .get_result(&mut conn).await.map_err(db_err)?;
        Ok(count > 0)
    }

    /// Lifts every active pause for an account. Returns how many were lifted.
    pub async fn unpause_account(
        &self,
        registration_id: i64,
        now: DateTime<Utc>,
    ) -> errors::Result<usize> {
        let mut conn = self.conn().await?;
        diesel::update(
            schema::paused::table
                .filter(schema::paused::dsl::registration_id.eq(registration_id))
                .filter(schema::paused::dsl::unpaused_at.is_null()),
        )
        .set(schema::paused::dsl::unpaused_at.eq(Some(now.naive_utc())))
        .execute(&mut conn).await.map_err(db_err)
    }

    pub async fn get_enabled_rate_limit_overrides(
        &self,
    ) -> errors::Result<Vec<models::RateLimitOverride>> {
        let mut conn = self.conn().await?;
        schema::rate_limit_overrides::table
            .filter(schema::rate_limit_overrides::dsl::enabled.eq(true))
            .get_results(&mut conn).await.map_err(db_err)
    }

    pub async fn upsert_rate_limit_override(
        &self,
        new: models::NewRateLimitOverride,
    ) -> errors::Result<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(schema::rate_limit_overrides::table)
            .values(&new)
            .on_conflict((
                schema::rate_limit_overrides::dsl::limit_enum,
                schema::rate_limit_overrides::dsl::bucket_key,
            ))
            .do_update()
            .set((
                schema::rate_limit_overrides::dsl::count.eq(new.count),
                schema::rate_limit_overrides::dsl::burst.eq(new.burst),
                schema::rate_limit_overrides::dsl::period_ns.eq(new.period_ns),
                schema::rate_limit_overrides::dsl::comment.eq(new.comment.clone()),
                schema::rate_limit_overrides::dsl::enabled.eq(new.enabled),
                schema::rate_limit_overrides::dsl::updated_at.eq(new.updated_at),
            ))
            .execute(&mut conn).await.map_err(db_err)?;
        Ok(())
    }

    /// Takes the lease on a CRL shard until `until`, creating the shard row
    /// on first use. An unexpired lease held elsewhere wins.
    pub async fn lease_crl_shard(
        &self,
        issuer_id: i64,
        idx: i64,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> errors::Result<()> {
        let mut conn = self.conn().await?;
        let inserted = diesel::insert_into(schema::crl_shards::table)
            .values((
                schema::crl_shards::dsl::issuer_id.eq(issuer_id),
                schema::crl_shards::dsl::idx.eq(idx),
                schema::crl_shards::dsl::leased_until.eq(until.naive_utc()),
            ))
            .on_conflict((schema::crl_shards::dsl::issuer_id, schema::crl_shards::dsl::idx))
            .do_nothing()
            .execute(&mut conn).await.map_err(db_err)?;
        if inserted == 1 {
            return Ok(());
        }

        let updated = diesel::update(
            schema::crl_shards::table
                .filter(schema::crl_shards::dsl::issuer_id.eq(issuer_id))
                .filter(schema::crl_shards::dsl::idx.eq(idx))
                .filter(schema::crl_shards::dsl::leased_until.lt(now.naive_utc())),
        )
        .set(schema::crl_shards::dsl::leased_until.eq(until.naive_utc()))
        .execute(&mut conn).await.map_err(db_err)?;
        if updated != 1 {
            return Err(Error::conflict("CRL shard lease is held"));
        }
        Ok(())
    }

    pub async fn update_crl_shard(
        &self,
        issuer_id: i64,
        idx: i64,
        this_update: DateTime<Utc>,
        next_update: DateTime<Utc>,
    ) -> errors::Result<()> {
        let mut conn = self.conn().await?;
        diesel::update(
            schema::crl_shards::table
                .filter(schema::crl_shards::dsl::issuer_id.eq(issuer_id))
                .filter(schema::crl_shards::dsl::idx.eq(idx)),
        )
        .set((
            schema::crl_shards::dsl::this_update.eq(Some(this_update.naive_utc())),
            schema::crl_shards::dsl::next_update.eq(Some(next_update.naive_utc())),
        ))
        .execute(&mut conn).await.map_err(db_err)?;
        Ok(())
    }
}
