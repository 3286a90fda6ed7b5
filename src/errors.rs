//! Structured errors that cross the RPC boundary. The WFE turns these into
//! problem documents; collaborators recover the kind exactly from the JSON
//! carried in the gRPC status metadata.

use std::time::Duration;
use crate::identifier::AcmeIdentifier;

/// Metadata key under which the JSON encoded [`Error`] rides on a
/// `tonic::Status`.
pub const ERROR_METADATA_KEY: &str = "cert-ra-error-bin";

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Copy, Clone)]
pub enum ErrorKind {
    Internal,
    Malformed,
    Unauthorized,
    NotFound,
    RateLimit,
    RejectedIdentifier,
    InvalidEmail,
    ConnectionFailure,
    Caa,
    MissingScts,
    Duplicate,
    OrderNotReady,
    Dns,
    BadPublicKey,
    BadCsr,
    AlreadyRevoked,
    BadRevocationReason,
    UnsupportedContact,
    UnknownSerial,
    Conflict,
    InvalidProfile,
    AlreadyReplaced,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_errors: Vec<SubError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
}

/// A sub-error tied to one identifier of a multi-identifier request.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct SubError {
    pub identifier: AcmeIdentifier,
    pub error: Error,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Error {
        Error {
            kind,
            detail: detail.into(),
            sub_errors: vec![],
            retry_after: None,
        }
    }

    pub fn internal(detail: impl Into<String>) -> Error {
        Error::new(ErrorKind::Internal, detail)
    }

    pub fn malformed(detail: impl Into<String>) -> Error {
        Error::new(ErrorKind::Malformed, detail)
    }

    pub fn unauthorized(detail: impl Into<String>) -> Error {
        Error::new(ErrorKind::Unauthorized, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Error {
        Error::new(ErrorKind::NotFound, detail)
    }

    pub fn rejected_identifier(detail: impl Into<String>) -> Error {
        Error::new(ErrorKind::RejectedIdentifier, detail)
    }

    pub fn invalid_email(detail: impl Into<String>) -> Error {
        Error::new(ErrorKind::InvalidEmail, detail)
    }

    pub fn connection_failure(detail: impl Into<String>) -> Error {
        Error::new(ErrorKind::ConnectionFailure, detail)
    }

    pub fn missing_scts(detail: impl Into<String>) -> Error {
        Error::new(ErrorKind::MissingScts, detail)
    }

    pub fn duplicate(detail: impl Into<String>) -> Error {
        Error::new(ErrorKind::Duplicate, detail)
    }

    pub fn order_not_ready(detail: impl Into<String>) -> Error {
        Error::new(ErrorKind::OrderNotReady, detail)
    }

    pub fn bad_public_key(detail: impl Into<String>) -> Error {
        Error::new(ErrorKind::BadPublicKey, detail)
    }

    pub fn bad_csr(detail: impl Into<String>) -> Error {
        Error::new(ErrorKind::BadCsr, detail)
    }

    pub fn already_revoked(detail: impl Into<String>) -> Error {
        Error::new(ErrorKind::AlreadyRevoked, detail)
    }

    pub fn bad_revocation_reason(reason: i64) -> Error {
        Error::new(
            ErrorKind::BadRevocationReason,
            format!("disallowed revocation reason: {}", reason),
        )
    }

    pub fn unsupported_contact(detail: impl Into<String>) -> Error {
        Error::new(ErrorKind::UnsupportedContact, detail)
    }

    pub fn unknown_serial() -> Error {
        Error::new(ErrorKind::UnknownSerial, "unknown serial")
    }

    pub fn conflict(detail: impl Into<String>) -> Error {
        Error::new(ErrorKind::Conflict, detail)
    }

    pub fn invalid_profile(detail: impl Into<String>) -> Error {
        Error::new(ErrorKind::InvalidProfile, detail)
    }

    pub fn already_replaced(detail: impl Into<String>) -> Error {
        Error::new(ErrorKind::AlreadyReplaced, detail)
    }

    pub fn rate_limit(retry_after: Duration, detail: impl Into<String>) -> Error {
        Error {
            kind: ErrorKind::RateLimit,
            detail: detail.into(),
            sub_errors: vec![],
            retry_after: Some(retry_after),
        }
    }

    pub fn with_sub_errors(mut self, sub_errors: Vec<SubError>) -> Error {
        self.sub_errors.extend(sub_errors);
        self
    }

    /// The RPC status category this kind maps to. Each kind maps to exactly
    /// one category; the full error still rides in metadata.
    pub fn grpc_code(&self) -> tonic::Code {
        match self.kind {
            ErrorKind::Internal => tonic::Code::Internal,
            ErrorKind::Malformed => tonic::Code::InvalidArgument,
            ErrorKind::Unauthorized => tonic::Code::PermissionDenied,
            ErrorKind::NotFound => tonic::Code::NotFound,
            ErrorKind::RateLimit => tonic::Code::Unknown,
            ErrorKind::RejectedIdentifier => tonic::Code::InvalidArgument,
            ErrorKind::InvalidEmail => tonic::Code::InvalidArgument,
            ErrorKind::ConnectionFailure => tonic::Code::Unavailable,
            ErrorKind::Caa => tonic::Code::FailedPrecondition,
            ErrorKind::MissingScts => tonic::Code::Internal,
            ErrorKind::Duplicate => tonic::Code::AlreadyExists,
            ErrorKind::OrderNotReady => tonic::Code::FailedPrecondition,
            ErrorKind::Dns => tonic::Code::Unknown,
            ErrorKind::BadPublicKey => tonic::Code::InvalidArgument,
            ErrorKind::BadCsr => tonic::Code::InvalidArgument,
            ErrorKind::AlreadyRevoked => tonic::Code::AlreadyExists,
            ErrorKind::BadRevocationReason => tonic::Code::InvalidArgument,
            ErrorKind::UnsupportedContact => tonic::Code::InvalidArgument,
            ErrorKind::UnknownSerial => tonic::Code::Unknown,
            ErrorKind::Conflict => tonic::Code::Unknown,
            ErrorKind::InvalidProfile => tonic::Code::InvalidArgument,
            ErrorKind::AlreadyReplaced => tonic::Code::AlreadyExists,
        }
    }

    /// Reconstructs a structured error from a collaborator's status. Falls
    /// back to mapping the bare code when no metadata is present:
    /// unavailability and deadline expiry become `ConnectionFailure` so
    /// callers can retry where safe.
    pub fn from_status(status: &tonic::Status) -> Error {
        if let Some(value) = status.metadata().get_bin(ERROR_METADATA_KEY) {
            if let Ok(bytes) = value.to_bytes() {
                if let Ok(err) = serde_json::from_slice::<Error>(&bytes) {
                    return err;
                }
            }
        }
        match status.code() {
            tonic::Code::Unavailable | tonic::Code::DeadlineExceeded => {
                Error::connection_failure(status.message().to_string())
            }
            tonic::Code::NotFound => Error::not_found(status.message().to_string()),
            tonic::Code::InvalidArgument => Error::malformed(status.message().to_string()),
            _ => Error::internal(status.message().to_string()),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.detail)
    }
}

impl std::error::Error for Error {}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> tonic::Status {
        let mut metadata = tonic::metadata::MetadataMap::new();
        // Serializing a plain struct of primitives cannot fail; fall back to
        // a bare status if it somehow does.
        if let Ok(encoded) = serde_json::to_vec(&err) {
            metadata.insert_bin(
                ERROR_METADATA_KEY,
                tonic::metadata::MetadataValue::from_bytes(&encoded),
            );
        }
        tonic::Status::with_metadata(err.grpc_code(), err.detail.clone(), metadata)
    }
}

/// Builds the top level error for a multi-identifier failure. A single
/// sub-error is promoted to the top level; several are summarized under a
/// `RejectedIdentifier` parent carrying each sub-error.
pub fn combine_sub_errors(sub_errors: Vec<SubError>) -> Result<()> {
    match sub_errors.len() {
        0 => Ok(()),
        1 => Err(Error::new(
            sub_errors[0].error.kind,
            format!(
                "Cannot issue for {:?}: {}",
                sub_errors[0].identifier.value, sub_errors[0].error.detail
            ),
        )),
        n => {
            let detail = format!(
                "Cannot issue for {:?}: {} (and {} more problems. Refer to sub-problems for more information.)",
                sub_errors[0].identifier.value,
                sub_errors[0].error.detail,
                n - 1,
            );
            Err(Error::rejected_identifier(detail).with_sub_errors(sub_errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip_preserves_kind_and_retry_after() {
        let err = Error::rate_limit(
            Duration::from_secs(3600),
            "too many certificates already issued",
        );
        let status: tonic::Status = err.clone().into();
        assert_eq!(status.code(), tonic::Code::Unknown);
        let back = Error::from_status(&status);
        assert_eq!(back, err);
    }

    #[test]
    fn status_round_trip_preserves_sub_errors() {
        let err = Error::rejected_identifier("Cannot issue for \"a.example.com\": oh no")
            .with_sub_errors(vec![SubError {
                identifier: crate::identifier::AcmeIdentifier::dns("a.example.com"),
                error: Error::malformed("Domain name contains an invalid character"),
            }]);
        let status: tonic::Status = err.clone().into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert_eq!(Error::from_status(&status), err);
    }

    #[test]
    fn bare_status_maps_by_code() {
        let unavailable = tonic::Status::unavailable("va is down");
        assert_eq!(
            Error::from_status(&unavailable).kind,
            ErrorKind::ConnectionFailure
        );
        let deadline = tonic::Status::deadline_exceeded("too slow");
        assert_eq!(
            Error::from_status(&deadline).kind,
            ErrorKind::ConnectionFailure
        );
        let missing = tonic::Status::not_found("no such order");
        assert_eq!(Error::from_status(&missing).kind, ErrorKind::NotFound);
    }

    #[test]
    fn combine_promotes_single_sub_error() {
        let result = combine_sub_errors(vec![SubError {
            identifier: crate::identifier::AcmeIdentifier::dns("bad.example.com"),
            error: Error::rejected_identifier("forbidden by policy"),
        }]);
        let err = result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RejectedIdentifier);
        assert!(err.sub_errors.is_empty());
    }

    #[test]
    fn combine_nests_multiple_sub_errors() {
        let subs = vec![
            SubError {
                identifier: crate::identifier::AcmeIdentifier::dns("a.invalid"),
                error: Error::malformed("no public suffix"),
            },
            SubError {
                identifier: crate::identifier::AcmeIdentifier::dns("b.invalid"),
                error: Error::malformed("no public suffix"),
            },
        ];
        let err = combine_sub_errors(subs).unwrap_err();
        assert_eq!(err.kind, ErrorKind::RejectedIdentifier);
        assert_eq!(err.sub_errors.len(), 2);
    }
}
