use serde::Deserialize;

use crate::firestore::error::{
    aborted, already_exists, cancelled, data_loss, deadline_exceeded, failed_precondition,
    internal_error, invalid_argument, not_found, permission_denied, resource_exhausted,
    unauthenticated, unavailable, FirestoreError, FirestoreErrorCode,
};

/// `google.rpc.Status` as carried in target change causes.
#[derive(Debug, Deserialize)]
pub(crate) struct StatusCause {
    pub code: i32,
    #[serde(default)]
    pub message: Option<String>,
}

impl StatusCause {
    pub(crate) fn into_error(self) -> FirestoreError {
        map_grpc_status(self.code, self.message)
    }
}

/// Maps a canonical gRPC status code to an error.
pub fn map_grpc_status(code: i32, message: Option<String>) -> FirestoreError {
    let message = message.unwrap_or_else(|| format!("Stream failed with status {code}"));
    match code {
        1 => cancelled(message),
        2 => FirestoreError::new(FirestoreErrorCode::Unknown, message),
        3 => invalid_argument(message),
        4 => deadline_exceeded(message),
        5 => not_found(message),
        6 => already_exists(message),
        7 => permission_denied(message),
        8 => resource_exhausted(message),
        9 => failed_precondition(message),
        10 => aborted(message),
        11 => FirestoreError::new(FirestoreErrorCode::OutOfRange, message),
        12 => FirestoreError::new(FirestoreErrorCode::Unimplemented, message),
        13 => internal_error(message),
        14 => unavailable(message),
        15 => data_loss(message),
        16 => unauthenticated(message),
        _ => FirestoreError::new(FirestoreErrorCode::Unknown, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_canonical_codes() {
        assert_eq!(map_grpc_status(16, None).code, FirestoreErrorCode::Unauthenticated);
        assert_eq!(map_grpc_status(9, None).code, FirestoreErrorCode::FailedPrecondition);
        assert_eq!(map_grpc_status(42, None).code, FirestoreErrorCode::Unknown);
        let err = map_grpc_status(7, Some("denied".into()));
        assert_eq!(err.message(), "denied");
    }
}
