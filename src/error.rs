use crate::listing::ListingStatus;

/// Failures of the persistence layer.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("storage backend failed: {0}")]
    Backend(#[from] sled::Error),
    #[error("failed to encode record: {0}")]
    Encode(#[from] minicbor::encode::Error<std::convert::Infallible>),
    #[error("failed to decode record: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error("failed to generate record id: {0}")]
    Identifier(String),
    #[error("a record with id {0} already exists")]
    Duplicate(String),
}

/// Everything a lifecycle operation can fail with. Each failure is scoped to
/// a single listing and a single attempt.
#[derive(thiserror::Error, Debug)]
pub enum LifecycleError {
    #[error("listing {0} not found")]
    NotFound(String),
    #[error("cannot move listing from {from} to {to}")]
    InvalidTransition { from: ListingStatus, to: ListingStatus },
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("listing {id} is no longer in the expected state: {detail}")]
    Conflict { id: String, detail: String },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("activity record for listing {listing_id} could not be written: {source}")]
    Audit {
        listing_id: String,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl LifecycleError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, LifecycleError::Conflict { .. })
    }
}

impl From<sled::Error> for LifecycleError {
    fn from(value: sled::Error) -> Self {
        LifecycleError::Store(StoreError::Backend(value))
    }
}
