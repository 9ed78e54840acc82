//! Listing persistence: the store seam and its sled implementation
use crate::error::{LifecycleError, StoreError};
use crate::listing::{Listing, ListingStatus};
use crate::time_window::TimeStamp;
use sled::{Db, Tree};
use std::sync::Arc;
use tracing::{debug, warn};

const LISTINGS_TREE: &str = "listings";

/// Equality filters on status and ownership, range filters on best before.
/// Unset fields match everything.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ListingFilter {
    pub statuses: Vec<ListingStatus>,
    pub donor_id: Option<String>,
    pub claimed_by: Option<String>,
    pub volunteer_id: Option<String>,
    /// Matches `best_before > t`.
    pub best_before_after: Option<TimeStamp>,
    /// Matches `best_before <= t`.
    pub best_before_at_or_before: Option<TimeStamp>,
}

impl ListingFilter {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_status(mut self, status: ListingStatus) -> Self {
        self.statuses.push(status);
        self
    }
    pub fn with_statuses(mut self, statuses: &[ListingStatus]) -> Self {
        self.statuses.extend_from_slice(statuses);
        self
    }
    pub fn with_donor(mut self, donor_id: impl Into<String>) -> Self {
        self.donor_id = Some(donor_id.into());
        self
    }
    pub fn with_claimed_by(mut self, ngo_id: impl Into<String>) -> Self {
        self.claimed_by = Some(ngo_id.into());
        self
    }
    pub fn with_volunteer(mut self, volunteer_id: impl Into<String>) -> Self {
        self.volunteer_id = Some(volunteer_id.into());
        self
    }
    pub fn best_before_after(mut self, t: TimeStamp) -> Self {
        self.best_before_after = Some(t);
        self
    }
    pub fn best_before_at_or_before(mut self, t: TimeStamp) -> Self {
        self.best_before_at_or_before = Some(t);
        self
    }

    pub fn matches(&self, listing: &Listing) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&listing.status) {
            return false;
        }
        if let Some(donor_id) = &self.donor_id {
            if &listing.donor_id != donor_id {
                return false;
            }
        }
        if let Some(ngo_id) = &self.claimed_by {
            if listing.claimed_by.as_ref() != Some(ngo_id) {
                return false;
            }
        }
        if let Some(volunteer_id) = &self.volunteer_id {
            if listing.volunteer_id.as_ref() != Some(volunteer_id) {
                return false;
            }
        }
        if let Some(t) = &self.best_before_after {
            if listing.best_before <= *t {
                return false;
            }
        }
        if let Some(t) = &self.best_before_at_or_before {
            if listing.best_before > *t {
                return false;
            }
        }
        true
    }
}

/// A mutation applied under compare-and-set. It sees the freshest stored
/// record and may reject it; it may run more than once.
pub type Patch<'a> = &'a dyn Fn(&mut Listing) -> Result<(), LifecycleError>;

/// Document style listing storage.
pub trait ListingStore: Send + Sync {
    /// Stores a new listing; fails if the id is taken.
    fn insert(&self, listing: &Listing) -> Result<(), LifecycleError>;

    fn find_by_id(&self, id: &str) -> Result<Option<Listing>, LifecycleError>;

    fn find_many(&self, filter: &ListingFilter) -> Result<Vec<Listing>, LifecycleError>;

    /// Applies `patch` only if the stored status still equals `expected` at
    /// write time. Returns the written listing, `NotFound` if the id is
    /// unknown, and `Conflict` if the status moved on.
    fn update_if_status(
        &self,
        id: &str,
        expected: ListingStatus,
        patch: Patch<'_>,
    ) -> Result<Listing, LifecycleError>;
}

pub struct SledListingStore {
    tree: Tree,
}

impl SledListingStore {
    pub fn new(instance: &Arc<Db>) -> Result<Self, LifecycleError> {
        let tree = instance.open_tree(LISTINGS_TREE)?;
        Ok(Self { tree })
    }

    fn decode(bytes: &[u8]) -> Result<Listing, StoreError> {
        Ok(minicbor::decode(bytes)?)
    }

    fn encode(listing: &Listing) -> Result<Vec<u8>, StoreError> {
        Ok(minicbor::to_vec(listing)?)
    }
}

impl ListingStore for SledListingStore {
    fn insert(&self, listing: &Listing) -> Result<(), LifecycleError> {
        let bytes = Self::encode(listing)?;

        self.tree
            .compare_and_swap(listing.id.as_bytes(), None as Option<&[u8]>, Some(bytes))?
            .map_err(|_| StoreError::Duplicate(listing.id.clone()))?;

        debug!(listing_id = %listing.id, "listing inserted");
        Ok(())
    }

    fn find_by_id(&self, id: &str) -> Result<Option<Listing>, LifecycleError> {
        match self.tree.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn find_many(&self, filter: &ListingFilter) -> Result<Vec<Listing>, LifecycleError> {
        let mut found = vec![];
        for entry in self.tree.iter().values() {
            let listing = Self::decode(&entry?)?;
            if filter.matches(&listing) {
                found.push(listing);
            }
        }
        Ok(found)
    }

    fn update_if_status(
        &self,
        id: &str,
        expected: ListingStatus,
        patch: Patch<'_>,
    ) -> Result<Listing, LifecycleError> {
        let mut current = self
            .tree
            .get(id.as_bytes())?
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;

        loop {
            let mut listing = Self::decode(&current)?;
            if listing.status != expected {
                warn!(listing_id = id, %expected, found = %listing.status, "compare-and-set lost");
                return Err(LifecycleError::Conflict {
                    id: id.to_string(),
                    detail: format!("expected {expected}, found {}", listing.status),
                });
            }

            patch(&mut listing)?;
            let next = Self::encode(&listing)?;

            match self
                .tree
                .compare_and_swap(id.as_bytes(), Some(&current), Some(next))?
            {
                Ok(()) => return Ok(listing),
                // the record changed under us; re-check against what is there now
                Err(cas) => match cas.current {
                    Some(fresh) => {
                        debug!(listing_id = id, "record changed during update, retrying");
                        current = fresh;
                    }
                    None => return Err(LifecycleError::NotFound(id.to_string())),
                },
            }
        }
    }
}
