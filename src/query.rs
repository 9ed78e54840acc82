//! Read-only projections over listings and the activity log
//!
//! Every projection applies the lazy expiry rule: a listing whose best before
//! has passed is reported as expired even if no sweep has written it yet.
use crate::activity::{Activity, ActivityHistory, SledActivityLog};
use crate::error::LifecycleError;
use crate::listing::{Listing, ListingStatus};
use crate::store::{ListingFilter, ListingStore, SledListingStore};
use crate::time_window::{Clock, SystemClock};
use chrono::TimeDelta;
use sled::Db;
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct ListingQuery {
    listings: Arc<dyn ListingStore>,
    activity: Arc<dyn ActivityHistory>,
    clock: Arc<dyn Clock>,
}

impl ListingQuery {
    pub fn new(
        listings: Arc<dyn ListingStore>,
        activity: Arc<dyn ActivityHistory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            listings,
            activity,
            clock,
        }
    }

    pub fn open_sled(instance: Arc<Db>) -> Result<Self, LifecycleError> {
        let listings = Arc::new(SledListingStore::new(&instance)?);
        let activity = Arc::new(SledActivityLog::new(&instance)?);
        Ok(Self::new(listings, activity, Arc::new(SystemClock)))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Listings whose effective status is `status`.
    pub fn by_status(&self, status: ListingStatus) -> Result<Vec<Listing>, LifecycleError> {
        let now = self.clock.now();
        let mut filter = ListingFilter::new().with_status(status);
        if status == ListingStatus::Expired {
            // unreconciled listings may still carry an expirable status
            filter = filter.with_statuses(&ListingStatus::EXPIRABLE);
        }

        Ok(self
            .listings
            .find_many(&filter)?
            .into_iter()
            .filter(|l| l.effective_status(&now) == status)
            .collect())
    }

    /// A donor's listings, newest first.
    pub fn by_donor(&self, donor_id: &str) -> Result<Vec<Listing>, LifecycleError> {
        let mut found = self.listings.find_many(&ListingFilter::new().with_donor(donor_id))?;
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    /// The NGO feed: available, inside the safety window, and not held by
    /// another NGO's live reservation. Soonest to expire first.
    pub fn available_for_claiming(&self, viewer: Option<&str>) -> Result<Vec<Listing>, LifecycleError> {
        let now = self.clock.now();
        let filter = ListingFilter::new()
            .with_status(ListingStatus::Available)
            .best_before_after(now);

        let mut found: Vec<Listing> = self
            .listings
            .find_many(&filter)?
            .into_iter()
            .filter(|l| !l.is_effectively_expired(&now))
            .filter(|l| match l.active_reservation(&now) {
                Some(holder) => viewer == Some(holder),
                None => true,
            })
            .collect();
        found.sort_by(|a, b| a.best_before.cmp(&b.best_before));
        Ok(found)
    }

    /// Listings cancelled within the last `days` days, newest first. A window
    /// reaching past the earliest representable instant covers every
    /// cancellation.
    pub fn cancelled_within(&self, days: i64) -> Result<Vec<Listing>, LifecycleError> {
        if days < 0 {
            return Err(LifecycleError::Validation(format!(
                "days must not be negative, got {days}"
            )));
        }
        let now = self.clock.now();
        let since = TimeDelta::try_days(days).and_then(|window| now.checked_sub(window));

        let mut found: Vec<Listing> = self
            .listings
            .find_many(&ListingFilter::new().with_status(ListingStatus::Cancelled))?
            .into_iter()
            .filter(|l| match (l.cancelled_at, since) {
                (Some(at), Some(since)) => at >= since,
                (Some(_), None) => true,
                (None, _) => false,
            })
            .collect();
        found.sort_by(|a, b| b.cancelled_at.cmp(&a.cancelled_at));
        Ok(found)
    }

    pub fn average_rating_per_donor(&self) -> Result<BTreeMap<String, f64>, LifecycleError> {
        let delivered = self
            .listings
            .find_many(&ListingFilter::new().with_status(ListingStatus::Delivered))?;

        let mut totals: BTreeMap<String, (u32, u32)> = BTreeMap::new();
        for listing in &delivered {
            if let Some(rating) = listing.rating {
                let entry = totals.entry(listing.donor_id.clone()).or_default();
                entry.0 += u32::from(rating);
                entry.1 += 1;
            }
        }

        Ok(totals
            .into_iter()
            .map(|(donor, (sum, count))| (donor, f64::from(sum) / f64::from(count)))
            .collect())
    }

    pub fn average_rating(&self, donor_id: &str) -> Result<Option<f64>, LifecycleError> {
        Ok(self.average_rating_per_donor()?.remove(donor_id))
    }

    /// Listings an NGO has claimed, most recently claimed first.
    pub fn claimed_by(&self, ngo_id: &str) -> Result<Vec<Listing>, LifecycleError> {
        let mut found = self
            .listings
            .find_many(&ListingFilter::new().with_claimed_by(ngo_id))?;
        found.sort_by(|a, b| b.claimed_at.cmp(&a.claimed_at));
        Ok(found)
    }

    /// Pickups assigned to a volunteer, most recently assigned first.
    pub fn assigned_to(&self, volunteer_id: &str) -> Result<Vec<Listing>, LifecycleError> {
        let mut found = self
            .listings
            .find_many(&ListingFilter::new().with_volunteer(volunteer_id))?;
        found.sort_by(|a, b| b.assigned_at.cmp(&a.assigned_at));
        Ok(found)
    }

    /// Count of listings per effective status. Every status is present.
    pub fn status_counts(&self) -> Result<BTreeMap<ListingStatus, usize>, LifecycleError> {
        let now = self.clock.now();
        let mut counts: BTreeMap<ListingStatus, usize> =
            ListingStatus::ALL.iter().map(|s| (*s, 0)).collect();

        for listing in self.listings.find_many(&ListingFilter::new())? {
            *counts.entry(listing.effective_status(&now)).or_default() += 1;
        }
        Ok(counts)
    }

    pub fn recent_activity(&self, limit: usize) -> Result<Vec<Activity>, LifecycleError> {
        Ok(self.activity.recent(limit)?)
    }

    pub fn activity_for(&self, listing_id: &str) -> Result<Vec<Activity>, LifecycleError> {
        Ok(self.activity.for_target(listing_id)?)
    }
}
