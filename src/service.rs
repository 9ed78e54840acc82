//! Service layer API for listing lifecycle operations
use crate::activity::{ActivityAction, ActivityRecord, ActivitySink, SledActivityLog};
use crate::actor::{Actor, Role};
use crate::config::EngineConfig;
use crate::error::LifecycleError;
use crate::listing::{CancelReason, Listing, ListingStatus, NewListing};
use crate::store::{ListingFilter, ListingStore, SledListingStore};
use crate::time_window::{Clock, SystemClock, TimeStamp};
use crate::utils;
use sled::Db;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Payload of the delivery confirmation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryProof {
    pub recipient_name: String,
    pub photo: Option<String>,
    pub notes: Option<String>,
}

impl DeliveryProof {
    pub fn new(recipient_name: impl Into<String>) -> Self {
        Self {
            recipient_name: recipient_name.into(),
            ..Self::default()
        }
    }
    pub fn with_photo(mut self, photo: impl Into<String>) -> Self {
        self.photo = Some(photo.into());
        self
    }
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Outcome of one reconciliation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: Vec<String>,
    /// Listings another writer moved first.
    pub skipped: Vec<String>,
    /// Listings whose expiry failed, with the error. A listing whose write
    /// landed but whose activity append failed is reported here too.
    pub failed: Vec<(String, String)>,
}

pub struct LifecycleService {
    listings: Arc<dyn ListingStore>,
    activity: Arc<dyn ActivitySink>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl LifecycleService {
    pub fn new(
        listings: Arc<dyn ListingStore>,
        activity: Arc<dyn ActivitySink>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            listings,
            activity,
            clock,
            config,
        }
    }

    /// Wires the service to the `listings` and `activity` trees of a sled
    /// database, reading the wall clock.
    pub fn open_sled(instance: Arc<Db>, config: EngineConfig) -> Result<Self, LifecycleError> {
        let listings = Arc::new(SledListingStore::new(&instance)?);
        let activity = Arc::new(SledActivityLog::new(&instance)?);
        Ok(Self::new(listings, activity, Arc::new(SystemClock), config))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> TimeStamp {
        self.clock.now()
    }

    /// Load a listing from the store
    pub fn load_listing(&self, listing_id: &str) -> Result<Listing, LifecycleError> {
        debug!(listing_id, "loading listing");
        self.listings
            .find_by_id(listing_id)?
            .ok_or_else(|| LifecycleError::NotFound(listing_id.to_string()))
    }

    /// Publish a donor's draft as an available listing
    pub fn create_listing(&self, actor: &Actor, draft: NewListing) -> Result<Listing, LifecycleError> {
        if !actor.is(Role::Donor) {
            return Err(forbidden(actor, "create listings"));
        }

        let id = utils::new_uuid_to_bech32(utils::LISTING_HRP)?;
        let listing = draft.validate_and_finalise(id, actor.id.clone(), self.now())?;
        self.listings.insert(&listing)?;

        info!(listing_id = %listing.id, donor = %actor.id, best_before = %listing.best_before, "listing created");
        Ok(listing)
    }

    /// Hold an available listing for one NGO for the configured window
    pub fn reserve(&self, listing_id: &str, actor: &Actor) -> Result<Listing, LifecycleError> {
        if !actor.is(Role::Ngo) {
            return Err(forbidden(actor, "reserve listings"));
        }
        let now = self.now();
        let listing = self.load_listing(listing_id)?;
        let status = listing.effective_status(&now);
        if status != ListingStatus::Available {
            warn!(listing_id, %status, "reservation rejected");
            return Err(LifecycleError::Validation(format!(
                "only available listings can be reserved, listing {listing_id} is {status}"
            )));
        }

        let until = now.checked_add(self.config.reservation_window).ok_or_else(|| {
            LifecycleError::Validation(format!(
                "reservation window {} overflows the clock",
                self.config.reservation_window
            ))
        })?;
        let updated = self.listings.update_if_status(
            listing_id,
            ListingStatus::Available,
            &|listing| {
                ensure_not_reserved_by_other(listing, actor, &now)?;
                listing.reserved_by = Some(actor.id.clone());
                listing.reserved_until = Some(until);
                Ok(())
            },
        )?;

        self.record(
            ActivityAction::ListingReserved,
            actor,
            &updated,
            now,
            format!("{actor} reserved '{}' until {until}", updated.name),
        )?;
        Ok(updated)
    }

    /// Available -> Claimed, by an NGO
    pub fn claim(&self, listing_id: &str, actor: &Actor) -> Result<Listing, LifecycleError> {
        let now = self.now();
        let listing = self.load_listing(listing_id)?;
        let from = self.checked_source(&listing, ListingStatus::Claimed, &now)?;
        if !actor.is(Role::Ngo) {
            return Err(forbidden(actor, "claim listings"));
        }

        let updated = self.listings.update_if_status(listing_id, from, &|listing| {
            ensure_not_reserved_by_other(listing, actor, &now)?;
            listing.status = ListingStatus::Claimed;
            listing.stamp(ListingStatus::Claimed, now)?;
            listing.claimed_by = Some(actor.id.clone());
            Ok(())
        })?;

        self.record(
            ActivityAction::ListingClaimed,
            actor,
            &updated,
            now,
            format!("{actor} claimed '{}'", updated.name),
        )?;
        Ok(updated)
    }

    /// Available -> Cancelled, by the owning donor or an admin
    pub fn cancel(
        &self,
        listing_id: &str,
        actor: &Actor,
        reason: CancelReason,
        note: Option<String>,
    ) -> Result<Listing, LifecycleError> {
        let now = self.now();
        let listing = self.load_listing(listing_id)?;
        let from = self.checked_source(&listing, ListingStatus::Cancelled, &now)?;
        let is_owner = actor.is(Role::Donor) && actor.id == listing.donor_id;
        if !is_owner && !actor.is(Role::Admin) {
            return Err(forbidden(actor, "cancel a listing it does not own"));
        }
        if reason == CancelReason::Other && note.as_deref().is_none_or(|n| n.trim().is_empty()) {
            return Err(LifecycleError::Validation(
                "cancelling for 'other' needs a note".into(),
            ));
        }

        let updated = self.listings.update_if_status(listing_id, from, &|listing| {
            listing.status = ListingStatus::Cancelled;
            listing.stamp(ListingStatus::Cancelled, now)?;
            listing.cancel_reason = Some(reason);
            listing.cancel_note = note.clone();
            Ok(())
        })?;

        self.record(
            ActivityAction::ListingCancelled,
            actor,
            &updated,
            now,
            format!("{actor} cancelled '{}': {reason}", updated.name),
        )?;
        Ok(updated)
    }

    /// Claimed -> PickupAssigned. Volunteers may only assign themselves; the
    /// system dispatcher may assign anyone.
    pub fn assign_volunteer(
        &self,
        listing_id: &str,
        actor: &Actor,
        volunteer_id: &str,
    ) -> Result<Listing, LifecycleError> {
        let now = self.now();
        let listing = self.load_listing(listing_id)?;
        let from = self.checked_source(&listing, ListingStatus::PickupAssigned, &now)?;
        match actor.role {
            Role::Volunteer if actor.id == volunteer_id => {}
            Role::Volunteer => return Err(forbidden(actor, "assign another volunteer")),
            Role::System => {}
            _ => return Err(forbidden(actor, "assign volunteers")),
        }
        if volunteer_id.trim().is_empty() {
            return Err(LifecycleError::Validation("volunteer id is required".into()));
        }

        let updated = self.listings.update_if_status(listing_id, from, &|listing| {
            listing.status = ListingStatus::PickupAssigned;
            listing.stamp(ListingStatus::PickupAssigned, now)?;
            listing.volunteer_id = Some(volunteer_id.to_string());
            Ok(())
        })?;

        self.record(
            ActivityAction::VolunteerAssigned,
            actor,
            &updated,
            now,
            format!("volunteer {volunteer_id} assigned to '{}'", updated.name),
        )?;
        Ok(updated)
    }

    /// PickupAssigned -> PickedUp, by the assigned volunteer
    pub fn confirm_pickup(
        &self,
        listing_id: &str,
        actor: &Actor,
        photo: Option<String>,
    ) -> Result<Listing, LifecycleError> {
        let now = self.now();
        let listing = self.load_listing(listing_id)?;
        let from = self.checked_source(&listing, ListingStatus::PickedUp, &now)?;
        ensure_assigned_volunteer(&listing, actor)?;

        let updated = self.listings.update_if_status(listing_id, from, &|listing| {
            listing.status = ListingStatus::PickedUp;
            listing.stamp(ListingStatus::PickedUp, now)?;
            listing.pickup_photo = photo.clone();
            Ok(())
        })?;

        self.record(
            ActivityAction::PickupConfirmed,
            actor,
            &updated,
            now,
            format!("{actor} picked up '{}'", updated.name),
        )?;
        Ok(updated)
    }

    /// PickedUp -> Delivered, by the assigned volunteer
    pub fn confirm_delivery(
        &self,
        listing_id: &str,
        actor: &Actor,
        proof: DeliveryProof,
    ) -> Result<Listing, LifecycleError> {
        let now = self.now();
        let listing = self.load_listing(listing_id)?;
        let from = self.checked_source(&listing, ListingStatus::Delivered, &now)?;
        ensure_assigned_volunteer(&listing, actor)?;
        let recipient = proof.recipient_name.trim();
        if recipient.is_empty() {
            return Err(LifecycleError::Validation("recipient name is required".into()));
        }

        let updated = self.listings.update_if_status(listing_id, from, &|listing| {
            listing.status = ListingStatus::Delivered;
            listing.stamp(ListingStatus::Delivered, now)?;
            listing.recipient_name = Some(recipient.to_string());
            listing.delivery_photo = proof.photo.clone();
            listing.delivery_notes = proof.notes.clone();
            Ok(())
        })?;

        self.record(
            ActivityAction::DeliveryConfirmed,
            actor,
            &updated,
            now,
            format!("{actor} delivered '{}' to {recipient}", updated.name),
        )?;
        Ok(updated)
    }

    /// Rate a delivered donation. Only the receiving NGO or an admin, and only
    /// once.
    pub fn rate(
        &self,
        listing_id: &str,
        actor: &Actor,
        rating: u8,
        feedback: Option<String>,
    ) -> Result<Listing, LifecycleError> {
        let now = self.now();
        let listing = self.load_listing(listing_id)?;
        if listing.status != ListingStatus::Delivered {
            return Err(LifecycleError::Validation(format!(
                "only delivered listings can be rated, listing is {}",
                listing.status
            )));
        }
        let is_receiver = actor.is(Role::Ngo) && listing.claimed_by.as_deref() == Some(actor.id.as_str());
        if !is_receiver && !actor.is(Role::Admin) {
            return Err(forbidden(actor, "rate a donation it did not receive"));
        }
        if !(1..=5).contains(&rating) {
            return Err(LifecycleError::Validation(format!(
                "rating must be between 1 and 5, got {rating}"
            )));
        }

        let updated = self.listings.update_if_status(
            listing_id,
            ListingStatus::Delivered,
            &|listing| {
                if listing.rating.is_some() {
                    return Err(LifecycleError::Validation(format!(
                        "listing {} has already been rated",
                        listing.id
                    )));
                }
                listing.rating = Some(rating);
                listing.feedback = feedback.clone();
                listing.rated_at = Some(now);
                Ok(())
            },
        )?;

        self.record(
            ActivityAction::DonationRated,
            actor,
            &updated,
            now,
            format!("{actor} rated '{}' {rating}/5", updated.name),
        )?;
        Ok(updated)
    }

    /// Force a single listing whose window has elapsed into Expired.
    pub fn expire(&self, listing_id: &str) -> Result<Listing, LifecycleError> {
        let listing = self.load_listing(listing_id)?;
        self.expire_listing(&listing, self.now())
    }

    /// Reconciliation sweep: writes Expired for every listing whose window has
    /// elapsed while still waiting for pickup. Listings another writer moved
    /// first are skipped; a failure on one listing is recorded in the report
    /// and the sweep moves on. Only a failed scan is returned as an error.
    pub fn sweep_expired(&self) -> Result<SweepReport, LifecycleError> {
        let now = self.now();
        let filter = ListingFilter::new()
            .with_statuses(&ListingStatus::EXPIRABLE)
            .best_before_at_or_before(now);
        let candidates = self.listings.find_many(&filter)?;
        debug!(candidates = candidates.len(), "expiry sweep started");

        let mut report = SweepReport::default();
        for listing in candidates {
            match self.expire_listing(&listing, now) {
                Ok(expired) => report.expired.push(expired.id),
                Err(e) if e.is_conflict() => {
                    debug!(listing_id = %listing.id, "already moved, skipping");
                    report.skipped.push(listing.id);
                }
                Err(e) => {
                    error!(listing_id = %listing.id, error = %e, "expiry failed, continuing sweep");
                    report.failed.push((listing.id, e.to_string()));
                }
            }
        }

        info!(
            expired = report.expired.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "expiry sweep finished"
        );
        Ok(report)
    }

    fn expire_listing(&self, listing: &Listing, now: TimeStamp) -> Result<Listing, LifecycleError> {
        listing.status.ensure_transition(ListingStatus::Expired)?;
        if !listing.time_window(&now).is_expired {
            return Err(LifecycleError::Validation(format!(
                "listing {} is still within its best before window",
                listing.id
            )));
        }

        let updated = self
            .listings
            .update_if_status(&listing.id, listing.status, &|listing| {
                listing.status = ListingStatus::Expired;
                listing.stamp(ListingStatus::Expired, now)?;
                Ok(())
            })?;

        self.record(
            ActivityAction::ListingExpired,
            &Actor::system(),
            &updated,
            now,
            format!("'{}' expired, best before {}", updated.name, updated.best_before),
        )?;
        Ok(updated)
    }

    /// Validates the edge from the listing's effective status. A listing whose
    /// window has elapsed reports Expired as its source. A listing already in
    /// the target state is a lost race and yields `Conflict`, terminal targets
    /// included: cancelling a cancelled listing is a `Conflict`, not an
    /// `InvalidTransition`.
    fn checked_source(
        &self,
        listing: &Listing,
        to: ListingStatus,
        now: &TimeStamp,
    ) -> Result<ListingStatus, LifecycleError> {
        let from = listing.effective_status(now);
        if from == to {
            // someone else already applied this transition
            warn!(listing_id = %listing.id, %to, "transition already applied");
            return Err(LifecycleError::Conflict {
                id: listing.id.clone(),
                detail: format!("already {to}"),
            });
        }
        if let Err(e) = from.ensure_transition(to) {
            warn!(listing_id = %listing.id, %from, %to, "rejected transition");
            return Err(e);
        }
        Ok(from)
    }

    fn record(
        &self,
        action: ActivityAction,
        actor: &Actor,
        listing: &Listing,
        at: TimeStamp,
        details: String,
    ) -> Result<(), LifecycleError> {
        let record = ActivityRecord::for_listing(action, actor, &listing.id, at, details);

        match self.activity.append(record) {
            Ok(_) => {
                info!(listing_id = %listing.id, %action, status = %listing.status, actor = %actor, "listing updated");
                Ok(())
            }
            Err(source) => {
                error!(listing_id = %listing.id, %action, error = %source, "listing updated but activity append failed");
                Err(LifecycleError::Audit {
                    listing_id: listing.id.clone(),
                    source,
                })
            }
        }
    }
}

fn forbidden(actor: &Actor, what: &str) -> LifecycleError {
    warn!(actor = %actor, what, "forbidden");
    LifecycleError::Forbidden(format!("{actor} may not {what}"))
}

fn ensure_not_reserved_by_other(
    listing: &Listing,
    actor: &Actor,
    now: &TimeStamp,
) -> Result<(), LifecycleError> {
    match (listing.active_reservation(now), &listing.reserved_until) {
        (Some(holder), Some(until)) if holder != actor.id => Err(LifecycleError::Conflict {
            id: listing.id.clone(),
            detail: format!("reserved by another NGO until {until}"),
        }),
        _ => Ok(()),
    }
}

fn ensure_assigned_volunteer(listing: &Listing, actor: &Actor) -> Result<(), LifecycleError> {
    if actor.is(Role::Volunteer) && listing.volunteer_id.as_deref() == Some(actor.id.as_str()) {
        Ok(())
    } else {
        Err(forbidden(actor, "act on a pickup assigned to someone else"))
    }
}
