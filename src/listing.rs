//! The listing record, its status graph and the draft used to create it
use crate::error::LifecycleError;
use crate::time_window::{TimeStamp, TimeWindow, time_window};
use std::collections::BTreeSet;
use std::fmt;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ListingStatus {
    #[n(0)]
    Available,
    #[n(1)]
    Claimed,
    #[n(2)]
    PickupAssigned,
    #[n(3)]
    PickedUp,
    #[n(4)]
    Delivered,
    #[n(5)]
    Expired,
    #[n(6)]
    Cancelled,
}

impl ListingStatus {
    pub const ALL: [ListingStatus; 7] = [
        ListingStatus::Available,
        ListingStatus::Claimed,
        ListingStatus::PickupAssigned,
        ListingStatus::PickedUp,
        ListingStatus::Delivered,
        ListingStatus::Expired,
        ListingStatus::Cancelled,
    ];

    /// States the expiry sweep may move to Expired.
    pub const EXPIRABLE: [ListingStatus; 3] = [
        ListingStatus::Available,
        ListingStatus::Claimed,
        ListingStatus::PickupAssigned,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ListingStatus::Delivered | ListingStatus::Expired | ListingStatus::Cancelled
        )
    }

    pub fn is_expirable(&self) -> bool {
        Self::EXPIRABLE.contains(self)
    }

    /// The directed edges of the lifecycle graph.
    pub fn can_transition_to(&self, next: ListingStatus) -> bool {
        use ListingStatus::*;

        matches!(
            (self, next),
            (Available, Claimed)
                | (Available, Cancelled)
                | (Available, Expired)
                | (Claimed, PickupAssigned)
                | (Claimed, Expired)
                | (PickupAssigned, PickedUp)
                | (PickupAssigned, Expired)
                | (PickedUp, Delivered)
        )
    }

    /// Checks the edge `self -> next`.
    pub fn ensure_transition(&self, next: ListingStatus) -> Result<(), LifecycleError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(LifecycleError::InvalidTransition {
                from: *self,
                to: next,
            })
        }
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ListingStatus::Available => "available",
            ListingStatus::Claimed => "claimed",
            ListingStatus::PickupAssigned => "pickup_assigned",
            ListingStatus::PickedUp => "picked_up",
            ListingStatus::Delivered => "delivered",
            ListingStatus::Expired => "expired",
            ListingStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    #[n(0)]
    Cooked,
    #[n(1)]
    Raw,
    #[n(2)]
    Bakery,
    #[n(3)]
    Dairy,
    #[n(4)]
    Fruits,
    #[n(5)]
    Packaged,
    #[n(6)]
    Beverages,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DietaryType {
    #[default]
    #[n(0)]
    Veg,
    #[n(1)]
    NonVeg,
    #[n(2)]
    Vegan,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Allergen {
    #[n(0)]
    Gluten,
    #[n(1)]
    Dairy,
    #[n(2)]
    Nuts,
    #[n(3)]
    Eggs,
    #[n(4)]
    Soy,
    #[n(5)]
    Shellfish,
    #[n(6)]
    Fish,
    #[n(7)]
    Sesame,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuantityUnit {
    #[default]
    #[n(0)]
    Kg,
    #[n(1)]
    Liters,
    #[n(2)]
    Pieces,
    #[n(3)]
    Boxes,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContainerType {
    #[default]
    #[n(0)]
    Disposable,
    #[n(1)]
    Returnable,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    #[n(0)]
    Spoiled,
    #[n(1)]
    Sold,
    #[n(2)]
    Consumed,
    #[n(3)]
    Error,
    #[n(4)]
    Other,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CancelReason::Spoiled => "spoiled",
            CancelReason::Sold => "sold",
            CancelReason::Consumed => "consumed",
            CancelReason::Error => "error",
            CancelReason::Other => "other",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for CancelReason {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "spoiled" => Ok(CancelReason::Spoiled),
            "sold" => Ok(CancelReason::Sold),
            "consumed" => Ok(CancelReason::Consumed),
            "error" => Ok(CancelReason::Error),
            "other" => Ok(CancelReason::Other),
            "" => Err(LifecycleError::Validation("cancel reason is required".into())),
            other => Err(LifecycleError::Validation(format!(
                "unknown cancel reason '{other}'"
            ))),
        }
    }
}

/// Donor's food safety self-check. Every item must be ticked before a
/// listing can be published.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HygieneChecklist {
    #[n(0)]
    pub hand_washing: bool,
    #[n(1)]
    pub clean_containers: bool,
    #[n(2)]
    pub proper_temperature: bool,
    #[n(3)]
    pub no_contamination: bool,
    #[n(4)]
    pub labeled_correctly: bool,
}

impl HygieneChecklist {
    pub fn all_checked() -> Self {
        Self {
            hand_washing: true,
            clean_containers: true,
            proper_temperature: true,
            no_contamination: true,
            labeled_correctly: true,
        }
    }
    pub fn is_complete(&self) -> bool {
        self.hand_washing
            && self.clean_containers
            && self.proper_temperature
            && self.no_contamination
            && self.labeled_correctly
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub donor_id: String,
    #[n(2)]
    pub status: ListingStatus,
    #[n(3)]
    pub name: String,
    #[n(4)]
    pub description: Option<String>,
    #[n(5)]
    pub category: Category,
    #[n(6)]
    pub quantity: u32,
    #[n(7)]
    pub unit: QuantityUnit,
    #[n(8)]
    pub servings: u32,
    #[n(9)]
    pub dietary_type: DietaryType,
    #[n(10)]
    pub allergens: BTreeSet<Allergen>,
    #[n(11)]
    pub handling_instructions: Option<String>,
    #[n(12)]
    pub container_type: ContainerType,
    #[n(13)]
    pub refrigeration_required: bool,
    #[n(14)]
    pub prepared_at: TimeStamp,
    #[n(15)]
    pub best_before: TimeStamp,
    #[n(16)]
    pub claimed_by: Option<String>,
    #[n(17)]
    pub volunteer_id: Option<String>,
    #[n(18)]
    pub reserved_by: Option<String>,
    #[n(19)]
    pub reserved_until: Option<TimeStamp>,
    #[n(20)]
    pub cancel_reason: Option<CancelReason>,
    #[n(21)]
    pub cancel_note: Option<String>,
    #[n(22)]
    pub pickup_photo: Option<String>,
    #[n(23)]
    pub delivery_photo: Option<String>,
    #[n(24)]
    pub recipient_name: Option<String>,
    #[n(25)]
    pub delivery_notes: Option<String>,
    #[n(26)]
    pub rating: Option<u8>,
    #[n(27)]
    pub feedback: Option<String>,
    #[n(28)]
    pub rated_at: Option<TimeStamp>,
    #[n(29)]
    pub created_at: TimeStamp,
    #[n(30)]
    pub claimed_at: Option<TimeStamp>,
    #[n(31)]
    pub assigned_at: Option<TimeStamp>,
    #[n(32)]
    pub picked_up_at: Option<TimeStamp>,
    #[n(33)]
    pub delivered_at: Option<TimeStamp>,
    #[n(34)]
    pub cancelled_at: Option<TimeStamp>,
    #[n(35)]
    pub expired_at: Option<TimeStamp>,
}

impl Listing {
    pub fn time_window(&self, now: &TimeStamp) -> TimeWindow {
        time_window(&self.best_before, now)
    }

    /// True once the safety window has elapsed while the food is still
    /// waiting to be picked up.
    pub fn is_effectively_expired(&self, now: &TimeStamp) -> bool {
        self.status.is_expirable() && self.time_window(now).is_expired
    }

    /// Status with the lazy expiry rule applied.
    pub fn effective_status(&self, now: &TimeStamp) -> ListingStatus {
        if self.is_effectively_expired(now) {
            ListingStatus::Expired
        } else {
            self.status
        }
    }

    /// The holder of a reservation that has not yet run out.
    pub fn active_reservation(&self, now: &TimeStamp) -> Option<&str> {
        match (&self.reserved_by, &self.reserved_until) {
            (Some(holder), Some(until)) if until > now => Some(holder.as_str()),
            _ => None,
        }
    }

    /// Timestamp recorded when the listing entered `status`.
    pub fn entered_at(&self, status: ListingStatus) -> Option<&TimeStamp> {
        match status {
            ListingStatus::Available => Some(&self.created_at),
            ListingStatus::Claimed => self.claimed_at.as_ref(),
            ListingStatus::PickupAssigned => self.assigned_at.as_ref(),
            ListingStatus::PickedUp => self.picked_up_at.as_ref(),
            ListingStatus::Delivered => self.delivered_at.as_ref(),
            ListingStatus::Expired => self.expired_at.as_ref(),
            ListingStatus::Cancelled => self.cancelled_at.as_ref(),
        }
    }

    /// Records the transition timestamp for `status`. The field must be empty.
    pub(crate) fn stamp(&mut self, status: ListingStatus, at: TimeStamp) -> Result<(), LifecycleError> {
        let slot = match status {
            ListingStatus::Available => {
                return Err(LifecycleError::Validation(
                    "a listing cannot re-enter available".into(),
                ));
            }
            ListingStatus::Claimed => &mut self.claimed_at,
            ListingStatus::PickupAssigned => &mut self.assigned_at,
            ListingStatus::PickedUp => &mut self.picked_up_at,
            ListingStatus::Delivered => &mut self.delivered_at,
            ListingStatus::Expired => &mut self.expired_at,
            ListingStatus::Cancelled => &mut self.cancelled_at,
        };
        if slot.is_some() {
            return Err(LifecycleError::Validation(format!(
                "{status} timestamp is already set on listing {}",
                self.id
            )));
        }
        *slot = Some(at);
        Ok(())
    }

    /// States this listing has passed through, in order, derived from status.
    pub fn path(&self) -> Vec<ListingStatus> {
        use ListingStatus::*;

        let mut path = vec![Available];
        match self.status {
            Available => {}
            Claimed => path.push(Claimed),
            PickupAssigned => path.extend([Claimed, PickupAssigned]),
            PickedUp => path.extend([Claimed, PickupAssigned, PickedUp]),
            Delivered => path.extend([Claimed, PickupAssigned, PickedUp, Delivered]),
            Cancelled => path.push(Cancelled),
            Expired => {
                if self.claimed_at.is_some() {
                    path.push(Claimed);
                }
                if self.assigned_at.is_some() {
                    path.push(PickupAssigned);
                }
                path.push(Expired);
            }
        }
        path
    }

    /// Exactly the timestamps of states on the path are set.
    pub fn timestamps_consistent(&self) -> bool {
        let path = self.path();
        ListingStatus::ALL
            .iter()
            .all(|status| path.contains(status) == self.entered_at(*status).is_some())
    }
}

/// A donor's draft listing. Built up field by field then validated into a
/// [`Listing`] by the lifecycle service.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NewListing {
    name: String,
    description: Option<String>,
    category: Option<Category>,
    quantity: u32,
    unit: QuantityUnit,
    servings: u32,
    dietary_type: DietaryType,
    allergens: BTreeSet<Allergen>,
    handling_instructions: Option<String>,
    container_type: ContainerType,
    refrigeration_required: bool,
    prepared_at: Option<TimeStamp>,
    best_before: Option<TimeStamp>,
    hygiene: HygieneChecklist,
}

impl NewListing {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
    pub fn set_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
    pub fn set_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }
    pub fn set_quantity(mut self, quantity: u32, unit: QuantityUnit) -> Self {
        self.quantity = quantity;
        self.unit = unit;
        self
    }
    pub fn set_servings(mut self, servings: u32) -> Self {
        self.servings = servings;
        self
    }
    pub fn set_dietary_type(mut self, dietary_type: DietaryType) -> Self {
        self.dietary_type = dietary_type;
        self
    }
    pub fn add_allergen(mut self, allergen: Allergen) -> Self {
        self.allergens.insert(allergen);
        self
    }
    pub fn set_handling_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.handling_instructions = Some(instructions.into());
        self
    }
    pub fn set_container_type(mut self, container_type: ContainerType) -> Self {
        self.container_type = container_type;
        self
    }
    pub fn set_refrigeration_required(mut self, required: bool) -> Self {
        self.refrigeration_required = required;
        self
    }
    pub fn set_prepared_at(mut self, at: TimeStamp) -> Self {
        self.prepared_at = Some(at);
        self
    }
    pub fn set_best_before(mut self, at: TimeStamp) -> Self {
        self.best_before = Some(at);
        self
    }
    pub fn set_hygiene(mut self, hygiene: HygieneChecklist) -> Self {
        self.hygiene = hygiene;
        self
    }

    /// Checks `prepared_at < best_before`; false when either is missing.
    pub fn validate_window(&self) -> bool {
        match (&self.prepared_at, &self.best_before) {
            (Some(prepared), Some(best_before)) => prepared < best_before,
            _ => false,
        }
    }

    // Checks every field and produces the stored record in its initial state
    pub fn validate_and_finalise(
        self,
        id: String,
        donor_id: String,
        now: TimeStamp,
    ) -> Result<Listing, LifecycleError> {
        if self.name.trim().is_empty() {
            return Err(LifecycleError::Validation("name is required".into()));
        }
        let Some(category) = self.category else {
            return Err(LifecycleError::Validation("category is required".into()));
        };
        if self.quantity == 0 {
            return Err(LifecycleError::Validation("quantity is set to zero".into()));
        }
        if self.servings == 0 {
            return Err(LifecycleError::Validation("servings is set to zero".into()));
        }
        let (Some(prepared_at), Some(best_before)) = (self.prepared_at, self.best_before) else {
            return Err(LifecycleError::Validation(
                "prepared at and best before are required".into(),
            ));
        };
        if !self.validate_window() {
            return Err(LifecycleError::Validation(
                "best before must be after prepared at".into(),
            ));
        }
        if time_window(&best_before, &now).is_expired {
            return Err(LifecycleError::Validation(
                "best before has already passed".into(),
            ));
        }
        if !self.hygiene.is_complete() {
            return Err(LifecycleError::Validation(
                "hygiene checklist is incomplete".into(),
            ));
        }

        Ok(Listing {
            id,
            donor_id,
            status: ListingStatus::Available,
            name: self.name.trim().to_string(),
            description: self.description,
            category,
            quantity: self.quantity,
            unit: self.unit,
            servings: self.servings,
            dietary_type: self.dietary_type,
            allergens: self.allergens,
            handling_instructions: self.handling_instructions,
            container_type: self.container_type,
            refrigeration_required: self.refrigeration_required,
            prepared_at,
            best_before,
            claimed_by: None,
            volunteer_id: None,
            reserved_by: None,
            reserved_until: None,
            cancel_reason: None,
            cancel_note: None,
            pickup_photo: None,
            delivery_photo: None,
            recipient_name: None,
            delivery_notes: None,
            rating: None,
            feedback: None,
            rated_at: None,
            created_at: now,
            claimed_at: None,
            assigned_at: None,
            picked_up_at: None,
            delivered_at: None,
            cancelled_at: None,
            expired_at: None,
        })
    }
}
