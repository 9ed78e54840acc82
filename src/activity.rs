//! Append-only audit log of who did what to which listing
//!
//! Each stored record carries the sha256 digest of the record stored before
//! it, so the log can be walked and checked for gaps or tampering.
use crate::actor::{Actor, Role};
use crate::error::StoreError;
use crate::time_window::TimeStamp;
use crate::utils;
use sled::{Db, Tree};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid7::{Uuid, uuid7};

const ACTIVITY_TREE: &str = "activity";

#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone, Copy, Hash)]
pub enum ActivityAction {
    #[n(0)]
    ListingReserved,
    #[n(1)]
    ListingClaimed,
    #[n(2)]
    VolunteerAssigned,
    #[n(3)]
    PickupConfirmed,
    #[n(4)]
    DeliveryConfirmed,
    #[n(5)]
    ListingCancelled,
    #[n(6)]
    ListingExpired,
    #[n(7)]
    DonationRated,
}

impl fmt::Display for ActivityAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActivityAction::ListingReserved => "LISTING_RESERVED",
            ActivityAction::ListingClaimed => "LISTING_CLAIMED",
            ActivityAction::VolunteerAssigned => "VOLUNTEER_ASSIGNED",
            ActivityAction::PickupConfirmed => "PICKUP_CONFIRMED",
            ActivityAction::DeliveryConfirmed => "DELIVERY_CONFIRMED",
            ActivityAction::ListingCancelled => "LISTING_CANCELLED",
            ActivityAction::ListingExpired => "LISTING_EXPIRED",
            ActivityAction::DonationRated => "DONATION_RATED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone, Copy)]
pub enum TargetType {
    #[n(0)]
    Listing,
    #[n(1)]
    User,
}

/// What happened, as reported by the engine.
#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub struct ActivityRecord {
    #[n(0)]
    pub action: ActivityAction,
    #[n(1)]
    pub actor_id: String,
    #[n(2)]
    pub actor_role: Role,
    #[n(3)]
    pub target_id: String,
    #[n(4)]
    pub target_type: TargetType,
    #[n(5)]
    pub timestamp: TimeStamp,
    #[n(6)]
    pub details: String,
}

impl ActivityRecord {
    pub fn for_listing(
        action: ActivityAction,
        actor: &Actor,
        listing_id: &str,
        timestamp: TimeStamp,
        details: String,
    ) -> Self {
        Self {
            action,
            actor_id: actor.id.clone(),
            actor_role: actor.role,
            target_id: listing_id.to_string(),
            target_type: TargetType::Listing,
            timestamp,
            details,
        }
    }
}

/// A record as stored in the log.
#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub struct Activity {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub record: ActivityRecord,
    #[n(2)]
    pub prev_digest: Option<String>,
}

impl Activity {
    /// Returns the sha256 digest of the record and its cbor encoding.
    pub fn build(&self) -> Result<(String, Vec<u8>), StoreError> {
        let cbor = minicbor::to_vec(self)?;
        let hash = sha256::digest(&cbor);

        Ok((hash, cbor))
    }
}

/// Accepts activity records. Appends happen before the engine reports
/// success.
pub trait ActivitySink: Send + Sync {
    fn append(&self, record: ActivityRecord) -> Result<Activity, StoreError>;
}

/// Read access to the log for admin feeds and listing timelines.
pub trait ActivityHistory: Send + Sync {
    /// Newest first.
    fn recent(&self, limit: usize) -> Result<Vec<Activity>, StoreError>;
    /// Oldest first.
    fn for_target(&self, target_id: &str) -> Result<Vec<Activity>, StoreError>;
}

pub struct SledActivityLog {
    tree: Tree,
    // serialises appends so each record links to the true predecessor
    append_lock: Mutex<()>,
}

impl SledActivityLog {
    pub fn new(instance: &Arc<Db>) -> Result<Self, StoreError> {
        let tree = instance.open_tree(ACTIVITY_TREE)?;
        Ok(Self {
            tree,
            append_lock: Mutex::new(()),
        })
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    fn decode(bytes: &[u8]) -> Result<Activity, StoreError> {
        Ok(minicbor::decode(bytes)?)
    }

    /// Walks the log from the start and checks every link. Returns the number
    /// of records checked, or the id of the first record whose link is broken.
    pub fn verify_chain(&self) -> Result<Result<usize, String>, StoreError> {
        let mut prev: Option<String> = None;
        let mut count = 0;

        for entry in self.tree.iter().values() {
            let bytes = entry?;
            let activity = Self::decode(&bytes)?;
            if activity.prev_digest != prev {
                return Ok(Err(activity.id));
            }
            prev = Some(sha256::digest(&bytes[..]));
            count += 1;
        }
        Ok(Ok(count))
    }
}

impl ActivitySink for SledActivityLog {
    fn append(&self, record: ActivityRecord) -> Result<Activity, StoreError> {
        // a poisoned lock only means another append panicked; the tree is intact
        let _guard = self
            .append_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let prev_digest = match self.tree.last()? {
            Some((_, bytes)) => Some(sha256::digest(&bytes[..])),
            None => None,
        };

        let key: Uuid = uuid7();
        let id = utils::uuid_to_bech32(utils::ACTIVITY_HRP, &key)
            .map_err(|e| StoreError::Identifier(e.to_string()))?;

        let activity = Activity {
            id,
            record,
            prev_digest,
        };
        let (digest, cbor) = activity.build()?;
        self.tree.insert(key.as_bytes(), cbor)?;

        debug!(
            activity_id = %activity.id,
            action = %activity.record.action,
            target = %activity.record.target_id,
            %digest,
            "activity appended"
        );
        Ok(activity)
    }
}

impl ActivityHistory for SledActivityLog {
    fn recent(&self, limit: usize) -> Result<Vec<Activity>, StoreError> {
        self.tree
            .iter()
            .values()
            .rev()
            .take(limit)
            .map(|entry| Self::decode(&entry?))
            .collect()
    }

    fn for_target(&self, target_id: &str) -> Result<Vec<Activity>, StoreError> {
        let mut found = vec![];
        for entry in self.tree.iter().values() {
            let activity = Self::decode(&entry?)?;
            if activity.record.target_id == target_id {
                found.push(activity);
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(action: ActivityAction, target: &str) -> ActivityRecord {
        ActivityRecord::for_listing(
            action,
            &Actor::ngo("user_ngo"),
            target,
            TimeStamp::now(),
            format!("{action} on {target}"),
        )
    }

    #[test]
    fn appended_records_form_a_chain() {
        let db = Arc::new(sled::Config::new().temporary(true).open().unwrap());
        let log = SledActivityLog::new(&db).unwrap();

        let first = log.append(record(ActivityAction::ListingReserved, "l1")).unwrap();
        let second = log.append(record(ActivityAction::ListingClaimed, "l1")).unwrap();
        log.append(record(ActivityAction::ListingClaimed, "l2")).unwrap();

        assert!(first.prev_digest.is_none());
        assert_eq!(second.prev_digest, Some(first.build().unwrap().0));
        assert_eq!(log.verify_chain().unwrap(), Ok(3));
    }

    #[test]
    fn recent_is_newest_first_and_target_is_oldest_first() {
        let db = Arc::new(sled::Config::new().temporary(true).open().unwrap());
        let log = SledActivityLog::new(&db).unwrap();

        log.append(record(ActivityAction::ListingReserved, "l1")).unwrap();
        log.append(record(ActivityAction::ListingClaimed, "l2")).unwrap();
        log.append(record(ActivityAction::ListingClaimed, "l1")).unwrap();

        let recent = log.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].record.target_id, "l1");
        assert_eq!(recent[1].record.target_id, "l2");

        let timeline = log.for_target("l1").unwrap();
        assert_eq!(
            timeline.iter().map(|a| a.record.action).collect::<Vec<_>>(),
            vec![ActivityAction::ListingReserved, ActivityAction::ListingClaimed]
        );
    }
}
