use anyhow::Context;
use chrono::TimeDelta;
use sled::open;
use std::sync::{Arc, Barrier};
use std::thread;

use food_rescue::{
    activity::{ActivityAction, SledActivityLog},
    actor::Actor,
    config::EngineConfig,
    error::LifecycleError,
    listing::{CancelReason, Category, HygieneChecklist, ListingStatus, NewListing, QuantityUnit},
    query::ListingQuery,
    service::{DeliveryProof, LifecycleService},
    time_window::{ManualClock, TimeStamp, hours_left},
    utils,
};
use tempfile::{TempDir, tempdir};

struct Harness {
    // keeps the database directory alive for the test
    _dir: TempDir,
    db: Arc<sled::Db>,
    clock: Arc<ManualClock>,
    service: LifecycleService,
    query: ListingQuery,
    log: SledActivityLog,
}

fn t0() -> TimeStamp {
    TimeStamp::new_with(2025, 6, 1, 8, 0, 0).unwrap()
}

// Sled uses file-based locking, so every test gets its own database in a
// temp dir for simplified cleanup.
fn harness(name: &str) -> anyhow::Result<Harness> {
    let dir = tempdir()?;
    let db = Arc::new(open(dir.path().join(name))?);
    let clock = Arc::new(ManualClock::new(t0()));

    let service =
        LifecycleService::open_sled(db.clone(), EngineConfig::default())?.with_clock(clock.clone());
    let query = ListingQuery::open_sled(db.clone())?.with_clock(clock.clone());
    let log = SledActivityLog::new(&db)?;

    Ok(Harness {
        _dir: dir,
        db,
        clock,
        service,
        query,
        log,
    })
}

fn user() -> String {
    utils::new_uuid_to_bech32(utils::USER_HRP).unwrap()
}

fn draft(prepared_at: TimeStamp, shelf_life: TimeDelta) -> NewListing {
    NewListing::new("Vegetable Biryani")
        .set_category(Category::Cooked)
        .set_quantity(10, QuantityUnit::Kg)
        .set_servings(50)
        .set_prepared_at(prepared_at)
        .set_best_before(prepared_at + shelf_life)
        .set_hygiene(HygieneChecklist::all_checked())
}

#[test]
fn full_delivery_appends_four_activity_records() -> anyhow::Result<()> {
    let h = harness("happy_path.db")?;
    let donor = Actor::donor(user());
    let ngo = Actor::ngo(user());
    let volunteer = Actor::volunteer(user());

    let listing = h
        .service
        .create_listing(&donor, draft(t0(), TimeDelta::hours(4)))
        .context("Listing Failed on Create: ")?;
    assert_eq!(listing.status, ListingStatus::Available);
    assert_eq!(h.log.len(), 0);

    let listing = h.service.claim(&listing.id, &ngo)?;
    assert_eq!(listing.status, ListingStatus::Claimed);
    assert_eq!(listing.claimed_by.as_deref(), Some(ngo.id.as_str()));

    let listing = h
        .service
        .assign_volunteer(&listing.id, &Actor::system(), &volunteer.id)?;
    assert_eq!(listing.status, ListingStatus::PickupAssigned);

    h.clock.advance(TimeDelta::minutes(30));
    let listing = h
        .service
        .confirm_pickup(&listing.id, &volunteer, Some("pickup.jpg".into()))?;
    assert_eq!(listing.status, ListingStatus::PickedUp);

    h.clock.advance(TimeDelta::minutes(30));
    let listing = h.service.confirm_delivery(
        &listing.id,
        &volunteer,
        DeliveryProof::new("Jane").with_photo("delivery.jpg"),
    )?;
    assert_eq!(listing.status, ListingStatus::Delivered);
    assert_eq!(listing.recipient_name.as_deref(), Some("Jane"));
    assert_eq!(listing.delivered_at, Some(t0() + TimeDelta::hours(1)));
    assert!(listing.timestamps_consistent());

    let timeline = h.query.activity_for(&listing.id)?;
    assert_eq!(
        timeline.iter().map(|a| a.record.action).collect::<Vec<_>>(),
        vec![
            ActivityAction::ListingClaimed,
            ActivityAction::VolunteerAssigned,
            ActivityAction::PickupConfirmed,
            ActivityAction::DeliveryConfirmed,
        ]
    );
    assert_eq!(h.log.len(), 4);
    assert_eq!(h.log.verify_chain()?, Ok(4));

    Ok(())
}

#[test]
fn cancel_after_claim_is_an_invalid_transition() -> anyhow::Result<()> {
    let h = harness("cancel_claimed.db")?;
    let donor = Actor::donor(user());

    let listing = h.service.create_listing(&donor, draft(t0(), TimeDelta::hours(4)))?;
    h.service.claim(&listing.id, &Actor::ngo(user()))?;

    let result = h
        .service
        .cancel(&listing.id, &donor, CancelReason::Spoiled, None);
    assert!(matches!(
        result,
        Err(LifecycleError::InvalidTransition {
            from: ListingStatus::Claimed,
            to: ListingStatus::Cancelled
        })
    ));
    assert_eq!(h.service.load_listing(&listing.id)?.status, ListingStatus::Claimed);

    Ok(())
}

#[test]
fn claim_on_cancelled_leaves_record_untouched() -> anyhow::Result<()> {
    let h = harness("claim_cancelled.db")?;
    let donor = Actor::donor(user());

    let listing = h.service.create_listing(&donor, draft(t0(), TimeDelta::hours(4)))?;
    let cancelled = h
        .service
        .cancel(&listing.id, &donor, CancelReason::Sold, None)?;
    assert_eq!(cancelled.cancel_reason, Some(CancelReason::Sold));
    let activity_before = h.log.len();

    let result = h.service.claim(&listing.id, &Actor::ngo(user()));
    assert!(matches!(
        result,
        Err(LifecycleError::InvalidTransition {
            from: ListingStatus::Cancelled,
            to: ListingStatus::Claimed
        })
    ));
    assert_eq!(h.service.load_listing(&listing.id)?, cancelled);
    assert_eq!(h.log.len(), activity_before);

    Ok(())
}

#[test]
fn only_owner_or_admin_may_cancel() -> anyhow::Result<()> {
    let h = harness("cancel_auth.db")?;
    let donor = Actor::donor(user());

    let listing = h.service.create_listing(&donor, draft(t0(), TimeDelta::hours(4)))?;

    let stranger = h
        .service
        .cancel(&listing.id, &Actor::donor(user()), CancelReason::Error, None);
    assert!(matches!(stranger, Err(LifecycleError::Forbidden(_))));

    let no_note = h
        .service
        .cancel(&listing.id, &Actor::admin(user()), CancelReason::Other, None);
    assert!(matches!(no_note, Err(LifecycleError::Validation(_))));

    let cancelled = h.service.cancel(
        &listing.id,
        &Actor::admin(user()),
        CancelReason::Other,
        Some("duplicate listing".into()),
    )?;
    assert_eq!(cancelled.status, ListingStatus::Cancelled);
    assert_eq!(cancelled.cancelled_at, Some(t0()));

    // a repeated cancel is a lost race, not an illegal edge
    let again = h
        .service
        .cancel(&listing.id, &donor, CancelReason::Spoiled, None);
    assert!(matches!(again, Err(LifecycleError::Conflict { .. })));
    assert_eq!(h.service.load_listing(&listing.id)?, cancelled);

    Ok(())
}

#[test]
fn concurrent_claims_have_exactly_one_winner() -> anyhow::Result<()> {
    let h = harness("concurrent_claims.db")?;
    let donor = Actor::donor(user());
    let listing = h.service.create_listing(&donor, draft(t0(), TimeDelta::hours(4)))?;

    let service = Arc::new(h.service);
    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let service = service.clone();
            let barrier = barrier.clone();
            let id = listing.id.clone();
            thread::spawn(move || {
                let ngo = Actor::ngo(user());
                barrier.wait();
                service.claim(&id, &ngo)
            })
        })
        .collect();

    let results: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().expect("claim thread panicked"))
        .collect();

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(
        results
            .iter()
            .any(|r| matches!(r, Err(LifecycleError::Conflict { .. })))
    );
    assert_eq!(h.log.len(), 1);

    Ok(())
}

#[test]
fn reservation_blocks_other_ngos_until_it_lapses() -> anyhow::Result<()> {
    let h = harness("reservation.db")?;
    let donor = Actor::donor(user());
    let holder = Actor::ngo(user());
    let other = Actor::ngo(user());

    let listing = h.service.create_listing(&donor, draft(t0(), TimeDelta::hours(4)))?;
    let reserved = h.service.reserve(&listing.id, &holder)?;
    assert_eq!(reserved.reserved_by.as_deref(), Some(holder.id.as_str()));
    assert_eq!(reserved.reserved_until, Some(t0() + TimeDelta::minutes(10)));
    assert_eq!(reserved.status, ListingStatus::Available);

    assert!(matches!(
        h.service.claim(&listing.id, &other),
        Err(LifecycleError::Conflict { .. })
    ));
    assert!(matches!(
        h.service.reserve(&listing.id, &other),
        Err(LifecycleError::Conflict { .. })
    ));
    assert!(h.query.available_for_claiming(Some(other.id.as_str()))?.is_empty());
    assert_eq!(h.query.available_for_claiming(Some(holder.id.as_str()))?.len(), 1);

    h.clock.advance(TimeDelta::minutes(11));
    let claimed = h.service.claim(&listing.id, &other)?;
    assert_eq!(claimed.claimed_by.as_deref(), Some(other.id.as_str()));

    Ok(())
}

#[test]
fn sweep_expires_stale_listings_once() -> anyhow::Result<()> {
    let h = harness("sweep.db")?;
    let donor = Actor::donor(user());
    let ngo = Actor::ngo(user());

    let short = h.service.create_listing(&donor, draft(t0(), TimeDelta::hours(1)))?;
    let claimed = h.service.create_listing(&donor, draft(t0(), TimeDelta::hours(2)))?;
    let fresh = h.service.create_listing(&donor, draft(t0(), TimeDelta::hours(8)))?;
    h.service.claim(&claimed.id, &ngo)?;

    h.clock.advance(TimeDelta::hours(3));
    let report = h.service.sweep_expired()?;
    assert_eq!(report.expired.len(), 2);
    assert!(report.expired.contains(&short.id));
    assert!(report.expired.contains(&claimed.id));

    let snapshot: Vec<_> = [&short.id, &claimed.id, &fresh.id]
        .iter()
        .map(|id| h.service.load_listing(id))
        .collect::<Result<_, _>>()?;
    let activity_after_first = h.log.len();

    let second = h.service.sweep_expired()?;
    assert!(second.expired.is_empty());
    assert!(second.skipped.is_empty());
    for listing in &snapshot {
        assert_eq!(&h.service.load_listing(&listing.id)?, listing);
    }
    assert_eq!(h.log.len(), activity_after_first);

    let expired = h.service.load_listing(&claimed.id)?;
    assert_eq!(expired.status, ListingStatus::Expired);
    assert_eq!(expired.expired_at, Some(t0() + TimeDelta::hours(3)));
    assert!(expired.timestamps_consistent());
    assert_eq!(
        h.service.load_listing(&fresh.id)?.status,
        ListingStatus::Available
    );

    Ok(())
}

#[test]
fn effectively_expired_listing_cannot_be_claimed() -> anyhow::Result<()> {
    let h = harness("lazy_expiry.db")?;
    let donor = Actor::donor(user());

    let listing = h.service.create_listing(&donor, draft(t0(), TimeDelta::hours(4)))?;
    h.clock.advance(TimeDelta::hours(5));

    assert!(h.query.available_for_claiming(None)?.is_empty());
    assert_eq!(h.query.by_status(ListingStatus::Expired)?.len(), 1);
    assert!(h.query.by_status(ListingStatus::Available)?.is_empty());

    let result = h.service.claim(&listing.id, &Actor::ngo(user()));
    assert!(matches!(
        result,
        Err(LifecycleError::InvalidTransition {
            from: ListingStatus::Expired,
            to: ListingStatus::Claimed
        })
    ));
    // stored status is only reconciled by the sweep
    assert_eq!(
        h.service.load_listing(&listing.id)?.status,
        ListingStatus::Available
    );

    Ok(())
}

#[test]
fn time_left_follows_the_clock() -> anyhow::Result<()> {
    let h = harness("time_left.db")?;
    let donor = Actor::donor(user());

    let listing = h.service.create_listing(&donor, draft(t0(), TimeDelta::hours(4)))?;

    h.clock.set(t0() + TimeDelta::hours(1));
    assert_eq!(hours_left(&listing.best_before, &h.service.now()), 3.0);
    assert!(!listing.time_window(&h.service.now()).is_expired);

    h.clock.set(t0() + TimeDelta::hours(5));
    assert!(hours_left(&listing.best_before, &h.service.now()) < 0.0);
    assert!(listing.time_window(&h.service.now()).is_expired);

    Ok(())
}

#[test]
fn only_the_assigned_volunteer_moves_the_pickup() -> anyhow::Result<()> {
    let h = harness("volunteer_auth.db")?;
    let donor = Actor::donor(user());
    let volunteer = Actor::volunteer(user());
    let other = Actor::volunteer(user());

    let listing = h.service.create_listing(&donor, draft(t0(), TimeDelta::hours(4)))?;
    h.service.claim(&listing.id, &Actor::ngo(user()))?;

    assert!(matches!(
        h.service.assign_volunteer(&listing.id, &other, &volunteer.id),
        Err(LifecycleError::Forbidden(_))
    ));
    assert!(matches!(
        h.service.assign_volunteer(&listing.id, &donor, &volunteer.id),
        Err(LifecycleError::Forbidden(_))
    ));
    h.service.assign_volunteer(&listing.id, &volunteer, &volunteer.id)?;

    assert!(matches!(
        h.service.confirm_pickup(&listing.id, &other, None),
        Err(LifecycleError::Forbidden(_))
    ));
    h.service.confirm_pickup(&listing.id, &volunteer, None)?;

    assert!(matches!(
        h.service
            .confirm_delivery(&listing.id, &volunteer, DeliveryProof::new("  ")),
        Err(LifecycleError::Validation(_))
    ));
    let delivered = h.service.confirm_delivery(
        &listing.id,
        &volunteer,
        DeliveryProof::new("Jane").with_notes("left with shelter staff"),
    )?;
    assert_eq!(delivered.delivery_notes.as_deref(), Some("left with shelter staff"));

    Ok(())
}

#[test]
fn rating_feeds_donor_average() -> anyhow::Result<()> {
    let h = harness("rating.db")?;
    let donor = Actor::donor(user());
    let ngo = Actor::ngo(user());
    let volunteer = Actor::volunteer(user());

    let mut delivered = vec![];
    for _ in 0..2 {
        let listing = h.service.create_listing(&donor, draft(t0(), TimeDelta::hours(4)))?;
        h.service.claim(&listing.id, &ngo)?;
        h.service
            .assign_volunteer(&listing.id, &volunteer, &volunteer.id)?;
        h.service.confirm_pickup(&listing.id, &volunteer, None)?;
        let listing =
            h.service
                .confirm_delivery(&listing.id, &volunteer, DeliveryProof::new("Jane"))?;
        delivered.push(listing.id);
    }

    assert!(matches!(
        h.service.rate(&delivered[0], &Actor::ngo(user()), 5, None),
        Err(LifecycleError::Forbidden(_))
    ));
    assert!(matches!(
        h.service.rate(&delivered[0], &ngo, 6, None),
        Err(LifecycleError::Validation(_))
    ));

    h.service
        .rate(&delivered[0], &ngo, 5, Some("fresh and well packed".into()))?;
    h.service.rate(&delivered[1], &ngo, 4, None)?;
    assert!(matches!(
        h.service.rate(&delivered[1], &ngo, 1, None),
        Err(LifecycleError::Validation(_))
    ));

    assert_eq!(h.query.average_rating(&donor.id)?, Some(4.5));
    assert_eq!(h.query.average_rating(&ngo.id)?, None);

    Ok(())
}

#[test]
fn projections_serve_each_dashboard() -> anyhow::Result<()> {
    let h = harness("projections.db")?;
    let donor = Actor::donor(user());
    let other_donor = Actor::donor(user());
    let ngo = Actor::ngo(user());
    let volunteer = Actor::volunteer(user());

    let first = h.service.create_listing(&donor, draft(t0(), TimeDelta::hours(6)))?;
    h.clock.advance(TimeDelta::minutes(5));
    let second = h.service.create_listing(&donor, draft(t0(), TimeDelta::hours(3)))?;
    let theirs = h
        .service
        .create_listing(&other_donor, draft(t0(), TimeDelta::hours(5)))?;

    let mine = h.query.by_donor(&donor.id)?;
    assert_eq!(
        mine.iter().map(|l| l.id.as_str()).collect::<Vec<_>>(),
        vec![second.id.as_str(), first.id.as_str()]
    );

    let feed = h.query.available_for_claiming(None)?;
    assert_eq!(
        feed.iter().map(|l| l.id.as_str()).collect::<Vec<_>>(),
        vec![second.id.as_str(), theirs.id.as_str(), first.id.as_str()]
    );

    h.service.claim(&first.id, &ngo)?;
    h.service
        .assign_volunteer(&first.id, &Actor::system(), &volunteer.id)?;
    h.service
        .cancel(&theirs.id, &other_donor, CancelReason::Consumed, None)?;

    assert_eq!(h.query.claimed_by(&ngo.id)?.len(), 1);
    assert_eq!(h.query.assigned_to(&volunteer.id)?[0].id, first.id);
    assert_eq!(h.query.cancelled_within(7)?.len(), 1);

    h.clock.advance(TimeDelta::days(8));
    assert!(h.query.cancelled_within(7)?.is_empty());

    let counts = h.query.status_counts()?;
    assert_eq!(counts[&ListingStatus::Cancelled], 1);
    // both remaining listings are past best before by now
    assert_eq!(counts[&ListingStatus::Expired], 2);
    assert_eq!(counts[&ListingStatus::Available], 0);

    let recent = h.query.recent_activity(2)?;
    assert_eq!(recent[0].record.action, ActivityAction::ListingCancelled);
    assert_eq!(recent[1].record.action, ActivityAction::VolunteerAssigned);

    h.db.flush()?;
    Ok(())
}

#[test]
fn unknown_listing_is_not_found() -> anyhow::Result<()> {
    let h = harness("not_found.db")?;

    let result = h.service.claim("listing1missing", &Actor::ngo(user()));
    assert!(matches!(result, Err(LifecycleError::NotFound(_))));
    assert!(matches!(
        h.service.expire("listing1missing"),
        Err(LifecycleError::NotFound(_))
    ));

    Ok(())
}

#[test]
fn only_donors_create_listings() -> anyhow::Result<()> {
    let h = harness("create_auth.db")?;

    let result = h
        .service
        .create_listing(&Actor::ngo(user()), draft(t0(), TimeDelta::hours(4)));
    assert!(matches!(result, Err(LifecycleError::Forbidden(_))));

    let stale = h.service.create_listing(
        &Actor::donor(user()),
        draft(t0() - TimeDelta::hours(6), TimeDelta::hours(2)),
    );
    assert!(matches!(stale, Err(LifecycleError::Validation(_))));

    Ok(())
}

#[test]
fn cancelled_window_is_bounded_by_the_calendar() -> anyhow::Result<()> {
    let h = harness("cancelled_window.db")?;
    let donor = Actor::donor(user());

    let listing = h.service.create_listing(&donor, draft(t0(), TimeDelta::hours(4)))?;
    h.service
        .cancel(&listing.id, &donor, CancelReason::Error, None)?;
    h.clock.advance(TimeDelta::days(30));

    assert!(h.query.cancelled_within(7)?.is_empty());
    assert_eq!(h.query.cancelled_within(30)?.len(), 1);
    // windows reaching past the earliest representable instant cover everything
    assert_eq!(h.query.cancelled_within(200_000_000)?.len(), 1);
    assert_eq!(h.query.cancelled_within(i64::MAX)?.len(), 1);
    assert!(matches!(
        h.query.cancelled_within(-1),
        Err(LifecycleError::Validation(_))
    ));

    Ok(())
}
