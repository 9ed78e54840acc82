//! Identifier helpers

use bech32::Bech32m;
use uuid7::{Uuid, uuid7};

/// Human readable prefix for listing identifiers.
pub const LISTING_HRP: &str = "listing";
/// Human readable prefix for activity record identifiers.
pub const ACTIVITY_HRP: &str = "activity";
/// Human readable prefix for user identifiers.
pub const USER_HRP: &str = "user";

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    uuid_to_bech32(hrp, &uuid7())
}

pub fn uuid_to_bech32(hrp: &str, id: &Uuid) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, id.as_bytes())?;
    Ok(encode)
}
