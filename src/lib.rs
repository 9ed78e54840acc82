//! Listing lifecycle and expiry engine for a food donation marketplace.
//!
//! Donors publish surplus food as listings, NGOs reserve and claim them,
//! volunteers carry them to recipients. [`service::LifecycleService`] is the
//! only writer of listing status; [`query::ListingQuery`] serves read-only
//! projections. Both sit on the [`store::ListingStore`] and
//! [`activity::ActivitySink`] seams, with sled implementations provided.

pub mod activity;
pub mod actor;
pub mod config;
pub mod error;
pub mod listing;
pub mod query;
pub mod service;
pub mod store;
pub mod time_window;
pub mod utils;
