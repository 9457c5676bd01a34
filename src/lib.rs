//! Reddit media downloader library.
//!
//! Downloads the media attached to Reddit posts while avoiding fetching the
//! same bytes twice. A durable identity index maps normalized URLs, ETags and
//! partial fingerprints to content hashes and local paths; each task climbs a
//! cheap-to-expensive dedup ladder before any full transfer, and failures are
//! kept in a ledger for a later retry pass.

pub mod config;
pub mod constants;
pub mod db;
pub mod fetch;
pub mod fingerprint;
pub mod index;
pub mod ledger;
pub mod normalize;
pub mod orchestrator;
pub mod rate_limiter;
pub mod scheduler;
pub mod task;
