//! # Cove (Sandbox Control Plane)
//!
//! `cove` manages organizations, their members and the consumable resource
//! quotas (sandboxes, snapshots, volumes) they hold across regions.
//!
//! ## Tenant Model
//!
//! Organizations are the tenant boundary. Each organization owns members with
//! roles and a set of per-region quotas for each resource type.
//!
//! ## Quota Enforcement
//!
//! Capacity decisions are taken by [`quota::QuotaEnforcer`]: every
//! reservation acquires a [`quota::DistributedLock`] keyed per
//! (organization, region, resource type) so that concurrent API server
//! instances never over-provision a shared limit. The lock lives in a shared
//! store with expiring keys; TTL expiry keeps the system live when a holder
//! crashes mid-section.

pub mod api;
pub mod cli;
pub mod duration;
pub mod organization;
pub mod quota;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
