//! Tenant domain types.
//!
//! Organizations are the tenant boundary: each owns members with roles and a
//! set of per-region quotas for the consumable resource types. Persistence of
//! these entities lives behind the traits in [`crate::quota::store`]; this
//! module only defines the shapes the quota subsystem operates on.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;
use uuid::Uuid;

use crate::duration::{parse_duration, DurationError};

/// Tenant entity owning resources and members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub created_by: Uuid,
    pub suspended: bool,
}

/// Role a member holds inside an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrganizationRole {
    Owner,
    Admin,
    Member,
}

/// Membership of a user in an organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationUser {
    pub organization_id: Uuid,
    pub user_id: Uuid,
    pub role: OrganizationRole,
}

/// Pending invitation to join an organization.
///
/// Lifecycle (accept/decline/revoke) is handled elsewhere; here the
/// invitation only exists so its expiry can be computed from the configured
/// duration string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationInvitation {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub email: String,
    pub role: OrganizationRole,
    pub expires_at: SystemTime,
}

impl OrganizationInvitation {
    /// Create an invitation expiring `expiry` (e.g. `"14d"`) from now.
    ///
    /// # Errors
    /// Returns `DurationError` when the expiry string is malformed.
    pub fn new(
        organization_id: Uuid,
        email: String,
        role: OrganizationRole,
        expiry: &str,
    ) -> Result<Self, DurationError> {
        let ttl = parse_duration(expiry)?;
        Ok(Self {
            id: Uuid::new_v4(),
            organization_id,
            email,
            role,
            expires_at: SystemTime::now() + ttl,
        })
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        SystemTime::now() >= self.expires_at
    }
}

/// A class of consumable capacity.
///
/// The string form is stable: it is used in lock keys and as the
/// `resource_type` column value, so it must be identical across processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Sandbox,
    Snapshot,
    Volume,
}

impl ResourceType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sandbox => "sandbox",
            Self::Snapshot => "snapshot",
            Self::Volume => "volume",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sandbox" => Ok(Self::Sandbox),
            "snapshot" => Ok(Self::Snapshot),
            "volume" => Ok(Self::Volume),
            other => Err(format!("unknown resource type: {other}")),
        }
    }
}

/// Configured capacity limit for one (organization, region, resource type).
///
/// Immutable during a reservation; only administrative updates change it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionQuota {
    pub organization_id: Uuid,
    pub region_id: String,
    pub resource_type: ResourceType,
    pub limit: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_resource_type_round_trip() {
        for rt in [
            ResourceType::Sandbox,
            ResourceType::Snapshot,
            ResourceType::Volume,
        ] {
            assert_eq!(rt.as_str().parse::<ResourceType>().unwrap(), rt);
        }
        assert!("floppy".parse::<ResourceType>().is_err());
    }

    #[test]
    fn test_invitation_expiry() {
        let org = Uuid::new_v4();
        let invitation = OrganizationInvitation::new(
            org,
            "dev@example.com".to_string(),
            OrganizationRole::Member,
            "14d",
        )
        .unwrap();

        assert_eq!(invitation.organization_id, org);
        assert!(!invitation.is_expired());

        let remaining = invitation
            .expires_at
            .duration_since(SystemTime::now())
            .unwrap();
        assert!(remaining > Duration::from_secs(13 * 24 * 3600));
        assert!(remaining <= Duration::from_secs(14 * 24 * 3600));
    }

    #[test]
    fn test_invitation_rejects_bad_expiry() {
        let err = OrganizationInvitation::new(
            Uuid::new_v4(),
            "dev@example.com".to_string(),
            OrganizationRole::Member,
            "fortnight",
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid duration format"));
    }
}
