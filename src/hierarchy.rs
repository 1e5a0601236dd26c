// ABOUTME: EntityGroup registry - the closed set of synchronized hierarchies
// ABOUTME: Maps each group to its payload shape, enrichment lookup and validation needs

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityGroup {
    CompanyHierarchy,
    Company,
    CostCenterHierarchy,
    CostCenter,
    LocationHierarchy,
    Site,
    Building,
}

/// Shape of the payload sent to the target system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Add_Update_Organization with the given organization type and subtype.
    Organization {
        org_type: &'static str,
        subtype: &'static str,
    },
    CostCenter,
    Site,
    Building,
}

/// Lookup performed against the target before sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enrichment {
    None,
    /// Existing location: skip when inactive, otherwise reuse its time profile.
    SiteTimeProfile,
    /// Existing location: carry over its inactive flag.
    BuildingInactive,
    /// Existing cost center: carry over its active flag.
    CostCenterActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupProfile {
    pub payload: PayloadKind,
    pub enrichment: Enrichment,
    pub validates_address: bool,
    /// Records whose `status` is not `A` are skipped without sending.
    pub requires_active_status: bool,
}

impl EntityGroup {
    pub const ALL: [EntityGroup; 7] = [
        EntityGroup::CompanyHierarchy,
        EntityGroup::Company,
        EntityGroup::CostCenterHierarchy,
        EntityGroup::CostCenter,
        EntityGroup::LocationHierarchy,
        EntityGroup::Site,
        EntityGroup::Building,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityGroup::CompanyHierarchy => "company_hierarchy",
            EntityGroup::Company => "company",
            EntityGroup::CostCenterHierarchy => "cost_center_hierarchy",
            EntityGroup::CostCenter => "cost_center",
            EntityGroup::LocationHierarchy => "location_hierarchy",
            EntityGroup::Site => "site",
            EntityGroup::Building => "building",
        }
    }

    pub fn profile(&self) -> GroupProfile {
        let (payload, enrichment, validates_address) = match self {
            EntityGroup::CompanyHierarchy => (
                PayloadKind::Organization {
                    org_type: "Company Hierarchy",
                    subtype: "Company",
                },
                Enrichment::None,
                false,
            ),
            EntityGroup::Company => (
                PayloadKind::Organization {
                    org_type: "Company",
                    subtype: "Company",
                },
                Enrichment::None,
                false,
            ),
            EntityGroup::CostCenterHierarchy => (
                PayloadKind::Organization {
                    org_type: "Cost Center Hierarchy",
                    subtype: "Cost Center",
                },
                Enrichment::None,
                false,
            ),
            EntityGroup::LocationHierarchy => (
                PayloadKind::Organization {
                    org_type: "Location Hierarchy",
                    subtype: "Location",
                },
                Enrichment::None,
                false,
            ),
            EntityGroup::CostCenter => (PayloadKind::CostCenter, Enrichment::CostCenterActive, false),
            EntityGroup::Site => (PayloadKind::Site, Enrichment::SiteTimeProfile, true),
            EntityGroup::Building => (PayloadKind::Building, Enrichment::BuildingInactive, false),
        };
        GroupProfile {
            payload,
            enrichment,
            validates_address,
            requires_active_status: matches!(self, EntityGroup::Site),
        }
    }
}

impl fmt::Display for EntityGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityGroup {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        for group in EntityGroup::ALL {
            if group.as_str() == s {
                return Ok(group);
            }
        }
        bail!(
            "Unknown entity group '{}'. Expected one of: {}",
            s,
            EntityGroup::ALL
                .iter()
                .map(|g| g.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}
