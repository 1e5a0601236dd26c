// ABOUTME: Record validation - per-country address rules with manual fixes for sites
// ABOUTME: Rules file maps ISO2 country codes to required address fields and fix instructions

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::hierarchy::EntityGroup;
use crate::record::Record;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Pass,
    Fail(String),
}

/// Validates, and may normalize, a record before it is sent.
pub trait RecordValidator: Send + Sync {
    fn validate(&self, group: EntityGroup, record: &mut Record) -> Validation;
}

/// Validator used when no rules are configured.
pub struct AcceptAll;

impl RecordValidator for AcceptAll {
    fn validate(&self, _group: EntityGroup, _record: &mut Record) -> Validation {
        Validation::Pass
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CountryRules {
    /// Rule-file names of the required fields, e.g. "Postal Code".
    pub required: Vec<String>,
    #[serde(default)]
    pub fixes: Vec<String>,
}

/// Record field name to the name used in the rules file.
const MAINTAINED_FIELDS: [(&str, &str); 7] = [
    ("address_line_1", "Address Line 1"),
    ("address_line_2", "Address Line 2"),
    ("municipality", "City"),
    ("postal_code", "Postal Code"),
    ("region", "Region"),
    ("city_subdivision_1", "City Subdivision 1"),
    ("region_subdivision_1", "Region Subdivision 1"),
];

#[derive(Debug, Clone, Default)]
pub struct AddressRules {
    countries: HashMap<String, CountryRules>,
}

impl AddressRules {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read address rules {:?}", path))?;
        Self::from_json(&contents).with_context(|| format!("Invalid address rules {:?}", path))
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let countries = serde_json::from_str(contents)?;
        Ok(Self { countries })
    }

    fn apply_fixes(record: &mut Record, fixes: &[String]) {
        let has = |fix: &str| fixes.iter().any(|f| f == fix);

        if has("copy address line 1 into address line 2") {
            let line = record.get("address_line_1").to_string();
            record.set("address_line_2", line);
        }
        if has("add city into region subdivision 1") {
            let city = record.get("municipality").to_string();
            record.set("region_subdivision_1", city);
        }
        if has("add city into city subdivision 1") {
            let city = record.get("municipality").to_string();
            record.set("city_subdivision_1", city);
        }
        if has("set country to 'US'") {
            record.set("country", "US");
        }
        if has("set region to 'PR'") {
            record.set("region", "PR");
        }
        // removals last
        if has("remove address line 1") {
            record.set("address_line_1", "");
        }
        if has("remove region") {
            record.set("region", "");
        }
        if has("remove city") {
            record.set("municipality", "");
        }
        if has("remove postal code") {
            record.set("postal_code", "");
        }
    }

    fn check_fields(record: &mut Record, required: &[String]) -> Validation {
        for (field, rule_name) in MAINTAINED_FIELDS {
            let is_required = required.iter().any(|r| r == rule_name);
            let is_empty = record.get(field).is_empty();
            if is_required && is_empty {
                return Validation::Fail(format!("Missing {} for Site: {}", field, record.id));
            }
            if !is_required && !is_empty {
                record.set(field, "");
            }
        }
        Validation::Pass
    }
}

impl RecordValidator for AddressRules {
    fn validate(&self, group: EntityGroup, record: &mut Record) -> Validation {
        if !group.profile().validates_address {
            return Validation::Pass;
        }
        let country = record.get("country").to_string();
        let Some(rules) = self.countries.get(&country) else {
            return Validation::Fail(format!(
                "No address rules for country '{}' (Site: {})",
                country, record.id
            ));
        };
        Self::apply_fixes(record, &rules.fixes);
        Self::check_fields(record, &rules.required)
    }
}
