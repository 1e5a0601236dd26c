// ABOUTME: Target payloads - turns records into the structured requests the HR system accepts
// ABOUTME: One builder per payload kind plus the lookup requests used for enrichment

use serde_json::{json, Map, Value};
use std::fmt;

use crate::hierarchy::{EntityGroup, PayloadKind};
use crate::record::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    AddUpdateOrganization,
    PutCostCenter,
    PutLocation,
    GetLocations,
    GetCostCenters,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::AddUpdateOrganization => "Add_Update_Organization",
            Operation::PutCostCenter => "Put_Cost_Center",
            Operation::PutLocation => "Put_Location",
            Operation::GetLocations => "Get_Locations",
            Operation::GetCostCenters => "Get_Cost_Centers",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn reference(id_type: &str, value: &str) -> Value {
    json!({ "ID": { "type": id_type, "value": value } })
}

/// Country region id, e.g. `US-IL`.
pub fn country_region_id(country: &str, region: &str) -> String {
    format!("{}-{}", country, region).to_uppercase()
}

/// Build the write request for a record. `today` is the availability date.
pub fn build(group: EntityGroup, record: &Record, today: &str) -> (Operation, Value) {
    match group.profile().payload {
        PayloadKind::Organization { org_type, subtype } => {
            (Operation::AddUpdateOrganization, organization(org_type, subtype, record, today))
        }
        PayloadKind::CostCenter => (Operation::PutCostCenter, cost_center(record, today)),
        PayloadKind::Site => (Operation::PutLocation, site(record)),
        PayloadKind::Building => (Operation::PutLocation, building(record)),
    }
}

fn organization(org_type: &str, subtype: &str, record: &Record, today: &str) -> Value {
    let mut fields = Map::new();
    let parent = record.get("parentid");
    if !parent.is_empty() {
        let key = if org_type == "Company" {
            "Container_Organization_Reference"
        } else {
            "Superior_Organization_Reference"
        };
        fields.insert(key.into(), reference("Organization_Reference_ID", parent));
    }
    let include_code = if org_type == "Company" { "true" } else { "false" };
    fields.insert("Include_Organization_Code_In_Name".into(), include_code.into());
    fields.insert("Organization_Reference_ID".into(), record.id.clone().into());
    fields.insert("Organization_Name".into(), record.get("name").into());
    fields.insert("Availability_Date".into(), today.into());
    fields.insert("Organization_Code".into(), record.id.clone().into());
    fields.insert(
        "Organization_Type_Reference".into(),
        json!({ "Organization_Type_Name": org_type }),
    );
    fields.insert(
        "Organization_Subtype_Reference".into(),
        json!({ "Organization_Subtype_Name": subtype }),
    );
    fields.insert(
        "Organization_Visibility_Reference".into(),
        json!({ "Organization_Visibility_Name": "Everyone" }),
    );
    Value::Object(fields)
}

fn cost_center(record: &Record, today: &str) -> Value {
    let mut fields = Map::new();
    let company = record.get("companycode");
    if !company.is_empty() {
        fields.insert(
            "Restricted_To_Company_or_Company_Hierarchy_Reference".into(),
            reference("Organization_Reference_ID", company),
        );
    }
    fields.insert(
        "Organization_Data".into(),
        json!({
            "ID": record.id,
            "Organization_Code": record.id,
            "Include_Organization_Code_in_Name": "true",
            "Organization_Name": record.get("name"),
            "Availability_Date": today,
            "Organization_Active": record.get("active_in_target"),
        }),
    );
    fields.insert(
        "Organization_Subtype_Reference".into(),
        reference("Organization_Subtype_ID", record.get("tdcindicator")),
    );
    fields.insert(
        "Organization_Container_Reference".into(),
        reference("Organization_Reference_ID", record.get("parentid")),
    );
    Value::Object(fields)
}

fn location_base(record: &Record) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("Location_Name".into(), record.get("name").into());
    fields.insert("Location_ID".into(), record.id.clone().into());
    fields.insert(
        "Location_Usage_Reference".into(),
        reference("Location_Usage_ID", record.get("location_usage_type")),
    );
    fields.insert(
        "Location_Type_Reference".into(),
        reference("Location_Type_ID", record.get("location_type_id")),
    );
    fields
}

fn building(record: &Record) -> Value {
    let mut fields = location_base(record);
    fields.insert("Inactive".into(), record.get("inactive_in_target").into());
    fields.insert(
        "Superior_Location_Reference".into(),
        reference("Location_ID", record.get("parentid")),
    );
    Value::Object(fields)
}

fn site(record: &Record) -> Value {
    let mut fields = location_base(record);
    fields.insert(
        "Location_Hierarchy_Reference".into(),
        reference("Organization_Reference_ID", record.get("parentid")),
    );
    fields.insert(
        "Time_Profile_Reference".into(),
        reference("Time_Profile_ID", record.get("time_profile_id")),
    );
    fields.insert(
        "Display_Language_Reference".into(),
        reference("User_Language_ID", record.get("user_language_id")),
    );

    let mut address = Map::new();
    address.insert(
        "Country_Reference".into(),
        reference("ISO_3166-1_Alpha-2_Code", record.get("country")),
    );
    let lines: Vec<Value> = ["address_line_1", "address_line_2"]
        .iter()
        .enumerate()
        .filter(|(_, f)| !record.get(f).is_empty())
        .map(|(i, f)| json!({ "Type": format!("Address_Line_{}", i + 1), "value": record.get(f) }))
        .collect();
    address.insert("Address_Line_Data".into(), Value::Array(lines));

    let municipality = record.get("municipality");
    if !municipality.is_empty() {
        address.insert("Municipality".into(), municipality.into());
    }
    let region = record.get("region");
    if !region.is_empty() {
        address.insert(
            "Country_Region_Reference".into(),
            reference(
                "Country_Region_ID",
                &country_region_id(record.get("country"), region),
            ),
        );
    }
    let postal = record.get("postal_code");
    if !postal.is_empty() {
        address.insert("Postal_Code".into(), postal.into());
    }
    address.insert(
        "Usage_Data".into(),
        json!({
            "Public": "true",
            "Type_Data": {
                "Primary": "true",
                "Type_Reference": { "ID": { "type": "Communication_Usage_Type_ID", "value": "BUSINESS" } }
            }
        }),
    );
    let city_sub = record.get("city_subdivision_1");
    if !city_sub.is_empty() {
        address.insert(
            "Submunicipality_Data".into(),
            json!([{ "Type": "CITY_SUBDIVISION_1", "value": city_sub }]),
        );
    }
    let region_sub = record.get("region_subdivision_1");
    if !region_sub.is_empty() {
        address.insert(
            "Subregion_Data".into(),
            json!([{ "Type": "REGION_SUBDIVISION_1", "value": region_sub }]),
        );
    }
    fields.insert(
        "Contact_Data".into(),
        json!({ "Address_Data": Value::Object(address) }),
    );
    Value::Object(fields)
}

/// Request for one location, used to read its inactive flag and time profile.
pub fn location_lookup(id: &str) -> (Operation, Value) {
    (
        Operation::GetLocations,
        json!({
            "Request_References": {
                "Skip_Non_Existing_Instances": "true",
                "Location_Reference": reference("Location_ID", id),
            },
            "Response_Group": {
                "Include_Reference": "true",
                "Include_Location_Data": "true",
            }
        }),
    )
}

/// Request for one cost center, used to read its active flag.
pub fn cost_center_lookup(id: &str) -> (Operation, Value) {
    (
        Operation::GetCostCenters,
        json!({
            "Request_References": {
                "Cost_Center_Reference": reference("Organization_Reference_ID", id),
            },
            "Response_Group": {
                "Include_Reference": "false",
                "Include_Cost_Center_Data": "true",
                "Include_Simple_Cost_Center_Data": "false",
            }
        }),
    )
}
