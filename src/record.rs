// ABOUTME: Record - one business entity with an id and flat string fields
// ABOUTME: Serialized as a flat JSON object; non-string JSON values are stringified on ingest

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(flatten)]
    pub fields: BTreeMap<String, String>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    /// Field value, or the empty string when the field is absent.
    pub fn get(&self, name: &str) -> &str {
        if name == "id" {
            return &self.id;
        }
        self.fields.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        if name == "id" {
            self.id = value.into();
        } else {
            self.fields.insert(name.to_string(), value.into());
        }
    }

    /// Build a record from an arbitrary JSON object.
    pub fn from_json(value: Value) -> Result<Self> {
        let Value::Object(map) = value else {
            bail!("record must be a JSON object");
        };
        let mut fields = flatten_strings(map);
        let id = fields
            .remove("id")
            .filter(|id| !id.is_empty())
            .context("record is missing a non-empty \"id\" field")?;
        Ok(Self { id, fields })
    }

    /// Build a record from a header row and a value row.
    pub fn from_row(header: &[String], row: &[String]) -> Result<Self> {
        let mut record = None;
        let mut fields = BTreeMap::new();
        for (name, value) in header.iter().zip(row.iter()) {
            if name == "id" {
                record = Some(value.clone());
            } else {
                fields.insert(name.clone(), value.clone());
            }
        }
        let id = record.context("result row has no \"id\" column")?;
        Ok(Self { id, fields })
    }

    /// Column names of this record with `id` first.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        std::iter::once("id").chain(self.fields.keys().map(String::as_str))
    }
}

/// Flatten a JSON object's values into strings. `null` becomes empty,
/// booleans and numbers use their JSON text, nested values are kept as JSON.
pub fn flatten_strings(map: Map<String, Value>) -> BTreeMap<String, String> {
    map.into_iter()
        .map(|(k, v)| {
            let text = match v {
                Value::Null => String::new(),
                Value::String(s) => s,
                other => other.to_string(),
            };
            (k, text)
        })
        .collect()
}

/// Parse newline-delimited JSON records. Blank lines are ignored.
pub fn parse_json_lines(text: &str) -> Result<Vec<Record>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            let value: Value = serde_json::from_str(line)
                .with_context(|| format!("invalid JSON on line {}", n + 1))?;
            Record::from_json(value).with_context(|| format!("invalid record on line {}", n + 1))
        })
        .collect()
}

pub fn to_json_lines(records: &[Record]) -> Result<String> {
    let mut out = String::new();
    for record in records {
        out.push_str(&serde_json::to_string(record).context("Failed to serialize record")?);
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_json_stringifies_values() {
        let record = Record::from_json(json!({
            "id": "1000",
            "name": "Acme",
            "level": 2,
            "active": true,
            "parentid": null
        }))
        .unwrap();
        assert_eq!(record.id, "1000");
        assert_eq!(record.get("level"), "2");
        assert_eq!(record.get("active"), "true");
        assert_eq!(record.get("parentid"), "");
        assert_eq!(record.get("missing"), "");
    }

    #[test]
    fn from_json_requires_id() {
        assert!(Record::from_json(json!({"name": "x"})).is_err());
        assert!(Record::from_json(json!({"id": ""})).is_err());
        assert!(Record::from_json(json!(["id"])).is_err());
    }

    #[test]
    fn serializes_flat() {
        let record = Record::new("7").with("name", "Seven");
        let text = serde_json::to_string(&record).unwrap();
        assert_eq!(text, r#"{"id":"7","name":"Seven"}"#);
        let back: Record = serde_json::from_str(&text).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn json_lines_skip_blank_and_report_line() {
        let records = parse_json_lines("{\"id\":\"a\"}\n\n{\"id\":\"b\"}\n").unwrap();
        assert_eq!(records.len(), 2);
        let err = parse_json_lines("{\"id\":\"a\"}\nnot json\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn from_row_maps_header() {
        let header = vec!["id".to_string(), "name".to_string()];
        let row = vec!["9".to_string(), "Nine".to_string()];
        let record = Record::from_row(&header, &row).unwrap();
        assert_eq!(record.id, "9");
        assert_eq!(record.get("name"), "Nine");
        assert_eq!(record.columns().collect::<Vec<_>>(), vec!["id", "name"]);
    }
}
