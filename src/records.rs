//! Record model for the remote record store.
//!
//! Records travel as JSON: a `fields` map of `{ "value": ..., "type": ... }`
//! entries, a record type, and an opaque change tag the store rotates on
//! every successful write. A record lives in a zone that is either private
//! to the caller or shared with explicit grantees; the zone is fixed once a
//! record has been fetched.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::StoreError;
use crate::session::Identity;

/// Databases exposed by the store. Picks the URL segment for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Database {
    Public,
    Private,
    Shared,
}

impl Database {
    pub fn as_str(&self) -> &'static str {
        match self {
            Database::Public => "public",
            Database::Private => "private",
            Database::Shared => "shared",
        }
    }
}

impl fmt::Display for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A partition within a database. `owner` is set for shared zones and
/// absent for the caller's own private zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneRef {
    pub zone_name: String,
    pub owner: Option<Identity>,
}

impl ZoneRef {
    pub fn private(zone_name: impl Into<String>) -> Self {
        Self { zone_name: zone_name.into(), owner: None }
    }

    pub fn shared(zone_name: impl Into<String>, owner: Identity) -> Self {
        Self { zone_name: zone_name.into(), owner: Some(owner) }
    }

    /// The implicit default zone of the public database.
    pub fn default_zone() -> Self {
        Self::private("_defaultZone")
    }

    pub(crate) fn to_wire(&self) -> Value {
        match &self.owner {
            Some(owner) => json!({
                "zoneName": self.zone_name,
                "ownerRecordName": owner.0,
            }),
            None => json!({ "zoneName": self.zone_name }),
        }
    }

    pub(crate) fn from_wire(value: &Value) -> Option<Self> {
        let zone_name = value.get("zoneName")?.as_str()?.to_string();
        let owner = value
            .get("ownerRecordName")
            .and_then(Value::as_str)
            .map(|o| Identity(o.to_string()));
        Some(Self { zone_name, owner })
    }
}

impl fmt::Display for ZoneRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.owner {
            Some(owner) => write!(f, "{}@{}", self.zone_name, owner.0),
            None => f.write_str(&self.zone_name),
        }
    }
}

/// A single typed field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Int(i64),
    Double(f64),
    /// Millisecond epoch timestamp.
    Timestamp(i64),
    /// Reference to another record by name.
    Reference { record_name: String },
}

impl FieldValue {
    pub fn reference(record_name: impl Into<String>) -> Self {
        FieldValue::Reference { record_name: record_name.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(n) | FieldValue::Timestamp(n) => Some(*n),
            _ => None,
        }
    }

    pub(crate) fn to_wire(&self) -> Value {
        match self {
            FieldValue::Text(s) => json!({ "value": s }),
            FieldValue::Int(n) => json!({ "value": n }),
            FieldValue::Double(x) => json!({ "value": x }),
            FieldValue::Timestamp(ms) => json!({ "value": ms, "type": "TIMESTAMP" }),
            FieldValue::Reference { record_name } => json!({
                "value": { "recordName": record_name, "action": "NONE" }
            }),
        }
    }

    pub(crate) fn from_wire(value: &Value) -> Option<Self> {
        let inner = value.get("value")?;
        if value.get("type").and_then(Value::as_str) == Some("TIMESTAMP") {
            return inner.as_i64().map(FieldValue::Timestamp);
        }
        match inner {
            Value::String(s) => Some(FieldValue::Text(s.clone())),
            Value::Number(n) => n
                .as_i64()
                .map(FieldValue::Int)
                .or_else(|| n.as_f64().map(FieldValue::Double)),
            Value::Object(o) => o
                .get("recordName")
                .and_then(Value::as_str)
                .map(|rn| FieldValue::Reference { record_name: rn.to_string() }),
            _ => None,
        }
    }
}

/// A record with optimistic-concurrency metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub record_type: String,
    pub record_name: String,
    pub fields: BTreeMap<String, FieldValue>,
    /// Opaque token the store rotates on every write. `None` means the
    /// record does not exist on the server yet.
    pub change_tag: Option<String>,
    pub zone: ZoneRef,
}

impl Record {
    pub fn new(
        record_type: impl Into<String>,
        record_name: impl Into<String>,
        zone: ZoneRef,
    ) -> Self {
        Self {
            record_type: record_type.into(),
            record_name: record_name.into(),
            fields: BTreeMap::new(),
            change_tag: None,
            zone,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn text_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(FieldValue::as_text)
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    pub(crate) fn fields_to_wire(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (name, value) in &self.fields {
            map.insert(name.clone(), value.to_wire());
        }
        Value::Object(map)
    }

    /// Parse a record entry out of a query/lookup/modify response.
    ///
    /// Entries carrying a `serverErrorCode` are rejections, not records;
    /// the caller decides what each code means for its operation.
    pub(crate) fn from_wire(value: &Value, fallback_zone: &ZoneRef) -> Result<Self, StoreError> {
        if let Some(code) = value.get("serverErrorCode").and_then(Value::as_str) {
            let server_tag = value
                .pointer("/serverRecord/recordChangeTag")
                .and_then(Value::as_str)
                .map(str::to_string);
            if code == "CONFLICT" {
                return Err(StoreError::Conflict { server_tag });
            }
            return Err(StoreError::Rejected { code: code.to_string() });
        }

        let record_name = value
            .get("recordName")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::Decode("record entry without recordName".to_string()))?
            .to_string();
        let record_type = value
            .get("recordType")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let change_tag = value
            .get("recordChangeTag")
            .and_then(Value::as_str)
            .map(str::to_string);
        let zone = value
            .get("zoneID")
            .and_then(ZoneRef::from_wire)
            .unwrap_or_else(|| fallback_zone.clone());

        let mut fields = BTreeMap::new();
        if let Some(Value::Object(map)) = value.get("fields") {
            for (name, raw) in map {
                if let Some(parsed) = FieldValue::from_wire(raw) {
                    fields.insert(name.clone(), parsed);
                }
            }
        }

        Ok(Self { record_type, record_name, fields, change_tag, zone })
    }
}

/// An EQUALS filter on a single field.
#[derive(Debug, Clone)]
pub struct Filter {
    pub field_name: String,
    pub value: FieldValue,
}

impl Filter {
    pub fn text(field_name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { field_name: field_name.into(), value: FieldValue::Text(value.into()) }
    }

    pub fn reference(field_name: impl Into<String>, record_name: impl Into<String>) -> Self {
        Self { field_name: field_name.into(), value: FieldValue::reference(record_name) }
    }

    pub(crate) fn to_wire(&self) -> Value {
        let mut wire = json!({
            "comparator": "EQUALS",
            "fieldName": self.field_name,
        });
        wire["fieldValue"] = match &self.value {
            FieldValue::Text(s) => json!({ "value": s, "type": "STRING" }),
            other => other.to_wire(),
        };
        wire
    }
}

/// Sort descriptor for queries.
#[derive(Debug, Clone)]
pub struct Sort {
    pub field_name: String,
    pub ascending: bool,
}

impl Sort {
    pub fn asc(field_name: impl Into<String>) -> Self {
        Self { field_name: field_name.into(), ascending: true }
    }

    pub fn desc(field_name: impl Into<String>) -> Self {
        Self { field_name: field_name.into(), ascending: false }
    }

    pub(crate) fn to_wire(&self) -> Value {
        json!({ "fieldName": self.field_name, "ascending": self.ascending })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_value_wire_round_trip() {
        let cases = vec![
            FieldValue::Text("hello".to_string()),
            FieldValue::Int(42),
            FieldValue::Timestamp(1_700_000_000_000),
            FieldValue::reference("rec-1"),
        ];
        for case in cases {
            let parsed = FieldValue::from_wire(&case.to_wire()).unwrap();
            assert_eq!(parsed, case);
        }
    }

    #[test]
    fn record_from_wire_reads_zone_and_tag() {
        let wire = serde_json::json!({
            "recordName": "crew-1",
            "recordType": "CrewMember",
            "recordChangeTag": "tag-a",
            "zoneID": { "zoneName": "TourCalZone", "ownerRecordName": "_owner9" },
            "fields": {
                "name": { "value": "Sam" },
                "order": { "value": 3 }
            }
        });

        let record = Record::from_wire(&wire, &ZoneRef::private("TourCalZone")).unwrap();
        assert_eq!(record.record_name, "crew-1");
        assert_eq!(record.change_tag.as_deref(), Some("tag-a"));
        assert_eq!(record.zone.owner.as_ref().map(|o| o.0.as_str()), Some("_owner9"));
        assert_eq!(record.text_field("name"), Some("Sam"));
        assert_eq!(record.field("order").and_then(FieldValue::as_i64), Some(3));
    }

    #[test]
    fn conflict_entry_becomes_conflict_error() {
        let wire = serde_json::json!({
            "recordName": "crew-1",
            "serverErrorCode": "CONFLICT",
            "serverRecord": { "recordChangeTag": "tag-server" }
        });

        match Record::from_wire(&wire, &ZoneRef::private("TourCalZone")) {
            Err(StoreError::Conflict { server_tag }) => {
                assert_eq!(server_tag.as_deref(), Some("tag-server"));
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }
}
