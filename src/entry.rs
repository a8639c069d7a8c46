//! Record types shared between the logs, the wire protocol and the views.

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display};
use std::time::SystemTime;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identifies one writer's segment of a multi-writer log.
///
/// Generated once per log and node, persisted alongside the log itself.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WriterId([u8; 32]);

impl WriterId {
    /// Generates a fresh random writer id.
    pub fn generate<R: rand::Rng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill(&mut bytes);
        WriterId(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        WriterId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 10 hex chars, for log output.
    pub fn fmt_short(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0)[..10].to_string()
    }
}

impl Debug for WriterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WriterId({})", self.fmt_short())
    }
}

impl Display for WriterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", data_encoding::HEXLOWER.encode(&self.0))
    }
}

/// A monotonic timestamp as emitted by a writer.
///
/// Writers emit either a plain millisecond number or a decimal-encoded string
/// such as `"1700000000000.003"` where the fraction disambiguates writes
/// within the same millisecond. Ordering and storage always use the integer
/// millisecond component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Stamp {
    Number(f64),
    Text(String),
}

impl Stamp {
    /// The integer millisecond component, or `None` if the stamp is garbage.
    pub fn millis(&self) -> Option<u64> {
        match self {
            Stamp::Number(n) => {
                if n.is_finite() && *n >= 0.0 {
                    Some(n.trunc() as u64)
                } else {
                    None
                }
            }
            Stamp::Text(s) => {
                let whole = s.split('.').next().unwrap_or("");
                whole.parse::<u64>().ok()
            }
        }
    }
}

impl From<u64> for Stamp {
    fn from(millis: u64) -> Self {
        Stamp::Number(millis as f64)
    }
}

/// Per-well measurement inside a [`QpcrResult`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Well {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwabTube {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_barcode: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barcode: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QpcrResult {
    #[serde(rename = "plateID", default, skip_serializing_if = "Option::is_none")]
    pub plate_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plate_barcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eds_file_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wells: Option<BTreeMap<String, Well>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Type-discriminated payload of an [`Object`].
///
/// Field presence is deliberately loose here; the validators decide which
/// entries each view accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Kind {
    SwabTube(SwabTube),
    Plate(Plate),
    QpcrResult(QpcrResult),
    User(User),
}

impl Kind {
    /// The physical barcode carried by this object, if its type has one.
    pub fn barcode(&self) -> Option<&str> {
        match self {
            Kind::SwabTube(t) => t.barcode.as_deref(),
            Kind::Plate(p) => p.barcode.as_deref(),
            Kind::QpcrResult(_) | Kind::User(_) => None,
        }
    }
}

/// A logical record as written into a log.
///
/// `id` is assigned once at creation and never reassigned; logical updates
/// are new entries with the same `id`. `changed` maps a renamed indexed
/// field to its previous value so secondary indexes can drop the stale key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Object {
    pub id: String,
    pub created_at: Stamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    /// Wall-clock millis when this node first applied the entry. Stamped
    /// locally by the views, never part of the original write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronized_at: Option<u64>,
    /// Set by the time index's mark-synced operation once the row has been
    /// reported upstream. Not part of the original write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uplink_synced: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(flatten)]
    pub kind: Kind,
}

impl Object {
    /// The previous value of a renamed field, if this entry renames it.
    pub fn changed_field(&self, field: &str) -> Option<&str> {
        self.changed
            .as_ref()
            .and_then(|c| c.get(field))
            .and_then(|v| v.as_str())
    }
}

/// One immutable entry of a per-writer log segment.
///
/// The payload is kept as raw JSON bytes so the node stores and relays
/// records it cannot parse; views deserialize on their own and silently
/// drop anything undecodable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub writer: WriterId,
    pub seq: u64,
    pub value: Bytes,
}

/// A [`LogEntry`] after it has been merged into the local log.
#[derive(Debug, Clone)]
pub struct MergedEntry {
    pub entry: LogEntry,
    /// Position in the local merge order.
    pub arrival: u64,
    /// Wall-clock millis at first local application, persisted with the
    /// arrival record so that replays see the same value.
    pub received_at: u64,
}

impl MergedEntry {
    /// Deserializes the payload, or `None` if it is not a known object.
    pub fn object(&self) -> Option<Object> {
        serde_json::from_slice(&self.entry.value).ok()
    }
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_millis() {
        assert_eq!(Stamp::Number(1700000000000.0).millis(), Some(1700000000000));
        assert_eq!(
            Stamp::Text("1700000000000.003".into()).millis(),
            Some(1700000000000)
        );
        assert_eq!(Stamp::Text("1700000000000".into()).millis(), Some(1700000000000));
        assert_eq!(Stamp::Text("bogus".into()).millis(), None);
        assert_eq!(Stamp::Number(f64::NAN).millis(), None);
    }

    #[test]
    fn object_json_shape() {
        let json = r#"{
            "id": "3b241101-e2bb-4255-8caf-4136c566a962",
            "type": "swabTube",
            "createdAt": "1700000000000.001",
            "barcode": "tube-1",
            "formBarcode": "form-1",
            "changed": {"formBarcode": "form-0"}
        }"#;
        let obj: Object = serde_json::from_str(json).unwrap();
        assert_eq!(obj.created_at.millis(), Some(1700000000000));
        match &obj.kind {
            Kind::SwabTube(tube) => {
                assert_eq!(tube.barcode.as_deref(), Some("tube-1"));
                assert_eq!(tube.form_barcode.as_deref(), Some("form-1"));
            }
            other => panic!("wrong kind: {other:?}"),
        }
        assert_eq!(obj.changed_field("formBarcode"), Some("form-0"));

        // Round-trip keeps the discriminator and camelCase field names.
        let back = serde_json::to_value(&obj).unwrap();
        assert_eq!(back["type"], "swabTube");
        assert_eq!(back["formBarcode"], "form-1");
    }

    #[test]
    fn unknown_type_is_not_an_object() {
        let json = r#"{"id": "x", "type": "mystery", "createdAt": 1}"#;
        assert!(serde_json::from_str::<Object>(json).is_err());
    }
}
