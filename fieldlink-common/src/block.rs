use chrono::{DateTime, Local, SecondsFormat};
use serde::{Deserialize, Serialize};

/// Line that opens a block on the sensor-terminal stream.
pub const START_MARKER: &str = "START_DATA";

/// Line that closes a block on the sensor-terminal stream.
pub const END_MARKER: &str = "END_DATA";

/// Key of the terminal's own clock field, which is never forwarded.
pub const DEVICE_TIMESTAMP_KEY: &str = "TIMESTAMP";

/// Key of the timestamp the bridge stamps on every block.
pub const BRIDGE_TIMESTAMP_KEY: &str = "RPI_TIMESTAMP";

/// A single `KEY:value[ unit]` reading inside a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Field name as sent by the terminal (e.g. `TEMP`).
    pub key: String,

    /// Everything after the first colon, trimmed (e.g. `21.5 C`).
    pub value: String,
}

impl Entry {
    /// Create an entry from its parts.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Parse a `KEY:value` line.
    ///
    /// Only the first colon separates key from value, so values such as
    /// `12:30:00` survive intact. Returns `None` when the line has no colon
    /// or an empty key.
    pub fn parse(line: &str) -> Option<Self> {
        let (key, value) = line.split_once(':')?;
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        Some(Self::new(key, value.trim()))
    }

    /// The synthetic timestamp entry injected at block start.
    pub fn bridge_timestamp(at: DateTime<Local>) -> Self {
        Self::new(
            BRIDGE_TIMESTAMP_KEY,
            at.to_rfc3339_opts(SecondsFormat::Micros, false),
        )
    }

    /// Whether this is the terminal's own timestamp field.
    pub fn is_device_timestamp(&self) -> bool {
        self.key == DEVICE_TIMESTAMP_KEY
    }

    /// Interpret the value for structured consumers.
    pub fn field_value(&self) -> FieldValue {
        FieldValue::parse(&self.value)
    }
}

impl std::fmt::Display for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.key, self.value)
    }
}

/// Typed interpretation of an entry value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FieldValue {
    /// Whole number reading.
    Integer(i64),

    /// Decimal reading.
    Float(f64),

    /// Anything that is not a plain number, kept verbatim with its unit.
    Text(String),
}

impl FieldValue {
    /// Parse a `value[ unit]` string.
    ///
    /// The first whitespace-separated token is read as a float when it
    /// contains a `.`, as an integer otherwise. When that fails, or the
    /// float is not finite, the whole value is kept as text.
    pub fn parse(value: &str) -> Self {
        let token = value.split_whitespace().next().unwrap_or("");

        if token.contains('.') {
            if let Ok(f) = token.parse::<f64>() {
                if f.is_finite() {
                    return FieldValue::Float(f);
                }
            }
        } else if let Ok(i) = token.parse::<i64>() {
            return FieldValue::Integer(i);
        }

        FieldValue::Text(value.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<FieldValue> for serde_json::Value {
    fn from(v: FieldValue) -> Self {
        match v {
            FieldValue::Integer(i) => serde_json::Value::from(i),
            FieldValue::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or_else(|| serde_json::Value::String(f.to_string())),
            FieldValue::Text(s) => serde_json::Value::String(s),
        }
    }
}

/// One complete reading from the sensor terminal.
///
/// Blocks are built by the assembler and never modified afterwards; the
/// first entry is always the bridge timestamp.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataBlock {
    entries: Vec<Entry>,
    started_at: DateTime<Local>,
}

impl DataBlock {
    /// Create a block from its entries and the instant its start marker arrived.
    pub fn new(entries: Vec<Entry>, started_at: DateTime<Local>) -> Self {
        Self {
            entries,
            started_at,
        }
    }

    /// Entries in arrival order.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Number of entries, including the bridge timestamp.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the block has no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// When the start marker of this block was received.
    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// Look up the first entry with the given key.
    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.key == key)
    }

    /// Render the block as a flat JSON object with lower-cased keys.
    ///
    /// Later duplicates of a key overwrite earlier ones.
    pub fn field_map(&self) -> serde_json::Map<String, serde_json::Value> {
        self.entries
            .iter()
            .map(|e| (e.key.to_lowercase(), e.field_value().into()))
            .collect()
    }
}
