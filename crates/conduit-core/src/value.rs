use std::collections::BTreeMap;

/// The self-describing value model carried by every message payload.
///
/// `Value` is the universal currency of the protocol (§6): arguments, return
/// values, signal payloads and the structured descriptors attached to
/// remote exceptions are all expressed in terms of it. Instrument-specific
/// types that do not fit here must be lowered to a [`Value::Record`] at the
/// service boundary — the runtime itself never needs to know more than this
/// closed set of kinds.
///
/// Map keys are `String` and stored in a [`BTreeMap`] rather than a
/// `HashMap` so that the canonical encoding (§6) is deterministic across
/// processes: two equal maps always encode to the same bytes regardless of
/// insertion order.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// A named record: a tag plus a field map. Used for remote-exception
    /// descriptors and the handshake frame, and available generally for
    /// instrument-specific structured data.
    Record { tag: String, fields: BTreeMap<String, Value> },
    /// Seconds and nanoseconds since the Unix epoch.
    Timestamp { secs: i64, nanos: u32 },
}

impl Value {
    pub fn record(tag: impl Into<String>, fields: BTreeMap<String, Value>) -> Self {
        Value::Record { tag: tag.into(), fields }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<(&str, &BTreeMap<String, Value>)> {
        match self {
            Value::Record { tag, fields } => Some((tag.as_str(), fields)),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}
