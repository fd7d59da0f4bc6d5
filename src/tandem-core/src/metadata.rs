//! Opaque JSON metadata attached to resources.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key holding the human readable title.
pub const TITLE_KEY: &str = "title";
/// Number of tracks inside a multi-track container.
pub const NUM_SUB_RESOURCES_KEY: &str = "num_sub_resources";
/// Index of the first track inside a multi-track container.
pub const MIN_SUB_RESOURCE_INDEX_KEY: &str = "min_sub_resource_index";

/// Opaque structured metadata for a resource.
///
/// The core only requires an object at the top level. Absent metadata is the
/// empty object, never `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub struct Metadata(Value);

impl Default for Metadata {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Value> for Metadata {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::empty(),
            other => Self(other),
        }
    }
}

impl From<Metadata> for Value {
    fn from(metadata: Metadata) -> Self {
        metadata.0
    }
}

impl Metadata {
    pub fn empty() -> Self {
        Self(Value::Object(Map::new()))
    }

    pub fn parse_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<Value>(text).map(Self::from)
    }

    pub fn to_json_string(&self) -> String {
        self.0.to_string()
    }

    pub fn is_valid(&self) -> bool {
        self.0.is_object()
    }

    pub fn is_empty(&self) -> bool {
        self.0.as_object().map_or(true, Map::is_empty)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Set a top-level key. Returns false if the metadata is not an object.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> bool {
        match self.0.as_object_mut() {
            Some(object) => {
                object.insert(key.into(), value.into());
                true
            }
            None => false,
        }
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn title(&self) -> Option<&str> {
        self.str_field(TITLE_KEY)
    }

    pub fn num_sub_resources(&self) -> Option<u64> {
        self.get(NUM_SUB_RESOURCES_KEY).and_then(Value::as_u64)
    }

    pub fn min_sub_resource_index(&self) -> u64 {
        self.get(MIN_SUB_RESOURCE_INDEX_KEY)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }
}
