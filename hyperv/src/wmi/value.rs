//! Provider-neutral property bag for WMI objects.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};

/// A WMI property value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    U16(u16),
    U32(u32),
    /// uint64 values travel as strings over COM; the transport converts.
    U64(u64),
    I32(i32),
    String(String),
    StringArray(Vec<String>),
    U16Array(Vec<u16>),
    /// Embedded instance (serialized by the transport).
    Instance(Box<WmiObject>),
    InstanceArray(Vec<WmiObject>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric view; string-encoded integers (uint64 over COM) are parsed.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U16(v) => Some(u64::from(*v)),
            Value::U32(v) => Some(u64::from(*v)),
            Value::U64(v) => Some(*v),
            Value::I32(v) => u64::try_from(*v).ok(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.as_u64().and_then(|v| u32::try_from(v).ok())
    }

    pub fn as_u16(&self) -> Option<u16> {
        self.as_u64().and_then(|v| u16::try_from(v).ok())
    }

    pub fn as_string_array(&self) -> Option<&[String]> {
        match self {
            Value::StringArray(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_u16_array(&self) -> Option<&[u16]> {
        match self {
            Value::U16Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&WmiObject> {
        match self {
            Value::Instance(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_instances(&self) -> Option<&[WmiObject]> {
        match self {
            Value::InstanceArray(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Literal form used in WQL `WHERE` clauses.
    pub(crate) fn to_wql(&self) -> String {
        match self {
            Value::Bool(true) => "TRUE".to_string(),
            Value::Bool(false) => "FALSE".to_string(),
            Value::U16(v) => v.to_string(),
            Value::U32(v) => v.to_string(),
            Value::U64(v) => v.to_string(),
            Value::I32(v) => v.to_string(),
            Value::String(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            _ => "NULL".to_string(),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::U16(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::U32(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::U64(v)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::StringArray(v)
    }
}

impl From<WmiObject> for Value {
    fn from(v: WmiObject) -> Self {
        Value::Instance(Box::new(v))
    }
}

impl From<Vec<WmiObject>> for Value {
    fn from(v: Vec<WmiObject>) -> Self {
        Value::InstanceArray(v)
    }
}

/// A WMI object: class name, optional object path and properties.
///
/// Objects read from the provider carry their `__PATH`. Properties set
/// locally are tracked so the transport writes back only what changed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WmiObject {
    class: String,
    path: Option<String>,
    properties: BTreeMap<String, Value>,
    modified: BTreeSet<String>,
}

impl WmiObject {
    /// New, unsaved instance of `class`.
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            ..Default::default()
        }
    }

    /// Object as read from the provider.
    pub fn from_provider(
        class: impl Into<String>,
        path: Option<String>,
        properties: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            class: class.into(),
            path,
            properties,
            modified: BTreeSet::new(),
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn require_path(&self) -> Result<&str> {
        self.path()
            .ok_or_else(|| Error::missing_property(&self.class, "__PATH"))
    }

    /// Property value; `Null` reads as absent.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name).filter(|v| !v.is_null())
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    pub fn get_u16(&self, name: &str) -> Option<u16> {
        self.get(name).and_then(Value::as_u16)
    }

    pub fn get_u32(&self, name: &str) -> Option<u32> {
        self.get(name).and_then(Value::as_u32)
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(Value::as_u64)
    }

    pub fn get_string_array(&self, name: &str) -> Option<&[String]> {
        self.get(name).and_then(Value::as_string_array)
    }

    pub fn require_str(&self, name: &str) -> Result<&str> {
        self.get_str(name)
            .ok_or_else(|| Error::missing_property(&self.class, name))
    }

    pub fn require_u16(&self, name: &str) -> Result<u16> {
        self.get_u16(name)
            .ok_or_else(|| Error::missing_property(&self.class, name))
    }

    /// Set a property and mark it modified.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        let name = name.into();
        self.modified.insert(name.clone());
        self.properties.insert(name, value.into());
        self
    }

    /// Builder form of [`set`](Self::set).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn properties(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Properties set since the object was read.
    pub fn modified(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.modified
            .iter()
            .filter_map(|name| self.properties.get(name).map(|v| (name.as_str(), v)))
    }

    pub fn is_modified(&self) -> bool {
        !self.modified.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uint64_strings_parse_as_numbers() {
        let v = Value::String("2048".into());
        assert_eq!(v.as_u64(), Some(2048));
        assert_eq!(v.as_u16(), Some(2048));
        assert_eq!(Value::U64(70_000).as_u16(), None);
    }

    #[test]
    fn null_reads_as_absent() {
        let mut props = BTreeMap::new();
        props.insert("ErrorDescription".to_string(), Value::Null);
        let obj = WmiObject::from_provider("Msvm_ConcreteJob", None, props);
        assert!(obj.get("ErrorDescription").is_none());
        assert!(obj.require_path().is_err());
    }

    #[test]
    fn set_tracks_modified_properties() {
        let mut props = BTreeMap::new();
        props.insert("VirtualQuantity".to_string(), Value::U64(1024));
        props.insert("Reservation".to_string(), Value::U64(1024));
        let mut obj = WmiObject::from_provider(
            "Msvm_MemorySettingData",
            Some("mem-path".into()),
            props,
        );
        assert!(!obj.is_modified());

        obj.set("VirtualQuantity", 2048u64);
        let modified: Vec<_> = obj.modified().collect();
        assert_eq!(modified, vec![("VirtualQuantity", &Value::U64(2048))]);
        assert_eq!(obj.get_u64("Reservation"), Some(1024));
    }

    #[test]
    fn wql_literals_escape_quotes() {
        assert_eq!(Value::from("O'Brien").to_wql(), r"'O\'Brien'");
        assert_eq!(Value::from(r"lab\web-01").to_wql(), r"'lab\\web-01'");
        assert_eq!(Value::from(true).to_wql(), "TRUE");
        assert_eq!(Value::from(3u16).to_wql(), "3");
    }
}
