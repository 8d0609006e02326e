//! Typed property bags attached to entities.
//!
//! A [`Property`] is an immutable tagged value; [`Properties`] is the map of
//! them carried alongside an entity. Values round-trip through a JSON wire
//! structure whose only numeric type is `double`, so 64-bit integers are
//! wrapped in a tagged object under the reserved `minder.internal.` prefix:
//!
//! ```json
//! {"minder.internal.type": "int64", "minder.internal.value": "-42"}
//! ```
//!
//! The reserved prefix may never appear as a key in user-supplied property
//! maps; constructors fail closed with [`PropertyError::ReservedKey`].

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;
use thiserror::Error;

/// Namespace prefix reserved for wire-encoding bookkeeping keys.
pub const RESERVED_PREFIX: &str = "minder.internal.";

/// Well-known lookup key holding the provider-assigned identifier.
pub const PROP_UPSTREAM_ID: &str = "upstream_id";

/// Well-known lookup key holding the entity name.
pub const PROP_NAME: &str = "name";

/// Wire key carrying the integer type tag.
const TYPE_KEY: &str = "minder.internal.type";

/// Wire key carrying the decimal rendering of a wrapped integer.
const VALUE_KEY: &str = "minder.internal.value";

const TAG_INT64: &str = "int64";
const TAG_UINT64: &str = "uint64";

/// Errors raised by property construction and wire decoding.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PropertyError {
    /// A user-supplied map contains a key under the reserved prefix.
    #[error("property key {key:?} uses the reserved `minder.internal.` prefix")]
    ReservedKey {
        /// The offending key.
        key: String,
    },

    /// A wire integer wrapper carries an unknown type tag.
    #[error("wire value carries unknown integer type tag {tag:?}")]
    UnknownTypeTag {
        /// The tag that was found.
        tag: String,
    },

    /// A wire integer wrapper is structurally invalid.
    #[error("malformed wire integer: {reason}")]
    MalformedWireInteger {
        /// Why the wrapper could not be decoded.
        reason: String,
    },

    /// A typed getter was called on a value of a different kind.
    #[error("property is {actual}, expected {expected}")]
    TypeMismatch {
        /// The kind the caller asked for.
        expected: &'static str,
        /// The kind the value actually holds.
        actual: &'static str,
    },
}

/// The value variants a property may hold.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// JSON null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer, wire-wrapped.
    Int64(i64),
    /// Unsigned 64-bit integer, wire-wrapped.
    Uint64(u64),
    /// Floating point; passes through the wire untouched.
    Double(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered list of values.
    List(Vec<PropertyValue>),
    /// Nested string-keyed map.
    Struct(BTreeMap<String, PropertyValue>),
}

impl PropertyValue {
    /// Human-readable kind name used in error messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int64(_) => "int64",
            Self::Uint64(_) => "uint64",
            Self::Double(_) => "double",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Struct(_) => "struct",
        }
    }
}

/// An immutable, typed property value.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    value: PropertyValue,
}

impl Property {
    /// Builds a property from an untrusted JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`PropertyError::ReservedKey`] if any map at any depth carries
    /// a key under the reserved prefix.
    pub fn new(value: JsonValue) -> Result<Self, PropertyError> {
        Ok(Self {
            value: value_from_json(value)?,
        })
    }

    /// Builds a boolean property.
    #[must_use]
    pub fn from_bool(value: bool) -> Self {
        Self {
            value: PropertyValue::Bool(value),
        }
    }

    /// Builds a string property.
    #[must_use]
    pub fn from_string(value: impl Into<String>) -> Self {
        Self {
            value: PropertyValue::String(value.into()),
        }
    }

    /// Builds a signed 64-bit integer property.
    #[must_use]
    pub fn from_int64(value: i64) -> Self {
        Self {
            value: PropertyValue::Int64(value),
        }
    }

    /// Builds an unsigned 64-bit integer property.
    #[must_use]
    pub fn from_uint64(value: u64) -> Self {
        Self {
            value: PropertyValue::Uint64(value),
        }
    }

    /// Decodes a property from its wire encoding, unwrapping tagged
    /// integers.
    ///
    /// # Errors
    ///
    /// Returns [`PropertyError::UnknownTypeTag`] when the type tag is not
    /// `int64`/`uint64` and [`PropertyError::MalformedWireInteger`] when the
    /// wrapper shape or decimal rendering is invalid.
    pub fn from_wire(value: &JsonValue) -> Result<Self, PropertyError> {
        Ok(Self {
            value: value_from_wire(value)?,
        })
    }

    /// Encodes the property into its wire form, wrapping 64-bit integers.
    #[must_use]
    pub fn to_wire(&self) -> JsonValue {
        value_to_wire(&self.value)
    }

    /// Borrow the underlying value.
    #[must_use]
    pub fn value(&self) -> &PropertyValue {
        &self.value
    }

    /// Typed getter; errors on kind mismatch.
    pub fn as_bool(&self) -> Result<bool, PropertyError> {
        match &self.value {
            PropertyValue::Bool(b) => Ok(*b),
            other => Err(PropertyError::TypeMismatch {
                expected: "bool",
                actual: other.kind(),
            }),
        }
    }

    /// Typed getter; errors on kind mismatch.
    pub fn as_string(&self) -> Result<&str, PropertyError> {
        match &self.value {
            PropertyValue::String(s) => Ok(s),
            other => Err(PropertyError::TypeMismatch {
                expected: "string",
                actual: other.kind(),
            }),
        }
    }

    /// Typed getter; errors on kind mismatch.
    pub fn as_int64(&self) -> Result<i64, PropertyError> {
        match &self.value {
            PropertyValue::Int64(v) => Ok(*v),
            other => Err(PropertyError::TypeMismatch {
                expected: "int64",
                actual: other.kind(),
            }),
        }
    }

    /// Typed getter; errors on kind mismatch.
    pub fn as_uint64(&self) -> Result<u64, PropertyError> {
        match &self.value {
            PropertyValue::Uint64(v) => Ok(*v),
            other => Err(PropertyError::TypeMismatch {
                expected: "uint64",
                actual: other.kind(),
            }),
        }
    }

    /// Zero-defaulting getter: `false` on mismatch.
    #[must_use]
    pub fn get_bool(&self) -> bool {
        self.as_bool().unwrap_or_default()
    }

    /// Zero-defaulting getter: empty string on mismatch.
    #[must_use]
    pub fn get_string(&self) -> String {
        self.as_string().map(ToOwned::to_owned).unwrap_or_default()
    }

    /// Zero-defaulting getter: `0` on mismatch.
    #[must_use]
    pub fn get_int64(&self) -> i64 {
        self.as_int64().unwrap_or_default()
    }

    /// Zero-defaulting getter: `0` on mismatch.
    #[must_use]
    pub fn get_uint64(&self) -> u64 {
        self.as_uint64().unwrap_or_default()
    }
}

/// String-keyed map of properties.
///
/// Iteration order is an implementation detail; nothing externally visible
/// may depend on it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    inner: BTreeMap<String, Property>,
}

impl Properties {
    /// Empty property set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a property set from an untrusted JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`PropertyError::ReservedKey`] when any key (at any depth)
    /// falls under the reserved prefix.
    pub fn from_map(map: serde_json::Map<String, JsonValue>) -> Result<Self, PropertyError> {
        let mut inner = BTreeMap::new();
        for (key, value) in map {
            check_key(&key)?;
            inner.insert(key, Property::new(value)?);
        }
        Ok(Self { inner })
    }

    /// Decodes a property set from its wire struct.
    pub fn from_wire_struct(
        map: &serde_json::Map<String, JsonValue>,
    ) -> Result<Self, PropertyError> {
        let mut inner = BTreeMap::new();
        for (key, value) in map {
            check_key(key)?;
            inner.insert(key.clone(), Property::from_wire(value)?);
        }
        Ok(Self { inner })
    }

    /// Encodes the set into its wire struct.
    #[must_use]
    pub fn to_wire_struct(&self) -> serde_json::Map<String, JsonValue> {
        self.inner
            .iter()
            .map(|(key, prop)| (key.clone(), prop.to_wire()))
            .collect()
    }

    /// Looks up a property by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Property> {
        self.inner.get(key)
    }

    /// Inserts or replaces a property.
    ///
    /// # Errors
    ///
    /// Returns [`PropertyError::ReservedKey`] for reserved-prefix keys.
    pub fn set(&mut self, key: impl Into<String>, prop: Property) -> Result<(), PropertyError> {
        let key = key.into();
        check_key(&key)?;
        self.inner.insert(key, prop);
        Ok(())
    }

    /// Zero-defaulting lookup: `false` when absent or mismatched.
    #[must_use]
    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).map(Property::get_bool).unwrap_or_default()
    }

    /// Zero-defaulting lookup: empty string when absent or mismatched.
    #[must_use]
    pub fn get_string(&self, key: &str) -> String {
        self.get(key).map(Property::get_string).unwrap_or_default()
    }

    /// Zero-defaulting lookup: `0` when absent or mismatched.
    #[must_use]
    pub fn get_int64(&self, key: &str) -> i64 {
        self.get(key).map(Property::get_int64).unwrap_or_default()
    }

    /// Zero-defaulting lookup: `0` when absent or mismatched.
    #[must_use]
    pub fn get_uint64(&self, key: &str) -> u64 {
        self.get(key).map(Property::get_uint64).unwrap_or_default()
    }

    /// Iterates over `(key, property)` pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Property)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of properties in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True when the set holds no properties.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Pure copy retaining only the keys the predicate accepts.
    #[must_use]
    pub fn filtered_copy(&self, pred: impl Fn(&str) -> bool) -> Self {
        Self {
            inner: self
                .inner
                .iter()
                .filter(|(key, _)| pred(key))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Merges `other` over `self`; `other` wins on key conflicts.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let mut inner = self.inner.clone();
        for (key, prop) in &other.inner {
            inner.insert(key.clone(), prop.clone());
        }
        Self { inner }
    }
}

impl FromIterator<(String, Property)> for Properties {
    fn from_iter<T: IntoIterator<Item = (String, Property)>>(iter: T) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}

fn check_key(key: &str) -> Result<(), PropertyError> {
    if key.starts_with(RESERVED_PREFIX) {
        return Err(PropertyError::ReservedKey {
            key: key.to_owned(),
        });
    }
    Ok(())
}

fn value_from_json(value: JsonValue) -> Result<PropertyValue, PropertyError> {
    match value {
        JsonValue::Null => Ok(PropertyValue::Null),
        JsonValue::Bool(b) => Ok(PropertyValue::Bool(b)),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(PropertyValue::Int64(i))
            } else if let Some(u) = n.as_u64() {
                Ok(PropertyValue::Uint64(u))
            } else {
                // serde_json guarantees one of the three accessors succeeds.
                Ok(PropertyValue::Double(n.as_f64().unwrap_or_default()))
            }
        }
        JsonValue::String(s) => Ok(PropertyValue::String(s)),
        JsonValue::Array(items) => Ok(PropertyValue::List(
            items
                .into_iter()
                .map(value_from_json)
                .collect::<Result<_, _>>()?,
        )),
        JsonValue::Object(map) => {
            let mut inner = BTreeMap::new();
            for (key, value) in map {
                check_key(&key)?;
                inner.insert(key, value_from_json(value)?);
            }
            Ok(PropertyValue::Struct(inner))
        }
    }
}

fn value_from_wire(value: &JsonValue) -> Result<PropertyValue, PropertyError> {
    match value {
        JsonValue::Null => Ok(PropertyValue::Null),
        JsonValue::Bool(b) => Ok(PropertyValue::Bool(*b)),
        JsonValue::Number(n) => {
            // Integers arrive as tagged wrappers; bare numbers are doubles.
            Ok(PropertyValue::Double(n.as_f64().unwrap_or_default()))
        }
        JsonValue::String(s) => Ok(PropertyValue::String(s.clone())),
        JsonValue::Array(items) => Ok(PropertyValue::List(
            items
                .iter()
                .map(value_from_wire)
                .collect::<Result<_, _>>()?,
        )),
        JsonValue::Object(map) => {
            if map.contains_key(TYPE_KEY) || map.contains_key(VALUE_KEY) {
                return decode_wrapped_integer(map);
            }
            let mut inner = BTreeMap::new();
            for (key, value) in map {
                check_key(key)?;
                inner.insert(key.clone(), value_from_wire(value)?);
            }
            Ok(PropertyValue::Struct(inner))
        }
    }
}

fn decode_wrapped_integer(
    map: &serde_json::Map<String, JsonValue>,
) -> Result<PropertyValue, PropertyError> {
    let tag = map
        .get(TYPE_KEY)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| PropertyError::MalformedWireInteger {
            reason: "missing or non-string type tag".to_owned(),
        })?;
    let raw = map
        .get(VALUE_KEY)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| PropertyError::MalformedWireInteger {
            reason: "missing or non-string integer value".to_owned(),
        })?;
    match tag {
        TAG_INT64 => raw
            .parse::<i64>()
            .map(PropertyValue::Int64)
            .map_err(|e| PropertyError::MalformedWireInteger {
                reason: format!("invalid int64 {raw:?}: {e}"),
            }),
        TAG_UINT64 => raw
            .parse::<u64>()
            .map(PropertyValue::Uint64)
            .map_err(|e| PropertyError::MalformedWireInteger {
                reason: format!("invalid uint64 {raw:?}: {e}"),
            }),
        other => Err(PropertyError::UnknownTypeTag {
            tag: other.to_owned(),
        }),
    }
}

fn value_to_wire(value: &PropertyValue) -> JsonValue {
    match value {
        PropertyValue::Null => JsonValue::Null,
        PropertyValue::Bool(b) => JsonValue::Bool(*b),
        PropertyValue::Int64(v) => wrap_integer(TAG_INT64, &v.to_string()),
        PropertyValue::Uint64(v) => wrap_integer(TAG_UINT64, &v.to_string()),
        PropertyValue::Double(d) => serde_json::Number::from_f64(*d)
            .map_or(JsonValue::Null, JsonValue::Number),
        PropertyValue::String(s) => JsonValue::String(s.clone()),
        PropertyValue::List(items) => {
            JsonValue::Array(items.iter().map(value_to_wire).collect())
        }
        PropertyValue::Struct(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), value_to_wire(v)))
                .collect(),
        ),
    }
}

fn wrap_integer(tag: &str, decimal: &str) -> JsonValue {
    let mut map = serde_json::Map::new();
    map.insert(TYPE_KEY.to_owned(), JsonValue::String(tag.to_owned()));
    map.insert(VALUE_KEY.to_owned(), JsonValue::String(decimal.to_owned()));
    JsonValue::Object(map)
}
