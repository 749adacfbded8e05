//! Keys, key paths and key ranges.
//!
//! Key ordering follows the host engine: numbers sort before dates, dates
//! before strings, strings before binary keys and binary keys before arrays.
//! Arrays compare element by element, shorter prefixes first.

use std::cmp::Ordering;
use std::fmt;
use std::ops::Bound;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StoreError, StoreResult};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Key {
    Number(f64),
    /// Milliseconds since the Unix epoch.
    Date(i64),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<Key>),
}

impl Key {
    /// Builds a number key, folding `-0.0` into `0.0` so both compare equal.
    pub fn number(value: f64) -> Self {
        if value == 0.0 {
            Self::Number(0.0)
        } else {
            Self::Number(value)
        }
    }

    pub fn validate(&self) -> StoreResult<()> {
        match self {
            Self::Number(value) if value.is_nan() => {
                Err(StoreError::data("NaN is not a valid key"))
            }
            Self::Array(items) => items.iter().try_for_each(Key::validate),
            _ => Ok(()),
        }
    }

    /// Converts a stored value into a key. Objects, booleans and null are not keys.
    pub fn from_value(value: &Value) -> StoreResult<Self> {
        match value {
            Value::Number(number) => number
                .as_f64()
                .map(Key::number)
                .ok_or_else(|| StoreError::data(format!("number {number} is not a valid key"))),
            Value::String(text) => Ok(Self::String(text.clone())),
            Value::Array(items) => items
                .iter()
                .map(Key::from_value)
                .collect::<StoreResult<Vec<_>>>()
                .map(Self::Array),
            other => Err(StoreError::data(format!("{other} is not a valid key"))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Number(value) => number_value(*value),
            Self::Date(millis) => Value::from(*millis),
            Self::String(text) => Value::String(text.clone()),
            Self::Binary(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
            Self::Array(items) => Value::Array(items.iter().map(Key::to_value).collect()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Number(_) => 0,
            Self::Date(_) => 1,
            Self::String(_) => 2,
            Self::Binary(_) => 3,
            Self::Array(_) => 4,
        }
    }
}

fn number_value(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
        Value::from(value as i64)
    } else {
        serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.total_cmp(b),
            (Self::Date(a), Self::Date(b)) => a.cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Binary(a), Self::Binary(b)) => a.cmp(b),
            (Self::Array(a), Self::Array(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::Date(millis) => write!(f, "Date({millis})"),
            Self::String(text) => f.write_str(text),
            Self::Binary(bytes) => {
                f.write_str("0x")?;
                bytes.iter().try_for_each(|b| write!(f, "{b:02x}"))
            }
            Self::Array(items) => {
                f.write_str("[")?;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<f64> for Key {
    fn from(value: f64) -> Self {
        Self::number(value)
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Self::number(value as f64)
    }
}

impl From<i32> for Key {
    fn from(value: i32) -> Self {
        Self::number(f64::from(value))
    }
}

impl From<u32> for Key {
    fn from(value: u32) -> Self {
        Self::number(f64::from(value))
    }
}

impl From<Vec<Key>> for Key {
    fn from(value: Vec<Key>) -> Self {
        Self::Array(value)
    }
}

/// Where a key lives inside a stored value. An empty path addresses the value itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPath {
    Single(String),
    Multiple(Vec<String>),
}

impl KeyPath {
    /// Returns `Ok(None)` when the path does not resolve, `Err` when it resolves to a non-key.
    pub fn extract(&self, value: &Value) -> StoreResult<Option<Key>> {
        match self {
            Self::Single(path) => match resolve(value, path) {
                Some(found) => Key::from_value(found).map(Some),
                None => Ok(None),
            },
            Self::Multiple(paths) => {
                let mut parts = Vec::with_capacity(paths.len());
                for path in paths {
                    let Some(found) = resolve(value, path) else {
                        return Ok(None);
                    };
                    parts.push(Key::from_value(found)?);
                }
                Ok(Some(Key::Array(parts)))
            }
        }
    }

    /// Writes a generated key into `value`, creating intermediate objects.
    pub fn inject(&self, value: &mut Value, key: &Key) -> StoreResult<()> {
        let Self::Single(path) = self else {
            return Err(StoreError::data("cannot inject a key through a compound key path"));
        };
        if path.is_empty() {
            return Err(StoreError::data("cannot inject a key through an empty key path"));
        }
        let mut target = value;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            let Value::Object(map) = target else {
                return Err(StoreError::data(format!(
                    "cannot inject key at '{path}': parent is not an object"
                )));
            };
            if segments.peek().is_none() {
                map.insert(segment.to_string(), key.to_value());
                return Ok(());
            }
            target = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Default::default()));
        }
        Ok(())
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(path) => f.write_str(path),
            Self::Multiple(paths) => write!(f, "[{}]", paths.join(", ")),
        }
    }
}

impl From<&str> for KeyPath {
    fn from(value: &str) -> Self {
        Self::Single(value.to_string())
    }
}

fn resolve<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.')
        .try_fold(value, |current, segment| current.as_object()?.get(segment))
}

/// Interval over the key ordering. Unbounded on both sides matches every key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRange {
    lower: Bound<Key>,
    upper: Bound<Key>,
}

impl KeyRange {
    pub fn all() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    pub fn only(key: impl Into<Key>) -> Self {
        let key = key.into();
        Self {
            lower: Bound::Included(key.clone()),
            upper: Bound::Included(key),
        }
    }

    pub fn lower_bound(key: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: bound(key.into(), open),
            upper: Bound::Unbounded,
        }
    }

    pub fn upper_bound(key: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: bound(key.into(), open),
        }
    }

    /// Fails with a data error when the range would be empty by construction.
    pub fn bound(
        lower: impl Into<Key>,
        upper: impl Into<Key>,
        lower_open: bool,
        upper_open: bool,
    ) -> StoreResult<Self> {
        let (lower, upper) = (lower.into(), upper.into());
        match lower.cmp(&upper) {
            Ordering::Greater => {
                return Err(StoreError::data(format!(
                    "lower bound {lower} is greater than upper bound {upper}"
                )));
            }
            Ordering::Equal if lower_open || upper_open => {
                return Err(StoreError::data(format!(
                    "bounds are equal ({lower}) but at least one is open"
                )));
            }
            _ => {}
        }
        Ok(Self {
            lower: bound(lower, lower_open),
            upper: bound(upper, upper_open),
        })
    }

    pub fn lower(&self) -> &Bound<Key> {
        &self.lower
    }

    pub fn upper(&self) -> &Bound<Key> {
        &self.upper
    }

    /// The single key this range matches, if it is an `only` range.
    pub fn as_only(&self) -> Option<&Key> {
        match (&self.lower, &self.upper) {
            (Bound::Included(lower), Bound::Included(upper)) if lower == upper => Some(lower),
            _ => None,
        }
    }

    pub fn includes(&self, key: &Key) -> bool {
        let above = match &self.lower {
            Bound::Included(lower) => key >= lower,
            Bound::Excluded(lower) => key > lower,
            Bound::Unbounded => true,
        };
        let below = match &self.upper {
            Bound::Included(upper) => key <= upper,
            Bound::Excluded(upper) => key < upper,
            Bound::Unbounded => true,
        };
        above && below
    }

    pub fn validate(&self) -> StoreResult<()> {
        for bound in [&self.lower, &self.upper] {
            if let Bound::Included(key) | Bound::Excluded(key) = bound {
                key.validate()?;
            }
        }
        Ok(())
    }

    /// `(lower, upper)` bounds suitable for `BTreeMap::range`.
    pub fn bounds(&self) -> (Bound<&Key>, Bound<&Key>) {
        (self.lower.as_ref(), self.upper.as_ref())
    }
}

impl Default for KeyRange {
    fn default() -> Self {
        Self::all()
    }
}

fn bound(key: Key, open: bool) -> Bound<Key> {
    if open {
        Bound::Excluded(key)
    } else {
        Bound::Included(key)
    }
}

impl From<Key> for KeyRange {
    fn from(value: Key) -> Self {
        Self::only(value)
    }
}

impl From<&Key> for KeyRange {
    fn from(value: &Key) -> Self {
        Self::only(value.clone())
    }
}

impl From<&str> for KeyRange {
    fn from(value: &str) -> Self {
        Self::only(value)
    }
}

impl From<String> for KeyRange {
    fn from(value: String) -> Self {
        Self::only(value)
    }
}

impl From<f64> for KeyRange {
    fn from(value: f64) -> Self {
        Self::only(value)
    }
}

impl From<i64> for KeyRange {
    fn from(value: i64) -> Self {
        Self::only(value)
    }
}

impl From<i32> for KeyRange {
    fn from(value: i32) -> Self {
        Self::only(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_ordering_follows_type_then_value() {
        let mut keys = vec![
            Key::Array(vec![Key::from(1)]),
            Key::from("b"),
            Key::Binary(vec![1]),
            Key::Date(5),
            Key::from(10),
            Key::from("a"),
            Key::from(-3.5),
        ];
        keys.sort();

        assert_eq!(
            keys,
            vec![
                Key::from(-3.5),
                Key::from(10),
                Key::Date(5),
                Key::from("a"),
                Key::from("b"),
                Key::Binary(vec![1]),
                Key::Array(vec![Key::from(1)]),
            ]
        );
    }

    #[test]
    fn array_keys_compare_element_wise_with_prefix_first() {
        let short = Key::from(vec![Key::from("a")]);
        let long = Key::from(vec![Key::from("a"), Key::from(1)]);
        assert!(short < long);
        assert!(Key::from(vec![Key::from(2)]) < Key::from(vec![Key::from("a")]));
    }

    #[test]
    fn negative_zero_equals_zero() {
        assert_eq!(Key::from(-0.0), Key::from(0));
    }

    #[test]
    fn nan_key_is_rejected() {
        let error = Key::Number(f64::NAN).validate().expect_err("NaN should be invalid");
        assert!(error.is(crate::ErrorKind::Data));
    }

    #[test]
    fn key_path_extracts_nested_and_compound_keys() {
        let value = json!({"id": 7, "meta": {"slug": "x"}});

        assert_eq!(
            KeyPath::from("meta.slug").extract(&value).expect("path should resolve"),
            Some(Key::from("x"))
        );
        assert_eq!(
            KeyPath::Multiple(vec!["id".into(), "meta.slug".into()])
                .extract(&value)
                .expect("compound path should resolve"),
            Some(Key::from(vec![Key::from(7), Key::from("x")]))
        );
        assert_eq!(
            KeyPath::from("missing").extract(&value).expect("missing path is not an error"),
            None
        );
        assert!(KeyPath::from("meta").extract(&value).is_err());
    }

    #[test]
    fn key_path_inject_creates_intermediate_objects() {
        let mut value = json!({"name": "n"});
        KeyPath::from("meta.id")
            .inject(&mut value, &Key::from(3))
            .expect("inject should succeed");
        assert_eq!(value, json!({"name": "n", "meta": {"id": 3}}));

        let mut scalar = json!("text");
        assert!(KeyPath::from("id").inject(&mut scalar, &Key::from(1)).is_err());
    }

    #[test]
    fn key_range_bounds_respect_openness() {
        let range = KeyRange::bound("a", "c", false, true).expect("range should build");
        assert!(range.includes(&Key::from("a")));
        assert!(range.includes(&Key::from("b")));
        assert!(!range.includes(&Key::from("c")));
        assert!(!range.includes(&Key::from(1)));

        assert!(KeyRange::bound("c", "a", false, false).is_err());
        assert!(KeyRange::bound("a", "a", true, false).is_err());
        assert_eq!(KeyRange::only("k").as_only(), Some(&Key::from("k")));
        assert_eq!(KeyRange::all().as_only(), None);
    }
}
