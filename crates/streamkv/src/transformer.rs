use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{StoreError, StoreResult};
use crate::host::HostValue;

/// Converts between domain values and host values at the store boundary.
pub trait Transformer<T>: Send + Sync {
    fn serialize(&self, value: &T) -> StoreResult<HostValue>;

    fn deserialize(&self, value: HostValue) -> StoreResult<T>;
}

/// Passes host values through untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct Identity;

impl Transformer<HostValue> for Identity {
    fn serialize(&self, value: &HostValue) -> StoreResult<HostValue> {
        Ok(value.clone())
    }

    fn deserialize(&self, value: HostValue) -> StoreResult<HostValue> {
        Ok(value)
    }
}

/// Maps any serde type to and from its JSON form.
pub struct Json<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Json<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for Json<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Json<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Transformer<T> for Json<T>
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self, value: &T) -> StoreResult<HostValue> {
        serde_json::to_value(value).map_err(|err| StoreError::data(format!("serialize failed: {err}")))
    }

    fn deserialize(&self, value: HostValue) -> StoreResult<T> {
        serde_json::from_value(value)
            .map_err(|err| StoreError::data(format!("deserialize failed: {err}")))
    }
}

/// Transformer built from a pair of closures.
pub struct FnTransformer<S, D> {
    serialize: S,
    deserialize: D,
}

impl<S, D> FnTransformer<S, D> {
    pub fn new(serialize: S, deserialize: D) -> Self {
        Self {
            serialize,
            deserialize,
        }
    }
}

impl<T, S, D> Transformer<T> for FnTransformer<S, D>
where
    S: Fn(&T) -> StoreResult<HostValue> + Send + Sync,
    D: Fn(HostValue) -> StoreResult<T> + Send + Sync,
{
    fn serialize(&self, value: &T) -> StoreResult<HostValue> {
        (self.serialize)(value)
    }

    fn deserialize(&self, value: HostValue) -> StoreResult<T> {
        (self.deserialize)(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Track {
        title: String,
        plays: u32,
    }

    #[test]
    fn json_transformer_maps_structs() {
        let transformer = Json::<Track>::new();
        let track = Track {
            title: "intro".to_string(),
            plays: 3,
        };

        let stored = transformer.serialize(&track).expect("track should serialize");
        assert_eq!(stored, json!({"title": "intro", "plays": 3}));
        assert_eq!(transformer.deserialize(stored).expect("track should decode"), track);
    }

    #[test]
    fn json_transformer_reports_shape_mismatch_as_data_error() {
        let error = Json::<Track>::new()
            .deserialize(json!("not a track"))
            .expect_err("string should not decode into Track");
        assert_eq!(error.kind, ErrorKind::Data);
    }

    #[test]
    fn fn_transformer_applies_both_directions() {
        let transformer = FnTransformer::new(
            |value: &String| Ok(json!({ "wrapped": value })),
            |value: HostValue| {
                value["wrapped"]
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| StoreError::data("missing wrapped field"))
            },
        );

        let stored = transformer.serialize(&"x".to_string()).expect("serialize should succeed");
        assert_eq!(stored, json!({"wrapped": "x"}));
        assert_eq!(transformer.deserialize(stored).expect("deserialize should succeed"), "x");
    }
}
