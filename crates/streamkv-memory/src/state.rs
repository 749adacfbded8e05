use std::collections::BTreeMap;
use std::ops::Bound;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use streamkv::host::{CursorDirection, IndexParameters, ObjectStoreParameters};
use streamkv::{Key, KeyPath, KeyRange, StoreError, StoreResult};

/// Everything the engine knows, committed data only.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct EngineState {
    pub databases: BTreeMap<String, DatabaseState>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct DatabaseState {
    pub version: u64,
    pub stores: BTreeMap<String, StoreState>,
}

impl DatabaseState {
    pub fn store(&self, name: &str) -> StoreResult<&StoreState> {
        self.stores
            .get(name)
            .ok_or_else(|| StoreError::not_found(format!("object store '{name}' does not exist")))
    }

    pub fn store_mut(&mut self, name: &str) -> StoreResult<&mut StoreState> {
        self.stores
            .get_mut(name)
            .ok_or_else(|| StoreError::not_found(format!("object store '{name}' does not exist")))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct IndexState {
    pub key_path: KeyPath,
    pub unique: bool,
    pub multi_entry: bool,
}

impl IndexState {
    pub fn new(key_path: KeyPath, parameters: IndexParameters) -> Self {
        Self {
            key_path,
            unique: parameters.unique,
            multi_entry: parameters.multi_entry,
        }
    }

    /// Index keys a value contributes. Values whose path does not resolve to a
    /// valid key are not indexed.
    pub fn keys_for(&self, value: &Value) -> Vec<Key> {
        match self.key_path.extract(value) {
            Ok(Some(Key::Array(items))) if self.multi_entry => {
                let mut keys: Vec<Key> =
                    items.into_iter().filter(|key| key.validate().is_ok()).collect();
                keys.sort();
                keys.dedup();
                keys
            }
            Ok(Some(key)) if key.validate().is_ok() => vec![key],
            _ => Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct StoreState {
    pub key_path: Option<KeyPath>,
    pub auto_increment: bool,
    /// Next key handed out by the key generator.
    #[serde(default = "first_generated_key")]
    pub next_key: u64,
    #[serde(default)]
    pub indexes: BTreeMap<String, IndexState>,
    #[serde(with = "records_as_entries", default)]
    pub records: BTreeMap<Key, Value>,
    /// Bumped on every record change; cursors compare it to reuse positions.
    #[serde(skip)]
    revision: u64,
}

fn first_generated_key() -> u64 {
    1
}

/// Which ordering a read walks: the store's primary keys or one of its indexes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum SourceKind {
    Store,
    Index(String),
}

/// One position in a source: `(key, primary_key)`.
pub(crate) type Position = (Key, Key);

impl StoreState {
    pub fn new(parameters: ObjectStoreParameters) -> Self {
        Self {
            key_path: parameters.key_path,
            auto_increment: parameters.auto_increment,
            next_key: first_generated_key(),
            indexes: BTreeMap::new(),
            records: BTreeMap::new(),
            revision: 0,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn index(&self, name: &str) -> StoreResult<&IndexState> {
        self.indexes
            .get(name)
            .ok_or_else(|| StoreError::not_found(format!("index '{name}' does not exist")))
    }

    /// Inserts `value`; with `overwrite` unset an existing key is a constraint error.
    pub fn write(&mut self, mut value: Value, key: Option<Key>, overwrite: bool) -> StoreResult<Key> {
        let key = self.resolve_key(&mut value, key)?;
        if !overwrite && self.records.contains_key(&key) {
            return Err(StoreError::constraint(format!("key {key} already exists")));
        }
        self.check_unique_indexes(&key, &value)?;
        if let Some(number) = key.as_f64() {
            self.bump_generator(number);
        }
        self.records.insert(key.clone(), value);
        self.revision += 1;
        Ok(key)
    }

    fn resolve_key(&mut self, value: &mut Value, explicit: Option<Key>) -> StoreResult<Key> {
        if let Some(key) = &explicit {
            key.validate()?;
        }
        match (self.key_path.clone(), explicit) {
            (Some(_), Some(_)) => Err(StoreError::data(
                "object store uses in-line keys; an explicit key is not allowed",
            )),
            (Some(path), None) => match path.extract(value)? {
                Some(key) => {
                    key.validate()?;
                    Ok(key)
                }
                None if self.auto_increment => {
                    let key = self.generate_key()?;
                    path.inject(value, &key)?;
                    Ok(key)
                }
                None => Err(StoreError::data(format!("value has no key at key path '{path}'"))),
            },
            (None, Some(key)) => Ok(key),
            (None, None) if self.auto_increment => self.generate_key(),
            (None, None) => Err(StoreError::data(
                "object store has no key path or key generator; a key is required",
            )),
        }
    }

    fn generate_key(&mut self) -> StoreResult<Key> {
        const MAX_GENERATED: u64 = 9_007_199_254_740_992;
        if self.next_key > MAX_GENERATED {
            return Err(StoreError::constraint("key generator exhausted"));
        }
        let key = Key::number(self.next_key as f64);
        self.next_key += 1;
        Ok(key)
    }

    fn bump_generator(&mut self, number: f64) {
        if self.auto_increment && number.is_finite() && number >= self.next_key as f64 {
            self.next_key = number.floor() as u64 + 1;
        }
    }

    fn check_unique_indexes(&self, primary_key: &Key, value: &Value) -> StoreResult<()> {
        for (name, index) in self.indexes.iter().filter(|(_, index)| index.unique) {
            let incoming = index.keys_for(value);
            if incoming.is_empty() {
                continue;
            }
            let clash = self
                .records
                .iter()
                .filter(|(existing, _)| *existing != primary_key)
                .any(|(_, stored)| index.keys_for(stored).iter().any(|key| incoming.contains(key)));
            if clash {
                return Err(StoreError::constraint(format!(
                    "unique index '{name}' already contains a matching key"
                )));
            }
        }
        Ok(())
    }

    /// Fails when an existing record would violate a new unique index.
    pub fn check_index_buildable(&self, name: &str, index: &IndexState) -> StoreResult<()> {
        if !index.unique {
            return Ok(());
        }
        let mut seen = Vec::new();
        for value in self.records.values() {
            for key in index.keys_for(value) {
                if seen.contains(&key) {
                    return Err(StoreError::constraint(format!(
                        "existing records violate unique index '{name}' at key {key}"
                    )));
                }
                seen.push(key);
            }
        }
        Ok(())
    }

    pub fn delete(&mut self, range: &KeyRange) {
        let doomed: Vec<Key> = self
            .records
            .range(range.bounds())
            .map(|(key, _)| key.clone())
            .collect();
        if doomed.is_empty() {
            return;
        }
        for key in doomed {
            self.records.remove(&key);
        }
        self.revision += 1;
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.revision += 1;
    }

    /// Positions of `source` inside `range`, ascending by `(key, primary_key)`.
    pub fn positions(&self, source: &SourceKind, range: Option<&KeyRange>) -> StoreResult<Vec<Position>> {
        let all = KeyRange::all();
        let range = range.unwrap_or(&all);
        match source {
            SourceKind::Store => Ok(self
                .records
                .range(range.bounds())
                .map(|(key, _)| (key.clone(), key.clone()))
                .collect()),
            SourceKind::Index(name) => {
                let index = self.index(name)?;
                let mut entries: Vec<Position> = self
                    .records
                    .iter()
                    .flat_map(|(primary, value)| {
                        index
                            .keys_for(value)
                            .into_iter()
                            .filter(move |key| range.includes(key))
                            .map(move |key| (key, primary.clone()))
                    })
                    .collect();
                entries.sort();
                Ok(entries)
            }
        }
    }

    /// Cursor position following `last` in `direction`.
    pub fn next_position(
        &self,
        source: &SourceKind,
        range: Option<&KeyRange>,
        last: Option<&Position>,
        direction: CursorDirection,
    ) -> StoreResult<Option<Position>> {
        if source != &SourceKind::Store {
            let positions = self.positions(source, range)?;
            return Ok(step(&positions, last, direction));
        }
        let (mut lower, mut upper) = match range {
            Some(range) => range.bounds(),
            None => (Bound::Unbounded, Bound::Unbounded),
        };
        if let Some((key, _)) = last {
            if direction.is_reverse() {
                upper = Bound::Excluded(key);
            } else {
                lower = Bound::Excluded(key);
            }
        }
        let mut keys = self.records.range::<Key, _>((lower, upper)).map(|(key, _)| key);
        let next = if direction.is_reverse() {
            keys.next_back()
        } else {
            keys.next()
        };
        Ok(next.map(|key| (key.clone(), key.clone())))
    }

    pub fn value(&self, primary_key: &Key) -> Option<&Value> {
        self.records.get(primary_key)
    }
}

/// Next cursor position after `last` (or the first one when `last` is `None`).
///
/// `positions` must be sorted ascending by `(key, primary_key)`.
pub(crate) fn step(positions: &[Position], last: Option<&Position>, direction: CursorDirection) -> Option<Position> {
    let at = |index: usize| positions.get(index).cloned();
    let Some(last) = last else {
        return match direction {
            CursorDirection::Next | CursorDirection::NextUnique => at(0),
            CursorDirection::Prev => positions.last().cloned(),
            CursorDirection::PrevUnique => {
                let key = &positions.last()?.0;
                at(positions.partition_point(|position| &position.0 < key))
            }
        };
    };
    match direction {
        CursorDirection::Next => at(positions.partition_point(|position| position <= last)),
        CursorDirection::NextUnique => at(positions.partition_point(|position| position.0 <= last.0)),
        CursorDirection::Prev => {
            let end = positions.partition_point(|position| position < last);
            end.checked_sub(1).and_then(at)
        }
        CursorDirection::PrevUnique => {
            let end = positions.partition_point(|position| position.0 < last.0);
            let key = &positions.get(end.checked_sub(1)?)?.0;
            at(positions.partition_point(|position| &position.0 < key))
        }
    }
}

/// Records are keyed by [`Key`], which JSON cannot use as an object key.
mod records_as_entries {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;
    use streamkv::Key;

    #[derive(Serialize, Deserialize)]
    struct Entry {
        key: Key,
        value: Value,
    }

    pub fn serialize<S: Serializer>(records: &BTreeMap<Key, Value>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(records.iter().map(|(key, value)| Entry {
            key: key.clone(),
            value: value.clone(),
        }))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeMap<Key, Value>, D::Error> {
        let entries = Vec::<Entry>::deserialize(deserializer)?;
        Ok(entries.into_iter().map(|entry| (entry.key, entry.value)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use streamkv::ErrorKind;

    fn keyed_store() -> StoreState {
        StoreState::new(ObjectStoreParameters {
            key_path: Some(KeyPath::from("id")),
            auto_increment: true,
        })
    }

    #[test]
    fn generator_fills_missing_in_line_key_and_skips_past_explicit_numbers() {
        let mut store = keyed_store();

        let first = store.write(json!({"name": "a"}), None, false).expect("first add");
        assert_eq!(first, Key::from(1));
        assert_eq!(store.value(&first), Some(&json!({"name": "a", "id": 1})));

        store.write(json!({"id": 10, "name": "b"}), None, false).expect("explicit add");
        let next = store.write(json!({"name": "c"}), None, false).expect("generated add");
        assert_eq!(next, Key::from(11));
    }

    #[test]
    fn in_line_store_rejects_explicit_key() {
        let mut store = keyed_store();
        let error = store
            .write(json!({"id": 1}), Some(Key::from(1)), false)
            .expect_err("explicit key should be rejected");
        assert_eq!(error.kind, ErrorKind::Data);
    }

    #[test]
    fn unique_index_rejects_second_record_with_same_key() {
        let mut store = keyed_store();
        store.indexes.insert(
            "by_email".to_string(),
            IndexState::new(KeyPath::from("email"), IndexParameters { unique: true, multi_entry: false }),
        );
        store.write(json!({"id": 1, "email": "x@y"}), None, false).expect("first write");
        store
            .write(json!({"id": 1, "email": "x@y"}), None, true)
            .expect("overwriting the same record keeps its own index key");

        let error = store
            .write(json!({"id": 2, "email": "x@y"}), None, false)
            .expect_err("duplicate email should fail");
        assert_eq!(error.kind, ErrorKind::Constraint);
    }

    #[test]
    fn multi_entry_index_yields_one_position_per_element() {
        let mut store = keyed_store();
        store.indexes.insert(
            "by_tag".to_string(),
            IndexState::new(KeyPath::from("tags"), IndexParameters { unique: false, multi_entry: true }),
        );
        store.write(json!({"id": 1, "tags": ["b", "a", "b"]}), None, false).expect("write");
        store.write(json!({"id": 2, "tags": ["a"]}), None, false).expect("write");

        let positions = store
            .positions(&SourceKind::Index("by_tag".to_string()), None)
            .expect("index should exist");
        assert_eq!(
            positions,
            vec![
                (Key::from("a"), Key::from(1)),
                (Key::from("a"), Key::from(2)),
                (Key::from("b"), Key::from(1)),
            ]
        );
    }

    #[test]
    fn unique_directions_visit_each_key_once() {
        let positions = vec![
            (Key::from("a"), Key::from(1)),
            (Key::from("a"), Key::from(2)),
            (Key::from("b"), Key::from(3)),
        ];

        let mut walked = Vec::new();
        let mut last = None;
        while let Some(position) = step(&positions, last.as_ref(), CursorDirection::PrevUnique) {
            walked.push(position.clone());
            last = Some(position);
        }
        assert_eq!(
            walked,
            vec![(Key::from("b"), Key::from(3)), (Key::from("a"), Key::from(1))]
        );

        let first = step(&positions, None, CursorDirection::NextUnique).expect("first position");
        let second = step(&positions, Some(&first), CursorDirection::NextUnique);
        assert_eq!(second, Some((Key::from("b"), Key::from(3))));
    }

    #[test]
    fn revision_moves_only_when_records_change() {
        let mut store = StoreState::new(ObjectStoreParameters::default());
        let start = store.revision();
        store.write(json!("a"), Some(Key::from(1)), false).expect("write");
        let written = store.revision();
        assert!(written > start);

        store
            .write(json!("b"), Some(Key::from(1)), false)
            .expect_err("duplicate add should fail");
        store.delete(&KeyRange::only(7));
        assert_eq!(store.revision(), written);

        store.clear();
        assert!(store.revision() > written);
    }

    #[test]
    fn plain_directions_step_through_duplicate_keys() {
        let positions = vec![
            (Key::from("a"), Key::from(1)),
            (Key::from("a"), Key::from(2)),
            (Key::from("b"), Key::from(3)),
        ];
        for (direction, expected) in [
            (CursorDirection::Next, positions.clone()),
            (CursorDirection::Prev, positions.iter().rev().cloned().collect()),
        ] {
            let mut walked = Vec::new();
            let mut last = None;
            while let Some(position) = step(&positions, last.as_ref(), direction) {
                walked.push(position.clone());
                last = Some(position);
            }
            assert_eq!(walked, expected);
        }
        assert_eq!(step(&[], None, CursorDirection::PrevUnique), None);
    }

    #[test]
    fn records_survive_a_json_round_trip_with_non_string_keys() {
        let mut store = StoreState::new(ObjectStoreParameters::default());
        store.write(json!("one"), Some(Key::from(1)), false).expect("write");
        store.write(json!("pair"), Some(Key::Array(vec![Key::from("a"), Key::from(2)])), false).expect("write");

        let raw = serde_json::to_string(&store).expect("state should serialize");
        let restored: StoreState = serde_json::from_str(&raw).expect("state should deserialize");
        assert_eq!(restored.records, store.records);
    }
}
