//! Typed key/value preferences
//!
//! `Preferences` is an immutable map from key name to a small set of
//! primitive value types. Reads go through typed [`Key`]s; a key whose stored
//! value has a different type reads as absent. Edits happen on a
//! [`MutablePreferences`] copy that is frozen back into a new snapshot.

use crate::store::codec::Codec;
use crate::store::engine::DataStore;
use crate::store::errors::{CodecError, DataStoreResult};
use crate::store::snapshot::Snapshot;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::marker::PhantomData;

/// A single stored preference value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PreferenceValue {
    Bool(bool),
    Int(i32),
    Long(i64),
    Float(#[serde(with = "json_float::single")] f32),
    Double(#[serde(with = "json_float::double")] f64),
    String(String),
    StringSet(BTreeSet<String>),
}

/// JSON numbers cannot hold NaN or infinities, so those are written as the
/// strings `"NaN"`, `"Infinity"` and `"-Infinity"`.
mod json_float {
    use serde::{de, Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    fn special(v: f64) -> Option<&'static str> {
        if v.is_nan() {
            Some("NaN")
        } else if v == f64::INFINITY {
            Some("Infinity")
        } else if v == f64::NEG_INFINITY {
            Some("-Infinity")
        } else {
            None
        }
    }

    fn read<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(n),
            Repr::Text(text) => match text.as_str() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                other => Err(de::Error::custom(format!("not a number: {:?}", other))),
            },
        }
    }

    pub mod single {
        use serde::{Deserializer, Serializer};

        pub fn serialize<S: Serializer>(v: &f32, serializer: S) -> Result<S::Ok, S::Error> {
            match super::special(f64::from(*v)) {
                Some(text) => serializer.serialize_str(text),
                None => serializer.serialize_f32(*v),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f32, D::Error> {
            super::read(deserializer).map(|v| v as f32)
        }
    }

    pub mod double {
        use serde::{Deserializer, Serializer};

        pub fn serialize<S: Serializer>(v: &f64, serializer: S) -> Result<S::Ok, S::Error> {
            match super::special(*v) {
                Some(text) => serializer.serialize_str(text),
                None => serializer.serialize_f64(*v),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
            super::read(deserializer)
        }
    }
}

/// Rust types that can be stored under a typed key
pub trait PreferenceType: Sized {
    fn into_value(self) -> PreferenceValue;
    fn from_value(value: &PreferenceValue) -> Option<Self>;
}

macro_rules! preference_type {
    ($ty:ty, $variant:ident) => {
        impl PreferenceType for $ty {
            fn into_value(self) -> PreferenceValue {
                PreferenceValue::$variant(self)
            }

            fn from_value(value: &PreferenceValue) -> Option<Self> {
                match value {
                    PreferenceValue::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }
    };
}

preference_type!(bool, Bool);
preference_type!(i32, Int);
preference_type!(i64, Long);
preference_type!(f32, Float);
preference_type!(f64, Double);
preference_type!(String, String);
preference_type!(BTreeSet<String>, StringSet);

/// Typed handle to a preference entry
pub struct Key<T> {
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Key {
            name: name.into(),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        Key::new(self.name.clone())
    }
}

impl<T> PartialEq for Key<T> {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl<T> Eq for Key<T> {}

impl<T> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key<{}>({})", std::any::type_name::<T>(), self.name)
    }
}

pub fn bool_key(name: impl Into<String>) -> Key<bool> {
    Key::new(name)
}

pub fn int_key(name: impl Into<String>) -> Key<i32> {
    Key::new(name)
}

pub fn long_key(name: impl Into<String>) -> Key<i64> {
    Key::new(name)
}

pub fn float_key(name: impl Into<String>) -> Key<f32> {
    Key::new(name)
}

pub fn double_key(name: impl Into<String>) -> Key<f64> {
    Key::new(name)
}

pub fn string_key(name: impl Into<String>) -> Key<String> {
    Key::new(name)
}

pub fn string_set_key(name: impl Into<String>) -> Key<BTreeSet<String>> {
    Key::new(name)
}

/// Immutable preference snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Preferences {
    entries: BTreeMap<String, PreferenceValue>,
}

impl Preferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: PreferenceType>(&self, key: &Key<T>) -> Option<T> {
        self.entries.get(key.name()).and_then(T::from_value)
    }

    pub fn contains<T>(&self, key: &Key<T>) -> bool {
        self.entries.contains_key(key.name())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Untyped view over all entries, sorted by key name
    pub fn as_map(&self) -> &BTreeMap<String, PreferenceValue> {
        &self.entries
    }

    /// Copy into an editable form
    pub fn to_mutable(&self) -> MutablePreferences {
        MutablePreferences {
            entries: self.entries.clone(),
        }
    }
}

/// Editable copy of a [`Preferences`] snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutablePreferences {
    entries: BTreeMap<String, PreferenceValue>,
}

impl MutablePreferences {
    pub fn get<T: PreferenceType>(&self, key: &Key<T>) -> Option<T> {
        self.entries.get(key.name()).and_then(T::from_value)
    }

    /// Insert or overwrite; the stored type follows the key
    pub fn set<T: PreferenceType>(&mut self, key: &Key<T>, value: T) {
        self.entries.insert(key.name().to_string(), value.into_value());
    }

    /// Remove the entry, returning it if it held a value of the key's type
    pub fn remove<T: PreferenceType>(&mut self, key: &Key<T>) -> Option<T> {
        self.entries
            .remove(key.name())
            .and_then(|v| T::from_value(&v))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn freeze(self) -> Preferences {
        Preferences {
            entries: self.entries,
        }
    }
}

/// JSON codec for [`Preferences`] stores
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferencesCodec;

impl Codec for PreferencesCodec {
    type Value = Preferences;

    fn default_value(&self) -> Preferences {
        Preferences::new()
    }

    fn decode(&self, bytes: &[u8]) -> Result<Preferences, CodecError> {
        let entries: BTreeMap<String, PreferenceValue> = serde_json::from_slice(bytes)?;
        Ok(Preferences { entries })
    }

    fn encode(&self, value: &Preferences) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(&value.entries).map_err(|e| CodecError::Encode(e.to_string()))
    }
}

impl DataStore<PreferencesCodec> {
    /// Edit the preferences in place within a single transaction
    pub async fn edit<F>(&self, edit: F) -> DataStoreResult<Snapshot<Preferences>>
    where
        F: FnOnce(&mut MutablePreferences) + Send + 'static,
    {
        self.update(move |current| {
            let mut prefs = current.to_mutable();
            edit(&mut prefs);
            prefs.freeze()
        })
        .await
    }
}
