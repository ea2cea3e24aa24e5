use std::fmt::{self, Display};
use std::str::FromStr;

use serde_json::{Map, Value};

use crate::errors::StorageError;

/// Delimiter between the area prefix and the local key.
pub const AREA_DELIMITER: char = ':';
/// Suffix appended to a local key to address its metadata record.
pub const META_SUFFIX: &str = "$";
/// Reserved metadata field holding the schema version.
pub const VERSION_FIELD: &str = "v";

/// Flat metadata record stored next to a value.
pub type MetaMap = Map<String, Value>;

/// The fixed set of storage areas a key may live in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Area {
    /// Persistent, device-local storage.
    Local,
    /// Storage that lives as long as the browsing session.
    Session,
    /// Storage synchronized across the user's devices.
    Sync,
    /// Storage provisioned by an administrator policy.
    Managed,
}

impl Area {
    pub const ALL: [Area; 4] = [Area::Local, Area::Session, Area::Sync, Area::Managed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Area::Local => "local",
            Area::Session => "session",
            Area::Sync => "sync",
            Area::Managed => "managed",
        }
    }
}

impl Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Area {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Area::ALL.into_iter().find(|a| a.as_str() == s).ok_or(())
    }
}

/// A parsed `<area>:<key>` compound key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey {
    pub area: Area,
    pub key: String,
}

impl StorageKey {
    /// Splits `raw` on the first delimiter and validates both halves.
    pub fn parse(raw: &str) -> Result<Self, StorageError> {
        let (area, key) = raw
            .split_once(AREA_DELIMITER)
            .filter(|(_, key)| !key.is_empty())
            .ok_or_else(|| StorageError::InvalidKey(raw.to_string()))?;

        let area = area.parse::<Area>().map_err(|_| StorageError::UnknownArea {
            key: raw.to_string(),
            area: area.to_string(),
        })?;

        Ok(Self {
            area,
            key: key.to_string(),
        })
    }

    /// Local key of the metadata record for this key.
    pub fn meta_key(&self) -> String {
        meta_key(&self.key)
    }
}

impl Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.area, AREA_DELIMITER, self.key)
    }
}

impl FromStr for StorageKey {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StorageKey::parse(s)
    }
}

/// Options for removing a value.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RemoveOptions {
    /// Also drop the metadata record stored next to the value.
    pub remove_meta: bool,
}

impl RemoveOptions {
    pub fn with_meta() -> Self {
        Self { remove_meta: true }
    }
}

pub fn meta_key(key: &str) -> String {
    format!("{key}{META_SUFFIX}")
}

/// Interprets a stored metadata slot. Anything that is not an object counts as empty.
pub fn meta_from_value(value: Option<Value>) -> MetaMap {
    match value {
        Some(Value::Object(map)) => map,
        _ => MetaMap::new(),
    }
}

/// Field-wise merge: `null` in the patch deletes the field, anything else overwrites it.
pub fn merge_meta(mut current: MetaMap, patch: MetaMap) -> MetaMap {
    for (field, value) in patch {
        if value.is_null() {
            current.remove(&field);
        } else {
            current.insert(field, value);
        }
    }
    current
}

/// Reads the schema version from a metadata record, defaulting to 1.
pub fn version_of(meta: &MetaMap) -> u32 {
    meta.get(VERSION_FIELD)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(1)
}
