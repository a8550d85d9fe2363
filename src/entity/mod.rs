//! Entity contract and per-type identity metadata
//!
//! An entity is a serde-serializable record with a comparable primary key and
//! a descriptor: the accessor table the engine uses instead of looking up
//! properties by name at runtime.

pub mod delete_state;
pub mod descriptor;
pub mod identity;
pub mod reference;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt::{self, Debug, Display};
use std::hash::Hash;
use uuid::Uuid;

pub use delete_state::{AuditInfo, DeleteStamp, DeleteState};
pub use descriptor::{AuditAccessor, EntityDescriptor, Field, SoftDeleteAccessor, TenantAccessor};
pub use identity::IdentityResolver;
pub use reference::{Reference, ReferenceAccessor};

/// How a default key is replaced when an entity is added
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyGeneration {
    /// Drawn from the store sequence named after the entity type
    Sequence,
    /// Random 128-bit identifier
    Random,
    /// Callers must supply the key
    Manual,
}

/// Primary key of an entity
pub trait EntityKey:
    Clone + Eq + Ord + Hash + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    const GENERATION: KeyGeneration;

    /// True for the zero/empty value of the key type
    fn is_default(&self) -> bool;

    /// String form used as the stored record key
    fn to_storage_key(&self) -> String;

    fn from_storage_key(raw: &str) -> Option<Self>;

    fn as_uuid(&self) -> Option<Uuid> {
        None
    }

    fn from_sequence(_value: i64) -> Option<Self> {
        None
    }

    fn random() -> Option<Self> {
        None
    }
}

macro_rules! integer_key {
    ($($ty:ty),*) => {
        $(
            impl EntityKey for $ty {
                const GENERATION: KeyGeneration = KeyGeneration::Sequence;

                fn is_default(&self) -> bool {
                    *self == 0
                }

                fn to_storage_key(&self) -> String {
                    self.to_string()
                }

                fn from_storage_key(raw: &str) -> Option<Self> {
                    raw.parse().ok()
                }

                fn from_sequence(value: i64) -> Option<Self> {
                    <$ty>::try_from(value).ok()
                }
            }
        )*
    };
}

integer_key!(i32, i64, u32, u64);

impl EntityKey for String {
    const GENERATION: KeyGeneration = KeyGeneration::Manual;

    fn is_default(&self) -> bool {
        self.is_empty()
    }

    fn to_storage_key(&self) -> String {
        self.clone()
    }

    fn from_storage_key(raw: &str) -> Option<Self> {
        Some(raw.to_string())
    }
}

impl EntityKey for Uuid {
    const GENERATION: KeyGeneration = KeyGeneration::Random;

    fn is_default(&self) -> bool {
        self.is_nil()
    }

    fn to_storage_key(&self) -> String {
        self.hyphenated().to_string()
    }

    fn from_storage_key(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw).ok()
    }

    fn as_uuid(&self) -> Option<Uuid> {
        Some(*self)
    }

    fn random() -> Option<Self> {
        Some(Uuid::new_v4())
    }
}

/// Key with its concrete type erased, as seen through
/// [`crate::repository::DbRepository`]
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey(String);

impl RecordKey {
    pub fn of<K: EntityKey>(key: &K) -> Self {
        RecordKey(key.to_storage_key())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn parse<K: EntityKey>(&self) -> Option<K> {
        K::from_storage_key(&self.0)
    }
}

impl From<&str> for RecordKey {
    fn from(value: &str) -> Self {
        RecordKey(value.to_string())
    }
}

impl From<String> for RecordKey {
    fn from(value: String) -> Self {
        RecordKey(value)
    }
}

impl Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A record type managed by the repository
///
/// Implementations describe themselves once through [`Entity::descriptor`];
/// the [`IdentityResolver`] validates and caches the result per type.
pub trait Entity: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {
    type Key: EntityKey;

    /// Stable name used for stored records and error messages
    const TYPE_NAME: &'static str;

    fn descriptor() -> EntityDescriptor<Self>;
}
