//! RelayStore - generic persistent record store
//!
//! Records are stored as JSON documents in SQLite, one row per record, with a
//! side table of indexed fields so callers can filter without deserializing
//! every document.
//!
//! # Architecture
//!
//! ```text
//! {store_dir}/
//! └── relay.db
//!     ├── records         (collection, id, data, updated_at)
//!     └── record_indexes  (collection, id, field, value_text | value_int)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use relaystore::{Filter, FilterOp, IndexValue, Store};
//!
//! let mut store = Store::open("/var/lib/streamrelay")?;
//! store.create(record)?;
//! let active: Vec<MyRecord> = store.list(&[Filter::eq("status", "active")])?;
//! ```

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde::de::DeserializeOwned;

mod store;

pub use store::{DB_FILE, Store};

/// A value stored in the field index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl From<&str> for IndexValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for IndexValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for IndexValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Comparison operator for a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl FilterOp {
    pub(crate) fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }
}

/// A single predicate against an indexed field
///
/// Records that do not index `field` never match.
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: IndexValue,
}

impl Filter {
    /// Shorthand for an equality filter
    pub fn eq(field: impl Into<String>, value: impl Into<IndexValue>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }
}

/// A type that can be persisted in the store
pub trait Record: Serialize + DeserializeOwned {
    /// Unique identifier within the collection
    fn id(&self) -> &str;

    /// Last modification time (Unix milliseconds), used for ordering
    fn updated_at(&self) -> i64;

    /// Collection (logical table) name
    fn collection_name() -> &'static str;

    /// Fields to index for filtering
    fn indexed_fields(&self) -> HashMap<String, IndexValue>;
}

/// Current time in Unix milliseconds
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
