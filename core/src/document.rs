//! Document identification, versioning and query types.
//!
//! This module defines strong types for addressing documents (`DocumentKey`),
//! optimistic concurrency (`Version`, `Precondition`) and range queries
//! (`Query`, `Filter`) used by the persistence port.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// Address of a document: a collection name plus the document ID inside it.
///
/// # Examples
///
/// ```
/// use idproxy_core::document::DocumentKey;
///
/// let key = DocumentKey::new("refresh_tokens", "rt-1");
/// assert_eq!(key.collection(), "refresh_tokens");
/// assert_eq!(key.id(), "rt-1");
/// assert_eq!(key.to_string(), "refresh_tokens/rt-1");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey {
    collection: String,
    id: String,
}

impl DocumentKey {
    /// Create a new key. No validation is performed here; callers validate
    /// IDs coming from untrusted input before building keys.
    #[must_use]
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Collection the document lives in.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Document ID within its collection.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Document version number for optimistic concurrency control.
///
/// Versions are store-wide revisions: every committed create or update
/// stamps the document with a version greater than any the store issued
/// before. A version is therefore never reused for a key, even after the
/// document is deleted and created again. A writer captures the version when
/// reading and makes its write conditional on it being unchanged:
///
/// - Reader sees version 3
/// - Another writer commits, document moves to a later version
/// - The first writer's `Precondition::Version(3)` fails
///
/// # Examples
///
/// ```
/// use idproxy_core::document::Version;
///
/// assert_eq!(Version::INITIAL.value(), 1);
/// assert!(Version::new(7) > Version::INITIAL);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// Lowest version a store issues; the first write to an empty store gets it.
    pub const INITIAL: Self = Self(1);

    /// Create a version from its raw number.
    #[must_use]
    pub const fn new(version: u64) -> Self {
        Self(version)
    }

    /// Raw version number.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored document: its key, JSON body and current version.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    /// Where the document lives.
    pub key: DocumentKey,
    /// JSON body.
    pub data: Value,
    /// Version at the time the document was read.
    pub version: Version,
}

impl Document {
    /// Deserialize the body into a typed record.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if the body does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}

/// Condition a write must satisfy at commit time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Precondition {
    /// No condition beyond the write's own semantics.
    #[default]
    None,
    /// The document must exist.
    Exists,
    /// The document must still be at exactly this version.
    Version(Version),
}

impl Precondition {
    /// Check the condition against the version currently stored
    /// (`None` when the document is absent).
    #[must_use]
    pub fn holds(&self, current: Option<Version>) -> bool {
        match self {
            Self::None => true,
            Self::Exists => current.is_some(),
            Self::Version(expected) => current == Some(*expected),
        }
    }
}

/// Comparison operator of a [`Filter`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOp {
    /// `field == value`
    Eq,
    /// `field < value`
    Lt,
    /// `field <= value`
    Lte,
    /// `field > value`
    Gt,
    /// `field >= value`
    Gte,
}

impl FilterOp {
    /// SQL spelling of the operator.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
        }
    }
}

/// Predicate over one top-level field of a document body.
///
/// Range operators only match when the field and the operand are both
/// numbers or both strings; missing and `null` fields never match a range.
#[derive(Clone, Debug, PartialEq)]
pub struct Filter {
    /// Top-level field name.
    pub field: String,
    /// Operator.
    pub op: FilterOp,
    /// Operand.
    pub value: Value,
}

impl Filter {
    /// `field == value`
    #[must_use]
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    /// `field < value`
    #[must_use]
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Lt, value)
    }

    /// `field <= value`
    #[must_use]
    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Lte, value)
    }

    /// `field > value`
    #[must_use]
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Gt, value)
    }

    /// `field >= value`
    #[must_use]
    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Gte, value)
    }

    fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Evaluate the filter against a document body.
    #[must_use]
    pub fn matches(&self, body: &Value) -> bool {
        let Some(actual) = body.get(&self.field) else {
            return false;
        };

        let accepts: fn(Ordering) -> bool = match self.op {
            FilterOp::Eq => return actual == &self.value,
            FilterOp::Lt => |ordering| ordering == Ordering::Less,
            FilterOp::Lte => |ordering| ordering != Ordering::Greater,
            FilterOp::Gt => |ordering| ordering == Ordering::Greater,
            FilterOp::Gte => |ordering| ordering != Ordering::Less,
        };
        compare(actual, &self.value).is_some_and(accepts)
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => match (l.as_i64(), r.as_i64()) {
            (Some(l), Some(r)) => Some(l.cmp(&r)),
            _ => l.as_f64()?.partial_cmp(&r.as_f64()?),
        },
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

/// Query over a single collection: all filters must match (logical AND).
///
/// Results are ordered by document ID. Queries never join collections.
///
/// # Examples
///
/// ```
/// use idproxy_core::document::{Filter, Query};
///
/// let query = Query::collection("refresh_tokens")
///     .filter(Filter::lte("expires_at", 1_700_000_000_000_000_i64))
///     .limit(500);
/// assert_eq!(query.filters.len(), 1);
/// assert_eq!(query.limit, Some(500));
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    /// Collection to scan.
    pub collection: String,
    /// Conjunctive filters.
    pub filters: Vec<Filter>,
    /// Maximum number of documents to return.
    pub limit: Option<usize>,
}

impl Query {
    /// Start a query over `collection` with no filters.
    #[must_use]
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            limit: None,
        }
    }

    /// Add a filter.
    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Cap the number of results.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a document body satisfies every filter.
    #[must_use]
    pub fn matches(&self, body: &Value) -> bool {
        self.filters.iter().all(|filter| filter.matches(body))
    }
}
