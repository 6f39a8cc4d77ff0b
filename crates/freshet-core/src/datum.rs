//! Self-describing document values and the orderable keys derived from them.
//!
//! A [`Datum`] is the database's value type: rows, primary keys, and
//! secondary-index keys are all datums. The changefeed core treats them as
//! opaque apart from two obligations: they must serialize for the wire, and
//! they must carry a total order so limit windows and key ranges behave
//! deterministically.
//!
//! Ordering is by type rank first (arrays < booleans < null < numbers <
//! objects < strings), then by value within a type. Numbers compare by IEEE
//! total order, arrays lexicographically, objects as ordered key/value
//! sequences.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Datum
// ---------------------------------------------------------------------------

/// A self-describing document value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Datum {
    /// Absence of a value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A double-precision number.
    Number(f64),
    /// A UTF-8 string.
    String(String),
    /// An ordered sequence of datums.
    Array(Vec<Datum>),
    /// A field → value mapping with deterministic field order.
    Object(BTreeMap<String, Datum>),
}

impl Datum {
    /// Rank of the datum's type in the cross-type total order.
    #[must_use]
    pub fn type_rank(&self) -> u8 {
        match self {
            Self::Array(_) => 0,
            Self::Bool(_) => 1,
            Self::Null => 2,
            Self::Number(_) => 3,
            Self::Object(_) => 4,
            Self::String(_) => 5,
        }
    }

    /// Looks up a field on an object datum.
    ///
    /// Returns `None` for non-objects and missing fields.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Datum> {
        match self {
            Self::Object(fields) => fields.get(field),
            _ => None,
        }
    }

    /// Converts the datum into its JSON representation.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Array(items) => {
                serde_json::Value::Array(items.iter().map(Datum::to_json).collect())
            }
            Self::Object(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for Datum {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Datum::from).collect())
            }
            serde_json::Value::Object(fields) => Self::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Datum::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Datum {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<f64> for Datum {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for Datum {
    fn from(n: i64) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let value = n as f64;
        Self::Number(value)
    }
}

impl From<bool> for Datum {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Datum {}

impl PartialOrd for Datum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Datum {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Array(a), Self::Array(b)) => a.iter().cmp(b.iter()),
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Number(a), Self::Number(b)) => a.total_cmp(b),
            (Self::Object(a), Self::Object(b)) => a.iter().cmp(b.iter()),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (a, b) => a.type_rank().cmp(&b.type_rank()),
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

// ---------------------------------------------------------------------------
// DatumRange
// ---------------------------------------------------------------------------

/// A range over datum space, used for secondary-index windows.
///
/// Both ends carry explicit [`Bound`]s so window edges can be expressed
/// inclusively when refill reads must admit sort-key ties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatumRange {
    /// Lower bound.
    pub lower: Bound<Datum>,
    /// Upper bound.
    pub upper: Bound<Datum>,
}

impl DatumRange {
    /// The unbounded range.
    #[must_use]
    pub fn all() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    /// A range with explicit bounds.
    #[must_use]
    pub fn new(lower: Bound<Datum>, upper: Bound<Datum>) -> Self {
        Self { lower, upper }
    }

    /// The half-open range `[lower, upper)`.
    #[must_use]
    pub fn closed_open(lower: Datum, upper: Datum) -> Self {
        Self {
            lower: Bound::Included(lower),
            upper: Bound::Excluded(upper),
        }
    }

    /// Whether `value` falls inside the range.
    #[must_use]
    pub fn contains(&self, value: &Datum) -> bool {
        let above_lower = match &self.lower {
            Bound::Unbounded => true,
            Bound::Included(l) => value >= l,
            Bound::Excluded(l) => value > l,
        };
        let below_upper = match &self.upper {
            Bound::Unbounded => true,
            Bound::Included(u) => value <= u,
            Bound::Excluded(u) => value < u,
        };
        above_lower && below_upper
    }
}

// ---------------------------------------------------------------------------
// StoreKey
// ---------------------------------------------------------------------------

/// A primary-key byte string.
///
/// Keys derived from datums via [`StoreKey::from_datum`] preserve datum
/// order, so region membership computed on either side of the wire agrees.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoreKey(Vec<u8>);

impl StoreKey {
    /// Wraps raw key bytes.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Derives the key for a primary-key datum.
    #[must_use]
    pub fn from_datum(datum: &Datum) -> Self {
        let mut buf = vec![datum.type_rank()];
        match datum {
            Datum::String(s) => buf.extend_from_slice(s.as_bytes()),
            Datum::Number(n) => buf.extend_from_slice(&number_key(*n)),
            other => buf.extend_from_slice(other.to_json().to_string().as_bytes()),
        }
        Self(buf)
    }

    /// The raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The smallest key strictly greater than this one.
    #[must_use]
    pub fn successor(&self) -> Self {
        let mut bytes = self.0.clone();
        bytes.push(0);
        Self(bytes)
    }
}

impl From<&str> for StoreKey {
    fn from(s: &str) -> Self {
        Self::from_datum(&Datum::from(s))
    }
}

/// Order-preserving big-endian encoding of an `f64`.
fn number_key(n: f64) -> [u8; 8] {
    let bits = n.to_bits();
    let flipped = if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits | (1 << 63)
    };
    flipped.to_be_bytes()
}

// ---------------------------------------------------------------------------
// Region
// ---------------------------------------------------------------------------

/// A half-open range `[lower, upper)` of the primary keyspace.
///
/// Regions route subscriptions to the shards that cover them; `None` on
/// either side means unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    /// Inclusive lower bound.
    pub lower: Option<StoreKey>,
    /// Exclusive upper bound.
    pub upper: Option<StoreKey>,
}

impl Region {
    /// The whole keyspace.
    #[must_use]
    pub fn all() -> Self {
        Self {
            lower: None,
            upper: None,
        }
    }

    /// A region with explicit bounds.
    #[must_use]
    pub fn new(lower: Option<StoreKey>, upper: Option<StoreKey>) -> Self {
        Self { lower, upper }
    }

    /// The single-key region `[key, successor(key))`.
    #[must_use]
    pub fn point(key: &StoreKey) -> Self {
        Self {
            lower: Some(key.clone()),
            upper: Some(key.successor()),
        }
    }

    /// Whether `key` falls inside the region.
    #[must_use]
    pub fn contains(&self, key: &StoreKey) -> bool {
        self.lower.as_ref().map_or(true, |l| key >= l)
            && self.upper.as_ref().map_or(true, |u| key < u)
    }

    /// Whether two regions share at least one key.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        fn strictly_below(lower: &Option<StoreKey>, upper: &Option<StoreKey>) -> bool {
            match (lower, upper) {
                (Some(l), Some(u)) => l < u,
                _ => true,
            }
        }
        strictly_below(&self.lower, &other.upper) && strictly_below(&other.lower, &self.upper)
    }

    /// Whether the region contains no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!((&self.lower, &self.upper), (Some(l), Some(u)) if l >= u)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
