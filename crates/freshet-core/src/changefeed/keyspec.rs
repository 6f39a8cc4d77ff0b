//! What a subscription watches: point, range, or ordered-prefix window.

use serde::{Deserialize, Serialize};

use crate::changefeed::ChangefeedError;
use crate::datum::{DatumRange, Region, StoreKey};

// ---------------------------------------------------------------------------
// Sorting
// ---------------------------------------------------------------------------

/// Direction of a limit window over its secondary index.
///
/// Governs admission order, the truncation side, and the direction of
/// refill reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sorting {
    /// Window holds the smallest N entries.
    Ascending,
    /// Window holds the largest N entries.
    Descending,
}

// ---------------------------------------------------------------------------
// LimitSpec
// ---------------------------------------------------------------------------

/// An ordered-prefix window: a secondary-index range, a direction, and a
/// window size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitSpec {
    /// Secondary-index range the window draws from.
    pub range: DatumRange,
    /// Name of the secondary index.
    pub sindex: String,
    /// Sort direction.
    pub sorting: Sorting,
    /// Window size N.
    pub limit: usize,
}

// ---------------------------------------------------------------------------
// Keyspec
// ---------------------------------------------------------------------------

/// A subscription's declaration of which mutations to observe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Keyspec {
    /// A half-open range over the primary key.
    Range {
        /// The watched key range.
        range: Region,
    },
    /// A single primary key.
    Point {
        /// The watched key.
        key: StoreKey,
    },
    /// An ordered-prefix window over a secondary index.
    Limit(LimitSpec),
}

impl Keyspec {
    /// Projects the keyspec onto the primary keyspace for shard routing.
    ///
    /// A limit keyspec projects to the whole keyspace: a secondary-index
    /// range gives no bound on primary keys.
    #[must_use]
    pub fn to_region(&self) -> Region {
        match self {
            Self::Range { range } => range.clone(),
            Self::Point { key } => Region::point(key),
            Self::Limit(_) => Region::all(),
        }
    }

    /// Whether a point mutation at `key` is visible to this keyspec.
    ///
    /// Limit subscriptions never match here; their events are routed by
    /// subscription id instead.
    #[must_use]
    pub fn covers(&self, key: &StoreKey) -> bool {
        match self {
            Self::Range { range } => range.contains(key),
            Self::Point { key: own } => own == key,
            Self::Limit(_) => false,
        }
    }

    /// Rejects keyspecs that cannot describe a valid subscription.
    ///
    /// # Errors
    ///
    /// [`ChangefeedError::MalformedKeyspec`] for an empty range, a zero
    /// window size, or a nameless secondary index.
    pub fn validate(&self) -> Result<(), ChangefeedError> {
        match self {
            Self::Range { range } if range.is_empty() => Err(ChangefeedError::MalformedKeyspec(
                "empty primary-key range".into(),
            )),
            Self::Limit(spec) if spec.limit == 0 => Err(ChangefeedError::MalformedKeyspec(
                "limit window size must be at least 1".into(),
            )),
            Self::Limit(spec) if spec.sindex.is_empty() => Err(
                ChangefeedError::MalformedKeyspec("secondary index name is empty".into()),
            ),
            _ => Ok(()),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn limit_spec(limit: usize) -> LimitSpec {
        LimitSpec {
            range: DatumRange::all(),
            sindex: "age".into(),
            sorting: Sorting::Ascending,
            limit,
        }
    }

    // --- Region projection tests ---

    #[test]
    fn test_range_projects_to_itself() {
        let region = Region::new(Some(StoreKey::from("a")), Some(StoreKey::from("z")));
        let keyspec = Keyspec::Range {
            range: region.clone(),
        };
        assert_eq!(keyspec.to_region(), region);
    }

    #[test]
    fn test_point_projects_to_single_key_region() {
        let key = StoreKey::from("m");
        let region = Keyspec::Point { key: key.clone() }.to_region();
        assert!(region.contains(&key));
        assert!(!region.contains(&key.successor()));
    }

    #[test]
    fn test_limit_projects_to_whole_keyspace() {
        let region = Keyspec::Limit(limit_spec(2)).to_region();
        assert_eq!(region, Region::all());
    }

    // --- Coverage tests ---

    #[test]
    fn test_range_coverage() {
        let keyspec = Keyspec::Range {
            range: Region::new(Some(StoreKey::from("a")), Some(StoreKey::from("z"))),
        };
        assert!(keyspec.covers(&StoreKey::from("m")));
        assert!(!keyspec.covers(&StoreKey::from("z")));
    }

    #[test]
    fn test_point_coverage() {
        let keyspec = Keyspec::Point {
            key: StoreKey::from("m"),
        };
        assert!(keyspec.covers(&StoreKey::from("m")));
        assert!(!keyspec.covers(&StoreKey::from("n")));
    }

    #[test]
    fn test_limit_never_covers_keys() {
        assert!(!Keyspec::Limit(limit_spec(2)).covers(&StoreKey::from("m")));
    }

    // --- Validation tests ---

    #[test]
    fn test_validate_accepts_well_formed_specs() {
        Keyspec::Range {
            range: Region::all(),
        }
        .validate()
        .unwrap();
        Keyspec::Point {
            key: StoreKey::from("m"),
        }
        .validate()
        .unwrap();
        Keyspec::Limit(limit_spec(5)).validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_empty_range() {
        let key = StoreKey::from("m");
        let keyspec = Keyspec::Range {
            range: Region::new(Some(key.clone()), Some(key)),
        };
        assert!(matches!(
            keyspec.validate(),
            Err(ChangefeedError::MalformedKeyspec(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_limit() {
        assert!(matches!(
            Keyspec::Limit(limit_spec(0)).validate(),
            Err(ChangefeedError::MalformedKeyspec(_))
        ));
    }

    #[test]
    fn test_validate_rejects_unnamed_sindex() {
        let mut spec = limit_spec(2);
        spec.sindex = String::new();
        assert!(matches!(
            Keyspec::Limit(spec).validate(),
            Err(ChangefeedError::MalformedKeyspec(_))
        ));
    }

    #[test]
    fn test_sorting_serializes() {
        let spec = limit_spec(2);
        let json = serde_json::to_string(&spec).unwrap();
        let back: LimitSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
        assert_eq!(back.sorting, Sorting::Ascending);
    }
}
