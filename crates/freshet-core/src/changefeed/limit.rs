//! Limit-window manager: the server-side top-N window of one ordered-prefix
//! subscription.
//!
//! Writes stage into `added`/`deleted` buffers between commits; `commit`
//! reconciles the staged changes against the sorted window, refills from the
//! storage layer when an eviction leaves the window short, and emits
//! [`Msg::LimitChange`] diffs — deletions before insertions, so a consumer
//! never sees a replacement before the delete that made room for it.

use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use fxhash::FxHashSet;

use crate::changefeed::keyspec::{LimitSpec, Sorting};
use crate::changefeed::msg::{Msg, SortKey};
use crate::changefeed::{ChangefeedError, ClientAddr, SubscriptionId};
use crate::datum::{Datum, DatumRange, StoreKey};

// ---------------------------------------------------------------------------
// LimitReader
// ---------------------------------------------------------------------------

/// The secondary-index read path, supplied by the storage layer.
#[async_trait]
pub trait LimitReader: Send + Sync {
    /// Reads up to `n` `(sort_key, row)` pairs from the leading edge of
    /// `range` on `sindex`, in `sorting` order.
    ///
    /// The initial snapshot passes the subscription's full range; refill
    /// passes the range strictly beyond the window's trailing edge, out to
    /// the subscription bound.
    ///
    /// # Errors
    ///
    /// Storage-level failures; they surface to the subscription as-is.
    async fn read(
        &self,
        range: &DatumRange,
        table: &str,
        sindex: &str,
        sorting: Sorting,
        n: usize,
    ) -> Result<Vec<(SortKey, Datum)>, ChangefeedError>;
}

// ---------------------------------------------------------------------------
// LimitManager
// ---------------------------------------------------------------------------

/// Top-N sorted window for one limit subscription.
///
/// Owned by the server's client entry; callers hold the manager's lock
/// across `add`/`del`/`commit` (see `Server::foreach_limit`).
pub struct LimitManager {
    table: String,
    sub: SubscriptionId,
    client: ClientAddr,
    spec: LimitSpec,
    /// Current window, ascending by `(sort_key, primary_key)`. The sorting
    /// direction decides which end loses on truncation.
    window: BTreeMap<SortKey, Datum>,
    added: Vec<(SortKey, Datum)>,
    deleted: Vec<SortKey>,
}

impl LimitManager {
    /// Creates a manager seeded with an initial snapshot.
    ///
    /// The snapshot is clamped to the window size from the losing end.
    #[must_use]
    pub fn new(
        table: String,
        sub: SubscriptionId,
        client: ClientAddr,
        spec: LimitSpec,
        start_data: Vec<(SortKey, Datum)>,
    ) -> Self {
        let mut manager = Self {
            table,
            sub,
            client,
            spec,
            window: BTreeMap::new(),
            added: Vec::new(),
            deleted: Vec::new(),
        };
        for (key, row) in start_data {
            manager.window.insert(key, row);
        }
        while manager.window.len() > manager.spec.limit {
            manager.pop_losing();
        }
        manager
    }

    /// The subscription owning this window.
    #[must_use]
    pub fn sub(&self) -> SubscriptionId {
        self.sub
    }

    /// The client the window's diffs are sent to.
    #[must_use]
    pub fn client(&self) -> ClientAddr {
        self.client
    }

    /// Name of the secondary index the window sorts on.
    #[must_use]
    pub fn sindex(&self) -> &str {
        &self.spec.sindex
    }

    /// The window's limit spec.
    #[must_use]
    pub fn spec(&self) -> &LimitSpec {
        &self.spec
    }

    /// Current window contents in sort order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(SortKey, Datum)> {
        let entries = self.window.iter().map(|(k, v)| (k.clone(), v.clone()));
        match self.spec.sorting {
            Sorting::Ascending => entries.collect(),
            Sorting::Descending => {
                let mut out: Vec<_> = entries.collect();
                out.reverse();
                out
            }
        }
    }

    /// Stages an insertion for the next commit.
    pub fn add(&mut self, sort_key: SortKey, row: Datum) {
        self.added.push((sort_key, row));
    }

    /// Stages a deletion for the next commit.
    pub fn del(&mut self, sort_key: SortKey) {
        self.deleted.push(sort_key);
    }

    /// Reconciles staged changes and returns the resulting diffs.
    ///
    /// Applies deletions, then insertions; truncates past-capacity entries
    /// from the losing end; refills through `reader` when a deletion left
    /// the window short, deduplicating fetched rows by primary key. Diffs
    /// order deletions before insertions. An empty staging area produces no
    /// diffs and no read.
    ///
    /// # Errors
    ///
    /// Read failures from `reader`; the staged buffers are cleared even so,
    /// since their effect on the window has already been applied.
    pub async fn commit(
        &mut self,
        reader: &dyn LimitReader,
    ) -> Result<Vec<Msg>, ChangefeedError> {
        if self.added.is_empty() && self.deleted.is_empty() {
            return Ok(Vec::new());
        }

        let before = self.window.clone();

        let mut removed_any = false;
        for key in std::mem::take(&mut self.deleted) {
            removed_any |= self.window.remove(&key).is_some();
        }
        for (key, row) in std::mem::take(&mut self.added) {
            self.window.insert(key, row);
        }
        while self.window.len() > self.spec.limit {
            self.pop_losing();
        }

        if removed_any && self.window.len() < self.spec.limit {
            let need = self.spec.limit - self.window.len();
            let range = self.refill_range();
            tracing::debug!(sub = %self.sub, need, "refilling limit window");
            let fetched = reader
                .read(&range, &self.table, &self.spec.sindex, self.spec.sorting, need)
                .await?;
            let present: FxHashSet<StoreKey> =
                self.window.keys().map(|k| k.primary.clone()).collect();
            for (key, row) in fetched {
                if present.contains(&key.primary) {
                    continue;
                }
                self.window.insert(key, row);
            }
            while self.window.len() > self.spec.limit {
                self.pop_losing();
            }
        }

        Ok(self.diffs(&before))
    }

    /// Diffs of the window against a prior snapshot: deletions, then
    /// replacements, then insertions.
    fn diffs(&self, before: &BTreeMap<SortKey, Datum>) -> Vec<Msg> {
        let mut msgs = Vec::new();
        for key in before.keys() {
            if !self.window.contains_key(key) {
                msgs.push(Msg::LimitChange {
                    sub: self.sub,
                    old_key: Some(key.clone()),
                    new_val: None,
                });
            }
        }
        for (key, row) in &self.window {
            match before.get(key) {
                Some(old) if old == row => {}
                Some(_) => msgs.push(Msg::LimitChange {
                    sub: self.sub,
                    old_key: Some(key.clone()),
                    new_val: Some((key.clone(), row.clone())),
                }),
                None => msgs.push(Msg::LimitChange {
                    sub: self.sub,
                    old_key: None,
                    new_val: Some((key.clone(), row.clone())),
                }),
            }
        }
        msgs
    }

    /// The range a refill read draws from: strictly beyond the window's
    /// trailing edge out to the subscription bound, or the full subscription
    /// range when the window is empty.
    fn refill_range(&self) -> DatumRange {
        match self.spec.sorting {
            Sorting::Ascending => match self.window.last_key_value() {
                Some((edge, _)) => DatumRange::new(
                    Bound::Excluded(edge.secondary.clone()),
                    self.spec.range.upper.clone(),
                ),
                None => self.spec.range.clone(),
            },
            Sorting::Descending => match self.window.first_key_value() {
                Some((edge, _)) => DatumRange::new(
                    self.spec.range.lower.clone(),
                    Bound::Excluded(edge.secondary.clone()),
                ),
                None => self.spec.range.clone(),
            },
        }
    }

    /// Drops the entry at the losing end of the window.
    fn pop_losing(&mut self) -> Option<(SortKey, Datum)> {
        match self.spec.sorting {
            Sorting::Ascending => self.window.pop_last(),
            Sorting::Descending => self.window.pop_first(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    use crate::fabric::{MailboxAddr, MailboxId, NodeId};

    /// In-memory index backing refill reads; records every call.
    struct FixedReader {
        entries: Vec<(SortKey, Datum)>,
        calls: Mutex<Vec<(DatumRange, usize)>>,
    }

    impl FixedReader {
        fn new(entries: Vec<(SortKey, Datum)>) -> Self {
            Self {
                entries,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn empty() -> Self {
            Self::new(Vec::new())
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl LimitReader for FixedReader {
        async fn read(
            &self,
            range: &DatumRange,
            _table: &str,
            _sindex: &str,
            sorting: Sorting,
            n: usize,
        ) -> Result<Vec<(SortKey, Datum)>, ChangefeedError> {
            self.calls.lock().push((range.clone(), n));
            let mut hits: Vec<_> = self
                .entries
                .iter()
                .filter(|(key, _)| range.contains(&key.secondary))
                .cloned()
                .collect();
            if sorting == Sorting::Descending {
                hits.reverse();
            }
            hits.truncate(n);
            Ok(hits)
        }
    }

    fn addr() -> ClientAddr {
        MailboxAddr {
            node: NodeId::random(),
            mailbox: MailboxId::new(0),
        }
    }

    fn entry(age: f64, id: &str) -> (SortKey, Datum) {
        (
            SortKey::new(Datum::Number(age), StoreKey::from(id)),
            Datum::from(json!({ "id": id, "age": age })),
        )
    }

    fn spec(sorting: Sorting, limit: usize) -> LimitSpec {
        LimitSpec {
            range: DatumRange::all(),
            sindex: "age".into(),
            sorting,
            limit,
        }
    }

    fn manager(sorting: Sorting, limit: usize, start: Vec<(SortKey, Datum)>) -> LimitManager {
        LimitManager::new(
            "users".into(),
            SubscriptionId::random(),
            addr(),
            spec(sorting, limit),
            start,
        )
    }

    fn window_ids(manager: &LimitManager) -> Vec<StoreKey> {
        manager
            .snapshot()
            .into_iter()
            .map(|(key, _)| key.primary)
            .collect()
    }

    // --- Commit basics ---

    #[tokio::test]
    async fn test_empty_commit_emits_nothing_and_reads_nothing() {
        let reader = FixedReader::empty();
        let mut mgr = manager(
            Sorting::Ascending,
            2,
            vec![entry(20.0, "alice"), entry(25.0, "bob")],
        );
        let diffs = mgr.commit(&reader).await.unwrap();
        assert!(diffs.is_empty());
        assert_eq!(reader.call_count(), 0);
    }

    #[tokio::test]
    async fn test_insert_evicts_losing_end() {
        let reader = FixedReader::empty();
        let mut mgr = manager(
            Sorting::Ascending,
            2,
            vec![entry(20.0, "alice"), entry(25.0, "bob")],
        );

        let (carol_key, carol_row) = entry(22.0, "carol");
        mgr.add(carol_key.clone(), carol_row.clone());
        let diffs = mgr.commit(&reader).await.unwrap();

        let (bob_key, _) = entry(25.0, "bob");
        assert_eq!(
            diffs,
            vec![
                Msg::LimitChange {
                    sub: mgr.sub(),
                    old_key: Some(bob_key),
                    new_val: None,
                },
                Msg::LimitChange {
                    sub: mgr.sub(),
                    old_key: None,
                    new_val: Some((carol_key, carol_row)),
                },
            ]
        );
        assert_eq!(
            window_ids(&mgr),
            vec![StoreKey::from("alice"), StoreKey::from("carol")]
        );
        // A pure insert never triggers a read.
        assert_eq!(reader.call_count(), 0);
    }

    #[tokio::test]
    async fn test_eviction_refills_past_window_edge() {
        let reader = FixedReader::new(vec![entry(25.0, "bob"), entry(30.0, "dave")]);
        let mut mgr = manager(
            Sorting::Ascending,
            2,
            vec![entry(20.0, "alice"), entry(25.0, "bob")],
        );

        let (alice_key, _) = entry(20.0, "alice");
        mgr.del(alice_key.clone());
        let diffs = mgr.commit(&reader).await.unwrap();

        let (dave_key, dave_row) = entry(30.0, "dave");
        assert_eq!(
            diffs,
            vec![
                Msg::LimitChange {
                    sub: mgr.sub(),
                    old_key: Some(alice_key),
                    new_val: None,
                },
                Msg::LimitChange {
                    sub: mgr.sub(),
                    old_key: None,
                    new_val: Some((dave_key, dave_row)),
                },
            ]
        );

        // The read started past the surviving edge and asked for the shortfall.
        let calls = reader.calls.lock();
        assert_eq!(calls.len(), 1);
        let (range, n) = &calls[0];
        assert_eq!(*n, 1);
        assert_eq!(range.lower, Bound::Excluded(Datum::Number(25.0)));
    }

    #[tokio::test]
    async fn test_refill_dedups_by_primary_key() {
        // The index still lists bob under a second sort value; the refill
        // must not duplicate his row in the window.
        let reader = FixedReader::new(vec![entry(26.0, "bob"), entry(30.0, "dave")]);
        let mut mgr = manager(
            Sorting::Ascending,
            3,
            vec![entry(20.0, "alice"), entry(25.0, "bob")],
        );

        let (alice_key, _) = entry(20.0, "alice");
        mgr.del(alice_key);
        mgr.commit(&reader).await.unwrap();

        assert_eq!(
            window_ids(&mgr),
            vec![StoreKey::from("bob"), StoreKey::from("dave")]
        );
    }

    #[tokio::test]
    async fn test_delete_outside_window_is_inert() {
        let reader = FixedReader::empty();
        let mut mgr = manager(
            Sorting::Ascending,
            2,
            vec![entry(20.0, "alice"), entry(25.0, "bob")],
        );

        mgr.del(SortKey::new(Datum::Number(99.0), StoreKey::from("zed")));
        let diffs = mgr.commit(&reader).await.unwrap();
        assert!(diffs.is_empty());
        assert_eq!(reader.call_count(), 0);
    }

    #[tokio::test]
    async fn test_emptied_window_refills_from_full_range() {
        let reader = FixedReader::new(vec![entry(40.0, "erin")]);
        let mut mgr = manager(Sorting::Ascending, 2, vec![entry(20.0, "alice")]);

        let (alice_key, _) = entry(20.0, "alice");
        mgr.del(alice_key);
        mgr.commit(&reader).await.unwrap();

        let calls = reader.calls.lock();
        assert_eq!(calls[0].0, DatumRange::all());
        drop(calls);
        assert_eq!(window_ids(&mgr), vec![StoreKey::from("erin")]);
    }

    #[tokio::test]
    async fn test_replaced_row_emits_single_diff() {
        let reader = FixedReader::empty();
        let mut mgr = manager(
            Sorting::Ascending,
            2,
            vec![entry(20.0, "alice"), entry(25.0, "bob")],
        );

        let (bob_key, _) = entry(25.0, "bob");
        let new_row = Datum::from(json!({ "id": "bob", "age": 25.0, "tier": "gold" }));
        mgr.del(bob_key.clone());
        mgr.add(bob_key.clone(), new_row.clone());
        let diffs = mgr.commit(&reader).await.unwrap();

        assert_eq!(
            diffs,
            vec![Msg::LimitChange {
                sub: mgr.sub(),
                old_key: Some(bob_key.clone()),
                new_val: Some((bob_key, new_row)),
            }]
        );
        // Window stayed full, so no read happened.
        assert_eq!(reader.call_count(), 0);
    }

    // --- Descending windows ---

    #[tokio::test]
    async fn test_descending_truncates_small_end() {
        let reader = FixedReader::empty();
        let mut mgr = manager(
            Sorting::Descending,
            2,
            vec![entry(20.0, "alice"), entry(25.0, "bob")],
        );

        let (dave_key, dave_row) = entry(30.0, "dave");
        mgr.add(dave_key, dave_row);
        let diffs = mgr.commit(&reader).await.unwrap();

        // alice (the smallest) loses.
        let (alice_key, _) = entry(20.0, "alice");
        assert!(diffs.contains(&Msg::LimitChange {
            sub: mgr.sub(),
            old_key: Some(alice_key),
            new_val: None,
        }));
        assert_eq!(
            window_ids(&mgr),
            vec![StoreKey::from("dave"), StoreKey::from("bob")]
        );
    }

    #[tokio::test]
    async fn test_descending_refill_reads_below_window() {
        let reader = FixedReader::new(vec![entry(10.0, "old"), entry(20.0, "alice")]);
        let mut mgr = manager(
            Sorting::Descending,
            2,
            vec![entry(20.0, "alice"), entry(25.0, "bob")],
        );

        let (bob_key, _) = entry(25.0, "bob");
        mgr.del(bob_key);
        mgr.commit(&reader).await.unwrap();

        let calls = reader.calls.lock();
        assert_eq!(calls[0].0.upper, Bound::Excluded(Datum::Number(20.0)));
        drop(calls);
        assert_eq!(
            window_ids(&mgr),
            vec![StoreKey::from("alice"), StoreKey::from("old")]
        );
    }

    // --- Construction ---

    #[tokio::test]
    async fn test_start_data_clamped_to_limit() {
        let mgr = manager(
            Sorting::Ascending,
            2,
            vec![entry(20.0, "alice"), entry(25.0, "bob"), entry(30.0, "dave")],
        );
        assert_eq!(
            window_ids(&mgr),
            vec![StoreKey::from("alice"), StoreKey::from("bob")]
        );
    }

    #[tokio::test]
    async fn test_snapshot_respects_sorting() {
        let mgr = manager(
            Sorting::Descending,
            3,
            vec![entry(20.0, "alice"), entry(25.0, "bob")],
        );
        assert_eq!(
            window_ids(&mgr),
            vec![StoreKey::from("bob"), StoreKey::from("alice")]
        );
    }
}
