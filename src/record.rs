//! The record model: immutable row tuples tagged with an action, a logical
//! time, and an inversion link.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::column::{FieldMap, Scalar};
use crate::error::RetrodbError;
use crate::subscribable::SubscribableId;

/// The kind of change a `Record` represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordAction {
    /// A row was added.
    Insert,
    /// A previously-inserted row was retroactively removed.
    Delete,
    /// Record(s) were struck from history outright; not reversible.
    Erase,
}

struct RecordData {
    owner: SubscribableId,
    time: i64,
    action: RecordAction,
    values: FieldMap,
    /// The paired INSERT/DELETE record, if any. A `Weak` reference: two
    /// records that reference each other must not keep each other alive,
    /// or no inversion pair would ever be reclaimed. See SPEC_FULL.md §3.
    inversion: Mutex<Option<Weak<RecordData>>>,
    /// Populated only for `Erase` records: the records being erased.
    erased: Vec<Record>,
}

/// A single change record: immutable except for the `inversion` back-pointer,
/// which may be cleared when the erased partner is removed.
///
/// Equality compares `(action, owning Subscribable, time, values)` — a
/// record emitted by a view is never equal to the upstream record it was
/// derived from, even if their field values coincide, because they belong
/// to different Subscribables. See SPEC_FULL.md §9.
#[derive(Clone)]
pub struct Record(Arc<RecordData>);

impl Record {
    pub(crate) fn new_insert(owner: SubscribableId, time: i64, values: FieldMap) -> Self {
        Record(Arc::new(RecordData {
            owner,
            time,
            action: RecordAction::Insert,
            values,
            inversion: Mutex::new(None),
            erased: Vec::new(),
        }))
    }

    fn new_delete(owner: SubscribableId, time: i64, values: FieldMap) -> Self {
        Record(Arc::new(RecordData {
            owner,
            time,
            action: RecordAction::Delete,
            values,
            inversion: Mutex::new(None),
            erased: Vec::new(),
        }))
    }

    /// Builds the special ERASE record citing the records being erased. Has
    /// no field values of its own and is never itself invertible.
    pub(crate) fn new_erasure(owner: SubscribableId, time: i64, erased: Vec<Record>) -> Self {
        Record(Arc::new(RecordData {
            owner,
            time,
            action: RecordAction::Erase,
            values: FieldMap::default(),
            inversion: Mutex::new(None),
            erased,
        }))
    }

    /// Produces the paired DELETE record and wires the mutual `inversion`
    /// link. Valid only on an INSERT record.
    pub fn delete(&self, time: i64) -> Result<Record, RetrodbError> {
        if self.0.action != RecordAction::Insert {
            return Err(RetrodbError::ErasureUndeletable);
        }
        let drecord = Record::new_delete(self.0.owner, time, self.0.values.clone());
        *drecord.0.inversion.lock() = Some(Arc::downgrade(&self.0));
        *self.0.inversion.lock() = Some(Arc::downgrade(&drecord.0));
        Ok(drecord)
    }

    /// The Subscribable that created this record (its "table", in
    /// SPEC_FULL.md's terms). Purely informational; carried only for
    /// equality and ownership bookkeeping.
    pub fn owner(&self) -> SubscribableId {
        self.0.owner
    }

    /// The logical time at which this record takes effect.
    pub fn time(&self) -> i64 {
        self.0.time
    }

    /// This record's action kind.
    pub fn action(&self) -> RecordAction {
        self.0.action
    }

    /// The value stored under `field`, if any.
    pub fn get(&self, field: &str) -> Option<&Scalar> {
        self.0.values.get(field)
    }

    /// All `(field, value)` pairs this record carries.
    pub fn values(&self) -> &FieldMap {
        &self.0.values
    }

    /// The records cited by an ERASE record; empty for INSERT/DELETE.
    pub fn erased_records(&self) -> &[Record] {
        &self.0.erased
    }

    /// The live inversion partner, if the weak link still resolves.
    pub fn inversion(&self) -> Option<Record> {
        self.0
            .inversion
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Record)
    }

    /// Clears this record's inversion link if (and only if) it currently
    /// points at `expected`. Returns whether it was cleared.
    ///
    /// Used by `Table::erase` to break back-pointers on the surviving
    /// partner of an erased record (SPEC_FULL.md §4.D).
    pub(crate) fn clear_inversion_if(&self, expected: &Record) -> bool {
        let mut guard = self.0.inversion.lock();
        let still_points_at_expected = guard
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|strong| Arc::ptr_eq(&strong, &expected.0))
            .unwrap_or(false);
        if still_points_at_expected {
            *guard = None;
        }
        still_points_at_expected
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.0.owner == other.0.owner
            && self.0.action == other.0.action
            && self.0.time == other.0.time
            && self.0.values == other.0.values
            && self.0.erased == other.0.erased
    }
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("owner", &self.0.owner)
            .field("time", &self.0.time)
            .field("action", &self.0.action)
            .field("values", &self.0.values)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> SubscribableId {
        SubscribableId::fresh_for_test()
    }

    #[test]
    fn delete_wires_mutual_inversion() {
        let owner = owner();
        let mut values = FieldMap::default();
        values.insert("k".into(), Scalar::Int(10));
        let insert = Record::new_insert(owner, 1, values);
        let delete = insert.delete(3).unwrap();

        assert_eq!(delete.inversion().unwrap(), insert);
        assert_eq!(insert.inversion().unwrap(), delete);
    }

    #[test]
    fn delete_on_erase_record_fails() {
        let owner = owner();
        let erasure = Record::new_erasure(owner, 1, Vec::new());
        assert_eq!(erasure.delete(2), Err(RetrodbError::ErasureUndeletable));
    }

    #[test]
    fn view_emitted_record_unequal_to_upstream_original() {
        let upstream = SubscribableId::fresh_for_test();
        let downstream = SubscribableId::fresh_for_test();
        let mut values = FieldMap::default();
        values.insert("k".into(), Scalar::Int(1));
        let a = Record::new_insert(upstream, 1, values.clone());
        let b = Record::new_insert(downstream, 1, values);
        assert_ne!(a, b);
    }

    #[test]
    fn clear_inversion_if_only_clears_matching_partner() {
        let owner = owner();
        let mut values = FieldMap::default();
        values.insert("k".into(), Scalar::Int(1));
        let insert = Record::new_insert(owner, 1, values.clone());
        let delete = insert.delete(2).unwrap();
        let unrelated = Record::new_insert(owner, 5, values);

        assert!(!delete.clear_inversion_if(&unrelated));
        assert!(insert.inversion().is_some());

        assert!(delete.clear_inversion_if(&insert));
        assert!(delete.inversion().is_none());
    }
}
