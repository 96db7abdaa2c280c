//! `Table`: the mutable, retroactively-editable base relation. Every view
//! chain in this crate is rooted at one.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::column::{FieldMap, Schema};
use crate::error::RetrodbError;
use crate::predicate::Predicate;
use crate::record::Record;
use crate::subscribable::{Checkpoint, Subscribable, Substrate};
use crate::view::select::SelectView;
use crate::view::sum::SumView;
use std::time::Duration;

/// A retroactively-updatable base relation: rows keyed by the logical time
/// they take effect, with a schema fixed at construction.
///
/// `insert`/`delete`/`erase` all take an explicit logical `time` rather than
/// acting "now" — this is the retroactive part (SPEC_FULL.md §1). The table
/// also implements `Subscribable` directly, so a view can be built straight
/// off of it, the same as off of another view.
pub struct Table {
    schema: Schema,
    /// Rows bucketed by the time they take effect, for `erase`'s lookups.
    /// The changelog of record is `substrate`'s own `history`; this index
    /// exists only to answer "what's at time T" in O(1) rather than by
    /// scanning history.
    buckets: Mutex<FxHashMap<i64, Vec<Record>>>,
    substrate: Substrate,
}

impl Table {
    /// Builds an empty table with the given schema.
    pub fn new(schema: Schema) -> Arc<Self> {
        Arc::new(Table {
            schema,
            buckets: Mutex::new(FxHashMap::default()),
            substrate: Substrate::new(),
        })
    }

    /// This table's schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Inserts a row at `time`. Fields absent from `values` fall back to
    /// their column's default. Fails if `values` names a field outside the
    /// schema.
    pub fn insert(&self, time: i64, values: FieldMap) -> Result<Record, RetrodbError> {
        self.schema.validate_fields(values.keys().map(String::as_str))?;

        let mut full = self.schema.default_values();
        full.extend(values);

        let record = Record::new_insert(self.substrate.id(), time, full);

        let mut buckets = self.buckets.lock();
        buckets.entry(time).or_default().push(record.clone());
        self.substrate.add_to_history([record.clone()]);
        Ok(record)
    }

    /// Deletes `record` as of `time`. The original INSERT stays in history;
    /// only a new DELETE record is appended, inversion-linked to it. Per
    /// the original's semantics, the deletion is bucketed under `time`, the
    /// time it *takes effect* — not the record's own original time.
    pub fn delete(&self, time: i64, record: &Record) -> Result<Record, RetrodbError> {
        let drecord = record.delete(time)?;

        let mut buckets = self.buckets.lock();
        buckets.entry(time).or_default().push(drecord.clone());
        self.substrate.add_to_history([drecord.clone()]);
        Ok(drecord)
    }

    /// Strikes every record bucketed at `time` from history outright. Unlike
    /// `delete`, this is not invertible: the erased records' own inversion
    /// partners (if any) have their back-pointer cleared, and a single
    /// ERASE record citing them is appended.
    ///
    /// Returns the records that were erased; empty if none were bucketed at
    /// `time`.
    pub fn erase(&self, time: i64) -> Vec<Record> {
        let mut buckets = self.buckets.lock();
        let erased = buckets.remove(&time).unwrap_or_default();
        if erased.is_empty() {
            return erased;
        }

        for r in &erased {
            if let Some(partner) = r.inversion() {
                partner.clear_inversion_if(r);
            }
        }

        let erasure = Record::new_erasure(self.substrate.id(), time, erased.clone());
        self.substrate.remove_from_history(&erased, erasure);
        erased
    }

    /// Builds a `SELECT` view over `fields` of this table's rows matching
    /// every predicate in `predicates`, effective as of `time`.
    pub fn select(
        self: &Arc<Self>,
        time: i64,
        fields: &[&str],
        predicates: Vec<Box<dyn Predicate>>,
    ) -> Result<Arc<SelectView>, RetrodbError> {
        SelectView::new(self.clone(), time, fields, predicates)
    }

    /// Builds a `SUM` view over `field` of this table's rows, effective as
    /// of `time`.
    pub fn sum(self: &Arc<Self>, time: i64, field: &str) -> Result<Arc<SumView>, RetrodbError> {
        SumView::new(self.clone(), time, field)
    }
}

impl Subscribable for Table {
    /// Delegates straight to the embedded `Substrate`; its `history` is the
    /// single source of truth for both live rows and the changelog, so a
    /// fresh subscriber's replay is always consistent with the checkpoint
    /// it is handed.
    fn subscribe(
        &self,
        checkpoint: Option<Checkpoint>,
        timeout: Option<Duration>,
    ) -> (Checkpoint, Vec<Record>) {
        self.substrate.subscribe(checkpoint, timeout)
    }

    fn unsubscribe(&self, checkpoint: Checkpoint) {
        self.substrate.unsubscribe(checkpoint)
    }

    fn free(&self) {
        self.substrate.free()
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::{IntColumn, Scalar};
    use std::sync::Arc as StdArc;

    fn int_table() -> Arc<Table> {
        Table::new(
            Schema::new(vec![("n".to_string(), StdArc::new(IntColumn) as _)]).unwrap(),
        )
    }

    fn values(n: i64) -> FieldMap {
        let mut m = FieldMap::default();
        m.insert("n".into(), Scalar::Int(n));
        m
    }

    #[test]
    fn insert_rejects_unknown_field() {
        let table = int_table();
        let mut bad = FieldMap::default();
        bad.insert("missing".into(), Scalar::Int(1));
        assert!(matches!(
            table.insert(0, bad),
            Err(RetrodbError::InvalidField(_))
        ));
    }

    #[test]
    fn insert_fills_schema_defaults() {
        let table = int_table();
        let record = table.insert(0, FieldMap::default()).unwrap();
        assert_eq!(record.get("n"), Some(&Scalar::Int(0)));
    }

    #[test]
    fn subscribe_fresh_sees_all_inserted_rows() {
        let table = int_table();
        table.insert(1, values(10)).unwrap();
        table.insert(2, values(20)).unwrap();
        let (_, records) = table.subscribe(None, None);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn delete_is_bucketed_under_its_own_time_not_the_original() {
        let table = int_table();
        let r = table.insert(1, values(10)).unwrap();
        table.delete(5, &r).unwrap();

        let erased_at_five = table.erase(5);
        assert_eq!(erased_at_five.len(), 1);
        assert_eq!(erased_at_five[0].action(), crate::record::RecordAction::Delete);
    }

    #[test]
    fn erase_clears_partner_inversion_and_emits_one_erasure() {
        let table = int_table();
        let r = table.insert(1, values(10)).unwrap();
        let d = table.delete(2, &r).unwrap();

        let erased = table.erase(1);
        assert_eq!(erased, vec![r]);
        assert!(d.inversion().is_none());

        let (_, records) = table.subscribe(None, None);
        assert!(records.iter().any(|rec| rec.action() == crate::record::RecordAction::Erase));
    }

    #[test]
    fn erase_of_empty_time_is_a_no_op() {
        let table = int_table();
        assert!(table.erase(99).is_empty());
    }
}
