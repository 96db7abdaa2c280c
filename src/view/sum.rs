//! `SUM`: a running total over one numeric field, re-materialized as a
//! single "current" record so downstream views can consume it the same way
//! they consume any other insert/delete stream.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::column::{FieldMap, Scalar, Schema};
use crate::error::RetrodbError;
use crate::record::{Record, RecordAction};
use crate::subscribable::{Checkpoint, Subscribable, Substrate};
use crate::view::{ViewBase, ViewCallbacks};

struct SumState {
    value: Scalar,
    /// The INSERT record currently representing `value`. Every update
    /// retracts this one and emits its replacement, so a subscriber never
    /// sees two "current" records live at once.
    current: Option<Record>,
}

/// A retroactively-updated running total of `field` across `upstream`'s
/// rows, as of a fixed logical time.
pub struct SumView {
    schema: Schema,
    time: i64,
    field: String,
    output_field: String,
    state: Mutex<SumState>,
    substrate: Substrate,
    base: ViewBase,
}

impl SumView {
    /// Builds a `SUM` view over `field` of `upstream`'s rows, as of `time`.
    /// Fails if `field` is not part of `upstream`'s schema or is not a
    /// numeric column type.
    pub fn new(upstream: Arc<dyn Subscribable>, time: i64, field: &str) -> Result<Arc<Self>, RetrodbError> {
        let col = upstream
            .schema()
            .get(field)
            .ok_or_else(|| RetrodbError::InvalidField(field.to_string()))?;
        if !col.is_numeric() {
            return Err(RetrodbError::TypeIncompatible {
                field: field.to_string(),
            });
        }

        let output_field = format!("SUM({})", field);
        let schema = Schema::single(output_field.clone(), col.clone());
        let zero = col.default_value();

        let view = Arc::new(SumView {
            schema,
            time,
            field: field.to_string(),
            output_field,
            state: Mutex::new(SumState {
                value: zero,
                current: None,
            }),
            substrate: Substrate::new(),
            base: ViewBase::new(),
        });

        // Establish the zero-valued baseline before the worker starts, so
        // the very first subscriber sees a current record rather than an
        // empty changelog.
        view.emit_current_locked(view.state.lock());

        let dyn_view: Arc<dyn ViewCallbacks> = view.clone();
        let callbacks: std::sync::Weak<dyn ViewCallbacks> = Arc::downgrade(&dyn_view);
        view.base.start(upstream, callbacks);
        Ok(view)
    }

    /// The logical time this view is computed as of.
    pub fn time(&self) -> i64 {
        self.time
    }

    /// The running total's current value.
    pub fn value(&self) -> Scalar {
        self.state.lock().value.clone()
    }

    /// Retracts the previous "current" record (if any) and appends a fresh
    /// one reflecting `state.value`, as a single atomic history append.
    fn emit_current_locked(&self, mut state: parking_lot::MutexGuard<'_, SumState>) {
        let mut values = FieldMap::default();
        values.insert(self.output_field.clone(), state.value.clone());
        let new_current = Record::new_insert(self.substrate.id(), self.time, values);
        let old_current = state.current.replace(new_current.clone());
        drop(state);

        match old_current.map(|old| old.delete(self.time)) {
            Some(Ok(drecord)) => self.substrate.add_to_history([drecord, new_current]),
            // `old_current` is always an INSERT this view produced itself.
            Some(Err(_)) | None => self.substrate.add_to_history([new_current]),
        }
    }

    fn adjust(&self, delta: &Scalar, add: bool) {
        let mut state = self.state.lock();
        state.value = if add {
            state.value.add(delta)
        } else {
            state.value.sub(delta)
        };
        self.emit_current_locked(state);
    }
}

impl ViewCallbacks for SumView {
    fn on_insert(&self, record: &Record) {
        if record.time() > self.time {
            return;
        }
        if let Some(delta) = record.get(&self.field) {
            self.adjust(delta, true);
        }
    }

    fn on_delete(&self, record: &Record) {
        if record.time() > self.time {
            return;
        }
        if let Some(delta) = record.get(&self.field) {
            self.adjust(delta, false);
        }
    }

    fn on_erase(&self, time: i64, erased: &[Record]) {
        if time > self.time {
            return;
        }
        for record in erased {
            let Some(delta) = record.get(&self.field) else {
                continue;
            };
            // Erasing an INSERT undoes the addition it made; erasing a
            // DELETE undoes the subtraction it made. An ERASE record never
            // itself appears among `erased`.
            match record.action() {
                RecordAction::Insert => self.adjust(delta, false),
                RecordAction::Delete => self.adjust(delta, true),
                RecordAction::Erase => {}
            }
        }
    }
}

impl Subscribable for SumView {
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
        self.base.stop_worker();
        self.substrate.free();
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::IntColumn;
    use crate::table::Table;
    use std::sync::Arc as StdArc;
    use std::thread;
    use std::time::Duration as StdDuration;

    fn int_table() -> StdArc<Table> {
        Table::new(Schema::new(vec![("n".to_string(), StdArc::new(IntColumn) as _)]).unwrap())
    }

    fn values(n: i64) -> FieldMap {
        let mut m = FieldMap::default();
        m.insert("n".into(), Scalar::Int(n));
        m
    }

    fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            thread::sleep(StdDuration::from_millis(10));
        }
        panic!("condition never became true");
    }

    #[test]
    fn sum_rejects_non_numeric_field() {
        let table = Table::new(
            Schema::new(vec![(
                "s".to_string(),
                StdArc::new(crate::column::StringColumn) as _,
            )])
            .unwrap(),
        );
        assert!(matches!(
            table.sum(0, "s"),
            Err(RetrodbError::TypeIncompatible { .. })
        ));
    }

    #[test]
    fn sum_starts_at_zero() {
        let table = int_table();
        let view = table.sum(10, "n").unwrap();
        assert_eq!(view.value(), Scalar::Int(0));
    }

    #[test]
    fn sum_accumulates_inserts_up_to_its_time() {
        let table = int_table();
        table.insert(1, values(3)).unwrap();
        table.insert(2, values(4)).unwrap();
        table.insert(100, values(1000)).unwrap(); // after view time

        let view = table.sum(5, "n").unwrap();
        wait_until(|| view.value() == Scalar::Int(7));
    }

    #[test]
    fn sum_reflects_retroactive_delete() {
        let table = int_table();
        let r = table.insert(1, values(10)).unwrap();
        let view = table.sum(20, "n").unwrap();
        wait_until(|| view.value() == Scalar::Int(10));

        table.delete(5, &r).unwrap();
        wait_until(|| view.value() == Scalar::Int(0));
    }
}
